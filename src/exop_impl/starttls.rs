use super::Exop;

pub const STARTTLS_OID: &str = "1.3.6.1.4.1.1466.20037";

/// StartTLS extended operation (RFC 4511, §4.14).
///
/// Must be the only outstanding operation on the connection when invoked;
/// after a successful response, the TLS handshake proceeds on the same
/// stream. Connection establishment issues the operation internally when a
/// settings struct with StartTLS is given, but the request type is public
/// for servers with unusual upgrade flows.
#[derive(Clone, Debug)]
pub struct StartTls;

impl From<StartTls> for Exop {
    fn from(_s: StartTls) -> Exop {
        Exop {
            name: Some(STARTTLS_OID.to_owned()),
            val: None,
        }
    }
}
