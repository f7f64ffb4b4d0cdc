use crate::controls_impl::RawControl;

pub const PROXY_AUTH_OID: &str = "2.16.840.1.113730.3.4.18";

/// Proxied Authorization control (RFC 4370).
///
/// Requests that the operation be performed under the authorization
/// identity given in `authzid`, either the empty string (anonymous) or a
/// value of the `dn:` or `u:` form. The control value is the raw authzId,
/// without BER wrapping, and the RFC requires the criticality to be set,
/// which the conversion does unconditionally.
#[derive(Clone, Debug, Default)]
pub struct ProxyAuth {
    pub authzid: String,
}

impl From<ProxyAuth> for RawControl {
    fn from(pa: ProxyAuth) -> RawControl {
        RawControl {
            ctype: PROXY_AUTH_OID.to_owned(),
            crit: true,
            val: Some(Vec::from(pa.authzid.as_bytes())),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn always_critical() {
        let rc = RawControl::from(ProxyAuth {
            authzid: "dn:cn=proxy,dc=example,dc=org".to_owned(),
        });
        assert!(rc.crit);
        assert_eq!(rc.val.as_deref(), Some(&b"dn:cn=proxy,dc=example,dc=org"[..]));
    }
}
