use std::str;

use super::{Exop, ExopParser};

pub const WHOAMI_OID: &str = "1.3.6.1.4.1.4203.1.11.3";

/// Who Am I extended operation (RFC 4532).
///
/// Returns the authorization identity the server associates with the
/// connection, which is not necessarily derivable from the bind DN.
#[derive(Clone, Debug)]
pub struct WhoAmI;

/// Who Am I response.
#[derive(Clone, Debug)]
pub struct WhoAmIResp {
    /// The authorization identity, empty for an anonymous session.
    pub authzid: String,
}

impl From<WhoAmI> for Exop {
    fn from(_w: WhoAmI) -> Exop {
        Exop {
            name: Some(WHOAMI_OID.to_owned()),
            val: None,
        }
    }
}

impl ExopParser for WhoAmIResp {
    fn parse(val: &[u8]) -> WhoAmIResp {
        WhoAmIResp {
            authzid: str::from_utf8(val).expect("authzid").to_owned(),
        }
    }
}
