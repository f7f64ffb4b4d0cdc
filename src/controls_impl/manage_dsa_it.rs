use crate::controls_impl::{MakeCritical, RawControl};

pub const MANAGE_DSA_IT_OID: &str = "2.16.840.1.113730.3.4.2";

/// ManageDsaIT control (RFC 3296).
///
/// Makes the server treat referral and other special entries as ordinary
/// ones, so they can be examined and modified directly. The control has no
/// value.
#[derive(Clone, Debug, Default)]
pub struct ManageDsaIt;

impl MakeCritical for ManageDsaIt {}

impl From<ManageDsaIt> for RawControl {
    fn from(_: ManageDsaIt) -> RawControl {
        RawControl {
            ctype: MANAGE_DSA_IT_OID.to_owned(),
            crit: false,
            val: None,
        }
    }
}
