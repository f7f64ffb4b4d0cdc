//! Password policy response controls.
//!
//! Two generations of expired-password signalling are covered: the Behera
//! draft (draft-behera-ldap-password-policy), with a structured value, and
//! the older VChu draft (draft-vchu-ldap-pwd-policy), whose warning control
//! carries the time to expiry as a decimal string.

use crate::controls_impl::{ControlParser, MakeCritical, RawControl};

use lber::parse::{parse_tag, parse_uint};
use lber::structure::{StructureTag, PL};

pub const PASSWORD_POLICY_OID: &str = "1.3.6.1.4.1.42.2.27.8.5.1";
pub const VCHU_PASSWORD_MUST_CHANGE_OID: &str = "2.16.840.1.113730.3.4.4";
pub const VCHU_PASSWORD_WARNING_OID: &str = "2.16.840.1.113730.3.4.5";

/// Password Policy request control (Behera draft).
///
/// Attached to a Bind (or password-changing) request, it solicits a
/// [`PasswordPolicyResp`](struct.PasswordPolicyResp.html) on the response.
/// The request control has no value.
#[derive(Clone, Debug, Default)]
pub struct PasswordPolicy;

impl MakeCritical for PasswordPolicy {}

impl From<PasswordPolicy> for RawControl {
    fn from(_: PasswordPolicy) -> RawControl {
        RawControl {
            ctype: PASSWORD_POLICY_OID.to_owned(),
            crit: false,
            val: None,
        }
    }
}

/// Warning component of the Behera Password Policy response.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PasswordPolicyWarning {
    /// Seconds until the password expires.
    TimeBeforeExpiration(i64),
    /// Remaining grace authentications after expiry.
    GraceAuthNsRemaining(i64),
}

/// Error component of the Behera Password Policy response.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PasswordPolicyError {
    PasswordExpired,
    AccountLocked,
    ChangeAfterReset,
    PasswordModNotAllowed,
    MustSupplyOldPassword,
    InsufficientPasswordQuality,
    PasswordTooShort,
    PasswordTooYoung,
    PasswordInHistory,
}

impl PasswordPolicyError {
    fn from_code(code: u64) -> Option<PasswordPolicyError> {
        use PasswordPolicyError::*;
        Some(match code {
            0 => PasswordExpired,
            1 => AccountLocked,
            2 => ChangeAfterReset,
            3 => PasswordModNotAllowed,
            4 => MustSupplyOldPassword,
            5 => InsufficientPasswordQuality,
            6 => PasswordTooShort,
            7 => PasswordTooYoung,
            8 => PasswordInHistory,
            _ => return None,
        })
    }
}

/// Password Policy response control (Behera draft).
#[derive(Clone, Debug, Default)]
pub struct PasswordPolicyResp {
    pub warning: Option<PasswordPolicyWarning>,
    pub error: Option<PasswordPolicyError>,
}

impl ControlParser for PasswordPolicyResp {
    fn parse(val: &[u8]) -> PasswordPolicyResp {
        let comps = match parse_tag(val) {
            Ok((_, tag)) => tag,
            _ => panic!("ppolicy: failed to parse tag"),
        }
        .expect_constructed()
        .expect("ppolicy: elements")
        .into_iter();
        let mut resp = PasswordPolicyResp::default();
        for comp in comps {
            match comp {
                StructureTag {
                    id,
                    payload: PL::C(choice),
                    ..
                } if id == 0 => {
                    let inner = choice.into_iter().next().expect("ppolicy: warning choice");
                    let secs = match parse_uint(
                        inner
                            .clone()
                            .expect_primitive()
                            .expect("ppolicy: warning value")
                            .as_slice(),
                    ) {
                        Ok((_, secs)) => secs as i64,
                        _ => panic!("ppolicy: failed to parse warning"),
                    };
                    resp.warning = Some(match inner.id {
                        0 => PasswordPolicyWarning::TimeBeforeExpiration(secs),
                        1 => PasswordPolicyWarning::GraceAuthNsRemaining(secs),
                        _ => panic!("ppolicy: unknown warning choice"),
                    });
                }
                StructureTag {
                    id,
                    payload: PL::P(err),
                    ..
                } if id == 1 => {
                    let code = match parse_uint(err.as_slice()) {
                        Ok((_, code)) => code,
                        _ => panic!("ppolicy: failed to parse error"),
                    };
                    resp.error = PasswordPolicyError::from_code(code);
                }
                _ => panic!("ppolicy: unrecognized component"),
            }
        }
        resp
    }
}

/// VChu "password must change" response control. The control has no
/// meaningful value; its presence on a Bind response is the signal.
#[derive(Clone, Debug, Default)]
pub struct VChuPasswordMustChange {
    pub must_change: bool,
}

impl ControlParser for VChuPasswordMustChange {
    fn parse(_val: &[u8]) -> VChuPasswordMustChange {
        VChuPasswordMustChange { must_change: true }
    }
}

/// VChu password expiry warning response control. The value is the number
/// of seconds until expiry, as a decimal string.
#[derive(Clone, Debug, Default)]
pub struct VChuPasswordWarning {
    pub expiry: i64,
}

impl ControlParser for VChuPasswordWarning {
    fn parse(val: &[u8]) -> VChuPasswordWarning {
        let expiry = std::str::from_utf8(val)
            .expect("vchu: expiry utf8")
            .parse()
            .expect("vchu: expiry seconds");
        VChuPasswordWarning { expiry }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn behera_warning_and_error() {
        // SEQUENCE { [0] { [0] 1200 }, [1] ENUMERATED grace-expired(0) }
        let val = b"\x30\x09\xa0\x04\x80\x02\x04\xb0\x81\x01\x00";
        let resp = PasswordPolicyResp::parse(val);
        assert_eq!(
            resp.warning,
            Some(PasswordPolicyWarning::TimeBeforeExpiration(1200))
        );
        assert_eq!(resp.error, Some(PasswordPolicyError::PasswordExpired));
    }

    #[test]
    fn behera_grace_only() {
        // SEQUENCE { [0] { [1] 2 } }
        let val = b"\x30\x05\xa0\x03\x81\x01\x02";
        let resp = PasswordPolicyResp::parse(val);
        assert_eq!(
            resp.warning,
            Some(PasswordPolicyWarning::GraceAuthNsRemaining(2))
        );
        assert_eq!(resp.error, None);
    }

    #[test]
    fn vchu_warning_seconds() {
        let warn = VChuPasswordWarning::parse(b"86400");
        assert_eq!(warn.expiry, 86400);
    }
}
