use super::{Exop, ExopParser};

use bytes::BytesMut;
use lber::common::TagClass;
use lber::parse::parse_tag;
use lber::structures::{ASNTag, OctetString, Sequence, Tag};
use lber::write;

pub const PASSMOD_OID: &str = "1.3.6.1.4.1.4203.1.11.1";

/// Password Modify extended operation (RFC 3062).
///
/// All elements are optional: the server applies its policy to derive the
/// target entry (when `user_id` is absent), to verify the old password, and
/// to generate a new password (when `new_pass` is absent), which is then
/// returned in [`PasswordModifyResp`](struct.PasswordModifyResp.html).
#[derive(Clone, Debug, Default)]
pub struct PasswordModify<'a> {
    /// Identity of the entry whose password is changed, usually a DN.
    pub user_id: Option<&'a str>,
    /// Old password, for verification.
    pub old_pass: Option<&'a str>,
    /// New password.
    pub new_pass: Option<&'a str>,
}

/// Password Modify response.
#[derive(Clone, Debug)]
pub struct PasswordModifyResp {
    /// Server-generated password, if one was requested.
    pub gen_password: Option<String>,
}

impl<'a> From<PasswordModify<'a>> for Exop {
    fn from(pm: PasswordModify) -> Exop {
        let mut pm_vec = vec![];
        if let Some(user_id) = pm.user_id {
            pm_vec.push(Tag::OctetString(OctetString {
                id: 0,
                class: TagClass::Context,
                inner: Vec::from(user_id.as_bytes()),
            }));
        }
        if let Some(old_pass) = pm.old_pass {
            pm_vec.push(Tag::OctetString(OctetString {
                id: 1,
                class: TagClass::Context,
                inner: Vec::from(old_pass.as_bytes()),
            }));
        }
        if let Some(new_pass) = pm.new_pass {
            pm_vec.push(Tag::OctetString(OctetString {
                id: 2,
                class: TagClass::Context,
                inner: Vec::from(new_pass.as_bytes()),
            }));
        }
        let pm_val = Tag::Sequence(Sequence {
            inner: pm_vec,
            ..Default::default()
        })
        .into_structure();
        let mut buf = BytesMut::new();
        write::encode_into(&mut buf, pm_val).expect("encoded");
        Exop {
            name: Some(PASSMOD_OID.to_owned()),
            val: Some(Vec::from(&buf[..])),
        }
    }
}

impl ExopParser for PasswordModifyResp {
    fn parse(val: &[u8]) -> PasswordModifyResp {
        let comps = match parse_tag(val) {
            Ok((_, tag)) => tag,
            _ => panic!("passmodresp: failed to parse tag"),
        }
        .expect_constructed()
        .expect("passmodresp: elements");
        let gen_password = comps.into_iter().next().map(|t| {
            String::from_utf8(t.expect_primitive().expect("passmodresp: genPasswd"))
                .expect("passmodresp: genPasswd utf8")
        });
        PasswordModifyResp { gen_password }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_value_shape() {
        let exop: Exop = PasswordModify {
            user_id: Some("uid=x"),
            old_pass: Some("old"),
            new_pass: Some("new"),
        }
        .into();
        assert_eq!(exop.name.as_deref(), Some(PASSMOD_OID));
        assert_eq!(
            exop.val.as_deref(),
            Some(&b"\x30\x11\x80\x05uid=x\x81\x03old\x82\x03new"[..])
        );
    }

    #[test]
    fn response_parse() {
        let resp = PasswordModifyResp::parse(b"\x30\x0a\x80\x08hunter42");
        assert_eq!(resp.gen_password.as_deref(), Some("hunter42"));
        let resp = PasswordModifyResp::parse(b"\x30\x00");
        assert!(resp.gen_password.is_none());
    }
}
