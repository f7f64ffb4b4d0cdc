//! Controls specific to Active Directory.

use crate::controls_impl::{ControlParser, MakeCritical, RawControl};

use bytes::BytesMut;
use lber::parse::{parse_tag, parse_uint};
use lber::structures::{ASNTag, Integer, OctetString, Sequence, Tag};
use lber::write;

pub const SHOW_DELETED_OID: &str = "1.2.840.113556.1.4.417";
pub const NOTIFICATION_OID: &str = "1.2.840.113556.1.4.528";
pub const EXTENDED_DN_OID: &str = "1.2.840.113556.1.4.529";
pub const TREE_DELETE_OID: &str = "1.2.840.113556.1.4.805";
pub const DIRSYNC_OID: &str = "1.2.840.113556.1.4.841";

/// Show Deleted control: include tombstoned entries in search results.
/// No value.
#[derive(Clone, Debug, Default)]
pub struct ShowDeleted;

impl MakeCritical for ShowDeleted {}

impl From<ShowDeleted> for RawControl {
    fn from(_: ShowDeleted) -> RawControl {
        RawControl {
            ctype: SHOW_DELETED_OID.to_owned(),
            crit: false,
            val: None,
        }
    }
}

/// Notification control: turn the Search into a change notification
/// subscription which emits an entry for every modification under the
/// search base. No value.
#[derive(Clone, Debug, Default)]
pub struct Notification;

impl MakeCritical for Notification {}

impl From<Notification> for RawControl {
    fn from(_: Notification) -> RawControl {
        RawControl {
            ctype: NOTIFICATION_OID.to_owned(),
            crit: false,
            val: None,
        }
    }
}

/// Tree Delete control: delete the named entry together with its whole
/// subtree. No value.
#[derive(Clone, Debug, Default)]
pub struct TreeDelete;

impl MakeCritical for TreeDelete {}

impl From<TreeDelete> for RawControl {
    fn from(_: TreeDelete) -> RawControl {
        RawControl {
            ctype: TREE_DELETE_OID.to_owned(),
            crit: false,
            val: None,
        }
    }
}

/// Extended DN control: return DNs in the extended form which includes the
/// objectGUID and objectSid. The flag selects the string form: 0 for hex,
/// 1 for standard GUID/SID syntax.
#[derive(Clone, Debug, Default)]
pub struct ExtendedDn {
    pub flag: i32,
}

impl MakeCritical for ExtendedDn {}

impl From<ExtendedDn> for RawControl {
    fn from(edn: ExtendedDn) -> RawControl {
        let val = Tag::Sequence(Sequence {
            inner: vec![Tag::Integer(Integer {
                inner: edn.flag as i64,
                ..Default::default()
            })],
            ..Default::default()
        })
        .into_structure();
        let mut buf = BytesMut::new();
        write::encode_into(&mut buf, val).expect("encoded");
        RawControl {
            ctype: EXTENDED_DN_OID.to_owned(),
            crit: false,
            val: Some(Vec::from(&buf[..])),
        }
    }
}

/// DirSync control (request and response): incremental retrieval of
/// changed objects. The request carries behavior flags, a response size
/// limit in bytes, and the cookie of the previous round; the response
/// returns the flags and the next cookie in the same shape.
#[derive(Clone, Debug, Default)]
pub struct DirSync {
    pub flags: i64,
    pub max_bytes: i64,
    pub cookie: Vec<u8>,
}

impl MakeCritical for DirSync {}

impl From<DirSync> for RawControl {
    fn from(ds: DirSync) -> RawControl {
        let cap_est = ds.cookie.len() + 24;
        let val = Tag::Sequence(Sequence {
            inner: vec![
                Tag::Integer(Integer {
                    inner: ds.flags,
                    ..Default::default()
                }),
                Tag::Integer(Integer {
                    inner: ds.max_bytes,
                    ..Default::default()
                }),
                Tag::OctetString(OctetString {
                    inner: ds.cookie,
                    ..Default::default()
                }),
            ],
            ..Default::default()
        })
        .into_structure();
        let mut buf = BytesMut::with_capacity(cap_est);
        write::encode_into(&mut buf, val).expect("encoded");
        RawControl {
            ctype: DIRSYNC_OID.to_owned(),
            crit: true,
            val: Some(Vec::from(&buf[..])),
        }
    }
}

impl ControlParser for DirSync {
    fn parse(val: &[u8]) -> DirSync {
        let mut comps = match parse_tag(val) {
            Ok((_, tag)) => tag,
            _ => panic!("dirsync: failed to parse tag"),
        }
        .expect_constructed()
        .expect("dirsync: elements")
        .into_iter();
        let mut next_int = || match parse_uint(
            comps
                .next()
                .expect("dirsync: element")
                .expect_primitive()
                .expect("dirsync: integer octets")
                .as_slice(),
        ) {
            Ok((_, val)) => val as i64,
            _ => panic!("dirsync: failed to parse integer"),
        };
        let flags = next_int();
        let max_bytes = next_int();
        let cookie = comps
            .next()
            .expect("dirsync: cookie")
            .expect_primitive()
            .expect("dirsync: cookie octets");
        DirSync {
            flags,
            max_bytes,
            cookie,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dirsync_roundtrip() {
        let rc = RawControl::from(DirSync {
            flags: 1,
            max_bytes: 4096,
            cookie: vec![1, 2, 3],
        });
        assert!(rc.crit);
        let ds = DirSync::parse(rc.val.as_ref().unwrap());
        assert_eq!(ds.flags, 1);
        assert_eq!(ds.max_bytes, 4096);
        assert_eq!(ds.cookie, vec![1, 2, 3]);
    }

    #[test]
    fn valueless_controls() {
        assert!(RawControl::from(ShowDeleted).val.is_none());
        assert!(RawControl::from(Notification).val.is_none());
        assert!(RawControl::from(TreeDelete).val.is_none());
    }
}
