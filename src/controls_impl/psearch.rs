use crate::controls_impl::{ControlParser, MakeCritical, RawControl};

use bytes::BytesMut;
use lber::parse::{parse_tag, parse_uint};
use lber::structure::StructureTag;
use lber::structures::{ASNTag, Boolean, Integer, Sequence, Tag};
use lber::universal::Types;
use lber::write;

pub const PERSISTENT_SEARCH_OID: &str = "2.16.840.1.113730.3.4.3";
pub const ENTRY_CHANGE_OID: &str = "2.16.840.1.113730.3.4.7";

/// Entry change types of the Persistent Search draft, used both as the
/// request bitmask and the change type of an Entry Change Notification.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChangeType {
    Add = 1,
    Delete = 2,
    Modify = 4,
    ModDn = 8,
}

impl ChangeType {
    fn from_code(code: u64) -> Option<ChangeType> {
        Some(match code {
            1 => ChangeType::Add,
            2 => ChangeType::Delete,
            4 => ChangeType::Modify,
            8 => ChangeType::ModDn,
            _ => return None,
        })
    }
}

/// Persistent Search request control
/// (draft-ietf-ldapext-psearch, widely implemented).
///
/// The search doesn't terminate after the initial result set; instead, the
/// server keeps it open and sends an entry whenever one matching the search
/// is changed in a way included in `change_types`.
#[derive(Clone, Debug)]
pub struct PersistentSearch {
    /// Change types to monitor.
    pub change_types: Vec<ChangeType>,
    /// Skip the initial result set, returning only changed entries.
    pub changes_only: bool,
    /// Attach an Entry Change Notification control to each returned entry.
    pub return_ecs: bool,
}

impl Default for PersistentSearch {
    fn default() -> PersistentSearch {
        PersistentSearch {
            change_types: vec![
                ChangeType::Add,
                ChangeType::Delete,
                ChangeType::Modify,
                ChangeType::ModDn,
            ],
            changes_only: false,
            return_ecs: true,
        }
    }
}

impl MakeCritical for PersistentSearch {}

impl From<PersistentSearch> for RawControl {
    fn from(ps: PersistentSearch) -> RawControl {
        let mask = ps
            .change_types
            .iter()
            .fold(0i64, |mask, &ct| mask | ct as i64);
        let val = Tag::Sequence(Sequence {
            inner: vec![
                Tag::Integer(Integer {
                    inner: mask,
                    ..Default::default()
                }),
                Tag::Boolean(Boolean {
                    inner: ps.changes_only,
                    ..Default::default()
                }),
                Tag::Boolean(Boolean {
                    inner: ps.return_ecs,
                    ..Default::default()
                }),
            ],
            ..Default::default()
        })
        .into_structure();
        let mut buf = BytesMut::new();
        write::encode_into(&mut buf, val).expect("encoded");
        RawControl {
            ctype: PERSISTENT_SEARCH_OID.to_owned(),
            crit: false,
            val: Some(Vec::from(&buf[..])),
        }
    }
}

/// Entry Change Notification control, attached by the server to entries
/// returned from a Persistent Search with `return_ecs` set.
#[derive(Clone, Debug)]
pub struct EntryChangeNotification {
    /// The change which caused the entry to be returned.
    pub change_type: Option<ChangeType>,
    /// Previous DN, present for ModDn changes.
    pub previous_dn: Option<String>,
    /// Change number, if the server keeps a change log.
    pub change_number: Option<i64>,
}

impl ControlParser for EntryChangeNotification {
    fn parse(val: &[u8]) -> EntryChangeNotification {
        let comps = match parse_tag(val) {
            Ok((_, tag)) => tag,
            _ => panic!("entrychange: failed to parse tag"),
        }
        .expect_constructed()
        .expect("entrychange: elements")
        .into_iter();
        let mut change_type = None;
        let mut previous_dn = None;
        let mut change_number = None;
        for comp in comps {
            match comp {
                StructureTag { id, .. } if id == Types::Enumerated as u64 => {
                    let code = match parse_uint(
                        comp.expect_primitive()
                            .expect("entrychange: change type")
                            .as_slice(),
                    ) {
                        Ok((_, code)) => code,
                        _ => panic!("entrychange: failed to parse change type"),
                    };
                    change_type = ChangeType::from_code(code);
                }
                StructureTag { id, .. } if id == Types::OctetString as u64 => {
                    previous_dn = Some(
                        String::from_utf8(
                            comp.expect_primitive().expect("entrychange: previous dn"),
                        )
                        .expect("entrychange: previous dn utf8"),
                    );
                }
                StructureTag { id, .. } if id == Types::Integer as u64 => {
                    change_number = match parse_uint(
                        comp.expect_primitive()
                            .expect("entrychange: change number")
                            .as_slice(),
                    ) {
                        Ok((_, num)) => Some(num as i64),
                        _ => panic!("entrychange: failed to parse change number"),
                    };
                }
                _ => panic!("entrychange: unrecognized component"),
            }
        }
        EntryChangeNotification {
            change_type,
            previous_dn,
            change_number,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_value_shape() {
        let rc = RawControl::from(PersistentSearch::default());
        assert_eq!(
            rc.val.as_deref(),
            Some(&b"\x30\x09\x02\x01\x0f\x01\x01\x00\x01\x01\xff"[..])
        );
    }

    #[test]
    fn entry_change_parse() {
        // SEQUENCE { ENUMERATED modDN(8), previousDN, changeNumber 7 }
        let val = b"\x30\x0d\x0a\x01\x08\x04\x05cn=ol\x02\x01\x07";
        let ecn = EntryChangeNotification::parse(val);
        assert_eq!(ecn.change_type, Some(ChangeType::ModDn));
        assert_eq!(ecn.previous_dn.as_deref(), Some("cn=ol"));
        assert_eq!(ecn.change_number, Some(7));
    }
}
