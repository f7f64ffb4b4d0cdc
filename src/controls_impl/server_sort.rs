use crate::controls_impl::{ControlParser, MakeCritical, RawControl};

use bytes::BytesMut;
use lber::common::TagClass;
use lber::parse::{parse_tag, parse_uint};
use lber::structures::{ASNTag, OctetString, Sequence, Tag};
use lber::write;

pub const SERVER_SORT_OID: &str = "1.2.840.113556.1.4.473";
pub const SERVER_SORT_RESULT_OID: &str = "1.2.840.113556.1.4.474";

/// One sort key of the Server Side Sort request control (RFC 2891).
#[derive(Clone, Debug, Default)]
pub struct SortKey {
    /// Attribute to sort by.
    pub attr: String,
    /// Optional ordering matching rule OID.
    pub matching_rule: Option<String>,
    /// Sort in reverse order.
    pub reverse: bool,
}

/// Server Side Sort request control (RFC 2891).
#[derive(Clone, Debug, Default)]
pub struct ServerSort {
    pub keys: Vec<SortKey>,
}

impl MakeCritical for ServerSort {}

impl From<ServerSort> for RawControl {
    fn from(ss: ServerSort) -> RawControl {
        let keys = ss
            .keys
            .into_iter()
            .map(|key| {
                let mut parts = vec![Tag::OctetString(OctetString {
                    inner: key.attr.into_bytes(),
                    ..Default::default()
                })];
                if let Some(rule) = key.matching_rule {
                    parts.push(Tag::OctetString(OctetString {
                        id: 0,
                        class: TagClass::Context,
                        inner: rule.into_bytes(),
                    }));
                }
                if key.reverse {
                    // BooleanType [1], only transmitted when true
                    parts.push(Tag::OctetString(OctetString {
                        id: 1,
                        class: TagClass::Context,
                        inner: vec![0xFF],
                    }));
                }
                Tag::Sequence(Sequence {
                    inner: parts,
                    ..Default::default()
                })
            })
            .collect();
        let val = Tag::Sequence(Sequence {
            inner: keys,
            ..Default::default()
        })
        .into_structure();
        let mut buf = BytesMut::new();
        write::encode_into(&mut buf, val).expect("encoded");
        RawControl {
            ctype: SERVER_SORT_OID.to_owned(),
            crit: false,
            val: Some(Vec::from(&buf[..])),
        }
    }
}

/// Server Side Sort response control (RFC 2891).
#[derive(Clone, Debug)]
pub struct ServerSortResult {
    /// Sort outcome, an LDAP result code; zero means the results are sorted.
    pub result: u32,
    /// The first attribute the server could not sort by, if any.
    pub attr: Option<String>,
}

impl ControlParser for ServerSortResult {
    fn parse(val: &[u8]) -> ServerSortResult {
        let mut comps = match parse_tag(val) {
            Ok((_, tag)) => tag,
            _ => panic!("sortresult: failed to parse tag"),
        }
        .expect_constructed()
        .expect("sortresult: elements")
        .into_iter();
        let result = match parse_uint(
            comps
                .next()
                .expect("sortresult: result")
                .expect_primitive()
                .expect("sortresult: result octets")
                .as_slice(),
        ) {
            Ok((_, rc)) => rc as u32,
            _ => panic!("sortresult: failed to parse result code"),
        };
        let attr = comps.next().map(|t| {
            String::from_utf8(t.expect_primitive().expect("sortresult: attr octets"))
                .expect("sortresult: attr")
        });
        ServerSortResult { result, attr }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_value_shape() {
        let rc = RawControl::from(ServerSort {
            keys: vec![SortKey {
                attr: "cn".to_owned(),
                matching_rule: None,
                reverse: true,
            }],
        });
        assert_eq!(rc.ctype, SERVER_SORT_OID);
        assert_eq!(
            rc.val.as_deref(),
            Some(&b"\x30\x09\x30\x07\x04\x02cn\x81\x01\xff"[..])
        );
    }

    #[test]
    fn result_parse() {
        // SEQUENCE { ENUMERATED 53, attributeType "cn" }
        let val = b"\x30\x07\x0a\x01\x35\x04\x02cn";
        let sr = ServerSortResult::parse(val);
        assert_eq!(sr.result, 53);
        assert_eq!(sr.attr.as_deref(), Some("cn"));
    }
}
