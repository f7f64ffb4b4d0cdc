use crate::controls_impl::{ControlParser, MakeCritical, RawControl};

use bytes::BytesMut;
use lber::parse::{parse_tag, parse_uint};
use lber::structures::{ASNTag, Integer, OctetString, Sequence, Tag};
use lber::write;

pub const PAGED_RESULTS_OID: &str = "1.2.840.113556.1.4.319";

/// Paged Results control (RFC 2696).
///
/// The same structure describes both the request and the response control:
/// a requested page size together with an opaque cookie which resumes the
/// search where the previous page left off. An empty cookie in a response
/// means the result set is exhausted; a request with a zero size and the
/// last cookie releases the search state on the server.
#[derive(Clone, Debug, Default)]
pub struct PagedResults {
    pub size: i32,
    pub cookie: Vec<u8>,
}

impl MakeCritical for PagedResults {}

impl From<PagedResults> for RawControl {
    fn from(pr: PagedResults) -> RawControl {
        let cap_est = pr.cookie.len() + 16;
        let cookie_val = Tag::Sequence(Sequence {
            inner: vec![
                Tag::Integer(Integer {
                    inner: pr.size as i64,
                    ..Default::default()
                }),
                Tag::OctetString(OctetString {
                    inner: pr.cookie,
                    ..Default::default()
                }),
            ],
            ..Default::default()
        })
        .into_structure();
        let mut buf = BytesMut::with_capacity(cap_est);
        write::encode_into(&mut buf, cookie_val).expect("encoded");
        RawControl {
            ctype: PAGED_RESULTS_OID.to_owned(),
            crit: false,
            val: Some(Vec::from(&buf[..])),
        }
    }
}

impl ControlParser for PagedResults {
    fn parse(val: &[u8]) -> PagedResults {
        let mut pr_comps = match parse_tag(val) {
            Ok((_, tag)) => tag,
            _ => panic!("pagedresults: failed to parse tag"),
        }
        .expect_constructed()
        .expect("pagedresults: elements")
        .into_iter();
        let size = match parse_uint(
            pr_comps
                .next()
                .expect("pagedresults: size")
                .expect_primitive()
                .expect("pagedresults: size octets")
                .as_slice(),
        ) {
            Ok((_, size)) => size as i32,
            _ => panic!("pagedresults: failed to parse size"),
        };
        let cookie = pr_comps
            .next()
            .expect("pagedresults: cookie")
            .expect_primitive()
            .expect("pagedresults: cookie octets");
        PagedResults { size, cookie }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn value_roundtrip() {
        let rc = RawControl::from(PagedResults {
            size: 5,
            cookie: vec![0xDE, 0xAD],
        });
        assert_eq!(rc.ctype, PAGED_RESULTS_OID);
        let pr = PagedResults::parse(rc.val.as_ref().unwrap());
        assert_eq!(pr.size, 5);
        assert_eq!(pr.cookie, vec![0xDE, 0xAD]);
    }

    #[test]
    fn empty_cookie_value() {
        let rc = RawControl::from(PagedResults {
            size: 100,
            cookie: vec![],
        });
        assert_eq!(rc.val.as_deref(), Some(&b"\x30\x05\x02\x01\x64\x04\x00"[..]));
    }
}
