//! Search filter compiler and decompiler (RFC 4515).
//!
//! [`parse`](fn.parse.html) turns the string representation of a filter into
//! the context-tagged structure used in a Search request;
//! [`unparse`](fn.unparse.html) does the reverse, producing the canonical
//! string form. For a compilable string `s`, `unparse(parse(s))` is the
//! canonical form of `s`, and compiling the canonical form yields the same
//! BER structure.

#![allow(clippy::blocks_in_conditions)]

use std::fmt::Write as _;

use crate::result::{LdapError, Result};

use lber::common::TagClass;
use lber::structure::{StructureTag, PL};
use lber::structures::{Boolean, ExplicitTag, OctetString, Sequence, Tag};

use nom::branch::alt;
use nom::bytes::complete::{tag, take_while, take_while1};
use nom::character::complete::digit1;
use nom::character::{is_alphabetic, is_alphanumeric, is_hex_digit};
use nom::combinator::{map, map_res, opt, recognize, verify};
use nom::multi::{fold_many0, many0};
use nom::number::complete::be_u8;
use nom::sequence::{delimited, preceded};
use nom::IResult;

const AND_FILT: u64 = 0;
const OR_FILT: u64 = 1;
const NOT_FILT: u64 = 2;

const EQ_MATCH: u64 = 3;
const SUBSTR_MATCH: u64 = 4;
const GTE_MATCH: u64 = 5;
const LTE_MATCH: u64 = 6;
const PRES_MATCH: u64 = 7;
const APPROX_MATCH: u64 = 8;
const EXT_MATCH: u64 = 9;

const SUB_INITIAL: u64 = 0;
const SUB_ANY: u64 = 1;
const SUB_FINAL: u64 = 2;

const EXT_RULE: u64 = 1;
const EXT_TYPE: u64 = 2;
const EXT_VALUE: u64 = 3;
const EXT_DNATTRS: u64 = 4;

/// Compile the string representation of a search filter into its
/// context-tagged structure. The error carries the byte offset at which
/// compilation stopped.
pub fn parse(input: impl AsRef<[u8]>) -> Result<Tag> {
    let input = input.as_ref();
    match filtexpr(input) {
        Ok((r, t)) => {
            if r.is_empty() {
                Ok(t)
            } else {
                Err(LdapError::FilterCompile(input.len() - r.len()))
            }
        }
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            Err(LdapError::FilterCompile(input.len() - e.input.len()))
        }
        Err(nom::Err::Incomplete(_)) => Err(LdapError::FilterCompile(input.len())),
    }
}

fn filtexpr(i: &[u8]) -> IResult<&[u8], Tag> {
    alt((filter, item))(i)
}

fn filter(i: &[u8]) -> IResult<&[u8], Tag> {
    delimited(tag(b"("), filtercomp, tag(b")"))(i)
}

fn filtercomp(i: &[u8]) -> IResult<&[u8], Tag> {
    alt((and, or, not, item))(i)
}

fn filterlist(i: &[u8]) -> IResult<&[u8], Vec<Tag>> {
    many0(filter)(i)
}

fn and(i: &[u8]) -> IResult<&[u8], Tag> {
    map(preceded(tag(b"&"), filterlist), |tagv: Vec<Tag>| -> Tag {
        Tag::Sequence(Sequence {
            class: TagClass::Context,
            id: AND_FILT,
            inner: tagv,
        })
    })(i)
}

fn or(i: &[u8]) -> IResult<&[u8], Tag> {
    map(preceded(tag(b"|"), filterlist), |tagv: Vec<Tag>| -> Tag {
        Tag::Sequence(Sequence {
            class: TagClass::Context,
            id: OR_FILT,
            inner: tagv,
        })
    })(i)
}

fn not(i: &[u8]) -> IResult<&[u8], Tag> {
    map(preceded(tag(b"!"), filter), |tag: Tag| -> Tag {
        Tag::ExplicitTag(ExplicitTag {
            class: TagClass::Context,
            id: NOT_FILT,
            inner: Box::new(tag),
        })
    })(i)
}

fn item(i: &[u8]) -> IResult<&[u8], Tag> {
    alt((eq, non_eq, extensible))(i)
}

enum Unescaper {
    WantFirst,
    WantSecond(u8),
    Value(u8),
    Error,
}

impl Unescaper {
    fn feed(&self, c: u8) -> Unescaper {
        match *self {
            Unescaper::Error => Unescaper::Error,
            Unescaper::WantFirst => {
                if is_hex_digit(c) {
                    Unescaper::WantSecond(
                        c - if c <= b'9' {
                            b'0'
                        } else {
                            (c & 0x20) + b'A' - 10
                        },
                    )
                } else {
                    Unescaper::Error
                }
            }
            Unescaper::WantSecond(partial) => {
                if is_hex_digit(c) {
                    Unescaper::Value(
                        (partial << 4)
                            + (c - if c <= b'9' {
                                b'0'
                            } else {
                                (c & 0x20) + b'A' - 10
                            }),
                    )
                } else {
                    Unescaper::Error
                }
            }
            Unescaper::Value(_v) => {
                if c != b'\\' {
                    Unescaper::Value(c)
                } else {
                    Unescaper::WantFirst
                }
            }
        }
    }
}

// Any byte in the assertion value may be represented by \NN, where N is a
// hex digit. Some characters must be represented in this way: parentheses,
// asterisk and backslash itself.
fn unescaped(i: &[u8]) -> IResult<&[u8], Vec<u8>> {
    map_res(
        fold_many0(
            verify(be_u8, is_value_char),
            || (Unescaper::Value(0), Vec::new()),
            |(mut u, mut vec): (Unescaper, Vec<_>), c: u8| {
                u = u.feed(c);
                if let Unescaper::Value(c) = u {
                    vec.push(c);
                }
                (u, vec)
            },
        ),
        |(u, vec): (Unescaper, Vec<_>)| -> std::result::Result<Vec<u8>, ()> {
            if let Unescaper::Value(_) = u {
                Ok(vec)
            } else {
                Err(())
            }
        },
    )(i)
}

fn is_value_char(&c: &u8) -> bool {
    c != 0 && c != b'(' && c != b')' && c != b'*'
}

fn non_eq(i: &[u8]) -> IResult<&[u8], Tag> {
    let (i, attr) = attributedescription(i)?;
    let (i, filterop) = alt((tag(b">="), tag(b"<="), tag("~=")))(i)?;
    let (i, value) = unescaped(i)?;
    let tag = Tag::Sequence(Sequence {
        class: TagClass::Context,
        id: filtertag(filterop),
        inner: vec![
            Tag::OctetString(OctetString {
                inner: attr.to_vec(),
                ..Default::default()
            }),
            Tag::OctetString(OctetString {
                inner: value,
                ..Default::default()
            }),
        ],
    });
    Ok((i, tag))
}

fn filtertag(filterop: &[u8]) -> u64 {
    match filterop {
        b">=" => GTE_MATCH,
        b"<=" => LTE_MATCH,
        b"~=" => APPROX_MATCH,
        _ => unimplemented!(),
    }
}

fn eq(i: &[u8]) -> IResult<&[u8], Tag> {
    let (i, attr) = attributedescription(i)?;
    let (i, _) = tag(b"=")(i)?;
    let (i, initial) = unescaped(i)?;
    let (i, mid_final) = map_res(
        many0(preceded(tag(b"*"), unescaped)),
        |v: Vec<Vec<u8>>| -> std::result::Result<Vec<Vec<u8>>, ()> {
            // empty parts are only allowed in the final position
            if v.iter().enumerate().fold(false, |acc, (n, ve)| {
                acc || ve.is_empty() && n + 1 != v.len()
            }) {
                Err(())
            } else {
                Ok(v)
            }
        },
    )(i)?;
    let tag = if mid_final.is_empty() {
        // simple equality, no asterisks in assertion value
        Tag::Sequence(Sequence {
            class: TagClass::Context,
            id: EQ_MATCH,
            inner: vec![
                Tag::OctetString(OctetString {
                    inner: attr.to_vec(),
                    ..Default::default()
                }),
                Tag::OctetString(OctetString {
                    inner: initial,
                    ..Default::default()
                }),
            ],
        })
    } else if initial.is_empty() && mid_final.len() == 1 && mid_final[0].is_empty() {
        // presence, single asterisk in assertion value
        Tag::OctetString(OctetString {
            class: TagClass::Context,
            id: PRES_MATCH,
            inner: attr.to_vec(),
        })
    } else {
        // substring match
        let mut inner = vec![];
        if !initial.is_empty() {
            inner.push(Tag::OctetString(OctetString {
                class: TagClass::Context,
                id: SUB_INITIAL,
                inner: initial,
            }));
        }
        let n = mid_final.len();
        for (i, sub_elem) in mid_final.into_iter().enumerate() {
            if sub_elem.is_empty() {
                break;
            }
            inner.push(Tag::OctetString(OctetString {
                class: TagClass::Context,
                id: if i + 1 != n { SUB_ANY } else { SUB_FINAL },
                inner: sub_elem,
            }));
        }
        Tag::Sequence(Sequence {
            class: TagClass::Context,
            id: SUBSTR_MATCH,
            inner: vec![
                Tag::OctetString(OctetString {
                    inner: attr.to_vec(),
                    ..Default::default()
                }),
                Tag::Sequence(Sequence {
                    inner,
                    ..Default::default()
                }),
            ],
        })
    };
    Ok((i, tag))
}

fn extensible(i: &[u8]) -> IResult<&[u8], Tag> {
    alt((attr_dn_mrule, dn_mrule))(i)
}

fn attr_dn_mrule(i: &[u8]) -> IResult<&[u8], Tag> {
    let (i, attr) = attributedescription(i)?;
    let (i, dn) = opt(tag(b":dn"))(i)?;
    let (i, mrule) = opt(preceded(tag(b":"), attributetype))(i)?;
    let (i, _) = tag(b":=")(i)?;
    let (i, value) = unescaped(i)?;
    Ok((i, extensible_tag(mrule, Some(attr), value, dn.is_some())))
}

fn dn_mrule(i: &[u8]) -> IResult<&[u8], Tag> {
    let (i, dn) = opt(tag(b":dn"))(i)?;
    let (i, mrule) = preceded(tag(b":"), attributetype)(i)?;
    let (i, _) = tag(b":=")(i)?;
    let (i, value) = unescaped(i)?;
    Ok((i, extensible_tag(Some(mrule), None, value, dn.is_some())))
}

fn extensible_tag(mrule: Option<&[u8]>, attr: Option<&[u8]>, value: Vec<u8>, dn: bool) -> Tag {
    let mut inner = vec![];
    if let Some(mrule) = mrule {
        inner.push(Tag::OctetString(OctetString {
            class: TagClass::Context,
            id: EXT_RULE,
            inner: mrule.to_vec(),
        }));
    }
    if let Some(attr) = attr {
        inner.push(Tag::OctetString(OctetString {
            class: TagClass::Context,
            id: EXT_TYPE,
            inner: attr.to_vec(),
        }));
    }
    inner.push(Tag::OctetString(OctetString {
        class: TagClass::Context,
        id: EXT_VALUE,
        inner: value,
    }));
    if dn {
        inner.push(Tag::Boolean(Boolean {
            class: TagClass::Context,
            id: EXT_DNATTRS,
            inner: dn,
        }));
    }
    Tag::Sequence(Sequence {
        class: TagClass::Context,
        id: EXT_MATCH,
        inner,
    })
}

fn attributedescription(i: &[u8]) -> IResult<&[u8], &[u8]> {
    recognize(|i| -> IResult<&[u8], ()> {
        let (i, _) = attributetype(i)?;
        let (i, _) = many0(preceded(tag(b";"), take_while1(is_alnum_hyphen)))(i)?;
        Ok((i, ()))
    })(i)
}

fn is_alnum_hyphen(c: u8) -> bool {
    is_alphanumeric(c) || c == b'-'
}

fn attributetype(i: &[u8]) -> IResult<&[u8], &[u8]> {
    alt((numericoid, descr))(i)
}

fn numericoid(i: &[u8]) -> IResult<&[u8], &[u8]> {
    recognize(|i| -> IResult<&[u8], ()> {
        let (i, _) = number(i)?;
        let (i, _) = many0(preceded(tag(b"."), number))(i)?;
        Ok((i, ()))
    })(i)
}

// A number may be zero, but must not have superfluous leading zeroes
fn number(i: &[u8]) -> IResult<&[u8], &[u8]> {
    verify(digit1, |d: &[u8]| d.len() == 1 || d[0] != b'0')(i)
}

fn descr(i: &[u8]) -> IResult<&[u8], &[u8]> {
    recognize(|i| -> IResult<&[u8], ()> {
        let (i, _) = verify(be_u8, |c| is_alphabetic(*c))(i)?;
        let (i, _) = take_while(is_alnum_hyphen)(i)?;
        Ok((i, ()))
    })(i)
}

/// Decompile a filter structure into the canonical string representation.
///
/// The input is the context-tagged structure of a SearchRequest filter, as
/// produced by [`parse`](fn.parse.html) or decoded from BER. Assertion
/// values are escaped: parentheses, the asterisk, the backslash, and any
/// byte outside printable ASCII become `\hh` escapes with lowercase hex
/// digits.
pub fn unparse(filter: &StructureTag) -> Result<String> {
    let mut out = String::new();
    write_filter(filter, &mut out)?;
    Ok(out)
}

fn decomp_err(reason: &'static str) -> LdapError {
    LdapError::FilterDecompile(reason)
}

fn escape_literal(bytes: &[u8], out: &mut String) {
    for &c in bytes {
        if c == b'(' || c == b')' || c == b'*' || c == b'\\' || c < 0x20 || c >= 0x7f {
            write!(out, "\\{:02x}", c).expect("write to string");
        } else {
            out.push(c as char);
        }
    }
}

fn constructed(t: &StructureTag) -> Result<&Vec<StructureTag>> {
    match t.payload {
        PL::C(ref tags) => Ok(tags),
        PL::P(_) => Err(decomp_err("expected constructed value")),
    }
}

fn primitive(t: &StructureTag) -> Result<&Vec<u8>> {
    match t.payload {
        PL::P(ref bytes) => Ok(bytes),
        PL::C(_) => Err(decomp_err("expected primitive value")),
    }
}

fn attr_str(t: &StructureTag) -> Result<&str> {
    std::str::from_utf8(primitive(t)?).map_err(|_| decomp_err("non-UTF-8 attribute description"))
}

fn write_simple_item(
    comps: &[StructureTag],
    filterop: &'static str,
    out: &mut String,
) -> Result<()> {
    if comps.len() != 2 {
        return Err(decomp_err("match item needs attribute and value"));
    }
    out.push_str(attr_str(&comps[0])?);
    out.push_str(filterop);
    escape_literal(primitive(&comps[1])?, out);
    Ok(())
}

fn write_filter(t: &StructureTag, out: &mut String) -> Result<()> {
    if t.class != TagClass::Context {
        return Err(decomp_err("filter tags must be context-class"));
    }
    out.push('(');
    match t.id {
        AND_FILT | OR_FILT => {
            out.push(if t.id == AND_FILT { '&' } else { '|' });
            for child in constructed(t)? {
                write_filter(child, out)?;
            }
        }
        NOT_FILT => {
            out.push('!');
            let inner = constructed(t)?;
            if inner.len() != 1 {
                return Err(decomp_err("Not filter needs a single component"));
            }
            write_filter(&inner[0], out)?;
        }
        EQ_MATCH => write_simple_item(constructed(t)?, "=", out)?,
        GTE_MATCH => write_simple_item(constructed(t)?, ">=", out)?,
        LTE_MATCH => write_simple_item(constructed(t)?, "<=", out)?,
        APPROX_MATCH => write_simple_item(constructed(t)?, "~=", out)?,
        PRES_MATCH => {
            out.push_str(attr_str(t)?);
            out.push_str("=*");
        }
        SUBSTR_MATCH => {
            let comps = constructed(t)?;
            if comps.len() != 2 {
                return Err(decomp_err("substring match needs attribute and components"));
            }
            out.push_str(attr_str(&comps[0])?);
            out.push('=');
            let mut saw_final = false;
            for sub in constructed(&comps[1])? {
                match sub.id {
                    SUB_INITIAL => escape_literal(primitive(sub)?, out),
                    SUB_ANY => {
                        out.push('*');
                        escape_literal(primitive(sub)?, out);
                    }
                    SUB_FINAL => {
                        out.push('*');
                        escape_literal(primitive(sub)?, out);
                        saw_final = true;
                    }
                    _ => return Err(decomp_err("unknown substring component")),
                }
            }
            if !saw_final {
                out.push('*');
            }
        }
        EXT_MATCH => {
            let mut mrule = None;
            let mut attr = None;
            let mut value = None;
            let mut dn_attrs = false;
            for comp in constructed(t)? {
                match comp.id {
                    EXT_RULE => mrule = Some(attr_str(comp)?),
                    EXT_TYPE => attr = Some(attr_str(comp)?),
                    EXT_VALUE => value = Some(primitive(comp)?),
                    EXT_DNATTRS => {
                        dn_attrs = primitive(comp)?.first().map(|&b| b != 0).unwrap_or(false)
                    }
                    _ => return Err(decomp_err("unknown extensible match component")),
                }
            }
            if let Some(attr) = attr {
                out.push_str(attr);
            }
            if dn_attrs {
                out.push_str(":dn");
            }
            if let Some(mrule) = mrule {
                out.push(':');
                out.push_str(mrule);
            }
            out.push_str(":=");
            escape_literal(
                value.ok_or_else(|| decomp_err("extensible match without a value"))?,
                out,
            );
        }
        _ => return Err(decomp_err("unknown filter tag")),
    }
    out.push(')');
    Ok(())
}

#[cfg(test)]
mod test {
    use super::{parse, unparse};
    use lber::structures::ASNTag;

    fn ber_vec_eq(filter: &str, ber: &[u8]) {
        use bytes::BytesMut;
        use lber::write;

        let mut buf = BytesMut::new();
        let tag = parse(filter).unwrap();
        write::encode_into(&mut buf, tag.into_structure()).unwrap();
        assert_eq!(buf, ber);
    }

    fn roundtrip(filter: &str, canonical: &str) {
        let text = unparse(&parse(filter).unwrap().into_structure()).unwrap();
        assert_eq!(text, canonical);
        // the canonical form must compile to the same structure
        assert_eq!(
            parse(&text).unwrap().into_structure(),
            parse(filter).unwrap().into_structure()
        );
    }

    #[test]
    fn filt_bare_item() {
        ber_vec_eq("a=v", b"\xa3\x06\x04\x01a\x04\x01v");
    }

    #[test]
    fn filt_simple_eq() {
        ber_vec_eq("(a=v)", b"\xa3\x06\x04\x01a\x04\x01v");
    }

    #[test]
    fn filt_empty() {
        assert!(parse("()").is_err());
        assert!(parse("").is_err());
    }

    #[test]
    fn filt_extra_garbage() {
        assert!(parse("(a=v)garbage").is_err());
    }

    #[test]
    fn filt_error_offset() {
        match parse("(a=v\\2)") {
            Err(crate::LdapError::FilterCompile(pos)) => assert!(pos > 0),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn filt_simple_noneq() {
        ber_vec_eq("(a<=2)", b"\xa6\x06\x04\x01a\x04\x012");
    }

    #[test]
    fn filt_approx_tag() {
        ber_vec_eq("(a~=2)", b"\xa8\x06\x04\x01a\x04\x012");
    }

    #[test]
    fn filt_pres() {
        ber_vec_eq("(a=*)", b"\x87\x01a");
    }

    #[test]
    fn filt_ast_ini() {
        ber_vec_eq("(a=*v)", b"\xa4\x08\x04\x01a0\x03\x82\x01v");
    }

    #[test]
    fn filt_ast_fin() {
        ber_vec_eq("(a=v*)", b"\xa4\x08\x04\x01a0\x03\x80\x01v");
    }

    #[test]
    fn filt_ast_multi() {
        ber_vec_eq(
            "(a=v*x*y)",
            b"\xa4\x0e\x04\x01a0\t\x80\x01v\x81\x01x\x82\x01y",
        );
    }

    #[test]
    fn filt_ast_double() {
        assert!(parse("(a=f**)").is_err());
    }

    #[test]
    fn filt_esc_ok() {
        ber_vec_eq("(a=v\\2ax)", b"\xa3\x08\x04\x01a\x04\x03v*x");
    }

    #[test]
    fn filt_esc_paren() {
        // \29 inside a value decodes to a right parenthesis
        ber_vec_eq("(a=v\\29)", b"\xa3\x07\x04\x01a\x04\x02v)");
    }

    #[test]
    fn filt_esc_runt() {
        assert!(parse("(a=v\\2)").is_err());
    }

    #[test]
    fn filt_esc_invalid() {
        assert!(parse("(a=v\\0x)").is_err());
    }

    #[test]
    fn filt_oid() {
        ber_vec_eq("(2.5.4.3=v)", b"\xa3\x0c\x04\x072.5.4.3\x04\x01v");
    }

    #[test]
    fn filt_oid0() {
        ber_vec_eq("(2.5.4.0=top)", b"\xa3\x0e\x04\x072.5.4.0\x04\x03top");
    }

    #[test]
    fn filt_oidl0() {
        assert!(parse("(2.5.04.0=top)").is_err());
    }

    #[test]
    fn filt_complex() {
        ber_vec_eq("(&(a=v)(b=x)(!(c=y)))", b"\xa0\x1a\xa3\x06\x04\x01a\x04\x01v\xa3\x06\x04\x01b\x04\x01x\xa2\x08\xa3\x06\x04\x01c\x04\x01y");
    }

    #[test]
    fn filt_abs_true() {
        ber_vec_eq("(&)", b"\xa0\0");
    }

    #[test]
    fn filt_abs_false() {
        ber_vec_eq("(|)", b"\xa1\0");
    }

    #[test]
    fn filt_ext_dn() {
        ber_vec_eq(
            "(ou:dn:=People)",
            b"\xa9\x0f\x82\x02ou\x83\x06People\x84\x01\xff",
        );
    }

    #[test]
    fn filt_ext_mrule() {
        ber_vec_eq(
            "(cn:2.5.13.5:=J D)",
            b"\xa9\x13\x81\x082.5.13.5\x82\x02cn\x83\x03J D",
        );
    }

    #[test]
    fn filt_simple_utf8() {
        ber_vec_eq("(a=ć)", b"\xa3\x07\x04\x01a\x04\x02\xc4\x87");
    }

    #[test]
    fn unparse_simple() {
        roundtrip("(&(sn=Miller)(givenName=Bob))", "(&(sn=Miller)(givenName=Bob))");
    }

    #[test]
    fn unparse_not() {
        roundtrip("(!(sn=Miller))", "(!(sn=Miller))");
    }

    #[test]
    fn unparse_pres_and_substrings() {
        roundtrip("(cn=*)", "(cn=*)");
        roundtrip("(cn=*a*b*)", "(cn=*a*b*)");
        roundtrip("(cn=Mi*ll*er)", "(cn=Mi*ll*er)");
        roundtrip("(cn=ller*)", "(cn=ller*)");
        roundtrip("(cn=*ller)", "(cn=*ller)");
    }

    #[test]
    fn unparse_escapes_utf8() {
        // the substring-any value carries the raw UTF-8 bytes of the
        // character; the canonical text form hex-escapes them
        roundtrip("(sn=Mi*함*r)", "(sn=Mi*\\ed\\95\\a8*r)");
    }

    #[test]
    fn unparse_escapes_specials() {
        roundtrip("(a=v\\2ax)", "(a=v\\2ax)");
        roundtrip("(a=v\\29)", "(a=v\\29)");
    }

    #[test]
    fn unparse_extensible() {
        roundtrip("(attr:dn:rule:=v)", "(attr:dn:rule:=v)");
        roundtrip("(cn:2.5.13.5:=J D)", "(cn:2.5.13.5:=J D)");
        roundtrip("(:caseExactMatch:=value)", "(:caseExactMatch:=value)");
    }

    #[test]
    fn unparse_rejects_non_filter() {
        use lber::common::TagClass;
        use lber::structure::{StructureTag, PL};

        let t = StructureTag {
            class: TagClass::Universal,
            id: 4,
            payload: PL::P(vec![b'x']),
        };
        assert!(unparse(&t).is_err());
    }
}
