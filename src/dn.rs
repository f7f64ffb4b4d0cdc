//! Distinguished name parsing, printing and comparison (RFC 4514).
//!
//! [`parse_dn`](fn.parse_dn.html) turns the string form of a DN into a
//! sequence of relative DNs, honoring backslash and hex escapes, `#hex`
//! BER-encoded values, and multi-valued RDNs joined by `+`. The `Display`
//! implementation prints the structure back with lowercased attribute types
//! and the minimal escaping which yields an unambiguous parse, so printing
//! is idempotent and `parse_dn(dn.to_string())` is equal to `dn`.

use std::cmp::Ordering;
use std::fmt;

use crate::result::{LdapError, Result};

use lber::parse::parse_tag;

/// A distinguished name: the ordered sequence of its relative DNs, most
/// specific first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Dn {
    pub rdns: Vec<RelativeDn>,
}

/// A relative distinguished name, made of one or more attribute type and
/// value pairs. Multi-valued RDNs are joined by `+` in the string form.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelativeDn {
    pub attrs: Vec<AttributeTypeAndValue>,
}

/// A single attribute type and value pair within an RDN.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttributeTypeAndValue {
    pub attr_type: String,
    pub value: String,
}

fn err(offset: usize, reason: &'static str) -> LdapError {
    LdapError::DnParse { offset, reason }
}

fn is_hex(c: u8) -> bool {
    c.is_ascii_hexdigit()
}

// The characters which may follow a backslash as a single-character escape.
fn is_special(c: u8) -> bool {
    matches!(
        c,
        b' ' | b'"' | b'#' | b'+' | b',' | b';' | b'<' | b'=' | b'>' | b'\\'
    )
}

enum Sep {
    Plus,
    Rdn,
    End,
}

/// Parse the RFC 4514 string form of a distinguished name.
///
/// Both `,` and `;` separate RDNs; `+` separates the attributes of a
/// multi-valued RDN. Unescaped whitespace around `=` and the separators is
/// insignificant. A value starting with `#` is a hex-encoded BER value,
/// decoded to the contents of its primitive payload. The empty string
/// parses to a DN with no RDNs.
pub fn parse_dn(input: &str) -> Result<Dn> {
    let b = input.as_bytes();
    let mut i = 0;
    skip_spaces(b, &mut i);
    let mut rdns = Vec::new();
    if i == b.len() {
        return Ok(Dn { rdns });
    }
    let mut attrs = Vec::new();
    loop {
        let attr_type = parse_attr_type(input, &mut i)?;
        skip_spaces(b, &mut i);
        let (value, sep) = if i < b.len() && b[i] == b'#' {
            parse_hex_value(b, &mut i)?
        } else {
            parse_string_value(b, &mut i)?
        };
        attrs.push(AttributeTypeAndValue { attr_type, value });
        match sep {
            Sep::Plus => (),
            Sep::Rdn | Sep::End => {
                rdns.push(RelativeDn {
                    attrs: std::mem::take(&mut attrs),
                });
                if let Sep::End = sep {
                    break;
                }
            }
        }
        skip_spaces(b, &mut i);
        if i == b.len() {
            return Err(err(i, "incomplete type and value pair"));
        }
    }
    Ok(Dn { rdns })
}

fn skip_spaces(b: &[u8], i: &mut usize) {
    while *i < b.len() && b[*i] == b' ' {
        *i += 1;
    }
}

fn parse_attr_type(input: &str, i: &mut usize) -> Result<String> {
    let b = input.as_bytes();
    let start = *i;
    while *i < b.len() && !matches!(b[*i], b'=' | b',' | b';' | b'+') {
        *i += 1;
    }
    if *i == b.len() || b[*i] != b'=' {
        return Err(err(*i, "incomplete type and value pair"));
    }
    let attr_type = input[start..*i].trim_end_matches(' ');
    if attr_type.is_empty() {
        return Err(err(start, "empty attribute type"));
    }
    *i += 1;
    Ok(attr_type.to_owned())
}

fn parse_string_value(b: &[u8], i: &mut usize) -> Result<(String, Sep)> {
    let mut out: Vec<u8> = Vec::new();
    let mut trailing_spaces = 0;
    let sep;
    loop {
        if *i == b.len() {
            sep = Sep::End;
            break;
        }
        match b[*i] {
            b',' | b';' => {
                sep = Sep::Rdn;
                *i += 1;
                break;
            }
            b'+' => {
                sep = Sep::Plus;
                *i += 1;
                break;
            }
            b'\\' => {
                *i += 1;
                if *i == b.len() {
                    return Err(err(*i, "unterminated escape"));
                }
                let c = b[*i];
                if is_hex(c) {
                    *i += 1;
                    if *i == b.len() || !is_hex(b[*i]) {
                        return Err(err(*i, "invalid hex digit in escape"));
                    }
                    out.push((hex_nibble(c) << 4) | hex_nibble(b[*i]));
                } else if is_special(c) {
                    out.push(c);
                } else {
                    return Err(err(*i, "invalid escape"));
                }
                trailing_spaces = 0;
                *i += 1;
            }
            c => {
                out.push(c);
                if c == b' ' {
                    trailing_spaces += 1;
                } else {
                    trailing_spaces = 0;
                }
                *i += 1;
            }
        }
    }
    out.truncate(out.len() - trailing_spaces);
    let value = String::from_utf8(out).map_err(|_| err(*i, "value is not valid UTF-8"))?;
    Ok((value, sep))
}

fn hex_nibble(c: u8) -> u8 {
    if c <= b'9' {
        c - b'0'
    } else {
        (c | 0x20) - b'a' + 10
    }
}

fn parse_hex_value(b: &[u8], i: &mut usize) -> Result<(String, Sep)> {
    let start = *i;
    *i += 1; // consume '#'
    let mut bytes = Vec::new();
    let sep;
    loop {
        if *i == b.len() {
            sep = Sep::End;
            break;
        }
        match b[*i] {
            b',' | b';' => {
                sep = Sep::Rdn;
                *i += 1;
                break;
            }
            b'+' => {
                sep = Sep::Plus;
                *i += 1;
                break;
            }
            c if is_hex(c) => {
                *i += 1;
                if *i == b.len() || !is_hex(b[*i]) {
                    return Err(err(*i, "odd number of hex digits in #hex value"));
                }
                bytes.push((hex_nibble(c) << 4) | hex_nibble(b[*i]));
                *i += 1;
            }
            _ => return Err(err(*i, "invalid hex digit in #hex value")),
        }
    }
    let payload = match parse_tag(&bytes) {
        Ok((rest, tag)) if rest.is_empty() => tag.expect_primitive(),
        _ => None,
    };
    let payload = payload.ok_or_else(|| err(start, "malformed BER in #hex value"))?;
    let value = String::from_utf8(payload).map_err(|_| err(start, "value is not valid UTF-8"))?;
    Ok((value, sep))
}

/// Escape an attribute value for embedding into the string form of an RDN,
/// encoding every byte which can't stand on its own as a `\hh` hex escape.
///
/// When constructing a DN from untrusted input, passing each value through
/// this function guarantees that the result parses back into the intended
/// structure.
pub fn dn_escape(val: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";

    let bytes = val.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    for (i, &c) in bytes.iter().enumerate() {
        let must_escape = matches!(c, 0 | b'"' | b'+' | b',' | b';' | b'<' | b'=' | b'>' | b'\\')
            || (i == 0 && (c == b' ' || c == b'#'))
            || (i + 1 == bytes.len() && c == b' ');
        if must_escape {
            out.push(b'\\');
            out.push(HEX[(c >> 4) as usize]);
            out.push(HEX[(c & 0xf) as usize]);
        } else {
            out.push(c);
        }
    }
    String::from_utf8(out).expect("escaped dn value")
}

// Print-time escape: single-character escapes for the RFC 4514 special set,
// hex escapes for control bytes, backslash-space for an exposed leading or
// trailing space and backslash-hash for a leading hash. Iterates over
// characters, so multi-byte UTF-8 passes through intact.
fn write_value_escaped(value: &str, f: &mut fmt::Formatter) -> fmt::Result {
    for (i, c) in value.char_indices() {
        let first = i == 0;
        let last = i + c.len_utf8() == value.len();
        match c {
            ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=' => write!(f, "\\{}", c)?,
            '#' if first => f.write_str("\\#")?,
            ' ' if first || last => f.write_str("\\ ")?,
            c if (c as u32) < 0x20 => write!(f, "\\{:02x}", c as u32)?,
            c => write!(f, "{}", c)?,
        }
    }
    Ok(())
}

impl fmt::Display for RelativeDn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, atv) in self.attrs.iter().enumerate() {
            if i > 0 {
                f.write_str("+")?;
            }
            write!(f, "{}=", atv.attr_type.to_lowercase())?;
            write_value_escaped(&atv.value, f)?;
        }
        Ok(())
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, rdn) in self.rdns.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", rdn)?;
        }
        Ok(())
    }
}

fn str_eq_fold(a: &str, b: &str) -> bool {
    a.chars()
        .flat_map(char::to_lowercase)
        .eq(b.chars().flat_map(char::to_lowercase))
}

impl RelativeDn {
    fn equal_with(&self, other: &RelativeDn, value_eq: fn(&str, &str) -> bool) -> bool {
        if self.attrs.len() != other.attrs.len() {
            return false;
        }
        // attribute order within an RDN is not significant
        let mut used = vec![false; other.attrs.len()];
        'outer: for atv in &self.attrs {
            for (i, other_atv) in other.attrs.iter().enumerate() {
                if !used[i]
                    && str_eq_fold(&atv.attr_type, &other_atv.attr_type)
                    && value_eq(&atv.value, &other_atv.value)
                {
                    used[i] = true;
                    continue 'outer;
                }
            }
            return false;
        }
        true
    }

    /// Check two RDNs for equality: types compared case-insensitively,
    /// values case-sensitively, attribute order not significant.
    pub fn equal(&self, other: &RelativeDn) -> bool {
        self.equal_with(other, |a, b| a == b)
    }

    /// As [`equal()`](#method.equal), but values are also compared
    /// case-insensitively.
    pub fn equal_fold(&self, other: &RelativeDn) -> bool {
        self.equal_with(other, str_eq_fold)
    }

    fn cmp_fold(&self, other: &RelativeDn) -> Ordering {
        if self.attrs.len() != other.attrs.len() {
            return self.attrs.len().cmp(&other.attrs.len());
        }
        for (a, b) in self.attrs.iter().zip(other.attrs.iter()) {
            let ord = a
                .attr_type
                .to_lowercase()
                .cmp(&b.attr_type.to_lowercase())
                .then_with(|| a.value.to_lowercase().cmp(&b.value.to_lowercase()));
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

impl Dn {
    /// Check two DNs for equality: the same number of RDNs, pairwise equal
    /// under [`RelativeDn::equal()`](struct.RelativeDn.html#method.equal).
    pub fn equal(&self, other: &Dn) -> bool {
        self.rdns.len() == other.rdns.len()
            && self
                .rdns
                .iter()
                .zip(other.rdns.iter())
                .all(|(a, b)| a.equal(b))
    }

    /// As [`equal()`](#method.equal), but attribute values are compared
    /// case-insensitively.
    pub fn equal_fold(&self, other: &Dn) -> bool {
        self.rdns.len() == other.rdns.len()
            && self
                .rdns
                .iter()
                .zip(other.rdns.iter())
                .all(|(a, b)| a.equal_fold(b))
    }

    /// Check whether `self` names an ancestor of `child`, i.e., whether
    /// `self`'s RDN sequence is a proper suffix of `child`'s.
    pub fn ancestor_of(&self, child: &Dn) -> bool {
        if child.rdns.len() <= self.rdns.len() {
            return false;
        }
        let off = child.rdns.len() - self.rdns.len();
        self.rdns
            .iter()
            .zip(child.rdns[off..].iter())
            .all(|(a, b)| a.equal(b))
    }

    /// Check whether `self` is subordinate to (a descendant of) `parent`.
    pub fn is_subordinate_of(&self, parent: &Dn) -> bool {
        parent.ancestor_of(self)
    }

    /// Return the parent of this DN, which is empty for an empty DN or a
    /// single RDN.
    pub fn parent(&self) -> Dn {
        Dn {
            rdns: self.rdns.iter().skip(1).cloned().collect(),
        }
    }

    /// Return the value of the first attribute of the first RDN, or the
    /// empty string for an empty DN.
    pub fn rdn(&self) -> &str {
        self.rdns
            .first()
            .and_then(|rdn| rdn.attrs.first())
            .map(|atv| atv.value.as_str())
            .unwrap_or("")
    }

    /// Append the RDNs of `other` to this DN, anchoring it below `other`.
    pub fn append(&mut self, other: &Dn) {
        self.rdns.extend(other.rdns.iter().cloned());
    }

    /// Remove the RDNs of `base` from the end of this DN. Fails if `base`
    /// is not an ancestor of this DN.
    pub fn strip(&mut self, base: &Dn) -> Result<()> {
        if !self.is_subordinate_of(base) {
            return Err(err(0, "not a subordinate"));
        }
        self.rdns.truncate(self.rdns.len() - base.rdns.len());
        Ok(())
    }

    /// Replace the first RDN of this DN with the given one.
    pub fn rename(&mut self, rdn: RelativeDn) {
        if self.rdns.is_empty() {
            self.rdns.push(rdn);
        } else {
            self.rdns[0] = rdn;
        }
    }

    /// Order two DNs so that subordinates sort before their ancestors, and
    /// siblings by their first RDN. Sorting a set of DNs with this ordering
    /// puts leaves first, which allows deleting a whole subtree in order.
    /// Unrelated DNs compare as equal; the ordering is not total.
    pub fn tree_cmp(&self, other: &Dn) -> Ordering {
        if self.is_subordinate_of(other) {
            return Ordering::Less;
        }
        if other.is_subordinate_of(self) {
            return Ordering::Greater;
        }
        if !self.rdns.is_empty()
            && !other.rdns.is_empty()
            && self.parent().equal_fold(&other.parent())
        {
            return self.rdns[0].cmp_fold(&other.rdns[0]);
        }
        Ordering::Equal
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn dn(s: &str) -> Dn {
        parse_dn(s).unwrap()
    }

    #[test]
    fn parse_empty() {
        assert!(dn("").rdns.is_empty());
    }

    #[test]
    fn parse_simple() {
        let d = dn("cn=admin,dc=example,dc=org");
        assert_eq!(d.rdns.len(), 3);
        assert_eq!(d.rdns[0].attrs[0].attr_type, "cn");
        assert_eq!(d.rdns[0].attrs[0].value, "admin");
    }

    #[test]
    fn parse_multivalued_rdn() {
        let d = dn("OU=Sales+CN=J. Smith,DC=example,DC=net");
        assert_eq!(d.rdns.len(), 3);
        assert_eq!(d.rdns[0].attrs.len(), 2);
        assert_eq!(d.rdns[0].attrs[0].attr_type, "OU");
        assert_eq!(d.rdns[0].attrs[0].value, "Sales");
        assert_eq!(d.rdns[0].attrs[1].attr_type, "CN");
        assert_eq!(d.rdns[0].attrs[1].value, "J. Smith");
        assert_eq!(
            d.to_string(),
            "ou=Sales+cn=J. Smith,dc=example,dc=net"
        );
    }

    #[test]
    fn parse_hex_ber_value() {
        let d = dn("1.3.6.1.4.1.1466.0=#04024869");
        assert_eq!(d.rdns[0].attrs[0].attr_type, "1.3.6.1.4.1.1466.0");
        assert_eq!(d.rdns[0].attrs[0].value, "Hi");
    }

    #[test]
    fn parse_semicolon_separator() {
        let d = dn("cn=john;dc=example,dc=com");
        assert_eq!(d.rdns.len(), 3);
        let d = dn("cn=john\\;doe,dc=com");
        assert_eq!(d.rdns.len(), 2);
        assert_eq!(d.rdns[0].attrs[0].value, "john;doe");
    }

    #[test]
    fn parse_escapes() {
        let d = dn("cn=Smith\\, John,dc=com");
        assert_eq!(d.rdns[0].attrs[0].value, "Smith, John");
        let d = dn("cn=star\\2a,dc=com");
        assert_eq!(d.rdns[0].attrs[0].value, "star*");
        let d = dn("cn=\\ padded\\ ,dc=com");
        assert_eq!(d.rdns[0].attrs[0].value, " padded ");
    }

    #[test]
    fn parse_spacing() {
        let d = dn("cn = admin , dc = example");
        assert_eq!(d.rdns[0].attrs[0].attr_type, "cn");
        assert_eq!(d.rdns[0].attrs[0].value, "admin");
        assert_eq!(d.rdns[1].attrs[0].value, "example");
    }

    #[test]
    fn parse_empty_value() {
        let d = dn("dc=,dc=com");
        assert_eq!(d.rdns[0].attrs[0].value, "");
    }

    #[test]
    fn parse_errors() {
        assert!(parse_dn("cn").is_err());
        assert!(parse_dn("cn=x,").is_err());
        assert!(parse_dn("cn=x+").is_err());
        assert!(parse_dn("=x").is_err());
        assert!(parse_dn("cn=x\\").is_err());
        assert!(parse_dn("cn=x\\0q").is_err());
        assert!(parse_dn("cn=#6").is_err());
        assert!(parse_dn("cn=#zz").is_err());
        assert!(parse_dn("cn=#0402").is_err());
    }

    #[test]
    fn print_is_idempotent() {
        for s in [
            "cn=admin,dc=example,dc=org",
            "ou=Sales+cn=J. Smith,dc=example,dc=net",
            "cn=Smith\\, John,dc=com",
            "cn=\\ padded\\ ,dc=com",
            "cn=\\#hash,dc=com",
            "cn=함,dc=com",
        ] {
            let printed = dn(s).to_string();
            assert_eq!(printed, dn(&printed).to_string());
            assert!(dn(s).equal(&dn(&printed)));
        }
    }

    #[test]
    fn equality() {
        assert!(dn("ou=x,dc=a").equal(&dn("OU=x,DC=a")));
        assert!(!dn("ou=x,dc=a").equal(&dn("ou=X,dc=a")));
        assert!(dn("ou=x,dc=a").equal_fold(&dn("ou=X,dc=a")));
        assert!(!dn("ou=x,dc=a").equal(&dn("ou=x")));
        // multi-valued RDN attribute order is not significant
        assert!(dn("ou=s+cn=j").equal(&dn("cn=j+ou=s")));
        assert!(!dn("ou=s+cn=j").equal(&dn("cn=j+ou=t")));
    }

    #[test]
    fn ancestors() {
        let base = dn("DC=example,DC=net");
        let child = dn("OU=Sales+CN=J. Smith,DC=example,DC=net");
        assert!(base.ancestor_of(&child));
        assert!(child.is_subordinate_of(&base));
        assert!(!base.ancestor_of(&base));
        assert!(!child.ancestor_of(&base));
    }

    #[test]
    fn parent_strip_append() {
        let mut d = dn("cn=x,ou=people,dc=org");
        assert!(d.parent().equal(&dn("ou=people,dc=org")));
        d.strip(&dn("ou=people,dc=org")).unwrap();
        assert_eq!(d.to_string(), "cn=x");
        d.append(&dn("ou=others,dc=org"));
        assert_eq!(d.to_string(), "cn=x,ou=others,dc=org");
        assert!(d.strip(&dn("dc=net")).is_err());
    }

    #[test]
    fn tree_sorting() {
        let mut dns = vec![
            dn("dc=org"),
            dn("cn=a,ou=p,dc=org"),
            dn("ou=p,dc=org"),
            dn("cn=b,ou=p,dc=org"),
        ];
        dns.sort_by(|a, b| a.tree_cmp(b));
        assert_eq!(dns[0].to_string(), "cn=a,ou=p,dc=org");
        assert_eq!(dns[1].to_string(), "cn=b,ou=p,dc=org");
        assert_eq!(dns[2].to_string(), "ou=p,dc=org");
        assert_eq!(dns[3].to_string(), "dc=org");
    }

    #[test]
    fn dn_esc_spaces_and_hash() {
        assert_eq!(dn_escape(" foo"), "\\20foo");
        assert_eq!(dn_escape("foo "), "foo\\20");
        assert_eq!(dn_escape("f o o"), "f o o");
        assert_eq!(dn_escape(" "), "\\20");
        assert_eq!(dn_escape("  "), "\\20\\20");
        assert_eq!(dn_escape("   "), "\\20 \\20");
        assert_eq!(dn_escape("#rust"), "\\23rust");
        assert_eq!(dn_escape("a,b"), "a\\2cb");
    }
}
