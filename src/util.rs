//! Escape helpers for values embedded in textual protocol forms.

use crate::result::{LdapError, Result};

const HEX: &[u8; 16] = b"0123456789abcdef";

fn push_hex_escape(out: &mut Vec<u8>, c: u8) {
    out.push(b'\\');
    out.push(HEX[(c >> 4) as usize]);
    out.push(HEX[(c & 0xf) as usize]);
}

/// Escape a filter literal.
///
/// A value assembled into the string form of a search filter must not
/// contain unescaped parentheses, asterisks, backslashes or NUL bytes;
/// those become `\hh` hex escapes here. Everything else, multi-byte UTF-8
/// included, passes through untouched.
pub fn ldap_escape(lit: &str) -> String {
    let mut out = Vec::with_capacity(lit.len());
    for &c in lit.as_bytes() {
        match c {
            0 | b'(' | b')' | b'*' | b'\\' => push_hex_escape(&mut out, c),
            c => out.push(c),
        }
    }
    String::from_utf8(out).expect("escaped filter literal")
}

/// Undo LDAP filter escapes in a string.
///
/// Every `\hh` hex escape is replaced by the byte it denotes. A truncated
/// escape, an invalid hex digit, or a decoded result which isn't valid
/// UTF-8 is an error.
pub fn ldap_unescape(val: &str) -> Result<String> {
    fn nibble(c: u8) -> Option<u8> {
        match c {
            b'0'..=b'9' => Some(c - b'0'),
            b'a'..=b'f' => Some(c - b'a' + 10),
            b'A'..=b'F' => Some(c - b'A' + 10),
            _ => None,
        }
    }

    let bytes = val.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        let hi = bytes.get(i + 1).copied().and_then(nibble);
        let lo = bytes.get(i + 2).copied().and_then(nibble);
        match (hi, lo) {
            (Some(hi), Some(lo)) => out.push((hi << 4) | lo),
            _ => return Err(LdapError::DecodingUTF8),
        }
        i += 3;
    }
    String::from_utf8(out).map_err(|_| LdapError::DecodingUTF8)
}

/// Escape the lines of an RFC 4517 Postal Address into its attribute value
/// form, where lines are joined by `$` and literal backslashes and dollar
/// signs are hex-escaped.
pub fn postal_escape<S: AsRef<str>>(lines: &[S]) -> String {
    let mut out = String::new();
    for line in lines {
        for c in line.as_ref().chars() {
            match c {
                '\\' => out.push_str("\\5C"),
                '$' => out.push_str("\\24"),
                c => out.push(c),
            }
        }
        out.push('$');
    }
    out
}

/// Split an RFC 4517 Postal Address attribute value into its unescaped
/// lines, skipping empty ones.
pub fn postal_unescape(escaped: &str) -> Vec<String> {
    let mut lines = Vec::new();
    for line in escaped.split('$') {
        if line.is_empty() {
            continue;
        }
        let mut out = String::new();
        let mut rest = line;
        while let Some(pos) = rest.find('\\') {
            out.push_str(&rest[..pos]);
            let esc = rest.get(pos + 1..pos + 3);
            match esc.map(str::to_ascii_uppercase).as_deref() {
                Some("5C") => {
                    out.push('\\');
                    rest = &rest[pos + 3..];
                }
                Some("24") => {
                    out.push('$');
                    rest = &rest[pos + 3..];
                }
                _ => {
                    out.push('\\');
                    rest = &rest[pos + 1..];
                }
            }
        }
        out.push_str(rest);
        lines.push(out);
    }
    lines
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn filter_escape() {
        assert_eq!(ldap_escape("a*b"), "a\\2ab");
        assert_eq!(ldap_escape("(x)"), "\\28x\\29");
        assert_eq!(ldap_escape("plain"), "plain");
        assert_eq!(ldap_escape("함"), "함");
    }

    #[test]
    fn filter_unescape() {
        assert_eq!(ldap_unescape("a\\2ab").unwrap(), "a*b");
        assert_eq!(ldap_unescape("a\\2Ab").unwrap(), "a*b");
        assert_eq!(ldap_unescape("plain").unwrap(), "plain");
        assert!(ldap_unescape("runt\\2").is_err());
        assert!(ldap_unescape("bad\\zz").is_err());
    }

    #[test]
    fn filter_escape_roundtrip() {
        for s in ["a*b", "(x)", "back\\slash", "nul\u{0}byte"] {
            assert_eq!(ldap_unescape(&ldap_escape(s)).unwrap(), s);
        }
    }

    #[test]
    fn postal_roundtrip() {
        let lines = ["1234 Main St.", "Anytown, CA 12345", "USA"];
        let escaped = postal_escape(&lines);
        assert_eq!(escaped, "1234 Main St.$Anytown, CA 12345$USA$");
        assert_eq!(postal_unescape(&escaped), lines.to_vec());
    }

    #[test]
    fn postal_specials() {
        let lines = ["$1,000,000 Sweepstakes", "PO Box 1000000"];
        let escaped = postal_escape(&lines);
        assert_eq!(escaped, "\\241,000,000 Sweepstakes$PO Box 1000000$");
        assert_eq!(postal_unescape(&escaped), lines.to_vec());
        assert_eq!(postal_unescape("back\\5Cslash$"), vec!["back\\slash"]);
    }
}
