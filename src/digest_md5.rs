//! DIGEST-MD5 challenge parsing and response computation (RFC 2831).
//!
//! The exchange is modeled as a pure function from the server challenge to
//! the client response, with the connection-independent pieces kept
//! testable. Only the `auth` quality of protection is implemented; the
//! mechanism itself is obsolete (RFC 6331) but still deployed.

use crate::result::{LdapError, Result};

use md5::{Digest, Md5};

#[derive(Debug, Default)]
pub(crate) struct Challenge {
    pub realm: Option<String>,
    pub nonce: Option<String>,
    pub qop: Vec<String>,
    pub charset: Option<String>,
    pub algorithm: Option<String>,
}

/// Parse the comma-separated `key=value` directives of a server challenge.
/// Values may be quoted; a backslash inside a quoted string escapes the
/// next character.
pub(crate) fn parse_challenge(raw: &[u8]) -> Result<Challenge> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| LdapError::DigestChallenge("challenge is not valid UTF-8"))?;
    let mut ch = Challenge::default();
    let b = text.as_bytes();
    let mut i = 0;
    while i < b.len() {
        while i < b.len() && (b[i] == b',' || b[i] == b' ') {
            i += 1;
        }
        if i == b.len() {
            break;
        }
        let key_start = i;
        while i < b.len() && b[i] != b'=' {
            i += 1;
        }
        if i == b.len() {
            return Err(LdapError::DigestChallenge("directive without a value"));
        }
        let key = text[key_start..i].trim().to_ascii_lowercase();
        i += 1;
        let value = if i < b.len() && b[i] == b'"' {
            i += 1;
            let mut value = String::new();
            loop {
                if i == b.len() {
                    return Err(LdapError::DigestChallenge("unterminated quoted value"));
                }
                match b[i] {
                    b'"' => {
                        i += 1;
                        break;
                    }
                    b'\\' => {
                        i += 1;
                        if i == b.len() {
                            return Err(LdapError::DigestChallenge("unterminated escape"));
                        }
                        value.push(b[i] as char);
                        i += 1;
                    }
                    c => {
                        value.push(c as char);
                        i += 1;
                    }
                }
            }
            value
        } else {
            let val_start = i;
            while i < b.len() && b[i] != b',' {
                i += 1;
            }
            text[val_start..i].trim().to_owned()
        };
        match key.as_str() {
            "realm" => ch.realm = Some(value),
            "nonce" => ch.nonce = Some(value),
            "qop" => ch.qop = value.split(',').map(|q| q.trim().to_owned()).collect(),
            "charset" => ch.charset = Some(value),
            "algorithm" => ch.algorithm = Some(value),
            _ => (),
        }
    }
    Ok(ch)
}

fn md5_bytes(parts: &[&[u8]]) -> [u8; 16] {
    let mut hash = Md5::new();
    for part in parts {
        hash.update(part);
    }
    hash.finalize().into()
}

/// The `response` directive value for a `qop=auth` exchange, per
/// RFC 2831 §2.1.2.1.
pub(crate) fn compute_response(
    username: &str,
    password: &str,
    realm: &str,
    nonce: &str,
    cnonce: &str,
    nc: &str,
    digest_uri: &str,
) -> String {
    let upr = md5_bytes(&[
        username.as_bytes(),
        b":",
        realm.as_bytes(),
        b":",
        password.as_bytes(),
    ]);
    let a1 = md5_bytes(&[&upr, b":", nonce.as_bytes(), b":", cnonce.as_bytes()]);
    let a2 = md5_bytes(&[b"AUTHENTICATE:", digest_uri.as_bytes()]);
    let resp = md5_bytes(&[
        hex::encode(a1).as_bytes(),
        b":",
        nonce.as_bytes(),
        b":",
        nc.as_bytes(),
        b":",
        cnonce.as_bytes(),
        b":auth:",
        hex::encode(a2).as_bytes(),
    ]);
    hex::encode(resp)
}

/// Produce the full client response to a server challenge.
pub(crate) fn challenge_response(
    challenge: &[u8],
    username: &str,
    password: &str,
    server_host: &str,
) -> Result<String> {
    let ch = parse_challenge(challenge)?;
    let nonce = ch
        .nonce
        .ok_or(LdapError::DigestChallenge("challenge without a nonce"))?;
    if !ch.qop.is_empty() && !ch.qop.iter().any(|q| q == "auth") {
        return Err(LdapError::DigestChallenge("auth qop not offered"));
    }
    let realm = ch.realm.unwrap_or_default();
    let cnonce = hex::encode(rand::random::<[u8; 16]>());
    let digest_uri = format!("ldap/{}", server_host);
    let response = compute_response(
        username,
        password,
        &realm,
        &nonce,
        &cnonce,
        "00000001",
        &digest_uri,
    );
    Ok(format!(
        "username=\"{}\",realm=\"{}\",nonce=\"{}\",cnonce=\"{}\",nc=00000001,qop=auth,\
         digest-uri=\"{}\",response={},charset=utf-8",
        username, realm, nonce, cnonce, digest_uri, response
    ))
}

#[cfg(test)]
mod test {
    use super::*;

    const CHALLENGE: &[u8] = b"realm=\"elwood.innosoft.com\",nonce=\"OA6MG9tEQGm2hh\",\
        qop=\"auth\",algorithm=md5-sess,charset=utf-8";

    #[test]
    fn challenge_directives() {
        let ch = parse_challenge(CHALLENGE).unwrap();
        assert_eq!(ch.realm.as_deref(), Some("elwood.innosoft.com"));
        assert_eq!(ch.nonce.as_deref(), Some("OA6MG9tEQGm2hh"));
        assert_eq!(ch.qop, vec!["auth"]);
        assert_eq!(ch.algorithm.as_deref(), Some("md5-sess"));
    }

    #[test]
    fn challenge_multi_qop() {
        let ch = parse_challenge(b"nonce=\"n\",qop=\"auth,auth-int\"").unwrap();
        assert_eq!(ch.qop, vec!["auth", "auth-int"]);
    }

    #[test]
    fn challenge_errors() {
        assert!(parse_challenge(b"nonce=\"unterminated").is_err());
        assert!(parse_challenge(b"standalone").is_err());
        assert!(challenge_response(b"realm=\"x\"", "u", "p", "h").is_err());
        assert!(challenge_response(b"nonce=\"n\",qop=\"auth-conf\"", "u", "p", "h").is_err());
    }

    // The worked example of RFC 2831 §4.
    #[test]
    fn rfc_worked_example() {
        let resp = compute_response(
            "chris",
            "secret",
            "elwood.innosoft.com",
            "OA6MG9tEQGm2hh",
            "OA6MHXh6VqTrRk",
            "00000001",
            "imap/elwood.innosoft.com",
        );
        assert_eq!(resp, "d388dad90d4bbd760a152321f2143af7");
    }

    #[test]
    fn response_directives() {
        let resp = challenge_response(CHALLENGE, "chris", "secret", "ldap.example.com").unwrap();
        assert!(resp.contains("username=\"chris\""));
        assert!(resp.contains("digest-uri=\"ldap/ldap.example.com\""));
        assert!(resp.contains("nc=00000001"));
        assert!(resp.contains("qop=auth,"));
        let response = resp
            .split("response=")
            .nth(1)
            .unwrap()
            .split(',')
            .next()
            .unwrap();
        assert_eq!(response.len(), 32);
        assert!(response.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
