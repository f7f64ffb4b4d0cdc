//! Request construction for the protocol operations.
//!
//! Each function builds the application-tagged body of one LDAPv3 operation
//! (RFC 4511 §4); the envelope around it is the codec's job. Response
//! parsing lives with the result types and the search stream.

use std::collections::HashSet;
use std::hash::Hash;

use crate::exop::Exop;
use crate::ldap::Mod;
use crate::result::{LdapError, Result};
use crate::search::{Scope, SearchOptions};
use crate::RequestId;

use lber::common::TagClass;
use lber::structures::{Boolean, Enumerated, Integer, Null, OctetString, Sequence, Set, Tag};

pub(crate) const APP_BIND_REQUEST: u64 = 0;
pub(crate) const APP_UNBIND_REQUEST: u64 = 2;
pub(crate) const APP_SEARCH_REQUEST: u64 = 3;
pub(crate) const APP_SEARCH_ENTRY: u64 = 4;
pub(crate) const APP_SEARCH_DONE: u64 = 5;
pub(crate) const APP_MODIFY_REQUEST: u64 = 6;
pub(crate) const APP_ADD_REQUEST: u64 = 8;
pub(crate) const APP_DEL_REQUEST: u64 = 10;
pub(crate) const APP_MODDN_REQUEST: u64 = 12;
pub(crate) const APP_COMPARE_REQUEST: u64 = 14;
pub(crate) const APP_ABANDON_REQUEST: u64 = 16;
pub(crate) const APP_SEARCH_REFERRAL: u64 = 19;
pub(crate) const APP_EXTENDED_REQUEST: u64 = 23;
pub(crate) const APP_INTERMEDIATE_RESPONSE: u64 = 25;

pub(crate) const LDAP_VERSION: i64 = 3;

fn octet_string(bytes: &[u8]) -> Tag {
    Tag::OctetString(OctetString {
        inner: Vec::from(bytes),
        ..Default::default()
    })
}

pub(crate) fn simple_bind_request(bind_dn: &str, bind_pw: &str) -> Tag {
    Tag::Sequence(Sequence {
        id: APP_BIND_REQUEST,
        class: TagClass::Application,
        inner: vec![
            Tag::Integer(Integer {
                inner: LDAP_VERSION,
                ..Default::default()
            }),
            octet_string(bind_dn.as_bytes()),
            Tag::OctetString(OctetString {
                id: 0,
                class: TagClass::Context,
                inner: Vec::from(bind_pw),
            }),
        ],
    })
}

pub(crate) fn sasl_bind_request(mech: &str, creds: Option<&[u8]>) -> Tag {
    let mut sasl = vec![octet_string(mech.as_bytes())];
    if let Some(creds) = creds {
        sasl.push(octet_string(creds));
    }
    Tag::Sequence(Sequence {
        id: APP_BIND_REQUEST,
        class: TagClass::Application,
        inner: vec![
            Tag::Integer(Integer {
                inner: LDAP_VERSION,
                ..Default::default()
            }),
            octet_string(b""),
            Tag::Sequence(Sequence {
                id: 3,
                class: TagClass::Context,
                inner: sasl,
            }),
        ],
    })
}

pub(crate) fn search_request<S: AsRef<str>>(
    base: &str,
    scope: Scope,
    opts: &SearchOptions,
    filter: Tag,
    attrs: &[S],
) -> Tag {
    Tag::Sequence(Sequence {
        id: APP_SEARCH_REQUEST,
        class: TagClass::Application,
        inner: vec![
            octet_string(base.as_bytes()),
            Tag::Enumerated(Enumerated {
                inner: scope as i64,
                ..Default::default()
            }),
            Tag::Enumerated(Enumerated {
                inner: opts.deref as i64,
                ..Default::default()
            }),
            Tag::Integer(Integer {
                inner: opts.sizelimit as i64,
                ..Default::default()
            }),
            Tag::Integer(Integer {
                inner: opts.timelimit as i64,
                ..Default::default()
            }),
            Tag::Boolean(Boolean {
                inner: opts.typesonly,
                ..Default::default()
            }),
            filter,
            Tag::Sequence(Sequence {
                inner: attrs
                    .iter()
                    .map(|s| octet_string(s.as_ref().as_bytes()))
                    .collect(),
                ..Default::default()
            }),
        ],
    })
}

fn partial_attribute<S: AsRef<[u8]> + Eq + Hash>(name: S, vals: HashSet<S>) -> Tag {
    Tag::Sequence(Sequence {
        inner: vec![
            octet_string(name.as_ref()),
            Tag::Set(Set {
                inner: vals.into_iter().map(|v| octet_string(v.as_ref())).collect(),
                ..Default::default()
            }),
        ],
        ..Default::default()
    })
}

/// An Add with no attributes, or any attribute with no values, is rejected
/// locally.
pub(crate) fn add_request<S: AsRef<[u8]> + Eq + Hash>(
    dn: &str,
    attrs: Vec<(S, HashSet<S>)>,
) -> Result<Tag> {
    if attrs.is_empty() || attrs.iter().any(|(_, vals)| vals.is_empty()) {
        return Err(LdapError::AddNoValues);
    }
    Ok(Tag::Sequence(Sequence {
        id: APP_ADD_REQUEST,
        class: TagClass::Application,
        inner: vec![
            octet_string(dn.as_bytes()),
            Tag::Sequence(Sequence {
                inner: attrs
                    .into_iter()
                    .map(|(name, vals)| partial_attribute(name, vals))
                    .collect(),
                ..Default::default()
            }),
        ],
    }))
}

/// An empty change list is a valid no-op per RFC 4511; an Add change with
/// no values is not.
pub(crate) fn modify_request<S: AsRef<[u8]> + Eq + Hash>(
    dn: &str,
    mods: Vec<Mod<S>>,
) -> Result<Tag> {
    let mut changes = Vec::with_capacity(mods.len());
    for m in mods {
        let (op, attr, set) = match m {
            Mod::Add(attr, set) => {
                if set.is_empty() {
                    return Err(LdapError::AddNoValues);
                }
                (0, attr, set)
            }
            Mod::Delete(attr, set) => (1, attr, set),
            Mod::Replace(attr, set) => (2, attr, set),
            Mod::Increment(attr, val) => (3, attr, HashSet::from([val])),
        };
        changes.push(Tag::Sequence(Sequence {
            inner: vec![
                Tag::Enumerated(Enumerated {
                    inner: op,
                    ..Default::default()
                }),
                partial_attribute(attr, set),
            ],
            ..Default::default()
        }));
    }
    Ok(Tag::Sequence(Sequence {
        id: APP_MODIFY_REQUEST,
        class: TagClass::Application,
        inner: vec![
            octet_string(dn.as_bytes()),
            Tag::Sequence(Sequence {
                inner: changes,
                ..Default::default()
            }),
        ],
    }))
}

pub(crate) fn delete_request(dn: &str) -> Tag {
    Tag::OctetString(OctetString {
        id: APP_DEL_REQUEST,
        class: TagClass::Application,
        inner: Vec::from(dn.as_bytes()),
    })
}

pub(crate) fn modify_dn_request(
    dn: &str,
    rdn: &str,
    delete_old: bool,
    new_sup: Option<&str>,
) -> Tag {
    let mut params = vec![
        octet_string(dn.as_bytes()),
        octet_string(rdn.as_bytes()),
        Tag::Boolean(Boolean {
            inner: delete_old,
            ..Default::default()
        }),
    ];
    if let Some(new_sup) = new_sup {
        params.push(Tag::OctetString(OctetString {
            id: 0,
            class: TagClass::Context,
            inner: Vec::from(new_sup.as_bytes()),
        }));
    }
    Tag::Sequence(Sequence {
        id: APP_MODDN_REQUEST,
        class: TagClass::Application,
        inner: params,
    })
}

pub(crate) fn compare_request(dn: &str, attr: &str, val: &[u8]) -> Tag {
    Tag::Sequence(Sequence {
        id: APP_COMPARE_REQUEST,
        class: TagClass::Application,
        inner: vec![
            octet_string(dn.as_bytes()),
            Tag::Sequence(Sequence {
                inner: vec![octet_string(attr.as_bytes()), octet_string(val)],
                ..Default::default()
            }),
        ],
    })
}

pub(crate) fn extended_request(exop: Exop) -> Tag {
    Tag::Sequence(Sequence {
        id: APP_EXTENDED_REQUEST,
        class: TagClass::Application,
        inner: crate::exop_impl::construct_exop(exop),
    })
}

pub(crate) fn abandon_request(msgid: RequestId) -> Tag {
    Tag::Integer(Integer {
        id: APP_ABANDON_REQUEST,
        class: TagClass::Application,
        inner: msgid as i64,
    })
}

pub(crate) fn unbind_request() -> Tag {
    Tag::Null(Null {
        id: APP_UNBIND_REQUEST,
        class: TagClass::Application,
        inner: (),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::BytesMut;
    use lber::structures::ASNTag;
    use lber::write;

    fn encode(tag: Tag) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write::encode_into(&mut buf, tag.into_structure()).unwrap();
        Vec::from(&buf[..])
    }

    #[test]
    fn simple_bind_shape() {
        let bytes = encode(simple_bind_request("cn=admin", "secret"));
        assert_eq!(
            bytes,
            b"\x60\x15\x02\x01\x03\x04\x08cn=admin\x80\x06secret"
        );
    }

    #[test]
    fn delete_shape() {
        let bytes = encode(delete_request("dc=x"));
        assert_eq!(bytes, b"\x4a\x04dc=x");
    }

    #[test]
    fn abandon_shape() {
        let bytes = encode(abandon_request(7));
        assert_eq!(bytes, b"\x50\x01\x07");
    }

    #[test]
    fn add_rejects_empty() {
        let empty: Vec<(&[u8], std::collections::HashSet<&[u8]>)> = vec![];
        assert!(matches!(
            add_request("dc=x", empty),
            Err(LdapError::AddNoValues)
        ));
        let no_vals = vec![(&b"cn"[..], std::collections::HashSet::new())];
        assert!(matches!(
            add_request("dc=x", no_vals),
            Err(LdapError::AddNoValues)
        ));
    }

    #[test]
    fn modify_empty_changes_is_valid() {
        let mods: Vec<Mod<&[u8]>> = vec![];
        let bytes = encode(modify_request("dc=x", mods).unwrap());
        assert_eq!(bytes, b"\x66\x08\x04\x04dc=x\x30\x00");
    }

    #[test]
    fn modify_increment_encodes_three() {
        let mods = vec![Mod::Increment(&b"uidNumber"[..], &b"1"[..])];
        let bytes = encode(modify_request("dc=x", mods).unwrap());
        // change sequence: ENUMERATED 3, then the partial attribute
        assert!(bytes
            .windows(3)
            .any(|w| w == [0x0a, 0x01, 0x03]));
    }
}
