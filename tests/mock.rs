//! Protocol-level tests against a scripted mock server.
//!
//! Each test binds a loopback listener, accepts the single connection the
//! client makes, and replies to parsed LDAPMessage envelopes with frames
//! built through lber. Server-side panics propagate through the task join
//! at the end of every test.

use std::collections::HashSet;

use bytes::BytesMut;
use lber::common::TagClass;
use lber::parse::{parse_tag, parse_uint};
use lber::structure::{StructureTag, PL};
use lber::structures::{ASNTag, Enumerated, Integer, OctetString, Sequence, Set, Tag};
use lber::write;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use ldaplink::controls::{Control, ControlParser, ControlType, PagedResults};
use ldaplink::{Connection, LdapError, Scope, SearchEntry};

const PAGED_OID: &str = "1.2.840.113556.1.4.319";

struct Msg {
    id: i32,
    op: StructureTag,
    controls: Vec<StructureTag>,
}

fn octet(s: impl AsRef<[u8]>) -> Tag {
    Tag::OctetString(OctetString {
        inner: Vec::from(s.as_ref()),
        ..Default::default()
    })
}

fn encode(tag: Tag) -> Vec<u8> {
    let mut buf = BytesMut::new();
    write::encode_into(&mut buf, tag.into_structure()).unwrap();
    Vec::from(&buf[..])
}

fn envelope(msgid: i32, op: Tag, controls: Option<Vec<Tag>>) -> Vec<u8> {
    let mut inner = vec![
        Tag::Integer(Integer {
            inner: msgid as i64,
            ..Default::default()
        }),
        op,
    ];
    if let Some(ctrls) = controls {
        inner.push(Tag::StructureTag(StructureTag {
            id: 0,
            class: TagClass::Context,
            payload: PL::C(ctrls.into_iter().map(|t| t.into_structure()).collect()),
        }));
    }
    encode(Tag::Sequence(Sequence {
        inner,
        ..Default::default()
    }))
}

fn result_op(app_tag: u64, rc: u32) -> Tag {
    Tag::Sequence(Sequence {
        id: app_tag,
        class: TagClass::Application,
        inner: vec![
            Tag::Enumerated(Enumerated {
                inner: rc as i64,
                ..Default::default()
            }),
            octet(""),
            octet(""),
        ],
    })
}

fn entry_op(dn: &str, attrs: &[(&str, &[&str])]) -> Tag {
    Tag::Sequence(Sequence {
        id: 4,
        class: TagClass::Application,
        inner: vec![
            octet(dn),
            Tag::Sequence(Sequence {
                inner: attrs
                    .iter()
                    .map(|(name, vals)| {
                        Tag::Sequence(Sequence {
                            inner: vec![
                                octet(name),
                                Tag::Set(Set {
                                    inner: vals.iter().map(octet).collect(),
                                    ..Default::default()
                                }),
                            ],
                            ..Default::default()
                        })
                    })
                    .collect(),
                ..Default::default()
            }),
        ],
    })
}

fn paged_control(size: i32, cookie: &[u8]) -> Tag {
    let val = encode(Tag::Sequence(Sequence {
        inner: vec![
            Tag::Integer(Integer {
                inner: size as i64,
                ..Default::default()
            }),
            octet(cookie),
        ],
        ..Default::default()
    }));
    Tag::Sequence(Sequence {
        inner: vec![octet(PAGED_OID), octet(val)],
        ..Default::default()
    })
}

fn try_parse(buf: &mut BytesMut) -> Option<Msg> {
    let (rest_len, tag) = match parse_tag(&buf[..]) {
        Ok((rest, tag)) => (rest.len(), tag),
        Err(_) => return None,
    };
    let consumed = buf.len() - rest_len;
    let _ = buf.split_to(consumed);
    let mut comps = tag.expect_constructed().expect("message").into_iter();
    let id = match parse_uint(
        comps
            .next()
            .expect("message id")
            .expect_primitive()
            .expect("id octets")
            .as_slice(),
    ) {
        Ok((_, id)) => id as i32,
        _ => panic!("bad message id"),
    };
    let op = comps.next().expect("protocol op");
    let controls = comps
        .next()
        .and_then(|t| t.expect_constructed())
        .unwrap_or_default();
    Some(Msg { id, op, controls })
}

async fn read_msg(stream: &mut TcpStream, buf: &mut BytesMut) -> Option<Msg> {
    loop {
        if let Some(msg) = try_parse(buf) {
            return Some(msg);
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ldap://{}", listener.local_addr().unwrap());
    (listener, url)
}

fn search_filter_value(op: &StructureTag) -> String {
    let comps = match &op.payload {
        PL::C(comps) => comps,
        _ => panic!("search request not constructed"),
    };
    let fcomps = match &comps[6].payload {
        PL::C(fcomps) => fcomps,
        _ => panic!("filter not constructed"),
    };
    match &fcomps[1].payload {
        PL::P(value) => String::from_utf8(value.clone()).unwrap(),
        _ => panic!("filter value not primitive"),
    }
}

fn request_paging(msg: &Msg) -> Option<PagedResults> {
    for ctrl in &msg.controls {
        let comps = match &ctrl.payload {
            PL::C(comps) => comps,
            _ => continue,
        };
        let oid = match &comps[0].payload {
            PL::P(oid) => oid.clone(),
            _ => continue,
        };
        if oid == PAGED_OID.as_bytes() {
            let val = match &comps.last().unwrap().payload {
                PL::P(val) => val.clone(),
                _ => continue,
            };
            return Some(PagedResults::parse(&val));
        }
    }
    None
}

/// Three concurrent searches multiplexed on one connection, with the server
/// interleaving the response streams out of order. Each caller must receive
/// exactly its own entries, and the message IDs on the wire must be
/// distinct.
#[tokio::test]
async fn concurrent_searches_interleaved() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = BytesMut::new();
        let mut searches = vec![];
        while searches.len() < 3 {
            let msg = read_msg(&mut stream, &mut buf).await.unwrap();
            assert_eq!(msg.op.id, 3);
            let filter = search_filter_value(&msg.op);
            searches.push((msg.id, filter));
        }
        let distinct = searches.iter().map(|s| s.0).collect::<HashSet<_>>();
        assert_eq!(distinct.len(), 3, "in-flight message ids must be distinct");
        // two entries per search, interleaved across the streams in
        // reverse round-robin order
        for round in 0..2 {
            for &(id, ref filter) in searches.iter().rev() {
                let dn = format!("cn={}-{},dc=test", filter, round);
                let frame = envelope(id, entry_op(&dn, &[("cn", &[filter.as_str()])]), None);
                stream.write_all(&frame).await.unwrap();
            }
        }
        for &(id, _) in searches.iter() {
            let frame = envelope(id, result_op(5, 0), None);
            stream.write_all(&frame).await.unwrap();
        }
        // connection stays open until the client unbinds
        while read_msg(&mut stream, &mut buf).await.is_some() {}
    });

    let (conn, ldap) = Connection::new(&url).await.unwrap();
    ldaplink::drive!(conn);
    let mut tasks = vec![];
    for filter in ["f1", "f2", "f3"] {
        let mut ldap = ldap.clone();
        tasks.push(tokio::spawn(async move {
            let (entries, res) = ldap
                .search("dc=test", Scope::WholeSubtree, &format!("(cn={})", filter), ["cn"])
                .await
                .unwrap()
                .success()
                .unwrap();
            assert_eq!(res.rc, 0);
            let dns = entries
                .into_iter()
                .map(|re| SearchEntry::construct(re).dn)
                .collect::<Vec<_>>();
            assert_eq!(
                dns,
                vec![
                    format!("cn={}-0,dc=test", filter),
                    format!("cn={}-1,dc=test", filter),
                ]
            );
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    let mut ldap = ldap;
    ldap.unbind().await.unwrap();
    server.await.unwrap();
}

/// Paged search: 12 entries served in pages of 5/5/2 with cookies C1, C2
/// and finally an empty one. The client must issue exactly three requests
/// bearing the cookie progression and accumulate all entries.
#[tokio::test]
async fn paged_search_cookie_progression() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = BytesMut::new();
        let mut seen_cookies = vec![];
        let mut served = 0;
        loop {
            let msg = read_msg(&mut stream, &mut buf).await;
            let msg = match msg {
                Some(msg) if msg.op.id == 3 => msg,
                _ => break,
            };
            let paging = request_paging(&msg).expect("paging control on request");
            assert_eq!(paging.size, 5);
            seen_cookies.push(paging.cookie.clone());
            let (count, next_cookie) = match &paging.cookie {
                c if c.is_empty() => (5, &b"C1"[..]),
                c if c == b"C1" => (5, &b"C2"[..]),
                c if c == b"C2" => (2, &b""[..]),
                c => panic!("unexpected cookie: {:?}", c),
            };
            for n in 0..count {
                let dn = format!("cn=e{}-{},dc=test", served + n, n);
                let frame = envelope(msg.id, entry_op(&dn, &[("cn", &["x"])]), None);
                stream.write_all(&frame).await.unwrap();
            }
            served += count;
            let done = envelope(
                msg.id,
                result_op(5, 0),
                Some(vec![paged_control(0, next_cookie)]),
            );
            stream.write_all(&done).await.unwrap();
            if next_cookie.is_empty() {
                break;
            }
        }
        assert_eq!(seen_cookies, vec![b"".to_vec(), b"C1".to_vec(), b"C2".to_vec()]);
        assert_eq!(served, 12);
        while read_msg(&mut stream, &mut buf).await.is_some() {}
    });

    let (conn, mut ldap) = Connection::new(&url).await.unwrap();
    ldaplink::drive!(conn);
    let (entries, res) = ldap
        .search_with_paging("dc=test", Scope::WholeSubtree, "(cn=x)", vec!["cn"], 5)
        .await
        .unwrap()
        .success()
        .unwrap();
    assert_eq!(entries.len(), 12);
    assert_eq!(res.rc, 0);
    ldap.unbind().await.unwrap();
    server.await.unwrap();
}

/// Compare result mapping: rc 6 is true, rc 5 is false, anything else is an
/// error carrying the result code.
#[tokio::test]
async fn compare_result_codes() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = BytesMut::new();
        for rc in [6u32, 5, 32] {
            let msg = read_msg(&mut stream, &mut buf).await.unwrap();
            assert_eq!(msg.op.id, 14);
            let frame = envelope(msg.id, result_op(15, rc), None);
            stream.write_all(&frame).await.unwrap();
        }
        while read_msg(&mut stream, &mut buf).await.is_some() {}
    });

    let (conn, mut ldap) = Connection::new(&url).await.unwrap();
    ldaplink::drive!(conn);
    assert!(ldap
        .compare("cn=x,dc=y", "cn", "x")
        .await
        .unwrap()
        .equal()
        .unwrap());
    assert!(!ldap
        .compare("cn=x,dc=y", "cn", "x")
        .await
        .unwrap()
        .equal()
        .unwrap());
    let err = ldap
        .compare("cn=x,dc=y", "cn", "x")
        .await
        .unwrap()
        .equal()
        .unwrap_err();
    assert!(err.is_result_code(32));
    ldap.unbind().await.unwrap();
    server.await.unwrap();
}

/// Binds: an empty simple-bind password is rejected locally, the explicit
/// unauthenticated bind goes to the server; an empty Modify change list is
/// a valid no-op on the wire.
#[tokio::test]
async fn bind_policy_and_empty_modify() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = BytesMut::new();
        let msg = read_msg(&mut stream, &mut buf).await.unwrap();
        assert_eq!(msg.op.id, 0);
        let frame = envelope(msg.id, result_op(1, 0), None);
        stream.write_all(&frame).await.unwrap();
        let msg = read_msg(&mut stream, &mut buf).await.unwrap();
        assert_eq!(msg.op.id, 6);
        // the change list must be present and empty
        let comps = match &msg.op.payload {
            PL::C(comps) => comps,
            _ => panic!("modify request not constructed"),
        };
        assert!(matches!(&comps[1].payload, PL::C(changes) if changes.is_empty()));
        let frame = envelope(msg.id, result_op(7, 0), None);
        stream.write_all(&frame).await.unwrap();
        while read_msg(&mut stream, &mut buf).await.is_some() {}
    });

    let (conn, mut ldap) = Connection::new(&url).await.unwrap();
    ldaplink::drive!(conn);
    match ldap.simple_bind("cn=admin,dc=test", "").await {
        Err(LdapError::EmptyPassword) => (),
        other => panic!("unexpected: {:?}", other),
    }
    ldap.unauthenticated_bind("cn=admin,dc=test")
        .await
        .unwrap()
        .success()
        .unwrap();
    let mods: Vec<ldaplink::Mod<&[u8]>> = vec![];
    ldap.modify("cn=x,dc=test", mods)
        .await
        .unwrap()
        .success()
        .unwrap();
    ldap.unbind().await.unwrap();
    server.await.unwrap();
}

/// Unbind is idempotent: the second call after the connection is gone is a
/// no-op rather than an error.
#[tokio::test]
async fn unbind_twice_is_noop() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = BytesMut::new();
        while read_msg(&mut stream, &mut buf).await.is_some() {}
    });

    let (conn, mut ldap) = Connection::new(&url).await.unwrap();
    ldaplink::drive!(conn);
    ldap.unbind().await.unwrap();
    ldap.unbind().await.unwrap();
    server.await.unwrap();
}

/// Response controls surface on the operation result with their registered
/// type.
#[tokio::test]
async fn response_control_recognition() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = BytesMut::new();
        let msg = read_msg(&mut stream, &mut buf).await.unwrap();
        assert_eq!(msg.op.id, 0);
        let frame = envelope(
            msg.id,
            result_op(1, 0),
            Some(vec![paged_control(0, b"tok")]),
        );
        stream.write_all(&frame).await.unwrap();
        while read_msg(&mut stream, &mut buf).await.is_some() {}
    });

    let (conn, mut ldap) = Connection::new(&url).await.unwrap();
    ldaplink::drive!(conn);
    let res = ldap.simple_bind("cn=admin,dc=test", "secret").await.unwrap();
    assert_eq!(res.rc, 0);
    let paged = res
        .ctrls
        .iter()
        .find_map(|ctrl| match ctrl {
            Control(Some(ControlType::PagedResults), raw) => Some(raw.parse::<PagedResults>()),
            _ => None,
        })
        .expect("recognized paging control");
    assert_eq!(paged.cookie, b"tok".to_vec());
    ldap.unbind().await.unwrap();
    server.await.unwrap();
}
