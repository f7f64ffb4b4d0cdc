//! Content Synchronization controls (RFC 4533, "syncrepl").

use std::collections::HashSet;

use crate::controls_impl::{ControlParser, MakeCritical, RawControl};
use crate::search::ResultEntry;

use bytes::BytesMut;
use lber::common::TagClass;
use lber::parse::{parse_tag, parse_uint};
use lber::structure::{StructureTag, PL};
use lber::structures::{ASNTag, Boolean, Enumerated, OctetString, Sequence, Tag};
use lber::universal::Types;
use lber::write;

pub const SYNC_REQUEST_OID: &str = "1.3.6.1.4.1.4203.1.9.1.1";
pub const SYNC_STATE_OID: &str = "1.3.6.1.4.1.4203.1.9.1.2";
pub const SYNC_DONE_OID: &str = "1.3.6.1.4.1.4203.1.9.1.3";
const SYNC_INFO_OID: &str = "1.3.6.1.4.1.4203.1.9.1.4";

/// Content refresh mode of the Sync Request control.
#[derive(Clone, Debug, Default)]
pub enum RefreshMode {
    /// A one-shot refresh: the stream terminates once the client content
    /// is synchronized.
    #[default]
    RefreshOnly,
    /// Refresh, then keep the search open and stream subsequent changes.
    RefreshAndPersist,
}

impl From<RefreshMode> for i64 {
    fn from(mode: RefreshMode) -> i64 {
        match mode {
            RefreshMode::RefreshOnly => 1,
            RefreshMode::RefreshAndPersist => 3,
        }
    }
}

/// Sync Request control.
#[derive(Clone, Debug, Default)]
pub struct SyncRequest {
    pub mode: RefreshMode,
    /// Synchronization state of a previous session, if resuming.
    pub cookie: Option<Vec<u8>>,
    /// Hint that the client content should be reloaded from scratch.
    pub reload_hint: bool,
}

impl MakeCritical for SyncRequest {}

impl From<SyncRequest> for RawControl {
    fn from(sr: SyncRequest) -> RawControl {
        let mut cap_est = 16; // covers sequence, selector and hint if any
        let mut tags = vec![Tag::Enumerated(Enumerated {
            inner: i64::from(sr.mode),
            ..Default::default()
        })];
        if let Some(cookie) = sr.cookie {
            cap_est += cookie.len();
            tags.push(Tag::OctetString(OctetString {
                inner: cookie,
                ..Default::default()
            }));
        }
        if sr.reload_hint {
            tags.push(Tag::Boolean(Boolean {
                inner: sr.reload_hint,
                ..Default::default()
            }));
        }
        let sreq = Tag::Sequence(Sequence {
            inner: tags,
            ..Default::default()
        })
        .into_structure();
        let mut buf = BytesMut::with_capacity(cap_est);
        write::encode_into(&mut buf, sreq).expect("encoded");
        RawControl {
            ctype: SYNC_REQUEST_OID.to_owned(),
            crit: false,
            val: Some(Vec::from(&buf[..])),
        }
    }
}

/// Per-entry synchronization state, attached by the server to every entry
/// and reference of a sync search.
#[derive(Debug)]
pub struct SyncState {
    pub state: EntryState,
    pub entry_uuid: Vec<u8>,
    pub cookie: Option<Vec<u8>>,
}

/// Possible entry states of the Sync State control.
#[derive(Debug)]
pub enum EntryState {
    Present,
    Add,
    Modify,
    Delete,
}

impl ControlParser for SyncState {
    fn parse(val: &[u8]) -> Self {
        let mut tags = match parse_tag(val) {
            Ok((_, tag)) => tag,
            _ => panic!("syncstate: failed to parse tag"),
        }
        .expect_constructed()
        .expect("syncstate: elements")
        .into_iter();
        let state = match match parse_uint(
            tags.next()
                .expect("syncstate: element 1")
                .match_class(TagClass::Universal)
                .and_then(|t| t.match_id(Types::Enumerated as u64))
                .and_then(|t| t.expect_primitive())
                .expect("syncstate: state")
                .as_slice(),
        ) {
            Ok((_, state)) => state,
            _ => panic!("syncstate: failed to parse state"),
        } {
            0 => EntryState::Present,
            1 => EntryState::Add,
            2 => EntryState::Modify,
            3 => EntryState::Delete,
            _ => panic!("syncstate: unknown state"),
        };
        let entry_uuid = tags
            .next()
            .expect("syncstate: element 2")
            .expect_primitive()
            .expect("syncstate: entryUUID");
        let cookie = tags
            .next()
            .map(|tag| tag.expect_primitive().expect("syncstate: syncCookie"));
        SyncState {
            state,
            entry_uuid,
            cookie,
        }
    }
}

/// Final synchronization state, attached by the server to the result of a
/// sync search.
#[derive(Debug)]
pub struct SyncDone {
    pub cookie: Option<Vec<u8>>,
    pub refresh_deletes: bool,
}

impl ControlParser for SyncDone {
    fn parse(val: &[u8]) -> Self {
        let tags = match parse_tag(val) {
            Ok((_, tag)) => tag,
            _ => panic!("syncdone: failed to parse tag"),
        }
        .expect_constructed()
        .expect("syncdone: elements")
        .into_iter();
        let mut cookie = None;
        let mut refresh_deletes = false;
        for tag in tags {
            match tag {
                StructureTag { id, payload, .. } if id == Types::OctetString as u64 => {
                    cookie = Some(match payload {
                        PL::P(ostr) => ostr,
                        PL::C(_) => panic!("syncdone: constructed octet string?"),
                    });
                }
                StructureTag { id, payload, .. } if id == Types::Boolean as u64 => {
                    refresh_deletes = match payload {
                        PL::P(ostr) => ostr[0] != 0,
                        PL::C(_) => panic!("syncdone: constructed boolean?"),
                    };
                }
                _ => panic!("syncdone: unrecognized component"),
            }
        }
        SyncDone {
            cookie,
            refresh_deletes,
        }
    }
}

/// Values of the Sync Info intermediate message.
#[derive(Clone, Debug)]
pub enum SyncInfo {
    /// Updated synchronization cookie.
    NewCookie(Vec<u8>),
    /// End of a delete phase of the refresh stage.
    RefreshDelete {
        cookie: Option<Vec<u8>>,
        refresh_done: bool,
    },
    /// End of a present phase of the refresh stage.
    RefreshPresent {
        cookie: Option<Vec<u8>>,
        refresh_done: bool,
    },
    /// A set of UUIDs of entries sharing the same state transition.
    SyncIdSet {
        cookie: Option<Vec<u8>>,
        refresh_deletes: bool,
        sync_uuids: HashSet<Vec<u8>>,
    },
}

/// Parse the Sync Info value out of an intermediate message returned by a
/// sync search.
pub fn parse_syncinfo(entry: ResultEntry) -> SyncInfo {
    let mut oid = None;
    let mut value = None;
    let tags = entry
        .0
        .match_id(25)
        .and_then(|t| t.expect_constructed())
        .expect("intermediate seq");
    for tag in tags {
        match tag.id {
            0 => {
                oid = Some(
                    String::from_utf8(tag.expect_primitive().expect("octet string"))
                        .expect("intermediate oid"),
                );
            }
            1 => {
                value = Some(tag.expect_primitive().expect("octet string"));
            }
            _ => panic!("syncinfo: unrecognized intermediate component"),
        }
    }
    match oid {
        Some(oid) if oid == SYNC_INFO_OID => (),
        _ => panic!("syncinfo: oid missing or mismatched"),
    }
    let value = value.expect("syncinfo: value");
    let choice = match parse_tag(value.as_ref()) {
        Ok((_, tag)) => tag,
        _ => panic!("syncinfo: error parsing value"),
    };
    if choice.class != TagClass::Context {
        panic!("syncinfo: value not context-tagged");
    }
    match choice.id {
        0 => match choice.payload {
            PL::P(cookie) => SyncInfo::NewCookie(cookie),
            PL::C(_) => panic!("syncinfo: newcookie not primitive"),
        },
        id @ 1..=3 => {
            let comps = match choice.payload {
                PL::C(comps) => comps,
                PL::P(_) => panic!("syncinfo: choice not a sequence"),
            };
            let mut cookie = None;
            let mut flag = id != 3;
            let mut uuids = HashSet::new();
            for comp in comps {
                match comp {
                    StructureTag { id, class, .. }
                        if class == TagClass::Universal && id == Types::OctetString as u64 =>
                    {
                        cookie = comp.expect_primitive();
                    }
                    StructureTag { id, class, .. }
                        if class == TagClass::Universal && id == Types::Boolean as u64 =>
                    {
                        flag = comp.expect_primitive().expect("octet string")[0] != 0;
                    }
                    StructureTag { id, class, .. }
                        if class == TagClass::Universal && id == Types::Set as u64 =>
                    {
                        uuids = comp
                            .expect_constructed()
                            .expect("uuid set")
                            .into_iter()
                            .map(|u| u.expect_primitive().expect("octet string"))
                            .collect();
                    }
                    _ => panic!("syncinfo: unrecognized choice component"),
                }
            }
            match id {
                1 => SyncInfo::RefreshDelete {
                    cookie,
                    refresh_done: flag,
                },
                2 => SyncInfo::RefreshPresent {
                    cookie,
                    refresh_done: flag,
                },
                _ => SyncInfo::SyncIdSet {
                    cookie,
                    refresh_deletes: flag,
                    sync_uuids: uuids,
                },
            }
        }
        _ => panic!("syncinfo: unknown choice"),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sync_request_value() {
        let rc = RawControl::from(SyncRequest {
            mode: RefreshMode::RefreshAndPersist,
            cookie: Some(vec![b'c']),
            reload_hint: false,
        });
        assert_eq!(rc.ctype, SYNC_REQUEST_OID);
        assert_eq!(rc.val.as_deref(), Some(&b"\x30\x06\x0a\x01\x03\x04\x01c"[..]));
    }

    #[test]
    fn sync_state_parse() {
        // SEQUENCE { ENUMERATED add(1), entryUUID, cookie }
        let val = b"\x30\x0b\x0a\x01\x01\x04\x03uid\x04\x01k";
        let ss = SyncState::parse(val);
        assert!(matches!(ss.state, EntryState::Add));
        assert_eq!(ss.entry_uuid, b"uid");
        assert_eq!(ss.cookie.as_deref(), Some(&b"k"[..]));
    }

    #[test]
    fn sync_done_parse() {
        let val = b"\x30\x06\x04\x01c\x01\x01\xff";
        let sd = SyncDone::parse(val);
        assert_eq!(sd.cookie.as_deref(), Some(&b"c"[..]));
        assert!(sd.refresh_deletes);
    }
}
