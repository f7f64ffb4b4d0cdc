//! The Search request surface and its response stream.

use std::collections::HashMap;
use std::time::Duration;

use crate::controls::Control;
use crate::ldap::Ldap;
use crate::parse_filter;
use crate::proto;
use crate::result::{LdapError, LdapResult, Result};
use crate::RequestId;

use tokio::sync::mpsc;
use tokio::time;

use lber::structure::StructureTag;

/// Search scope (RFC 4511, §4.5.1.2).
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Scope {
    /// Consider only the entry named by the base DN.
    BaseObject = 0,
    /// Consider the entries immediately below the base DN.
    SingleLevel = 1,
    /// Consider the base entry and its whole subtree.
    WholeSubtree = 2,
}

/// Alias dereferencing policy during Search (RFC 4511, §4.5.1.3).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum DerefAliases {
    /// Never dereference.
    #[default]
    Never = 0,
    /// Dereference while searching below the base object.
    InSearching = 1,
    /// Dereference while locating the base object.
    FindingBaseObject = 2,
    /// Always dereference.
    Always = 3,
}

/// One message of a search response stream, as routed by the connection
/// driver. Intermediate messages travel in the `Entry` variant and are
/// told apart by their application tag.
#[derive(Debug)]
pub enum SearchItem {
    Entry(StructureTag),
    Referral(StructureTag),
    Done(LdapResult),
}

/// Wrapper for the internal structure of a result entry.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ResultEntry(pub StructureTag, pub Vec<Control>);

impl ResultEntry {
    #[doc(hidden)]
    pub fn new(st: StructureTag) -> ResultEntry {
        ResultEntry(st, vec![])
    }

    /// Returns true if the enclosed message is a referral.
    pub fn is_ref(&self) -> bool {
        self.0.id == proto::APP_SEARCH_REFERRAL
    }

    /// Returns true if the enclosed message is an intermediate response.
    pub fn is_intermediate(&self) -> bool {
        self.0.id == proto::APP_INTERMEDIATE_RESPONSE
    }
}

/// Infrequently used parameters of a Search request. The absent fields of
/// a partially initialized struct come from `Default`:
///
/// ```rust
/// # use ldaplink::{DerefAliases, SearchOptions};
/// let opts = SearchOptions {
///     deref: DerefAliases::Always,
///     ..SearchOptions::default()
/// };
/// # let _ = opts;
/// ```
#[derive(Clone, Debug, Default)]
pub struct SearchOptions {
    /// Alias dereferencing policy.
    pub deref: DerefAliases,
    /// Return attribute names only, without values.
    pub typesonly: bool,
    /// Server-side time limit for the operation, in seconds; zero means no
    /// limit. Not a network timeout: see
    /// [`Ldap::with_timeout()`](struct.Ldap.html#method.with_timeout) for
    /// that.
    pub timelimit: i32,
    /// Server-side limit on the number of returned entries; zero means no
    /// limit.
    pub sizelimit: i32,
}

/// Parsed search result entry.
///
/// Attribute values are octet strings on the wire, without any type
/// information. Values of an attribute land in `attrs`, converted to
/// `String`, when every value of that attribute is valid UTF-8; otherwise
/// the whole value set is kept as raw bytes in `bin_attrs`. An attribute
/// which sometimes carries binary values should therefore be looked up in
/// both maps.
#[derive(Debug, Clone)]
pub struct SearchEntry {
    /// Entry DN.
    pub dn: String,
    /// Attributes with all-textual values.
    pub attrs: HashMap<String, Vec<String>>,
    /// Attributes with at least one non-UTF-8 value.
    pub bin_attrs: HashMap<String, Vec<Vec<u8>>>,
}

fn entry_error() -> LdapError {
    LdapError::UnexpectedResponse(proto::APP_SEARCH_ENTRY)
}

fn read_string(tag: Option<StructureTag>) -> Result<String> {
    tag.and_then(|t| t.expect_primitive())
        .and_then(|v| String::from_utf8(v).ok())
        .ok_or_else(entry_error)
}

impl SearchEntry {
    /// Parse a BER search result entry into attribute maps.
    pub fn parse(re: ResultEntry) -> Result<SearchEntry> {
        let mut comps = re
            .0
            .match_id(proto::APP_SEARCH_ENTRY)
            .and_then(|t| t.expect_constructed())
            .ok_or_else(entry_error)?
            .into_iter();
        let dn = read_string(comps.next())?;
        let mut attrs = HashMap::new();
        let mut bin_attrs = HashMap::new();
        let attr_list = comps
            .next()
            .and_then(|t| t.expect_constructed())
            .ok_or_else(entry_error)?;
        for partial_attr in attr_list {
            let mut parts = partial_attr
                .expect_constructed()
                .ok_or_else(entry_error)?
                .into_iter();
            let name = read_string(parts.next())?;
            let values = parts
                .next()
                .and_then(|t| t.expect_constructed())
                .ok_or_else(entry_error)?
                .into_iter()
                .map(|t| t.expect_primitive().ok_or_else(entry_error))
                .collect::<Result<Vec<Vec<u8>>>>()?;
            if values.iter().all(|v| std::str::from_utf8(v).is_ok()) {
                attrs.insert(
                    name,
                    values
                        .into_iter()
                        .map(|v| String::from_utf8(v).expect("checked utf8"))
                        .collect(),
                );
            } else {
                bin_attrs.insert(name, values);
            }
        }
        Ok(SearchEntry {
            dn,
            attrs,
            bin_attrs,
        })
    }

    /// As [`parse()`](#method.parse), panicking on a malformed entry.
    pub fn construct(re: ResultEntry) -> SearchEntry {
        SearchEntry::parse(re).expect("malformed search entry")
    }
}

/// Possible states of a `SearchStream`.
///
/// A stream starts out `Active`: the request has been handed to the
/// connection driver, and entries can be drawn with `next()`. The arrival
/// of the final Search message moves it to `Done`; `finish()` moves any
/// state to `Closed`. A fallible operation which goes wrong leaves the
/// stream in `Error`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamState {
    /// Live stream which can be iterated with `next()`.
    Active,
    /// All messages of the stream have been retrieved.
    Done,
    /// Finalized stream, after a call to `finish()`.
    Closed,
    /// Stream in an error state after some fallible operation.
    Error,
}

/// A stream of entries from one Search, created by
/// [`streaming_search()`](struct.Ldap.html#method.streaming_search).
///
/// Entries arrive through a bounded queue fed by the connection driver, so
/// a consumer which falls behind slows the connection down instead of
/// buffering without limit. Call [`next()`](#method.next) until it returns
/// `Ok(None)` or an error, then [`finish()`](#method.finish) for the
/// overall search result. Abandoning the stream early only stops local
/// processing; telling the server is the caller's job, by performing an
/// Abandon operation with this stream's message ID.
#[derive(Debug)]
pub struct SearchStream {
    ldap: Ldap,
    id: RequestId,
    rx: Option<mpsc::Receiver<(SearchItem, Vec<Control>)>>,
    state: StreamState,
    timeout: Option<Duration>,
    /// Overall result, present once the server's final message arrives.
    pub res: Option<LdapResult>,
}

impl SearchStream {
    /// Compile the filter, send the request off, and wrap the response
    /// queue. The stream is live as soon as this returns.
    pub(crate) fn issue<S: AsRef<str>>(
        mut ldap: Ldap,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: &[S],
    ) -> Result<SearchStream> {
        let opts = ldap.search_opts.take().unwrap_or_default();
        let timeout = ldap.timeout.take();
        let filter = parse_filter(filter)?;
        let req = proto::search_request(base, scope, &opts, filter, attrs);
        let (id, rx) = ldap.issue_search(req)?;
        Ok(SearchStream {
            ldap,
            id,
            rx: Some(rx),
            state: StreamState::Active,
            timeout,
            res: None,
        })
    }

    /// Fetch the next entry or referral, `Ok(None)` at the end of the
    /// stream.
    #[allow(clippy::should_implement_trait)]
    pub async fn next(&mut self) -> Result<Option<ResultEntry>> {
        if self.state != StreamState::Active {
            return Ok(None);
        }
        let rx = self.rx.as_mut().expect("active stream has a queue");
        let item = match self.timeout {
            Some(timeout) => match time::timeout(timeout, rx.recv()).await {
                Ok(item) => item,
                Err(elapsed) => {
                    self.state = StreamState::Error;
                    self.ldap.finish_op(self.id);
                    return Err(LdapError::from(elapsed));
                }
            },
            None => rx.recv().await,
        };
        match item {
            None => {
                // the driver dropped the queue without a Done message
                self.rx = None;
                self.state = StreamState::Error;
                Err(LdapError::EndOfStream)
            }
            Some((SearchItem::Entry(t), controls)) | Some((SearchItem::Referral(t), controls)) => {
                Ok(Some(ResultEntry(t, controls)))
            }
            Some((SearchItem::Done(mut res), controls)) => {
                res.ctrls = controls;
                self.res = Some(res);
                self.rx = None;
                self.state = StreamState::Done;
                Ok(None)
            }
        }
    }

    /// Close the stream and return the overall Search result.
    ///
    /// After a fully drained stream this is the result the server sent;
    /// otherwise a synthetic `abandoned` result is returned, the driver's
    /// pending slot is released, and informing the server is up to the
    /// caller.
    pub async fn finish(&mut self) -> LdapResult {
        if self.state == StreamState::Closed {
            return synthetic_result(80, "stream already finalized");
        }
        if self.state != StreamState::Done {
            self.ldap.finish_op(self.id);
        }
        self.state = StreamState::Closed;
        self.rx = None;
        self.res
            .take()
            .unwrap_or_else(|| synthetic_result(88, "user cancelled"))
    }

    /// Return the current state of the stream.
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Return the `Ldap` handle of the stream.
    pub fn ldap_handle(&mut self) -> &mut Ldap {
        &mut self.ldap
    }
}

fn synthetic_result(rc: u32, text: &str) -> LdapResult {
    LdapResult {
        rc,
        matched: String::new(),
        text: String::from(text),
        refs: vec![],
        ctrls: vec![],
    }
}

/// Collect the referral URIs of a BER-encoded reference.
pub fn parse_refs(t: StructureTag) -> Vec<String> {
    t.expect_constructed()
        .unwrap_or_default()
        .into_iter()
        .filter_map(|t| t.expect_primitive())
        .filter_map(|uri| String::from_utf8(uri).ok())
        .collect()
}
