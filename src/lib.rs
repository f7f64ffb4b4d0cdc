//! A pure-Rust LDAPv3 client library on the Tokio stack.
//!
//! The crate multiplexes any number of concurrent LDAP operations over a
//! single connection to a directory server. A [`Connection`](struct.Connection.html)
//! drives the socket; the cloneable [`Ldap`](struct.Ldap.html) handle issues
//! operations against it. With the __sync__ feature (enabled by default),
//! [`LdapConn`](struct.LdapConn.html) wraps the pair in a blocking interface.
//!
//! Besides the protocol operations of RFC 4511, the library contains a
//! search filter compiler and decompiler (RFC 4515, the [`filter`](filter/index.html)
//! module) and a distinguished name parser and printer (RFC 4514, the
//! [`dn`](dn/index.html) module).
//!
//! ## Compile-time features
//!
//! * __sync__ (enabled by default): blocking API support.
//!
//! * __tls__ (alias for __tls-native__): TLS support, for both the
//!   __ldaps__ scheme and the in-place StartTLS upgrade, backed by the
//!   `native-tls` crate.
//!
//! * __gssapi__: Kerberos/GSSAPI binds through the `cross-krb5` crate.
//!   Uses FFI to the platform Kerberos libraries.
//!
//! * __ntlm__: NTLM binds through the `sspi` crate. Username and password
//!   must be supplied in cleartext.
//!
//! Without the TLS feature, only plain TCP connections are available.
//!
//! ## Example
//!
//! ```rust,no_run
//! use ldaplink::{Connection, Scope, SearchEntry};
//! use ldaplink::result::Result;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let (conn, mut ldap) = Connection::new("ldap://localhost:2389").await?;
//!     ldaplink::drive!(conn);
//!     let (rs, _res) = ldap.search(
//!         "ou=Places,dc=example,dc=org",
//!         Scope::WholeSubtree,
//!         "(&(objectClass=locality)(l=ma*))",
//!         vec!["l"]
//!     ).await?.success()?;
//!     for entry in rs {
//!         println!("{:?}", SearchEntry::construct(entry));
//!     }
//!     Ok(ldap.unbind().await?)
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

#[doc(hidden)]
#[macro_use]
pub extern crate log;
#[doc(hidden)]
pub use tokio;

/// Type alias for the LDAP message ID.
pub type RequestId = i32;

pub mod asn1 {
    //! ASN.1 structure construction and parsing.
    //!
    //! Re-exports of the `lber` interface used when implementing an
    //! extended operation or a control outside this crate. Consult the
    //! source of the existing exops and controls for usage examples.
    pub use lber::IResult;
    pub use lber::common::TagClass;
    pub use lber::parse::{parse_tag, parse_uint};
    pub use lber::structure::{PL, StructureTag};
    pub use lber::structures::{
        ASNTag, Boolean, Enumerated, ExplicitTag, Integer, Null, OctetString, Sequence, Set, Tag,
    };
    pub use lber::universal::Types;
    pub use lber::write;
}
mod codec;
mod conn;
pub mod controls {
    //! Control construction and parsing.
    //!
    //! A control can be associated with a request or a response. The common
    //! controls listed in this module are implemented directly by the
    //! library. If an implemented control has the same form for the request
    //! and the response, there is a single structure for both; if the forms
    //! differ, the response struct's name carries the `Resp` suffix.
    //!
    //! A request control is created by instantiating its structure and
    //! converting it with `into()` when building the control vector for
    //! [`with_controls()`](../struct.Ldap.html#method.with_controls). A
    //! third-party control must implement the conversion from itself to
    //! [`RawControl`](struct.RawControl.html), the general form of a control.
    //!
    //! Every operation result carries a vector of [`Control`](struct.Control.html)
    //! values. The first element of `Control` has a value if the response
    //! parser recognizes the control's OID through the process-wide
    //! [registry](fn.register_control.html); the registry is seeded with
    //! the controls implemented here, and registration of further OIDs is
    //! idempotent and thread-safe. A recognized or raw response control is
    //! decoded by calling [`parse()`](struct.RawControl.html#method.parse)
    //! on its `RawControl`, for any type implementing
    //! [`ControlParser`](trait.ControlParser.html).
    pub use crate::controls_impl::parse_syncinfo;
    pub use crate::controls_impl::{
        ChangeType, Control, ControlParser, ControlType, CriticalControl, DirSync,
        EntryChangeNotification, EntryState, ExtendedDn, IntoRawControlVec, MakeCritical,
        ManageDsaIt, Notification, PagedResults, PasswordPolicy, PasswordPolicyError,
        PasswordPolicyResp, PasswordPolicyWarning, PersistentSearch, ProxyAuth, RawControl,
        RefreshMode, ServerSort, ServerSortResult, ShowDeleted, SortKey, SyncDone, SyncInfo,
        SyncRequest, SyncState, TreeDelete, VChuPasswordMustChange, VChuPasswordWarning,
    };
    pub use crate::controls_impl::{control_description, register_control};
}
mod controls_impl;
mod digest_md5;
pub mod dn;
mod exop_impl;
pub mod exop {
    //! Extended operation construction and parsing.
    //!
    //! A generic exop is represented by [`Exop`](struct.Exop.html). A
    //! request struct implements the `From` conversion of itself into
    //! `Exop`; a response struct implements [`ExopParser`](trait.ExopParser.html).
    //! Response structs carry the `Resp` suffix when they differ from the
    //! request.
    pub use crate::exop_impl::{
        Exop, ExopParser, PasswordModify, PasswordModifyResp, StartTls, WhoAmI, WhoAmIResp,
    };
}
pub mod filter;
mod ldap;
mod proto;
pub mod result;
mod search;
#[cfg(feature = "sync")]
mod sync;
mod util;

pub use conn::{ConnSettings, Connection};
pub use dn::{dn_escape, parse_dn, AttributeTypeAndValue, Dn, RelativeDn};
pub use filter::parse as parse_filter;
pub use filter::unparse as unparse_filter;
pub use ldap::{Ldap, Mod};
pub use result::{LdapError, LdapResult, SearchResult};
pub use search::parse_refs;
pub use search::{
    DerefAliases, ResultEntry, Scope, SearchEntry, SearchOptions, SearchStream, StreamState,
};
#[cfg(feature = "sync")]
pub use sync::{EntryStream, LdapConn};
pub use util::{ldap_escape, ldap_unescape, postal_escape, postal_unescape};
