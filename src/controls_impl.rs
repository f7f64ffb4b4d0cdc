use std::collections::HashMap;
use std::sync::{LazyLock, RwLock};

use lber::structure::{StructureTag, PL};
use lber::structures::{ASNTag, Boolean, OctetString, Sequence, Tag};
use lber::universal::Types;

/// Recognized control types.
///
/// The variants can't be exhaustively matched, since the list of
/// recognized and internally implemented controls can change from one
/// release to the next.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ControlType {
    PagedResults,
    SyncRequest,
    SyncState,
    SyncDone,
    ManageDsaIt,
    ProxyAuth,
    ServerSort,
    ServerSortResult,
    PersistentSearch,
    EntryChangeNotification,
    ShowDeleted,
    Notification,
    ExtendedDn,
    TreeDelete,
    DirSync,
    PasswordPolicy,
    VChuPasswordMustChange,
    VChuPasswordWarning,
}

mod ad;
pub use self::ad::{DirSync, ExtendedDn, Notification, ShowDeleted, TreeDelete};

mod content_sync;
pub use self::content_sync::parse_syncinfo;
pub use self::content_sync::{EntryState, RefreshMode, SyncDone, SyncInfo, SyncRequest, SyncState};

mod manage_dsa_it;
pub use self::manage_dsa_it::ManageDsaIt;

mod paged;
pub use self::paged::{PagedResults, PAGED_RESULTS_OID};

mod password_policy;
pub use self::password_policy::{
    PasswordPolicy, PasswordPolicyError, PasswordPolicyResp, PasswordPolicyWarning,
    VChuPasswordMustChange, VChuPasswordWarning,
};

mod proxy_auth;
pub use self::proxy_auth::ProxyAuth;

mod psearch;
pub use self::psearch::{ChangeType, EntryChangeNotification, PersistentSearch};

mod server_sort;
pub use self::server_sort::{ServerSort, ServerSortResult, SortKey};

#[rustfmt::skip]
static REGISTRY: LazyLock<RwLock<HashMap<String, (ControlType, &'static str)>>> =
    LazyLock::new(|| {
        let mut map = HashMap::new();
        let seed: &[(&str, ControlType, &str)] = &[
            (self::paged::PAGED_RESULTS_OID, ControlType::PagedResults, "Paged Results"),
            (self::content_sync::SYNC_REQUEST_OID, ControlType::SyncRequest, "Sync Request"),
            (self::content_sync::SYNC_STATE_OID, ControlType::SyncState, "Sync State"),
            (self::content_sync::SYNC_DONE_OID, ControlType::SyncDone, "Sync Done"),
            (self::manage_dsa_it::MANAGE_DSA_IT_OID, ControlType::ManageDsaIt, "ManageDsaIT"),
            (self::proxy_auth::PROXY_AUTH_OID, ControlType::ProxyAuth, "Proxied Authorization"),
            (self::server_sort::SERVER_SORT_OID, ControlType::ServerSort, "Server Side Sort Request"),
            (self::server_sort::SERVER_SORT_RESULT_OID, ControlType::ServerSortResult, "Server Side Sort Result"),
            (self::psearch::PERSISTENT_SEARCH_OID, ControlType::PersistentSearch, "Persistent Search"),
            (self::psearch::ENTRY_CHANGE_OID, ControlType::EntryChangeNotification, "Entry Change Notification"),
            (self::ad::SHOW_DELETED_OID, ControlType::ShowDeleted, "Microsoft Show Deleted"),
            (self::ad::NOTIFICATION_OID, ControlType::Notification, "Microsoft Notification"),
            (self::ad::EXTENDED_DN_OID, ControlType::ExtendedDn, "Microsoft Extended DN"),
            (self::ad::TREE_DELETE_OID, ControlType::TreeDelete, "Microsoft Tree Delete"),
            (self::ad::DIRSYNC_OID, ControlType::DirSync, "Microsoft DirSync"),
            (self::password_policy::PASSWORD_POLICY_OID, ControlType::PasswordPolicy, "Password Policy - Behera Draft"),
            (self::password_policy::VCHU_PASSWORD_MUST_CHANGE_OID, ControlType::VChuPasswordMustChange, "VChu Password Must Change"),
            (self::password_policy::VCHU_PASSWORD_WARNING_OID, ControlType::VChuPasswordWarning, "VChu Password Warning"),
        ];
        for &(oid, ctype, desc) in seed {
            map.insert(oid.to_owned(), (ctype, desc));
        }
        RwLock::new(map)
    });

/// Register a control OID with its recognized type and a human-readable
/// description. Registration is idempotent: an OID which is already present
/// keeps its original entry. The registry is consulted when parsing
/// response controls, so registering an alias OID makes responses bearing
/// it carry the corresponding [`ControlType`](enum.ControlType.html).
pub fn register_control(oid: &str, ctype: ControlType, description: &'static str) {
    let mut registry = REGISTRY.write().expect("control registry");
    registry.entry(oid.to_owned()).or_insert((ctype, description));
}

/// Return the registered description of a control OID, if any.
pub fn control_description(oid: &str) -> Option<&'static str> {
    let registry = REGISTRY.read().expect("control registry");
    registry.get(oid).map(|entry| entry.1)
}

fn registered_type(oid: &str) -> Option<ControlType> {
    let registry = REGISTRY.read().expect("control registry");
    registry.get(oid).map(|entry| entry.0)
}

/// Conversion trait for single control instances.
///
/// The [`Ldap::with_controls()`](crate::Ldap::with_controls) method and its
/// sync counterpart accept a vector of controls, as dictated by the LDAP
/// specification. However, it's expected that most uses of controls involve
/// a single instance, so constructing a vector at the call site is noisy. If
/// a control implements this trait, its single instance may be used in the
/// call, and a single-element vector is constructed internally.
pub trait IntoRawControlVec {
    /// Create a control vector.
    fn into(self) -> Vec<RawControl>;
}

/// Trivial implementation for a control vector, returning itself.
impl IntoRawControlVec for Vec<RawControl> {
    fn into(self) -> Vec<RawControl> {
        self
    }
}

/// Blanket implementation for any control. The vector is constructed by the
/// conversion method.
impl<R> IntoRawControlVec for R
where
    RawControl: From<R>,
{
    fn into(self) -> Vec<RawControl> {
        vec![std::convert::Into::into(self)]
    }
}

/// Mark a control as critical.
///
/// Most controls provided by this library implement this trait. All controls
/// are instantiated as non-critical by default, unless dictated otherwise by
/// their specification.
pub trait MakeCritical {
    /// Mark the control instance as critical. This operation consumes the
    /// control, and is irreversible.
    fn critical(self) -> CriticalControl<Self>
    where
        Self: Sized,
    {
        CriticalControl { control: self }
    }
}

/// Wrapper for a control marked as critical.
///
/// The wrapper ensures that the criticality of the control will be set to
/// true when the control is encoded.
pub struct CriticalControl<T> {
    control: T,
}

impl<T> From<CriticalControl<T>> for RawControl
where
    T: Into<RawControl>,
{
    fn from(cc: CriticalControl<T>) -> RawControl {
        let mut rc = cc.control.into();
        rc.crit = true;
        rc
    }
}

/// Conversion trait for response controls.
pub trait ControlParser {
    /// Convert the raw BER value into a control-specific struct.
    fn parse(val: &[u8]) -> Self;
}

/// Response control.
///
/// If the OID is recognized in the control registry while parsing raw BER
/// data of the response, the first element will have a value, otherwise it
/// will be `None`.
#[derive(Clone, Debug)]
pub struct Control(pub Option<ControlType>, pub RawControl);

/// Generic control.
///
/// This struct can be used both for request and response controls. For
/// requests, an independently implemented control can produce an instance
/// of this type and use it to provide an element of the vector passed to
/// [`with_controls()`](../struct.Ldap.html#method.with_controls) by calling
/// `into()` on the instance.
///
/// For responses, an instance is packed into a
/// [`Control`](struct.Control.html) and can be parsed by calling
/// type-qualified [`parse()`](#method.parse) on that instance, if a
/// [`ControlParser`](trait.ControlParser.html) implementation exists for the
/// specified type.
#[derive(Clone, Debug)]
pub struct RawControl {
    /// OID of the control.
    pub ctype: String,
    /// Criticality, has no meaning on response.
    pub crit: bool,
    /// Raw value of the control, if any.
    pub val: Option<Vec<u8>>,
}

impl RawControl {
    /// Parse the generic control into a control-specific struct.
    ///
    /// The parser will panic if the control value is `None`.
    /// __Note__: no control known to the author signals the lack of return
    /// value by omitting the control value, so this shouldn't be a problem
    /// in practice. Nevertheless, it should be possible to report this along
    /// with other parsing errors, if it proves necessary.
    pub fn parse<T: ControlParser>(&self) -> T {
        T::parse(self.val.as_ref().expect("value"))
    }
}

pub fn build_tag(rc: RawControl) -> StructureTag {
    let mut seq = vec![Tag::OctetString(OctetString {
        inner: Vec::from(rc.ctype.as_bytes()),
        ..Default::default()
    })];
    if rc.crit {
        seq.push(Tag::Boolean(Boolean {
            inner: true,
            ..Default::default()
        }));
    }
    if let Some(val) = rc.val {
        seq.push(Tag::OctetString(OctetString {
            inner: val,
            ..Default::default()
        }));
    }
    Tag::Sequence(Sequence {
        inner: seq,
        ..Default::default()
    })
    .into_structure()
}

pub fn parse_controls(t: StructureTag) -> Vec<Control> {
    let tags = t.expect_constructed().expect("result sequence").into_iter();
    let mut ctrls = Vec::new();
    for ctrl in tags {
        let mut components = ctrl.expect_constructed().expect("components").into_iter();
        let ctype = String::from_utf8(
            components
                .next()
                .expect("element")
                .expect_primitive()
                .expect("octet string"),
        )
        .expect("control type");
        let next = components.next();
        let (crit, maybe_val) = match next {
            None => (false, None),
            Some(c) => match c {
                StructureTag {
                    id, ref payload, ..
                } if id == Types::Boolean as u64 => match *payload {
                    PL::P(ref v) => (v[0] != 0, components.next()),
                    PL::C(_) => panic!("decoding error"),
                },
                StructureTag { id, .. } if id == Types::OctetString as u64 => {
                    (false, Some(c.clone()))
                }
                _ => panic!("decoding error"),
            },
        };
        let val = maybe_val.map(|v| v.expect_primitive().expect("octet string"));
        let known_type = registered_type(&ctype);
        ctrls.push(Control(known_type, RawControl { ctype, crit, val }));
    }
    ctrls
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn registry_idempotent() {
        register_control("1.2.3.4.5", ControlType::PagedResults, "first");
        register_control("1.2.3.4.5", ControlType::ManageDsaIt, "second");
        assert_eq!(control_description("1.2.3.4.5"), Some("first"));
        assert_eq!(registered_type("1.2.3.4.5"), Some(ControlType::PagedResults));
    }

    #[test]
    fn registry_seeded() {
        assert_eq!(
            registered_type("1.2.840.113556.1.4.319"),
            Some(ControlType::PagedResults)
        );
        assert_eq!(registered_type("9.9.9.9"), None);
    }

    #[test]
    fn controls_roundtrip_through_tags() {
        let raw = RawControl {
            ctype: PAGED_RESULTS_OID.to_owned(),
            crit: true,
            val: Some(vec![0x30, 0x00]),
        };
        let parsed = parse_controls(StructureTag {
            class: lber::common::TagClass::Context,
            id: 0,
            payload: PL::C(vec![build_tag(raw)]),
        });
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].0, Some(ControlType::PagedResults));
        assert!(parsed[0].1.crit);
        assert_eq!(parsed[0].1.val.as_deref(), Some(&[0x30, 0x00][..]));
    }
}
