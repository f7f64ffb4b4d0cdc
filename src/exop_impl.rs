use lber::common::TagClass;
use lber::structures::{OctetString, Tag};

mod passmod;
pub use self::passmod::{PasswordModify, PasswordModifyResp};

mod starttls;
pub use self::starttls::StartTls;

mod whoami;
pub use self::whoami::{WhoAmI, WhoAmIResp};

/// Generic extended operation.
///
/// Since the payload can be arbitrary, both the name, really an OID, and
/// the value are optional byte vectors (the name is additionally
/// UTF-8-checked, since the protocol specifies it as an OID string). When
/// sending the request, at least the name should be present; parsing the
/// response may yield an empty structure.
#[derive(Clone, Debug)]
pub struct Exop {
    /// OID of the operation, if any.
    pub name: Option<String>,
    /// Request or response value, if any.
    pub val: Option<Vec<u8>>,
}

/// Conversion trait for extended operation responses.
pub trait ExopParser {
    /// Convert the raw BER value into an exop-specific struct.
    fn parse(val: &[u8]) -> Self;
}

impl Exop {
    /// Parse the generic exop into an operation-specific struct.
    ///
    /// The parser will panic if the value is `None`.
    pub fn parse<T: ExopParser>(&self) -> T {
        T::parse(self.val.as_ref().expect("value"))
    }
}

pub(crate) fn construct_exop(exop: Exop) -> Vec<Tag> {
    assert!(exop.name.is_some() || exop.val.is_some());
    let mut seq = vec![];
    if let Some(name) = exop.name {
        seq.push(Tag::OctetString(OctetString {
            id: 0,
            class: TagClass::Context,
            inner: Vec::from(name.as_bytes()),
        }));
    }
    if let Some(val) = exop.val {
        seq.push(Tag::OctetString(OctetString {
            id: 1,
            class: TagClass::Context,
            inner: val,
        }));
    }
    seq
}
