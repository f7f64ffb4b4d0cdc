//! Operation result structures and helpers.
//!
//! Most LDAP operations return an [`LdapResult`](struct.LdapResult.html),
//! defined here together with the wrapper structs and helper methods which
//! adapt LDAP result and error handling to Rust conventions.

use std::error::Error;
use std::fmt;
use std::io;
use std::result::Result as StdResult;

use crate::conn::Command;
use crate::controls::Control;
use crate::exop::Exop;
use crate::ldap::SaslCreds;
use crate::search::parse_refs;
use crate::search::ResultEntry;

use lber::common::TagClass;
use lber::parse::parse_uint;
use lber::structure::StructureTag;
use lber::structures::Tag;
use lber::universal::Types;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time;

/// Type alias for the standard `Result` with the fixed `LdapError` error part.
pub type Result<T> = std::result::Result<T, LdapError>;

/// Error variants recognized by the library.
#[derive(Debug, Error)]
pub enum LdapError {
    /// Encapsulated I/O error.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// Error while handing a command to the connection driver; the
    /// connection is gone.
    #[error("command send error: {source}")]
    CommandSend {
        #[from]
        source: mpsc::error::SendError<Command>,
    },

    /// Error while receiving operation results from the connection driver.
    #[error("result recv error: {source}")]
    ResultRecv {
        #[from]
        source: oneshot::error::RecvError,
    },

    /// Operation or connection timeout.
    #[error("timeout: {elapsed}")]
    Timeout {
        #[from]
        elapsed: time::error::Elapsed,
    },

    /// Error compiling the string representation of a search filter.
    #[error("filter compile error at offset {0}")]
    FilterCompile(usize),

    /// Error decompiling a filter structure into its string representation.
    #[error("filter decompile error: {0}")]
    FilterDecompile(&'static str),

    /// Error parsing the string representation of a DN.
    #[error("DN parse error at offset {offset}: {reason}")]
    DnParse {
        offset: usize,
        reason: &'static str,
    },

    /// Simple Bind with an empty password, without opting into the
    /// Unauthenticated Bind of RFC 4513.
    #[error("empty password for simple bind")]
    EmptyPassword,

    /// Wrong-shaped response to the request, bearing the given tag.
    #[error("unexpected response, tag {0}")]
    UnexpectedResponse(u64),

    /// Premature end of a search stream.
    #[error("premature end of search stream")]
    EndOfStream,

    /// URL parsing error.
    #[error("url parse error: {source}")]
    UrlParsing {
        #[from]
        source: url::ParseError,
    },

    /// Unknown LDAP URL scheme.
    #[error("unknown LDAP URL scheme: {0}")]
    UnknownScheme(String),

    #[cfg(feature = "tls-native")]
    /// Native TLS library error.
    #[error("native TLS error: {source}")]
    NativeTLS {
        #[from]
        source: native_tls::Error,
    },

    /// LDAP operation result with an error return code.
    #[error("LDAP operation result: {result}")]
    LdapResult {
        #[from]
        result: LdapResult,
    },

    /// No values provided for the Add operation.
    #[error("empty attribute or value set for Add")]
    AddNoValues,

    /// Error converting an escaped string to UTF-8.
    #[error("utf8 decoding error")]
    DecodingUTF8,

    /// Malformed or truncated DIGEST-MD5 challenge.
    #[error("malformed DIGEST-MD5 challenge: {0}")]
    DigestChallenge(&'static str),

    /// No challenge received from the server during a SASL exchange.
    #[error("no server challenge in SASL exchange")]
    NoSaslChallenge,

    #[cfg(feature = "gssapi")]
    /// GSSAPI operation error.
    #[error("GSSAPI operation error: {0}")]
    GssapiOperationError(String),

    #[cfg(feature = "ntlm")]
    /// SSPI error in NTLM processing.
    #[error("SSPI NTLM error: {source}")]
    SSPIError {
        #[from]
        source: sspi::Error,
    },
}

impl LdapError {
    /// Return the LDAP result code if the error wraps an
    /// [`LdapResult`](struct.LdapResult.html), `None` otherwise.
    pub fn result_code(&self) -> Option<u32> {
        match self {
            LdapError::LdapResult { result } => Some(result.rc),
            _ => None,
        }
    }

    /// Check whether the error wraps an operation result with the given
    /// result code.
    pub fn is_result_code(&self, rc: u32) -> bool {
        self.result_code() == Some(rc)
    }
}

impl From<LdapError> for io::Error {
    fn from(le: LdapError) -> io::Error {
        match le {
            LdapError::Io { source, .. } => source,
            _ => io::Error::new(io::ErrorKind::Other, format!("{}", le)),
        }
    }
}

/// Common components of an LDAP operation result.
///
/// This structure faithfully replicates the components dictated by the
/// standard, and is distinctly C-like with its reliance on numeric codes for
/// the indication of outcome. It would be tempting to hide it behind an
/// automatic `Result`-like interface, but there are scenarios where this
/// would preclude intentional incorporation of error conditions into query
/// design. Instead, the struct implements helper methods,
/// [`success()`](#method.success) and [`non_error()`](#method.non_error),
/// which may be used for ergonomic error handling when simple condition
/// checking suffices.
#[derive(Clone, Debug)]
pub struct LdapResult {
    /// Result code.
    ///
    /// Generally, the value of zero indicates successful completion, but
    /// there's a number of other non-error codes arising as a result of
    /// various operations. See
    /// [Section A.1 of RFC 4511](https://tools.ietf.org/html/rfc4511#appendix-A.1).
    pub rc: u32,
    /// Matched component DN, where applicable.
    pub matched: String,
    /// Additional diagnostic text.
    pub text: String,
    /// Referrals.
    ///
    /// Absence of referrals is represented by an empty vector.
    pub refs: Vec<String>,
    /// Response controls.
    ///
    /// Missing and empty controls are both represented by an empty vector.
    pub ctrls: Vec<Control>,
}

impl Error for LdapResult {}

impl fmt::Display for LdapResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> StdResult<(), fmt::Error> {
        write!(
            f,
            "rc={} ({}), dn: \"{}\", text: \"{}\"",
            self.rc,
            result_code_name(self.rc),
            self.matched,
            self.text
        )
    }
}

/// Name of an LDAP result code from the IANA table.
pub fn result_code_name(rc: u32) -> &'static str {
    match rc {
        0 => "success",
        1 => "operationsError",
        2 => "protocolError",
        3 => "timeLimitExceeded",
        4 => "sizeLimitExceeded",
        5 => "compareFalse",
        6 => "compareTrue",
        7 => "authMethodNotSupported",
        8 => "strongerAuthRequired",
        10 => "referral",
        11 => "adminLimitExceeded",
        12 => "unavailableCriticalExtension",
        13 => "confidentialityRequired",
        14 => "saslBindInProgress",
        16 => "noSuchAttribute",
        17 => "undefinedAttributeType",
        18 => "inappropriateMatching",
        19 => "constraintViolation",
        20 => "attributeOrValueExists",
        21 => "invalidAttributeSyntax",
        32 => "noSuchObject",
        33 => "aliasProblem",
        34 => "invalidDNSyntax",
        36 => "aliasDereferencingProblem",
        48 => "inappropriateAuthentication",
        49 => "invalidCredentials",
        50 => "insufficientAccessRights",
        51 => "busy",
        52 => "unavailable",
        53 => "unwillingToPerform",
        54 => "loopDetect",
        64 => "namingViolation",
        65 => "objectClassViolation",
        66 => "notAllowedOnNonLeaf",
        67 => "notAllowedOnRDN",
        68 => "entryAlreadyExists",
        69 => "objectClassModsProhibited",
        71 => "affectsMultipleDSAs",
        80 => "other",
        88 => "abandoned",
        122 => "assertionFailed",
        _ => "unknown",
    }
}

impl LdapResult {
    /// If the result code is zero, return the instance itself wrapped
    /// in `Ok()`, otherwise wrap the instance in an `LdapError`.
    pub fn success(self) -> Result<Self> {
        if self.rc == 0 {
            Ok(self)
        } else {
            Err(LdapError::from(self))
        }
    }

    /// If the result code is 0 or 10 (referral), return the instance
    /// itself wrapped in `Ok()`, otherwise wrap the instance in an
    /// `LdapError`.
    pub fn non_error(self) -> Result<Self> {
        if self.rc == 0 || self.rc == 10 {
            Ok(self)
        } else {
            Err(LdapError::from(self))
        }
    }
}

impl TryFrom<Tag> for LdapResult {
    type Error = LdapError;

    fn try_from(t: Tag) -> Result<LdapResult> {
        Ok(LdapResultExt::try_from(t)?.0)
    }
}

#[derive(Clone, Debug)]
pub(crate) struct LdapResultExt(pub LdapResult, pub Exop, pub SaslCreds);

impl LdapResultExt {
    fn shape_error(reason: u64) -> LdapError {
        LdapError::UnexpectedResponse(reason)
    }
}

impl TryFrom<Tag> for LdapResultExt {
    type Error = LdapError;

    fn try_from(t: Tag) -> Result<LdapResultExt> {
        let t = match t {
            Tag::StructureTag(t) => t,
            Tag::Null(_) => {
                return Ok(LdapResultExt(
                    LdapResult {
                        rc: 0,
                        matched: String::from(""),
                        text: String::from(""),
                        refs: vec![],
                        ctrls: vec![],
                    },
                    Exop {
                        name: None,
                        val: None,
                    },
                    SaslCreds(None),
                ))
            }
            _ => return Err(LdapResultExt::shape_error(0)),
        };
        let op_id = t.id;
        let mut tags = t
            .expect_constructed()
            .ok_or_else(|| LdapResultExt::shape_error(op_id))?
            .into_iter();
        let rc = parse_result_uint(
            tags.next(),
            TagClass::Universal,
            Types::Enumerated as u64,
            op_id,
        )? as u32;
        let matched = parse_result_string(tags.next(), op_id)?;
        let text = parse_result_string(tags.next(), op_id)?;
        let mut refs = Vec::new();
        let mut exop_name = None;
        let mut exop_val = None;
        let mut sasl_creds = None;
        for comp in tags {
            match comp.id {
                3 => refs.extend(parse_refs(comp)),
                7 => {
                    sasl_creds = comp.expect_primitive();
                }
                10 => {
                    exop_name = comp
                        .expect_primitive()
                        .and_then(|v| String::from_utf8(v).ok());
                }
                11 => {
                    exop_val = comp.expect_primitive();
                }
                _ => (),
            }
        }
        Ok(LdapResultExt(
            LdapResult {
                rc,
                matched,
                text,
                refs,
                ctrls: vec![],
            },
            Exop {
                name: exop_name,
                val: exop_val,
            },
            SaslCreds(sasl_creds),
        ))
    }
}

fn parse_result_uint(
    tag: Option<StructureTag>,
    class: TagClass,
    id: u64,
    op_id: u64,
) -> Result<u64> {
    let bytes = tag
        .and_then(|t| t.match_class(class))
        .and_then(|t| t.match_id(id))
        .and_then(|t| t.expect_primitive())
        .ok_or(LdapError::UnexpectedResponse(op_id))?;
    match parse_uint(bytes.as_slice()) {
        Ok((_, val)) => Ok(val),
        _ => Err(LdapError::UnexpectedResponse(op_id)),
    }
}

fn parse_result_string(tag: Option<StructureTag>, op_id: u64) -> Result<String> {
    tag.and_then(|t| t.expect_primitive())
        .and_then(|v| String::from_utf8(v).ok())
        .ok_or(LdapError::UnexpectedResponse(op_id))
}

/// Wrapper for results of a Search operation which returns all entries at once.
///
/// The wrapper exists so that methods [`success()`](#method.success) and
/// [`non_error()`](#method.non_error) can be called on an instance. Those
/// methods destructure the wrapper and return its components as elements
/// of an anonymous tuple.
#[derive(Clone, Debug)]
pub struct SearchResult(pub Vec<ResultEntry>, pub LdapResult);

impl SearchResult {
    /// If the result code is zero, return an anonymous tuple of component
    /// structs wrapped in `Ok()`, otherwise wrap the `LdapResult` part in
    /// an `LdapError`.
    pub fn success(self) -> Result<(Vec<ResultEntry>, LdapResult)> {
        if self.1.rc == 0 {
            Ok((self.0, self.1))
        } else {
            Err(LdapError::from(self.1))
        }
    }

    /// If the result code is 0 or 10 (referral), return an anonymous tuple
    /// of component structs wrapped in `Ok()`, otherwise wrap the
    /// `LdapResult` part in an `LdapError`.
    pub fn non_error(self) -> Result<(Vec<ResultEntry>, LdapResult)> {
        if self.1.rc == 0 || self.1.rc == 10 {
            Ok((self.0, self.1))
        } else {
            Err(LdapError::from(self.1))
        }
    }
}

/// Wrapper for the result of a Compare operation.
///
/// Compare uniquely has two non-zero return codes to indicate the outcome
/// of a successful comparison, while other return codes indicate errors,
/// as usual (except 10 for referral). The [`equal()`](#method.equal) method
/// optimizes for the expected case of ignoring referrals;
/// [`non_error()`](#method.non_error) can be used when that's not possible.
#[derive(Clone, Debug)]
pub struct CompareResult(pub LdapResult);

impl CompareResult {
    /// If the result code is 6 (compareTrue) or 5 (compareFalse), return
    /// the corresponding boolean value wrapped in `Ok()`, otherwise wrap
    /// the `LdapResult` part in an `LdapError`.
    pub fn equal(self) -> Result<bool> {
        match self.0.rc {
            5 => Ok(false),
            6 => Ok(true),
            _ => Err(LdapError::from(self.0)),
        }
    }

    /// If the result code is 5 (compareFalse), 6 (compareTrue), or 10
    /// (referral), return the inner `LdapResult`, otherwise rewrap
    /// `LdapResult` in an `LdapError`.
    pub fn non_error(self) -> Result<LdapResult> {
        if self.0.rc == 5 || self.0.rc == 6 || self.0.rc == 10 {
            Ok(self.0)
        } else {
            Err(LdapError::from(self.0))
        }
    }
}

/// Wrapper for the result of an Extended operation.
///
/// Similarly to [`SearchResult`](struct.SearchResult.html), methods
/// [`success()`](#method.success) and [`non_error()`](#method.non_error)
/// can be called on an instance, and will destructure the wrapper into an
/// anonymous tuple of its components.
#[derive(Clone, Debug)]
pub struct ExopResult(pub Exop, pub LdapResult);

impl ExopResult {
    /// If the result code is zero, return an anonymous tuple of component
    /// structs wrapped in `Ok()`, otherwise wrap the `LdapResult` part in
    /// an `LdapError`.
    pub fn success(self) -> Result<(Exop, LdapResult)> {
        if self.1.rc == 0 {
            Ok((self.0, self.1))
        } else {
            Err(LdapError::from(self.1))
        }
    }

    /// If the result code is 0 or 10 (referral), return an anonymous tuple
    /// of component structs wrapped in `Ok()`, otherwise wrap the
    /// `LdapResult` part in an `LdapError`.
    pub fn non_error(self) -> Result<(Exop, LdapResult)> {
        if self.1.rc == 0 || self.1.rc == 10 {
            Ok((self.0, self.1))
        } else {
            Err(LdapError::from(self.1))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn res(rc: u32) -> LdapResult {
        LdapResult {
            rc,
            matched: String::new(),
            text: String::new(),
            refs: vec![],
            ctrls: vec![],
        }
    }

    #[test]
    fn compare_maps_result_codes() {
        assert_eq!(CompareResult(res(6)).equal().unwrap(), true);
        assert_eq!(CompareResult(res(5)).equal().unwrap(), false);
        let err = CompareResult(res(32)).equal().unwrap_err();
        assert!(err.is_result_code(32));
    }

    #[test]
    fn referral_is_non_error() {
        assert!(res(10).non_error().is_ok());
        assert!(res(10).success().is_err());
    }

    #[test]
    fn code_names() {
        assert_eq!(result_code_name(0), "success");
        assert_eq!(result_code_name(32), "noSuchObject");
        assert_eq!(result_code_name(9), "unknown");
    }
}
