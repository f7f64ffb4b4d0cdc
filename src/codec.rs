//! Framing for the LDAPMessage envelope.
//!
//! Every message on the wire is `SEQUENCE { messageID, protocolOp,
//! [0] controls? }`. The codec turns outgoing `(id, op, controls)` triples
//! into BER bytes and incoming bytes into `(id, (op, controls))` pairs for
//! the connection driver to route by message ID. With the __gssapi__
//! feature, an optional SASL confidentiality layer wraps and unwraps whole
//! frames once a Kerberos security layer has been negotiated.

use std::io;
#[cfg(feature = "gssapi")]
use std::sync::RwLock;
#[cfg(feature = "gssapi")]
use std::sync::{Arc, Mutex};

use crate::controls::{Control, RawControl};
use crate::controls_impl::{build_tag, parse_controls};
use crate::RequestId;

use lber::common::TagClass;
use lber::parse::parse_uint;
use lber::structure::{StructureTag, PL};
use lber::structures::{ASNTag, Integer, Sequence, Tag};
use lber::universal::Types;
use lber::write;

use bytes::{Buf, BytesMut};
#[cfg(feature = "gssapi")]
use cross_krb5::{ClientCtx, K5Ctx};
use tokio_util::codec::{Decoder, Encoder};

/// Negotiated SASL security layer parameters, installed by a GSSAPI bind.
#[cfg(feature = "gssapi")]
#[derive(Debug, Default)]
pub(crate) struct SaslParams {
    pub wrap: bool,
    pub max_send: u32,
}

pub(crate) struct LdapCodec {
    #[cfg(feature = "gssapi")]
    pub(crate) has_decoded_data: bool,
    #[cfg(feature = "gssapi")]
    pub(crate) sasl_param: Arc<RwLock<SaslParams>>,
    #[cfg(feature = "gssapi")]
    pub(crate) client_ctx: Arc<Mutex<Option<ClientCtx>>>,
}

impl LdapCodec {
    pub(crate) fn new() -> LdapCodec {
        LdapCodec {
            #[cfg(feature = "gssapi")]
            has_decoded_data: false,
            #[cfg(feature = "gssapi")]
            sasl_param: Arc::new(RwLock::new(SaslParams::default())),
            #[cfg(feature = "gssapi")]
            client_ctx: Arc::new(Mutex::new(None)),
        }
    }
}

fn decoding_error() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "BER decoding error")
}

/// Split one complete envelope off the front of `buf`, if present.
#[allow(clippy::type_complexity)]
fn decode_envelope(
    buf: &mut BytesMut,
) -> Result<Option<(RequestId, (Tag, Vec<Control>))>, io::Error> {
    let mut parser = lber::Parser::new();
    let (rest_len, tag) = match parser.parse(buf) {
        Err(e) if e.is_incomplete() => return Ok(None),
        Err(_) => return Err(decoding_error()),
        Ok((rest, tag)) => (rest.len(), tag),
    };
    buf.advance(buf.len() - rest_len);
    let mut tags = tag
        .match_id(Types::Sequence as u64)
        .and_then(|t| t.expect_constructed())
        .ok_or_else(decoding_error)?;
    let mut last = tags.pop().ok_or_else(decoding_error)?;
    let has_controls = match last {
        StructureTag {
            id,
            class,
            ref payload,
        } if class == TagClass::Context && id == 0 => match *payload {
            PL::C(_) => true,
            PL::P(_) => return Err(decoding_error()),
        },
        StructureTag { id, class, .. } if class == TagClass::Context && id == 10 => {
            // Active Directory bug workaround
            //
            // AD encodes the OID of the Notice of Disconnection unsolicited
            // notification outside the ExtendedResponse sequence, in the
            // position where optional controls belong. Skip the element.
            last = tags.pop().ok_or_else(decoding_error)?;
            false
        }
        _ => false,
    };
    let (protoop, controls) = if has_controls {
        (tags.pop().ok_or_else(decoding_error)?, parse_controls(last))
    } else {
        (last, vec![])
    };
    let msgid_bytes = tags
        .pop()
        .and_then(|t| t.match_class(TagClass::Universal))
        .and_then(|t| t.match_id(Types::Integer as u64))
        .and_then(|t| t.expect_primitive())
        .ok_or_else(decoding_error)?;
    let msgid = match parse_uint(msgid_bytes.as_slice()) {
        Ok((_, id)) => id as i32,
        _ => return Err(decoding_error()),
    };
    Ok(Some((msgid, (Tag::StructureTag(protoop), controls))))
}

impl Decoder for LdapCodec {
    type Item = (RequestId, (Tag, Vec<Control>));
    type Error = io::Error;

    #[cfg(not(feature = "gssapi"))]
    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_envelope(buf)
    }

    #[cfg(feature = "gssapi")]
    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        const U32_SIZE: usize = std::mem::size_of::<u32>();

        let sasl_wrap = { self.sasl_param.read().expect("sasl params").wrap };
        if !sasl_wrap || buf.is_empty() {
            return decode_envelope(buf);
        }
        if self.has_decoded_data {
            let res = decode_envelope(buf);
            if res.is_ok() && buf.is_empty() {
                self.has_decoded_data = false;
            }
            return res;
        }
        if buf.len() < U32_SIZE {
            return Err(io::Error::new(io::ErrorKind::Other, "invalid SASL buffer"));
        }
        let sasl_len = u32::from_be_bytes(buf[0..U32_SIZE].try_into().unwrap());
        if buf.len() - U32_SIZE < sasl_len as usize {
            return Ok(None);
        }
        buf.advance(U32_SIZE);
        let client_opt = &mut *self.client_ctx.lock().expect("client ctx lock");
        let client_ctx = client_opt.as_mut().expect("client Option mut ref");
        let mut decoded = client_ctx.unwrap_iov(sasl_len as usize, buf).map_err(|e| {
            io::Error::new(io::ErrorKind::Other, format!("gss_unwrap error: {:#}", e))
        })?;
        let res = decode_envelope(&mut decoded);
        if res.is_ok() && !decoded.is_empty() && buf.is_empty() {
            buf.extend(decoded);
            self.has_decoded_data = true;
        }
        res
    }
}

#[cfg(not(feature = "gssapi"))]
#[inline]
fn maybe_wrap(
    _codec: &mut LdapCodec,
    outstruct: StructureTag,
    into: &mut BytesMut,
) -> io::Result<()> {
    write::encode_into(into, outstruct)?;
    Ok(())
}

#[cfg(feature = "gssapi")]
fn maybe_wrap(
    codec: &mut LdapCodec,
    outstruct: StructureTag,
    into: &mut BytesMut,
) -> io::Result<()> {
    let mut out_buf = BytesMut::new();
    write::encode_into(&mut out_buf, outstruct)?;
    let (sasl_wrap, sasl_max_send) = {
        let sasl_param = codec.sasl_param.read().expect("sasl params");
        (sasl_param.wrap, sasl_param.max_send)
    };
    if sasl_wrap {
        let client_opt = &mut *codec.client_ctx.lock().expect("client_ctx lock");
        let client_ctx = client_opt.as_mut().expect("client Option mut ref");
        if sasl_max_send > 0 && out_buf.len() > sasl_max_send as usize {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!(
                    "buffer too large for GSSAPI: {} > {}",
                    out_buf.len(),
                    sasl_max_send
                ),
            ));
        }
        let sasl_buf = client_ctx
            .wrap(true, &out_buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("gss_wrap error: {:#}", e)))?;
        let sasl_len = (sasl_buf.len() as u32).to_be_bytes();
        into.extend(&sasl_len);
        into.extend(&*sasl_buf);
    } else {
        into.extend(&out_buf);
    }
    Ok(())
}

impl Encoder<(RequestId, Tag, Option<Vec<RawControl>>)> for LdapCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        msg: (RequestId, Tag, Option<Vec<RawControl>>),
        into: &mut BytesMut,
    ) -> io::Result<()> {
        let (id, tag, controls) = msg;
        let mut envelope = vec![
            Tag::Integer(Integer {
                inner: id as i64,
                ..Default::default()
            }),
            tag,
        ];
        if let Some(controls) = controls {
            envelope.push(Tag::StructureTag(StructureTag {
                id: 0,
                class: TagClass::Context,
                payload: PL::C(controls.into_iter().map(build_tag).collect()),
            }));
        }
        let outstruct = Tag::Sequence(Sequence {
            inner: envelope,
            ..Default::default()
        })
        .into_structure();
        maybe_wrap(self, outstruct, into)?;
        Ok(())
    }
}
