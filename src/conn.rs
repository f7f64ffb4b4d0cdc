//! The connection driver: one socket, one reader, many callers.
//!
//! A [`Connection`](struct.Connection.html) owns the framed socket and a
//! single map of outstanding requests keyed by message ID. Operation
//! handles talk to it over one command queue; every command either issues
//! a request together with its response sink, fires a request no response
//! will answer (Abandon, Unbind), or releases a pending slot. Response
//! frames are routed back through the sink registered under their message
//! ID: a one-shot channel for single-response operations, a bounded queue
//! for search streams. The bounded queue is deliberate: when a search
//! consumer stalls, the reader stalls with it, and the backpressure
//! reaches the server through TCP instead of ballooning memory here.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::codec::LdapCodec;
use crate::controls::{Control, RawControl};
#[cfg(feature = "tls-native")]
use crate::exop_impl::StartTls;
use crate::ldap::Ldap;
use crate::proto;
use crate::result::{LdapError, LdapResult, Result};
use crate::search::SearchItem;
use crate::RequestId;

use lber::structures::Tag;

#[cfg(feature = "tls-native")]
use bytes::BytesMut;
use futures_util::sink::SinkExt;
#[cfg(feature = "tls-native")]
use native_tls::TlsConnector;
#[cfg(feature = "tls-native")]
use tokio::io::AsyncReadExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
#[cfg(feature = "tls-native")]
use tokio_native_tls::TlsStream;
use tokio_stream::StreamExt;
#[cfg(feature = "tls-native")]
use tokio_util::codec::Encoder;
use tokio_util::codec::{Decoder, Framed};
use url::Url;

/// Capacity of the per-search response queue. Full queue means the reader
/// waits, which is the intended backpressure path.
pub(crate) const STREAM_QUEUE: usize = 64;

/// Anything the driver can frame LDAP over.
pub(crate) trait Socket: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Socket for T {}

/// Where the responses to an issued request go.
#[derive(Debug)]
pub enum ResponseSink {
    /// Exactly one response message completes the exchange.
    Once(oneshot::Sender<(Tag, Vec<Control>)>),
    /// A stream of messages terminated by SearchResultDone.
    Stream(mpsc::Sender<(SearchItem, Vec<Control>)>),
}

/// A request which expects responses.
#[derive(Debug)]
pub struct Operation {
    pub id: RequestId,
    pub body: Tag,
    pub controls: Option<Vec<RawControl>>,
    pub sink: ResponseSink,
}

/// A request no response will answer. `shutdown` additionally closes the
/// link after the write (Unbind).
#[derive(Debug)]
pub struct Notice {
    pub id: RequestId,
    pub body: Tag,
    pub controls: Option<Vec<RawControl>>,
    pub shutdown: bool,
    pub done: oneshot::Sender<()>,
}

/// The command queue protocol between operation handles and the driver.
#[derive(Debug)]
pub enum Command {
    Run(Operation),
    Fire(Notice),
    /// Release the pending slot of a finished or abandoned message ID.
    Finish(RequestId),
}

/// Message-id assignment state, shared between the driver and all `Ldap`
/// handles. Ids of in-flight operations are kept so that a wrapped-around
/// counter never reissues one; id zero is never assigned.
#[derive(Debug, Default)]
pub(crate) struct MsgIdState {
    pub(crate) last_id: RequestId,
    pub(crate) in_flight: HashSet<RequestId>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Lifecycle {
    Open,
    Closing,
    Closed,
}

/// Additional settings for an LDAP connection.
///
/// An instance with default values is constructed by [`new()`](#method.new);
/// each setting is replaced through a builder-like method.
#[derive(Clone, Default)]
pub struct ConnSettings {
    conn_timeout: Option<Duration>,
    #[cfg(feature = "tls-native")]
    connector: Option<TlsConnector>,
    #[cfg(feature = "tls-native")]
    starttls: bool,
    #[cfg(feature = "tls-native")]
    no_tls_verify: bool,
}

impl ConnSettings {
    /// Create an instance of the structure with default settings.
    pub fn new() -> ConnSettings {
        ConnSettings::default()
    }

    /// Limit the time allowed for establishing the connection, TLS setup
    /// included. The default is no limit.
    pub fn conn_timeout(mut self, timeout: Duration) -> Self {
        self.conn_timeout = Some(timeout);
        self
    }

    #[cfg(feature = "tls-native")]
    /// Use a preconfigured TLS connector instead of one with default
    /// settings.
    pub fn connector(mut self, connector: TlsConnector) -> Self {
        self.connector = Some(connector);
        self
    }

    #[cfg(feature = "tls-native")]
    /// Upgrade an __ldap__ connection in place with the StartTLS extended
    /// operation before any other traffic. Off by default.
    pub fn starttls(mut self, starttls: bool) -> Self {
        self.starttls = starttls;
        self
    }

    #[cfg(feature = "tls-native")]
    /// Skip server certificate verification. Off by default.
    pub fn no_tls_verify(mut self, no_tls_verify: bool) -> Self {
        self.no_tls_verify = no_tls_verify;
        self
    }
}

/// How the dialed transport is secured.
enum Security {
    Plain,
    #[cfg(feature = "tls-native")]
    Tls {
        /// Negotiate StartTLS on the clear connection first.
        upgrade: bool,
    },
}

#[cfg(feature = "tls-native")]
fn plain_or_starttls(settings: &ConnSettings) -> Security {
    if settings.starttls {
        Security::Tls { upgrade: true }
    } else {
        Security::Plain
    }
}

#[cfg(not(feature = "tls-native"))]
fn plain_or_starttls(_settings: &ConnSettings) -> Security {
    Security::Plain
}

/// Resolve an LDAP URL into a dial target. Only the scheme, host and port
/// take part; a base DN in the URL path is accepted and ignored.
fn dial_target(url: &Url, settings: &ConnSettings) -> Result<(String, u16, Security)> {
    let (default_port, security) = match url.scheme() {
        "ldap" => (389, plain_or_starttls(settings)),
        #[cfg(feature = "tls-native")]
        "ldaps" => (636, Security::Tls { upgrade: false }),
        other => return Err(LdapError::UnknownScheme(String::from(other))),
    };
    let host = match url.host_str() {
        Some("") | None => "localhost",
        Some(host) => host,
    };
    let port = url.port().unwrap_or(default_port);
    Ok((String::from(host), port, security))
}

#[cfg(feature = "tls-native")]
struct TlsInfo {
    peer_cert: Option<Vec<u8>>,
    #[cfg(any(feature = "gssapi", feature = "ntlm"))]
    endpoint_token: Option<Vec<u8>>,
}

/// Perform the StartTLS exchange on the still-clear stream, before the
/// driver exists. Doing it here makes the critical section trivial: nothing
/// else can possibly be outstanding.
#[cfg(feature = "tls-native")]
async fn starttls_exchange(stream: &mut TcpStream) -> Result<()> {
    let mut codec = LdapCodec::new();
    let mut out = BytesMut::new();
    codec.encode((1, proto::extended_request(StartTls.into()), None), &mut out)?;
    stream.write_all(&out).await?;
    let mut buf = BytesMut::new();
    loop {
        if let Some((id, (op, _controls))) = codec.decode(&mut buf)? {
            if id != 1 {
                return Err(LdapError::UnexpectedResponse(proto::APP_EXTENDED_REQUEST));
            }
            return LdapResult::try_from(op)?.success().map(|_| ());
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(LdapError::from(io::Error::from(
                io::ErrorKind::UnexpectedEof,
            )));
        }
    }
}

#[cfg(feature = "tls-native")]
async fn tls_connect(
    settings: &ConnSettings,
    host: &str,
    tcp: TcpStream,
) -> Result<(TlsStream<TcpStream>, TlsInfo)> {
    let connector = match settings.connector.clone() {
        Some(connector) => connector,
        None => {
            let mut builder = TlsConnector::builder();
            if settings.no_tls_verify {
                builder.danger_accept_invalid_certs(true);
            }
            builder.build()?
        }
    };
    let tls = tokio_native_tls::TlsConnector::from(connector)
        .connect(host, tcp)
        .await?;
    let session = tls.get_ref();
    let peer_cert = match session.peer_certificate() {
        Ok(cert) => cert.and_then(|c| c.to_der().ok()),
        Err(e) => {
            warn!("error reading peer certificate: {}", e);
            None
        }
    };
    // RFC 5929 tls-server-end-point token for SASL channel binding
    #[cfg(any(feature = "gssapi", feature = "ntlm"))]
    let endpoint_token = match session.tls_server_end_point() {
        Ok(token) => token,
        Err(e) => {
            warn!("error computing endpoint token: {}", e);
            None
        }
    };
    Ok((
        tls,
        TlsInfo {
            peer_cert,
            #[cfg(any(feature = "gssapi", feature = "ntlm"))]
            endpoint_token,
        },
    ))
}

/// Asynchronous connection to an LDAP server.
///
/// [`new()`](#method.new) returns the connection paired with an
/// [`Ldap`](struct.Ldap.html) operation handle. The connection must be
/// spawned on the running Tokio executor before the handle is used; the
/// [`drive!`](macro.drive.html) macro does that and logs a warning if the
/// connection ends with an error. Cloned handles multiplex their
/// operations over this single connection, and the connection closes
/// itself when the last handle is dropped.
pub struct Connection {
    ids: Arc<Mutex<MsgIdState>>,
    pending: HashMap<RequestId, ResponseSink>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    stream: Framed<Box<dyn Socket>, LdapCodec>,
    lifecycle: Lifecycle,
}

/// Drive the connection until its completion.
///
/// Spawns the connection on the current executor, logging a terminal
/// error, if any, through the `log` facade.
#[macro_export]
macro_rules! drive {
    ($conn:expr) => {
        $crate::tokio::spawn(async move {
            if let Err(e) = $conn.drive().await {
                $crate::log::warn!("LDAP connection error: {}", e);
            }
        });
    };
}

impl Connection {
    /// Open a connection to the LDAP server at `url`.
    ///
    /// The __ldap__ scheme (default port 389) uses a plain TCP connection,
    /// upgraded in place when StartTLS is requested through the settings.
    /// With the __tls__ feature, the __ldaps__ scheme (default port 636)
    /// negotiates TLS immediately. A base DN in the URL is accepted but
    /// only the host and port are used.
    pub async fn new(url: &str) -> Result<(Self, Ldap)> {
        Self::with_settings(ConnSettings::new(), url).await
    }

    /// As [`new()`](#method.new), with additional connection settings.
    pub async fn with_settings(settings: ConnSettings, url: &str) -> Result<(Self, Ldap)> {
        Self::from_url_with_settings(settings, &Url::parse(url)?).await
    }

    /// Open a connection to an LDAP server specified by an already parsed
    /// `Url`.
    pub async fn from_url(url: &Url) -> Result<(Self, Ldap)> {
        Self::from_url_with_settings(ConnSettings::new(), url).await
    }

    /// As [`from_url()`](#method.from_url), with additional connection
    /// settings.
    pub async fn from_url_with_settings(
        settings: ConnSettings,
        url: &Url,
    ) -> Result<(Self, Ldap)> {
        let timeout = settings.conn_timeout;
        let open = Self::open(settings, url);
        match timeout {
            Some(timeout) => time::timeout(timeout, open).await?,
            None => open.await,
        }
    }

    async fn open(settings: ConnSettings, url: &Url) -> Result<(Self, Ldap)> {
        let (host, port, security) = dial_target(url, &settings)?;
        let tcp = TcpStream::connect((host.as_str(), port)).await?;
        match security {
            Security::Plain => Ok(Self::assemble(Box::new(tcp))),
            #[cfg(feature = "tls-native")]
            Security::Tls { upgrade } => {
                let mut tcp = tcp;
                if upgrade {
                    starttls_exchange(&mut tcp).await?;
                }
                let (tls, info) = tls_connect(&settings, &host, tcp).await?;
                let (conn, mut ldap) = Self::assemble(Box::new(tls));
                ldap.has_tls = true;
                ldap.peer_cert = Arc::new(info.peer_cert);
                #[cfg(any(feature = "gssapi", feature = "ntlm"))]
                {
                    ldap.tls_endpoint_token = Arc::new(info.endpoint_token);
                }
                Ok((conn, ldap))
            }
        }
    }

    fn assemble(socket: Box<dyn Socket>) -> (Connection, Ldap) {
        let codec = LdapCodec::new();
        #[cfg(feature = "gssapi")]
        let sasl_param = codec.sasl_param.clone();
        #[cfg(feature = "gssapi")]
        let client_ctx = codec.client_ctx.clone();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let ids = Arc::new(Mutex::new(MsgIdState::default()));
        let conn = Connection {
            ids: ids.clone(),
            pending: HashMap::new(),
            cmd_rx,
            stream: codec.framed(socket),
            lifecycle: Lifecycle::Open,
        };
        let ldap = Ldap {
            ids,
            cmd_tx,
            last_id: 0,
            peer_cert: Arc::new(None),
            #[cfg(feature = "gssapi")]
            sasl_param,
            #[cfg(feature = "gssapi")]
            client_ctx,
            #[cfg(any(feature = "gssapi", feature = "ntlm"))]
            tls_endpoint_token: Arc::new(None),
            has_tls: false,
            timeout: None,
            controls: None,
            search_opts: None,
        };
        (conn, ldap)
    }

    /// Serve the connection until it terminates. Whatever the outcome,
    /// every still-pending request is failed by dropping its sink, so
    /// waiting callers observe a closed channel.
    pub async fn drive(mut self) -> Result<()> {
        let outcome = self.serve().await;
        self.fail_pending();
        outcome
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.apply(cmd).await?,
                    None => {
                        // the last handle is gone
                        self.shut_link().await;
                        return Ok(());
                    }
                },
                frame = self.stream.next() => match frame {
                    Some(Ok((id, (op, controls)))) => self.dispatch(id, op, controls).await,
                    Some(Err(e)) => {
                        warn!("socket receive error: {}", e);
                        return Err(LdapError::from(e));
                    }
                    None => {
                        return if self.lifecycle == Lifecycle::Closing {
                            Ok(())
                        } else {
                            warn!("server closed the connection");
                            Err(LdapError::from(io::Error::from(
                                io::ErrorKind::UnexpectedEof,
                            )))
                        };
                    }
                },
            }
        }
    }

    async fn apply(&mut self, cmd: Command) -> Result<()> {
        match cmd {
            Command::Run(op) => {
                if self.lifecycle != Lifecycle::Open {
                    // dropping the sink tells the caller the link is gone
                    return Ok(());
                }
                let id = op.id;
                self.pending.insert(id, op.sink);
                if let Err(e) = self.stream.send((id, op.body, op.controls)).await {
                    warn!("socket send error: {}", e);
                    return Err(LdapError::from(e));
                }
            }
            Command::Fire(notice) => {
                if self.lifecycle == Lifecycle::Open {
                    if let Err(e) = self
                        .stream
                        .send((notice.id, notice.body, notice.controls))
                        .await
                    {
                        warn!("socket send error: {}", e);
                        return Err(LdapError::from(e));
                    }
                }
                self.release_id(notice.id);
                if notice.shutdown {
                    self.shut_link().await;
                }
                let _ = notice.done.send(());
            }
            Command::Finish(id) => {
                self.pending.remove(&id);
                self.release_id(id);
            }
        }
        Ok(())
    }

    /// Route one incoming frame to the sink registered under its id.
    async fn dispatch(&mut self, id: RequestId, op: Tag, controls: Vec<Control>) {
        let streaming = match self.pending.get(&id) {
            None => {
                debug!("dropping frame for unknown id {}", id);
                return;
            }
            Some(ResponseSink::Once(_)) => false,
            Some(ResponseSink::Stream(_)) => true,
        };
        if !streaming {
            if let Some(ResponseSink::Once(tx)) = self.pending.remove(&id) {
                if tx.send((op, controls)).is_err() {
                    debug!("result receiver gone, id {}", id);
                }
            }
            self.release_id(id);
            return;
        }
        let protoop = match op {
            Tag::StructureTag(protoop) => protoop,
            _ => {
                warn!("demux: non-structural frame for id {}", id);
                return;
            }
        };
        let (item, last) = match protoop.id {
            proto::APP_SEARCH_ENTRY | proto::APP_INTERMEDIATE_RESPONSE => {
                (SearchItem::Entry(protoop), false)
            }
            proto::APP_SEARCH_REFERRAL => (SearchItem::Referral(protoop), false),
            proto::APP_SEARCH_DONE => match LdapResult::try_from(Tag::StructureTag(protoop)) {
                Ok(res) => (SearchItem::Done(res), true),
                Err(_) => {
                    warn!("demux: malformed search done, id {}", id);
                    return;
                }
            },
            other => {
                warn!("demux: unexpected tag {} in search stream, id {}", other, id);
                return;
            }
        };
        let dead = match self.pending.get_mut(&id) {
            Some(ResponseSink::Stream(tx)) => tx.send((item, controls)).await.is_err(),
            _ => return,
        };
        if last || dead {
            self.pending.remove(&id);
            self.release_id(id);
        }
    }

    async fn shut_link(&mut self) {
        if let Err(e) = self.stream.get_mut().shutdown().await {
            debug!("socket shutdown error: {}", e);
        }
        self.lifecycle = Lifecycle::Closing;
    }

    fn release_id(&mut self, id: RequestId) {
        let mut ids = self.ids.lock().expect("id mutex (release)");
        ids.in_flight.remove(&id);
    }

    fn fail_pending(&mut self) {
        let mut ids = self.ids.lock().expect("id mutex (fail)");
        for (id, _sink) in self.pending.drain() {
            ids.in_flight.remove(&id);
        }
        self.lifecycle = Lifecycle::Closed;
    }
}
