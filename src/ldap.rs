use std::collections::HashSet;
use std::hash::Hash;
#[cfg(feature = "gssapi")]
use std::sync::RwLock;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[cfg(feature = "gssapi")]
use crate::codec::SaslParams;
use crate::conn::{Command, MsgIdState, Notice, Operation, ResponseSink, STREAM_QUEUE};
use crate::controls_impl::{self, Control, IntoRawControlVec, PagedResults, RawControl};
use crate::digest_md5;
use crate::exop::Exop;
use crate::proto;
use crate::result::{
    CompareResult, ExopResult, LdapError, LdapResult, LdapResultExt, Result, SearchResult,
};
use crate::search::{Scope, SearchItem, SearchOptions, SearchStream};
use crate::RequestId;

use lber::structures::Tag;

#[cfg(feature = "gssapi")]
use cross_krb5::{ClientCtx, Cred, InitiateFlags, K5Ctx, Step};
use tokio::sync::{mpsc, oneshot};
use tokio::time;

/// Server-supplied SASL credentials from a bind response.
#[allow(dead_code)]
#[derive(Clone, Debug)]
pub(crate) struct SaslCreds(pub Option<Vec<u8>>);

const SASL_BIND_IN_PROGRESS: u32 = 14;

/// Possible sub-operations for the Modify operation.
#[derive(Clone, Debug, PartialEq)]
pub enum Mod<S: AsRef<[u8]> + Eq + Hash> {
    /// Add an attribute, with at least one value.
    Add(S, HashSet<S>),
    /// Delete the entire attribute, or the given values of an attribute.
    Delete(S, HashSet<S>),
    /// Replace an existing attribute, setting its values to those in the set,
    /// or delete it if no values are given.
    Replace(S, HashSet<S>),
    /// Increment the attribute by the given value (RFC 4525).
    Increment(S, S),
}

/// Asynchronous handle for LDAP operations.
///
/// An operation optionally takes request controls
/// ([`with_controls()`](#method.with_controls)), a network timeout
/// ([`with_timeout()`](#method.with_timeout)), and, for Search, the less
/// frequently used request fields bundled in
/// [`SearchOptions`](struct.SearchOptions.html)
/// ([`with_search_options()`](#method.with_search_options)). The modifiers
/// apply to the next invoked operation only.
///
/// Search exists in three shapes: [`search()`](#method.search) accumulates
/// the whole result set, [`streaming_search()`](#method.streaming_search)
/// hands out entries one by one through a
/// [`SearchStream`](struct.SearchStream.html), and
/// [`search_with_paging()`](#method.search_with_paging) drives the Paged
/// Results cookie loop across as many protocol searches as the server
/// needs.
///
/// Operations return [`LdapResult`](result/struct.LdapResult.html), whose
/// numeric result code carries the outcome; `success()` and `non_error()`
/// convert error codes into `LdapError`. The handle is cheaply cloneable,
/// and every clone multiplexes its operations over the same connection.
/// Dropping the last handle closes the connection.
#[derive(Debug)]
pub struct Ldap {
    pub(crate) ids: Arc<Mutex<MsgIdState>>,
    pub(crate) cmd_tx: mpsc::UnboundedSender<Command>,
    pub(crate) last_id: RequestId,
    pub(crate) peer_cert: Arc<Option<Vec<u8>>>,
    #[cfg(feature = "gssapi")]
    pub(crate) sasl_param: Arc<RwLock<SaslParams>>,
    #[cfg(feature = "gssapi")]
    pub(crate) client_ctx: Arc<Mutex<Option<ClientCtx>>>,
    #[cfg(any(feature = "gssapi", feature = "ntlm"))]
    pub(crate) tls_endpoint_token: Arc<Option<Vec<u8>>>,
    pub(crate) has_tls: bool,
    pub timeout: Option<Duration>,
    pub controls: Option<Vec<RawControl>>,
    pub search_opts: Option<SearchOptions>,
}

impl Clone for Ldap {
    fn clone(&self) -> Self {
        Ldap {
            ids: self.ids.clone(),
            cmd_tx: self.cmd_tx.clone(),
            last_id: 0,
            peer_cert: self.peer_cert.clone(),
            #[cfg(feature = "gssapi")]
            sasl_param: self.sasl_param.clone(),
            #[cfg(feature = "gssapi")]
            client_ctx: self.client_ctx.clone(),
            #[cfg(any(feature = "gssapi", feature = "ntlm"))]
            tls_endpoint_token: self.tls_endpoint_token.clone(),
            has_tls: self.has_tls,
            timeout: None,
            controls: None,
            search_opts: None,
        }
    }
}

#[cfg(feature = "gssapi")]
enum GssapiCred {
    Default,
    Supplied(Cred),
}

impl Ldap {
    /// Assign the next message ID. Message ID zero is reserved; a
    /// wrapped-around counter skips the IDs of still-outstanding operations.
    fn next_msgid(&mut self) -> RequestId {
        let mut ids = self.ids.lock().expect("id mutex (assign)");
        let prev_id = ids.last_id;
        let mut next_id = prev_id;
        loop {
            if next_id == i32::MAX {
                next_id = 1;
            } else {
                next_id += 1;
            }
            if !ids.in_flight.contains(&next_id) {
                break;
            }
            assert_ne!(
                next_id, prev_id,
                "LDAP message id wraparound with no free slots"
            );
        }
        ids.last_id = next_id;
        ids.in_flight.insert(next_id);
        next_id
    }

    /// Run one single-response operation to completion.
    pub(crate) async fn op_call(&mut self, body: Tag) -> Result<(LdapResult, Exop, SaslCreds)> {
        let id = self.next_msgid();
        self.last_id = id;
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Run(Operation {
            id,
            body,
            controls: self.controls.take(),
            sink: ResponseSink::Once(tx),
        }))?;
        let (op, controls) = match self.timeout.take() {
            Some(timeout) => match time::timeout(timeout, rx).await {
                Ok(response) => response?,
                Err(elapsed) => {
                    self.finish_op(id);
                    return Err(LdapError::from(elapsed));
                }
            },
            None => rx.await?,
        };
        let LdapResultExt(mut result, exop, sasl_creds) = LdapResultExt::try_from(op)?;
        result.ctrls = controls;
        Ok((result, exop, sasl_creds))
    }

    /// Register a search and return the message ID with the bounded queue
    /// its responses arrive on.
    #[allow(clippy::type_complexity)]
    pub(crate) fn issue_search(
        &mut self,
        body: Tag,
    ) -> Result<(RequestId, mpsc::Receiver<(SearchItem, Vec<Control>)>)> {
        let id = self.next_msgid();
        self.last_id = id;
        let (tx, rx) = mpsc::channel(STREAM_QUEUE);
        self.cmd_tx.send(Command::Run(Operation {
            id,
            body,
            controls: self.controls.take(),
            sink: ResponseSink::Stream(tx),
        }))?;
        Ok((id, rx))
    }

    /// Release the pending slot of the given message ID, best-effort.
    pub(crate) fn finish_op(&self, id: RequestId) {
        let _ = self.cmd_tx.send(Command::Finish(id));
    }

    /// Use the provided `SearchOptions` with the next Search operation,
    /// which can be invoked directly on the result of this method. When
    /// combined with a non-Search operation, the options are silently
    /// discarded.
    pub fn with_search_options(&mut self, opts: SearchOptions) -> &mut Self {
        self.search_opts = Some(opts);
        self
    }

    /// Pass the provided request control(s) to the next LDAP operation.
    /// The method accepts a control vector, or a single control wherever
    /// its type converts into [`RawControl`](controls/struct.RawControl.html).
    pub fn with_controls<V: IntoRawControlVec>(&mut self, ctrls: V) -> &mut Self {
        self.controls = Some(ctrls.into());
        self
    }

    /// Perform the next operation with the given network timeout. For
    /// Search, the timer restarts for every entry of the result stream.
    /// A timed out operation fails, but the connection remains usable.
    pub fn with_timeout(&mut self, duration: Duration) -> &mut Self {
        self.timeout = Some(duration);
        self
    }

    /// Do a simple Bind with the provided DN (`bind_dn`) and password
    /// (`bind_pw`).
    ///
    /// An empty password is rejected locally: accidentally passing one would
    /// otherwise turn the operation into an Unauthenticated Bind, which
    /// servers following RFC 4513 treat as anonymous. Use
    /// [`unauthenticated_bind()`](#method.unauthenticated_bind) when that
    /// behavior is actually wanted.
    pub async fn simple_bind(&mut self, bind_dn: &str, bind_pw: &str) -> Result<LdapResult> {
        if bind_pw.is_empty() {
            return Err(LdapError::EmptyPassword);
        }
        let req = proto::simple_bind_request(bind_dn, bind_pw);
        Ok(self.op_call(req).await?.0)
    }

    /// Do an Unauthenticated Bind (RFC 4513, §5.1.2) with the provided DN:
    /// a name is supplied, but no password. Meant for logging the identity
    /// of a client which the server will nevertheless treat as anonymous.
    pub async fn unauthenticated_bind(&mut self, bind_dn: &str) -> Result<LdapResult> {
        let req = proto::simple_bind_request(bind_dn, "");
        Ok(self.op_call(req).await?.0)
    }

    /// Do an SASL EXTERNAL bind on the connection. The identity of the
    /// client must have already been established by transport-level means,
    /// as with a TLS client certificate. The bind is made with the
    /// hardcoded empty authzId value.
    pub async fn sasl_external_bind(&mut self) -> Result<LdapResult> {
        let req = proto::sasl_bind_request("EXTERNAL", Some(b""));
        Ok(self.op_call(req).await?.0)
    }

    /// Do an SASL DIGEST-MD5 bind (RFC 2831) with the given username and
    /// password. `server_host` names the host part of the digest URI,
    /// `ldap/<server_host>`.
    ///
    /// The mechanism is obsolete and is implemented for interoperability
    /// with servers which still offer it; only the `auth` quality of
    /// protection is supported, so the connection itself remains in the
    /// clear unless TLS is used.
    pub async fn sasl_digest_md5_bind(
        &mut self,
        username: &str,
        password: &str,
        server_host: &str,
    ) -> Result<LdapResult> {
        let req = proto::sasl_bind_request("DIGEST-MD5", None);
        let (res, _, creds) = self.op_call(req).await?;
        if res.rc != SASL_BIND_IN_PROGRESS {
            return Ok(res);
        }
        let challenge = creds.0.ok_or(LdapError::NoSaslChallenge)?;
        let response = digest_md5::challenge_response(&challenge, username, password, server_host)?;
        let req = proto::sasl_bind_request("DIGEST-MD5", Some(response.as_bytes()));
        Ok(self.op_call(req).await?.0)
    }

    #[cfg(any(feature = "gssapi", feature = "ntlm"))]
    fn channel_binding_token(&self) -> Option<Vec<u8>> {
        if !self.has_tls {
            return None;
        }
        self.tls_endpoint_token.as_ref().as_ref().map(|token| {
            let mut cbt = Vec::from(&b"tls-server-end-point:"[..]);
            cbt.extend(token);
            cbt
        })
    }

    #[cfg_attr(docsrs, doc(cfg(feature = "gssapi")))]
    #[cfg(feature = "gssapi")]
    /// Do an SASL GSSAPI bind on the connection, using the default Kerberos
    /// credentials for the current user and `server_fqdn` for the LDAP
    /// server SPN. On a clear connection, the Kerberos confidentiality
    /// security layer is requested and installed; on TLS, Kerberos only
    /// authenticates and the __tls-server-end-point__ channel binding token
    /// is supplied when available.
    ///
    /// The underlying GSSAPI libraries issue blocking filesystem and
    /// network calls when querying the ticket cache or the Kerberos
    /// servers, so the method is ill-suited to heavily concurrent contexts
    /// with frequent Bind operations.
    pub async fn sasl_gssapi_bind(&mut self, server_fqdn: &str) -> Result<LdapResult> {
        self.gssapi_bind(server_fqdn, GssapiCred::Default).await
    }

    #[cfg_attr(docsrs, doc(cfg(feature = "gssapi")))]
    #[cfg(feature = "gssapi")]
    /// As [`sasl_gssapi_bind()`](#method.sasl_gssapi_bind) (q.v.), with
    /// explicitly supplied GSSAPI credentials.
    pub async fn sasl_gssapi_cred_bind(
        &mut self,
        cred: Cred,
        server_fqdn: &str,
    ) -> Result<LdapResult> {
        self.gssapi_bind(server_fqdn, GssapiCred::Supplied(cred))
            .await
    }

    /// The three-step GSSAPI exchange: send the initiator token, finish
    /// context establishment with the acceptor token, then agree on the
    /// security layer inside a GSS-wrapped final round.
    #[cfg(feature = "gssapi")]
    async fn gssapi_bind(&mut self, server_fqdn: &str, cred: GssapiCred) -> Result<LdapResult> {
        const SECLAYER_NONE: u8 = 1;
        const SECLAYER_CONF: u8 = 4;

        use either::Either;

        fn gss_err(e: impl std::fmt::Display) -> LdapError {
            LdapError::GssapiOperationError(format!("{:#}", e))
        }

        let spn = format!("ldap/{}", server_fqdn);
        let cbt = self.channel_binding_token();
        let initiated = match cred {
            GssapiCred::Default => Either::Left(
                ClientCtx::new(InitiateFlags::empty(), None, &spn, cbt.as_deref())
                    .map_err(|e| gss_err(e))?,
            ),
            GssapiCred::Supplied(cred) => Either::Right(
                ClientCtx::new_with_cred(cred, &spn, cbt.as_deref()).map_err(|e| gss_err(e))?,
            ),
        };
        let (pending_ctx, first_token) = match initiated {
            Either::Left((ctx, token)) => (ctx, Either::Left(token)),
            Either::Right((ctx, token)) => (ctx, Either::Right(token)),
        };
        let first_token = match first_token {
            Either::Left(ref t) => t.as_ref(),
            Either::Right(ref t) => t.as_ref(),
        };

        // step 1: initiator token
        let ans = self
            .op_call(proto::sasl_bind_request("GSSAPI", Some(first_token)))
            .await?;
        if ans.0.rc != SASL_BIND_IN_PROGRESS {
            return Ok(ans.0);
        }
        let acceptor_token = (ans.2).0.ok_or(LdapError::NoSaslChallenge)?;

        // step 2: consume the acceptor token; context must be complete
        let mut ctx = match pending_ctx.step(&acceptor_token).map_err(|e| gss_err(e))? {
            Step::Finished((ctx, None)) => ctx,
            _ => {
                return Err(gss_err(
                    "GSSAPI exchange not finished or has an additional token",
                ))
            }
        };
        let ans = self.op_call(proto::sasl_bind_request("GSSAPI", None)).await?;
        if ans.0.rc != SASL_BIND_IN_PROGRESS {
            return Ok(ans.0);
        }
        let layer_token = (ans.2).0.ok_or(LdapError::NoSaslChallenge)?;

        // step 3: pick the security layer offered by the server
        let mut layer_bytes = ctx.unwrap(&layer_token).map_err(|e| gss_err(e))?;
        let needed_layer = if self.has_tls {
            SECLAYER_NONE
        } else {
            SECLAYER_CONF
        };
        if layer_bytes[0] | needed_layer == 0 {
            return Err(gss_err(format!(
                "no appropriate security layer offered: needed {}, mask {}",
                needed_layer, layer_bytes[0]
            )));
        }
        // FIXME: the max_size constant is taken from OpenLDAP GSSAPI code as
        // a fallback value for broken GSSAPI libraries. It's meant to serve
        // as a safe value until a gss_wrap_size_limit() equivalent is
        // available in cross-krb5.
        let recv_max_size = (0x9FFFB8u32 | (needed_layer as u32) << 24).to_be_bytes();
        let size_msg = ctx.wrap(true, &recv_max_size).map_err(|e| gss_err(e))?;
        let res = self
            .op_call(proto::sasl_bind_request("GSSAPI", Some(&size_msg)))
            .await?
            .0;
        if res.rc == 0 {
            if needed_layer == SECLAYER_CONF {
                layer_bytes[0] = 0;
                let max_send =
                    u32::from_be_bytes((&layer_bytes[..]).try_into().expect("send max size"));
                if max_send == 0 {
                    warn!("got zero send_max_size, will be treated as unlimited");
                }
                let mut sasl_param = self.sasl_param.write().expect("sasl params");
                sasl_param.wrap = true;
                sasl_param.max_send = max_send;
            }
            self.client_ctx
                .lock()
                .expect("client ctx lock")
                .replace(ctx);
        }
        Ok(res)
    }

    #[cfg_attr(docsrs, doc(cfg(feature = "ntlm")))]
    #[cfg(feature = "ntlm")]
    /// Do an SASL GSS-SPNEGO bind with an NTLMSSP exchange on the
    /// connection. Username and password must be provided, since the method
    /// is incapable of retrieving the credentials associated with the login
    /// session (which would only work on Windows anyway.) To specify the
    /// domain, incorporate it into the username, using the `DOMAIN\user` or
    /// `user@DOMAIN` format.
    ///
    /// __Caveat:__ the connection cannot be encrypted by NTLM "sealing".
    /// For encryption, use TLS. A channel binding token is automatically
    /// sent on a TLS connection, if possible.
    pub async fn sasl_ntlm_bind(&mut self, username: &str, password: &str) -> Result<LdapResult> {
        use sspi::{
            builders::AcquireCredentialsHandleResult, AuthIdentity, AuthIdentityBuffers,
            BufferType, ClientRequestFlags, CredentialUse, DataRepresentation, Ntlm,
            SecurityBuffer, SecurityStatus, Sspi, SspiImpl, Username,
        };

        fn ntlm_step(
            ntlm: &mut Ntlm,
            acq_creds: &mut AcquireCredentialsHandleResult<Option<AuthIdentityBuffers>>,
            input: &[u8],
        ) -> Result<Vec<u8>> {
            let mut input = vec![SecurityBuffer::new(input.to_vec(), BufferType::Token)];
            let mut output = vec![SecurityBuffer::new(Vec::new(), BufferType::Token)];
            let mut builder = ntlm
                .initialize_security_context()
                .with_credentials_handle(&mut acq_creds.credentials_handle)
                .with_context_requirements(ClientRequestFlags::ALLOCATE_MEMORY)
                .with_target_data_representation(DataRepresentation::Native)
                .with_input(&mut input)
                .with_output(&mut output);
            let result = ntlm
                .initialize_security_context_impl(&mut builder)?
                .resolve_to_result()?;
            match result.status {
                SecurityStatus::CompleteNeeded | SecurityStatus::CompleteAndContinue => {
                    ntlm.complete_auth_token(&mut output)?
                }
                s => s,
            };
            Ok(output.swap_remove(0).buffer)
        }

        let mut ntlm = Ntlm::new();
        let identity = AuthIdentity {
            username: Username::parse(username).map_err(|e| LdapError::SSPIError { source: e })?,
            password: password.to_string().into(),
        };
        let mut acq_creds = ntlm
            .acquire_credentials_handle()
            .with_credential_use(CredentialUse::Outbound)
            .with_auth_data(&identity)
            .execute(&mut ntlm)?;
        // NEGOTIATE
        let negotiate = ntlm_step(&mut ntlm, &mut acq_creds, &[])?;
        let (res, _, token) = self
            .op_call(proto::sasl_bind_request("GSS-SPNEGO", Some(&negotiate)))
            .await?;
        if res.rc != SASL_BIND_IN_PROGRESS {
            return Ok(res);
        }
        let challenge = token.0.ok_or(LdapError::NoSaslChallenge)?;
        if let Some(cbt) = self.channel_binding_token() {
            ntlm.set_channel_bindings(&cbt);
        }
        // AUTHENTICATE
        let authenticate = ntlm_step(&mut ntlm, &mut acq_creds, &challenge)?;
        Ok(self
            .op_call(proto::sasl_bind_request("GSS-SPNEGO", Some(&authenticate)))
            .await?
            .0)
    }

    /// Perform a Search with the given base DN (`base`), scope, filter, and
    /// the list of attributes to be returned (`attrs`). If `attrs` is empty,
    /// or if it contains a special name `*` (asterisk), return all (user)
    /// attributes. Requesting a special name `+` (plus sign) will return all
    /// operational attributes. Include both `*` and `+` in order to return
    /// all attributes of an entry.
    ///
    /// The returned structure wraps the vector of result entries and the
    /// overall result of the operation. Entries are not directly usable, and
    /// must be parsed by
    /// [`SearchEntry::construct()`](struct.SearchEntry.html#method.construct).
    /// All referrals in the result stream will be collected in the `refs`
    /// vector of the operation result. Any intermediate messages will be
    /// discarded.
    ///
    /// This method should be used if it's known that the result set won't be
    /// large. For other situations, one can use
    /// [`streaming_search()`](#method.streaming_search).
    pub async fn search<S: AsRef<str> + Send + Sync>(
        &mut self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: impl AsRef<[S]> + Send + Sync,
    ) -> Result<SearchResult> {
        let mut stream = self.streaming_search(base, scope, filter, attrs).await?;
        let mut re_vec = vec![];
        let mut refs = vec![];
        while let Some(entry) = stream.next().await? {
            if entry.is_intermediate() {
                continue;
            }
            if entry.is_ref() {
                refs.extend(crate::search::parse_refs(entry.0));
                continue;
            }
            re_vec.push(entry);
        }
        let mut res = stream.finish().await;
        res.refs.extend(refs);
        Ok(SearchResult(re_vec, res))
    }

    /// Perform a Search, but unlike [`search()`](#method.search) (q.v., also
    /// for the parameters), which returns all results at once, return a
    /// handle which will be used for retrieving entries one by one. See
    /// [`SearchStream`](struct.SearchStream.html) for the protocol which
    /// must be adhered to in this case.
    pub async fn streaming_search<S: AsRef<str> + Send + Sync, A: AsRef<[S]> + Send + Sync>(
        &mut self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: A,
    ) -> Result<SearchStream> {
        let mut ldap = self.clone();
        ldap.controls = self.controls.take();
        ldap.timeout = self.timeout.take();
        ldap.search_opts = self.search_opts.take();
        SearchStream::issue(ldap, base, scope, filter, attrs.as_ref())
    }

    /// Perform a Search with the Paged Results control (RFC 2696), issuing
    /// successive Search requests of at most `page_size` entries until the
    /// server returns an empty cookie or omits the control. Entries of all
    /// pages are accumulated into the returned
    /// [`SearchResult`](result/struct.SearchResult.html), whose result part
    /// comes from the final protocol operation.
    ///
    /// Controls given through [`with_controls()`](#method.with_controls) are
    /// attached to every page's request, alongside the paging control. If a
    /// page fails, a best-effort request with a zero page size and the last
    /// cookie is sent to release the search state on the server, and the
    /// error is returned.
    pub async fn search_with_paging<S: AsRef<str> + Clone + Send + Sync>(
        &mut self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: Vec<S>,
        page_size: i32,
    ) -> Result<SearchResult> {
        let user_controls = self.controls.take();
        let user_opts = self.search_opts.take();
        let timeout = self.timeout.take();
        let mut entries = vec![];
        let mut refs = vec![];
        let mut cookie = Vec::new();
        loop {
            let mut page_controls: Vec<RawControl> = user_controls.clone().unwrap_or_default();
            page_controls.push(std::convert::Into::into(PagedResults {
                size: page_size,
                cookie: cookie.clone(),
            }));
            self.controls = Some(page_controls);
            self.search_opts = user_opts.clone();
            self.timeout = timeout;
            let page = self.search(base, scope, filter, attrs.as_slice()).await;
            let SearchResult(page_entries, res) = match page {
                Ok(sr) => sr,
                Err(e) => {
                    self.release_paged(base, scope, filter, &attrs, &cookie).await;
                    return Err(e);
                }
            };
            if res.rc != 0 {
                self.release_paged(base, scope, filter, &attrs, &cookie).await;
                return Ok(SearchResult(entries, res));
            }
            entries.extend(page_entries);
            refs.extend(res.refs.iter().cloned());
            match paging_cookie(&res) {
                Some(next) if !next.is_empty() => cookie = next,
                _ => {
                    let mut res = res;
                    res.refs = refs;
                    return Ok(SearchResult(entries, res));
                }
            }
        }
    }

    /// Best-effort release of server-side paged search state.
    async fn release_paged<S: AsRef<str> + Send + Sync>(
        &mut self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: &[S],
        cookie: &[u8],
    ) {
        if cookie.is_empty() {
            return;
        }
        self.controls = Some(IntoRawControlVec::into(PagedResults {
            size: 0,
            cookie: Vec::from(cookie),
        }));
        if let Err(e) = self.search(base, scope, filter, attrs).await {
            debug!("paged search release error: {}", e);
        }
    }

    /// Add an entry named by `dn`, with the list of attributes and their
    /// values given in `attrs`. None of the `HashSet`s of values for an
    /// attribute may be empty.
    pub async fn add<S: AsRef<[u8]> + Eq + Hash>(
        &mut self,
        dn: &str,
        attrs: Vec<(S, HashSet<S>)>,
    ) -> Result<LdapResult> {
        let req = proto::add_request(dn, attrs)?;
        Ok(self.op_call(req).await?.0)
    }

    /// Compare the value(s) of the attribute `attr` within an entry named by
    /// `dn` with the value `val`. The boolean outcome is obtained by calling
    /// [`equal()`](result/struct.CompareResult.html#method.equal) on the
    /// result: result code 6 (`compareTrue`) maps to `true`, 5
    /// (`compareFalse`) to `false`, and any other code to an error.
    pub async fn compare<B: AsRef<[u8]>>(
        &mut self,
        dn: &str,
        attr: &str,
        val: B,
    ) -> Result<CompareResult> {
        let req = proto::compare_request(dn, attr, val.as_ref());
        Ok(CompareResult(self.op_call(req).await?.0))
    }

    /// Delete an entry named by `dn`.
    pub async fn delete(&mut self, dn: &str) -> Result<LdapResult> {
        let req = proto::delete_request(dn);
        Ok(self.op_call(req).await?.0)
    }

    /// Modify an entry named by `dn` by sequentially applying the
    /// modifications given by `mods`. See the [`Mod`](enum.Mod.html)
    /// documentation for the description of possible values. An empty
    /// change list is a valid no-op.
    pub async fn modify<S: AsRef<[u8]> + Eq + Hash>(
        &mut self,
        dn: &str,
        mods: Vec<Mod<S>>,
    ) -> Result<LdapResult> {
        let req = proto::modify_request(dn, mods)?;
        Ok(self.op_call(req).await?.0)
    }

    /// Rename and/or move an entry named by `dn`. The new name is given by
    /// `rdn`. If `delete_old` is `true`, delete the previous value of the
    /// naming attribute from the entry. If the entry is to be moved
    /// elsewhere in the DIT, `new_sup` gives the new superior entry where
    /// the moved entry will be anchored.
    pub async fn modifydn(
        &mut self,
        dn: &str,
        rdn: &str,
        delete_old: bool,
        new_sup: Option<&str>,
    ) -> Result<LdapResult> {
        let req = proto::modify_dn_request(dn, rdn, delete_old, new_sup);
        Ok(self.op_call(req).await?.0)
    }

    /// Perform an Extended operation given by `exop`. Extended operations
    /// are defined in the [`exop`](exop/index.html) module. See the
    /// module-level documentation for the list of extended operations
    /// supported by this library and procedures for defining custom exops.
    pub async fn extended<E>(&mut self, exop: E) -> Result<ExopResult>
    where
        E: Into<Exop>,
    {
        let req = proto::extended_request(exop.into());
        self.op_call(req)
            .await
            .map(|(result, exop, _)| ExopResult(exop, result))
    }

    /// Terminate the connection to the server. The Unbind request never
    /// generates a response, and calling this method again after the
    /// connection is gone is a no-op.
    pub async fn unbind(&mut self) -> Result<()> {
        if self.cmd_tx.is_closed() {
            return Ok(());
        }
        let id = self.next_msgid();
        self.last_id = id;
        let (tx, rx) = oneshot::channel();
        let sent = self.cmd_tx.send(Command::Fire(Notice {
            id,
            body: proto::unbind_request(),
            controls: self.controls.take(),
            shutdown: true,
            done: tx,
        }));
        if sent.is_ok() {
            // the ack may be lost if the driver dies first; Unbind is
            // best-effort either way
            let _ = rx.await;
        }
        Ok(())
    }

    /// Return the message ID of the last operation issued through this
    /// handle, zero if there was none. The intended use is to obtain the ID
    /// of a timed out operation for passing it to
    /// [`abandon()`](#method.abandon).
    pub fn last_id(&mut self) -> RequestId {
        self.last_id
    }

    /// Ask the server to abandon an operation identified by `msgid`.
    /// Abandon is fire-and-forget: no response is generated on the server,
    /// and the pending slot of the target operation is released locally, so
    /// late arrivals bearing the abandoned ID are dropped.
    pub async fn abandon(&mut self, msgid: RequestId) -> Result<()> {
        self.finish_op(msgid);
        let id = self.next_msgid();
        self.last_id = id;
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Fire(Notice {
            id,
            body: proto::abandon_request(msgid),
            controls: self.controls.take(),
            shutdown: false,
            done: tx,
        }))?;
        Ok(rx.await?)
    }

    /// Check whether the underlying connection has been closed.
    ///
    /// This is an indirect check: it queries the status of the command
    /// channel to the connection driver, not the socket itself. An open
    /// channel does not prove the server is reachable; for that, a
    /// round-trip operation (e.g., `WhoAmI`) would be necessary.
    pub fn is_closed(&mut self) -> bool {
        self.cmd_tx.is_closed()
    }

    /// Return the TLS peer certificate in DER format, captured when the
    /// connection was established. `None` on connections without TLS, or
    /// when the certificate could not be obtained.
    pub fn peer_certificate(&self) -> Option<Vec<u8>> {
        self.peer_cert.as_ref().clone()
    }
}

fn paging_cookie(res: &LdapResult) -> Option<Vec<u8>> {
    for ctrl in &res.ctrls {
        if ctrl.1.ctype == controls_impl::PAGED_RESULTS_OID && ctrl.1.val.is_some() {
            return Some(ctrl.1.parse::<PagedResults>().cookie);
        }
    }
    None
}
