//! Blocking API, a thin shell around the async interface.
//!
//! [`LdapConn`](struct.LdapConn.html) owns a single-threaded Tokio runtime
//! together with the driven connection and an operation handle; every
//! method simply blocks on its async counterpart. Unlike
//! [`Ldap`](struct.Ldap.html), the blocking handle is not cloneable: a
//! second handle means a second connection.

use std::collections::HashSet;
use std::hash::Hash;
use std::time::Duration;

use crate::conn::{ConnSettings, Connection};
use crate::controls_impl::IntoRawControlVec;
use crate::exop::Exop;
use crate::ldap::{Ldap, Mod};
use crate::result::{CompareResult, ExopResult, LdapResult, Result, SearchResult};
use crate::search::{ResultEntry, Scope, SearchOptions, SearchStream};
use crate::RequestId;
#[cfg(feature = "gssapi")]
use cross_krb5::Cred;

use tokio::runtime::{self, Runtime};
use url::Url;

/// Synchronous connection to an LDAP server. See the module documentation.
#[cfg_attr(docsrs, doc(cfg(feature = "sync")))]
#[derive(Debug)]
pub struct LdapConn {
    rt: Runtime,
    ldap: Ldap,
}

impl LdapConn {
    /// Open a connection to the LDAP server at `url`. See
    /// [Connection::new()](struct.Connection.html#method.new) for the
    /// supported URL forms.
    pub fn new(url: &str) -> Result<Self> {
        Self::with_settings(ConnSettings::new(), url)
    }

    /// As [`new()`](#method.new), with additional connection settings.
    pub fn with_settings(settings: ConnSettings, url: &str) -> Result<Self> {
        Self::from_url_with_settings(settings, &Url::parse(url)?)
    }

    /// Open a connection to an LDAP server specified by an already parsed
    /// `Url`.
    pub fn from_url(url: &Url) -> Result<Self> {
        Self::from_url_with_settings(ConnSettings::new(), url)
    }

    /// As [`from_url()`](#method.from_url), with additional connection
    /// settings.
    pub fn from_url_with_settings(settings: ConnSettings, url: &Url) -> Result<Self> {
        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let ldap = rt.block_on(async {
            let (conn, ldap) = Connection::from_url_with_settings(settings, url).await?;
            super::drive!(conn);
            Ok::<_, crate::LdapError>(ldap)
        })?;
        Ok(LdapConn { rt, ldap })
    }

    /// See [`Ldap::with_search_options()`](struct.Ldap.html#method.with_search_options).
    pub fn with_search_options(&mut self, opts: SearchOptions) -> &mut Self {
        self.ldap.with_search_options(opts);
        self
    }

    /// See [`Ldap::with_controls()`](struct.Ldap.html#method.with_controls).
    pub fn with_controls<V: IntoRawControlVec>(&mut self, ctrls: V) -> &mut Self {
        self.ldap.with_controls(ctrls);
        self
    }

    /// See [`Ldap::with_timeout()`](struct.Ldap.html#method.with_timeout).
    pub fn with_timeout(&mut self, duration: Duration) -> &mut Self {
        self.ldap.with_timeout(duration);
        self
    }

    /// See [`Ldap::simple_bind()`](struct.Ldap.html#method.simple_bind).
    pub fn simple_bind(&mut self, bind_dn: &str, bind_pw: &str) -> Result<LdapResult> {
        self.rt.block_on(self.ldap.simple_bind(bind_dn, bind_pw))
    }

    /// See [`Ldap::unauthenticated_bind()`](struct.Ldap.html#method.unauthenticated_bind).
    pub fn unauthenticated_bind(&mut self, bind_dn: &str) -> Result<LdapResult> {
        self.rt.block_on(self.ldap.unauthenticated_bind(bind_dn))
    }

    /// See [`Ldap::sasl_external_bind()`](struct.Ldap.html#method.sasl_external_bind).
    pub fn sasl_external_bind(&mut self) -> Result<LdapResult> {
        self.rt.block_on(self.ldap.sasl_external_bind())
    }

    /// See [`Ldap::sasl_digest_md5_bind()`](struct.Ldap.html#method.sasl_digest_md5_bind).
    pub fn sasl_digest_md5_bind(
        &mut self,
        username: &str,
        password: &str,
        server_host: &str,
    ) -> Result<LdapResult> {
        self.rt
            .block_on(self.ldap.sasl_digest_md5_bind(username, password, server_host))
    }

    #[cfg_attr(docsrs, doc(cfg(feature = "gssapi")))]
    #[cfg(feature = "gssapi")]
    /// See [`Ldap::sasl_gssapi_bind()`](struct.Ldap.html#method.sasl_gssapi_bind).
    pub fn sasl_gssapi_bind(&mut self, server_fqdn: &str) -> Result<LdapResult> {
        self.rt.block_on(self.ldap.sasl_gssapi_bind(server_fqdn))
    }

    #[cfg_attr(docsrs, doc(cfg(feature = "gssapi")))]
    #[cfg(feature = "gssapi")]
    /// See [`Ldap::sasl_gssapi_cred_bind()`](struct.Ldap.html#method.sasl_gssapi_cred_bind).
    pub fn sasl_gssapi_cred_bind(&mut self, cred: Cred, server_fqdn: &str) -> Result<LdapResult> {
        self.rt
            .block_on(self.ldap.sasl_gssapi_cred_bind(cred, server_fqdn))
    }

    #[cfg_attr(docsrs, doc(cfg(feature = "ntlm")))]
    #[cfg(feature = "ntlm")]
    /// See [`Ldap::sasl_ntlm_bind()`](struct.Ldap.html#method.sasl_ntlm_bind).
    pub fn sasl_ntlm_bind(&mut self, username: &str, password: &str) -> Result<LdapResult> {
        self.rt.block_on(self.ldap.sasl_ntlm_bind(username, password))
    }

    /// See [`Ldap::search()`](struct.Ldap.html#method.search).
    pub fn search<S: AsRef<str> + Send + Sync>(
        &mut self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: impl AsRef<[S]> + Send + Sync,
    ) -> Result<SearchResult> {
        self.rt.block_on(self.ldap.search(base, scope, filter, attrs))
    }

    /// See [`Ldap::search_with_paging()`](struct.Ldap.html#method.search_with_paging).
    pub fn search_with_paging<S: AsRef<str> + Clone + Send + Sync>(
        &mut self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: Vec<S>,
        page_size: i32,
    ) -> Result<SearchResult> {
        self.rt
            .block_on(self.ldap.search_with_paging(base, scope, filter, attrs, page_size))
    }

    /// Begin a streaming Search; see
    /// [`Ldap::streaming_search()`](struct.Ldap.html#method.streaming_search).
    /// The stream borrows this handle, which enforces that the two are not
    /// used in parallel.
    pub fn streaming_search<'b, S: AsRef<str> + Send + Sync>(
        &'b mut self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: impl AsRef<[S]> + Send + Sync,
    ) -> Result<EntryStream<'b>> {
        let stream = self
            .rt
            .block_on(self.ldap.streaming_search(base, scope, filter, attrs))?;
        Ok(EntryStream { stream, conn: self })
    }

    /// See [`Ldap::add()`](struct.Ldap.html#method.add).
    pub fn add<S: AsRef<[u8]> + Eq + Hash>(
        &mut self,
        dn: &str,
        attrs: Vec<(S, HashSet<S>)>,
    ) -> Result<LdapResult> {
        self.rt.block_on(self.ldap.add(dn, attrs))
    }

    /// See [`Ldap::compare()`](struct.Ldap.html#method.compare).
    pub fn compare<B: AsRef<[u8]>>(
        &mut self,
        dn: &str,
        attr: &str,
        val: B,
    ) -> Result<CompareResult> {
        self.rt.block_on(self.ldap.compare(dn, attr, val))
    }

    /// See [`Ldap::delete()`](struct.Ldap.html#method.delete).
    pub fn delete(&mut self, dn: &str) -> Result<LdapResult> {
        self.rt.block_on(self.ldap.delete(dn))
    }

    /// See [`Ldap::modify()`](struct.Ldap.html#method.modify).
    pub fn modify<S: AsRef<[u8]> + Eq + Hash>(
        &mut self,
        dn: &str,
        mods: Vec<Mod<S>>,
    ) -> Result<LdapResult> {
        self.rt.block_on(self.ldap.modify(dn, mods))
    }

    /// See [`Ldap::modifydn()`](struct.Ldap.html#method.modifydn).
    pub fn modifydn(
        &mut self,
        dn: &str,
        rdn: &str,
        delete_old: bool,
        new_sup: Option<&str>,
    ) -> Result<LdapResult> {
        self.rt
            .block_on(self.ldap.modifydn(dn, rdn, delete_old, new_sup))
    }

    /// See [`Ldap::unbind()`](struct.Ldap.html#method.unbind).
    pub fn unbind(&mut self) -> Result<()> {
        self.rt.block_on(self.ldap.unbind())
    }

    /// See [`Ldap::extended()`](struct.Ldap.html#method.extended).
    pub fn extended<E>(&mut self, exop: E) -> Result<ExopResult>
    where
        E: Into<Exop>,
    {
        self.rt.block_on(self.ldap.extended(exop))
    }

    /// See [`Ldap::last_id()`](struct.Ldap.html#method.last_id).
    pub fn last_id(&mut self) -> RequestId {
        self.ldap.last_id()
    }

    /// See [`Ldap::abandon()`](struct.Ldap.html#method.abandon).
    pub fn abandon(&mut self, msgid: RequestId) -> Result<()> {
        self.rt.block_on(self.ldap.abandon(msgid))
    }

    /// See [`Ldap::is_closed()`](struct.Ldap.html#method.is_closed).
    pub fn is_closed(&mut self) -> bool {
        self.ldap.is_closed()
    }

    /// See [`Ldap::peer_certificate()`](struct.Ldap.html#method.peer_certificate).
    pub fn peer_certificate(&self) -> Option<Vec<u8>> {
        self.ldap.peer_certificate()
    }
}

/// Blocking counterpart of [`SearchStream`](struct.SearchStream.html),
/// obtained from
/// [`streaming_search()`](struct.LdapConn.html#method.streaming_search).
/// It keeps the originating [`LdapConn`](struct.LdapConn.html) borrowed
/// for its whole lifetime, since both need the same runtime.
#[cfg_attr(docsrs, doc(cfg(feature = "sync")))]
pub struct EntryStream<'b> {
    stream: SearchStream,
    conn: &'b mut LdapConn,
}

impl<'b> EntryStream<'b> {
    /// See [`SearchStream::next()`](struct.SearchStream.html#method.next).
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<ResultEntry>> {
        self.conn.rt.block_on(self.stream.next())
    }

    /// See [`SearchStream::finish()`](struct.SearchStream.html#method.finish).
    ///
    /// The name `result()` was kept for backwards compatibility.
    pub fn result(mut self) -> LdapResult {
        self.conn.rt.block_on(self.stream.finish())
    }

    /// The message ID of the underlying Search, usable for an Abandon
    /// operation after cutting the stream short.
    pub fn last_id(&mut self) -> RequestId {
        self.stream.ldap_handle().last_id()
    }
}
