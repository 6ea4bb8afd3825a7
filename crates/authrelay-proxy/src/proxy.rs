//! The proxy: listeners, connections and the credential cache.
//!
//! Structural state (started flag, credential source, connection collection
//! and the credential cache slot) sits behind the proxy's own lock. The
//! contents of the credential cache have a lock of their own, so a connection
//! waiting for the credential source never blocks start, stop or accept.

use crate::cache::CacheStats;
use crate::config::{Config, ListenerSettings};
use crate::connection::ConnectionCollection;
use crate::credential::{BasicCredential, CredentialCache, CredentialSource};
use crate::error::{Error, Result};
use crate::listener::{ConnectionAcceptor, Listener};
use crate::resolver::{DnsEndpoint, RequestTarget, UpstreamResolver};
use crate::task::{wait_all, StopTimeout, TaskHandle};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

/// What connections need from the proxy while relaying.
#[async_trait]
pub trait ProxyRunner: Send + Sync {
    /// Additional attempts per request after a 407.
    fn retry_count(&self) -> usize;

    /// Upstream proxies for `target`; `None` means connect directly.
    fn upstream_endpoints(&self, target: &RequestTarget) -> Option<Vec<DnsEndpoint>>;

    async fn get_server_basic_credentials(
        &self,
        endpoint: &str,
        realm: &str,
        first_request: bool,
        old: Option<&BasicCredential>,
    ) -> Result<Option<BasicCredential>>;

    /// The credential currently cached for `endpoint`. Never consults the source.
    async fn cached_credential(&self, endpoint: &str) -> Option<BasicCredential>;
}

#[derive(Clone)]
pub struct ProxySettings {
    pub listeners: Vec<ListenerSettings>,
    pub resolver: Option<Arc<dyn UpstreamResolver>>,
    pub retry_count: usize,
    pub max_cached_connections: usize,
}

impl ProxySettings {
    pub fn new(listeners: Vec<ListenerSettings>) -> Self {
        Self {
            listeners,
            resolver: None,
            retry_count: 2,
            max_cached_connections: 64,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn UpstreamResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_retry_count(mut self, retry_count: usize) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_max_cached_connections(mut self, max: usize) -> Self {
        self.max_cached_connections = max;
        self
    }

    pub fn from_config(config: &Config) -> std::result::Result<Self, anyhow::Error> {
        let mut settings = Self::new(config.listener_settings()?)
            .with_retry_count(config.retry_count)
            .with_max_cached_connections(config.max_cached_connections);
        if let Some(resolver) = config.resolver()? {
            settings = settings.with_resolver(Arc::new(resolver));
        }
        Ok(settings)
    }
}

struct ProxyState {
    started: bool,
    disposed: bool,
    source: Option<Arc<dyn CredentialSource>>,
    connections: Option<Arc<ConnectionCollection>>,
    credential_cache: Arc<CredentialCache>,
}

struct ProxyInner {
    this: Weak<ProxyInner>,
    state: Mutex<ProxyState>,
    listeners: Vec<Listener>,
    resolver: Option<Arc<dyn UpstreamResolver>>,
    retry_count: usize,
    max_cached_connections: usize,
}

pub struct Proxy {
    inner: Arc<ProxyInner>,
}

impl Proxy {
    pub fn new(settings: ProxySettings) -> Self {
        let inner = Arc::new_cyclic(|this: &Weak<ProxyInner>| {
            let acceptor: Weak<dyn ConnectionAcceptor> = this.clone();
            ProxyInner {
                this: this.clone(),
                state: Mutex::new(ProxyState {
                    started: false,
                    disposed: false,
                    source: None,
                    connections: None,
                    credential_cache: Arc::new(CredentialCache::new()),
                }),
                listeners: settings
                    .listeners
                    .iter()
                    .map(|s| Listener::new(*s, acceptor.clone()))
                    .collect(),
                resolver: settings.resolver,
                retry_count: settings.retry_count,
                max_cached_connections: settings.max_cached_connections,
            }
        });
        Self { inner }
    }

    /// Start every listener and serve credentials from `source`.
    ///
    /// Succeeds if at least one listener started. Does nothing if already started.
    pub async fn start(&self, source: Arc<dyn CredentialSource>) -> Result<()> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            if state.disposed {
                return Err(Error::Disposed);
            }
            if state.started {
                return Ok(());
            }
            if inner.listeners.is_empty() {
                return Err(Error::NoListeners);
            }
            state.started = true;
            state.source = Some(source);
            if let Some(connections) = &state.connections {
                connections.set_accepting(true);
            }
        }

        let results = join_all(inner.listeners.iter().map(Listener::start)).await;
        let mut failures = Vec::new();
        for (listener, result) in inner.listeners.iter().zip(results) {
            if let Err(e) = result {
                let endpoint = listener.settings().endpoint;
                error!(%endpoint, "Failed to start listener: {}", e);
                failures.push(format!("{endpoint}: {e}"));
            }
        }

        if failures.len() == inner.listeners.len() {
            let mut state = inner.state.lock();
            state.started = false;
            state.source = None;
            return Err(Error::NoListenerStarted(failures.join("; ")));
        }

        info!(
            listeners = inner.listeners.len() - failures.len(),
            failed = failures.len(),
            "Proxy started"
        );
        Ok(())
    }

    /// Stop listeners and connections. Returns whether all of them confirmed
    /// within `timeout`; the proxy counts as stopped either way.
    pub async fn stop(&self, timeout: StopTimeout) -> bool {
        let (was_started, connections) = {
            let mut state = self.inner.state.lock();
            let was_started = state.started;
            state.started = false;
            state.source = None;
            (was_started, state.connections.clone())
        };

        let mut handles: Vec<TaskHandle> = self
            .inner
            .listeners
            .iter()
            .filter_map(Listener::begin_stop)
            .collect();
        if let Some(connections) = connections {
            handles.extend(connections.begin_stop_all());
        }

        let confirmed = wait_all(&handles, timeout).await;
        if !confirmed {
            let pending = handles.iter().filter(|h| !h.is_finished()).count();
            warn!(pending, "Proxy stop not confirmed by every listener and connection");
        } else if was_started {
            info!("Proxy stopped");
        } else {
            debug!("Proxy already stopped");
        }
        confirmed
    }

    pub fn is_started(&self) -> bool {
        self.inner.state.lock().started
    }

    /// Addresses of the listeners currently bound.
    pub fn listener_addrs(&self) -> Vec<SocketAddr> {
        self.inner
            .listeners
            .iter()
            .filter_map(Listener::local_addr)
            .collect()
    }

    pub fn listeners(&self) -> &[Listener] {
        &self.inner.listeners
    }

    pub fn credential_cache(&self) -> Arc<CredentialCache> {
        Arc::clone(&self.inner.state.lock().credential_cache)
    }

    /// Forget every cached credential.
    pub fn clear_credential_cache(&self) {
        self.inner.state.lock().credential_cache = Arc::new(CredentialCache::new());
        debug!("Credential cache cleared");
    }

    /// Pool statistics, once the first connection has been accepted.
    pub fn connection_stats(&self) -> Option<CacheStats> {
        let connections = self.inner.state.lock().connections.clone();
        connections.map(|c| c.stats())
    }

    pub fn active_connections(&self) -> usize {
        let connections = self.inner.state.lock().connections.clone();
        connections.map_or(0, |c| c.active_count())
    }

    /// Release listeners and the connection pool. The proxy must be stopped.
    pub fn dispose(&self) -> Result<()> {
        let connections = {
            let mut state = self.inner.state.lock();
            if state.started {
                return Err(Error::StillStarted);
            }
            state.disposed = true;
            state.connections.take()
        };
        for listener in &self.inner.listeners {
            listener.dispose()?;
        }
        if let Some(connections) = connections {
            connections.dispose();
        }
        Ok(())
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        for listener in &self.inner.listeners {
            listener.begin_stop();
        }
    }
}

impl ConnectionAcceptor for ProxyInner {
    fn on_accept(&self, stream: TcpStream, peer: SocketAddr) {
        let connections = {
            let mut state = self.state.lock();
            if state.started {
                let connections = state.connections.get_or_insert_with(|| {
                    let runner: Weak<dyn ProxyRunner> = self.this.clone();
                    ConnectionCollection::new(runner, self.max_cached_connections)
                });
                Some(Arc::clone(connections))
            } else {
                None
            }
        };

        match connections {
            Some(connections) => {
                if let Err(e) = connections.start_connection(stream, peer) {
                    debug!(%peer, "Connection not started: {}", e);
                }
            }
            None => debug!(%peer, "Proxy is not started; closing accepted socket"),
        }
    }
}

#[async_trait]
impl ProxyRunner for ProxyInner {
    fn retry_count(&self) -> usize {
        self.retry_count
    }

    fn upstream_endpoints(&self, target: &RequestTarget) -> Option<Vec<DnsEndpoint>> {
        self.resolver.as_ref()?.get_proxy_endpoints(target)
    }

    async fn get_server_basic_credentials(
        &self,
        endpoint: &str,
        realm: &str,
        first_request: bool,
        old: Option<&BasicCredential>,
    ) -> Result<Option<BasicCredential>> {
        let (cache, source) = {
            let state = self.state.lock();
            (Arc::clone(&state.credential_cache), state.source.clone())
        };
        let source = source.ok_or(Error::NotStarted)?;
        cache
            .get_server_basic_credentials(source.as_ref(), endpoint, realm, first_request, old)
            .await
    }

    async fn cached_credential(&self, endpoint: &str) -> Option<BasicCredential> {
        let cache = Arc::clone(&self.state.lock().credential_cache);
        cache.get(endpoint).await
    }
}
