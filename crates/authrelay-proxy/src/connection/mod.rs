//! Pooled client connections.
//!
//! A [`Connection`] relays one accepted client socket at a time. Idle
//! connections live in the [`ConnectionCollection`]'s pool and are handed out
//! again for later sockets. The collection also keeps the registry of
//! connections that are currently relaying, so the proxy can stop them.

mod relay;
mod tunnel;

use crate::cache::{CacheError, CacheStats, Cacheable, CacheableInstanceCache, InstanceFactory};
use crate::error::{Error, Result};
use crate::metrics;
use crate::proxy::ProxyRunner;
use crate::task::{Component, StopTimeout, TaskHandle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::TcpStream;
use tracing::{debug, info_span, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Queued in the pool.
    Idle,
    /// Handed out, not relaying yet.
    Ready,
    Relaying,
    /// Discarded by the pool; never used again.
    Decommissioned,
}

#[derive(Debug)]
struct ConnectionState {
    phase: Phase,
    retry_count: usize,
    task: Option<TaskHandle>,
}

pub struct Connection {
    id: u64,
    collection: Weak<ConnectionCollection>,
    state: Mutex<ConnectionState>,
}

impl Connection {
    fn new(id: u64, collection: Weak<ConnectionCollection>) -> Self {
        Self {
            id,
            collection,
            state: Mutex::new(ConnectionState {
                phase: Phase::Idle,
                retry_count: 0,
                task: None,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_communicating(&self) -> bool {
        self.state.lock().phase == Phase::Relaying
    }

    pub fn is_decommissioned(&self) -> bool {
        self.state.lock().phase == Phase::Decommissioned
    }

    /// Start relaying `stream` on a task of its own.
    pub fn start_communication(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let mut state = self.state.lock();
        match state.phase {
            Phase::Relaying => return Err(Error::AlreadyCommunicating),
            Phase::Decommissioned => return Err(Error::Decommissioned),
            Phase::Idle | Phase::Ready => {}
        }
        let runner = self
            .collection
            .upgrade()
            .and_then(|c| c.runner())
            .ok_or(Error::NotStarted)?;

        let component = Component::new(
            format!("connection #{}", self.id),
            info_span!("connection", id = self.id, %peer),
        );
        let guard = FinishGuard {
            connection: Arc::clone(self),
        };
        let retry_count = state.retry_count;
        let task = component.spawn(move |_| async move {
            let _guard = guard;
            relay::RelaySession::new(stream, runner, retry_count).run().await;
        });

        state.phase = Phase::Relaying;
        state.task = Some(task);
        metrics::connection_started();
        Ok(())
    }

    /// Close both sockets and request the relay task to end, without waiting.
    pub fn begin_stop(&self) -> Option<TaskHandle> {
        let task = self.state.lock().task.clone()?;
        task.stop();
        Some(task)
    }

    /// Close both sockets. Returns whether the relay ended within `timeout`.
    pub async fn stop_communication(&self, timeout: StopTimeout) -> bool {
        match self.begin_stop() {
            Some(task) => task.wait(timeout).await,
            None => true,
        }
    }

    fn finish(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            state.task = None;
            if state.phase == Phase::Relaying {
                state.phase = Phase::Ready;
            }
        }
        metrics::connection_finished();
        match self.collection.upgrade() {
            Some(collection) => collection.on_communication_finished(self),
            None => trace!(id = self.id, "collection gone; connection dropped"),
        }
    }

    fn decommission(&self) {
        self.state.lock().phase = Phase::Decommissioned;
    }
}

impl Cacheable for Connection {
    fn on_decaching(&self) -> std::result::Result<(), CacheError> {
        let mut state = self.state.lock();
        if state.phase != Phase::Idle || state.task.is_some() {
            return Err(CacheError::Activate(format!(
                "connection #{} is not idle ({:?})",
                self.id, state.phase
            )));
        }
        let runner = self
            .collection
            .upgrade()
            .and_then(|c| c.runner())
            .ok_or_else(|| CacheError::Activate("proxy is gone".to_string()))?;
        state.retry_count = runner.retry_count();
        state.phase = Phase::Ready;
        Ok(())
    }

    fn on_caching(&self) -> std::result::Result<(), CacheError> {
        let mut state = self.state.lock();
        if state.task.is_some() {
            return Err(CacheError::Deactivate(format!(
                "connection #{} is still communicating",
                self.id
            )));
        }
        if state.phase == Phase::Decommissioned {
            return Err(CacheError::Deactivate(format!(
                "connection #{} is decommissioned",
                self.id
            )));
        }
        state.phase = Phase::Idle;
        state.retry_count = 0;
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &*self.state.lock())
            .finish()
    }
}

/// Reports the end of a relay task to the collection, also when it is cancelled.
struct FinishGuard {
    connection: Arc<Connection>,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.connection.finish();
    }
}

pub struct ConnectionFactory {
    collection: Weak<ConnectionCollection>,
    next_id: AtomicU64,
}

impl InstanceFactory<Arc<Connection>> for ConnectionFactory {
    fn create(&self) -> std::result::Result<Arc<Connection>, CacheError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Arc::new(Connection::new(id, self.collection.clone())))
    }

    fn discard(&self, connection: Arc<Connection>) {
        trace!(id = connection.id, "discarding connection");
        connection.decommission();
    }
}

struct Registry {
    active: HashMap<u64, Arc<Connection>>,
    accepting: bool,
}

/// Pool and registry of the proxy's connections.
pub struct ConnectionCollection {
    runner: Weak<dyn ProxyRunner>,
    pool: CacheableInstanceCache<Arc<Connection>, ConnectionFactory>,
    registry: Mutex<Registry>,
}

impl ConnectionCollection {
    pub fn new(runner: Weak<dyn ProxyRunner>, max_cached: usize) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            runner,
            pool: CacheableInstanceCache::new(
                "connections",
                ConnectionFactory {
                    collection: weak.clone(),
                    next_id: AtomicU64::new(0),
                },
                max_cached,
            ),
            registry: Mutex::new(Registry {
                active: HashMap::new(),
                accepting: true,
            }),
        })
    }

    fn runner(&self) -> Option<Arc<dyn ProxyRunner>> {
        self.runner.upgrade()
    }

    /// Take a connection from the pool and start relaying `stream` on it.
    pub fn start_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        if !self.registry.lock().accepting {
            return Err(Error::NotStarted);
        }

        let connection = self.pool.allocate()?;
        {
            let mut registry = self.registry.lock();
            if !registry.accepting {
                drop(registry);
                self.pool.release(connection, false);
                return Err(Error::NotStarted);
            }
            registry.active.insert(connection.id, Arc::clone(&connection));
        }

        if let Err(e) = connection.start_communication(stream, peer) {
            warn!(id = connection.id, "Failed to start connection: {}", e);
            self.registry.lock().active.remove(&connection.id);
            self.pool.release(connection, true);
            return Err(e);
        }
        metrics::record_connection_accepted();
        debug!(id = connection.id, %peer, "connection started");
        Ok(())
    }

    fn on_communication_finished(&self, connection: &Arc<Connection>) {
        self.registry.lock().active.remove(&connection.id);
        let discard = connection.is_decommissioned();
        self.pool.release(Arc::clone(connection), discard);
        trace!(id = connection.id, "connection returned to pool");
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.registry.lock().accepting = accepting;
    }

    pub fn is_accepting(&self) -> bool {
        self.registry.lock().accepting
    }

    /// Refuse new sockets and request every active connection to stop.
    pub fn begin_stop_all(&self) -> Vec<TaskHandle> {
        let active: Vec<Arc<Connection>> = {
            let mut registry = self.registry.lock();
            registry.accepting = false;
            registry.active.values().cloned().collect()
        };
        active.iter().filter_map(|c| c.begin_stop()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.registry.lock().active.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.pool.stats()
    }

    pub fn dispose(&self) {
        self.set_accepting(false);
        self.pool.dispose();
    }
}
