//! Bounded object pools.
//!
//! [`InstanceCache`] keeps up to `max_cached` idle instances built by an
//! [`InstanceFactory`]. [`CacheableInstanceCache`] additionally runs the
//! [`Cacheable`] activate/deactivate hooks on every checkout and checkin:
//!
//! - an instance whose activate hook fails is discarded and the error propagates,
//! - an instance whose deactivate hook fails is discarded instead of cached.
//!
//! Statistics are updated under the same lock as the queue.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("Instance cache '{0}' has been disposed")]
    Disposed(String),
    #[error("Failed to create instance: {0}")]
    Create(String),
    #[error("Failed to activate instance: {0}")]
    Activate(String),
    #[error("Failed to deactivate instance: {0}")]
    Deactivate(String),
}

/// Creates and discards pooled instances.
pub trait InstanceFactory<T>: Send + Sync {
    fn create(&self) -> Result<T, CacheError>;

    /// Called for every instance leaving the pool for good.
    fn discard(&self, instance: T) {
        drop(instance);
    }
}

/// Lifecycle hooks of an instance managed by a [`CacheableInstanceCache`].
pub trait Cacheable {
    /// Runs when the instance is handed out (after creation or after dequeue).
    fn on_decaching(&self) -> Result<(), CacheError>;

    /// Runs when the instance is handed back.
    fn on_caching(&self) -> Result<(), CacheError>;
}

impl<T: Cacheable + ?Sized> Cacheable for Arc<T> {
    fn on_decaching(&self) -> Result<(), CacheError> {
        (**self).on_decaching()
    }

    fn on_caching(&self) -> Result<(), CacheError> {
        (**self).on_caching()
    }
}

/// Usage counters of a cache. Diagnostic only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Instances handed out.
    pub allocated: u64,
    /// Instances handed back (cached or discarded).
    pub released: u64,
    /// Instances built by the factory.
    pub created: u64,
    /// Instances discarded on release, on hook failure or on dispose.
    pub discarded: u64,
    /// Highest number of instances out of the cache at the same time.
    pub max_active: u64,
    /// Instances currently queued.
    pub cached: usize,
}

impl CacheStats {
    pub fn active(&self) -> u64 {
        self.allocated.saturating_sub(self.released)
    }
}

struct CacheState<T> {
    /// `None` once disposed.
    queue: Option<VecDeque<T>>,
    stats: CacheStats,
}

pub struct InstanceCache<T, F> {
    name: String,
    factory: F,
    max_cached: usize,
    state: Mutex<CacheState<T>>,
}

impl<T, F: InstanceFactory<T>> InstanceCache<T, F> {
    pub fn new(name: impl Into<String>, factory: F, max_cached: usize) -> Self {
        Self {
            name: name.into(),
            factory,
            max_cached,
            state: Mutex::new(CacheState {
                queue: Some(VecDeque::with_capacity(max_cached)),
                stats: CacheStats::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_cached(&self) -> usize {
        self.max_cached
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Take a cached instance, or build a new one.
    pub fn allocate(&self) -> Result<T, CacheError> {
        let cached = {
            let mut guard = self.state.lock();
            let CacheState { queue, stats } = &mut *guard;
            let queue = queue
                .as_mut()
                .ok_or_else(|| CacheError::Disposed(self.name.clone()))?;
            let instance = queue.pop_front();
            if instance.is_some() {
                Self::count_allocation(stats);
            }
            instance
        };

        if let Some(instance) = cached {
            trace!(cache = %self.name, "reusing cached instance");
            return Ok(instance);
        }

        let instance = self.factory.create()?;
        let mut state = self.state.lock();
        if state.queue.is_none() {
            drop(state);
            self.factory.discard(instance);
            return Err(CacheError::Disposed(self.name.clone()));
        }
        state.stats.created += 1;
        Self::count_allocation(&mut state.stats);
        trace!(cache = %self.name, "created new instance");
        Ok(instance)
    }

    /// Hand an instance back. It is queued unless `discard` is set, the cache
    /// is full, or the cache has been disposed.
    pub fn release(&self, instance: T, discard: bool) {
        let rejected = {
            let mut guard = self.state.lock();
            let CacheState { queue, stats } = &mut *guard;
            stats.released += 1;
            match queue {
                Some(queue) if !discard && queue.len() < self.max_cached => {
                    queue.push_back(instance);
                    None
                }
                _ => {
                    stats.discarded += 1;
                    Some(instance)
                }
            }
        };

        if let Some(instance) = rejected {
            trace!(cache = %self.name, "discarding released instance");
            self.factory.discard(instance);
        }
    }

    /// Count an instance that was allocated but will never be released normally.
    fn discard_allocated(&self, instance: T) {
        {
            let mut state = self.state.lock();
            state.stats.released += 1;
            state.stats.discarded += 1;
        }
        self.factory.discard(instance);
    }

    /// Discard every cached instance. Later allocations fail.
    pub fn dispose(&self) {
        let drained = {
            let mut state = self.state.lock();
            let drained = state.queue.take().unwrap_or_default();
            state.stats.discarded += drained.len() as u64;
            drained
        };
        debug!(cache = %self.name, count = drained.len(), "disposing instance cache");
        for instance in drained {
            self.factory.discard(instance);
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().queue.is_none()
    }

    pub fn cached_count(&self) -> usize {
        self.state.lock().queue.as_ref().map_or(0, VecDeque::len)
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            cached: state.queue.as_ref().map_or(0, VecDeque::len),
            ..state.stats
        }
    }

    fn count_allocation(stats: &mut CacheStats) {
        stats.allocated += 1;
        stats.max_active = stats.max_active.max(stats.active());
    }
}

/// An [`InstanceCache`] whose instances take part in their own pooling lifecycle.
pub struct CacheableInstanceCache<T, F> {
    inner: InstanceCache<T, F>,
}

impl<T: Cacheable, F: InstanceFactory<T>> CacheableInstanceCache<T, F> {
    pub fn new(name: impl Into<String>, factory: F, max_cached: usize) -> Self {
        Self {
            inner: InstanceCache::new(name, factory, max_cached),
        }
    }

    /// Take an activated instance. An instance that fails activation is discarded.
    pub fn allocate(&self) -> Result<T, CacheError> {
        let instance = self.inner.allocate()?;
        match instance.on_decaching() {
            Ok(()) => Ok(instance),
            Err(e) => {
                warn!(cache = %self.inner.name, error = %e, "instance failed to activate; discarding");
                self.inner.discard_allocated(instance);
                Err(e)
            }
        }
    }

    /// Deactivate and hand an instance back. Deactivation failures force a discard.
    pub fn release(&self, instance: T, discard: bool) {
        let discard = match instance.on_caching() {
            Ok(()) => discard,
            Err(e) => {
                warn!(cache = %self.inner.name, error = %e, "instance failed to deactivate; discarding");
                true
            }
        };
        self.inner.release(instance, discard);
    }

    pub fn dispose(&self) {
        self.inner.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    pub fn cached_count(&self) -> usize {
        self.inner.cached_count()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.stats()
    }

    pub fn factory(&self) -> &F {
        self.inner.factory()
    }
}
