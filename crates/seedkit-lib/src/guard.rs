//! Process-wide concurrency limits: one hashing job at a time, one login per client endpoint.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};

use crate::error::{Error, Result};

/// Serializes hashing jobs (fresh builds and external tool runs).
///
/// Tokio's semaphore is fair, so waiters are served in arrival order.
#[derive(Debug, Clone)]
pub struct HashingGuard {
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
}

impl Default for HashingGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl HashingGuard {
    pub fn new() -> Self {
        HashingGuard {
            semaphore: Arc::new(Semaphore::new(1)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn acquire(&self) -> Result<HashingPermit> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal(anyhow::anyhow!("hashing semaphore was closed")))?;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(HashingPermit {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    /// Hashing jobs currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// Released on drop, including when the holding future panics or is cancelled.
#[derive(Debug)]
pub struct HashingPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for HashingPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Identity of a remote client session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub host: String,
    pub port: Option<u16>,
    pub user: String,
}

/// Caches established sessions per endpoint and makes sure concurrent callers never log in twice.
#[derive(Debug)]
pub struct SessionRegistry<S> {
    locks: Mutex<HashMap<EndpointKey, Arc<AsyncMutex<()>>>>,
    sessions: Mutex<HashMap<EndpointKey, Arc<S>>>,
}

impl<S> Default for SessionRegistry<S> {
    fn default() -> Self {
        SessionRegistry {
            locks: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

impl<S> SessionRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, key: &EndpointKey) -> Arc<AsyncMutex<()>> {
        Arc::clone(self.locks.lock().entry(key.clone()).or_default())
    }

    pub fn cached(&self, key: &EndpointKey) -> Option<Arc<S>> {
        self.sessions.lock().get(key).cloned()
    }

    /// Returns the cached session or runs `establish` while holding the endpoint's lock.
    pub async fn get_or_establish<F, Fut>(&self, key: &EndpointKey, establish: F) -> Result<Arc<S>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<S>>,
    {
        if let Some(session) = self.cached(key) {
            return Ok(session);
        }

        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        // someone else may have logged in while we waited
        if let Some(session) = self.cached(key) {
            return Ok(session);
        }

        tracing::debug!(host = %key.host, port = ?key.port, "establishing a new client session");
        let session = Arc::new(establish().await?);
        self.sessions.lock().insert(key.clone(), Arc::clone(&session));
        Ok(session)
    }

    /// Forgets a session, e.g. after the remote rejected it.
    pub fn invalidate(&self, key: &EndpointKey) {
        if self.sessions.lock().remove(key).is_some() {
            tracing::debug!(host = %key.host, "invalidated client session");
        }
    }
}
