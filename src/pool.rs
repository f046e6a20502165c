//! Connection Pool
//!
//! A fixed set of connection slots, one per [`ConnectionDescriptor`], created when the pool
//! is built. Sessions are established lazily on first use and revalidated after sitting idle.
//!
//! # Lease Lifecycle
//! - [`Pool::acquire`] waits for a free slot (bounded by the acquisition timeout), then makes
//!   sure the slot holds a live session; the ping and connect for that are bounded too
//! - [`Pool::release`] (or dropping the [`LeasedConnection`]) returns the slot; an unhealthy
//!   lease has its session closed so the next acquisition connects afresh
//!
//! The number of concurrently leased connections never exceeds the pool size.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::backend::{Backend, ConnectionDescriptor, Endpoint};
use crate::error::{GatewayError, Result};

/// Pool sizing and timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub size: usize,
    pub acquire_timeout: Duration,
    /// Idle time after which a session is pinged before being handed out
    pub validate_after: Duration,
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub size: usize,
    /// Free slots holding a live session
    pub idle: usize,
    pub leased: usize,
}

struct Slot<S> {
    descriptor: Arc<ConnectionDescriptor>,
    session: Option<S>,
    last_used: Instant,
}

struct PoolInner<B: Backend> {
    backend: Arc<B>,
    settings: PoolSettings,
    permits: Arc<Semaphore>,
    slots: Mutex<VecDeque<Slot<B::Session>>>,
    leased: AtomicUsize,
}

/// Bounded pool of backend sessions
pub struct Pool<B: Backend> {
    inner: Arc<PoolInner<B>>,
}

impl<B: Backend> Clone for Pool<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> Pool<B> {
    /// Create `settings.size` descriptors and as many empty slots
    pub fn new(backend: Arc<B>, settings: PoolSettings, endpoint: &Endpoint) -> Self {
        let now = Instant::now();
        let slots = (0..settings.size)
            .map(|id| Slot {
                descriptor: Arc::new(endpoint.descriptor(id)),
                session: None,
                last_used: now,
            })
            .collect();

        debug!(size = settings.size, address = %endpoint.address, "connection pool created");

        Self {
            inner: Arc::new(PoolInner {
                backend,
                settings,
                permits: Arc::new(Semaphore::new(settings.size)),
                slots: Mutex::new(slots),
                leased: AtomicUsize::new(0),
            }),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.inner.backend
    }

    pub fn settings(&self) -> PoolSettings {
        self.inner.settings
    }

    /// Lease a connection with a live session
    ///
    /// Cancel-safe: dropping the returned future before it resolves leases nothing.
    pub async fn acquire(&self) -> Result<LeasedConnection<B>> {
        let timeout = self.inner.settings.acquire_timeout;
        let permit =
            match tokio::time::timeout(timeout, Arc::clone(&self.inner.permits).acquire_owned())
                .await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(GatewayError::pool_exhausted("connection pool is closed")),
                Err(_) => {
                    debug!(timeout_ms = timeout.as_millis() as u64, "pool acquisition timed out");
                    return Err(GatewayError::pool_exhausted(format!(
                        "no connection became free within {}ms",
                        timeout.as_millis()
                    )));
                }
            };

        let slot = self
            .inner
            .lock_slots()
            .pop_front()
            .ok_or_else(|| GatewayError::pool_exhausted("no free connection slot"))?;

        self.inner.leased.fetch_add(1, Ordering::SeqCst);
        let mut lease = LeasedConnection {
            pool: Arc::clone(&self.inner),
            descriptor: slot.descriptor,
            session: slot.session,
            last_used: slot.last_used,
            healthy: true,
            _permit: permit,
        };

        self.prepare(&mut lease).await?;
        Ok(lease)
    }

    /// Return a lease; `healthy = false` discards its session
    pub fn release(&self, mut lease: LeasedConnection<B>, healthy: bool) {
        if !healthy {
            lease.mark_unhealthy();
        }
        drop(lease);
    }

    pub fn status(&self) -> PoolStatus {
        let idle = self.inner.lock_slots().iter().filter(|s| s.session.is_some()).count();
        PoolStatus {
            size: self.inner.settings.size,
            idle,
            leased: self.inner.leased.load(Ordering::SeqCst),
        }
    }

    /// Stop handing out leases and close every idle session
    pub async fn close(&self) {
        self.inner.permits.close();
        let sessions: Vec<B::Session> =
            self.inner.lock_slots().iter_mut().filter_map(|s| s.session.take()).collect();
        debug!(closed = sessions.len(), "closing idle sessions");
        for session in sessions {
            self.inner.backend.close(session).await;
        }
    }

    /// Make sure the lease holds a live session
    ///
    /// The liveness ping and the reconnect are each bounded by the acquisition timeout. A ping
    /// that does not answer in time counts as a failed check.
    async fn prepare(&self, lease: &mut LeasedConnection<B>) -> Result<()> {
        let backend = &self.inner.backend;
        let limit = self.inner.settings.acquire_timeout;

        if let Some(session) = lease.session.as_mut() {
            if lease.last_used.elapsed() < self.inner.settings.validate_after {
                return Ok(());
            }
            let failure = match tokio::time::timeout(limit, backend.ping(session)).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("no reply within {}ms", limit.as_millis()),
            };
            warn!(
                slot = lease.descriptor.id,
                error = %failure,
                "stale session failed liveness check, reconnecting"
            );
            if let Some(stale) = lease.session.take() {
                self.inner.close_detached(stale);
            }
        }

        match tokio::time::timeout(limit, backend.connect(&lease.descriptor)).await {
            Ok(Ok(session)) => {
                debug!(slot = lease.descriptor.id, "session established");
                lease.session = Some(session);
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(slot = lease.descriptor.id, error = %e, "connect failed");
                Err(GatewayError::backend_unreachable(format!(
                    "could not connect to {}: {e}",
                    lease.descriptor.address
                )))
            }
            Err(_) => {
                warn!(
                    slot = lease.descriptor.id,
                    timeout_ms = limit.as_millis() as u64,
                    "connect timed out"
                );
                Err(GatewayError::backend_unreachable(format!(
                    "could not connect to {} within {}ms",
                    lease.descriptor.address,
                    limit.as_millis()
                )))
            }
        }
    }
}

impl<B: Backend> PoolInner<B> {
    fn lock_slots(&self) -> std::sync::MutexGuard<'_, VecDeque<Slot<B::Session>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Live sessions go to the front so they are reused before empty slots
    fn return_slot(&self, slot: Slot<B::Session>) {
        let mut slots = self.lock_slots();
        if slot.session.is_some() {
            slots.push_front(slot);
        } else {
            slots.push_back(slot);
        }
    }

    /// Close a session without blocking the caller
    fn close_detached(&self, session: B::Session) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let backend = Arc::clone(&self.backend);
                handle.spawn(async move { backend.close(session).await });
            }
            Err(_) => drop(session),
        }
    }
}

/// A slot leased from the pool
///
/// Exclusively owned by one operation. Returned to the pool on drop.
pub struct LeasedConnection<B: Backend> {
    pool: Arc<PoolInner<B>>,
    descriptor: Arc<ConnectionDescriptor>,
    session: Option<B::Session>,
    last_used: Instant,
    healthy: bool,
    _permit: OwnedSemaphorePermit,
}

impl<B: Backend> LeasedConnection<B> {
    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    pub const fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Discard the session when the lease is returned
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    /// Move the session out for the duration of a statement
    pub(crate) fn take_session(&mut self) -> Option<B::Session> {
        self.session.take()
    }

    pub(crate) fn restore_session(&mut self, session: B::Session) {
        self.session = Some(session);
    }
}

impl<B: Backend> Drop for LeasedConnection<B> {
    fn drop(&mut self) {
        let session = match self.session.take() {
            Some(session) if !self.healthy => {
                debug!(slot = self.descriptor.id, "discarding unhealthy session");
                self.pool.close_detached(session);
                None
            }
            other => other,
        };

        self.pool.return_slot(Slot {
            descriptor: Arc::clone(&self.descriptor),
            session,
            last_used: Instant::now(),
        });
        self.pool.leased.fetch_sub(1, Ordering::SeqCst);
        // the permit is released after this body, once the slot is back in the queue
    }
}
