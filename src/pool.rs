//! Bounded connection pool handing out one lease per request.
//!
//! The physical connections are managed by r2d2; this layer adds lease
//! bookkeeping (outstanding/peak counts, exactly-once release) and the
//! out-of-band fault channel a leased connection can report through.

use diesel::PgConnection;
use diesel::r2d2::ConnectionManager;
use r2d2::{ManageConnection, Pool, PooledConnection};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::completion::{Completion, FaultReporter};
use crate::config::DatabaseConfig;

/// Pool over diesel's PostgreSQL connection manager
pub type PgPool = ConnectionPool<ConnectionManager<PgConnection>>;

#[derive(Error, Debug)]
pub enum AcquireError {
    #[error("cannot open database connection: {0}")]
    Connect(String),

    #[error("all {limit} connections are leased")]
    Saturated { limit: u32 },

    #[error("acquire task interrupted: {0}")]
    Interrupted(String),
}

/// Fault raised on an already-leased connection, independent of any query result
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionFault {
    #[error("database connection closed: {0}")]
    Closed(String),

    #[error("database connection is broken")]
    Broken,
}

/// Snapshot of pool bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub limit: u32,
    pub outstanding: usize,
    pub peak_outstanding: usize,
    pub acquired: u64,
    pub released: u64,
    pub acquire_failures: u64,
    pub connections: u32,
    pub idle_connections: u32,
}

#[derive(Default)]
struct LeaseCounters {
    next_id: AtomicU64,
    outstanding: AtomicUsize,
    peak: AtomicUsize,
    acquired: AtomicU64,
    released: AtomicU64,
    acquire_failures: AtomicU64,
}

pub struct ConnectionPool<M: ManageConnection> {
    inner: Pool<M>,
    limit: u32,
    counters: Arc<LeaseCounters>,
}

impl<M: ManageConnection> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limit: self.limit,
            counters: Arc::clone(&self.counters),
        }
    }
}

impl PgPool {
    /// Build the PostgreSQL pool. No connection is opened until the first acquire.
    pub fn connect(config: &DatabaseConfig) -> Self {
        let manager = ConnectionManager::<PgConnection>::new(config.connection_string());
        Self::build(manager, config.pool_size, config.acquire_timeout())
    }
}

impl<M: ManageConnection> ConnectionPool<M> {
    /// Build a pool of at most `limit` connections.
    ///
    /// Connections are opened lazily and checked for health on every checkout,
    /// so a connection returned after a timed-out query is verified before reuse.
    /// `limit` must be at least 1.
    pub fn build(manager: M, limit: u32, acquire_timeout: Duration) -> Self {
        let inner = Pool::builder()
            .max_size(limit)
            .min_idle(Some(0))
            .connection_timeout(acquire_timeout)
            .test_on_check_out(true)
            .build_unchecked(manager);

        Self {
            inner,
            limit,
            counters: Arc::new(LeaseCounters::default()),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Lease a connection. The blocking r2d2 checkout runs on the blocking
    /// thread pool so other requests keep making progress.
    pub async fn acquire(&self) -> Result<Lease<M>, AcquireError> {
        let pool = self.inner.clone();
        let checkout = tokio::task::spawn_blocking(move || pool.get()).await;

        let result = match checkout {
            Ok(Ok(conn)) => Ok(self.lease(conn)),
            Ok(Err(e)) => Err(self.classify(e)),
            Err(e) => Err(AcquireError::Interrupted(e.to_string())),
        };

        if let Err(e) = &result {
            self.counters.acquire_failures.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("flight_pool_acquire_failed_total").increment(1);
            debug!("Acquire failed: {}", e);
        }

        result
    }

    /// Return a lease to the pool. Consumes the lease, so it cannot be released twice.
    pub fn release(&self, mut lease: Lease<M>) {
        debug_assert!(
            Arc::ptr_eq(&self.counters, &lease.counters),
            "lease released to a pool that did not issue it"
        );
        lease.finish(false);
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state();
        PoolStats {
            limit: self.limit,
            outstanding: self.counters.outstanding.load(Ordering::Acquire),
            peak_outstanding: self.counters.peak.load(Ordering::Acquire),
            acquired: self.counters.acquired.load(Ordering::Acquire),
            released: self.counters.released.load(Ordering::Acquire),
            acquire_failures: self.counters.acquire_failures.load(Ordering::Acquire),
            connections: state.connections,
            idle_connections: state.idle_connections,
        }
    }

    fn lease(&self, conn: PooledConnection<M>) -> Lease<M> {
        let id = self.counters.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let outstanding = self.counters.outstanding.fetch_add(1, Ordering::AcqRel) + 1;
        self.counters.peak.fetch_max(outstanding, Ordering::AcqRel);
        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!("flight_pool_outstanding").set(outstanding as f64);
        debug!(lease = id, outstanding, "Leased connection");

        Lease {
            id,
            conn: Some(conn),
            counters: Arc::clone(&self.counters),
            acquired_at: Instant::now(),
            released: false,
        }
    }

    /// r2d2 reports both failure modes as a checkout timeout; the pool state
    /// tells them apart.
    fn classify(&self, error: r2d2::Error) -> AcquireError {
        let state = self.inner.state();
        if state.connections >= self.limit && state.idle_connections == 0 {
            AcquireError::Saturated { limit: self.limit }
        } else {
            AcquireError::Connect(error.to_string())
        }
    }
}

/// A connection leased for the duration of one request.
///
/// The physical connection can be moved out with [`Lease::checkout`] to run a
/// query; the lease itself stays with the request and is released exactly
/// once, either through [`ConnectionPool::release`] or, as a fallback, on drop.
pub struct Lease<M: ManageConnection> {
    id: u64,
    conn: Option<PooledConnection<M>>,
    counters: Arc<LeaseCounters>,
    acquired_at: Instant,
    released: bool,
}

impl<M: ManageConnection> Lease<M> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Hand the physical connection to a query, together with a reporter for
    /// transport faults bound to the request's completion signal.
    ///
    /// Returns `None` if the connection was already checked out.
    pub fn checkout(&mut self, completion: &Completion) -> Option<(PooledConnection<M>, FaultReporter)> {
        let conn = self.conn.take()?;
        Some((conn, completion.fault_reporter()))
    }

    fn finish(&mut self, implicit: bool) {
        if self.released {
            return;
        }
        self.released = true;
        // A connection still checked out to a timed-out query returns to r2d2
        // when that query's blocking work ends.
        self.conn.take();

        let outstanding = self.counters.outstanding.fetch_sub(1, Ordering::AcqRel) - 1;
        self.counters.released.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!("flight_pool_outstanding").set(outstanding as f64);

        let held_ms = self.acquired_at.elapsed().as_millis();
        if implicit {
            warn!(
                lease = self.id,
                held_ms, "Lease dropped without an explicit release"
            );
        } else {
            debug!(lease = self.id, held_ms, outstanding, "Released connection");
        }
    }
}

impl<M: ManageConnection> Drop for Lease<M> {
    fn drop(&mut self) {
        self.finish(true);
    }
}

impl<M: ManageConnection> std::fmt::Debug for Lease<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("checked_out", &self.conn.is_none())
            .field("released", &self.released)
            .finish()
    }
}
