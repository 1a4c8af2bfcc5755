//! Per-node connection pool. Bookkeeping lives under a synchronous
//! mutex that is never held across an await; connection I/O happens
//! outside the lock, on leases handed out by [`ConnectionPool::acquire`].

use std::{
    collections::VecDeque,
    ops::{Deref, DerefMut},
    pin::pin,
    sync::{Arc, Mutex},
    time::Duration,
};

use memc_core::address::Address;
use tokio::{
    sync::{mpsc, Notify},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::{
    connection::{Connection, ConnectionOptions},
    error::Error,
};

/// Sizing and lifecycle knobs, shared by every node pool of a client.
#[derive(Debug, Clone)]
pub(crate) struct PoolConfig {
    pub(crate) min_connections: usize,
    pub(crate) max_connections: usize,
    pub(crate) purge_unused_connections_after: Option<Duration>,
}

/// A health transition reported to the cluster: the node address and
/// its new healthiness.
pub(crate) type HealthEvent = (Address, bool);

/// Point-in-time counters for one node's connection pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionPoolMetrics {
    /// Connections currently owned by the pool, idle plus leased.
    pub cur_connections: usize,
    /// Connections created since the pool started.
    pub connections_created: u64,
    /// Creation attempts that failed.
    pub connections_create_errors: u64,
    /// Idle connections closed by the purge task.
    pub connections_purged: u64,
    /// Connections dropped because they were broken or the pool closed.
    pub connections_closed: u64,
    /// Leases handed out.
    pub operations: u64,
    /// Leases that had to wait for a connection to become available.
    pub operations_waited: u64,
}

pub(crate) struct ConnectionPool {
    address: Address,
    options: ConnectionOptions,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Notify,
    health_events: mpsc::UnboundedSender<HealthEvent>,
}

struct PoolState {
    idle: VecDeque<Connection>,
    total: usize,
    creating: usize,
    create_failures: VecDeque<Error>,
    healthy: bool,
    closed: bool,
    purge_task: Option<JoinHandle<()>>,
    metrics: Counters,
}

#[derive(Default)]
struct Counters {
    created: u64,
    create_errors: u64,
    purged: u64,
    closed: u64,
    operations: u64,
    operations_waited: u64,
}

impl ConnectionPool {
    pub(crate) fn new(
        address: Address,
        options: ConnectionOptions,
        config: PoolConfig,
        health_events: mpsc::UnboundedSender<HealthEvent>,
    ) -> Arc<Self> {
        let pool = Arc::new(ConnectionPool {
            address,
            options,
            config,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                total: 0,
                creating: 0,
                create_failures: VecDeque::new(),
                healthy: true,
                closed: false,
                purge_task: None,
                metrics: Counters::default(),
            }),
            available: Notify::new(),
            health_events,
        });

        {
            let mut state = pool.state.lock().unwrap();
            // warm up to the configured minimum
            let warm = pool.config.min_connections.min(pool.config.max_connections);
            for _ in 0..warm {
                state.creating += 1;
                pool.spawn_create();
            }
            if let Some(after) = pool.config.purge_unused_connections_after {
                state.purge_task = Some(tokio::spawn(ConnectionPool::purge_loop(
                    Arc::clone(&pool),
                    after,
                )));
            }
        }
        pool
    }

    pub(crate) fn address(&self) -> &Address {
        &self.address
    }

    /// Lease a connection: reuse an idle one, start a creation when
    /// under the cap, otherwise wait until a connection is returned.
    /// Creation failures are surfaced to one waiting caller each.
    pub(crate) async fn acquire(self: &Arc<Self>) -> Result<PoolConnection, Error> {
        let mut waited = false;
        loop {
            let mut notified = pin!(self.available.notified());
            {
                let mut state = self.state.lock().unwrap();
                if state.closed {
                    return Err(Error::ClientClosed);
                }
                if let Some(err) = state.create_failures.pop_front() {
                    return Err(err);
                }
                if let Some(connection) = state.idle.pop_back() {
                    state.metrics.operations += 1;
                    if waited {
                        state.metrics.operations_waited += 1;
                    }
                    return Ok(PoolConnection {
                        pool: Arc::clone(self),
                        connection: Some(connection),
                    });
                }
                if state.total + state.creating < self.config.max_connections {
                    state.creating += 1;
                    self.spawn_create();
                }
                // register before releasing the lock so a wakeup racing
                // with the wait cannot be lost
                notified.as_mut().enable();
            }
            waited = true;
            notified.await;
        }
    }

    fn spawn_create(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let result = Connection::connect(&pool.address, &pool.options).await;
            pool.finish_create(result);
        });
    }

    fn finish_create(&self, result: Result<Connection, Error>) {
        let transition = {
            let mut state = self.state.lock().unwrap();
            state.creating -= 1;
            match result {
                Ok(connection) => {
                    state.metrics.created += 1;
                    if state.closed {
                        state.metrics.closed += 1;
                    } else {
                        state.total += 1;
                        state.idle.push_back(connection);
                    }
                    if !state.healthy {
                        state.healthy = true;
                        Some(true)
                    } else {
                        None
                    }
                }
                Err(err) => {
                    state.metrics.create_errors += 1;
                    debug!(address = %self.address, error = %err, "connection creation failed");
                    if !state.closed {
                        state.create_failures.push_back(err);
                    }
                    if state.total == 0 && state.healthy {
                        state.healthy = false;
                        Some(false)
                    } else {
                        None
                    }
                }
            }
        };
        self.available.notify_waiters();
        if let Some(healthy) = transition {
            if healthy {
                debug!(address = %self.address, "node back to healthy");
            } else {
                warn!(address = %self.address, "node marked unhealthy");
            }
            let _ = self.health_events.send((self.address.clone(), healthy));
        }
    }

    /// Return a leased connection. Broken or poisoned connections are
    /// dropped and the pool refills toward the minimum; usable ones go
    /// back to the idle set.
    fn release(self: &Arc<Self>, mut connection: Connection) {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                state.total = state.total.saturating_sub(1);
                state.metrics.closed += 1;
            } else if !connection.is_open() || connection.is_in_flight() {
                // a connection cancelled mid-request cannot be reused:
                // the response stream is no longer at a turn boundary
                state.total -= 1;
                state.metrics.closed += 1;
                if state.total + state.creating < self.config.min_connections {
                    state.creating += 1;
                    self.spawn_create();
                }
            } else {
                connection.mark_used();
                state.idle.push_back(connection);
            }
        }
        self.available.notify_waiters();
    }

    async fn purge_loop(pool: Arc<ConnectionPool>, ttl: Duration) {
        let mut interval = tokio::time::interval(ttl);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            pool.purge_idle(ttl);
        }
    }

    /// Close idle connections unused for longer than the TTL, keeping
    /// at least `min_connections`.
    fn purge_idle(&self, ttl: Duration) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        let now = Instant::now();
        let mut purged = 0;
        while state.total > self.config.min_connections {
            // the front of the idle queue is the least recently used
            match state.idle.front() {
                Some(connection) if now.duration_since(connection.last_used()) > ttl => {
                    state.idle.pop_front();
                    state.total -= 1;
                    purged += 1;
                }
                _ => break,
            }
        }
        if purged > 0 {
            state.metrics.purged += purged;
            debug!(address = %self.address, purged, "purged idle connections");
        }
    }

    pub(crate) fn is_healthy(&self) -> bool {
        self.state.lock().unwrap().healthy
    }

    pub(crate) fn metrics(&self) -> ConnectionPoolMetrics {
        let state = self.state.lock().unwrap();
        ConnectionPoolMetrics {
            cur_connections: state.total,
            connections_created: state.metrics.created,
            connections_create_errors: state.metrics.create_errors,
            connections_purged: state.metrics.purged,
            connections_closed: state.metrics.closed,
            operations: state.metrics.operations,
            operations_waited: state.metrics.operations_waited,
        }
    }

    /// Idempotent. Cancels the purge task, drops every idle connection
    /// immediately and discards leased ones as they are released.
    /// In-flight operations are not drained.
    pub(crate) fn close(&self) {
        let purge_task = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            let drained = state.idle.len();
            state.idle.clear();
            state.total -= drained;
            state.metrics.closed += drained as u64;
            state.create_failures.clear();
            state.purge_task.take()
        };
        if let Some(task) = purge_task {
            task.abort();
        }
        self.available.notify_waiters();
        debug!(address = %self.address, "connection pool closed");
    }
}

/// An exclusive connection lease. Dropping the lease returns the
/// connection to the pool; dropping it while a request is still in
/// flight discards the connection instead.
pub(crate) struct PoolConnection {
    pool: Arc<ConnectionPool>,
    connection: Option<Connection>,
}

impl Deref for PoolConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.connection.as_ref().expect("lease already released")
    }
}

impl DerefMut for PoolConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.connection.as_mut().expect("lease already released")
    }
}

impl std::fmt::Debug for PoolConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConnection")
            .field("address", self.pool.address())
            .finish()
    }
}

impl Drop for PoolConnection {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.release(connection);
        }
    }
}
