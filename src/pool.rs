// pool.rs - Fixed-capacity connection pool per PLC endpoint
//
// The pool lends a connection for the duration of one request/response
// exchange. Connections are constructed lazily, handed out FIFO, and
// replaced lazily once they break. Capacity is enforced with a semaphore,
// so a thousand concurrent acquires on a pool of two never yield more than
// two live leases.

use crate::config::Endpoint;
use crate::connection::{Connection, ConnectionState};
use crate::error::{EnipLinkError, Result};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

#[derive(Debug)]
struct PoolInner {
    endpoint: Endpoint,
    capacity: usize,
    read_timeout: Duration,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<Connection>>,
    closed: AtomicBool,
}

/// Pool of [`Connection`]s for one endpoint. Cheap to clone; clones share
/// the same slots.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(endpoint: Endpoint, capacity: usize, read_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(PoolInner {
                endpoint,
                capacity,
                read_timeout,
                semaphore: Arc::new(Semaphore::new(capacity)),
                idle: Mutex::new(Vec::with_capacity(capacity)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Borrow a connection, waiting up to `deadline` for a free slot.
    ///
    /// Returns an opened, Forward-Opened connection. Waiters are served
    /// first-come first-served. An idle connection found `Broken` (or
    /// otherwise not `Connected`) is discarded and a replacement is built in
    /// its place.
    pub async fn acquire(&self, deadline: Duration) -> Result<ConnectionLease> {
        if self.is_closed() {
            return Err(EnipLinkError::PoolClosed);
        }
        let permit = match timeout(
            deadline,
            Arc::clone(&self.inner.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(EnipLinkError::PoolClosed),
            Err(_) => return Err(EnipLinkError::PoolTimeout),
        };
        if self.is_closed() {
            return Err(EnipLinkError::PoolClosed);
        }

        // The permit guards the slot; replacement construction happens while
        // holding it so capacity is never exceeded.
        loop {
            let candidate = {
                let mut idle = self.inner.idle.lock().unwrap_or_else(|e| e.into_inner());
                idle.pop()
            };
            match candidate {
                Some(conn) if conn.state() == ConnectionState::Connected => {
                    debug!(endpoint = %self.inner.endpoint, "reusing pooled connection");
                    return Ok(ConnectionLease {
                        connection: Some(conn),
                        _permit: permit,
                        pool: Arc::clone(&self.inner),
                        broken: false,
                    });
                }
                Some(conn) => {
                    debug!(
                        endpoint = %self.inner.endpoint,
                        state = ?conn.state(),
                        "discarding unusable pooled connection"
                    );
                    drop(conn);
                    continue;
                }
                None => break,
            }
        }

        let conn = self.build_connection().await?;
        Ok(ConnectionLease {
            connection: Some(conn),
            _permit: permit,
            pool: Arc::clone(&self.inner),
            broken: false,
        })
    }

    async fn build_connection(&self) -> Result<Connection> {
        let mut conn = Connection::new(self.inner.endpoint.clone(), self.inner.read_timeout);
        conn.open().await?;
        conn.connect().await?;
        debug!(endpoint = %self.inner.endpoint, "built pooled connection");
        Ok(conn)
    }

    /// Close every pooled connection and reject subsequent acquires with
    /// `PoolClosed`.
    pub async fn drain(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.semaphore.close();
        let drained: Vec<Connection> = {
            let mut idle = self.inner.idle.lock().unwrap_or_else(|e| e.into_inner());
            idle.drain(..).collect()
        };
        for mut conn in drained {
            if let Err(err) = conn.close().await {
                warn!(endpoint = %self.inner.endpoint, error = %err, "error closing pooled connection");
            }
        }
        debug!(endpoint = %self.inner.endpoint, "pool drained");
    }
}

/// Exclusive borrow of one pooled connection for a single exchange.
///
/// Dropping the lease returns the connection to the pool unless it broke,
/// in which case it is discarded and the slot is refilled lazily by the
/// next acquire.
#[derive(Debug)]
pub struct ConnectionLease {
    connection: Option<Connection>,
    _permit: OwnedSemaphorePermit,
    pool: Arc<PoolInner>,
    broken: bool,
}

impl ConnectionLease {
    /// Flag the connection so the pool discards it instead of reusing it.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
            || self
                .connection
                .as_ref()
                .map(|c| c.state() == ConnectionState::Broken)
                .unwrap_or(true)
    }
}

impl Deref for ConnectionLease {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.connection.as_ref().expect("lease already released")
    }
}

impl DerefMut for ConnectionLease {
    fn deref_mut(&mut self) -> &mut Connection {
        self.connection.as_mut().expect("lease already released")
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if let Some(conn) = self.connection.take() {
            let reusable = !self.broken
                && conn.state() == ConnectionState::Connected
                && !self.pool.closed.load(Ordering::Acquire);
            if reusable {
                let mut idle = self.pool.idle.lock().unwrap_or_else(|e| e.into_inner());
                idle.push(conn);
            } else {
                // Dropping the connection closes its socket; a broken peer
                // cannot be told about Forward Close anyway.
                debug!(endpoint = %self.pool.endpoint, "discarding leased connection");
            }
        }
        // The permit drops with the lease, waking the next waiter.
    }
}
