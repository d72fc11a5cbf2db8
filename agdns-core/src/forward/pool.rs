// Copyright 2020 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Bounded LIFO connection pool with idle eviction on borrow. A hand-rolled
//! `Mutex<Vec<_>>` stack rather than a recycle-on-return pool crate, since
//! a borrowed connection needs to be discarded and redialed when its idle
//! time exceeds the timeout before it is handed back to the caller.
//! `PooledConn` holds no reference back to the pool; callers explicitly
//! `put` it back, which keeps pool and connection from owning each other.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::error::{ForwardError, Result};

/// Default bounded pool capacity (§4.1).
pub const DEFAULT_POOL_CAPACITY: usize = 1024;
/// Default idle timeout before a pooled connection is discarded on borrow
/// (§4.1 "Idle connections older than `IdleTimeout` ... discarded").
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// A factory capable of dialing a fresh connection of type `C`.
#[async_trait]
pub trait ConnFactory: Send + Sync {
    /// Connection type this factory produces.
    type Conn: Send + 'static;

    /// Dial a fresh connection, honoring `deadline` if given.
    async fn dial(&self, deadline: Option<Instant>) -> Result<Self::Conn>;
}

/// A connection wrapped with its last-used timestamp (§3 `PooledConn`).
pub struct PooledConn<C> {
    conn: C,
    last_used: Instant,
}

impl<C> PooledConn<C> {
    fn fresh(conn: C) -> Self {
        Self {
            conn,
            last_used: Instant::now(),
        }
    }

    /// Borrow the underlying connection.
    pub fn get(&mut self) -> &mut C {
        &mut self.conn
    }

    /// Consume the wrapper, returning the underlying connection.
    pub fn into_inner(self) -> C {
        self.conn
    }
}

enum Slots<C> {
    Open(Vec<PooledConn<C>>),
    Closed,
}

/// Bounded LIFO pool of reusable connections for one (address, network)
/// pair (§3 `UpstreamPool`).
pub struct UpstreamPool<F: ConnFactory> {
    factory: F,
    capacity: usize,
    idle_timeout: Duration,
    slots: Mutex<Slots<F::Conn>>,
}

impl<F: ConnFactory> UpstreamPool<F> {
    /// Build a pool with the default capacity and idle timeout.
    pub fn new(factory: F) -> Self {
        Self::with_params(factory, DEFAULT_POOL_CAPACITY, DEFAULT_IDLE_TIMEOUT)
    }

    /// Build a pool with explicit capacity and idle timeout.
    pub fn with_params(factory: F, capacity: usize, idle_timeout: Duration) -> Self {
        Self {
            factory,
            capacity,
            idle_timeout,
            slots: Mutex::new(Slots::Open(Vec::with_capacity(capacity.min(64)))),
        }
    }

    /// Borrow a connection: pop the most-recently-returned one (LIFO) if
    /// it is not stale; otherwise dial a fresh one via the factory,
    /// honoring `deadline` (§4.1 step 3 "borrow a UDP connection from the
    /// UDP pool (or dial a fresh one)").
    pub async fn get(&self, deadline: Option<Instant>) -> Result<PooledConn<F::Conn>> {
        let popped = {
            let mut slots = self.slots.lock().await;
            match &mut *slots {
                Slots::Closed => return Err(ForwardError::PoolClosed),
                Slots::Open(v) => v.pop(),
            }
        };
        match popped {
            Some(mut pc) => {
                if pc.last_used.elapsed() > self.idle_timeout {
                    // Stale: the remote end may have silently timed us out.
                    // Discard and dial fresh rather than risk a dead socket.
                    drop(pc);
                    let conn = self.factory.dial(deadline).await?;
                    pc = PooledConn::fresh(conn);
                } else {
                    pc.last_used = Instant::now();
                }
                Ok(pc)
            }
            None => Ok(PooledConn::fresh(self.factory.dial(deadline).await?)),
        }
    }

    /// Return a connection to the pool. If the pool is closed or full, the
    /// connection is dropped (closed) instead (§3 "`Put` on a closed pool
    /// closes the connection").
    pub async fn put(&self, mut pc: PooledConn<F::Conn>) {
        pc.last_used = Instant::now();
        let mut slots = self.slots.lock().await;
        match &mut *slots {
            Slots::Closed => drop(pc),
            Slots::Open(v) => {
                if v.len() < self.capacity {
                    v.push(pc);
                } else {
                    drop(pc);
                }
            }
        }
    }

    /// Drain and close every pooled connection; all future `get`/`put`
    /// calls return/no-op against the closed sentinel (§3, §4.1).
    pub async fn close(&self) {
        let mut slots = self.slots.lock().await;
        *slots = Slots::Closed;
    }

    /// Number of idle connections currently held (for tests / diagnostics).
    pub async fn idle_len(&self) -> usize {
        match &*self.slots.lock().await {
            Slots::Open(v) => v.len(),
            Slots::Closed => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingFactory(Arc<AtomicUsize>);

    #[async_trait]
    impl ConnFactory for CountingFactory {
        type Conn = u32;
        async fn dial(&self, _deadline: Option<Instant>) -> Result<u32> {
            Ok(self.0.fetch_add(1, Ordering::SeqCst) as u32)
        }
    }

    #[tokio::test]
    async fn reuses_pooled_connection_when_fresh() {
        let dials = Arc::new(AtomicUsize::new(0));
        let pool = UpstreamPool::with_params(
            CountingFactory(dials.clone()),
            4,
            Duration::from_secs(30),
        );
        let conn = pool.get(None).await.unwrap();
        pool.put(conn).await;
        assert_eq!(pool.idle_len().await, 1);
        let _conn = pool.get(None).await.unwrap();
        assert_eq!(dials.load(Ordering::SeqCst), 1, "second get should reuse, not dial again");
    }

    #[tokio::test]
    async fn discards_stale_connection_on_borrow() {
        let dials = Arc::new(AtomicUsize::new(0));
        let pool = UpstreamPool::with_params(
            CountingFactory(dials.clone()),
            4,
            Duration::from_millis(1),
        );
        let conn = pool.get(None).await.unwrap();
        pool.put(conn).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let _conn = pool.get(None).await.unwrap();
        assert_eq!(dials.load(Ordering::SeqCst), 2, "stale conn must be redialed");
    }

    #[tokio::test]
    async fn put_drops_connection_once_full() {
        let dials = Arc::new(AtomicUsize::new(0));
        let pool = UpstreamPool::with_params(CountingFactory(dials), 1, Duration::from_secs(30));
        let a = pool.get(None).await.unwrap();
        let b = pool.get(None).await.unwrap();
        pool.put(a).await;
        pool.put(b).await;
        assert_eq!(pool.idle_len().await, 1, "pool conservation: never exceed capacity");
    }

    #[tokio::test]
    async fn close_drains_and_future_gets_fail() {
        let dials = Arc::new(AtomicUsize::new(0));
        let pool = UpstreamPool::with_params(CountingFactory(dials), 4, Duration::from_secs(30));
        let conn = pool.get(None).await.unwrap();
        pool.put(conn).await;
        pool.close().await;
        assert!(pool.get(None).await.is_err());
    }
}
