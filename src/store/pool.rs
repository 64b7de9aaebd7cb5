//! SQLite connection pool.
//!
//! Connections are never shared across threads; each caller borrows a pooled
//! handle for the duration of one operation. `invalidate` (used by `clear`)
//! bumps an epoch so that handles checked out before the call are dropped on
//! return instead of being recycled.

use crate::error::Result;
use rusqlite::Connection;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Pool size: max(4, CPU count).
fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .max(4)
}

pub struct ConnectionPool {
    path: String,
    max_idle: usize,
    idle: Mutex<Vec<Connection>>,
    epoch: AtomicU64,
}

impl ConnectionPool {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            max_idle: default_pool_size(),
            idle: Mutex::new(Vec::new()),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Borrow a handle, reusing an idle connection when one is available.
    pub fn get(&self) -> Result<PooledConn<'_>> {
        let epoch = self.epoch.load(Ordering::Acquire);

        let reused = self.idle.lock().expect("pool mutex poisoned").pop();
        let conn = match reused {
            Some(conn) => conn,
            None => self.open()?,
        };

        Ok(PooledConn {
            pool: self,
            conn: Some(conn),
            epoch,
        })
    }

    /// Drop all pooled handles; outstanding ones are discarded on return.
    pub fn invalidate(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.idle.lock().expect("pool mutex poisoned").clear();
    }

    fn open(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(conn)
    }

    fn put_back(&self, conn: Connection, epoch: u64) {
        if self.epoch.load(Ordering::Acquire) != epoch {
            return; // Pool was invalidated while this handle was out.
        }
        let mut idle = self.idle.lock().expect("pool mutex poisoned");
        if idle.len() < self.max_idle {
            idle.push(conn);
        }
    }
}

/// A borrowed connection; returns to the pool on drop.
pub struct PooledConn<'a> {
    pool: &'a ConnectionPool,
    conn: Option<Connection>,
    epoch: u64,
}

impl Deref for PooledConn<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection taken")
    }
}

impl DerefMut for PooledConn<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection taken")
    }
}

impl Drop for PooledConn<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(conn, self.epoch);
        }
    }
}
