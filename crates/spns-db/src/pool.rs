//! Bounded idle pool of database connections.
//!
//! The pool keeps a deque of `(connection, idle-since)` pairs. `get()` pops
//! the most-recently-used connection so that older entries age toward the
//! idle cutoff, probes it, and discards it if dead. Trimming to `max_idle`
//! and `max_idle_time` happens on every acquisition and release; there is
//! no background reaper.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rusqlite::{Connection, OpenFlags};

use crate::{configure, migrations, Result};

/// Default cap on idle connections kept alive.
pub const DEFAULT_MAX_IDLE: i32 = 8;

/// Default idle-age cutoff.
pub const DEFAULT_MAX_IDLE_TIME: Duration = Duration::from_secs(10 * 60);

enum Source {
    Path(PathBuf),
    /// Shared-cache in-memory database; the URI keeps every pooled
    /// connection pointed at the same data.
    Memory(String),
}

/// A pool of SQLite connections for one database.
pub struct Pool {
    source: Source,
    /// Maximum idle connections to retain; negative means unbounded, zero
    /// means none are kept at all.
    pub max_idle: i32,
    /// Idle age past which connections are dropped; zero disables the
    /// age check.
    pub max_idle_time: Duration,
    idle: Mutex<VecDeque<(Connection, Instant)>>,
    /// Anchor connection for in-memory databases (the database vanishes
    /// when the last connection closes).
    _anchor: Mutex<Option<Connection>>,
}

impl Pool {
    /// Open (creating if needed) the database at `path`, run migrations,
    /// and return a pool seeded with one idle connection.
    pub fn open(path: impl Into<PathBuf>) -> Result<Arc<Self>> {
        Self::build(Source::Path(path.into()), None)
    }

    /// Open a fresh private in-memory database (for tests).
    pub fn open_in_memory() -> Result<Arc<Self>> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);
        let uri = format!(
            "file:spnsmem{}?mode=memory&cache=shared",
            NEXT_ID.fetch_add(1, Ordering::Relaxed)
        );
        Self::build(Source::Memory(uri), None)
    }

    fn build(source: Source, max_idle: Option<i32>) -> Result<Arc<Self>> {
        let pool = Arc::new(Self {
            source,
            max_idle: max_idle.unwrap_or(DEFAULT_MAX_IDLE),
            max_idle_time: DEFAULT_MAX_IDLE_TIME,
            idle: Mutex::new(VecDeque::new()),
            _anchor: Mutex::new(None),
        });

        // First connection validates the database and runs migrations.
        let conn = pool.make_conn()?;
        migrations::run(&conn)?;
        if let Source::Memory(_) = pool.source {
            *pool._anchor.lock().expect("pool lock") = Some(pool.make_conn()?);
        }
        pool.release(conn);
        Ok(pool)
    }

    /// Get a connection, reusing an idle one when possible.
    ///
    /// Dead idle connections are discarded; excess idle connections are
    /// trimmed as a side effect.
    pub fn get(self: &Arc<Self>) -> Result<PooledConn> {
        let mut conn = None;
        while let Some(candidate) = self.pop_conn() {
            if candidate.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)) == Ok(1) {
                conn = Some(candidate);
                break;
            }
            tracing::debug!("discarding dead pooled connection");
        }
        self.clear_idle();

        let conn = match conn {
            Some(conn) => conn,
            None => self.make_conn()?,
        };
        Ok(PooledConn {
            pool: Arc::clone(self),
            conn: Some(conn),
        })
    }

    /// Return a connection to the idle queue.
    pub fn release(&self, conn: Connection) {
        {
            let mut idle = self.idle.lock().expect("pool lock");
            idle.push_back((conn, Instant::now()));
        }
        self.clear_idle();
    }

    /// Drop idle connections beyond `max_idle` or older than
    /// `max_idle_time`. Runs automatically on `get` and `release`.
    pub fn clear_idle(&self) {
        let mut idle = self.idle.lock().expect("pool lock");
        if self.max_idle >= 0 {
            while idle.len() > self.max_idle as usize {
                idle.pop_front();
            }
        }
        if self.max_idle_time > Duration::ZERO {
            if let Some(cutoff) = Instant::now().checked_sub(self.max_idle_time) {
                while idle.front().is_some_and(|(_, since)| *since < cutoff) {
                    idle.pop_front();
                }
            }
        }
    }

    /// Number of idle connections currently pooled.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().expect("pool lock").len()
    }

    fn pop_conn(&self) -> Option<Connection> {
        self.idle.lock().expect("pool lock").pop_back().map(|(c, _)| c)
    }

    fn make_conn(&self) -> Result<Connection> {
        tracing::debug!("creating database connection");
        let conn = match &self.source {
            Source::Path(path) => Connection::open(path)?,
            Source::Memory(uri) => Connection::open_with_flags(
                uri,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI,
            )?,
        };
        configure(&conn)?;
        Ok(conn)
    }
}

/// A pooled connection; returns itself to the pool on drop unless
/// [`close`](Self::close)d.
pub struct PooledConn {
    pool: Arc<Pool>,
    conn: Option<Connection>,
}

impl PooledConn {
    /// Destroy the underlying connection instead of returning it.
    pub fn close(mut self) {
        self.conn = None;
    }
}

impl Deref for PooledConn {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection taken")
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection taken")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
