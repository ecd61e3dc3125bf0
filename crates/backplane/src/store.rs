//! Opaque list surface of the backplane store.
//!
//! Contract:
//! - `move_one` is a single-RTT atomic pop-one-push-other; emulating it with
//!   separate pop and push calls loses entries on a crash between the two and
//!   is a correctness violation;
//! - `blocking_move_one` is the same move, waiting server-side up to the
//!   timeout for an entry to arrive;
//! - `disconnect` forcibly closes the transport so a server-side wait
//!   unblocks; callers reconnect implicitly on the next request.
//!
//! Transport failures surface as [`FfxError::Transient`]; the caller retries.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ffx_common::{FfxError, Result};
use tokio::sync::Notify;

/// End of a backplane list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Head of the list.
    Left,
    /// Tail of the list.
    Right,
}

/// Async list primitives the backplane exposes.
#[async_trait]
pub trait ListStore: Send + Sync {
    /// Push `value` onto the head of `key`.
    async fn push_head(&self, key: &str, value: &str) -> Result<()>;

    /// Atomically pop one element of `src` at `from` and push it onto `dst`
    /// at `to`. Returns the moved element, or `None` if `src` was empty.
    async fn move_one(
        &self,
        src: &str,
        dst: &str,
        from: Direction,
        to: Direction,
    ) -> Result<Option<String>>;

    /// [`ListStore::move_one`], waiting up to `timeout` for an element to
    /// arrive. Returns `None` on timeout.
    async fn blocking_move_one(
        &self,
        src: &str,
        dst: &str,
        from: Direction,
        to: Direction,
        timeout: Duration,
    ) -> Result<Option<String>>;

    /// Remove occurrences of `value` from `key` with Redis LREM semantics:
    /// `count > 0` removes up to `count` scanning head to tail, `count < 0`
    /// scans tail to head, `count == 0` removes all. Returns removed count.
    async fn remove(&self, key: &str, count: i64, value: &str) -> Result<u64>;

    /// Length of the list at `key`.
    async fn len(&self, key: &str) -> Result<u64>;

    /// Inclusive range of elements, with negative indices counting from the
    /// tail.
    async fn range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;

    /// Forcibly close the transport, failing any server-side wait in flight.
    async fn disconnect(&self);
}

fn transient(e: redis::RedisError) -> FfxError {
    FfxError::Transient(e.to_string())
}

fn redis_direction(d: Direction) -> redis::Direction {
    match d {
        Direction::Left => redis::Direction::Left,
        Direction::Right => redis::Direction::Right,
    }
}

/// Redis-backed [`ListStore`].
///
/// Non-blocking commands share one managed multiplexed connection. Every
/// blocking command gets a dedicated connection whose socket driver is
/// registered with the store, so `disconnect` can abort the driver and close
/// the socket out from under an in-flight server-side wait; the interrupted
/// command surfaces `Transient`.
pub struct RedisListStore {
    client: redis::Client,
    conn: tokio::sync::Mutex<Option<redis::aio::MultiplexedConnection>>,
    next_blocking_id: AtomicU64,
    blocking_drivers: std::sync::Mutex<HashMap<u64, tokio::task::JoinHandle<()>>>,
}

impl RedisListStore {
    /// Connect to a Redis endpoint (for example `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| FfxError::InvalidConfig(format!("invalid backplane url: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(transient)?;
        Ok(Self {
            client,
            conn: tokio::sync::Mutex::new(Some(conn)),
            next_blocking_id: AtomicU64::new(0),
            blocking_drivers: std::sync::Mutex::new(HashMap::new()),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(transient)?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Open a dedicated connection for one blocking command, spawning its
    /// driver under the store's control so `disconnect` can kill it.
    async fn blocking_connection(&self) -> Result<(u64, redis::aio::MultiplexedConnection)> {
        let (conn, driver) = self
            .client
            .create_multiplexed_tokio_connection()
            .await
            .map_err(transient)?;
        let id = self.next_blocking_id.fetch_add(1, Ordering::Relaxed);
        let driver = tokio::spawn(driver);
        self.blocking_drivers
            .lock()
            .expect("blocking drivers")
            .insert(id, driver);
        Ok((id, conn))
    }

    /// Tear down the dedicated connection once its blocking command is done.
    fn close_blocking_connection(&self, id: u64) {
        if let Some(driver) = self
            .blocking_drivers
            .lock()
            .expect("blocking drivers")
            .remove(&id)
        {
            driver.abort();
        }
    }
}

#[async_trait]
impl ListStore for RedisListStore {
    async fn push_head(&self, key: &str, value: &str) -> Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.connection().await?;
        let _: i64 = conn.lpush(key, value).await.map_err(transient)?;
        Ok(())
    }

    async fn move_one(
        &self,
        src: &str,
        dst: &str,
        from: Direction,
        to: Direction,
    ) -> Result<Option<String>> {
        use redis::AsyncCommands;
        let mut conn = self.connection().await?;
        let moved: Option<String> = conn
            .lmove(src, dst, redis_direction(from), redis_direction(to))
            .await
            .map_err(transient)?;
        Ok(moved)
    }

    async fn blocking_move_one(
        &self,
        src: &str,
        dst: &str,
        from: Direction,
        to: Direction,
        timeout: Duration,
    ) -> Result<Option<String>> {
        use redis::AsyncCommands;
        // A blocking command would stall every other request on the shared
        // multiplexed connection, and its socket must stay reachable for
        // `disconnect`. Run it on a dedicated registered connection instead.
        let (id, mut conn) = self.blocking_connection().await?;
        let moved: redis::RedisResult<Option<String>> = conn
            .blmove(
                src,
                dst,
                redis_direction(from),
                redis_direction(to),
                timeout.as_secs_f64(),
            )
            .await;
        self.close_blocking_connection(id);
        moved.map_err(transient)
    }

    async fn remove(&self, key: &str, count: i64, value: &str) -> Result<u64> {
        use redis::AsyncCommands;
        let mut conn = self.connection().await?;
        let removed: i64 = conn
            .lrem(key, count as isize, value)
            .await
            .map_err(transient)?;
        Ok(removed.max(0) as u64)
    }

    async fn len(&self, key: &str) -> Result<u64> {
        use redis::AsyncCommands;
        let mut conn = self.connection().await?;
        let len: i64 = conn.llen(key).await.map_err(transient)?;
        Ok(len.max(0) as u64)
    }

    async fn range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        use redis::AsyncCommands;
        let mut conn = self.connection().await?;
        let entries: Vec<String> = conn
            .lrange(key, start as isize, stop as isize)
            .await
            .map_err(transient)?;
        Ok(entries)
    }

    async fn disconnect(&self) {
        // Drop the managed connection; the next request reconnects.
        self.conn.lock().await.take();
        // Abort the socket drivers of in-flight blocking commands. Closing
        // the socket unblocks the server-side wait; the interrupted command
        // errors and surfaces as `Transient`.
        let drivers: Vec<tokio::task::JoinHandle<()>> = self
            .blocking_drivers
            .lock()
            .expect("blocking drivers")
            .drain()
            .map(|(_, driver)| driver)
            .collect();
        for driver in drivers {
            driver.abort();
        }
    }
}

/// In-process [`ListStore`] for tests and embedded use.
///
/// Models a single client connection: `disconnect` fails the next (or
/// current) server-side wait with `Transient`, the way a severed socket
/// would, and subsequent requests see a fresh connection.
pub struct MemoryListStore {
    lists: std::sync::Mutex<HashMap<String, VecDeque<String>>>,
    changed: Notify,
    reset: AtomicBool,
}

impl MemoryListStore {
    /// Build an empty store.
    pub fn new() -> Self {
        Self {
            lists: std::sync::Mutex::new(HashMap::new()),
            changed: Notify::new(),
            reset: AtomicBool::new(false),
        }
    }

    fn move_one_locked(
        &self,
        src: &str,
        dst: &str,
        from: Direction,
        to: Direction,
    ) -> Option<String> {
        let mut lists = self.lists.lock().expect("lists lock");
        let val = {
            let src_list = lists.get_mut(src)?;
            match from {
                Direction::Left => src_list.pop_front(),
                Direction::Right => src_list.pop_back(),
            }?
        };
        let dst_list = lists.entry(dst.to_string()).or_default();
        match to {
            Direction::Left => dst_list.push_front(val.clone()),
            Direction::Right => dst_list.push_back(val.clone()),
        }
        Some(val)
    }
}

impl Default for MemoryListStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ListStore for MemoryListStore {
    async fn push_head(&self, key: &str, value: &str) -> Result<()> {
        self.lists
            .lock()
            .expect("lists lock")
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        self.changed.notify_waiters();
        Ok(())
    }

    async fn move_one(
        &self,
        src: &str,
        dst: &str,
        from: Direction,
        to: Direction,
    ) -> Result<Option<String>> {
        let moved = self.move_one_locked(src, dst, from, to);
        if moved.is_some() {
            self.changed.notify_waiters();
        }
        Ok(moved)
    }

    async fn blocking_move_one(
        &self,
        src: &str,
        dst: &str,
        from: Direction,
        to: Direction,
        timeout: Duration,
    ) -> Result<Option<String>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register for wakeups before inspecting state; a notify_waiters
            // between the inspection and the await would otherwise be lost.
            notified.as_mut().enable();
            if self.reset.swap(false, Ordering::SeqCst) {
                return Err(FfxError::Transient("connection reset by peer".to_string()));
            }
            if let Some(val) = self.move_one_locked(src, dst, from, to) {
                self.changed.notify_waiters();
                return Ok(Some(val));
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn remove(&self, key: &str, count: i64, value: &str) -> Result<u64> {
        let mut lists = self.lists.lock().expect("lists lock");
        let Some(list) = lists.get_mut(key) else {
            return Ok(0);
        };
        let limit = if count == 0 {
            usize::MAX
        } else {
            count.unsigned_abs() as usize
        };
        let mut removed = 0usize;
        if count < 0 {
            for i in (0..list.len()).rev() {
                if removed == limit {
                    break;
                }
                if list[i] == value {
                    list.remove(i);
                    removed += 1;
                }
            }
        } else {
            let mut i = 0;
            while i < list.len() && removed < limit {
                if list[i] == value {
                    list.remove(i);
                    removed += 1;
                } else {
                    i += 1;
                }
            }
        }
        Ok(removed as u64)
    }

    async fn len(&self, key: &str) -> Result<u64> {
        let lists = self.lists.lock().expect("lists lock");
        Ok(lists.get(key).map_or(0, |l| l.len() as u64))
    }

    async fn range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let lists = self.lists.lock().expect("lists lock");
        let Some(list) = lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = list.len() as i64;
        let normalize = |idx: i64| -> i64 {
            if idx < 0 {
                (len + idx).max(0)
            } else {
                idx
            }
        };
        let start = normalize(start);
        let stop = normalize(stop).min(len - 1);
        if len == 0 || start > stop {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn disconnect(&self) {
        self.reset.store(true, Ordering::SeqCst);
        self.changed.notify_waiters();
    }
}
