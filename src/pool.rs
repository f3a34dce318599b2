use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::connection::Connection;
use crate::error::Error;
use crate::origin::PoolKey;
use crate::transport::Connector;
use crate::util::lock_unpoisoned;

pub(crate) const DEFAULT_POOL_MAXSIZE: usize = 8;

/// Per-pool capacity and acquisition behavior.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolOptions {
    maxsize: usize,
    block: bool,
}

impl PoolOptions {
    pub fn maxsize(mut self, maxsize: usize) -> Self {
        self.maxsize = maxsize.max(1);
        self
    }

    /// Blocking mode: exhausted `acquire` calls wait for a release instead of
    /// failing immediately.
    pub const fn block(mut self, block: bool) -> Self {
        self.block = block;
        self
    }

    pub const fn configured_maxsize(&self) -> usize {
        self.maxsize
    }

    pub const fn configured_block(&self) -> bool {
        self.block
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            maxsize: DEFAULT_POOL_MAXSIZE,
            block: false,
        }
    }
}

struct PoolState {
    idle: VecDeque<Connection>,
    checked_out: usize,
    closed: bool,
}

impl PoolState {
    fn in_use(&self) -> usize {
        self.idle.len() + self.checked_out
    }
}

/// Bounded per-origin connection pool.
///
/// Hands out at most `maxsize` live-or-creatable connections. Bookkeeping is
/// guarded by one mutex per pool; connect/send/receive happen on the caller's
/// thread after acquisition, never under the lock.
pub struct ConnectionPool {
    key: PoolKey,
    options: PoolOptions,
    connector: Arc<dyn Connector>,
    state: Mutex<PoolState>,
    released: Condvar,
}

impl ConnectionPool {
    pub fn new(key: PoolKey, options: PoolOptions, connector: Arc<dyn Connector>) -> Self {
        Self {
            key,
            options,
            connector,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                checked_out: 0,
                closed: false,
            }),
            released: Condvar::new(),
        }
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    pub fn idle_count(&self) -> usize {
        lock_unpoisoned(&self.state).idle.len()
    }

    pub fn checked_out_count(&self) -> usize {
        lock_unpoisoned(&self.state).checked_out
    }

    /// Idle plus checked-out, read under one lock. Never exceeds `maxsize`.
    pub fn resident_count(&self) -> usize {
        lock_unpoisoned(&self.state).in_use()
    }

    /// Acquires a connection: most recently idle first (after a liveness
    /// probe), else a fresh closed connection while under capacity, else (in
    /// blocking mode) waits up to `timeout` for a release.
    ///
    /// `timeout` elapsing (or `None` timeout in fail-fast mode) yields
    /// [`Error::PoolExhausted`]; this never hangs past the deadline.
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<Connection, Error> {
        let wait_started_at = Instant::now();
        let deadline = timeout.map(|timeout| wait_started_at + timeout);
        let mut state = lock_unpoisoned(&self.state);

        loop {
            if state.closed {
                return Err(Error::PoolClosed {
                    key: self.key.to_string(),
                });
            }

            while let Some(mut connection) = state.idle.pop_back() {
                if connection.probe_alive() {
                    state.checked_out += 1;
                    return Ok(connection);
                }
                // Peer dropped the link while it sat idle. Not the caller's
                // failure: discard and fall through to creation.
                debug!(key = %self.key, "discarding dead idle connection");
                connection.close();
            }

            if state.in_use() < self.options.maxsize {
                state.checked_out += 1;
                return Ok(Connection::new(
                    self.key.origin().clone(),
                    self.key.config().clone(),
                    Arc::clone(&self.connector),
                ));
            }

            if !self.options.block {
                return Err(Error::PoolExhausted {
                    key: self.key.to_string(),
                    wait_ms: 0,
                });
            }

            state = match deadline {
                None => {
                    let guard = self.released.wait(state);
                    match guard {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    }
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::PoolExhausted {
                            key: self.key.to_string(),
                            wait_ms: wait_started_at.elapsed().as_millis(),
                        });
                    }
                    let guard = self.released.wait_timeout(state, deadline - now);
                    match guard {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    }
                }
            };
        }
    }

    /// Returns a checked-out connection. Reusable connections go back to the
    /// idle set unless it is already full; everything else is closed. Wakes
    /// one blocked acquirer either way.
    pub fn release(&self, connection: Connection) {
        let to_close = {
            let mut state = lock_unpoisoned(&self.state);
            state.checked_out = state.checked_out.saturating_sub(1);
            let leftover = if !state.closed
                && connection.is_reusable()
                && state.idle.len() < self.options.maxsize
            {
                state.idle.push_back(connection);
                None
            } else {
                Some(connection)
            };
            self.released.notify_one();
            leftover
        };
        if let Some(mut connection) = to_close {
            connection.close();
        }
    }

    /// Forcibly closes and discards a checked-out connection without
    /// returning it to the idle set.
    pub fn invalidate(&self, mut connection: Connection) {
        {
            let mut state = lock_unpoisoned(&self.state);
            state.checked_out = state.checked_out.saturating_sub(1);
            self.released.notify_one();
        }
        connection.close();
    }

    /// Closes every idle connection and refuses further acquisition.
    /// Checked-out connections close themselves on release.
    pub fn close_all(&self) {
        let drained: Vec<Connection> = {
            let mut state = lock_unpoisoned(&self.state);
            state.closed = true;
            self.released.notify_all();
            state.idle.drain(..).collect()
        };
        for mut connection in drained {
            connection.close();
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock_unpoisoned(&self.state);
        formatter
            .debug_struct("ConnectionPool")
            .field("key", &self.key)
            .field("maxsize", &self.options.maxsize)
            .field("block", &self.options.block)
            .field("idle", &state.idle.len())
            .field("checked_out", &state.checked_out)
            .field("closed", &state.closed)
            .finish()
    }
}
