use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use http::Uri;
use tracing::debug;

use crate::error::Error;
use crate::http1::Http1Connector;
use crate::origin::PoolKey;
use crate::pool::{ConnectionPool, PoolOptions};
use crate::transport::{ConnectionConfig, Connector};
use crate::util::lock_unpoisoned;

pub(crate) const DEFAULT_NUM_POOLS: usize = 16;

struct PoolEntry {
    pool: Arc<ConnectionPool>,
    last_used_at: u64,
}

struct RegistryState {
    pools: BTreeMap<PoolKey, PoolEntry>,
    access_counter: u64,
}

/// Bounded LRU registry mapping pool keys to connection pools.
///
/// At most `num_pools` pools stay resident; touching a pool (hit or creation)
/// makes it most recently used, and inserting past capacity evicts and closes
/// the least recently used pool. One registry per client session; there is
/// no process-global instance.
pub struct PoolManager {
    num_pools: usize,
    pool_options: PoolOptions,
    connection_config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<RegistryState>,
}

impl PoolManager {
    pub fn new(
        num_pools: usize,
        pool_options: PoolOptions,
        connection_config: ConnectionConfig,
    ) -> Self {
        Self::with_connector(
            num_pools,
            pool_options,
            connection_config,
            Arc::new(Http1Connector),
        )
    }

    pub fn with_connector(
        num_pools: usize,
        pool_options: PoolOptions,
        connection_config: ConnectionConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            num_pools: num_pools.max(1),
            pool_options,
            connection_config,
            connector,
            state: Mutex::new(RegistryState {
                pools: BTreeMap::new(),
                access_counter: 0,
            }),
        }
    }

    pub fn connection_config(&self) -> &ConnectionConfig {
        &self.connection_config
    }

    pub fn pool_count(&self) -> usize {
        lock_unpoisoned(&self.state).pools.len()
    }

    /// Looks up the pool for `uri`'s origin, creating (and LRU-evicting) as
    /// needed.
    pub fn pool_for_uri(&self, uri: &Uri) -> Result<Arc<ConnectionPool>, Error> {
        let key = PoolKey::from_uri(uri, &self.connection_config)?;
        Ok(self.get_or_create(key))
    }

    pub fn get_or_create(&self, key: PoolKey) -> Arc<ConnectionPool> {
        let (pool, evicted) = {
            let mut state = lock_unpoisoned(&self.state);
            state.access_counter += 1;
            let stamp = state.access_counter;

            if let Some(entry) = state.pools.get_mut(&key) {
                entry.last_used_at = stamp;
                (Arc::clone(&entry.pool), None)
            } else {
                let evicted = if state.pools.len() >= self.num_pools {
                    evict_least_recently_used(&mut state.pools)
                } else {
                    None
                };
                let pool = Arc::new(ConnectionPool::new(
                    key.clone(),
                    self.pool_options,
                    Arc::clone(&self.connector),
                ));
                state.pools.insert(
                    key,
                    PoolEntry {
                        pool: Arc::clone(&pool),
                        last_used_at: stamp,
                    },
                );
                (pool, evicted)
            }
        };

        // Closing happens synchronously with eviction, but after the registry
        // lock is released: close touches sockets.
        if let Some(evicted) = evicted {
            debug!(key = %evicted.key(), "evicting least recently used pool");
            evicted.close_all();
        }
        pool
    }

    /// Evicts and closes every resident pool.
    pub fn clear(&self) {
        let drained: Vec<Arc<ConnectionPool>> = {
            let mut state = lock_unpoisoned(&self.state);
            let pools = std::mem::take(&mut state.pools);
            pools.into_values().map(|entry| entry.pool).collect()
        };
        for pool in drained {
            pool.close_all();
        }
    }
}

fn evict_least_recently_used(
    pools: &mut BTreeMap<PoolKey, PoolEntry>,
) -> Option<Arc<ConnectionPool>> {
    let oldest_key = pools
        .iter()
        .min_by_key(|(_, entry)| entry.last_used_at)
        .map(|(key, _)| key.clone())?;
    pools.remove(&oldest_key).map(|entry| entry.pool)
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("PoolManager")
            .field("num_pools", &self.num_pools)
            .field("pool_options", &self.pool_options)
            .field("resident", &self.pool_count())
            .finish()
    }
}
