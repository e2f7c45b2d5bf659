//! # Cache Backend Contract
//!
//! Byte-oriented get/set with per-entry TTL — the surface the
//! thinking-signature interceptor stores against. Two backends ship: an
//! in-memory map for single instances and a Redis backend for fleets that
//! want signatures shared across replicas.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::error::RelayError;

/// Minimal cache contract: byte values, per-entry TTL.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RelayError>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), RelayError>;
}

/// In-memory backend with lazy expiry and a soft entry cap.
pub struct MemoryCache {
    entries: DashMap<String, (Vec<u8>, Instant)>,
    max_entries: usize,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    fn sweep_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, (_, expires)| *expires > now);
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RelayError> {
        if let Some(entry) = self.entries.get(key) {
            let (value, expires) = entry.value();
            if *expires > Instant::now() {
                return Ok(Some(value.clone()));
            }
        }
        // Expired entries are dropped on touch rather than by a sweeper.
        self.entries.remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), RelayError> {
        if self.entries.len() >= self.max_entries {
            self.sweep_expired();
            if self.entries.len() >= self.max_entries {
                // Still over the cap after expiry: shed an arbitrary entry.
                if let Some(victim) = self.entries.iter().next().map(|e| e.key().clone()) {
                    self.entries.remove(&victim);
                }
            }
        }
        self.entries
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }
}

/// Redis-backed cache for multi-instance deployments.
pub struct RedisCache {
    connection: redis::aio::MultiplexedConnection,
}

impl RedisCache {
    /// Connect to the given Redis URL.
    pub async fn connect(url: &str) -> Result<Self, RelayError> {
        let client = redis::Client::open(url).map_err(|e| RelayError::Cache {
            message: format!("invalid redis url: {e}"),
        })?;
        let connection = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| RelayError::Cache {
                message: format!("redis connect failed: {e}"),
            })?;
        Ok(Self { connection })
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RelayError> {
        let mut connection = self.connection.clone();
        redis::AsyncCommands::get(&mut connection, key)
            .await
            .map_err(|e| RelayError::Cache {
                message: format!("redis get failed: {e}"),
            })
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), RelayError> {
        let mut connection = self.connection.clone();
        redis::AsyncCommands::set_ex(&mut connection, key, value, ttl.as_secs().max(1))
            .await
            .map_err(|e| RelayError::Cache {
                message: format!("redis set failed: {e}"),
            })
    }
}
