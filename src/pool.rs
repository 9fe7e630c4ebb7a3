//! Identity-keyed cache of constructed clients.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::client::{Client, HttpClientError};
use crate::clock::{Clock, SystemClock};
use crate::config::{ClientSettings, PoolConfig, TransportConfig};
use crate::error::{MgTransportError, Result};
use crate::ratelimit::{Limiter, TokenBucket};

/// Error message for a pool built without room for a single client.
pub const NEGATIVE_CAPACITY: &str = "capacity cannot be less than 1";

#[derive(Debug)]
struct Entry {
    client: Arc<Client>,
    expires_at: Instant,
}

/// A bounded cache of clients keyed by identity token.
///
/// A live entry is handed out as is; an expired or missing one is rebuilt
/// and stored with a fresh time-to-live. Every pooled client shares the
/// pool's limiter and HTTP connection pool, so quotas are tracked per
/// identity no matter how often a client is rebuilt.
#[derive(Debug)]
pub struct ClientPool {
    entries: DashMap<String, Entry>,
    capacity: usize,
    ttl: Duration,
    settings: ClientSettings,
    limiter: Arc<TokenBucket>,
    http: reqwest::Client,
    clock: Arc<dyn Clock>,
    closed: AtomicBool,
    /// Serializes inserts so the capacity check and the insert act as one.
    insert_lock: Mutex<()>,
}

impl ClientPool {
    /// Create a pool holding at most `capacity` clients, other settings default.
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_config(&TransportConfig {
            pool: PoolConfig {
                capacity,
                ..PoolConfig::default()
            },
            ..TransportConfig::default()
        })
    }

    /// Create a pool from a full transport configuration.
    pub fn with_config(config: &TransportConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a pool whose expiry and shared limiter run on `clock`.
    pub fn with_clock(config: &TransportConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        if config.pool.capacity < 1 {
            return Err(MgTransportError::Config(NEGATIVE_CAPACITY.into()));
        }

        let http = reqwest::Client::builder()
            .timeout(config.client.timeout())
            .build()
            .map_err(HttpClientError::transport)?;
        let limiter = Arc::new(TokenBucket::with_clock(
            &config.rate_limiting,
            clock.clone(),
        ));

        info!(
            capacity = config.pool.capacity,
            ttl = ?config.pool.ttl(),
            "Client pool initialized"
        );

        Ok(Self {
            entries: DashMap::new(),
            capacity: config.pool.capacity,
            ttl: config.pool.ttl(),
            settings: config.client.clone(),
            limiter,
            http,
            clock,
            closed: AtomicBool::new(false),
            insert_lock: Mutex::new(()),
        })
    }

    /// Return the client for `token`, building it when absent or expired.
    ///
    /// A cached client built for a different base URL is replaced.
    pub fn get(&self, token: &str, base_url: &str) -> Result<Arc<Client>> {
        if self.is_closed() {
            return Err(MgTransportError::PoolClosed);
        }

        let now = self.clock.now();
        if let Some(entry) = self.entries.get(token) {
            if now < entry.expires_at
                && entry.client.base_url() == base_url.trim_end_matches('/')
            {
                return Ok(entry.client.clone());
            }
        }

        let client = Arc::new(
            Client::builder(base_url, token)
                .settings(self.settings.clone())
                .limiter(self.limiter.clone() as Arc<dyn Limiter>)
                .http_client(self.http.clone())
                .build()?,
        );

        {
            let _guard = self.insert_lock.lock();
            if !self.entries.contains_key(token) {
                self.make_room(now);
            }

            // Concurrent rebuilds of the same identity: last write wins.
            self.entries.insert(
                token.to_owned(),
                Entry {
                    client: client.clone(),
                    expires_at: now + self.ttl,
                },
            );
        }
        debug!(cached = self.entries.len(), "Client constructed");

        Ok(client)
    }

    /// Drop the cached client for `token`, if any.
    pub fn remove(&self, token: &str) -> bool {
        self.entries.remove(token).is_some()
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(self.clock.now())
    }

    /// Release every cached client and stop the shared limiter.
    ///
    /// Later calls to [`ClientPool::get`] fail with
    /// [`MgTransportError::PoolClosed`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.entries.clear();
        self.limiter.close();
        info!("Client pool closed");
    }

    /// Close the pool and wait for the limiter's eviction task to exit.
    pub async fn shutdown(&self) {
        self.close();
        self.limiter.shutdown().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The limiter shared by every pooled client.
    pub fn limiter(&self) -> &Arc<TokenBucket> {
        &self.limiter
    }

    fn purge_expired_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| now < entry.expires_at);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "Expired clients purged");
        }
        removed
    }

    /// Free one slot when the pool is full: expired entries go first, then
    /// the entry closest to expiry.
    fn make_room(&self, now: Instant) {
        if self.entries.len() < self.capacity {
            return;
        }
        if self.purge_expired_at(now) > 0 && self.entries.len() < self.capacity {
            return;
        }

        let victim = self
            .entries
            .iter()
            .min_by_key(|entry| entry.expires_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = victim {
            self.entries.remove(&key);
            debug!("Client evicted to stay within capacity");
        }
    }
}

impl Drop for ClientPool {
    fn drop(&mut self) {
        self.limiter.close();
    }
}
