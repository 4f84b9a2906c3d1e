//! Synthetic work for running without a pool.
//!
//! Publishes a fresh header on a fixed epoch at a fixed interval. DAG sizes
//! follow the ethash growth schedule so the board sees realistic
//! dimensions; the seed is derived from the epoch number rather than the
//! real keccak chain, which the board never checks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::tracing::prelude::*;
use crate::types::{EpochContext, WorkPackage, H256, ETHASH};
use crate::u256::U256;
use crate::worker::{WorkFeed, WorkSource};

const DATASET_BYTES_INIT: u64 = 1 << 30;
const DATASET_BYTES_GROWTH: u64 = 1 << 23;
const CACHE_BYTES_INIT: u64 = 1 << 24;
const CACHE_BYTES_GROWTH: u64 = 1 << 17;
const MIX_BYTES: u64 = 128;
const HASH_BYTES: u64 = 64;

/// Full dataset size in bytes for `epoch`.
pub fn dag_size(epoch: u32) -> u64 {
    largest_prime_multiple(
        DATASET_BYTES_INIT + DATASET_BYTES_GROWTH * u64::from(epoch) - MIX_BYTES,
        MIX_BYTES,
    )
}

/// Light cache size in bytes for `epoch`.
pub fn light_size(epoch: u32) -> u64 {
    largest_prime_multiple(
        CACHE_BYTES_INIT + CACHE_BYTES_GROWTH * u64::from(epoch) - HASH_BYTES,
        HASH_BYTES,
    )
}

// Walk down in steps of two items until the item count is prime.
fn largest_prime_multiple(mut size: u64, item: u64) -> u64 {
    while !is_prime(size / item) {
        size -= 2 * item;
    }
    size
}

fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut d = 3;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 2;
    }
    true
}

/// Configuration for the dummy source.
#[derive(Debug, Clone)]
pub struct DummyConfig {
    pub epoch: u32,
    /// Time between new headers.
    pub interval: Duration,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            epoch: 0,
            interval: Duration::from_secs(30),
        }
    }
}

impl DummyConfig {
    /// Parse from environment variables.
    ///
    /// - `HBM_DUMMY_EPOCH`: epoch of the synthetic work (default: 0)
    /// - `HBM_DUMMY_INTERVAL_SECS`: seconds between headers (default: 30)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let epoch = match std::env::var("HBM_DUMMY_EPOCH") {
            Ok(v) => v.trim().parse().unwrap_or_else(|_| {
                warn!(value = %v, "Invalid HBM_DUMMY_EPOCH, using 0");
                defaults.epoch
            }),
            Err(_) => defaults.epoch,
        };
        let interval = match std::env::var("HBM_DUMMY_INTERVAL_SECS") {
            Ok(v) => match v.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    warn!(value = %v, "Invalid HBM_DUMMY_INTERVAL_SECS, using 30");
                    defaults.interval
                }
            },
            Err(_) => defaults.interval,
        };
        Self { epoch, interval }
    }
}

/// Fixed-epoch synthetic work generator.
pub struct DummySource {
    config: DummyConfig,
    tx: watch::Sender<Option<Arc<WorkPackage>>>,
    sequence: AtomicU64,
}

impl DummySource {
    pub fn new(config: DummyConfig) -> Self {
        Self {
            config,
            tx: watch::channel(None).0,
            sequence: AtomicU64::new(0),
        }
    }

    /// Publish the next synthetic work package.
    pub fn publish_next(&self) -> Arc<WorkPackage> {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let mut header = [0x5a; 32];
        header[..8].copy_from_slice(&seq.to_be_bytes());
        header[8..12].copy_from_slice(&self.config.epoch.to_be_bytes());

        let work = Arc::new(WorkPackage {
            header: H256(header),
            // Stricter than the core takes; it runs at the floor instead.
            boundary: H256::from(U256::max_shr(32)),
            start_nonce: seq << 40,
            epoch: self.config.epoch,
            algorithm: ETHASH.into(),
        });
        debug!(header = %work.header, seq, "new dummy work");
        self.tx.send_replace(Some(Arc::clone(&work)));
        work
    }

    /// Publish work every interval until shutdown.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            epoch = self.config.epoch,
            interval_s = self.config.interval.as_secs(),
            "dummy work source started"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.publish_next();
                }
                _ = shutdown.cancelled() => break,
            }
        }
        debug!("dummy work source stopped");
    }
}

#[async_trait]
impl WorkSource for DummySource {
    fn subscribe(&self) -> WorkFeed {
        self.tx.subscribe()
    }

    async fn epoch_context(&self, epoch: u32) -> Option<EpochContext> {
        if epoch != self.config.epoch {
            return None;
        }
        let mut seed = [0; 32];
        seed[28..].copy_from_slice(&epoch.to_be_bytes());
        Some(EpochContext {
            epoch,
            dag_size: dag_size(epoch),
            light_size: light_size(epoch),
            seed: H256(seed),
            light_cache: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;
    use test_case::test_case;

    use super::*;

    // Published ethash sizes.
    #[test_case(0, 1_073_739_904, 16_776_896; "epoch_0")]
    #[test_case(1, 1_082_130_304, 16_907_456; "epoch_1")]
    fn ethash_sizes(epoch: u32, dag: u64, light: u64) {
        assert_eq!(dag_size(epoch), dag);
        assert_eq!(light_size(epoch), light);
    }

    #[test]
    fn test_sizes_are_prime_item_counts() {
        for epoch in [10, 100, 400] {
            assert!(is_prime(dag_size(epoch) / MIX_BYTES), "epoch {}", epoch);
            assert!(is_prime(light_size(epoch) / HASH_BYTES), "epoch {}", epoch);
        }
    }

    #[tokio::test]
    async fn test_headers_change_each_publish() {
        let source = DummySource::new(DummyConfig {
            epoch: 7,
            ..Default::default()
        });
        let mut feed = source.subscribe();
        assert!(feed.borrow().is_none());

        let first = source.publish_next();
        assert!(feed.has_changed().unwrap());
        let seen = feed.borrow_and_update().clone().unwrap();
        assert_eq!(seen.header, first.header);
        assert!(seen.is_ethash());
        assert_eq!(seen.epoch, 7);

        let second = source.publish_next();
        assert_ne!(first.header, second.header);
        assert_ne!(first.start_nonce, second.start_nonce);
    }

    #[tokio::test]
    async fn test_context_only_for_own_epoch() {
        let source = DummySource::new(DummyConfig {
            epoch: 2,
            ..Default::default()
        });
        let ctx = source.epoch_context(2).await.unwrap();
        assert_eq!(ctx.dag_size, dag_size(2));
        assert_eq!(ctx.light_size, light_size(2));
        assert!(ctx.light_cache.is_none());
        assert!(source.epoch_context(3).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_publishes_until_shutdown() {
        let source = Arc::new(DummySource::new(DummyConfig {
            epoch: 0,
            interval: Duration::from_secs(10),
        }));
        let mut feed = source.subscribe();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let source = Arc::clone(&source);
            let shutdown = shutdown.clone();
            async move { source.run(shutdown).await }
        });

        feed.changed().await.unwrap();
        tokio::time::sleep(Duration::from_secs(25)).await;
        shutdown.cancel();
        task.await.unwrap();

        // Immediate first tick, then one every 10s.
        assert_eq!(source.sequence.load(Ordering::Relaxed), 3);
    }

    #[test]
    #[serial]
    fn test_config_from_env() {
        std::env::set_var("HBM_DUMMY_EPOCH", "12");
        std::env::set_var("HBM_DUMMY_INTERVAL_SECS", "0");
        let config = DummyConfig::from_env();
        std::env::remove_var("HBM_DUMMY_EPOCH");
        std::env::remove_var("HBM_DUMMY_INTERVAL_SECS");

        assert_eq!(config.epoch, 12);
        assert_eq!(config.interval, Duration::from_secs(30));
    }
}
