use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;

use super::Config;

/// Live tunables shared by pools, adaptive managers and coordinators
///
/// Readers never block. Worker-count changes are also published on a
/// watch channel so pools can resize.
#[derive(Debug)]
pub struct RuntimeTunables {
    num_workers: AtomicUsize,
    idle_timeout_ms: AtomicU64,
    transaction_idle_timeout_ms: AtomicU64,
    max_lifespan_secs: AtomicU64,
    max_requests: AtomicU64,
    sat_threshold_ms: AtomicU64,
    sat_throttle_rate: AtomicU32,
    workers_tx: watch::Sender<usize>,
}

impl RuntimeTunables {
    pub fn new(config: &Config) -> Self {
        let (workers_tx, _) = watch::channel(config.pool.num_workers);
        Self {
            num_workers: AtomicUsize::new(config.pool.num_workers),
            idle_timeout_ms: AtomicU64::new(config.session.idle_timeout_ms),
            transaction_idle_timeout_ms: AtomicU64::new(config.session.transaction_idle_timeout_ms),
            max_lifespan_secs: AtomicU64::new(config.pool.max_lifespan_per_child_secs),
            max_requests: AtomicU64::new(config.pool.max_requests_per_child),
            sat_threshold_ms: AtomicU64::new(config.saturation.recover_threshold_ms),
            sat_throttle_rate: AtomicU32::new(config.saturation.recover_throttle_rate),
            workers_tx,
        }
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers.load(Ordering::Relaxed)
    }

    /// Change the per-shard worker count; pools resize asynchronously
    pub fn set_num_workers(&self, n: usize) {
        self.num_workers.store(n, Ordering::Relaxed);
        self.workers_tx.send_replace(n);
    }

    pub fn subscribe_num_workers(&self) -> watch::Receiver<usize> {
        self.workers_tx.subscribe()
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn transaction_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_idle_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_idle_timeouts(&self, idle: Duration, in_transaction: Duration) {
        self.idle_timeout_ms
            .store(idle.as_millis() as u64, Ordering::Relaxed);
        self.transaction_idle_timeout_ms
            .store(in_transaction.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn max_lifespan(&self) -> Duration {
        Duration::from_secs(self.max_lifespan_secs.load(Ordering::Relaxed))
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests.load(Ordering::Relaxed)
    }

    pub fn saturation_threshold(&self) -> Duration {
        Duration::from_millis(self.sat_threshold_ms.load(Ordering::Relaxed))
    }

    pub fn saturation_throttle_rate(&self) -> u32 {
        self.sat_throttle_rate.load(Ordering::Relaxed)
    }

    /// Rates above 100 disable saturation recovery
    pub fn set_saturation(&self, threshold: Duration, throttle_rate: u32) {
        let rate = if throttle_rate > 100 { 0 } else { throttle_rate };
        self.sat_threshold_ms
            .store(threshold.as_millis() as u64, Ordering::Relaxed);
        self.sat_throttle_rate.store(rate, Ordering::Relaxed);
    }

    /// Workers that saturation recovery may reclaim per second
    pub fn throttle_count(&self) -> u64 {
        u64::from(self.saturation_throttle_rate()) * self.num_workers() as u64 / 100
    }

    /// Interval between two saturation recovery passes, `None` when disabled
    pub fn saturation_interval(&self) -> Option<Duration> {
        let per_sec = self.throttle_count();
        if per_sec == 0 {
            return None;
        }
        Some(Duration::from_millis((1000 / per_sec).max(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saturation_interval() {
        let mut config = Config::default();
        config.pool.num_workers = 10;
        config.saturation.recover_throttle_rate = 40;
        let tunables = RuntimeTunables::new(&config);

        assert_eq!(tunables.throttle_count(), 4);
        assert_eq!(tunables.saturation_interval(), Some(Duration::from_millis(250)));

        tunables.set_saturation(Duration::from_millis(100), 0);
        assert_eq!(tunables.saturation_interval(), None);

        tunables.set_saturation(Duration::from_millis(100), 101);
        assert_eq!(tunables.saturation_throttle_rate(), 0);
    }

    #[tokio::test]
    async fn test_worker_count_is_published() {
        let tunables = RuntimeTunables::new(&Config::default());
        let mut rx = tunables.subscribe_num_workers();

        tunables.set_num_workers(9);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 9);
        assert_eq!(tunables.num_workers(), 9);
    }
}
