//! Progress reporting and bandwidth limiting for part transfers.
//!

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota};
use std::fmt::{Debug, Formatter};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Bytes moved so far in a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataTransferStatus {
    /// Total bytes transferred, including bytes from a resumed checkpoint.
    pub consumed_bytes: u64,
    /// The size of the object.
    pub total_bytes: u64,
    /// Bytes transferred by the read or write that triggered this update.
    pub rw_once_bytes: u64,
}

/// Receives progress updates. Called concurrently from every worker.
pub trait DataTransferListener: Send + Sync {
    fn on_progress(&self, status: DataTransferStatus);
}

/// Limits the rate at which bytes are transferred.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Wait until `bytes` may be transferred.
    async fn acquire(&self, bytes: u64);
}

/// Limits bandwidth to a number of bytes per second, allowing bursts of up to one second.
pub struct BandwidthLimiter {
    limiter: DefaultDirectRateLimiter,
    burst: NonZeroU32,
}

impl BandwidthLimiter {
    /// Create a limiter for `bytes_per_second`, saturating at `u32::MAX`.
    pub fn new(bytes_per_second: u64) -> Self {
        let burst = NonZeroU32::new(u32::try_from(bytes_per_second).unwrap_or(u32::MAX))
            .unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_second(burst).allow_burst(burst);

        Self {
            limiter: governor::RateLimiter::direct(quota),
            burst,
        }
    }
}

impl Debug for BandwidthLimiter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BandwidthLimiter")
            .field("bytes_per_second", &self.burst)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RateLimiter for BandwidthLimiter {
    async fn acquire(&self, bytes: u64) {
        let mut remaining = bytes;
        while remaining > 0 {
            let cells = u32::try_from(remaining)
                .unwrap_or(u32::MAX)
                .min(self.burst.get());
            remaining -= u64::from(cells);

            let Some(cells) = NonZeroU32::new(cells) else {
                return;
            };
            // Never exceeds the burst, so capacity is always sufficient.
            if self.limiter.until_n_ready(cells).await.is_err() {
                return;
            }
        }
    }
}

/// Progress and rate limiting shared by the tasks of one transfer.
#[derive(Clone, Default)]
pub struct TransferControls {
    listener: Option<Arc<dyn DataTransferListener>>,
    limiter: Option<Arc<dyn RateLimiter>>,
    consumed: Arc<AtomicU64>,
    total: u64,
}

impl Debug for TransferControls {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferControls")
            .field("consumed", &self.consumed)
            .field("total", &self.total)
            .finish_non_exhaustive()
    }
}

impl TransferControls {
    /// Create controls for an object of `total` bytes where `consumed` bytes were already
    /// transferred by an earlier run.
    pub fn new(
        listener: Option<Arc<dyn DataTransferListener>>,
        limiter: Option<Arc<dyn RateLimiter>>,
        total: u64,
        consumed: u64,
    ) -> Self {
        Self {
            listener,
            limiter,
            consumed: Arc::new(AtomicU64::new(consumed)),
            total,
        }
    }

    /// Wait until `want` bytes may be transferred.
    pub async fn throttle(&self, want: u64) {
        if let Some(limiter) = &self.limiter {
            limiter.acquire(want).await;
        }
    }

    /// Record that `n` bytes were transferred.
    pub fn progress(&self, n: u64) {
        let consumed = self.consumed.fetch_add(n, Ordering::Relaxed) + n;
        if let Some(listener) = &self.listener {
            listener.on_progress(DataTransferStatus {
                consumed_bytes: consumed,
                total_bytes: self.total,
                rw_once_bytes: n,
            });
        }
    }

    /// Start the listener, reporting bytes already transferred.
    pub fn start(&self) {
        if let Some(listener) = &self.listener {
            listener.on_progress(DataTransferStatus {
                consumed_bytes: self.consumed.load(Ordering::Relaxed),
                total_bytes: self.total,
                rw_once_bytes: 0,
            });
        }
    }

    /// Get the bytes transferred so far.
    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<DataTransferStatus>>);

    impl DataTransferListener for Recorder {
        fn on_progress(&self, status: DataTransferStatus) {
            self.0.lock().unwrap().push(status);
        }
    }

    #[test]
    fn progress_accumulates() {
        let recorder = Arc::new(Recorder::default());
        let controls = TransferControls::new(Some(recorder.clone()), None, 100, 40);

        controls.start();
        controls.progress(10);
        controls.progress(50);

        let statuses = recorder.0.lock().unwrap();
        assert_eq!(statuses.len(), 3);
        assert_eq!(statuses[0].consumed_bytes, 40);
        assert_eq!(statuses[2].consumed_bytes, 100);
        assert_eq!(statuses[2].rw_once_bytes, 50);
        assert_eq!(controls.consumed(), 100);
    }

    #[tokio::test]
    async fn bandwidth_limiter_waits_after_burst() {
        let limiter = BandwidthLimiter::new(10_000);

        let start = Instant::now();
        limiter.acquire(10_000).await;
        assert!(start.elapsed() < Duration::from_millis(100));

        let start = Instant::now();
        limiter.acquire(5_000).await;
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn bandwidth_limiter_splits_large_requests() {
        let limiter = BandwidthLimiter::new(10_000);

        let start = Instant::now();
        limiter.acquire(15_000).await;
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn throttle_without_limiter_returns() {
        TransferControls::default().throttle(u64::MAX).await;
    }
}
