//! Admission control for separation jobs.
//!
//! Each upload spawns one external separation process, and those are expensive. The
//! [`SeparationLimiter`] bounds how many tool runs happen at once and how many stored uploads
//! may queue for a run, so a burst of uploads degrades into HTTP 429s instead of exhausting the
//! host.
//!
//! Only the separation phase is gated. Request parsing and streaming the file to disk happen
//! before a slot is requested, so a slow uploader or a malformed request never holds one.
//!
//! Running and waiting counts are published as the `stemd_separation_jobs_running` and
//! `stemd_separation_jobs_waiting` gauges, and are available through [`SeparationLimiter::stats`].

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use metrics::gauge;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::config::SeparationLimitsConfig;
use crate::errors::{Error, Result};

/// Snapshot of the limiter's occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobStats {
    /// Tool runs currently holding a slot
    pub running: usize,
    /// Stored uploads queued for a slot
    pub waiting: usize,
    /// Configured number of slots
    pub capacity: usize,
}

#[derive(Debug, Default)]
struct JobCounts {
    running: AtomicUsize,
    waiting: AtomicUsize,
}

impl JobCounts {
    fn publish(&self) {
        gauge!("stemd_separation_jobs_running").set(self.running.load(Ordering::SeqCst) as f64);
        gauge!("stemd_separation_jobs_waiting").set(self.waiting.load(Ordering::SeqCst) as f64);
    }
}

/// Gate in front of the separation tool.
#[derive(Debug)]
pub struct SeparationLimiter {
    slots: Arc<Semaphore>,
    capacity: usize,
    counts: Arc<JobCounts>,
    /// `None` means any number of uploads may queue
    max_waiting: Option<usize>,
    max_wait: Duration,
}

impl SeparationLimiter {
    /// Returns `None` when `max_concurrent_jobs` is 0, i.e. every request runs the tool
    /// immediately. A `max_waiting_jobs` of 0 leaves the queue unbounded.
    pub fn new(config: &SeparationLimitsConfig) -> Option<Self> {
        if config.max_concurrent_jobs == 0 {
            return None;
        }

        let limiter = Self {
            slots: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
            capacity: config.max_concurrent_jobs,
            counts: Arc::new(JobCounts::default()),
            max_waiting: (config.max_waiting_jobs > 0).then_some(config.max_waiting_jobs),
            max_wait: Duration::from_secs(config.max_job_wait_secs),
        };
        limiter.counts.publish();
        Some(limiter)
    }

    pub fn stats(&self) -> JobStats {
        JobStats {
            running: self.counts.running.load(Ordering::SeqCst),
            waiting: self.counts.waiting.load(Ordering::SeqCst),
            capacity: self.capacity,
        }
    }

    /// Wait for a slot to run the separation tool.
    ///
    /// Fails with [`Error::TooManyRequests`] when the queue is full, when no slot frees up within
    /// `max_job_wait_secs`, or immediately when that wait is 0 and every slot is taken. Dropping
    /// the returned future gives up the queue position.
    pub async fn acquire(&self) -> Result<JobPermit> {
        if let Ok(slot) = self.slots.clone().try_acquire_owned() {
            return Ok(self.start(slot));
        }

        let _queued = self.enqueue()?;
        if self.max_wait.is_zero() {
            return Err(busy());
        }

        debug!(waiting = self.counts.waiting.load(Ordering::SeqCst), "Waiting for a separation slot");
        let slot = tokio::time::timeout(self.max_wait, self.slots.clone().acquire_owned())
            .await
            .map_err(|_| Error::TooManyRequests {
                message: "Timed out waiting for a processing slot. Please retry later.".to_string(),
            })?
            .map_err(|_| Error::TooManyRequests {
                message: "Separation service temporarily unavailable.".to_string(),
            })?;

        Ok(self.start(slot))
    }

    fn enqueue(&self) -> Result<QueueSpot<'_>> {
        let max_waiting = self.max_waiting;
        self.counts
            .waiting
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |waiting| match max_waiting {
                Some(max) if waiting >= max => None,
                _ => Some(waiting + 1),
            })
            .map_err(|_| busy())?;
        self.counts.publish();
        Ok(QueueSpot { counts: &self.counts })
    }

    fn start(&self, slot: OwnedSemaphorePermit) -> JobPermit {
        self.counts.running.fetch_add(1, Ordering::SeqCst);
        self.counts.publish();
        JobPermit {
            _slot: slot,
            counts: self.counts.clone(),
        }
    }
}

fn busy() -> Error {
    Error::TooManyRequests {
        message: "Too many files being processed. Please retry later.".to_string(),
    }
}

/// A place in the queue; released on drop, including when the waiting request is cancelled.
struct QueueSpot<'a> {
    counts: &'a JobCounts,
}

impl Drop for QueueSpot<'_> {
    fn drop(&mut self) {
        self.counts.waiting.fetch_sub(1, Ordering::SeqCst);
        self.counts.publish();
    }
}

/// One running separation. The slot is released when this is dropped.
#[must_use]
pub struct JobPermit {
    _slot: OwnedSemaphorePermit,
    counts: Arc<JobCounts>,
}

impl Drop for JobPermit {
    fn drop(&mut self) {
        self.counts.running.fetch_sub(1, Ordering::SeqCst);
        self.counts.publish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_concurrent_jobs: usize, max_waiting_jobs: usize, max_job_wait_secs: u64) -> Arc<SeparationLimiter> {
        Arc::new(
            SeparationLimiter::new(&SeparationLimitsConfig {
                max_concurrent_jobs,
                max_waiting_jobs,
                max_job_wait_secs,
            })
            .unwrap(),
        )
    }

    fn assert_busy(result: Result<JobPermit>, expected: &str) {
        match result {
            Err(Error::TooManyRequests { message }) => assert!(message.contains(expected), "unexpected message: {message}"),
            Err(other) => panic!("Expected TooManyRequests, got {other:?}"),
            Ok(_) => panic!("Expected TooManyRequests, got a permit"),
        }
    }

    #[test]
    fn test_zero_jobs_means_no_limiter() {
        assert!(
            SeparationLimiter::new(&SeparationLimitsConfig {
                max_concurrent_jobs: 0,
                ..Default::default()
            })
            .is_none()
        );
    }

    #[tokio::test]
    async fn test_stats_track_running_jobs() {
        let limiter = limiter(2, 4, 60);
        assert_eq!(
            limiter.stats(),
            JobStats {
                running: 0,
                waiting: 0,
                capacity: 2
            }
        );

        let first = limiter.acquire().await.unwrap();
        let second = limiter.acquire().await.unwrap();
        assert_eq!(limiter.stats().running, 2);

        drop(first);
        assert_eq!(limiter.stats().running, 1);
        drop(second);
        assert_eq!(limiter.stats().running, 0);
    }

    #[tokio::test]
    async fn test_queued_upload_runs_when_slot_frees() {
        let limiter = limiter(1, 4, 5);
        let running = limiter.acquire().await.unwrap();

        let queued = tokio::spawn({
            let limiter = limiter.clone();
            async move { limiter.acquire().await.map(|_permit| ()) }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(limiter.stats().waiting, 1);

        drop(running);

        assert!(queued.await.unwrap().is_ok());
        assert_eq!(limiter.stats().waiting, 0);
        assert_eq!(limiter.stats().running, 0);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_without_waiting() {
        let limiter = limiter(1, 1, 60);
        let _running = limiter.acquire().await.unwrap();

        let _queued = tokio::spawn({
            let limiter = limiter.clone();
            async move { limiter.acquire().await.map(|_permit| ()) }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let start = std::time::Instant::now();
        assert_busy(limiter.acquire().await, "Too many files");
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(limiter.stats().waiting, 1);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_gives_up_queue_spot() {
        // A client that disconnects while queued must not keep counting against the queue
        let limiter = limiter(1, 1, 60);
        let running = limiter.acquire().await.unwrap();

        let abandoned = tokio::time::timeout(Duration::from_millis(50), limiter.acquire()).await;
        assert!(abandoned.is_err());
        assert_eq!(limiter.stats().waiting, 0);

        drop(running);
        assert!(limiter.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_is_bounded() {
        let limiter = limiter(1, 4, 1);
        let _running = limiter.acquire().await.unwrap();

        let start = std::time::Instant::now();
        let result = limiter.acquire().await;

        assert!(start.elapsed() >= Duration::from_secs(1));
        assert_busy(result, "Timed out");
        assert_eq!(limiter.stats().waiting, 0);
    }

    #[tokio::test]
    async fn test_zero_wait_rejects_when_all_slots_busy() {
        let limiter = limiter(1, 4, 0);
        let _running = limiter.acquire().await.unwrap();

        assert_busy(limiter.acquire().await, "Too many files");
        assert_eq!(limiter.stats().waiting, 0);
    }
}
