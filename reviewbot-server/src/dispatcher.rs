//! Webhook dispatch with per-PR duplicate suppression.
//!
//! A delivery is validated on the request path, then handed to a tracked
//! background task. The task serializes on the PR's lock, takes a global
//! concurrency permit, and only then checks the record store. Because the
//! check, the review and the record write all happen under the PR lock, a
//! burst of redeliveries for one PR produces exactly one review.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::event::{Classified, IgnoreReason, ValidationError, WebhookEvent};
use crate::locks::{LockRegistry, PrLock};
use crate::processor::PrProcessor;
use crate::record_store::RecordStore;

pub const DEFAULT_MAX_CONCURRENT_REVIEWS: usize = 8;
pub const DEFAULT_REVIEW_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Upper bound on reviews running at once, across all PRs.
    pub max_concurrent_reviews: usize,
    /// Wall-clock limit for a single review, excluding time spent queued.
    pub review_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_reviews: DEFAULT_MAX_CONCURRENT_REVIEWS,
            review_timeout: DEFAULT_REVIEW_TIMEOUT,
        }
    }
}

/// How a dispatched review ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewOutcome {
    Reviewed,
    /// A record already existed when the task got the PR lock.
    AlreadyReviewed,
    Failed {
        step: &'static str,
        message: String,
    },
    TimedOut,
    Cancelled,
}

/// Immediate answer to a delivery.
#[derive(Debug)]
pub enum Ack {
    Ignored(IgnoreReason),
    /// A review task was spawned; the handle resolves when it finishes.
    Dispatched(JoinHandle<ReviewOutcome>),
}

pub struct Dispatcher {
    locks: Arc<LockRegistry>,
    store: Arc<dyn RecordStore>,
    processor: Arc<PrProcessor>,
    permits: Arc<Semaphore>,
    review_timeout: Duration,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        locks: Arc<LockRegistry>,
        store: Arc<dyn RecordStore>,
        processor: Arc<PrProcessor>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            locks,
            store,
            processor,
            permits: Arc::new(Semaphore::new(config.max_concurrent_reviews)),
            review_timeout: config.review_timeout,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn locks(&self) -> &Arc<LockRegistry> {
        &self.locks
    }

    /// Reviews currently queued or running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Validate a delivery and, if it is a new PR, spawn its review.
    ///
    /// Returns as soon as the task is spawned; the review itself never runs on
    /// the caller's path.
    pub async fn handle(
        &self,
        event_type: Option<&str>,
        body: &[u8],
        delivery_id: Option<&str>,
    ) -> Result<Ack, ValidationError> {
        let event = match WebhookEvent::classify(event_type, delivery_id, body) {
            Ok(Classified::Review(event)) => event,
            Ok(Classified::Ignored(reason)) => {
                info!("Ignoring webhook delivery: {}", reason);
                return Ok(Ack::Ignored(reason));
            }
            Err(e) => {
                warn!(
                    delivery_id = delivery_id.unwrap_or("-"),
                    "Rejecting webhook delivery: {}", e
                );
                return Err(e);
            }
        };

        info!(
            "Received {}.{} for PR {} (delivery {})",
            event.event_type,
            event.action,
            event.pr,
            event.delivery_id.as_deref().unwrap_or("-")
        );

        let lock = self.locks.acquire_lock(&event.pr).await;
        let task = ReviewTask {
            store: self.store.clone(),
            processor: self.processor.clone(),
            permits: self.permits.clone(),
            review_timeout: self.review_timeout,
            event,
            lock,
        };

        let shutdown = self.shutdown.clone();
        let handle = self.tracker.spawn(async move {
            let pr = task.event.pr.clone();
            tokio::select! {
                _ = shutdown.cancelled() => {
                    warn!("Review of PR {} cancelled by shutdown", pr);
                    ReviewOutcome::Cancelled
                }
                outcome = task.run() => outcome,
            }
        });

        Ok(Ack::Dispatched(handle))
    }

    /// Cancel every queued or running review. Cancelled reviews write no record.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
    }

    /// Wait until every spawned review has finished.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        if !self.shutdown.is_cancelled() {
            self.tracker.reopen();
        }
    }
}

struct ReviewTask {
    store: Arc<dyn RecordStore>,
    processor: Arc<PrProcessor>,
    permits: Arc<Semaphore>,
    review_timeout: Duration,
    event: WebhookEvent,
    lock: PrLock,
}

impl ReviewTask {
    async fn run(self) -> ReviewOutcome {
        let pr = &self.event.pr;
        let delivery_id = self.event.delivery_id.as_deref().unwrap_or("-");

        // Lock before permit, so duplicates waiting on a PR hold no permit.
        let _guard = self.lock.lock().await;
        let Ok(_permit) = self.permits.acquire().await else {
            return ReviewOutcome::Cancelled;
        };

        match self.store.has_record(pr).await {
            Ok(true) => {
                info!("PR {} already reviewed, skipping", pr);
                return ReviewOutcome::AlreadyReviewed;
            }
            Ok(false) => {}
            Err(e) => {
                error!(
                    repository = %pr.repository,
                    pr_number = pr.number,
                    step = "check",
                    delivery_id,
                    "Failed to check review record: {}", e
                );
                return ReviewOutcome::Failed {
                    step: "check",
                    message: e.to_string(),
                };
            }
        }

        let review = self.processor.process(&self.event);
        match tokio::time::timeout(self.review_timeout, review).await {
            Ok(Ok(())) => ReviewOutcome::Reviewed,
            Ok(Err(e)) => {
                error!(
                    repository = %pr.repository,
                    pr_number = pr.number,
                    step = e.step(),
                    delivery_id,
                    "Review failed: {}", e
                );
                ReviewOutcome::Failed {
                    step: e.step(),
                    message: e.to_string(),
                }
            }
            Err(_) => {
                error!(
                    repository = %pr.repository,
                    pr_number = pr.number,
                    delivery_id,
                    "Review timed out after {:?}", self.review_timeout
                );
                ReviewOutcome::TimedOut
            }
        }
    }
}
