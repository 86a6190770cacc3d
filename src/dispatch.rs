//! Background work that runs after or beside commits: customer notifications
//! from the outbox, WAL compaction, and expiry sweeps.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::engine::Engine;
use crate::gate::KeyedCounterGate;
use crate::notify::NotifyHub;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    AppointmentBooked,
    AppointmentStatusChanged,
    ReservationBooked,
    ReservationCancelled,
}

/// A post-commit message for the customer or business.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingNotice {
    pub business_id: Ulid,
    pub booking_id: Ulid,
    pub kind: NoticeKind,
    pub status: &'static str,
    pub customer: String,
}

/// Sending half of the notification queue. Enqueueing never blocks and never
/// fails the caller; a full or missing queue drops the notice with a log line.
#[derive(Clone, Default)]
pub struct Outbox {
    tx: Option<mpsc::Sender<BookingNotice>>,
}

impl Outbox {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<BookingNotice>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx: Some(tx) }, rx)
    }

    /// An outbox that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn enqueue(&self, notice: BookingNotice) {
        let Some(tx) = &self.tx else { return };
        if let Err(e) = tx.try_send(notice) {
            let notice = match e {
                mpsc::error::TrySendError::Full(n) | mpsc::error::TrySendError::Closed(n) => n,
            };
            warn!(
                "outbox unavailable, dropping {:?} notice for booking {}",
                notice.kind, notice.booking_id
            );
            metrics::counter!(crate::observability::NOTIFICATIONS_TOTAL, "outcome" => "dropped").increment(1);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyError(pub String);

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "notification failed: {}", self.0)
    }
}

impl std::error::Error for NotifyError {}

/// Delivery channel for notices (email, SMS, webhook...).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, notice: &BookingNotice) -> Result<(), NotifyError>;
}

/// Writes notices to the log. The server's default notifier.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, notice: &BookingNotice) -> Result<(), NotifyError> {
        info!(
            "notify {}: {:?} booking {} is {}",
            notice.customer, notice.kind, notice.booking_id, notice.status
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), doubling each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Deliver one notice, retrying with exponential backoff. Returns whether it
/// was eventually delivered.
pub async fn deliver_with_retry(notifier: &dyn Notifier, notice: &BookingNotice, policy: RetryPolicy) -> bool {
    for attempt in 1..=policy.max_attempts.max(1) {
        match notifier.deliver(notice).await {
            Ok(()) => {
                metrics::counter!(crate::observability::NOTIFICATIONS_TOTAL, "outcome" => "delivered").increment(1);
                return true;
            }
            Err(e) if attempt < policy.max_attempts => {
                debug!("notice for {} failed (attempt {attempt}): {e}", notice.booking_id);
                metrics::counter!(crate::observability::NOTIFICATIONS_TOTAL, "outcome" => "retried").increment(1);
                tokio::time::sleep(policy.backoff(attempt)).await;
            }
            Err(e) => {
                error!(
                    "giving up on notice for booking {} after {attempt} attempts: {e}",
                    notice.booking_id
                );
            }
        }
    }
    metrics::counter!(crate::observability::NOTIFICATIONS_TOTAL, "outcome" => "failed").increment(1);
    false
}

/// Drain the outbox. Each notice retries on its own task so a failing
/// delivery never holds up the rest of the queue.
pub async fn run_dispatcher(
    mut rx: mpsc::Receiver<BookingNotice>,
    notifier: Arc<dyn Notifier>,
    policy: RetryPolicy,
) {
    while let Some(notice) = rx.recv().await {
        let notifier = notifier.clone();
        tokio::spawn(async move {
            deliver_with_retry(notifier.as_ref(), &notice, policy).await;
        });
    }
    debug!("outbox closed, dispatcher exiting");
}

/// Periodically rewrite the WAL once it has grown past `threshold` appends.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}

/// One compaction check. Returns true when the log was rewritten.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

/// Drop expired rate-limit windows and notification channels nobody listens to.
pub async fn run_janitor(gate: Option<Arc<KeyedCounterGate>>, notify: Arc<NotifyHub>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if let Some(gate) = &gate {
            let purged = gate.purge_expired();
            if purged > 0 {
                debug!("purged {purged} expired rate-limit windows");
            }
        }
        notify.prune();
    }
}
