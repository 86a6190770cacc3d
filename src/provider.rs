//! External calendar collaborator: busy-time lookup and event creation.
//!
//! The engine never authenticates against a calendar provider; it is handed a
//! ready [`BusyTimeProvider`]. Provider data is untrusted and possibly stale,
//! and a failing provider must never block slot generation, so every fetch
//! goes through [`fetch_busy_or_degrade`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono_tz::Tz;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::interval::merge_sorted;
use crate::model::{Ms, Span};

/// Raw busy range as reported by a provider. Not validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusyInterval {
    pub start: Ms,
    pub end: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarError {
    pub calendar_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct BusyFetch {
    pub busy: Vec<BusyInterval>,
    pub calendar_errors: Vec<CalendarError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    Unavailable(String),
    Unauthorized(String),
    Rejected(String),
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::Unavailable(e) => write!(f, "calendar provider unavailable: {e}"),
            ProviderError::Unauthorized(e) => write!(f, "calendar provider refused credentials: {e}"),
            ProviderError::Rejected(e) => write!(f, "calendar provider rejected request: {e}"),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Event mirrored to the business's booking calendar after a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarEventRequest {
    pub booking_id: Ulid,
    pub span: Span,
    pub summary: String,
    pub customer: String,
}

#[async_trait]
pub trait BusyTimeProvider: Send + Sync {
    /// Busy time on `calendar_ids` within `window`. Per-calendar failures are
    /// reported in [`BusyFetch::calendar_errors`], not as an `Err`.
    async fn fetch_busy(
        &self,
        calendar_ids: &[String],
        window: Span,
        tz: Tz,
    ) -> Result<BusyFetch, ProviderError>;

    /// Create an event and return the provider's event id.
    async fn create_event(
        &self,
        calendar_id: &str,
        event: &CalendarEventRequest,
    ) -> Result<String, ProviderError>;
}

/// Something that went wrong while reading busy time. Soft: the affected
/// data is treated as absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderIssue {
    pub calendar_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct BusyOutcome {
    /// Disjoint, sorted.
    pub busy: Vec<Span>,
    pub issues: Vec<ProviderIssue>,
}

/// Fetch busy time with a deadline. Timeouts and provider errors yield no busy
/// data plus an issue; failing calendars are dropped individually.
pub async fn fetch_busy_or_degrade(
    provider: &dyn BusyTimeProvider,
    calendar_ids: &[String],
    window: Span,
    tz: Tz,
    timeout: Duration,
) -> BusyOutcome {
    if calendar_ids.is_empty() {
        return BusyOutcome::default();
    }

    let fetch = match tokio::time::timeout(timeout, provider.fetch_busy(calendar_ids, window, tz)).await {
        Ok(Ok(fetch)) => fetch,
        Ok(Err(e)) => {
            warn!("busy-time fetch failed, continuing without busy data: {e}");
            metrics::counter!(crate::observability::PROVIDER_DEGRADED_TOTAL, "cause" => "error").increment(1);
            return BusyOutcome {
                busy: Vec::new(),
                issues: vec![ProviderIssue { calendar_id: None, reason: e.to_string() }],
            };
        }
        Err(_) => {
            warn!("busy-time fetch exceeded {}ms, continuing without busy data", timeout.as_millis());
            metrics::counter!(crate::observability::PROVIDER_DEGRADED_TOTAL, "cause" => "timeout").increment(1);
            return BusyOutcome {
                busy: Vec::new(),
                issues: vec![ProviderIssue {
                    calendar_id: None,
                    reason: format!("timed out after {}ms", timeout.as_millis()),
                }],
            };
        }
    };

    let mut issues = Vec::with_capacity(fetch.calendar_errors.len());
    for err in fetch.calendar_errors {
        warn!("calendar {} omitted from busy merge: {}", err.calendar_id, err.reason);
        metrics::counter!(crate::observability::PROVIDER_DEGRADED_TOTAL, "cause" => "calendar").increment(1);
        issues.push(ProviderIssue {
            calendar_id: Some(err.calendar_id),
            reason: err.reason,
        });
    }

    let spans: Vec<Span> = fetch
        .busy
        .iter()
        .filter_map(|b| {
            let span = Span::try_new(b.start, b.end);
            if span.is_none() {
                debug!("dropping malformed busy interval [{}, {})", b.start, b.end);
            }
            span
        })
        .collect();

    BusyOutcome {
        busy: merge_sorted(&spans),
        issues,
    }
}

// ── In-memory provider ───────────────────────────────────────────

/// Provider backed by in-process calendars. Used by the server when no
/// external provider is wired in, and by tests to script failures.
#[derive(Default)]
pub struct StaticBusyProvider {
    calendars: DashMap<String, Vec<BusyInterval>>,
    failing: DashMap<String, String>,
    offline: AtomicBool,
    reject_events: AtomicBool,
    latency_ms: AtomicU64,
    created: DashMap<String, Vec<CalendarEventRequest>>,
    next_event: AtomicU64,
}

impl StaticBusyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_busy(&self, calendar_id: &str, busy: Vec<BusyInterval>) {
        self.calendars.insert(calendar_id.to_string(), busy);
    }

    pub fn add_busy(&self, calendar_id: &str, start: Ms, end: Ms) {
        self.calendars
            .entry(calendar_id.to_string())
            .or_default()
            .push(BusyInterval { start, end });
    }

    /// Make one calendar report an error on every fetch.
    pub fn fail_calendar(&self, calendar_id: &str, reason: &str) {
        self.failing.insert(calendar_id.to_string(), reason.to_string());
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_reject_events(&self, reject: bool) {
        self.reject_events.store(reject, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn created_events(&self, calendar_id: &str) -> Vec<CalendarEventRequest> {
        self.created
            .get(calendar_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    async fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

#[async_trait]
impl BusyTimeProvider for StaticBusyProvider {
    async fn fetch_busy(
        &self,
        calendar_ids: &[String],
        window: Span,
        _tz: Tz,
    ) -> Result<BusyFetch, ProviderError> {
        self.simulate_latency().await;
        if self.offline.load(Ordering::SeqCst) {
            return Err(ProviderError::Unavailable("provider offline".into()));
        }

        let mut fetch = BusyFetch::default();
        for id in calendar_ids {
            if let Some(reason) = self.failing.get(id) {
                fetch.calendar_errors.push(CalendarError {
                    calendar_id: id.clone(),
                    reason: reason.value().clone(),
                });
                continue;
            }
            if let Some(busy) = self.calendars.get(id) {
                fetch.busy.extend(
                    busy.iter()
                        .filter(|b| b.start < window.end && b.end > window.start)
                        .copied(),
                );
            }
        }
        Ok(fetch)
    }

    async fn create_event(
        &self,
        calendar_id: &str,
        event: &CalendarEventRequest,
    ) -> Result<String, ProviderError> {
        self.simulate_latency().await;
        if self.offline.load(Ordering::SeqCst) {
            return Err(ProviderError::Unavailable("provider offline".into()));
        }
        if self.reject_events.load(Ordering::SeqCst) {
            return Err(ProviderError::Rejected("event creation disabled".into()));
        }
        self.created
            .entry(calendar_id.to_string())
            .or_default()
            .push(event.clone());
        let n = self.next_event.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("{calendar_id}-evt-{n}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn day() -> Span {
        Span::new(0, 24 * H)
    }

    #[tokio::test]
    async fn merges_busy_across_calendars() {
        let p = StaticBusyProvider::new();
        p.add_busy("work", 10 * H, 11 * H);
        p.add_busy("home", 10 * H + H / 2, 12 * H);
        p.add_busy("home", 15 * H, 16 * H);

        let out = fetch_busy_or_degrade(&p, &ids(&["work", "home"]), day(), chrono_tz::UTC, Duration::from_secs(1)).await;
        assert!(out.issues.is_empty());
        assert_eq!(out.busy, vec![Span::new(10 * H, 12 * H), Span::new(15 * H, 16 * H)]);
    }

    #[tokio::test]
    async fn failing_calendar_is_omitted_others_kept() {
        let p = StaticBusyProvider::new();
        p.add_busy("work", 10 * H, 11 * H);
        p.add_busy("home", 13 * H, 14 * H);
        p.fail_calendar("home", "token expired");

        let out = fetch_busy_or_degrade(&p, &ids(&["work", "home"]), day(), chrono_tz::UTC, Duration::from_secs(1)).await;
        assert_eq!(out.busy, vec![Span::new(10 * H, 11 * H)]);
        assert_eq!(out.issues.len(), 1);
        assert_eq!(out.issues[0].calendar_id.as_deref(), Some("home"));
    }

    #[tokio::test]
    async fn offline_provider_degrades_to_empty() {
        let p = StaticBusyProvider::new();
        p.add_busy("work", 10 * H, 11 * H);
        p.set_offline(true);

        let out = fetch_busy_or_degrade(&p, &ids(&["work"]), day(), chrono_tz::UTC, Duration::from_secs(1)).await;
        assert!(out.busy.is_empty());
        assert_eq!(out.issues.len(), 1);
        assert!(out.issues[0].calendar_id.is_none());
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let p = StaticBusyProvider::new();
        p.add_busy("work", 10 * H, 11 * H);
        p.set_latency(Duration::from_millis(500));

        let out = fetch_busy_or_degrade(&p, &ids(&["work"]), day(), chrono_tz::UTC, Duration::from_millis(20)).await;
        assert!(out.busy.is_empty());
        assert!(out.issues[0].reason.contains("timed out"));
    }

    #[tokio::test]
    async fn malformed_intervals_dropped() {
        let p = StaticBusyProvider::new();
        p.set_busy(
            "work",
            vec![
                BusyInterval { start: 11 * H, end: 10 * H },
                BusyInterval { start: 12 * H, end: 12 * H },
                BusyInterval { start: 13 * H, end: 14 * H },
            ],
        );
        let out = fetch_busy_or_degrade(&p, &ids(&["work"]), day(), chrono_tz::UTC, Duration::from_secs(1)).await;
        assert_eq!(out.busy, vec![Span::new(13 * H, 14 * H)]);
    }

    #[tokio::test]
    async fn no_calendars_no_call() {
        let p = StaticBusyProvider::new();
        p.set_offline(true);
        let out = fetch_busy_or_degrade(&p, &[], day(), chrono_tz::UTC, Duration::from_secs(1)).await;
        assert!(out.busy.is_empty());
        assert!(out.issues.is_empty());
    }

    #[tokio::test]
    async fn create_event_records_and_rejects() {
        let p = StaticBusyProvider::new();
        let req = CalendarEventRequest {
            booking_id: Ulid::new(),
            span: Span::new(10 * H, 11 * H),
            summary: "Haircut".into(),
            customer: "c-1".into(),
        };
        let id = p.create_event("bookings", &req).await.unwrap();
        assert_eq!(id, "bookings-evt-1");
        assert_eq!(p.created_events("bookings"), vec![req.clone()]);

        p.set_reject_events(true);
        assert!(matches!(p.create_event("bookings", &req).await, Err(ProviderError::Rejected(_))));
    }
}
