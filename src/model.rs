use std::collections::HashMap;

use chrono::{NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only instant type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 86_400_000;

pub fn minutes_to_ms(minutes: u32) -> Ms {
    Ms::from(minutes) * MINUTE_MS
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for intervals coming from outside the engine.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn starting_at(start: Ms, minutes: u32) -> Self {
        Self::new(start, start + minutes_to_ms(minutes))
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Pad both sides by `buffer_minutes`. Collision tests only; stored spans
    /// are never widened.
    pub fn expand(&self, buffer_minutes: u32) -> Span {
        let pad = minutes_to_ms(buffer_minutes);
        Span {
            start: self.start.saturating_sub(pad),
            end: self.end.saturating_add(pad),
        }
    }
}

/// Inclusive range of calendar days. `end == None` means a single day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: Option<NaiveDate>,
}

impl DateRange {
    pub fn single(day: NaiveDate) -> Self {
        Self { start: day, end: None }
    }

    pub fn new(start: NaiveDate, end: Option<NaiveDate>) -> Self {
        Self { start, end }
    }

    /// Last covered day; a missing end collapses to `start`.
    pub fn last_day(&self) -> NaiveDate {
        self.end.unwrap_or(self.start)
    }

    pub fn is_valid(&self) -> bool {
        self.last_day() >= self.start
    }

    /// Number of covered days (at least 1 for a valid range).
    pub fn days(&self) -> i64 {
        (self.last_day() - self.start).num_days() + 1
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start <= other.last_day() && other.start <= self.last_day()
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.end {
            Some(end) if end != self.start => write!(f, "{}..={}", self.start, end),
            _ => write!(f, "{}", self.start),
        }
    }
}

// ── Business configuration ───────────────────────────────────────

/// Opening hours for one weekday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaySchedule {
    pub opens: NaiveTime,
    pub closes: NaiveTime,
}

fn one() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotConfig {
    pub duration_minutes: u32,
    #[serde(default)]
    pub buffer_minutes: u32,
    #[serde(default)]
    pub min_hours_notice: f64,
    pub timezone: String,
    /// Length used when testing a slot against busy time. Defaults to the
    /// appointment duration.
    #[serde(default)]
    pub conflict_duration_minutes: Option<u32>,
    /// How many appointments may run at the same instant.
    #[serde(default = "one")]
    pub parallel_bookings: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub duration_minutes: u32,
    #[serde(default)]
    pub conflict_duration_minutes: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessProfile {
    pub id: Ulid,
    #[serde(default)]
    pub name: Option<String>,
    /// Weekdays without an entry are closed.
    #[serde(default)]
    pub hours: HashMap<Weekday, DaySchedule>,
    pub slots: SlotConfig,
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
    /// External calendars whose busy time blocks slots.
    #[serde(default)]
    pub calendar_ids: Vec<String>,
    /// Calendar that receives an event for every committed appointment.
    #[serde(default)]
    pub booking_calendar_id: Option<String>,
}

impl BusinessProfile {
    pub fn schedule_for(&self, weekday: Weekday) -> Option<DaySchedule> {
        self.hours.get(&weekday).copied()
    }

    /// Appointment length and conflict-test length, honouring a named service.
    pub fn durations(&self, service: Option<&str>) -> Option<(u32, u32)> {
        match service {
            None => Some((
                self.slots.duration_minutes,
                self.slots
                    .conflict_duration_minutes
                    .unwrap_or(self.slots.duration_minutes),
            )),
            Some(name) => self.services.get(name).map(|svc| {
                (
                    svc.duration_minutes,
                    svc.conflict_duration_minutes.unwrap_or(svc.duration_minutes),
                )
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub id: Ulid,
    pub business_id: Ulid,
    #[serde(default)]
    pub name: Option<String>,
    pub total_quantity: u32,
    pub is_active: bool,
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    /// Pending and confirmed bookings hold their time.
    pub fn is_committed(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn can_become(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Completed) | (Confirmed, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Active,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Active => "active",
            ReservationStatus::Cancelled => "cancelled",
        }
    }
}

/// An appointment occupying time on a business calendar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBooking {
    pub id: Ulid,
    pub business_id: Ulid,
    pub span: Span,
    pub status: BookingStatus,
    pub customer: String,
    pub service: Option<String>,
    pub external_event_id: Option<String>,
}

impl TimeBooking {
    pub fn duration_minutes(&self) -> i64 {
        self.span.duration_ms() / MINUTE_MS
    }
}

/// A quantity of an inventory item held over a range of days.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBooking {
    pub id: Ulid,
    pub item_id: Ulid,
    pub range: DateRange,
    pub quantity: u32,
    pub status: ReservationStatus,
    pub customer: String,
}

impl ResourceBooking {
    pub fn is_active(&self) -> bool {
        self.status == ReservationStatus::Active
    }
}

/// Flat event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    BusinessUpserted {
        profile: BusinessProfile,
    },
    ItemUpserted {
        item: InventoryItem,
    },
    AppointmentBooked {
        booking: TimeBooking,
    },
    AppointmentStatusChanged {
        id: Ulid,
        business_id: Ulid,
        status: BookingStatus,
    },
    AppointmentEventLinked {
        id: Ulid,
        business_id: Ulid,
        external_event_id: String,
    },
    ReservationBooked {
        business_id: Ulid,
        booking: ResourceBooking,
    },
    ReservationCancelled {
        id: Ulid,
        business_id: Ulid,
        item_id: Ulid,
    },
}

impl Event {
    /// Business whose subscribers hear about this event.
    pub fn business_id(&self) -> Ulid {
        match self {
            Event::BusinessUpserted { profile } => profile.id,
            Event::ItemUpserted { item } => item.business_id,
            Event::AppointmentBooked { booking } => booking.business_id,
            Event::AppointmentStatusChanged { business_id, .. }
            | Event::AppointmentEventLinked { business_id, .. }
            | Event::ReservationBooked { business_id, .. }
            | Event::ReservationCancelled { business_id, .. } => *business_id,
        }
    }

    /// Short label used in notifications and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::BusinessUpserted { .. } => "business_upserted",
            Event::ItemUpserted { .. } => "item_upserted",
            Event::AppointmentBooked { .. } => "appointment_booked",
            Event::AppointmentStatusChanged { .. } => "appointment_status_changed",
            Event::AppointmentEventLinked { .. } => "appointment_event_linked",
            Event::ReservationBooked { .. } => "reservation_booked",
            Event::ReservationCancelled { .. } => "reservation_cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // touching, not overlapping
    }

    #[test]
    fn span_try_new_rejects_inverted() {
        assert!(Span::try_new(200, 100).is_none());
        assert!(Span::try_new(100, 100).is_none());
        assert_eq!(Span::try_new(100, 101), Some(Span::new(100, 101)));
    }

    #[test]
    fn span_expand_pads_both_sides() {
        let s = Span::new(10 * HOUR_MS, 11 * HOUR_MS);
        let e = s.expand(15);
        assert_eq!(e.start, 10 * HOUR_MS - 15 * MINUTE_MS);
        assert_eq!(e.end, 11 * HOUR_MS + 15 * MINUTE_MS);
        assert_eq!(s.expand(0), s);
    }

    #[test]
    fn span_contains_span() {
        let outer = Span::new(100, 400);
        assert!(outer.contains_span(&Span::new(150, 300)));
        assert!(outer.contains_span(&outer));
        assert!(!outer.contains_span(&Span::new(50, 200)));
    }

    #[test]
    fn date_range_single_day_overlap() {
        let a = DateRange::single(day(2026, 3, 2));
        let b = DateRange::new(day(2026, 3, 1), Some(day(2026, 3, 2)));
        let c = DateRange::single(day(2026, 3, 3));
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
        assert_eq!(b.days(), 2);
        assert_eq!(a.days(), 1);
    }

    #[test]
    fn date_range_inverted_is_invalid() {
        let r = DateRange::new(day(2026, 3, 5), Some(day(2026, 3, 4)));
        assert!(!r.is_valid());
    }

    #[test]
    fn status_transitions() {
        use BookingStatus::*;
        assert!(Pending.can_become(Confirmed));
        assert!(Confirmed.can_become(Completed));
        assert!(!Cancelled.can_become(Confirmed));
        assert!(!Completed.can_become(Cancelled));
        assert!(Pending.is_committed());
        assert!(!Cancelled.is_committed());
    }

    #[test]
    fn service_durations_override_defaults() {
        let mut profile = BusinessProfile {
            id: Ulid::new(),
            name: None,
            hours: HashMap::new(),
            slots: SlotConfig {
                duration_minutes: 30,
                buffer_minutes: 0,
                min_hours_notice: 0.0,
                timezone: "UTC".into(),
                conflict_duration_minutes: Some(60),
                parallel_bookings: 1,
            },
            services: HashMap::new(),
            calendar_ids: Vec::new(),
            booking_calendar_id: None,
        };
        profile.services.insert(
            "consult".into(),
            ServiceConfig { duration_minutes: 45, conflict_duration_minutes: None },
        );
        assert_eq!(profile.durations(None), Some((30, 60)));
        assert_eq!(profile.durations(Some("consult")), Some((45, 45)));
        assert_eq!(profile.durations(Some("missing")), None);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::AppointmentStatusChanged {
            id: Ulid::new(),
            business_id: Ulid::new(),
            status: BookingStatus::Confirmed,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
