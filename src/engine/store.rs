use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::warn;
use ulid::Ulid;

use crate::model::*;

pub type SharedCalendar = Arc<RwLock<BusinessCalendar>>;
pub type SharedLedger = Arc<RwLock<ItemLedger>>;

/// A business's profile and its appointments, sorted by start.
#[derive(Debug, Clone)]
pub struct BusinessCalendar {
    pub profile: BusinessProfile,
    pub bookings: Vec<TimeBooking>,
}

impl BusinessCalendar {
    pub fn new(profile: BusinessProfile) -> Self {
        Self {
            profile,
            bookings: Vec::new(),
        }
    }

    /// Insert maintaining sort order by start.
    pub fn insert_booking(&mut self, booking: TimeBooking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: Ulid) -> Option<&TimeBooking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut TimeBooking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Bookings whose span overlaps `query`, any status.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &TimeBooking> {
        // Everything at index >= right_bound starts at or after query.end.
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    /// Pending or confirmed bookings overlapping `query`.
    pub fn committed_overlapping(&self, query: &Span) -> impl Iterator<Item = &TimeBooking> {
        self.overlapping(query).filter(|b| b.status.is_committed())
    }

    pub fn committed_spans(&self, query: &Span) -> Vec<Span> {
        self.committed_overlapping(query).map(|b| b.span).collect()
    }
}

/// An inventory item and its reservations, sorted by first day.
#[derive(Debug, Clone)]
pub struct ItemLedger {
    pub item: InventoryItem,
    pub bookings: Vec<ResourceBooking>,
}

impl ItemLedger {
    pub fn new(item: InventoryItem) -> Self {
        Self {
            item,
            bookings: Vec::new(),
        }
    }

    pub fn insert_booking(&mut self, booking: ResourceBooking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.range.start, |b| b.range.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut ResourceBooking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Active reservations whose day range overlaps `range`.
    pub fn active_overlapping(&self, range: &DateRange) -> impl Iterator<Item = &ResourceBooking> {
        let last = range.last_day();
        let right_bound = self.bookings.partition_point(|b| b.range.start <= last);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.is_active() && b.range.last_day() >= range.start)
    }
}

/// Where a booking id lives, for lookups by id alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingLocation {
    Appointment { business_id: Ulid },
    Reservation { business_id: Ulid, item_id: Ulid },
}

/// Apply an event to a calendar (caller holds the write lock).
pub(crate) fn apply_to_calendar(cal: &mut BusinessCalendar, event: &Event) {
    match event {
        Event::BusinessUpserted { profile } => cal.profile = profile.clone(),
        Event::AppointmentBooked { booking } => cal.insert_booking(booking.clone()),
        Event::AppointmentStatusChanged { id, status, .. } => {
            if let Some(b) = cal.booking_mut(*id) {
                b.status = *status;
            }
        }
        Event::AppointmentEventLinked { id, external_event_id, .. } => {
            if let Some(b) = cal.booking_mut(*id) {
                b.external_event_id = Some(external_event_id.clone());
            }
        }
        Event::ItemUpserted { .. } | Event::ReservationBooked { .. } | Event::ReservationCancelled { .. } => {}
    }
}

/// Apply an event to an item ledger (caller holds the write lock).
pub(crate) fn apply_to_ledger(ledger: &mut ItemLedger, event: &Event) {
    match event {
        Event::ItemUpserted { item } => ledger.item = item.clone(),
        Event::ReservationBooked { booking, .. } => ledger.insert_booking(booking.clone()),
        Event::ReservationCancelled { id, .. } => {
            if let Some(b) = ledger.booking_mut(*id) {
                b.status = ReservationStatus::Cancelled;
            }
        }
        Event::BusinessUpserted { .. }
        | Event::AppointmentBooked { .. }
        | Event::AppointmentStatusChanged { .. }
        | Event::AppointmentEventLinked { .. } => {}
    }
}

/// Business calendars, item ledgers and the booking index.
pub struct Store {
    calendars: DashMap<Ulid, SharedCalendar>,
    ledgers: DashMap<Ulid, SharedLedger>,
    bookings: DashMap<Ulid, BookingLocation>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            calendars: DashMap::new(),
            ledgers: DashMap::new(),
            bookings: DashMap::new(),
        }
    }

    /// Rebuild state from a replayed log. Runs before the store is shared, so
    /// state is assembled unlocked and wrapped at the end.
    pub fn from_events(events: &[Event]) -> Self {
        let mut calendars: HashMap<Ulid, BusinessCalendar> = HashMap::new();
        let mut ledgers: HashMap<Ulid, ItemLedger> = HashMap::new();
        let store = Self::new();

        for event in events {
            match event {
                Event::BusinessUpserted { profile } => {
                    calendars
                        .entry(profile.id)
                        .and_modify(|cal| cal.profile = profile.clone())
                        .or_insert_with(|| BusinessCalendar::new(profile.clone()));
                }
                Event::ItemUpserted { item } => {
                    ledgers
                        .entry(item.id)
                        .and_modify(|l| l.item = item.clone())
                        .or_insert_with(|| ItemLedger::new(item.clone()));
                }
                Event::AppointmentBooked { booking } => {
                    store.index_booking(
                        booking.id,
                        BookingLocation::Appointment { business_id: booking.business_id },
                    );
                    apply_replayed(calendars.get_mut(&booking.business_id), event);
                }
                Event::AppointmentStatusChanged { business_id, .. }
                | Event::AppointmentEventLinked { business_id, .. } => {
                    apply_replayed(calendars.get_mut(business_id), event);
                }
                Event::ReservationBooked { business_id, booking } => {
                    store.index_booking(
                        booking.id,
                        BookingLocation::Reservation {
                            business_id: *business_id,
                            item_id: booking.item_id,
                        },
                    );
                    match ledgers.get_mut(&booking.item_id) {
                        Some(ledger) => apply_to_ledger(ledger, event),
                        None => warn!("replay: reservation {} for unknown item {}", booking.id, booking.item_id),
                    }
                }
                Event::ReservationCancelled { item_id, .. } => {
                    if let Some(ledger) = ledgers.get_mut(item_id) {
                        apply_to_ledger(ledger, event);
                    }
                }
            }
        }

        for (id, cal) in calendars {
            store.calendars.insert(id, Arc::new(RwLock::new(cal)));
        }
        for (id, ledger) in ledgers {
            store.ledgers.insert(id, Arc::new(RwLock::new(ledger)));
        }
        store
    }

    // ── Calendars ────────────────────────────────────────────

    pub fn calendar(&self, business_id: &Ulid) -> Option<SharedCalendar> {
        self.calendars.get(business_id).map(|e| e.value().clone())
    }

    pub fn contains_calendar(&self, business_id: &Ulid) -> bool {
        self.calendars.contains_key(business_id)
    }

    /// Existing calendar for the profile's id, or a fresh one holding it.
    pub fn calendar_or_insert(&self, profile: &BusinessProfile) -> (SharedCalendar, bool) {
        let mut created = false;
        let cal = self
            .calendars
            .entry(profile.id)
            .or_insert_with(|| {
                created = true;
                Arc::new(RwLock::new(BusinessCalendar::new(profile.clone())))
            })
            .value()
            .clone();
        (cal, created)
    }

    pub fn remove_calendar(&self, business_id: &Ulid) {
        self.calendars.remove(business_id);
    }

    pub fn business_count(&self) -> usize {
        self.calendars.len()
    }

    pub fn business_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.calendars.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    // ── Ledgers ──────────────────────────────────────────────

    pub fn ledger(&self, item_id: &Ulid) -> Option<SharedLedger> {
        self.ledgers.get(item_id).map(|e| e.value().clone())
    }

    pub fn ledger_or_insert(&self, item: &InventoryItem) -> (SharedLedger, bool) {
        let mut created = false;
        let ledger = self
            .ledgers
            .entry(item.id)
            .or_insert_with(|| {
                created = true;
                Arc::new(RwLock::new(ItemLedger::new(item.clone())))
            })
            .value()
            .clone();
        (ledger, created)
    }

    pub fn remove_ledger(&self, item_id: &Ulid) {
        self.ledgers.remove(item_id);
    }

    pub fn item_count(&self) -> usize {
        self.ledgers.len()
    }

    pub fn item_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.ledgers.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    // ── Booking index ────────────────────────────────────────

    pub fn locate(&self, booking_id: &Ulid) -> Option<BookingLocation> {
        self.bookings.get(booking_id).map(|e| *e.value())
    }

    pub fn index_booking(&self, booking_id: Ulid, location: BookingLocation) {
        self.bookings.insert(booking_id, location);
    }
}

fn apply_replayed(cal: Option<&mut BusinessCalendar>, event: &Event) {
    match cal {
        Some(cal) => apply_to_calendar(cal, event),
        None => warn!("replay: {} for unknown business {}", event.kind(), event.business_id()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn profile() -> BusinessProfile {
        BusinessProfile {
            id: Ulid::new(),
            name: None,
            hours: HashMap::new(),
            slots: SlotConfig {
                duration_minutes: 60,
                buffer_minutes: 0,
                min_hours_notice: 0.0,
                timezone: "UTC".into(),
                conflict_duration_minutes: None,
                parallel_bookings: 1,
            },
            services: HashMap::new(),
            calendar_ids: Vec::new(),
            booking_calendar_id: None,
        }
    }

    fn appointment(business_id: Ulid, start: Ms, end: Ms, status: BookingStatus) -> TimeBooking {
        TimeBooking {
            id: Ulid::new(),
            business_id,
            span: Span::new(start, end),
            status,
            customer: "c".into(),
            service: None,
            external_event_id: None,
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut cal = BusinessCalendar::new(profile());
        let bid = cal.profile.id;
        cal.insert_booking(appointment(bid, 1000, 1100, BookingStatus::Pending));
        cal.insert_booking(appointment(bid, 100, 200, BookingStatus::Pending));
        cal.insert_booking(appointment(bid, 450, 600, BookingStatus::Pending));

        let hits: Vec<_> = cal.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut cal = BusinessCalendar::new(profile());
        let bid = cal.profile.id;
        cal.insert_booking(appointment(bid, 100, 200, BookingStatus::Confirmed));
        assert_eq!(cal.overlapping(&Span::new(200, 300)).count(), 0);
    }

    #[test]
    fn committed_overlapping_ignores_cancelled_and_completed() {
        let mut cal = BusinessCalendar::new(profile());
        let bid = cal.profile.id;
        cal.insert_booking(appointment(bid, 0, 100, BookingStatus::Cancelled));
        cal.insert_booking(appointment(bid, 0, 100, BookingStatus::Completed));
        cal.insert_booking(appointment(bid, 50, 150, BookingStatus::Pending));
        assert_eq!(cal.committed_spans(&Span::new(0, 200)), vec![Span::new(50, 150)]);
    }

    #[test]
    fn ledger_overlap_is_inclusive_by_day() {
        let item = InventoryItem {
            id: Ulid::new(),
            business_id: Ulid::new(),
            name: None,
            total_quantity: 3,
            is_active: true,
        };
        let mut ledger = ItemLedger::new(item.clone());
        let booking = |range: DateRange, status| ResourceBooking {
            id: Ulid::new(),
            item_id: item.id,
            range,
            quantity: 1,
            status,
            customer: "c".into(),
        };
        ledger.insert_booking(booking(DateRange::new(day(1), Some(day(2))), ReservationStatus::Active));
        ledger.insert_booking(booking(DateRange::single(day(3)), ReservationStatus::Active));
        ledger.insert_booking(booking(DateRange::single(day(2)), ReservationStatus::Cancelled));
        ledger.insert_booking(booking(DateRange::single(day(5)), ReservationStatus::Active));

        assert_eq!(ledger.active_overlapping(&DateRange::single(day(2))).count(), 1);
        assert_eq!(ledger.active_overlapping(&DateRange::new(day(2), Some(day(3)))).count(), 2);
        assert_eq!(ledger.active_overlapping(&DateRange::single(day(4))).count(), 0);
    }

    #[test]
    fn from_events_rebuilds_state_and_index() {
        let p = profile();
        let bid = p.id;
        let booking = appointment(bid, 0, 100, BookingStatus::Pending);
        let bkid = booking.id;
        let events = vec![
            Event::BusinessUpserted { profile: p },
            Event::AppointmentBooked { booking },
            Event::AppointmentStatusChanged {
                id: bkid,
                business_id: bid,
                status: BookingStatus::Confirmed,
            },
            Event::AppointmentEventLinked {
                id: bkid,
                business_id: bid,
                external_event_id: "evt-1".into(),
            },
        ];

        let store = Store::from_events(&events);
        assert_eq!(store.business_count(), 1);
        assert_eq!(
            store.locate(&bkid),
            Some(BookingLocation::Appointment { business_id: bid })
        );
        let cal = store.calendar(&bid).unwrap();
        let guard = cal.try_read().unwrap();
        let b = guard.booking(bkid).unwrap();
        assert_eq!(b.status, BookingStatus::Confirmed);
        assert_eq!(b.external_event_id.as_deref(), Some("evt-1"));
    }

    #[test]
    fn from_events_skips_orphans() {
        let orphan = appointment(Ulid::new(), 0, 100, BookingStatus::Pending);
        let store = Store::from_events(&[Event::AppointmentBooked { booking: orphan }]);
        assert_eq!(store.business_count(), 0);
    }
}
