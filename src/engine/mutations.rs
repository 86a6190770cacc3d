use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{error, info};
use ulid::Ulid;

use crate::dispatch::{BookingNotice, NoticeKind};
use crate::limits::*;
use crate::model::*;
use crate::provider::CalendarEventRequest;

use super::conflict::{check_time_available, validate_customer, validate_item, validate_profile, validate_span};
use super::store::BookingLocation;
use super::{Engine, EngineError, EngineWarning, WalCommand};

fn one() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BookingRequest {
    /// Time on the business calendar starting at `start`. The length comes
    /// from the service, or the business default.
    Appointment {
        start: Ms,
        #[serde(default)]
        duration_minutes: Option<u32>,
        #[serde(default)]
        service: Option<String>,
    },
    /// Units of an inventory item over a range of days.
    Reservation {
        item_id: Ulid,
        range: DateRange,
        #[serde(default = "one")]
        quantity: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub business_id: Ulid,
    pub booking: BookingRequest,
    pub customer: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitOutcome {
    pub booking_id: Ulid,
    pub status: &'static str,
    pub warnings: Vec<EngineWarning>,
}

impl Engine {
    pub async fn upsert_business(&self, profile: BusinessProfile) -> Result<(), EngineError> {
        validate_profile(&profile)?;
        let _log = self.log_gate.read().await;
        if !self.store.contains_calendar(&profile.id) && self.store.business_count() >= MAX_BUSINESSES {
            return Err(EngineError::LimitExceeded("too many businesses"));
        }

        let (cal, created) = self.store.calendar_or_insert(&profile);
        let mut guard = cal.write().await;
        let id = profile.id;
        let event = Event::BusinessUpserted { profile };
        if let Err(e) = self.persist_to_calendar(&mut guard, &event).await {
            if created {
                self.store.remove_calendar(&id);
            }
            return Err(e);
        }
        info!("business {id} {}", if created { "created" } else { "updated" });
        Ok(())
    }

    pub async fn upsert_item(&self, item: InventoryItem) -> Result<(), EngineError> {
        validate_item(&item)?;
        let _log = self.log_gate.read().await;
        if !self.store.contains_calendar(&item.business_id) {
            return Err(EngineError::NotFound(item.business_id));
        }
        if let Some(existing) = self.store.ledger(&item.id) {
            let owner = existing.read().await.item.business_id;
            if owner != item.business_id {
                return Err(EngineError::InvalidInput(format!(
                    "item {} belongs to another business",
                    item.id
                )));
            }
        } else if self.store.item_count() >= MAX_ITEMS {
            return Err(EngineError::LimitExceeded("too many items"));
        }

        let (ledger, created) = self.store.ledger_or_insert(&item);
        let mut guard = ledger.write().await;
        let id = item.id;
        let event = Event::ItemUpserted { item };
        if let Err(e) = self.persist_to_ledger(&mut guard, &event).await {
            if created {
                self.store.remove_ledger(&id);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Commit a booking if the slot or capacity is still free. Conflicts fail;
    /// trouble with the external calendar after the local record is durable
    /// comes back as a warning.
    pub async fn commit_booking(&self, request: CommitRequest) -> Result<CommitOutcome, EngineError> {
        validate_customer(&request.customer)?;
        let gate_key = format!("{}:{}", request.business_id, request.customer);
        if let Err(denied) = self.gate.admit(&gate_key).await {
            metrics::counter!(crate::observability::COMMITS_TOTAL, "kind" => "any", "outcome" => "rate_limited")
                .increment(1);
            return Err(EngineError::RateLimited(denied.to_string()));
        }

        let (kind, result) = match request.booking {
            BookingRequest::Appointment {
                start,
                duration_minutes,
                service,
            } => (
                "appointment",
                self.commit_appointment(request.business_id, start, duration_minutes, service, &request.customer)
                    .await,
            ),
            BookingRequest::Reservation {
                item_id,
                range,
                quantity,
            } => (
                "reservation",
                self.commit_reservation(request.business_id, item_id, range, quantity, &request.customer)
                    .await,
            ),
        };

        let outcome = match &result {
            Ok(_) => "committed",
            Err(e) if e.is_conflict() => "conflict",
            Err(_) => "error",
        };
        metrics::counter!(crate::observability::COMMITS_TOTAL, "kind" => kind, "outcome" => outcome).increment(1);
        result
    }

    async fn commit_reservation(
        &self,
        business_id: Ulid,
        item_id: Ulid,
        range: DateRange,
        quantity: u32,
        customer: &str,
    ) -> Result<CommitOutcome, EngineError> {
        let ledger = self.store.ledger(&item_id).ok_or(EngineError::NotFound(item_id))?;
        if ledger.read().await.item.business_id != business_id {
            return Err(EngineError::NotFound(item_id));
        }
        let booking = self.reserve(item_id, range, quantity, customer).await?;
        self.outbox.enqueue(BookingNotice {
            business_id,
            booking_id: booking.id,
            kind: NoticeKind::ReservationBooked,
            status: booking.status.as_str(),
            customer: booking.customer,
        });
        Ok(CommitOutcome {
            booking_id: booking.id,
            status: booking.status.as_str(),
            warnings: Vec::new(),
        })
    }

    async fn commit_appointment(
        &self,
        business_id: Ulid,
        start: Ms,
        duration_minutes: Option<u32>,
        service: Option<String>,
        customer: &str,
    ) -> Result<CommitOutcome, EngineError> {
        if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&start) {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }

        let log = self.log_gate.read().await;
        let cal = self.store.calendar(&business_id).ok_or(EngineError::NotFound(business_id))?;
        let mut guard = cal.write().await;

        let (default_minutes, conflict_minutes) = guard
            .profile
            .durations(service.as_deref())
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown service {:?}", service.as_deref().unwrap_or_default())))?;
        let minutes = duration_minutes.unwrap_or(default_minutes);
        if minutes == 0 {
            return Err(EngineError::InvalidInput("duration must be positive".into()));
        }
        if minutes > MAX_APPOINTMENT_MINUTES {
            return Err(EngineError::LimitExceeded("appointment too long"));
        }
        let span = Span::starting_at(start, minutes);
        validate_span(&span)?;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_CALENDAR {
            return Err(EngineError::LimitExceeded("too many bookings on calendar"));
        }

        check_time_available(&guard, &Span::starting_at(start, conflict_minutes))?;

        let booking = TimeBooking {
            id: Ulid::new(),
            business_id,
            span,
            status: BookingStatus::Pending,
            customer: customer.to_string(),
            service,
            external_event_id: None,
        };
        let event = Event::AppointmentBooked {
            booking: booking.clone(),
        };
        self.persist_to_calendar(&mut guard, &event).await?;
        self.store
            .index_booking(booking.id, BookingLocation::Appointment { business_id });
        let mirror_to = guard.profile.booking_calendar_id.clone();
        drop(guard);
        drop(log);
        info!("booked appointment {} for business {business_id}", booking.id);

        let mut warnings = Vec::new();
        if let Some(calendar_id) = mirror_to
            && let Some(warning) = self.mirror_to_calendar(&calendar_id, &booking).await
        {
            warnings.push(warning);
        }

        self.outbox.enqueue(BookingNotice {
            business_id,
            booking_id: booking.id,
            kind: NoticeKind::AppointmentBooked,
            status: booking.status.as_str(),
            customer: booking.customer,
        });
        Ok(CommitOutcome {
            booking_id: booking.id,
            status: booking.status.as_str(),
            warnings,
        })
    }

    /// Create the external calendar event for a committed appointment and
    /// record its id. Any failure leaves the local booking in place.
    async fn mirror_to_calendar(&self, calendar_id: &str, booking: &TimeBooking) -> Option<EngineWarning> {
        let request = CalendarEventRequest {
            booking_id: booking.id,
            span: booking.span,
            summary: match &booking.service {
                Some(service) => format!("{service} with {}", booking.customer),
                None => format!("Appointment with {}", booking.customer),
            },
            customer: booking.customer.clone(),
        };

        let created = tokio::time::timeout(self.provider_timeout, self.provider.create_event(calendar_id, &request)).await;
        let detail = match created {
            Ok(Ok(event_id)) => match self.link_external_event(booking, event_id.clone()).await {
                Ok(()) => return None,
                Err(e) => format!("calendar event {event_id} created but not linked locally: {e}"),
            },
            Ok(Err(e)) => format!("booking saved but calendar event not created: {e}"),
            Err(_) => format!(
                "booking saved but calendar event not created: timed out after {}ms",
                self.provider_timeout.as_millis()
            ),
        };

        error!(
            "partial commit for booking {} (business {}, calendar {calendar_id}): {detail}",
            booking.id, booking.business_id
        );
        metrics::counter!(crate::observability::PARTIAL_COMMITS_TOTAL).increment(1);
        Some(EngineWarning::PartialCommit {
            business_id: booking.business_id,
            booking_id: booking.id,
            detail,
        })
    }

    async fn link_external_event(&self, booking: &TimeBooking, external_event_id: String) -> Result<(), EngineError> {
        let _log = self.log_gate.read().await;
        let cal = self
            .store
            .calendar(&booking.business_id)
            .ok_or(EngineError::NotFound(booking.business_id))?;
        let mut guard = cal.write().await;
        let event = Event::AppointmentEventLinked {
            id: booking.id,
            business_id: booking.business_id,
            external_event_id,
        };
        self.persist_to_calendar(&mut guard, &event).await
    }

    /// Move an appointment along its lifecycle.
    pub async fn set_booking_status(&self, id: Ulid, status: BookingStatus) -> Result<TimeBooking, EngineError> {
        let Some(BookingLocation::Appointment { business_id }) = self.store.locate(&id) else {
            return Err(EngineError::NotFound(id));
        };
        let _log = self.log_gate.read().await;
        let cal = self.store.calendar(&business_id).ok_or(EngineError::NotFound(business_id))?;
        let mut guard = cal.write().await;
        let current = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        if !current.status.can_become(status) {
            return Err(EngineError::InvalidTransition {
                id,
                from: current.status,
                to: status,
            });
        }

        let event = Event::AppointmentStatusChanged { id, business_id, status };
        self.persist_to_calendar(&mut guard, &event).await?;
        drop(guard);

        self.outbox.enqueue(BookingNotice {
            business_id,
            booking_id: id,
            kind: NoticeKind::AppointmentStatusChanged,
            status: status.as_str(),
            customer: current.customer.clone(),
        });
        Ok(TimeBooking { status, ..current })
    }

    /// Cancel a reservation and queue a notice for it.
    pub async fn release_reservation(&self, id: Ulid) -> Result<ResourceBooking, EngineError> {
        let booking = self.cancel_reservation(id).await?;
        if let Some(BookingLocation::Reservation { business_id, .. }) = self.store.locate(&id) {
            self.outbox.enqueue(BookingNotice {
                business_id,
                booking_id: id,
                kind: NoticeKind::ReservationCancelled,
                status: booking.status.as_str(),
                customer: booking.customer.clone(),
            });
        }
        Ok(booking)
    }

    /// Rewrite the WAL with only the events needed to recreate current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Exclusive: no mutation is between its WAL append and its apply.
        let _log = self.log_gate.write().await;
        let mut events = Vec::new();

        for id in self.store.business_ids() {
            let Some(cal) = self.store.calendar(&id) else { continue };
            let guard = cal.read().await;
            events.push(Event::BusinessUpserted {
                profile: guard.profile.clone(),
            });
            events.extend(guard.bookings.iter().map(|b| Event::AppointmentBooked { booking: b.clone() }));
        }
        for id in self.store.item_ids() {
            let Some(ledger) = self.store.ledger(&id) else { continue };
            let guard = ledger.read().await;
            let business_id = guard.item.business_id;
            events.push(Event::ItemUpserted {
                item: guard.item.clone(),
            });
            events.extend(guard.bookings.iter().map(|b| Event::ReservationBooked {
                business_id,
                booking: b.clone(),
            }));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
