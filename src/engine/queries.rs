use serde::Serialize;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// Every booking a business holds, for the `bookings` listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingsView {
    pub business_id: Ulid,
    pub appointments: Vec<TimeBooking>,
    pub reservations: Vec<ResourceBooking>,
}

impl Engine {
    pub async fn get_business(&self, business_id: Ulid) -> Result<BusinessProfile, EngineError> {
        let cal = self
            .store
            .calendar(&business_id)
            .ok_or(EngineError::NotFound(business_id))?;
        let guard = cal.read().await;
        Ok(guard.profile.clone())
    }

    pub async fn get_appointment(&self, id: Ulid) -> Result<TimeBooking, EngineError> {
        let Some(super::BookingLocation::Appointment { business_id }) = self.store.locate(&id) else {
            return Err(EngineError::NotFound(id));
        };
        let cal = self
            .store
            .calendar(&business_id)
            .ok_or(EngineError::NotFound(business_id))?;
        let guard = cal.read().await;
        guard.booking(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Items owned by a business, sorted by id.
    pub async fn list_items(&self, business_id: Ulid) -> Vec<InventoryItem> {
        let mut items = Vec::new();
        for id in self.store.item_ids() {
            let Some(ledger) = self.store.ledger(&id) else { continue };
            let guard = ledger.read().await;
            if guard.item.business_id == business_id {
                items.push(guard.item.clone());
            }
        }
        items
    }

    /// Appointments (sorted by start) and reservations (sorted by first day),
    /// optionally restricted to those touching `within`.
    pub async fn list_bookings(&self, business_id: Ulid, within: Option<Span>) -> Result<BookingsView, EngineError> {
        let cal = self
            .store
            .calendar(&business_id)
            .ok_or(EngineError::NotFound(business_id))?;
        let appointments = {
            let guard = cal.read().await;
            match within {
                Some(span) => guard.overlapping(&span).cloned().collect(),
                None => guard.bookings.clone(),
            }
        };

        let mut reservations = Vec::new();
        for id in self.store.item_ids() {
            let Some(ledger) = self.store.ledger(&id) else { continue };
            let guard = ledger.read().await;
            if guard.item.business_id == business_id {
                reservations.extend(guard.bookings.iter().cloned());
            }
        }
        reservations.sort_by_key(|b| (b.range.start, b.id));

        Ok(BookingsView {
            business_id,
            appointments,
            reservations,
        })
    }
}
