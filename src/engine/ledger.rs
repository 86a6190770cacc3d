use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{validate_customer, validate_range};
use super::store::{BookingLocation, ItemLedger};
use super::{Engine, EngineError};

/// Units still free for every day of `range`: total minus the quantity held
/// by active reservations overlapping it. Inactive items have none.
pub fn remaining_capacity(ledger: &ItemLedger, range: &DateRange) -> u32 {
    if !ledger.item.is_active {
        return 0;
    }
    let used: u64 = ledger
        .active_overlapping(range)
        .map(|b| u64::from(b.quantity))
        .sum();
    u64::from(ledger.item.total_quantity).saturating_sub(used) as u32
}

impl Engine {
    /// Current remaining capacity of `item_id` over `range`.
    pub async fn remaining_capacity(&self, item_id: Ulid, range: DateRange) -> Result<u32, EngineError> {
        validate_range(&range)?;
        let ledger = self.store.ledger(&item_id).ok_or(EngineError::NotFound(item_id))?;
        let guard = ledger.read().await;
        Ok(remaining_capacity(&guard, &range))
    }

    /// Hold `quantity` units of an item for `range`. Capacity is recomputed
    /// under the item's write lock, so concurrent reservations on the same
    /// item are strictly ordered.
    pub async fn reserve(
        &self,
        item_id: Ulid,
        range: DateRange,
        quantity: u32,
        customer: &str,
    ) -> Result<ResourceBooking, EngineError> {
        validate_range(&range)?;
        validate_customer(customer)?;
        if quantity == 0 {
            return Err(EngineError::InvalidInput("quantity must be at least 1".into()));
        }
        if quantity > MAX_QUANTITY {
            return Err(EngineError::LimitExceeded("quantity too large"));
        }

        let _log = self.log_gate.read().await;
        let ledger = self.store.ledger(&item_id).ok_or(EngineError::NotFound(item_id))?;
        let mut guard = ledger.write().await;
        if !guard.item.is_active {
            return Err(EngineError::InvalidInput(format!("item {item_id} is not bookable")));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_ITEM {
            return Err(EngineError::LimitExceeded("too many reservations on item"));
        }

        let remaining = remaining_capacity(&guard, &range);
        if quantity > remaining {
            return Err(EngineError::InsufficientCapacity {
                item_id,
                range,
                requested: quantity,
                remaining,
            });
        }

        let business_id = guard.item.business_id;
        let booking = ResourceBooking {
            id: Ulid::new(),
            item_id,
            range,
            quantity,
            status: ReservationStatus::Active,
            customer: customer.to_string(),
        };
        let event = Event::ReservationBooked {
            business_id,
            booking: booking.clone(),
        };
        self.persist_to_ledger(&mut guard, &event).await?;
        self.store
            .index_booking(booking.id, BookingLocation::Reservation { business_id, item_id });
        info!("reserved {quantity} of item {item_id} for {range} ({})", booking.id);
        Ok(booking)
    }

    /// Mark a reservation cancelled. Fails if it already is.
    pub(super) async fn cancel_reservation(&self, id: Ulid) -> Result<ResourceBooking, EngineError> {
        let Some(BookingLocation::Reservation { business_id, item_id }) = self.store.locate(&id) else {
            return Err(EngineError::NotFound(id));
        };
        let _log = self.log_gate.read().await;
        let ledger = self.store.ledger(&item_id).ok_or(EngineError::NotFound(item_id))?;
        let mut guard = ledger.write().await;
        let current = guard
            .bookings
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        if !current.is_active() {
            return Err(EngineError::InvalidInput(format!("reservation {id} is already cancelled")));
        }

        let event = Event::ReservationCancelled { id, business_id, item_id };
        self.persist_to_ledger(&mut guard, &event).await?;
        Ok(ResourceBooking {
            status: ReservationStatus::Cancelled,
            ..current
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    fn ledger(total: u32, active: bool) -> ItemLedger {
        ItemLedger::new(InventoryItem {
            id: Ulid::new(),
            business_id: Ulid::new(),
            name: None,
            total_quantity: total,
            is_active: active,
        })
    }

    fn hold(ledger: &mut ItemLedger, range: DateRange, quantity: u32) {
        let item_id = ledger.item.id;
        ledger.insert_booking(ResourceBooking {
            id: Ulid::new(),
            item_id,
            range,
            quantity,
            status: ReservationStatus::Active,
            customer: "c".into(),
        });
    }

    #[test]
    fn scenario_c_full_day_has_no_capacity() {
        let mut l = ledger(3, true);
        hold(&mut l, DateRange::single(day(2)), 2);
        hold(&mut l, DateRange::single(day(2)), 1);
        assert_eq!(remaining_capacity(&l, &DateRange::single(day(2))), 0);
        assert_eq!(remaining_capacity(&l, &DateRange::single(day(3))), 3);
    }

    #[test]
    fn multi_day_range_counts_every_overlap() {
        let mut l = ledger(5, true);
        hold(&mut l, DateRange::new(day(1), Some(day(3))), 2);
        hold(&mut l, DateRange::single(day(4)), 1);
        assert_eq!(remaining_capacity(&l, &DateRange::new(day(3), Some(day(4)))), 2);
        assert_eq!(remaining_capacity(&l, &DateRange::single(day(5))), 5);
    }

    #[test]
    fn overbooked_clamps_to_zero() {
        let mut l = ledger(1, true);
        hold(&mut l, DateRange::single(day(2)), 4);
        assert_eq!(remaining_capacity(&l, &DateRange::single(day(2))), 0);
    }

    #[test]
    fn inactive_item_has_no_capacity() {
        let l = ledger(10, false);
        assert_eq!(remaining_capacity(&l, &DateRange::single(day(2))), 0);
    }

    #[test]
    fn cancelled_reservations_free_capacity() {
        let mut l = ledger(2, true);
        hold(&mut l, DateRange::single(day(2)), 2);
        l.bookings[0].status = ReservationStatus::Cancelled;
        assert_eq!(remaining_capacity(&l, &DateRange::single(day(2))), 2);
    }
}
