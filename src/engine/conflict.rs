use crate::interval::{collides, saturated_spans};
use crate::limits::*;
use crate::model::*;
use crate::slots::parse_timezone;

use super::store::BusinessCalendar;
use super::EngineError;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > minutes_to_ms(MAX_APPOINTMENT_MINUTES) {
        return Err(EngineError::LimitExceeded("appointment too long"));
    }
    Ok(())
}

pub(crate) fn validate_range(range: &DateRange) -> Result<(), EngineError> {
    if !range.is_valid() {
        return Err(EngineError::InvalidInput(format!(
            "range ends ({}) before it starts ({})",
            range.last_day(),
            range.start
        )));
    }
    if range.days() > MAX_RESERVATION_DAYS {
        return Err(EngineError::LimitExceeded("reservation range too long"));
    }
    Ok(())
}

pub(crate) fn validate_customer(customer: &str) -> Result<(), EngineError> {
    if customer.trim().is_empty() {
        return Err(EngineError::InvalidInput("customer reference is required".into()));
    }
    if customer.len() > MAX_CUSTOMER_LEN {
        return Err(EngineError::LimitExceeded("customer reference too long"));
    }
    Ok(())
}

fn validate_name(name: &Option<String>) -> Result<(), EngineError> {
    if let Some(n) = name
        && n.len() > MAX_NAME_LEN
    {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn validate_duration(what: &str, minutes: u32) -> Result<(), EngineError> {
    if minutes == 0 {
        return Err(EngineError::InvalidInput(format!("{what} must be positive")));
    }
    if minutes > MAX_APPOINTMENT_MINUTES {
        return Err(EngineError::LimitExceeded("duration too long"));
    }
    Ok(())
}

pub(crate) fn validate_profile(profile: &BusinessProfile) -> Result<(), EngineError> {
    validate_name(&profile.name)?;
    parse_timezone(&profile.slots.timezone)?;
    validate_duration("slot duration", profile.slots.duration_minutes)?;
    if let Some(c) = profile.slots.conflict_duration_minutes {
        validate_duration("conflict duration", c)?;
    }
    if profile.slots.buffer_minutes > MAX_APPOINTMENT_MINUTES {
        return Err(EngineError::LimitExceeded("buffer too long"));
    }
    let notice = profile.slots.min_hours_notice;
    if !notice.is_finite() || notice < 0.0 {
        return Err(EngineError::InvalidInput("min_hours_notice must be a non-negative number".into()));
    }
    if notice > MAX_NOTICE_HOURS {
        return Err(EngineError::LimitExceeded("notice too long"));
    }
    if profile.slots.parallel_bookings == 0 {
        return Err(EngineError::InvalidInput("parallel_bookings must be at least 1".into()));
    }
    if profile.services.len() > MAX_SERVICES_PER_BUSINESS {
        return Err(EngineError::LimitExceeded("too many services"));
    }
    for (name, svc) in &profile.services {
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("service name too long"));
        }
        validate_duration("service duration", svc.duration_minutes)?;
        if let Some(c) = svc.conflict_duration_minutes {
            validate_duration("service conflict duration", c)?;
        }
    }
    if profile.calendar_ids.len() > MAX_CALENDARS_PER_BUSINESS {
        return Err(EngineError::LimitExceeded("too many calendars"));
    }
    Ok(())
}

pub(crate) fn validate_item(item: &InventoryItem) -> Result<(), EngineError> {
    validate_name(&item.name)?;
    if item.total_quantity > MAX_QUANTITY {
        return Err(EngineError::LimitExceeded("quantity too large"));
    }
    Ok(())
}

/// Fails if an appointment tested as `requested` would collide with committed
/// bookings, padded by the business buffer, at its parallel capacity. This is
/// the same rule availability applies to committed bookings.
pub(crate) fn check_time_available(cal: &BusinessCalendar, requested: &Span) -> Result<(), EngineError> {
    let business_id = cal.profile.id;
    let buffer = cal.profile.slots.buffer_minutes;
    let capacity = cal.profile.slots.parallel_bookings.max(1);
    let search = requested.expand(buffer);

    if capacity == 1 {
        if let Some(existing) = cal.committed_overlapping(&search).next() {
            return Err(EngineError::SlotNoLongerAvailable {
                business_id,
                requested: *requested,
                conflicting: Some(existing.id),
            });
        }
        return Ok(());
    }

    let allocs = cal.committed_spans(&search);
    if collides(&saturated_spans(&allocs, capacity), requested, buffer).is_some() {
        return Err(EngineError::SlotNoLongerAvailable {
            business_id,
            requested: *requested,
            conflicting: None,
        });
    }
    Ok(())
}
