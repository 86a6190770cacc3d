use chrono::{Datelike, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::interval::{collides, merge_sorted, saturated_spans};
use crate::model::*;
use crate::provider::fetch_busy_or_degrade;
use crate::slots::{candidate_slots, day_window, display_time, parse_date, parse_timezone, today_in, CandidateSlot};

use super::conflict::now_ms;
use super::ledger::remaining_capacity;
use super::{Engine, EngineError, EngineWarning};

/// Why a slot cannot be booked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Unavailability {
    /// Collides with buffered busy time or a committed booking.
    Busy,
    /// Starts inside the minimum-notice window.
    Notice,
    /// The day is already over in the business timezone.
    Past,
    /// Not enough inventory left for the requested quantity.
    SoldOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotVerdict {
    pub slot: CandidateSlot,
    pub unavailable: Option<Unavailability>,
}

impl SlotVerdict {
    pub fn is_available(&self) -> bool {
        self.unavailable.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolveRules {
    pub buffer_minutes: u32,
    /// Length tested against busy time, independent of slot spacing.
    pub conflict_duration_minutes: u32,
    pub now: Ms,
    pub min_hours_notice: f64,
    /// Notice only applies when the queried day is today.
    pub is_today: bool,
}

impl ResolveRules {
    fn notice_cutoff(&self) -> Ms {
        self.now + (self.min_hours_notice * HOUR_MS as f64).round() as Ms
    }
}

/// Flag each candidate against `busy` and the notice window. Output order
/// matches input order and no slot is dropped.
pub fn resolve(
    candidates: impl IntoIterator<Item = CandidateSlot>,
    busy: &[Span],
    rules: &ResolveRules,
) -> Vec<SlotVerdict> {
    let busy = merge_sorted(busy);
    let cutoff = rules.notice_cutoff();

    candidates
        .into_iter()
        .map(|slot| {
            let effective = Span::starting_at(slot.start, rules.conflict_duration_minutes);
            let unavailable = if rules.is_today && slot.start < cutoff {
                Some(Unavailability::Notice)
            } else if collides(&busy, &effective, rules.buffer_minutes).is_some() {
                Some(Unavailability::Busy)
            } else {
                None
            };
            SlotVerdict { slot, unavailable }
        })
        .collect()
}

// ── Engine query ─────────────────────────────────────────

fn one() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRequest {
    pub item_id: Ulid,
    #[serde(default = "one")]
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityQuery {
    pub business_id: Ulid,
    /// Calendar day, `YYYY-MM-DD`.
    pub date: String,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub inventory: Option<InventoryRequest>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HoursWindow {
    pub opens: NaiveTime,
    pub closes: NaiveTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnnotatedSlot {
    pub start: Ms,
    pub display_time: String,
    pub duration_minutes: u32,
    pub available: bool,
    pub reason: Option<Unavailability>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailabilityReport {
    pub business_id: Ulid,
    pub date: NaiveDate,
    pub timezone: String,
    /// Opening hours used; `None` when closed that weekday.
    pub window: Option<HoursWindow>,
    pub slots: Vec<AnnotatedSlot>,
    pub remaining_inventory: Option<u32>,
    pub warnings: Vec<EngineWarning>,
}

impl Engine {
    pub async fn query_availability(&self, query: &AvailabilityQuery) -> Result<AvailabilityReport, EngineError> {
        self.query_availability_at(query, now_ms()).await
    }

    /// Availability as seen at instant `now`.
    pub async fn query_availability_at(
        &self,
        query: &AvailabilityQuery,
        now: Ms,
    ) -> Result<AvailabilityReport, EngineError> {
        let started = std::time::Instant::now();
        let date = parse_date(&query.date)?;
        let cal = self
            .store
            .calendar(&query.business_id)
            .ok_or(EngineError::NotFound(query.business_id))?;

        // Copy what we need and drop the lock before any I/O.
        let (profile, local_busy, tz, duration, conflict_duration, search) = {
            let guard = cal.read().await;
            let profile = guard.profile.clone();
            let tz = parse_timezone(&profile.slots.timezone)?;
            let (duration, conflict_duration) = profile
                .durations(query.service.as_deref())
                .ok_or_else(|| {
                    EngineError::InvalidInput(format!(
                        "unknown service {:?}",
                        query.service.as_deref().unwrap_or_default()
                    ))
                })?;
            let day = day_window(tz, date);
            let pad = minutes_to_ms(profile.slots.buffer_minutes.saturating_add(conflict_duration));
            let search = Span::new(day.start - pad, day.end + pad);

            let committed = guard.committed_spans(&search);
            let parallel = profile.slots.parallel_bookings.max(1);
            let local_busy = if parallel > 1 {
                saturated_spans(&committed, parallel)
            } else {
                committed
            };
            (profile, local_busy, tz, duration, conflict_duration, search)
        };

        let remaining_inventory = match &query.inventory {
            Some(inv) => Some(self.inventory_for_day(query.business_id, inv, date).await?),
            None => None,
        };

        let schedule = profile.schedule_for(date.weekday());
        let candidates: Vec<CandidateSlot> = match schedule {
            Some(schedule) => {
                candidate_slots(date, tz, schedule, duration, profile.slots.buffer_minutes)?.collect()
            }
            None => Vec::new(),
        };

        let mut warnings = Vec::new();
        let mut busy = local_busy;
        if !candidates.is_empty() {
            let outcome = fetch_busy_or_degrade(
                self.provider.as_ref(),
                &profile.calendar_ids,
                search,
                tz,
                self.provider_timeout,
            )
            .await;
            busy.extend(outcome.busy);
            warnings.extend(outcome.issues.into_iter().map(|issue| EngineWarning::ProviderDegraded {
                business_id: profile.id,
                calendar_id: issue.calendar_id,
                reason: issue.reason,
            }));
        }

        let today = today_in(tz, now);
        let mut verdicts = if date < today {
            candidates
                .into_iter()
                .map(|slot| SlotVerdict {
                    slot,
                    unavailable: Some(Unavailability::Past),
                })
                .collect()
        } else {
            let rules = ResolveRules {
                buffer_minutes: profile.slots.buffer_minutes,
                conflict_duration_minutes: conflict_duration,
                now,
                min_hours_notice: profile.slots.min_hours_notice,
                is_today: date == today,
            };
            resolve(candidates, &busy, &rules)
        };

        if let (Some(inv), Some(remaining)) = (&query.inventory, remaining_inventory)
            && remaining < inv.quantity
        {
            for v in verdicts.iter_mut().filter(|v| v.is_available()) {
                v.unavailable = Some(Unavailability::SoldOut);
            }
        }

        let slots = verdicts
            .into_iter()
            .map(|v| AnnotatedSlot {
                start: v.slot.start,
                display_time: display_time(tz, v.slot.start),
                duration_minutes: v.slot.duration_minutes,
                available: v.is_available(),
                reason: v.unavailable,
            })
            .collect();

        metrics::histogram!(crate::observability::AVAILABILITY_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        Ok(AvailabilityReport {
            business_id: profile.id,
            date,
            timezone: profile.slots.timezone.clone(),
            window: schedule.map(|s| HoursWindow {
                opens: s.opens,
                closes: s.closes,
            }),
            slots,
            remaining_inventory,
            warnings,
        })
    }

    async fn inventory_for_day(
        &self,
        business_id: Ulid,
        inv: &InventoryRequest,
        date: NaiveDate,
    ) -> Result<u32, EngineError> {
        if inv.quantity == 0 {
            return Err(EngineError::InvalidInput("quantity must be at least 1".into()));
        }
        let ledger = self.store.ledger(&inv.item_id).ok_or(EngineError::NotFound(inv.item_id))?;
        let guard = ledger.read().await;
        if guard.item.business_id != business_id {
            return Err(EngineError::NotFound(inv.item_id));
        }
        Ok(remaining_capacity(&guard, &DateRange::single(date)))
    }
}
