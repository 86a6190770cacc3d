use serde::Serialize;
use ulid::Ulid;

use crate::model::{BookingStatus, DateRange, Span};

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    InvalidInput(String),
    NotFound(Ulid),
    SlotNoLongerAvailable {
        business_id: Ulid,
        requested: Span,
        conflicting: Option<Ulid>,
    },
    InsufficientCapacity {
        item_id: Ulid,
        range: DateRange,
        requested: u32,
        remaining: u32,
    },
    InvalidTransition {
        id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
    },
    RateLimited(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::NotFound(_) => "not_found",
            EngineError::SlotNoLongerAvailable { .. } => "slot_no_longer_available",
            EngineError::InsufficientCapacity { .. } => "insufficient_capacity",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::RateLimited(_) => "rate_limited",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "storage_error",
        }
    }

    /// HTTP-equivalent status.
    pub fn status(&self) -> u16 {
        match self {
            EngineError::InvalidInput(_) | EngineError::LimitExceeded(_) => 400,
            EngineError::NotFound(_) => 404,
            EngineError::SlotNoLongerAvailable { .. }
            | EngineError::InsufficientCapacity { .. }
            | EngineError::InvalidTransition { .. } => 409,
            EngineError::RateLimited(_) => 429,
            EngineError::WalError(_) => 500,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.status() == 409
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::SlotNoLongerAvailable {
                business_id,
                requested,
                conflicting,
            } => {
                write!(
                    f,
                    "slot [{}, {}) for business {business_id} is no longer available",
                    requested.start, requested.end
                )?;
                if let Some(id) = conflicting {
                    write!(f, " (taken by {id})")?;
                }
                Ok(())
            }
            EngineError::InsufficientCapacity {
                item_id,
                range,
                requested,
                remaining,
            } => write!(
                f,
                "item {item_id} has {remaining} left for {range}, {requested} requested"
            ),
            EngineError::InvalidTransition { id, from, to } => write!(
                f,
                "booking {id} cannot go from {} to {}",
                from.as_str(),
                to.as_str()
            ),
            EngineError::RateLimited(msg) => write!(f, "rate limited: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<crate::slots::SlotError> for EngineError {
    fn from(e: crate::slots::SlotError) -> Self {
        EngineError::InvalidInput(e.to_string())
    }
}

/// Soft failures returned alongside a successful result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum EngineWarning {
    /// Busy data was missing or partial; slots were computed without it.
    ProviderDegraded {
        business_id: Ulid,
        calendar_id: Option<String>,
        reason: String,
    },
    /// The local record and the external calendar disagree and need manual
    /// reconciliation.
    PartialCommit {
        business_id: Ulid,
        booking_id: Ulid,
        detail: String,
    },
}

impl EngineWarning {
    pub fn code(&self) -> &'static str {
        match self {
            EngineWarning::ProviderDegraded { .. } => "provider_degraded",
            EngineWarning::PartialCommit { .. } => "partial_commit",
        }
    }
}
