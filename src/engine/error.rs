use thiserror::Error;
use ulid::Ulid;

use crate::model::BookingStatus;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Unknown or inactive venue/arena, unknown booking or slot.
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The requested range overlaps this committed booking.
    #[error("slot already booked: conflicts with booking {0}")]
    Conflict(Ulid),
    /// Lock or store could not be reached in time; safe to retry.
    #[error("temporarily unavailable: {0}")]
    Unavailable(String),
    #[error("booking {id} cannot go from {from} to {to}")]
    InvalidTransition {
        id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
    },
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
}

impl EngineError {
    pub(crate) fn not_found(what: &str, id: Ulid) -> Self {
        EngineError::NotFound(format!("{what} {id}"))
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidInput(msg.into())
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::Conflict(_) => "conflict",
            EngineError::Unavailable(_) => "unavailable",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::LimitExceeded(_) => "limit_exceeded",
        }
    }
}
