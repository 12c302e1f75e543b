use ulid::Ulid;

use crate::model::RentalStatus;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Operation not legal for the request's current lifecycle state.
    InvalidState {
        id: Ulid,
        status: RentalStatus,
    },
    /// The requested interval is no longer free at commit time; carries the
    /// id of the booking that blocks it.
    Conflict(Ulid),
    /// `end < start`.
    InvalidInterval {
        start: i64,
        end: i64,
    },
    InvalidInput(&'static str),
    /// Vehicle still has committed bookings on its calendar.
    HasBookings(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidState { id, status } => {
                write!(f, "rental {id} is {}, not pending", status.as_str())
            }
            EngineError::Conflict(id) => {
                write!(f, "interval no longer free: conflicts with booking {id}")
            }
            EngineError::InvalidInterval { start, end } => {
                write!(f, "invalid interval: [{start}, {end})")
            }
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::HasBookings(id) => {
                write!(f, "cannot remove vehicle {id}: bookings exist")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
