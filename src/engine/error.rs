#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingError {
    /// No caller identity on the request.
    Unauthenticated,
    MissingFields,
    InvalidResource,
    InvalidTimeFormat,
    /// Slot not in `(now, now + horizon]`.
    OutOfHorizon,
    SlotTaken,
    /// Caller identity does not resolve to a profile.
    OwnerNotFound,
    /// No reservation with that id owned by the caller.
    NotFound,
    EmailTaken,
    UserNotFound,
    LimitExceeded(&'static str),
    /// Store I/O failure; not part of the booking taxonomy.
    Storage(String),
}

impl BookingError {
    /// Stable machine-readable code, one per variant.
    pub fn code(&self) -> &'static str {
        match self {
            BookingError::Unauthenticated => "unauthenticated",
            BookingError::MissingFields => "missing_fields",
            BookingError::InvalidResource => "invalid_resource",
            BookingError::InvalidTimeFormat => "invalid_time_format",
            BookingError::OutOfHorizon => "out_of_horizon",
            BookingError::SlotTaken => "slot_taken",
            BookingError::OwnerNotFound => "owner_not_found",
            BookingError::NotFound => "not_found",
            BookingError::EmailTaken => "email_taken",
            BookingError::UserNotFound => "user_not_found",
            BookingError::LimitExceeded(_) => "limit_exceeded",
            BookingError::Storage(_) => "storage",
        }
    }

    pub fn is_storage(&self) -> bool {
        matches!(self, BookingError::Storage(_))
    }
}

impl std::fmt::Display for BookingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookingError::Unauthenticated => write!(f, "authentication required"),
            BookingError::MissingFields => write!(f, "missing required fields"),
            BookingError::InvalidResource => write!(f, "unknown resource"),
            BookingError::InvalidTimeFormat => {
                write!(f, "invalid time format, expected YYYY-MM-DD HH:MM")
            }
            BookingError::OutOfHorizon => {
                write!(f, "slot must be in the future and within the next 7 days")
            }
            BookingError::SlotTaken => write!(f, "slot already reserved"),
            BookingError::OwnerNotFound => write!(f, "user not found"),
            BookingError::NotFound => write!(f, "reservation not found"),
            BookingError::EmailTaken => write!(f, "email already registered"),
            BookingError::UserNotFound => write!(f, "no such user"),
            BookingError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            BookingError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for BookingError {}
