//! Hard limits. Anything past these is rejected with `LimitExceeded`.

/// New reservations must fall in `(now, now + BOOKING_HORIZON_DAYS]`.
pub const BOOKING_HORIZON_DAYS: i64 = 7;

pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_DISPLAY_NAME_LEN: usize = 128;
pub const MAX_USERS_PER_VENUE: usize = 1_000_000;
pub const MAX_RESERVATIONS_PER_RESOURCE: usize = 1_000_000;

pub const MAX_VENUES: usize = 1024;
pub const MAX_VENUE_NAME_LEN: usize = 64;
