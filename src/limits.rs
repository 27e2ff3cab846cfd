//! Hard limits enforced per tenant. Requests past these fail with
//! `EngineError::LimitExceeded` instead of growing state without bound.

pub const MAX_TENANTS: usize = 1_024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_VENUES_PER_TENANT: usize = 100_000;
pub const MAX_ARENAS_PER_VENUE: usize = 256;
pub const MAX_SLOTS_PER_ARENA: usize = 7 * 48;
pub const MAX_BOOKINGS_PER_PARTITION: usize = 1_440;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_SPORT_LEN: usize = 64;
pub const MAX_NOTES_LEN: usize = 1_024;

pub const MIN_MOBILE_DIGITS: usize = 10;
pub const MAX_MOBILE_DIGITS: usize = 15;

pub const MAX_PRICE_PER_HOUR: i64 = 10_000_000;
