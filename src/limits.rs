use crate::model::Ms;

// Hard limits. Everything here exists to bound memory and WAL growth per
// tenant; exceeding any of them surfaces as `EngineError::LimitExceeded`.

pub const MAX_VEHICLES_PER_TENANT: usize = 10_000;

/// Retained rental requests (pending + terminal) per tenant.
pub const MAX_RENTALS_PER_TENANT: usize = 100_000;

/// Blocked intervals (committed bookings) per vehicle.
pub const MAX_BLOCKED_PER_VEHICLE: usize = 10_000;

/// Model / location / category / address / organization strings.
pub const MAX_TEXT_LEN: usize = 256;

/// Rejection reasons can be a sentence or two.
pub const MAX_REASON_LEN: usize = 1_024;

/// Timestamps must land between 2000-01-01 and 2100-01-01 (UTC, ms).
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single rental may span at most two years.
pub const MAX_RENTAL_DURATION_MS: Ms = 2 * 366 * 86_400_000;

/// Availability queries may scan at most five years.
pub const MAX_QUERY_WINDOW_MS: Ms = 5 * 366 * 86_400_000;

pub const MAX_PAGE_LIMIT: usize = 100;
pub const DEFAULT_PAGE_LIMIT: usize = 10;

pub const MAX_TENANTS: usize = 256;
pub const MAX_TENANT_NAME_LEN: usize = 256;
