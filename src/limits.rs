//! Hard bounds on tenant-controlled growth. Every limit maps to an
//! `EngineError::LimitExceeded` (or an io error at the tenant layer).

pub const MAX_TENANTS: usize = 256;
pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const MAX_SERVICES_PER_TENANT: usize = 4_096;
pub const MAX_RULES_PER_TENANT: usize = 65_536;
pub const MAX_SKIP_DATES_PER_RULE: usize = 4_096;
pub const MAX_BOOKINGS_PER_RULE: usize = 16_384;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_REASON_LEN: usize = 512;

/// Longest forward window a single generation call may scan.
pub const MAX_HORIZON_WEEKS: u32 = 260;

/// Largest period multiplier a rule may carry.
pub const MAX_INTERVAL: u32 = 52;

/// Calendar dates outside this year range are rejected at intake.
pub const MIN_VALID_YEAR: i32 = 2000;
pub const MAX_VALID_YEAR: i32 = 2100;
