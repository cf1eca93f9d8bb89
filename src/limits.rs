//! Hard limits on inputs and per-shop state.

/// Customer, service and shop names.
pub const MAX_NAME_LEN: usize = 120;

pub const MAX_DESCRIPTION_LEN: usize = 500;

/// `wa.me` numbers: country code + subscriber number, digits only.
pub const MAX_WHATSAPP_LEN: usize = 20;

/// Sub-intervals per hour; more than 60 would make the slot length zero minutes.
pub const MAX_SLOTS_PER_HOUR: u32 = 60;

/// Service duration in minutes.
pub const MAX_SERVICE_DURATION_MIN: u32 = 24 * 60;

/// Prices and expense amounts, in cents.
pub const MAX_AMOUNT_CENTS: i64 = 100_000_000;

pub const MAX_SERVICES_PER_SHOP: usize = 500;

/// Days shown by the booking date picker.
pub const BOOKING_WINDOW_DAYS: u32 = 7;

pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_TENANTS: usize = 1_000;
