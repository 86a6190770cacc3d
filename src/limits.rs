use crate::model::Ms;

/// One slot per minute across a 25-hour DST day.
pub const MAX_SLOTS_PER_DAY: usize = 1_500;
pub const MAX_CALENDARS_PER_BUSINESS: usize = 32;
pub const MAX_SERVICES_PER_BUSINESS: usize = 256;
pub const MAX_BUSINESSES: usize = 100_000;
pub const MAX_ITEMS: usize = 1_000_000;
pub const MAX_BOOKINGS_PER_CALENDAR: usize = 1_000_000;
pub const MAX_BOOKINGS_PER_ITEM: usize = 1_000_000;
pub const MAX_RESERVATION_DAYS: i64 = 366;
pub const MAX_QUANTITY: u32 = 1_000_000;
pub const MAX_APPOINTMENT_MINUTES: u32 = 24 * 60;
pub const MAX_NOTICE_HOURS: f64 = 24.0 * 365.0;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_CUSTOMER_LEN: usize = 512;
pub const MAX_LINE_LEN: usize = 256 * 1024;
pub const MAX_LISTENS_PER_CONNECTION: usize = 64;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
