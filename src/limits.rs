use crate::model::Ms;

pub const MAX_CITY_LEN: usize = 64;
pub const MAX_ZIP_LEN: usize = 16;
pub const MAX_STREET_LEN: usize = 128;

pub const MAX_SECTORS_PER_PARKING: usize = 256;
pub const MAX_PLACES_PER_SECTOR: u32 = 100_000;
pub const MAX_SECTOR_WEIGHT: u32 = 1_000;

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 200;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
