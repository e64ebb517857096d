//! Resource units used across the booking engine.
//!
//! Memory is tracked in kilobytes. Cores are tracked in core units where
//! [`CORE_UNITS_PER_CORE`] units make one physical core.

/// One megabyte expressed in KB.
pub const MB: i64 = 1024;
/// Half a gigabyte expressed in KB.
pub const MB512: i64 = 512 * MB;
/// One gigabyte expressed in KB.
pub const GB: i64 = 1024 * MB;
/// Two gigabytes expressed in KB.
pub const GB2: i64 = 2 * GB;
/// Four gigabytes expressed in KB.
pub const GB4: i64 = 4 * GB;

/// Core units that make up one whole core.
pub const CORE_UNITS_PER_CORE: i32 = 100;

/// Number of whole cores contained in `units` core units (floored).
#[must_use]
pub const fn whole_cores(units: i32) -> i32 {
    units / CORE_UNITS_PER_CORE
}
