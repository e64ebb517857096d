//! Async drivers that feed the command pools.

pub mod tick;

pub use tick::{BookingTicker, HostSource, TickReport};
