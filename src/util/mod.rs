//! Shared utilities: clock access, memory units, and tracing setup.

pub mod clock;
pub mod telemetry;
pub mod units;

pub use clock::*;
pub use telemetry::*;
pub use units::*;
