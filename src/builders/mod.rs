//! Wiring helpers that assemble the dispatch system from configuration.

pub mod pool_builder;

pub use pool_builder::{build_dispatch, store_from_engine, DispatchSystem};
