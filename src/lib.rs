//! # Farm Dispatch
//!
//! The dispatch and resource-booking engine of a render farm.
//!
//! Worker hosts report idle cores, memory and GPUs. The engine matches
//! waiting frames of submitted jobs against those resources, reserves a
//! slice of the host (a *proc*) for each frame, and asks the host's agent to
//! launch it. Frames whose upstream work has not finished are held back by
//! the dependency graph.
//!
//! ## Pieces
//!
//! - **Frame ranges** ([`frames`]): the `1-100x5`, `1-10y2`, `1-10:5` grammar
//!   that expands into ordered frame numbers.
//! - **Resource ledger** ([`core::ledger`]): idle/total accounting for hosts
//!   and local desktop assignments, with GPU reservation.
//! - **Dependency graph** ([`depend`]): job, layer and frame ordering
//!   constraints, satisfied as upstream work completes.
//! - **Dispatcher** ([`core::dispatcher`], [`core::local`]): the booking loop
//!   with per-job locks, per-host and per-job caps, and failure
//!   classification.
//! - **Command pools** ([`core::worker_pool`], [`core::queues`]): booking,
//!   kill and management commands on bounded thread pools with host dedup
//!   and backpressure.
//! - **Collaborators** ([`infra`]): the persistence and remote-agent
//!   contracts, with an in-memory store and a caching agent client.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use farm_dispatch::builders::{build_dispatch, store_from_engine};
//! use farm_dispatch::config::DispatchConfig;
//!
//! let config = DispatchConfig::from_env()?;
//! let system = build_dispatch(&config, store_from_engine, |agent_cfg| {
//!     Arc::new(CachedAgentClient::new(MyConnector::default(), agent_cfg)) as Arc<_>
//! })?;
//!
//! system.queues.book(host)?;
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Booking engine, resource accounting and command pools.
pub mod core;
/// Configuration models for pools, the agent client and booking limits.
pub mod config;
/// Builders to assemble the dispatch system from configuration.
pub mod builders;
/// Execution-ordering constraints.
pub mod depend;
/// Frame-range expressions.
pub mod frames;
/// Persistence and remote agent adapters.
pub mod infra;
/// Async tick driver.
#[cfg(feature = "tokio-runtime")]
pub mod runtime;
/// Shared utilities.
pub mod util;
