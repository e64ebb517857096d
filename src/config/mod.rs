//! Configuration models for command pools, the agent client and booking limits.

pub mod dispatch;
pub mod pool;

pub use dispatch::{AgentConfig, DispatchConfig, DispatcherConfig, StoreEngine};
pub use pool::PoolConfig;
