//! Adapters for the collaborators the booking engine depends on: worker
//! agents and persistence.

pub mod agent;
pub mod store;

pub use agent::{CachedAgentClient, RemoteAgentClient};
pub use store::{DispatchStore, InMemoryStore};
