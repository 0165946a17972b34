//! Resource Store Implementations
//!
//! Implementations of the [`ResourceStore`](crate::domain::ports::ResourceStore)
//! port. The in-memory store backs the daemon's standalone mode and the
//! test suite.

pub mod memory;

pub use memory::{AlertNotification, InMemoryStore, StatisticSample};
