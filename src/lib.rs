//! Storage Resource Graph
//!
//! A plugin-driven engine that keeps a persistent graph of storage
//! resources (hosts, controllers, disks, pools and anything a plugin
//! declares) synchronized with what discovery plugins report.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              Scheduler                                   │
//! │         initial scan with backoff · periodic updates · shutdown          │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  ┌────────────────────┐   ┌──────────────────────────────────────────┐  │
//! │  │   Plugin Manager   │   │             Plugin Session               │  │
//! │  │  module catalog    │──►│  plugin ─► ScanContext ─► SessionCache   │  │
//! │  │  class registry    │   │                              │           │  │
//! │  │  session registry  │   │            flush · cull · alerts         │  │
//! │  └─────────┬──────────┘   └──────────────────┬───────────────────────┘  │
//! │            │                                 │                           │
//! │            └──────────────┬──────────────────┘                           │
//! │                           ▼                                              │
//! │              ┌─────────────────────────┐                                 │
//! │              │  ResourceStore (port)   │  one transaction per scan       │
//! │              └─────────────────────────┘                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`schema`]: Resource types, attributes, statistics and alert conditions
//! - [`graph`]: Resource instances and the identity index
//! - [`plugin`]: Session cache, scan context, scan lifecycle and alerts
//! - [`manager`]: Module loading, session registry and graph queries
//! - [`store`]: Store implementations
//! - [`scheduler`]: Async driver for plugin sessions
//! - [`plugins`]: Bundled plugins
//! - [`domain`]: Store and plugin ports
//! - [`error`]: Error types and handling

pub mod domain;
pub mod error;
pub mod graph;
pub mod manager;
pub mod metrics;
pub mod plugin;
pub mod plugins;
pub mod scheduler;
pub mod schema;
pub mod store;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use domain::ports::{
    ClassId, RecordId, ResourceStore, ResourceStoreRef, StoragePlugin, StoreTransaction,
};

pub use error::{Error, ErrorAction, Result};

pub use graph::{Resource, ResourceHandle};

pub use manager::{
    LoadedModule, PluginDescriptor, PluginManager, PluginModule, ResourceNode, ResourceQuery,
};

pub use metrics::{EngineMetrics, MetricsSnapshot};

pub use plugin::{PluginSession, ScanContext, ScanKind, ScanReport, SessionEvent, SessionState};

pub use scheduler::{Scheduler, SchedulerConfig, SessionExit};

pub use schema::{
    AlertCondition, AttributeDef, AttributeValue, Identifier, ResourceType, StatisticDef,
    StatisticValue,
};

pub use store::InMemoryStore;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
