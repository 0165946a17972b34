//! Plugin/Resource Manager
//!
//! Module catalog, the manager that loads modules and tracks sessions, and
//! read-side queries over the persisted graph.

pub mod catalog;
pub mod plugin_manager;
pub mod query;

pub use catalog::{LoadedModule, LoadedResourceClass, PluginDescriptor, PluginFactory, PluginModule};
pub use plugin_manager::{PluginManager, SessionInfo};
pub use query::{ResourceNode, ResourceQuery};
