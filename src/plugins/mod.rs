//! Bundled Plugins
//!
//! Plugin modules shipped with the engine. The inventory plugin reports a
//! resource tree described by a YAML file, which lets the daemon run
//! against hardware it cannot probe directly.

pub mod inventory;

pub use inventory::{inventory_module, InventoryFile, InventoryPlugin, INVENTORY_MODULE, INVENTORY_PLUGIN};
