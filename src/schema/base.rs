//! Base Resource Types
//!
//! Abstract types plugin authors extend so that resources from different
//! vendors share a common vocabulary. None of these declare an identifier;
//! concrete subtypes must.

use crate::schema::attributes::AttributeDef;
use crate::schema::resource_type::ResourceType;
use std::sync::Arc;

/// Module name under which the base types are declared
pub const BASE_MODULE: &str = "base";

fn abstract_type(name: &str, human_name: &str) -> Arc<ResourceType> {
    ResourceType::builder(BASE_MODULE, name)
        .human_name(human_name)
        .build()
        .expect("base resource type without declarations is always valid")
}

pub fn host() -> Arc<ResourceType> {
    abstract_type("Host", "Host")
}

pub fn controller() -> Arc<ResourceType> {
    abstract_type("Controller", "Controller")
}

pub fn enclosure() -> Arc<ResourceType> {
    abstract_type("Enclosure", "Enclosure")
}

pub fn fan() -> Arc<ResourceType> {
    abstract_type("Fan", "Fan")
}

pub fn physical_disk() -> Arc<ResourceType> {
    abstract_type("PhysicalDisk", "Physical disk")
}

pub fn virtual_disk() -> Arc<ResourceType> {
    abstract_type("VirtualDisk", "Virtual disk")
}

pub fn storage_pool() -> Arc<ResourceType> {
    abstract_type("StoragePool", "Storage pool")
}

/// A block device node as seen from a host
pub fn device_node() -> Arc<ResourceType> {
    ResourceType::builder(BASE_MODULE, "DeviceNode")
        .human_name("Device node")
        .attribute("host", AttributeDef::host_name())
        .attribute("path", AttributeDef::posix_path())
        .build()
        .expect("device node declarations are consistent")
}
