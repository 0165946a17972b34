//! Plugin Modules
//!
//! A plugin module bundles the resource types a plugin reports with the
//! plugin type itself. Modules are provided to the manager by name and
//! loaded on first use.

use crate::domain::ports::{ClassId, StoragePlugin};
use crate::error::{Error, Result};
use crate::schema::ResourceType;
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;

/// Constructor for a plugin instance
pub type PluginFactory = Arc<dyn Fn() -> Box<dyn StoragePlugin> + Send + Sync>;

/// A named plugin type and how to instantiate it
#[derive(Clone)]
pub struct PluginDescriptor {
    name: String,
    factory: PluginFactory,
}

impl PluginDescriptor {
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn StoragePlugin> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            factory: Arc::new(factory),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instantiate(&self) -> Box<dyn StoragePlugin> {
        (self.factory)()
    }
}

impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("name", &self.name)
            .finish()
    }
}

// =============================================================================
// Plugin Module
// =============================================================================

/// Declarations provided by one plugin module
#[derive(Debug, Clone)]
pub struct PluginModule {
    name: String,
    resource_types: Vec<Arc<ResourceType>>,
    plugins: Vec<PluginDescriptor>,
}

impl PluginModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource_types: Vec::new(),
            plugins: Vec::new(),
        }
    }

    pub fn resource_type(mut self, resource_type: Arc<ResourceType>) -> Self {
        self.resource_types.push(resource_type);
        self
    }

    pub fn plugin(mut self, descriptor: PluginDescriptor) -> Self {
        self.plugins.push(descriptor);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resource_types(&self) -> &[Arc<ResourceType>] {
        &self.resource_types
    }

    pub fn plugins(&self) -> &[PluginDescriptor] {
        &self.plugins
    }

    /// The module's single plugin type
    pub(crate) fn single_plugin(&self) -> Result<&PluginDescriptor> {
        match self.plugins.as_slice() {
            [plugin] => Ok(plugin),
            [] => Err(Error::Module {
                module: self.name.clone(),
                reason: "module does not define a storage plugin".into(),
            }),
            many => Err(Error::Module {
                module: self.name.clone(),
                reason: format!(
                    "module defines more than one storage plugin: {}",
                    many.iter().map(|p| p.name()).collect::<Vec<_>>().join(", ")
                ),
            }),
        }
    }
}

// =============================================================================
// Loaded Module
// =============================================================================

/// A resource type together with its persisted class id
#[derive(Debug, Clone)]
pub struct LoadedResourceClass {
    pub resource_type: Arc<ResourceType>,
    pub class_id: ClassId,
}

/// A module whose schema has been registered with the store
#[derive(Debug)]
pub struct LoadedModule {
    name: String,
    plugin: PluginDescriptor,
    classes: IndexMap<String, LoadedResourceClass>,
}

impl LoadedModule {
    pub(crate) fn new(
        name: String,
        plugin: PluginDescriptor,
        classes: IndexMap<String, LoadedResourceClass>,
    ) -> Self {
        Self {
            name,
            plugin,
            classes,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn plugin(&self) -> &PluginDescriptor {
        &self.plugin
    }

    pub fn classes(&self) -> impl Iterator<Item = &LoadedResourceClass> {
        self.classes.values()
    }

    pub fn resource_type(&self, class_name: &str) -> Result<&Arc<ResourceType>> {
        self.class(class_name).map(|c| &c.resource_type)
    }

    pub fn class_id(&self, class_name: &str) -> Result<ClassId> {
        self.class(class_name).map(|c| c.class_id)
    }

    fn class(&self, class_name: &str) -> Result<&LoadedResourceClass> {
        self.classes
            .get(class_name)
            .ok_or_else(|| Error::UnknownResourceClass {
                module: self.name.clone(),
                class_name: class_name.to_string(),
            })
    }
}
