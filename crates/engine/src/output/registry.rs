//! Output plugin registry
//!
//! Maps plugin names (as used in [`OutputPluginDescriptor`]) to factories
//! that build a plugin from its JSON arguments.

use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::builtin::{
    DummyOutputPlugin, EmailOutputPlugin, FailingDummyOutputPlugin, JsonExportOutputPlugin,
};
use super::{OutputPlugin, OutputPluginDescriptor, PluginError};

/// Factory building a plugin instance from its arguments
pub type PluginFactory =
    Box<dyn Fn(&Value) -> Result<Box<dyn OutputPlugin>, PluginError> + Send + Sync>;

/// A plugin whose arguments deserialize from JSON
///
/// Implementing this is enough to register the plugin by name.
pub trait ConfigurablePlugin: OutputPlugin + Sized + 'static {
    const NAME: &'static str;
    const DOC: &'static str = "";

    type Args: DeserializeOwned + JsonSchema + Default;

    fn from_args(args: Self::Args) -> Result<Self, PluginError>;
}

/// Metadata describing an available output plugin type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputPluginTypeDescriptor {
    pub name: String,
    pub doc: String,
    pub args_schema: Value,
}

struct RegisteredPlugin {
    factory: PluginFactory,
    descriptor: OutputPluginTypeDescriptor,
}

/// Registry of output plugin factories
pub struct OutputPluginRegistry {
    plugins: BTreeMap<String, RegisteredPlugin>,
}

impl Default for OutputPluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputPluginRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            plugins: BTreeMap::new(),
        }
    }

    /// Registry holding the built-in plugins
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register::<EmailOutputPlugin>();
        registry.register::<JsonExportOutputPlugin>();
        registry.register::<DummyOutputPlugin>();
        registry.register::<FailingDummyOutputPlugin>();
        registry
    }

    /// Register a plugin type under its name
    pub fn register<P: ConfigurablePlugin>(&mut self) {
        let factory: PluginFactory = Box::new(|args: &Value| {
            let typed: P::Args = if args.is_null() {
                P::Args::default()
            } else {
                serde_json::from_value(args.clone())
                    .map_err(|e| PluginError::InvalidArgs(e.to_string()))?
            };
            Ok(Box::new(P::from_args(typed)?) as Box<dyn OutputPlugin>)
        });

        let descriptor = OutputPluginTypeDescriptor {
            name: P::NAME.to_string(),
            doc: P::DOC.to_string(),
            args_schema: serde_json::to_value(schemars::schema_for!(P::Args)).unwrap_or_default(),
        };

        self.plugins
            .insert(P::NAME.to_string(), RegisteredPlugin { factory, descriptor });
    }

    /// Register a custom factory under `name`
    pub fn register_factory(&mut self, name: impl Into<String>, factory: PluginFactory) {
        let name = name.into();
        let descriptor = OutputPluginTypeDescriptor {
            name: name.clone(),
            doc: String::new(),
            args_schema: Value::Null,
        };
        self.plugins
            .insert(name, RegisteredPlugin { factory, descriptor });
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// Build a plugin from a descriptor
    pub fn create(
        &self,
        descriptor: &OutputPluginDescriptor,
    ) -> Result<Box<dyn OutputPlugin>, PluginError> {
        let registered = self.plugins.get(&descriptor.plugin_name).ok_or_else(|| {
            PluginError::InvalidArgs(format!(
                "unknown output plugin: {}",
                descriptor.plugin_name
            ))
        })?;
        (registered.factory)(&descriptor.plugin_args)
    }

    /// Check that a descriptor names a known plugin with valid arguments
    pub fn validate(&self, descriptor: &OutputPluginDescriptor) -> Result<(), PluginError> {
        self.create(descriptor).map(|_| ())
    }

    /// Descriptors of all registered plugin types, sorted by name
    pub fn descriptors(&self) -> Vec<OutputPluginTypeDescriptor> {
        self.plugins
            .values()
            .map(|p| p.descriptor.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

impl fmt::Debug for OutputPluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputPluginRegistry")
            .field("plugins", &self.plugins.keys().collect::<Vec<_>>())
            .finish()
    }
}
