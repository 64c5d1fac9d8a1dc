//! Output plugin pipeline
//!
//! This module provides:
//! - [`OutputPlugin`] trait for result post-processors
//! - [`OutputPluginRegistry`] for creating plugins by name
//! - [`OutputPipeline`] background worker applying plugins to result batches
//! - Built-in plugins (email notification, JSON export, test sinks)

mod builtin;
mod pipeline;
mod plugin;
mod registry;

pub use builtin::{
    DummyOutputPlugin, EmailOutputPlugin, EmailOutputPluginArgs, FailingDummyOutputPlugin,
    JsonExportOutputPlugin, JsonExportOutputPluginArgs, NoArgs,
};
pub use pipeline::{OutputPipeline, PluginApplier};
pub use plugin::{
    plugin_instance_ids, OutputPlugin, OutputPluginDescriptor, OutputPluginLogEntry,
    OutputPluginState, PluginBatchRecord, PluginError, PluginOutcome,
};
pub use registry::{
    ConfigurablePlugin, OutputPluginRegistry, OutputPluginTypeDescriptor, PluginFactory,
};
