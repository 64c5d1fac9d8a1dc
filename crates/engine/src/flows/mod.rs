//! Built-in flow types
//!
//! - [`ListProcesses`] - list (and optionally fetch) running processes
//! - [`GetFile`] / [`FileFinder`] - file collection
//! - [`Interrogate`] - client summary

mod administrative;
mod filesystem;
mod processes;

use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

use crate::engine::FlowRegistry;

pub use administrative::{Interrogate, InterrogateArgs};
pub use filesystem::{FileFinder, FileFinderAction, FileFinderArgs, GetFile, GetFileArgs};
pub use processes::{ListProcesses, ListProcessesArgs};

/// Flow categories shown in descriptors
pub const PROCESSES: &str = "Processes";
pub const FILESYSTEM: &str = "Filesystem";
pub const ADMINISTRATIVE: &str = "Administrative";

/// Process entry as reported by a client's `ListProcesses` action
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub ppid: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub exe: String,
    #[serde(default)]
    pub cmdline: Vec<String>,
    #[serde(default)]
    pub username: String,
}

impl Process {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Register every built-in flow type
pub fn register_builtins(registry: &mut FlowRegistry) {
    registry.register::<ListProcesses>();
    registry.register::<GetFile>();
    registry.register::<FileFinder>();
    registry.register::<Interrogate>();
}

/// Process-wide registry of the built-in flows, built on first use
pub fn builtin_registry() -> Arc<FlowRegistry> {
    static REGISTRY: OnceLock<Arc<FlowRegistry>> = OnceLock::new();
    REGISTRY
        .get_or_init(|| {
            let mut registry = FlowRegistry::new();
            register_builtins(&mut registry);
            Arc::new(registry)
        })
        .clone()
}
