//! Flow execution engine
//!
//! - [`FlowRegistry`] maps flow type names to factories
//! - [`FlowRunner`] drives flow instances from start to a terminal state
//! - [`FlowLifecycle`] is the API surface for creating, stopping and
//!   inspecting flows

mod lifecycle;
mod registry;
mod runner;

pub use lifecycle::{FlowLifecycle, ListPage, Principal, ResultFilter};
pub use registry::{AnyFlow, CreatedFlow, FlowFactory, FlowRegistry, FlowRestorer, RegistryError};
pub use runner::{EngineError, FlowRunner, RunnerConfig};
