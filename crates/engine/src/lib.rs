//! # Fleet Flow Engine
//!
//! Flow execution and tasking engine for a fleet of remote agents (clients).
//!
//! A flow is a long-running, multi-step unit of work executed against one
//! client. The engine starts flows, sends their requests to clients,
//! advances them as responses arrive, stores their results and logs, and
//! feeds the results through output plugins.
//!
//! ## Features
//!
//! - **Resumable flows**: flow state is serialized after every transition,
//!   so any response can be processed by restoring it from the store
//! - **Per-flow serialization**: transitions of one flow never race, while
//!   different flows run fully in parallel
//! - **At-least-once dispatch**: per-client FIFO queues with exponential
//!   backoff and jitter; exhausted retries become failure responses
//! - **Isolated output plugins**: a failing or panicking plugin records an
//!   error without affecting other plugins or the flow
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      FlowLifecycle                           │
//! │  (create / cancel / terminate, listings, descriptors)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       FlowRunner                             │
//! │  (restores flows, runs state handlers, persists effects)    │
//! └─────────────────────────────────────────────────────────────┘
//!          │                   │                     │
//!          ▼                   ▼                     ▼
//! ┌─────────────────┐ ┌─────────────────┐ ┌─────────────────────┐
//! │   FlowStore     │ │ ClientAction    │ │  OutputPipeline     │
//! │ (records, logs, │ │ Dispatcher      │ │ (plugins applied    │
//! │  results)       │ │ (per-client     │ │  in the background) │
//! │                 │ │  FIFO, retries) │ │                     │
//! └─────────────────┘ └─────────────────┘ └─────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use fleetflow_engine::prelude::*;
//!
//! let store = Arc::new(InMemoryFlowStore::new());
//! store.write_client(ClientRecord::new(client_id.clone())).await?;
//!
//! let transport = Arc::new(ChannelTransport::new());
//! let inbox = transport.connect(client_id.clone());
//!
//! let lifecycle = FlowLifecycle::build(store, transport, &EngineConfig::from_env()?);
//! let flow = lifecycle
//!     .create_flow(&Principal::new("alice"), client_id.as_str(), "ListProcesses", json!({}), RunnerArgs::default())
//!     .await?;
//! ```

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod flow;
pub mod flows;
pub mod output;
pub mod persistence;
pub mod reliability;
pub mod telemetry;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::dispatch::{
        ChannelTransport, ClientActionDispatcher, ClientMessage, ClientTransport,
        DispatcherConfig,
    };
    pub use crate::engine::{
        EngineError, FlowLifecycle, FlowRegistry, FlowRunner, ListPage, Principal, ResultFilter,
        RunnerConfig,
    };
    pub use crate::flow::{
        ClientId, ClientRecord, ClientResponse, Flow, FlowAction, FlowError, FlowId, FlowKey,
        FlowRecord, FlowStatus, RunnerArgs,
    };
    pub use crate::output::{OutputPlugin, OutputPluginDescriptor, OutputPluginRegistry};
    pub use crate::persistence::{FlowFilter, FlowStore, InMemoryFlowStore, Pagination};
    pub use crate::reliability::RetryPolicy;
}

// Re-export key types at crate root
pub use config::{ConfigError, EngineConfig};
pub use dispatch::{
    ChannelTransport, ClientActionDispatcher, ClientMessage, ClientTransport, DispatchError,
    DispatcherConfig, TransportError,
};
pub use engine::{
    EngineError, FlowLifecycle, FlowRegistry, FlowRunner, ListPage, Principal, RegistryError,
    ResultFilter, RunnerConfig,
};
pub use flow::{
    ClientId, ClientRecord, ClientResponse, Flow, FlowAction, FlowError, FlowId, FlowKey,
    FlowRecord, FlowStatus, RequestState, RunnerArgs,
};
pub use flows::builtin_registry;
pub use output::{OutputPluginDescriptor, OutputPluginRegistry, PluginError};
pub use persistence::{FlowFilter, FlowStore, InMemoryFlowStore, Pagination, StoreError};
pub use reliability::RetryPolicy;
