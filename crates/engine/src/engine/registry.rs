//! Flow registry for type-erased flow creation
//!
//! The registry maps flow type names to factories that build flow instances
//! from JSON arguments, and to restorers that rebuild a flow from its saved
//! continuation state.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use crate::flow::{ClientResponse, Flow, FlowAction, FlowDescriptor, FlowError};

/// Type-erased flow interface
///
/// Lets the runner drive flows without knowing their concrete types.
pub trait AnyFlow: Send + Sync {
    /// Flow type name
    fn flow_type(&self) -> &'static str;

    fn on_start(&mut self) -> Result<Vec<FlowAction>, FlowError>;

    fn on_response(
        &mut self,
        state: &str,
        response: ClientResponse,
    ) -> Result<Vec<FlowAction>, FlowError>;

    fn on_complete(&mut self) -> Result<Vec<FlowAction>, FlowError>;

    /// Serialize the continuation state
    fn save_state(&self) -> Result<Value, serde_json::Error>;
}

/// Wrapper to implement AnyFlow for any Flow
struct FlowWrapper<F: Flow> {
    inner: F,
}

impl<F: Flow> AnyFlow for FlowWrapper<F> {
    fn flow_type(&self) -> &'static str {
        F::NAME
    }

    fn on_start(&mut self) -> Result<Vec<FlowAction>, FlowError> {
        self.inner.on_start()
    }

    fn on_response(
        &mut self,
        state: &str,
        response: ClientResponse,
    ) -> Result<Vec<FlowAction>, FlowError> {
        self.inner.on_response(state, response)
    }

    fn on_complete(&mut self) -> Result<Vec<FlowAction>, FlowError> {
        self.inner.on_complete()
    }

    fn save_state(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(&self.inner)
    }
}

/// A freshly created flow together with its normalized arguments
pub struct CreatedFlow {
    pub flow: Box<dyn AnyFlow>,

    /// Arguments after defaults were filled in
    pub args: Value,
}

impl fmt::Debug for CreatedFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreatedFlow")
            .field("flow_type", &self.flow.flow_type())
            .field("args", &self.args)
            .finish()
    }
}

/// Factory building a flow from JSON arguments
pub type FlowFactory = Box<dyn Fn(Value) -> Result<CreatedFlow, RegistryError> + Send + Sync>;

/// Restorer rebuilding a flow from saved state
pub type FlowRestorer =
    Box<dyn Fn(Value) -> Result<Box<dyn AnyFlow>, serde_json::Error> + Send + Sync>;

struct RegisteredFlow {
    factory: FlowFactory,
    restorer: FlowRestorer,
    descriptor: FlowDescriptor,
}

/// Registry of flow types
pub struct FlowRegistry {
    flows: BTreeMap<String, RegisteredFlow>,
}

impl Default for FlowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            flows: BTreeMap::new(),
        }
    }

    /// Register a flow type
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut registry = FlowRegistry::new();
    /// registry.register::<ListProcesses>();
    /// ```
    pub fn register<F: Flow>(&mut self) {
        let factory: FlowFactory = Box::new(|args: Value| {
            let typed: F::Args = if args.is_null() {
                F::Args::default()
            } else {
                serde_json::from_value(args).map_err(|e| RegistryError::InvalidArgs {
                    flow_type: F::NAME.to_string(),
                    reason: e.to_string(),
                })?
            };

            F::validate_args(&typed).map_err(|reason| RegistryError::InvalidArgs {
                flow_type: F::NAME.to_string(),
                reason,
            })?;

            let args = serde_json::to_value(&typed).map_err(RegistryError::Deserialization)?;
            let flow = Box::new(FlowWrapper {
                inner: F::new(typed),
            }) as Box<dyn AnyFlow>;
            Ok(CreatedFlow { flow, args })
        });

        let restorer: FlowRestorer = Box::new(|state: Value| {
            let inner: F = serde_json::from_value(state)?;
            Ok(Box::new(FlowWrapper { inner }) as Box<dyn AnyFlow>)
        });

        let descriptor = FlowDescriptor {
            name: F::NAME.to_string(),
            category: F::CATEGORY.to_string(),
            doc: F::DOC.to_string(),
            args_schema: serde_json::to_value(schemars::schema_for!(F::Args)).unwrap_or_default(),
            default_args: serde_json::to_value(F::Args::default()).unwrap_or_default(),
        };

        self.flows.insert(
            F::NAME.to_string(),
            RegisteredFlow {
                factory,
                restorer,
                descriptor,
            },
        );
    }

    /// Check if a flow type is registered
    pub fn contains(&self, flow_type: &str) -> bool {
        self.flows.contains_key(flow_type)
    }

    fn get(&self, flow_type: &str) -> Result<&RegisteredFlow, RegistryError> {
        self.flows
            .get(flow_type)
            .ok_or_else(|| RegistryError::UnknownFlowType(flow_type.to_string()))
    }

    /// Create a flow instance from type name and JSON arguments
    ///
    /// `Value::Null` arguments mean "use the defaults".
    pub fn create(&self, flow_type: &str, args: Value) -> Result<CreatedFlow, RegistryError> {
        (self.get(flow_type)?.factory)(args)
    }

    /// Rebuild a flow from its saved continuation state
    pub fn restore(&self, flow_type: &str, state: Value) -> Result<Box<dyn AnyFlow>, RegistryError> {
        (self.get(flow_type)?.restorer)(state).map_err(RegistryError::Deserialization)
    }

    pub fn descriptor(&self, flow_type: &str) -> Option<&FlowDescriptor> {
        self.flows.get(flow_type).map(|f| &f.descriptor)
    }

    /// Descriptors of all registered flows, sorted by name
    pub fn descriptors(&self) -> Vec<FlowDescriptor> {
        self.flows.values().map(|f| f.descriptor.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// All registered flow type names
    pub fn flow_types(&self) -> impl Iterator<Item = &str> {
        self.flows.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for FlowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowRegistry")
            .field("flow_types", &self.flows.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Flow type not registered
    #[error("unknown flow type: {0}")]
    UnknownFlowType(String),

    /// Arguments rejected by deserialization or the flow's own validation
    #[error("invalid arguments for {flow_type}: {reason}")]
    InvalidArgs { flow_type: String, reason: String },

    /// Saved state could not be (de)serialized
    #[error("failed to deserialize flow state: {0}")]
    Deserialization(#[source] serde_json::Error),
}
