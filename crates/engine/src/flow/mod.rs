//! Flow abstractions and types
//!
//! This module contains the core flow primitives:
//! - [`Flow`] trait for defining flow state machines
//! - [`FlowAction`] enum for flow commands
//! - [`ClientResponse`] for answers coming back from clients
//! - Identifiers ([`ClientId`], [`FlowId`], [`FlowKey`]) and persisted records

mod action;
mod definition;
mod ids;
mod record;

pub use action::{ClientResponse, FlowAction, ResponseStatus};
pub use definition::{Flow, FlowDescriptor, FlowError};
pub use ids::{ClientId, FlowId, FlowKey, IdError, RequestId};
pub use record::{
    ClientRecord, FlowLogEntry, FlowRecord, FlowRequest, FlowResult, FlowStatus,
    InvalidTransition, ParentLink, RequestState, RequestTarget, RunnerArgs, UserNotification,
};
