//! Persistence layer for flow state
//!
//! This module provides:
//! - [`FlowStore`] trait for flow, request, result, log and plugin persistence
//! - [`InMemoryFlowStore`] for tests and embedding

mod memory;
mod store;

pub use memory::InMemoryFlowStore;
pub use store::{FlowFilter, FlowStore, Pagination, StoreError};
