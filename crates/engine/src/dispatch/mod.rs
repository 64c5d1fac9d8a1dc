//! Client action dispatch
//!
//! - [`ClientActionDispatcher`] - per-client FIFO delivery with retries
//! - [`ClientTransport`] - outbound channel to clients
//! - [`ChannelTransport`] - in-process transport backed by tokio channels

mod dispatcher;
mod transport;

pub use dispatcher::{ClientActionDispatcher, DispatchError, DispatcherConfig, ResponseHandler};
pub use transport::{ChannelTransport, ClientMessage, ClientTransport, TransportError};
