//! Hub-facing surface: sending, group management and connection lifetime.
//!
//! A hub is a named set of clients sharing an all-stream. [`HubContext`]
//! publishes to it from anywhere; [`HubLifetimeManager`] is the per-process
//! piece that owns local connections and delivers to them through a
//! [`ClientTransport`].

mod context;
mod lifetime;
mod transport;

pub use context::HubContext;
pub use lifetime::{ConnectionInfo, HubLifetimeManager};
pub use transport::{ChannelTransport, ClientTransport, TransportMessage};
