//! The boundary to the real-time client transport.

use crate::observers::DeliveryError;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// Hands a method invocation to one locally connected client.
#[async_trait]
pub trait ClientTransport: Send + Sync {
    async fn deliver(
        &self,
        connection_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<(), DeliveryError>;
}

/// One invocation handed to a [`ChannelTransport`].
#[derive(Clone, Debug, PartialEq)]
pub struct TransportMessage {
    pub connection_id: String,
    pub method: String,
    pub args: Vec<Value>,
}

/// Transport that pushes every invocation into an unbounded channel.
///
/// Useful for embedding the backplane behind a custom socket layer and in
/// tests.
#[derive(Clone)]
pub struct ChannelTransport {
    sender: mpsc::UnboundedSender<TransportMessage>,
}

impl ChannelTransport {
    /// Create a transport and the receiver of everything it is handed.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl ClientTransport for ChannelTransport {
    async fn deliver(
        &self,
        connection_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<(), DeliveryError> {
        self.sender
            .send(TransportMessage {
                connection_id: connection_id.to_string(),
                method: method.to_string(),
                args,
            })
            .map_err(|_| DeliveryError::Closed)
    }
}
