//! Observer types: what a topic hands to its subscribers.

use crate::types::{Envelope, MessageHandle, TopicKey};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// One message delivered to an observer.
#[derive(Clone, Debug)]
pub struct Delivery {
    /// Topic the message was published on.
    pub topic: TopicKey,
    pub envelope: Arc<Envelope>,
    /// Handle to resume from after this message.
    pub handle: MessageHandle,
}

/// Why a delivery to one observer failed. The observer is evicted.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The receiving side is gone.
    #[error("observer channel closed")]
    Closed,
    /// The receiving side is not keeping up.
    #[error("observer buffer full")]
    Lagged,
    /// The observer panicked while handling the call.
    #[error("observer panicked")]
    Panicked,
    #[error("transport error: {0}")]
    Transport(String),
}

/// A live subscriber of a topic.
///
/// Both calls are made from inside the topic actor and must not block: push
/// into a queue and return. An error evicts the observer.
pub trait MessageObserver: Send + Sync {
    /// A message was published (or replayed) on the topic.
    fn on_message(&self, delivery: &Delivery) -> Result<(), DeliveryError>;

    /// The subscription was ended by the topic (eviction, expiry, or the
    /// topic actor going away). Failures are ignored.
    fn on_subscription_ended(&self, topic: &TopicKey) -> Result<(), DeliveryError>;
}

/// Events read from an [`ObserverReceiver`].
#[derive(Clone, Debug)]
pub enum ObserverEvent {
    Message(Delivery),
    SubscriptionEnded { topic: TopicKey },
}

/// Observer that pushes into a bounded channel.
///
/// A full buffer counts as a failed delivery, so a slow consumer is evicted
/// rather than stalling the topic. The ended signal travels on its own
/// unbounded lane so it still arrives when the message buffer is full.
#[derive(Clone)]
pub struct ChannelObserver {
    messages: mpsc::Sender<Delivery>,
    ended: mpsc::UnboundedSender<TopicKey>,
}

impl ChannelObserver {
    /// Create an observer and the receiver that drains it.
    pub fn channel(buffer: usize) -> (Self, ObserverReceiver) {
        let (messages, message_rx) = mpsc::channel(buffer.max(1));
        let (ended, ended_rx) = mpsc::unbounded_channel();
        (
            Self { messages, ended },
            ObserverReceiver {
                messages: message_rx,
                ended: ended_rx,
            },
        )
    }
}

impl MessageObserver for ChannelObserver {
    fn on_message(&self, delivery: &Delivery) -> Result<(), DeliveryError> {
        match self.messages.try_send(delivery.clone()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(DeliveryError::Lagged),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }

    fn on_subscription_ended(&self, topic: &TopicKey) -> Result<(), DeliveryError> {
        self.ended
            .send(topic.clone())
            .map_err(|_| DeliveryError::Closed)
    }
}

/// Receiving half of a [`ChannelObserver`].
pub struct ObserverReceiver {
    messages: mpsc::Receiver<Delivery>,
    ended: mpsc::UnboundedReceiver<TopicKey>,
}

impl ObserverReceiver {
    /// Next event. Buffered messages are drained before an ended signal.
    /// Returns `None` once every observer clone is dropped.
    pub async fn recv(&mut self) -> Option<ObserverEvent> {
        tokio::select! {
            biased;
            Some(delivery) = self.messages.recv() => Some(ObserverEvent::Message(delivery)),
            Some(topic) = self.ended.recv() => Some(ObserverEvent::SubscriptionEnded { topic }),
            else => None,
        }
    }

    /// Next event if one is ready.
    pub fn try_recv(&mut self) -> Option<ObserverEvent> {
        if let Ok(delivery) = self.messages.try_recv() {
            return Some(ObserverEvent::Message(delivery));
        }
        self.ended
            .try_recv()
            .ok()
            .map(|topic| ObserverEvent::SubscriptionEnded { topic })
    }
}

/// Observer built from two closures.
pub struct CallbackObserver<M, E> {
    on_message: M,
    on_ended: E,
}

impl<M, E> CallbackObserver<M, E>
where
    M: Fn(&Delivery) -> Result<(), DeliveryError> + Send + Sync,
    E: Fn(&TopicKey) + Send + Sync,
{
    pub fn new(on_message: M, on_ended: E) -> Self {
        Self {
            on_message,
            on_ended,
        }
    }
}

impl<M, E> MessageObserver for CallbackObserver<M, E>
where
    M: Fn(&Delivery) -> Result<(), DeliveryError> + Send + Sync,
    E: Fn(&TopicKey) + Send + Sync,
{
    fn on_message(&self, delivery: &Delivery) -> Result<(), DeliveryError> {
        (self.on_message)(delivery)
    }

    fn on_subscription_ended(&self, topic: &TopicKey) -> Result<(), DeliveryError> {
        (self.on_ended)(topic);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Generation, MethodInvocation};

    fn delivery(seq: u64) -> Delivery {
        Delivery {
            topic: TopicKey::all("chat"),
            envelope: Arc::new(Envelope::new(MethodInvocation::new("ping", vec![]))),
            handle: MessageHandle::new(seq, Generation::new()),
        }
    }

    #[tokio::test]
    async fn test_channel_observer_full_is_lagged() {
        let (observer, mut rx) = ChannelObserver::channel(1);

        assert!(observer.on_message(&delivery(1)).is_ok());
        assert_eq!(observer.on_message(&delivery(2)), Err(DeliveryError::Lagged));

        match rx.recv().await {
            Some(ObserverEvent::Message(d)) => assert_eq!(d.handle.sequence, 1),
            other => panic!("Expected message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ended_arrives_after_buffered_messages() {
        let (observer, mut rx) = ChannelObserver::channel(4);
        observer.on_message(&delivery(1)).unwrap();
        observer
            .on_subscription_ended(&TopicKey::all("chat"))
            .unwrap();

        assert!(matches!(rx.recv().await, Some(ObserverEvent::Message(_))));
        assert!(matches!(
            rx.recv().await,
            Some(ObserverEvent::SubscriptionEnded { .. })
        ));
    }

    #[tokio::test]
    async fn test_closed_receiver() {
        let (observer, rx) = ChannelObserver::channel(4);
        drop(rx);

        assert_eq!(observer.on_message(&delivery(1)), Err(DeliveryError::Closed));
        assert!(observer
            .on_subscription_ended(&TopicKey::all("chat"))
            .is_err());
    }

    #[tokio::test]
    async fn test_recv_none_when_observer_dropped() {
        let (observer, mut rx) = ChannelObserver::channel(4);
        drop(observer);
        assert!(rx.recv().await.is_none());
    }
}
