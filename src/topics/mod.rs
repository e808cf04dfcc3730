//! Topic actors and their supervisor.
//!
//! Every topic key is served by one actor task owning the topic's rewind
//! log, its observer registry and (for group and user keys) its membership
//! set. All calls on a key are serialized through the actor's mailbox; calls
//! on different keys run in parallel.

mod actor;
mod supervisor;

pub use supervisor::TopicSupervisor;

use crate::observers::MessageObserver;
use crate::types::{Generation, MessageHandle, SubscriptionId, TopicKey};
use std::fmt;
use std::sync::Arc;

/// Result of accepting a message on a topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Accepted {
    /// Handle assigned to the message in the topic's log.
    pub handle: MessageHandle,
    /// Observers the message was delivered to.
    pub delivered: usize,
    /// Member connections (raw ids) the message must be forwarded to.
    /// Always empty for the all-stream and connection topics.
    pub forward_to: Vec<String>,
}

/// A request to observe a topic.
#[derive(Clone)]
pub struct SubscribeRequest {
    pub id: SubscriptionId,
    pub observer: Arc<dyn MessageObserver>,
    /// Replay everything after this handle. The zero handle replays nothing.
    pub since: MessageHandle,
}

impl SubscribeRequest {
    /// Subscribe with a fresh id and no replay.
    pub fn new(observer: Arc<dyn MessageObserver>) -> Self {
        Self {
            id: SubscriptionId::new(),
            observer,
            since: MessageHandle::ZERO,
        }
    }

    pub fn with_id(mut self, id: SubscriptionId) -> Self {
        self.id = id;
        self
    }

    pub fn since(mut self, handle: MessageHandle) -> Self {
        self.since = handle;
        self
    }
}

impl fmt::Debug for SubscribeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeRequest")
            .field("id", &self.id)
            .field("since", &self.since)
            .finish_non_exhaustive()
    }
}

/// An established subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subscription {
    pub id: SubscriptionId,
    /// Generation of the topic log at subscribe time.
    pub generation: Generation,
    /// Newest handle in the log at subscribe time (zero if the log is empty).
    pub last_handle: MessageHandle,
    /// Messages replayed to the observer before it went live.
    pub replayed: usize,
}

/// Point-in-time view of one topic actor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicStats {
    pub key: TopicKey,
    pub generation: Generation,
    pub last_handle: MessageHandle,
    /// Messages currently retained for replay.
    pub retained: usize,
    pub observers: usize,
    /// Membership size (0 for keys without membership).
    pub members: usize,
}
