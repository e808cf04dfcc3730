//! Per-topic observer registry.

use crate::types::{SubscriptionId, TopicKey};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::types::{DeliveryError, MessageObserver};

/// A registered observer and when it was last renewed.
struct Entry {
    observer: Arc<dyn MessageObserver>,
    last_renewed: Instant,
}

/// Result of one notify pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NotifyOutcome {
    /// Observers that accepted the message.
    pub delivered: usize,
    /// Observers dropped because they were not renewed in time.
    pub expired: usize,
    /// Observers dropped because delivery failed.
    pub failed: usize,
}

impl NotifyOutcome {
    pub fn removed(&self) -> usize {
        self.expired + self.failed
    }
}

/// Tracks the live observers of one topic.
///
/// Expiry is lazy: stale observers are only dropped when a notify pass (or
/// [`ObserverRegistry::clear_expired`]) runs into them.
pub struct ObserverRegistry {
    topic: TopicKey,
    observers: HashMap<SubscriptionId, Entry>,
    expiration: Duration,
}

impl ObserverRegistry {
    pub fn new(topic: TopicKey, expiration: Duration) -> Self {
        Self {
            topic,
            observers: HashMap::new(),
            expiration,
        }
    }

    /// Add or replace an observer, renewing it. Returns true if it was new.
    pub fn subscribe(&mut self, id: SubscriptionId, observer: Arc<dyn MessageObserver>) -> bool {
        self.observers
            .insert(
                id,
                Entry {
                    observer,
                    last_renewed: Instant::now(),
                },
            )
            .is_none()
    }

    /// Keep-alive for an existing observer. Returns false if it is unknown
    /// or has already expired.
    pub fn renew(&mut self, id: SubscriptionId) -> bool {
        let now = Instant::now();
        let expiration = self.expiration;
        match self.observers.get_mut(&id) {
            Some(entry) if !is_expired(entry, now, expiration) => {
                entry.last_renewed = now;
                true
            }
            _ => false,
        }
    }

    /// Remove an observer. Unknown ids are ignored.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.observers.remove(&id).is_some()
    }

    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.observers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Notify every live observer.
    pub fn notify<D>(&mut self, deliver: D) -> NotifyOutcome
    where
        D: FnMut(&dyn MessageObserver) -> Result<(), DeliveryError>,
    {
        self.notify_matching(deliver, |_, _| true)
    }

    /// Notify every live observer accepted by `filter`.
    ///
    /// Expired observers are dropped without being called; observers whose
    /// delivery fails are dropped too. Every dropped observer then gets a
    /// best-effort ended signal. Never fails.
    pub fn notify_matching<D, F>(&mut self, mut deliver: D, filter: F) -> NotifyOutcome
    where
        D: FnMut(&dyn MessageObserver) -> Result<(), DeliveryError>,
        F: Fn(SubscriptionId, &dyn MessageObserver) -> bool,
    {
        let now = Instant::now();
        let mut outcome = NotifyOutcome::default();
        let mut defunct = Vec::new();

        for (id, entry) in &self.observers {
            if is_expired(entry, now, self.expiration) {
                outcome.expired += 1;
                defunct.push(*id);
                continue;
            }

            if !filter(*id, entry.observer.as_ref()) {
                continue;
            }

            match guarded(|| deliver(entry.observer.as_ref())) {
                Ok(()) => outcome.delivered += 1,
                Err(e) => {
                    debug!(topic = %self.topic, subscription = ?id, error = %e, "delivery failed, evicting observer");
                    outcome.failed += 1;
                    defunct.push(*id);
                }
            }
        }

        self.remove_and_signal(defunct);
        outcome
    }

    /// Deliver to a single observer (used for replay). A failure evicts it.
    pub fn deliver_to<D>(&mut self, id: SubscriptionId, deliver: D) -> Result<(), DeliveryError>
    where
        D: FnOnce(&dyn MessageObserver) -> Result<(), DeliveryError>,
    {
        let Some(entry) = self.observers.get(&id) else {
            return Err(DeliveryError::Closed);
        };

        let result = guarded(|| deliver(entry.observer.as_ref()));
        if let Err(ref e) = result {
            debug!(topic = %self.topic, subscription = ?id, error = %e, "replay delivery failed, evicting observer");
            self.remove_and_signal(vec![id]);
        }
        result
    }

    /// Drop every expired observer. Returns how many were dropped.
    pub fn clear_expired(&mut self) -> usize {
        let now = Instant::now();
        let expired: Vec<_> = self
            .observers
            .iter()
            .filter(|(_, entry)| is_expired(entry, now, self.expiration))
            .map(|(id, _)| *id)
            .collect();
        let count = expired.len();
        self.remove_and_signal(expired);
        count
    }

    /// Drop every observer, signalling each that its subscription ended.
    pub fn end_all(&mut self) -> usize {
        let all: Vec<_> = self.observers.keys().copied().collect();
        let count = all.len();
        self.remove_and_signal(all);
        count
    }

    /// Remove the given observers, then tell each one. Signal failures are
    /// swallowed: a broken observer must not hold up cleanup.
    fn remove_and_signal(&mut self, ids: Vec<SubscriptionId>) {
        for id in ids {
            let Some(entry) = self.observers.remove(&id) else {
                continue;
            };
            let topic = &self.topic;
            if let Err(e) = guarded(|| entry.observer.on_subscription_ended(topic)) {
                debug!(topic = %topic, subscription = ?id, error = %e, "subscription ended signal failed");
            }
        }
    }
}

fn is_expired(entry: &Entry, now: Instant, expiration: Duration) -> bool {
    now.saturating_duration_since(entry.last_renewed) > expiration
}

/// Run an observer call, turning a panic into a delivery error.
fn guarded<F>(f: F) -> Result<(), DeliveryError>
where
    F: FnOnce() -> Result<(), DeliveryError>,
{
    catch_unwind(AssertUnwindSafe(f)).unwrap_or(Err(DeliveryError::Panicked))
}
