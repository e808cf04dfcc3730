//! Lazy activation and idle eviction of topic actors.

use super::actor::{Command, TopicActor};
use super::{Accepted, SubscribeRequest, Subscription, TopicStats};
use crate::config::BackplaneConfig;
use crate::error::{BackplaneError, Result};
use crate::membership::MembershipStore;
use crate::types::{validate_connection_id, Envelope, SubscriptionId, TopicKey};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How many times a call is re-sent after its actor stopped underneath it.
const MAX_CALL_ATTEMPTS: usize = 3;

struct TopicHandle {
    sender: mpsc::Sender<Command>,
    /// Cancelled once the actor task has returned.
    stopped: CancellationToken,
    last_activity: Instant,
}

/// Owns every active topic actor of a process.
///
/// Actors are started on the first call for their key and deactivated after
/// `idle_timeout` without calls. A call that races with a deactivation is
/// re-sent to a fresh actor; since the stopped actor never ran it, nothing
/// happens twice. An actor started while its predecessor is still stopping
/// waits for it before loading membership.
pub struct TopicSupervisor {
    config: Arc<BackplaneConfig>,
    store: Arc<dyn MembershipStore>,
    topics: Mutex<HashMap<TopicKey, TopicHandle>>,
    /// Stop tokens of actors taken out of `topics` that may still be
    /// flushing. Lock order: `topics`, then `draining`.
    draining: Mutex<HashMap<TopicKey, CancellationToken>>,
    shutdown: CancellationToken,
}

impl TopicSupervisor {
    /// Create a supervisor and start its idle sweep.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: Arc<BackplaneConfig>, store: Arc<dyn MembershipStore>) -> Arc<Self> {
        let supervisor = Arc::new(Self {
            config,
            store,
            topics: Mutex::new(HashMap::new()),
            draining: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(Self::sweep_idle(
            Arc::downgrade(&supervisor),
            supervisor.config.idle_check_interval,
            supervisor.shutdown.clone(),
        ));
        supervisor
    }

    pub fn config(&self) -> &BackplaneConfig {
        &self.config
    }

    // --- Topic operations ---

    /// Append a message to a topic and notify its observers.
    pub async fn accept_message(
        &self,
        key: &TopicKey,
        envelope: Envelope,
        cancel: &CancellationToken,
    ) -> Result<Accepted> {
        self.validate(key)?;
        let envelope = Arc::new(envelope);
        self.call(key, cancel, |reply| Command::Accept {
            envelope: envelope.clone(),
            reply,
        })
        .await
    }

    /// Register an observer, replaying everything after `request.since` to it
    /// first.
    ///
    /// Fails with [`BackplaneError::ReplayOutOfRange`] when the log can no
    /// longer satisfy the replay; the observer is not registered then.
    pub async fn subscribe(
        &self,
        key: &TopicKey,
        request: SubscribeRequest,
        cancel: &CancellationToken,
    ) -> Result<Subscription> {
        self.validate(key)?;
        self.call(key, cancel, |reply| Command::Subscribe {
            request: request.clone(),
            reply,
        })
        .await
    }

    /// Remove an observer. Returns false if it was not registered.
    pub async fn unsubscribe(
        &self,
        key: &TopicKey,
        id: SubscriptionId,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.validate(key)?;
        self.call(key, cancel, |reply| Command::Unsubscribe { id, reply })
            .await
    }

    /// Keep an observer alive. Returns false if it is no longer registered.
    pub async fn renew(
        &self,
        key: &TopicKey,
        id: SubscriptionId,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.validate(key)?;
        self.call(key, cancel, |reply| Command::Renew { id, reply })
            .await
    }

    /// Add a connection (raw id) to a group or user topic.
    pub async fn add_member(
        &self,
        key: &TopicKey,
        connection_id: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.validate_membership(key, connection_id)?;
        self.call(key, cancel, |reply| Command::AddMember {
            connection: connection_id.to_string(),
            reply,
        })
        .await
    }

    /// Remove a connection (raw id) from a group or user topic.
    pub async fn remove_member(
        &self,
        key: &TopicKey,
        connection_id: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.validate_membership(key, connection_id)?;
        self.call(key, cancel, |reply| Command::RemoveMember {
            connection: connection_id.to_string(),
            reply,
        })
        .await
    }

    /// Hub-scoped member ids of a group or user topic.
    pub async fn members(&self, key: &TopicKey) -> Result<BTreeSet<String>> {
        self.validate(key)?;
        if !key.has_membership() {
            return Err(BackplaneError::InvalidOperation(format!(
                "{key} has no membership"
            )));
        }
        self.call(key, &CancellationToken::new(), |reply| Command::Members {
            reply,
        })
        .await
    }

    pub async fn stats(&self, key: &TopicKey) -> Result<TopicStats> {
        self.validate(key)?;
        self.call(key, &CancellationToken::new(), |reply| Command::Stats {
            reply,
        })
        .await
    }

    // --- Lifecycle ---

    /// Number of live topic actors.
    pub fn active_topics(&self) -> usize {
        self.topics.lock().len()
    }

    pub fn is_active(&self, key: &TopicKey) -> bool {
        self.topics.lock().contains_key(key)
    }

    /// Write every dirty membership set. All actors are asked even if some
    /// fail; the first error is returned.
    pub async fn flush_all(&self) -> Result<()> {
        let senders: Vec<_> = self
            .topics
            .lock()
            .values()
            .map(|handle| handle.sender.clone())
            .collect();

        let results = join_all(senders.iter().map(|sender| async move {
            let (reply, rx) = oneshot::channel();
            if sender.send(Command::Flush { reply }).await.is_err() {
                // Stopped actors flushed on their way out.
                return Ok(());
            }
            rx.await.unwrap_or(Ok(()))
        }))
        .await;

        results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
    }

    /// Deactivate one topic actor now. Returns false if it was not active.
    pub async fn deactivate(&self, key: &TopicKey) -> Result<bool> {
        let Some(handle) = self.take(key) else {
            return Ok(false);
        };
        self.retire(key, handle).await?;
        Ok(true)
    }

    /// Deactivate actors that saw no call for `idle_timeout`. Returns how
    /// many were stopped.
    pub async fn deactivate_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let now = Instant::now();
        let idle: Vec<_> = {
            let topics = self.topics.lock();
            topics
                .iter()
                .filter(|(_, handle)| {
                    now.saturating_duration_since(handle.last_activity) >= idle_timeout
                })
                .map(|(key, _)| key.clone())
                .collect()
        };

        let mut count = 0;
        for key in idle {
            let Some(handle) = self.take(&key) else {
                continue;
            };
            count += 1;
            debug!(topic = %key, "deactivating idle topic actor");
            if let Err(e) = self.retire(&key, handle).await {
                warn!(topic = %key, error = %e, "idle deactivation failed");
            }
        }
        count
    }

    /// Refuse new calls, then flush and deactivate every actor.
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        let handles: Vec<_> = {
            let mut topics = self.topics.lock();
            let mut draining = self.draining.lock();
            topics
                .drain()
                .map(|(key, handle)| {
                    draining.insert(key.clone(), handle.stopped.clone());
                    (key, handle)
                })
                .collect()
        };
        debug!(topics = handles.len(), "shutting down topic supervisor");

        let results = join_all(
            handles
                .into_iter()
                .map(|(key, handle)| async move { self.retire(&key, handle).await }),
        )
        .await;

        results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // --- Internals ---

    /// Send a command to the actor for `key`, starting it if needed.
    ///
    /// If the actor stopped before answering, the command never ran and is
    /// sent again to a new actor.
    ///
    /// Cancellation before the command is enqueued leaves the topic
    /// untouched. Once enqueued, the actor still runs the command to
    /// completion; the caller only stops waiting and gets `Cancelled`.
    async fn call<T, F>(&self, key: &TopicKey, cancel: &CancellationToken, make: F) -> Result<T>
    where
        F: Fn(oneshot::Sender<Result<T>>) -> Command,
    {
        for _ in 0..MAX_CALL_ATTEMPTS {
            if self.shutdown.is_cancelled() {
                return Err(BackplaneError::ShuttingDown);
            }
            let sender = self.activate(key);
            let (reply, rx) = oneshot::channel();

            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BackplaneError::Cancelled),
                sent = sender.send(make(reply)) => sent,
            };
            if sent.is_err() {
                self.forget(key, &sender);
                continue;
            }

            let answer = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BackplaneError::Cancelled),
                answer = rx => answer,
            };
            match answer {
                Ok(result) => return result,
                Err(_) => self.forget(key, &sender),
            }
        }
        Err(BackplaneError::ActorStopped(key.clone()))
    }

    /// Mailbox of the live actor for `key`, spawning one if there is none.
    fn activate(&self, key: &TopicKey) -> mpsc::Sender<Command> {
        let now = Instant::now();
        let mut topics = self.topics.lock();
        if let Some(handle) = topics.get_mut(key) {
            if !handle.sender.is_closed() {
                handle.last_activity = now;
                return handle.sender.clone();
            }
        }

        let predecessor = self
            .draining
            .lock()
            .remove(key)
            .filter(|stopped| !stopped.is_cancelled());
        debug!(topic = %key, after_predecessor = predecessor.is_some(), "activating topic actor");
        let (sender, stopped) = TopicActor::spawn(
            key.clone(),
            self.config.clone(),
            self.store.clone(),
            predecessor,
        );
        topics.insert(
            key.clone(),
            TopicHandle {
                sender: sender.clone(),
                stopped,
                last_activity: now,
            },
        );
        sender
    }

    /// Take the actor for `key` out of the map and mark it as draining in
    /// the same critical section, so no activation slips in between.
    fn take(&self, key: &TopicKey) -> Option<TopicHandle> {
        let mut topics = self.topics.lock();
        let handle = topics.remove(key)?;
        self.draining
            .lock()
            .insert(key.clone(), handle.stopped.clone());
        Some(handle)
    }

    /// Stop an actor previously returned by `take` and wait until its task
    /// has returned.
    async fn retire(&self, key: &TopicKey, handle: TopicHandle) -> Result<()> {
        let result = Self::stop(&handle.sender).await;
        handle.stopped.cancelled().await;

        let mut draining = self.draining.lock();
        if draining
            .get(key)
            .is_some_and(CancellationToken::is_cancelled)
        {
            draining.remove(key);
        }
        result
    }

    /// Drop the map entry for `key` if it still points at `sender`.
    fn forget(&self, key: &TopicKey, sender: &mpsc::Sender<Command>) {
        let mut topics = self.topics.lock();
        if topics
            .get(key)
            .is_some_and(|handle| handle.sender.same_channel(sender))
        {
            topics.remove(key);
        }
    }

    async fn stop(sender: &mpsc::Sender<Command>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if sender
            .send(Command::Deactivate { reply: Some(reply) })
            .await
            .is_err()
        {
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    fn validate(&self, key: &TopicKey) -> Result<()> {
        key.validate()?;
        if !self.config.serves_hub(key.hub()) {
            return Err(BackplaneError::UnknownHub(key.hub().to_string()));
        }
        Ok(())
    }

    fn validate_membership(&self, key: &TopicKey, connection_id: &str) -> Result<()> {
        self.validate(key)?;
        validate_connection_id(connection_id)?;
        if !key.has_membership() {
            return Err(BackplaneError::InvalidOperation(format!(
                "{key} has no membership"
            )));
        }
        Ok(())
    }

    async fn sweep_idle(
        supervisor: Weak<Self>,
        period: std::time::Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(supervisor) = supervisor.upgrade() else {
                break;
            };
            supervisor.deactivate_idle().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::{MembershipKey, MemoryMembershipStore};
    use crate::observers::{ChannelObserver, ObserverEvent};
    use crate::types::{MessageHandle, MethodInvocation};
    use std::time::Duration;

    fn supervisor_with(config: BackplaneConfig) -> (Arc<TopicSupervisor>, Arc<MemoryMembershipStore>) {
        let store = Arc::new(MemoryMembershipStore::new());
        (
            TopicSupervisor::start(Arc::new(config), store.clone()),
            store,
        )
    }

    fn supervisor() -> Arc<TopicSupervisor> {
        supervisor_with(BackplaneConfig::default()).0
    }

    fn envelope(method: &str) -> Envelope {
        Envelope::new(MethodInvocation::new(method, vec![]))
    }

    /// Memory store whose writes take a while to land.
    #[derive(Default)]
    struct SlowSaveStore {
        inner: MemoryMembershipStore,
    }

    #[async_trait::async_trait]
    impl MembershipStore for SlowSaveStore {
        async fn load(&self, key: &MembershipKey) -> Result<BTreeSet<String>> {
            self.inner.load(key).await
        }

        async fn save(&self, key: &MembershipKey, members: &BTreeSet<String>) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.inner.save(key, members).await
        }
    }

    #[tokio::test]
    async fn test_lazy_activation() {
        let supervisor = supervisor();
        let key = TopicKey::all("chat");
        let cancel = CancellationToken::new();

        assert!(!supervisor.is_active(&key));
        supervisor
            .accept_message(&key, envelope("a"), &cancel)
            .await
            .unwrap();
        assert!(supervisor.is_active(&key));
        assert_eq!(supervisor.active_topics(), 1);
    }

    #[tokio::test]
    async fn test_deactivation_ends_subscriptions_and_mints_new_generation() {
        let supervisor = supervisor();
        let key = TopicKey::connection("chat", "c1");
        let cancel = CancellationToken::new();

        let (observer, mut rx) = ChannelObserver::channel(8);
        let first = supervisor
            .subscribe(&key, SubscribeRequest::new(Arc::new(observer)), &cancel)
            .await
            .unwrap();

        assert!(supervisor.deactivate(&key).await.unwrap());
        assert!(!supervisor.deactivate(&key).await.unwrap());
        assert!(matches!(
            rx.recv().await,
            Some(ObserverEvent::SubscriptionEnded { .. })
        ));

        let stats = supervisor.stats(&key).await.unwrap();
        assert_ne!(stats.generation, first.generation);
        assert_eq!(stats.observers, 0);
        assert_eq!(stats.last_handle, MessageHandle::ZERO);
    }

    #[tokio::test]
    async fn test_membership_survives_deactivation() {
        let supervisor = supervisor();
        let key = TopicKey::group("chat", "g");
        let cancel = CancellationToken::new();

        assert!(supervisor.add_member(&key, "c1", &cancel).await.unwrap());
        assert!(!supervisor.add_member(&key, "c1", &cancel).await.unwrap());
        supervisor.deactivate(&key).await.unwrap();

        let members = supervisor.members(&key).await.unwrap();
        assert_eq!(members, BTreeSet::from(["chat::c1".to_string()]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reactivation_waits_for_flush_of_previous_actor() {
        let supervisor = TopicSupervisor::start(
            Arc::new(BackplaneConfig::default()),
            Arc::new(SlowSaveStore::default()),
        );
        let key = TopicKey::group("chat", "lobby");
        let cancel = CancellationToken::new();

        supervisor.add_member(&key, "conn-1", &cancel).await.unwrap();

        let deactivating = tokio::spawn({
            let supervisor = supervisor.clone();
            let key = key.clone();
            async move { supervisor.deactivate(&key).await }
        });
        // The old actor is now in the middle of its slow save.
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!supervisor.is_active(&key));

        let members = supervisor.members(&key).await.unwrap();
        assert_eq!(members, BTreeSet::from(["chat::conn-1".to_string()]));
        assert!(deactivating.await.unwrap().unwrap());

        // The new actor must not write a stale set back.
        supervisor.add_member(&key, "conn-2", &cancel).await.unwrap();
        supervisor.deactivate(&key).await.unwrap();
        let members = supervisor.members(&key).await.unwrap();
        assert_eq!(members.len(), 2);
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let (supervisor, _) = supervisor_with(BackplaneConfig {
            hubs: vec!["chat".into()],
            ..Default::default()
        });
        let cancel = CancellationToken::new();

        let err = supervisor
            .accept_message(&TopicKey::all("game"), envelope("a"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BackplaneError::UnknownHub(_)));

        let err = supervisor
            .accept_message(&TopicKey::group("chat", ""), envelope("a"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BackplaneError::InvalidTopicKey(_)));

        let err = supervisor
            .add_member(&TopicKey::all("chat"), "c1", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BackplaneError::InvalidOperation(_)));

        let err = supervisor
            .add_member(&TopicKey::group("chat", "g"), "", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BackplaneError::InvalidConnectionId(_)));

        assert_eq!(supervisor.active_topics(), 0);
    }

    #[tokio::test]
    async fn test_call_cancelled_before_send_has_no_effect() {
        let supervisor = supervisor();
        let key = TopicKey::all("chat");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = supervisor
            .accept_message(&key, envelope("a"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BackplaneError::Cancelled));

        let stats = supervisor.stats(&key).await.unwrap();
        assert_eq!(stats.last_handle, MessageHandle::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_cancelled_after_send_still_completes() {
        let supervisor = TopicSupervisor::start(
            Arc::new(BackplaneConfig::default()),
            Arc::new(SlowSaveStore::default()),
        );
        let key = TopicKey::group("chat", "lobby");
        supervisor
            .add_member(&key, "c1", &CancellationToken::new())
            .await
            .unwrap();

        // Keep the actor busy in a slow save so the next command queues.
        let flushing = tokio::spawn({
            let supervisor = supervisor.clone();
            async move { supervisor.flush_all().await }
        });
        tokio::time::sleep(Duration::from_millis(1)).await;

        let cancel = CancellationToken::new();
        let adding = tokio::spawn({
            let supervisor = supervisor.clone();
            let key = key.clone();
            let cancel = cancel.clone();
            async move { supervisor.add_member(&key, "c2", &cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        cancel.cancel();

        let err = adding.await.unwrap().unwrap_err();
        assert!(matches!(err, BackplaneError::Cancelled));
        flushing.await.unwrap().unwrap();

        let members = supervisor.members(&key).await.unwrap();
        assert!(members.contains("chat::c2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_actor_is_deactivated() {
        let (supervisor, store) = supervisor_with(BackplaneConfig {
            idle_timeout: Duration::from_secs(120),
            idle_check_interval: Duration::from_secs(10),
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let busy = TopicKey::all("chat");
        let idle = TopicKey::group("chat", "g");

        supervisor.add_member(&idle, "c1", &cancel).await.unwrap();
        for _ in 0..15 {
            supervisor
                .accept_message(&busy, envelope("tick"), &cancel)
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        }

        assert!(supervisor.is_active(&busy));
        assert!(!supervisor.is_active(&idle));
        assert!(store.save_count() >= 1);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_refuses_calls() {
        let (supervisor, store) = supervisor_with(BackplaneConfig::default());
        let key = TopicKey::user("chat", "u");
        let cancel = CancellationToken::new();

        supervisor.add_member(&key, "c1", &cancel).await.unwrap();
        supervisor.shutdown().await.unwrap();
        supervisor.shutdown().await.unwrap();

        assert_eq!(store.save_count(), 1);
        assert_eq!(supervisor.active_topics(), 0);
        let err = supervisor.stats(&key).await.unwrap_err();
        assert!(matches!(err, BackplaneError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_flush_all() {
        let (supervisor, store) = supervisor_with(BackplaneConfig::default());
        let cancel = CancellationToken::new();

        supervisor
            .add_member(&TopicKey::group("chat", "a"), "c1", &cancel)
            .await
            .unwrap();
        supervisor
            .add_member(&TopicKey::user("chat", "u"), "c1", &cancel)
            .await
            .unwrap();
        supervisor
            .accept_message(&TopicKey::all("chat"), envelope("x"), &cancel)
            .await
            .unwrap();

        supervisor.flush_all().await.unwrap();
        assert_eq!(store.save_count(), 2);
        assert_eq!(supervisor.active_topics(), 3);
    }
}
