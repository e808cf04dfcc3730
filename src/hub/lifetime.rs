//! Connection lifetime and reconnection handling for one hub.
//!
//! The manager keeps one subscription per process on the hub's all-stream
//! and fans it out to local connections, plus one subscription per local
//! connection on that connection's stream. Each subscription is driven by a
//! pump task that hands messages to the transport, remembers the newest
//! handle it delivered, renews the subscription and re-establishes it from
//! that handle whenever the topic ends it.

use super::context::HubContext;
use super::transport::ClientTransport;
use crate::config::BackplaneConfig;
use crate::error::{BackplaneError, Result};
use crate::observers::{ChannelObserver, Delivery, ObserverEvent, ObserverReceiver};
use crate::router::{SendReport, Target};
use crate::topics::{SubscribeRequest, TopicSupervisor};
use crate::types::{validate_connection_id, MessageHandle, SubscriptionId, TopicKey};
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A connection as announced by the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: String,
    /// Authenticated user, if any. The connection joins the user's topic.
    pub user: Option<String>,
    /// Last handle the client saw before reconnecting. Zero for a new
    /// connection.
    pub resume_from: MessageHandle,
}

impl ConnectionInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user: None,
            resume_from: MessageHandle::ZERO,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn resuming_from(mut self, handle: MessageHandle) -> Self {
        self.resume_from = handle;
        self
    }
}

struct ConnectionState {
    user: Option<String>,
    /// Groups joined through this manager, left again on disconnect.
    groups: BTreeSet<String>,
    subscription: SubscriptionId,
    latest: Arc<Mutex<MessageHandle>>,
    cancel: CancellationToken,
}

struct Shared {
    context: HubContext,
    supervisor: Arc<TopicSupervisor>,
    transport: Arc<dyn ClientTransport>,
    config: BackplaneConfig,
    connections: Mutex<HashMap<String, ConnectionState>>,
    cancel: CancellationToken,
}

/// Tracks the local connections of one hub and keeps their streams flowing
/// across topic restarts and client reconnects.
pub struct HubLifetimeManager {
    shared: Arc<Shared>,
    all_subscription: SubscriptionId,
    all_latest: Arc<Mutex<MessageHandle>>,
}

impl HubLifetimeManager {
    /// Subscribe this process to the hub's all-stream and start delivering.
    pub async fn start(context: HubContext, transport: Arc<dyn ClientTransport>) -> Result<Self> {
        let supervisor = context.supervisor().clone();
        let shared = Arc::new(Shared {
            config: supervisor.config().clone(),
            context,
            supervisor,
            transport,
            connections: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        });

        let all_subscription = SubscriptionId::new();
        let all_latest = Arc::new(Mutex::new(MessageHandle::ZERO));
        let pump = StreamPump {
            key: TopicKey::all(shared.context.hub()),
            sink: Sink::LocalConnections,
            id: all_subscription,
            latest: all_latest.clone(),
            cancel: shared.cancel.clone(),
            shared: shared.clone(),
        };
        let events = pump.subscribe(MessageHandle::ZERO).await?;
        tokio::spawn(pump.run(events));

        debug!(hub = %shared.context.hub(), "lifetime manager started");
        Ok(Self {
            shared,
            all_subscription,
            all_latest,
        })
    }

    pub fn hub(&self) -> &str {
        self.shared.context.hub()
    }

    pub fn context(&self) -> &HubContext {
        &self.shared.context
    }

    // --- Connections ---

    /// Register a local connection and start its stream, replaying what it
    /// missed since `info.resume_from` when the log still has it.
    pub async fn on_connected(&self, info: ConnectionInfo, cancel: &CancellationToken) -> Result<()> {
        validate_connection_id(&info.id)?;
        if self.shared.cancel.is_cancelled() {
            return Err(BackplaneError::ShuttingDown);
        }

        let subscription = SubscriptionId::new();
        let latest = Arc::new(Mutex::new(info.resume_from));
        let connection_cancel = self.shared.cancel.child_token();
        {
            let mut connections = self.shared.connections.lock();
            if connections.contains_key(&info.id) {
                return Err(BackplaneError::InvalidOperation(format!(
                    "connection {} is already registered",
                    info.id
                )));
            }
            connections.insert(
                info.id.clone(),
                ConnectionState {
                    user: info.user.clone(),
                    groups: BTreeSet::new(),
                    subscription,
                    latest: latest.clone(),
                    cancel: connection_cancel.clone(),
                },
            );
        }

        let result = self
            .attach(&info, subscription, latest, connection_cancel, cancel)
            .await;
        if let Err(e) = &result {
            warn!(hub = %self.hub(), connection = %info.id, error = %e, "connection setup failed");
            let cleanup = CancellationToken::new();
            if let Err(e) = self.detach(&info.id, &cleanup).await {
                debug!(connection = %info.id, error = %e, "cleanup after failed setup incomplete");
            }
        }
        result
    }

    async fn attach(
        &self,
        info: &ConnectionInfo,
        subscription: SubscriptionId,
        latest: Arc<Mutex<MessageHandle>>,
        connection_cancel: CancellationToken,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if let Some(user) = &info.user {
            self.shared
                .context
                .router()
                .add_to_user(&info.id, user, cancel)
                .await?;
        }

        let pump = StreamPump {
            key: TopicKey::connection(self.hub(), &info.id),
            sink: Sink::Connection(info.id.clone()),
            id: subscription,
            latest,
            cancel: connection_cancel,
            shared: self.shared.clone(),
        };
        let events = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BackplaneError::Cancelled),
            events = pump.subscribe(info.resume_from) => events?,
        };
        tokio::spawn(pump.run(events));

        debug!(hub = %self.hub(), connection = %info.id, resume_from = ?info.resume_from, "connection attached");
        Ok(())
    }

    /// Forget a local connection: stop its stream and take it out of its
    /// user and every group it joined here.
    ///
    /// Every step is attempted even if an earlier one fails; the first error
    /// is returned. Unknown connections are ignored.
    pub async fn on_disconnected(&self, connection_id: &str, cancel: &CancellationToken) -> Result<()> {
        self.detach(connection_id, cancel).await
    }

    async fn detach(&self, connection_id: &str, cancel: &CancellationToken) -> Result<()> {
        let Some(state) = self.shared.connections.lock().remove(connection_id) else {
            return Ok(());
        };
        state.cancel.cancel();

        let router = self.shared.context.router();
        let mut first_error = None;

        let key = TopicKey::connection(self.hub(), connection_id);
        let result = self
            .shared
            .supervisor
            .unsubscribe(&key, state.subscription, cancel)
            .await;
        note_failure(&mut first_error, connection_id, "unsubscribe", result);

        if let Some(user) = &state.user {
            let result = router.remove_from_user(connection_id, user, cancel).await;
            note_failure(&mut first_error, connection_id, "leave user", result);
        }
        for group in &state.groups {
            let result = router.remove_from_group(connection_id, group, cancel).await;
            note_failure(&mut first_error, connection_id, "leave group", result);
        }

        debug!(hub = %self.hub(), connection = %connection_id, "connection detached");
        first_error.map_or(Ok(()), Err)
    }

    // --- Groups ---

    /// Add a connection to a group. Local connections leave it again on
    /// disconnect.
    pub async fn add_to_group(
        &self,
        connection_id: &str,
        group: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let added = self
            .shared
            .context
            .add_to_group(connection_id, group, cancel)
            .await?;
        if let Some(state) = self.shared.connections.lock().get_mut(connection_id) {
            state.groups.insert(group.to_string());
        }
        Ok(added)
    }

    pub async fn remove_from_group(
        &self,
        connection_id: &str,
        group: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let removed = self
            .shared
            .context
            .remove_from_group(connection_id, group, cancel)
            .await?;
        if let Some(state) = self.shared.connections.lock().get_mut(connection_id) {
            state.groups.remove(group);
        }
        Ok(removed)
    }

    /// Encode `args` and invoke `method` on every client addressed by `target`.
    pub async fn send(
        &self,
        target: &Target,
        method: &str,
        args: &[Value],
        cancel: &CancellationToken,
    ) -> Result<SendReport> {
        self.shared.context.send(target, method, args, cancel).await
    }

    // --- Introspection ---

    /// Newest handle delivered on a connection's stream. A client that
    /// reconnects passes it back as `resume_from`.
    pub fn latest_handle(&self, connection_id: &str) -> Option<MessageHandle> {
        self.shared
            .connections
            .lock()
            .get(connection_id)
            .map(|state| *state.latest.lock())
    }

    /// Newest handle delivered from the all-stream.
    pub fn all_stream_handle(&self) -> MessageHandle {
        *self.all_latest.lock()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().len()
    }

    pub fn is_connected(&self, connection_id: &str) -> bool {
        self.shared.connections.lock().contains_key(connection_id)
    }

    // --- Lifecycle ---

    /// Stop every stream and detach every local connection.
    ///
    /// Call before shutting down the backplane; cleanup steps that find the
    /// backplane already shut down are skipped.
    pub async fn shutdown(&self) -> Result<()> {
        self.shared.cancel.cancel();

        let cleanup = CancellationToken::new();
        let ids: Vec<String> = self.shared.connections.lock().keys().cloned().collect();
        let mut first_error = None;
        for id in ids {
            match self.detach(&id, &cleanup).await {
                Ok(()) | Err(BackplaneError::ShuttingDown) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        let all = TopicKey::all(self.hub());
        match self
            .shared
            .supervisor
            .unsubscribe(&all, self.all_subscription, &cleanup)
            .await
        {
            Ok(_) | Err(BackplaneError::ShuttingDown) => {}
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }

        debug!(hub = %self.hub(), "lifetime manager stopped");
        first_error.map_or(Ok(()), Err)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }
}

impl Drop for HubLifetimeManager {
    fn drop(&mut self) {
        // Pumps hold the shared state; stop them with the manager.
        self.shared.cancel.cancel();
    }
}

fn note_failure<T>(
    first_error: &mut Option<BackplaneError>,
    connection_id: &str,
    step: &str,
    result: Result<T>,
) {
    if let Err(e) = result {
        warn!(connection = %connection_id, step, error = %e, "disconnect cleanup step failed");
        first_error.get_or_insert(e);
    }
}

// --- Stream pumps ---

/// Where a stream's messages go.
enum Sink {
    /// Every local connection not excluded by the envelope.
    LocalConnections,
    Connection(String),
}

/// Drives one subscription: delivery, keep-alive and resubscription.
struct StreamPump {
    shared: Arc<Shared>,
    key: TopicKey,
    sink: Sink,
    id: SubscriptionId,
    latest: Arc<Mutex<MessageHandle>>,
    cancel: CancellationToken,
}

impl StreamPump {
    /// Subscribe with replay from `since`, falling back to a subscription
    /// without replay when the log no longer reaches back that far.
    async fn subscribe(&self, since: MessageHandle) -> Result<ObserverReceiver> {
        let (observer, events) = ChannelObserver::channel(self.shared.config.observer_buffer);
        let request = SubscribeRequest::new(Arc::new(observer))
            .with_id(self.id)
            .since(since);

        let supervisor = &self.shared.supervisor;
        let subscription = match supervisor
            .subscribe(&self.key, request.clone(), &self.cancel)
            .await
        {
            Ok(subscription) => subscription,
            Err(e) if e.is_replay_out_of_range() => {
                warn!(topic = %self.key, since = ?since, "replay window exceeded, subscribing without replay");
                let subscription = supervisor
                    .subscribe(&self.key, request.since(MessageHandle::ZERO), &self.cancel)
                    .await?;
                self.advance(subscription.last_handle);
                subscription
            }
            Err(e) => return Err(e),
        };

        // Nothing of a new generation was replayed: resume from its current
        // end if the client reconnects.
        if subscription.generation != since.generation {
            self.advance(subscription.last_handle);
        }

        debug!(
            topic = %self.key,
            since = ?since,
            replayed = subscription.replayed,
            "subscribed"
        );
        Ok(events)
    }

    async fn run(self, mut events: ObserverReceiver) {
        let period = self.shared.config.renew_interval;
        let mut renew = interval_at(Instant::now() + period, period);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let resubscribe = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(ObserverEvent::Message(delivery)) => {
                        self.deliver(delivery).await;
                        false
                    }
                    Some(ObserverEvent::SubscriptionEnded { .. }) | None => {
                        debug!(topic = %self.key, "subscription ended by topic");
                        true
                    }
                },
                _ = renew.tick() => !self.renew().await,
            };

            if resubscribe {
                // Messages buffered before the end still go out first.
                while let Some(event) = events.try_recv() {
                    if let ObserverEvent::Message(delivery) = event {
                        self.deliver(delivery).await;
                    }
                }
                match self.resubscribe().await {
                    Some(next) => events = next,
                    None => break,
                }
            }
        }
        debug!(topic = %self.key, "stream stopped");
    }

    /// Returns false when the subscription is gone and must be recreated.
    async fn renew(&self) -> bool {
        match self
            .shared
            .supervisor
            .renew(&self.key, self.id, &self.cancel)
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                debug!(topic = %self.key, "subscription expired");
                false
            }
            Err(e) => {
                if !self.cancel.is_cancelled() {
                    warn!(topic = %self.key, error = %e, "renew failed");
                }
                true
            }
        }
    }

    /// Re-establish the subscription from the latest handle. Keeps retrying
    /// with capped exponential backoff for as long as the stream is live;
    /// returns `None` only once it has been stopped.
    async fn resubscribe(&self) -> Option<ObserverReceiver> {
        let config = &self.shared.config;
        let mut delay = config.resubscribe_backoff;
        let mut attempt: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            attempt += 1;
            let since = *self.latest.lock();
            match self.subscribe(since).await {
                Ok(events) => {
                    debug!(topic = %self.key, since = ?since, attempt, "resubscribed");
                    return Some(events);
                }
                Err(BackplaneError::Cancelled) | Err(BackplaneError::ShuttingDown) => return None,
                Err(e) => {
                    warn!(topic = %self.key, attempt, retry_in = ?delay, error = %e, "resubscribe failed");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = delay.saturating_mul(2).min(config.resubscribe_max_backoff);
                }
            }
        }
    }

    async fn deliver(&self, delivery: Delivery) {
        let payload = &delivery.envelope.payload;
        let args = match self.shared.context.codec().decode(&payload.args) {
            Ok(args) => args,
            Err(e) => {
                warn!(topic = %self.key, handle = ?delivery.handle, error = %e, "dropping message with undecodable arguments");
                self.advance(delivery.handle);
                return;
            }
        };

        match &self.sink {
            Sink::Connection(connection_id) => {
                if delivery.envelope.is_excluded(connection_id) {
                    self.advance(delivery.handle);
                    return;
                }
                match self
                    .shared
                    .transport
                    .deliver(connection_id, &payload.method, args)
                    .await
                {
                    Ok(()) => self.advance(delivery.handle),
                    Err(e) => {
                        debug!(connection = %connection_id, handle = ?delivery.handle, error = %e, "transport delivery failed")
                    }
                }
            }
            Sink::LocalConnections => {
                let targets: Vec<String> = self
                    .shared
                    .connections
                    .lock()
                    .keys()
                    .filter(|id| !delivery.envelope.is_excluded(id))
                    .cloned()
                    .collect();
                let transport = &self.shared.transport;
                let sends = targets.iter().map(|id| {
                    let args = args.clone();
                    async move { (id, transport.deliver(id, &payload.method, args).await) }
                });
                for (id, result) in join_all(sends).await {
                    if let Err(e) = result {
                        debug!(connection = %id, handle = ?delivery.handle, error = %e, "transport delivery failed");
                    }
                }
                self.advance(delivery.handle);
            }
        }
    }

    /// Move the resume point forward. Never moves back within a generation.
    fn advance(&self, handle: MessageHandle) {
        let mut latest = self.latest.lock();
        if handle.supersedes(&latest) {
            *latest = handle;
        }
    }
}
