//! The per-topic actor task.

use super::{Accepted, SubscribeRequest, Subscription, TopicStats};
use crate::config::BackplaneConfig;
use crate::error::{BackplaneError, Result};
use crate::log::MessageLog;
use crate::membership::{MembershipKey, MembershipStore};
use crate::observers::{Delivery, ObserverRegistry};
use crate::types::{Envelope, SubscriptionId, TopicKey};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type Reply<T> = oneshot::Sender<Result<T>>;

/// Mailbox messages understood by a topic actor.
pub(crate) enum Command {
    Accept {
        envelope: Arc<Envelope>,
        reply: Reply<Accepted>,
    },
    Subscribe {
        request: SubscribeRequest,
        reply: Reply<Subscription>,
    },
    Unsubscribe {
        id: SubscriptionId,
        reply: Reply<bool>,
    },
    Renew {
        id: SubscriptionId,
        reply: Reply<bool>,
    },
    AddMember {
        connection: String,
        reply: Reply<bool>,
    },
    RemoveMember {
        connection: String,
        reply: Reply<bool>,
    },
    Members {
        reply: Reply<BTreeSet<String>>,
    },
    Stats {
        reply: Reply<TopicStats>,
    },
    Flush {
        reply: Reply<()>,
    },
    /// Flush, end every subscription and stop.
    Deactivate {
        reply: Option<Reply<()>>,
    },
}

impl Command {
    /// Answer the command with an error without running it.
    fn fail(self, error: BackplaneError) {
        // A dropped reply receiver means the caller stopped waiting.
        match self {
            Command::Accept { reply, .. } => drop(reply.send(Err(error))),
            Command::Subscribe { reply, .. } => drop(reply.send(Err(error))),
            Command::Unsubscribe { reply, .. }
            | Command::Renew { reply, .. }
            | Command::AddMember { reply, .. }
            | Command::RemoveMember { reply, .. } => drop(reply.send(Err(error))),
            Command::Members { reply } => drop(reply.send(Err(error))),
            Command::Stats { reply } => drop(reply.send(Err(error))),
            Command::Flush { reply } => drop(reply.send(Err(error))),
            Command::Deactivate { reply } => {
                if let Some(reply) = reply {
                    drop(reply.send(Err(error)));
                }
            }
        }
    }
}

/// Durable membership of a group or user topic.
struct Membership {
    key: MembershipKey,
    members: BTreeSet<String>,
    dirty: bool,
}

/// State owned by one topic actor. Only the actor task touches it.
pub(crate) struct TopicActor {
    key: TopicKey,
    log: MessageLog<Arc<Envelope>>,
    observers: ObserverRegistry,
    membership: Option<Membership>,
    store: Arc<dyn MembershipStore>,
    config: Arc<BackplaneConfig>,
}

impl TopicActor {
    /// Start an actor for `key` and return its mailbox together with a token
    /// that is cancelled once the actor has stopped.
    ///
    /// With a `predecessor`, the actor waits for that token before loading
    /// its membership, so it reads what the previous actor for the key
    /// wrote on its way out. Commands queue in the mailbox meanwhile.
    pub(crate) fn spawn(
        key: TopicKey,
        config: Arc<BackplaneConfig>,
        store: Arc<dyn MembershipStore>,
        predecessor: Option<CancellationToken>,
    ) -> (mpsc::Sender<Command>, CancellationToken) {
        let (sender, mailbox) = mpsc::channel(config.mailbox_capacity);
        let actor = Self {
            log: MessageLog::new(config.max_rewind),
            observers: ObserverRegistry::new(key.clone(), config.observer_expiration),
            membership: None,
            key,
            store,
            config,
        };
        let stopped = CancellationToken::new();
        tokio::spawn(actor.run(mailbox, predecessor, stopped.clone()));
        (sender, stopped)
    }

    async fn run(
        mut self,
        mut mailbox: mpsc::Receiver<Command>,
        predecessor: Option<CancellationToken>,
        stopped: CancellationToken,
    ) {
        let _stopped = stopped.drop_guard();
        if let Some(predecessor) = predecessor {
            debug!(topic = %self.key, "waiting for previous actor to stop");
            predecessor.cancelled().await;
        }

        if let Err(e) = self.load_membership().await {
            warn!(topic = %self.key, error = %e, "failed to load membership, stopping actor");
            mailbox.close();
            while let Some(command) = mailbox.recv().await {
                command.fail(BackplaneError::Storage(format!(
                    "{}: membership load failed: {e}",
                    self.key
                )));
            }
            return;
        }

        debug!(topic = %self.key, generation = ?self.log.generation(), "topic actor activated");

        let period = self.config.persist_interval;
        let mut persist = interval_at(Instant::now() + period, period);
        persist.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = mailbox.recv() => match command {
                    Some(command) => {
                        if !self.handle(command).await {
                            break;
                        }
                    }
                    None => {
                        let _ = self.deactivate().await;
                        break;
                    }
                },
                _ = persist.tick() => self.on_tick().await,
            }
        }
    }

    /// Run one command. Returns false once the actor must stop.
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Accept { envelope, reply } => {
                let _ = reply.send(Ok(self.accept(envelope)));
            }
            Command::Subscribe { request, reply } => {
                let _ = reply.send(self.subscribe(request));
            }
            Command::Unsubscribe { id, reply } => {
                let _ = reply.send(Ok(self.observers.unsubscribe(id)));
            }
            Command::Renew { id, reply } => {
                let _ = reply.send(Ok(self.observers.renew(id)));
            }
            Command::AddMember { connection, reply } => {
                let _ = reply.send(self.add_member(&connection));
            }
            Command::RemoveMember { connection, reply } => {
                let _ = reply.send(self.remove_member(&connection));
            }
            Command::Members { reply } => {
                let members = self
                    .membership
                    .as_ref()
                    .map(|m| m.members.clone())
                    .unwrap_or_default();
                let _ = reply.send(Ok(members));
            }
            Command::Stats { reply } => {
                let _ = reply.send(Ok(self.stats()));
            }
            Command::Flush { reply } => {
                let _ = reply.send(self.persist().await);
            }
            Command::Deactivate { reply } => {
                let result = self.deactivate().await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
                return false;
            }
        }
        true
    }

    // --- Operations ---

    fn accept(&mut self, envelope: Arc<Envelope>) -> Accepted {
        let handle = self.log.push(envelope.clone());
        let delivery = Delivery {
            topic: self.key.clone(),
            envelope: envelope.clone(),
            handle,
        };

        let outcome = self.observers.notify(|observer| observer.on_message(&delivery));
        if outcome.removed() > 0 {
            debug!(
                topic = %self.key,
                handle = ?handle,
                expired = outcome.expired,
                failed = outcome.failed,
                "dropped observers while notifying"
            );
        }

        let forward_to = match &self.membership {
            Some(membership) => membership
                .members
                .iter()
                .filter(|scoped| !envelope.is_excluded(scoped))
                .filter_map(|scoped| self.key.unscope_connection(scoped))
                .map(str::to_string)
                .collect(),
            None => Vec::new(),
        };

        Accepted {
            handle,
            delivered: outcome.delivered,
            forward_to,
        }
    }

    fn subscribe(&mut self, request: SubscribeRequest) -> Result<Subscription> {
        // Replay is computed before registering, so a failed replay leaves
        // the registry as it was.
        let replay = self.log.since(request.since).map_err(|e| {
            debug!(topic = %self.key, since = ?request.since, "replay out of range");
            e
        })?;

        let id = request.id;
        self.observers.subscribe(id, request.observer);

        let mut replayed = 0;
        for (envelope, handle) in replay {
            let delivery = Delivery {
                topic: self.key.clone(),
                envelope,
                handle,
            };
            if self
                .observers
                .deliver_to(id, |observer| observer.on_message(&delivery))
                .is_err()
            {
                break;
            }
            replayed += 1;
        }

        Ok(Subscription {
            id,
            generation: self.log.generation(),
            last_handle: self.log.last_handle(),
            replayed,
        })
    }

    fn add_member(&mut self, connection: &str) -> Result<bool> {
        let scoped = self.key.scope_connection(connection);
        let membership = self.membership_mut()?;
        let added = membership.members.insert(scoped);
        membership.dirty |= added;
        Ok(added)
    }

    fn remove_member(&mut self, connection: &str) -> Result<bool> {
        let scoped = self.key.scope_connection(connection);
        let membership = self.membership_mut()?;
        let removed = membership.members.remove(&scoped);
        membership.dirty |= removed;
        Ok(removed)
    }

    fn membership_mut(&mut self) -> Result<&mut Membership> {
        let key = &self.key;
        self.membership.as_mut().ok_or_else(|| {
            BackplaneError::InvalidOperation(format!("{key} has no membership"))
        })
    }

    fn stats(&self) -> TopicStats {
        TopicStats {
            key: self.key.clone(),
            generation: self.log.generation(),
            last_handle: self.log.last_handle(),
            retained: self.log.len(),
            observers: self.observers.len(),
            members: self
                .membership
                .as_ref()
                .map(|m| m.members.len())
                .unwrap_or(0),
        }
    }

    // --- Lifecycle ---

    async fn load_membership(&mut self) -> Result<()> {
        let Some(key) = MembershipKey::for_topic(&self.key) else {
            return Ok(());
        };
        let members = self.store.load(&key).await?;
        self.membership = Some(Membership {
            key,
            members,
            dirty: false,
        });
        Ok(())
    }

    /// Write the membership set if it changed since the last write.
    async fn persist(&mut self) -> Result<()> {
        let Some(membership) = self.membership.as_mut() else {
            return Ok(());
        };
        if !membership.dirty {
            return Ok(());
        }
        self.store.save(&membership.key, &membership.members).await?;
        membership.dirty = false;
        debug!(topic = %self.key, members = membership.members.len(), "membership persisted");
        Ok(())
    }

    async fn on_tick(&mut self) {
        if let Err(e) = self.persist().await {
            warn!(topic = %self.key, error = %e, "periodic membership flush failed");
        }
        let expired = self.observers.clear_expired();
        if expired > 0 {
            debug!(topic = %self.key, expired, "dropped expired observers");
        }
    }

    async fn deactivate(&mut self) -> Result<()> {
        let result = self.persist().await;
        if let Err(e) = &result {
            warn!(topic = %self.key, error = %e, "membership flush on deactivation failed");
        }
        let ended = self.observers.end_all();
        debug!(topic = %self.key, ended, "topic actor deactivated");
        result
    }
}
