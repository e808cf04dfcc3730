//! Routing of logical sends to topic actors.
//!
//! A send names a target (everyone, a group, a user, a connection, or lists
//! of those) and may exclude connections. The router turns it into accepts
//! on the right topics, putting exclusions into each topic's address space,
//! and forwards group and user messages to every member's connection topic.

use crate::error::Result;
use crate::topics::TopicSupervisor;
use crate::types::{Envelope, MessageHandle, MethodInvocation, TopicKey};
use futures::future::try_join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Who a message is for. Connection ids are raw (not hub-scoped).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    All,
    AllExcept(Vec<String>),
    Group(String),
    GroupExcept(String, Vec<String>),
    Groups(Vec<String>),
    User(String),
    Users(Vec<String>),
    Connection(String),
    Connections(Vec<String>),
}

/// Every topic a send was accepted on, in acceptance order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SendReport {
    pub accepted: Vec<(TopicKey, MessageHandle)>,
}

impl SendReport {
    /// Handle assigned on `key`, if the send touched it.
    pub fn handle_for(&self, key: &TopicKey) -> Option<MessageHandle> {
        self.accepted
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, handle)| *handle)
    }

    /// Connection topics the message ended up on.
    pub fn connections(&self) -> impl Iterator<Item = &str> {
        self.accepted.iter().filter_map(|(key, _)| match key {
            TopicKey::Connection { connection, .. } => Some(connection.as_str()),
            _ => None,
        })
    }
}

/// Routes sends for one hub.
#[derive(Clone)]
pub struct Router {
    hub: String,
    supervisor: Arc<TopicSupervisor>,
}

impl Router {
    pub fn new(hub: impl Into<String>, supervisor: Arc<TopicSupervisor>) -> Self {
        Self {
            hub: hub.into(),
            supervisor,
        }
    }

    pub fn hub(&self) -> &str {
        &self.hub
    }

    /// Publish `payload` to `target`.
    ///
    /// Observers failing along the way never fail the send; only validation,
    /// cancellation and shutdown do.
    pub async fn send(
        &self,
        target: &Target,
        payload: MethodInvocation,
        cancel: &CancellationToken,
    ) -> Result<SendReport> {
        let mut report = SendReport::default();
        match target {
            Target::All => self.publish_all(&[], payload, cancel, &mut report).await?,
            Target::AllExcept(excluded) => {
                self.publish_all(excluded, payload, cancel, &mut report)
                    .await?
            }
            Target::Group(group) => {
                let keys = [TopicKey::group(&self.hub, group)];
                self.publish_members(&keys, &[], payload, cancel, &mut report)
                    .await?
            }
            Target::GroupExcept(group, excluded) => {
                let keys = [TopicKey::group(&self.hub, group)];
                self.publish_members(&keys, excluded, payload, cancel, &mut report)
                    .await?
            }
            Target::Groups(groups) => {
                let keys: Vec<_> = groups
                    .iter()
                    .map(|group| TopicKey::group(&self.hub, group))
                    .collect();
                self.publish_members(&keys, &[], payload, cancel, &mut report)
                    .await?
            }
            Target::User(user) => {
                let keys = [TopicKey::user(&self.hub, user)];
                self.publish_members(&keys, &[], payload, cancel, &mut report)
                    .await?
            }
            Target::Users(users) => {
                let keys: Vec<_> = users
                    .iter()
                    .map(|user| TopicKey::user(&self.hub, user))
                    .collect();
                self.publish_members(&keys, &[], payload, cancel, &mut report)
                    .await?
            }
            Target::Connection(connection) => {
                self.publish_connections(
                    std::slice::from_ref(connection),
                    payload,
                    cancel,
                    &mut report,
                )
                .await?
            }
            Target::Connections(connections) => {
                self.publish_connections(connections, payload, cancel, &mut report)
                    .await?
            }
        }
        Ok(report)
    }

    // --- Membership ---

    pub async fn add_to_group(
        &self,
        connection_id: &str,
        group: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.supervisor
            .add_member(&TopicKey::group(&self.hub, group), connection_id, cancel)
            .await
    }

    pub async fn remove_from_group(
        &self,
        connection_id: &str,
        group: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.supervisor
            .remove_member(&TopicKey::group(&self.hub, group), connection_id, cancel)
            .await
    }

    pub async fn add_to_user(
        &self,
        connection_id: &str,
        user: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.supervisor
            .add_member(&TopicKey::user(&self.hub, user), connection_id, cancel)
            .await
    }

    pub async fn remove_from_user(
        &self,
        connection_id: &str,
        user: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.supervisor
            .remove_member(&TopicKey::user(&self.hub, user), connection_id, cancel)
            .await
    }

    // --- Internals ---

    /// The all-stream uses raw connection ids, so exclusions go in as given.
    async fn publish_all(
        &self,
        excluded: &[String],
        payload: MethodInvocation,
        cancel: &CancellationToken,
        report: &mut SendReport,
    ) -> Result<()> {
        let key = TopicKey::all(&self.hub);
        let envelope = Envelope::excluding(excluded.iter().cloned(), payload);
        let accepted = self.supervisor.accept_message(&key, envelope, cancel).await?;
        report.accepted.push((key, accepted.handle));
        Ok(())
    }

    /// Accept on group or user topics, then forward to their members. A
    /// connection reached through several topics gets the message once.
    async fn publish_members(
        &self,
        keys: &[TopicKey],
        excluded: &[String],
        payload: MethodInvocation,
        cancel: &CancellationToken,
        report: &mut SendReport,
    ) -> Result<()> {
        let accepts = keys.iter().map(|key| {
            let envelope = Envelope::excluding(
                excluded.iter().map(|id| key.scope_connection(id)),
                payload.clone(),
            );
            self.supervisor.accept_message(key, envelope, cancel)
        });
        let results = try_join_all(accepts).await?;

        let mut forward = BTreeSet::new();
        for (key, accepted) in keys.iter().zip(results) {
            report.accepted.push((key.clone(), accepted.handle));
            forward.extend(accepted.forward_to);
        }

        let forward: Vec<_> = forward.into_iter().collect();
        self.publish_connections(&forward, payload, cancel, report)
            .await
    }

    async fn publish_connections(
        &self,
        connections: &[String],
        payload: MethodInvocation,
        cancel: &CancellationToken,
        report: &mut SendReport,
    ) -> Result<()> {
        let keys: Vec<_> = connections
            .iter()
            .map(|connection| TopicKey::connection(&self.hub, connection))
            .collect();
        let accepts = keys.iter().map(|key| {
            self.supervisor
                .accept_message(key, Envelope::new(payload.clone()), cancel)
        });
        let results = try_join_all(accepts).await?;

        report.accepted.extend(
            keys.into_iter()
                .zip(results)
                .map(|(key, accepted)| (key, accepted.handle)),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackplaneConfig;
    use crate::membership::MemoryMembershipStore;

    fn router() -> (Router, Arc<TopicSupervisor>) {
        let supervisor = TopicSupervisor::start(
            Arc::new(BackplaneConfig::default()),
            Arc::new(MemoryMembershipStore::new()),
        );
        (Router::new("chat", supervisor.clone()), supervisor)
    }

    fn payload() -> MethodInvocation {
        MethodInvocation::new("notify", b"[]".to_vec())
    }

    #[tokio::test]
    async fn test_all_except_keeps_raw_ids() {
        let (router, supervisor) = router();
        let cancel = CancellationToken::new();

        let report = router
            .send(&Target::AllExcept(vec!["c1".into()]), payload(), &cancel)
            .await
            .unwrap();

        assert_eq!(report.accepted.len(), 1);
        assert_eq!(report.accepted[0].0, TopicKey::all("chat"));
        assert_eq!(
            supervisor.stats(&TopicKey::all("chat")).await.unwrap().retained,
            1
        );
    }

    #[tokio::test]
    async fn test_group_except_forwards_to_remaining_members() {
        let (router, _) = router();
        let cancel = CancellationToken::new();
        for connection in ["c1", "c2", "c3"] {
            router.add_to_group(connection, "g", &cancel).await.unwrap();
        }

        let report = router
            .send(
                &Target::GroupExcept("g".into(), vec!["c2".into()]),
                payload(),
                &cancel,
            )
            .await
            .unwrap();

        let forwarded: Vec<_> = report.connections().collect();
        assert_eq!(forwarded, vec!["c1", "c3"]);
        assert!(report.handle_for(&TopicKey::group("chat", "g")).is_some());
    }

    #[tokio::test]
    async fn test_user_reaches_every_connection() {
        let (router, _) = router();
        let cancel = CancellationToken::new();
        router.add_to_user("phone", "alice", &cancel).await.unwrap();
        router.add_to_user("laptop", "alice", &cancel).await.unwrap();
        router.add_to_user("other", "bob", &cancel).await.unwrap();

        let report = router
            .send(&Target::User("alice".into()), payload(), &cancel)
            .await
            .unwrap();

        let mut forwarded: Vec<_> = report.connections().collect();
        forwarded.sort();
        assert_eq!(forwarded, vec!["laptop", "phone"]);
    }

    #[tokio::test]
    async fn test_overlapping_groups_forward_once() {
        let (router, _) = router();
        let cancel = CancellationToken::new();
        router.add_to_group("c1", "a", &cancel).await.unwrap();
        router.add_to_group("c1", "b", &cancel).await.unwrap();
        router.add_to_group("c2", "b", &cancel).await.unwrap();

        let report = router
            .send(
                &Target::Groups(vec!["a".into(), "b".into()]),
                payload(),
                &cancel,
            )
            .await
            .unwrap();

        let forwarded: Vec<_> = report.connections().collect();
        assert_eq!(forwarded, vec!["c1", "c2"]);
        assert_eq!(report.accepted.len(), 4);
    }

    #[tokio::test]
    async fn test_removed_member_no_longer_forwarded() {
        let (router, _) = router();
        let cancel = CancellationToken::new();
        router.add_to_group("c1", "g", &cancel).await.unwrap();
        assert!(router.remove_from_group("c1", "g", &cancel).await.unwrap());
        assert!(!router.remove_from_group("c1", "g", &cancel).await.unwrap());

        let report = router
            .send(&Target::Group("g".into()), payload(), &cancel)
            .await
            .unwrap();
        assert_eq!(report.connections().count(), 0);
    }

    #[tokio::test]
    async fn test_connections_each_get_their_own_log() {
        let (router, _) = router();
        let cancel = CancellationToken::new();

        let report = router
            .send(
                &Target::Connections(vec!["c1".into(), "c2".into()]),
                payload(),
                &cancel,
            )
            .await
            .unwrap();
        let again = router
            .send(&Target::Connection("c1".into()), payload(), &cancel)
            .await
            .unwrap();

        let c1 = TopicKey::connection("chat", "c1");
        assert_eq!(report.handle_for(&c1).unwrap().sequence, 1);
        assert_eq!(again.handle_for(&c1).unwrap().sequence, 2);
        assert_eq!(
            report
                .handle_for(&TopicKey::connection("chat", "c2"))
                .unwrap()
                .sequence,
            1
        );
    }
}
