//! Sending to a hub from anywhere in the process.

use crate::codec::ArgsCodec;
use crate::error::Result;
use crate::router::{Router, SendReport, Target};
use crate::topics::TopicSupervisor;
use crate::types::{MethodInvocation, TopicKey};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Handle for publishing to one hub and managing its groups, without being
/// tied to a connection.
#[derive(Clone)]
pub struct HubContext {
    router: Router,
    supervisor: Arc<TopicSupervisor>,
    codec: Arc<dyn ArgsCodec>,
}

impl HubContext {
    pub fn new(
        hub: impl Into<String>,
        supervisor: Arc<TopicSupervisor>,
        codec: Arc<dyn ArgsCodec>,
    ) -> Self {
        Self {
            router: Router::new(hub, supervisor.clone()),
            supervisor,
            codec,
        }
    }

    pub fn hub(&self) -> &str {
        self.router.hub()
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn codec(&self) -> &Arc<dyn ArgsCodec> {
        &self.codec
    }

    pub fn supervisor(&self) -> &Arc<TopicSupervisor> {
        &self.supervisor
    }

    /// Encode `args` and invoke `method` on every client addressed by `target`.
    pub async fn send(
        &self,
        target: &Target,
        method: &str,
        args: &[Value],
        cancel: &CancellationToken,
    ) -> Result<SendReport> {
        let payload = MethodInvocation::new(method, self.codec.encode(args)?);
        self.router.send(target, payload, cancel).await
    }

    /// Send an already encoded invocation.
    pub async fn send_invocation(
        &self,
        target: &Target,
        payload: MethodInvocation,
        cancel: &CancellationToken,
    ) -> Result<SendReport> {
        self.router.send(target, payload, cancel).await
    }

    pub async fn add_to_group(
        &self,
        connection_id: &str,
        group: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.router.add_to_group(connection_id, group, cancel).await
    }

    pub async fn remove_from_group(
        &self,
        connection_id: &str,
        group: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.router
            .remove_from_group(connection_id, group, cancel)
            .await
    }

    /// Raw connection ids currently in `group`.
    pub async fn group_members(&self, group: &str) -> Result<BTreeSet<String>> {
        self.members_of(TopicKey::group(self.hub(), group)).await
    }

    /// Raw connection ids currently registered for `user`.
    pub async fn user_connections(&self, user: &str) -> Result<BTreeSet<String>> {
        self.members_of(TopicKey::user(self.hub(), user)).await
    }

    async fn members_of(&self, key: TopicKey) -> Result<BTreeSet<String>> {
        let scoped = self.supervisor.members(&key).await?;
        Ok(scoped
            .iter()
            .filter_map(|id| key.unscope_connection(id))
            .map(str::to_string)
            .collect())
    }
}
