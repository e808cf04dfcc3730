//! Top-level entry point tying configuration, topic actors and hubs together.

use crate::codec::{ArgsCodec, JsonArgsCodec};
use crate::config::BackplaneConfig;
use crate::error::{BackplaneError, Result};
use crate::hub::{ClientTransport, HubContext, HubLifetimeManager};
use crate::membership::{FileMembershipStore, MembershipStore, MemoryMembershipStore};
use crate::topics::TopicSupervisor;
use crate::types::TopicKey;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// A running backplane for one process.
///
/// Cheap to share behind an `Arc`; every hub of the process goes through
/// the same topic supervisor.
pub struct Backplane {
    supervisor: Arc<TopicSupervisor>,
    codec: Arc<dyn ArgsCodec>,
}

impl Backplane {
    /// Start a backplane on the given membership store.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: BackplaneConfig, store: Arc<dyn MembershipStore>) -> Result<Self> {
        config.validate()?;
        info!(
            max_rewind = config.max_rewind,
            hubs = ?config.hubs,
            "starting backplane"
        );
        Ok(Self {
            supervisor: TopicSupervisor::start(Arc::new(config), store),
            codec: Arc::new(JsonArgsCodec),
        })
    }

    /// Start with memberships kept in process memory.
    pub fn in_memory(config: BackplaneConfig) -> Result<Self> {
        Self::start(config, Arc::new(MemoryMembershipStore::new()))
    }

    /// Start with memberships persisted under `path`.
    pub fn open(config: BackplaneConfig, path: impl AsRef<Path>) -> Result<Self> {
        let store = FileMembershipStore::open(path)?;
        Self::start(config, Arc::new(store))
    }

    /// Use another argument codec for hubs created from now on.
    pub fn with_codec(mut self, codec: Arc<dyn ArgsCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn config(&self) -> &BackplaneConfig {
        self.supervisor.config()
    }

    pub fn supervisor(&self) -> &Arc<TopicSupervisor> {
        &self.supervisor
    }

    /// Context for publishing to `hub`.
    pub fn hub(&self, hub: &str) -> Result<HubContext> {
        TopicKey::all(hub).validate()?;
        if !self.config().serves_hub(hub) {
            return Err(BackplaneError::UnknownHub(hub.to_string()));
        }
        Ok(HubContext::new(
            hub,
            self.supervisor.clone(),
            self.codec.clone(),
        ))
    }

    /// Start the lifetime manager of `hub` for this process, delivering to
    /// local clients through `transport`.
    pub async fn lifetime_manager(
        &self,
        hub: &str,
        transport: Arc<dyn ClientTransport>,
    ) -> Result<HubLifetimeManager> {
        HubLifetimeManager::start(self.hub(hub)?, transport).await
    }

    /// Write every dirty membership set now.
    pub async fn flush(&self) -> Result<()> {
        self.supervisor.flush_all().await
    }

    /// Flush and stop every topic actor. Shut lifetime managers down first.
    pub async fn shutdown(&self) -> Result<()> {
        info!(topics = self.supervisor.active_topics(), "shutting down backplane");
        self.supervisor.shutdown().await
    }
}
