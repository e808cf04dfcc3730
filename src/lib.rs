//! # Backplane
//!
//! A replayable fanout backplane for real-time hubs. Server processes publish
//! to topics (everyone on a hub, a group, a user, a single connection) and
//! subscribers that lose their connection resume from the last message they
//! saw, as long as it is still inside the topic's rewind window.
//!
//! ## Core Concepts
//!
//! - **Topics**: One actor per key, owning a bounded rewind log and its observers
//! - **Handles**: `(sequence, generation)` positions used to resume a stream
//! - **Observers**: Live subscribers, evicted on failure or missed keep-alive
//! - **Memberships**: Durable group and user sets that outlive topic actors
//! - **Lifetime managers**: Per-process connection tracking with replay on reconnect
//!
//! ## Example
//!
//! ```ignore
//! use backplane::{Backplane, BackplaneConfig, ChannelTransport, ConnectionInfo, Target};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! let backplane = Backplane::open(BackplaneConfig::default(), "./memberships")?;
//! let (transport, mut outbox) = ChannelTransport::channel();
//! let manager = backplane.lifetime_manager("chat", Arc::new(transport)).await?;
//! let cancel = CancellationToken::new();
//!
//! manager.on_connected(ConnectionInfo::new("c1").with_user("alice"), &cancel).await?;
//! manager.add_to_group("c1", "lobby", &cancel).await?;
//!
//! let hub = backplane.hub("chat")?;
//! hub.send(&Target::Group("lobby".into()), "say", &[json!("hi")], &cancel).await?;
//!
//! // Remember where the client was, then resume there after a reconnect.
//! let resume_from = manager.latest_handle("c1").unwrap_or_default();
//! manager.on_disconnected("c1", &cancel).await?;
//! manager
//!     .on_connected(ConnectionInfo::new("c1").resuming_from(resume_from), &cancel)
//!     .await?;
//! ```

pub mod backplane;
pub mod codec;
pub mod config;
pub mod error;
pub mod hub;
pub mod log;
pub mod membership;
pub mod observers;
pub mod router;
pub mod topics;
pub mod types;

// Re-exports
pub use backplane::Backplane;
pub use codec::{ArgsCodec, JsonArgsCodec, MsgPackArgsCodec};
pub use config::BackplaneConfig;
pub use error::{BackplaneError, Result};
pub use hub::{
    ChannelTransport, ClientTransport, ConnectionInfo, HubContext, HubLifetimeManager,
    TransportMessage,
};
pub use log::MessageLog;
pub use membership::{
    FileMembershipStore, MembershipKey, MembershipKind, MembershipStore, MemoryMembershipStore,
};
pub use observers::{
    CallbackObserver, ChannelObserver, Delivery, DeliveryError, MessageObserver, NotifyOutcome,
    ObserverEvent, ObserverReceiver, ObserverRegistry,
};
pub use router::{Router, SendReport, Target};
pub use topics::{Accepted, SubscribeRequest, Subscription, TopicStats, TopicSupervisor};
pub use types::*;
