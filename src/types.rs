//! Core types for the backplane.

use crate::error::{BackplaneError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Separator between hub name and connection id in hub-scoped connection ids.
pub const SCOPE_SEPARATOR: &str = "::";

/// Identity of one incarnation of a topic's message log.
///
/// A fresh generation is minted every time a topic actor is activated, since the
/// log itself is volatile. Sequences from different generations are not comparable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Generation(pub Uuid);

impl Generation {
    /// The nil generation, used only by the zero handle.
    pub const NIL: Generation = Generation(Uuid::nil());

    /// A new random generation.
    pub fn new() -> Self {
        Generation(Uuid::new_v4())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let simple = self.0.simple().to_string();
        write!(f, "Gen({}...)", &simple[..8])
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position marker for replay: `(sequence, generation)`.
///
/// The default value is the zero handle, which means "no handle": subscribing
/// with it requests no replay.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct MessageHandle {
    /// Increases by one per push within a generation, starting at 1.
    pub sequence: u64,
    /// Log incarnation the sequence belongs to.
    pub generation: Generation,
}

impl MessageHandle {
    /// The zero handle.
    pub const ZERO: MessageHandle = MessageHandle {
        sequence: 0,
        generation: Generation::NIL,
    };

    pub fn new(sequence: u64, generation: Generation) -> Self {
        Self {
            sequence,
            generation,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Whether this handle should replace `latest` as a subscriber's resume point.
    ///
    /// Within a generation only a strictly greater sequence wins, so a message
    /// delivered late by a concurrent notify pass cannot move the resume point
    /// backwards. A different generation always wins because its sequences
    /// cannot be compared to the old ones.
    pub fn supersedes(&self, latest: &MessageHandle) -> bool {
        !self.is_zero()
            && (self.generation != latest.generation || self.sequence > latest.sequence)
    }
}

impl fmt::Debug for MessageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            write!(f, "Handle(zero)")
        } else {
            write!(f, "Handle({}@{:?})", self.sequence, self.generation)
        }
    }
}

/// Identifier of one subscription within a topic's observer registry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        SubscriptionId(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let simple = self.0.simple().to_string();
        write!(f, "Sub({}...)", &simple[..8])
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A client method call with already-serialized arguments.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodInvocation {
    pub method: String,
    pub args: Vec<u8>,
}

impl MethodInvocation {
    pub fn new(method: impl Into<String>, args: Vec<u8>) -> Self {
        Self {
            method: method.into(),
            args,
        }
    }
}

/// The message accepted by every topic: a payload plus the connections that
/// must not receive it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub excluding: BTreeSet<String>,
    pub payload: MethodInvocation,
}

impl Envelope {
    /// Envelope with no exclusions.
    pub fn new(payload: MethodInvocation) -> Self {
        Self {
            excluding: BTreeSet::new(),
            payload,
        }
    }

    /// Envelope excluding the given connection ids. Duplicates collapse.
    pub fn excluding<I, S>(excluding: I, payload: MethodInvocation) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            excluding: excluding.into_iter().map(Into::into).collect(),
            payload,
        }
    }

    pub fn is_excluded(&self, connection_id: &str) -> bool {
        self.excluding.contains(connection_id)
    }
}

/// A payload addressed to exactly one connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressedMessage {
    pub connection_id: String,
    pub payload: MethodInvocation,
}

/// What kind of stream a topic key addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TopicKind {
    All,
    Group,
    User,
    Connection,
}

/// Addressable target of a message stream. Each key maps to exactly one topic actor.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TopicKey {
    All { hub: String },
    Group { hub: String, group: String },
    User { hub: String, user: String },
    Connection { hub: String, connection: String },
}

impl TopicKey {
    pub fn all(hub: impl Into<String>) -> Self {
        TopicKey::All { hub: hub.into() }
    }

    pub fn group(hub: impl Into<String>, group: impl Into<String>) -> Self {
        TopicKey::Group {
            hub: hub.into(),
            group: group.into(),
        }
    }

    pub fn user(hub: impl Into<String>, user: impl Into<String>) -> Self {
        TopicKey::User {
            hub: hub.into(),
            user: user.into(),
        }
    }

    pub fn connection(hub: impl Into<String>, connection: impl Into<String>) -> Self {
        TopicKey::Connection {
            hub: hub.into(),
            connection: connection.into(),
        }
    }

    pub fn hub(&self) -> &str {
        match self {
            TopicKey::All { hub }
            | TopicKey::Group { hub, .. }
            | TopicKey::User { hub, .. }
            | TopicKey::Connection { hub, .. } => hub,
        }
    }

    pub fn kind(&self) -> TopicKind {
        match self {
            TopicKey::All { .. } => TopicKind::All,
            TopicKey::Group { .. } => TopicKind::Group,
            TopicKey::User { .. } => TopicKind::User,
            TopicKey::Connection { .. } => TopicKind::Connection,
        }
    }

    /// Group and user topics carry a durable membership set.
    pub fn has_membership(&self) -> bool {
        matches!(self, TopicKey::Group { .. } | TopicKey::User { .. })
    }

    /// Reject keys with empty components or a hub name that would make
    /// hub-scoped connection ids ambiguous.
    pub fn validate(&self) -> Result<()> {
        let hub = self.hub();
        if hub.is_empty() {
            return Err(BackplaneError::InvalidTopicKey(format!(
                "{self}: hub name is empty"
            )));
        }
        if hub.contains(SCOPE_SEPARATOR) {
            return Err(BackplaneError::InvalidTopicKey(format!(
                "{self}: hub name contains {SCOPE_SEPARATOR:?}"
            )));
        }
        let name = match self {
            TopicKey::All { .. } => return Ok(()),
            TopicKey::Group { group, .. } => group,
            TopicKey::User { user, .. } => user,
            TopicKey::Connection { connection, .. } => connection,
        };
        if name.is_empty() {
            return Err(BackplaneError::InvalidTopicKey(format!(
                "{self}: name is empty"
            )));
        }
        Ok(())
    }

    /// Map a connection id into this topic's address space.
    ///
    /// Group and user memberships hold hub-scoped ids (`hub::connection`);
    /// the all-stream and connection streams use raw ids.
    pub fn scope_connection(&self, connection_id: &str) -> String {
        if self.has_membership() {
            format!("{}{}{}", self.hub(), SCOPE_SEPARATOR, connection_id)
        } else {
            connection_id.to_string()
        }
    }

    /// Inverse of [`TopicKey::scope_connection`]. Returns `None` for ids that
    /// belong to another hub.
    pub fn unscope_connection<'a>(&self, scoped: &'a str) -> Option<&'a str> {
        if !self.has_membership() {
            return Some(scoped);
        }
        scoped
            .strip_prefix(self.hub())
            .and_then(|rest| rest.strip_prefix(SCOPE_SEPARATOR))
    }
}

impl fmt::Debug for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TopicKey({self})")
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicKey::All { hub } => write!(f, "all:{hub}"),
            TopicKey::Group { hub, group } => write!(f, "group:{hub}/{group}"),
            TopicKey::User { hub, user } => write!(f, "user:{hub}/{user}"),
            TopicKey::Connection { hub, connection } => write!(f, "connection:{hub}/{connection}"),
        }
    }
}

/// Validate a connection id supplied by a caller.
pub fn validate_connection_id(connection_id: &str) -> Result<()> {
    if connection_id.is_empty() {
        return Err(BackplaneError::InvalidConnectionId(connection_id.to_string()));
    }
    Ok(())
}
