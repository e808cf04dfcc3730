//! Durable membership sets for group and user topics.
//!
//! A group or user topic holds the hub-scoped connection ids currently
//! addressed through it. The set outlives the topic actor: it is loaded on
//! activation and written back when dirty.

mod file;
mod memory;

pub use file::FileMembershipStore;
pub use memory::MemoryMembershipStore;

use crate::error::Result;
use crate::types::TopicKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;

/// Which kind of topic a membership set belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MembershipKind {
    Group,
    User,
}

/// Storage key of one membership set.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MembershipKey {
    pub hub: String,
    pub kind: MembershipKind,
    pub name: String,
}

impl MembershipKey {
    /// The membership key of a topic, if the topic carries one.
    pub fn for_topic(topic: &TopicKey) -> Option<Self> {
        match topic {
            TopicKey::Group { hub, group } => Some(Self {
                hub: hub.clone(),
                kind: MembershipKind::Group,
                name: group.clone(),
            }),
            TopicKey::User { hub, user } => Some(Self {
                hub: hub.clone(),
                kind: MembershipKind::User,
                name: user.clone(),
            }),
            TopicKey::All { .. } | TopicKey::Connection { .. } => None,
        }
    }

    /// Stable hex digest of the key, usable as a file name.
    pub fn digest(&self) -> String {
        let kind = match self.kind {
            MembershipKind::Group => "group",
            MembershipKind::User => "user",
        };
        let mut hasher = Sha256::new();
        hasher.update(kind.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.hub.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.name.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Debug for MembershipKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MembershipKey({:?} {}/{})", self.kind, self.hub, self.name)
    }
}

/// Backend for membership sets.
///
/// Both calls come from the owning topic actor only, so a store never sees
/// concurrent writes to the same key.
#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Load a membership set. A key that was never saved loads as empty.
    async fn load(&self, key: &MembershipKey) -> Result<BTreeSet<String>>;

    /// Replace a membership set.
    async fn save(&self, key: &MembershipKey, members: &BTreeSet<String>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_for_topic() {
        let key = MembershipKey::for_topic(&TopicKey::group("chat", "admins")).unwrap();
        assert_eq!(key.kind, MembershipKind::Group);
        assert_eq!(key.name, "admins");

        assert!(MembershipKey::for_topic(&TopicKey::all("chat")).is_none());
        assert!(MembershipKey::for_topic(&TopicKey::connection("chat", "c1")).is_none());
    }

    #[test]
    fn test_digest_separates_kinds_and_components() {
        let group = MembershipKey::for_topic(&TopicKey::group("chat", "alice")).unwrap();
        let user = MembershipKey::for_topic(&TopicKey::user("chat", "alice")).unwrap();
        assert_ne!(group.digest(), user.digest());

        let a = MembershipKey::for_topic(&TopicKey::group("ab", "c")).unwrap();
        let b = MembershipKey::for_topic(&TopicKey::group("a", "bc")).unwrap();
        assert_ne!(a.digest(), b.digest());

        assert_eq!(group.digest().len(), 64);
        assert_eq!(group.digest(), group.clone().digest());
    }
}
