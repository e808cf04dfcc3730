//! In-memory membership store.

use super::{MembershipKey, MembershipStore};
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

/// Membership store that lives as long as the process.
///
/// Survives topic actor deactivation, which is all a single-process
/// deployment needs.
#[derive(Default)]
pub struct MemoryMembershipStore {
    sets: Mutex<HashMap<MembershipKey, BTreeSet<String>>>,
    saves: AtomicU64,
}

impl MemoryMembershipStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `save` calls so far.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    /// Snapshot of one set without going through a topic actor.
    pub fn get(&self, key: &MembershipKey) -> BTreeSet<String> {
        self.sets.lock().get(key).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl MembershipStore for MemoryMembershipStore {
    async fn load(&self, key: &MembershipKey) -> Result<BTreeSet<String>> {
        Ok(self.get(key))
    }

    async fn save(&self, key: &MembershipKey, members: &BTreeSet<String>) -> Result<()> {
        self.saves.fetch_add(1, Ordering::Relaxed);
        let mut sets = self.sets.lock();
        if members.is_empty() {
            sets.remove(key);
        } else {
            sets.insert(key.clone(), members.clone());
        }
        Ok(())
    }
}
