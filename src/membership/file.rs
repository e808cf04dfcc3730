//! File-backed membership store.
//!
//! One file per membership key, named by the key digest:
//!
//! ```text
//! <root>/
//! ├── LOCK                 # exclusive lock held while the store is open
//! ├── 3f1a...c2.members    # one framed record per key
//! └── ...
//! ```
//!
//! Record framing: magic, version byte, payload length (u32 LE), msgpack
//! payload, CRC32 of the payload (u32 LE). Writes go to a temp file that is
//! renamed over the old one, so a crash leaves either the old or the new set.

use super::{MembershipKey, MembershipStore};
use crate::error::{BackplaneError, Result};
use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const RECORD_MAGIC: &[u8; 4] = b"BPMS";
const RECORD_VERSION: u8 = 1;
const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

#[derive(Serialize, Deserialize)]
struct MembershipRecord {
    key: MembershipKey,
    members: BTreeSet<String>,
}

/// Membership store writing one file per key under a directory.
pub struct FileMembershipStore {
    root: PathBuf,
    _lock_file: File,
}

impl FileMembershipStore {
    /// Open (or create) a store directory, taking its exclusive lock.
    ///
    /// Fails with [`BackplaneError::Locked`] if another process holds it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let lock_file = Self::acquire_lock(&root)?;
        debug!(path = %root.display(), "opened membership store");
        Ok(Self {
            root,
            _lock_file: lock_file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    fn acquire_lock(root: &Path) -> Result<File> {
        let lock_file = File::create(root.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| BackplaneError::Locked)?;
        Ok(lock_file)
    }

    fn record_path(root: &Path, key: &MembershipKey) -> PathBuf {
        root.join(format!("{}.members", key.digest()))
    }

    fn read_record(path: &Path, key: &MembershipKey) -> Result<BTreeSet<String>> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(e.into()),
        };

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != RECORD_MAGIC {
            return Err(BackplaneError::Corruption(format!(
                "{}: bad magic",
                path.display()
            )));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != RECORD_VERSION {
            return Err(BackplaneError::Corruption(format!(
                "{}: unsupported version {}",
                path.display(),
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_RECORD_LEN {
            return Err(BackplaneError::Corruption(format!(
                "{}: record too large ({len} bytes)",
                path.display()
            )));
        }

        let mut encoded = vec![0u8; len];
        file.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let expected = u32::from_le_bytes(checksum_bytes);
        let got = crc32fast::hash(&encoded);
        if expected != got {
            return Err(BackplaneError::ChecksumMismatch { expected, got });
        }

        let record: MembershipRecord = rmp_serde::from_slice(&encoded)?;
        if &record.key != key {
            return Err(BackplaneError::Corruption(format!(
                "{}: holds {:?}, expected {:?}",
                path.display(),
                record.key,
                key
            )));
        }
        Ok(record.members)
    }

    fn write_record(path: &Path, record: &MembershipRecord) -> Result<()> {
        if record.members.is_empty() {
            return match fs::remove_file(path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            };
        }

        let encoded = rmp_serde::to_vec(record)?;
        let tmp_path = path.with_extension("members.tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(RECORD_MAGIC)?;
            file.write_all(&[RECORD_VERSION])?;
            file.write_all(&(encoded.len() as u32).to_le_bytes())?;
            file.write_all(&encoded)?;
            file.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

#[async_trait]
impl MembershipStore for FileMembershipStore {
    async fn load(&self, key: &MembershipKey) -> Result<BTreeSet<String>> {
        let path = Self::record_path(&self.root, key);
        let key = key.clone();
        tokio::task::spawn_blocking(move || Self::read_record(&path, &key))
            .await
            .map_err(|e| BackplaneError::Storage(e.to_string()))?
    }

    async fn save(&self, key: &MembershipKey, members: &BTreeSet<String>) -> Result<()> {
        let path = Self::record_path(&self.root, key);
        let record = MembershipRecord {
            key: key.clone(),
            members: members.clone(),
        };
        tokio::task::spawn_blocking(move || Self::write_record(&path, &record))
            .await
            .map_err(|e| BackplaneError::Storage(e.to_string()))?
    }
}
