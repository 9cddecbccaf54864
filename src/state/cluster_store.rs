// Cluster Identity and Member-Set Cache
//
// `raft-state/cluster-id` pins the 16-byte cluster identity; once
// written it never changes. `raft-state/member-set` caches the latest
// committed member set together with the log index that produced it,
// purely as a startup optimization (it is reconstructible from the
// log).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::common::{ClusterId, LogIndex};
use crate::error::{RaftError, Result};
use crate::membership::MemberSet;
use crate::state::{read_state_file, write_state_file};

pub struct ClusterIdStore {
    path: PathBuf,
}

impl ClusterIdStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: state_dir.into().join("cluster-id"),
        }
    }

    pub fn load(&self) -> Result<Option<ClusterId>> {
        match read_state_file(&self.path)? {
            None => Ok(None),
            Some(bytes) => {
                let raw: [u8; 16] = bytes.as_slice().try_into().map_err(|_| {
                    RaftError::Corruption(format!(
                        "cluster-id record has {} bytes, expected 16",
                        bytes.len()
                    ))
                })?;
                Ok(Some(ClusterId::from_bytes(raw)))
            }
        }
    }

    /// Persist the cluster id. Once bound, rebinding to a different id
    /// is refused.
    pub fn put(&self, id: ClusterId) -> Result<()> {
        if let Some(existing) = self.load()? {
            if existing != id {
                return Err(RaftError::InvalidState(format!(
                    "cluster id already bound to {}",
                    existing
                )));
            }
            return Ok(());
        }
        write_state_file(&self.path, id.as_bytes())
    }
}

/// Cached latest-committed member set.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedMemberSet {
    index: LogIndex,
    set: MemberSet,
}

pub struct MemberSetStore {
    path: PathBuf,
}

impl MemberSetStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: state_dir.into().join("member-set"),
        }
    }

    pub fn load(&self) -> Result<Option<(LogIndex, MemberSet)>> {
        match read_state_file(&self.path)? {
            None => Ok(None),
            Some(bytes) => {
                let (cached, _): (CachedMemberSet, _) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|e| RaftError::Corruption(e.to_string()))?;
                Ok(Some((cached.index, cached.set)))
            }
        }
    }

    pub fn put(&self, index: LogIndex, set: &MemberSet) -> Result<()> {
        let cached = CachedMemberSet {
            index,
            set: set.clone(),
        };
        let bytes = bincode::serde::encode_to_vec(&cached, bincode::config::standard())
            .map_err(|e| RaftError::Serialization(e.to_string()))?;
        write_state_file(&self.path, &bytes)
    }
}
