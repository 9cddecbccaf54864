// Durable State Records
//
// Small single-record files under `raft-state/`: the current term, the
// vote within that term, the immutable cluster id, and a cache of the
// latest committed member set. Every write goes through a temp file
// with fsync and an atomic rename.

pub mod cluster_store;
pub mod term_store;
pub mod vote_store;

pub use cluster_store::{ClusterIdStore, MemberSetStore};
pub use term_store::TermStore;
pub use vote_store::VoteStore;

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::{RaftError, Result};

/// Write a state file atomically using temp file + fsync + rename.
pub(crate) fn write_state_file(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| RaftError::InvalidState(format!("invalid state path: {:?}", path)))?;
    fs::create_dir_all(parent)?;

    let temp_path = parent.join(format!(
        ".{}.tmp.{}",
        path.file_name().unwrap_or_default().to_string_lossy(),
        std::process::id()
    ));

    let mut file = fs::File::create(&temp_path)?;
    file.write_all(content)?;
    file.sync_all()?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Read a state file in full; None if it does not exist yet.
pub(crate) fn read_state_file(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
