// Durable Current-Term Record
//
// `raft-state/current-term` holds the highest term this member has
// seen, as a little-endian u64. The write is fsynced before any
// message advertising the new term leaves the node.

use std::path::PathBuf;

use crate::common::Term;
use crate::error::{RaftError, Result};
use crate::state::{read_state_file, write_state_file};

pub struct TermStore {
    path: PathBuf,
}

impl TermStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: state_dir.into().join("current-term"),
        }
    }

    /// Load the persisted term; 0 if never written.
    pub fn load(&self) -> Result<Term> {
        match read_state_file(&self.path)? {
            None => Ok(0),
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    RaftError::Corruption(format!(
                        "current-term record has {} bytes, expected 8",
                        bytes.len()
                    ))
                })?;
                Ok(u64::from_le_bytes(raw))
            }
        }
    }

    /// Durably record `term`.
    pub fn put(&self, term: Term) -> Result<()> {
        write_state_file(&self.path, &term.to_le_bytes())
    }
}
