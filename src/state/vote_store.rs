// Durable Vote Record
//
// `raft-state/vote` holds `(term u64, voted_for [16])` little-endian.
// An all-ones member field is the "no vote" sentinel. The record is
// rewritten atomically with any term change so the pair can never
// disagree after a crash.

use std::path::PathBuf;

use crate::common::{MemberId, Term};
use crate::error::{RaftError, Result};
use crate::state::{read_state_file, write_state_file};

const NO_VOTE_SENTINEL: [u8; 16] = [0xFF; 16];

pub struct VoteStore {
    path: PathBuf,
}

impl VoteStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: state_dir.into().join("vote"),
        }
    }

    /// Load the persisted `(term, vote)`; `(0, None)` if never written.
    pub fn load(&self) -> Result<(Term, Option<MemberId>)> {
        match read_state_file(&self.path)? {
            None => Ok((0, None)),
            Some(bytes) => {
                if bytes.len() != 24 {
                    return Err(RaftError::Corruption(format!(
                        "vote record has {} bytes, expected 24",
                        bytes.len()
                    )));
                }
                let term = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
                let member: [u8; 16] = bytes[8..24].try_into().unwrap();
                let vote = if member == NO_VOTE_SENTINEL {
                    None
                } else {
                    Some(MemberId::from_bytes(member))
                };
                Ok((term, vote))
            }
        }
    }

    /// Durably record the vote cast in `term` (or the absence of one).
    pub fn put(&self, term: Term, vote: Option<MemberId>) -> Result<()> {
        let mut record = [0u8; 24];
        record[0..8].copy_from_slice(&term.to_le_bytes());
        match vote {
            Some(member) => record[8..24].copy_from_slice(member.as_bytes()),
            None => record[8..24].copy_from_slice(&NO_VOTE_SENTINEL),
        }
        write_state_file(&self.path, &record)
    }
}
