// Log Entries and Commands
//
// An entry pairs the term it was created in with an opaque command.
// The command encoding is owned by the consensus core: a one-byte tag
// distinguishes the leader's no-op barrier, application payloads, and
// log-embedded member sets. On the wire and on disk an entry is always
// framed as `term u64 | payload_len u32 | payload` (little-endian).

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::common::Term;
use crate::error::{RaftError, Result};
use crate::membership::MemberSet;

const TAG_NOOP: u8 = 0;
const TAG_PAYLOAD: u8 = 1;
const TAG_MEMBER_SET: u8 = 2;

/// A replicated command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Barrier appended by a fresh leader so prior-term entries can
    /// commit under the current-term rule.
    NoOp,

    /// Opaque application payload.
    Payload(Vec<u8>),

    /// Membership change.
    MemberSet(MemberSet),
}

impl Command {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Command::NoOp => Ok(vec![TAG_NOOP]),
            Command::Payload(data) => {
                let mut out = Vec::with_capacity(1 + data.len());
                out.push(TAG_PAYLOAD);
                out.extend_from_slice(data);
                Ok(out)
            }
            Command::MemberSet(set) => {
                let encoded = set.to_bytes()?;
                let mut out = Vec::with_capacity(1 + encoded.len());
                out.push(TAG_MEMBER_SET);
                out.extend_from_slice(&encoded);
                Ok(out)
            }
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (tag, rest) = bytes
            .split_first()
            .ok_or_else(|| RaftError::Corruption("empty command payload".to_string()))?;
        match *tag {
            TAG_NOOP => Ok(Command::NoOp),
            TAG_PAYLOAD => Ok(Command::Payload(rest.to_vec())),
            TAG_MEMBER_SET => Ok(Command::MemberSet(MemberSet::from_bytes(rest)?)),
            other => Err(RaftError::Corruption(format!(
                "unknown command tag {}",
                other
            ))),
        }
    }

    /// Size of the framed command payload in bytes.
    pub fn payload_size(&self) -> usize {
        match self {
            Command::NoOp => 1,
            Command::Payload(data) => 1 + data.len(),
            // Member sets are tiny; the exact size only matters for
            // batch budgeting, where the encoded form is used anyway.
            Command::MemberSet(set) => 1 + 16 * set.len() + 8,
        }
    }
}

/// One entry of the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term in which the leader created this entry.
    pub term: Term,

    /// The replicated command.
    pub command: Command,
}

impl LogEntry {
    pub fn new(term: Term, command: Command) -> Self {
        Self { term, command }
    }

    pub fn noop(term: Term) -> Self {
        Self::new(term, Command::NoOp)
    }

    /// Encode as `term u64 | payload_len u32 | payload`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        let payload = self.command.to_bytes()?;
        buf.put_u64_le(self.term);
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(&payload);
        Ok(())
    }

    /// Decode from the framing written by [`encode_into`].
    ///
    /// [`encode_into`]: LogEntry::encode_into
    pub fn decode_from(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < 12 {
            return Err(RaftError::Corruption(
                "truncated entry frame".to_string(),
            ));
        }
        let term = buf.get_u64_le();
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len {
            return Err(RaftError::Corruption(format!(
                "entry payload truncated: need {}, have {}",
                len,
                buf.remaining()
            )));
        }
        let mut payload = vec![0u8; len];
        buf.copy_to_slice(&mut payload);
        Ok(Self {
            term,
            command: Command::from_bytes(&payload)?,
        })
    }

    /// Framed size: 8 (term) + 4 (length) + payload.
    pub fn frame_size(&self) -> usize {
        12 + self.command.payload_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::MemberId;

    #[test]
    fn test_command_roundtrip() {
        let commands = vec![
            Command::NoOp,
            Command::Payload(vec![]),
            Command::Payload(b"create-node".to_vec()),
            Command::MemberSet(MemberSet::new([MemberId::random(), MemberId::random()])),
        ];
        for command in commands {
            let bytes = command.to_bytes().unwrap();
            assert_eq!(Command::from_bytes(&bytes).unwrap(), command);
        }
    }

    #[test]
    fn test_entry_frame_roundtrip() {
        let entry = LogEntry::new(7, Command::Payload(b"set x = 1".to_vec()));
        let mut buf = BytesMut::new();
        entry.encode_into(&mut buf).unwrap();

        let mut cursor = buf.freeze();
        let decoded = LogEntry::decode_from(&mut cursor).unwrap();
        assert_eq!(decoded, entry);
        assert!(!cursor.has_remaining());
    }

    #[test]
    fn test_decode_rejects_truncated_frame() {
        let entry = LogEntry::new(3, Command::Payload(vec![1, 2, 3, 4]));
        let mut buf = BytesMut::new();
        entry.encode_into(&mut buf).unwrap();
        buf.truncate(buf.len() - 2);

        let mut cursor = buf.freeze();
        assert!(LogEntry::decode_from(&mut cursor).is_err());
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert!(Command::from_bytes(&[9, 1, 2]).is_err());
        assert!(Command::from_bytes(&[]).is_err());
    }
}
