// Wire Codec
//
// Binary little-endian framing:
//
//   | total_len u32 | msg_type u8 | cluster_id [16] | from [16] | payload |
//
// `total_len` counts everything after itself. Log index fields are
// written as i64; `-1` is accepted on decode as a legacy alias for the
// "before the first entry ever" sentinel and normalizes to 0. Encoders
// never emit `-1`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::common::{ClusterId, LogIndex, MemberId, Term};
use crate::consensus::message::{
    AppendEntriesRequest, AppendEntriesResponse, Envelope, Heartbeat, HeartbeatResponse,
    LogCompactionInfo, NewBatchRequest, NewEntryRequest, PruneRequest, RaftMessage,
    VoteRequest, VoteResponse,
};
use crate::error::{RaftError, Result};
use crate::log::entry::{Command, LogEntry};

/// Frames larger than this are refused on both paths.
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

const ENVELOPE_OVERHEAD: usize = 1 + 16 + 16;

fn put_index(buf: &mut BytesMut, index: LogIndex) {
    buf.put_i64_le(index as i64);
}

fn get_index(buf: &mut impl Buf) -> Result<LogIndex> {
    need(buf, 8)?;
    let raw = buf.get_i64_le();
    if raw < -1 {
        return Err(RaftError::Protocol(format!("invalid log index {}", raw)));
    }
    Ok(raw.max(0) as LogIndex)
}

fn get_term(buf: &mut impl Buf) -> Result<Term> {
    need(buf, 8)?;
    Ok(buf.get_u64_le())
}

/// Terms paired with an index sentinel use all-ones as their own
/// "before the first entry" alias.
fn get_prev_term(buf: &mut impl Buf) -> Result<Term> {
    need(buf, 8)?;
    let raw = buf.get_u64_le();
    Ok(if raw == u64::MAX { 0 } else { raw })
}

fn need(buf: &impl Buf, bytes: usize) -> Result<()> {
    if buf.remaining() < bytes {
        return Err(RaftError::Protocol(format!(
            "frame truncated: need {} more bytes, have {}",
            bytes,
            buf.remaining()
        )));
    }
    Ok(())
}

/// Encode an envelope into one length-prefixed frame.
pub fn encode(envelope: &Envelope) -> Result<BytesMut> {
    let type_code = envelope.message.type_code().ok_or_else(|| {
        RaftError::Protocol(format!(
            "{} is internal and cannot be sent",
            envelope.message.name()
        ))
    })?;

    let mut body = BytesMut::with_capacity(64);
    body.put_u8(type_code);
    body.put_slice(envelope.cluster_id.as_bytes());
    body.put_slice(envelope.from.as_bytes());
    encode_payload(&envelope.message, &mut body)?;

    if body.len() > MAX_MESSAGE_SIZE {
        return Err(RaftError::Protocol(format!(
            "message of {} bytes exceeds limit {}",
            body.len(),
            MAX_MESSAGE_SIZE
        )));
    }

    let mut frame = BytesMut::with_capacity(4 + body.len());
    frame.put_u32_le(body.len() as u32);
    frame.put_slice(&body);
    Ok(frame)
}

fn encode_payload(message: &RaftMessage, buf: &mut BytesMut) -> Result<()> {
    match message {
        RaftMessage::VoteRequest(m) => {
            buf.put_u64_le(m.term);
            buf.put_slice(m.candidate.as_bytes());
            put_index(buf, m.last_log_index);
            buf.put_u64_le(m.last_log_term);
        }
        RaftMessage::VoteResponse(m) => {
            buf.put_u64_le(m.term);
            buf.put_u8(m.granted as u8);
        }
        RaftMessage::AppendRequest(m) => {
            buf.put_u64_le(m.term);
            put_index(buf, m.prev_log_index);
            buf.put_u64_le(m.prev_log_term);
            put_index(buf, m.leader_commit);
            buf.put_u32_le(m.entries.len() as u32);
            for entry in &m.entries {
                entry.encode_into(buf)?;
            }
        }
        RaftMessage::AppendResponse(m) => {
            buf.put_u64_le(m.term);
            buf.put_u8(m.success as u8);
            put_index(buf, m.match_index);
            put_index(buf, m.append_index);
        }
        RaftMessage::Heartbeat(m) => {
            buf.put_u64_le(m.term);
            put_index(buf, m.commit_index);
            buf.put_u64_le(m.commit_term);
        }
        RaftMessage::HeartbeatResponse(HeartbeatResponse) => {}
        RaftMessage::LogCompactionInfo(m) => {
            buf.put_u64_le(m.term);
            put_index(buf, m.prev_index);
        }
        RaftMessage::NewEntry(m) => {
            let payload = m.command.to_bytes()?;
            buf.put_u32_le(payload.len() as u32);
            buf.put_slice(&payload);
        }
        RaftMessage::NewBatch(m) => {
            buf.put_u32_le(m.commands.len() as u32);
            for command in &m.commands {
                let payload = command.to_bytes()?;
                buf.put_u32_le(payload.len() as u32);
                buf.put_slice(&payload);
            }
        }
        RaftMessage::Prune(m) => {
            put_index(buf, m.prune_index);
        }
        RaftMessage::ElectionTimeout | RaftMessage::HeartbeatTimeout => {
            return Err(RaftError::Protocol(
                "timer messages are never encoded".to_string(),
            ));
        }
    }
    Ok(())
}

/// Decode one complete frame (including the length prefix).
pub fn decode(frame: &mut BytesMut) -> Result<Envelope> {
    need(frame, 4)?;
    let total_len = frame.get_u32_le() as usize;
    if total_len > MAX_MESSAGE_SIZE {
        return Err(RaftError::Protocol(format!(
            "message of {} bytes exceeds limit {}",
            total_len, MAX_MESSAGE_SIZE
        )));
    }
    if total_len < ENVELOPE_OVERHEAD {
        return Err(RaftError::Protocol(format!(
            "frame of {} bytes is below the envelope minimum",
            total_len
        )));
    }
    need(frame, total_len)?;
    let mut body: Bytes = frame.split_to(total_len).freeze();

    let type_code = body.get_u8();
    let mut cluster_id = [0u8; 16];
    body.copy_to_slice(&mut cluster_id);
    let mut from = [0u8; 16];
    body.copy_to_slice(&mut from);

    let message = decode_payload(type_code, &mut body)?;
    if body.has_remaining() {
        return Err(RaftError::Protocol(format!(
            "{} trailing bytes after {} payload",
            body.remaining(),
            message.name()
        )));
    }

    Ok(Envelope {
        cluster_id: ClusterId::from_bytes(cluster_id),
        from: MemberId::from_bytes(from),
        message,
    })
}

fn decode_payload(type_code: u8, buf: &mut Bytes) -> Result<RaftMessage> {
    let message = match type_code {
        1 => {
            let term = get_term(buf)?;
            need(buf, 16)?;
            let mut candidate = [0u8; 16];
            buf.copy_to_slice(&mut candidate);
            RaftMessage::VoteRequest(VoteRequest {
                term,
                candidate: MemberId::from_bytes(candidate),
                last_log_index: get_index(buf)?,
                last_log_term: get_term(buf)?,
            })
        }
        2 => {
            let term = get_term(buf)?;
            need(buf, 1)?;
            RaftMessage::VoteResponse(VoteResponse {
                term,
                granted: buf.get_u8() != 0,
            })
        }
        3 => {
            let term = get_term(buf)?;
            let prev_log_index = get_index(buf)?;
            let prev_log_term = get_prev_term(buf)?;
            let leader_commit = get_index(buf)?;
            need(buf, 4)?;
            let count = buf.get_u32_le() as usize;
            let mut entries = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                entries.push(LogEntry::decode_from(buf).map_err(|e| {
                    RaftError::Protocol(format!("bad entry in append request: {}", e))
                })?);
            }
            RaftMessage::AppendRequest(AppendEntriesRequest {
                term,
                prev_log_index,
                prev_log_term,
                leader_commit,
                entries,
            })
        }
        4 => {
            let term = get_term(buf)?;
            need(buf, 1)?;
            let success = buf.get_u8() != 0;
            RaftMessage::AppendResponse(AppendEntriesResponse {
                term,
                success,
                match_index: get_index(buf)?,
                append_index: get_index(buf)?,
            })
        }
        5 => RaftMessage::Heartbeat(Heartbeat {
            term: get_term(buf)?,
            commit_index: get_index(buf)?,
            commit_term: get_term(buf)?,
        }),
        6 => RaftMessage::HeartbeatResponse(HeartbeatResponse),
        7 => RaftMessage::LogCompactionInfo(LogCompactionInfo {
            term: get_term(buf)?,
            prev_index: get_index(buf)?,
        }),
        8 => {
            need(buf, 4)?;
            let len = buf.get_u32_le() as usize;
            need(buf, len)?;
            let mut payload = vec![0u8; len];
            buf.copy_to_slice(&mut payload);
            RaftMessage::NewEntry(NewEntryRequest {
                command: Command::from_bytes(&payload)
                    .map_err(|e| RaftError::Protocol(e.to_string()))?,
            })
        }
        9 => {
            need(buf, 4)?;
            let count = buf.get_u32_le() as usize;
            let mut commands = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                need(buf, 4)?;
                let len = buf.get_u32_le() as usize;
                need(buf, len)?;
                let mut payload = vec![0u8; len];
                buf.copy_to_slice(&mut payload);
                commands.push(
                    Command::from_bytes(&payload)
                        .map_err(|e| RaftError::Protocol(e.to_string()))?,
                );
            }
            RaftMessage::NewBatch(NewBatchRequest { commands })
        }
        10 => RaftMessage::Prune(PruneRequest {
            prune_index: get_index(buf)?,
        }),
        other => {
            return Err(RaftError::Protocol(format!(
                "unknown message type {}",
                other
            )));
        }
    };
    Ok(message)
}
