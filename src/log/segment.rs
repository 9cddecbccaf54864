// Log Segment Files
//
// One segment holds a contiguous run of log entries in a file named
// `v<N>.seg`. Layout (little-endian):
//
//   header:  prev_index i64 | prev_term u64 | version u64 | magic u32
//   record:  payload_len u32 | term u64 | payload | crc32c u32
//
// The checksum covers the term and payload bytes. Appends are fsynced
// before returning. Opening a segment walks every record; a trailing
// torn or corrupt record truncates the file back to the last good one.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::common::{LogIndex, Term};
use crate::error::{RaftError, Result};
use crate::log::entry::{Command, LogEntry};

const SEGMENT_MAGIC: u32 = 0x5246_5447; // "RFTG"
const HEADER_SIZE: u64 = 8 + 8 + 8 + 4;
const RECORD_OVERHEAD: u64 = 4 + 8 + 4;

/// Fixed header of a segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Index of the entry immediately before this segment's first.
    pub prev_index: LogIndex,

    /// Term of that entry.
    pub prev_term: Term,

    /// Monotonic segment version, also encoded in the file name.
    pub version: u64,
}

impl SegmentHeader {
    fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut out = [0u8; HEADER_SIZE as usize];
        out[0..8].copy_from_slice(&(self.prev_index as i64).to_le_bytes());
        out[8..16].copy_from_slice(&self.prev_term.to_le_bytes());
        out[16..24].copy_from_slice(&self.version.to_le_bytes());
        out[24..28].copy_from_slice(&SEGMENT_MAGIC.to_le_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE as usize {
            return Err(RaftError::Corruption(
                "segment header truncated".to_string(),
            ));
        }
        let magic = u32::from_le_bytes(bytes[24..28].try_into().unwrap());
        if magic != SEGMENT_MAGIC {
            return Err(RaftError::Corruption(format!(
                "bad segment magic {:#010x}",
                magic
            )));
        }
        let raw_prev = i64::from_le_bytes(bytes[0..8].try_into().unwrap());
        // -1 is the legacy "before the first entry ever" sentinel.
        let prev_index = if raw_prev < 0 { 0 } else { raw_prev as LogIndex };
        Ok(Self {
            prev_index,
            prev_term: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            version: u64::from_le_bytes(bytes[16..24].try_into().unwrap()),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct RecordMeta {
    offset: u64,
    term: Term,
}

/// An open segment file with its in-memory record table.
pub struct Segment {
    path: PathBuf,
    file: Mutex<File>,
    header: SegmentHeader,
    records: Vec<RecordMeta>,
    size_bytes: u64,
}

/// File name for a segment version, `v<N>.seg`.
pub fn segment_file_name(version: u64) -> String {
    format!("v{}.seg", version)
}

/// Parse the version out of a segment file name.
pub fn parse_segment_version(name: &str) -> Option<u64> {
    name.strip_prefix('v')?.strip_suffix(".seg")?.parse().ok()
}

impl Segment {
    /// Create a fresh, empty segment and fsync its header.
    pub fn create(
        dir: &Path,
        version: u64,
        prev_index: LogIndex,
        prev_term: Term,
    ) -> Result<Self> {
        let path = dir.join(segment_file_name(version));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        let header = SegmentHeader {
            prev_index,
            prev_term,
            version,
        };
        file.write_all(&header.encode())?;
        file.sync_all()?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            header,
            records: Vec::new(),
            size_bytes: HEADER_SIZE,
        })
    }

    /// Open an existing segment, walking and checksumming every record.
    ///
    /// A torn or corrupt tail is truncated back to the last good record
    /// and reported through the returned flag.
    pub fn open(path: &Path) -> Result<(Self, bool)> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;

        let header = SegmentHeader::decode(&contents)?;
        let mut records = Vec::new();
        let mut offset = HEADER_SIZE as usize;
        let mut good_end = offset;

        while offset < contents.len() {
            match Self::scan_record(&contents, offset) {
                Some((term, next_offset)) => {
                    records.push(RecordMeta {
                        offset: offset as u64,
                        term,
                    });
                    offset = next_offset;
                    good_end = next_offset;
                }
                None => break,
            }
        }

        let truncated = good_end < contents.len();
        if truncated {
            tracing::warn!(
                path = %path.display(),
                discarded_bytes = contents.len() - good_end,
                "truncating torn tail of log segment"
            );
            file.set_len(good_end as u64)?;
            file.sync_all()?;
        }

        Ok((
            Self {
                path: path.to_path_buf(),
                file: Mutex::new(file),
                header,
                records,
                size_bytes: good_end as u64,
            },
            truncated,
        ))
    }

    /// Validate one record at `offset`; returns its term and the offset
    /// just past it, or None for a torn/corrupt record.
    fn scan_record(contents: &[u8], offset: usize) -> Option<(Term, usize)> {
        if contents.len() - offset < RECORD_OVERHEAD as usize {
            return None;
        }
        let payload_len =
            u32::from_le_bytes(contents[offset..offset + 4].try_into().unwrap()) as usize;
        let term_start = offset + 4;
        let payload_start = term_start + 8;
        let crc_start = payload_start + payload_len;
        let next_offset = crc_start + 4;
        if next_offset > contents.len() {
            return None;
        }
        let term = u64::from_le_bytes(contents[term_start..payload_start].try_into().unwrap());
        let stored_crc =
            u32::from_le_bytes(contents[crc_start..next_offset].try_into().unwrap());
        let computed = crc32c::crc32c(&contents[term_start..crc_start]);
        if stored_crc != computed {
            return None;
        }
        Some((term, next_offset))
    }

    /// Append entries at the end of the segment and fsync.
    pub fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        let mut buf = Vec::new();
        let mut metas = Vec::with_capacity(entries.len());
        let mut offset = self.size_bytes;

        for entry in entries {
            let payload = entry.command.to_bytes()?;
            let record_len = RECORD_OVERHEAD + payload.len() as u64;

            buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            let checksummed_start = buf.len();
            buf.extend_from_slice(&entry.term.to_le_bytes());
            buf.extend_from_slice(&payload);
            let crc = crc32c::crc32c(&buf[checksummed_start..]);
            buf.extend_from_slice(&crc.to_le_bytes());

            metas.push(RecordMeta {
                offset,
                term: entry.term,
            });
            offset += record_len;
        }

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.size_bytes))?;
        file.write_all(&buf)?;
        file.sync_data()?;
        drop(file);

        self.records.extend(metas);
        self.size_bytes = offset;
        Ok(())
    }

    /// Read the entry at `index`.
    pub fn read(&self, index: LogIndex) -> Result<LogEntry> {
        let meta = self.meta_at(index)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(meta.offset))?;

        let mut len_buf = [0u8; 4];
        file.read_exact(&mut len_buf)?;
        let payload_len = u32::from_le_bytes(len_buf) as usize;

        let mut body = vec![0u8; 8 + payload_len];
        file.read_exact(&mut body)?;
        drop(file);

        let term = u64::from_le_bytes(body[0..8].try_into().unwrap());
        if term != meta.term {
            return Err(RaftError::Corruption(format!(
                "segment record term changed under us at index {}",
                index
            )));
        }
        let command = Command::from_bytes(&body[8..])?;
        Ok(LogEntry::new(term, command))
    }

    /// Term of the entry at `index`, if this segment holds it.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index <= self.header.prev_index || index > self.last_index() {
            return None;
        }
        let pos = (index - self.header.prev_index - 1) as usize;
        self.records.get(pos).map(|meta| meta.term)
    }

    /// Discard all records at `index` and above.
    pub fn truncate_from(&mut self, index: LogIndex) -> Result<()> {
        let meta = self.meta_at(index)?;
        let mut file = self.file.lock();
        file.set_len(meta.offset)?;
        file.sync_all()?;
        drop(file);

        let keep = (index - self.header.prev_index - 1) as usize;
        self.records.truncate(keep);
        self.size_bytes = meta.offset;
        Ok(())
    }

    fn meta_at(&self, index: LogIndex) -> Result<RecordMeta> {
        if index <= self.header.prev_index || index > self.last_index() {
            return Err(RaftError::OutOfRange {
                index,
                low: self.header.prev_index,
                high: self.last_index(),
            });
        }
        let pos = (index - self.header.prev_index - 1) as usize;
        Ok(self.records[pos])
    }

    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    pub fn first_index(&self) -> LogIndex {
        self.header.prev_index + 1
    }

    pub fn last_index(&self) -> LogIndex {
        self.header.prev_index + self.records.len() as LogIndex
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn entry_count(&self) -> usize {
        self.records.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the backing file. Consumes the segment.
    pub fn delete(self) -> Result<()> {
        drop(self.file);
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}
