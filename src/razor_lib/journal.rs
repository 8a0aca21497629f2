/// Append-only write-ahead journal.
///
/// Every mutating operation appends one checksummed record before the
/// in-memory state is considered durable. A reader stops at the first
/// record that fails validation, which is exactly the truncation point a
/// crash mid-append leaves behind.
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use log::{debug, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::razor_lib::crc::Crc32;
use crate::razor_lib::errors::{FsError, FsResult};
use crate::razor_lib::utils::{deserialize_row, now_millis, serialize_row};

pub const JOURNAL_MAGIC: u32 = 0x72617A72;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum JournalEntryType {
    CreateFile = 1,
    DeleteFile = 2,
    WriteData = 3,
    CreateDir = 4,
    DeleteDir = 5,
    Rename = 6,
    Checkpoint = 7,
}

#[repr(C, packed)]
struct JournalRecordHeader {
    magic: u32,
    rtype: u8,
    reserved: [u8; 3],
    timestamp: u64,
    inode: u64,
    data_size: u32,
    crc32: u32,
}

const HEADER_SIZE: usize = size_of::<JournalRecordHeader>();
const _: () = assert!(HEADER_SIZE == 32);
/// Checksummed prefix: everything before the crc32 field.
const HEADER_CRC_SPAN: usize = HEADER_SIZE - 4;

/// A parsed, bounds-validated journal mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalOp {
    CreateFile { path: String, content: Vec<u8> },
    DeleteFile,
    WriteData { content: Vec<u8> },
    CreateDir { path: String },
    DeleteDir,
    Rename { old_path: String, new_path: String },
    Checkpoint,
}

fn parse_path(bytes: &[u8]) -> FsResult<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| FsError::Corruption("non-UTF-8 path in journal record".into()))
}

impl JournalOp {
    /// Decode a record payload according to its type byte. Each variant
    /// fully validates its own bounds before any state is touched.
    pub fn parse(rtype: JournalEntryType, payload: &[u8]) -> FsResult<JournalOp> {
        match rtype {
            JournalEntryType::CreateFile => {
                let sep = payload
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or_else(|| FsError::Corruption("create record lacks separator".into()))?;
                Ok(JournalOp::CreateFile {
                    path: parse_path(&payload[..sep])?,
                    content: payload[sep + 1..].to_vec(),
                })
            }
            JournalEntryType::CreateDir => {
                let end = payload
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(payload.len());
                Ok(JournalOp::CreateDir {
                    path: parse_path(&payload[..end])?,
                })
            }
            JournalEntryType::DeleteFile => Ok(JournalOp::DeleteFile),
            JournalEntryType::DeleteDir => Ok(JournalOp::DeleteDir),
            JournalEntryType::WriteData => Ok(JournalOp::WriteData {
                content: payload.to_vec(),
            }),
            JournalEntryType::Rename => {
                let sep = payload
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or_else(|| FsError::Corruption("rename record lacks separator".into()))?;
                let old_path = parse_path(&payload[..sep])?;
                let new_path = parse_path(&payload[sep + 1..])?;
                if old_path.is_empty() || new_path.is_empty() {
                    return Err(FsError::Corruption("rename record with empty path".into()));
                }
                Ok(JournalOp::Rename { old_path, new_path })
            }
            JournalEntryType::Checkpoint => Ok(JournalOp::Checkpoint),
        }
    }

    pub fn encode(&self) -> (JournalEntryType, Vec<u8>) {
        match self {
            JournalOp::CreateFile { path, content } => {
                let mut payload = path.as_bytes().to_vec();
                payload.push(0);
                payload.extend_from_slice(content);
                (JournalEntryType::CreateFile, payload)
            }
            JournalOp::CreateDir { path } => {
                let mut payload = path.as_bytes().to_vec();
                payload.push(0);
                (JournalEntryType::CreateDir, payload)
            }
            JournalOp::DeleteFile => (JournalEntryType::DeleteFile, Vec::new()),
            JournalOp::DeleteDir => (JournalEntryType::DeleteDir, Vec::new()),
            JournalOp::WriteData { content } => (JournalEntryType::WriteData, content.clone()),
            JournalOp::Rename { old_path, new_path } => {
                let mut payload = old_path.as_bytes().to_vec();
                payload.push(0);
                payload.extend_from_slice(new_path.as_bytes());
                (JournalEntryType::Rename, payload)
            }
            JournalOp::Checkpoint => (JournalEntryType::Checkpoint, Vec::new()),
        }
    }
}

pub struct Journal {
    path: PathBuf,
    file: Mutex<Option<File>>,
    sequence: AtomicU64,
}

impl Journal {
    /// Open (creating if absent) the journal in append mode.
    pub fn open(path: &Path) -> FsResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(Some(file)),
            sequence: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record: header, then payload, then flush to disk.
    pub fn append(&self, rtype: JournalEntryType, inode: u64, payload: &[u8]) -> FsResult<()> {
        let mut guard = self.file.lock().unwrap();
        let file = guard
            .as_mut()
            .ok_or_else(|| FsError::Io("journal is closed".into()))?;

        let mut header = JournalRecordHeader {
            magic: JOURNAL_MAGIC,
            rtype: rtype.into(),
            reserved: [0; 3],
            timestamp: now_millis(),
            inode,
            data_size: payload.len() as u32,
            crc32: 0,
        };
        let mut crc = Crc32::new();
        crc.update(&unsafe { serialize_row(&header) }[..HEADER_CRC_SPAN]);
        crc.update(payload);
        header.crc32 = crc.finish();

        file.write_all(unsafe { serialize_row(&header) })?;
        file.write_all(payload)?;
        file.sync_data()?;
        self.sequence.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn append_op(&self, inode: u64, op: &JournalOp) -> FsResult<()> {
        let (rtype, payload) = op.encode();
        self.append(rtype, inode, &payload)
    }

    /// Read the journal from the start, delivering each valid record.
    ///
    /// Replay stops quietly at the first invalid magic, short read, unknown
    /// type, or checksum failure: that prefix is all a crash left behind.
    /// Returns the number of records delivered.
    pub fn replay(
        &self,
        mut callback: impl FnMut(JournalEntryType, u64, &[u8]) -> FsResult<()>,
    ) -> FsResult<usize> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            // A missing journal means there is simply nothing to replay.
            Err(_) => return Ok(0),
        };
        let mut applied = 0usize;
        let mut header_buf = [0u8; HEADER_SIZE];
        loop {
            match file.read_exact(&mut header_buf) {
                Ok(()) => {}
                Err(_) => break,
            }
            let header: JournalRecordHeader = unsafe { deserialize_row(&header_buf) };
            if header.magic != JOURNAL_MAGIC {
                warn!("journal replay stopped: bad record magic");
                break;
            }
            let rtype = match JournalEntryType::try_from(header.rtype) {
                Ok(t) => t,
                Err(_) => {
                    warn!("journal replay stopped: unknown record type {}", header.rtype);
                    break;
                }
            };
            let data_size = header.data_size as usize;
            let mut payload = vec![0u8; data_size];
            if file.read_exact(&mut payload).is_err() {
                warn!("journal replay stopped: truncated payload");
                break;
            }
            let mut crc = Crc32::new();
            crc.update(&header_buf[..HEADER_CRC_SPAN]);
            crc.update(&payload);
            let stored = header.crc32;
            if crc.finish() != stored {
                warn!("journal replay stopped: record checksum mismatch");
                break;
            }
            callback(rtype, header.inode, &payload)?;
            applied += 1;
        }
        debug!("journal replay applied {} records", applied);
        Ok(applied)
    }

    /// Mark the on-disk image as covering all prior records.
    pub fn checkpoint(&self) -> FsResult<()> {
        self.append(JournalEntryType::Checkpoint, 0, &[])
    }

    /// Drop every record and start over with an empty log.
    pub fn truncate(&self) -> FsResult<()> {
        let mut guard = self.file.lock().unwrap();
        *guard = None;
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        *guard = Some(OpenOptions::new().create(true).append(true).open(&self.path)?);
        Ok(())
    }

    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::fs;

    fn temp_journal(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("razorfs-jnl-{}-{}", std::process::id(), name))
    }

    fn collect(journal: &Journal) -> Vec<(JournalEntryType, u64, Vec<u8>)> {
        let mut out = Vec::new();
        journal
            .replay(|t, ino, payload| {
                out.push((t, ino, payload.to_vec()));
                Ok(())
            })
            .unwrap();
        out
    }

    #[test]
    fn append_replay_round_trip() -> Result<()> {
        let path = temp_journal("round-trip");
        let _ = fs::remove_file(&path);
        let journal = Journal::open(&path).map_err(|e| anyhow::anyhow!("{}", e))?;
        journal
            .append_op(
                5,
                &JournalOp::CreateFile {
                    path: "/a".into(),
                    content: b"hello".to_vec(),
                },
            )
            .unwrap();
        journal
            .append_op(5, &JournalOp::WriteData { content: b"world".to_vec() })
            .unwrap();
        journal.append_op(5, &JournalOp::DeleteFile).unwrap();

        let records = collect(&journal);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].0, JournalEntryType::CreateFile);
        assert_eq!(records[0].1, 5);
        assert_eq!(
            JournalOp::parse(records[0].0, &records[0].2).unwrap(),
            JournalOp::CreateFile {
                path: "/a".into(),
                content: b"hello".to_vec()
            }
        );
        assert_eq!(records[2].0, JournalEntryType::DeleteFile);
        fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn truncated_tail_is_discarded() -> Result<()> {
        let path = temp_journal("truncated");
        let _ = fs::remove_file(&path);
        let journal = Journal::open(&path).map_err(|e| anyhow::anyhow!("{}", e))?;
        journal
            .append_op(1, &JournalOp::WriteData { content: b"keep".to_vec() })
            .unwrap();
        journal
            .append_op(2, &JournalOp::WriteData { content: b"lost".to_vec() })
            .unwrap();
        // Chop the last record mid-payload, as a crash would.
        let bytes = fs::read(&path)?;
        fs::write(&path, &bytes[..bytes.len() - 2])?;

        let records = collect(&journal);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].1, 1);
        fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn corrupted_record_aborts_replay() -> Result<()> {
        let path = temp_journal("corrupt");
        let _ = fs::remove_file(&path);
        let journal = Journal::open(&path).map_err(|e| anyhow::anyhow!("{}", e))?;
        journal
            .append_op(1, &JournalOp::WriteData { content: b"first".to_vec() })
            .unwrap();
        journal
            .append_op(2, &JournalOp::WriteData { content: b"second".to_vec() })
            .unwrap();
        journal
            .append_op(3, &JournalOp::WriteData { content: b"third".to_vec() })
            .unwrap();
        // Flip one payload byte of the second record.
        let mut bytes = fs::read(&path)?;
        let second_payload = HEADER_SIZE + 5 + HEADER_SIZE;
        bytes[second_payload] ^= 0xFF;
        fs::write(&path, &bytes)?;

        // The corrupted record and everything after it are dropped.
        let records = collect(&journal);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].1, 1);
        fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn truncate_empties_the_log() -> Result<()> {
        let path = temp_journal("truncate");
        let _ = fs::remove_file(&path);
        let journal = Journal::open(&path).map_err(|e| anyhow::anyhow!("{}", e))?;
        journal.append_op(1, &JournalOp::DeleteFile).unwrap();
        journal.checkpoint().unwrap();
        assert_eq!(collect(&journal).len(), 2);
        journal.truncate().unwrap();
        assert_eq!(collect(&journal).len(), 0);
        // Still usable after truncation.
        journal.append_op(2, &JournalOp::DeleteDir).unwrap();
        assert_eq!(collect(&journal).len(), 1);
        fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn rename_payload_round_trip() {
        let op = JournalOp::Rename {
            old_path: "/a/b".into(),
            new_path: "/c".into(),
        };
        let (rtype, payload) = op.encode();
        assert_eq!(JournalOp::parse(rtype, &payload).unwrap(), op);
        assert!(matches!(
            JournalOp::parse(JournalEntryType::Rename, b"no-separator"),
            Err(FsError::Corruption(_))
        ));
    }
}
