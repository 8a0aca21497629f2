/// Binary image reader/writer and the save/load/recovery driver.
///
/// An image is header + string table + inode entries + data section, every
/// part covered by CRC-32. Saves always go through a fully checksummed
/// temporary renamed over the target, so the previous image survives any
/// crash mid-save. The journal (same path + ".journal") carries mutations
/// made since the last checkpoint.
use std::fs;
use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::razor_lib::crc::{crc32, Crc32};
use crate::razor_lib::errors::{FsError, FsResult};
use crate::razor_lib::inode::{S_IFDIR, S_IFMT};
use crate::razor_lib::journal::Journal;
use crate::razor_lib::strings::StringTable;
use crate::razor_lib::utils::{deserialize_row, now_millis, serialize_row};

pub const RAZORFS_MAGIC: u32 = 0x72617A72; // "razr"
pub const RAZORFS_VERSION_MAJOR: u16 = 1;
pub const RAZORFS_VERSION_MINOR: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceMode {
    /// Every save writes the image before returning.
    Synchronous,
    /// Saves are queued for a background worker.
    Asynchronous,
    /// Only the journal is written; the image waits for a checkpoint.
    JournalOnly,
}

#[repr(C, packed)]
struct FileHeader {
    magic: u32,
    version_major: u16,
    version_minor: u16,
    header_crc: u32,
    timestamp: u64,
    next_inode: u64,
    string_table_offset: u32,
    string_table_size: u32,
    inode_table_offset: u32,
    inode_table_size: u32,
    data_section_offset: u32,
    data_section_size: u32,
    /// Unused in the image file; the journal lives beside it.
    journal_offset: u32,
    journal_size: u32,
    file_crc: u32,
    reserved: [u8; 32],
}

const HEADER_SIZE: usize = size_of::<FileHeader>();
const _: () = assert!(HEADER_SIZE == 96);

#[repr(C, packed)]
struct InodeEntryRec {
    inode_number: u64,
    parent_inode: u64,
    name_offset: u32,
    mode: u16,
    flags: u16,
    size: u64,
    timestamp: u64,
    data_offset: u32,
    data_size: u32,
    entry_crc32: u32,
}

const ENTRY_SIZE: usize = size_of::<InodeEntryRec>();
const _: () = assert!(ENTRY_SIZE == 52);

/// Header CRC covers the header minus its two CRC fields.
fn header_crc(bytes: &[u8]) -> u32 {
    let mut crc = Crc32::new();
    crc.update(&bytes[..8]); // magic + version
    crc.update(&bytes[12..60]); // timestamp .. journal sections
    crc.update(&bytes[64..HEADER_SIZE]); // reserved
    crc.finish()
}

/// One live name for the image, collected from the tree at save time.
#[derive(Debug, Clone)]
pub struct SaveEntry {
    pub ino: u64,
    pub path: String,
    pub mode: u16,
    pub size: u64,
    /// File bytes; `None` for directories.
    pub content: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct LoadedEntry {
    pub ino: u64,
    pub path: String,
    pub mode: u16,
    pub content: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct LoadedImage {
    pub next_inode: u64,
    pub entries: Vec<LoadedEntry>,
}

/// Serialize a whole image into one buffer, CRCs included.
pub fn build_image(next_inode: u64, entries: &[SaveEntry]) -> FsResult<Vec<u8>> {
    // Fresh string table per save: the image stores full paths.
    let strings = StringTable::new();
    let mut path_to_ino = std::collections::HashMap::new();
    for e in entries {
        strings.intern(&e.path)?;
        path_to_ino.insert(e.path.as_str(), e.ino);
    }
    let string_data = strings.serialize();

    let mut data_section = Vec::new();
    let mut records = Vec::with_capacity(entries.len());
    for e in entries {
        let parent_inode = match e.path.rfind('/') {
            Some(0) | None => 0, // child of root
            Some(pos) => path_to_ino.get(&e.path[..pos]).copied().unwrap_or(0),
        };
        let (data_offset, data_size) = match &e.content {
            Some(content) => {
                let off = data_section.len() as u32;
                data_section.extend_from_slice(content);
                (off, content.len() as u32)
            }
            None => (0, 0),
        };
        let mut rec = InodeEntryRec {
            inode_number: e.ino,
            parent_inode,
            name_offset: strings.intern(&e.path)?,
            mode: e.mode,
            flags: 0,
            size: e.size,
            timestamp: now_millis(),
            data_offset,
            data_size,
            entry_crc32: 0,
        };
        rec.entry_crc32 = crc32(&unsafe { serialize_row(&rec) }[..ENTRY_SIZE - 4]);
        records.push(rec);
    }

    let inode_table_size = records.len() * ENTRY_SIZE;
    let mut header = FileHeader {
        magic: RAZORFS_MAGIC,
        version_major: RAZORFS_VERSION_MAJOR,
        version_minor: RAZORFS_VERSION_MINOR,
        header_crc: 0,
        timestamp: now_millis(),
        next_inode,
        string_table_offset: HEADER_SIZE as u32,
        string_table_size: string_data.len() as u32,
        inode_table_offset: (HEADER_SIZE + string_data.len()) as u32,
        inode_table_size: inode_table_size as u32,
        data_section_offset: (HEADER_SIZE + string_data.len() + inode_table_size) as u32,
        data_section_size: data_section.len() as u32,
        journal_offset: 0,
        journal_size: 0,
        file_crc: 0,
        reserved: [0; 32],
    };

    let total = HEADER_SIZE + string_data.len() + inode_table_size + data_section.len();
    let mut image = Vec::with_capacity(total);
    image.extend_from_slice(unsafe { serialize_row(&header) });
    image.extend_from_slice(&string_data);
    for rec in &records {
        image.extend_from_slice(unsafe { serialize_row(rec) });
    }
    image.extend_from_slice(&data_section);

    header.file_crc = crc32(&image[HEADER_SIZE..]);
    header.header_crc = header_crc(&image[..HEADER_SIZE]);
    image[..HEADER_SIZE].copy_from_slice(unsafe { serialize_row(&header) });
    Ok(image)
}

/// Validate and decode an image buffer.
///
/// Header or whole-file CRC failures reject the image; a bad per-entry CRC
/// only drops that entry.
pub fn parse_image(bytes: &[u8]) -> FsResult<LoadedImage> {
    if bytes.len() < HEADER_SIZE {
        return Err(FsError::Corruption("image shorter than its header".into()));
    }
    let header: FileHeader = unsafe { deserialize_row(bytes) };
    if header.magic != RAZORFS_MAGIC {
        return Err(FsError::Corruption("bad image magic".into()));
    }
    if header.version_major != RAZORFS_VERSION_MAJOR {
        let (maj, min) = (header.version_major, header.version_minor);
        return Err(FsError::Corruption(format!(
            "unsupported image version {}.{}",
            maj, min
        )));
    }
    let stored_header_crc = header.header_crc;
    if header_crc(&bytes[..HEADER_SIZE]) != stored_header_crc {
        return Err(FsError::Corruption("header checksum mismatch".into()));
    }
    let stored_file_crc = header.file_crc;
    if crc32(&bytes[HEADER_SIZE..]) != stored_file_crc {
        return Err(FsError::Corruption("file checksum mismatch".into()));
    }

    let section = |off: u32, len: u32| -> FsResult<&[u8]> {
        let start = off as usize;
        let end = start + len as usize;
        if start < HEADER_SIZE && len > 0 || end > bytes.len() {
            return Err(FsError::Corruption(format!(
                "section [{}, {}) out of bounds",
                start, end
            )));
        }
        Ok(&bytes[start..end])
    };

    let strings = StringTable::new();
    strings.load(section(header.string_table_offset, header.string_table_size)?)?;
    let inode_table = section(header.inode_table_offset, header.inode_table_size)?;
    let data_section = section(header.data_section_offset, header.data_section_size)?;

    let mut image = LoadedImage {
        next_inode: header.next_inode,
        entries: Vec::with_capacity(inode_table.len() / ENTRY_SIZE),
    };
    let mut max_ino = 0u64;
    for chunk in inode_table.chunks_exact(ENTRY_SIZE) {
        let rec: InodeEntryRec = unsafe { deserialize_row(chunk) };
        let stored_crc = rec.entry_crc32;
        if crc32(&chunk[..ENTRY_SIZE - 4]) != stored_crc {
            let ino = rec.inode_number;
            warn!("skipping inode entry {} with bad checksum", ino);
            continue;
        }
        let path = match strings.get(rec.name_offset) {
            Ok(p) => p,
            Err(e) => {
                warn!("skipping inode entry with unreadable name: {}", e);
                continue;
            }
        };
        let content = if rec.mode & S_IFMT != S_IFDIR {
            let start = rec.data_offset as usize;
            let end = start + rec.data_size as usize;
            if end > data_section.len() {
                warn!("skipping inode entry {} with out-of-range data", {
                    rec.inode_number
                });
                continue;
            }
            Some(data_section[start..end].to_vec())
        } else {
            None
        };
        max_ino = max_ino.max(rec.inode_number);
        image.entries.push(LoadedEntry {
            ino: rec.inode_number,
            path,
            mode: rec.mode,
            content,
        });
    }
    if max_ino >= image.next_inode {
        image.next_inode = max_ino + 1;
    }
    debug!("loaded {} inode entries from image", image.entries.len());
    Ok(image)
}

struct EngineCore {
    image_path: PathBuf,
    journal: Journal,
    /// Exclusive during save, shared during load.
    lock: RwLock<()>,
    dirty: AtomicBool,
}

impl EngineCore {
    /// §4.7 save protocol: serialize, write a temporary, fsync, rename over
    /// the live image, then checkpoint and truncate the journal.
    fn save_now(&self, next_inode: u64, entries: &[SaveEntry]) -> FsResult<()> {
        let _guard = self.lock.write().unwrap();
        let image = build_image(next_inode, entries)?;
        let tmp_path = PathBuf::from(format!("{}.tmp", self.image_path.display()));
        let write = (|| -> FsResult<()> {
            let mut file = fs::File::create(&tmp_path)?;
            use std::io::Write;
            file.write_all(&image)?;
            file.sync_all()?;
            fs::rename(&tmp_path, &self.image_path)?;
            Ok(())
        })();
        if let Err(e) = write {
            let _ = fs::remove_file(&tmp_path);
            self.dirty.store(true, Ordering::Relaxed);
            return Err(e);
        }
        self.journal.checkpoint()?;
        self.journal.truncate()?;
        self.dirty.store(false, Ordering::Relaxed);
        info!(
            "image saved: {} entries, {} bytes",
            entries.len(),
            image.len()
        );
        Ok(())
    }

    fn load(&self) -> FsResult<LoadedImage> {
        let _guard = self.lock.read().unwrap();
        let bytes = fs::read(&self.image_path).map_err(|_| FsError::NotFound)?;
        parse_image(&bytes)
    }
}

struct SaveQueue {
    pending: Mutex<Option<(u64, Vec<SaveEntry>)>>,
    cv: Condvar,
}

pub struct PersistenceEngine {
    core: Arc<EngineCore>,
    mode: PersistenceMode,
    auto_sync: Duration,
    queue: Arc<SaveQueue>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceEngine {
    pub fn new(image_path: &Path, mode: PersistenceMode, auto_sync_ms: u64) -> FsResult<Self> {
        let journal_path = PathBuf::from(format!("{}.journal", image_path.display()));
        let core = Arc::new(EngineCore {
            image_path: image_path.to_path_buf(),
            journal: Journal::open(&journal_path)?,
            lock: RwLock::new(()),
            dirty: AtomicBool::new(false),
        });
        let queue = Arc::new(SaveQueue {
            pending: Mutex::new(None),
            cv: Condvar::new(),
        });
        let running = Arc::new(AtomicBool::new(true));
        let engine = Self {
            core,
            mode,
            auto_sync: Duration::from_millis(auto_sync_ms.max(1)),
            queue,
            running,
            worker: Mutex::new(None),
        };
        if mode == PersistenceMode::Asynchronous {
            engine.spawn_worker();
        }
        Ok(engine)
    }

    fn spawn_worker(&self) {
        let core = Arc::clone(&self.core);
        let queue = Arc::clone(&self.queue);
        let running = Arc::clone(&self.running);
        let interval = self.auto_sync;
        let handle = std::thread::spawn(move || {
            loop {
                let job = {
                    let mut pending = queue.pending.lock().unwrap();
                    while pending.is_none() && running.load(Ordering::Relaxed) {
                        let (guard, _timeout) =
                            queue.cv.wait_timeout(pending, interval).unwrap();
                        pending = guard;
                    }
                    pending.take()
                };
                match job {
                    Some((next_inode, entries)) => {
                        if let Err(e) = core.save_now(next_inode, &entries) {
                            // Keep the snapshot and retry at the next
                            // interval.
                            error!("background save failed, will retry: {}", e);
                            let mut pending = queue.pending.lock().unwrap();
                            if pending.is_none() {
                                *pending = Some((next_inode, entries));
                            }
                            drop(pending);
                            std::thread::sleep(interval);
                        }
                    }
                    None => {
                        if !running.load(Ordering::Relaxed) {
                            break;
                        }
                    }
                }
            }
        });
        *self.worker.lock().unwrap() = Some(handle);
    }

    pub fn mode(&self) -> PersistenceMode {
        self.mode
    }

    pub fn journal(&self) -> &Journal {
        &self.core.journal
    }

    pub fn image_path(&self) -> &Path {
        &self.core.image_path
    }

    pub fn is_dirty(&self) -> bool {
        self.core.dirty.load(Ordering::Relaxed)
    }

    /// Hand a snapshot over according to the configured mode.
    pub fn save(&self, next_inode: u64, entries: Vec<SaveEntry>) -> FsResult<()> {
        match self.mode {
            PersistenceMode::Synchronous => self.core.save_now(next_inode, &entries),
            PersistenceMode::Asynchronous => {
                let mut pending = self.queue.pending.lock().unwrap();
                // Snapshots coalesce: only the newest matters.
                *pending = Some((next_inode, entries));
                self.queue.cv.notify_one();
                Ok(())
            }
            PersistenceMode::JournalOnly => {
                self.core.dirty.store(true, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    /// Write the image immediately regardless of mode (flush/fsync,
    /// checkpoint in journal-only mode, shutdown).
    pub fn save_now(&self, next_inode: u64, entries: &[SaveEntry]) -> FsResult<()> {
        self.core.save_now(next_inode, entries)
    }

    pub fn load(&self) -> FsResult<LoadedImage> {
        self.core.load()
    }

    /// Whether the on-disk image currently passes full validation.
    pub fn verify_integrity(&self) -> bool {
        self.core.load().is_ok()
    }

    /// Drain the worker and stop accepting background saves.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.queue.cv.notify_all();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PersistenceEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::razor_lib::inode::S_IFREG;
    use anyhow::Result;

    fn sample_entries() -> Vec<SaveEntry> {
        vec![
            SaveEntry {
                ino: 2,
                path: "/docs".into(),
                mode: S_IFDIR | 0o755,
                size: 0,
                content: None,
            },
            SaveEntry {
                ino: 3,
                path: "/docs/readme".into(),
                mode: S_IFREG | 0o644,
                size: 5,
                content: Some(b"hello".to_vec()),
            },
            SaveEntry {
                ino: 4,
                path: "/empty".into(),
                mode: S_IFREG | 0o600,
                size: 0,
                content: Some(Vec::new()),
            },
        ]
    }

    #[test]
    fn image_round_trip() -> Result<()> {
        let image = build_image(5, &sample_entries()).unwrap();
        let loaded = parse_image(&image).unwrap();
        assert_eq!(loaded.next_inode, 5);
        assert_eq!(loaded.entries.len(), 3);
        let readme = loaded
            .entries
            .iter()
            .find(|e| e.path == "/docs/readme")
            .unwrap();
        assert_eq!(readme.ino, 3);
        assert_eq!(readme.content.as_deref(), Some(&b"hello"[..]));
        let docs = loaded.entries.iter().find(|e| e.path == "/docs").unwrap();
        assert!(docs.content.is_none());
        Ok(())
    }

    #[test]
    fn next_inode_advances_past_max_seen() -> Result<()> {
        let image = build_image(2, &sample_entries()).unwrap();
        let loaded = parse_image(&image).unwrap();
        assert_eq!(loaded.next_inode, 5);
        Ok(())
    }

    #[test]
    fn corrupted_header_rejects_load() -> Result<()> {
        let mut image = build_image(5, &sample_entries()).unwrap();
        image[9] ^= 0xFF; // header CRC bytes
        assert!(matches!(parse_image(&image), Err(FsError::Corruption(_))));
        Ok(())
    }

    #[test]
    fn flipped_data_byte_rejects_load() -> Result<()> {
        let mut image = build_image(5, &sample_entries()).unwrap();
        let last = image.len() - 1;
        image[last] ^= 0x01; // inside the data section
        assert!(matches!(parse_image(&image), Err(FsError::Corruption(_))));
        Ok(())
    }

    #[test]
    fn bad_version_rejects_load() -> Result<()> {
        let mut image = build_image(5, &sample_entries()).unwrap();
        image[4] = 9; // version_major
        assert!(matches!(parse_image(&image), Err(FsError::Corruption(_))));
        Ok(())
    }

    #[test]
    fn corrupted_entry_is_skipped_not_fatal() -> Result<()> {
        let entries = sample_entries();
        let mut image = build_image(5, &entries).unwrap();
        // Corrupt the second inode entry's mode field, then re-seal the
        // whole-file CRC so only the per-entry checksum trips.
        let header: FileHeader = unsafe { deserialize_row(&image) };
        let entry_off = header.inode_table_offset as usize + ENTRY_SIZE + 20;
        image[entry_off] ^= 0xFF;
        let file_crc = crc32(&image[HEADER_SIZE..]);
        image[60..64].copy_from_slice(&file_crc.to_le_bytes());
        let hdr_crc = header_crc(&image[..HEADER_SIZE]);
        image[8..12].copy_from_slice(&hdr_crc.to_le_bytes());

        let loaded = parse_image(&image).unwrap();
        assert_eq!(loaded.entries.len(), 2);
        assert!(loaded.entries.iter().all(|e| e.path != "/docs/readme"));
        Ok(())
    }

    #[test]
    fn save_now_writes_atomically_and_truncates_journal() -> Result<()> {
        let dir = std::env::temp_dir();
        let image_path = dir.join(format!("razorfs-img-{}-atomic", std::process::id()));
        let _ = fs::remove_file(&image_path);
        let journal_path = PathBuf::from(format!("{}.journal", image_path.display()));
        let _ = fs::remove_file(&journal_path);

        let engine =
            PersistenceEngine::new(&image_path, PersistenceMode::Synchronous, 1000).unwrap();
        engine
            .journal()
            .append(crate::razor_lib::journal::JournalEntryType::DeleteFile, 9, &[])
            .unwrap();
        engine.save_now(5, &sample_entries()).unwrap();

        assert!(image_path.exists());
        assert!(!PathBuf::from(format!("{}.tmp", image_path.display())).exists());
        let loaded = engine.load().unwrap();
        assert_eq!(loaded.entries.len(), 3);
        // Journal was checkpointed and truncated.
        let mut replayed = 0;
        engine
            .journal()
            .replay(|_, _, _| {
                replayed += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(replayed, 0);
        assert!(engine.verify_integrity());

        let _ = fs::remove_file(&image_path);
        let _ = fs::remove_file(&journal_path);
        Ok(())
    }

    #[test]
    fn async_mode_writes_in_background() -> Result<()> {
        let image_path = std::env::temp_dir().join(format!(
            "razorfs-img-{}-async",
            std::process::id()
        ));
        let _ = fs::remove_file(&image_path);
        let journal_path = PathBuf::from(format!("{}.journal", image_path.display()));
        let _ = fs::remove_file(&journal_path);

        let engine =
            PersistenceEngine::new(&image_path, PersistenceMode::Asynchronous, 50).unwrap();
        engine.save(5, sample_entries()).unwrap();
        // The worker owns the write; give it a moment.
        let mut waited = 0;
        while !image_path.exists() && waited < 2000 {
            std::thread::sleep(Duration::from_millis(10));
            waited += 10;
        }
        assert!(image_path.exists(), "background save never landed");
        engine.shutdown();
        let loaded = engine.load().unwrap();
        assert_eq!(loaded.entries.len(), 3);

        let _ = fs::remove_file(&image_path);
        let _ = fs::remove_file(&journal_path);
        Ok(())
    }

    #[test]
    fn missing_image_is_not_found() -> Result<()> {
        let image_path = std::env::temp_dir().join(format!(
            "razorfs-img-{}-missing",
            std::process::id()
        ));
        let _ = fs::remove_file(&image_path);
        let engine =
            PersistenceEngine::new(&image_path, PersistenceMode::Synchronous, 1000).unwrap();
        assert_eq!(engine.load().err(), Some(FsError::NotFound));
        let _ = fs::remove_file(PathBuf::from(format!("{}.journal", image_path.display())));
        Ok(())
    }
}
