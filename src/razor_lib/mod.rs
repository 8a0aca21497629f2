/// Filesystem core: cache-aligned metadata engine with journalled,
/// checksum-protected persistence.
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::info;

pub mod alloc;
pub mod crc;
pub mod errors;
pub mod extent;
pub mod fs;
pub mod fuse;
pub mod inode;
pub mod journal;
pub mod persist;
pub mod strings;
pub mod tree;
pub mod utils;
pub mod xattr;

use alloc::{BlockAllocator, BLOCK_SIZE_DEFAULT};
use errors::FsResult;
use inode::InodeTable;
use persist::{PersistenceEngine, PersistenceMode};
use strings::StringTable;
use tree::NaryTree;
use xattr::XattrTable;

/// Attribute TTL handed to the kernel, 1 second default.
pub const TTL: Duration = Duration::from_secs(1);

/// Longest directory-entry name accepted.
pub const MAX_NAME_LEN: usize = 255;

const FILE_LOCK_STRIPES: usize = 64;

#[derive(Debug, Clone)]
pub struct FsConfig {
    /// Canonical image path; the journal lives at `<image>.journal`.
    pub image_path: PathBuf,
    pub mode: PersistenceMode,
    pub auto_sync_ms: u64,
    /// Backing region, in blocks.
    pub total_blocks: u32,
    pub block_size: u32,
    pub inode_capacity: u32,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            image_path: PathBuf::from("razorfs.img"),
            mode: PersistenceMode::Synchronous,
            auto_sync_ms: 5000,
            total_blocks: 16384,
            block_size: BLOCK_SIZE_DEFAULT,
            inode_capacity: 65536,
        }
    }
}

/// Attributes in the core's own terms; the adapter translates them for the
/// host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub is_dir: bool,
    pub perm: u16,
    pub nlink: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
    pub block_size: u32,
    pub max_name_len: u32,
}

/// The filesystem instance: exclusive owner of the tree, inode table,
/// string interner, block allocator, and journal.
pub struct RazorFS {
    pub config: FsConfig,
    strings: Arc<StringTable>,
    tree: NaryTree,
    inodes: InodeTable,
    alloc: BlockAllocator,
    xattrs: XattrTable,
    persist: PersistenceEngine,
    /// Striped per-inode locks serializing file content updates.
    file_locks: Vec<RwLock<()>>,
    uid: u32,
    gid: u32,
}

impl RazorFS {
    /// Build the core and recover state from the image/journal pair.
    pub fn new(config: FsConfig) -> FsResult<Self> {
        let strings = Arc::new(StringTable::new());
        let tree = NaryTree::new(Arc::clone(&strings))?;
        let inodes = InodeTable::new(config.inode_capacity);
        let alloc = BlockAllocator::new(config.total_blocks, config.block_size)?;
        let persist = PersistenceEngine::new(&config.image_path, config.mode, config.auto_sync_ms)?;
        let fs = Self {
            strings,
            tree,
            inodes,
            alloc,
            xattrs: XattrTable::new(),
            persist,
            file_locks: (0..FILE_LOCK_STRIPES).map(|_| RwLock::new(())).collect(),
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            config,
        };
        fs.bootstrap()?;
        fs.load_or_recover()?;
        info!(
            "razorfs ready at {} ({} blocks of {} bytes)",
            fs.config.image_path.display(),
            fs.config.total_blocks,
            fs.config.block_size
        );
        Ok(fs)
    }

    pub(crate) fn tree(&self) -> &NaryTree {
        &self.tree
    }

    pub(crate) fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    pub(crate) fn allocator(&self) -> &BlockAllocator {
        &self.alloc
    }

    pub(crate) fn xattrs(&self) -> &XattrTable {
        &self.xattrs
    }

    pub(crate) fn persistence(&self) -> &PersistenceEngine {
        &self.persist
    }

    pub(crate) fn owner(&self) -> (u32, u32) {
        (self.uid, self.gid)
    }

    pub(crate) fn file_lock(&self, ino: u32) -> &RwLock<()> {
        &self.file_locks[ino as usize % FILE_LOCK_STRIPES]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let config = FsConfig::default();
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.mode, PersistenceMode::Synchronous);
        assert!(config.total_blocks > 0);
    }
}
