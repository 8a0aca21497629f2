/// Inode records and the inode table.
///
/// An inode is one cache line: identity, link count, timestamps, size, the
/// xattr chain head, and a 32-byte payload whose interpretation is governed
/// by the storage-mode tag in `flags` (see `extent.rs`).
use std::mem::size_of;
use std::sync::RwLock;

use log::debug;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::razor_lib::errors::{FsError, FsResult};
use crate::razor_lib::utils::now_secs;

/// Max hardlinks per inode.
pub const INODE_MAX_LINKS: u16 = 65535;
/// Inline payload bytes per inode.
pub const INODE_INLINE_DATA: usize = 32;

/// How the 32-byte payload is to be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum StorageMode {
    /// Payload holds the file content itself (size <= 32).
    InlineData = 0,
    /// Payload holds up to two extent descriptors.
    InlineExtents = 1,
    /// Payload's first four bytes hold the extent-tree block number.
    ExtentTree = 2,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C, align(64))]
pub struct Inode {
    pub inode_num: u32,
    pub nlink: u16,
    /// File type and permission bits.
    pub mode: u16,
    pub size: u64,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    /// Chain head in the xattr table, 0 = none.
    pub xattr_head: u16,
    /// Storage-mode tag.
    pub flags: u16,
    pub data: [u8; INODE_INLINE_DATA],
}

// One cache line, exactly.
const _: () = assert!(size_of::<Inode>() == 64);

pub const S_IFMT: u16 = 0o170000;
pub const S_IFDIR: u16 = 0o040000;
pub const S_IFREG: u16 = 0o100000;

impl Inode {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn storage_mode(&self) -> StorageMode {
        StorageMode::try_from(self.flags).unwrap_or(StorageMode::InlineData)
    }

    pub fn set_storage_mode(&mut self, mode: StorageMode) {
        self.flags = mode.into();
    }
}

impl Default for Inode {
    fn default() -> Self {
        Self {
            inode_num: 0,
            nlink: 0,
            mode: 0,
            size: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            xattr_head: 0,
            flags: 0,
            data: [0; INODE_INLINE_DATA],
        }
    }
}

/// Outcome of an unlink: either the inode survives with a lower link count,
/// or it was freed and the final copy is handed back so the caller can
/// release its extents.
pub enum UnlinkOutcome {
    Live(u16),
    Freed(Inode),
}

struct InodeTableInner {
    inodes: Vec<Inode>,
    /// Freed slots awaiting reuse.
    free_slots: Vec<u32>,
    used: u32,
    next_inode: u64,
    /// inode_num -> slot index, separately chained.
    buckets: Vec<Vec<(u32, u32)>>,
}

pub struct InodeTable {
    capacity: u32,
    inner: RwLock<InodeTableInner>,
}

/// Multiplicative hash over inode numbers.
fn hash_inode(inode_num: u32, capacity: usize) -> usize {
    (inode_num.wrapping_mul(2_654_435_761) as usize) % capacity
}

impl InodeTable {
    pub fn new(capacity: u32) -> Self {
        let hash_capacity = (capacity as usize / 4).max(64);
        Self {
            capacity,
            inner: RwLock::new(InodeTableInner {
                inodes: Vec::new(),
                free_slots: Vec::new(),
                used: 0,
                next_inode: 1,
                buckets: vec![Vec::new(); hash_capacity],
            }),
        }
    }

    fn index_of(inner: &InodeTableInner, inode_num: u32) -> Option<u32> {
        let bucket = &inner.buckets[hash_inode(inode_num, inner.buckets.len())];
        bucket
            .iter()
            .find(|(num, _)| *num == inode_num)
            .map(|(_, idx)| *idx)
    }

    fn hash_insert(inner: &mut InodeTableInner, inode_num: u32, index: u32) {
        let h = hash_inode(inode_num, inner.buckets.len());
        inner.buckets[h].push((inode_num, index));
    }

    fn hash_remove(inner: &mut InodeTableInner, inode_num: u32) {
        let h = hash_inode(inode_num, inner.buckets.len());
        inner.buckets[h].retain(|(num, _)| *num != inode_num);
    }

    fn place(inner: &mut InodeTableInner, inode: Inode) -> FsResult<u32> {
        let slot = match inner.free_slots.pop() {
            Some(s) => {
                inner.inodes[s as usize] = inode;
                s
            }
            None => {
                inner.inodes.push(inode);
                (inner.inodes.len() - 1) as u32
            }
        };
        inner.used += 1;
        Self::hash_insert(inner, inode.inode_num, slot);
        Ok(slot)
    }

    /// Allocate the next sequential inode with link count 1.
    pub fn alloc(&self, mode: u16) -> FsResult<u32> {
        let mut inner = self.inner.write().unwrap();
        if inner.used >= self.capacity {
            return Err(FsError::NoSpace);
        }
        let inode_num = inner.next_inode as u32;
        inner.next_inode += 1;
        let now = now_secs();
        let inode = Inode {
            inode_num,
            nlink: 1,
            mode,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            ..Default::default()
        };
        Self::place(&mut inner, inode)?;
        debug!("allocated inode {} mode {:o}", inode_num, mode);
        Ok(inode_num)
    }

    /// Install an inode carrying a specific number (image load, replay).
    pub fn insert(&self, inode: Inode) -> FsResult<()> {
        if inode.inode_num == 0 {
            return Err(FsError::InvalidArgument("inode 0 is reserved".into()));
        }
        let mut inner = self.inner.write().unwrap();
        if inner.used >= self.capacity {
            return Err(FsError::NoSpace);
        }
        if Self::index_of(&inner, inode.inode_num).is_some() {
            return Err(FsError::AlreadyExists);
        }
        if inode.inode_num as u64 >= inner.next_inode {
            inner.next_inode = inode.inode_num as u64 + 1;
        }
        Self::place(&mut inner, inode)?;
        Ok(())
    }

    pub fn lookup(&self, inode_num: u32) -> FsResult<Inode> {
        let inner = self.inner.read().unwrap();
        let idx = Self::index_of(&inner, inode_num).ok_or(FsError::NotFound)?;
        Ok(inner.inodes[idx as usize])
    }

    /// Run `f` on the live record. The table lock is held for the duration,
    /// so `f` must not call back into other locked subsystems.
    pub fn with_mut<R>(
        &self,
        inode_num: u32,
        f: impl FnOnce(&mut Inode) -> FsResult<R>,
    ) -> FsResult<R> {
        let mut inner = self.inner.write().unwrap();
        let idx = Self::index_of(&inner, inode_num).ok_or(FsError::NotFound)? as usize;
        f(&mut inner.inodes[idx])
    }

    /// Increment the hardlink count.
    pub fn link(&self, inode_num: u32) -> FsResult<u16> {
        self.with_mut(inode_num, |inode| {
            if inode.nlink >= INODE_MAX_LINKS {
                return Err(FsError::TooManyLinks);
            }
            inode.nlink += 1;
            inode.ctime = now_secs();
            Ok(inode.nlink)
        })
    }

    /// Decrement the hardlink count; at zero the slot is zeroed and the
    /// final copy returned for extent release.
    pub fn unlink(&self, inode_num: u32) -> FsResult<UnlinkOutcome> {
        let mut inner = self.inner.write().unwrap();
        let idx = Self::index_of(&inner, inode_num).ok_or(FsError::NotFound)? as usize;
        let inode = &mut inner.inodes[idx];
        if inode.nlink > 1 {
            inode.nlink -= 1;
            inode.ctime = now_secs();
            return Ok(UnlinkOutcome::Live(inode.nlink));
        }
        let freed = *inode;
        *inode = Inode::default();
        Self::hash_remove(&mut inner, inode_num);
        inner.free_slots.push(idx as u32);
        inner.used -= 1;
        debug!("freed inode {}", inode_num);
        Ok(UnlinkOutcome::Freed(freed))
    }

    pub fn update(&self, inode_num: u32, size: u64, mtime: u32) -> FsResult<()> {
        self.with_mut(inode_num, |inode| {
            inode.size = size;
            inode.mtime = mtime;
            inode.ctime = now_secs();
            Ok(())
        })
    }

    /// (total, used, free)
    pub fn stats(&self) -> (u32, u32, u32) {
        let inner = self.inner.read().unwrap();
        (self.capacity, inner.used, self.capacity - inner.used)
    }

    pub fn next_inode(&self) -> u64 {
        self.inner.read().unwrap().next_inode
    }

    pub fn set_next_inode(&self, next: u64) {
        let mut inner = self.inner.write().unwrap();
        if next > inner.next_inode {
            inner.next_inode = next;
        }
    }

    /// Every live inode number, for save iteration.
    pub fn live_inodes(&self) -> Vec<u32> {
        let inner = self.inner.read().unwrap();
        inner
            .inodes
            .iter()
            .filter(|i| i.inode_num != 0)
            .map(|i| i.inode_num)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn inode_is_one_cache_line() {
        assert_eq!(size_of::<Inode>(), 64);
        assert_eq!(std::mem::align_of::<Inode>(), 64);
    }

    #[test]
    fn alloc_initializes_link_count() -> Result<()> {
        let table = InodeTable::new(16);
        let ino = table.alloc(S_IFREG | 0o644)?;
        let inode = table.lookup(ino)?;
        assert_eq!(inode.nlink, 1);
        assert_eq!(inode.mode, S_IFREG | 0o644);
        assert!(!inode.is_dir());
        assert_eq!(inode.storage_mode(), StorageMode::InlineData);
        Ok(())
    }

    #[test]
    fn link_unlink_lifecycle() -> Result<()> {
        let table = InodeTable::new(16);
        let ino = table.alloc(S_IFREG | 0o644)?;
        let n = 3;
        for _ in 0..n {
            table.link(ino)?;
        }
        assert_eq!(table.lookup(ino)?.nlink, n + 1);
        for _ in 0..n {
            match table.unlink(ino)? {
                UnlinkOutcome::Live(_) => {}
                UnlinkOutcome::Freed(_) => panic!("freed too early"),
            }
        }
        match table.unlink(ino)? {
            UnlinkOutcome::Freed(inode) => assert_eq!(inode.inode_num, ino),
            UnlinkOutcome::Live(_) => panic!("still live"),
        }
        assert_eq!(table.lookup(ino), Err(FsError::NotFound));
        Ok(())
    }

    #[test]
    fn link_count_is_bounded() -> Result<()> {
        let table = InodeTable::new(4);
        let ino = table.alloc(S_IFREG | 0o644)?;
        table.with_mut(ino, |inode| {
            inode.nlink = INODE_MAX_LINKS;
            Ok(())
        })?;
        assert_eq!(table.link(ino), Err(FsError::TooManyLinks));
        Ok(())
    }

    #[test]
    fn capacity_is_enforced() -> Result<()> {
        let table = InodeTable::new(2);
        table.alloc(S_IFREG | 0o644)?;
        table.alloc(S_IFREG | 0o644)?;
        assert_eq!(table.alloc(S_IFREG | 0o644), Err(FsError::NoSpace));
        Ok(())
    }

    #[test]
    fn freed_slots_are_reused_with_fresh_numbers() -> Result<()> {
        let table = InodeTable::new(2);
        let a = table.alloc(S_IFREG | 0o644)?;
        table.unlink(a)?;
        let b = table.alloc(S_IFREG | 0o644)?;
        assert_ne!(a, b);
        assert!(table.next_inode() > b as u64);
        Ok(())
    }

    #[test]
    fn insert_advances_next_inode() -> Result<()> {
        let table = InodeTable::new(16);
        let inode = Inode {
            inode_num: 42,
            nlink: 1,
            mode: S_IFDIR | 0o755,
            ..Default::default()
        };
        table.insert(inode).map_err(|e| anyhow::anyhow!("{}", e))?;
        assert!(table.next_inode() > 42);
        assert!(table.lookup(42)?.is_dir());
        Ok(())
    }

    #[test]
    fn update_bumps_ctime() -> Result<()> {
        let table = InodeTable::new(16);
        let ino = table.alloc(S_IFREG | 0o644)?;
        table.update(ino, 1234, 99)?;
        let inode = table.lookup(ino)?;
        assert_eq!(inode.size, 1234);
        assert_eq!(inode.mtime, 99);
        Ok(())
    }
}
