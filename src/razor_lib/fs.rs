/// Core filesystem operations.
///
/// Every host-visible operation lives here, layered over the tree, inode
/// table, extent mapper, and persistence engine. Mutating operations append
/// a journal record before returning; image writes happen at flush points
/// according to the configured persistence mode.
use log::{debug, info, warn};

use crate::razor_lib::errors::{FsError, FsResult};
use crate::razor_lib::extent;
use crate::razor_lib::inode::{Inode, UnlinkOutcome, S_IFDIR, S_IFMT, S_IFREG};
use crate::razor_lib::journal::JournalOp;
use crate::razor_lib::persist::{LoadedImage, SaveEntry};
use crate::razor_lib::tree::{ChildState, TreeStats, ROOT_INO};
use crate::razor_lib::utils::now_secs;
use crate::razor_lib::{FileAttr, RazorFS, StatFs, MAX_NAME_LEN};

/// Aggregate statistics for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct FsStats {
    pub tree: TreeStats,
    pub total_inodes: u32,
    pub used_inodes: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub fragmentation: f64,
    pub journal_records: u64,
}

fn check_name(name: &str) -> FsResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(FsError::InvalidArgument(format!("bad name {:?}", name)));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(FsError::InvalidArgument(format!(
            "name of {} bytes exceeds {}",
            name.len(),
            MAX_NAME_LEN
        )));
    }
    Ok(())
}

/// Split a path into its parent path and final component.
fn split_path(path: &str) -> FsResult<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(FsError::InvalidArgument("operation on root".into()));
    }
    match trimmed.rfind('/') {
        Some(pos) => Ok((if pos == 0 { "/" } else { &trimmed[..pos] }, &trimmed[pos + 1..])),
        None => Ok(("/", trimmed)),
    }
}

impl RazorFS {
    // ---- startup and recovery ---------------------------------------------

    /// Seed the root inode; the tree already carries the root node.
    pub(crate) fn bootstrap(&self) -> FsResult<()> {
        if self.inodes().lookup(ROOT_INO).is_err() {
            let now = now_secs();
            self.inodes().insert(Inode {
                inode_num: ROOT_INO,
                nlink: 1,
                mode: S_IFDIR | 0o755,
                atime: now,
                mtime: now,
                ctime: now,
                ..Default::default()
            })?;
        }
        Ok(())
    }

    /// Load the newest valid image, replay the journal on top, and fall
    /// back to journal-only crash recovery when the image is unreadable.
    pub(crate) fn load_or_recover(&self) -> FsResult<()> {
        match self.persistence().load() {
            Ok(image) => {
                self.populate(image)?;
                let replayed = self.replay_journal()?;
                if replayed > 0 {
                    info!("replayed {} journal records over the image", replayed);
                    self.save_to_disk()?;
                }
                Ok(())
            }
            Err(FsError::NotFound) => {
                let replayed = self.replay_journal()?;
                if replayed > 0 {
                    info!("recovered {} journal records with no image", replayed);
                    self.save_to_disk()?;
                }
                Ok(())
            }
            Err(e) => {
                warn!("image rejected ({}); attempting crash recovery", e);
                let replayed = self.replay_journal()?;
                if replayed > 0 {
                    info!("crash recovery restored {} journal records", replayed);
                    self.save_to_disk()?;
                } else {
                    warn!("no recoverable journal; starting empty");
                }
                Ok(())
            }
        }
    }

    fn populate(&self, image: LoadedImage) -> FsResult<()> {
        let mut entries = image.entries;
        entries.sort_by_key(|e| e.path.matches('/').count());
        for entry in entries {
            let ino = entry.ino as u32;
            let (parent_path, name) = match split_path(&entry.path) {
                Ok(v) => v,
                Err(_) => {
                    warn!("image entry with unusable path {:?}", entry.path);
                    continue;
                }
            };
            let parent_ino = match self.tree().find_by_path(parent_path) {
                Ok(p) => p,
                Err(_) => {
                    warn!("image entry {:?} has no parent; skipped", entry.path);
                    continue;
                }
            };
            if let Err(e) =
                self.materialize_entry(parent_ino, name, ino, entry.mode, entry.content.as_deref())
            {
                warn!("image entry {:?} not restored: {}", entry.path, e);
            }
        }
        self.inodes().set_next_inode(image.next_inode);
        Ok(())
    }

    /// Install one (name, inode) pair, creating the inode or adding a
    /// hardlink when the number is already live.
    fn materialize_entry(
        &self,
        parent_ino: u32,
        name: &str,
        ino: u32,
        mode: u16,
        content: Option<&[u8]>,
    ) -> FsResult<()> {
        check_name(name)?;
        let is_dir = mode & S_IFMT == S_IFDIR;
        if self.inodes().lookup(ino).is_ok() {
            self.inodes().link(ino)?;
            if let Err(e) = self
                .tree()
                .add_child(parent_ino, name, ino, mode as u32, is_dir)
            {
                let _ = self.inodes().unlink(ino);
                return Err(e);
            }
            return Ok(());
        }
        let now = now_secs();
        self.inodes().insert(Inode {
            inode_num: ino,
            nlink: 1,
            mode,
            atime: now,
            mtime: now,
            ctime: now,
            ..Default::default()
        })?;
        if let Err(e) = self
            .tree()
            .add_child(parent_ino, name, ino, mode as u32, is_dir)
        {
            let _ = self.inodes().unlink(ino);
            return Err(e);
        }
        if let Some(content) = content {
            if !content.is_empty() {
                self.replace_content(ino, content)?;
            }
        }
        Ok(())
    }

    fn replay_journal(&self) -> FsResult<usize> {
        self.persistence().journal().replay(|rtype, ino, payload| {
            let op = JournalOp::parse(rtype, payload)?;
            if let Err(e) = self.apply_journal_op(ino, op) {
                warn!("journal record for inode {} not applied: {}", ino, e);
            }
            Ok(())
        })
    }

    fn apply_journal_op(&self, ino: u64, op: JournalOp) -> FsResult<()> {
        let ino = ino as u32;
        match op {
            JournalOp::CreateFile { path, content } => {
                if self.tree().find_by_path(&path).is_ok() {
                    return self.replace_content(ino, &content);
                }
                let (parent_path, name) = split_path(&path)?;
                let parent_ino = self.tree().find_by_path(parent_path)?;
                self.materialize_entry(parent_ino, name, ino, S_IFREG | 0o644, Some(&content))
            }
            JournalOp::CreateDir { path } => {
                if self.tree().find_by_path(&path).is_ok() {
                    return Ok(());
                }
                let (parent_path, name) = split_path(&path)?;
                let parent_ino = self.tree().find_by_path(parent_path)?;
                self.materialize_entry(parent_ino, name, ino, S_IFDIR | 0o755, None)
            }
            JournalOp::WriteData { content } => self.replace_content(ino, &content),
            JournalOp::DeleteFile | JournalOp::DeleteDir => {
                let path = self.tree().path_of(ino)?;
                let (parent_path, name) = split_path(&path)?;
                let parent_ino = self.tree().find_by_path(parent_path)?;
                self.remove_entry(parent_ino, name)
            }
            JournalOp::Rename { old_path, new_path } => {
                let (old_parent_path, old_name) = split_path(&old_path)?;
                let (new_parent_path, new_name) = split_path(&new_path)?;
                let old_parent = self.tree().find_by_path(old_parent_path)?;
                let new_parent = self.tree().find_by_path(new_parent_path)?;
                let (_, displaced) =
                    self.tree()
                        .move_child(old_parent, old_name, new_parent, new_name, true)?;
                if let Some(victim) = displaced {
                    self.drop_inode(victim)?;
                }
                Ok(())
            }
            JournalOp::Checkpoint => Ok(()),
        }
    }

    // ---- save path --------------------------------------------------------

    fn content_of(&self, inode: &Inode) -> FsResult<Vec<u8>> {
        let mut buf = vec![0u8; inode.size as usize];
        let n = extent::read(inode, self.allocator(), &mut buf, 0)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn snapshot(&self) -> FsResult<(u64, Vec<SaveEntry>)> {
        let mut out = Vec::new();
        for entry in self.tree().snapshot_entries()? {
            let inode = match self.inodes().lookup(entry.ino) {
                Ok(i) => i,
                Err(_) => continue,
            };
            let content = if inode.is_dir() {
                None
            } else {
                Some(self.content_of(&inode)?)
            };
            out.push(SaveEntry {
                ino: entry.ino as u64,
                path: entry.path,
                mode: inode.mode,
                size: inode.size,
                content,
            });
        }
        Ok((self.inodes().next_inode(), out))
    }

    /// Write a fresh image immediately (flush, fsync, shutdown, recovery).
    pub fn save_to_disk(&self) -> FsResult<()> {
        let (next_inode, entries) = self.snapshot()?;
        self.persistence().save_now(next_inode, &entries)
    }

    /// Hand the current state to the persistence engine per its mode.
    pub fn schedule_save(&self) -> FsResult<()> {
        let (next_inode, entries) = self.snapshot()?;
        self.persistence().save(next_inode, entries)
    }

    // ---- shared mutation helpers ------------------------------------------

    fn path_of_child(&self, parent_ino: u32, name: &str) -> FsResult<String> {
        let parent_path = self.tree().path_of(parent_ino)?;
        if parent_path == "/" {
            Ok(format!("/{}", name))
        } else {
            Ok(format!("{}/{}", parent_path, name))
        }
    }

    /// Replace a file's entire content (journal replay, truncate path).
    fn replace_content(&self, ino: u32, content: &[u8]) -> FsResult<()> {
        let mut copy = self.inodes().lookup(ino)?;
        if copy.is_dir() {
            return Err(FsError::IsADirectory);
        }
        extent::free_all(&mut copy, self.allocator())?;
        copy.size = 0;
        if !content.is_empty() {
            extent::write(&mut copy, self.allocator(), content, 0)?;
        }
        let now = now_secs();
        self.inodes().with_mut(ino, |inode| {
            inode.data = copy.data;
            inode.flags = copy.flags;
            inode.size = copy.size;
            inode.mtime = now;
            inode.ctime = now;
            Ok(())
        })
    }

    /// Remove a name; when the last link drops, release extents and xattrs.
    fn remove_entry(&self, parent_ino: u32, name: &str) -> FsResult<()> {
        let ino = self.tree().remove_child(parent_ino, name)?;
        self.drop_inode(ino)
    }

    fn drop_inode(&self, ino: u32) -> FsResult<()> {
        match self.inodes().unlink(ino)? {
            UnlinkOutcome::Live(nlink) => {
                debug!("inode {} still has {} links", ino, nlink);
                Ok(())
            }
            UnlinkOutcome::Freed(mut freed) => {
                extent::free_all(&mut freed, self.allocator())?;
                self.xattrs().release(freed.xattr_head);
                Ok(())
            }
        }
    }

    fn attr_of(&self, ino: u32) -> FsResult<FileAttr> {
        let inode = self.inodes().lookup(ino)?;
        let bs = self.allocator().block_size() as u64;
        Ok(FileAttr {
            ino: ino as u64,
            size: inode.size,
            blocks: (inode.size + bs - 1) / bs,
            atime: inode.atime,
            mtime: inode.mtime,
            ctime: inode.ctime,
            is_dir: inode.is_dir(),
            perm: inode.mode & 0o7777,
            nlink: inode.nlink as u32,
        })
    }

    // ---- lookup and attributes --------------------------------------------

    pub fn rfs_lookup(&self, parent_ino: u64, name: &str) -> FsResult<(u64, FileAttr)> {
        let ino = self.tree().find_child(parent_ino as u32, name)?;
        Ok((ino as u64, self.attr_of(ino)?))
    }

    pub fn rfs_getattr(&self, ino: u64) -> FsResult<FileAttr> {
        self.attr_of(ino as u32)
    }

    /// Path form of lookup/getattr for the §6 contract.
    pub fn rfs_getattr_path(&self, path: &str) -> FsResult<FileAttr> {
        let ino = self.tree().find_by_path(path)?;
        self.attr_of(ino)
    }

    pub fn rfs_access(&self, ino: u64) -> FsResult<()> {
        self.inodes().lookup(ino as u32).map(|_| ())
    }

    pub fn rfs_open(&self, path: &str) -> FsResult<u64> {
        Ok(self.tree().find_by_path(path)? as u64)
    }

    // ---- create family ----------------------------------------------------

    pub fn rfs_mkdir(&self, parent_ino: u64, name: &str, mode: u32) -> FsResult<(u64, FileAttr)> {
        check_name(name)?;
        let parent_ino = parent_ino as u32;
        let mode = S_IFDIR | (mode as u16 & 0o7777);
        let ino = self.inodes().alloc(mode)?;
        if let Err(e) = self
            .tree()
            .add_child(parent_ino, name, ino, mode as u32, true)
        {
            // A failed insert releases the inode it claimed.
            let _ = self.inodes().unlink(ino);
            return Err(e);
        }
        let path = self.path_of_child(parent_ino, name)?;
        self.persistence()
            .journal()
            .append_op(ino as u64, &JournalOp::CreateDir { path })?;
        Ok((ino as u64, self.attr_of(ino)?))
    }

    pub fn rfs_create(&self, parent_ino: u64, name: &str, mode: u32) -> FsResult<(u64, FileAttr)> {
        check_name(name)?;
        let parent_ino = parent_ino as u32;
        let mode = S_IFREG | (mode as u16 & 0o7777);
        let ino = self.inodes().alloc(mode)?;
        if let Err(e) = self
            .tree()
            .add_child(parent_ino, name, ino, mode as u32, false)
        {
            let _ = self.inodes().unlink(ino);
            return Err(e);
        }
        let path = self.path_of_child(parent_ino, name)?;
        self.persistence().journal().append_op(
            ino as u64,
            &JournalOp::CreateFile {
                path,
                content: Vec::new(),
            },
        )?;
        Ok((ino as u64, self.attr_of(ino)?))
    }

    pub fn rfs_mkdir_path(&self, path: &str, mode: u32) -> FsResult<FileAttr> {
        let (parent_path, name) = split_path(path)?;
        let parent = self.tree().find_by_path(parent_path)?;
        let (_, attr) = self.rfs_mkdir(parent as u64, name, mode)?;
        Ok(attr)
    }

    pub fn rfs_create_path(&self, path: &str, mode: u32) -> FsResult<FileAttr> {
        let (parent_path, name) = split_path(path)?;
        let parent = self.tree().find_by_path(parent_path)?;
        let (_, attr) = self.rfs_create(parent as u64, name, mode)?;
        Ok(attr)
    }

    /// Hardlink: bind a new name to an existing inode.
    pub fn rfs_link(
        &self,
        ino: u64,
        new_parent_ino: u64,
        new_name: &str,
    ) -> FsResult<(u64, FileAttr)> {
        check_name(new_name)?;
        let ino = ino as u32;
        let inode = self.inodes().lookup(ino)?;
        if inode.is_dir() {
            return Err(FsError::IsADirectory);
        }
        self.inodes().link(ino)?;
        if let Err(e) = self.tree().add_child(
            new_parent_ino as u32,
            new_name,
            ino,
            inode.mode as u32,
            false,
        ) {
            let _ = self.inodes().unlink(ino);
            return Err(e);
        }
        let path = self.path_of_child(new_parent_ino as u32, new_name)?;
        let content = self.content_of(&self.inodes().lookup(ino)?)?;
        self.persistence()
            .journal()
            .append_op(ino as u64, &JournalOp::CreateFile { path, content })?;
        Ok((ino as u64, self.attr_of(ino)?))
    }

    pub fn rfs_link_path(&self, existing: &str, new_path: &str) -> FsResult<FileAttr> {
        let ino = self.tree().find_by_path(existing)?;
        let (parent_path, name) = split_path(new_path)?;
        let parent = self.tree().find_by_path(parent_path)?;
        let (_, attr) = self.rfs_link(ino as u64, parent as u64, name)?;
        Ok(attr)
    }

    // ---- remove family ----------------------------------------------------

    pub fn rfs_unlink(&self, parent_ino: u64, name: &str) -> FsResult<()> {
        let parent_ino = parent_ino as u32;
        let ino = self.tree().find_child(parent_ino, name)?;
        if self.inodes().lookup(ino)?.is_dir() {
            return Err(FsError::IsADirectory);
        }
        self.remove_entry(parent_ino, name)?;
        self.persistence()
            .journal()
            .append_op(ino as u64, &JournalOp::DeleteFile)?;
        Ok(())
    }

    pub fn rfs_rmdir(&self, parent_ino: u64, name: &str) -> FsResult<()> {
        let parent_ino = parent_ino as u32;
        let ino = self.tree().find_child(parent_ino, name)?;
        if !self.inodes().lookup(ino)?.is_dir() {
            return Err(FsError::NotADirectory);
        }
        self.remove_entry(parent_ino, name)?;
        self.persistence()
            .journal()
            .append_op(ino as u64, &JournalOp::DeleteDir)?;
        Ok(())
    }

    pub fn rfs_unlink_path(&self, path: &str) -> FsResult<()> {
        let (parent_path, name) = split_path(path)?;
        let parent = self.tree().find_by_path(parent_path)?;
        self.rfs_unlink(parent as u64, name)
    }

    pub fn rfs_rmdir_path(&self, path: &str) -> FsResult<()> {
        let (parent_path, name) = split_path(path)?;
        let parent = self.tree().find_by_path(parent_path)?;
        self.rfs_rmdir(parent as u64, name)
    }

    // ---- data path --------------------------------------------------------

    pub fn rfs_read(&self, ino: u64, offset: i64, size: u32) -> FsResult<Vec<u8>> {
        if offset < 0 {
            return Err(FsError::InvalidArgument("negative offset".into()));
        }
        let ino = ino as u32;
        let _guard = self.file_lock(ino).read().unwrap();
        let inode = self.inodes().lookup(ino)?;
        if inode.is_dir() {
            return Err(FsError::IsADirectory);
        }
        let mut buf = vec![0u8; size as usize];
        let n = extent::read(&inode, self.allocator(), &mut buf, offset as u64)?;
        buf.truncate(n);
        let now = now_secs();
        let _ = self.inodes().with_mut(ino, |i| {
            i.atime = now;
            Ok(())
        });
        Ok(buf)
    }

    pub fn rfs_write(&self, ino: u64, offset: i64, data: &[u8]) -> FsResult<u32> {
        if offset < 0 {
            return Err(FsError::InvalidArgument("negative offset".into()));
        }
        let ino = ino as u32;
        let _guard = self.file_lock(ino).write().unwrap();
        let mut copy = self.inodes().lookup(ino)?;
        if copy.is_dir() {
            return Err(FsError::IsADirectory);
        }
        let written = extent::write(&mut copy, self.allocator(), data, offset as u64)?;
        let now = now_secs();
        self.inodes().with_mut(ino, |inode| {
            inode.data = copy.data;
            inode.flags = copy.flags;
            inode.size = copy.size;
            inode.mtime = now;
            inode.ctime = now;
            Ok(())
        })?;
        let content = self.content_of(&copy)?;
        self.persistence()
            .journal()
            .append_op(ino as u64, &JournalOp::WriteData { content })?;
        Ok(written as u32)
    }

    pub fn rfs_truncate(&self, ino: u64, new_size: u64) -> FsResult<()> {
        let ino = ino as u32;
        let _guard = self.file_lock(ino).write().unwrap();
        let mut copy = self.inodes().lookup(ino)?;
        if copy.is_dir() {
            return Err(FsError::IsADirectory);
        }
        extent::truncate(&mut copy, self.allocator(), new_size)?;
        let now = now_secs();
        self.inodes().with_mut(ino, |inode| {
            inode.data = copy.data;
            inode.flags = copy.flags;
            inode.size = copy.size;
            inode.mtime = now;
            inode.ctime = now;
            Ok(())
        })?;
        let content = self.content_of(&copy)?;
        self.persistence()
            .journal()
            .append_op(ino as u64, &JournalOp::WriteData { content })?;
        Ok(())
    }

    pub fn rfs_truncate_path(&self, path: &str, new_size: u64) -> FsResult<()> {
        let ino = self.tree().find_by_path(path)?;
        self.rfs_truncate(ino as u64, new_size)
    }

    pub fn rfs_read_path(&self, path: &str, offset: i64, size: u32) -> FsResult<Vec<u8>> {
        let ino = self.tree().find_by_path(path)?;
        self.rfs_read(ino as u64, offset, size)
    }

    pub fn rfs_write_path(&self, path: &str, offset: i64, data: &[u8]) -> FsResult<u32> {
        let ino = self.tree().find_by_path(path)?;
        self.rfs_write(ino as u64, offset, data)
    }

    /// Free whole blocks inside the range and leave a sparse hole.
    pub fn rfs_punch_hole(&self, ino: u64, offset: u64, length: u64) -> FsResult<()> {
        let ino = ino as u32;
        let _guard = self.file_lock(ino).write().unwrap();
        let mut copy = self.inodes().lookup(ino)?;
        if copy.is_dir() {
            return Err(FsError::IsADirectory);
        }
        extent::punch_hole(&mut copy, self.allocator(), offset, length)?;
        self.inodes().with_mut(ino, |inode| {
            inode.data = copy.data;
            inode.flags = copy.flags;
            inode.size = copy.size;
            inode.ctime = now_secs();
            Ok(())
        })
    }

    // ---- rename -----------------------------------------------------------

    pub fn rfs_rename(
        &self,
        parent_ino: u64,
        name: &str,
        new_parent_ino: u64,
        new_name: &str,
        no_replace: bool,
    ) -> FsResult<()> {
        check_name(new_name)?;
        let parent_ino = parent_ino as u32;
        let new_parent_ino = new_parent_ino as u32;
        let moved = self.tree().find_child(parent_ino, name)?;

        // A directory must not move under its own subtree.
        if self.inodes().lookup(moved)?.is_dir() {
            let target_path = self.tree().path_of(new_parent_ino)?;
            let moved_path = self.tree().path_of(moved)?;
            if target_path == moved_path
                || target_path.starts_with(&format!("{}/", moved_path))
            {
                return Err(FsError::InvalidArgument(
                    "cannot move a directory into itself".into(),
                ));
            }
        }

        let old_path = self.path_of_child(parent_ino, name)?;
        let (ino, displaced) =
            self.tree()
                .move_child(parent_ino, name, new_parent_ino, new_name, !no_replace)?;
        if let Some(victim) = displaced {
            self.drop_inode(victim)?;
        }
        let new_path = self.path_of_child(new_parent_ino, new_name)?;
        self.persistence().journal().append_op(
            ino as u64,
            &JournalOp::Rename { old_path, new_path },
        )?;
        Ok(())
    }

    pub fn rfs_rename_path(&self, old: &str, new: &str, no_replace: bool) -> FsResult<()> {
        let (old_parent_path, old_name) = split_path(old)?;
        let (new_parent_path, new_name) = split_path(new)?;
        let old_parent = self.tree().find_by_path(old_parent_path)?;
        let new_parent = self.tree().find_by_path(new_parent_path)?;
        self.rfs_rename(old_parent as u64, old_name, new_parent as u64, new_name, no_replace)
    }

    // ---- directory listing ------------------------------------------------

    pub fn rfs_readdir(&self, ino: u64) -> FsResult<Vec<(String, u64, bool)>> {
        let children = self.tree().get_children(ino as u32)?;
        Ok(children
            .into_iter()
            .map(|(name, ino, is_dir)| (name, ino as u64, is_dir))
            .collect())
    }

    pub fn rfs_readdir_path(&self, path: &str) -> FsResult<Vec<(String, u64, bool)>> {
        let ino = self.tree().find_by_path(path)?;
        self.rfs_readdir(ino as u64)
    }

    // ---- attribute updates ------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn rfs_setattr(
        &self,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<u32>,
        mtime: Option<u32>,
    ) -> FsResult<FileAttr> {
        let ino32 = ino as u32;
        if let Some(new_size) = size {
            self.rfs_truncate(ino, new_size)?;
        }
        self.inodes().with_mut(ino32, |inode| {
            if let Some(m) = mode {
                inode.mode = (inode.mode & S_IFMT) | (m as u16 & 0o7777);
            }
            if let Some(t) = atime {
                inode.atime = t;
            }
            if let Some(t) = mtime {
                inode.mtime = t;
            }
            inode.ctime = now_secs();
            Ok(())
        })?;
        self.attr_of(ino32)
    }

    pub fn rfs_chmod(&self, path: &str, mode: u32) -> FsResult<FileAttr> {
        let ino = self.tree().find_by_path(path)?;
        self.rfs_setattr(ino as u64, Some(mode), None, None, None, None, None)
    }

    /// Ownership is host policy; the core only bumps the change time.
    pub fn rfs_chown(&self, path: &str, _uid: u32, _gid: u32) -> FsResult<FileAttr> {
        let ino = self.tree().find_by_path(path)?;
        self.rfs_setattr(ino as u64, None, None, None, None, None, None)
    }

    pub fn rfs_utimens(&self, path: &str, atime: Option<u32>, mtime: Option<u32>) -> FsResult<FileAttr> {
        let ino = self.tree().find_by_path(path)?;
        self.rfs_setattr(ino as u64, None, None, None, None, atime, mtime)
    }

    // ---- xattrs -----------------------------------------------------------

    pub fn rfs_setxattr(&self, ino: u64, name: &str, value: &[u8]) -> FsResult<()> {
        let ino = ino as u32;
        let head = self.inodes().lookup(ino)?.xattr_head;
        let new_head = self.xattrs().set(head, name, value)?;
        if new_head != head {
            self.inodes().with_mut(ino, |inode| {
                inode.xattr_head = new_head;
                inode.ctime = now_secs();
                Ok(())
            })?;
        }
        Ok(())
    }

    pub fn rfs_getxattr(&self, ino: u64, name: &str) -> FsResult<Vec<u8>> {
        let head = self.inodes().lookup(ino as u32)?.xattr_head;
        self.xattrs().get(head, name)
    }

    pub fn rfs_listxattr(&self, ino: u64) -> FsResult<Vec<String>> {
        let head = self.inodes().lookup(ino as u32)?.xattr_head;
        Ok(self.xattrs().list(head))
    }

    pub fn rfs_removexattr(&self, ino: u64, name: &str) -> FsResult<()> {
        let ino = ino as u32;
        let head = self.inodes().lookup(ino)?.xattr_head;
        let new_head = self.xattrs().remove(head, name)?;
        if new_head != head {
            self.inodes().with_mut(ino, |inode| {
                inode.xattr_head = new_head;
                inode.ctime = now_secs();
                Ok(())
            })?;
        }
        Ok(())
    }

    // ---- statistics and sync ----------------------------------------------

    pub fn rfs_statfs(&self) -> StatFs {
        let (total_blocks, free_blocks, _) = self.allocator().stats();
        let (total_inodes, _, free_inodes) = self.inodes().stats();
        StatFs {
            total_blocks: total_blocks as u64,
            free_blocks: free_blocks as u64,
            total_inodes: total_inodes as u64,
            free_inodes: free_inodes as u64,
            block_size: self.allocator().block_size(),
            max_name_len: MAX_NAME_LEN as u32,
        }
    }

    pub fn rfs_stats(&self) -> FsStats {
        let (total_inodes, used_inodes, _) = self.inodes().stats();
        let (total_blocks, free_blocks, _) = self.allocator().stats();
        FsStats {
            tree: self.tree().stats(),
            total_inodes,
            used_inodes,
            total_blocks,
            free_blocks,
            fragmentation: self.allocator().fragmentation(),
            journal_records: self.persistence().journal().sequence(),
        }
    }

    /// flush/fsync contract: a synchronous save.
    pub fn rfs_flush(&self) -> FsResult<()> {
        self.save_to_disk()
    }

    pub fn rfs_fsync(&self, _data_only: bool) -> FsResult<()> {
        self.save_to_disk()
    }

    /// release: hand the state to the engine per its persistence mode.
    pub fn rfs_release(&self) -> FsResult<()> {
        self.schedule_save()
    }

    /// Final save and worker drain on unmount.
    pub fn rfs_destroy(&self) -> FsResult<()> {
        let result = self.save_to_disk();
        self.persistence().shutdown();
        result
    }

    /// Child-index state of a directory, for diagnostics and tests.
    pub fn directory_state(&self, ino: u64) -> FsResult<ChildState> {
        Ok(self.tree().info(ino as u32)?.state)
    }

    /// Live extent count of a file.
    pub fn extent_count(&self, ino: u64) -> FsResult<usize> {
        let inode = self.inodes().lookup(ino as u32)?;
        extent::count(&inode, self.allocator())
    }
}
