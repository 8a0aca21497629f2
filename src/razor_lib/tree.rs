/// N-ary directory tree.
///
/// Nodes are 64-byte-aligned records packed into 4 KiB pages owned by the
/// tree arena. Small directories keep up to 16 children inline; on the 17th
/// child a directory is promoted to a 128-slot open-addressed hash table.
/// Hash tables live in the arena too, and nodes refer to them by index, so
/// a node can be freed without a concurrent reader ever holding a dangling
/// table reference.
use std::collections::HashMap;
use std::mem::size_of;
use std::sync::{Arc, RwLock};

use log::{debug, warn};

use crate::razor_lib::errors::{FsError, FsResult};
use crate::razor_lib::strings::StringTable;
use crate::razor_lib::utils::now_secs;

pub const MAX_CHILDREN_INLINE: usize = 16;
pub const DIR_HASH_SIZE: usize = 128;
/// Load-factor gate: 0.75 * DIR_HASH_SIZE.
pub const DIR_HASH_MAX_ENTRIES: u32 = 96;
pub const DIR_HASH_MAX_PROBES: usize = 10;
pub const ROOT_INO: u32 = 1;

const PAGE_SIZE: usize = 4096;
pub const NODES_PER_PAGE: usize = 31;

const NODE_FLAG_DIR: u16 = 0x0001;
const NODE_FLAG_OVERLOADED: u16 = 0x0002;

/// A directory entry bound to an inode.
///
/// Child arrays and hash entries store arena slot numbers biased by one
/// (0 = empty), never raw pointers.
#[derive(Debug, Clone, Copy)]
#[repr(C, align(64))]
pub struct TreeNode {
    /// 0 marks a freed slot.
    pub inode_num: u32,
    pub parent_inode: u32,
    pub name_offset: u32,
    pub name_hash: u32,
    pub child_count: u16,
    pub flags: u16,
    pub mode: u32,
    /// Biased arena indices of inline children.
    pub inline_children: [u32; MAX_CHILDREN_INLINE],
    /// Biased index into the hash-table arena, 0 = not promoted.
    pub hash_table: u32,
    pub mtime: u32,
    pub version: u32,
}

const _: () = assert!(size_of::<TreeNode>() == 128);

impl TreeNode {
    fn empty() -> Self {
        Self {
            inode_num: 0,
            parent_inode: 0,
            name_offset: 0,
            name_hash: 0,
            child_count: 0,
            flags: 0,
            mode: 0,
            inline_children: [0; MAX_CHILDREN_INLINE],
            hash_table: 0,
            mtime: 0,
            version: 0,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.flags & NODE_FLAG_DIR != 0
    }
}

/// Page-aligned node storage.
#[repr(C, align(4096))]
struct NodePage {
    nodes: [TreeNode; NODES_PER_PAGE],
    used_nodes: u32,
}

const _: () = assert!(size_of::<NodePage>() == PAGE_SIZE);

impl NodePage {
    fn new() -> Box<Self> {
        Box::new(Self {
            nodes: [TreeNode::empty(); NODES_PER_PAGE],
            used_nodes: 0,
        })
    }
}

/// Child-index state of a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Inline,
    Hashed,
    /// Load factor or collision count past the gate; escalation pending.
    Overloaded,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
struct HashEntry {
    name_hash: u32,
    name_offset: u32,
    /// Biased arena slot of the child node, 0 = empty.
    child_slot: u32,
    probe_next: u32,
}

const _: () = assert!(size_of::<HashEntry>() == 16);

struct DirectoryHashTable {
    entries: [HashEntry; DIR_HASH_SIZE],
    used_entries: u32,
    collision_count: u32,
}

impl DirectoryHashTable {
    fn new() -> Box<Self> {
        Box::new(Self {
            entries: [HashEntry::default(); DIR_HASH_SIZE],
            used_entries: 0,
            collision_count: 0,
        })
    }

    fn is_overloaded(&self) -> bool {
        self.used_entries > DIR_HASH_MAX_ENTRIES
            || self.collision_count > self.used_entries / 2
    }

    /// Linear probing bounded by `DIR_HASH_MAX_PROBES`; probing skips over
    /// cleared slots so removals need no tombstones.
    fn insert(&mut self, name_hash: u32, name_offset: u32, child_slot: u32) -> bool {
        if self.used_entries >= DIR_HASH_MAX_ENTRIES {
            return false;
        }
        let home = name_hash as usize % DIR_HASH_SIZE;
        for probe in 0..DIR_HASH_MAX_PROBES {
            let idx = (home + probe) % DIR_HASH_SIZE;
            if self.entries[idx].child_slot == 0 {
                if probe > 0 {
                    self.collision_count += 1;
                }
                self.entries[idx] = HashEntry {
                    name_hash,
                    name_offset,
                    child_slot,
                    probe_next: 0,
                };
                self.used_entries += 1;
                return true;
            }
        }
        false
    }

    fn find_slot(&self, name_hash: u32) -> impl Iterator<Item = &HashEntry> {
        let home = name_hash as usize % DIR_HASH_SIZE;
        (0..DIR_HASH_MAX_PROBES)
            .map(move |p| &self.entries[(home + p) % DIR_HASH_SIZE])
            .filter(move |e| e.child_slot != 0 && e.name_hash == name_hash)
    }

    fn remove_at(&mut self, name_hash: u32, child_slot: u32) -> bool {
        let home = name_hash as usize % DIR_HASH_SIZE;
        for probe in 0..DIR_HASH_MAX_PROBES {
            let idx = (home + probe) % DIR_HASH_SIZE;
            let e = &mut self.entries[idx];
            if e.child_slot == child_slot && e.name_hash == name_hash {
                *e = HashEntry::default();
                self.used_entries -= 1;
                return true;
            }
        }
        false
    }

    fn live_slots(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries
            .iter()
            .filter(|e| e.child_slot != 0)
            .map(|e| e.child_slot)
    }
}

/// Hash over directory-entry names.
pub fn hash_name(name: &str) -> u32 {
    let mut hash: u32 = 0;
    for b in name.bytes() {
        hash = hash.wrapping_mul(31).wrapping_add(b as u32);
    }
    hash
}

struct TreeInner {
    pages: Vec<Box<NodePage>>,
    free_slots: Vec<u32>,
    /// inode -> arena slots (hardlinked files own one slot per name).
    inode_map: HashMap<u32, Vec<u32>>,
    hash_tables: Vec<Option<Box<DirectoryHashTable>>>,
    free_tables: Vec<u32>,
    total_nodes: usize,
}

impl TreeInner {
    fn node(&self, slot: u32) -> &TreeNode {
        let slot = slot as usize;
        &self.pages[slot / NODES_PER_PAGE].nodes[slot % NODES_PER_PAGE]
    }

    fn node_mut(&mut self, slot: u32) -> &mut TreeNode {
        let slot = slot as usize;
        &mut self.pages[slot / NODES_PER_PAGE].nodes[slot % NODES_PER_PAGE]
    }

    fn first_slot(&self, ino: u32) -> Option<u32> {
        self.inode_map.get(&ino).and_then(|v| v.first().copied())
    }

    fn alloc_slot(&mut self) -> u32 {
        if let Some(slot) = self.free_slots.pop() {
            return slot;
        }
        let last_used = self
            .pages
            .last()
            .map(|p| p.used_nodes as usize)
            .unwrap_or(NODES_PER_PAGE);
        if last_used < NODES_PER_PAGE {
            let page_idx = self.pages.len() - 1;
            self.pages[page_idx].used_nodes += 1;
            return (page_idx * NODES_PER_PAGE + last_used) as u32;
        }
        let mut page = NodePage::new();
        page.used_nodes = 1;
        self.pages.push(page);
        ((self.pages.len() - 1) * NODES_PER_PAGE) as u32
    }

    fn alloc_table(&mut self) -> u32 {
        if let Some(idx) = self.free_tables.pop() {
            self.hash_tables[idx as usize] = Some(DirectoryHashTable::new());
            return idx;
        }
        self.hash_tables.push(Some(DirectoryHashTable::new()));
        (self.hash_tables.len() - 1) as u32
    }

    fn table(&self, biased: u32) -> Option<&DirectoryHashTable> {
        if biased == 0 {
            return None;
        }
        self.hash_tables[(biased - 1) as usize].as_deref()
    }

    fn table_mut(&mut self, biased: u32) -> Option<&mut DirectoryHashTable> {
        if biased == 0 {
            return None;
        }
        self.hash_tables[(biased - 1) as usize].as_deref_mut()
    }
}

/// Copy of one node's externally interesting state.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub ino: u32,
    pub parent_ino: u32,
    pub name: String,
    pub mode: u32,
    pub is_dir: bool,
    pub child_count: u16,
    pub state: ChildState,
}

/// One live entry in save order (parents before children).
#[derive(Debug, Clone)]
pub struct TreeEntry {
    pub ino: u32,
    pub path: String,
    pub mode: u32,
    pub is_dir: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TreeStats {
    pub total_nodes: usize,
    pub total_pages: usize,
    pub string_table_bytes: usize,
    pub inline_directories: usize,
    pub hashed_directories: usize,
}

pub struct NaryTree {
    inner: RwLock<TreeInner>,
    strings: Arc<StringTable>,
}

impl NaryTree {
    pub fn new(strings: Arc<StringTable>) -> FsResult<Self> {
        let tree = Self {
            inner: RwLock::new(TreeInner {
                pages: Vec::new(),
                free_slots: Vec::new(),
                inode_map: HashMap::new(),
                hash_tables: Vec::new(),
                free_tables: Vec::new(),
                total_nodes: 0,
            }),
            strings,
        };
        {
            let mut inner = tree.inner.write().unwrap();
            let slot = inner.alloc_slot();
            let name_offset = tree.strings.intern("/")?;
            let node = inner.node_mut(slot);
            *node = TreeNode {
                inode_num: ROOT_INO,
                parent_inode: 0,
                name_offset,
                name_hash: hash_name("/"),
                flags: NODE_FLAG_DIR,
                mode: libc::S_IFDIR | 0o755,
                mtime: now_secs(),
                version: 1,
                ..TreeNode::empty()
            };
            inner.inode_map.insert(ROOT_INO, vec![slot]);
            inner.total_nodes = 1;
        }
        Ok(tree)
    }

    pub fn strings(&self) -> &Arc<StringTable> {
        &self.strings
    }

    fn find_child_slot(&self, inner: &TreeInner, parent_slot: u32, name: &str) -> Option<u32> {
        let parent = inner.node(parent_slot);
        let name_hash = hash_name(name);
        if parent.hash_table == 0 {
            for &biased in parent.inline_children.iter() {
                if biased == 0 {
                    continue;
                }
                let child = inner.node(biased - 1);
                if child.inode_num != 0 && child.name_hash == name_hash {
                    if let Ok(stored) = self.strings.get(child.name_offset) {
                        if stored == name {
                            return Some(biased - 1);
                        }
                    }
                }
            }
            return None;
        }
        let table = inner.table(parent.hash_table)?;
        for entry in table.find_slot(name_hash) {
            let child = inner.node(entry.child_slot - 1);
            if child.inode_num != 0 {
                if let Ok(stored) = self.strings.get(child.name_offset) {
                    if stored == name {
                        return Some(entry.child_slot - 1);
                    }
                }
            }
        }
        None
    }

    /// Insert `name -> child_ino` under `parent_ino`, allocating the entry
    /// node. Fails with `AlreadyExists` on duplicate names and promotes the
    /// directory to its hash table on the 17th child.
    pub fn add_child(
        &self,
        parent_ino: u32,
        name: &str,
        child_ino: u32,
        mode: u32,
        is_dir: bool,
    ) -> FsResult<()> {
        if name.is_empty() || name.contains('/') {
            return Err(FsError::InvalidArgument(format!("bad name {:?}", name)));
        }
        let name_offset = self.strings.intern(name)?;
        let mut inner = self.inner.write().unwrap();
        let parent_slot = inner.first_slot(parent_ino).ok_or(FsError::NotFound)?;
        if !inner.node(parent_slot).is_dir() {
            return Err(FsError::NotADirectory);
        }
        if self.find_child_slot(&inner, parent_slot, name).is_some() {
            return Err(FsError::AlreadyExists);
        }

        let child_slot = inner.alloc_slot();
        let name_hash = hash_name(name);
        *inner.node_mut(child_slot) = TreeNode {
            inode_num: child_ino,
            parent_inode: parent_ino,
            name_offset,
            name_hash,
            flags: if is_dir { NODE_FLAG_DIR } else { 0 },
            mode,
            mtime: now_secs(),
            version: 1,
            ..TreeNode::empty()
        };

        if let Err(e) = self.link_into_parent(&mut inner, parent_slot, child_slot) {
            // Failed insert: give the entry node back before reporting.
            *inner.node_mut(child_slot) = TreeNode::empty();
            inner.free_slots.push(child_slot);
            return Err(e);
        }
        inner
            .inode_map
            .entry(child_ino)
            .or_default()
            .push(child_slot);
        inner.total_nodes += 1;
        Ok(())
    }

    fn link_into_parent(
        &self,
        inner: &mut TreeInner,
        parent_slot: u32,
        child_slot: u32,
    ) -> FsResult<()> {
        let biased_child = child_slot + 1;
        let parent = inner.node(parent_slot);
        let child_count = parent.child_count as usize;
        if parent.hash_table == 0 && child_count < MAX_CHILDREN_INLINE {
            let parent = inner.node_mut(parent_slot);
            parent.inline_children[child_count] = biased_child;
            parent.child_count += 1;
            parent.version = parent.version.wrapping_add(1);
            return Ok(());
        }

        // Promote on the 17th child. The arena lock is exclusive here, so
        // exactly one table is ever installed for a directory.
        if inner.node(parent_slot).hash_table == 0 {
            let table_idx = inner.alloc_table();
            let inline = inner.node(parent_slot).inline_children;
            for &biased in inline.iter() {
                if biased == 0 {
                    continue;
                }
                let (hash, offset) = {
                    let n = inner.node(biased - 1);
                    (n.name_hash, n.name_offset)
                };
                let table = inner.table_mut(table_idx + 1).unwrap();
                if !table.insert(hash, offset, biased) {
                    inner.hash_tables[table_idx as usize] = None;
                    inner.free_tables.push(table_idx);
                    return Err(FsError::Io("directory hash table insert failed".into()));
                }
            }
            let parent = inner.node_mut(parent_slot);
            parent.hash_table = table_idx + 1;
            parent.inline_children = [0; MAX_CHILDREN_INLINE];
            debug!(
                "directory inode {} promoted to hash table",
                parent.inode_num
            );
        }

        let (hash, offset) = {
            let n = inner.node(child_slot);
            (n.name_hash, n.name_offset)
        };
        let table_ref = inner.node(parent_slot).hash_table;
        let table = inner
            .table_mut(table_ref)
            .ok_or_else(|| FsError::Io("missing directory hash table".into()))?;
        if !table.insert(hash, offset, biased_child) {
            return Err(FsError::Io("directory hash table full".into()));
        }
        let overloaded = table.is_overloaded();
        let parent = inner.node_mut(parent_slot);
        parent.child_count += 1;
        parent.version = parent.version.wrapping_add(1);
        if overloaded && parent.flags & NODE_FLAG_OVERLOADED == 0 {
            parent.flags |= NODE_FLAG_OVERLOADED;
            warn!(
                "directory inode {} overloaded; escalation pending",
                parent.inode_num
            );
        }
        Ok(())
    }

    fn unlink_from_parent(
        &self,
        inner: &mut TreeInner,
        parent_slot: u32,
        child_slot: u32,
    ) -> FsResult<()> {
        let biased_child = child_slot + 1;
        let table_ref = inner.node(parent_slot).hash_table;
        if table_ref == 0 {
            let parent = inner.node_mut(parent_slot);
            let count = parent.child_count as usize;
            let pos = parent.inline_children[..count]
                .iter()
                .position(|&c| c == biased_child)
                .ok_or(FsError::NotFound)?;
            // Keep the inline array dense.
            for i in pos..count - 1 {
                parent.inline_children[i] = parent.inline_children[i + 1];
            }
            parent.inline_children[count - 1] = 0;
            parent.child_count -= 1;
            parent.version = parent.version.wrapping_add(1);
            return Ok(());
        }
        let name_hash = inner.node(child_slot).name_hash;
        let table = inner
            .table_mut(table_ref)
            .ok_or_else(|| FsError::Io("missing directory hash table".into()))?;
        if !table.remove_at(name_hash, biased_child) {
            return Err(FsError::NotFound);
        }
        let parent = inner.node_mut(parent_slot);
        parent.child_count -= 1;
        parent.version = parent.version.wrapping_add(1);
        Ok(())
    }

    /// Remove `name` from `parent_ino` and free its entry node. Returns the
    /// child's inode number. Non-empty directories are refused.
    pub fn remove_child(&self, parent_ino: u32, name: &str) -> FsResult<u32> {
        let mut inner = self.inner.write().unwrap();
        let parent_slot = inner.first_slot(parent_ino).ok_or(FsError::NotFound)?;
        let child_slot = self
            .find_child_slot(&inner, parent_slot, name)
            .ok_or(FsError::NotFound)?;
        if inner.node(child_slot).child_count > 0 {
            return Err(FsError::NotEmpty);
        }
        self.unlink_from_parent(&mut inner, parent_slot, child_slot)?;
        let child_ino = inner.node(child_slot).inode_num;
        self.release_node(&mut inner, child_slot);
        Ok(child_ino)
    }

    fn release_node(&self, inner: &mut TreeInner, slot: u32) {
        let (ino, table_ref) = {
            let node = inner.node_mut(slot);
            let ino = node.inode_num;
            let table_ref = node.hash_table;
            // Freed marker first, so racing lookups see a dead node before
            // the table goes away.
            node.inode_num = 0;
            node.hash_table = 0;
            (ino, table_ref)
        };
        if table_ref != 0 {
            inner.hash_tables[(table_ref - 1) as usize] = None;
            inner.free_tables.push(table_ref - 1);
        }
        if let Some(slots) = inner.inode_map.get_mut(&ino) {
            slots.retain(|&s| s != slot);
            if slots.is_empty() {
                inner.inode_map.remove(&ino);
            }
        }
        *inner.node_mut(slot) = TreeNode::empty();
        inner.free_slots.push(slot);
        inner.total_nodes -= 1;
    }

    /// Resolve one name under a directory to its inode.
    pub fn find_child(&self, parent_ino: u32, name: &str) -> FsResult<u32> {
        let inner = self.inner.read().unwrap();
        let parent_slot = inner.first_slot(parent_ino).ok_or(FsError::NotFound)?;
        if !inner.node(parent_slot).is_dir() {
            return Err(FsError::NotADirectory);
        }
        self.find_child_slot(&inner, parent_slot, name)
            .map(|slot| inner.node(slot).inode_num)
            .ok_or(FsError::NotFound)
    }

    /// Walk a `/`-separated path from the root. `.` components are skipped,
    /// `..` is rejected outright.
    pub fn find_by_path(&self, path: &str) -> FsResult<u32> {
        let inner = self.inner.read().unwrap();
        let mut current = inner.first_slot(ROOT_INO).ok_or(FsError::NotFound)?;
        for component in path.split('/') {
            if component.is_empty() || component == "." {
                continue;
            }
            if component == ".." {
                return Err(FsError::InvalidArgument(
                    "path traversal rejected".into(),
                ));
            }
            if !inner.node(current).is_dir() {
                return Err(FsError::NotADirectory);
            }
            current = self
                .find_child_slot(&inner, current, component)
                .ok_or(FsError::NotFound)?;
        }
        Ok(inner.node(current).inode_num)
    }

    /// `(name, inode, is_dir)` for every child. Order is the storage order
    /// of the directory and stable within one call.
    pub fn get_children(&self, parent_ino: u32) -> FsResult<Vec<(String, u32, bool)>> {
        let inner = self.inner.read().unwrap();
        let parent_slot = inner.first_slot(parent_ino).ok_or(FsError::NotFound)?;
        let parent = inner.node(parent_slot);
        if !parent.is_dir() {
            return Err(FsError::NotADirectory);
        }
        let slots: Vec<u32> = if parent.hash_table == 0 {
            parent.inline_children[..parent.child_count as usize]
                .iter()
                .filter(|&&b| b != 0)
                .map(|&b| b - 1)
                .collect()
        } else {
            inner
                .table(parent.hash_table)
                .map(|t| t.live_slots().map(|b| b - 1).collect())
                .unwrap_or_default()
        };
        let mut children = Vec::with_capacity(slots.len());
        for slot in slots {
            let node = inner.node(slot);
            if node.inode_num == 0 {
                continue;
            }
            children.push((
                self.strings.get(node.name_offset)?,
                node.inode_num,
                node.is_dir(),
            ));
        }
        Ok(children)
    }

    /// Atomically move/rename an entry. With `overwrite` false an existing
    /// target name fails with `AlreadyExists`; otherwise the displaced
    /// entry's inode is returned for the caller to unlink.
    pub fn move_child(
        &self,
        parent_ino: u32,
        name: &str,
        new_parent_ino: u32,
        new_name: &str,
        overwrite: bool,
    ) -> FsResult<(u32, Option<u32>)> {
        if new_name.is_empty() || new_name.contains('/') {
            return Err(FsError::InvalidArgument(format!("bad name {:?}", new_name)));
        }
        let new_offset = self.strings.intern(new_name)?;
        let mut inner = self.inner.write().unwrap();
        let parent_slot = inner.first_slot(parent_ino).ok_or(FsError::NotFound)?;
        let new_parent_slot = inner.first_slot(new_parent_ino).ok_or(FsError::NotFound)?;
        if !inner.node(new_parent_slot).is_dir() {
            return Err(FsError::NotADirectory);
        }
        let child_slot = self
            .find_child_slot(&inner, parent_slot, name)
            .ok_or(FsError::NotFound)?;

        let mut displaced = None;
        if let Some(target_slot) = self.find_child_slot(&inner, new_parent_slot, new_name) {
            if target_slot == child_slot {
                return Ok((inner.node(child_slot).inode_num, None));
            }
            if !overwrite {
                return Err(FsError::AlreadyExists);
            }
            if inner.node(target_slot).child_count > 0 {
                return Err(FsError::NotEmpty);
            }
            self.unlink_from_parent(&mut inner, new_parent_slot, target_slot)?;
            displaced = Some(inner.node(target_slot).inode_num);
            self.release_node(&mut inner, target_slot);
        }

        self.unlink_from_parent(&mut inner, parent_slot, child_slot)?;
        {
            let node = inner.node_mut(child_slot);
            node.parent_inode = new_parent_ino;
            node.name_offset = new_offset;
            node.name_hash = hash_name(new_name);
            node.mtime = now_secs();
            node.version = node.version.wrapping_add(1);
        }
        if let Err(e) = self.link_into_parent(&mut inner, new_parent_slot, child_slot) {
            // Re-link under the old parent so no entry is lost.
            let node = inner.node_mut(child_slot);
            node.parent_inode = parent_ino;
            self.link_into_parent(&mut inner, parent_slot, child_slot)?;
            return Err(e);
        }
        Ok((inner.node(child_slot).inode_num, displaced))
    }

    pub fn contains(&self, ino: u32) -> bool {
        self.inner.read().unwrap().inode_map.contains_key(&ino)
    }

    pub fn info(&self, ino: u32) -> FsResult<NodeInfo> {
        let inner = self.inner.read().unwrap();
        let slot = inner.first_slot(ino).ok_or(FsError::NotFound)?;
        let node = inner.node(slot);
        let state = if node.hash_table == 0 {
            ChildState::Inline
        } else if inner
            .table(node.hash_table)
            .map(|t| t.is_overloaded())
            .unwrap_or(false)
        {
            ChildState::Overloaded
        } else {
            ChildState::Hashed
        };
        Ok(NodeInfo {
            ino: node.inode_num,
            parent_ino: node.parent_inode,
            name: self.strings.get(node.name_offset)?,
            mode: node.mode,
            is_dir: node.is_dir(),
            child_count: node.child_count,
            state,
        })
    }

    /// Full path of the first entry bound to `ino`.
    pub fn path_of(&self, ino: u32) -> FsResult<String> {
        let inner = self.inner.read().unwrap();
        if ino == ROOT_INO {
            return Ok("/".into());
        }
        let mut slot = inner.first_slot(ino).ok_or(FsError::NotFound)?;
        let mut parts = Vec::new();
        for _ in 0..4096 {
            let node = inner.node(slot);
            parts.push(self.strings.get(node.name_offset)?);
            if node.parent_inode == 0 || node.parent_inode == ROOT_INO {
                parts.reverse();
                return Ok(format!("/{}", parts.join("/")));
            }
            slot = inner
                .first_slot(node.parent_inode)
                .ok_or(FsError::NotFound)?;
        }
        Err(FsError::Corruption("parent chain does not terminate".into()))
    }

    /// Every live entry except the root, parents before children.
    pub fn snapshot_entries(&self) -> FsResult<Vec<TreeEntry>> {
        let inner = self.inner.read().unwrap();
        let root = inner.first_slot(ROOT_INO).ok_or(FsError::NotFound)?;
        let mut out = Vec::with_capacity(inner.total_nodes);
        let mut stack = vec![(root, String::new())];
        while let Some((slot, prefix)) = stack.pop() {
            let node = inner.node(slot);
            let child_slots: Vec<u32> = if node.hash_table == 0 {
                node.inline_children[..node.child_count as usize]
                    .iter()
                    .filter(|&&b| b != 0)
                    .map(|&b| b - 1)
                    .collect()
            } else {
                inner
                    .table(node.hash_table)
                    .map(|t| t.live_slots().map(|b| b - 1).collect())
                    .unwrap_or_default()
            };
            for child_slot in child_slots {
                let child = inner.node(child_slot);
                if child.inode_num == 0 {
                    continue;
                }
                let path = format!("{}/{}", prefix, self.strings.get(child.name_offset)?);
                out.push(TreeEntry {
                    ino: child.inode_num,
                    path: path.clone(),
                    mode: child.mode,
                    is_dir: child.is_dir(),
                });
                if child.is_dir() {
                    stack.push((child_slot, path));
                }
            }
        }
        // Parents strictly before children for the loader.
        out.sort_by_key(|e| e.path.matches('/').count());
        Ok(out)
    }

    pub fn stats(&self) -> TreeStats {
        let inner = self.inner.read().unwrap();
        let mut inline_dirs = 0;
        let mut hashed_dirs = 0;
        for slots in inner.inode_map.values() {
            for &slot in slots {
                let node = inner.node(slot);
                if node.is_dir() {
                    if node.hash_table == 0 {
                        inline_dirs += 1;
                    } else {
                        hashed_dirs += 1;
                    }
                }
            }
        }
        TreeStats {
            total_nodes: inner.total_nodes,
            total_pages: inner.pages.len(),
            string_table_bytes: self.strings.len(),
            inline_directories: inline_dirs,
            hashed_directories: hashed_dirs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn tree() -> NaryTree {
        NaryTree::new(Arc::new(StringTable::new())).unwrap()
    }

    #[test]
    fn node_layout() {
        assert_eq!(size_of::<TreeNode>(), 128);
        assert_eq!(size_of::<NodePage>(), PAGE_SIZE);
        assert_eq!(size_of::<HashEntry>(), 16);
    }

    #[test]
    fn root_exists() -> Result<()> {
        let t = tree();
        assert_eq!(t.find_by_path("/")?, ROOT_INO);
        let info = t.info(ROOT_INO)?;
        assert!(info.is_dir);
        assert_eq!(info.parent_ino, 0);
        Ok(())
    }

    #[test]
    fn add_find_remove_child() -> Result<()> {
        let t = tree();
        t.add_child(ROOT_INO, "etc", 2, libc::S_IFDIR | 0o755, true)?;
        t.add_child(2, "fstab", 3, libc::S_IFREG | 0o644, false)?;
        assert_eq!(t.find_child(ROOT_INO, "etc")?, 2);
        assert_eq!(t.find_by_path("/etc/fstab")?, 3);
        assert_eq!(t.path_of(3)?, "/etc/fstab");
        assert_eq!(t.remove_child(2, "fstab")?, 3);
        assert_eq!(t.find_child(2, "fstab"), Err(FsError::NotFound));
        Ok(())
    }

    #[test]
    fn duplicate_names_rejected() -> Result<()> {
        let t = tree();
        t.add_child(ROOT_INO, "a", 2, libc::S_IFREG | 0o644, false)?;
        assert_eq!(
            t.add_child(ROOT_INO, "a", 3, libc::S_IFREG | 0o644, false),
            Err(FsError::AlreadyExists)
        );
        Ok(())
    }

    #[test]
    fn dotdot_is_rejected() {
        let t = tree();
        assert!(matches!(
            t.find_by_path("/../etc"),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn dot_and_empty_components_are_skipped() -> Result<()> {
        let t = tree();
        t.add_child(ROOT_INO, "dir", 2, libc::S_IFDIR | 0o755, true)?;
        assert_eq!(t.find_by_path("//dir/.")?, 2);
        Ok(())
    }

    #[test]
    fn promotion_on_seventeenth_child() -> Result<()> {
        let t = tree();
        t.add_child(ROOT_INO, "d", 2, libc::S_IFDIR | 0o755, true)?;
        for i in 0..MAX_CHILDREN_INLINE {
            t.add_child(2, &format!("f{}", i), 10 + i as u32, libc::S_IFREG | 0o644, false)?;
        }
        assert_eq!(t.info(2)?.state, ChildState::Inline);
        t.add_child(2, "f16", 40, libc::S_IFREG | 0o644, false)?;
        assert_eq!(t.info(2)?.state, ChildState::Hashed);
        // Every name still resolves after migration.
        for i in 0..MAX_CHILDREN_INLINE {
            assert_eq!(t.find_child(2, &format!("f{}", i))?, 10 + i as u32);
        }
        assert_eq!(t.find_child(2, "f16")?, 40);
        assert_eq!(t.info(2)?.child_count, 17);
        Ok(())
    }

    #[test]
    fn inline_removal_keeps_array_dense() -> Result<()> {
        let t = tree();
        for i in 0..5u32 {
            t.add_child(ROOT_INO, &format!("n{}", i), 10 + i, libc::S_IFREG | 0o644, false)?;
        }
        t.remove_child(ROOT_INO, "n2")?;
        for i in [0u32, 1, 3, 4] {
            assert_eq!(t.find_child(ROOT_INO, &format!("n{}", i))?, 10 + i);
        }
        assert_eq!(t.info(ROOT_INO)?.child_count, 4);
        Ok(())
    }

    #[test]
    fn removal_from_hashed_directory() -> Result<()> {
        let t = tree();
        t.add_child(ROOT_INO, "d", 2, libc::S_IFDIR | 0o755, true)?;
        for i in 0..20u32 {
            t.add_child(2, &format!("f{}", i), 10 + i, libc::S_IFREG | 0o644, false)?;
        }
        t.remove_child(2, "f7")?;
        assert_eq!(t.find_child(2, "f7"), Err(FsError::NotFound));
        assert_eq!(t.find_child(2, "f8")?, 18);
        assert_eq!(t.info(2)?.child_count, 19);
        Ok(())
    }

    #[test]
    fn rename_no_overwrite() -> Result<()> {
        let t = tree();
        t.add_child(ROOT_INO, "a", 2, libc::S_IFREG | 0o644, false)?;
        t.add_child(ROOT_INO, "b", 3, libc::S_IFREG | 0o644, false)?;
        assert_eq!(
            t.move_child(ROOT_INO, "a", ROOT_INO, "b", false),
            Err(FsError::AlreadyExists)
        );
        let (ino, displaced) = t.move_child(ROOT_INO, "a", ROOT_INO, "b", true)?;
        assert_eq!(ino, 2);
        assert_eq!(displaced, Some(3));
        assert_eq!(t.find_child(ROOT_INO, "b")?, 2);
        assert_eq!(t.find_child(ROOT_INO, "a"), Err(FsError::NotFound));
        Ok(())
    }

    #[test]
    fn rename_moves_subtree() -> Result<()> {
        let t = tree();
        t.add_child(ROOT_INO, "src", 2, libc::S_IFDIR | 0o755, true)?;
        t.add_child(ROOT_INO, "dst", 3, libc::S_IFDIR | 0o755, true)?;
        t.add_child(2, "deep", 4, libc::S_IFDIR | 0o755, true)?;
        t.add_child(4, "leaf", 5, libc::S_IFREG | 0o644, false)?;
        t.move_child(ROOT_INO, "src", 3, "moved", false)?;
        assert_eq!(t.find_by_path("/dst/moved/deep/leaf")?, 5);
        assert_eq!(t.path_of(5)?, "/dst/moved/deep/leaf");
        Ok(())
    }

    #[test]
    fn rmdir_of_populated_directory_fails() -> Result<()> {
        let t = tree();
        t.add_child(ROOT_INO, "d", 2, libc::S_IFDIR | 0o755, true)?;
        t.add_child(2, "f", 3, libc::S_IFREG | 0o644, false)?;
        assert_eq!(t.remove_child(ROOT_INO, "d"), Err(FsError::NotEmpty));
        t.remove_child(2, "f")?;
        t.remove_child(ROOT_INO, "d")?;
        Ok(())
    }

    #[test]
    fn hardlinks_share_an_inode() -> Result<()> {
        let t = tree();
        t.add_child(ROOT_INO, "a", 2, libc::S_IFREG | 0o644, false)?;
        t.add_child(ROOT_INO, "b", 2, libc::S_IFREG | 0o644, false)?;
        assert_eq!(t.find_child(ROOT_INO, "a")?, 2);
        assert_eq!(t.find_child(ROOT_INO, "b")?, 2);
        t.remove_child(ROOT_INO, "a")?;
        assert_eq!(t.find_child(ROOT_INO, "b")?, 2);
        assert!(t.contains(2));
        t.remove_child(ROOT_INO, "b")?;
        assert!(!t.contains(2));
        Ok(())
    }

    #[test]
    fn snapshot_lists_parents_first() -> Result<()> {
        let t = tree();
        t.add_child(ROOT_INO, "d", 2, libc::S_IFDIR | 0o755, true)?;
        t.add_child(2, "f", 3, libc::S_IFREG | 0o644, false)?;
        t.add_child(ROOT_INO, "g", 4, libc::S_IFREG | 0o644, false)?;
        let entries = t.snapshot_entries()?;
        assert_eq!(entries.len(), 3);
        let d_pos = entries.iter().position(|e| e.path == "/d").unwrap();
        let f_pos = entries.iter().position(|e| e.path == "/d/f").unwrap();
        assert!(d_pos < f_pos);
        Ok(())
    }

    #[test]
    fn stats_count_directory_kinds() -> Result<()> {
        let t = tree();
        t.add_child(ROOT_INO, "small", 2, libc::S_IFDIR | 0o755, true)?;
        t.add_child(ROOT_INO, "big", 3, libc::S_IFDIR | 0o755, true)?;
        for i in 0..17u32 {
            t.add_child(3, &format!("f{}", i), 100 + i, libc::S_IFREG | 0o644, false)?;
        }
        let stats = t.stats();
        assert_eq!(stats.hashed_directories, 1);
        // Root and /small remain inline.
        assert_eq!(stats.inline_directories, 2);
        assert!(stats.total_pages >= 1);
        Ok(())
    }
}
