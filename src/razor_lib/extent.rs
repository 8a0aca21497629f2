/// Extent mapping for file data.
///
/// Representation per inode, selected by the storage-mode tag:
/// - `InlineData`: content up to 32 bytes lives in the inode payload.
/// - `InlineExtents`: the payload holds up to two extent descriptors.
/// - `ExtentTree`: the payload's first four bytes name a block holding an
///   extent-tree node with room for ~254 descriptors.
///
/// Extents map logical byte ranges onto contiguous physical block runs; a
/// block number of `EXTENT_HOLE` marks a sparse hole whose reads are zeros.
use std::mem::size_of;

use log::{debug, warn};
use zerocopy::AsBytes;

use crate::razor_lib::alloc::BlockAllocator;
use crate::razor_lib::errors::{FsError, FsResult};
use crate::razor_lib::inode::{Inode, StorageMode, INODE_INLINE_DATA};
use crate::razor_lib::utils::{deserialize_row, serialize_row};

/// Max inline extents in the inode payload.
pub const EXTENT_INLINE_MAX: usize = 2;
/// Extents per 4 KiB tree block.
pub const EXTENT_PER_BLOCK: usize = 254;
/// Sparse hole marker.
pub const EXTENT_HOLE: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C, packed)]
pub struct Extent {
    pub logical_offset: u64,
    /// Starting physical block, or `EXTENT_HOLE`.
    pub block_num: u32,
    pub num_blocks: u32,
}

const _: () = assert!(size_of::<Extent>() == 16);

impl Extent {
    pub fn is_hole(&self) -> bool {
        self.block_num == EXTENT_HOLE
    }

    fn logical_end(&self, block_size: u32) -> u64 {
        self.logical_offset + self.num_blocks as u64 * block_size as u64
    }
}

#[repr(C, packed)]
struct ExtentTreeNode {
    num_extents: u32,
    _pad: u32,
    extents: [Extent; EXTENT_PER_BLOCK],
}

const EXTENT_TREE_NODE_SIZE: usize = size_of::<ExtentTreeNode>();
const _: () = assert!(EXTENT_TREE_NODE_SIZE <= 4096);

fn tree_block_of(inode: &Inode) -> u32 {
    u32::from_le_bytes([inode.data[0], inode.data[1], inode.data[2], inode.data[3]])
}

fn set_tree_block(inode: &mut Inode, block: u32) {
    inode.data = [0; INODE_INLINE_DATA];
    inode.data[..4].copy_from_slice(block.as_bytes());
}

fn load_tree(alloc: &BlockAllocator, block: u32) -> FsResult<Box<ExtentTreeNode>> {
    if block == 0 || block == EXTENT_HOLE {
        return Err(FsError::Corruption(format!(
            "extent tree at invalid block {}",
            block
        )));
    }
    let mut buf = vec![0u8; EXTENT_TREE_NODE_SIZE];
    alloc.read(block, &mut buf, 0)?;
    let node: ExtentTreeNode = unsafe { deserialize_row(&buf) };
    if node.num_extents as usize > EXTENT_PER_BLOCK {
        return Err(FsError::Corruption(format!(
            "extent tree block {} claims {} extents",
            block,
            { node.num_extents }
        )));
    }
    Ok(Box::new(node))
}

fn save_tree(alloc: &BlockAllocator, block: u32, node: &ExtentTreeNode) -> FsResult<()> {
    let bytes = unsafe { serialize_row(node) };
    alloc.write(block, bytes, 0)?;
    Ok(())
}

/// Every live extent of the inode, in logical order.
pub fn extents(inode: &Inode, alloc: &BlockAllocator) -> FsResult<Vec<Extent>> {
    let mut list = match inode.storage_mode() {
        StorageMode::InlineData => Vec::new(),
        StorageMode::InlineExtents => {
            let mut v = Vec::with_capacity(EXTENT_INLINE_MAX);
            for i in 0..EXTENT_INLINE_MAX {
                let e: Extent = unsafe { deserialize_row(&inode.data[i * 16..]) };
                if e.num_blocks > 0 {
                    v.push(e);
                }
            }
            v
        }
        StorageMode::ExtentTree => {
            let node = load_tree(alloc, tree_block_of(inode))?;
            node.extents[..node.num_extents as usize].to_vec()
        }
    };
    list.sort_by_key(|e| e.logical_offset);
    Ok(list)
}

/// Write the extent list back, promoting to a tree block when the inline
/// slots no longer suffice.
fn store_extents(inode: &mut Inode, alloc: &BlockAllocator, list: &[Extent]) -> FsResult<()> {
    match inode.storage_mode() {
        StorageMode::ExtentTree => {
            if list.len() > EXTENT_PER_BLOCK {
                warn!(
                    "inode {}: {} extents exceed tree-block capacity",
                    inode.inode_num,
                    list.len()
                );
                return Err(FsError::Io("extent tree capacity exceeded".into()));
            }
            let block = tree_block_of(inode);
            let mut node = Box::new(ExtentTreeNode {
                num_extents: list.len() as u32,
                _pad: 0,
                extents: [Extent::default(); EXTENT_PER_BLOCK],
            });
            node.extents[..list.len()].copy_from_slice(list);
            save_tree(alloc, block, &node)
        }
        _ => {
            if list.len() <= EXTENT_INLINE_MAX {
                inode.data = [0; INODE_INLINE_DATA];
                for (i, e) in list.iter().enumerate() {
                    let bytes = unsafe { serialize_row(e) };
                    inode.data[i * 16..i * 16 + 16].copy_from_slice(bytes);
                }
                inode.set_storage_mode(StorageMode::InlineExtents);
                Ok(())
            } else {
                // Inline slots exhausted: move everything into a fresh tree
                // block and point the payload at it.
                let block = alloc.alloc(1)?;
                let mut node = Box::new(ExtentTreeNode {
                    num_extents: list.len() as u32,
                    _pad: 0,
                    extents: [Extent::default(); EXTENT_PER_BLOCK],
                });
                if list.len() > EXTENT_PER_BLOCK {
                    alloc.free(block, 1)?;
                    return Err(FsError::Io("extent tree capacity exceeded".into()));
                }
                node.extents[..list.len()].copy_from_slice(list);
                if let Err(e) = save_tree(alloc, block, &node) {
                    alloc.free(block, 1)?;
                    return Err(e);
                }
                set_tree_block(inode, block);
                inode.set_storage_mode(StorageMode::ExtentTree);
                debug!("inode {}: promoted extents to tree block {}", inode.inode_num, block);
                Ok(())
            }
        }
    }
}

/// Coalesce extents whose logical and physical ranges are both exactly
/// adjacent. Holes never merge.
fn coalesce(list: &mut Vec<Extent>, block_size: u32) {
    list.sort_by_key(|e| e.logical_offset);
    let mut i = 0;
    while i + 1 < list.len() {
        let a = list[i];
        let b = list[i + 1];
        if !a.is_hole()
            && !b.is_hole()
            && a.logical_end(block_size) == b.logical_offset
            && a.block_num + a.num_blocks == b.block_num
        {
            list[i].num_blocks += b.num_blocks;
            list.remove(i + 1);
        } else {
            i += 1;
        }
    }
}

/// Map a logical offset to `(block, offset_in_block)`.
///
/// The block may be `EXTENT_HOLE` for a mapped sparse region; an entirely
/// unmapped offset is `NotFound`.
pub fn map(inode: &Inode, alloc: &BlockAllocator, logical_offset: u64) -> FsResult<(u32, u32)> {
    let block_size = alloc.block_size();
    for e in extents(inode, alloc)? {
        if logical_offset >= e.logical_offset && logical_offset < e.logical_end(block_size) {
            let within = logical_offset - e.logical_offset;
            let block_index = (within / block_size as u64) as u32;
            let block = if e.is_hole() {
                EXTENT_HOLE
            } else {
                e.block_num + block_index
            };
            return Ok((block, (within % block_size as u64) as u32));
        }
    }
    Err(FsError::NotFound)
}

/// Insert a mapping, merging with an adjacent extent when the logical and
/// physical ranges line up.
pub fn add(
    inode: &mut Inode,
    alloc: &BlockAllocator,
    logical_offset: u64,
    block_num: u32,
    num_blocks: u32,
) -> FsResult<()> {
    if num_blocks == 0 {
        return Err(FsError::InvalidArgument("empty extent".into()));
    }
    if inode.storage_mode() == StorageMode::InlineData {
        // Caller converts inline content first; the payload is now ours.
        inode.data = [0; INODE_INLINE_DATA];
        inode.set_storage_mode(StorageMode::InlineExtents);
    }
    let mut list = extents(inode, alloc)?;
    list.push(Extent {
        logical_offset,
        block_num,
        num_blocks,
    });
    coalesce(&mut list, alloc.block_size());
    store_extents(inode, alloc, &list)
}

/// Number of live extents (0 for inline data).
pub fn count(inode: &Inode, alloc: &BlockAllocator) -> FsResult<usize> {
    if inode.storage_mode() == StorageMode::InlineData {
        return Ok(0);
    }
    Ok(extents(inode, alloc)?.len())
}

/// Read up to `buf.len()` bytes from `offset`, clipped to the file size.
/// Unmapped ranges and holes read as zeros.
pub fn read(inode: &Inode, alloc: &BlockAllocator, buf: &mut [u8], offset: u64) -> FsResult<usize> {
    if offset >= inode.size {
        return Ok(0);
    }
    let len = buf.len().min((inode.size - offset) as usize);
    if len == 0 {
        return Ok(0);
    }

    if inode.storage_mode() == StorageMode::InlineData {
        // The file may have been grown past the inline area by truncate;
        // everything beyond it is a hole.
        let start = offset as usize;
        let mut filled = 0;
        if start < INODE_INLINE_DATA {
            filled = len.min(INODE_INLINE_DATA - start);
            buf[..filled].copy_from_slice(&inode.data[start..start + filled]);
        }
        buf[filled..len].fill(0);
        return Ok(len);
    }

    let block_size = alloc.block_size() as u64;
    let mut total = 0usize;
    while total < len {
        let pos = offset + total as u64;
        let remaining = len - total;
        match map(inode, alloc, pos) {
            Ok((block, block_offset)) => {
                let chunk = remaining.min((block_size - block_offset as u64) as usize);
                if block == EXTENT_HOLE {
                    buf[total..total + chunk].fill(0);
                } else {
                    alloc.read(block, &mut buf[total..total + chunk], block_offset)?;
                }
                total += chunk;
            }
            Err(FsError::NotFound) => {
                // Sparse region with no descriptor at all.
                let block_offset = pos % block_size;
                let chunk = remaining.min((block_size - block_offset) as usize);
                buf[total..total + chunk].fill(0);
                total += chunk;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

/// Replace the hole descriptor covering `logical` with a real block for that
/// one block position, splitting the hole as needed.
fn fill_hole_block(
    inode: &mut Inode,
    alloc: &BlockAllocator,
    logical: u64,
    new_block: u32,
) -> FsResult<()> {
    let block_size = alloc.block_size();
    let mut list = extents(inode, alloc)?;
    let idx = list
        .iter()
        .position(|e| {
            e.is_hole() && logical >= e.logical_offset && logical < e.logical_end(block_size)
        })
        .ok_or_else(|| FsError::Io("no hole at offset".into()))?;
    let hole = list.remove(idx);
    let block_logical = (logical / block_size as u64) * block_size as u64;
    if block_logical > hole.logical_offset {
        list.push(Extent {
            logical_offset: hole.logical_offset,
            block_num: EXTENT_HOLE,
            num_blocks: ((block_logical - hole.logical_offset) / block_size as u64) as u32,
        });
    }
    list.push(Extent {
        logical_offset: block_logical,
        block_num: new_block,
        num_blocks: 1,
    });
    let after = block_logical + block_size as u64;
    if after < hole.logical_end(block_size) {
        list.push(Extent {
            logical_offset: after,
            block_num: EXTENT_HOLE,
            num_blocks: ((hole.logical_end(block_size) - after) / block_size as u64) as u32,
        });
    }
    coalesce(&mut list, block_size);
    store_extents(inode, alloc, &list)
}

/// Write `data` at `offset`, growing the file and allocating blocks as
/// needed. May transition an inline-data inode to extents.
pub fn write(inode: &mut Inode, alloc: &BlockAllocator, data: &[u8], offset: u64) -> FsResult<usize> {
    if data.is_empty() {
        return Ok(0);
    }
    let end = offset + data.len() as u64;

    // Small writes stay inline.
    if inode.storage_mode() == StorageMode::InlineData && end <= INODE_INLINE_DATA as u64 {
        let start = offset as usize;
        inode.data[start..start + data.len()].copy_from_slice(data);
        if end > inode.size {
            inode.size = end;
        }
        return Ok(data.len());
    }

    // Inline content must move out before the payload can hold extents.
    if inode.storage_mode() == StorageMode::InlineData {
        let saved_size = (inode.size as usize).min(INODE_INLINE_DATA);
        let saved: [u8; INODE_INLINE_DATA] = inode.data;
        inode.data = [0; INODE_INLINE_DATA];
        inode.set_storage_mode(StorageMode::InlineExtents);
        if saved_size > 0 {
            let block = match alloc.alloc(1) {
                Ok(b) => b,
                Err(e) => {
                    inode.data = saved;
                    inode.set_storage_mode(StorageMode::InlineData);
                    return Err(e);
                }
            };
            alloc.write(block, &saved[..saved_size], 0)?;
            add(inode, alloc, 0, block, 1)?;
        }
        debug!("inode {}: inline data converted to extents", inode.inode_num);
    }

    let block_size = alloc.block_size() as u64;
    let mut total = 0usize;
    while total < data.len() {
        let pos = offset + total as u64;
        let block_logical = (pos / block_size) * block_size;
        let (block, block_offset) = match map(inode, alloc, pos) {
            Ok((b, off)) if b != EXTENT_HOLE => (b, off),
            mapped => {
                let new_block = match alloc.alloc(1) {
                    Ok(b) => b,
                    Err(e) => return if total > 0 { Ok(total) } else { Err(e) },
                };
                match mapped {
                    Ok(_) => {
                        if let Err(e) = fill_hole_block(inode, alloc, pos, new_block) {
                            alloc.free(new_block, 1)?;
                            return Err(e);
                        }
                    }
                    Err(FsError::NotFound) => {
                        if let Err(e) = add(inode, alloc, block_logical, new_block, 1) {
                            alloc.free(new_block, 1)?;
                            return if total > 0 { Ok(total) } else { Err(e) };
                        }
                    }
                    Err(e) => {
                        alloc.free(new_block, 1)?;
                        return Err(e);
                    }
                }
                (new_block, (pos % block_size) as u32)
            }
        };
        let chunk = (data.len() - total).min((block_size - block_offset as u64) as usize);
        alloc.write(block, &data[total..total + chunk], block_offset)?;
        total += chunk;
    }

    if offset + total as u64 > inode.size {
        inode.size = offset + total as u64;
    }
    Ok(total)
}

/// Change the file size. Shrinking releases whole blocks past the new end
/// and zeroes the tail of the boundary block, so a later regrowth reads
/// zeros there; growth just opens a hole.
pub fn truncate(inode: &mut Inode, alloc: &BlockAllocator, new_size: u64) -> FsResult<()> {
    if inode.storage_mode() == StorageMode::InlineData {
        if new_size < inode.size {
            let end = (inode.size as usize).min(INODE_INLINE_DATA);
            for b in &mut inode.data[(new_size as usize).min(end)..end] {
                *b = 0;
            }
        }
        inode.size = new_size;
        return Ok(());
    }
    if new_size < inode.size {
        let bs = alloc.block_size() as u64;
        let boundary = ((new_size + bs - 1) / bs) * bs;
        let max_end = extents(inode, alloc)?
            .iter()
            .map(|e| e.logical_end(alloc.block_size()))
            .max()
            .unwrap_or(0);
        if max_end > boundary {
            remove(inode, alloc, boundary, max_end - boundary)?;
        }
        if new_size % bs != 0 {
            if let Ok((block, off)) = map(inode, alloc, new_size) {
                if block != EXTENT_HOLE {
                    let zeros = vec![0u8; (bs - off as u64) as usize];
                    alloc.write(block, &zeros, off)?;
                }
            }
        }
    }
    inode.size = new_size;
    Ok(())
}

/// Remove the physical mapping of `[logical_offset, logical_offset + length)`,
/// freeing whole blocks fully inside the range.
pub fn remove(
    inode: &mut Inode,
    alloc: &BlockAllocator,
    logical_offset: u64,
    length: u64,
) -> FsResult<()> {
    if length == 0 {
        return Ok(());
    }
    let block_size = alloc.block_size() as u64;
    let start = ((logical_offset + block_size - 1) / block_size) * block_size;
    let end = ((logical_offset + length) / block_size) * block_size;
    if start >= end {
        return Ok(());
    }
    let mut list = extents(inode, alloc)?;
    let mut out: Vec<Extent> = Vec::with_capacity(list.len() + 2);
    for e in list.drain(..) {
        let e_start = e.logical_offset;
        let e_end = e.logical_end(alloc.block_size());
        if e_end <= start || e_start >= end {
            out.push(e);
            continue;
        }
        let cut_start = e_start.max(start);
        let cut_end = e_end.min(end);
        // Left remainder.
        if cut_start > e_start {
            out.push(Extent {
                logical_offset: e_start,
                block_num: e.block_num,
                num_blocks: ((cut_start - e_start) / block_size) as u32,
            });
        }
        // Right remainder.
        if cut_end < e_end {
            let skip = ((cut_end - e_start) / block_size) as u32;
            out.push(Extent {
                logical_offset: cut_end,
                block_num: if e.is_hole() {
                    EXTENT_HOLE
                } else {
                    e.block_num + skip
                },
                num_blocks: ((e_end - cut_end) / block_size) as u32,
            });
        }
        // Middle: release physical blocks.
        if !e.is_hole() {
            let first = e.block_num + ((cut_start - e_start) / block_size) as u32;
            let n = ((cut_end - cut_start) / block_size) as u32;
            alloc.free(first, n)?;
        }
    }
    coalesce(&mut out, alloc.block_size());
    store_extents(inode, alloc, &out)
}

/// Punch a sparse hole: free whole blocks inside the range and record a
/// hole descriptor; partial-block edges are zeroed in place.
pub fn punch_hole(
    inode: &mut Inode,
    alloc: &BlockAllocator,
    offset: u64,
    length: u64,
) -> FsResult<()> {
    if length == 0 || offset >= inode.size {
        return Ok(());
    }
    let end = (offset + length).min(inode.size);
    let block_size = alloc.block_size() as u64;
    let hole_start = ((offset + block_size - 1) / block_size) * block_size;
    let hole_end = (end / block_size) * block_size;

    // Zero the ragged edges through the normal write path.
    if hole_start > offset {
        let edge = (hole_start.min(end) - offset) as usize;
        write(inode, alloc, &vec![0u8; edge], offset)?;
    }
    if hole_end < end && hole_end >= hole_start {
        write(inode, alloc, &vec![0u8; (end - hole_end) as usize], hole_end)?;
    }

    if hole_start >= hole_end {
        return Ok(());
    }
    remove(inode, alloc, hole_start, hole_end - hole_start)?;
    let mut list = extents(inode, alloc)?;
    list.push(Extent {
        logical_offset: hole_start,
        block_num: EXTENT_HOLE,
        num_blocks: ((hole_end - hole_start) / block_size) as u32,
    });
    coalesce(&mut list, alloc.block_size());
    store_extents(inode, alloc, &list)
}

/// Release every physical block the inode references and reset the payload.
pub fn free_all(inode: &mut Inode, alloc: &BlockAllocator) -> FsResult<()> {
    match inode.storage_mode() {
        StorageMode::InlineData => {}
        StorageMode::InlineExtents => {
            for e in extents(inode, alloc)? {
                if !e.is_hole() {
                    alloc.free(e.block_num, e.num_blocks)?;
                }
            }
        }
        StorageMode::ExtentTree => {
            let tree_block = tree_block_of(inode);
            for e in extents(inode, alloc)? {
                if !e.is_hole() {
                    alloc.free(e.block_num, e.num_blocks)?;
                }
            }
            alloc.free(tree_block, 1)?;
        }
    }
    inode.data = [0; INODE_INLINE_DATA];
    inode.set_storage_mode(StorageMode::InlineData);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::razor_lib::inode::S_IFREG;
    use anyhow::Result;

    fn setup() -> (Inode, BlockAllocator) {
        let inode = Inode {
            inode_num: 7,
            nlink: 1,
            mode: S_IFREG | 0o644,
            ..Default::default()
        };
        (inode, BlockAllocator::new(1024, 4096).unwrap())
    }

    #[test]
    fn inline_data_round_trip() -> Result<()> {
        let (mut inode, alloc) = setup();
        assert_eq!(write(&mut inode, &alloc, b"tiny file", 0)?, 9);
        assert_eq!(inode.size, 9);
        assert_eq!(inode.storage_mode(), StorageMode::InlineData);
        assert_eq!(count(&inode, &alloc)?, 0);
        let mut buf = [0u8; 9];
        assert_eq!(read(&inode, &alloc, &mut buf, 0)?, 9);
        assert_eq!(&buf, b"tiny file");
        Ok(())
    }

    #[test]
    fn inline_to_extents_conversion_preserves_content() -> Result<()> {
        let (mut inode, alloc) = setup();
        write(&mut inode, &alloc, b"0123456789abcdef0123456789abcdef", 0)?; // 32 B inline
        assert_eq!(inode.storage_mode(), StorageMode::InlineData);
        write(&mut inode, &alloc, b"MORE", 32)?;
        assert_eq!(inode.storage_mode(), StorageMode::InlineExtents);
        assert_eq!(inode.size, 36);
        let mut buf = [0u8; 36];
        read(&inode, &alloc, &mut buf, 0)?;
        assert_eq!(&buf[..32], b"0123456789abcdef0123456789abcdef");
        assert_eq!(&buf[32..], b"MORE");
        Ok(())
    }

    #[test]
    fn adjacent_insertions_merge() -> Result<()> {
        let (mut inode, alloc) = setup();
        inode.size = 100_000;
        let b1 = alloc.alloc(2)?;
        add(&mut inode, &alloc, 0, b1, 1)?;
        assert_eq!(count(&inode, &alloc)?, 1);
        add(&mut inode, &alloc, 4096, b1 + 1, 1)?;
        // Logical and physical both adjacent: the count drops instead of
        // growing.
        assert_eq!(count(&inode, &alloc)?, 1);
        Ok(())
    }

    #[test]
    fn gap_prevents_merge_and_fill_collapses() -> Result<()> {
        let (mut inode, alloc) = setup();
        inode.size = 1024 * 1024;
        // Blocks laid out so that filling the logical gap restores full
        // physical contiguity.
        let base = alloc.alloc(5)?;
        add(&mut inode, &alloc, 0, base, 1)?;
        add(&mut inode, &alloc, 4096, base + 1, 1)?;
        assert_eq!(count(&inode, &alloc)?, 1);
        add(&mut inode, &alloc, 16384, base + 4, 1)?;
        assert_eq!(count(&inode, &alloc)?, 2);
        add(&mut inode, &alloc, 8192, base + 2, 1)?;
        add(&mut inode, &alloc, 12288, base + 3, 1)?;
        assert_eq!(count(&inode, &alloc)?, 1);
        Ok(())
    }

    #[test]
    fn third_extent_promotes_to_tree() -> Result<()> {
        let (mut inode, alloc) = setup();
        inode.size = 1024 * 1024;
        let b1 = alloc.alloc(1)?;
        let b2 = alloc.alloc(1)?;
        let b3 = alloc.alloc(1)?;
        add(&mut inode, &alloc, 0, b1, 1)?;
        add(&mut inode, &alloc, 2 * 4096, b2, 1)?;
        assert_eq!(inode.storage_mode(), StorageMode::InlineExtents);
        add(&mut inode, &alloc, 4 * 4096, b3, 1)?;
        assert_eq!(inode.storage_mode(), StorageMode::ExtentTree);
        assert_eq!(count(&inode, &alloc)?, 3);
        // All three still resolve.
        assert_eq!(map(&inode, &alloc, 0)?.0, b1);
        assert_eq!(map(&inode, &alloc, 2 * 4096)?.0, b2);
        assert_eq!(map(&inode, &alloc, 4 * 4096)?.0, b3);
        Ok(())
    }

    #[test]
    fn sparse_write_reads_zeros_before_data() -> Result<()> {
        let (mut inode, alloc) = setup();
        write(&mut inode, &alloc, b"END", 1_000_000)?;
        assert_eq!(inode.size, 1_000_003);
        let mut buf = [0xAAu8; 10];
        assert_eq!(read(&inode, &alloc, &mut buf, 0)?, 10);
        assert_eq!(buf, [0u8; 10]);
        let mut tail = [0u8; 3];
        read(&inode, &alloc, &mut tail, 1_000_000)?;
        assert_eq!(&tail, b"END");
        Ok(())
    }

    #[test]
    fn read_clips_at_eof() -> Result<()> {
        let (mut inode, alloc) = setup();
        let data = vec![0x5Au8; 5000];
        write(&mut inode, &alloc, &data, 0)?;
        let mut buf = vec![0u8; 4096];
        assert_eq!(read(&inode, &alloc, &mut buf, 4000)?, 1000);
        assert_eq!(read(&inode, &alloc, &mut buf, 5000)?, 0);
        assert_eq!(read(&inode, &alloc, &mut buf, 9999)?, 0);
        Ok(())
    }

    #[test]
    fn write_read_round_trip_across_blocks() -> Result<()> {
        let (mut inode, alloc) = setup();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(write(&mut inode, &alloc, &data, 100)?, data.len());
        let mut buf = vec![0u8; data.len()];
        assert_eq!(read(&inode, &alloc, &mut buf, 100)?, data.len());
        assert_eq!(buf, data);
        Ok(())
    }

    #[test]
    fn punch_hole_zeroes_and_frees() -> Result<()> {
        let (mut inode, alloc) = setup();
        let data = vec![0xFFu8; 5 * 4096];
        write(&mut inode, &alloc, &data, 0)?;
        let (_, free_before, _) = alloc.stats();
        punch_hole(&mut inode, &alloc, 4096, 3 * 4096)?;
        let (_, free_after, _) = alloc.stats();
        assert!(free_after > free_before);
        let mut buf = vec![0xAAu8; 3 * 4096];
        read(&inode, &alloc, &mut buf, 4096)?;
        assert!(buf.iter().all(|&b| b == 0));
        // Outside the hole the data survives.
        let mut head = [0u8; 16];
        read(&inode, &alloc, &mut head, 0)?;
        assert!(head.iter().all(|&b| b == 0xFF));
        Ok(())
    }

    #[test]
    fn write_into_hole_replaces_it() -> Result<()> {
        let (mut inode, alloc) = setup();
        let data = vec![0x11u8; 3 * 4096];
        write(&mut inode, &alloc, &data, 0)?;
        punch_hole(&mut inode, &alloc, 4096, 4096)?;
        write(&mut inode, &alloc, &vec![0x22u8; 4096], 4096)?;
        let mut buf = vec![0u8; 4096];
        read(&inode, &alloc, &mut buf, 4096)?;
        assert!(buf.iter().all(|&b| b == 0x22));
        Ok(())
    }

    #[test]
    fn free_all_returns_blocks_and_resets_payload() -> Result<()> {
        let (mut inode, alloc) = setup();
        let (_, free_start, _) = alloc.stats();
        let data = vec![1u8; 10 * 4096];
        write(&mut inode, &alloc, &data, 0)?;
        // Force a tree by scattering extents.
        write(&mut inode, &alloc, b"x", 100 * 4096)?;
        write(&mut inode, &alloc, b"y", 200 * 4096)?;
        free_all(&mut inode, &alloc)?;
        let (_, free_end, _) = alloc.stats();
        assert_eq!(free_start, free_end);
        assert_eq!(inode.storage_mode(), StorageMode::InlineData);
        assert_eq!(inode.data, [0u8; INODE_INLINE_DATA]);
        Ok(())
    }

    #[test]
    fn truncate_grow_leaves_hole() -> Result<()> {
        let (mut inode, alloc) = setup();
        write(&mut inode, &alloc, &vec![3u8; 4096], 0)?;
        truncate(&mut inode, &alloc, 3 * 4096)?;
        assert_eq!(inode.size, 3 * 4096);
        let mut buf = vec![0xEEu8; 4096];
        read(&inode, &alloc, &mut buf, 2 * 4096)?;
        assert!(buf.iter().all(|&b| b == 0));
        Ok(())
    }

    #[test]
    fn truncate_shrink_inline_zeroes_tail() -> Result<()> {
        let (mut inode, alloc) = setup();
        write(&mut inode, &alloc, b"0123456789", 0)?;
        truncate(&mut inode, &alloc, 4)?;
        assert_eq!(inode.size, 4);
        truncate(&mut inode, &alloc, 10)?;
        let mut buf = [0xFFu8; 10];
        read(&inode, &alloc, &mut buf, 0)?;
        assert_eq!(&buf[..4], b"0123");
        assert_eq!(&buf[4..], [0u8; 6]);
        Ok(())
    }
}
