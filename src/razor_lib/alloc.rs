/// Bitmap block allocator over a single backing region.
///
/// The region is sized once at init and never moves, so block numbers are
/// stable handles for the lifetime of the filesystem instance. Block 0 is
/// permanently reserved and never handed out.
use std::sync::RwLock;

use log::debug;

use crate::razor_lib::errors::{FsError, FsResult};

pub const BLOCK_SIZE_DEFAULT: u32 = 4096;
const BITS_PER_WORD: u32 = 32;

struct AllocState {
    /// One bit per block, 1 = used.
    bitmap: Vec<u32>,
    free_blocks: u32,
    /// First-fit search resumes here.
    hint: u32,
}

pub struct BlockAllocator {
    total_blocks: u32,
    block_size: u32,
    state: RwLock<AllocState>,
    storage: RwLock<Vec<u8>>,
}

#[inline]
fn bit_test(bitmap: &[u32], block: u32) -> bool {
    bitmap[(block / BITS_PER_WORD) as usize] & (1 << (block % BITS_PER_WORD)) != 0
}

#[inline]
fn bit_set(bitmap: &mut [u32], block: u32) {
    bitmap[(block / BITS_PER_WORD) as usize] |= 1 << (block % BITS_PER_WORD);
}

#[inline]
fn bit_clear(bitmap: &mut [u32], block: u32) {
    bitmap[(block / BITS_PER_WORD) as usize] &= !(1 << (block % BITS_PER_WORD));
}

impl BlockAllocator {
    pub fn new(total_blocks: u32, block_size: u32) -> FsResult<Self> {
        if total_blocks < 2 || block_size == 0 {
            return Err(FsError::InvalidArgument(format!(
                "unusable region: {} blocks of {} bytes",
                total_blocks, block_size
            )));
        }
        let words = ((total_blocks + BITS_PER_WORD - 1) / BITS_PER_WORD) as usize;
        let mut bitmap = vec![0u32; words];
        // Block 0 is reserved.
        bit_set(&mut bitmap, 0);
        Ok(Self {
            total_blocks,
            block_size,
            state: RwLock::new(AllocState {
                bitmap,
                free_blocks: total_blocks - 1,
                hint: 1,
            }),
            storage: RwLock::new(vec![0u8; total_blocks as usize * block_size as usize]),
        })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    /// Allocate `num_blocks` contiguous blocks, first fit from the hint.
    pub fn alloc(&self, num_blocks: u32) -> FsResult<u32> {
        if num_blocks == 0 {
            return Err(FsError::InvalidArgument("zero-block allocation".into()));
        }
        let mut state = self.state.write().unwrap();
        if state.free_blocks < num_blocks {
            return Err(FsError::NoSpace);
        }
        let start_hint = state.hint;
        for i in 0..self.total_blocks {
            let block = (start_hint + i) % self.total_blocks;
            if block == 0 || bit_test(&state.bitmap, block) {
                continue;
            }
            // Runs never wrap: contiguous means contiguous block numbers.
            if block + num_blocks > self.total_blocks {
                continue;
            }
            let mut run = 1;
            while run < num_blocks && !bit_test(&state.bitmap, block + run) {
                run += 1;
            }
            if run >= num_blocks {
                for j in 0..num_blocks {
                    bit_set(&mut state.bitmap, block + j);
                }
                state.free_blocks -= num_blocks;
                state.hint = (block + num_blocks) % self.total_blocks;
                debug!("alloc {} blocks at {}", num_blocks, block);
                return Ok(block);
            }
        }
        Err(FsError::NoSpace)
    }

    /// Free a previously allocated range. Every block in the range must be
    /// currently allocated, or the bitmap is left untouched.
    pub fn free(&self, block_num: u32, num_blocks: u32) -> FsResult<()> {
        if block_num == 0
            || num_blocks == 0
            || block_num >= self.total_blocks
            || block_num as u64 + num_blocks as u64 > self.total_blocks as u64
        {
            return Err(FsError::InvalidArgument(format!(
                "free of blocks [{}, {})",
                block_num,
                block_num as u64 + num_blocks as u64
            )));
        }
        let mut state = self.state.write().unwrap();
        for i in 0..num_blocks {
            if !bit_test(&state.bitmap, block_num + i) {
                return Err(FsError::InvalidArgument(format!(
                    "double free of block {}",
                    block_num + i
                )));
            }
        }
        for i in 0..num_blocks {
            bit_clear(&mut state.bitmap, block_num + i);
        }
        state.free_blocks += num_blocks;
        debug!("freed {} blocks at {}", num_blocks, block_num);
        Ok(())
    }

    pub fn is_allocated(&self, block_num: u32) -> bool {
        if block_num >= self.total_blocks {
            return false;
        }
        if block_num == 0 {
            return true;
        }
        bit_test(&self.state.read().unwrap().bitmap, block_num)
    }

    /// Copy up to `buf.len()` bytes out of a block, starting at
    /// `offset_in_block`. Bounded by the block size.
    pub fn read(&self, block_num: u32, buf: &mut [u8], offset_in_block: u32) -> FsResult<usize> {
        self.check_span(block_num, buf.len(), offset_in_block)?;
        let storage = self.storage.read().unwrap();
        let base = block_num as usize * self.block_size as usize + offset_in_block as usize;
        buf.copy_from_slice(&storage[base..base + buf.len()]);
        Ok(buf.len())
    }

    /// Copy bytes into a block at `offset_in_block`.
    pub fn write(&self, block_num: u32, data: &[u8], offset_in_block: u32) -> FsResult<usize> {
        self.check_span(block_num, data.len(), offset_in_block)?;
        let mut storage = self.storage.write().unwrap();
        let base = block_num as usize * self.block_size as usize + offset_in_block as usize;
        storage[base..base + data.len()].copy_from_slice(data);
        Ok(data.len())
    }

    fn check_span(&self, block_num: u32, len: usize, offset_in_block: u32) -> FsResult<()> {
        if block_num == 0 || block_num >= self.total_blocks {
            return Err(FsError::InvalidArgument(format!(
                "block {} out of range",
                block_num
            )));
        }
        if offset_in_block as usize + len > self.block_size as usize {
            return Err(FsError::InvalidArgument(format!(
                "span {}+{} exceeds block size {}",
                offset_in_block, len, self.block_size
            )));
        }
        Ok(())
    }

    /// (total, free, used)
    pub fn stats(&self) -> (u32, u32, u32) {
        let state = self.state.read().unwrap();
        (
            self.total_blocks,
            state.free_blocks,
            self.total_blocks - state.free_blocks,
        )
    }

    /// `(free_runs - 1) / free_blocks`, clamped into [0, 1].
    pub fn fragmentation(&self) -> f64 {
        let state = self.state.read().unwrap();
        if state.free_blocks == 0 {
            return 0.0;
        }
        let mut runs = 0u32;
        let mut in_run = false;
        for block in 1..self.total_blocks {
            let free = !bit_test(&state.bitmap, block);
            if free && !in_run {
                runs += 1;
            }
            in_run = free;
        }
        if runs <= 1 {
            return 0.0;
        }
        ((runs - 1) as f64 / state.free_blocks as f64).min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn block_zero_is_reserved() -> Result<()> {
        let alloc = BlockAllocator::new(16, 512)?;
        for _ in 0..15 {
            assert_ne!(alloc.alloc(1)?, 0);
        }
        assert_eq!(alloc.alloc(1), Err(FsError::NoSpace));
        Ok(())
    }

    #[test]
    fn alloc_free_restores_free_count() -> Result<()> {
        let alloc = BlockAllocator::new(64, 512)?;
        let (_, free_before, _) = alloc.stats();
        let start = alloc.alloc(8)?;
        let (_, free_mid, used) = alloc.stats();
        assert_eq!(free_mid, free_before - 8);
        assert_eq!(used, 64 - free_mid);
        alloc.free(start, 8)?;
        let (_, free_after, _) = alloc.stats();
        assert_eq!(free_after, free_before);
        Ok(())
    }

    #[test]
    fn invalid_free_leaves_bitmap_intact() -> Result<()> {
        let alloc = BlockAllocator::new(32, 512)?;
        let start = alloc.alloc(4)?;
        // Range straddling allocated and free blocks must fail whole.
        assert!(matches!(
            alloc.free(start, 8),
            Err(FsError::InvalidArgument(_))
        ));
        for i in 0..4 {
            assert!(alloc.is_allocated(start + i));
        }
        alloc.free(start, 4)?;
        assert!(matches!(
            alloc.free(start, 4),
            Err(FsError::InvalidArgument(_))
        ));
        Ok(())
    }

    #[test]
    fn contiguous_or_fails() -> Result<()> {
        let alloc = BlockAllocator::new(8, 512)?;
        // Blocks 1..8 free; carve a hole at 4.
        let a = alloc.alloc(3)?; // 1,2,3
        let b = alloc.alloc(1)?; // 4
        let _c = alloc.alloc(3)?; // 5,6,7
        alloc.free(b, 1)?;
        alloc.free(a, 3)?;
        // Largest contiguous run is 1..5 (4 blocks).
        assert_eq!(alloc.alloc(5), Err(FsError::NoSpace));
        assert!(alloc.alloc(4).is_ok());
        Ok(())
    }

    #[test]
    fn read_write_within_block() -> Result<()> {
        let alloc = BlockAllocator::new(8, 512)?;
        let b = alloc.alloc(1)?;
        alloc.write(b, b"payload", 100)?;
        let mut buf = [0u8; 7];
        alloc.read(b, &mut buf, 100)?;
        assert_eq!(&buf, b"payload");
        assert!(alloc.write(b, &[0u8; 16], 500).is_err());
        Ok(())
    }

    #[test]
    fn fragmentation_ratio() -> Result<()> {
        let alloc = BlockAllocator::new(10, 512)?;
        assert_eq!(alloc.fragmentation(), 0.0);
        // Allocate 1..=9 then free alternating blocks to split the free space.
        let start = alloc.alloc(9)?;
        assert_eq!(start, 1);
        alloc.free(2, 1)?;
        alloc.free(4, 1)?;
        alloc.free(6, 1)?;
        // Three single-block free runs.
        let frag = alloc.fragmentation();
        assert!(frag > 0.5 && frag <= 1.0, "frag = {}", frag);
        Ok(())
    }
}
