// kernel/src/memory/memory_pool.rs
//
// Fixed-block linear memory pool.  Carves a contiguous range of linear
// address space into equal power-of-two blocks, allocated through a bitmap.
// The payload-mapping pools of every address space are built from these.

use super::bitmap::Bitmap;
use super::VirtAddr;
use crate::status::{KernelResult, Status};

#[derive(Debug)]
pub struct MemoryPool {
    base: VirtAddr,
    block_size: usize,
    block_count: usize,
    bitmap: Bitmap,
}

/// The bitmap sizing keeps any single pool at 1024 blocks or fewer.
const POOL_BLOCK_LIMIT: usize = 1024;

impl MemoryPool {
    /// `base` must already be aligned to `block_size`; each pool is carved
    /// from a larger aligned area, which guarantees the alignment of the
    /// blocks inside it.
    pub fn new(base: VirtAddr, pool_size: usize, block_size: usize) -> MemoryPool {
        debug_assert!(base.0 != 0);
        debug_assert!(block_size != 0);
        debug_assert!(block_size.is_power_of_two());
        debug_assert!(base.0 as usize % block_size == 0);

        let block_count = (pool_size / block_size).min(POOL_BLOCK_LIMIT);
        MemoryPool {
            base,
            block_size,
            block_count,
            bitmap: Bitmap::new(block_count),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Reserve the next free block, or None if the pool is exhausted.
    pub fn allocate_block(&mut self) -> Option<VirtAddr> {
        match self.bitmap.allocate() {
            Some(index) => Some(VirtAddr(self.base.0 + (index * self.block_size) as u32)),
            None => {
                log::trace!(
                    "pool at {:#x} (blocksize {}) exhausted",
                    self.base.0,
                    self.block_size
                );
                None
            }
        }
    }

    /// Release a block back into the pool.  The block is immediately
    /// eligible for reallocation; the caller must not touch it again.
    pub fn free_block(&mut self, block: VirtAddr) -> KernelResult<()> {
        debug_assert!(block >= self.base);
        debug_assert!((block.0 as usize) % self.block_size == 0);

        let index = (block.0 - self.base.0) as usize / self.block_size;
        if index >= self.block_count {
            log::warn!(
                "cannot return block at {:#x} to pool at {:#x}",
                block.0,
                self.base.0
            );
            return Err(Status::InvalidData);
        }
        self.bitmap.free(index);
        Ok(())
    }

    /// Does `block` lie inside this pool's range?
    pub fn owns(&self, block: VirtAddr) -> bool {
        let offset = block.0.wrapping_sub(self.base.0) as usize;
        block >= self.base && offset / self.block_size < self.block_count
    }
}
