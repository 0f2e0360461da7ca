// kernel/src/memory/frame_allocator.rs
//
// Physical frame allocation.  All RAM above the nonpaged kernel boundary is
// carved into 4 MiB regions of 1024 frames; each region runs an independent
// buddy allocator over block orders 0..=6 (1 to 64 contiguous frames).

use alloc::vec::Vec;
use spin::Mutex;

use super::bitmap::Bitmap;
use super::{MemoryFlags, PhysAddr, INVALID_FRAME, KERNEL_PAGED_BOUNDARY, PAGE_SIZE};
use crate::status::{KernelResult, Status};

pub const FRAME_COUNT_PER_REGION: usize = 1024;
pub const REGION_SIZE: u32 = PAGE_SIZE * FRAME_COUNT_PER_REGION as u32;

/// Block orders 0..=6; the largest block spans 64 contiguous frames (256 KiB)
pub const MAX_BLOCK_ORDER: usize = 7;
pub const MAX_BLOCK_SIZE: usize = 1 << (MAX_BLOCK_ORDER - 1);

/// A 4 MiB region of contiguous physical memory, subdivided into blocks of
/// one or more contiguous frames.  A bit set in pool k means "the block of
/// 2^k frames at this index is in use or does not exist".
pub struct Region {
    base: PhysAddr,
    pool: Vec<Bitmap>,
}

impl Region {
    /// Initially a region contains only maximum-sized blocks; the smaller
    /// pools stay empty until a larger block is split.
    pub fn new(base: PhysAddr) -> Region {
        debug_assert!(base.0 % REGION_SIZE == 0);

        let mut pool = Vec::with_capacity(MAX_BLOCK_ORDER);
        for _ in 0..MAX_BLOCK_ORDER {
            let mut bitmap = Bitmap::new(FRAME_COUNT_PER_REGION);
            bitmap.set_range(0, FRAME_COUNT_PER_REGION);
            pool.push(bitmap);
        }
        let mut region = Region { base, pool };
        let max_block_size = 1 << (MAX_BLOCK_ORDER - 1);
        for index in (0..FRAME_COUNT_PER_REGION).step_by(max_block_size) {
            region.pool[MAX_BLOCK_ORDER - 1].free(index);
        }
        region
    }

    fn buddy_index(frame_index: usize, order: usize) -> usize {
        frame_index ^ (1 << order)
    }

    /// 2^N order of contiguous frames covering `frame_count` frames.
    fn order_of(frame_count: usize) -> usize {
        debug_assert!(frame_count > 0);
        frame_count.next_power_of_two().trailing_zeros() as usize
    }

    /// Allocate a block of physically contiguous frames, splitting larger
    /// free blocks in half as needed.  The block may later be freed as a
    /// unit or as individual frames.
    pub fn allocate_block(&mut self, frame_count: usize) -> Option<PhysAddr> {
        if frame_count == 0 || frame_count > MAX_BLOCK_SIZE {
            return None;
        }
        let order = Self::order_of(frame_count);

        // Smallest pool that can satisfy the request wins
        for larger in order..MAX_BLOCK_ORDER {
            if let Some(index) = self.pool[larger].allocate() {
                if larger > order {
                    self.split(index, order, larger);
                }
                return Some(PhysAddr(self.base.0 + (index as u32) * PAGE_SIZE));
            }
        }
        None
    }

    /// Free a block previously handed out by allocate_block(), then try to
    /// coalesce it with its buddy.
    pub fn free_block(&mut self, frame: PhysAddr, frame_count: usize) {
        debug_assert!(frame != INVALID_FRAME);
        debug_assert!(frame >= self.base);
        debug_assert!(frame.0 < self.base.0 + REGION_SIZE);
        debug_assert!(frame.is_page_aligned());

        let frame_index = ((frame.0 - self.base.0) / PAGE_SIZE) as usize;
        let order = Self::order_of(frame_count);
        debug_assert!(frame_index < FRAME_COUNT_PER_REGION);
        self.pool[order].free(frame_index);
        self.join(frame_index, order);
    }

    /// Repeatedly merge free buddy pairs into larger blocks; rolls back the
    /// effect of split().
    fn join(&mut self, frame_index: usize, start_order: usize) {
        let mut index = frame_index;
        for order in start_order..MAX_BLOCK_ORDER - 1 {
            debug_assert!(!self.pool[order].is_set(index));

            let buddy = Self::buddy_index(index, order);
            if self.pool[order].is_set(buddy) {
                break;
            }
            // Both halves free: collapse them into the parent block
            self.pool[order].set(index);
            self.pool[order].set(buddy);
            let parent = index & buddy;
            self.pool[order + 1].free(parent);
            index = parent;
        }
    }

    /// Split free blocks down to the requested order, parking the unused
    /// halves in their pools for later allocation.
    fn split(&mut self, frame_index: usize, requested_order: usize, actual_order: usize) {
        debug_assert!(actual_order > requested_order);
        for order in (requested_order..actual_order).rev() {
            let buddy = Self::buddy_index(frame_index, order);
            debug_assert!(self.pool[order].is_set(frame_index));
            debug_assert!(self.pool[order].is_set(buddy));
            self.pool[order].free(buddy);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_free_at_order(&self, frame_index: usize, order: usize) -> bool {
        !self.pool[order].is_set(frame_index)
    }
}

struct FrameAllocatorInner {
    region: Vec<Option<Region>>,
    region_map: Bitmap,
}

/// Owner of all paged physical memory.  Every request for frames lands here;
/// this is the only caller of the per-region buddy allocators.
pub struct FrameAllocator {
    inner: Mutex<FrameAllocatorInner>,
    total_memory_size: u32,
}

impl FrameAllocator {
    /// Carve the available RAM into regions of contiguous frames.  The low
    /// portion of the physical address space is nonpaged and reserved for
    /// the kernel; those addresses are never managed here.
    pub fn new(total_memory_size: u32) -> FrameAllocator {
        let paged_memory_size = total_memory_size - KERNEL_PAGED_BOUNDARY;
        let first_region = (KERNEL_PAGED_BOUNDARY / REGION_SIZE) as usize;
        let last_region = first_region + (paged_memory_size / REGION_SIZE) as usize;
        log::debug!(
            "carving {} MB of paged memory into {} regions",
            paged_memory_size / (1024 * 1024),
            last_region - first_region
        );

        let mut region: Vec<Option<Region>> = Vec::with_capacity(last_region);
        let mut region_map = Bitmap::new(last_region);
        for index in 0..last_region {
            if index < first_region {
                region.push(None);
                region_map.set(index);
            } else {
                region.push(Some(Region::new(PhysAddr(index as u32 * REGION_SIZE))));
            }
        }

        FrameAllocator {
            inner: Mutex::new(FrameAllocatorInner { region, region_map }),
            total_memory_size,
        }
    }

    /// Attempt to allocate a block of contiguous frames from any region
    /// with free blocks.  A region that declines the request stays masked
    /// off until a later free reopens it; this is conservative and can
    /// overlook free blocks in a masked region.
    fn allocate_block(&self, frame_count: usize) -> Option<PhysAddr> {
        let mut inner = self.inner.lock();
        loop {
            let region_index = match inner.region_map.allocate() {
                Some(index) => index,
                None => {
                    log::warn!(
                        "unable to allocate {} frames; all regions are allocated",
                        frame_count
                    );
                    return None;
                }
            };

            let block = inner.region[region_index]
                .as_mut()
                .expect("region map points at a missing region")
                .allocate_block(frame_count);

            match block {
                Some(block) => {
                    inner.region_map.free(region_index);
                    return Some(block);
                }
                None => {
                    log::trace!("region {} is completely allocated", region_index);
                }
            }
        }
    }

    fn allocate_contiguous(&self, frame_count: usize) -> KernelResult<Vec<PhysAddr>> {
        if frame_count > MAX_BLOCK_SIZE {
            return Err(Status::InsufficientMemory);
        }
        let block = self
            .allocate_block(frame_count)
            .ok_or(Status::InsufficientMemory)?;
        Ok((0..frame_count)
            .map(|i| PhysAddr(block.0 + i as u32 * PAGE_SIZE))
            .collect())
    }

    fn allocate_discontiguous(&self, frame_count: usize) -> KernelResult<Vec<PhysAddr>> {
        let mut frames = Vec::with_capacity(frame_count);
        for _ in 0..frame_count {
            match self.allocate_block(1) {
                Some(frame) => frames.push(frame),
                None => {
                    // Partial failure: put back everything acquired so far
                    self.free_frames(&frames);
                    return Err(Status::InsufficientMemory);
                }
            }
        }
        Ok(frames)
    }

    /// Allocate physical frames.  DMA flags require a physically contiguous
    /// block; otherwise the frames may come from anywhere.
    pub fn allocate_frames(
        &self,
        frame_count: usize,
        flags: MemoryFlags,
    ) -> KernelResult<Vec<PhysAddr>> {
        if frame_count == 0 {
            return Err(Status::InsufficientMemory);
        }
        if flags.requires_contiguous() {
            self.allocate_contiguous(frame_count)
        } else {
            self.allocate_discontiguous(frame_count)
        }
    }

    /// Release frames back to their owning regions.  Invalid sentinel
    /// entries are skipped; typically those only appear when cleaning up a
    /// failed allocation.
    pub fn free_frames(&self, frames: &[PhysAddr]) {
        for &frame in frames {
            if frame == INVALID_FRAME {
                continue;
            }
            debug_assert!(frame.0 < self.total_memory_size);
            debug_assert!(frame.is_page_aligned());

            let region_index = (frame.0 / REGION_SIZE) as usize;
            let mut inner = self.inner.lock();
            match inner.region[region_index].as_mut() {
                Some(region) => region.free_block(frame, 1),
                None => {
                    log::error!("freeing frame {:#x} in unmanaged region", frame.0);
                    continue;
                }
            }
            // The region cannot be empty now; at least one block is free
            inner.region_map.free(region_index);
        }
    }
}
