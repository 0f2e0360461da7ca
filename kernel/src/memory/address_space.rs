// kernel/src/memory/address_space.rs
//
// One virtual address space: a page directory, the table of frames shared
// with other address spaces, the pools used to map incoming message
// payloads, and the optional I/O port bitmap.
//
// The lock here is leaf-level: it may never be held while acquiring any
// thread lock.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::io_port_map::IoPortMap;
use super::manager;
use super::memory_pool::MemoryPool;
use super::page_table::PageDirectory;
use super::shared_frame::{SharedFrame, SharedFrameList};
use super::{
    page_count, MemoryFlags, PhysAddr, VirtAddr, EXPAND_MAX_PAGES, LARGE_PAYLOAD_POOL_BASE,
    LARGE_PAYLOAD_POOL_COUNT, MEDIUM_PAYLOAD_POOL_BASE, PAGE_SIZE, PAYLOAD_AREA_BASE,
    PAYLOAD_POOL_SIZE,
};
use crate::capability::Capabilities;
use crate::hal;
use crate::status::{KernelResult, Status};

pub type AddressSpaceId = usize;

pub const ADDRESS_SPACE_ID_USER_LOADER: AddressSpaceId = 0;
pub const ADDRESS_SPACE_ID_AUTO_ALLOCATE: AddressSpaceId = usize::MAX - 2;
pub const ADDRESS_SPACE_ID_KERNEL: AddressSpaceId = usize::MAX - 1;
pub const ADDRESS_SPACE_ID_INVALID: AddressSpaceId = usize::MAX;

/// Size of one medium message payload, in bytes.
pub const MEDIUM_PAYLOAD_SIZE: usize = 256;

#[derive(Debug)]
struct AddressSpaceInner {
    page_directory: PageDirectory,
    shared_frame_table: BTreeMap<u32, Arc<SharedFrame>>,
    medium_payload_pool: MemoryPool,
    large_payload_pool: Vec<MemoryPool>,
    io_port_map: Option<Box<IoPortMap>>,
}

#[derive(Debug)]
pub struct AddressSpace {
    pub id: AddressSpaceId,
    inner: Mutex<AddressSpaceInner>,
}

impl AddressSpace {
    /// Fresh address space containing only the shared kernel superpages.
    /// The i'th large-payload pool serves blocks of 2^i pages, so the
    /// largest mappable payload is 2^7 pages.
    pub fn new(id: AddressSpaceId) -> Arc<AddressSpace> {
        let mut large_payload_pool = Vec::with_capacity(LARGE_PAYLOAD_POOL_COUNT);
        let mut base = LARGE_PAYLOAD_POOL_BASE;
        for order in 0..LARGE_PAYLOAD_POOL_COUNT {
            large_payload_pool.push(MemoryPool::new(
                VirtAddr(base),
                PAYLOAD_POOL_SIZE as usize,
                (1usize << order) * PAGE_SIZE as usize,
            ));
            base += PAYLOAD_POOL_SIZE;
        }

        Arc::new(AddressSpace {
            id,
            inner: Mutex::new(AddressSpaceInner {
                page_directory: PageDirectory::new(),
                shared_frame_table: BTreeMap::new(),
                medium_payload_pool: MemoryPool::new(
                    VirtAddr(MEDIUM_PAYLOAD_POOL_BASE),
                    MEDIUM_PAYLOAD_SIZE * 1024,
                    MEDIUM_PAYLOAD_SIZE,
                ),
                large_payload_pool,
                io_port_map: None,
            }),
        })
    }

    /// Bind physical frames to virtual pages of this address space.  Used
    /// for clean frames owned by this address space alone.  On failure some
    /// pages may be bound and some not; the caller recovers via decommit().
    pub fn commit(&self, page: VirtAddr, frames: &[PhysAddr], flags: MemoryFlags) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        for (index, &frame) in frames.iter().enumerate() {
            let address = VirtAddr(page.0 + index as u32 * PAGE_SIZE);
            let entry = inner
                .page_directory
                .find_entry(address, true)
                .ok_or(Status::InsufficientMemory)?;
            entry.commit_frame(frame, flags)?;
        }
        Ok(())
    }

    /// Bind already-shared frames to virtual pages of this address space.
    /// Each binding takes a reference on the shared frame and records it in
    /// the shared-frame table.
    pub fn commit_shared(
        &self,
        page: VirtAddr,
        frames: &[Arc<SharedFrame>],
        flags: MemoryFlags,
    ) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        for (index, frame) in frames.iter().enumerate() {
            let address = VirtAddr(page.0 + index as u32 * PAGE_SIZE);
            let entry = inner
                .page_directory
                .find_entry(address, true)
                .ok_or(Status::InsufficientMemory)?;
            entry.commit_frame(frame.address, flags)?;
            inner
                .shared_frame_table
                .insert(address.page_base().0, frame.clone());
        }
        Ok(())
    }

    /// Remove the mappings behind `page_count` pages, invalidating the TLB
    /// entry for each.  Returns the frames that were backing the pages; the
    /// caller owns them and is responsible for freeing them.
    pub fn decommit(&self, page: VirtAddr, count: usize) -> Vec<PhysAddr> {
        let mut inner = self.inner.lock();
        let mut frames = Vec::with_capacity(count);
        for index in 0..count {
            let address = VirtAddr(page.0 + index as u32 * PAGE_SIZE);
            match inner.page_directory.find_entry(address, false) {
                Some(entry) if entry.is_present() => {
                    frames.push(entry.decommit_frame(Some(address)));
                }
                _ => {
                    log::warn!("decommit of absent page {:#x}", address.0);
                    frames.push(super::INVALID_FRAME);
                }
            }
        }
        frames
    }

    /// Grow this address space with fresh zero-filled pages.  The main
    /// logic underneath the ExpandAddressSpace system call.
    pub fn expand(&self, first_new_page: VirtAddr, size: usize, _flags: usize) -> KernelResult<()> {
        if let Some(current_thread) = crate::thread::try_current() {
            if !current_thread.has_capability(Capabilities::EXPAND_ADDRESS_SPACE) {
                log::warn!("insufficient privileges to expand address space");
                return Err(Status::AccessDenied);
            }
        }

        let frame_count = page_count(size);
        if frame_count == 0 || frame_count > EXPAND_MAX_PAGES {
            log::warn!("cannot expand by {} pages", frame_count);
            return Err(Status::InsufficientMemory);
        }

        // The whole range must be page-aligned user space
        let span = (frame_count as u32 - 1) * PAGE_SIZE;
        let last_new_page = match first_new_page.0.checked_add(span) {
            Some(last) => VirtAddr(last),
            None => return Err(Status::InvalidData),
        };
        if !first_new_page.is_page_aligned() || !first_new_page.is_user() {
            log::warn!("bad expansion address {:#x}", first_new_page.0);
            return Err(Status::InvalidData);
        }

        // Refuse ranges with pages already present, to avoid leaking frames
        {
            let inner = self.inner.lock();
            if let Some(present) = inner.page_directory.next_present_page(first_new_page) {
                if present <= last_new_page {
                    log::warn!(
                        "cannot expand at {:#x}, page present at {:#x}",
                        first_new_page.0,
                        present.0
                    );
                    return Err(Status::ResourceConflict);
                }
            }
        }

        let frames = manager::memory_manager().allocate_frames(frame_count, MemoryFlags::empty())?;
        for &frame in &frames {
            hal::hal().zero_frame(frame);
        }

        log::debug!(
            "expanding address space {:#x}: adding {} frames at {:#x}",
            self.id,
            frame_count,
            first_new_page.0
        );
        if let Err(status) = self.commit(first_new_page, &frames, MemoryFlags::USER_DEFAULT) {
            log::error!("unable to expand address space {:#x}", self.id);
            self.decommit(first_new_page, frame_count);
            manager::memory_manager().free_frames(&frames);
            return Err(status);
        }
        Ok(())
    }

    /// Copy-on-write fixup, invoked from the page-fault path.  Returns true
    /// if the fault was a copy-on-write fault and has been repaired; the
    /// faulting instruction then re-executes.  Returns false for any other
    /// kind of fault.
    pub fn copy_on_write(&self, address: VirtAddr) -> bool {
        let mut inner = self.inner.lock();

        let old_frame = match inner.page_directory.find_entry(address, false) {
            Some(entry) if entry.is_copy_on_write() => {
                debug_assert!(entry.is_present());
                debug_assert!(!entry.is_super_page());
                debug_assert!(!entry.is_writable());
                entry.frame()
            }
            _ => return false,
        };

        // The faulting thread's preallocated scratch page gives the new
        // frame a temporary mapping while the data is copied out
        let current_thread = crate::thread::current();
        let copy_page = match current_thread.copy_page {
            Some(page) => page,
            None => {
                log::error!("thread {:#x} has no copy-on-write buffer", current_thread.id);
                return false;
            }
        };

        let new_frame = match manager::memory_manager().allocate_frames(1, MemoryFlags::empty()) {
            Ok(frames) => frames[0],
            Err(_) => {
                log::error!("unable to allocate frame for copy-on-write");
                return false;
            }
        };

        {
            let copy_entry = inner
                .page_directory
                .find_entry(copy_page, true)
                .expect("no page table entry for copy buffer");
            copy_entry
                .commit_frame(new_frame, MemoryFlags::WRITABLE)
                .expect("copy buffer still mapped");
            hal::hal().copy_frame(new_frame, old_frame);
            copy_entry.decommit_frame(Some(copy_page));
        }

        // The data must stay at the same virtual address: drop the link to
        // the shared frame and rebind the page to the private copy
        unshare_page(&mut inner, address);
        inner
            .page_directory
            .find_entry(address, true)
            .expect("faulting page table vanished")
            .commit_frame(new_frame, MemoryFlags::USER_DEFAULT)
            .expect("faulting page still mapped after unshare");

        true
    }

    /// Share every page spanning [address, address+size) and return the
    /// shared-frame descriptors, for delivery to another address space.
    pub fn share_pages(&self, address: VirtAddr, size: usize) -> KernelResult<SharedFrameList> {
        let mut inner = self.inner.lock();
        let mut frames = Vec::new();
        for index in 0..page_count(size) {
            let page = VirtAddr(address.0 + index as u32 * PAGE_SIZE);
            let shared = share_page(&mut inner, page).map_err(|_| Status::InsufficientMemory)?;
            debug_assert!(SharedFrame::reference_count(&shared) >= 2);
            frames.push(shared);
        }
        Ok(frames)
    }

    /// Prepopulate the shared-frame table with synthetic entries covering
    /// kernel-superpage-backed data, so page-sized blocks of the kernel
    /// image or ramdisk can travel as message payloads.  unshare_pages()
    /// recognizes these entries and leaves the superpage mappings alone.
    pub fn share_kernel_frames(&self, address: VirtAddr, size: usize) -> KernelResult<()> {
        debug_assert!(address.0 < PAYLOAD_AREA_BASE);
        debug_assert!(address.0 + size as u32 <= PAYLOAD_AREA_BASE);

        let mut inner = self.inner.lock();
        let mut block = address.page_base();
        let end = address.0 + size as u32;
        log::trace!("sharing kernel data at {:#x}", block.0);
        while block.0 < end {
            let key = block.0;
            if !inner.shared_frame_table.contains_key(&key) {
                // The kernel image and ramdisk are identity-mapped
                let shared = SharedFrame::new_kernel_resident(PhysAddr(block.0));
                inner.shared_frame_table.insert(key, shared);
            }
            block = VirtAddr(block.0 + PAGE_SIZE);
        }
        Ok(())
    }

    /// Break the linkage to previously-shared pages.
    pub fn unshare_pages(&self, address: VirtAddr, size: usize) {
        let mut inner = self.inner.lock();
        for index in 0..page_count(size) {
            let page = VirtAddr(address.0 + index as u32 * PAGE_SIZE);
            unshare_page(&mut inner, page);
        }
    }

    /// Reserve a virtually-contiguous block in the message area for an
    /// incoming large payload.  Only the address range is reserved; the
    /// caller follows up with commit() or commit_shared().
    pub fn allocate_large_payload_block(&self, pages: usize) -> Option<VirtAddr> {
        debug_assert!(pages > 0);
        let order = pages.next_power_of_two().trailing_zeros() as usize;

        let mut inner = self.inner.lock();
        for index in order..LARGE_PAYLOAD_POOL_COUNT {
            if let Some(block) = inner.large_payload_pool[index].allocate_block() {
                return Some(block);
            }
        }
        log::warn!("unable to allocate payload block of {} pages", pages);
        None
    }

    /// Release a block from allocate_large_payload_block().  The caller
    /// must have torn down the mappings first, via unshare_pages() or
    /// decommit().
    pub fn free_large_payload_block(&self, block: VirtAddr) -> KernelResult<()> {
        debug_assert!(block.is_page_aligned());
        let index = ((block.0 - LARGE_PAYLOAD_POOL_BASE) / PAYLOAD_POOL_SIZE) as usize;
        if index >= LARGE_PAYLOAD_POOL_COUNT {
            log::warn!("unable to free payload block at {:#x}", block.0);
            return Err(Status::InvalidData);
        }
        self.inner.lock().large_payload_pool[index].free_block(block)
    }

    /// Reserve a buffer in the medium-payload slab, committing a fresh
    /// frame underneath it if this part of the slab was never touched.
    /// Multiple buffers pack into each page.
    pub fn allocate_medium_payload_block(&self) -> Option<VirtAddr> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let block = inner.medium_payload_pool.allocate_block()?;

        // The slab page may already be backed by an earlier buffer
        match inner.page_directory.find_entry(block, true) {
            Some(entry) if entry.is_present() => return Some(block),
            Some(_) => {}
            None => {
                log::error!("unable to create entry for payload block");
                let _ = inner.medium_payload_pool.free_block(block);
                return None;
            }
        }

        let frame = match manager::memory_manager().allocate_frames(1, MemoryFlags::empty()) {
            Ok(frames) => frames[0],
            Err(_) => {
                log::error!("unable to allocate frame for payload buffer");
                let _ = inner.medium_payload_pool.free_block(block);
                return None;
            }
        };
        hal::hal().zero_frame(frame);

        let entry = inner
            .page_directory
            .find_entry(block, true)
            .expect("payload page table vanished");
        match entry.commit_frame(frame, MemoryFlags::USER_DEFAULT) {
            Ok(()) => Some(block),
            Err(_) => {
                manager::memory_manager().free_frames(&[frame]);
                let _ = inner.medium_payload_pool.free_block(block);
                None
            }
        }
    }

    /// Release a buffer from allocate_medium_payload_block().  The page
    /// directory is left unchanged; other buffers within the same page may
    /// still be live.
    pub fn free_medium_payload_block(&self, block: VirtAddr) -> KernelResult<()> {
        self.inner.lock().medium_payload_pool.free_block(block)
    }

    /// Does this address space's payload area own `block`?
    pub fn owns_medium_payload_block(&self, block: VirtAddr) -> bool {
        self.inner.lock().medium_payload_pool.owns(block)
    }

    /// Grant ring-3 access to a contiguous range of I/O ports, creating the
    /// 64K-bit permission map on first use.
    pub fn enable_io_port(&self, port: u16, count: u16) -> KernelResult<()> {
        debug_assert!(count > 0);
        let mut inner = self.inner.lock();
        inner
            .io_port_map
            .get_or_insert_with(|| Box::new(IoPortMap::new()))
            .enable(port, count);
        Ok(())
    }

    /// Revoke ring-3 access to a contiguous range of I/O ports.  Fails if
    /// the map was never created (no port was ever enabled).
    pub fn disable_io_port(&self, port: u16, count: u16) -> KernelResult<()> {
        debug_assert!(count > 0);
        let mut inner = self.inner.lock();
        match inner.io_port_map.as_mut() {
            Some(map) => {
                map.disable(port, count);
                Ok(())
            }
            None => Err(Status::InvalidData),
        }
    }

    pub fn io_port_enabled(&self, port: u16) -> bool {
        self.inner
            .lock()
            .io_port_map
            .as_ref()
            .is_some_and(|map| map.is_enabled(port))
    }

    #[cfg(test)]
    pub(crate) fn with_entry<R>(
        &self,
        page: VirtAddr,
        f: impl FnOnce(Option<&super::page_table::PageTableEntry>) -> R,
    ) -> R {
        let mut inner = self.inner.lock();
        let entry = inner.page_directory.find_entry(page, false);
        f(entry.map(|entry| &*entry))
    }

    #[cfg(test)]
    pub(crate) fn shared_frame_refcount(&self, page: VirtAddr) -> Option<usize> {
        let inner = self.inner.lock();
        inner
            .shared_frame_table
            .get(&page.page_base().0)
            .map(SharedFrame::reference_count)
    }
}

/// Share the data in one page.  Reuses the existing descriptor when the
/// page is already shared.  Assumes the caller holds the space lock.
fn share_page(inner: &mut AddressSpaceInner, page: VirtAddr) -> KernelResult<Arc<SharedFrame>> {
    let key = page.page_base().0;

    if let Some(existing) = inner.shared_frame_table.get(&key) {
        return Ok(existing.clone());
    }

    let entry = inner
        .page_directory
        .find_entry(page, false)
        .ok_or(Status::InvalidData)?;

    // Superpages may not be shared; share_kernel_frames() handles the
    // kernel regions instead
    if entry.is_super_page() {
        log::warn!("unable to share address {:#x}, within superpage", page.0);
        return Err(Status::InvalidData);
    }

    let frame = entry.share_frame(page)?;
    let shared = SharedFrame::new(frame);
    inner.shared_frame_table.insert(key, shared.clone());
    Ok(shared)
}

/// Remove one page from the pool of shared pages.  Kernel superpage
/// aliases injected by share_kernel_frames() leave the superpage mapping
/// untouched.  Assumes the caller holds the space lock.
fn unshare_page(inner: &mut AddressSpaceInner, page: VirtAddr) {
    let key = page.page_base().0;
    match inner.shared_frame_table.remove(&key) {
        Some(shared) => {
            if let Some(entry) = inner.page_directory.find_entry(page, false) {
                if !entry.is_super_page() && entry.is_present() && entry.is_shared() {
                    entry.unshare_frame(Some(page));
                }
            }
            drop(shared);
        }
        None => {
            log::trace!("page {:#x} is not shared", page.0);
        }
    }
}

impl Drop for AddressSpace {
    /// Runs when the last thread has exited and the creator's handle is
    /// gone; the current thread is never executing inside the victim, so no
    /// TLB invalidation is needed.  Remaining private frames return to the
    /// frame allocator; shared frames stay with their descriptors.
    fn drop(&mut self) {
        log::debug!("destroying address space {:#x}", self.id);
        let inner = self.inner.get_mut();

        // Release every shared frame still referenced by this space
        inner.shared_frame_table.clear();

        let mut leftover = Vec::new();
        let mut cursor = VirtAddr(PAYLOAD_AREA_BASE);
        while let Some(page) = inner.page_directory.next_present_page(cursor) {
            let entry = inner
                .page_directory
                .find_entry(page, false)
                .expect("present page lost during teardown");
            if entry.is_shared() {
                // The frame belongs to a shared-frame descriptor that may
                // outlive this space; just drop the mapping
                entry.decommit_frame(None);
            } else {
                leftover.push(entry.decommit_frame(None));
            }
            match page.0.checked_add(PAGE_SIZE) {
                Some(next) => cursor = VirtAddr(next),
                None => break,
            }
        }

        if !leftover.is_empty() {
            if let Some(memory_manager) = manager::try_memory_manager() {
                memory_manager.free_frames(&leftover);
            }
        }
    }
}
