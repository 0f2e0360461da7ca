// kernel/src/memory/page_table.rs
//
// 32-bit x86 page directory / page table model.  Apart from a few control
// bits, directory and table entries are identical, so one entry type serves
// both levels.  The first three directory slots of every address space are
// the identity-mapped kernel superpages.

use alloc::boxed::Box;
use alloc::vec::Vec;
use bitflags::bitflags;

use super::{MemoryFlags, PhysAddr, VirtAddr, INVALID_FRAME};
use crate::hal;
use crate::status::{KernelResult, Status};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        // Hardware-defined bits (see the Intel documentation)
        const PRESENT       = 0x0001;
        const WRITABLE      = 0x0002;
        const USER          = 0x0004;
        const WRITE_THROUGH = 0x0008;
        const CACHE_DISABLE = 0x0010;
        const ACCESSED      = 0x0020;
        const DIRTY         = 0x0040;
        const SUPER_PAGE    = 0x0080;
        const GLOBAL        = 0x0100;

        // Software-defined bits
        const SHARED        = 0x0200;
        const COPY_ON_WRITE = 0x0400;
    }
}

const PAGE_BASE_ADDRESS_MASK: u32 = 0xFFFF_F000;

const DIRECTORY_INDEX_SHIFT: u32 = 22;
const TABLE_INDEX_SHIFT: u32 = 12;
const ENTRY_COUNT: usize = 1024;

// Predefined kernel superpages, identical in every address space
const KERNEL_CODE_PAGE: u32 = 0x0000_0183; // 4M page @ 0M
const KERNEL_RAMDISK_PAGE: u32 = 0x0040_0181; // 4M page @ 4M
const KERNEL_DATA_PAGE: u32 = 0x0080_0183; // 4M page @ 8M

/// One entry in a page directory or page table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry {
    bits: u32,
}

impl PageTableEntry {
    pub const fn empty() -> Self {
        PageTableEntry { bits: 0 }
    }

    pub const fn from_bits(bits: u32) -> Self {
        PageTableEntry { bits }
    }

    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.bits)
    }

    pub fn frame(&self) -> PhysAddr {
        PhysAddr(self.bits & PAGE_BASE_ADDRESS_MASK)
    }

    pub fn is_present(&self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    pub fn is_writable(&self) -> bool {
        self.flags().contains(PteFlags::WRITABLE)
    }

    pub fn is_super_page(&self) -> bool {
        self.flags().contains(PteFlags::SUPER_PAGE)
    }

    pub fn is_shared(&self) -> bool {
        self.flags().contains(PteFlags::SHARED)
    }

    pub fn is_copy_on_write(&self) -> bool {
        self.flags().contains(PteFlags::COPY_ON_WRITE)
    }

    /// Bind a physical frame to this (currently empty) entry.  A present
    /// copy-on-write entry is never writable.
    pub fn commit_frame(&mut self, frame: PhysAddr, flags: MemoryFlags) -> KernelResult<()> {
        debug_assert!(frame != INVALID_FRAME);

        if self.is_present() {
            log::warn!("cannot commit frame; page is already present");
            return Err(Status::ResourceConflict);
        }

        let mut bits = (frame.0 & PAGE_BASE_ADDRESS_MASK) | PteFlags::PRESENT.bits();
        if flags.contains(MemoryFlags::WRITABLE) && !flags.contains(MemoryFlags::COPY_ON_WRITE) {
            bits |= PteFlags::WRITABLE.bits();
        }
        if flags.contains(MemoryFlags::USER) {
            bits |= PteFlags::USER.bits();
        }
        if flags.contains(MemoryFlags::SHARED) {
            bits |= PteFlags::SHARED.bits();
        }
        if flags.contains(MemoryFlags::COPY_ON_WRITE) {
            bits |= PteFlags::COPY_ON_WRITE.bits();
        }
        self.bits = bits;

        Ok(())
    }

    /// Unbind this entry, returning the frame that was backing it.  When a
    /// virtual address is supplied the matching TLB entry is invalidated.
    pub fn decommit_frame(&mut self, page: Option<VirtAddr>) -> PhysAddr {
        debug_assert!(self.is_present());
        let old_frame = self.frame();
        self.bits = 0;
        if let Some(page) = page {
            hal::hal().invalidate_tlb(page);
        }
        old_frame
    }

    /// Mark this entry shared + copy-on-write.  The underlying frame now has
    /// potentially multiple references, so the page becomes read-only.
    pub fn share_frame(&mut self, page: VirtAddr) -> KernelResult<PhysAddr> {
        if !self.is_present() {
            log::warn!("unable to share invalid page {:#x}", page.0);
            return Err(Status::InvalidData);
        }

        let frame = self.frame();
        self.bits |= (PteFlags::SHARED | PteFlags::COPY_ON_WRITE).bits();
        if self.is_writable() {
            self.bits &= !PteFlags::WRITABLE.bits();
            hal::hal().invalidate_tlb(page);
        }
        Ok(frame)
    }

    /// Break the link to a previously-shared frame.  The mapping is torn
    /// down entirely; the shared-frame descriptor keeps the frame alive for
    /// any other address spaces still using it.
    pub fn unshare_frame(&mut self, page: Option<VirtAddr>) {
        debug_assert!(self.is_present());
        debug_assert!(self.is_shared());
        self.decommit_frame(page);
    }
}

#[derive(Debug)]
enum DirectoryEntry {
    Empty,
    SuperPage(PageTableEntry),
    Table(Box<PageTable>),
}

#[derive(Debug)]
pub struct PageTable {
    entries: [PageTableEntry; ENTRY_COUNT],
}

impl PageTable {
    fn new() -> Box<PageTable> {
        Box::new(PageTable {
            entries: [PageTableEntry::empty(); ENTRY_COUNT],
        })
    }
}

/// One page directory, describing one address space to the processor.
#[derive(Debug)]
pub struct PageDirectory {
    entries: Vec<DirectoryEntry>,
}

impl PageDirectory {
    /// A fresh directory containing only the shared kernel superpages.
    pub fn new() -> PageDirectory {
        let mut entries = Vec::with_capacity(ENTRY_COUNT);
        entries.push(DirectoryEntry::SuperPage(PageTableEntry::from_bits(
            KERNEL_CODE_PAGE,
        )));
        entries.push(DirectoryEntry::SuperPage(PageTableEntry::from_bits(
            KERNEL_RAMDISK_PAGE,
        )));
        entries.push(DirectoryEntry::SuperPage(PageTableEntry::from_bits(
            KERNEL_DATA_PAGE,
        )));
        for _ in 3..ENTRY_COUNT {
            entries.push(DirectoryEntry::Empty);
        }
        PageDirectory { entries }
    }

    fn directory_index(page: VirtAddr) -> usize {
        (page.0 >> DIRECTORY_INDEX_SHIFT) as usize
    }

    fn table_index(page: VirtAddr) -> usize {
        ((page.0 >> TABLE_INDEX_SHIFT) as usize) & (ENTRY_COUNT - 1)
    }

    /// Locate the entry mapping `page`, optionally creating the
    /// intermediate page table.  For superpage-backed addresses this is the
    /// directory entry itself.
    pub fn find_entry(&mut self, page: VirtAddr, create: bool) -> Option<&mut PageTableEntry> {
        let index = Self::directory_index(page);
        if matches!(self.entries[index], DirectoryEntry::Empty) {
            if !create {
                return None;
            }
            self.entries[index] = DirectoryEntry::Table(PageTable::new());
        }
        match &mut self.entries[index] {
            DirectoryEntry::SuperPage(entry) => Some(entry),
            DirectoryEntry::Table(table) => Some(&mut table.entries[Self::table_index(page)]),
            DirectoryEntry::Empty => None,
        }
    }

    /// The next present 4 KiB page at or above `from`.  Kernel superpages
    /// are not reported; callers always scan the paged regions above them.
    pub fn next_present_page(&self, from: VirtAddr) -> Option<VirtAddr> {
        let start_dir = Self::directory_index(from);
        for dir_index in start_dir..ENTRY_COUNT {
            let table = match &self.entries[dir_index] {
                DirectoryEntry::Table(table) => table,
                _ => continue,
            };
            let first = if dir_index == start_dir {
                Self::table_index(from)
            } else {
                0
            };
            for table_index in first..ENTRY_COUNT {
                if table.entries[table_index].is_present() {
                    let address =
                        ((dir_index as u32) << DIRECTORY_INDEX_SHIFT) | ((table_index as u32) << TABLE_INDEX_SHIFT);
                    return Some(VirtAddr(address));
                }
            }
        }
        None
    }
}
