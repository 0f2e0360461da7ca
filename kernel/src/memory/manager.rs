// kernel/src/memory/manager.rs
//
// The Memory Manager: registry of address spaces keyed by id, owner of the
// frame allocator, and handler for the memory-related exceptions and
// system calls.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::{Mutex, Once};

use super::address_space::{
    AddressSpace, AddressSpaceId, ADDRESS_SPACE_ID_AUTO_ALLOCATE, ADDRESS_SPACE_ID_KERNEL,
};
use super::frame_allocator::FrameAllocator;
use super::{MemoryFlags, PhysAddr, VirtAddr};
use crate::capability::Capabilities;
use crate::hal;
use crate::panic::{kernel_panic, PanicReason};
use crate::status::{KernelResult, Status};
use crate::syscall::{self, SyscallData};

struct AddressSpaceTable {
    next_id: AddressSpaceId,
    table: BTreeMap<AddressSpaceId, Arc<AddressSpace>>,
}

pub struct MemoryManager {
    frames: FrameAllocator,
    spaces: Mutex<AddressSpaceTable>,
}

static MEMORY_MANAGER: Once<MemoryManager> = Once::new();

/// Bring up the Memory Manager: carve physical memory into regions, create
/// the kernel address space and enable paging with it.  Runs once, before
/// the Thread Manager exists.
pub fn init(total_memory_size: u32) {
    MEMORY_MANAGER.call_once(|| {
        log::info!("initializing Memory Manager");
        let memory_manager = MemoryManager {
            frames: FrameAllocator::new(total_memory_size),
            spaces: Mutex::new(AddressSpaceTable {
                next_id: 1,
                table: BTreeMap::new(),
            }),
        };

        let kernel_space = memory_manager
            .create_address_space(ADDRESS_SPACE_ID_KERNEL)
            .unwrap_or_else(|_| {
                kernel_panic(PanicReason::MemoryAllocationFailure, [0; 4]);
            });
        hal::hal().enable_paging(&kernel_space);

        memory_manager
    });
}

pub fn memory_manager() -> &'static MemoryManager {
    MEMORY_MANAGER.get().expect("Memory Manager not initialized")
}

pub fn try_memory_manager() -> Option<&'static MemoryManager> {
    MEMORY_MANAGER.get()
}

impl MemoryManager {
    pub fn allocate_frames(
        &self,
        frame_count: usize,
        flags: MemoryFlags,
    ) -> KernelResult<Vec<PhysAddr>> {
        self.frames.allocate_frames(frame_count, flags)
    }

    pub fn free_frames(&self, frames: &[PhysAddr]) {
        self.frames.free_frames(frames);
    }

    /// Create a new address space with the requested id, or any free id
    /// for ADDRESS_SPACE_ID_AUTO_ALLOCATE.  Requires the caller to hold
    /// CREATE_ADDRESS_SPACE, except during boot when no thread exists yet.
    pub fn create_address_space(&self, id: AddressSpaceId) -> KernelResult<Arc<AddressSpace>> {
        if let Some(current_thread) = crate::thread::try_current() {
            if !current_thread.has_capability(Capabilities::CREATE_ADDRESS_SPACE) {
                log::warn!("insufficient privileges to create new address space");
                return Err(Status::AccessDenied);
            }
        }

        let mut spaces = self.spaces.lock();
        let id = if id == ADDRESS_SPACE_ID_AUTO_ALLOCATE {
            while spaces.table.contains_key(&spaces.next_id) {
                spaces.next_id += 1;
            }
            let id = spaces.next_id;
            spaces.next_id += 1;
            id
        } else {
            if spaces.table.contains_key(&id) {
                log::warn!("unable to allocate address space, id {:#x} is in use", id);
                return Err(Status::ResourceConflict);
            }
            id
        };

        let address_space = AddressSpace::new(id);
        spaces.table.insert(id, address_space.clone());
        Ok(address_space)
    }

    /// Remove the victim from the table of known address spaces.  The
    /// space persists while threads still reference it, but further
    /// lookups fail.
    pub fn delete_address_space(&self, id: AddressSpaceId) -> KernelResult<()> {
        let mut spaces = self.spaces.lock();
        match spaces.table.remove(&id) {
            Some(_) => Ok(()),
            None => Err(Status::InvalidData),
        }
    }

    pub fn find_address_space(&self, id: AddressSpaceId) -> Option<Arc<AddressSpace>> {
        let spaces = self.spaces.lock();
        let address_space = spaces.table.get(&id).cloned();
        if address_space.is_none() {
            log::warn!("unable to find address space {:#x}", id);
        }
        address_space
    }

    pub fn kernel_address_space(&self) -> Arc<AddressSpace> {
        self.find_address_space(ADDRESS_SPACE_ID_KERNEL)
            .expect("kernel address space missing")
    }

    /// Page-fault path.  Copy-on-write faults are repaired in the kernel;
    /// any other fault should eventually be forwarded to a user-mode pager
    /// as a blocking message, but no pager protocol exists yet.
    pub fn handle_page_fault(&self) {
        let faulting_address = hal::hal().read_page_fault_address();
        let current_thread = crate::thread::current();
        log::debug!(
            "page fault at {:#x} in thread {:#x}",
            faulting_address.0,
            current_thread.id
        );

        if !current_thread.address_space.copy_on_write(faulting_address) {
            kernel_panic(
                PanicReason::UnhandledPageFault,
                [faulting_address.0 as usize, current_thread.id, 0, 0],
            );
        }
    }

    /// Non-paging memory exceptions: the offending thread should be killed
    /// once a policy exists; for now they are fatal.
    pub fn handle_exception(&self, vector: usize, data: usize) -> ! {
        log::error!("unhandled memory exception {} (data {:#x})", vector, data);
        kernel_panic(PanicReason::UnhandledException, [vector, data, 0, 0]);
    }

    /// System-call dispatch for the memory vectors.
    pub fn handle_system_call(&self, vector: usize, syscall: &mut SyscallData) {
        match vector {
            syscall::VECTOR_CREATE_ADDRESS_SPACE => self.syscall_create_address_space(syscall),
            syscall::VECTOR_EXPAND_ADDRESS_SPACE => self.syscall_expand_address_space(syscall),
            _ => kernel_panic(PanicReason::UnexpectedInterrupt, [vector, 0, 0, 0]),
        }
    }

    /// CreateAddressSpace: returns the new id in data0.
    fn syscall_create_address_space(&self, syscall: &mut SyscallData) {
        log::trace!("system call: create address space");
        let result = self.create_address_space(ADDRESS_SPACE_ID_AUTO_ALLOCATE);
        if let Ok(address_space) = &result {
            syscall.data0 = address_space.id;
        }
        syscall.status = Status::code_of(&result);
    }

    /// ExpandAddressSpace: data0 = id, data1 = base, data2 = size,
    /// data3 = flags (accepted, currently unused).
    fn syscall_expand_address_space(&self, syscall: &mut SyscallData) {
        log::trace!("system call: expand address space");
        let result = match self.find_address_space(syscall.data0) {
            Some(address_space) => address_space.expand(
                VirtAddr(syscall.data1 as u32),
                syscall.data2,
                syscall.data3,
            ),
            None => Err(Status::InvalidData),
        };
        syscall.status = Status::code_of(&result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::setup;

    #[test]
    fn address_space_ids_are_unique() {
        let _kernel = setup();
        let memory_manager = memory_manager();

        let a = memory_manager
            .create_address_space(ADDRESS_SPACE_ID_AUTO_ALLOCATE)
            .unwrap();
        let b = memory_manager
            .create_address_space(ADDRESS_SPACE_ID_AUTO_ALLOCATE)
            .unwrap();
        assert_ne!(a.id, b.id);

        assert_eq!(
            memory_manager.create_address_space(a.id).unwrap_err(),
            Status::ResourceConflict
        );

        memory_manager.delete_address_space(a.id).unwrap();
        memory_manager.delete_address_space(b.id).unwrap();
    }

    #[test]
    fn create_then_delete_restores_the_table() {
        let _kernel = setup();
        let memory_manager = memory_manager();

        let space = memory_manager.create_address_space(777).unwrap();
        assert!(memory_manager.find_address_space(777).is_some());
        drop(space);
        memory_manager.delete_address_space(777).unwrap();
        assert!(memory_manager.find_address_space(777).is_none());

        // The id is free again
        let space = memory_manager.create_address_space(777).unwrap();
        memory_manager.delete_address_space(777).unwrap();
        drop(space);
    }

    #[test]
    fn syscall_create_address_space_reports_the_id() {
        let _kernel = setup();
        let mut syscall = SyscallData::new();
        memory_manager().handle_system_call(syscall::VECTOR_CREATE_ADDRESS_SPACE, &mut syscall);
        assert_eq!(syscall.status, crate::status::STATUS_CODE_SUCCESS);
        assert!(memory_manager().find_address_space(syscall.data0).is_some());
        memory_manager().delete_address_space(syscall.data0).unwrap();
    }
}
