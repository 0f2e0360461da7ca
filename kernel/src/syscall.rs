// kernel/src/syscall.rs
//
// System-call argument block and the fixed interrupt vectors the kernel
// claims for its system calls.  A user thread populates a SyscallData
// structure, traps to the kernel with one of these vectors, and reads the
// result back out of the same structure.

use crate::memory::VirtAddr;
use crate::status::{KernelResult, Status};

// System-call vectors
pub const VECTOR_CREATE_ADDRESS_SPACE: usize = 0x80;
pub const VECTOR_EXPAND_ADDRESS_SPACE: usize = 0x81;
pub const VECTOR_CREATE_THREAD: usize = 0x82;
pub const VECTOR_DELETE_THREAD: usize = 0x83;
pub const VECTOR_SEND_MESSAGE: usize = 0x84;
pub const VECTOR_SEND_AND_RECEIVE_MESSAGE: usize = 0x85;
pub const VECTOR_RECEIVE_MESSAGE: usize = 0x86;
pub const VECTOR_DELETE_MESSAGE: usize = 0x87;
pub const VECTOR_MAP_DEVICE: usize = 0x88;
pub const VECTOR_UNMAP_DEVICE: usize = 0x89;

/// Synthetic vector raised by Hal::soft_yield()
pub const VECTOR_SOFT_YIELD: usize = 0x8F;

// Hardware vectors routed into the core
pub const VECTOR_BOUND_RANGE_EXCEEDED: usize = 5;
pub const VECTOR_SEGMENT_NOT_PRESENT: usize = 11;
pub const VECTOR_STACK_SEGMENT_FAULT: usize = 12;
pub const VECTOR_GENERAL_PROTECTION: usize = 13;
pub const VECTOR_PAGE_FAULT: usize = 14;

pub const VECTOR_FIRST_PIC_IRQ: usize = 0x20;
pub const PIC_IRQ_COUNT: usize = 16;
pub const CLOCK_IRQ: usize = 0;

/// Arguments supplied with a system call.  The caller always populates
/// `size`; the kernel always overwrites `size` and `status` before
/// returning, so a caller can detect a half-processed request.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct SyscallData {
    pub size: usize,
    pub data0: usize,
    pub data1: usize,
    pub data2: usize,
    pub data3: usize,
    pub data4: usize,
    pub data5: usize,
    pub status: usize,
}

impl SyscallData {
    pub fn new() -> SyscallData {
        SyscallData {
            size: core::mem::size_of::<SyscallData>(),
            data0: 0,
            data1: 0,
            data2: 0,
            data3: 0,
            data4: 0,
            data5: 0,
            status: usize::MAX,
        }
    }
}

impl Default for SyscallData {
    fn default() -> Self {
        Self::new()
    }
}

/// Entry validation: the argument block must live in user space and be
/// large enough to hold every field the kernel will touch.
pub fn validate(user_address: VirtAddr, syscall: &SyscallData) -> KernelResult<()> {
    if !user_address.is_user() {
        log::warn!("syscall block at kernel address {:#x}", user_address.0);
        return Err(Status::InvalidData);
    }
    if syscall.size < core::mem::size_of::<SyscallData>() {
        log::warn!("undersized syscall block ({} bytes)", syscall.size);
        return Err(Status::InvalidData);
    }
    Ok(())
}
