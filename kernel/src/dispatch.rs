// kernel/src/dispatch.rs
//
// Interrupt-vector routing.  The HAL's vector stubs funnel every
// exception, IRQ and system-call trap into these two functions, which
// hand them to the owning subsystem.  Scheduling decisions triggered here
// take effect when the handler chain unwinds.

use crate::device::device_proxy;
use crate::io::io_manager;
use crate::memory::manager::memory_manager;
use crate::memory::VirtAddr;
use crate::panic::{kernel_panic, PanicReason};
use crate::syscall::{self, SyscallData};
use crate::thread::manager::thread_manager;

/// Hardware interrupts and exceptions.
pub fn handle_interrupt(vector: usize, data: usize) {
    match vector {
        syscall::VECTOR_BOUND_RANGE_EXCEEDED
        | syscall::VECTOR_SEGMENT_NOT_PRESENT
        | syscall::VECTOR_STACK_SEGMENT_FAULT
        | syscall::VECTOR_GENERAL_PROTECTION => {
            memory_manager().handle_exception(vector, data);
        }

        syscall::VECTOR_PAGE_FAULT => memory_manager().handle_page_fault(),

        vector if vector == syscall::VECTOR_FIRST_PIC_IRQ + syscall::CLOCK_IRQ => {
            io_manager().handle_clock_tick();
        }

        vector
            if (syscall::VECTOR_FIRST_PIC_IRQ
                ..syscall::VECTOR_FIRST_PIC_IRQ + syscall::PIC_IRQ_COUNT)
                .contains(&vector) =>
        {
            device_proxy().wake_interrupt_handlers(vector - syscall::VECTOR_FIRST_PIC_IRQ);
        }

        syscall::VECTOR_SOFT_YIELD => io_manager().reschedule(),

        _ => kernel_panic(PanicReason::UnexpectedInterrupt, [vector, data, 0, 0]),
    }
}

/// System-call traps.  `user_address` is where the argument block lives in
/// the calling thread's address space; the block itself has already been
/// copied in.  `size` and `status` are always rewritten before returning.
pub fn handle_system_call(vector: usize, user_address: VirtAddr, data: &mut SyscallData) {
    if let Err(status) = syscall::validate(user_address, data) {
        data.size = core::mem::size_of::<SyscallData>();
        data.status = status.code();
        return;
    }
    data.size = core::mem::size_of::<SyscallData>();

    match vector {
        syscall::VECTOR_CREATE_ADDRESS_SPACE | syscall::VECTOR_EXPAND_ADDRESS_SPACE => {
            memory_manager().handle_system_call(vector, data);
        }

        syscall::VECTOR_CREATE_THREAD | syscall::VECTOR_DELETE_THREAD => {
            thread_manager().handle_system_call(vector, data);
        }

        syscall::VECTOR_SEND_MESSAGE
        | syscall::VECTOR_SEND_AND_RECEIVE_MESSAGE
        | syscall::VECTOR_RECEIVE_MESSAGE
        | syscall::VECTOR_DELETE_MESSAGE
        | syscall::VECTOR_SOFT_YIELD => {
            io_manager().handle_system_call(vector, data);
        }

        syscall::VECTOR_MAP_DEVICE | syscall::VECTOR_UNMAP_DEVICE => {
            device_proxy().handle_system_call(vector, data);
        }

        _ => {
            data.status = crate::status::Status::InvalidData.code();
        }
    }
}
