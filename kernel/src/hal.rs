// kernel/src/hal.rs
//
// Narrow hardware-abstraction interface consumed by the kernel core.  The
// actual x86 implementation (context frames, CR3 loads, invlpg, PIC masking,
// TSS bitmap reloads) lives outside this crate; the core only ever talks to
// hardware through this trait.

use spin::Once;

use crate::memory::address_space::AddressSpace;
use crate::memory::{PhysAddr, VirtAddr};
use crate::thread::Thread;

pub trait Hal: Send + Sync {
    /// Push an initial kernel frame onto the thread's stack so that the
    /// first switch into it "returns" into the kernel entry trampoline.
    fn initialize_thread_context(&self, thread: &Thread);

    /// Atomic context switch.  Never returns for an exiting thread.
    fn switch_thread(&self, old: &Thread, new: &Thread);

    /// Install the address space's page directory and enable paging.
    /// Called once during kernel initialization.
    fn enable_paging(&self, address_space: &AddressSpace);

    /// Faulting linear address of the current page fault (CR2).
    fn read_page_fault_address(&self) -> VirtAddr;

    /// Invalidate the TLB entry covering `page` in the current address
    /// space.
    fn invalidate_tlb(&self, page: VirtAddr);

    /// If `thread` is the current thread, reload the TSS I/O permission
    /// bitmap from its address space.
    fn reload_io_port_map(&self, thread: &Thread);

    /// Mask interrupts; returns whether they were previously enabled.
    fn interrupts_disable(&self) -> bool;
    fn interrupts_enable(&self);

    fn mask_interrupt(&self, irq: usize);
    fn unmask_interrupt(&self, irq: usize);

    /// Halt the processor until the next interrupt.
    fn suspend_processor(&self);

    /// Raise the synthetic yield vector, giving up the remaining quantum.
    fn soft_yield(&self);

    /// Leave ring 0 permanently for the current thread.
    fn jump_to_user(&self, entry: VirtAddr, stack: VirtAddr) -> !;

    /// Zero one physical frame.
    fn zero_frame(&self, frame: PhysAddr);

    /// Copy one page of data between physical frames.  The kernel keeps the
    /// destination temporarily mapped at the faulting thread's scratch page
    /// while this runs.
    fn copy_frame(&self, dest: PhysAddr, source: PhysAddr);

    /// Copy bytes out of the current user address space.
    fn copy_from_user(&self, source: VirtAddr, dest: &mut [u8]);

    /// Copy bytes into the current user address space.
    fn copy_to_user(&self, dest: VirtAddr, source: &[u8]);

    /// Entropy for seeding the scheduling lottery.
    fn random_seed(&self) -> u32;
}

static HAL: Once<&'static dyn Hal> = Once::new();

/// Install the platform HAL.  Must run before any other kernel
/// initialization; later calls are ignored.
pub fn install(hal: &'static dyn Hal) {
    HAL.call_once(|| hal);
}

/// The installed HAL.  Panics if the kernel was never initialized.
pub fn hal() -> &'static dyn Hal {
    *HAL.get().expect("HAL not installed")
}
