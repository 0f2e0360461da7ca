// kernel/src/panic.rs
//
// Fatal kernel errors.  A kernel panic records a reason code plus four
// debug words, prints what it can and halts; it is never recoverable.
// The embedding binary supplies the actual #[panic_handler].

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanicReason {
    MemoryAllocationFailure,
    UnableToCreateSystemThread,
    BadIndex,
    UnhandledException,
    UnhandledPageFault,
    UnexpectedInterrupt,
}

pub fn kernel_panic(reason: PanicReason, data: [usize; 4]) -> ! {
    log::error!(
        "kernel panic: {:?} data {:#x} {:#x} {:#x} {:#x}",
        reason,
        data[0],
        data[1],
        data[2],
        data[3]
    );
    panic!("kernel panic: {:?}", reason);
}
