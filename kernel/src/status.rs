// kernel/src/status.rs
//
// Kernel-wide status codes.  Every user-visible failure surfaces as one of
// these values in the syscall status word; internal invariant violations go
// through kernel_panic() instead.

/// Errors returned by kernel operations and system calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Bad syscall arguments, misaligned payload, unknown id
    InvalidData,
    /// Out of frames, messages or allocator blocks
    InsufficientMemory,
    /// Id already taken; page already present at expansion base
    ResourceConflict,
    /// Capability missing, or address outside the allowed range
    AccessDenied,
    /// Recipient thread is being deleted
    MailboxDisabled,
    /// Recipient mailbox is at its message limit
    MailboxOverflow,
    /// Delivery would create a blocking cycle
    MessageDeadlock,
    /// Payload offset mismatch between sender and receiver
    IoError,
    /// Non-waiting receive found no pending message
    MailboxEmpty,
}

pub type KernelResult<T> = Result<T, Status>;

/// Numeric value written into the syscall status word.  Zero is success.
pub const STATUS_CODE_SUCCESS: usize = 0;

impl Status {
    pub fn code(self) -> usize {
        match self {
            Status::InvalidData => 1,
            Status::InsufficientMemory => 2,
            Status::ResourceConflict => 3,
            Status::AccessDenied => 4,
            Status::MailboxDisabled => 5,
            Status::MailboxOverflow => 6,
            Status::MessageDeadlock => 7,
            Status::IoError => 8,
            Status::MailboxEmpty => 9,
        }
    }

    /// Collapse a result into the numeric syscall status word.
    pub fn code_of<T>(result: &KernelResult<T>) -> usize {
        match result {
            Ok(_) => STATUS_CODE_SUCCESS,
            Err(status) => status.code(),
        }
    }
}

impl core::fmt::Display for Status {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(self, f)
    }
}
