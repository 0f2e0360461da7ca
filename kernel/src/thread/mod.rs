// kernel/src/thread/mod.rs
//
// Thread lifecycle and state.  Every thread owns a page-aligned execution
// block hosting its kernel stack, a capability mask clipped to its
// parent's, a mailbox, and the scratch page used to repair copy-on-write
// faults.  The per-thread lock is held across short critical sections
// only; two thread locks are always taken in ascending-id order.

pub mod mailbox;
pub mod manager;
pub mod system_threads;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::AtomicI32;
use spin::{Mutex, MutexGuard, RwLock};

use self::mailbox::Mailbox;
use crate::capability::Capabilities;
use crate::hal;
use crate::memory::address_space::AddressSpace;
use crate::memory::{VirtAddr, PAGE_SIZE};
use crate::message::{next_kernel_message_id, Message, MessageId, MessageType};
use crate::status::{KernelResult, Status};

pub type ThreadId = usize;

// Well-known system threads, installed at boot
pub const THREAD_ID_BOOT: ThreadId = 0;
pub const THREAD_ID_CLEANUP: ThreadId = 1;
pub const THREAD_ID_IDLE: ThreadId = 2;
pub const THREAD_ID_NULL: ThreadId = 3;

pub const THREAD_ID_AUTO_ALLOCATE: ThreadId = usize::MAX - 2;
pub const THREAD_ID_LOOPBACK: ThreadId = usize::MAX - 1;
pub const THREAD_ID_INVALID: ThreadId = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Blocked,
}

/// One memory page hosting a thread's kernel stack.  The block is
/// page-aligned so the hosting page can be recovered from any stack
/// address by masking.
#[derive(Debug)]
pub struct ExecutionBlock {
    base: NonNull<u8>,
}

pub const EXECUTION_BLOCK_SIZE: usize = PAGE_SIZE as usize;

impl ExecutionBlock {
    fn new() -> KernelResult<ExecutionBlock> {
        let layout = Layout::from_size_align(EXECUTION_BLOCK_SIZE, EXECUTION_BLOCK_SIZE)
            .expect("bad execution block layout");
        let pointer = unsafe { alloc::alloc::alloc_zeroed(layout) };
        match NonNull::new(pointer) {
            Some(base) => Ok(ExecutionBlock { base }),
            None => Err(Status::InsufficientMemory),
        }
    }

    pub fn base_address(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// The kernel stack grows down from the end of the block.
    pub fn stack_top(&self) -> usize {
        self.base_address() + EXECUTION_BLOCK_SIZE
    }
}

impl Drop for ExecutionBlock {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(EXECUTION_BLOCK_SIZE, EXECUTION_BLOCK_SIZE)
            .expect("bad execution block layout");
        unsafe { alloc::alloc::dealloc(self.base.as_ptr(), layout) };
    }
}

unsafe impl Send for ExecutionBlock {}
unsafe impl Sync for ExecutionBlock {}

#[derive(Debug)]
pub(crate) struct ThreadInner {
    pub state: ThreadState,
    pub blocking_message_id: MessageId,
    pub blocking_thread: Option<Arc<Thread>>,
    pub mailbox: Mailbox,
    pub deletion_acknowledgement: Option<Arc<Message>>,
}

#[derive(Debug)]
pub struct Thread {
    pub id: ThreadId,
    pub address_space: Arc<AddressSpace>,
    /// Scratch page reserved for copy-on-write fixups
    pub copy_page: Option<VirtAddr>,
    capability_mask: Capabilities,

    // Initial/startup context
    pub kernel_start: Option<fn()>,
    pub user_start: Option<VirtAddr>,
    pub user_stack: Option<VirtAddr>,

    /// Remaining scheduling quantum, in clock ticks
    pub tick_count: AtomicI32,
    execution_block: ExecutionBlock,
    inner: Mutex<ThreadInner>,
}

impl Thread {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        kernel_start: Option<fn()>,
        address_space: Arc<AddressSpace>,
        id: ThreadId,
        copy_page: Option<VirtAddr>,
        capability_mask: Capabilities,
        user_start: Option<VirtAddr>,
        user_stack: Option<VirtAddr>,
    ) -> KernelResult<Arc<Thread>> {
        let execution_block = ExecutionBlock::new()?;
        debug_assert!(execution_block.base_address() % EXECUTION_BLOCK_SIZE == 0);

        Ok(Arc::new(Thread {
            id,
            address_space,
            copy_page,
            capability_mask,
            kernel_start,
            user_start,
            user_stack,
            tick_count: AtomicI32::new(0),
            execution_block,
            inner: Mutex::new(ThreadInner {
                state: ThreadState::Ready,
                blocking_message_id: 0,
                blocking_thread: None,
                mailbox: Mailbox::new(),
                deletion_acknowledgement: None,
            }),
        }))
    }

    pub fn has_capability(&self, mask: Capabilities) -> bool {
        self.capability_mask.contains(mask)
    }

    pub fn capability_mask(&self) -> Capabilities {
        self.capability_mask
    }

    pub fn state(&self) -> ThreadState {
        self.inner.lock().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ThreadState::Ready
    }

    pub fn stack_top(&self) -> usize {
        self.execution_block.stack_top()
    }

    pub fn execution_block_base(&self) -> usize {
        self.execution_block.base_address()
    }

    pub fn mailbox_enabled(&self) -> bool {
        self.inner.lock().mailbox.enabled
    }

    pub fn pending_message_count(&self) -> usize {
        self.inner.lock().mailbox.queue.len()
    }

    pub fn disable_mailbox(&self) {
        self.inner.lock().mailbox.enabled = false;
    }

    /// Queue `message` for `recipient`.  This is the lowest-level delivery
    /// primitive, underneath both I/O Manager send paths.  It manipulates
    /// two threads at once: the recipient (possibly waking it) and the
    /// sender (possibly marking it blocked); the actual yield happens later,
    /// once the caller has dropped all locks.
    pub(crate) fn enqueue_message(
        recipient: &Arc<Thread>,
        current: &Arc<Thread>,
        message: Arc<Message>,
    ) -> KernelResult<()> {
        let (mut recipient_guard, mut current_guard) = lock_pair(recipient, current);

        if !recipient_guard.mailbox.enabled {
            return Err(Status::MailboxDisabled);
        }

        // A blocking send must not create a scheduling loop; a loop would
        // turn the lottery into an infinite draw over blocked threads
        if message.is_blocking() {
            if recipient.id == current.id {
                log::warn!("thread {:#x} is attempting to block on itself", current.id);
                return Err(Status::MessageDeadlock);
            }
            // Walk the recipient's blocking chain to its head.  Both ends
            // of this send are already locked, so the walk stops at either
            // of them instead of taking their locks again.
            let mut head = recipient_guard.blocking_thread.clone();
            while let Some(thread) = &head {
                if thread.id == current.id || thread.id == recipient.id {
                    break;
                }
                let next = thread.inner.lock().blocking_thread.clone();
                match next {
                    Some(next) => head = Some(next),
                    None => break,
                }
            }
            if head.is_some_and(|head| head.id == current.id) {
                log::warn!(
                    "scheduling loop between threads {:#x} and {:#x}",
                    current.id,
                    recipient.id
                );
                return Err(Status::MessageDeadlock);
            }
        }

        // Three possibilities: the message wakes the recipient and jumps
        // the queue; it queues normally; or the mailbox is full
        if unblock_on(&mut recipient_guard, &message) {
            debug_assert_eq!(recipient_guard.state, ThreadState::Ready);
            recipient_guard.mailbox.queue.push_front(message.clone());
        } else if !recipient_guard.mailbox.overflow() {
            recipient_guard.mailbox.queue.push_back(message.clone());
        } else {
            log::warn!("mailbox overflow on thread {:#x}", recipient.id);
            return Err(Status::MailboxOverflow);
        }

        // A sender expecting a response is marked blocked here; it keeps
        // running until it yields after dropping its locks
        if message.is_blocking() {
            let sender = current_guard
                .as_mut()
                .expect("self-directed blocking send already rejected");
            debug_assert!(sender.blocking_thread.is_none());
            sender.state = ThreadState::Blocked;
            sender.blocking_message_id = message.id;
            sender.blocking_thread = Some(recipient.clone());
        }

        Ok(())
    }

    /// Pop the next pending message, if any.
    pub(crate) fn take_message(&self) -> Option<Arc<Message>> {
        self.inner.lock().mailbox.queue.pop_front()
    }

    /// Ensure the current thread keeps at least one message pending, so it
    /// stays eligible for the scheduling lottery when its quantum expires.
    /// Returns the injected null message for the caller to pool, or None
    /// if the mailbox already had work (or is disabled).
    pub(crate) fn maybe_put_null_message(self: &Arc<Self>) -> Option<Arc<Message>> {
        let null_thread = manager::try_thread_manager()?.null_thread()?;

        let mut inner = self.inner.lock();
        if !inner.mailbox.enabled || !inner.mailbox.queue.is_empty() {
            return None;
        }

        let message = Message::small(
            null_thread,
            self.clone(),
            MessageType::NULL,
            next_kernel_message_id(),
            0,
        );
        inner.mailbox.queue.push_back(message.clone());
        Some(message)
    }

    /// First step of deletion: stop accepting messages, hand the pending
    /// backlog to the caller and stash the acknowledgement that will wake
    /// the requestor once the last reference drops.
    pub(crate) fn mark_for_deletion(
        &self,
        leftover_messages: &mut Vec<Arc<Message>>,
        acknowledgement: Option<Arc<Message>>,
    ) {
        let mut inner = self.inner.lock();

        inner.mailbox.enabled = false;
        while let Some(message) = inner.mailbox.queue.pop_front() {
            leftover_messages.push(message);
        }

        if let Some(acknowledgement) = acknowledgement {
            debug_assert!(inner.deletion_acknowledgement.is_none());
            inner.deletion_acknowledgement = Some(acknowledgement);
        }
    }

    /// Release a blocked-sender state without a matching wakeup message;
    /// used when the thread it was waiting on is being torn down.
    pub(crate) fn abandon_block(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ThreadState::Blocked {
            inner.state = ThreadState::Ready;
            inner.blocking_thread = None;
        }
    }

    /// The thread at the head of this thread's blocking chain, or None if
    /// this thread is not blocked at all.
    pub fn find_blocking_thread(&self) -> Option<Arc<Thread>> {
        let first = self.inner.lock().blocking_thread.clone()?;
        Some(head_of_line_blocker(first))
    }

    /// Grant this thread's address space access to a range of I/O ports
    /// and reload the hardware map if the thread is running.
    pub fn enable_io_port(&self, port: u16, count: u16) -> KernelResult<()> {
        self.address_space.enable_io_port(port, count)?;
        hal::hal().reload_io_port_map(self);
        Ok(())
    }

    pub fn disable_io_port(&self, port: u16, count: u16) -> KernelResult<()> {
        self.address_space.disable_io_port(port, count)?;
        hal::hal().reload_io_port_map(self);
        Ok(())
    }
}

impl Drop for Thread {
    /// Final stage of deletion; always runs in some other thread's context
    /// once the last handle drops.  Frees the scratch page, releases the
    /// address space and wakes whoever asked for the deletion.
    fn drop(&mut self) {
        log::debug!("destroying thread {:#x}", self.id);
        let inner = self.inner.get_mut();
        debug_assert!(inner.mailbox.queue.is_empty());

        if let Some(copy_page) = self.copy_page {
            let _ = self.address_space.free_large_payload_block(copy_page);
        }

        // A gracefully-exiting thread dies blocked on the cleanup thread;
        // drop that leftover reference
        inner.blocking_thread = None;

        if let Some(acknowledgement) = inner.deletion_acknowledgement.take() {
            log::trace!(
                "waking thread {:#x} after deletion of thread {:#x}",
                acknowledgement.destination.id,
                self.id
            );
            if crate::io::io_manager().put_message(acknowledgement).is_err() {
                // The requestor stays stuck; nothing more we can do
                log::error!("unable to wake requestor after deletion of thread {:#x}", self.id);
            }
        }
    }
}

/// Walk the chain of blocked threads to the one preventing the rest from
/// executing.  The chain is acyclic as long as every blocking send goes
/// through the loop check, so the walk terminates.
fn head_of_line_blocker(start: Arc<Thread>) -> Arc<Thread> {
    let mut thread = start;
    loop {
        let next = thread.inner.lock().blocking_thread.clone();
        match next {
            Some(next) => thread = next,
            None => return thread,
        }
    }
}

/// Lock two threads at once, lower id first.  Returns the recipient's
/// guard plus the sender's guard (None when they are the same thread).
fn lock_pair<'a>(
    recipient: &'a Arc<Thread>,
    current: &'a Arc<Thread>,
) -> (
    MutexGuard<'a, ThreadInner>,
    Option<MutexGuard<'a, ThreadInner>>,
) {
    if recipient.id == current.id {
        (recipient.inner.lock(), None)
    } else if recipient.id < current.id {
        let recipient_guard = recipient.inner.lock();
        let current_guard = current.inner.lock();
        (recipient_guard, Some(current_guard))
    } else {
        let current_guard = current.inner.lock();
        let recipient_guard = recipient.inner.lock();
        (recipient_guard, Some(current_guard))
    }
}

/// Companion to the blocking-send bookkeeping: if this thread is waiting
/// for precisely this message, wake it.
fn unblock_on(inner: &mut ThreadInner, message: &Message) -> bool {
    let waiting_for_sender = inner
        .blocking_thread
        .as_ref()
        .is_some_and(|blocker| blocker.id == message.source.id);

    if inner.state == ThreadState::Blocked
        && waiting_for_sender
        && inner.blocking_message_id == message.id
    {
        inner.state = ThreadState::Ready;
        inner.blocking_thread = None;
        true
    } else {
        false
    }
}

static CURRENT_THREAD: RwLock<Option<Arc<Thread>>> = RwLock::new(None);

/// The thread currently executing on this processor.  Maintained by the
/// scheduler at every context switch.
pub fn current() -> Arc<Thread> {
    try_current().expect("no current thread")
}

pub fn try_current() -> Option<Arc<Thread>> {
    CURRENT_THREAD.read().clone()
}

pub(crate) fn set_current(thread: Arc<Thread>) -> Option<Arc<Thread>> {
    core::mem::replace(&mut *CURRENT_THREAD.write(), Some(thread))
}

/// Give up the processor.  Safe inside system-call handlers, never inside
/// a device-interrupt handler.
pub fn thread_yield() {
    hal::hal().soft_yield();
}

/// Terminate the calling thread.  Never returns.
pub fn thread_exit() -> ! {
    let current_thread = current();
    log::debug!("thread {:#x} exiting", current_thread.id);

    if let Err(status) = system_threads::send_deletion_message(current_thread.id) {
        log::error!("thread {:#x} unable to exit: {}", current_thread.id, status);
    }
    loop {
        thread_yield();
    }
}

/// Common kernel entry for every thread: run the thread's kernel routine,
/// then exit when it returns.  The HAL's initial thread context is built
/// so that the first switch into a new thread "returns" here.
pub fn kernel_thread_trampoline() -> ! {
    let current_thread = current();
    if let Some(kernel_start) = current_thread.kernel_start {
        kernel_start();
    }
    thread_exit();
}
