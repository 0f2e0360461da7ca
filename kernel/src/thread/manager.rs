// kernel/src/thread/manager.rs
//
// The Thread Manager: registry of threads keyed by id, thread creation and
// deletion, and the system threads installed at boot.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use spin::{Mutex, Once};

use super::system_threads;
use super::{
    Thread, ThreadId, THREAD_ID_AUTO_ALLOCATE, THREAD_ID_BOOT, THREAD_ID_CLEANUP, THREAD_ID_IDLE,
    THREAD_ID_LOOPBACK, THREAD_ID_NULL,
};
use crate::capability::Capabilities;
use crate::hal;
use crate::memory::address_space::AddressSpace;
use crate::memory::{manager as memory, VirtAddr};
use crate::message::Message;
use crate::panic::{kernel_panic, PanicReason};
use crate::status::{KernelResult, Status};
use crate::syscall::{self, SyscallData};

struct ThreadTable {
    next_thread_id: ThreadId,
    table: BTreeMap<ThreadId, Arc<Thread>>,
}

struct SystemThreads {
    cleanup: Arc<Thread>,
    idle: Arc<Thread>,
    null: Arc<Thread>,
}

pub struct ThreadManager {
    inner: Mutex<ThreadTable>,
    system: Once<SystemThreads>,
}

static THREAD_MANAGER: Once<ThreadManager> = Once::new();

/// Bring up the Thread Manager and install the system threads.  Requires
/// the Memory Manager; runs once during boot, before any lottery is held.
pub fn init() {
    let created = THREAD_MANAGER.call_once(|| {
        log::info!("initializing Thread Manager");
        ThreadManager {
            inner: Mutex::new(ThreadTable {
                next_thread_id: THREAD_ID_NULL + 1,
                table: BTreeMap::new(),
            }),
            system: Once::new(),
        }
    });
    created.initialize_system_threads();
}

pub fn thread_manager() -> &'static ThreadManager {
    THREAD_MANAGER.get().expect("Thread Manager not initialized")
}

pub fn try_thread_manager() -> Option<&'static ThreadManager> {
    THREAD_MANAGER.get()
}

impl ThreadManager {
    /// Allocate a new thread.  The child's capability mask is clipped to
    /// the parent's: a parent cannot grant what it does not hold.
    pub fn create_thread(
        &self,
        kernel_start: Option<fn()>,
        address_space: Option<Arc<AddressSpace>>,
        id: ThreadId,
        capability_mask: Capabilities,
        user_start: Option<VirtAddr>,
        user_stack: Option<VirtAddr>,
    ) -> KernelResult<Arc<Thread>> {
        let current_thread = crate::thread::try_current();
        if let Some(parent) = &current_thread {
            if !parent.has_capability(Capabilities::CREATE_THREAD) {
                log::warn!("insufficient privileges to create new thread");
                return Err(Status::AccessDenied);
            }
        }

        let mut inner = self.inner.lock();

        let id = if id == THREAD_ID_AUTO_ALLOCATE {
            while inner.table.contains_key(&inner.next_thread_id) {
                inner.next_thread_id += 1;
            }
            let id = inner.next_thread_id;
            inner.next_thread_id += 1;
            id
        } else {
            if inner.table.contains_key(&id) {
                log::warn!("unable to allocate thread, id {:#x} is already in use", id);
                return Err(Status::ResourceConflict);
            }
            id
        };

        // Threads with no explicit address space run in the kernel's
        let address_space = match address_space {
            Some(space) => space,
            None => memory::memory_manager().kernel_address_space(),
        };

        // One page per thread for copy-on-write repair; a thread can only
        // take one fault at a time, so the page is reused on every fault
        let copy_page = address_space
            .allocate_large_payload_block(1)
            .ok_or(Status::InsufficientMemory)?;

        let effective_mask = match &current_thread {
            Some(parent) => capability_mask & parent.capability_mask(),
            None => capability_mask,
        };

        let thread = match Thread::new(
            kernel_start,
            address_space.clone(),
            id,
            Some(copy_page),
            effective_mask,
            user_start,
            user_stack,
        ) {
            Ok(thread) => thread,
            Err(status) => {
                let _ = address_space.free_large_payload_block(copy_page);
                return Err(status);
            }
        };

        // Push the initial context so the scheduler can start this thread
        // as if it were merely resuming it
        hal::hal().initialize_thread_context(&thread);

        inner.table.insert(id, thread.clone());
        Ok(thread)
    }

    /// Intermediate stage of deletion: after this the victim can receive
    /// no messages, win no lotteries, and no lookup will find it.  The
    /// runtime resources go away with the last reference, in the thread's
    /// drop handler.  Never runs in the context of the victim itself.
    ///
    /// A thread requesting a deletion must not hold its own reference to
    /// the victim across a blocking request, or it can never be woken.
    pub fn delete_thread(&self, victim: &Arc<Thread>, acknowledgement: Option<Arc<Message>>) {
        if let Some(current_thread) = crate::thread::try_current() {
            debug_assert!(current_thread.id != victim.id);
        }

        crate::io::io_manager().delete_messages(victim, acknowledgement);

        let mut inner = self.inner.lock();
        inner.table.remove(&victim.id);
    }

    /// Look up a thread by id.  THREAD_ID_LOOPBACK and the current
    /// thread's own id short-circuit to the current thread.
    pub fn find_thread(&self, id: ThreadId) -> Option<Arc<Thread>> {
        if let Some(current_thread) = crate::thread::try_current() {
            if id == current_thread.id || id == THREAD_ID_LOOPBACK {
                return Some(current_thread);
            }
        }

        let found = self.inner.lock().table.get(&id).cloned();
        if found.is_none() {
            log::debug!("unable to find thread {:#x}", id);
        }
        found
    }

    pub fn cleanup_thread(&self) -> Option<Arc<Thread>> {
        self.system.get().map(|system| system.cleanup.clone())
    }

    pub fn idle_thread(&self) -> Option<Arc<Thread>> {
        self.system.get().map(|system| system.idle.clone())
    }

    pub fn null_thread(&self) -> Option<Arc<Thread>> {
        self.system.get().map(|system| system.null.clone())
    }

    /// Install the boot, cleanup, idle and null threads.  Runs only in the
    /// boot context; no other thread exists yet, so there is no risk of
    /// preemption here.
    fn initialize_system_threads(&'static self) {
        if self.system.get().is_some() {
            return;
        }

        // The boot thread wraps the currently-executing kernel init
        // context.  It never receives message payloads, so it gets no
        // copy-on-write buffer; and its quantum is effectively infinite so
        // nothing can preempt kernel initialization.
        let kernel_space = memory::memory_manager().kernel_address_space();
        let boot_thread = Thread::new(
            None,
            kernel_space,
            THREAD_ID_BOOT,
            None,
            Capabilities::ALL,
            None,
            None,
        )
        .unwrap_or_else(|_| kernel_panic(PanicReason::UnableToCreateSystemThread, [0; 4]));
        boot_thread
            .tick_count
            .store(i32::MAX, core::sync::atomic::Ordering::Relaxed);

        self.inner
            .lock()
            .table
            .insert(THREAD_ID_BOOT, boot_thread.clone());
        let _ = crate::thread::set_current(boot_thread.clone());
        log::debug!("initialized boot thread (id {:#x})", boot_thread.id);

        let mut spawn = |entry: fn(), id: ThreadId| {
            self.create_thread(Some(entry), None, id, Capabilities::ALL, None, None)
                .unwrap_or_else(|_| {
                    kernel_panic(PanicReason::UnableToCreateSystemThread, [id, 0, 0, 0])
                })
        };

        let cleanup = spawn(system_threads::cleanup_thread_entry, THREAD_ID_CLEANUP);
        let idle = spawn(system_threads::idle_thread_entry, THREAD_ID_IDLE);
        let null = spawn(system_threads::null_thread_entry, THREAD_ID_NULL);
        log::debug!(
            "initialized cleanup (id {:#x}), idle (id {:#x}), null (id {:#x}) threads",
            cleanup.id,
            idle.id,
            null.id
        );

        self.system.call_once(|| SystemThreads { cleanup, idle, null });
    }

    /// System-call dispatch for the thread vectors.
    pub fn handle_system_call(&self, vector: usize, syscall: &mut SyscallData) {
        match vector {
            syscall::VECTOR_CREATE_THREAD => self.syscall_create_thread(syscall),
            syscall::VECTOR_DELETE_THREAD => {
                log::trace!("system call: delete thread {:#x}", syscall.data0);
                // Blocks until the deletion completes; never returns when a
                // thread is deleting itself
                let result = system_threads::send_deletion_message(syscall.data0);
                syscall.status = Status::code_of(&result);
            }
            _ => kernel_panic(PanicReason::UnexpectedInterrupt, [vector, 0, 0, 0]),
        }
    }

    /// CreateThread: data0 = address space id, data1 = entry point,
    /// data2 = stack, data3 = capability mask.  Returns the new thread's
    /// id in data0.
    fn syscall_create_thread(&self, syscall: &mut SyscallData) {
        log::trace!("system call: create thread");

        let result = match memory::memory_manager().find_address_space(syscall.data0) {
            Some(address_space) => self.create_thread(
                Some(system_threads::user_thread_entry),
                Some(address_space),
                THREAD_ID_AUTO_ALLOCATE,
                Capabilities::from_bits_truncate(syscall.data3),
                Some(VirtAddr(syscall.data1 as u32)),
                Some(VirtAddr(syscall.data2 as u32)),
            ),
            None => Err(Status::InvalidData),
        };

        if let Ok(thread) = &result {
            syscall.data0 = thread.id;
        }
        syscall.status = Status::code_of(&result);
    }
}
