// kernel/src/io/mod.rs
//
// The I/O Manager: synchronous and asynchronous message passing, the
// lottery scheduler over the global message pool, and the message-side
// half of thread deletion.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use lazy_static::lazy_static;
use spin::Mutex;

use crate::hal;
use crate::message::pool::MessagePool;
use crate::message::{Message, MessageType};
use crate::panic::{kernel_panic, PanicReason};
use crate::status::{KernelResult, Status};
use crate::syscall::{self, SyscallData};
use crate::thread::manager::{thread_manager, try_thread_manager};
use crate::thread::Thread;

/// Every thread receives a scheduling quantum of 12 clock ticks; at 500 Hz
/// that is roughly 24 milliseconds.  In practice a thread gets slightly
/// less because it rarely gains the processor on an exact tick boundary.
pub const SCHEDULING_QUANTUM_DEFAULT: i32 = 12;

/// Scheduling and messaging statistics.
#[derive(Default)]
pub struct IoStatistics {
    pub direct_handoff_count: AtomicU32,
    pub idle_count: AtomicU32,
    pub lottery_count: AtomicU32,
    pub message_count: AtomicU32,
    pub receive_error_count: AtomicU32,
    pub send_error_count: AtomicU32,
}

impl IoStatistics {
    fn bump(counter: &AtomicU32) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct Xorshift32 {
    state: u32,
}

impl Xorshift32 {
    fn next(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        x
    }
}

pub struct IoManager {
    pending_messages: Mutex<MessagePool>,
    random: Mutex<Option<Xorshift32>>,
    /// Recipient of the last blocking send, preferred at the next lottery
    handoff: Mutex<Option<Arc<Thread>>>,
    pub stats: IoStatistics,
}

lazy_static! {
    static ref IO_MANAGER: IoManager = IoManager {
        pending_messages: Mutex::new(MessagePool::new()),
        random: Mutex::new(None),
        handoff: Mutex::new(None),
        stats: IoStatistics::default(),
    };
}

pub fn io_manager() -> &'static IoManager {
    &IO_MANAGER
}

impl IoManager {
    fn next_random(&self) -> u32 {
        let mut random = self.random.lock();
        random
            .get_or_insert_with(|| Xorshift32 {
                state: hal::hal().random_seed() | 1,
            })
            .next()
    }

    /// Asynchronous delivery: queue the message for its destination and
    /// enter it in the lottery pool.  For a blocking message this also
    /// marks the calling thread blocked; the caller yields afterwards.
    pub fn put_message(&self, message: Arc<Message>) -> KernelResult<()> {
        let current_thread =
            crate::thread::try_current().unwrap_or_else(|| message.source.clone());
        let recipient = message.destination.clone();

        match Thread::enqueue_message(&recipient, &current_thread, message.clone()) {
            Ok(()) => {
                self.pending_messages.lock().insert(message.clone());
                IoStatistics::bump(&self.stats.message_count);

                if message.is_blocking() && recipient.is_ready() {
                    *self.handoff.lock() = Some(recipient);
                }
                Ok(())
            }
            Err(status) => {
                IoStatistics::bump(&self.stats.send_error_count);
                Err(status)
            }
        }
    }

    /// Synchronous send: collect the payload in the sender's context,
    /// deliver, then sleep until the matching response arrives.  The
    /// response is the wakeup message, which always sits at the head of
    /// the mailbox.
    pub fn send_message(&self, request: Arc<Message>) -> KernelResult<Arc<Message>> {
        debug_assert!(request.is_blocking());
        request.collect_payload()?;

        let current_thread = crate::thread::current();
        self.put_message(request)?;

        // On hardware the yield switches away and only resumes once the
        // response has marked this thread ready again
        while !current_thread.is_ready() {
            hal::hal().soft_yield();
        }

        self.receive_message(true)
    }

    /// Retrieve the next message pending for the current thread.  With
    /// `wait` the thread yields until traffic arrives; without it an empty
    /// mailbox is an error.  The payload is delivered (mapped or copied
    /// into this address space) before the message is returned.
    pub fn receive_message(&self, wait: bool) -> KernelResult<Arc<Message>> {
        let current_thread = crate::thread::current();
        loop {
            if let Some(message) = current_thread.take_message() {
                self.pending_messages.lock().remove(&message);
                match message.deliver_payload() {
                    Ok(_) => return Ok(message),
                    Err(status) => {
                        IoStatistics::bump(&self.stats.receive_error_count);
                        return Err(status);
                    }
                }
            }
            if !wait {
                return Err(Status::MailboxEmpty);
            }
            hal::hal().soft_yield();
        }
    }

    /// Message-side half of thread deletion: disable the victim's mailbox,
    /// pull its backlog out of the pool, wake any senders still blocked on
    /// requests the victim will never answer, and stash the deletion
    /// acknowledgement.
    pub fn delete_messages(&self, victim: &Arc<Thread>, acknowledgement: Option<Arc<Message>>) {
        let mut leftover_messages = Vec::new();
        victim.mark_for_deletion(&mut leftover_messages, acknowledgement);

        {
            let mut pool = self.pending_messages.lock();
            for message in &leftover_messages {
                pool.remove(message);
            }
        }

        for message in leftover_messages {
            if message.is_blocking() {
                // The sender is waiting on a response that will never
                // come; hand it a null response in the victim's name
                let wakeup = Message::small(
                    victim.clone(),
                    message.source.clone(),
                    MessageType::NULL,
                    message.id,
                    0,
                );
                if self.put_message(wakeup).is_err() {
                    log::warn!(
                        "unable to release thread {:#x} blocked on dying thread {:#x}",
                        message.source.id,
                        victim.id
                    );
                    message.source.abandon_block();
                }
            }
            // Non-blocking leftovers are simply discarded
        }
    }

    /// Clock tick: burn one quantum tick off the running thread and hold a
    /// new lottery when the quantum expires.
    pub fn handle_clock_tick(&self) {
        let current_thread = crate::thread::current();
        if current_thread.tick_count.fetch_sub(1, Ordering::Relaxed) > 1 {
            return;
        }
        self.reschedule();
    }

    /// Hold a lottery and switch to the winner.  Runs at quantum expiry
    /// and on the soft-yield vector; the context-switch decision always
    /// happens after the interrupt handler chain has unwound.
    pub fn reschedule(&self) {
        let current_thread = crate::thread::current();

        // Keep the outgoing thread eligible even when it has no pending
        // work, or it could starve while still runnable
        if let Some(null_message) = current_thread.maybe_put_null_message() {
            self.pending_messages.lock().insert(null_message);
        }

        let next_thread = self.select_next_thread();
        next_thread
            .tick_count
            .store(SCHEDULING_QUANTUM_DEFAULT, Ordering::Relaxed);

        if next_thread.id != current_thread.id {
            let _ = crate::thread::set_current(next_thread.clone());
            hal::hal().switch_thread(&current_thread, &next_thread);
        }
    }

    /// Lottery policy: prefer a direct handoff to the ready recipient of a
    /// blocking send; otherwise run the destination of a uniformly random
    /// pending message; with no runnable work at all, run the idle thread.
    fn select_next_thread(&self) -> Arc<Thread> {
        if let Some(handoff) = self.handoff.lock().take() {
            if handoff.is_ready() && handoff.mailbox_enabled() {
                IoStatistics::bump(&self.stats.direct_handoff_count);
                return handoff;
            }
        }

        let mut attempts = 0;
        loop {
            let candidate = {
                let pool = self.pending_messages.lock();
                if pool.is_empty() || attempts >= pool.len().max(8) {
                    break;
                }
                pool.select_random(self.next_random())
            };
            let destination = candidate.destination.clone();
            if destination.is_ready() && destination.mailbox_enabled() {
                IoStatistics::bump(&self.stats.lottery_count);
                return destination;
            }
            attempts += 1;
        }

        IoStatistics::bump(&self.stats.idle_count);
        match try_thread_manager().and_then(|manager| manager.idle_thread()) {
            Some(idle_thread) => idle_thread,
            None => crate::thread::current(),
        }
    }

    #[cfg(test)]
    pub(crate) fn reset_for_tests(&self) {
        *self.pending_messages.lock() = MessagePool::new();
        *self.handoff.lock() = None;
    }

    #[cfg(test)]
    pub(crate) fn pending_message_total(&self) -> usize {
        self.pending_messages.lock().len()
    }

    /// System-call dispatch for the messaging vectors.
    pub fn handle_system_call(&self, vector: usize, syscall: &mut SyscallData) {
        match vector {
            syscall::VECTOR_SEND_MESSAGE => self.syscall_send_message(syscall),
            syscall::VECTOR_SEND_AND_RECEIVE_MESSAGE => {
                self.syscall_send_and_receive_message(syscall)
            }
            syscall::VECTOR_RECEIVE_MESSAGE => self.syscall_receive_message(syscall),
            syscall::VECTOR_DELETE_MESSAGE => self.syscall_delete_message(syscall),
            syscall::VECTOR_SOFT_YIELD => {
                syscall.status = crate::status::STATUS_CODE_SUCCESS;
                self.reschedule();
            }
            _ => kernel_panic(PanicReason::UnexpectedInterrupt, [vector, 0, 0, 0]),
        }
    }

    /// Wire format shared by both send vectors: data0 = destination id,
    /// data1 = type, data2 = message id, data3 = payload word or pointer,
    /// data4 = payload size (0 selects a single-word message), data5 =
    /// explicit destination address or zero.
    fn message_from_syscall(&self, syscall: &SyscallData, blocking: bool) -> KernelResult<Arc<Message>> {
        let destination = thread_manager()
            .find_thread(syscall.data0)
            .ok_or(Status::InvalidData)?;
        Ok(Message::from_syscall(
            crate::thread::current(),
            destination,
            MessageType(syscall.data1 as u32),
            syscall.data2,
            syscall.data3,
            syscall.data4,
            syscall.data5,
            blocking,
        ))
    }

    /// Write a received message back into the syscall block: data0 =
    /// source thread, data1 = type, data2 = id, data3 = payload word or
    /// address, data4 = payload size.
    fn write_message_out(syscall: &mut SyscallData, message: &Arc<Message>) {
        syscall.data0 = message.source.id;
        syscall.data1 = message.message_type.0 as usize;
        syscall.data2 = message.id;
        match message.delivered_payload() {
            Some(crate::message::Delivered::Word(word)) => {
                syscall.data3 = word;
                syscall.data4 = 0;
            }
            Some(crate::message::Delivered::Block { address, size }) => {
                syscall.data3 = address.0 as usize;
                syscall.data4 = size;
            }
            None => {
                syscall.data3 = 0;
                syscall.data4 = 0;
            }
        }
    }

    fn syscall_send_message(&self, syscall: &mut SyscallData) {
        log::trace!("system call: send message to {:#x}", syscall.data0);
        let result = self
            .message_from_syscall(syscall, false)
            .and_then(|message| {
                message.collect_payload()?;
                self.put_message(message)
            });
        syscall.status = Status::code_of(&result);
    }

    fn syscall_send_and_receive_message(&self, syscall: &mut SyscallData) {
        log::trace!("system call: send and receive message to {:#x}", syscall.data0);
        let result = self
            .message_from_syscall(syscall, true)
            .and_then(|message| self.send_message(message));
        if let Ok(response) = &result {
            Self::write_message_out(syscall, response);
        }
        syscall.status = Status::code_of(&result);
    }

    /// ReceiveMessage: data0 = wait flag on entry.
    fn syscall_receive_message(&self, syscall: &mut SyscallData) {
        let wait = syscall.data0 != 0;
        let result = self.receive_message(wait);
        if let Ok(message) = &result {
            Self::write_message_out(syscall, message);
        }
        syscall.status = Status::code_of(&result);
    }

    /// DeleteMessage: release a delivered payload block.  data0 = payload
    /// address, data1 = payload size.
    fn syscall_delete_message(&self, syscall: &mut SyscallData) {
        let result = self.delete_payload(syscall.data0, syscall.data1);
        syscall.status = Status::code_of(&result);
    }

    fn delete_payload(&self, address: usize, size: usize) -> KernelResult<()> {
        use crate::memory::{
            VirtAddr, LARGE_PAYLOAD_POOL_BASE, LARGE_PAYLOAD_POOL_COUNT, MEDIUM_PAYLOAD_POOL_BASE,
            PAYLOAD_POOL_SIZE,
        };

        let current_thread = crate::thread::current();
        let address = VirtAddr(address as u32);
        let large_pools_end =
            LARGE_PAYLOAD_POOL_BASE + (LARGE_PAYLOAD_POOL_COUNT as u32) * PAYLOAD_POOL_SIZE;

        if (MEDIUM_PAYLOAD_POOL_BASE..LARGE_PAYLOAD_POOL_BASE).contains(&address.0) {
            current_thread.address_space.free_medium_payload_block(address)
        } else if (LARGE_PAYLOAD_POOL_BASE..large_pools_end).contains(&address.0) {
            let page = address.page_base();
            let span = address.page_offset() as usize + size;
            current_thread.address_space.unshare_pages(page, span);
            current_thread.address_space.free_large_payload_block(page)
        } else {
            Err(Status::InvalidData)
        }
    }
}
