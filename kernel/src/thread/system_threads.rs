// kernel/src/thread/system_threads.rs
//
// Entry points for the threads the kernel itself runs: cleanup (drives
// thread destruction), idle (halts the processor when nothing is ready),
// null (sink for stray messages), plus the common entry for user threads
// and the deletion-request plumbing.

use crate::hal;
use crate::message::{next_kernel_message_id, Delivered, Message, MessageType};
use crate::status::{KernelResult, Status};
use crate::thread::manager::thread_manager;
use crate::thread::ThreadId;

/// Ask the cleanup thread to destroy `victim_id`, then block until the
/// deletion acknowledgement arrives.  When a thread is deleting itself
/// this never returns; the acknowledgement is skipped and the caller is
/// simply never scheduled again.
pub fn send_deletion_message(victim_id: ThreadId) -> KernelResult<()> {
    let current_thread = crate::thread::current();
    let cleanup_thread = thread_manager()
        .cleanup_thread()
        .ok_or(Status::InvalidData)?;

    let request = Message::small_blocking(
        current_thread,
        cleanup_thread,
        MessageType::DELETE_THREAD,
        next_kernel_message_id(),
        victim_id,
    );
    let acknowledgement = crate::io::io_manager().send_message(request)?;
    match acknowledgement.delivered_payload() {
        Some(Delivered::Word(0)) => Ok(()),
        _ => Err(Status::InvalidData),
    }
}

/// One pass of the cleanup loop: wait for a deletion request and carry it
/// out.  The acknowledgement is stored on the victim and sent from its
/// final teardown, so the requestor sleeps until the last reference to the
/// victim is gone.
pub(crate) fn service_deletion_request() -> KernelResult<()> {
    let request = crate::io::io_manager().receive_message(true)?;
    if request.message_type != MessageType::DELETE_THREAD {
        log::debug!(
            "cleanup thread ignoring message type {:?} from thread {:#x}",
            request.message_type,
            request.source.id
        );
        return Ok(());
    }

    let victim_id = match request.delivered_payload() {
        Some(Delivered::Word(id)) => id,
        _ => return Err(Status::InvalidData),
    };
    let cleanup_thread = crate::thread::current();
    let requestor = request.source.clone();

    match thread_manager().find_thread(victim_id) {
        Some(victim) => {
            // A thread that deleted itself cannot be woken; everyone else
            // gets an acknowledgement once the victim is fully gone
            let acknowledgement = if requestor.id != victim_id {
                Some(Message::small(
                    cleanup_thread,
                    requestor,
                    MessageType::DELETION_ACKNOWLEDGEMENT,
                    request.id,
                    0,
                ))
            } else {
                None
            };
            thread_manager().delete_thread(&victim, acknowledgement);
            Ok(())
        }
        None => {
            // Bad id: wake the requestor immediately with an error word
            let nack = Message::small(
                cleanup_thread,
                requestor,
                MessageType::DELETION_ACKNOWLEDGEMENT,
                request.id,
                Status::InvalidData.code(),
            );
            if crate::io::io_manager().put_message(nack).is_err() {
                log::error!("unable to reject deletion of unknown thread {:#x}", victim_id);
            }
            Ok(())
        }
    }
}

/// Receives deletion requests and drives thread destruction.
pub fn cleanup_thread_entry() {
    loop {
        if let Err(status) = service_deletion_request() {
            log::error!("cleanup thread error: {}", status);
        }
    }
}

/// Consumes cycles when nothing is ready to run.
pub fn idle_thread_entry() {
    loop {
        hal::hal().suspend_processor();
    }
}

/// Sink for stray and synthesized null messages.
pub fn null_thread_entry() {
    loop {
        match crate::io::io_manager().receive_message(true) {
            Ok(message) => {
                log::trace!(
                    "null thread discarding message {:#x} from thread {:#x}",
                    message.id,
                    message.source.id
                );
            }
            Err(status) => log::debug!("null thread receive error: {}", status),
        }
    }
}

/// Common kernel-side entry for user threads: drop to ring 3 at the
/// requested entry point and stack.  Never returns.
pub fn user_thread_entry() {
    let current_thread = crate::thread::current();
    let (entry, stack) = match (current_thread.user_start, current_thread.user_stack) {
        (Some(entry), Some(stack)) => (entry, stack),
        _ => {
            log::error!("thread {:#x} has no user context", current_thread.id);
            crate::thread::thread_exit();
        }
    };
    hal::hal().jump_to_user(entry, stack);
}
