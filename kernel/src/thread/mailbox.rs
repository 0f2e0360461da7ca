// kernel/src/thread/mailbox.rs
//
// Per-thread mailbox: a FIFO of pending messages plus an enabled flag.
// Disabling the mailbox is the first step of thread deletion.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use crate::message::Message;

/// Maximum backlog of messages.  Past this limit the sender gets an error;
/// the overflowing thread itself is left alone.
pub const MAILBOX_LIMIT: usize = 64;

#[derive(Debug)]
pub struct Mailbox {
    pub enabled: bool,
    pub queue: VecDeque<Arc<Message>>,
}

impl Mailbox {
    pub const fn new() -> Mailbox {
        Mailbox {
            enabled: true,
            queue: VecDeque::new(),
        }
    }

    pub fn overflow(&self) -> bool {
        self.queue.len() >= MAILBOX_LIMIT
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}
