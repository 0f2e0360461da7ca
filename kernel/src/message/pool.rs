// kernel/src/message/pool.rs
//
// Unsorted pool of every message currently pending in some thread's
// mailbox.  This is the population the scheduling lottery draws from, so
// insertion, removal-by-handle and random selection all stay O(1): each
// message caches its own slot, and removal swaps the last entry into the
// vacated position.

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::Message;

pub struct MessagePool {
    pool: Vec<Arc<Message>>,
}

impl MessagePool {
    pub const fn new() -> MessagePool {
        MessagePool { pool: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn insert(&mut self, message: Arc<Message>) {
        message.set_pool_index(self.pool.len());
        self.pool.push(message);
    }

    /// Remove a message given a handle to it.  The last entry takes over
    /// the vacated slot so the pool stays packed for select_random().
    pub fn remove(&mut self, victim: &Arc<Message>) {
        let index = victim.pool_index();
        if index >= self.pool.len() || !Arc::ptr_eq(&self.pool[index], victim) {
            debug_assert!(false, "message pool index out of sync");
            log::error!("message pool index out of sync");
            return;
        }

        self.pool.swap_remove(index);
        if index < self.pool.len() {
            self.pool[index].set_pool_index(index);
        }
        victim.set_pool_index(usize::MAX);
    }

    /// A uniformly random message; the message stays in the pool.
    pub fn select_random(&self, random: u32) -> Arc<Message> {
        debug_assert!(!self.is_empty());
        let index = random as usize % self.pool.len();
        self.pool[index].clone()
    }
}
