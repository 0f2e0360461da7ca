// kernel/src/memory/shared_frame.rs
//
// Reference-counted descriptors for physical frames shared between address
// spaces.  A frame is owned either by exactly one address space or by one
// of these descriptors; when the last handle drops, the frame goes back to
// the frame allocator.

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::manager;
use super::PhysAddr;

/// A single physical frame shared between two or more holders (address
/// spaces, in-flight messages).  Handles are `Arc<SharedFrame>`; the strong
/// count is the reference count.
#[derive(Debug)]
pub struct SharedFrame {
    pub address: PhysAddr,
    /// Synthetic entries injected for kernel-superpage-backed data.  Their
    /// frames belong to the kernel image and are never freed.
    kernel_resident: bool,
}

impl SharedFrame {
    pub fn new(address: PhysAddr) -> Arc<SharedFrame> {
        Arc::new(SharedFrame {
            address,
            kernel_resident: false,
        })
    }

    pub fn new_kernel_resident(address: PhysAddr) -> Arc<SharedFrame> {
        Arc::new(SharedFrame {
            address,
            kernel_resident: true,
        })
    }

    pub fn is_kernel_resident(&self) -> bool {
        self.kernel_resident
    }

    /// Current number of holders; mainly for debugging and invariants.
    pub fn reference_count(this: &Arc<SharedFrame>) -> usize {
        Arc::strong_count(this)
    }
}

impl Drop for SharedFrame {
    fn drop(&mut self) {
        // Last reference gone: the underlying frame returns to the free pool
        if !self.kernel_resident {
            if let Some(memory_manager) = manager::try_memory_manager() {
                memory_manager.free_frames(&[self.address]);
            }
        }
    }
}

/// Ordered list of the frames backing one large message payload.
pub type SharedFrameList = Vec<Arc<SharedFrame>>;
