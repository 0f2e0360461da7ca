// kernel/src/message/mod.rs
//
// Message objects.  Three payload classes: small payloads ride in the
// message itself; medium payloads are copied through a kernel buffer into
// the recipient's slab; large payloads travel as lists of shared frames
// and are mapped into the recipient's address space on delivery.

pub mod pool;

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

use crate::capability::Capabilities;
use crate::hal;
use crate::memory::address_space::MEDIUM_PAYLOAD_SIZE;
use crate::memory::shared_frame::SharedFrameList;
use crate::memory::VirtAddr;
use crate::status::{KernelResult, Status};
use crate::thread::Thread;

pub type MessageId = usize;

/// Message type tag.  The low values are claimed by the kernel; drivers
/// and applications define their own protocols above them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageType(pub u32);

impl MessageType {
    pub const NULL: MessageType = MessageType(0);
    pub const HANDLE_INTERRUPT: MessageType = MessageType(1);
    pub const DELETE_THREAD: MessageType = MessageType(2);
    pub const DELETION_ACKNOWLEDGEMENT: MessageType = MessageType(3);
}

/// Ids for kernel-synthesized messages (null messages, interrupt fan-out,
/// deletion requests).
pub fn next_kernel_message_id() -> MessageId {
    static NEXT_ID: AtomicUsize = AtomicUsize::new(0x8000_0000);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug)]
enum Payload {
    /// A single word, stored inline
    Small(usize),
    /// Up to one slab entry, copied out of the sender at send time and
    /// into the recipient's medium-payload slab at delivery
    Medium {
        sender_payload: VirtAddr,
        size: usize,
        data: Vec<u8>,
        receiver_block: Option<VirtAddr>,
    },
    /// `size` bytes of sender memory, carried as shared frames
    Large {
        sender_payload: VirtAddr,
        size: usize,
        receiver_payload: Option<VirtAddr>,
        frames: SharedFrameList,
    },
}

/// What a delivered payload looks like from the recipient's side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivered {
    Word(usize),
    Block { address: VirtAddr, size: usize },
}

#[derive(Debug)]
pub struct Message {
    pub source: Arc<Thread>,
    pub destination: Arc<Thread>,
    pub message_type: MessageType,
    pub id: MessageId,
    blocking: bool,
    /// Cached slot in the global message pool
    pool_index: AtomicUsize,
    payload: Mutex<Payload>,
}

impl Message {
    fn build(
        source: Arc<Thread>,
        destination: Arc<Thread>,
        message_type: MessageType,
        id: MessageId,
        blocking: bool,
        payload: Payload,
    ) -> Arc<Message> {
        Arc::new(Message {
            source,
            destination,
            message_type,
            id,
            blocking,
            pool_index: AtomicUsize::new(usize::MAX),
            payload: Mutex::new(payload),
        })
    }

    pub fn small(
        source: Arc<Thread>,
        destination: Arc<Thread>,
        message_type: MessageType,
        id: MessageId,
        data: usize,
    ) -> Arc<Message> {
        Self::build(source, destination, message_type, id, false, Payload::Small(data))
    }

    pub fn small_blocking(
        source: Arc<Thread>,
        destination: Arc<Thread>,
        message_type: MessageType,
        id: MessageId,
        data: usize,
    ) -> Arc<Message> {
        Self::build(source, destination, message_type, id, true, Payload::Small(data))
    }

    pub fn medium(
        source: Arc<Thread>,
        destination: Arc<Thread>,
        message_type: MessageType,
        id: MessageId,
        sender_payload: VirtAddr,
        size: usize,
        blocking: bool,
    ) -> Arc<Message> {
        debug_assert!(size > 0);
        let size = size.min(MEDIUM_PAYLOAD_SIZE);
        Self::build(
            source,
            destination,
            message_type,
            id,
            blocking,
            Payload::Medium {
                sender_payload,
                size,
                data: Vec::new(),
                receiver_block: None,
            },
        )
    }

    pub fn large(
        source: Arc<Thread>,
        destination: Arc<Thread>,
        message_type: MessageType,
        id: MessageId,
        sender_payload: VirtAddr,
        size: usize,
        receiver_payload: Option<VirtAddr>,
        blocking: bool,
    ) -> Arc<Message> {
        debug_assert!(size > 0);
        Self::build(
            source,
            destination,
            message_type,
            id,
            blocking,
            Payload::Large {
                sender_payload,
                size,
                receiver_payload,
                frames: Vec::new(),
            },
        )
    }

    /// Build a message from the SendMessage wire format: the payload size
    /// selects the message class (0 = single word, one slab entry or less =
    /// medium, anything bigger = large).
    pub fn from_syscall(
        source: Arc<Thread>,
        destination: Arc<Thread>,
        message_type: MessageType,
        id: MessageId,
        data: usize,
        data_size: usize,
        destination_address: usize,
        blocking: bool,
    ) -> Arc<Message> {
        if data_size == 0 {
            Self::build(source, destination, message_type, id, blocking, Payload::Small(data))
        } else if data_size <= MEDIUM_PAYLOAD_SIZE {
            Self::medium(
                source,
                destination,
                message_type,
                id,
                VirtAddr(data as u32),
                data_size,
                blocking,
            )
        } else {
            let receiver_payload = match destination_address {
                0 => None,
                address => Some(VirtAddr(address as u32)),
            };
            Self::large(
                source,
                destination,
                message_type,
                id,
                VirtAddr(data as u32),
                data_size,
                receiver_payload,
                blocking,
            )
        }
    }

    /// Does the sender wait for a response to this message?
    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    pub(crate) fn pool_index(&self) -> usize {
        self.pool_index.load(Ordering::Relaxed)
    }

    pub(crate) fn set_pool_index(&self, index: usize) {
        self.pool_index.store(index, Ordering::Relaxed);
    }

    /// Capture the payload from the sender.  Always runs in the context of
    /// the sending thread, before the message is queued anywhere.
    pub fn collect_payload(&self) -> KernelResult<()> {
        let mut payload = self.payload.lock();
        match &mut *payload {
            Payload::Small(_) => Ok(()),

            Payload::Medium {
                sender_payload,
                size,
                data,
                ..
            } => {
                // Copy the user data into the message; this can fault if
                // the caller passed a bad address
                let mut buffer = vec![0u8; *size];
                hal::hal().copy_from_user(*sender_payload, &mut buffer);
                *data = buffer;
                Ok(())
            }

            Payload::Large {
                sender_payload,
                size,
                receiver_payload,
                frames,
            } => {
                if sender_payload.0 == 0 {
                    return Err(Status::InvalidData);
                }

                if let Some(target) = receiver_payload {
                    let current_thread = crate::thread::current();
                    if !current_thread.has_capability(Capabilities::EXPLICIT_TARGET_ADDRESS) {
                        log::warn!("insufficient privileges to deliver payload");
                        return Err(Status::AccessDenied);
                    }
                    // Sender and receiver must agree on the offset within
                    // the page, or the receiver would look for the payload
                    // in the wrong place
                    if sender_payload.page_offset() != target.page_offset() {
                        log::warn!(
                            "cannot deliver misaligned payload from {:#x} to {:#x}",
                            sender_payload.0,
                            target.0
                        );
                        return Err(Status::IoError);
                    }
                    if !target.is_user() {
                        log::warn!("cannot place message payload at kernel {:#x}", target.0);
                        return Err(Status::AccessDenied);
                    }
                }

                let current_thread = crate::thread::current();
                *frames = current_thread
                    .address_space
                    .share_pages(*sender_payload, *size)?;
                Ok(())
            }
        }
    }

    /// Hand the payload to the recipient.  Always runs in the context of
    /// the receiving thread; for large payloads this maps the shared frames
    /// into the receiver's address space.
    pub fn deliver_payload(&self) -> KernelResult<Delivered> {
        let mut payload = self.payload.lock();
        match &mut *payload {
            Payload::Small(data) => Ok(Delivered::Word(*data)),

            Payload::Medium {
                size,
                data,
                receiver_block,
                ..
            } => {
                let current_thread = crate::thread::current();
                let block = current_thread
                    .address_space
                    .allocate_medium_payload_block()
                    .ok_or_else(|| {
                        log::warn!("unable to deliver message to thread {:#x}", current_thread.id);
                        Status::InsufficientMemory
                    })?;
                hal::hal().copy_to_user(block, data);
                *receiver_block = Some(block);
                Ok(Delivered::Block {
                    address: block,
                    size: *size,
                })
            }

            Payload::Large {
                sender_payload,
                size,
                receiver_payload,
                frames,
            } => {
                let current_thread = crate::thread::current();
                let page = if let Some(target) = *receiver_payload {
                    debug_assert_eq!(sender_payload.page_offset(), target.page_offset());
                    log::trace!(
                        "delivering large payload ({}b) to thread {:#x} at explicit target {:#x}",
                        size,
                        current_thread.id,
                        target.0
                    );
                    target.page_base()
                } else {
                    let page = current_thread
                        .address_space
                        .allocate_large_payload_block(frames.len())
                        .ok_or(Status::InsufficientMemory)?;
                    // The payload lands at the same offset as on the
                    // sender's side
                    *receiver_payload = Some(VirtAddr(page.0 + sender_payload.page_offset()));
                    log::trace!(
                        "delivering large payload ({}b) to thread {:#x} at auto target {:#x}",
                        size,
                        current_thread.id,
                        page.0
                    );
                    page
                };

                let flags = crate::memory::MemoryFlags::SHARED
                    | crate::memory::MemoryFlags::USER
                    | crate::memory::MemoryFlags::COPY_ON_WRITE;
                current_thread
                    .address_space
                    .commit_shared(page, frames, flags)
                    .inspect_err(|_| {
                        log::warn!("unable to deliver message to thread {:#x}", current_thread.id)
                    })?;

                Ok(Delivered::Block {
                    address: receiver_payload.expect("receiver payload just placed"),
                    size: *size,
                })
            }
        }
    }

    /// The payload as the recipient sees it after delivery.
    pub fn delivered_payload(&self) -> Option<Delivered> {
        let payload = self.payload.lock();
        match &*payload {
            Payload::Small(data) => Some(Delivered::Word(*data)),
            Payload::Medium {
                size,
                receiver_block,
                ..
            } => receiver_block.map(|address| Delivered::Block {
                address,
                size: *size,
            }),
            Payload::Large {
                size,
                receiver_payload,
                ..
            } => receiver_payload.map(|address| Delivered::Block {
                address,
                size: *size,
            }),
        }
    }
}
