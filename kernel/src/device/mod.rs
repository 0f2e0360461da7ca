// kernel/src/device/mod.rs
//
// The Device Proxy: lets user-mode driver threads claim the resources of
// their devices.  Physical memory is mapped into the driver's payload
// area, I/O ports are opened in its permission bitmap, and IRQ lines fan
// out as blocking HANDLE_INTERRUPT messages to every registered handler.

use alloc::sync::Arc;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::capability::Capabilities;
use crate::hal;
use crate::memory::{
    page_count, MemoryFlags, PhysAddr, VirtAddr, INVALID_FRAME, KERNEL_IMAGE_BASE, PAGE_SIZE,
    USER_BASE,
};
use crate::message::{next_kernel_message_id, Message, MessageType};
use crate::panic::{kernel_panic, PanicReason};
use crate::status::{KernelResult, Status};
use crate::syscall::{self, SyscallData};
use crate::thread::Thread;

pub const IRQ_LINE_COUNT: usize = 16;

/// Resource classes a driver can map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Interrupt,
    Memory,
    IoPort,
}

impl DeviceKind {
    fn from_raw(raw: usize) -> Option<DeviceKind> {
        match raw {
            0 => Some(DeviceKind::Interrupt),
            1 => Some(DeviceKind::Memory),
            2 => Some(DeviceKind::IoPort),
            _ => None,
        }
    }
}

pub struct DeviceProxy {
    interrupt_handlers: Mutex<[Vec<Arc<Thread>>; IRQ_LINE_COUNT]>,
}

lazy_static! {
    static ref DEVICE_PROXY: DeviceProxy = DeviceProxy {
        interrupt_handlers: Mutex::new(core::array::from_fn(|_| Vec::new())),
    };
}

pub fn device_proxy() -> &'static DeviceProxy {
    &DEVICE_PROXY
}

impl DeviceProxy {
    /// System-call dispatch for MapDevice / UnmapDevice.
    pub fn handle_system_call(&self, vector: usize, syscall: &mut SyscallData) {
        match vector {
            syscall::VECTOR_MAP_DEVICE => {
                let result = self.map_device(syscall);
                syscall.status = Status::code_of(&result);
            }
            syscall::VECTOR_UNMAP_DEVICE => {
                let result = self.unmap_device(syscall);
                syscall.status = Status::code_of(&result);
            }
            _ => kernel_panic(PanicReason::UnexpectedInterrupt, [vector, 0, 0, 0]),
        }
    }

    /// MapDevice: data0 = resource, data1 = kind, data2 = size,
    /// data3 = flags.  On success data0 holds the mapped resource.
    fn map_device(&self, syscall: &mut SyscallData) -> KernelResult<()> {
        let current_thread = crate::thread::current();
        log::trace!("system call: map device (kind {:#x})", syscall.data1);

        if !current_thread.has_capability(Capabilities::MAP_DEVICE) {
            return Err(Status::AccessDenied);
        }

        match DeviceKind::from_raw(syscall.data1) {
            Some(DeviceKind::Interrupt) => {
                self.register_interrupt_handler(&current_thread, syscall.data0)
            }
            Some(DeviceKind::Memory) => self.map_memory(&current_thread, syscall),
            Some(DeviceKind::IoPort) => {
                log::trace!(
                    "enabling thread {:#x} access to {} I/O ports at {:#x}",
                    current_thread.id,
                    syscall.data2,
                    syscall.data0
                );
                current_thread.enable_io_port(syscall.data0 as u16, syscall.data2 as u16)
            }
            None => {
                log::warn!("unable to map unknown device type {:#x}", syscall.data1);
                Err(Status::InvalidData)
            }
        }
    }

    /// UnmapDevice: the symmetric operation.
    fn unmap_device(&self, syscall: &mut SyscallData) -> KernelResult<()> {
        let current_thread = crate::thread::current();
        log::trace!("system call: unmap device (kind {:#x})", syscall.data1);

        if !current_thread.has_capability(Capabilities::UNMAP_DEVICE) {
            return Err(Status::AccessDenied);
        }

        match DeviceKind::from_raw(syscall.data1) {
            Some(DeviceKind::Interrupt) => {
                self.unregister_interrupt_handler(&current_thread, syscall.data0)
            }
            Some(DeviceKind::Memory) => self.unmap_memory(&current_thread, syscall),
            Some(DeviceKind::IoPort) => {
                log::trace!(
                    "removing thread {:#x} access to {} I/O ports at {:#x}",
                    current_thread.id,
                    syscall.data2,
                    syscall.data0
                );
                current_thread.disable_io_port(syscall.data0 as u16, syscall.data2 as u16)
            }
            None => {
                log::warn!("unable to unmap unknown device type {:#x}", syscall.data1);
                Err(Status::InvalidData)
            }
        }
    }

    /// Attach the calling thread to an IRQ line.  The handler must be
    /// ready for interrupt messages immediately; the line is unmasked as
    /// soon as the first handler registers.
    fn register_interrupt_handler(
        &self,
        current_thread: &Arc<Thread>,
        irq: usize,
    ) -> KernelResult<()> {
        if irq >= IRQ_LINE_COUNT {
            return Err(Status::InvalidData);
        }
        log::debug!("registering thread {:#x} on IRQ {:#x}", current_thread.id, irq);

        let mut handlers = self.interrupt_handlers.lock();
        handlers[irq].push(current_thread.clone());
        hal::hal().unmask_interrupt(irq);
        Ok(())
    }

    /// Detach the calling thread from an IRQ line; the last handler
    /// leaving remasks the line.
    fn unregister_interrupt_handler(
        &self,
        current_thread: &Arc<Thread>,
        irq: usize,
    ) -> KernelResult<()> {
        if irq >= IRQ_LINE_COUNT {
            return Err(Status::InvalidData);
        }
        log::debug!("deregistering thread {:#x} from IRQ {:#x}", current_thread.id, irq);

        let mut handlers = self.interrupt_handlers.lock();
        match handlers[irq]
            .iter()
            .position(|handler| handler.id == current_thread.id)
        {
            Some(index) => {
                handlers[irq].remove(index);
            }
            None => return Err(Status::InvalidData),
        }
        if handlers[irq].is_empty() {
            hal::hal().mask_interrupt(irq);
        }
        Ok(())
    }

    /// Map a block of device memory (registers, ROM, a framebuffer) into
    /// the caller's address space.  The kernel image itself can never be
    /// exposed this way.
    fn map_memory(&self, current_thread: &Arc<Thread>, syscall: &mut SyscallData) -> KernelResult<()> {
        let device_memory = PhysAddr(syscall.data0 as u32);
        let pages = page_count(syscall.data2);

        if device_memory == INVALID_FRAME || !device_memory.is_page_aligned() || pages == 0 {
            return Err(Status::InvalidData);
        }

        let last_byte = device_memory
            .0
            .checked_add(pages as u32 * PAGE_SIZE)
            .ok_or(Status::InvalidData)?;
        let overlaps_kernel = |address: u32| (KERNEL_IMAGE_BASE..USER_BASE).contains(&address);
        if overlaps_kernel(device_memory.0) || overlaps_kernel(last_byte) {
            return Err(Status::AccessDenied);
        }

        let address_space = &current_thread.address_space;
        let mapped_address = address_space
            .allocate_large_payload_block(pages)
            .ok_or(Status::InsufficientMemory)?;

        // Device registers are physically contiguous
        let frames: Vec<PhysAddr> = (0..pages)
            .map(|index| PhysAddr(device_memory.0 + index as u32 * PAGE_SIZE))
            .collect();

        let flags = MemoryFlags::WRITABLE | MemoryFlags::USER;
        if let Err(status) = address_space.commit(mapped_address, &frames, flags) {
            address_space.decommit(mapped_address, pages);
            let _ = address_space.free_large_payload_block(mapped_address);
            return Err(status);
        }

        log::debug!(
            "mapped device memory {:#x} into address space {:#x} at {:#x}",
            device_memory.0,
            address_space.id,
            mapped_address.0
        );
        syscall.data0 = mapped_address.0 as usize;
        Ok(())
    }

    /// Remove a device-memory view created by map_memory().  The backing
    /// frames belong to the device, not the frame allocator, so only the
    /// mappings and the payload block are released.
    fn unmap_memory(
        &self,
        current_thread: &Arc<Thread>,
        syscall: &mut SyscallData,
    ) -> KernelResult<()> {
        let mapped_address = VirtAddr(syscall.data0 as u32);
        let pages = page_count(syscall.data2);

        if mapped_address.0 == 0 || !mapped_address.is_page_aligned() || pages == 0 {
            return Err(Status::InvalidData);
        }

        let address_space = &current_thread.address_space;
        address_space.decommit(mapped_address, pages);
        address_space.free_large_payload_block(mapped_address)?;

        log::debug!(
            "removed mapped device memory {:#x} from address space {:#x}",
            mapped_address.0,
            address_space.id
        );
        Ok(())
    }

    /// IRQ arrival.  Runs in interrupt context on some arbitrary
    /// interrupted thread: send a HANDLE_INTERRUPT message to every
    /// handler registered on the line and wait for each acknowledgement in
    /// turn; one of the handlers owns the interrupting device.
    pub fn wake_interrupt_handlers(&self, irq: usize) {
        debug_assert!(irq < IRQ_LINE_COUNT);
        let handlers = self.interrupt_handlers.lock()[irq].clone();
        debug_assert!(!handlers.is_empty());

        let current_thread = crate::thread::current();
        for handler in handlers {
            let message = Message::small_blocking(
                current_thread.clone(),
                handler.clone(),
                MessageType::HANDLE_INTERRUPT,
                next_kernel_message_id(),
                irq,
            );

            match crate::io::io_manager().send_message(message) {
                Ok(acknowledgement) => drop(acknowledgement),
                Err(status) => {
                    // The device will likely keep interrupting; this may or
                    // may not be recoverable
                    log::error!(
                        "unable to deliver interrupt message to thread {:#x} ({})",
                        handler.id,
                        status
                    );
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn handler_count(&self, irq: usize) -> usize {
        self.interrupt_handlers.lock()[irq].len()
    }
}
