// kernel/src/tests.rs
//
// Hosted test support plus the end-to-end scenarios that exercise the
// four subsystems together.  The kernel globals are process-wide, so
// every test touching them serializes on one lock and runs against the
// mock HAL; blocking exchanges are driven to completion by impersonating
// the peer thread from the mock's yield hook.

use std::sync::{Mutex, MutexGuard, Once};

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::capability::Capabilities;
use crate::hal::mock::MockHal;
use crate::io::io_manager;
use crate::memory::address_space::{AddressSpace, ADDRESS_SPACE_ID_AUTO_ALLOCATE};
use crate::memory::manager::memory_manager;
use crate::memory::{VirtAddr, PAGE_SIZE, USER_BASE};
use crate::message::{Delivered, Message, MessageType};
use crate::status::Status;
use crate::thread::manager::thread_manager;
use crate::thread::{Thread, THREAD_ID_AUTO_ALLOCATE, THREAD_ID_BOOT, THREAD_ID_IDLE, THREAD_ID_NULL};

const TEST_TOTAL_MEMORY: u32 = crate::memory::KERNEL_PAGED_BOUNDARY + 64 * 1024 * 1024;

static MOCK_HAL: MockHal = MockHal::new();
static KERNEL_LOCK: Mutex<()> = Mutex::new(());
static KERNEL_INIT: Once = Once::new();

pub(crate) fn test_hal() -> &'static MockHal {
    &MOCK_HAL
}

/// Install the mock HAL without touching the managers; enough for the
/// page-table level tests.
pub(crate) fn setup_hal_only() {
    crate::hal::install(&MOCK_HAL);
}

pub(crate) struct KernelGuard {
    _guard: MutexGuard<'static, ()>,
}

/// Serialize on the kernel lock, initialize the kernel once, and restore
/// a clean slate: boot thread current with a fresh quantum, empty message
/// pool, reset mock HAL.
pub(crate) fn setup() -> KernelGuard {
    let guard = KERNEL_LOCK.lock().unwrap_or_else(|poison| poison.into_inner());
    KERNEL_INIT.call_once(|| {
        crate::init(&MOCK_HAL, TEST_TOTAL_MEMORY);
    });

    MOCK_HAL.reset();
    io_manager().reset_for_tests();

    let boot_thread = thread_manager().find_thread(THREAD_ID_BOOT).unwrap();
    boot_thread.abandon_block();
    boot_thread
        .tick_count
        .store(i32::MAX, core::sync::atomic::Ordering::Relaxed);
    while boot_thread.take_message().is_some() {}
    let _ = crate::thread::set_current(boot_thread);

    KernelGuard { _guard: guard }
}

impl KernelGuard {
    pub fn spawn_thread(&self) -> Arc<Thread> {
        self.spawn_thread_with_caps(Capabilities::ALL)
    }

    pub fn spawn_thread_with_caps(&self, capability_mask: Capabilities) -> Arc<Thread> {
        thread_manager()
            .create_thread(
                None,
                None,
                THREAD_ID_AUTO_ALLOCATE,
                capability_mask,
                None,
                None,
            )
            .unwrap()
    }

    pub fn spawn_thread_in(&self, address_space: Arc<AddressSpace>) -> Arc<Thread> {
        thread_manager()
            .create_thread(
                None,
                Some(address_space),
                THREAD_ID_AUTO_ALLOCATE,
                Capabilities::ALL,
                None,
                None,
            )
            .unwrap()
    }

    pub fn new_address_space(&self) -> Arc<AddressSpace> {
        memory_manager()
            .create_address_space(ADDRESS_SPACE_ID_AUTO_ALLOCATE)
            .unwrap()
    }

    /// Make `thread` the current thread until the returned guard drops.
    pub fn run_as(&self, thread: Arc<Thread>) -> CurrentThreadGuard {
        let previous = crate::thread::set_current(thread);
        CurrentThreadGuard { previous }
    }
}

impl Drop for KernelGuard {
    fn drop(&mut self) {
        MOCK_HAL.clear_yield_hook();
        if let Some(boot_thread) = thread_manager().find_thread(THREAD_ID_BOOT) {
            let _ = crate::thread::set_current(boot_thread);
        }
    }
}

pub(crate) struct CurrentThreadGuard {
    previous: Option<Arc<Thread>>,
}

impl Drop for CurrentThreadGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            let _ = crate::thread::set_current(previous);
        }
    }
}

//
// -- End-to-end scenarios --
//

#[test]
fn scenario_basic_send_receive() {
    let kernel = setup();
    let thread_a = kernel.spawn_thread();
    let thread_b = kernel.spawn_thread();

    {
        let _as_a = kernel.run_as(thread_a.clone());
        let message = Message::small(
            thread_a.clone(),
            thread_b.clone(),
            MessageType::NULL,
            7,
            0xdead,
        );
        io_manager().put_message(message).unwrap();
    }

    let _as_b = kernel.run_as(thread_b.clone());
    let received = io_manager().receive_message(false).unwrap();
    assert_eq!(received.source.id, thread_a.id);
    assert_eq!(received.message_type, MessageType::NULL);
    assert_eq!(received.id, 7);
    assert_eq!(received.delivered_payload(), Some(Delivered::Word(0xdead)));

    // The pool tracked the message for exactly as long as it was pending
    assert_eq!(io_manager().pending_message_total(), 0);
}

#[test]
fn scenario_copy_on_write() {
    let kernel = setup();
    let space_a = kernel.new_address_space();
    let space_b = kernel.new_address_space();
    let thread_a = kernel.spawn_thread_in(space_a.clone());
    let thread_b = kernel.spawn_thread_in(space_b.clone());

    let page = VirtAddr(0x8000_0000);
    let pattern_a = [0xAAu8; 16];

    // A owns a private writable page carrying the pattern
    {
        let _as_a = kernel.run_as(thread_a.clone());
        space_a.expand(page, PAGE_SIZE as usize, 0).unwrap();
    }
    let frame_a = space_a.with_entry(page, |entry| entry.unwrap().frame());
    test_hal().write_frame(frame_a, 0, &pattern_a);

    // A sends the page to B as a large payload
    {
        let _as_a = kernel.run_as(thread_a.clone());
        let message = Message::large(
            thread_a.clone(),
            thread_b.clone(),
            MessageType(9),
            42,
            page,
            PAGE_SIZE as usize,
            None,
            false,
        );
        message.collect_payload().unwrap();
        io_manager().put_message(message).unwrap();
    }

    // Delivery maps the same frame into B, shared and copy-on-write
    let delivered = {
        let _as_b = kernel.run_as(thread_b.clone());
        let received = io_manager().receive_message(false).unwrap();
        match received.delivered_payload() {
            Some(Delivered::Block { address, size }) => {
                assert_eq!(size, PAGE_SIZE as usize);
                assert_eq!(address.page_offset(), 0);
                address
            }
            other => panic!("unexpected payload {:?}", other),
        }
    };

    space_b.with_entry(delivered, |entry| {
        let entry = entry.unwrap();
        assert_eq!(entry.frame(), frame_a);
        assert!(entry.is_shared());
        assert!(entry.is_copy_on_write());
        assert!(!entry.is_writable());
    });
    space_a.with_entry(page, |entry| {
        let entry = entry.unwrap();
        assert!(entry.is_copy_on_write());
        assert!(!entry.is_writable());
    });
    assert_eq!(test_hal().read_frame(frame_a, 0, 16), pattern_a);

    // A writes: the fault is repaired with a private copy
    {
        let _as_a = kernel.run_as(thread_a.clone());
        assert!(space_a.copy_on_write(VirtAddr(page.0 + 4)));
    }
    let new_frame_a = space_a.with_entry(page, |entry| {
        let entry = entry.unwrap();
        assert!(entry.is_writable());
        assert!(!entry.is_shared());
        assert!(!entry.is_copy_on_write());
        entry.frame()
    });
    assert_ne!(new_frame_a, frame_a);
    // The copy carried the original contents; now A diverges
    assert_eq!(test_hal().read_frame(new_frame_a, 0, 16), pattern_a);
    test_hal().write_frame(new_frame_a, 0, &[0xBBu8; 16]);

    // B is unaffected: same frame, same bytes, still shared + COW
    space_b.with_entry(delivered, |entry| {
        let entry = entry.unwrap();
        assert_eq!(entry.frame(), frame_a);
        assert!(entry.is_shared());
        assert!(entry.is_copy_on_write());
    });
    assert_eq!(test_hal().read_frame(frame_a, 0, 16), pattern_a);
    assert_eq!(test_hal().read_frame(new_frame_a, 0, 16), [0xBBu8; 16]);
}

#[test]
fn scenario_deadlock_detection() {
    let kernel = setup();
    let thread_a = kernel.spawn_thread();
    let thread_b = kernel.spawn_thread();

    {
        let _as_a = kernel.run_as(thread_a.clone());
        let request = Message::small_blocking(
            thread_a.clone(),
            thread_b.clone(),
            MessageType::NULL,
            100,
            0,
        );
        io_manager().put_message(request).unwrap();
    }
    assert!(!thread_a.is_ready());

    // The reverse blocking send would close the cycle
    {
        let _as_b = kernel.run_as(thread_b.clone());
        let request = Message::small_blocking(
            thread_b.clone(),
            thread_a.clone(),
            MessageType::NULL,
            101,
            0,
        );
        assert_eq!(
            io_manager().put_message(request).unwrap_err(),
            Status::MessageDeadlock
        );
    }
    assert!(thread_b.is_ready());

    // B answers the original request and both threads are runnable again
    {
        let _as_b = kernel.run_as(thread_b.clone());
        let request = io_manager().receive_message(false).unwrap();
        assert_eq!(request.id, 100);
        let response = Message::small(
            thread_b.clone(),
            thread_a.clone(),
            MessageType::NULL,
            100,
            0,
        );
        io_manager().put_message(response).unwrap();
    }
    assert!(thread_a.is_ready());
    assert!(thread_b.is_ready());

    let _as_a = kernel.run_as(thread_a.clone());
    io_manager().receive_message(false).unwrap();
}

#[test]
fn scenario_transitive_deadlock_detection() {
    let kernel = setup();
    let thread_a = kernel.spawn_thread();
    let thread_b = kernel.spawn_thread();
    let thread_c = kernel.spawn_thread();

    {
        let _as_a = kernel.run_as(thread_a.clone());
        let request = Message::small_blocking(
            thread_a.clone(),
            thread_b.clone(),
            MessageType::NULL,
            200,
            0,
        );
        io_manager().put_message(request).unwrap();
    }
    {
        let _as_b = kernel.run_as(thread_b.clone());
        let request = Message::small_blocking(
            thread_b.clone(),
            thread_c.clone(),
            MessageType::NULL,
            201,
            0,
        );
        io_manager().put_message(request).unwrap();
    }

    // c -> a would deadlock through the a -> b -> c chain
    let _as_c = kernel.run_as(thread_c.clone());
    let request = Message::small_blocking(
        thread_c.clone(),
        thread_a.clone(),
        MessageType::NULL,
        202,
        0,
    );
    assert_eq!(
        io_manager().put_message(request).unwrap_err(),
        Status::MessageDeadlock
    );
    assert!(thread_c.is_ready());
}

#[test]
fn scenario_irq_fan_out() {
    let kernel = setup();
    let thread_x = kernel.spawn_thread();
    let thread_y = kernel.spawn_thread();

    // Both drivers attach to IRQ 5 through MapDevice
    for thread in [&thread_x, &thread_y] {
        let _as_driver = kernel.run_as(thread.clone());
        let mut syscall = crate::syscall::SyscallData::new();
        syscall.data0 = 5;
        syscall.data1 = 0; // interrupt
        crate::device::device_proxy()
            .handle_system_call(crate::syscall::VECTOR_MAP_DEVICE, &mut syscall);
        assert_eq!(syscall.status, crate::status::STATUS_CODE_SUCCESS);
    }
    assert!(!test_hal().irq_masked(5));
    assert_eq!(crate::device::device_proxy().handler_count(5), 2);

    // The proxy blocks on each handler in turn; the hook impersonates
    // whichever handler the interrupted thread is waiting on
    let serviced: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let serviced_by_hook = serviced.clone();
    test_hal().set_yield_hook(Box::new(move || {
        let proxy_thread = crate::thread::current();
        let handler = match proxy_thread.find_blocking_thread() {
            Some(handler) => handler,
            None => return,
        };

        let previous = crate::thread::set_current(handler.clone()).unwrap();
        let request = io_manager().receive_message(false).unwrap();
        assert_eq!(request.message_type, MessageType::HANDLE_INTERRUPT);
        assert_eq!(request.delivered_payload(), Some(Delivered::Word(5)));
        serviced_by_hook.lock().unwrap().push(handler.id);

        let acknowledgement = Message::small(
            handler,
            request.source.clone(),
            MessageType(0x100),
            request.id,
            0,
        );
        io_manager().put_message(acknowledgement).unwrap();
        let _ = crate::thread::set_current(previous);
    }));

    crate::device::device_proxy().wake_interrupt_handlers(5);
    test_hal().clear_yield_hook();

    // Each handler saw the interrupt exactly once
    let serviced = serviced.lock().unwrap();
    assert_eq!(serviced.len(), 2);
    assert!(serviced.contains(&thread_x.id));
    assert!(serviced.contains(&thread_y.id));
    drop(serviced);

    // Last handler leaving the line masks it again
    for thread in [&thread_x, &thread_y] {
        let _as_driver = kernel.run_as(thread.clone());
        let mut syscall = crate::syscall::SyscallData::new();
        syscall.data0 = 5;
        syscall.data1 = 0;
        crate::device::device_proxy()
            .handle_system_call(crate::syscall::VECTOR_UNMAP_DEVICE, &mut syscall);
        assert_eq!(syscall.status, crate::status::STATUS_CODE_SUCCESS);
    }
    assert!(test_hal().irq_masked(5));
}

#[test]
fn scenario_mailbox_overflow() {
    let kernel = setup();
    let sender = kernel.spawn_thread();
    let receiver = kernel.spawn_thread();

    {
        let _as_sender = kernel.run_as(sender.clone());
        for id in 0..crate::thread::mailbox::MAILBOX_LIMIT {
            let message = Message::small(
                sender.clone(),
                receiver.clone(),
                MessageType::NULL,
                id,
                id,
            );
            io_manager().put_message(message).unwrap();
        }

        let overflow = Message::small(
            sender.clone(),
            receiver.clone(),
            MessageType::NULL,
            usize::MAX,
            0,
        );
        assert_eq!(
            io_manager().put_message(overflow).unwrap_err(),
            Status::MailboxOverflow
        );
    }
    assert!(receiver.is_ready());

    // The receiver drains its backlog and traffic flows again
    {
        let _as_receiver = kernel.run_as(receiver.clone());
        for expected in 0..crate::thread::mailbox::MAILBOX_LIMIT {
            let message = io_manager().receive_message(false).unwrap();
            assert_eq!(message.id, expected);
        }
        assert_eq!(
            io_manager().receive_message(false).unwrap_err(),
            Status::MailboxEmpty
        );
    }

    let _as_sender = kernel.run_as(sender.clone());
    let message = Message::small(sender.clone(), receiver.clone(), MessageType::NULL, 1, 1);
    io_manager().put_message(message).unwrap();
    let _as_receiver = kernel.run_as(receiver.clone());
    io_manager().receive_message(false).unwrap();
}

#[test]
fn medium_payloads_round_trip_and_release() {
    let kernel = setup();
    let sender = kernel.spawn_thread();
    let receiver = kernel.spawn_thread();

    let source = VirtAddr(USER_BASE + 0x123);
    test_hal().write_user(source, b"payload bytes");

    {
        let _as_sender = kernel.run_as(sender.clone());
        let message = Message::medium(
            sender.clone(),
            receiver.clone(),
            MessageType(11),
            5,
            source,
            13,
            false,
        );
        message.collect_payload().unwrap();
        io_manager().put_message(message).unwrap();
    }

    let _as_receiver = kernel.run_as(receiver.clone());
    let received = io_manager().receive_message(false).unwrap();
    let (address, size) = match received.delivered_payload() {
        Some(Delivered::Block { address, size }) => (address, size),
        other => panic!("unexpected payload {:?}", other),
    };
    assert_eq!(size, 13);
    assert_eq!(test_hal().read_user(address, 13), b"payload bytes");

    // DeleteMessage returns the slab buffer
    let mut syscall = crate::syscall::SyscallData::new();
    syscall.data0 = address.0 as usize;
    syscall.data1 = size;
    io_manager().handle_system_call(crate::syscall::VECTOR_DELETE_MESSAGE, &mut syscall);
    assert_eq!(syscall.status, crate::status::STATUS_CODE_SUCCESS);
}

#[test]
fn explicit_target_addresses_are_guarded() {
    let kernel = setup();
    let space_a = kernel.new_address_space();
    let space_b = kernel.new_address_space();
    let thread_a = kernel.spawn_thread_in(space_a.clone());
    let thread_b = kernel.spawn_thread_in(space_b.clone());
    let unprivileged = kernel.spawn_thread_with_caps(Capabilities::empty());

    let source_page = VirtAddr(0x9000_0000);
    {
        let _as_a = kernel.run_as(thread_a.clone());
        space_a.expand(source_page, PAGE_SIZE as usize, 0).unwrap();
    }
    let source = VirtAddr(source_page.0 + 0x10);

    // No EXPLICIT_TARGET_ADDRESS capability
    {
        let _as_u = kernel.run_as(unprivileged.clone());
        let message = Message::large(
            unprivileged.clone(),
            thread_b.clone(),
            MessageType(12),
            60,
            source,
            16,
            Some(VirtAddr(USER_BASE + 0x10)),
            false,
        );
        assert_eq!(message.collect_payload().unwrap_err(), Status::AccessDenied);
    }

    // Mismatched page offsets
    {
        let _as_a = kernel.run_as(thread_a.clone());
        let message = Message::large(
            thread_a.clone(),
            thread_b.clone(),
            MessageType(12),
            61,
            source,
            16,
            Some(VirtAddr(USER_BASE + 0x20)),
            false,
        );
        assert_eq!(message.collect_payload().unwrap_err(), Status::IoError);
    }

    // Kernel-space target
    {
        let _as_a = kernel.run_as(thread_a.clone());
        let message = Message::large(
            thread_a.clone(),
            thread_b.clone(),
            MessageType(12),
            62,
            source,
            16,
            Some(VirtAddr(0x2000_0010)),
            false,
        );
        assert_eq!(message.collect_payload().unwrap_err(), Status::AccessDenied);
    }

    // Aligned, privileged, user-space target: delivered exactly there
    let target = VirtAddr(USER_BASE + 0x70_0010);
    {
        let _as_a = kernel.run_as(thread_a.clone());
        let message = Message::large(
            thread_a.clone(),
            thread_b.clone(),
            MessageType(12),
            63,
            source,
            16,
            Some(target),
            false,
        );
        message.collect_payload().unwrap();
        io_manager().put_message(message).unwrap();
    }
    let _as_b = kernel.run_as(thread_b.clone());
    let received = io_manager().receive_message(false).unwrap();
    assert_eq!(
        received.delivered_payload(),
        Some(Delivered::Block { address: target, size: 16 })
    );
    space_b.with_entry(target, |entry| {
        let entry = entry.unwrap();
        assert!(entry.is_shared());
        assert!(entry.is_copy_on_write());
    });
}

#[test]
fn thread_deletion_wakes_the_requestor() {
    let kernel = setup();
    let requestor = kernel.spawn_thread();
    let victim_id = {
        // Only the thread table keeps the victim alive
        let victim = kernel.spawn_thread();
        victim.id
    };

    test_hal().set_yield_hook(Box::new(move || {
        let cleanup_thread = thread_manager().cleanup_thread().unwrap();
        let previous = crate::thread::set_current(cleanup_thread).unwrap();
        crate::thread::system_threads::service_deletion_request().unwrap();
        let _ = crate::thread::set_current(previous);
    }));

    {
        let _as_requestor = kernel.run_as(requestor.clone());
        crate::thread::system_threads::send_deletion_message(victim_id).unwrap();
    }
    test_hal().clear_yield_hook();

    assert!(thread_manager().find_thread(victim_id).is_none());
    assert!(requestor.is_ready());
}

#[test]
fn deleting_an_unknown_thread_fails_cleanly() {
    let kernel = setup();
    let requestor = kernel.spawn_thread();

    test_hal().set_yield_hook(Box::new(move || {
        let cleanup_thread = thread_manager().cleanup_thread().unwrap();
        let previous = crate::thread::set_current(cleanup_thread).unwrap();
        crate::thread::system_threads::service_deletion_request().unwrap();
        let _ = crate::thread::set_current(previous);
    }));

    let _as_requestor = kernel.run_as(requestor.clone());
    assert_eq!(
        crate::thread::system_threads::send_deletion_message(0xBAD_1D).unwrap_err(),
        Status::InvalidData
    );
}

#[test]
fn deletion_releases_blocked_senders() {
    let kernel = setup();
    let victim = kernel.spawn_thread();
    let sender = kernel.spawn_thread();

    {
        let _as_sender = kernel.run_as(sender.clone());
        let request = Message::small_blocking(
            sender.clone(),
            victim.clone(),
            MessageType(21),
            500,
            0,
        );
        io_manager().put_message(request).unwrap();
    }
    assert!(!sender.is_ready());

    thread_manager().delete_thread(&victim, None);
    assert!(sender.is_ready());
    assert!(!victim.mailbox_enabled());

    // The sender finds a null response in the victim's name
    let _as_sender = kernel.run_as(sender.clone());
    let response = io_manager().receive_message(false).unwrap();
    assert_eq!(response.source.id, victim.id);
    assert_eq!(response.id, 500);
    assert_eq!(response.message_type, MessageType::NULL);
}

#[test]
fn send_and_receive_round_trip_via_syscalls() {
    let kernel = setup();
    let thread_a = kernel.spawn_thread();
    let thread_b = kernel.spawn_thread();

    {
        let _as_a = kernel.run_as(thread_a.clone());
        let mut syscall = crate::syscall::SyscallData::new();
        syscall.data0 = thread_b.id;
        syscall.data1 = 5; // type
        syscall.data2 = 9; // id
        syscall.data3 = 0xbeef; // single word
        crate::dispatch::handle_system_call(
            crate::syscall::VECTOR_SEND_MESSAGE,
            VirtAddr(USER_BASE),
            &mut syscall,
        );
        assert_eq!(syscall.status, crate::status::STATUS_CODE_SUCCESS);
    }

    let _as_b = kernel.run_as(thread_b.clone());
    let mut syscall = crate::syscall::SyscallData::new();
    syscall.data0 = 0; // no wait
    crate::dispatch::handle_system_call(
        crate::syscall::VECTOR_RECEIVE_MESSAGE,
        VirtAddr(USER_BASE),
        &mut syscall,
    );
    assert_eq!(syscall.status, crate::status::STATUS_CODE_SUCCESS);
    assert_eq!(syscall.data0, thread_a.id);
    assert_eq!(syscall.data1, 5);
    assert_eq!(syscall.data2, 9);
    assert_eq!(syscall.data3, 0xbeef);
    assert_eq!(syscall.data4, 0);
}

#[test]
fn syscall_blocks_from_kernel_addresses_are_rejected() {
    let kernel = setup();
    let thread = kernel.spawn_thread();
    let _as_thread = kernel.run_as(thread);

    let mut syscall = crate::syscall::SyscallData::new();
    crate::dispatch::handle_system_call(
        crate::syscall::VECTOR_RECEIVE_MESSAGE,
        VirtAddr(0x1000),
        &mut syscall,
    );
    assert_eq!(syscall.status, Status::InvalidData.code());
}

#[test]
fn blocking_sends_prefer_direct_handoff() {
    let kernel = setup();
    let worker = kernel.spawn_thread();
    let boot_thread = crate::thread::current();

    let request = Message::small_blocking(
        boot_thread.clone(),
        worker.clone(),
        MessageType(30),
        900,
        1,
    );
    io_manager().put_message(request).unwrap();
    assert!(!boot_thread.is_ready());

    let handoffs_before = io_manager()
        .stats
        .direct_handoff_count
        .load(core::sync::atomic::Ordering::Relaxed);
    io_manager().reschedule();
    assert_eq!(crate::thread::current().id, worker.id);
    assert_eq!(
        io_manager()
            .stats
            .direct_handoff_count
            .load(core::sync::atomic::Ordering::Relaxed),
        handoffs_before + 1
    );
    assert!(test_hal()
        .switches
        .lock()
        .iter()
        .any(|&(from, to)| from == boot_thread.id && to == worker.id));

    // The worker answers and the boot thread drains its mailbox: wakeup
    // first, injected null message second
    let request = io_manager().receive_message(false).unwrap();
    assert_eq!(request.id, 900);
    let response = Message::small(worker.clone(), boot_thread.clone(), MessageType(30), 900, 2);
    io_manager().put_message(response).unwrap();
    assert!(boot_thread.is_ready());

    let _as_boot = kernel.run_as(boot_thread.clone());
    let first = io_manager().receive_message(false).unwrap();
    assert_eq!(first.id, 900);
    let second = io_manager().receive_message(false).unwrap();
    assert_eq!(second.source.id, THREAD_ID_NULL);
    assert_eq!(
        io_manager().receive_message(false).unwrap_err(),
        Status::MailboxEmpty
    );
}

#[test]
fn empty_lottery_runs_the_idle_thread() {
    let kernel = setup();
    let worker = kernel.spawn_thread();
    worker.disable_mailbox();

    let _as_worker = kernel.run_as(worker.clone());
    io_manager().reschedule();
    assert_eq!(crate::thread::current().id, THREAD_ID_IDLE);
}

#[test]
fn quantum_expiry_triggers_the_lottery() {
    let kernel = setup();
    let worker = kernel.spawn_thread();
    let _as_worker = kernel.run_as(worker.clone());
    worker
        .tick_count
        .store(3, core::sync::atomic::Ordering::Relaxed);

    io_manager().handle_clock_tick();
    io_manager().handle_clock_tick();
    assert_eq!(crate::thread::current().id, worker.id);

    // Third tick exhausts the quantum; the injected null message keeps
    // the worker eligible and it wins its own lottery
    io_manager().handle_clock_tick();
    assert_eq!(crate::thread::current().id, worker.id);
    assert_eq!(
        worker.tick_count.load(core::sync::atomic::Ordering::Relaxed),
        crate::io::SCHEDULING_QUANTUM_DEFAULT
    );

    let null_message = io_manager().receive_message(false).unwrap();
    assert_eq!(null_message.source.id, THREAD_ID_NULL);
}

#[test]
fn share_kernel_data_as_payload() {
    let kernel = setup();
    let space = kernel.new_address_space();

    // Page-sized blocks of the identity-mapped ramdisk become sendable
    let ramdisk_chunk = VirtAddr(0x0040_0000);
    space
        .share_kernel_frames(ramdisk_chunk, 2 * PAGE_SIZE as usize)
        .unwrap();
    assert_eq!(space.shared_frame_refcount(ramdisk_chunk), Some(1));

    let frames = space
        .share_pages(ramdisk_chunk, 2 * PAGE_SIZE as usize)
        .unwrap();
    assert_eq!(frames.len(), 2);
    assert!(frames[0].is_kernel_resident());
    assert_eq!(frames[0].address.0, ramdisk_chunk.0);
    drop(frames);

    space.unshare_pages(ramdisk_chunk, 2 * PAGE_SIZE as usize);
    assert_eq!(space.shared_frame_refcount(ramdisk_chunk), None);
}

#[test]
fn device_memory_mapping_round_trip() {
    let kernel = setup();
    let driver = kernel.spawn_thread();
    let _as_driver = kernel.run_as(driver.clone());

    // Map two pages of a device aperture living above the kernel window
    let aperture = 0x4800_0000usize;
    let mut syscall = crate::syscall::SyscallData::new();
    syscall.data0 = aperture;
    syscall.data1 = 1; // memory
    syscall.data2 = 2 * PAGE_SIZE as usize;
    crate::device::device_proxy().handle_system_call(crate::syscall::VECTOR_MAP_DEVICE, &mut syscall);
    assert_eq!(syscall.status, crate::status::STATUS_CODE_SUCCESS);

    let mapped = VirtAddr(syscall.data0 as u32);
    driver.address_space.with_entry(mapped, |entry| {
        let entry = entry.unwrap();
        assert!(entry.is_present());
        assert!(entry.is_writable());
        assert_eq!(entry.frame().0, aperture as u32);
    });

    let mut syscall = crate::syscall::SyscallData::new();
    syscall.data0 = mapped.0 as usize;
    syscall.data1 = 1;
    syscall.data2 = 2 * PAGE_SIZE as usize;
    crate::device::device_proxy()
        .handle_system_call(crate::syscall::VECTOR_UNMAP_DEVICE, &mut syscall);
    assert_eq!(syscall.status, crate::status::STATUS_CODE_SUCCESS);
    driver
        .address_space
        .with_entry(mapped, |entry| assert!(entry.is_none() || !entry.unwrap().is_present()));
}

#[test]
fn kernel_image_cannot_be_mapped_as_device_memory() {
    let kernel = setup();
    let driver = kernel.spawn_thread();
    let _as_driver = kernel.run_as(driver.clone());

    let mut syscall = crate::syscall::SyscallData::new();
    syscall.data0 = 0x0020_0000; // kernel image
    syscall.data1 = 1;
    syscall.data2 = PAGE_SIZE as usize;
    crate::device::device_proxy().handle_system_call(crate::syscall::VECTOR_MAP_DEVICE, &mut syscall);
    assert_eq!(syscall.status, Status::AccessDenied.code());
}

#[test]
fn device_operations_require_capabilities() {
    let kernel = setup();
    let thread = kernel.spawn_thread_with_caps(Capabilities::empty());
    let _as_thread = kernel.run_as(thread);

    let mut syscall = crate::syscall::SyscallData::new();
    syscall.data0 = 5;
    syscall.data1 = 0;
    crate::device::device_proxy().handle_system_call(crate::syscall::VECTOR_MAP_DEVICE, &mut syscall);
    assert_eq!(syscall.status, Status::AccessDenied.code());
}

#[test]
fn io_port_mapping_flows_through_the_proxy() {
    let kernel = setup();
    let driver = kernel.spawn_thread();
    let _as_driver = kernel.run_as(driver.clone());

    let mut syscall = crate::syscall::SyscallData::new();
    syscall.data0 = 0x3F8;
    syscall.data1 = 2; // I/O port
    syscall.data2 = 8;
    crate::device::device_proxy().handle_system_call(crate::syscall::VECTOR_MAP_DEVICE, &mut syscall);
    assert_eq!(syscall.status, crate::status::STATUS_CODE_SUCCESS);
    assert!(driver.address_space.io_port_enabled(0x3F8));
    assert!(driver.address_space.io_port_enabled(0x3FF));

    let mut syscall = crate::syscall::SyscallData::new();
    syscall.data0 = 0x3F8;
    syscall.data1 = 2;
    syscall.data2 = 8;
    crate::device::device_proxy()
        .handle_system_call(crate::syscall::VECTOR_UNMAP_DEVICE, &mut syscall);
    assert_eq!(syscall.status, crate::status::STATUS_CODE_SUCCESS);
    assert!(!driver.address_space.io_port_enabled(0x3F8));
}

#[test]
fn send_and_receive_blocks_until_the_response() {
    let kernel = setup();
    let client = kernel.spawn_thread();
    let server = kernel.spawn_thread();

    let server_for_hook = server.clone();
    test_hal().set_yield_hook(Box::new(move || {
        let previous = crate::thread::set_current(server_for_hook.clone()).unwrap();
        let request = io_manager().receive_message(false).unwrap();
        let response = Message::small(
            server_for_hook.clone(),
            request.source.clone(),
            MessageType(40),
            request.id,
            request.id + 1,
        );
        io_manager().put_message(response).unwrap();
        let _ = crate::thread::set_current(previous);
    }));

    let _as_client = kernel.run_as(client.clone());
    let mut syscall = crate::syscall::SyscallData::new();
    syscall.data0 = server.id;
    syscall.data1 = 40;
    syscall.data2 = 70;
    syscall.data3 = 0;
    crate::dispatch::handle_system_call(
        crate::syscall::VECTOR_SEND_AND_RECEIVE_MESSAGE,
        VirtAddr(USER_BASE),
        &mut syscall,
    );
    test_hal().clear_yield_hook();

    assert_eq!(syscall.status, crate::status::STATUS_CODE_SUCCESS);
    assert_eq!(syscall.data0, server.id);
    assert_eq!(syscall.data2, 70);
    assert_eq!(syscall.data3, 71);
}

#[test]
fn shared_frame_refcounts_track_their_holders() {
    let kernel = setup();
    let space = kernel.new_address_space();
    let thread = kernel.spawn_thread_in(space.clone());
    let _as_thread = kernel.run_as(thread);

    let page = VirtAddr(0xA000_0000);
    space.expand(page, PAGE_SIZE as usize, 0).unwrap();
    assert_eq!(space.shared_frame_refcount(page), None);

    let frames = space.share_pages(page, PAGE_SIZE as usize).unwrap();
    assert_eq!(space.shared_frame_refcount(page), Some(2));

    drop(frames);
    assert_eq!(space.shared_frame_refcount(page), Some(1));

    space.unshare_pages(page, PAGE_SIZE as usize);
    assert_eq!(space.shared_frame_refcount(page), None);
}
