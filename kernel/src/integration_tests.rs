//! End-to-end scenarios across subsystem boundaries: boot handoff to
//! memory and VFS state, syscall-driven file I/O, scheduler fairness under
//! the timer tick, demand paging, COW isolation, and the keyboard path.

#![cfg(all(test, not(target_os = "none")))]

use alloc::vec::Vec;

use crate::{
    boot::{BootInfo, MemoryMapEntry},
    drivers::keyboard,
    fs::{OpenFlags, Permissions, SeekFrom},
    interrupts::InterruptContext,
    kernel::Kernel,
    mm::{page_fault::PageFaultCode, MemoryRegion, Protection, VirtualAddress, PAGE_SIZE},
    process::{Priority, ProcessState, SchedPolicy},
};

fn kernel_with_map(map: &'static [MemoryMapEntry]) -> Kernel {
    let boot = BootInfo {
        memory_map: map,
        kernel_base: 0x10_0000,
        kernel_size: 0,
        initrd: None,
        cmdline: "",
    };
    Kernel::new(&boot).expect("kernel boots from test map")
}

#[test]
fn s1_boot_reports_memory_and_the_full_tree() {
    static MAP: [MemoryMapEntry; 1] = [MemoryMapEntry {
        base: 0x10_0000,
        length: 0x100_0000,
        kind: 1,
    }];
    let kernel = kernel_with_map(&MAP);

    let info = kernel.memory_info();
    assert_eq!(info.total, 0x100_0000);
    assert_eq!(info.total / PAGE_SIZE as u64, 4096);
    assert_eq!(info.total, info.free + info.used);

    let root: Vec<_> = kernel
        .vfs
        .list("/")
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    for dir in ["bin", "sbin", "usr", "etc", "var", "tmp", "dev", "proc", "sys", "home"] {
        assert!(root.iter().any(|n| n == dir), "missing /{}", dir);
    }

    let dev: Vec<_> = kernel
        .vfs
        .list("/dev")
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(dev, ["console", "null", "tty", "zero"]);
}

#[test]
fn s2_create_write_seek_read() {
    let kernel = Kernel::new(&BootInfo::fallback()).unwrap();
    let fd = kernel
        .vfs
        .create("/tmp/a.txt", Permissions::from_mode(0o644))
        .unwrap();
    assert_eq!(kernel.vfs.write(fd, b"hi").unwrap(), 2);
    kernel.vfs.seek(fd, SeekFrom::Start(0)).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(kernel.vfs.read(fd, &mut buf).unwrap(), 2);
    assert_eq!(&buf[..2], b"hi");
    kernel.vfs.close(fd).unwrap();
}

#[test]
fn s3_dev_zero_reads_zeros() {
    let kernel = Kernel::new(&BootInfo::fallback()).unwrap();
    let fd = kernel.vfs.open("/dev/zero", OpenFlags::read_only()).unwrap();
    let mut buf = [0xAAu8; 5];
    assert_eq!(kernel.vfs.read(fd, &mut buf).unwrap(), 5);
    assert_eq!(buf, [0, 0, 0, 0, 0]);
    kernel.vfs.close(fd).unwrap();
}

#[test]
fn s4_two_cfs_processes_split_200_ticks_evenly() {
    let kernel = Kernel::new(&BootInfo::fallback()).unwrap();
    let a = kernel
        .spawn_with_policy(
            "a",
            VirtualAddress::new(0x40_0000),
            PAGE_SIZE,
            SchedPolicy::Cfs,
            Priority::Normal,
        )
        .unwrap();
    let b = kernel
        .spawn_with_policy(
            "b",
            VirtualAddress::new(0x40_0000),
            PAGE_SIZE,
            SchedPolicy::Cfs,
            Priority::Normal,
        )
        .unwrap();

    let mut ctx = InterruptContext::zeroed();
    for _ in 0..200 {
        kernel.on_timer_tick(&mut ctx);
    }

    let procs = kernel.procs.lock();
    let ta = procs.get(a).unwrap().stats.run_ticks;
    let tb = procs.get(b).unwrap().stats.run_ticks;
    assert!(
        ta.abs_diff(tb) <= 1,
        "uneven split after 200 ticks: {} vs {}",
        ta,
        tb
    );
}

#[test]
fn s5_demand_zero_fault_maps_and_retries() {
    let kernel = Kernel::new(&BootInfo::fallback()).unwrap();
    let pid = kernel
        .spawn("faulter", VirtualAddress::new(0x40_0000), PAGE_SIZE)
        .unwrap();
    {
        let mut procs = kernel.procs.lock();
        let mut sched = kernel.sched.lock();
        sched.schedule(&mut procs, 0);
    }
    assert_eq!(kernel.current_pid(0), pid);

    // Map region [0x50000000, 0x50001000) R/W with no frame behind it.
    kernel
        .vmm
        .with_space(pid, |space| {
            space.add_region(MemoryRegion::new(
                VirtualAddress::new(0x5000_0000),
                VirtualAddress::new(0x5000_1000),
                Protection::READ | Protection::WRITE,
                "anon",
            ))
        })
        .unwrap();
    assert!(kernel
        .vmm
        .translate(pid, VirtualAddress::new(0x5000_0000))
        .is_err());

    // Touching the page enters the fault path and resolves it.
    kernel
        .handle_page_fault(
            VirtualAddress::new(0x5000_0000),
            PageFaultCode::USER | PageFaultCode::WRITE,
            0x40_0000,
        )
        .unwrap();

    assert!(kernel
        .vmm
        .translate(pid, VirtualAddress::new(0x5000_0000))
        .is_ok());
    let procs = kernel.procs.lock();
    assert_eq!(procs.get(pid).unwrap().stats.major_faults, 1);
}

#[test]
fn s6_keyboard_press_release_yields_one_char() {
    let _guard = keyboard::TEST_LOCK.lock();
    keyboard::init();
    keyboard::handle_scancode(0x1E); // 'a' press
    keyboard::handle_scancode(0x9E); // 'a' release
    assert_eq!(keyboard::read_key(), Some(b'a'));
    // A subsequent read finds nothing pending (the blocking getchar
    // would halt here until the next IRQ).
    assert_eq!(keyboard::read_key(), None);
}

#[test]
fn frame_pool_is_conserved_across_process_lifetimes() {
    let kernel = Kernel::new(&BootInfo::fallback()).unwrap();
    // Every frame is on exactly one side of the ledger.
    assert_eq!(
        kernel.frames.free_frames() + kernel.frames.owned_frames(),
        kernel.frames.total_frames()
    );
    let free_before = kernel.frames.free_frames();

    let pid = kernel
        .spawn("worker", VirtualAddress::new(0x40_0000), 4 * PAGE_SIZE)
        .unwrap();
    assert!(kernel.frames.free_frames() < free_before);
    assert_eq!(
        kernel.frames.free_frames() + kernel.frames.owned_frames(),
        kernel.frames.total_frames()
    );

    kernel.kill(pid).unwrap();
    assert_eq!(kernel.frames.free_frames(), free_before);
}

#[test]
fn cow_write_preserves_the_shared_original() {
    let kernel = Kernel::new(&BootInfo::fallback()).unwrap();
    let a = kernel
        .spawn("parent", VirtualAddress::new(0x40_0000), PAGE_SIZE)
        .unwrap();
    let b = kernel
        .spawn("child", VirtualAddress::new(0x40_0000), PAGE_SIZE)
        .unwrap();

    // Share one frame read-only between both processes.
    let virt = VirtualAddress::new(0x6000_0000);
    let frame = kernel.frames.allocate().unwrap();
    for pid in [a, b] {
        kernel
            .vmm
            .with_space(pid, |space| {
                space.add_region(MemoryRegion::new(
                    virt,
                    VirtualAddress::new(virt.as_u64() + PAGE_SIZE as u64),
                    Protection::READ | Protection::WRITE,
                    "shared",
                ))
            })
            .unwrap();
        kernel
            .vmm
            .map(
                &kernel.frames,
                pid,
                virt,
                frame.as_addr(),
                (Protection::READ | Protection::WRITE).to_page_flags(),
            )
            .unwrap();
        kernel.vmm.copy_on_write_mark(pid, virt).unwrap();
    }
    assert_eq!(kernel.vmm.cow_refcount(frame), 2);

    // Process A writes: it gets a private copy, B still sees the original.
    {
        let mut procs = kernel.procs.lock();
        let mut sched = kernel.sched.lock();
        sched.schedule(&mut procs, 0);
    }
    kernel
        .handle_page_fault(virt, PageFaultCode::PRESENT | PageFaultCode::WRITE | PageFaultCode::USER, 0)
        .unwrap();

    let a_phys = kernel.vmm.translate(a, virt).unwrap();
    let b_phys = kernel.vmm.translate(b, virt).unwrap();
    assert_eq!(b_phys, frame.as_addr());
    assert_ne!(a_phys, b_phys);
    assert_eq!(kernel.vmm.cow_refcount(frame), 1);
}

#[test]
fn kernel_half_stays_identical_as_spaces_come_and_go() {
    let kernel = Kernel::new(&BootInfo::fallback()).unwrap();
    let a = kernel
        .spawn("a", VirtualAddress::new(0x40_0000), PAGE_SIZE)
        .unwrap();
    let b = kernel
        .spawn("b", VirtualAddress::new(0x40_0000), PAGE_SIZE)
        .unwrap();

    let ua = kernel.vmm.with_space(a, |s| Ok(s.upper_half_bits())).unwrap();
    let ub = kernel.vmm.with_space(b, |s| Ok(s.upper_half_bits())).unwrap();
    assert_eq!(ua[..], ub[..]);

    kernel.kill(a).unwrap();
    let c = kernel
        .spawn("c", VirtualAddress::new(0x40_0000), PAGE_SIZE)
        .unwrap();
    let uc = kernel.vmm.with_space(c, |s| Ok(s.upper_half_bits())).unwrap();
    assert_eq!(ub[..], uc[..]);
}

#[test]
fn faulting_process_dies_and_the_rest_continue() {
    let kernel = Kernel::new(&BootInfo::fallback()).unwrap();
    let victim = kernel
        .spawn("victim", VirtualAddress::new(0x40_0000), PAGE_SIZE)
        .unwrap();
    let survivor = kernel
        .spawn("survivor", VirtualAddress::new(0x40_0000), PAGE_SIZE)
        .unwrap();
    {
        let mut procs = kernel.procs.lock();
        let mut sched = kernel.sched.lock();
        sched.schedule(&mut procs, 0);
    }
    assert_eq!(kernel.current_pid(0), victim);

    // A wild access with no region behind it is unresolvable.
    let err = kernel
        .handle_page_fault(
            VirtualAddress::new(0x7000_0000),
            PageFaultCode::USER,
            0,
        )
        .unwrap_err();
    assert!(!err.is_fatal());
    kernel.kill_current_for_fault(err);

    {
        let procs = kernel.procs.lock();
        assert_eq!(procs.get(victim).unwrap().state, ProcessState::Terminated);
        assert_eq!(procs.get(survivor).unwrap().state, ProcessState::Running);
    }
    // The survivor took over the CPU; the victim's exit is recorded.
    assert_eq!(kernel.current_pid(0), survivor);
    assert_eq!(
        kernel.procs.lock().get(victim).unwrap().exit_code,
        Some(-1)
    );
}

#[test]
fn periodic_task_registration_survives_boot() {
    let before = crate::timer::pending_timer_count();
    crate::bootstrap::register_periodic_tasks().unwrap();
    assert_eq!(crate::timer::pending_timer_count(), before + 1);
}
