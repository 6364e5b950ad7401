//! System call dispatch.
//!
//! The syscall gate (vector 0x80) lands here with the caller's saved
//! registers: the number in rax, up to six arguments in rdi, rsi, rdx,
//! r10, r8, r9, and the result written back to rax. Every error kind
//! except Fatal becomes -1 with an errno-style code recorded in the
//! calling process; unknown numbers return -1.
//!
//! Open-flag bits on the ABI: low two bits select the access mode
//! (0 = read, 1 = write, 2 = read/write); 0x100 = create, 0x200 =
//! truncate, 0x400 = append.

use crate::{
    error::{KernelError, KernelResult},
    fs::OpenFlags,
    interrupts::InterruptContext,
    kernel::Kernel,
    mm::{
        vmm::{MMAP_BASE, USER_HEAP_BASE},
        FileBacking, MemoryRegion, Protection, VirtualAddress, PAGE_SIZE,
    },
    process::Pid,
};

/// System call numbers.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Read = 0,
    Write = 1,
    Open = 2,
    Close = 3,
    Exit = 4,
    Brk = 5,
    Mmap = 6,
    Munmap = 7,
}

impl TryFrom<u64> for Syscall {
    type Error = ();

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Syscall::Read),
            1 => Ok(Syscall::Write),
            2 => Ok(Syscall::Open),
            3 => Ok(Syscall::Close),
            4 => Ok(Syscall::Exit),
            5 => Ok(Syscall::Brk),
            6 => Ok(Syscall::Mmap),
            7 => Ok(Syscall::Munmap),
            _ => Err(()),
        }
    }
}

/// ABI open-flag bits.
const O_ACCMODE: u64 = 0x3;
const O_WRONLY: u64 = 0x1;
const O_RDWR: u64 = 0x2;
const O_CREAT: u64 = 0x100;
const O_TRUNC: u64 = 0x200;
const O_APPEND: u64 = 0x400;

fn decode_open_flags(bits: u64) -> OpenFlags {
    let mut flags = match bits & O_ACCMODE {
        O_WRONLY => OpenFlags::WRITE,
        O_RDWR => OpenFlags::READ | OpenFlags::WRITE,
        _ => OpenFlags::READ,
    };
    if bits & O_CREAT != 0 {
        flags |= OpenFlags::CREATE;
    }
    if bits & O_TRUNC != 0 {
        flags |= OpenFlags::TRUNCATE;
    }
    if bits & O_APPEND != 0 {
        flags |= OpenFlags::APPEND;
    }
    flags
}

/// Table-driven dispatch from a saved interrupt frame. The return value
/// (or -1) is written into the frame's rax; `exit` additionally applies
/// the resulting context switch to the frame and leaves rax alone.
pub fn dispatch(kernel: &Kernel, ctx: &mut InterruptContext) {
    let nr = ctx.syscall_number();
    let args = ctx.syscall_args();
    let pid = kernel.current_pid(0);

    let syscall = match Syscall::try_from(nr) {
        Ok(s) => s,
        Err(()) => {
            log::debug!("pid {}: unknown syscall {}", pid, nr);
            record_error(
                kernel,
                pid,
                KernelError::Invalid {
                    what: "syscall number",
                },
            );
            ctx.set_return_value(u64::MAX);
            return;
        }
    };

    if syscall == Syscall::Exit {
        let switch = kernel.exit_current(0, args[0] as i64);
        let mut procs = kernel.procs.lock();
        kernel.apply_switch(&mut procs, switch, ctx);
        // The frame now belongs to the next process; rax stays theirs.
        return;
    }

    let result = handle(kernel, pid, syscall, args);
    match result {
        Ok(value) => ctx.set_return_value(value),
        Err(err) if err.is_fatal() => {
            // Fatal never crosses the syscall boundary as an errno.
            panic!("fatal error in syscall path: {}", err);
        }
        Err(err) => {
            record_error(kernel, pid, err);
            ctx.set_return_value(u64::MAX);
        }
    }
}

fn record_error(kernel: &Kernel, pid: Pid, err: KernelError) {
    let mut procs = kernel.procs.lock();
    if let Some(p) = procs.get_mut(pid) {
        p.errno = err.errno();
    }
}

fn handle(kernel: &Kernel, pid: Pid, syscall: Syscall, args: [u64; 6]) -> KernelResult<u64> {
    match syscall {
        Syscall::Read => sys_read(kernel, pid, args[0], args[1], args[2]),
        Syscall::Write => sys_write(kernel, pid, args[0], args[1], args[2]),
        Syscall::Open => sys_open(kernel, pid, args[0], args[1], args[2]),
        Syscall::Close => sys_close(kernel, pid, args[0]),
        Syscall::Exit => unreachable!("exit handled in dispatch"),
        Syscall::Brk => sys_brk(kernel, pid, args[0]),
        Syscall::Mmap => sys_mmap(kernel, pid, args),
        Syscall::Munmap => sys_munmap(kernel, pid, args[0], args[1]),
    }
}

// ---------------------------------------------------------------------------
// Argument marshaling
// ---------------------------------------------------------------------------

/// Upper bound on one I/O transfer.
const IO_MAX: u64 = 1 << 24;

fn user_buffer<'a>(ptr: u64, len: u64) -> KernelResult<&'a mut [u8]> {
    if ptr == 0 {
        return Err(KernelError::Invalid { what: "null buffer" });
    }
    if len > IO_MAX {
        return Err(KernelError::Invalid {
            what: "transfer too large",
        });
    }
    // SAFETY: The pointer was produced by the calling process and points
    // into its mapped address space (the fault handler catches lies); the
    // length is bounded above.
    Ok(unsafe { core::slice::from_raw_parts_mut(ptr as *mut u8, len as usize) })
}

fn user_string<'a>(ptr: u64) -> KernelResult<&'a str> {
    if ptr == 0 {
        return Err(KernelError::Invalid { what: "null path" });
    }
    let base = ptr as *const u8;
    let mut len = 0usize;
    // SAFETY: Bytes are read one at a time up to the NUL or the PATH_MAX
    // cap, within the caller's mapping.
    unsafe {
        while len < crate::fs::PATH_MAX {
            if *base.add(len) == 0 {
                break;
            }
            len += 1;
        }
        if len == crate::fs::PATH_MAX {
            return Err(KernelError::Invalid { what: "unterminated path" });
        }
        core::str::from_utf8(core::slice::from_raw_parts(base, len))
            .map_err(|_| KernelError::Invalid { what: "path encoding" })
    }
}

fn lookup_open_id(kernel: &Kernel, pid: Pid, fd: u64) -> KernelResult<u64> {
    let procs = kernel.procs.lock();
    let p = procs.get(pid).ok_or(KernelError::NotFound {
        resource: "process",
    })?;
    p.lookup_fd(fd as u32).ok_or(KernelError::Invalid {
        what: "file descriptor",
    })
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn sys_read(kernel: &Kernel, pid: Pid, fd: u64, buf: u64, len: u64) -> KernelResult<u64> {
    let open_id = lookup_open_id(kernel, pid, fd)?;
    let buffer = user_buffer(buf, len)?;
    kernel.vfs.read(open_id, buffer).map(|n| n as u64)
}

fn sys_write(kernel: &Kernel, pid: Pid, fd: u64, buf: u64, len: u64) -> KernelResult<u64> {
    let open_id = lookup_open_id(kernel, pid, fd)?;
    let buffer = user_buffer(buf, len)?;
    kernel.vfs.write(open_id, buffer).map(|n| n as u64)
}

fn sys_open(kernel: &Kernel, pid: Pid, path_ptr: u64, flags: u64, _mode: u64) -> KernelResult<u64> {
    let path = user_string(path_ptr)?;
    let open_id = kernel.vfs.open(path, decode_open_flags(flags))?;
    let mut procs = kernel.procs.lock();
    let p = procs.get_mut(pid).ok_or(KernelError::NotFound {
        resource: "process",
    })?;
    Ok(p.alloc_fd(open_id) as u64)
}

fn sys_close(kernel: &Kernel, pid: Pid, fd: u64) -> KernelResult<u64> {
    let open_id = {
        let mut procs = kernel.procs.lock();
        let p = procs.get_mut(pid).ok_or(KernelError::NotFound {
            resource: "process",
        })?;
        p.fds.remove(&(fd as u32)).ok_or(KernelError::Invalid {
            what: "file descriptor",
        })?
    };
    kernel.vfs.close(open_id)?;
    Ok(0)
}

/// Adjust the heap break. `addr == 0` queries the current break; growing
/// extends the heap region (demand-zero pages arrive via the fault
/// handler); shrinking unmaps and frees the dropped pages.
fn sys_brk(kernel: &Kernel, pid: Pid, addr: u64) -> KernelResult<u64> {
    kernel.vmm.with_space(pid, |space| {
        let heap_end = space
            .regions()
            .iter()
            .find(|r| r.name == "heap")
            .map(|r| r.end.as_u64());

        if addr == 0 {
            return Ok(heap_end.unwrap_or(USER_HEAP_BASE));
        }
        if addr < USER_HEAP_BASE {
            return Err(KernelError::Invalid {
                what: "break below heap base",
            });
        }
        let new_end = VirtualAddress::new(addr).align_up().as_u64();

        match heap_end {
            None => {
                if new_end > USER_HEAP_BASE {
                    space.add_region(MemoryRegion::new(
                        VirtualAddress::new(USER_HEAP_BASE),
                        VirtualAddress::new(new_end),
                        Protection::READ | Protection::WRITE,
                        "heap",
                    ))?;
                }
                Ok(new_end.max(USER_HEAP_BASE))
            }
            Some(old_end) => {
                let new_end = new_end.max(USER_HEAP_BASE);
                if new_end > old_end {
                    // Growing: the added span [old_end, new_end) must not
                    // collide with any other region, same as a fresh
                    // mapping would be checked by add_region. The heap
                    // itself ends at old_end, so it never matches.
                    let grow_start = VirtualAddress::new(old_end);
                    let grow_end = VirtualAddress::new(new_end);
                    if space
                        .regions()
                        .iter()
                        .any(|r| r.overlaps(grow_start, grow_end))
                    {
                        return Err(KernelError::AlreadyExists {
                            resource: "overlapping memory region",
                        });
                    }
                }
                let region = space
                    .find_region_mut(VirtualAddress::new(USER_HEAP_BASE))
                    .ok_or(KernelError::NotFound {
                        resource: "heap region",
                    })?;
                region.end = VirtualAddress::new(new_end);
                // Shrinking: drop mappings past the new break.
                let mut page = new_end;
                while page < old_end {
                    if let Ok(frame) = space.unmap(VirtualAddress::new(page)) {
                        let _ = kernel.frames.free(frame);
                    }
                    page += PAGE_SIZE as u64;
                }
                Ok(new_end)
            }
        }
    })
}

/// Map a fresh region. Pages materialize on first touch (demand zero);
/// `fd >= 0` records the file backing on the region.
fn sys_mmap(kernel: &Kernel, pid: Pid, args: [u64; 6]) -> KernelResult<u64> {
    let [addr, len, prot, _flags, fd, offset] = args;
    if len == 0 {
        return Err(KernelError::Invalid { what: "empty mapping" });
    }
    if addr % PAGE_SIZE as u64 != 0 {
        return Err(KernelError::Invalid {
            what: "unaligned mapping address",
        });
    }
    let len = (len as usize).div_ceil(PAGE_SIZE) as u64 * PAGE_SIZE as u64;

    let mut protection = Protection::empty();
    if prot & 0x1 != 0 {
        protection |= Protection::READ;
    }
    if prot & 0x2 != 0 {
        protection |= Protection::WRITE;
    }
    if prot & 0x4 != 0 {
        protection |= Protection::EXEC;
    }

    let backing = if fd as i64 >= 0 {
        let open_id = lookup_open_id(kernel, pid, fd)?;
        Some(FileBacking {
            inode: kernel.vfs.open_file_ino(open_id)?,
            offset,
        })
    } else {
        None
    };

    kernel.vmm.with_space(pid, |space| {
        let start = if addr != 0 {
            addr
        } else {
            // First gap at or above MMAP_BASE large enough for the request.
            let mut candidate = MMAP_BASE;
            loop {
                let end = candidate + len;
                match space
                    .regions()
                    .iter()
                    .find(|r| r.overlaps(VirtualAddress::new(candidate), VirtualAddress::new(end)))
                {
                    Some(region) => candidate = region.end.as_u64(),
                    None => break,
                }
            }
            candidate
        };

        let mut region = MemoryRegion::new(
            VirtualAddress::new(start),
            VirtualAddress::new(start + len),
            protection,
            "mmap",
        );
        region.backing = backing;
        space.add_region(region)?;
        Ok(start)
    })
}

/// Unmap a region: remove its bookkeeping and free every mapped page.
/// The range must cover a mapped region exactly; partial unmaps are
/// rejected, since a removed region record must not leave live page-table
/// entries behind for a later mapping to inherit (region splitting is not
/// implemented).
fn sys_munmap(kernel: &Kernel, pid: Pid, addr: u64, len: u64) -> KernelResult<u64> {
    if addr % PAGE_SIZE as u64 != 0 || len == 0 {
        return Err(KernelError::Invalid {
            what: "unaligned unmap request",
        });
    }
    let len = (len as usize).div_ceil(PAGE_SIZE) as u64 * PAGE_SIZE as u64;

    let region = kernel.vmm.with_space(pid, |space| {
        let start = VirtualAddress::new(addr);
        let region_len = space
            .regions()
            .iter()
            .find(|r| r.start == start)
            .map(|r| r.len())
            .ok_or(KernelError::NotFound {
                resource: "memory region",
            })?;
        if region_len != len {
            return Err(KernelError::Invalid {
                what: "unmap length does not match the region",
            });
        }
        space.remove_region(start).ok_or(KernelError::NotFound {
            resource: "memory region",
        })
    })?;
    let end = region.end.as_u64();

    let mut page = addr;
    while page < end {
        let _ = kernel
            .vmm
            .unmap_and_release(&kernel.frames, pid, VirtualAddress::new(page));
        page += PAGE_SIZE as u64;
    }
    Ok(0)
}
