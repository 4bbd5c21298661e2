//! Raw io_uring kernel interface.
//!
//! Mirrors `<linux/io_uring.h>`: the structs shared with the kernel and the
//! three system calls. Only the pieces this workspace uses are declared.

use nix::errno::Errno;

use std::os::unix::io::RawFd;

// ── mmap offsets ──

pub const IORING_OFF_SQ_RING: libc::off_t = 0;
pub const IORING_OFF_CQ_RING: libc::off_t = 0x0800_0000;
pub const IORING_OFF_SQES: libc::off_t = 0x1000_0000;

// ── io_uring_setup flags ──

pub const IORING_SETUP_CQSIZE: u32 = 1 << 3;
pub const IORING_SETUP_CLAMP: u32 = 1 << 4;

// ── io_uring_params.features ──

pub const IORING_FEAT_SINGLE_MMAP: u32 = 1 << 0;
pub const IORING_FEAT_NODROP: u32 = 1 << 1;

// ── io_uring_register opcodes ──

pub const IORING_REGISTER_BUFFERS: u32 = 0;

/// `_NSIG / 8`, the sigset size the kernel expects alongside a mask.
const NSIG_BYTES: usize = 64 / 8;

/// Largest SQ size `io_uring_setup` accepts.
pub const IORING_MAX_ENTRIES: u32 = 32768;

/// Submission queue entry (64 bytes).
///
/// Unions in the C struct are flattened to the member this workspace
/// writes: `off`, `addr`, `op_flags` (`poll32_events` / `msg_flags`),
/// `buf_index`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct IoUringSqe {
    pub opcode: u8,
    pub flags: u8,
    pub ioprio: u16,
    pub fd: i32,
    pub off: u64,
    pub addr: u64,
    pub len: u32,
    pub op_flags: u32,
    pub user_data: u64,
    pub buf_index: u16,
    pub personality: u16,
    pub splice_fd_in: i32,
    pub _pad2: [u64; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SqRingOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub flags: u32,
    pub dropped: u32,
    pub array: u32,
    pub resv1: u32,
    pub user_addr: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CqRingOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub overflow: u32,
    pub cqes: u32,
    pub flags: u32,
    pub resv1: u32,
    pub user_addr: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct IoUringParams {
    pub sq_entries: u32,
    pub cq_entries: u32,
    pub flags: u32,
    pub sq_thread_cpu: u32,
    pub sq_thread_idle: u32,
    pub features: u32,
    pub wq_fd: u32,
    pub resv: [u32; 3],
    pub sq_off: SqRingOffsets,
    pub cq_off: CqRingOffsets,
}

/// `io_uring_setup(2)`. Fills `params` and returns the ring fd.
///
/// # Safety
/// `params` must point to a writable `IoUringParams`.
pub unsafe fn io_uring_setup(entries: u32, params: *mut IoUringParams) -> nix::Result<RawFd> {
    let ret = libc::syscall(libc::SYS_io_uring_setup, entries as libc::c_long, params);
    Errno::result(ret).map(|fd| fd as RawFd)
}

/// `io_uring_enter(2)` without a signal mask.
///
/// # Safety
/// `fd` must be an io_uring fd whose SQ entries up to the published tail
/// are fully written.
pub unsafe fn io_uring_enter(
    fd: RawFd,
    to_submit: u32,
    min_complete: u32,
    flags: u32,
) -> nix::Result<u32> {
    let ret = libc::syscall(
        libc::SYS_io_uring_enter,
        fd as libc::c_long,
        to_submit as libc::c_long,
        min_complete as libc::c_long,
        flags as libc::c_long,
        std::ptr::null::<libc::sigset_t>(),
        NSIG_BYTES,
    );
    Errno::result(ret).map(|n| n as u32)
}

/// `io_uring_register(2)`.
///
/// # Safety
/// `arg`/`nr_args` must match what `opcode` expects.
pub unsafe fn io_uring_register(
    fd: RawFd,
    opcode: u32,
    arg: *const libc::c_void,
    nr_args: u32,
) -> nix::Result<()> {
    let ret = libc::syscall(
        libc::SYS_io_uring_register,
        fd as libc::c_long,
        opcode as libc::c_long,
        arg,
        nr_args as libc::c_long,
    );
    Errno::result(ret).map(drop)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_sizes_match_uapi() {
        assert_eq!(std::mem::size_of::<IoUringSqe>(), 64);
        assert_eq!(std::mem::size_of::<SqRingOffsets>(), 40);
        assert_eq!(std::mem::size_of::<CqRingOffsets>(), 40);
        assert_eq!(std::mem::size_of::<IoUringParams>(), 120);
    }
}
