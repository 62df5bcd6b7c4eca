//! Loading and attaching cgroup device-filter programs.
//!
//! Every device-access attempt by a process in a cgroup is evaluated by
//! the attached BPF_CGROUP_DEVICE program. Installing a filter must
//! replace whatever this crate attached before without a window where no
//! filter is active, which is why a single pre-existing program goes
//! through the kernel's atomic replace path.
//!
//! All bpf(2) raw-pointer handling is confined to this module; the rest
//! of the crate only sees typed program handles.

use std::ffi::CString;
use std::fs::File;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::resource::{setrlimit, Resource};
use tracing::{debug, warn};

use crate::error::{CgroupError, Result};

// bpf(2) commands and flags; not exported by libc.
const BPF_PROG_LOAD: u32 = 5;
const BPF_PROG_ATTACH: u32 = 8;
const BPF_PROG_DETACH: u32 = 9;
const BPF_PROG_GET_FD_BY_ID: u32 = 13;
const BPF_PROG_QUERY: u32 = 16;

const BPF_PROG_TYPE_CGROUP_DEVICE: u32 = 15;
const BPF_CGROUP_DEVICE: u32 = 6;
const BPF_F_ALLOW_MULTI: u32 = 1 << 1;
const BPF_F_REPLACE: u32 = 1 << 2;

/// Architectural limit on programs attached to one cgroup.
const MAX_ATTACHED_PROGRAMS: usize = 64;

/// Attempts before giving up on a stable enumeration.
const QUERY_RETRIES: usize = 10;

/// One raw eBPF instruction, as consumed by BPF_PROG_LOAD. Instructions
/// arrive pre-assembled; this crate never builds or inspects them.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BpfInsn {
    pub code: u8,
    /// Destination register in the low nibble, source in the high.
    pub regs: u8,
    pub off: i16,
    pub imm: i32,
}

/// Revert handle for an installed device filter. Detaches the program
/// this crate attached and nothing else: after an atomic replace the
/// previously attached program is NOT restored, so reverting fails open.
/// That gap is inherited from the original design; the correct recovery
/// policy is unspecified.
#[derive(Debug)]
pub struct DeviceFilterGuard {
    dir: File,
    prog: OwnedFd,
}

impl DeviceFilterGuard {
    /// Detach the program installed by
    /// [`load_attach_device_filter`]. Consumes the guard; the program fd
    /// closes either way.
    pub fn detach(self) -> Result<()> {
        detach_program(self.dir.as_raw_fd(), self.prog.as_raw_fd())
    }
}

/// Install a device filter program on the cgroup directory `dir`.
///
/// Returns a guard whose [`DeviceFilterGuard::detach`] removes the newly
/// installed program. With exactly one program already attached the
/// kernel swaps atomically; with more than one (a state correct group
/// management never produces) the extras are detached best-effort after
/// the new program is in place.
pub fn load_attach_device_filter(
    insns: &[BpfInsn],
    license: &str,
    dir: File,
) -> Result<DeviceFilterGuard> {
    // Loading can fail with EPERM when the locked-memory limit is too
    // small; raising it is advisory and the load itself decides.
    if let Err(e) = setrlimit(
        Resource::RLIMIT_MEMLOCK,
        libc::RLIM_INFINITY,
        libc::RLIM_INFINITY,
    ) {
        debug!(error = %e, "could not raise RLIMIT_MEMLOCK");
    }

    let old_ids = query_device_programs(dir.as_raw_fd())?;
    let old_progs = old_ids
        .iter()
        .map(|&id| prog_fd_by_id(id))
        .collect::<Result<Vec<OwnedFd>>>()?;

    let prog = load_program(insns, license)?;

    let replace = if old_progs.len() == 1 {
        Some(old_progs[0].as_raw_fd())
    } else {
        None
    };
    attach_program(dir.as_raw_fd(), prog.as_raw_fd(), replace)?;
    let guard = DeviceFilterGuard { dir, prog };

    if old_progs.len() > 1 {
        // Should not happen under correct group management; clean up the
        // leftovers now that the new filter is attached.
        warn!(
            count = old_progs.len(),
            "found more than one device filter attached to the cgroup, removing extra filters"
        );
        for old in &old_progs {
            if let Err(e) = detach_program(guard.dir.as_raw_fd(), old.as_raw_fd()) {
                warn!(error = %e, "failed to detach stale device filter");
            }
        }
    }

    Ok(guard)
}

/// Ids of the device-filter programs currently attached to `dir_fd`.
fn query_device_programs(dir_fd: RawFd) -> Result<Vec<u32>> {
    query_with_retries(|ids| {
        let mut attr = ProgQueryAttr {
            target_fd: dir_fd as u32,
            attach_type: BPF_CGROUP_DEVICE,
            query_flags: 0,
            attach_flags: 0,
            prog_ids: ids.as_mut_ptr() as u64,
            prog_cnt: ids.len() as u32,
        };
        match sys_bpf(BPF_PROG_QUERY, &mut attr) {
            Ok(_) => Ok(QueryOutcome::Complete(attr.prog_cnt)),
            // On ENOSPC the kernel still reports the true count.
            Err(Errno::ENOSPC) => Ok(QueryOutcome::TooSmall(attr.prog_cnt)),
            Err(errno) => Err(CgroupError::Syscall {
                op: "bpf_prog_query",
                errno,
            }),
        }
    })
}

enum QueryOutcome {
    /// Query succeeded; the buffer holds this many ids.
    Complete(u32),
    /// Buffer was too small; the kernel needs room for this many ids.
    TooSmall(u32),
}

/// Drive a program-id query against a racing kernel: resize to the
/// reported count on each short buffer, bounded by [`QUERY_RETRIES`].
fn query_with_retries(
    mut query: impl FnMut(&mut Vec<u32>) -> Result<QueryOutcome>,
) -> Result<Vec<u32>> {
    let mut size = MAX_ATTACHED_PROGRAMS;
    for _ in 0..QUERY_RETRIES {
        let mut ids = vec![0u32; size];
        match query(&mut ids)? {
            QueryOutcome::Complete(count) => {
                ids.truncate(count as usize);
                return Ok(ids);
            }
            QueryOutcome::TooSmall(count) => size = count as usize,
        }
    }
    Err(CgroupError::EnumerationRace)
}

/// Materialize a live program handle from a kernel program id.
fn prog_fd_by_id(id: u32) -> Result<OwnedFd> {
    let mut attr = ProgGetFdByIdAttr {
        prog_id: id,
        next_id: 0,
        open_flags: 0,
    };
    let fd = sys_bpf(BPF_PROG_GET_FD_BY_ID, &mut attr).map_err(|errno| CgroupError::Syscall {
        op: "bpf_prog_get_fd_by_id",
        errno,
    })?;
    // SAFETY: on success the kernel returned a fresh fd we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

/// Load the instructions as a cgroup-device program.
fn load_program(insns: &[BpfInsn], license: &str) -> Result<OwnedFd> {
    let license = CString::new(license).map_err(|_| {
        CgroupError::Translation("program license contains a NUL byte".to_string())
    })?;
    let mut attr = ProgLoadAttr {
        prog_type: BPF_PROG_TYPE_CGROUP_DEVICE,
        insn_cnt: insns.len() as u32,
        insns: insns.as_ptr() as u64,
        license: license.as_ptr() as u64,
        log_level: 0,
        log_size: 0,
        log_buf: 0,
        kern_version: 0,
        prog_flags: 0,
    };
    let fd = sys_bpf(BPF_PROG_LOAD, &mut attr).map_err(|errno| CgroupError::Syscall {
        op: "bpf_prog_load",
        errno,
    })?;
    // SAFETY: on success the kernel returned a fresh fd we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

/// Attach with allow-multi semantics; `replace` selects the kernel's
/// atomic swap of one existing program.
fn attach_program(dir_fd: RawFd, prog_fd: RawFd, replace: Option<RawFd>) -> Result<()> {
    let mut flags = BPF_F_ALLOW_MULTI;
    let mut replace_fd = 0;
    if let Some(old) = replace {
        flags |= BPF_F_REPLACE;
        replace_fd = old as u32;
    }
    let mut attr = ProgAttachAttr {
        target_fd: dir_fd as u32,
        attach_bpf_fd: prog_fd as u32,
        attach_type: BPF_CGROUP_DEVICE,
        attach_flags: flags,
        replace_bpf_fd: replace_fd,
    };
    sys_bpf(BPF_PROG_ATTACH, &mut attr)
        .map(|_| ())
        .map_err(|errno| CgroupError::Syscall {
            op: "bpf_prog_attach",
            errno,
        })
}

fn detach_program(dir_fd: RawFd, prog_fd: RawFd) -> Result<()> {
    let mut attr = ProgAttachAttr {
        target_fd: dir_fd as u32,
        attach_bpf_fd: prog_fd as u32,
        attach_type: BPF_CGROUP_DEVICE,
        attach_flags: 0,
        replace_bpf_fd: 0,
    };
    sys_bpf(BPF_PROG_DETACH, &mut attr)
        .map(|_| ())
        .map_err(|errno| CgroupError::Syscall {
            op: "bpf_prog_detach",
            errno,
        })
}

// Per-command views of the kernel's bpf_attr union. The kernel reads
// exactly the size passed to the syscall, so each view only declares the
// fields its command consumes.

#[repr(C)]
struct ProgQueryAttr {
    target_fd: u32,
    attach_type: u32,
    query_flags: u32,
    attach_flags: u32,
    /// User-space address of the id buffer; alignment puts it at offset 16.
    prog_ids: u64,
    prog_cnt: u32,
}

#[repr(C)]
struct ProgGetFdByIdAttr {
    prog_id: u32,
    next_id: u32,
    open_flags: u32,
}

#[repr(C)]
struct ProgLoadAttr {
    prog_type: u32,
    insn_cnt: u32,
    insns: u64,
    license: u64,
    log_level: u32,
    log_size: u32,
    log_buf: u64,
    kern_version: u32,
    prog_flags: u32,
}

#[repr(C)]
struct ProgAttachAttr {
    target_fd: u32,
    attach_bpf_fd: u32,
    attach_type: u32,
    attach_flags: u32,
    replace_bpf_fd: u32,
}

/// The single audited boundary around the raw syscall. Takes one of the
/// typed attr views above; returns the syscall's non-negative result.
fn sys_bpf<T>(cmd: u32, attr: &mut T) -> std::result::Result<i64, Errno> {
    // SAFETY: attr is a live, exclusively borrowed repr(C) struct and the
    // kernel reads at most size_of::<T>() bytes from it.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            cmd as libc::c_long,
            attr as *mut T as *mut libc::c_void,
            mem::size_of::<T>(),
        )
    };
    if ret < 0 {
        Err(Errno::last())
    } else {
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bpf_insn_matches_kernel_layout() {
        assert_eq!(mem::size_of::<BpfInsn>(), 8);
    }

    #[test]
    fn test_query_attr_buffer_field_is_aligned() {
        assert_eq!(mem::size_of::<ProgQueryAttr>(), 32);
        let attr = ProgQueryAttr {
            target_fd: 0,
            attach_type: 0,
            query_flags: 0,
            attach_flags: 0,
            prog_ids: 0,
            prog_cnt: 0,
        };
        let base = &attr as *const _ as usize;
        let ids = &attr.prog_ids as *const _ as usize;
        assert_eq!(ids - base, 16);
    }

    #[test]
    fn test_query_succeeds_first_try() {
        let ids = query_with_retries(|buf| {
            assert_eq!(buf.len(), MAX_ATTACHED_PROGRAMS);
            buf[0] = 11;
            buf[1] = 22;
            Ok(QueryOutcome::Complete(2))
        })
        .unwrap();
        assert_eq!(ids, vec![11, 22]);
    }

    #[test]
    fn test_query_resizes_to_reported_count() {
        let mut calls = 0;
        let ids = query_with_retries(|buf| {
            calls += 1;
            if calls < 3 {
                // Kernel says the buffer needs room for 70 ids.
                Ok(QueryOutcome::TooSmall(70))
            } else {
                assert_eq!(buf.len(), 70);
                buf[..3].copy_from_slice(&[1, 2, 3]);
                Ok(QueryOutcome::Complete(3))
            }
        })
        .unwrap();
        assert_eq!(calls, 3);
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_query_nine_short_buffers_then_success() {
        let mut calls = 0;
        let ids = query_with_retries(|_| {
            calls += 1;
            if calls <= 9 {
                Ok(QueryOutcome::TooSmall(65))
            } else {
                Ok(QueryOutcome::Complete(0))
            }
        })
        .unwrap();
        assert_eq!(calls, 10);
        assert!(ids.is_empty());
    }

    #[test]
    fn test_query_gives_up_after_ten_short_buffers() {
        let mut calls = 0;
        let err = query_with_retries(|_| {
            calls += 1;
            Ok(QueryOutcome::TooSmall(65))
        })
        .unwrap_err();
        assert_eq!(calls, 10);
        assert!(matches!(err, CgroupError::EnumerationRace));
    }

    #[test]
    fn test_query_surfaces_syscall_errors() {
        let err = query_with_retries(|_| {
            Err(CgroupError::Syscall {
                op: "bpf_prog_query",
                errno: Errno::EPERM,
            })
        })
        .unwrap_err();
        assert!(matches!(err, CgroupError::Syscall { .. }));
    }
}
