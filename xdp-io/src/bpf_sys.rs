//! Gateway to the `bpf(2)` syscall.
//!
//! Every map, program and link operation goes through one syscall whose
//! argument is `union bpf_attr`. The structs below mirror the kernel layout
//! field for field, padding included; the `const` assertions at the bottom
//! pin the offsets that matter so a reordering fails the build instead of
//! silently landing a flags word on top of a pointer.
//!
//! [`BpfBackend`] is the seam the loader talks to. [`Syscall`] is the real
//! kernel; tests substitute an in-memory double.

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::RawFd;

use tracing::{debug, warn};

use crate::bytecode::BpfInsn;
use crate::error::{Result, XdpError};

// ---------------------------------------------------------------------------
// Kernel constants (from <linux/bpf.h>, <linux/if_link.h>)
// ---------------------------------------------------------------------------

pub const BPF_MAP_CREATE: u32 = 0;
pub const BPF_MAP_UPDATE_ELEM: u32 = 2;
pub const BPF_MAP_DELETE_ELEM: u32 = 3;
pub const BPF_PROG_LOAD: u32 = 5;
pub const BPF_PROG_GET_NEXT_ID: u32 = 11;
pub const BPF_PROG_GET_FD_BY_ID: u32 = 13;
pub const BPF_OBJ_GET_INFO_BY_FD: u32 = 15;
pub const BPF_LINK_CREATE: u32 = 28;
pub const BPF_LINK_GET_FD_BY_ID: u32 = 30;
pub const BPF_LINK_GET_NEXT_ID: u32 = 31;
pub const BPF_LINK_DETACH: u32 = 34;

pub const BPF_MAP_TYPE_HASH: u32 = 1;
pub const BPF_MAP_TYPE_XSKMAP: u32 = 17;

pub const BPF_PROG_TYPE_XDP: u32 = 6;
pub const BPF_XDP: u32 = 37;
pub const BPF_LINK_TYPE_XDP: u32 = 6;

/// `BPF_ANY`: create or update.
pub const BPF_ANY: u64 = 0;

pub const XDP_FLAGS_SKB_MODE: u32 = 1 << 1;
pub const XDP_FLAGS_DRV_MODE: u32 = 1 << 2;

const BPF_OBJ_NAME_LEN: usize = 16;
const LOG_BUF_START: usize = 64 * 1024;
const LOG_BUF_MAX: usize = 16 * 1024 * 1024;

// ---------------------------------------------------------------------------
// union bpf_attr
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub(crate) struct MapCreateAttr {
    pub map_type: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub map_flags: u32,
    pub inner_map_fd: u32,
    pub numa_node: u32,
    pub map_name: [u8; BPF_OBJ_NAME_LEN],
    pub map_ifindex: u32,
    pub btf_fd: u32,
    pub btf_key_type_id: u32,
    pub btf_value_type_id: u32,
    pub btf_vmlinux_value_type_id: u32,
    pub map_extra: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct MapElemAttr {
    pub map_fd: u32,
    pub _pad: u32,
    pub key: u64,
    pub value: u64,
    pub flags: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub(crate) struct ProgLoadAttr {
    pub prog_type: u32,
    pub insn_cnt: u32,
    pub insns: u64,
    pub license: u64,
    pub log_level: u32,
    pub log_size: u32,
    pub log_buf: u64,
    pub kern_version: u32,
    pub prog_flags: u32,
    pub prog_name: [u8; BPF_OBJ_NAME_LEN],
    pub prog_ifindex: u32,
    pub expected_attach_type: u32,
    pub prog_btf_fd: u32,
    pub func_info_rec_size: u32,
    pub func_info: u64,
    pub func_info_cnt: u32,
    pub line_info_rec_size: u32,
    pub line_info: u64,
    pub line_info_cnt: u32,
    pub attach_btf_id: u32,
    pub attach_prog_fd: u32,
    pub core_relo_cnt: u32,
    pub fd_array: u64,
    pub core_relos: u64,
    pub core_relo_rec_size: u32,
    pub log_true_size: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct LinkCreateAttr {
    pub prog_fd: u32,
    pub target_ifindex: u32,
    pub attach_type: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct GetIdAttr {
    /// `start_id` for *_GET_NEXT_ID, the object id for *_GET_FD_BY_ID.
    pub id: u32,
    pub next_id: u32,
    pub open_flags: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct InfoAttr {
    pub bpf_fd: u32,
    pub info_len: u32,
    pub info: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct LinkDetachAttr {
    pub link_fd: u32,
}

#[repr(C)]
pub(crate) union BpfAttr {
    pub map_create: MapCreateAttr,
    pub map_elem: MapElemAttr,
    pub prog_load: ProgLoadAttr,
    pub link_create: LinkCreateAttr,
    pub get_id: GetIdAttr,
    pub info: InfoAttr,
    pub link_detach: LinkDetachAttr,
}

impl BpfAttr {
    pub(crate) fn zeroed() -> Self {
        // SAFETY: every member is plain integers; all-zero is the kernel's
        // "unset" value for each field.
        unsafe { mem::zeroed() }
    }
}

// Layout checks against <linux/bpf.h>.
const _: () = {
    use std::mem::offset_of;
    assert!(offset_of!(MapCreateAttr, map_name) == 28);
    assert!(offset_of!(MapCreateAttr, map_ifindex) == 44);
    assert!(offset_of!(MapCreateAttr, map_extra) == 64);
    assert!(offset_of!(MapElemAttr, key) == 8);
    assert!(offset_of!(MapElemAttr, value) == 16);
    assert!(offset_of!(MapElemAttr, flags) == 24);
    assert!(offset_of!(ProgLoadAttr, insns) == 8);
    assert!(offset_of!(ProgLoadAttr, license) == 16);
    assert!(offset_of!(ProgLoadAttr, log_level) == 24);
    assert!(offset_of!(ProgLoadAttr, log_buf) == 32);
    assert!(offset_of!(ProgLoadAttr, kern_version) == 40);
    assert!(offset_of!(ProgLoadAttr, prog_name) == 48);
    assert!(offset_of!(ProgLoadAttr, expected_attach_type) == 68);
    assert!(offset_of!(ProgLoadAttr, fd_array) == 120);
    assert!(offset_of!(ProgLoadAttr, log_true_size) == 140);
    assert!(offset_of!(LinkCreateAttr, attach_type) == 8);
    assert!(offset_of!(LinkCreateAttr, flags) == 12);
    assert!(offset_of!(InfoAttr, info) == 8);
    assert!(mem::size_of::<BpfAttr>() == 144);
    assert!(mem::size_of::<BpfInsn>() == 8);
};

/// Issue `bpf(cmd, attr)`. Returns the non-negative result (often an fd).
pub(crate) fn sys_bpf(cmd: u32, attr: &mut BpfAttr) -> io::Result<i64> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            cmd as libc::c_long,
            attr as *mut BpfAttr as *mut libc::c_void,
            mem::size_of::<BpfAttr>() as libc::c_uint,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as i64)
}

fn object_name(name: &str) -> [u8; BPF_OBJ_NAME_LEN] {
    let mut out = [0u8; BPF_OBJ_NAME_LEN];
    let len = name.len().min(BPF_OBJ_NAME_LEN - 1);
    out[..len].copy_from_slice(&name.as_bytes()[..len]);
    out
}

// ---------------------------------------------------------------------------
// Backend seam
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapSpec {
    pub map_type: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub name: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct ProgramSpec<'a> {
    pub insns: &'a [BpfInsn],
    pub license: &'a str,
    pub name: &'a str,
}

/// The kernel operations the XDP loader needs.
pub trait BpfBackend: Send + Sync {
    fn map_create(&self, spec: &MapSpec) -> Result<RawFd>;

    fn map_update(&self, map_fd: RawFd, key: &[u8], value: &[u8], flags: u64) -> Result<()>;

    fn map_delete(&self, map_fd: RawFd, key: &[u8]) -> Result<()>;

    /// Load an XDP program. Verifier rejections carry the verifier log.
    fn prog_load(&self, prog: &ProgramSpec<'_>) -> Result<RawFd>;

    /// Attach `prog_fd` to `ifindex` through a BPF link. Fails with
    /// `EBUSY`/`EEXIST` when the interface already runs an XDP program.
    fn link_create(&self, prog_fd: RawFd, ifindex: u32, xdp_flags: u32) -> Result<RawFd>;

    fn close(&self, fd: RawFd);
}

/// The real `bpf(2)` syscall.
#[derive(Debug, Default, Clone, Copy)]
pub struct Syscall;

impl Syscall {
    fn load_once(
        prog: &ProgramSpec<'_>,
        license: &CString,
        log: Option<&mut Vec<u8>>,
    ) -> io::Result<RawFd> {
        let mut attr = BpfAttr::zeroed();
        let (log_level, log_size, log_buf) = match log {
            Some(buf) => (1, buf.len() as u32, buf.as_mut_ptr() as u64),
            None => (0, 0, 0),
        };
        attr.prog_load = ProgLoadAttr {
            prog_type: BPF_PROG_TYPE_XDP,
            insn_cnt: prog.insns.len() as u32,
            insns: prog.insns.as_ptr() as u64,
            license: license.as_ptr() as u64,
            log_level,
            log_size,
            log_buf,
            prog_name: object_name(prog.name),
            expected_attach_type: BPF_XDP,
            ..Default::default()
        };
        sys_bpf(BPF_PROG_LOAD, &mut attr).map(|fd| fd as RawFd)
    }
}

impl BpfBackend for Syscall {
    fn map_create(&self, spec: &MapSpec) -> Result<RawFd> {
        let mut attr = BpfAttr::zeroed();
        attr.map_create = MapCreateAttr {
            map_type: spec.map_type,
            key_size: spec.key_size,
            value_size: spec.value_size,
            max_entries: spec.max_entries,
            map_name: object_name(spec.name),
            ..Default::default()
        };
        let fd = sys_bpf(BPF_MAP_CREATE, &mut attr)
            .map_err(|e| XdpError::syscall("BPF_MAP_CREATE", e))?;
        debug!(name = spec.name, fd, "created BPF map");
        Ok(fd as RawFd)
    }

    fn map_update(&self, map_fd: RawFd, key: &[u8], value: &[u8], flags: u64) -> Result<()> {
        let mut attr = BpfAttr::zeroed();
        attr.map_elem = MapElemAttr {
            map_fd: map_fd as u32,
            _pad: 0,
            key: key.as_ptr() as u64,
            value: value.as_ptr() as u64,
            flags,
        };
        sys_bpf(BPF_MAP_UPDATE_ELEM, &mut attr)
            .map_err(|e| XdpError::syscall("BPF_MAP_UPDATE_ELEM", e))?;
        Ok(())
    }

    fn map_delete(&self, map_fd: RawFd, key: &[u8]) -> Result<()> {
        let mut attr = BpfAttr::zeroed();
        attr.map_elem = MapElemAttr {
            map_fd: map_fd as u32,
            _pad: 0,
            key: key.as_ptr() as u64,
            value: 0,
            flags: 0,
        };
        sys_bpf(BPF_MAP_DELETE_ELEM, &mut attr)
            .map_err(|e| XdpError::syscall("BPF_MAP_DELETE_ELEM", e))?;
        Ok(())
    }

    fn prog_load(&self, prog: &ProgramSpec<'_>) -> Result<RawFd> {
        let license = CString::new(prog.license)
            .map_err(|_| XdpError::InvalidConfig("license contains NUL".to_string()))?;

        let first = match Self::load_once(prog, &license, None) {
            Ok(fd) => return Ok(fd),
            Err(e) => e,
        };

        // Reload with a log buffer so the caller sees why it was rejected.
        let mut size = LOG_BUF_START;
        loop {
            let mut log = vec![0u8; size];
            match Self::load_once(prog, &license, Some(&mut log)) {
                // Accepted the second time around; not worth failing over.
                Ok(fd) => {
                    warn!(error = %first, "XDP program load succeeded only on retry");
                    return Ok(fd);
                }
                Err(e) if e.raw_os_error() == Some(libc::ENOSPC) && size < LOG_BUF_MAX => {
                    size *= 4;
                }
                Err(e) => {
                    let end = log.iter().position(|&b| b == 0).unwrap_or(log.len());
                    let text = String::from_utf8_lossy(&log[..end]).trim_end().to_string();
                    if text.is_empty() {
                        return Err(XdpError::syscall("BPF_PROG_LOAD", e));
                    }
                    return Err(XdpError::Verifier { source: e, log: text });
                }
            }
        }
    }

    fn link_create(&self, prog_fd: RawFd, ifindex: u32, xdp_flags: u32) -> Result<RawFd> {
        let mut attr = BpfAttr::zeroed();
        attr.link_create = LinkCreateAttr {
            prog_fd: prog_fd as u32,
            target_ifindex: ifindex,
            attach_type: BPF_XDP,
            flags: xdp_flags,
        };
        let fd = sys_bpf(BPF_LINK_CREATE, &mut attr)
            .map_err(|e| XdpError::syscall("BPF_LINK_CREATE", e))?;
        Ok(fd as RawFd)
    }

    fn close(&self, fd: RawFd) {
        if fd >= 0 {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Object enumeration (used by the recovery tooling)
// ---------------------------------------------------------------------------

/// Next object id after `start` for `BPF_PROG_GET_NEXT_ID` /
/// `BPF_LINK_GET_NEXT_ID`. `None` once the id space is exhausted.
pub(crate) fn next_id(cmd: u32, start: u32) -> Result<Option<u32>> {
    let mut attr = BpfAttr::zeroed();
    attr.get_id = GetIdAttr {
        id: start,
        next_id: 0,
        open_flags: 0,
    };
    match sys_bpf(cmd, &mut attr) {
        Ok(_) => Ok(Some(unsafe { attr.get_id.next_id })),
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(None),
        Err(e) => Err(XdpError::syscall("BPF_*_GET_NEXT_ID", e)),
    }
}

/// Open an fd for a program or link id. `None` if the object vanished.
pub(crate) fn fd_by_id(cmd: u32, id: u32) -> Result<Option<RawFd>> {
    let mut attr = BpfAttr::zeroed();
    attr.get_id = GetIdAttr {
        id,
        next_id: 0,
        open_flags: 0,
    };
    match sys_bpf(cmd, &mut attr) {
        Ok(fd) => Ok(Some(fd as RawFd)),
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(None),
        Err(e) => Err(XdpError::syscall("BPF_*_GET_FD_BY_ID", e)),
    }
}

/// `BPF_OBJ_GET_INFO_BY_FD` into a caller-provided info struct.
pub(crate) fn obj_info<T: Copy>(fd: RawFd, info: &mut T) -> Result<()> {
    let mut attr = BpfAttr::zeroed();
    attr.info = InfoAttr {
        bpf_fd: fd as u32,
        info_len: mem::size_of::<T>() as u32,
        info: info as *mut T as u64,
    };
    sys_bpf(BPF_OBJ_GET_INFO_BY_FD, &mut attr)
        .map_err(|e| XdpError::syscall("BPF_OBJ_GET_INFO_BY_FD", e))?;
    Ok(())
}

pub(crate) fn link_detach(link_fd: RawFd) -> Result<()> {
    let mut attr = BpfAttr::zeroed();
    attr.link_detach = LinkDetachAttr {
        link_fd: link_fd as u32,
    };
    sys_bpf(BPF_LINK_DETACH, &mut attr).map_err(|e| XdpError::syscall("BPF_LINK_DETACH", e))?;
    Ok(())
}

/// Raise `RLIMIT_MEMLOCK` so map and UMEM pinning is not refused on kernels
/// that still charge BPF memory against it (< 5.11). Best effort.
pub fn bump_memlock_rlimit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) } != 0 {
        debug!(
            error = %io::Error::last_os_error(),
            "could not raise RLIMIT_MEMLOCK; relying on memcg accounting"
        );
    }
}
