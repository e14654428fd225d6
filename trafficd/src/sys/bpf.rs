// bpf(2) command wrappers
//
// Attribute layouts follow linux/bpf.h. Each command only fills the member
// of `union bpf_attr` it uses; the rest stays zeroed as the kernel requires.

use std::ffi::CStr;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use aya::Pod;

use super::{SysResult, Syscall, syscall};

pub(crate) const BPF_MAP_CREATE: u32 = 0;
pub(crate) const BPF_MAP_LOOKUP_ELEM: u32 = 1;
pub(crate) const BPF_MAP_UPDATE_ELEM: u32 = 2;
pub(crate) const BPF_MAP_DELETE_ELEM: u32 = 3;
pub(crate) const BPF_MAP_GET_NEXT_KEY: u32 = 4;
pub(crate) const BPF_PROG_LOAD: u32 = 5;
pub(crate) const BPF_OBJ_PIN: u32 = 6;
pub(crate) const BPF_OBJ_GET: u32 = 7;
pub(crate) const BPF_PROG_ATTACH: u32 = 8;
pub(crate) const BPF_PROG_DETACH: u32 = 9;
pub(crate) const BPF_OBJ_GET_INFO_BY_FD: u32 = 15;

pub(crate) const BPF_MAP_TYPE_HASH: u32 = 1;

pub(crate) const BPF_PROG_TYPE_SOCKET_FILTER: u32 = 1;
pub(crate) const BPF_PROG_TYPE_CGROUP_SKB: u32 = 8;

pub(crate) const BPF_CGROUP_INET_INGRESS: u32 = 0;
pub(crate) const BPF_CGROUP_INET_EGRESS: u32 = 1;

pub(crate) const BPF_ANY: u64 = 0;
pub(crate) const BPF_NOEXIST: u64 = 1;
pub(crate) const BPF_EXIST: u64 = 2;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct MapCreateAttr {
    pub map_type: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub map_flags: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct MapElemAttr {
    pub map_fd: u32,
    pub key: u64,
    /// `value` for lookup/update, `next_key` for get-next-key
    pub value: u64,
    pub flags: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct ObjAttr {
    pub pathname: u64,
    pub bpf_fd: u32,
    pub file_flags: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct InfoAttr {
    pub bpf_fd: u32,
    pub info_len: u32,
    pub info: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
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
    pub prog_name: [u8; 16],
    pub prog_ifindex: u32,
    pub expected_attach_type: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct ProgAttachAttr {
    pub target_fd: u32,
    pub attach_bpf_fd: u32,
    pub attach_type: u32,
    pub attach_flags: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
#[allow(non_camel_case_types)]
pub(crate) union bpf_attr {
    pub map_create: MapCreateAttr,
    pub map_elem: MapElemAttr,
    pub obj: ObjAttr,
    pub info: InfoAttr,
    pub prog_load: ProgLoadAttr,
    pub prog_attach: ProgAttachAttr,
    _pad: [u64; 16],
}

impl bpf_attr {
    pub(crate) fn zeroed() -> Self {
        bpf_attr { _pad: [0; 16] }
    }
}

/// Leading fields of `struct bpf_map_info`
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct bpf_map_info {
    pub map_type: u32,
    pub id: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub map_flags: u32,
}

fn sys_bpf(cmd: u32, attr: &mut bpf_attr) -> SysResult {
    syscall(Syscall::Bpf { cmd, attr })
}

fn fd_from_ret(ret: i64) -> OwnedFd {
    // SAFETY: the kernel just handed us this descriptor and nothing else owns it
    unsafe { OwnedFd::from_raw_fd(ret as RawFd) }
}

pub(crate) fn bpf_create_map(
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
) -> Result<OwnedFd, (i64, io::Error)> {
    let mut attr = bpf_attr::zeroed();
    attr.map_create = MapCreateAttr {
        map_type,
        key_size,
        value_size,
        max_entries,
        map_flags,
    };
    sys_bpf(BPF_MAP_CREATE, &mut attr).map(fd_from_ret)
}

pub(crate) fn bpf_map_lookup_elem<K: Pod, V: Pod>(
    fd: BorrowedFd<'_>,
    key: &K,
) -> Result<V, (i64, io::Error)> {
    let mut value = mem::MaybeUninit::<V>::zeroed();
    let mut attr = bpf_attr::zeroed();
    attr.map_elem = MapElemAttr {
        map_fd: fd.as_raw_fd() as u32,
        key: key as *const K as u64,
        value: value.as_mut_ptr() as u64,
        flags: 0,
    };
    sys_bpf(BPF_MAP_LOOKUP_ELEM, &mut attr)?;
    // SAFETY: V is Pod and the kernel filled all of it
    Ok(unsafe { value.assume_init() })
}

pub(crate) fn bpf_map_update_elem<K: Pod, V: Pod>(
    fd: BorrowedFd<'_>,
    key: &K,
    value: &V,
    flags: u64,
) -> SysResult {
    let mut attr = bpf_attr::zeroed();
    attr.map_elem = MapElemAttr {
        map_fd: fd.as_raw_fd() as u32,
        key: key as *const K as u64,
        value: value as *const V as u64,
        flags,
    };
    sys_bpf(BPF_MAP_UPDATE_ELEM, &mut attr)
}

pub(crate) fn bpf_map_delete_elem<K: Pod>(fd: BorrowedFd<'_>, key: &K) -> SysResult {
    let mut attr = bpf_attr::zeroed();
    attr.map_elem = MapElemAttr {
        map_fd: fd.as_raw_fd() as u32,
        key: key as *const K as u64,
        value: 0,
        flags: 0,
    };
    sys_bpf(BPF_MAP_DELETE_ELEM, &mut attr)
}

/// Passing `None` asks for the first key of the map
pub(crate) fn bpf_map_get_next_key<K: Pod>(
    fd: BorrowedFd<'_>,
    key: Option<&K>,
) -> Result<K, (i64, io::Error)> {
    let mut next_key = mem::MaybeUninit::<K>::zeroed();
    let mut attr = bpf_attr::zeroed();
    attr.map_elem = MapElemAttr {
        map_fd: fd.as_raw_fd() as u32,
        key: key.map_or(0, |k| k as *const K as u64),
        value: next_key.as_mut_ptr() as u64,
        flags: 0,
    };
    sys_bpf(BPF_MAP_GET_NEXT_KEY, &mut attr)?;
    // SAFETY: K is Pod and the kernel filled all of it
    Ok(unsafe { next_key.assume_init() })
}

pub(crate) fn bpf_obj_pin(fd: BorrowedFd<'_>, path: &CStr) -> SysResult {
    let mut attr = bpf_attr::zeroed();
    attr.obj = ObjAttr {
        pathname: path.as_ptr() as u64,
        bpf_fd: fd.as_raw_fd() as u32,
        file_flags: 0,
    };
    sys_bpf(BPF_OBJ_PIN, &mut attr)
}

pub(crate) fn bpf_obj_get(path: &CStr) -> Result<OwnedFd, (i64, io::Error)> {
    let mut attr = bpf_attr::zeroed();
    attr.obj = ObjAttr {
        pathname: path.as_ptr() as u64,
        bpf_fd: 0,
        file_flags: 0,
    };
    sys_bpf(BPF_OBJ_GET, &mut attr).map(fd_from_ret)
}

pub(crate) fn bpf_map_get_info_by_fd(
    fd: BorrowedFd<'_>,
) -> Result<bpf_map_info, (i64, io::Error)> {
    let mut info = bpf_map_info::default();
    let mut attr = bpf_attr::zeroed();
    attr.info = InfoAttr {
        bpf_fd: fd.as_raw_fd() as u32,
        info_len: mem::size_of::<bpf_map_info>() as u32,
        info: &mut info as *mut bpf_map_info as u64,
    };
    sys_bpf(BPF_OBJ_GET_INFO_BY_FD, &mut attr)?;
    Ok(info)
}

/// Loads `insns` (raw 8-byte instructions). Verifier output lands in `log_buf`.
pub(crate) fn bpf_load_program(
    prog_type: u32,
    insns: &[u8],
    license: &CStr,
    log_buf: &mut [u8],
) -> Result<OwnedFd, (i64, io::Error)> {
    let mut attr = bpf_attr::zeroed();
    attr.prog_load = ProgLoadAttr {
        prog_type,
        insn_cnt: (insns.len() / 8) as u32,
        insns: insns.as_ptr() as u64,
        license: license.as_ptr() as u64,
        log_level: if log_buf.is_empty() { 0 } else { 1 },
        log_size: log_buf.len() as u32,
        log_buf: log_buf.as_mut_ptr() as u64,
        ..Default::default()
    };
    sys_bpf(BPF_PROG_LOAD, &mut attr).map(fd_from_ret)
}

pub(crate) fn bpf_prog_attach(
    prog_fd: BorrowedFd<'_>,
    target_fd: BorrowedFd<'_>,
    attach_type: u32,
) -> SysResult {
    let mut attr = bpf_attr::zeroed();
    attr.prog_attach = ProgAttachAttr {
        target_fd: target_fd.as_raw_fd() as u32,
        attach_bpf_fd: prog_fd.as_raw_fd() as u32,
        attach_type,
        attach_flags: 0,
    };
    sys_bpf(BPF_PROG_ATTACH, &mut attr)
}

pub(crate) fn bpf_prog_detach(target_fd: BorrowedFd<'_>, attach_type: u32) -> SysResult {
    let mut attr = bpf_attr::zeroed();
    attr.prog_attach = ProgAttachAttr {
        target_fd: target_fd.as_raw_fd() as u32,
        attach_bpf_fd: 0,
        attach_type,
        attach_flags: 0,
    };
    sys_bpf(BPF_PROG_DETACH, &mut attr)
}

/// Socket cookie as reported by SO_COOKIE
pub(crate) fn sock_cookie(fd: BorrowedFd<'_>) -> Result<u64, (i64, io::Error)> {
    syscall(Syscall::SockCookie {
        fd: fd.as_raw_fd(),
    })
    .map(|cookie| cookie as u64)
}
