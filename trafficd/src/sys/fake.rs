// In-memory stand-in for the bpf(2) syscall
//
// Maps are ordered byte maps, pins are real empty files so ownership and
// mode changes can be observed, and descriptors are real /dev/null handles so
// dropping an OwnedFd is always safe.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::{CStr, OsStr};
use std::fs;
use std::io;
use std::os::fd::{IntoRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use aya::Pod;

use super::*;

#[derive(Debug)]
struct FakeMap {
    map_type: u32,
    key_size: usize,
    value_size: usize,
    max_entries: usize,
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

#[derive(Debug)]
enum Object {
    Map(FakeMap),
    Prog { prog_type: u32, insns: Vec<u8> },
}

#[derive(Debug)]
struct Injected {
    cmd: u32,
    key: Option<Vec<u8>>,
    errno: i32,
}

#[derive(Debug, Default)]
struct State {
    next_id: u32,
    objects: HashMap<u32, Object>,
    fds: HashMap<RawFd, u32>,
    pins: HashMap<PathBuf, u32>,
    attached: HashMap<u32, u32>,
    attach_calls: usize,
    detach_calls: usize,
    injected: Vec<Injected>,
    zero_cookie_fds: HashSet<RawFd>,
    verifier_reject: Option<String>,
}

/// Installs itself as this thread's syscall handler; uninstalls on drop
pub(crate) struct FakeKernel {
    state: Rc<RefCell<State>>,
}

impl FakeKernel {
    pub(crate) fn install() -> Self {
        let state = Rc::new(RefCell::new(State::default()));
        let handler = Rc::clone(&state);
        override_syscall(move |call| handler.borrow_mut().handle(call));
        Self { state }
    }

    /// Every later `cmd` call fails with `errno`
    pub(crate) fn fail(&self, cmd: u32, errno: i32) {
        self.state.borrow_mut().injected.push(Injected {
            cmd,
            key: None,
            errno,
        });
    }

    /// Every later `cmd` call on this exact key fails with `errno`
    pub(crate) fn fail_on_key<K: Pod>(&self, cmd: u32, key: &K, errno: i32) {
        self.state.borrow_mut().injected.push(Injected {
            cmd,
            key: Some(pod_bytes(key).to_vec()),
            errno,
        });
    }

    pub(crate) fn clear_failures(&self) {
        self.state.borrow_mut().injected.clear();
    }

    /// SO_COOKIE on `fd` reports the nonexistent cookie
    pub(crate) fn zero_cookie(&self, fd: RawFd) {
        self.state.borrow_mut().zero_cookie_fds.insert(fd);
    }

    pub(crate) fn cookie_of(fd: RawFd) -> u64 {
        0x1000 + fd as u64
    }

    /// Every later program load is rejected with `log` as verifier output
    pub(crate) fn reject_programs(&self, log: &str) {
        self.state.borrow_mut().verifier_reject = Some(log.to_string());
    }

    pub(crate) fn is_pinned(&self, path: &Path) -> bool {
        self.state.borrow().pins.contains_key(path)
    }

    /// Drops the pin record without touching the file on disk
    pub(crate) fn unpin(&self, path: &Path) {
        self.state.borrow_mut().pins.remove(path);
    }

    pub(crate) fn is_attached(&self, attach_type: u32) -> bool {
        self.state.borrow().attached.contains_key(&attach_type)
    }

    pub(crate) fn attach_calls(&self) -> usize {
        self.state.borrow().attach_calls
    }

    pub(crate) fn detach_calls(&self) -> usize {
        self.state.borrow().detach_calls
    }

    /// Program types and instructions of everything loaded so far
    pub(crate) fn programs(&self) -> Vec<(u32, Vec<u8>)> {
        let state = self.state.borrow();
        let mut ids: Vec<_> = state
            .objects
            .iter()
            .filter_map(|(id, obj)| match obj {
                Object::Prog { prog_type, insns } => Some((*id, *prog_type, insns.clone())),
                Object::Map(_) => None,
            })
            .collect();
        ids.sort_by_key(|(id, _, _)| *id);
        ids.into_iter().map(|(_, t, i)| (t, i)).collect()
    }

    /// Number of rows in the map pinned at `path`
    pub(crate) fn pinned_len(&self, path: &Path) -> Option<usize> {
        let state = self.state.borrow();
        let id = state.pins.get(path)?;
        match state.objects.get(id)? {
            Object::Map(map) => Some(map.entries.len()),
            Object::Prog { .. } => None,
        }
    }

    /// Pins a fresh map with the given shape at `path`
    pub(crate) fn pin_foreign_map(&self, path: &Path, key_size: usize, value_size: usize) {
        let mut state = self.state.borrow_mut();
        let id = state.add_object(Object::Map(FakeMap {
            map_type: BPF_MAP_TYPE_HASH,
            key_size,
            value_size,
            max_entries: 16,
            entries: BTreeMap::new(),
        }));
        fs::write(path, b"").expect("create pin file");
        state.pins.insert(path.to_path_buf(), id);
    }
}

impl Drop for FakeKernel {
    fn drop(&mut self) {
        reset_syscall();
    }
}

fn pod_bytes<T: Pod>(v: &T) -> &[u8] {
    // SAFETY: Pod types have no padding requirements on reads
    unsafe { std::slice::from_raw_parts(v as *const T as *const u8, std::mem::size_of::<T>()) }
}

fn read_bytes(ptr: u64, len: usize) -> Vec<u8> {
    // SAFETY: the pointer came from a wrapper in sys::bpf sized for `len`
    unsafe { std::slice::from_raw_parts(ptr as *const u8, len).to_vec() }
}

fn write_bytes(ptr: u64, bytes: &[u8]) {
    // SAFETY: the pointer came from a wrapper in sys::bpf sized for `bytes`
    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, bytes.len()) }
}

fn read_path(ptr: u64) -> PathBuf {
    // SAFETY: pathname always points at a CString owned by the caller
    let c = unsafe { CStr::from_ptr(ptr as *const libc::c_char) };
    PathBuf::from(OsStr::from_bytes(c.to_bytes()))
}

fn errno(code: i32) -> SysResult {
    Err((-1, io::Error::from_raw_os_error(code)))
}

impl State {
    fn add_object(&mut self, obj: Object) -> u32 {
        self.next_id += 1;
        self.objects.insert(self.next_id, obj);
        self.next_id
    }

    fn new_fd(&mut self, id: u32) -> SysResult {
        let fd = fs::File::open("/dev/null")
            .map_err(|e| (-1, e))?
            .into_raw_fd();
        self.fds.insert(fd, id);
        Ok(fd as i64)
    }

    fn map_mut(&mut self, fd: u32) -> Result<&mut FakeMap, (i64, io::Error)> {
        let id = self
            .fds
            .get(&(fd as RawFd))
            .copied()
            .ok_or((-1, io::Error::from_raw_os_error(libc::EBADF)))?;
        match self.objects.get_mut(&id) {
            Some(Object::Map(map)) => Ok(map),
            _ => Err((-1, io::Error::from_raw_os_error(libc::EINVAL))),
        }
    }

    fn injected(&mut self, cmd: u32, attr: &bpf_attr) -> Option<i32> {
        let elem = matches!(
            cmd,
            BPF_MAP_LOOKUP_ELEM | BPF_MAP_UPDATE_ELEM | BPF_MAP_DELETE_ELEM | BPF_MAP_GET_NEXT_KEY
        );
        let key = if elem {
            let a = unsafe { attr.map_elem };
            if a.key == 0 {
                None
            } else {
                self.map_mut(a.map_fd)
                    .ok()
                    .map(|m| m.key_size)
                    .map(|len| read_bytes(a.key, len))
            }
        } else {
            None
        };
        self.injected
            .iter()
            .find(|inj| {
                inj.cmd == cmd
                    && match &inj.key {
                        None => true,
                        Some(k) => key.as_ref() == Some(k),
                    }
            })
            .map(|inj| inj.errno)
    }

    fn handle(&mut self, call: Syscall<'_>) -> SysResult {
        match call {
            Syscall::SockCookie { fd } => {
                if self.zero_cookie_fds.contains(&fd) {
                    Ok(0)
                } else {
                    Ok(FakeKernel::cookie_of(fd) as i64)
                }
            }
            Syscall::Bpf { cmd, attr } => {
                if let Some(code) = self.injected(cmd, attr) {
                    return errno(code);
                }
                self.bpf(cmd, attr)
            }
        }
    }

    fn bpf(&mut self, cmd: u32, attr: &mut bpf_attr) -> SysResult {
        match cmd {
            BPF_MAP_CREATE => {
                let a = unsafe { attr.map_create };
                if a.key_size == 0 || a.value_size == 0 || a.max_entries == 0 {
                    return errno(libc::EINVAL);
                }
                let id = self.add_object(Object::Map(FakeMap {
                    map_type: a.map_type,
                    key_size: a.key_size as usize,
                    value_size: a.value_size as usize,
                    max_entries: a.max_entries as usize,
                    entries: BTreeMap::new(),
                }));
                self.new_fd(id)
            }
            BPF_MAP_LOOKUP_ELEM => {
                let a = unsafe { attr.map_elem };
                let map = self.map_mut(a.map_fd)?;
                let key = read_bytes(a.key, map.key_size);
                match map.entries.get(&key) {
                    Some(value) => {
                        write_bytes(a.value, value);
                        Ok(0)
                    }
                    None => errno(libc::ENOENT),
                }
            }
            BPF_MAP_UPDATE_ELEM => {
                let a = unsafe { attr.map_elem };
                let map = self.map_mut(a.map_fd)?;
                let key = read_bytes(a.key, map.key_size);
                let value = read_bytes(a.value, map.value_size);
                let present = map.entries.contains_key(&key);
                match a.flags {
                    BPF_NOEXIST if present => return errno(libc::EEXIST),
                    BPF_EXIST if !present => return errno(libc::ENOENT),
                    BPF_ANY | BPF_NOEXIST | BPF_EXIST => {}
                    _ => return errno(libc::EINVAL),
                }
                if !present && map.entries.len() >= map.max_entries {
                    return errno(libc::E2BIG);
                }
                map.entries.insert(key, value);
                Ok(0)
            }
            BPF_MAP_DELETE_ELEM => {
                let a = unsafe { attr.map_elem };
                let map = self.map_mut(a.map_fd)?;
                let key = read_bytes(a.key, map.key_size);
                match map.entries.remove(&key) {
                    Some(_) => Ok(0),
                    None => errno(libc::ENOENT),
                }
            }
            BPF_MAP_GET_NEXT_KEY => {
                let a = unsafe { attr.map_elem };
                let map = self.map_mut(a.map_fd)?;
                let next = if a.key == 0 {
                    map.entries.keys().next()
                } else {
                    let key = read_bytes(a.key, map.key_size);
                    if map.entries.contains_key(&key) {
                        map.entries
                            .range::<Vec<u8>, _>((
                                std::ops::Bound::Excluded(&key),
                                std::ops::Bound::Unbounded,
                            ))
                            .next()
                            .map(|(k, _)| k)
                    } else {
                        // A vanished key restarts the walk, like the hash table does
                        map.entries.keys().next()
                    }
                };
                match next {
                    Some(k) => {
                        write_bytes(a.value, k);
                        Ok(0)
                    }
                    None => errno(libc::ENOENT),
                }
            }
            BPF_OBJ_PIN => {
                let a = unsafe { attr.obj };
                let path = read_path(a.pathname);
                let Some(id) = self.fds.get(&(a.bpf_fd as RawFd)).copied() else {
                    return errno(libc::EBADF);
                };
                if self.pins.contains_key(&path) || path.exists() {
                    return errno(libc::EEXIST);
                }
                if fs::write(&path, b"").is_err() {
                    return errno(libc::ENOENT);
                }
                self.pins.insert(path, id);
                Ok(0)
            }
            BPF_OBJ_GET => {
                let a = unsafe { attr.obj };
                let path = read_path(a.pathname);
                match self.pins.get(&path).copied() {
                    Some(id) => self.new_fd(id),
                    None => errno(libc::ENOENT),
                }
            }
            BPF_OBJ_GET_INFO_BY_FD => {
                let a = unsafe { attr.info };
                let map = self.map_mut(a.bpf_fd)?;
                let info = bpf_map_info {
                    map_type: map.map_type,
                    id: 0,
                    key_size: map.key_size as u32,
                    value_size: map.value_size as u32,
                    max_entries: map.max_entries as u32,
                    map_flags: 0,
                };
                let len = (a.info_len as usize).min(std::mem::size_of::<bpf_map_info>());
                write_bytes(a.info, &pod_bytes_info(&info)[..len]);
                Ok(0)
            }
            BPF_PROG_LOAD => {
                let a = unsafe { attr.prog_load };
                if let Some(log) = &self.verifier_reject {
                    let bytes = log.as_bytes();
                    let len = bytes.len().min((a.log_size as usize).saturating_sub(1));
                    if a.log_buf != 0 {
                        write_bytes(a.log_buf, &bytes[..len]);
                    }
                    return errno(libc::EACCES);
                }
                let insns = read_bytes(a.insns, a.insn_cnt as usize * 8);
                let id = self.add_object(Object::Prog {
                    prog_type: a.prog_type,
                    insns,
                });
                self.new_fd(id)
            }
            BPF_PROG_ATTACH => {
                let a = unsafe { attr.prog_attach };
                let Some(id) = self.fds.get(&(a.attach_bpf_fd as RawFd)).copied() else {
                    return errno(libc::EBADF);
                };
                self.attach_calls += 1;
                self.attached.insert(a.attach_type, id);
                Ok(0)
            }
            BPF_PROG_DETACH => {
                let a = unsafe { attr.prog_attach };
                self.detach_calls += 1;
                match self.attached.remove(&a.attach_type) {
                    Some(_) => Ok(0),
                    None => errno(libc::ENOENT),
                }
            }
            _ => errno(libc::EINVAL),
        }
    }
}

fn pod_bytes_info(info: &bpf_map_info) -> &[u8] {
    // SAFETY: bpf_map_info is repr(C) with only u32 fields
    unsafe {
        std::slice::from_raw_parts(
            info as *const bpf_map_info as *const u8,
            std::mem::size_of::<bpf_map_info>(),
        )
    }
}
