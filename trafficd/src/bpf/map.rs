// Typed wrapper over a kernel BPF hash map
//
// Keys and values are fixed-size Pod records, so every call is a byte copy
// of exactly `size_of::<K>()` / `size_of::<V>()` bytes.

use std::ffi::CString;
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use aya::Pod;
use thiserror::Error;

use crate::sys::{
    BPF_ANY, BPF_EXIST, BPF_NOEXIST, bpf_create_map, bpf_map_delete_elem, bpf_map_get_info_by_fd,
    bpf_map_get_next_key, bpf_map_lookup_elem, bpf_map_update_elem, bpf_obj_get, bpf_obj_pin,
};

#[derive(Error, Debug)]
pub enum MapError {
    #[error("the map is not initialized")]
    NotInitialized,

    #[error("key not found")]
    NotFound,

    #[error("failed to create map: {io_error}")]
    CreateError { code: i64, io_error: io::Error },

    #[error("failed to pin map at {}: {io_error}", path.display())]
    PinError { path: PathBuf, io_error: io::Error },

    #[error("failed to set access rights on {}: {io_error}", path.display())]
    AccessError { path: PathBuf, io_error: io::Error },

    #[error("invalid pin path {}", path.display())]
    InvalidPath { path: PathBuf },

    #[error(
        "pinned map at {} has key/value size {key_size}/{value_size}, expected {expected_key}/{expected_value}",
        path.display()
    )]
    ShapeMismatch {
        path: PathBuf,
        key_size: u32,
        value_size: u32,
        expected_key: u32,
        expected_value: u32,
    },

    #[error("the `{call}` syscall failed with code {code}: {io_error}")]
    SyscallError {
        call: &'static str,
        code: i64,
        io_error: io::Error,
    },
}

impl MapError {
    fn from_syscall(call: &'static str, (code, io_error): (i64, io::Error)) -> Self {
        if io_error.raw_os_error() == Some(libc::ENOENT) {
            return MapError::NotFound;
        }
        MapError::SyscallError {
            call,
            code,
            io_error,
        }
    }

    /// Kernel errno carried by this error, for callers that report raw codes
    pub fn errno(&self) -> i32 {
        match self {
            MapError::NotInitialized => libc::EBADF,
            MapError::NotFound => libc::ENOENT,
            MapError::InvalidPath { .. } | MapError::ShapeMismatch { .. } => libc::EINVAL,
            MapError::CreateError { io_error, .. }
            | MapError::PinError { io_error, .. }
            | MapError::AccessError { io_error, .. }
            | MapError::SyscallError { io_error, .. } => io_error.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, MapError::NotFound)
    }
}

/// Write semantics, passed to the kernel verbatim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePolicy {
    /// Insert or overwrite
    Any,
    /// Insert only, EEXIST if present
    NoExist,
    /// Overwrite only, ENOENT if absent
    Exist,
}

impl UpdatePolicy {
    fn flags(self) -> u64 {
        match self {
            UpdatePolicy::Any => BPF_ANY,
            UpdatePolicy::NoExist => BPF_NOEXIST,
            UpdatePolicy::Exist => BPF_EXIST,
        }
    }
}

pub(crate) fn path_to_cstring(path: &Path) -> Result<CString, MapError> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| MapError::InvalidPath {
        path: path.to_path_buf(),
    })
}

/// Exclusive owner of one kernel map descriptor
///
/// Iteration fetches the successor of a key before handing the key out, so
/// deleting the current key while iterating is safe. Two unlocked deleters
/// on the same map can still make a walk restart, which shows up as
/// duplicated or skipped keys.
pub struct TypedMap<K, V> {
    fd: Option<OwnedFd>,
    pinned_path: Option<PathBuf>,
    _kv: PhantomData<fn() -> (K, V)>,
}

impl<K, V> fmt::Debug for TypedMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedMap")
            .field("fd", &self.fd)
            .field("pinned_path", &self.pinned_path)
            .finish()
    }
}

impl<K, V> Default for TypedMap<K, V> {
    fn default() -> Self {
        Self {
            fd: None,
            pinned_path: None,
            _kv: PhantomData,
        }
    }
}

impl<K: Pod, V: Pod> TypedMap<K, V> {
    /// Creates an anonymous map sized for `K` and `V`
    pub fn create(map_type: u32, max_entries: u32, flags: u32) -> Result<Self, MapError> {
        let fd = bpf_create_map(
            map_type,
            size_of::<K>() as u32,
            size_of::<V>() as u32,
            max_entries,
            flags,
        )
        .map_err(|(code, io_error)| MapError::CreateError { code, io_error })?;

        Ok(Self {
            fd: Some(fd),
            pinned_path: None,
            _kv: PhantomData,
        })
    }

    /// Adopts the map pinned at `path`, or creates and pins a new one
    ///
    /// A freshly created map that cannot be pinned is closed again, so a
    /// failure never leaves an unpinned map behind.
    pub fn get_or_create(
        max_entries: u32,
        path: &Path,
        map_type: u32,
    ) -> Result<Self, MapError> {
        match Self::from_pinned(path) {
            Ok(map) => {
                log::debug!("Reusing pinned map {}", path.display());
                return Ok(map);
            }
            Err(MapError::NotFound) => {}
            Err(e) => return Err(e),
        }

        let c_path = path_to_cstring(path)?;
        let mut map = Self::create(map_type, max_entries, 0)?;
        bpf_obj_pin(map.fd()?, &c_path).map_err(|(_, io_error)| MapError::PinError {
            path: path.to_path_buf(),
            io_error,
        })?;
        map.pinned_path = Some(path.to_path_buf());

        log::debug!(
            "Created map {} (key {} bytes, value {} bytes, {} entries)",
            path.display(),
            size_of::<K>(),
            size_of::<V>(),
            max_entries
        );
        Ok(map)
    }

    /// Opens an existing pinned map, checking that its key and value sizes
    /// match `K` and `V` where the kernel can report them
    pub fn from_pinned(path: &Path) -> Result<Self, MapError> {
        let c_path = path_to_cstring(path)?;
        let fd = bpf_obj_get(&c_path).map_err(|e| MapError::from_syscall("bpf_obj_get", e))?;
        let info = match bpf_map_get_info_by_fd(fd.as_fd()) {
            Ok(info) => info,
            // Kernels before 4.13 have no info-by-fd; take the pin on trust there
            Err((_, io_error))
                if matches!(
                    io_error.raw_os_error(),
                    Some(libc::EINVAL) | Some(libc::EOPNOTSUPP)
                ) =>
            {
                log::warn!(
                    "Cannot verify the shape of pinned map {}: {}",
                    path.display(),
                    io_error
                );
                return Ok(Self {
                    fd: Some(fd),
                    pinned_path: Some(path.to_path_buf()),
                    _kv: PhantomData,
                });
            }
            Err(e) => return Err(MapError::from_syscall("bpf_obj_get_info_by_fd", e)),
        };

        if info.key_size as usize != size_of::<K>() || info.value_size as usize != size_of::<V>() {
            return Err(MapError::ShapeMismatch {
                path: path.to_path_buf(),
                key_size: info.key_size,
                value_size: info.value_size,
                expected_key: size_of::<K>() as u32,
                expected_value: size_of::<V>() as u32,
            });
        }

        Ok(Self {
            fd: Some(fd),
            pinned_path: Some(path.to_path_buf()),
            _kv: PhantomData,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.fd.is_some()
    }

    pub fn pinned_path(&self) -> Option<&Path> {
        self.pinned_path.as_deref()
    }

    pub(crate) fn fd(&self) -> Result<BorrowedFd<'_>, MapError> {
        self.fd
            .as_ref()
            .map(|fd| fd.as_fd())
            .ok_or(MapError::NotInitialized)
    }

    pub fn read_value(&self, key: &K) -> Result<V, MapError> {
        bpf_map_lookup_elem(self.fd()?, key)
            .map_err(|e| MapError::from_syscall("bpf_map_lookup_elem", e))
    }

    pub fn write_value(&self, key: &K, value: &V, policy: UpdatePolicy) -> Result<(), MapError> {
        bpf_map_update_elem(self.fd()?, key, value, policy.flags())
            .map(|_| ())
            .map_err(|e| MapError::from_syscall("bpf_map_update_elem", e))
    }

    pub fn delete_value(&self, key: &K) -> Result<(), MapError> {
        bpf_map_delete_elem(self.fd()?, key)
            .map(|_| ())
            .map_err(|e| MapError::from_syscall("bpf_map_delete_elem", e))
    }

    /// First key in kernel traversal order; `NotFound` on an empty map
    pub fn first_key(&self) -> Result<K, MapError> {
        bpf_map_get_next_key::<K>(self.fd()?, None)
            .map_err(|e| MapError::from_syscall("bpf_map_get_next_key", e))
    }

    /// Successor of `key`; `NotFound` past the last key
    pub fn next_key(&self, key: &K) -> Result<K, MapError> {
        bpf_map_get_next_key(self.fd()?, Some(key))
            .map_err(|e| MapError::from_syscall("bpf_map_get_next_key", e))
    }

    pub fn keys(&self) -> MapKeys<'_, K, V> {
        MapKeys {
            map: self,
            cursor: Cursor::Start,
        }
    }

    /// Calls `f` for each key. A visitor error stops the walk and is returned
    /// as is; rows already visited keep whatever the visitor did to them.
    pub fn iterate<E, F>(&self, mut f: F) -> Result<(), E>
    where
        E: From<MapError>,
        F: FnMut(&K, &Self) -> Result<(), E>,
    {
        for key in self.keys() {
            let key = key?;
            f(&key, self)?;
        }
        Ok(())
    }

    /// Like `iterate`, also handing out the value read for each key
    pub fn iterate_with_value<E, F>(&self, mut f: F) -> Result<(), E>
    where
        E: From<MapError>,
        F: FnMut(&K, &V, &Self) -> Result<(), E>,
    {
        for key in self.keys() {
            let key = key?;
            let value = self.read_value(&key)?;
            f(&key, &value, self)?;
        }
        Ok(())
    }

    /// Closes the descriptor and forgets the pin path
    pub fn reset(&mut self) {
        self.fd = None;
        self.pinned_path = None;
    }
}

enum Cursor<K> {
    Start,
    Next(K),
    Failed(MapError),
    Done,
}

/// Lazy key walk over a `TypedMap`, see `TypedMap::keys`
pub struct MapKeys<'a, K, V> {
    map: &'a TypedMap<K, V>,
    cursor: Cursor<K>,
}

impl<K: Pod, V: Pod> Iterator for MapKeys<'_, K, V> {
    type Item = Result<K, MapError>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = match std::mem::replace(&mut self.cursor, Cursor::Done) {
            Cursor::Done => return None,
            Cursor::Failed(e) => return Some(Err(e)),
            Cursor::Start => match self.map.first_key() {
                Ok(key) => key,
                Err(MapError::NotFound) => return None,
                Err(e) => return Some(Err(e)),
            },
            Cursor::Next(key) => key,
        };

        // Advance before yielding so the caller may delete `current`
        self.cursor = match self.map.next_key(&current) {
            Ok(next) => Cursor::Next(next),
            Err(MapError::NotFound) => Cursor::Done,
            Err(e) => Cursor::Failed(e),
        };
        Some(Ok(current))
    }
}
