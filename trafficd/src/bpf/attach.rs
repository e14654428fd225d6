// Wiring loaded programs to their enforcement points

use std::fs;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use super::loader::{
    CGROUP_EGRESS_SECTION, CGROUP_INGRESS_SECTION, ProgramError, ProgramObject,
    XT_EGRESS_SECTION, XT_INGRESS_SECTION, load_program, patch_map_fds,
};
use super::map::{MapError, path_to_cstring};
use super::pin::MapRegistry;
use crate::sys::{
    BPF_CGROUP_INET_EGRESS, BPF_CGROUP_INET_INGRESS, BPF_PROG_TYPE_CGROUP_SKB,
    BPF_PROG_TYPE_SOCKET_FILTER, bpf_obj_get, bpf_obj_pin, bpf_prog_attach, bpf_prog_detach,
};

/// The four kernel hooks the controller drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    CgroupIngress,
    CgroupEgress,
    XtIngress,
    XtEgress,
}

impl Hook {
    pub const ALL: [Hook; 4] = [
        Hook::CgroupIngress,
        Hook::CgroupEgress,
        Hook::XtIngress,
        Hook::XtEgress,
    ];

    pub fn section(self) -> &'static str {
        match self {
            Hook::CgroupIngress => CGROUP_INGRESS_SECTION,
            Hook::CgroupEgress => CGROUP_EGRESS_SECTION,
            Hook::XtIngress => XT_INGRESS_SECTION,
            Hook::XtEgress => XT_EGRESS_SECTION,
        }
    }

    pub fn pin_name(self) -> &'static str {
        match self {
            Hook::CgroupIngress => "ingress_prog",
            Hook::CgroupEgress => "egress_prog",
            Hook::XtIngress => "xt_bpf_ingress_prog",
            Hook::XtEgress => "xt_bpf_egress_prog",
        }
    }

    pub fn prog_type(self) -> u32 {
        match self {
            Hook::CgroupIngress | Hook::CgroupEgress => BPF_PROG_TYPE_CGROUP_SKB,
            Hook::XtIngress | Hook::XtEgress => BPF_PROG_TYPE_SOCKET_FILTER,
        }
    }

    /// cgroup attach type, or None for hooks consumed through their pin
    pub fn cgroup_attach_type(self) -> Option<u32> {
        match self {
            Hook::CgroupIngress => Some(BPF_CGROUP_INET_INGRESS),
            Hook::CgroupEgress => Some(BPF_CGROUP_INET_EGRESS),
            Hook::XtIngress | Hook::XtEgress => None,
        }
    }
}

impl std::fmt::Display for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.section())
    }
}

/// Where a hook stands for this process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookState {
    NotLoaded,
    Attached,
    Failed(String),
}

/// Loads, pins and attaches programs for the controller's hooks
pub struct ProgramAttacher<'a> {
    registry: &'a MapRegistry,
    cgroup_root: PathBuf,
}

impl<'a> ProgramAttacher<'a> {
    pub fn new(registry: &'a MapRegistry, cgroup_root: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            cgroup_root: cgroup_root.into(),
        }
    }

    /// Makes `hook` active. A program already pinned for the hook is reused;
    /// otherwise the section is patched with `maps`, loaded and pinned.
    pub fn install(
        &self,
        hook: Hook,
        object: Option<&ProgramObject>,
        maps: &[(u64, RawFd)],
    ) -> Result<(), ProgramError> {
        let prog_path = self.registry.prog_path(hook);
        let prog_fd = match self.pinned_program(&prog_path)? {
            Some(fd) => {
                log::info!("Reusing pinned program {}", prog_path.display());
                fd
            }
            None => {
                let object = object.ok_or(ProgramError::NoObject(hook.section()))?;
                let mut insns = object.section(hook.section())?.to_vec();
                let patched = patch_map_fds(&mut insns, maps);
                log::debug!("Patched {} map references in {}", patched, hook);

                let fd = load_program(hook.prog_type(), hook.section(), &insns, object.license())?;
                pin_program(fd.as_fd(), &prog_path)?;
                fd
            }
        };

        if let Some(attach_type) = hook.cgroup_attach_type() {
            self.attach_to_cgroup(prog_fd.as_fd(), attach_type)?;
        }

        log::info!("✅ {} active", hook);
        Ok(())
    }

    fn pinned_program(&self, path: &Path) -> Result<Option<OwnedFd>, ProgramError> {
        let c_path = path_to_cstring(path)?;
        match bpf_obj_get(&c_path) {
            Ok(fd) => Ok(Some(fd)),
            Err((_, e)) if e.raw_os_error() == Some(libc::ENOENT) => Ok(None),
            Err((code, io_error)) => Err(ProgramError::Map(MapError::SyscallError {
                call: "bpf_obj_get",
                code,
                io_error,
            })),
        }
    }

    /// Attaches to the cgroup root, first clearing whatever a previous
    /// incarnation of the daemon left on the same attach point
    fn attach_to_cgroup(&self, prog_fd: BorrowedFd<'_>, attach_type: u32) -> Result<(), ProgramError> {
        let cgroup = fs::File::open(&self.cgroup_root).map_err(|source| ProgramError::Cgroup {
            path: self.cgroup_root.clone(),
            source,
        })?;

        match bpf_prog_detach(cgroup.as_fd(), attach_type) {
            Ok(_) => log::debug!(
                "Detached stale program from {} (attach type {})",
                self.cgroup_root.display(),
                attach_type
            ),
            Err((_, e)) => log::debug!(
                "Nothing to detach from {} (attach type {}): {}",
                self.cgroup_root.display(),
                attach_type,
                e
            ),
        }

        bpf_prog_attach(prog_fd, cgroup.as_fd(), attach_type).map_err(|(_, io_error)| {
            log::error!(
                "bpf_prog_attach failed: {} (errno: {:?})",
                io_error,
                io_error.raw_os_error()
            );
            ProgramError::Attach {
                path: self.cgroup_root.clone(),
                io_error,
            }
        })?;
        Ok(())
    }
}

fn pin_program(fd: BorrowedFd<'_>, path: &Path) -> Result<(), ProgramError> {
    let c_path = path_to_cstring(path)?;
    bpf_obj_pin(fd, &c_path).map_err(|(_, io_error)| ProgramError::Pin {
        path: path.to_path_buf(),
        io_error,
    })?;
    Ok(())
}
