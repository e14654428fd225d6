// Raw kernel entry points
//
// Everything that talks to the bpf(2) syscall or reads a socket cookie goes
// through `syscall()`, so tests can swap the kernel for an in-memory fake.

mod bpf;
#[cfg(test)]
pub(crate) mod fake;

pub(crate) use bpf::*;

use std::io;
use std::os::fd::RawFd;

#[cfg(test)]
use std::cell::RefCell;

/// Result of a raw syscall: the return value, or the return value and errno
pub(crate) type SysResult = Result<i64, (i64, io::Error)>;

pub(crate) enum Syscall<'a> {
    Bpf {
        cmd: u32,
        attr: &'a mut bpf_attr,
    },
    SockCookie {
        fd: RawFd,
    },
}

impl std::fmt::Debug for Syscall<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Syscall::Bpf { cmd, .. } => f.debug_struct("Bpf").field("cmd", cmd).finish(),
            Syscall::SockCookie { fd } => f.debug_struct("SockCookie").field("fd", fd).finish(),
        }
    }
}

#[cfg(test)]
type SyscallFn = Box<dyn FnMut(Syscall<'_>) -> SysResult>;

#[cfg(test)]
thread_local! {
    static TEST_SYSCALL: RefCell<Option<SyscallFn>> = RefCell::new(None);
}

/// Routes this thread's syscalls to `call` until `reset_syscall` is called
#[cfg(test)]
pub(crate) fn override_syscall(call: impl FnMut(Syscall<'_>) -> SysResult + 'static) {
    TEST_SYSCALL.with(|test_impl| *test_impl.borrow_mut() = Some(Box::new(call)));
}

#[cfg(test)]
pub(crate) fn reset_syscall() {
    TEST_SYSCALL.with(|test_impl| *test_impl.borrow_mut() = None);
}

pub(crate) fn syscall(call: Syscall<'_>) -> SysResult {
    #[cfg(test)]
    return TEST_SYSCALL.with(move |test_impl| match test_impl.borrow_mut().as_mut() {
        Some(f) => f(call),
        None => real_syscall(call),
    });

    #[cfg(not(test))]
    real_syscall(call)
}

fn real_syscall(call: Syscall<'_>) -> SysResult {
    let ret = match call {
        Syscall::Bpf { cmd, attr } => unsafe {
            libc::syscall(
                libc::SYS_bpf,
                cmd,
                attr as *mut bpf_attr as *mut libc::c_void,
                std::mem::size_of::<bpf_attr>(),
            )
        },
        Syscall::SockCookie { fd } => {
            let mut cookie: u64 = 0;
            let mut len = std::mem::size_of::<u64>() as libc::socklen_t;
            let ret = unsafe {
                libc::getsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_COOKIE,
                    &mut cookie as *mut u64 as *mut libc::c_void,
                    &mut len,
                )
            };
            if ret == 0 {
                return Ok(cookie as i64);
            }
            ret as i64
        }
    };

    if ret < 0 {
        return Err((ret, io::Error::last_os_error()));
    }
    Ok(ret)
}
