use std::fs::File;

use nix::errno::Errno;
use nix::libc::{c_int, c_ulong};

use crate::Error;

pub type Pid = nix::unistd::Pid;

#[repr(C, align(8))]
#[derive(Debug, Default)]
pub(crate) struct CloneArgs {
    pub flags: u64,
    pub pidfd: u64,
    pub child_tid: u64,
    pub parent_tid: u64,
    pub exit_signal: u64,
    pub stack: u64,
    pub stack_size: u64,
    pub tls: u64,
    pub set_tid: u64,
    pub set_tid_size: u64,
    pub cgroup: u64,
}

impl CloneArgs {
    pub fn flag_newpid(&mut self) {
        self.flags |= nix::libc::CLONE_NEWPID as u64;
    }

    pub fn exit_signal(&mut self, signal: c_int) {
        self.exit_signal = signal as u64;
    }
}

pub(crate) enum CloneResult {
    Child,
    Parent { child: Pid },
}

pub(crate) unsafe fn clone3(cl_args: &CloneArgs) -> Result<CloneResult, Errno> {
    let res = nix::libc::syscall(
        nix::libc::SYS_clone3,
        cl_args as *const CloneArgs,
        core::mem::size_of::<CloneArgs>(),
    );
    Errno::result(res).map(|v| match v {
        0 => CloneResult::Child,
        v => CloneResult::Parent {
            child: Pid::from_raw(v as nix::libc::pid_t),
        },
    })
}

pub(crate) struct Pipe {
    pub rx: File,
    pub tx: File,
}

pub(crate) fn new_pipe() -> Result<Pipe, Error> {
    let (rx, tx) = nix::unistd::pipe().map_err(Error::syscall("pipe"))?;
    Ok(Pipe {
        rx: File::from(rx),
        tx: File::from(tx),
    })
}

/// Reaps any child, recording its resource usage. Returns `None` once
/// no children remain.
pub(crate) fn wait_any(usage: &mut nix::libc::rusage) -> Option<(Pid, c_int)> {
    let mut status = 0;
    let res = unsafe { nix::libc::wait4(-1, &mut status, 0, usage) };
    if res > 0 {
        Some((Pid::from_raw(res), status))
    } else {
        None
    }
}

pub(crate) fn set_securebits(bits: c_ulong) -> Result<(), Errno> {
    let res = unsafe {
        nix::libc::prctl(
            nix::libc::PR_SET_SECUREBITS,
            bits,
            0 as c_ulong,
            0 as c_ulong,
            0 as c_ulong,
        )
    };
    Errno::result(res).map(drop)
}

/// Legacy strict-mode seccomp. Blocks everything except read, write,
/// exit and sigreturn from here on.
pub(crate) fn set_seccomp_strict() -> Result<(), Errno> {
    let res = unsafe {
        nix::libc::prctl(
            nix::libc::PR_SET_SECCOMP,
            nix::libc::SECCOMP_MODE_STRICT as c_ulong,
            0 as c_ulong,
            0 as c_ulong,
            0 as c_ulong,
        )
    };
    Errno::result(res).map(drop)
}

pub(crate) fn ualarm(usecs: u32) {
    let new_value = nix::libc::itimerval {
        it_interval: nix::libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
        it_value: nix::libc::timeval {
            tv_sec: (usecs / 1_000_000) as nix::libc::time_t,
            tv_usec: (usecs % 1_000_000) as nix::libc::suseconds_t,
        },
    };
    unsafe { nix::libc::setitimer(nix::libc::ITIMER_REAL, &new_value, core::ptr::null_mut()) };
}

/// Signal-handler-safe write to stderr.
pub(crate) fn raw_write_stderr(buf: &[u8]) {
    unsafe { nix::libc::write(2, buf.as_ptr().cast(), buf.len()) };
}
