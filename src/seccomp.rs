use log::warn;
use nix::errno::Errno;
use nix::libc::{c_int, c_uint, c_ulong, c_ushort, c_void, siginfo_t};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::{syscall, Error, FilterInstruction, Policy};

#[repr(C)]
struct SockFprog {
    len: c_ushort,
    filter: *const FilterInstruction,
}

/// SIGSYS member of the kernel's siginfo union. libc exposes no
/// `si_syscall` accessor, so the handler reads this layout directly.
#[repr(C)]
struct SigsysInfo {
    _signo: c_int,
    _errno: c_int,
    _code: c_int,
    #[cfg(target_pointer_width = "64")]
    _pad: c_int,
    _call_addr: *mut c_void,
    syscall: c_int,
    _arch: c_uint,
}

/// Logs the blocked syscall number and dies. Only async-signal-safe
/// operations: a stack buffer and a raw write to stderr.
extern "C" fn sigsys_handler(_signo: c_int, info: *mut siginfo_t, _context: *mut c_void) {
    let nr = unsafe { (*info.cast::<SigsysInfo>()).syscall };
    let mut buf = [0; 40];
    let mut pos = 0;
    for &b in b"blocked syscall: " {
        buf[pos] = b;
        pos += 1;
    }
    let mut digits = [0; 10];
    let mut ndigits = 0;
    let mut value = if nr < 0 { 0 } else { nr as u32 };
    loop {
        digits[ndigits] = b'0' + (value % 10) as u8;
        ndigits += 1;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    while ndigits > 0 {
        ndigits -= 1;
        buf[pos] = digits[ndigits];
        pos += 1;
    }
    buf[pos] = b'\n';
    pos += 1;
    syscall::raw_write_stderr(&buf[..pos]);
    unsafe { nix::libc::_exit(1) }
}

pub(crate) fn install_sigsys_handler() -> Result<(), Error> {
    let action = SigAction::new(
        SigHandler::SigAction(sigsys_handler),
        SaFlags::SA_SIGINFO,
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGSYS, &action) }.map_err(Error::syscall("sigaction"))?;
    Ok(())
}

fn install_filter(program: &[FilterInstruction]) -> Result<(), Error> {
    let fprog = SockFprog {
        len: program.len() as c_ushort,
        filter: program.as_ptr(),
    };
    let res = unsafe {
        nix::libc::prctl(
            nix::libc::PR_SET_SECCOMP,
            nix::libc::SECCOMP_MODE_FILTER as c_ulong,
            &fprog as *const SockFprog,
        )
    };
    Errno::result(res)
        .map(drop)
        .map_err(Error::syscall("prctl(PR_SET_SECCOMP, SECCOMP_MODE_FILTER)"))
}

/// Arms `no_new_privs`, the optional SIGSYS logger, and the compiled
/// filter, in that order. With `no_new_privs` set a later `execve`
/// cannot gain privileges, so filter policies need not allow the
/// identity-changing syscalls.
pub(crate) fn set_seccomp_filter(policy: &Policy) -> Result<(), Error> {
    if policy.flags.no_new_privs {
        nix::sys::prctl::set_no_new_privs().map_err(Error::syscall("prctl(PR_SET_NO_NEW_PRIVS)"))?;
    }
    if policy.flags.seccomp_filter && policy.flags.log_seccomp {
        install_sigsys_handler()?;
        warn!("logging seccomp filter failures");
    }
    if policy.flags.seccomp_filter {
        let program = policy
            .filter
            .as_deref()
            .ok_or_else(|| Error::bad_argument("seccomp filter enabled without a program"))?;
        install_filter(program)?;
    }
    Ok(())
}
