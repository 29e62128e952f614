use std::convert::Infallible;
use std::env;
use std::ffi::CString;
use std::fs::File;
use std::mem;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStringExt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI32, Ordering};

use log::{error, info, warn};
use nix::libc::{c_int, WEXITSTATUS, WIFEXITED, WIFSIGNALED, WTERMSIG};
use nix::sys::signal::{kill, signal, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::time::{clock_gettime, ClockId};
use nix::unistd::{alarm, dup2, execve, fork, setsid, ForkResult, Pid};

use crate::meta::{Disposition, Meta};
use crate::syscall::{clone3, new_pipe, wait_any, CloneArgs, CloneResult, Pipe};
use crate::{jail, limits, mounts, Error, Policy};

/// Exit code surfaced by [`Policy::wait`] when the target was killed by
/// a seccomp violation.
pub const ERR_JAIL: i32 = 254;
/// Exit code surfaced when the init supervisor failed, or the target
/// was taken out by a signal or the time limit.
pub const ERR_INIT: i32 = 250;

/// Absolute path of the preload helper appended to `LD_PRELOAD` for
/// dynamically linked targets.
pub const PRELOAD_PATH: &str = "/usr/lib/libjailboxpreload.so";
/// Environment variable carrying the policy-pipe read fd, as ASCII
/// decimal, to the preload helper.
pub const POLICY_FD_ENV: &str = "JAILBOX_POLICY_FD";

const LD_PRELOAD_ENV: &str = "LD_PRELOAD";

/// How the first-generation child is created. Pid namespaces need a
/// raw `clone3`; everything else forks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpawnMode {
    Fork,
    ClonePidNs,
}

/// Parent-side ends of the requested stdio pipes.
#[derive(Debug, Default)]
pub struct StdioPipes {
    pub stdin: Option<File>,
    pub stdout: Option<File>,
    pub stderr: Option<File>,
}

struct ChildStdio {
    stdin: Option<Pipe>,
    stdout: Option<Pipe>,
    stderr: Option<Pipe>,
}

enum ChildMode {
    /// Preload handshake; limits and post-exec flags are re-applied by
    /// the helper inside the target.
    Dynamic,
    /// No helper will run inside the target: everything including the
    /// resource limits is applied before exec.
    Static,
}

struct ExecImage {
    filename: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
}

/// Prepares all exec arguments up front: after a raw clone the child
/// must stay clear of allocating libc calls until exec.
fn exec_image(target: &str, argv: &[&str]) -> Result<ExecImage, Error> {
    let filename =
        CString::new(target).map_err(|_| Error::bad_argument("target path contains NUL"))?;
    let argv = Result::<Vec<_>, _>::from_iter(argv.iter().map(|v| CString::new(*v)))
        .map_err(|_| Error::bad_argument("argument contains NUL"))?;
    let mut envp = Vec::new();
    for (key, value) in env::vars_os() {
        let mut entry = key.into_vec();
        entry.push(b'=');
        entry.extend(value.into_vec());
        envp.push(
            CString::new(entry).map_err(|_| Error::bad_argument("environment contains NUL"))?,
        );
    }
    Ok(ExecImage {
        filename,
        argv,
        envp,
    })
}

fn spawn(mode: SpawnMode) -> Result<CloneResult, Error> {
    match mode {
        SpawnMode::Fork => match unsafe { fork() }.map_err(Error::syscall("fork"))? {
            ForkResult::Child => Ok(CloneResult::Child),
            ForkResult::Parent { child } => Ok(CloneResult::Parent { child }),
        },
        // Bypassing libc's fork wrappers is only safe because the
        // child execs right away; with other threads around, libc
        // locks may be held by owners that were not cloned.
        SpawnMode::ClonePidNs => {
            let mut args = CloneArgs::default();
            args.flag_newpid();
            args.exit_signal(nix::libc::SIGCHLD);
            unsafe { clone3(&args) }.map_err(Error::syscall("clone3"))
        }
    }
}

/// Appends the preload helper to `LD_PRELOAD` and publishes the policy
/// pipe's read end for it. The child inherits this environment; the
/// parent restores its own copy after the fork.
fn setup_preload(policy_pipe: &Pipe) {
    let mut preload = env::var_os(LD_PRELOAD_ENV).unwrap_or_default();
    if !preload.is_empty() {
        preload.push(" ");
    }
    preload.push(PRELOAD_PATH);
    env::set_var(LD_PRELOAD_ENV, preload);
    env::set_var(POLICY_FD_ENV, policy_pipe.rx.as_raw_fd().to_string());
}

fn restore_preload(saved: Option<std::ffi::OsString>) {
    match saved {
        Some(value) => env::set_var(LD_PRELOAD_ENV, value),
        None => env::remove_var(LD_PRELOAD_ENV),
    }
    env::remove_var(POLICY_FD_ENV);
}

fn fatal_child(result: Result<Infallible, Error>) -> ! {
    if let Err(err) = result {
        error!("cannot launch jailed process: {err}");
    }
    unsafe { nix::libc::_exit(ERR_INIT) }
}

/// Everything the child does between fork and exec. Never returns:
/// either the exec succeeds or the process dies.
fn child_run(
    policy: &mut Policy,
    image: ExecImage,
    stdio: ChildStdio,
    policy_pipe: Option<Pipe>,
    mode: ChildMode,
) -> Result<Infallible, Error> {
    // The preload helper finds the policy pipe by fd number; both ends
    // stay open through exec.
    if let Some(pipe) = policy_pipe {
        mem::forget(pipe);
    }
    if let Some(pipe) = stdio.stdin {
        drop(pipe.tx);
        dup2(pipe.rx.as_raw_fd(), 0).map_err(Error::syscall("dup2"))?;
    }
    if let Some(pipe) = stdio.stdout {
        drop(pipe.rx);
        dup2(pipe.tx.as_raw_fd(), 1).map_err(Error::syscall("dup2"))?;
    }
    if let Some(pipe) = stdio.stderr {
        drop(pipe.rx);
        dup2(pipe.tx.as_raw_fd(), 2).map_err(Error::syscall("dup2"))?;
    }
    let pids_ns = policy.flags.pids_ns;
    let want_chroot = policy.flags.chroot;
    let want_mount_tmp = policy.flags.mount_tmp;
    match mode {
        ChildMode::Dynamic => policy.preexec(),
        // The pid namespace was consumed by the clone; everything else
        // still applies before a static exec.
        ChildMode::Static => policy.flags.pids_ns = false,
    }
    jail::enter(policy)?;
    if pids_ns {
        // This process is pid 1 of the new namespace. Fork once more
        // so the target does not have to know how to be init.
        match unsafe { fork() }.map_err(Error::syscall("fork"))? {
            ForkResult::Parent { child } => init_supervisor(policy, child),
            ForkResult::Child => {}
        }
    }
    // Own process group, so the supervisor can kill the whole tree.
    setsid().map_err(Error::syscall("setsid"))?;
    if want_chroot && !policy.flags.chroot {
        // enter() skipped the chroot because preexec stripped the
        // flag; it happens here, after the init fork.
        mounts::enter_chroot(policy)?;
        if want_mount_tmp {
            mounts::mount_tmp()?;
        }
    }
    if let ChildMode::Static = mode {
        limits::setup_limits(policy)?;
        policy.meta_file = None;
    }
    Ok(execve(&image.filename, &image.argv, &image.envp).map_err(Error::syscall("execve"))?)
}

// Signal handlers cannot carry context; the init supervisor parks its
// state here before arming them.
static INIT_EXITSTATUS: AtomicI32 = AtomicI32::new(0);
static CHILD_PID: AtomicI32 = AtomicI32::new(0);
static SIGNAL_OVERRIDE: AtomicI32 = AtomicI32::new(0);

extern "C" fn init_term(_signo: c_int) {
    unsafe { nix::libc::_exit(INIT_EXITSTATUS.load(Ordering::Relaxed)) }
}

extern "C" fn init_timeout(_signo: c_int) {
    // Something went wrong or the target ignored its own SIGALRM.
    SIGNAL_OVERRIDE.store(nix::libc::SIGXCPU, Ordering::Relaxed);
    let pid = CHILD_PID.load(Ordering::Relaxed);
    unsafe { nix::libc::kill(-pid, nix::libc::SIGKILL) };
}

/// Pid 1 of a pid-namespaced run: reaps every process in the
/// namespace, remembers the target's status, reports usage to the meta
/// sink and exits with the mapped status. Never returns.
fn init_supervisor(policy: &mut Policy, rootpid: Pid) -> ! {
    let start = policy
        .flags
        .meta_file
        .then(|| clock_gettime(ClockId::CLOCK_MONOTONIC).ok())
        .flatten();
    if policy.flags.time_limit {
        CHILD_PID.store(rootpid.as_raw(), Ordering::Relaxed);
        let _ = unsafe { signal(Signal::SIGALRM, SigHandler::Handler(init_timeout)) };
        // One wall-second of slack past the rlimit CPU budget.
        let _ = alarm::set((policy.time_limit_ms.div_ceil(1000) + 1) as u32);
    }
    // Exit with the target's status if someone terminates us.
    let _ = unsafe { signal(Signal::SIGTERM, SigHandler::Handler(init_term)) };
    let mut usage: nix::libc::rusage = unsafe { mem::zeroed() };
    // The loop only ends when no processes remain in the namespace or
    // a signal takes us out.
    while let Some((pid, status)) = wait_any(&mut usage) {
        if pid == rootpid {
            INIT_EXITSTATUS.store(status, Ordering::Relaxed);
        }
    }
    let status = INIT_EXITSTATUS.load(Ordering::Relaxed);
    let mut exit_signal = 0;
    let exit_status;
    let overridden = SIGNAL_OVERRIDE.load(Ordering::Relaxed);
    if overridden != 0 {
        exit_signal = overridden;
        exit_status = ERR_INIT;
    } else if WIFEXITED(status) {
        exit_status = WEXITSTATUS(status);
    } else {
        exit_signal = if WIFSIGNALED(status) {
            WTERMSIG(status)
        } else {
            -1
        };
        // A kill by the time-limit alarm is reported as the canonical
        // time-limit signal.
        if policy.flags.time_limit && exit_signal == nix::libc::SIGALRM {
            exit_signal = nix::libc::SIGXCPU;
        }
        exit_status = ERR_INIT;
    }
    if let (Some(file), Some(start)) = (policy.meta_file.as_mut(), start) {
        let wall = clock_gettime(ClockId::CLOCK_MONOTONIC).unwrap_or(start) - start;
        let meta = Meta {
            time_us: 1_000_000 * usage.ru_utime.tv_sec as i64 + usage.ru_utime.tv_usec as i64,
            time_wall_us: (1_000_000_000 * wall.tv_sec() as i64 + wall.tv_nsec() as i64) / 1000,
            mem_bytes: usage.ru_maxrss as i64 * 1024,
            disposition: if exit_signal != 0 {
                Disposition::Signal(exit_signal)
            } else {
                Disposition::Status(exit_status)
            },
        };
        let _ = meta.write_to(&mut *file);
    }
    policy.meta_file = None;
    if exit_signal == nix::libc::SIGSYS {
        warn!("illegal syscall");
    } else {
        info!("normal exit");
    }
    unsafe { nix::libc::_exit(exit_status) }
}

fn exit_code(pid: Pid, status: WaitStatus) -> Result<i32, Error> {
    match status {
        WaitStatus::Exited(_, code) => {
            if code != 0 {
                info!("child process {pid} exited with status {code}");
            }
            Ok(code)
        }
        WaitStatus::Signaled(_, sig, _) => {
            warn!("child process {pid} received signal {sig}");
            // SIGSYS means a syscall was cut down by the seccomp
            // filter; everything else maps the way shells do it.
            if sig == Signal::SIGSYS {
                warn!("illegal syscall");
                Ok(ERR_JAIL)
            } else {
                Ok(128 + sig as i32)
            }
        }
        status => Err(Error::InitFailure(format!(
            "unexpected wait status: {status:?}"
        ))),
    }
}

/// Maps a [`Policy::wait`] exit code onto the error taxonomy, for
/// hosts that treat jail violations and supervisor failures as errors.
pub fn check_exit(code: i32) -> Result<i32, Error> {
    match code {
        ERR_JAIL => Err(Error::JailViolated),
        ERR_INIT => Err(Error::InitFailure(
            "init supervisor failed or timed out".into(),
        )),
        code => Ok(code),
    }
}

impl Policy {
    /// Launches a dynamically linked target under this policy. The
    /// preload helper finishes jail setup inside the target after
    /// exec; see [`Policy::run_static`] for targets it cannot enter.
    pub fn run(&mut self, target: &str, argv: &[&str]) -> Result<Pid, Error> {
        let (pid, _) = self.run_with_pipes(target, argv, false, false, false)?;
        Ok(pid)
    }

    /// Like [`Policy::run`], additionally wiring a pipe over each
    /// requested stdio stream and returning the parent-side ends.
    pub fn run_with_pipes(
        &mut self,
        target: &str,
        argv: &[&str],
        want_stdin: bool,
        want_stdout: bool,
        want_stderr: bool,
    ) -> Result<(Pid, StdioPipes), Error> {
        if self.init_pid.is_some() {
            return Err(Error::bad_argument("policy was already launched"));
        }
        let saved_preload = env::var_os(LD_PRELOAD_ENV);
        let policy_pipe = new_pipe()?;
        setup_preload(&policy_pipe);
        let stdin_pipe = if want_stdin { Some(new_pipe()?) } else { None };
        let stdout_pipe = if want_stdout { Some(new_pipe()?) } else { None };
        let stderr_pipe = if want_stderr { Some(new_pipe()?) } else { None };
        let image = exec_image(target, argv)?;
        let mode = if self.flags.pids_ns {
            SpawnMode::ClonePidNs
        } else {
            SpawnMode::Fork
        };
        match spawn(mode)? {
            CloneResult::Child => {
                let stdio = ChildStdio {
                    stdin: stdin_pipe,
                    stdout: stdout_pipe,
                    stderr: stderr_pipe,
                };
                match catch_unwind(AssertUnwindSafe(move || {
                    child_run(self, image, stdio, Some(policy_pipe), ChildMode::Dynamic)
                })) {
                    Ok(result) => fatal_child(result),
                    Err(_) => unsafe { nix::libc::_exit(ERR_INIT) },
                }
            }
            CloneResult::Parent { child } => {
                restore_preload(saved_preload);
                self.init_pid = Some(child);
                // Send the marshalled policy; closing the write end
                // marks its end with EOF.
                drop(policy_pipe.rx);
                if let Err(err) = self.write_to(&policy_pipe.tx) {
                    let _ = kill(child, Signal::SIGKILL);
                    return Err(err);
                }
                drop(policy_pipe.tx);
                let mut pipes = StdioPipes::default();
                if let Some(pipe) = stdin_pipe {
                    drop(pipe.rx);
                    pipes.stdin = Some(pipe.tx);
                }
                if let Some(pipe) = stdout_pipe {
                    drop(pipe.tx);
                    pipes.stdout = Some(pipe.rx);
                }
                if let Some(pipe) = stderr_pipe {
                    drop(pipe.tx);
                    pipes.stderr = Some(pipe.rx);
                }
                Ok((child, pipes))
            }
        }
    }

    /// Launches a statically linked target: no preload handshake, the
    /// whole policy including resource limits applies before exec.
    /// Capability masks need the helper and are rejected here.
    pub fn run_static(&mut self, target: &str, argv: &[&str]) -> Result<Pid, Error> {
        if self.init_pid.is_some() {
            return Err(Error::bad_argument("policy was already launched"));
        }
        if self.flags.caps {
            return Err(Error::bad_argument(
                "capability masks are not supported with static targets",
            ));
        }
        let image = exec_image(target, argv)?;
        let mode = if self.flags.pids_ns {
            SpawnMode::ClonePidNs
        } else {
            SpawnMode::Fork
        };
        match spawn(mode)? {
            CloneResult::Child => {
                let stdio = ChildStdio {
                    stdin: None,
                    stdout: None,
                    stderr: None,
                };
                match catch_unwind(AssertUnwindSafe(move || {
                    child_run(self, image, stdio, None, ChildMode::Static)
                })) {
                    Ok(result) => fatal_child(result),
                    Err(_) => unsafe { nix::libc::_exit(ERR_INIT) },
                }
            }
            CloneResult::Parent { child } => {
                self.init_pid = Some(child);
                Ok(child)
            }
        }
    }

    /// Waits for the launched process and maps its status: the target's
    /// own exit code, `128 + n` for death by signal `n`, [`ERR_JAIL`]
    /// for a seccomp kill, [`ERR_INIT`] for supervisor failures.
    pub fn wait(&mut self) -> Result<i32, Error> {
        let pid = self
            .init_pid
            .ok_or_else(|| Error::bad_argument("policy has not been launched"))?;
        let status = waitpid(pid, None).map_err(Error::syscall("waitpid"))?;
        exit_code(pid, status)
    }

    /// Terminates the launched process tree and reaps it, returning
    /// the mapped exit code like [`Policy::wait`].
    pub fn kill(&mut self) -> Result<i32, Error> {
        let pid = self
            .init_pid
            .ok_or_else(|| Error::bad_argument("policy has not been launched"))?;
        kill(pid, Signal::SIGTERM).map_err(Error::syscall("kill"))?;
        let status = waitpid(pid, None).map_err(Error::syscall("waitpid"))?;
        exit_code(pid, status)
    }
}
