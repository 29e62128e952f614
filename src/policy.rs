use std::fs::File;
use std::path::Path;

use log::info;
use nix::unistd::{Group, Pid, User};

use crate::Error;

/// Upper bound on compiled filter programs, matching the kernel's
/// `sock_fprog.len` field width.
pub const MAX_FILTER_LEN: usize = u16::MAX as usize;

/// One classic-BPF instruction, layout-compatible with the kernel's
/// `sock_filter`. Produced by the external policy compiler; this crate
/// treats the program as opaque.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FilterInstruction {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

/// Independent feature switches of a [`Policy`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PolicyFlags {
    pub uid: bool,
    pub gid: bool,
    pub caps: bool,
    pub vfs_ns: bool,
    pub pids_ns: bool,
    pub net_ns: bool,
    pub seccomp: bool,
    pub seccomp_filter: bool,
    pub log_seccomp: bool,
    pub readonly_remount: bool,
    pub inherit_groups: bool,
    pub disable_ptrace: bool,
    pub no_new_privs: bool,
    pub chroot: bool,
    pub chdir: bool,
    pub mount_tmp: bool,
    pub stack_limit: bool,
    pub time_limit: bool,
    pub output_limit: bool,
    pub memory_limit: bool,
    pub meta_file: bool,
}

/// A bind-mount directive mapping a host path onto a path inside the
/// chroot. Applied in insertion order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    pub src: String,
    pub dest: String,
    pub writeable: bool,
}

/// Sandbox configuration, built by the host and consumed by exactly one
/// launch. The launch records the first-generation child pid here, so a
/// Policy cannot be reused.
#[derive(Debug, Default)]
pub struct Policy {
    pub(crate) flags: PolicyFlags,
    pub(crate) uid: u32,
    pub(crate) gid: u32,
    pub(crate) usergid: u32,
    pub(crate) user: Option<String>,
    pub(crate) caps: u64,
    pub(crate) init_pid: Option<Pid>,
    pub(crate) chrootdir: Option<String>,
    pub(crate) chdir: Option<String>,
    pub(crate) filter: Option<Vec<FilterInstruction>>,
    pub(crate) bindings: Vec<Binding>,
    pub(crate) stack_limit: u64,
    pub(crate) time_limit_ms: u64,
    pub(crate) memory_limit: u64,
    pub(crate) output_limit: u64,
    pub(crate) meta_file: Option<File>,
}

impl Policy {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn change_uid(&mut self, uid: u32) -> Result<(), Error> {
        if uid == 0 {
            return Err(Error::bad_argument("useless change to uid 0"));
        }
        self.uid = uid;
        self.flags.uid = true;
        Ok(())
    }

    pub fn change_gid(&mut self, gid: u32) -> Result<(), Error> {
        if gid == 0 {
            return Err(Error::bad_argument("useless change to gid 0"));
        }
        self.gid = gid;
        self.flags.gid = true;
        Ok(())
    }

    /// Resolves a user name and targets its uid. Also records the name
    /// and primary gid, which [`Policy::inherit_usergroups`] needs.
    pub fn change_user(&mut self, name: &str) -> Result<(), Error> {
        let user = User::from_name(name)
            .map_err(Error::syscall("getpwnam"))?
            .ok_or_else(|| Error::bad_argument(format!("unknown user: {name}")))?;
        self.change_uid(user.uid.as_raw())?;
        self.user = Some(name.to_owned());
        self.usergid = user.gid.as_raw();
        Ok(())
    }

    /// Resolves a group name and targets its gid.
    pub fn change_group(&mut self, name: &str) -> Result<(), Error> {
        let group = Group::from_name(name)
            .map_err(Error::syscall("getgrnam"))?
            .ok_or_else(|| Error::bad_argument(format!("unknown group: {name}")))?;
        self.change_gid(group.gid.as_raw())
    }

    /// Enables legacy strict-mode seccomp. Installed after everything
    /// else, since strict mode blocks nearly all further syscalls.
    pub fn use_seccomp(&mut self) {
        self.flags.seccomp = true;
    }

    pub fn no_new_privs(&mut self) {
        self.flags.no_new_privs = true;
    }

    /// Installs a compiled seccomp-BPF program for the target.
    pub fn use_seccomp_filter(&mut self, program: Vec<FilterInstruction>) -> Result<(), Error> {
        if program.len() > MAX_FILTER_LEN {
            return Err(Error::bad_argument(format!(
                "filter program too long: {} instructions",
                program.len()
            )));
        }
        self.filter = Some(program);
        self.flags.seccomp_filter = true;
        Ok(())
    }

    /// Logs blocked syscalls via a `SIGSYS` handler. Filter policies
    /// must return a trapping action for the handler to run.
    pub fn log_seccomp_failures(&mut self) {
        self.flags.log_seccomp = true;
    }

    /// Keeps only the capabilities whose bit is set in `capmask`.
    pub fn use_caps(&mut self, capmask: u64) {
        self.caps = capmask;
        self.flags.caps = true;
    }

    pub fn namespace_vfs(&mut self) {
        self.flags.vfs_ns = true;
    }

    /// A pid namespace needs its own read-only `/proc` so the jailed
    /// tree cannot observe the host's processes.
    pub fn namespace_pids(&mut self) {
        self.flags.vfs_ns = true;
        self.flags.readonly_remount = true;
        self.flags.pids_ns = true;
    }

    pub fn namespace_net(&mut self) {
        self.flags.net_ns = true;
    }

    pub fn remount_readonly(&mut self) {
        self.flags.vfs_ns = true;
        self.flags.readonly_remount = true;
    }

    /// Inherits supplementary groups of the named user instead of
    /// clearing them. Requires [`Policy::change_user`].
    pub fn inherit_usergroups(&mut self) {
        self.flags.inherit_groups = true;
    }

    /// Marks ptrace as denied. Enforcement lives in the compiled
    /// seccomp policy; the flag only crosses the wire.
    pub fn disable_ptrace(&mut self) {
        self.flags.disable_ptrace = true;
    }

    pub fn enter_chroot(&mut self, dir: &str) -> Result<(), Error> {
        if self.chrootdir.is_some() {
            return Err(Error::bad_argument("chroot directory already set"));
        }
        self.chrootdir = Some(dir.to_owned());
        self.flags.chroot = true;
        Ok(())
    }

    /// Mounts a tmpfs at `/tmp` inside the chroot.
    pub fn mount_tmp(&mut self) {
        self.flags.mount_tmp = true;
    }

    /// Working directory inside the jail; must be absolute and requires
    /// an already-configured chroot.
    pub fn chroot_chdir(&mut self, dir: &str) -> Result<(), Error> {
        if self.chrootdir.is_none() {
            return Err(Error::bad_argument("chdir requires a chroot"));
        }
        if self.chdir.is_some() {
            return Err(Error::bad_argument("chdir already set"));
        }
        if !dir.starts_with('/') {
            return Err(Error::bad_argument(format!("chdir is not absolute: {dir}")));
        }
        self.chdir = Some(dir.to_owned());
        self.flags.chdir = true;
        Ok(())
    }

    /// Appends a bind mount. `dest` names a path inside the chroot and
    /// must be absolute. Forces a vfs namespace so the mounts cannot
    /// leak into the host.
    pub fn bind(&mut self, src: &str, dest: &str, writeable: bool) -> Result<(), Error> {
        if !dest.starts_with('/') {
            return Err(Error::bad_argument(format!(
                "bind dest is not absolute: {dest}"
            )));
        }
        info!("bind {src} -> {dest}");
        self.namespace_vfs();
        self.bindings.push(Binding {
            src: src.to_owned(),
            dest: dest.to_owned(),
            writeable,
        });
        Ok(())
    }

    pub fn stack_limit(&mut self, bytes: u64) {
        self.flags.stack_limit = true;
        self.stack_limit = bytes;
    }

    pub fn time_limit(&mut self, msec: u64) {
        self.flags.time_limit = true;
        self.time_limit_ms = msec;
    }

    pub fn output_limit(&mut self, bytes: u64) {
        self.flags.output_limit = true;
        self.output_limit = bytes;
    }

    pub fn memory_limit(&mut self, bytes: u64) {
        self.flags.memory_limit = true;
        self.memory_limit = bytes;
    }

    /// Opens `path` for writing; the init supervisor reports usage and
    /// exit disposition there after the run.
    pub fn meta_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), Error> {
        self.meta_file = Some(File::create(path)?);
        self.flags.meta_file = true;
        Ok(())
    }

    pub fn flags(&self) -> &PolicyFlags {
        &self.flags
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    pub fn usergid(&self) -> u32 {
        self.usergid
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn caps_mask(&self) -> u64 {
        self.caps
    }

    pub fn chrootdir(&self) -> Option<&str> {
        self.chrootdir.as_deref()
    }

    pub fn chdir_in_jail(&self) -> Option<&str> {
        self.chdir.as_deref()
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn filter(&self) -> Option<&[FilterInstruction]> {
        self.filter.as_deref()
    }

    pub fn stack_limit_bytes(&self) -> u64 {
        self.stack_limit
    }

    pub fn time_limit_msec(&self) -> u64 {
        self.time_limit_ms
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit
    }

    pub fn output_limit_bytes(&self) -> u64 {
        self.output_limit
    }

    /// Pid of the first-generation child, populated by a launch.
    pub fn init_pid(&self) -> Option<Pid> {
        self.init_pid
    }

    /// Strips flags meant for the parent side of `execve`. Called by
    /// the preload helper on the policy it reads from the pipe: these
    /// steps either happened before the exec or do not apply to an
    /// already-running process.
    pub fn preenter(&mut self) {
        self.flags.vfs_ns = false;
        self.flags.readonly_remount = false;
        self.flags.pids_ns = false;
        self.flags.chroot = false;
    }

    /// Strips flags meant for the child side of `execve`, keeping only
    /// what survives the exec or is re-applied by the preload helper.
    pub fn preexec(&mut self) {
        let vfs_ns = self.flags.vfs_ns;
        let readonly_remount = self.flags.readonly_remount;
        let stack_limit = self.flags.stack_limit;
        let time_limit = self.flags.time_limit;
        let memory_limit = self.flags.memory_limit;
        let output_limit = self.flags.output_limit;
        let meta_file = self.flags.meta_file;
        self.user = None;
        self.flags = PolicyFlags::default();
        // Note, `pids_ns` will already have been used before this call.
        self.flags.vfs_ns = vfs_ns;
        self.flags.readonly_remount = readonly_remount;
        self.flags.stack_limit = stack_limit;
        self.flags.time_limit = time_limit;
        self.flags.memory_limit = memory_limit;
        self.flags.output_limit = output_limit;
        self.flags.meta_file = meta_file;
    }
}

/// Field-wise equality, ignoring the meta sink: file handles are
/// transient and rebuilt on the receiving side of the marshaller.
impl PartialEq for Policy {
    fn eq(&self, other: &Self) -> bool {
        self.flags == other.flags
            && self.uid == other.uid
            && self.gid == other.gid
            && self.usergid == other.usergid
            && self.user == other.user
            && self.caps == other.caps
            && self.init_pid == other.init_pid
            && self.chrootdir == other.chrootdir
            && self.chdir == other.chdir
            && self.filter == other.filter
            && self.bindings == other.bindings
            && self.stack_limit == other.stack_limit
            && self.time_limit_ms == other.time_limit_ms
            && self.memory_limit == other.memory_limit
            && self.output_limit == other.output_limit
    }
}
