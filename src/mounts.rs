use nix::mount::{mount, umount, MsFlags};
use nix::unistd::{chdir, chroot};

use crate::{Binding, Error, Policy};

/// Applies the bind mounts in insertion order, then pivots into the
/// chroot and the configured working directory.
pub(crate) fn enter_chroot(policy: &Policy) -> Result<(), Error> {
    let chrootdir = policy
        .chrootdir
        .as_deref()
        .ok_or_else(|| Error::bad_argument("chroot without a directory"))?;
    for binding in &policy.bindings {
        bind_one(chrootdir, binding)?;
    }
    chroot(chrootdir).map_err(Error::syscall("chroot"))?;
    chdir(policy.chdir.as_deref().unwrap_or("/")).map_err(Error::syscall("chdir"))?;
    Ok(())
}

fn bind_one(chrootdir: &str, binding: &Binding) -> Result<(), Error> {
    // dest carries a leading "/".
    let dest = format!("{}{}", chrootdir, binding.dest);
    mount(
        Some(binding.src.as_str()),
        dest.as_str(),
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(Error::syscall("mount"))?;
    if !binding.writeable {
        mount(
            Some(binding.src.as_str()),
            dest.as_str(),
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(Error::syscall("mount"))?;
    }
    Ok(())
}

pub(crate) fn mount_tmp() -> Result<(), Error> {
    mount(
        Some("none"),
        "/tmp",
        Some("tmpfs"),
        MsFlags::empty(),
        Some("size=128M,mode=777"),
    )
    .map_err(Error::syscall("mount"))
}

/// Replaces the inherited `/proc` with a fresh read-only instance.
///
/// The old mount is removed rather than remounted: even in a fresh
/// mount namespace the child still holds the parent's mount object, and
/// `MS_REMOUNT` would mutate the parent's `/proc` as well.
pub(crate) fn remount_readonly(policy: &Policy) -> Result<(), Error> {
    let safe_flags = MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID;
    // Some distros have the JDK mount this. Unmount without erroring out.
    let _ = umount("/proc/sys/fs/binfmt_misc");
    umount("/proc").map_err(Error::syscall("umount"))?;
    let target = match (&policy.chrootdir, policy.flags.chroot) {
        // The chroot already happened in this jail-entry pass.
        (_, true) => "/proc".to_owned(),
        // Stage the mount where a later chroot will surface it as /proc.
        (Some(chrootdir), false) => format!("{chrootdir}/proc"),
        (None, false) => "/proc".to_owned(),
    };
    mount(
        Some(""),
        target.as_str(),
        Some("proc"),
        safe_flags | MsFlags::MS_RDONLY,
        Some(""),
    )
    .map_err(Error::syscall("mount"))
}
