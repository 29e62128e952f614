use nix::sched::{unshare, CloneFlags};

use crate::{creds, mounts, seccomp, syscall, Error, Policy};

/// Applies the policy to the current process, in fixed order.
///
/// The launchers call this in the forked child; a host may also jail
/// itself with it, except under `pids_ns` which needs the extra init
/// fork that only the launchers perform. There is no recovery from a
/// partial privilege drop: on any error the caller must die instead of
/// continuing.
pub fn enter(policy: &Policy) -> Result<(), Error> {
    if policy.flags.pids_ns {
        return Err(Error::bad_argument(
            "cannot enter a pid-namespaced jail in place; use run",
        ));
    }
    if policy.flags.inherit_groups && policy.user.is_none() {
        return Err(Error::bad_argument("usergroup inheritance without username"));
    }
    if policy.flags.vfs_ns {
        unshare(CloneFlags::CLONE_NEWNS).map_err(Error::syscall("unshare(CLONE_NEWNS)"))?;
    }
    if policy.flags.net_ns {
        unshare(CloneFlags::CLONE_NEWNET).map_err(Error::syscall("unshare(CLONE_NEWNET)"))?;
    }
    if policy.flags.chroot {
        mounts::enter_chroot(policy)?;
    }
    if policy.flags.chroot && policy.flags.mount_tmp {
        mounts::mount_tmp()?;
    }
    if policy.flags.readonly_remount {
        mounts::remount_readonly(policy)?;
    }
    if policy.flags.caps {
        creds::lock_securebits()?;
    }
    if policy.flags.no_new_privs {
        // Privileges can drop before the filter loads, so filter
        // policies need not allow the identity-changing syscalls.
        creds::drop_ugid(policy)?;
        if policy.flags.caps {
            creds::drop_caps(policy)?;
        }
        seccomp::set_seccomp_filter(policy)?;
    } else {
        // The filter must load while still privileged, and must then
        // allow setgroups, setresgid, setresuid, capget, capset and
        // prctl for the drops below.
        seccomp::set_seccomp_filter(policy)?;
        creds::drop_ugid(policy)?;
        if policy.flags.caps {
            creds::drop_caps(policy)?;
        }
    }
    // Strict mode last since it cuts off the other privilege-dropping
    // syscalls.
    if policy.flags.seccomp {
        syscall::set_seccomp_strict().map_err(Error::syscall("prctl(PR_SET_SECCOMP)"))?;
    }
    Ok(())
}
