use std::ffi::CString;

use caps::{CapSet, Capability, CapsHashSet};
use nix::libc::c_ulong;
use nix::unistd::{initgroups, setgroups, setresgid, setresuid, Gid, Uid};

use crate::{syscall, Error, Policy};

const SECURE_ALL_BITS: c_ulong = 0x15;
const SECURE_ALL_LOCKS: c_ulong = SECURE_ALL_BITS << 1;

const CAP_LAST_CAP_FILE: &str = "/proc/sys/kernel/cap_last_cap";

/// Keeps capabilities across the coming uid change and locks the
/// securebits so the jailed process cannot undo it. Must run before
/// any identity change, while `CAP_SETPCAP` is still effective.
pub(crate) fn lock_securebits() -> Result<(), Error> {
    nix::sys::prctl::set_keepcaps(true).map_err(Error::syscall("prctl(PR_SET_KEEPCAPS)"))?;
    syscall::set_securebits(SECURE_ALL_BITS | SECURE_ALL_LOCKS)
        .map_err(Error::syscall("prctl(PR_SET_SECUREBITS)"))?;
    Ok(())
}

/// Switches group and user identity. At most one transition per
/// process: a failure here leaves an undefined mix and the child must
/// die rather than return.
pub(crate) fn drop_ugid(policy: &Policy) -> Result<(), Error> {
    if policy.flags.inherit_groups {
        let user = policy
            .user
            .as_deref()
            .ok_or_else(|| Error::bad_argument("usergroup inheritance without username"))?;
        let user = CString::new(user).map_err(|_| Error::bad_argument("user name contains NUL"))?;
        initgroups(&user, Gid::from_raw(policy.usergid)).map_err(Error::syscall("initgroups"))?;
    } else if policy.flags.uid || policy.flags.gid {
        // Only clear supplementary groups when changing identity.
        setgroups(&[]).map_err(Error::syscall("setgroups"))?;
    }
    if policy.flags.gid {
        let gid = Gid::from_raw(policy.gid);
        setresgid(gid, gid, gid).map_err(Error::syscall("setresgid"))?;
    }
    if policy.flags.uid {
        let uid = Uid::from_raw(policy.uid);
        setresuid(uid, uid, uid).map_err(Error::syscall("setresuid"))?;
    }
    Ok(())
}

/// The kernel's last valid capability. A compile-time constant goes
/// stale when the running kernel is older or newer than the headers, so
/// the answer comes from /proc.
fn last_valid_cap() -> Result<u8, Error> {
    let text = std::fs::read_to_string(CAP_LAST_CAP_FILE)?;
    text.trim()
        .parse()
        .map_err(|_| Error::bad_argument(format!("cannot parse {CAP_LAST_CAP_FILE}")))
}

/// Reduces the three capability sets and the bounding set to the
/// policy's mask. `CAP_SETPCAP` is retained through the bounding-set
/// drops and stripped last unless the mask asked for it.
pub(crate) fn drop_caps(policy: &Policy) -> Result<(), Error> {
    let last_cap = last_valid_cap()?;
    let mut keep = CapsHashSet::new();
    for cap in caps::all() {
        if cap.index() > last_cap {
            continue;
        }
        // Keep CAP_SETPCAP for the bounding-set drops below.
        if cap == Capability::CAP_SETPCAP || policy.caps & (1 << cap.index()) != 0 {
            keep.insert(cap);
        }
    }
    apply_sets(&keep)?;
    // The bounding set goes after the sets above: a caller with a more
    // permissive bounding set could have used it there to raise a
    // capability that was not already present.
    for cap in caps::all() {
        if cap.index() > last_cap || policy.caps & (1 << cap.index()) != 0 {
            continue;
        }
        caps::drop(None, CapSet::Bounding, cap)?;
    }
    // If CAP_SETPCAP was not specifically requested, remove it now.
    // This must stay the last capability operation.
    if policy.caps & (1 << Capability::CAP_SETPCAP.index()) == 0 {
        keep.remove(&Capability::CAP_SETPCAP);
        apply_sets(&keep)?;
    }
    Ok(())
}

/// Applies one kept set to effective, permitted and inheritable.
/// Effective goes first so it never exceeds the shrinking permitted
/// set; inheritable last since raising it needs CAP_SETPCAP effective.
fn apply_sets(keep: &CapsHashSet) -> Result<(), Error> {
    caps::set(None, CapSet::Effective, keep)?;
    caps::set(None, CapSet::Permitted, keep)?;
    caps::set(None, CapSet::Inheritable, keep)?;
    Ok(())
}
