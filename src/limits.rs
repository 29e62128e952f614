use nix::sys::resource::{setrlimit, Resource};

use crate::{syscall, Error, Policy};

/// Applies the resource limits in the grandchild, just before exec.
/// Only the static-target path calls this; dynamically linked targets
/// get the same limits from the preload helper after exec.
pub(crate) fn setup_limits(policy: &Policy) -> Result<(), Error> {
    if policy.flags.memory_limit {
        setrlimit(Resource::RLIMIT_AS, policy.memory_limit, policy.memory_limit)
            .map_err(Error::syscall("setrlimit(RLIMIT_AS)"))?;
    }
    if policy.flags.output_limit {
        setrlimit(Resource::RLIMIT_FSIZE, policy.output_limit, policy.output_limit)
            .map_err(Error::syscall("setrlimit(RLIMIT_FSIZE)"))?;
        // No core dumps when output is limited.
        setrlimit(Resource::RLIMIT_CORE, 0, 0).map_err(Error::syscall("setrlimit(RLIMIT_CORE)"))?;
    }
    if policy.flags.stack_limit {
        setrlimit(Resource::RLIMIT_STACK, policy.stack_limit, policy.stack_limit)
            .map_err(Error::syscall("setrlimit(RLIMIT_STACK)"))?;
    }
    if policy.flags.time_limit {
        // Soft limit delivers SIGXCPU; the hard limit one second later
        // is the kernel's SIGKILL backstop.
        let soft = policy.time_limit_ms.div_ceil(1000);
        setrlimit(Resource::RLIMIT_CPU, soft, soft + 1)
            .map_err(Error::syscall("setrlimit(RLIMIT_CPU)"))?;
        // Wall-clock alarm at the exact deadline; the init supervisor
        // reports the resulting kill as the canonical SIGXCPU.
        syscall::ualarm(policy.time_limit_ms.saturating_mul(1000).min(u32::MAX as u64) as u32);
    }
    Ok(())
}
