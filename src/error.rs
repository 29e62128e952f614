use nix::errno::Errno;

/// Everything that can go wrong on the host side of a sandbox launch.
///
/// Failures inside the child after the fork are never reported through
/// this type; the child dies and the parent observes the wait status.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bad argument: {0}")]
    BadArgument(String),
    #[error("malformed policy stream: {0}")]
    MalformedStream(&'static str),
    #[error("{op} failed: {errno}")]
    Syscall { op: &'static str, errno: Errno },
    #[error("capability operation failed: {0}")]
    Caps(#[from] caps::errors::CapsError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("target is not accessible: {0}")]
    TargetInaccessible(String),
    #[error("target killed by seccomp violation")]
    JailViolated,
    #[error("time limit exceeded")]
    TimedOut,
    #[error("init supervisor failed: {0}")]
    InitFailure(String),
}

impl Error {
    pub(crate) fn bad_argument(msg: impl Into<String>) -> Self {
        Self::BadArgument(msg.into())
    }

    /// Adapter for `map_err` on nix results.
    pub(crate) fn syscall(op: &'static str) -> impl Fn(Errno) -> Self {
        move |errno| Self::Syscall { op, errno }
    }
}
