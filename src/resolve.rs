use nix::fcntl::readlink;
use nix::sys::stat::{lstat, SFlag};
use nix::unistd::{access, getcwd, AccessFlags};

use crate::{Binding, Error, Policy};

// Bounds symlink chains so a cycle terminates instead of recursing
// until the stack runs out.
const MAX_SYMLINK_DEPTH: usize = 40;

/// Joins `path` onto `buffer` with exactly one `/` at the seam. No
/// `..` resolution happens at this layer.
fn concat_path(buffer: &mut String, path: &str) {
    if !buffer.is_empty() && !buffer.ends_with('/') && !path.starts_with('/') {
        buffer.push('/');
        buffer.push_str(path);
    } else if buffer.ends_with('/') && path.starts_with('/') {
        buffer.push_str(&path[1..]);
    } else {
        buffer.push_str(path);
    }
}

impl Policy {
    /// Maps a path as the jailed process would see it to the host path
    /// it actually lives at, through the bind table (longest matching
    /// destination wins) and the chroot, following symlinks to a
    /// regular file.
    pub fn resolve_path(&self, path: &str) -> Result<String, Error> {
        self.resolve_depth(path, 0)
    }

    /// Like [`Policy::resolve_path`], additionally demanding execute
    /// permission on the result.
    pub fn resolve_executable(&self, path: &str) -> Result<String, Error> {
        let host = self.resolve_path(path)?;
        access(host.as_str(), AccessFlags::X_OK)
            .map_err(|_| Error::TargetInaccessible(host.clone()))?;
        Ok(host)
    }

    fn resolve_depth(&self, path: &str, depth: usize) -> Result<String, Error> {
        if depth > MAX_SYMLINK_DEPTH {
            return Err(Error::TargetInaccessible(format!(
                "too many levels of symbolic links: {path}"
            )));
        }
        // Absolute view of the path inside the jail, anchored on the
        // configured working directory.
        let mut buffer = String::new();
        if !path.starts_with('/') {
            if self.flags.chdir {
                concat_path(&mut buffer, self.chdir.as_deref().unwrap_or("/"));
            } else if self.flags.chroot {
                concat_path(&mut buffer, "/");
            } else {
                let cwd = getcwd().map_err(Error::syscall("getcwd"))?;
                match cwd.to_str() {
                    Some(cwd) => concat_path(&mut buffer, cwd),
                    None => {
                        return Err(Error::TargetInaccessible(
                            "working directory is not UTF-8".into(),
                        ))
                    }
                }
            }
        }
        concat_path(&mut buffer, path);
        // The binding with the longest matching destination wins.
        let mut best: Option<&Binding> = None;
        let mut best_len = 0;
        for binding in &self.bindings {
            if buffer.starts_with(&binding.dest) && binding.dest.len() > best_len {
                best_len = binding.dest.len();
                best = Some(binding);
            }
        }
        let src = match best {
            Some(binding) => binding.src.as_str(),
            None => {
                best_len = 1;
                match self.flags.chroot {
                    true => self.chrootdir.as_deref().unwrap_or("/"),
                    false => "/",
                }
            }
        };
        let mut host = src.trim_end_matches('/').to_owned();
        concat_path(&mut host, "/");
        concat_path(&mut host, &buffer[best_len..]);
        let stat = lstat(host.as_str()).map_err(|_| Error::TargetInaccessible(host.clone()))?;
        let format = SFlag::from_bits_truncate(stat.st_mode) & SFlag::S_IFMT;
        if format == SFlag::S_IFREG {
            return Ok(host);
        }
        if format != SFlag::S_IFLNK {
            return Err(Error::TargetInaccessible(host));
        }
        let link = readlink(host.as_str()).map_err(|_| Error::TargetInaccessible(host.clone()))?;
        match link.to_str() {
            Some(link) => self.resolve_depth(link, depth + 1),
            None => Err(Error::TargetInaccessible(host)),
        }
    }
}
