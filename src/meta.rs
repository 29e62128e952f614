use std::io::Write;

use crate::Error;

/// How a supervised run ended: exactly one of a normal exit status or
/// a fatal signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    Status(i32),
    Signal(i32),
}

/// Post-mortem usage report. The init supervisor writes one to the
/// policy's meta sink; judge hosts read it back with [`Meta::parse`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Meta {
    /// CPU time spent in user mode, microseconds.
    pub time_us: i64,
    /// Wall-clock time of the whole run, microseconds.
    pub time_wall_us: i64,
    /// Peak resident set size, bytes.
    pub mem_bytes: i64,
    pub disposition: Disposition,
}

fn field(line: Option<&str>, key: &str) -> Result<i64, Error> {
    let value = line
        .and_then(|line| line.strip_prefix(key))
        .and_then(|rest| rest.strip_prefix(':'))
        .ok_or_else(|| Error::bad_argument(format!("meta report missing {key}")))?;
    value
        .parse()
        .map_err(|_| Error::bad_argument(format!("meta report has malformed {key}")))
}

impl Meta {
    /// Emits the four fixed lines: `time`, `time-wall`, `mem`, then
    /// `signal` or `status`.
    pub fn write_to<W: Write>(&self, mut w: W) -> Result<(), Error> {
        write!(
            w,
            "time:{}\ntime-wall:{}\nmem:{}\n",
            self.time_us, self.time_wall_us, self.mem_bytes
        )?;
        match self.disposition {
            Disposition::Signal(n) => writeln!(w, "signal:{n}")?,
            Disposition::Status(n) => writeln!(w, "status:{n}")?,
        }
        Ok(())
    }

    pub fn parse(text: &str) -> Result<Meta, Error> {
        let mut lines = text.lines();
        let time_us = field(lines.next(), "time")?;
        let time_wall_us = field(lines.next(), "time-wall")?;
        let mem_bytes = field(lines.next(), "mem")?;
        let last = lines
            .next()
            .ok_or_else(|| Error::bad_argument("meta report missing disposition"))?;
        let disposition = if let Some(v) = last.strip_prefix("signal:") {
            Disposition::Signal(
                v.parse()
                    .map_err(|_| Error::bad_argument("meta report has malformed signal"))?,
            )
        } else if let Some(v) = last.strip_prefix("status:") {
            Disposition::Status(
                v.parse()
                    .map_err(|_| Error::bad_argument("meta report has malformed status"))?,
            )
        } else {
            return Err(Error::bad_argument("meta report missing disposition"));
        };
        Ok(Meta {
            time_us,
            time_wall_us,
            mem_bytes,
            disposition,
        })
    }

    /// Error corresponding to an abnormal disposition, if any: the
    /// time-limit signal maps to [`Error::TimedOut`] and a seccomp
    /// kill to [`Error::JailViolated`].
    pub fn limit_error(&self) -> Option<Error> {
        match self.disposition {
            Disposition::Signal(n) if n == nix::libc::SIGXCPU => Some(Error::TimedOut),
            Disposition::Signal(n) if n == nix::libc::SIGSYS => Some(Error::JailViolated),
            _ => None,
        }
    }
}
