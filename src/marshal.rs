use std::io::{Read, Write};
use std::mem::size_of;

use nix::unistd::Pid;

use crate::policy::MAX_FILTER_LEN;
use crate::{Error, FilterInstruction, Policy, PolicyFlags};

/// Sanity cap for the pipe form of the policy. Large enough for a full
/// 65535-instruction filter plus bindings.
pub const MAX_POLICY_SIZE: usize = 1 << 20;

const PRESENT_USER: u8 = 1;
const PRESENT_CHROOTDIR: u8 = 1 << 1;
const PRESENT_CHDIR: u8 = 1 << 2;
const PRESENT_FILTER: u8 = 1 << 3;

// Flag order is the wire contract; new flags append.
fn flag_list(flags: &PolicyFlags) -> [bool; 21] {
    [
        flags.uid,
        flags.gid,
        flags.caps,
        flags.vfs_ns,
        flags.pids_ns,
        flags.net_ns,
        flags.seccomp,
        flags.seccomp_filter,
        flags.log_seccomp,
        flags.readonly_remount,
        flags.inherit_groups,
        flags.disable_ptrace,
        flags.no_new_privs,
        flags.chroot,
        flags.chdir,
        flags.mount_tmp,
        flags.stack_limit,
        flags.time_limit,
        flags.output_limit,
        flags.memory_limit,
        flags.meta_file,
    ]
}

fn flag_bits(flags: &PolicyFlags) -> u32 {
    let mut bits = 0;
    for (i, on) in flag_list(flags).into_iter().enumerate() {
        if on {
            bits |= 1 << i;
        }
    }
    bits
}

fn flags_from_bits(bits: u32) -> PolicyFlags {
    let bit = |i: u32| bits & (1 << i) != 0;
    PolicyFlags {
        uid: bit(0),
        gid: bit(1),
        caps: bit(2),
        vfs_ns: bit(3),
        pids_ns: bit(4),
        net_ns: bit(5),
        seccomp: bit(6),
        seccomp_filter: bit(7),
        log_seccomp: bit(8),
        readonly_remount: bit(9),
        inherit_groups: bit(10),
        disable_ptrace: bit(11),
        no_new_privs: bit(12),
        chroot: bit(13),
        chdir: bit(14),
        mount_tmp: bit(15),
        stack_limit: bit(16),
        time_limit: bit(17),
        output_limit: bit(18),
        memory_limit: bit(19),
        meta_file: bit(20),
    }
}

/// Bounded writer that keeps counting once the buffer is full, so one
/// pass computes the total and a second pass with capacity writes it.
struct MarshalState<'a> {
    buf: &'a mut [u8],
    pos: usize,
    total: usize,
}

impl<'a> MarshalState<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0, total: 0 }
    }

    fn append(&mut self, src: &[u8]) {
        let copy = src.len().min(self.buf.len() - self.pos);
        if copy > 0 {
            self.buf[self.pos..self.pos + copy].copy_from_slice(&src[..copy]);
            self.pos += copy;
        }
        self.total += src.len();
    }

    fn append_u32(&mut self, v: u32) {
        self.append(&v.to_le_bytes());
    }

    fn append_u64(&mut self, v: u64) {
        self.append(&v.to_le_bytes());
    }

    fn append_i32(&mut self, v: i32) {
        self.append(&v.to_le_bytes());
    }

    fn append_str(&mut self, s: &str) {
        self.append(s.as_bytes());
        self.append(&[0]);
    }
}

/// Bounded reader over a received byte image.
struct Consumer<'a> {
    buf: &'a [u8],
}

impl<'a> Consumer<'a> {
    fn bytes(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if len > self.buf.len() {
            return Err(Error::MalformedStream("truncated stream"));
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, Error> {
        Ok(u16::from_le_bytes(self.bytes(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, Error> {
        Ok(u64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32, Error> {
        Ok(i32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn str(&mut self) -> Result<String, Error> {
        let nul = self
            .buf
            .iter()
            .position(|b| *b == 0)
            .ok_or(Error::MalformedStream("string without terminator"))?;
        let bytes = self.bytes(nul + 1)?;
        String::from_utf8(bytes[..nul].to_vec())
            .map_err(|_| Error::MalformedStream("string is not UTF-8"))
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }
}

impl Policy {
    fn marshal_helper(&self, state: &mut MarshalState) {
        let filter_len = self.filter.as_deref().map_or(0, <[_]>::len);
        state.append_u32(flag_bits(&self.flags));
        state.append_u32(self.uid);
        state.append_u32(self.gid);
        state.append_u32(self.usergid);
        state.append_u64(self.caps);
        state.append_i32(self.init_pid.map_or(0, Pid::as_raw));
        state.append_u32(filter_len as u32);
        state.append_u32(self.bindings.len() as u32);
        state.append_u64(self.stack_limit);
        state.append_u64(self.time_limit_ms);
        state.append_u64(self.memory_limit);
        state.append_u64(self.output_limit);
        let mut presence = 0;
        if self.user.is_some() {
            presence |= PRESENT_USER;
        }
        if self.chrootdir.is_some() {
            presence |= PRESENT_CHROOTDIR;
        }
        if self.chdir.is_some() {
            presence |= PRESENT_CHDIR;
        }
        // A present-but-empty program is distinct from no program, so
        // the filter gets a presence bit of its own rather than
        // overloading the length field.
        if self.filter.is_some() {
            presence |= PRESENT_FILTER;
        }
        state.append(&[presence]);
        if let Some(user) = &self.user {
            state.append_str(user);
        }
        if let Some(chrootdir) = &self.chrootdir {
            state.append_str(chrootdir);
        }
        if let Some(chdir) = &self.chdir {
            state.append_str(chdir);
        }
        if let Some(program) = &self.filter {
            for instr in program {
                state.append(&instr.code.to_le_bytes());
                state.append(&[instr.jt, instr.jf]);
                state.append(&instr.k.to_le_bytes());
            }
        }
        for binding in &self.bindings {
            state.append_str(&binding.src);
            state.append_str(&binding.dest);
            state.append_i32(binding.writeable as i32);
        }
    }

    /// Exact number of bytes [`Policy::marshal_into`] needs.
    pub fn size(&self) -> usize {
        self.marshal_into(&mut [])
    }

    /// Serializes into `buf`, truncating if it is too small, and
    /// returns the total size required. Output is complete iff the
    /// returned size fits the buffer.
    pub fn marshal_into(&self, buf: &mut [u8]) -> usize {
        let mut state = MarshalState::new(buf);
        self.marshal_helper(&mut state);
        state.total
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = vec![0; self.size()];
        self.marshal_into(&mut buf);
        buf
    }

    /// Rebuilds a Policy from a marshalled image. All strings and
    /// filter bytes are freshly owned; the meta sink does not cross and
    /// comes back empty.
    pub fn unmarshal(buf: &[u8]) -> Result<Policy, Error> {
        let mut c = Consumer { buf };
        let mut policy = Policy::new();
        policy.flags = flags_from_bits(c.u32()?);
        policy.uid = c.u32()?;
        policy.gid = c.u32()?;
        policy.usergid = c.u32()?;
        policy.caps = c.u64()?;
        policy.init_pid = match c.i32()? {
            0 => None,
            pid => Some(Pid::from_raw(pid)),
        };
        let filter_len = c.u32()? as usize;
        let binding_count = c.u32()? as usize;
        policy.stack_limit = c.u64()?;
        policy.time_limit_ms = c.u64()?;
        policy.memory_limit = c.u64()?;
        policy.output_limit = c.u64()?;
        let presence = c.u8()?;
        if presence & PRESENT_USER != 0 {
            policy.user = Some(c.str()?);
        }
        if presence & PRESENT_CHROOTDIR != 0 {
            policy.chrootdir = Some(c.str()?);
        }
        if presence & PRESENT_CHDIR != 0 {
            policy.chdir = Some(c.str()?);
        }
        if presence & PRESENT_FILTER != 0 {
            if filter_len > MAX_FILTER_LEN
                || filter_len > c.remaining() / size_of::<FilterInstruction>()
            {
                return Err(Error::MalformedStream("oversized filter program"));
            }
            let mut program = Vec::with_capacity(filter_len);
            for _ in 0..filter_len {
                let code = c.u16()?;
                let jt = c.u8()?;
                let jf = c.u8()?;
                let k = c.u32()?;
                program.push(FilterInstruction { code, jt, jf, k });
            }
            policy.filter = Some(program);
        }
        // Replay bindings through the builder so derived flags are
        // re-established on the receiving side.
        for _ in 0..binding_count {
            let src = c.str()?;
            let dest = c.str()?;
            let writeable = c.i32()? != 0;
            policy
                .bind(&src, &dest, writeable)
                .map_err(|_| Error::MalformedStream("invalid binding"))?;
        }
        Ok(policy)
    }

    /// Pipe form: a native `u64` length header followed by the image.
    pub fn write_to<W: Write>(&self, mut w: W) -> Result<(), Error> {
        let buf = self.marshal();
        w.write_all(&(buf.len() as u64).to_le_bytes())?;
        w.write_all(&buf)?;
        Ok(())
    }

    pub fn read_from<R: Read>(mut r: R) -> Result<Policy, Error> {
        let mut header = [0; 8];
        r.read_exact(&mut header)?;
        let size = u64::from_le_bytes(header) as usize;
        if size > MAX_POLICY_SIZE {
            return Err(Error::MalformedStream("policy image over sanity cap"));
        }
        let mut buf = vec![0; size];
        r.read_exact(&mut buf)?;
        Self::unmarshal(&buf)
    }
}
