mod common;

use std::io::Cursor;

use jailbox::{Error, FilterInstruction, Policy};

// Offset of the filter instruction count inside the fixed record, per
// the documented wire format.
const FILTER_LEN_OFFSET: usize = 28;

fn sample_filter() -> Vec<FilterInstruction> {
    vec![
        FilterInstruction {
            code: 0x20,
            jt: 0,
            jf: 0,
            k: 4,
        },
        FilterInstruction {
            code: 0x15,
            jt: 0,
            jf: 1,
            k: 1,
        },
        FilterInstruction {
            code: 0x06,
            jt: 0,
            jf: 0,
            k: 0,
        },
        FilterInstruction {
            code: 0x06,
            jt: 0,
            jf: 0,
            k: 0x7fff0000,
        },
    ]
}

fn sample_policy() -> Policy {
    let mut policy = Policy::new();
    policy.change_uid(1000).unwrap();
    policy.change_gid(1000).unwrap();
    policy.use_caps(0b101);
    policy.namespace_pids();
    policy.namespace_net();
    policy.no_new_privs();
    policy.enter_chroot("/srv/jail").unwrap();
    policy.chroot_chdir("/work").unwrap();
    policy.mount_tmp();
    policy.bind("/bin", "/bin", false).unwrap();
    policy.bind("/var/data", "/data", true).unwrap();
    policy.use_seccomp_filter(sample_filter()).unwrap();
    policy.log_seccomp_failures();
    policy.stack_limit(8 << 20);
    policy.time_limit(1000);
    policy.memory_limit(64 << 20);
    policy.output_limit(1 << 10);
    policy
}

#[test]
fn round_trip_reproduces_policy() {
    common::setup_logs();
    let mut policy = sample_policy();
    // A user entry needs a real passwd lookup; use the conventional
    // unprivileged account when the system has it.
    if policy.change_user("nobody").is_ok() {
        policy.inherit_usergroups();
    }
    let rebuilt = Policy::unmarshal(&policy.marshal()).unwrap();
    assert_eq!(rebuilt, policy);
    assert_eq!(rebuilt.flags(), policy.flags());
    assert_eq!(rebuilt.user(), policy.user());
    assert_eq!(rebuilt.chrootdir(), Some("/srv/jail"));
    assert_eq!(rebuilt.chdir_in_jail(), Some("/work"));
    assert_eq!(rebuilt.filter().unwrap(), &sample_filter()[..]);
    assert_eq!(rebuilt.bindings(), policy.bindings());
}

#[test]
fn round_trip_over_pipe_form() {
    let policy = sample_policy();
    let mut stream = Vec::new();
    policy.write_to(&mut stream).unwrap();
    let rebuilt = Policy::read_from(Cursor::new(stream)).unwrap();
    assert_eq!(rebuilt, policy);
}

#[test]
fn size_agreement() {
    let policy = sample_policy();
    let size = policy.size();
    let mut buf = vec![0; size];
    assert_eq!(policy.marshal_into(&mut buf), size);
    // One byte short: the total still comes back, flagging truncation,
    // and the written prefix is intact.
    let mut short = vec![0; size - 1];
    assert_eq!(policy.marshal_into(&mut short), size);
    assert_eq!(&short[..], &buf[..size - 1]);
}

#[test]
fn empty_policy_round_trips() {
    let policy = Policy::new();
    let rebuilt = Policy::unmarshal(&policy.marshal()).unwrap();
    assert_eq!(rebuilt, policy);
}

#[test]
fn binding_order_is_preserved() {
    let mut policy = Policy::new();
    for i in 0..16 {
        policy
            .bind(&format!("/src/{i}"), &format!("/dst/{i}"), i % 2 == 0)
            .unwrap();
    }
    let rebuilt = Policy::unmarshal(&policy.marshal()).unwrap();
    let dests: Vec<_> = rebuilt.bindings().iter().map(|b| b.dest.as_str()).collect();
    let expected: Vec<_> = (0..16).map(|i| format!("/dst/{i}")).collect();
    assert_eq!(dests, expected);
}

#[test]
fn empty_filter_program_round_trips() {
    let mut policy = sample_policy();
    // The compiler may hand over a present-but-empty program; it must
    // survive the pipe as empty, not come back as no filter at all.
    policy.use_seccomp_filter(vec![]).unwrap();
    let rebuilt = Policy::unmarshal(&policy.marshal()).unwrap();
    assert_eq!(rebuilt, policy);
    assert!(rebuilt.flags().seccomp_filter);
    assert!(rebuilt.filter().unwrap().is_empty());
}

#[test]
fn truncated_stream_is_rejected() {
    let buf = sample_policy().marshal();
    for len in [0, 10, 40] {
        let err = Policy::unmarshal(&buf[..len]).unwrap_err();
        assert!(matches!(err, Error::MalformedStream(_)), "{err}");
    }
}

#[test]
fn unterminated_string_is_rejected() {
    let policy = sample_policy();
    let buf = policy.marshal();
    // Cut inside the chrootdir section, leaving no terminator behind.
    let err = Policy::unmarshal(&buf[..72]).unwrap_err();
    assert!(matches!(err, Error::MalformedStream(_)), "{err}");
}

#[test]
fn oversized_filter_count_is_rejected() {
    let policy = sample_policy();
    let mut buf = policy.marshal();
    // More instructions than the record can hold.
    buf[FILTER_LEN_OFFSET..FILTER_LEN_OFFSET + 4].copy_from_slice(&60000u32.to_le_bytes());
    let err = Policy::unmarshal(&buf).unwrap_err();
    assert!(matches!(err, Error::MalformedStream(_)), "{err}");
    // More instructions than the kernel accepts at all.
    buf[FILTER_LEN_OFFSET..FILTER_LEN_OFFSET + 4].copy_from_slice(&70000u32.to_le_bytes());
    let err = Policy::unmarshal(&buf).unwrap_err();
    assert!(matches!(err, Error::MalformedStream(_)), "{err}");
}

#[test]
fn oversized_pipe_header_is_rejected() {
    let mut stream = Vec::new();
    stream.extend_from_slice(&(u64::MAX).to_le_bytes());
    let err = Policy::read_from(Cursor::new(stream)).unwrap_err();
    assert!(matches!(err, Error::MalformedStream(_)), "{err}");
}

#[test]
fn meta_sink_does_not_cross() {
    let tmp = common::TempDir::new().unwrap();
    let mut policy = sample_policy();
    policy.meta_file(tmp.join("meta")).unwrap();
    let rebuilt = Policy::unmarshal(&policy.marshal()).unwrap();
    // The flag survives; the handle is rebuilt empty on the far side.
    assert!(rebuilt.flags().meta_file);
    assert_eq!(rebuilt, policy);
}
