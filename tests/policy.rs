mod common;

use jailbox::{check_exit, Disposition, Error, FilterInstruction, Meta, Policy, ERR_INIT, ERR_JAIL};

#[test]
fn identity_builders_reject_root() {
    let mut policy = Policy::new();
    assert!(matches!(policy.change_uid(0), Err(Error::BadArgument(_))));
    assert!(matches!(policy.change_gid(0), Err(Error::BadArgument(_))));
    assert!(!policy.flags().uid);
    assert!(!policy.flags().gid);
}

#[test]
fn unknown_user_is_rejected() {
    let mut policy = Policy::new();
    let err = policy.change_user("no-such-user-here").unwrap_err();
    assert!(matches!(err, Error::BadArgument(_)), "{err}");
    assert!(policy.user().is_none());
}

#[test]
fn chdir_requires_chroot_and_absolute_path() {
    let mut policy = Policy::new();
    assert!(policy.chroot_chdir("/work").is_err());
    policy.enter_chroot("/srv/jail").unwrap();
    assert!(policy.chroot_chdir("work").is_err());
    policy.chroot_chdir("/work").unwrap();
    // At most one of each.
    assert!(policy.chroot_chdir("/other").is_err());
    assert!(policy.enter_chroot("/other").is_err());
}

#[test]
fn bind_dest_must_be_absolute() {
    let mut policy = Policy::new();
    assert!(policy.bind("/bin", "bin", false).is_err());
    assert!(policy.bindings().is_empty());
    assert!(!policy.flags().vfs_ns);
}

#[test]
fn bind_forces_vfs_namespace() {
    let mut policy = Policy::new();
    policy.bind("/bin", "/bin", false).unwrap();
    assert!(policy.flags().vfs_ns);
}

#[test]
fn pid_namespace_forces_vfs_and_readonly() {
    let mut policy = Policy::new();
    policy.namespace_pids();
    assert!(policy.flags().vfs_ns);
    assert!(policy.flags().readonly_remount);
    assert!(policy.flags().pids_ns);
}

#[test]
fn filter_over_kernel_limit_is_rejected() {
    let mut policy = Policy::new();
    let program = vec![FilterInstruction::default(); 65536];
    assert!(policy.use_seccomp_filter(program).is_err());
    assert!(policy.filter().is_none());
    policy
        .use_seccomp_filter(vec![FilterInstruction::default(); 65535])
        .unwrap();
    assert!(policy.flags().seccomp_filter);
}

#[test]
fn preenter_strips_parent_side_flags() {
    let mut policy = Policy::new();
    policy.namespace_pids();
    policy.namespace_net();
    policy.no_new_privs();
    policy.enter_chroot("/srv/jail").unwrap();
    policy.preenter();
    assert!(!policy.flags().vfs_ns);
    assert!(!policy.flags().readonly_remount);
    assert!(!policy.flags().pids_ns);
    assert!(!policy.flags().chroot);
    // Everything meant for the running child stays.
    assert!(policy.flags().net_ns);
    assert!(policy.flags().no_new_privs);
}

#[test]
fn preexec_keeps_only_post_exec_flags() {
    let tmp = common::TempDir::new().unwrap();
    let mut policy = Policy::new();
    policy.change_uid(1000).unwrap();
    policy.namespace_pids();
    policy.namespace_net();
    policy.no_new_privs();
    policy.use_seccomp();
    policy.enter_chroot("/srv/jail").unwrap();
    policy.stack_limit(8 << 20);
    policy.time_limit(1000);
    policy.memory_limit(64 << 20);
    policy.output_limit(1 << 10);
    policy.meta_file(tmp.join("meta")).unwrap();
    policy.preexec();
    let flags = *policy.flags();
    assert!(flags.vfs_ns);
    assert!(flags.readonly_remount);
    assert!(flags.stack_limit);
    assert!(flags.time_limit);
    assert!(flags.memory_limit);
    assert!(flags.output_limit);
    assert!(flags.meta_file);
    assert!(!flags.uid);
    assert!(!flags.pids_ns);
    assert!(!flags.net_ns);
    assert!(!flags.no_new_privs);
    assert!(!flags.seccomp);
    assert!(!flags.chroot);
    assert!(policy.user().is_none());
}

#[test]
fn exit_code_taxonomy() {
    assert_eq!(check_exit(0).unwrap(), 0);
    assert_eq!(check_exit(7).unwrap(), 7);
    assert_eq!(check_exit(128 + 9).unwrap(), 137);
    assert!(matches!(check_exit(ERR_JAIL), Err(Error::JailViolated)));
    assert!(matches!(check_exit(ERR_INIT), Err(Error::InitFailure(_))));
}

#[test]
fn meta_report_round_trip() {
    let meta = Meta {
        time_us: 1234,
        time_wall_us: 56789,
        mem_bytes: 1 << 20,
        disposition: Disposition::Status(0),
    };
    let mut text = Vec::new();
    meta.write_to(&mut text).unwrap();
    let text = String::from_utf8(text).unwrap();
    assert_eq!(text, "time:1234\ntime-wall:56789\nmem:1048576\nstatus:0\n");
    assert_eq!(Meta::parse(&text).unwrap(), meta);
}

#[test]
fn meta_limit_errors() {
    let text = "time:1\ntime-wall:2\nmem:3\nsignal:24\n";
    let meta = Meta::parse(text).unwrap();
    assert_eq!(meta.disposition, Disposition::Signal(24));
    assert!(matches!(meta.limit_error(), Some(Error::TimedOut)));
    let text = "time:1\ntime-wall:2\nmem:3\nsignal:31\n";
    let meta = Meta::parse(text).unwrap();
    assert!(matches!(meta.limit_error(), Some(Error::JailViolated)));
    let text = "time:1\ntime-wall:2\nmem:3\nstatus:1\n";
    assert!(Meta::parse(text).unwrap().limit_error().is_none());
}

#[test]
fn malformed_meta_is_rejected() {
    assert!(Meta::parse("").is_err());
    assert!(Meta::parse("time:1\ntime-wall:2\nmem:3\n").is_err());
    assert!(Meta::parse("time:1\ntime-wall:2\nmem:3\ncrashed:yes\n").is_err());
    assert!(Meta::parse("time:x\ntime-wall:2\nmem:3\nstatus:0\n").is_err());
}
