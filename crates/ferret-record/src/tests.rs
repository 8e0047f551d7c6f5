use super::*;
use ferret_proto::LnkSupport;

fn test_env(root: &str) -> AutodepEnv {
    AutodepEnv {
        root_dir: root.to_string(),
        tmp_dir: format!("{root}/.ferret/tmp"),
        lnk_support: LnkSupport::Full,
        reliable_dirs: true,
        admin_dir: ".ferret".to_string(),
        ..Default::default()
    }
}

fn static_recorder(root: &str) -> Recorder {
    Recorder::new_static(test_env(root), root.to_string())
}

fn tmp_repo() -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let root = root.to_str().unwrap().to_string();
    (dir, root)
}

#[test]
fn simple_paths_are_recognized() {
    assert!(is_simple(""));
    assert!(is_simple("/etc/ld.so.cache"));
    assert!(is_simple("/dev/null"));
    assert!(is_simple("/usr/lib/x86_64/libm.so"));
    assert!(is_simple("/proc/meminfo"));
    assert!(!is_simple("/proc/self/cwd"));
    assert!(!is_simple("/proc/1234/fd/3"));
    assert!(!is_simple("relative/path"));
    assert!(!is_simple("/home/user/repo/f"));
    // escaping the simple top through .. is not simple
    assert!(!is_simple("/etc/../home/user"));
    assert!(is_simple("/etc/x/../y"));
}

#[test]
fn open_read_reports_a_dep() {
    let (_keep, root) = tmp_repo();
    std::fs::write(format!("{root}/in"), b"x").unwrap();
    let mut r = static_recorder(&root);
    r.open(At::Cwd, "in", libc::O_RDONLY, "open");
    let reports = r.take_static();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].kind(), AccessKind::Access);
    assert_eq!(reports[0].files[0].0, "in");
    assert_eq!(reports[0].digest.write, Bool3::No);
    assert!(reports[0].digest.accesses.contains(ferret_proto::Access::Reg));
}

#[test]
fn open_write_announces_then_confirms() {
    let (_keep, root) = tmp_repo();
    let mut r = static_recorder(&root);
    let ctx = r.open(At::Cwd, "out", libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC, "open");
    assert!(ctx.confirm);
    r.confirm(ctx.solved.loc, true);
    let reports = r.take_static();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].digest.write, Bool3::Maybe);
    assert_eq!(reports[1].kind(), AccessKind::Confirm);
    assert!(reports[1].ok);
}

#[test]
fn repeated_reads_are_reported_once() {
    let (_keep, root) = tmp_repo();
    std::fs::write(format!("{root}/in"), b"x").unwrap();
    let mut r = static_recorder(&root);
    r.open(At::Cwd, "in", libc::O_RDONLY, "open");
    r.open(At::Cwd, "in", libc::O_RDONLY, "open");
    r.stat(At::Cwd, "in", true, "stat"); // Stat ⊂ already reported accesses
    assert_eq!(r.take_static().len(), 1);
}

#[test]
fn write_poisons_the_read_cache() {
    let (_keep, root) = tmp_repo();
    std::fs::write(format!("{root}/f"), b"x").unwrap();
    let mut r = static_recorder(&root);
    let ctx = r.open(At::Cwd, "f", libc::O_WRONLY | libc::O_TRUNC, "open");
    r.confirm(ctx.solved.loc, true);
    r.open(At::Cwd, "f", libc::O_RDONLY, "open"); // own write: not a dep anymore
    let reports = r.take_static();
    let accesses: Vec<_> = reports.iter().filter(|r| r.kind() == AccessKind::Access).collect();
    assert_eq!(accesses.len(), 1);
    assert_eq!(accesses[0].digest.write, Bool3::Maybe);
}

#[test]
fn accesses_outside_every_domain_are_ignored() {
    let (_keep, root) = tmp_repo();
    let mut r = static_recorder(&root);
    r.open(At::Cwd, "/elsewhere/file", libc::O_RDONLY, "open");
    r.stat(At::Cwd, "/elsewhere/file", true, "stat");
    assert!(r.take_static().is_empty());
}

#[test]
fn tmp_access_reports_tmp_once_and_no_dep() {
    let (_keep, root) = tmp_repo();
    let mut r = static_recorder(&root);
    let tmp = format!("{root}/.ferret/tmp/scratch");
    let ctx = r.open(At::Cwd, &tmp, libc::O_WRONLY | libc::O_CREAT, "open");
    assert_eq!(ctx.solved.loc, FileLoc::Tmp);
    r.open(At::Cwd, &format!("{root}/.ferret/tmp/other"), libc::O_WRONLY | libc::O_CREAT, "open");
    let reports = r.take_static();
    assert_eq!(reports.iter().filter(|r| r.kind() == AccessKind::Tmp).count(), 1);
    assert_eq!(reports.iter().filter(|r| r.kind() == AccessKind::Access).count(), 0);
}

#[test]
fn unlink_reports_a_write_without_accesses() {
    let (_keep, root) = tmp_repo();
    std::fs::write(format!("{root}/victim"), b"x").unwrap();
    let mut r = static_recorder(&root);
    let ctx = r.unlnk(At::Cwd, "victim", false, "unlink");
    assert_eq!(ctx.loc, FileLoc::Repo);
    let reports = r.take_static();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].digest.write, Bool3::Maybe);
    assert!(reports[0].digest.accesses.is_empty());
}

#[test]
fn rename_scatters_reads_unlinks_and_writes() {
    let (_keep, root) = tmp_repo();
    std::fs::create_dir(format!("{root}/srcdir")).unwrap();
    std::fs::write(format!("{root}/srcdir/a"), b"x").unwrap();
    std::fs::write(format!("{root}/srcdir/b"), b"y").unwrap();
    let mut r = static_recorder(&root);
    r.rename((At::Cwd, "srcdir"), (At::Cwd, "dstdir"), false, false, "rename");
    let reports = r.take_static();
    // one unlink group (src files), one target group (dst files), two guards
    let unlnk: Vec<_> = reports
        .iter()
        .filter(|r| r.kind() == AccessKind::Access && r.digest.write == Bool3::Maybe && !r.digest.accesses.is_empty())
        .collect();
    assert_eq!(unlnk.len(), 1);
    let mut unlinked: Vec<_> = unlnk[0].files.iter().map(|(f, _)| f.clone()).collect();
    unlinked.sort();
    assert_eq!(unlinked, vec!["srcdir/a", "srcdir/b"]);
    let targets: Vec<_> = reports
        .iter()
        .filter(|r| r.kind() == AccessKind::Access && r.digest.write == Bool3::Maybe && r.digest.accesses.is_empty())
        .collect();
    assert_eq!(targets.len(), 1);
    let mut written: Vec<_> = targets[0].files.iter().map(|(f, _)| f.clone()).collect();
    written.sort();
    assert_eq!(written, vec!["dstdir/a", "dstdir/b"]);
    assert_eq!(reports.iter().filter(|r| r.kind() == AccessKind::Guard).count(), 2);
}

#[test]
fn parallel_groups_get_one_id() {
    let (_keep, root) = tmp_repo();
    std::fs::create_dir(format!("{root}/d")).unwrap();
    std::fs::write(format!("{root}/d/a"), b"x").unwrap();
    std::fs::write(format!("{root}/d/b"), b"y").unwrap();
    let mut r = static_recorder(&root);
    r.rename((At::Cwd, "d"), (At::Cwd, "/elsewhere/d"), false, false, "rename");
    let reports = r.take_static();
    let grouped: Vec<_> = reports.iter().filter(|r| r.files.len() > 1).collect();
    assert!(!grouped.is_empty());
    for g in grouped {
        assert_ne!(g.parallel_id, 0);
    }
}

#[test]
fn backdoor_queries_do_not_touch_the_filesystem() {
    let (_keep, root) = tmp_repo();
    let mut r = static_recorder(&root);
    let ctx = r.readlink(At::Fd(BACKDOOR_FD), "autodep", "readlink");
    assert_eq!(ctx.backdoor, Some(vec![b'1']));
    let ctx = r.readlink(At::Fd(BACKDOOR_FD), "disable", "readlink");
    assert_eq!(ctx.backdoor, Some(vec![]));
    assert!(!r.enabled());
    let ctx = r.readlink(At::Fd(BACKDOOR_FD), "enable", "readlink");
    assert_eq!(ctx.backdoor, Some(vec![]));
    assert!(r.enabled());
    assert!(r.take_static().is_empty());
}

#[test]
fn symlink_traversal_records_the_link_and_the_file() {
    let (_keep, root) = tmp_repo();
    std::fs::create_dir_all(format!("{root}/a")).unwrap();
    std::fs::create_dir_all(format!("{root}/d/e")).unwrap();
    std::fs::write(format!("{root}/d/e/c"), b"payload").unwrap();
    std::os::unix::fs::symlink("../d/e", format!("{root}/a/b")).unwrap();
    let mut r = static_recorder(&root);
    r.open(At::Cwd, "a/b/c", libc::O_RDONLY, "open");
    let reports = r.take_static();
    let mut files: Vec<String> = reports
        .iter()
        .flat_map(|r| r.files.iter().map(|(f, _)| f.clone()))
        .collect();
    files.sort();
    assert_eq!(files, vec!["a/b".to_string(), "d/e/c".to_string()]);
}

#[test]
fn search_records_every_attempted_entry() {
    let (_keep, root) = tmp_repo();
    std::fs::create_dir_all(format!("{root}/bin1")).unwrap();
    std::fs::create_dir_all(format!("{root}/bin2")).unwrap();
    let exe = format!("{root}/bin2/tool");
    std::fs::write(&exe, b"#!/bin/sh\n").unwrap();
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
    let mut r = static_recorder(&root);
    let path_var = format!("{root}/bin1:{root}/bin2");
    let found = r.search("tool", Some(&path_var), true, "execvp");
    assert_eq!(found, Some(format!("{root}/bin2/tool")));
    let reports = r.take_static();
    let mut files: Vec<String> = reports
        .iter()
        .flat_map(|r| r.files.iter().map(|(f, _)| f.clone()))
        .collect();
    files.sort();
    // both the miss and the hit are deps: adding bin1/tool must invalidate
    assert_eq!(files, vec!["bin1/tool".to_string(), "bin2/tool".to_string()]);
}
