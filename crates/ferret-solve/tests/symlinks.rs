//! Resolution against real symlink trees.

use ferret_proto::{AutodepEnv, Bool3, FileLoc, LnkSupport};
use ferret_solve::{At, RealPath};

fn repo_env(root: &str) -> AutodepEnv {
    AutodepEnv {
        root_dir: root.to_string(),
        tmp_dir: format!("{root}/.ferret/tmp"),
        lnk_support: LnkSupport::Full,
        reliable_dirs: true,
        admin_dir: ".ferret".to_string(),
        ..Default::default()
    }
}

/// A rule reading `a/b/c` where `a/b` is a symlink to `d/e` must depend on
/// the link itself and on the resolved file.
#[test]
fn uphill_link_is_recorded_and_followed() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let root = root.to_str().unwrap();
    std::fs::create_dir_all(format!("{root}/a")).unwrap();
    std::fs::create_dir_all(format!("{root}/d/e")).unwrap();
    std::fs::write(format!("{root}/d/e/c"), b"payload").unwrap();
    std::os::unix::fs::symlink("../d/e", format!("{root}/a/b")).unwrap();

    let rp = RealPath::with_cwd(repo_env(root), root.to_string(), 0);
    let sr = rp.solve(At::Cwd, "a/b/c", false);
    assert_eq!(sr.loc, FileLoc::Repo);
    assert_eq!(sr.real, "d/e/c");
    assert_eq!(sr.lnks, vec!["a/b".to_string()]);
}

#[test]
fn final_link_follow_vs_no_follow() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let root = root.to_str().unwrap();
    std::fs::write(format!("{root}/target"), b"x").unwrap();
    std::os::unix::fs::symlink("target", format!("{root}/lnk")).unwrap();

    let rp = RealPath::with_cwd(repo_env(root), root.to_string(), 0);

    let followed = rp.solve(At::Cwd, "lnk", false);
    assert_eq!(followed.real, "target");
    assert_eq!(followed.lnks, vec!["lnk".to_string()]);
    assert_eq!(followed.file_accessed, Bool3::Yes);

    let raw = rp.solve(At::Cwd, "lnk", true);
    assert_eq!(raw.real, "lnk");
    assert!(raw.lnks.is_empty());
}

#[test]
fn link_loop_returns_empty_real_with_gathered_links() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let root = root.to_str().unwrap();
    std::os::unix::fs::symlink("loop_b", format!("{root}/loop_a")).unwrap();
    std::os::unix::fs::symlink("loop_a", format!("{root}/loop_b")).unwrap();

    let rp = RealPath::with_cwd(repo_env(root), root.to_string(), 0);
    let sr = rp.solve(At::Cwd, "loop_a", false);
    assert!(sr.real.is_empty());
    assert!(!sr.lnks.is_empty()); // caller still declares these deps
}

#[test]
fn absolute_link_target_restarts_from_root() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let root = root.to_str().unwrap();
    std::fs::create_dir_all(format!("{root}/sub")).unwrap();
    std::fs::write(format!("{root}/sub/file"), b"x").unwrap();
    std::os::unix::fs::symlink(format!("{root}/sub"), format!("{root}/alias")).unwrap();

    let rp = RealPath::with_cwd(repo_env(root), root.to_string(), 0);
    let sr = rp.solve(At::Cwd, "alias/file", false);
    assert_eq!(sr.real, "sub/file");
    assert_eq!(sr.lnks, vec!["alias".to_string()]);
}

#[test]
fn non_existent_intermediate_still_canonicalizes() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let root = root.to_str().unwrap();

    let rp = RealPath::with_cwd(repo_env(root), root.to_string(), 0);
    let sr = rp.solve(At::Cwd, "no/such/dir/../file", false);
    assert_eq!(sr.real, "no/such/file");
    assert_eq!(sr.loc, FileLoc::Repo);
}
