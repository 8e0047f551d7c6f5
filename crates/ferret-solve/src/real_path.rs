//! The resolution walk itself.
//!
//! Strong performance efforts are inherited from the reference algorithm:
//! copies of the input path are avoided until a symlink forces one, and no
//! cache sits in front of the walk (checking a cache would cost as much as
//! redoing the work, syscalls aside).

use crate::{cwd, is_abs, mk_abs, mk_glb, read_lnk, SolveError};
use ferret_proto::{Accesses, AutodepEnv, Bool3, FileLoc, LnkSupport};
use std::os::unix::fs::OpenOptionsExt;

const PROC: &str = "/proc";

/// Result of one resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SolveReport {
    /// Canonical path: repo-relative if `loc` is `Repo`, expressed through
    /// the source dir if `SrcDirs`, absolute otherwise. Empty on a symlink
    /// loop (the links gathered so far are still valid deps).
    pub real: String,
    /// Symlinks traversed inside the dependency domains, in walk order.
    pub lnks: Vec<String>,
    /// `Yes` if the final component was accessed as a symlink, `Maybe` if
    /// some uphill dir may have been.
    pub file_accessed: Bool3,
    pub loc: FileLoc,
    /// True if the tmp mapping was used anywhere along the walk.
    pub mapped: bool,
}

/// Anchor of a relative path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum At {
    Cwd,
    Fd(i32),
}

/// Tracks whether a checked path currently diverges from a domain prefix.
/// Updated incrementally as the checked path is lengthened or shortened.
#[derive(Debug, Clone, Copy)]
struct Dvg {
    ok: bool,
    dvg: usize,
}

impl Dvg {
    fn new(domain: &str, chk: &str) -> Self {
        let mut d = Dvg { ok: false, dvg: 0 };
        d.update(domain, chk);
        d
    }

    fn update(&mut self, domain: &str, chk: &str) {
        let start = self.dvg;
        self.ok = domain.len() <= chk.len();
        self.dvg = if self.ok { domain.len() } else { chk.len() };
        let db = domain.as_bytes();
        let cb = chk.as_bytes();
        for i in start..self.dvg {
            if db[i] != cb[i] {
                self.ok = false;
                self.dvg = i;
                return;
            }
        }
        if domain.len() < chk.len() {
            self.ok = cb[domain.len()] == b'/';
        }
    }

    fn ok(&self) -> bool {
        self.ok
    }
}

fn symloop_max() -> usize {
    let res = unsafe { libc::sysconf(libc::_SC_SYMLOOP_MAX) };
    if res >= 0 {
        res as usize
    } else {
        8 // _POSIX_SYMLOOP_MAX
    }
}

/// The resolver proper. One instance per recorded process.
#[derive(Debug)]
pub struct RealPath {
    env: AutodepEnv,
    /// Pid of the observed process; 0 means self.
    pub pid: i32,
    /// Engine-tracked cwd, in view space, empty for the filesystem root.
    cwd: String,
    admin_dir: String,
    /// `tmp_view` when mapping is configured, else `tmp_dir`.
    tmp_view_eff: String,
    has_tmp_view: bool,
    abs_src_dirs: Vec<String>,
    root_dir_sz1: usize,
}

impl RealPath {
    /// `src_dirs` may be absolute or repo-relative but must be canonical;
    /// `tmp_dir` and `tmp_view` must be absolute and canonical.
    pub fn new(env: AutodepEnv, pid: i32) -> Result<Self, SolveError> {
        let cwd_ = if pid != 0 {
            read_lnk(&format!("/proc/{pid}/cwd")).ok_or(SolveError::NoCwd)?
        } else {
            cwd()?
        };
        Ok(Self::with_cwd(env, cwd_, pid))
    }

    /// `cwd_` is in disk space: it is translated to view space if it lies
    /// under the on-disk tmp dir.
    pub fn with_cwd(env: AutodepEnv, cwd_: String, pid: i32) -> Self {
        debug_assert!(is_abs(&env.root_dir), "{}", env.root_dir);
        debug_assert!(is_abs(&env.tmp_dir), "{}", env.tmp_dir);
        let has_tmp_view = !env.tmp_view.is_empty();
        let tmp_view_eff = if has_tmp_view {
            env.tmp_view.clone()
        } else {
            env.tmp_dir.clone()
        };
        let admin_dir = format!("{}/{}", env.root_dir, env.admin_dir);
        let abs_src_dirs = env
            .src_dirs
            .iter()
            .map(|sd| mk_glb(sd, &format!("{}/", env.root_dir)))
            .collect();
        let root_dir_sz1 = env.root_dir.len() + 1;
        let mut rp = RealPath {
            env,
            pid,
            cwd: String::new(),
            admin_dir,
            tmp_view_eff,
            has_tmp_view,
            abs_src_dirs,
            root_dir_sz1,
        };
        rp.chdir(cwd_);
        rp
    }

    pub fn env(&self) -> &AutodepEnv {
        &self.env
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    /// Record a cwd change. `dir` is in disk space, i.e. mapped in case of
    /// tmp mapping.
    pub fn chdir(&mut self, dir: String) {
        debug_assert!(is_abs(&dir), "{dir}");
        if self.has_tmp_view && dir.starts_with(&self.env.tmp_dir) {
            self.cwd = format!("{}{}", self.tmp_view_eff, &dir[self.env.tmp_dir.len()..]);
        } else if dir == "/" {
            self.cwd = String::new();
        } else {
            self.cwd = dir;
        }
    }

    fn find_src_idx(&self, real: &str) -> Option<usize> {
        self.abs_src_dirs.iter().position(|sd| real.starts_with(sd.as_str()))
    }

    /// Resolve `file` (relative to `at`) into a [`SolveReport`].
    ///
    /// The walk canonicalizes empty, `.` and `..` components, follows
    /// symlinks per the configured link support, applies the tmp mapping and
    /// classifies the result. A non-existent intermediate component does not
    /// stop the walk: no further links can be found under it, but `..` and
    /// empty segments still need cleaning up.
    pub fn solve(&self, at: At, file: &str, no_follow: bool) -> SolveReport {
        let n_max_lnks = symloop_max();
        let mut lnks: Vec<String> = Vec::new();
        let mut exists = true; // false once a non-existent component was seen
        let mut cur: String = file.to_string();
        let mut pos = usize::from(file.starts_with('/'));
        let mut real = String::with_capacity(file.len().max(64));
        if pos == 0 {
            // relative: anchor at cwd or at the dir designated by the fd
            match at {
                At::Cwd => real.push_str(&self.cwd),
                At::Fd(fd) => {
                    let anchor = if self.pid != 0 {
                        read_lnk(&format!("/proc/{}/fd/{fd}", self.pid))
                    } else {
                        read_lnk(&format!("/proc/self/fd/{fd}"))
                    };
                    let Some(mut anchor) = anchor else {
                        return SolveReport::default(); // user code may pass the strangest fd
                    };
                    if self.has_tmp_view && anchor.starts_with(&self.env.tmp_dir) {
                        anchor =
                            format!("{}{}", self.tmp_view_eff, &anchor[self.env.tmp_dir.len()..]);
                    }
                    if !anchor.starts_with('/') {
                        return SolveReport::default();
                    }
                    if anchor.len() == 1 {
                        anchor.clear();
                    }
                    real.push_str(&anchor);
                }
            }
        }
        let mut in_repo = Dvg::new(&self.env.root_dir, &real);
        let mut in_tmp = Dvg::new(&self.tmp_view_eff, &real);
        let mut in_admin = Dvg::new(&self.admin_dir, &real);
        let mut in_proc = Dvg::new(PROC, &real);
        let mut is_in_tmp = !self.tmp_view_eff.is_empty() && in_tmp.ok();
        let mut mapped = self.has_tmp_view && is_in_tmp;
        let mut n_lnks = 0usize;
        // loop invariant: the accessed file is real + '/' + cur[pos..]
        let mut first = true;
        while pos <= cur.len() {
            if !first {
                // domains (except admin) start strictly inside: their root
                // dir is not part of the domain. The admin tracker must also
                // see every shortening of real before the next growth, or
                // its verified-prefix length would go stale.
                in_repo.update(&self.env.root_dir, &real);
                in_tmp.update(&self.tmp_view_eff, &real);
                in_proc.update(PROC, &real);
                in_admin.update(&self.admin_dir, &real);
                is_in_tmp = !self.tmp_view_eff.is_empty() && in_tmp.ok();
            }
            first = false;
            let (end, last) = match cur[pos..].find('/') {
                Some(i) => (pos + i, false),
                None => (cur.len(), true),
            };
            let comp = &cur[pos..end];
            pos = end + 1;
            if comp.is_empty() || comp == "." {
                continue;
            }
            if comp == ".." {
                if !real.is_empty() {
                    let cut = real.rfind('/').unwrap_or(0);
                    real.truncate(cut);
                }
                continue;
            }
            let prev_real_size = real.len();
            real.push('/');
            real.push_str(comp);
            // the admin domain starts at itself: the admin dir is part of it
            in_admin.update(&self.admin_dir, &real);
            if !exists {
                continue; // no hope of a link, but go on cleaning components
            }
            if no_follow && last {
                continue;
            }
            let handle_lnk = if is_in_tmp {
                true // tmp may lie within repo or admin, it wins
            } else if in_admin.ok() {
                false
            } else if in_proc.ok() {
                true
            } else if !in_repo.ok() {
                false
            } else {
                // NFS does the coherence job at the last level; uphill dirs
                // need an open to be reliable
                if !last && !self.env.reliable_dirs {
                    let opened = std::fs::OpenOptions::new()
                        .read(true)
                        .custom_flags(libc::O_DIRECTORY | libc::O_NOFOLLOW | libc::O_NOATIME)
                        .open(&real)
                        .is_ok();
                    if opened {
                        continue; // a dir for sure, no link to handle
                    }
                }
                match self.env.lnk_support {
                    LnkSupport::None => false,
                    LnkSupport::File => last,
                    LnkSupport::Full => true,
                }
            };
            if !handle_lnk {
                continue;
            }
            let nxt = if self.has_tmp_view && is_in_tmp {
                mapped = true;
                read_lnk(&format!(
                    "{}{}",
                    self.env.tmp_dir,
                    &real[self.tmp_view_eff.len()..]
                ))
            } else {
                read_lnk(&real)
            };
            if !is_in_tmp && !in_proc.ok() {
                if in_repo.ok() {
                    if real.len() < self.root_dir_sz1 {
                        continue; // at repo root, no sym link to handle
                    }
                    if nxt.is_some() {
                        lnks.push(real[self.root_dir_sz1..].to_string());
                    }
                } else {
                    match self.find_src_idx(&real) {
                        None => continue,
                        Some(i) => {
                            if nxt.is_some() {
                                lnks.push(format!(
                                    "{}{}",
                                    self.env.src_dirs[i],
                                    &real[self.abs_src_dirs[i].len()..]
                                ));
                            }
                        }
                    }
                }
            }
            let Some(mut nxt) = nxt else {
                // distinguish "not a link" from "does not exist"
                if let Err(e) = std::fs::symlink_metadata(disk_path(self, &real)) {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        exists = false;
                    }
                }
                // no dep for intermediate non-link dirs: they are depended
                // on indirectly through the final accessed file
                continue;
            };
            n_lnks += 1;
            if n_lnks > n_max_lnks {
                return SolveReport {
                    real: String::new(),
                    lnks,
                    file_accessed: Bool3::No,
                    loc: FileLoc::Ext,
                    mapped,
                }; // same loop check as the system's
            }
            if !last {
                nxt.push('/');
                nxt.push_str(&cur[end + 1..]);
            }
            if nxt.starts_with('/') {
                pos = 1;
                real.clear(); // absolute target: flush real
            } else {
                pos = 0;
                real.truncate(prev_real_size); // target is relative to the containing dir
            }
            cur = nxt;
        }
        // classify; admin is typically in repo and tmp might be
        if is_in_tmp {
            if !self.has_tmp_view {
                return SolveReport {
                    real,
                    lnks,
                    file_accessed: Bool3::No,
                    loc: FileLoc::Tmp,
                    mapped: false,
                };
            }
            let real = format!("{}{}", self.env.tmp_dir, &real[self.tmp_view_eff.len()..]);
            return SolveReport {
                real,
                lnks,
                file_accessed: Bool3::No,
                loc: FileLoc::Tmp,
                mapped: true,
            };
        }
        if in_proc.ok() {
            return SolveReport {
                real,
                lnks,
                file_accessed: Bool3::No,
                loc: FileLoc::Proc,
                mapped,
            };
        }
        if in_admin.ok() {
            return SolveReport {
                real,
                lnks,
                file_accessed: Bool3::No,
                loc: FileLoc::Admin,
                mapped,
            };
        }
        if in_repo.ok() {
            if real.len() < self.root_dir_sz1 {
                return SolveReport {
                    real,
                    lnks,
                    file_accessed: Bool3::No,
                    loc: FileLoc::Root,
                    mapped,
                };
            }
            let real = real[self.root_dir_sz1..].to_string();
            let file_accessed = if self.env.lnk_support >= LnkSupport::File && !no_follow {
                Bool3::Yes
            } else if self.env.lnk_support >= LnkSupport::Full && real.contains('/') {
                Bool3::Maybe
            } else {
                Bool3::No
            };
            return SolveReport {
                real,
                lnks,
                file_accessed,
                loc: FileLoc::Repo,
                mapped,
            };
        }
        if let Some(i) = self.find_src_idx(&real) {
            let real = format!(
                "{}{}",
                self.env.src_dirs[i],
                &real[self.abs_src_dirs[i].len()..]
            );
            let file_accessed = if self.env.lnk_support >= LnkSupport::File && !no_follow {
                Bool3::Yes
            } else if self.env.lnk_support >= LnkSupport::Full
                && real[self.env.src_dirs[i].len()..].contains('/')
            {
                Bool3::Maybe
            } else {
                Bool3::No
            };
            return SolveReport {
                real,
                lnks,
                file_accessed,
                loc: FileLoc::SrcDirs,
                mapped,
            };
        }
        SolveReport {
            real,
            lnks,
            file_accessed: Bool3::No,
            loc: FileLoc::Ext,
            mapped,
        }
    }

    /// Interpreter scan for exec: follow `#!` lines (4 levels, as execve
    /// does) and return the read accesses gathered along the way. `sr` is
    /// updated to designate the last interpreter.
    pub fn exec(&self, sr: &mut SolveReport) -> Result<Vec<(String, Accesses)>, SolveError> {
        let mut res: Vec<(String, Accesses)> = Vec::new();
        let root_dir_s = format!("{}/", self.env.root_dir);
        for _ in 0..=4 {
            for l in sr.lnks.drain(..) {
                res.push((l, Accesses::LNK));
            }
            if !sr.loc.is_dep() && sr.loc != FileLoc::Tmp {
                break; // escaped the repo: nothing more to gather
            }
            if sr.mapped {
                return Err(SolveError::MappedInterpreter {
                    path: sr.real.clone(),
                });
            }
            let mut a = Accesses::REG;
            if sr.file_accessed == Bool3::Yes {
                a |= Accesses::LNK;
            }
            if sr.loc.is_dep() {
                res.push((sr.real.clone(), a));
            }
            let abs = mk_abs(&sr.real, &root_dir_s);
            let Ok(content) = std::fs::read(&abs) else {
                break;
            };
            if !content.starts_with(b"#!") {
                break;
            }
            // data beyond 255 chars are ignored, per man execve
            let line_end = content[2..]
                .iter()
                .take(255)
                .position(|&c| c == b'\n')
                .map(|i| 2 + i)
                .unwrap_or((2 + 255).min(content.len()));
            let line = String::from_utf8_lossy(&content[2..line_end]).into_owned();
            let interpreter = line
                .split([' ', '\0'])
                .next()
                .unwrap_or("")
                .to_string();
            if interpreter.is_empty() {
                break;
            }
            *sr = self.solve(At::Cwd, &interpreter, false);
        }
        Ok(res)
    }
}

/// View → disk translation for existence probes during the walk.
fn disk_path(rp: &RealPath, real: &str) -> String {
    if rp.has_tmp_view && real.starts_with(&rp.tmp_view_eff) {
        format!("{}{}", rp.env.tmp_dir, &real[rp.tmp_view_eff.len()..])
    } else {
        real.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(root: &str, tmp: &str) -> AutodepEnv {
        AutodepEnv {
            root_dir: root.to_string(),
            tmp_dir: tmp.to_string(),
            lnk_support: LnkSupport::Full,
            reliable_dirs: true,
            admin_dir: ".ferret".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn dvg_tracks_domain_membership() {
        let dom = "/repo";
        let mut d = Dvg::new(dom, "/repo/a");
        assert!(d.ok());
        d.update(dom, "/repo");
        assert!(!d.ok()); // the domain root is not part of the domain
        d.update(dom, "/repo/a/b");
        assert!(d.ok());
        d.update(dom, "/repository");
        assert!(!d.ok());
    }

    #[test]
    fn solve_cleans_components_without_touching_disk() {
        let rp = RealPath::with_cwd(env("/repo", "/tmp/x"), "/repo".to_string(), 0);
        let sr = rp.solve(At::Cwd, "a//b/./c/../d", true);
        assert_eq!(sr.real, "a/b/d");
        assert_eq!(sr.loc, FileLoc::Repo);
        assert!(sr.lnks.is_empty());
    }

    #[test]
    fn solve_classifies_domains() {
        let rp = RealPath::with_cwd(env("/repo", "/scratch"), "/repo".to_string(), 0);
        assert_eq!(rp.solve(At::Cwd, "/repo/f", true).loc, FileLoc::Repo);
        assert_eq!(rp.solve(At::Cwd, "/repo", true).loc, FileLoc::Root);
        assert_eq!(rp.solve(At::Cwd, "/scratch/f", true).loc, FileLoc::Tmp);
        assert_eq!(rp.solve(At::Cwd, "/proc/42/maps", true).loc, FileLoc::Proc);
        assert_eq!(rp.solve(At::Cwd, "/repo/.ferret/log", true).loc, FileLoc::Admin);
        assert_eq!(rp.solve(At::Cwd, "/elsewhere/f", true).loc, FileLoc::Ext);
    }

    #[test]
    fn solve_escape_through_dot_dot_leaves_repo() {
        let rp = RealPath::with_cwd(env("/repo", "/scratch"), "/repo/sub".to_string(), 0);
        let sr = rp.solve(At::Cwd, "../../etc/passwd", true);
        assert_eq!(sr.loc, FileLoc::Ext);
        assert_eq!(sr.real, "/etc/passwd");
    }

    #[test]
    fn tmp_view_maps_to_disk_and_flags() {
        let mut e = env("/repo", "/scratch/j17");
        e.tmp_view = "/tmp/job".to_string();
        let rp = RealPath::with_cwd(e, "/repo".to_string(), 0);
        let sr = rp.solve(At::Cwd, "/tmp/job/out.o", true);
        assert_eq!(sr.loc, FileLoc::Tmp);
        assert!(sr.mapped);
        assert_eq!(sr.real, "/scratch/j17/out.o");
    }

    #[test]
    fn chdir_translates_tmp_dir_to_view() {
        let mut e = env("/repo", "/scratch/j17");
        e.tmp_view = "/tmp/job".to_string();
        let mut rp = RealPath::with_cwd(e, "/repo".to_string(), 0);
        rp.chdir("/scratch/j17/w".to_string());
        assert_eq!(rp.cwd(), "/tmp/job/w");
        let sr = rp.solve(At::Cwd, "x", true);
        assert_eq!(sr.loc, FileLoc::Tmp);
        assert_eq!(sr.real, "/scratch/j17/w/x");
    }
}
