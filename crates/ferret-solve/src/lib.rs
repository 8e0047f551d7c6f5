//! Path resolution against the build engine's virtual filesystem view.
//!
//! The engine layers several domains over the plain filesystem: the
//! repository, an optional set of source dirs, a scratch (tmp) dir that may
//! be presented to jobs under a different name, the engine's admin dir and
//! /proc. [`RealPath`] turns any `(dirfd, path)` pair a job can utter into a
//! canonical real path plus a classification among those domains, recording
//! every symlink traversed inside the dependency domains along the way.
//!
//! Paths are handled as plain `String`s throughout: the resolver works on
//! byte-exact path text (including non-normalized user input) and must not
//! round-trip through any normalizing type.

mod real_path;

pub use real_path::{At, RealPath, SolveReport};

use ferret_proto::{FileSig, FileTag};
use std::collections::HashSet;
use std::os::unix::ffi::OsStrExt;

/// Resolver-side failures. Resolution itself never fails (it reports); these
/// only arise on auxiliary operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SolveError {
    /// Executing an interpreter through a tmp-mapped path would require
    /// rewriting file contents.
    #[error("executing {path} would traverse the tmp mapping along its interpreter path")]
    MappedInterpreter { path: String },

    #[error("cannot determine cwd")]
    NoCwd,
}

// =============================================================================
// Canonical path algebra
// =============================================================================

/// True if `name` contains no empty, `.` or internal `..` component.
/// A leading run of `..` components is accepted on relative names.
pub fn is_canon(name: &str) -> bool {
    #[derive(PartialEq)]
    enum St {
        First,
        Empty,
        Dot,
        DotDot,
        Plain,
    }
    let mut accept_dot_dot = true;
    let mut state = St::First;
    for c in name.bytes() {
        match c {
            b'/' => {
                match state {
                    St::Empty | St::Dot => return false,
                    St::DotDot => {
                        if !accept_dot_dot {
                            return false;
                        }
                    }
                    // seen from '/', First is like Plain
                    St::First | St::Plain => accept_dot_dot = false, // .. only accepted as relative prefix
                }
                state = St::Empty;
            }
            b'.' => {
                state = match state {
                    St::First | St::Empty => St::Dot,
                    St::Dot => St::DotDot,
                    St::DotDot | St::Plain => St::Plain,
                };
            }
            _ => state = St::Plain,
        }
    }
    !matches!(state, St::Dot | St::DotDot)
}

/// Dir part of `file`, without trailing `/`; empty if `file` has no `/`.
pub fn dir_name(file: &str) -> &str {
    match file.rfind('/') {
        Some(sep) => &file[..sep],
        None => "",
    }
}

/// Last component of `file`.
pub fn base_name(file: &str) -> &str {
    match file.rfind('/') {
        Some(sep) => &file[sep + 1..],
        None => file,
    }
}

/// A name is absolute if it starts with `/`. The empty name stands for the
/// filesystem root and is absolute.
pub fn is_abs(name: &str) -> bool {
    name.is_empty() || name.starts_with('/')
}

/// Same for dir names carrying a trailing `/` (where empty means relative).
pub fn is_abs_s(name_s: &str) -> bool {
    name_s.starts_with('/')
}

/// A name is local if it stays under its origin (no absolute, no `..` escape).
pub fn is_lcl(name: &str) -> bool {
    !(is_abs(name) || name.starts_with("../") || name == "..")
}

/// Return `file` (expressed from `dir_s`'s origin) as seen from `dir_s`.
/// `dir_s` carries a trailing `/`. Inverse of [`mk_glb`] on canonical input.
pub fn mk_lcl(file: &str, dir_s: &str) -> String {
    debug_assert_eq!(is_abs(file), is_abs_s(dir_s), "{file} vs {dir_s}");
    debug_assert!(dir_s.is_empty() || dir_s.ends_with('/'), "{dir_s}");
    let fb = file.as_bytes();
    let db = dir_s.as_bytes();
    let mut last_slash1 = 0;
    for i in 0..fb.len() {
        if db.get(i) != Some(&fb[i]) {
            break;
        }
        if fb[i] == b'/' {
            last_slash1 = i + 1;
        }
    }
    let mut res = String::new();
    for c in dir_s[last_slash1..].bytes() {
        if c == b'/' {
            res.push_str("../");
        }
    }
    res.push_str(&file[last_slash1..]);
    res
}

/// Return `file` (expressed from `dir_s`) as seen from `dir_s`'s origin.
pub fn mk_glb(file: &str, dir_s: &str) -> String {
    if is_abs(file) {
        return file.to_string();
    }
    let mut d = dir_s;
    let mut f = file;
    while let Some(rest) = f.strip_prefix("../") {
        f = rest;
        d = &d[..d.len() - 1]; // suppress ending /
        d = match d.rfind('/') {
            Some(last) => &d[..last + 1], // keep new ending /
            None => "",
        };
    }
    format!("{d}{f}")
}

/// Return `file` (expressed from `dir_s`) as absolute. `dir_s` must be.
pub fn mk_abs(file: &str, dir_s: &str) -> String {
    debug_assert!(is_abs_s(dir_s), "{dir_s}");
    mk_glb(file, dir_s)
}

/// Localize `file` w.r.t. `dir_s` when both live in the same space.
pub fn mk_rel(file: &str, dir_s: &str) -> String {
    if is_abs(file) == is_abs_s(dir_s) {
        mk_lcl(file, dir_s)
    } else {
        file.to_string()
    }
}

// =============================================================================
// File info
// =============================================================================

/// What lstat tells us about a file, reduced to what the engine cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileInfo {
    pub tag: FileTag,
    pub sz: u64,
    pub mtime_ns: u64,
}

impl FileInfo {
    /// Stat `path`, following the final symlink iff `!no_follow`.
    pub fn of(path: &str, no_follow: bool) -> Self {
        let md = if no_follow {
            std::fs::symlink_metadata(path)
        } else {
            std::fs::metadata(path)
        };
        match md {
            Ok(md) => Self::from_metadata(&md),
            Err(_) => Self::default(),
        }
    }

    /// Stat relative to an open directory descriptor.
    pub fn at(dirfd: i32, path: &str, no_follow: bool) -> Self {
        let c_path = match std::ffi::CString::new(path) {
            Ok(p) => p,
            Err(_) => return Self::default(),
        };
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        let mut flags = libc::AT_EMPTY_PATH;
        if no_follow {
            flags |= libc::AT_SYMLINK_NOFOLLOW;
        }
        let rc = unsafe { libc::fstatat(dirfd, c_path.as_ptr(), &mut st, flags) };
        if rc != 0 {
            return Self::default();
        }
        let mode = st.st_mode;
        let tag = if mode & libc::S_IFMT == libc::S_IFREG {
            if mode & libc::S_IXUSR as libc::mode_t != 0 {
                FileTag::Exe
            } else if st.st_size == 0 {
                FileTag::Empty
            } else {
                FileTag::Reg
            }
        } else if mode & libc::S_IFMT == libc::S_IFLNK {
            FileTag::Lnk
        } else if mode & libc::S_IFMT == libc::S_IFDIR {
            FileTag::Dir
        } else {
            FileTag::None
        };
        FileInfo {
            tag,
            sz: st.st_size as u64,
            mtime_ns: st.st_mtime as u64 * 1_000_000_000 + st.st_mtime_nsec as u64,
        }
    }

    fn from_metadata(md: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        let tag = if md.file_type().is_symlink() {
            FileTag::Lnk
        } else if md.is_dir() {
            FileTag::Dir
        } else if md.is_file() {
            if md.mode() & libc::S_IXUSR as u32 != 0 {
                FileTag::Exe
            } else if md.len() == 0 {
                FileTag::Empty
            } else {
                FileTag::Reg
            }
        } else {
            FileTag::None
        };
        FileInfo {
            tag,
            sz: md.len(),
            mtime_ns: md.mtime() as u64 * 1_000_000_000 + md.mtime_nsec() as u64,
        }
    }

    pub fn exists(&self) -> bool {
        self.tag.is_target()
    }

    pub fn sig(&self) -> FileSig {
        FileSig::new(self.tag, self.mtime_ns, self.sz)
    }
}

/// Content digest of the file at `path`, never following a final symlink
/// (a link's digest covers its target text, domain-separated from file
/// content so a link to `x` and a file containing `x` stay distinct).
pub fn crc_of(path: &str) -> ferret_proto::Crc {
    use ferret_proto::{ContentHash, Crc};
    let fi = FileInfo::of(path, true);
    match fi.tag {
        FileTag::None | FileTag::Dir => Crc::None,
        FileTag::Empty => Crc::Empty,
        FileTag::Lnk => match read_lnk(path) {
            Some(target) => {
                let mut h = blake3::Hasher::new();
                h.update(b"lnk\0");
                h.update(target.as_bytes());
                Crc::Plain(ContentHash(*h.finalize().as_bytes()))
            }
            None => Crc::None,
        },
        FileTag::Reg | FileTag::Exe => match std::fs::read(path) {
            Ok(content) => {
                if content.is_empty() {
                    Crc::Empty
                } else {
                    Crc::Plain(ContentHash::from_bytes(&content))
                }
            }
            Err(_) => Crc::None,
        },
    }
}

/// Read a symlink's target; `None` if `path` is not a readable link.
pub fn read_lnk(path: &str) -> Option<String> {
    let target = std::fs::read_link(path).ok()?;
    Some(String::from_utf8_lossy(target.as_os_str().as_bytes()).into_owned())
}

/// The engine-tracked cwd; empty string stands for the filesystem root.
pub fn cwd() -> Result<String, SolveError> {
    let cwd = std::env::current_dir().map_err(|_| SolveError::NoCwd)?;
    let res = String::from_utf8_lossy(cwd.as_os_str().as_bytes()).into_owned();
    if res == "/" {
        Ok(String::new())
    } else {
        Ok(res)
    }
}

// =============================================================================
// NFS guard
// =============================================================================

/// Forces close-to-open coherence on uphill dirs when dirs are not reliable.
///
/// NFS guarantees close-to-open coherence on files, not on the dirs leading
/// to them: before accessing a file produced on another host, its dir must be
/// opened; after modifying one, the dir must be closed again.
#[derive(Debug, Default)]
pub struct NfsGuard {
    pub reliable_dirs: bool,
    fetched_dirs: HashSet<String>,
    to_stamp_dirs: HashSet<String>,
}

impl NfsGuard {
    pub fn new(reliable_dirs: bool) -> Self {
        NfsGuard {
            reliable_dirs,
            fetched_dirs: HashSet::new(),
            to_stamp_dirs: HashSet::new(),
        }
    }

    /// Call before any access to `file` or its inode if it may have been
    /// produced remotely.
    pub fn access(&mut self, file: &str) {
        if !self.reliable_dirs && !file.is_empty() {
            self.access_dir(dir_name(file).to_string());
        }
    }

    /// Call before any modification to `file` or its inode.
    pub fn change(&mut self, file: &str) {
        if !self.reliable_dirs && !file.is_empty() {
            let dir = dir_name(file).to_string();
            self.access_dir(dir.clone());
            self.to_stamp_dirs.insert(dir);
        }
    }

    fn access_dir(&mut self, dir: String) {
        self.access(&dir); // the dir's own dir must be coherent first
        if self.fetched_dirs.insert(dir.clone()) {
            protect(&dir); // open forces close-to-open coherence, close is useless
        }
    }

    pub fn close(&mut self) {
        for d in self.to_stamp_dirs.drain() {
            protect(&d); // close forces coherence, open is useless
        }
    }
}

impl Drop for NfsGuard {
    fn drop(&mut self) {
        self.close();
    }
}

fn protect(dir: &str) {
    use std::os::unix::fs::OpenOptionsExt;
    let dir = if dir.is_empty() { "." } else { dir };
    let _ = std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECTORY | libc::O_NOATIME)
        .open(dir);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canon_recognizes_clean_names() {
        assert!(is_canon(""));
        assert!(is_canon("a/b/c"));
        assert!(is_canon("/a/b/c"));
        assert!(is_canon("a/b/")); // dir form
        assert!(is_canon("../../a")); // leading .. on relative names
        assert!(!is_canon("a//b"));
        assert!(!is_canon("a/./b"));
        assert!(!is_canon("a/../b")); // internal ..
        assert!(!is_canon("a/b/."));
        assert!(!is_canon("/../a")); // .. from the root
    }

    #[test]
    fn dir_and_base_name() {
        assert_eq!(dir_name("a/b/c"), "a/b");
        assert_eq!(dir_name("c"), "");
        assert_eq!(base_name("a/b/c"), "c");
        assert_eq!(base_name("c"), "c");
    }

    #[test]
    fn lcl_glb_round_trip() {
        // mk_lcl then mk_glb is the identity on canonical names
        for (file, dir_s) in [
            ("/repo/a/b", "/repo/x/"),
            ("/repo/a/b", "/repo/a/"),
            ("a/b/c", "a/d/"),
            ("/other/f", "/repo/sub/"),
        ] {
            let lcl = mk_lcl(file, dir_s);
            assert_eq!(mk_glb(&lcl, dir_s), file, "via {lcl}");
        }
    }

    #[test]
    fn glb_resolves_dot_dot_prefix() {
        assert_eq!(mk_glb("../x", "/repo/sub/"), "/repo/x");
        assert_eq!(mk_glb("../../x", "/repo/a/b/"), "/repo/x");
        assert_eq!(mk_glb("x", "/repo/"), "/repo/x");
        assert_eq!(mk_glb("/abs", "/repo/"), "/abs");
    }

    #[test]
    fn mk_rel_only_applies_within_one_space() {
        assert_eq!(mk_rel("/repo/a", "/repo/"), "a");
        assert_eq!(mk_rel("rel/a", "/repo/"), "rel/a"); // space mismatch: untouched
    }

    #[test]
    fn crc_depends_only_on_content_and_kind() {
        use ferret_proto::Crc;
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_str().unwrap();
        std::fs::write(format!("{base}/a"), b"same bytes").unwrap();
        std::fs::write(format!("{base}/b"), b"same bytes").unwrap();
        std::fs::write(format!("{base}/empty"), b"").unwrap();
        std::os::unix::fs::symlink("a", format!("{base}/lnk")).unwrap();
        // recomputation over the same bytes yields the same value
        assert_eq!(crc_of(&format!("{base}/a")), crc_of(&format!("{base}/a")));
        assert_eq!(crc_of(&format!("{base}/a")), crc_of(&format!("{base}/b")));
        assert_eq!(crc_of(&format!("{base}/empty")), Crc::Empty);
        assert_eq!(crc_of(&format!("{base}/absent")), Crc::None);
        // a link to "a" and a file containing "a" must stay distinct
        std::fs::write(format!("{base}/texty"), b"a").unwrap();
        assert_ne!(crc_of(&format!("{base}/lnk")), crc_of(&format!("{base}/texty")));
        assert!(matches!(crc_of(&format!("{base}/lnk")), Crc::Plain(_)));
    }

    #[test]
    fn file_info_tags() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_str().unwrap();
        std::fs::write(format!("{base}/plain"), b"content").unwrap();
        std::fs::write(format!("{base}/empty"), b"").unwrap();
        std::os::unix::fs::symlink("plain", format!("{base}/lnk")).unwrap();
        assert_eq!(FileInfo::of(&format!("{base}/plain"), true).tag, FileTag::Reg);
        assert_eq!(FileInfo::of(&format!("{base}/empty"), true).tag, FileTag::Empty);
        assert_eq!(FileInfo::of(&format!("{base}/lnk"), true).tag, FileTag::Lnk);
        assert_eq!(FileInfo::of(&format!("{base}/lnk"), false).tag, FileTag::Reg);
        assert_eq!(FileInfo::of(base, true).tag, FileTag::Dir);
        assert_eq!(FileInfo::of(&format!("{base}/absent"), true).tag, FileTag::None);
        assert!(!FileInfo::of(&format!("{base}/absent"), true).exists());
    }
}
