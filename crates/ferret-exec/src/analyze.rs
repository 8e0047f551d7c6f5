//! End-of-job analysis: partition the gathered accesses into deps and
//! targets, assign rule flags, compute content digests.

use crate::gather::Gather;
use ferret_proto::{
    Accesses, Bool3, Crc, DepDigest, FileSig, StartReply, TargetDigest, Tflags,
};
use ferret_solve::{FileInfo, NfsGuard};

/// Result of one analysis pass.
#[derive(Debug, Default)]
pub struct Analysis {
    pub deps: Vec<(String, DepDigest)>,
    pub targets: Vec<(String, TargetDigest)>,
    /// Indices into `targets` whose CRC must be computed.
    pub crc_queue: Vec<usize>,
    pub analysis_err: Vec<(String, String)>,
}

/// Minimal glob: `*` matches any run (including `/`), `?` one char. This is
/// the target-pattern language, not a shell.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    // classic two-pointer with backtracking on the last *
    let (mut pi, mut ni) = (0usize, 0usize);
    let (mut star, mut mark) = (usize::MAX, 0usize);
    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = pi;
            mark = ni;
            pi += 1;
        } else if star != usize::MAX {
            pi = star + 1;
            mark += 1;
            ni = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Flags the rule assigns to `file`: static deps are never legitimate
/// targets, then first matching target spec wins.
pub fn tflags_for(file: &str, start: &StartReply) -> Tflags {
    if start.static_deps.iter().any(|(d, _)| d == file) {
        return Tflags::unexpected();
    }
    for spec in &start.targets {
        let hit = if spec.tflags.contains(Tflags::STAR) {
            glob_match(&spec.pattern, file)
        } else {
            file == spec.pattern
        };
        if hit {
            return spec.tflags;
        }
    }
    Tflags::unexpected()
}

/// The dep view of the current access list, for mid-run ChkDeps queries.
pub fn current_deps(gather: &Gather) -> Vec<(String, DepDigest)> {
    let mut deps = Vec::with_capacity(gather.accesses.len());
    let mut prev_parallel = 0u64;
    for (file, info) in &gather.accesses {
        if info.write != Bool3::No {
            continue;
        }
        let parallel = info.parallel_id != 0 && info.parallel_id == prev_parallel;
        prev_parallel = info.parallel_id;
        deps.push((
            file.clone(),
            DepDigest {
                accesses: info.accesses,
                dflags: info.dflags,
                parallel,
                sig: info.sig,
                garbage: false,
            },
        ));
    }
    deps
}

/// Full end-of-job analysis. `root_dir` anchors repo-relative names for disk
/// interrogation.
pub fn analyze(gather: &Gather, start: &StartReply, root_dir: &str) -> Analysis {
    let mut out = Analysis::default();
    let mut prev_parallel = 0u64;
    // deps may have been produced on another host: force close-to-open
    // coherence on their dirs before trusting the inodes
    let mut nfs = NfsGuard::new(start.autodep_env.reliable_dirs);
    for (file, info) in &gather.accesses {
        let tflags = tflags_for(file, start);
        let mut accesses = info.accesses;
        if !tflags.contains(Tflags::STAT) {
            accesses = accesses & !Accesses::STAT;
        }
        if let Err(e) = tflags.chk() {
            out.analysis_err
                .push((format!("bad flags ({e})"), file.clone()));
            continue; // nothing sensible to do with such an access
        }
        let abs = format!("{root_dir}/{file}");
        nfs.access(&abs);
        let disk_sig = FileInfo::of(&abs, true).sig();
        // an announced but unconfirmed write: interrogate the disk
        let wrote = match info.write {
            Bool3::Yes => true,
            Bool3::Maybe => disk_sig != info.sig,
            Bool3::No => false,
        };
        if !wrote {
            let parallel = info.parallel_id != 0 && info.parallel_id == prev_parallel;
            prev_parallel = info.parallel_id;
            let mut dd = DepDigest {
                accesses,
                dflags: info.dflags,
                parallel,
                sig: info.sig,
                garbage: false,
            };
            if !accesses.is_empty() {
                // sig not coherent from first access to end of job: we do
                // not know what the job actually read
                dd.garbage = disk_sig != info.sig;
            }
            out.deps.push((file.clone(), dd));
        } else {
            let mut accesses = accesses;
            if !info.sig.exists() {
                accesses = Accesses::NONE; // nothing was readable before the write
            }
            let td = TargetDigest {
                accesses,
                write: wrote && !info.unlink,
                tflags,
                unlink: info.unlink,
                crc: Crc::Unknown,
            };
            if td.write && tflags.contains(Tflags::CRC) {
                out.crc_queue.push(out.targets.len());
            }
            out.targets.push((file.clone(), td));
        }
    }
    for p in &gather.panics {
        out.analysis_err.push((p.clone(), String::new()));
    }
    out
}

/// Compute the queued target CRCs on a small pool, sized to the queue.
/// Returns targets that turned out to be spuriously unlinked.
pub fn compute_crcs(root_dir: &str, analysis: &mut Analysis) -> Vec<String> {
    let queue: Vec<(usize, String)> = analysis
        .crc_queue
        .iter()
        .map(|&i| (i, format!("{root_dir}/{}", analysis.targets[i].0)))
        .collect();
    if queue.is_empty() {
        return Vec::new();
    }
    let n_threads = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(queue.len());
    let work = std::sync::Mutex::new(queue.into_iter());
    let results = std::sync::Mutex::new(Vec::<(usize, Crc)>::new());
    std::thread::scope(|s| {
        for _ in 0..n_threads {
            s.spawn(|| loop {
                let item = work.lock().unwrap().next();
                let Some((idx, path)) = item else { break };
                let crc = ferret_solve::crc_of(&path);
                results.lock().unwrap().push((idx, crc));
            });
        }
    });
    let mut spurious = Vec::new();
    for (idx, crc) in results.into_inner().unwrap() {
        if crc == Crc::None {
            spurious.push(analysis.targets[idx].0.clone());
        }
        analysis.targets[idx].1.crc = crc;
    }
    spurious
}

/// Signature of a repo file, as the engine wants to stamp injected deps.
pub fn sig_of(root_dir: &str, file: &str) -> FileSig {
    FileInfo::of(&format!("{root_dir}/{file}"), true).sig()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gather::Gather;
    use ferret_proto::{AccessDigest, AccessKind, AccessReport, Dflags, TargetSpec};

    fn start_with_targets(specs: Vec<(&str, Tflags)>) -> StartReply {
        StartReply {
            targets: specs
                .into_iter()
                .map(|(p, tflags)| TargetSpec {
                    pattern: p.to_string(),
                    tflags,
                })
                .collect(),
            ..Default::default()
        }
    }

    fn access(g: &mut Gather, file: &str, write: Bool3, accesses: Accesses) {
        let pending = g.access(&AccessReport {
            kind: AccessKind::Access as u8,
            files: vec![(file.to_string(), FileSig::default())],
            digest: AccessDigest {
                write,
                unlink: false,
                accesses,
                dflags: Dflags::default(),
            },
            ..Default::default()
        });
        if write != Bool3::No {
            g.confirm(&pending, true);
        }
    }

    #[test]
    fn glob_matching() {
        assert!(glob_match("*.o", "main.o"));
        assert!(glob_match("obj/*.o", "obj/a/b.o")); // * crosses /
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("*.o", "main.c"));
        assert!(glob_match("*", "anything"));
        assert!(!glob_match("a*b", "acx"));
    }

    #[test]
    fn deps_and_targets_are_partitioned() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_str().unwrap();
        std::fs::write(format!("{root}/out"), b"produced").unwrap();
        let start = start_with_targets(vec![("out", Tflags::WRITE | Tflags::CRC)]);
        let mut g = Gather::default();
        access(&mut g, "in", Bool3::No, Accesses::REG);
        access(&mut g, "out", Bool3::Yes, Accesses::NONE);
        let mut a = analyze(&g, &start, root);
        assert_eq!(a.deps.len(), 1);
        assert_eq!(a.deps[0].0, "in");
        assert_eq!(a.targets.len(), 1);
        assert_eq!(a.targets[0].0, "out");
        assert!(a.targets[0].1.write);
        assert_eq!(a.crc_queue, vec![0]);
        let spurious = compute_crcs(root, &mut a);
        assert!(spurious.is_empty());
        assert!(matches!(a.targets[0].1.crc, Crc::Plain(_)));
    }

    #[test]
    fn unlinked_crc_target_is_spurious() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_str().unwrap();
        let start = start_with_targets(vec![("gone", Tflags::WRITE | Tflags::CRC)]);
        let mut g = Gather::default();
        access(&mut g, "gone", Bool3::Yes, Accesses::NONE);
        let mut a = analyze(&g, &start, root);
        let spurious = compute_crcs(root, &mut a);
        assert_eq!(spurious, vec!["gone".to_string()]);
        assert_eq!(a.targets[0].1.crc, Crc::None);
    }

    #[test]
    fn star_targets_match_by_glob() {
        let start = start_with_targets(vec![(
            "obj/*.o",
            Tflags::STAR | Tflags::WRITE | Tflags::CRC,
        )]);
        assert!(tflags_for("obj/main.o", &start).contains(Tflags::CRC));
        assert_eq!(tflags_for("src/main.c", &start), Tflags::unexpected());
    }

    #[test]
    fn static_deps_are_never_targets() {
        let mut start = start_with_targets(vec![("*", Tflags::STAR | Tflags::WRITE)]);
        start.static_deps.push(("in".to_string(), Dflags::STATIC));
        assert_eq!(tflags_for("in", &start), Tflags::unexpected());
    }

    #[test]
    fn unconfirmed_write_settled_by_disk() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_str().unwrap();
        let start = start_with_targets(vec![("out", Tflags::WRITE)]);
        let mut g = Gather::default();
        // announced but the supervisor never saw the confirm
        g.access(&AccessReport {
            kind: AccessKind::Access as u8,
            files: vec![("out".to_string(), FileSig::default())],
            digest: AccessDigest {
                write: Bool3::Maybe,
                unlink: false,
                accesses: Accesses::NONE,
                dflags: Dflags::default(),
            },
            ..Default::default()
        });
        // no file appeared on disk: the write did not occur
        let a = analyze(&g, &start, root);
        assert!(a.targets.is_empty());
        // now the file exists: the write is deemed to have happened
        std::fs::write(format!("{root}/out"), b"x").unwrap();
        let a = analyze(&g, &start, root);
        assert_eq!(a.targets.len(), 1);
    }
}
