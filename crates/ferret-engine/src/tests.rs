use super::*;
use crate::engine::Submission;
use ferret_proto::{
    Accesses, Crc, DepDigest, FileSig, JobDigest, Status, TargetDigest, TargetSpec, Tflags,
};
use ferret_solve::FileInfo;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct MockBackend {
    subs: Arc<Mutex<Vec<Submission>>>,
    kills: Arc<Mutex<Vec<(JobId, u64)>>>,
}

impl Backend for MockBackend {
    fn submit(&mut self, sub: Submission) {
        self.subs.lock().unwrap().push(sub);
    }
    fn kill(&mut self, job: JobId, seq_id: u64) {
        self.kills.lock().unwrap().push((job, seq_id));
    }
}

struct Harness {
    engine: Engine,
    subs: Arc<Mutex<Vec<Submission>>>,
    _keep: tempfile::TempDir,
    root: String,
}

fn compile_rule() -> Rule {
    Rule {
        name: "compile".to_string(),
        prio: 0,
        targets: vec![TargetSpec {
            pattern: "out".to_string(),
            tflags: Tflags::WRITE | Tflags::CRC,
        }],
        deps: vec!["in".to_string()],
        cmd: "tr a-z A-Z < in > out".to_string(),
        interpreter: vec![],
        sure: true,
        cmd_gen: 1,
    }
}

fn harness(rules: RuleSet) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let root = root.to_str().unwrap().to_string();
    let cfg = EngineConfig {
        root_dir: root.clone(),
        tmp_root: format!("{root}/.ferret/tmp"),
        dep_depth_max: 16,
        ..Default::default()
    };
    let backend = MockBackend::default();
    let subs = backend.subs.clone();
    Harness {
        engine: Engine::new(cfg, rules, Box::new(backend)),
        subs,
        _keep: dir,
        root,
    }
}

impl Harness {
    fn write(&self, name: &str, content: &str) {
        let path = format!("{}/{name}", self.root);
        if let Some(dir) = std::path::Path::new(&path).parent() {
            std::fs::create_dir_all(dir).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    fn sig(&self, name: &str) -> FileSig {
        FileInfo::of(&format!("{}/{name}", self.root), true).sig()
    }

    fn take_subs(&self) -> Vec<Submission> {
        std::mem::take(&mut self.subs.lock().unwrap())
    }

    /// Play the supervisor for one submission: transform `in` to uppercase
    /// `out`, then report the digest.
    fn run_compile(&mut self, sub: &Submission) {
        let input = std::fs::read_to_string(format!("{}/in", self.root)).unwrap();
        let output = input.to_uppercase();
        self.write("out", &output);
        let digest = JobDigest {
            status: Status::Ok,
            targets: vec![(
                "out".to_string(),
                TargetDigest {
                    accesses: Accesses::NONE,
                    write: true,
                    tflags: Tflags::WRITE | Tflags::CRC,
                    unlink: false,
                    crc: ferret_solve::crc_of(&format!("{}/out", self.root)),
                },
            )],
            deps: vec![(
                "in".to_string(),
                DepDigest {
                    accesses: Accesses::REG,
                    dflags: ferret_proto::Dflags::STATIC,
                    parallel: false,
                    sig: self.sig("in"),
                    garbage: false,
                },
            )],
            ..Default::default()
        };
        self.engine.end_job(sub.seq_id, sub.job, &digest).unwrap();
    }
}

fn src_rules() -> RuleSet {
    RuleSet {
        sources: vec!["in".to_string()],
        rules: vec![compile_rule()],
        ..Default::default()
    }
}

#[test]
fn simple_build_runs_once_then_is_up_to_date() {
    let mut h = harness(src_rules());
    h.write("in", "x");

    let rq = h.engine.open_req(vec!["out".to_string()]);
    assert!(!h.engine.req_done(rq));
    let subs = h.take_subs();
    assert_eq!(subs.len(), 1, "exactly one job must run");

    h.run_compile(&subs[0]);
    assert!(h.engine.req_done(rq));
    assert_eq!(h.engine.req_summary(rq).jobs_run, 1);
    let out = h.engine.lookup_node("out").unwrap();
    assert_eq!(h.engine.node_ok(out), Some(true));
    assert!(matches!(h.engine.node_data(out).crc, Crc::Plain(_)));
    assert_eq!(
        std::fs::read_to_string(format!("{}/out", h.root)).unwrap(),
        "X"
    );

    // second request with no changes: zero jobs, reported up to date
    let rq2 = h.engine.open_req(vec!["out".to_string()]);
    assert!(h.engine.req_done(rq2));
    assert!(h.take_subs().is_empty());
    assert_eq!(h.engine.req_summary(rq2).jobs_run, 0);
    assert_eq!(h.engine.req_summary(rq2).up_to_date, 1);
}

#[test]
fn changed_source_triggers_a_rerun() {
    let mut h = harness(src_rules());
    h.write("in", "x");
    let rq = h.engine.open_req(vec!["out".to_string()]);
    let subs = h.take_subs();
    h.run_compile(&subs[0]);
    assert!(h.engine.req_done(rq));

    std::thread::sleep(std::time::Duration::from_millis(5));
    h.write("in", "y");
    let rq2 = h.engine.open_req(vec!["out".to_string()]);
    let subs = h.take_subs();
    assert_eq!(subs.len(), 1, "source change must rerun the job");
    h.run_compile(&subs[0]);
    assert!(h.engine.req_done(rq2));
    assert_eq!(
        std::fs::read_to_string(format!("{}/out", h.root)).unwrap(),
        "Y"
    );
}

#[test]
fn manual_modification_is_detected_and_washed() {
    let mut h = harness(src_rules());
    h.write("in", "x");
    let rq = h.engine.open_req(vec!["out".to_string()]);
    let subs = h.take_subs();
    h.run_compile(&subs[0]);
    assert!(h.engine.req_done(rq));

    // user overwrites the target behind the engine's back
    std::thread::sleep(std::time::Duration::from_millis(5));
    h.write("out", "tampered");

    let rq3 = h.engine.open_req(vec!["out".to_string()]);
    let subs = h.take_subs();
    assert_eq!(subs.len(), 1, "manual change must rerun the producer");
    assert!(subs[0].reason.contains("manually modified"));
    h.run_compile(&subs[0]);
    assert!(h.engine.req_done(rq3));
    assert_eq!(
        std::fs::read_to_string(format!("{}/out", h.root)).unwrap(),
        "X"
    );
}

#[test]
fn steady_manual_rewrite_only_refreshes_the_date() {
    let mut h = harness(src_rules());
    h.write("in", "x");
    let rq = h.engine.open_req(vec!["out".to_string()]);
    let subs = h.take_subs();
    h.run_compile(&subs[0]);
    assert!(h.engine.req_done(rq));

    // rewrite with identical content: same crc, newer date
    std::thread::sleep(std::time::Duration::from_millis(5));
    h.write("out", "X");
    let _rq2 = h.engine.open_req(vec!["out".to_string()]);
    assert!(h.take_subs().is_empty(), "steady content must not rerun");
}

#[test]
fn missing_source_is_an_error() {
    let mut h = harness(src_rules());
    // "in" never written
    let rq = h.engine.open_req(vec!["out".to_string()]);
    let subs = h.take_subs();
    assert!(subs.is_empty(), "job cannot run without its static dep");
    assert!(h.engine.req_done(rq));
    let out = h.engine.lookup_node("out").unwrap();
    assert_eq!(h.engine.node_ok(out), Some(false));
    assert!(h
        .engine
        .req_errors(rq)
        .iter()
        .any(|(n, e)| n == "in" && e.contains("missing")));
}

#[test]
fn failed_job_is_deemed_producer_so_dependents_see_the_error() {
    let mut h = harness(src_rules());
    h.write("in", "x");
    let rq = h.engine.open_req(vec!["out".to_string()]);
    let subs = h.take_subs();
    let digest = JobDigest {
        status: Status::Err,
        stderr: "boom".to_string(),
        wstatus: 1 << 8,
        ..Default::default()
    };
    h.engine.end_job(subs[0].seq_id, subs[0].job, &digest).unwrap();
    assert!(h.engine.req_done(rq));
    let out = h.engine.lookup_node("out").unwrap();
    assert_eq!(h.engine.node_ok(out), Some(false));
    assert_eq!(h.engine.req_summary(rq).jobs_failed, 1);
}

#[test]
fn infinite_rule_chain_is_reported_once() {
    let rules = RuleSet {
        rules: vec![Rule {
            name: "chain".to_string(),
            prio: 0,
            targets: vec![TargetSpec {
                pattern: "%".to_string(),
                tflags: Tflags::WRITE,
            }],
            deps: vec!["%.prev".to_string()],
            cmd: "cp {stem}.prev {target}".to_string(),
            interpreter: vec![],
            sure: true,
            cmd_gen: 1,
        }],
        ..Default::default()
    };
    let mut h = harness(rules);
    let rq = h.engine.open_req(vec!["f".to_string()]);
    assert!(h.engine.req_done(rq));
    assert!(h.take_subs().is_empty());
    let f = h.engine.lookup_node("f").unwrap();
    assert_eq!(h.engine.node_ok(f), Some(false));
    let errors = h.engine.req_errors(rq);
    assert_eq!(
        errors
            .iter()
            .filter(|(_, e)| e.contains("recurse forever"))
            .count(),
        1,
        "the cycle must be reported exactly once: {errors:?}"
    );
    // the synthetic job exists and is the node's sole candidate
    let deep = errors.iter().find(|(_, e)| e.contains("recurse")).unwrap();
    let n = h.engine.lookup_node(&deep.0).unwrap();
    let inf = h.engine.node_data(n).job_tgts.clone();
    assert_eq!(inf.len(), 1);
    assert!(matches!(
        h.engine.job_data(inf[0]).special,
        Some(Special::Infinite)
    ));
}

#[test]
fn concurrent_reqs_share_one_execution() {
    let mut h = harness(src_rules());
    h.write("in", "x");

    let ra = h.engine.open_req(vec!["out".to_string()]);
    let rb = h.engine.open_req(vec!["out".to_string()]);
    let subs = h.take_subs();
    assert_eq!(subs.len(), 1, "at most one concurrent execution per job");
    assert!(!h.engine.req_done(ra));
    assert!(!h.engine.req_done(rb));

    h.run_compile(&subs[0]);
    assert!(h.engine.req_done(ra), "both requests observe the completion");
    assert!(h.engine.req_done(rb));
    assert!(h.take_subs().is_empty());
}

#[test]
fn killed_request_goes_zombie_and_kills_exclusive_jobs() {
    let mut h = harness(src_rules());
    h.write("in", "x");
    let rq = h.engine.open_req(vec!["out".to_string()]);
    let subs = h.take_subs();
    assert_eq!(subs.len(), 1);
    h.engine.kill_req(rq);
    assert!(h.engine.req_done(rq), "a zombie request is done");
    // the late digest is still ingested without waking the zombie
    h.run_compile(&subs[0]);
}

#[test]
fn lost_supervisor_marks_the_job_lost_and_rerun_retries() {
    let mut h = harness(src_rules());
    h.write("in", "x");
    let rq = h.engine.open_req(vec!["out".to_string()]);
    let subs = h.take_subs();
    h.engine.job_lost(subs[0].job).unwrap();
    assert!(h.engine.req_done(rq));
    assert_eq!(h.engine.job_data(subs[0].job).status, Status::Lost);

    // user retries: the lost job is resubmitted
    let rq2 = h.engine.open_req(vec!["out".to_string()]);
    let subs = h.take_subs();
    assert_eq!(subs.len(), 1);
    assert!(subs[0].reason.contains("lost"));
    h.run_compile(&subs[0]);
    assert!(h.engine.req_done(rq2));
}

#[test]
fn hidden_deps_from_the_digest_trigger_reruns() {
    let mut h = harness(RuleSet {
        sources: vec!["in".to_string(), "header".to_string()],
        rules: vec![compile_rule()],
        ..Default::default()
    });
    h.write("in", "x");
    h.write("header", "h1");
    let rq = h.engine.open_req(vec!["out".to_string()]);
    let subs = h.take_subs();
    // the job turns out to also read "header" (discovered, not declared)
    h.write("out", "X");
    let digest = JobDigest {
        status: Status::Ok,
        targets: vec![(
            "out".to_string(),
            TargetDigest {
                accesses: Accesses::NONE,
                write: true,
                tflags: Tflags::WRITE | Tflags::CRC,
                unlink: false,
                crc: ferret_solve::crc_of(&format!("{}/out", h.root)),
            },
        )],
        deps: vec![
            (
                "in".to_string(),
                DepDigest {
                    accesses: Accesses::REG,
                    dflags: ferret_proto::Dflags::STATIC,
                    parallel: false,
                    sig: h.sig("in"),
                    garbage: false,
                },
            ),
            (
                "header".to_string(),
                DepDigest {
                    accesses: Accesses::REG,
                    dflags: ferret_proto::Dflags::default(),
                    parallel: false,
                    sig: h.sig("header"),
                    garbage: false,
                },
            ),
        ],
        ..Default::default()
    };
    h.engine.end_job(subs[0].seq_id, subs[0].job, &digest).unwrap();
    assert!(h.engine.req_done(rq));

    // touching the hidden dep invalidates the job
    std::thread::sleep(std::time::Duration::from_millis(5));
    h.write("header", "h2");
    let _rq2 = h.engine.open_req(vec!["out".to_string()]);
    let subs = h.take_subs();
    assert_eq!(subs.len(), 1, "hidden dep change must rerun: {subs:?}");
    assert!(subs[0].reason.contains("header"));
}

fn touch_rule() -> Rule {
    Rule {
        name: "touch".to_string(),
        prio: 0,
        targets: vec![TargetSpec {
            pattern: "other".to_string(),
            tflags: Tflags::WRITE | Tflags::CRC,
        }],
        deps: vec![],
        cmd: "date > other".to_string(),
        interpreter: vec![],
        sure: true,
        cmd_gen: 1,
    }
}

/// A dep rewritten by a run that ended strictly inside another job's own
/// window is distrusted even when the recorded signatures line up: dates
/// cannot settle which side of the rewrite was read.
#[test]
fn dep_rewritten_during_the_run_is_distrusted() {
    let mut rules = src_rules();
    rules.rules.push(touch_rule());
    let mut h = harness(rules);
    h.write("in", "x");

    let ra = h.engine.open_req(vec!["out".to_string()]);
    let subs = h.take_subs();
    assert_eq!(subs.len(), 1);
    let rb = h.engine.open_req(vec!["other".to_string()]);
    let other_subs = h.take_subs();
    assert_eq!(other_subs.len(), 1);

    // the touch job ends while the compile job is still running, rewriting
    // "in" on the way (same bytes, fresh date)
    std::thread::sleep(std::time::Duration::from_millis(5));
    h.write("in", "x");
    h.write("other", "o");
    let touch_digest = JobDigest {
        status: Status::Ok,
        targets: vec![
            (
                "other".to_string(),
                TargetDigest {
                    accesses: Accesses::NONE,
                    write: true,
                    tflags: Tflags::WRITE | Tflags::CRC,
                    unlink: false,
                    crc: ferret_solve::crc_of(&format!("{}/other", h.root)),
                },
            ),
            (
                "in".to_string(),
                TargetDigest {
                    accesses: Accesses::NONE,
                    write: true,
                    tflags: Tflags::WRITE | Tflags::CRC,
                    unlink: false,
                    crc: ferret_solve::crc_of(&format!("{}/in", h.root)),
                },
            ),
        ],
        deps: vec![],
        ..Default::default()
    };
    h.engine
        .end_job(other_subs[0].seq_id, other_subs[0].job, &touch_digest)
        .unwrap();
    assert!(h.engine.req_done(rb));

    // the compile job ends with its recorded dep matching the rewritten
    // file: the content comparison alone would pass
    h.run_compile(&subs[0]);
    let resub = h.take_subs();
    assert_eq!(resub.len(), 1, "chronology must force a rerun: {resub:?}");
    assert!(resub[0].reason.contains("rewritten during the run"));
    h.run_compile(&resub[0]);
    assert!(h.engine.req_done(ra));
}

/// A job a request never analyzed rewriting a node that request had already
/// settled on surfaces as an error on that request.
#[test]
fn foreign_overwrite_is_flagged_to_settled_requests() {
    let mut rules = src_rules();
    rules.rules.push(touch_rule());
    let mut h = harness(rules);
    h.write("in", "x");

    let ra = h.engine.open_req(vec!["out".to_string()]);
    let subs = h.take_subs();
    h.run_compile(&subs[0]);
    assert!(h.engine.req_done(ra));
    assert!(h.engine.req_errors(ra).is_empty());

    let rb = h.engine.open_req(vec!["other".to_string()]);
    let other_subs = h.take_subs();
    // the touch job clobbers "out", which ra settled on and never saw coming
    h.write("other", "o");
    h.write("out", "clobbered");
    let touch_digest = JobDigest {
        status: Status::Ok,
        targets: vec![
            (
                "other".to_string(),
                TargetDigest {
                    accesses: Accesses::NONE,
                    write: true,
                    tflags: Tflags::WRITE | Tflags::CRC,
                    unlink: false,
                    crc: ferret_solve::crc_of(&format!("{}/other", h.root)),
                },
            ),
            (
                "out".to_string(),
                TargetDigest {
                    accesses: Accesses::NONE,
                    write: true,
                    tflags: Tflags::WRITE | Tflags::CRC,
                    unlink: false,
                    crc: ferret_solve::crc_of(&format!("{}/out", h.root)),
                },
            ),
        ],
        deps: vec![],
        ..Default::default()
    };
    h.engine
        .end_job(other_subs[0].seq_id, other_subs[0].job, &touch_digest)
        .unwrap();
    assert!(h.engine.req_done(rb));
    assert!(
        h.engine
            .req_errors(ra)
            .iter()
            .any(|(n, e)| n == "out" && e.contains("overwritten")),
        "{:?}",
        h.engine.req_errors(ra)
    );
}

#[test]
fn forget_forces_reanalysis() {
    let mut h = harness(src_rules());
    h.write("in", "x");
    let rq = h.engine.open_req(vec!["out".to_string()]);
    let subs = h.take_subs();
    h.run_compile(&subs[0]);
    assert!(h.engine.req_done(rq));

    assert!(h.engine.forget("out", false, false));
    let _rq2 = h.engine.open_req(vec!["out".to_string()]);
    let subs = h.take_subs();
    assert_eq!(subs.len(), 1, "forgotten producer must rerun");
}

#[test]
fn stale_end_reports_are_rejected() {
    let mut h = harness(src_rules());
    h.write("in", "x");
    let _rq = h.engine.open_req(vec!["out".to_string()]);
    let subs = h.take_subs();
    let digest = JobDigest::default();
    let err = h.engine.end_job(subs[0].seq_id + 42, subs[0].job, &digest);
    assert!(matches!(err, Err(EngineError::StaleSeq { .. })));
}

#[test]
fn frozen_jobs_are_trusted_without_rerun() {
    let mut h = harness(src_rules());
    h.write("in", "x");
    let rq = h.engine.open_req(vec!["out".to_string()]);
    let subs = h.take_subs();
    h.run_compile(&subs[0]);
    assert!(h.engine.req_done(rq));

    let full_name = h.engine.job_data(subs[0].job).full_name.clone();
    assert!(h.engine.freeze(&full_name, true));
    // even with a tampered target, a frozen job does not rerun
    std::thread::sleep(std::time::Duration::from_millis(5));
    h.write("out", "tampered");
    let rq2 = h.engine.open_req(vec!["out".to_string()]);
    assert!(h.take_subs().is_empty());
    assert!(h.engine.req_done(rq2));
}

#[test]
fn chk_deps_detects_drift() {
    let mut h = harness(src_rules());
    h.write("in", "x");
    let sig = h.sig("in");
    let dd = DepDigest {
        accesses: Accesses::REG,
        sig,
        ..Default::default()
    };
    assert_eq!(
        h.engine.chk_deps(&[("in".to_string(), dd)]),
        ferret_proto::ChkDepsVerdict::Ok
    );
    std::thread::sleep(std::time::Duration::from_millis(5));
    h.write("in", "changed");
    assert_eq!(
        h.engine.chk_deps(&[("in".to_string(), dd)]),
        ferret_proto::ChkDepsVerdict::Changed
    );
}

#[test]
fn dep_infos_reports_known_and_disk_crcs() {
    let mut h = harness(src_rules());
    h.write("in", "x");
    h.write("unknown-to-engine", "data");
    let crcs = h
        .engine
        .dep_infos(&["in".to_string(), "unknown-to-engine".to_string(), "absent".to_string()]);
    assert!(matches!(crcs[0], Crc::Plain(_)));
    assert!(matches!(crcs[1], Crc::Plain(_)));
    assert_eq!(crcs[2], Crc::None);
}

#[test]
fn start_info_for_stale_seq_asks_to_give_up() {
    let mut h = harness(src_rules());
    h.write("in", "x");
    let _rq = h.engine.open_req(vec!["out".to_string()]);
    let subs = h.take_subs();
    let good = h.engine.start_info(subs[0].seq_id, subs[0].job);
    assert!(good.run);
    assert_eq!(good.cmd, "tr a-z A-Z < in > out");
    assert_eq!(good.static_deps.len(), 1);
    let stale = h.engine.start_info(subs[0].seq_id + 1, subs[0].job);
    assert!(!stale.run);
}
