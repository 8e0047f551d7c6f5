//! The make loop.
//!
//! Analysis is demand driven and push-completed: `make_node`/`make_job`
//! either finish immediately or register the asker as a watcher and return
//! "waiting". Completions (job endings, candidate settlements) enqueue wake
//! events; draining the queue re-enters the interrupted frames. No frame
//! ever runs twice concurrently on the same object because the engine is
//! single-threaded and the queue is processed to exhaustion before any
//! public call returns.

use crate::job::{Dep, JobData, JobStep, RunStatus, Special};
use crate::node::{Buildable, Manual, NodeData, NodeStatus};
use crate::req::{NodeGoal, Req, ReqSummary};
use crate::rules::RuleSet;
use crate::{EngineError, JobChrono, JobId, NodeId, ReqChrono, ReqId};
use ferret_proto::{
    AutodepEnv, ChkDepsVerdict, Crc, DepDigest, Dflags, FileSig, JobDigest, LnkSupport, SeqId,
    StartReply, Status, Tflags,
};
use ferret_solve::FileInfo;
use std::collections::{HashMap, VecDeque};

/// Engine-wide configuration, set once at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Absolute, canonical repository root.
    pub root_dir: String,
    /// Admin subdir name under the root.
    pub admin_dir: String,
    /// Dir under which per-job scratch dirs are created.
    pub tmp_root: String,
    /// User-visible scratch name; empty = no mapping.
    pub tmp_view: String,
    pub lnk_support: LnkSupport,
    pub reliable_dirs: bool,
    pub kill_sigs: Vec<i32>,
    pub timeout_ms: u64,
    pub keep_tmp: bool,
    pub live_out: bool,
    /// Names longer than this are not buildable.
    pub path_max: usize,
    /// Dep chains deeper than this are reported as infinite.
    pub dep_depth_max: u32,
    /// Submissions per (req, job) before declaring a rerun loop.
    pub submit_max: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            root_dir: String::new(),
            admin_dir: ".ferret".to_string(),
            tmp_root: String::new(),
            tmp_view: String::new(),
            lnk_support: LnkSupport::Full,
            reliable_dirs: true,
            kill_sigs: vec![libc_consts::SIGTERM],
            timeout_ms: 0,
            keep_tmp: false,
            live_out: false,
            path_max: 4096,
            dep_depth_max: 1000,
            submit_max: 3,
        }
    }
}

// the engine proper has no unsafe and no libc dependency; only the default
// kill signal number is needed
mod libc_consts {
    pub const SIGTERM: i32 = 15;
}

/// One job submission handed to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub job: JobId,
    pub seq_id: SeqId,
    pub reason: String,
}

/// The backend contract: start/monitor/kill is somebody else's business; the
/// engine only hands over submissions.
pub trait Backend: Send {
    fn submit(&mut self, sub: Submission);
    /// The engine lost interest (req killed); best effort.
    fn kill(&mut self, job: JobId, seq_id: SeqId);
}

#[derive(Debug, Clone, Copy)]
enum Wake {
    Node(NodeId),
    Job(JobId),
}

pub struct Engine {
    pub cfg: EngineConfig,
    pub rules: RuleSet,
    backend: Box<dyn Backend>,
    nodes: Vec<NodeData>,
    node_idx: HashMap<String, NodeId>,
    jobs: Vec<JobData>,
    job_idx: HashMap<String, JobId>,
    reqs: HashMap<ReqId, Req>,
    next_req: u32,
    next_seq: SeqId,
    /// Current match generation; nodes with an older one redo set_buildable.
    match_gen: u32,
    chrono: JobChrono,
    req_chrono: ReqChrono,
    wakes: VecDeque<(ReqId, Wake)>,
}

impl Engine {
    pub fn new(cfg: EngineConfig, rules: RuleSet, backend: Box<dyn Backend>) -> Self {
        Engine {
            cfg,
            rules,
            backend,
            nodes: Vec::new(),
            node_idx: HashMap::new(),
            jobs: Vec::new(),
            job_idx: HashMap::new(),
            reqs: HashMap::new(),
            next_req: 0,
            next_seq: 1,
            match_gen: 1,
            chrono: JobChrono(1),
            req_chrono: ReqChrono(1),
            wakes: VecDeque::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Arena access
    // -------------------------------------------------------------------------

    pub fn node(&mut self, name: &str) -> NodeId {
        if let Some(&id) = self.node_idx.get(name) {
            return id;
        }
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(NodeData::new(name.to_string()));
        self.node_idx.insert(name.to_string(), id);
        id
    }

    pub fn node_data(&self, id: NodeId) -> &NodeData {
        &self.nodes[id.0 as usize]
    }

    pub fn job_data(&self, id: JobId) -> &JobData {
        &self.jobs[id.0 as usize]
    }

    pub fn lookup_node(&self, name: &str) -> Option<NodeId> {
        self.node_idx.get(name).copied()
    }

    pub fn lookup_job(&self, full_name: &str) -> Option<JobId> {
        self.job_idx.get(full_name).copied()
    }

    fn abs(&self, name: &str) -> String {
        format!("{}/{name}", self.cfg.root_dir)
    }

    fn disk_sig(&self, name: &str) -> FileSig {
        FileInfo::of(&self.abs(name), true).sig()
    }

    // -------------------------------------------------------------------------
    // Requests
    // -------------------------------------------------------------------------

    /// Open a request on `roots` and run analysis as far as it can go
    /// without job completions.
    pub fn open_req(&mut self, roots: Vec<String>) -> ReqId {
        let rq = ReqId(self.next_req);
        self.next_req += 1;
        self.req_chrono = self.req_chrono.next();
        let root_ids: Vec<NodeId> = roots.iter().map(|r| self.node(r)).collect();
        self.reqs.insert(rq, Req::new(root_ids.clone(), self.req_chrono));
        for n in root_ids {
            let ri = self.reqs.get_mut(&rq).unwrap().node_info(n);
            ri.goal = NodeGoal::Dsk;
            ri.watchers.push(None);
            self.wakes.push_back((rq, Wake::Node(n)));
        }
        self.drain();
        rq
    }

    /// Cancel: the request becomes zombie, queued work for it is dropped and
    /// running jobs it exclusively waits on are killed (best effort).
    pub fn kill_req(&mut self, rq: ReqId) {
        let Some(req) = self.reqs.get_mut(&rq) else {
            return;
        };
        req.zombie = true;
        let waited: Vec<JobId> = req.jobs.keys().copied().collect();
        for (n, ri) in req.nodes.iter_mut() {
            let _ = n;
            ri.done = NodeGoal::Dsk; // snap so no further work is queued
        }
        for j in waited {
            let job = &self.jobs[j.0 as usize];
            if job.running {
                // only kill if no other live req waits for it
                let shared = self.reqs.iter().any(|(orq, oreq)| {
                    *orq != rq && !oreq.zombie && oreq.jobs.contains_key(&j)
                });
                if !shared {
                    self.backend.kill(j, job.seq_id);
                }
            }
        }
    }

    pub fn req_done(&self, rq: ReqId) -> bool {
        self.reqs.get(&rq).map(|r| r.zombie || r.done()).unwrap_or(true)
    }

    pub fn req_summary(&self, rq: ReqId) -> ReqSummary {
        self.reqs.get(&rq).map(|r| r.summary).unwrap_or_default()
    }

    pub fn req_errors(&self, rq: ReqId) -> Vec<(String, String)> {
        let Some(req) = self.reqs.get(&rq) else {
            return Vec::new();
        };
        req.errors
            .iter()
            .map(|(n, e)| (self.nodes[n.0 as usize].name.clone(), e.clone()))
            .collect()
    }

    pub fn close_req(&mut self, rq: ReqId) -> Result<Req, EngineError> {
        self.reqs.remove(&rq).ok_or(EngineError::UnknownReq(rq))
    }

    /// Whether the node ended up ok for this request. `None` = not built.
    pub fn node_ok(&self, n: NodeId) -> Option<bool> {
        let node = &self.nodes[n.0 as usize];
        match node.status {
            NodeStatus::Plain => {
                let j = node.conform_job()?;
                Some(!self.jobs[j.0 as usize].err())
            }
            NodeStatus::Multi => Some(false),
            NodeStatus::Src | NodeStatus::SrcDir => Some(node.crc != Crc::None),
            _ => None,
        }
    }

    // -------------------------------------------------------------------------
    // Wake machinery
    // -------------------------------------------------------------------------

    fn drain(&mut self) {
        while let Some((rq, wake)) = self.wakes.pop_front() {
            if self.reqs.get(&rq).map(|r| r.zombie).unwrap_or(true) {
                continue;
            }
            match wake {
                Wake::Node(n) => {
                    if self.make_node(rq, n, 0) {
                        self.node_completed(rq, n);
                    }
                }
                Wake::Job(j) => {
                    if self.make_job(rq, j, 0) {
                        self.job_completed(rq, j);
                    }
                }
            }
        }
    }

    fn node_completed(&mut self, rq: ReqId, n: NodeId) {
        let Some(req) = self.reqs.get_mut(&rq) else {
            return;
        };
        let watchers = std::mem::take(&mut req.node_info(n).watchers);
        for w in watchers {
            match w {
                Some(job) => {
                    let ji = req.job_info(job);
                    ji.n_wait = ji.n_wait.saturating_sub(1);
                    self.wakes.push_back((rq, Wake::Job(job)));
                }
                None => {} // a request root: done() will observe it
            }
        }
    }

    fn job_completed(&mut self, rq: ReqId, j: JobId) {
        let Some(req) = self.reqs.get_mut(&rq) else {
            return;
        };
        let watchers = std::mem::take(&mut req.job_info(j).watchers);
        for n in watchers {
            let ri = req.node_info(n);
            ri.n_wait = ri.n_wait.saturating_sub(1);
            self.wakes.push_back((rq, Wake::Node(n)));
        }
    }

    // -------------------------------------------------------------------------
    // set_buildable
    // -------------------------------------------------------------------------

    /// Data-independent classification, cached per match generation.
    fn set_buildable(&mut self, rq: ReqId, n: NodeId, depth: u32) -> Buildable {
        {
            let node = &self.nodes[n.0 as usize];
            if node.match_gen == self.match_gen && node.buildable != Buildable::Unknown {
                return node.buildable;
            }
        }
        let name = self.nodes[n.0 as usize].name.clone();
        let b = self.classify(rq, n, &name, depth);
        let node = &mut self.nodes[n.0 as usize];
        node.buildable = b;
        node.match_gen = self.match_gen;
        b
    }

    fn classify(&mut self, rq: ReqId, n: NodeId, name: &str, depth: u32) -> Buildable {
        if name.len() > self.cfg.path_max {
            let node = &mut self.nodes[n.0 as usize];
            if !node.long_warned {
                node.long_warned = true;
                if let Some(req) = self.reqs.get_mut(&rq) {
                    req.errors.push((n, "name is too long to be buildable".to_string()));
                }
            }
            return Buildable::LongName;
        }
        // special rules come first, in priority order
        if self.rules.is_source(name) {
            return Buildable::Src;
        }
        if self.rules.is_src_dir(name) {
            return Buildable::SrcDir;
        }
        if self.rules.under_src_dir(name) {
            return Buildable::SubSrcDir;
        }
        if self.rules.is_anti(name) {
            return Buildable::Anti;
        }
        // uphill: a node inside a source dir node is source material too
        let dir = ferret_solve::dir_name(name).to_string();
        if !dir.is_empty() {
            let d = self.node(&dir);
            self.nodes[n.0 as usize].dir = Some(d);
            // guard against dir cycles: a dir under analysis blocks recursion
            if self.nodes[d.0 as usize].buildable == Buildable::Loop {
                return Buildable::No;
            }
            self.nodes[n.0 as usize].buildable = Buildable::Loop;
            let db = self.set_buildable(rq, d, depth);
            self.nodes[n.0 as usize].buildable = Buildable::Unknown;
            if matches!(db, Buildable::SrcDir | Buildable::SubSrcDir) {
                return Buildable::SubSrcDir;
            }
        }
        if depth > self.cfg.dep_depth_max {
            self.set_infinite(rq, n);
            return Buildable::Yes;
        }
        let name_owned = name.to_string();
        let protos = self.rules.job_candidates(&name_owned);
        if protos.is_empty() {
            return Buildable::No;
        }
        let mut tgts = Vec::new();
        let mut sure = false;
        for proto in protos {
            let j = self.intern_job(&proto);
            tgts.push(j);
            if proto.sure {
                sure = true;
                break; // a sure candidate discards the rest of the tier
            }
        }
        self.nodes[n.0 as usize].job_tgts = tgts;
        self.nodes[n.0 as usize].conform_idx = None;
        if sure {
            Buildable::Yes
        } else {
            Buildable::Maybe
        }
    }

    fn intern_job(&mut self, proto: &crate::rules::JobProto) -> JobId {
        if let Some(&j) = self.job_idx.get(&proto.full_name) {
            // keep the rule generation fresh so edits are seen
            self.jobs[j.0 as usize].rule_cmd_gen = proto.cmd_gen;
            return j;
        }
        let j = JobId(self.jobs.len() as u32);
        let targets = proto
            .targets
            .iter()
            .filter(|t| !t.tflags.contains(Tflags::STAR))
            .map(|t| self.node(&t.pattern))
            .collect();
        self.jobs.push(JobData {
            full_name: proto.full_name.clone(),
            rule_name: proto.rule_name.clone(),
            prio: proto.prio,
            sure: proto.sure,
            targets,
            target_specs: proto.targets.clone(),
            static_deps: proto.static_deps.clone(),
            cmd: proto.cmd.clone(),
            interpreter: proto.interpreter.clone(),
            cmd_gen: 0,
            rule_cmd_gen: proto.cmd_gen,
            ..Default::default()
        });
        self.job_idx.insert(proto.full_name.clone(), j);
        j
    }

    /// Rewrite the node's candidates to one synthetic job so the cycle is
    /// reported once.
    fn set_infinite(&mut self, rq: ReqId, n: NodeId) {
        let name = self.nodes[n.0 as usize].name.clone();
        let full_name = format!("infinite:{name}");
        let j = if let Some(&j) = self.job_idx.get(&full_name) {
            j
        } else {
            let j = JobId(self.jobs.len() as u32);
            self.jobs.push(JobData {
                full_name: full_name.clone(),
                rule_name: "infinite".to_string(),
                special: Some(Special::Infinite),
                targets: vec![n],
                status: Status::Err,
                run_status: RunStatus::Err,
                ..Default::default()
            });
            self.job_idx.insert(full_name, j);
            j
        };
        self.nodes[n.0 as usize].job_tgts = vec![j];
        self.nodes[n.0 as usize].conform_idx = Some(0);
        if let Some(req) = self.reqs.get_mut(&rq) {
            req.errors
                .push((n, "rule chain would recurse forever".to_string()));
        }
    }

    // -------------------------------------------------------------------------
    // make
    // -------------------------------------------------------------------------

    /// Analyze `n` up to its goal for `rq`. True if done.
    fn make_node(&mut self, rq: ReqId, n: NodeId, depth: u32) -> bool {
        let goal = {
            let Some(req) = self.reqs.get_mut(&rq) else {
                return true;
            };
            if req.zombie {
                return true;
            }
            let ri = req.node_info(n);
            if ri.done >= ri.goal {
                return true;
            }
            if ri.n_wait > 0 {
                return false; // a frame is already pending on this node
            }
            if ri.visiting {
                // the dep graph cycles through this node
                ri.done = ri.goal;
                req.errors
                    .push((n, "dependency cycle through this file".to_string()));
                self.nodes[n.0 as usize].status = NodeStatus::None;
                self.nodes[n.0 as usize].crc = Crc::None;
                return true;
            }
            ri.goal
        };
        let b = self.set_buildable(rq, n, depth);
        // pre-make: sources and non-buildables settle from the disk alone
        if b.is_src() {
            // the disk is consulted once per request epoch: a node refreshed
            // at or after this request opened is still coherent for it
            let rq_epoch = self.reqs.get(&rq).map(|r| r.chrono).unwrap_or_default();
            let stale = {
                let node = &self.nodes[n.0 as usize];
                node.crc == Crc::Unknown
                    || node.coherent_req.is_before(rq_epoch, self.req_chrono)
            };
            if stale {
                let name = self.nodes[n.0 as usize].name.clone();
                let sig = self.disk_sig(&name);
                let crc = ferret_solve::crc_of(&self.abs(&name));
                let chrono = self.chrono;
                let epoch = self.req_chrono;
                self.nodes[n.0 as usize].refresh(crc, sig, chrono, epoch);
                if crc == Crc::None {
                    if let Some(req) = self.reqs.get_mut(&rq) {
                        req.errors.push((n, "source file is missing".to_string()));
                    }
                }
            }
            let node = &mut self.nodes[n.0 as usize];
            node.status = if matches!(b, Buildable::SrcDir) {
                NodeStatus::SrcDir
            } else {
                NodeStatus::Src
            };
            self.finish_node(rq, n);
            return true;
        }
        if !b.is_buildable() {
            let name = {
                let node = &mut self.nodes[n.0 as usize];
                node.status = NodeStatus::None;
                node.crc = Crc::None;
                node.name.clone()
            };
            // an unbuildable file may still exist on disk (external data)
            let sig = self.disk_sig(&name);
            if sig.exists() {
                let crc = ferret_solve::crc_of(&self.abs(&name));
                let chrono = self.chrono;
                let epoch = self.req_chrono;
                self.nodes[n.0 as usize].refresh(crc, sig, chrono, epoch);
            }
            self.finish_node(rq, n);
            return true;
        }
        if goal == NodeGoal::Makable {
            self.finish_node(rq, n);
            return true;
        }
        // walk the candidate tier
        let tier = self.nodes[n.0 as usize].job_tgts.clone();
        self.reqs.get_mut(&rq).unwrap().node_info(n).visiting = true;
        let mut n_wait = 0u32;
        for j in &tier {
            {
                let req = self.reqs.get_mut(&rq).unwrap();
                let ji = req.job_info(*j);
                if ji.step == JobStep::Done {
                    continue;
                }
            }
            if self.make_job(rq, *j, depth) {
                self.reqs.get_mut(&rq).unwrap().job_info(*j).step = JobStep::Done;
            } else {
                let req = self.reqs.get_mut(&rq).unwrap();
                req.job_info(*j).watchers.push(n);
                n_wait += 1;
            }
        }
        if n_wait > 0 {
            let ri = self.reqs.get_mut(&rq).unwrap().node_info(n);
            ri.visiting = false;
            ri.n_wait = n_wait;
            return false;
        }
        self.conform(rq, n, &tier);
        self.finish_node(rq, n);
        true
    }

    /// Choose the producer once the whole tier settled.
    fn conform(&mut self, rq: ReqId, n: NodeId, tier: &[JobId]) {
        let mut claimants: Vec<usize> = Vec::new();
        for (i, &j) in tier.iter().enumerate() {
            let job = &self.jobs[j.0 as usize];
            // an errored job produces all its potential targets, so that
            // dependents surface the error rather than a missing file
            let claims = job.err() || job.sure || job.produces(n)
                || self.nodes[n.0 as usize].actual_job == Some(j);
            if claims {
                claimants.push(i);
            }
        }
        let node = &mut self.nodes[n.0 as usize];
        match claimants.len() {
            0 => {
                node.status = NodeStatus::None;
                node.crc = Crc::None;
            }
            1 => {
                node.conform_idx = Some(claimants[0]);
                node.status = NodeStatus::Plain;
            }
            _ => {
                node.status = NodeStatus::Multi;
                let names: Vec<String> = claimants
                    .iter()
                    .map(|&i| self.jobs[tier[i].0 as usize].rule_name.clone())
                    .collect();
                if let Some(req) = self.reqs.get_mut(&rq) {
                    req.errors.push((
                        n,
                        format!("several rules produce this file: {}", names.join(", ")),
                    ));
                }
            }
        }
        // uphill texture: a produced node under a symlinked dir is transient
        if let Some(d) = self.nodes[n.0 as usize].dir {
            let dname = self.nodes[d.0 as usize].name.clone();
            match FileInfo::of(&self.abs(&dname), true).tag {
                ferret_proto::FileTag::Lnk => {
                    self.nodes[n.0 as usize].status = NodeStatus::Transcient
                }
                ferret_proto::FileTag::Reg
                | ferret_proto::FileTag::Empty
                | ferret_proto::FileTag::Exe => {
                    self.nodes[n.0 as usize].status = NodeStatus::Uphill
                }
                _ => {}
            }
        }
    }

    fn finish_node(&mut self, rq: ReqId, n: NodeId) {
        if let Some(req) = self.reqs.get_mut(&rq) {
            let ri = req.node_info(n);
            ri.done = ri.goal;
            ri.n_wait = 0;
            ri.visiting = false;
        }
    }

    /// Analyze `j` for `rq`; submit it if stale. True if done.
    fn make_job(&mut self, rq: ReqId, j: JobId, depth: u32) -> bool {
        {
            let Some(req) = self.reqs.get_mut(&rq) else {
                return true;
            };
            if req.zombie {
                return true;
            }
            let ji = req.job_info(j);
            if ji.step == JobStep::Done {
                return true;
            }
            if ji.n_wait > 0 {
                return false;
            }
        }
        let job = &self.jobs[j.0 as usize];
        if let Some(Special::Infinite) = job.special {
            self.finish_job(rq, j);
            return true;
        }
        if job.frozen {
            let req = self.reqs.get_mut(&rq).unwrap();
            if !req.frozen_warned.contains(&j) {
                req.frozen_warned.push(j);
                tracing::warn!(job = %self.jobs[j.0 as usize].full_name, "reading a frozen job's targets");
            }
            self.finish_job(rq, j);
            return true;
        }
        if job.running {
            // at-most-one execution: wait for the other request's run
            let req = self.reqs.get_mut(&rq).unwrap();
            let ji = req.job_info(j);
            ji.step = JobStep::Exec;
            ji.n_wait = 1;
            return false;
        }

        // deps first: statics, then what the last run recorded
        let mut dep_nodes: Vec<(NodeId, Dflags)> = Vec::new();
        let statics = self.jobs[j.0 as usize].static_deps.clone();
        for (name, dflags) in &statics {
            let d = self.node(name);
            dep_nodes.push((d, *dflags));
        }
        let recorded: Vec<(NodeId, Dflags)> = self.jobs[j.0 as usize]
            .deps
            .iter()
            .map(|d| (d.node, d.dflags))
            .collect();
        for (d, f) in recorded {
            if !dep_nodes.iter().any(|(e, _)| *e == d) {
                dep_nodes.push((d, f));
            }
        }
        {
            let req = self.reqs.get_mut(&rq).unwrap();
            req.job_info(j).step = JobStep::Dep;
        }
        let mut n_wait = 0u32;
        for (d, _) in &dep_nodes {
            {
                let req = self.reqs.get_mut(&rq).unwrap();
                let ri = req.node_info(*d);
                ri.goal = ri.goal.max(NodeGoal::Status);
                if ri.done >= ri.goal {
                    continue;
                }
            }
            if self.make_node(rq, *d, depth + 1) {
                self.node_completed(rq, *d);
            } else {
                let req = self.reqs.get_mut(&rq).unwrap();
                req.node_info(*d).watchers.push(Some(j));
                n_wait += 1;
            }
        }
        if n_wait > 0 {
            self.reqs.get_mut(&rq).unwrap().job_info(j).n_wait = n_wait;
            return false;
        }

        // all deps settled: decide whether to run
        let mut dep_err = false;
        let mut missing_static = false;
        for (d, dflags) in &dep_nodes {
            match self.node_ok(*d) {
                Some(false) if !dflags.contains(Dflags::IGNORE_ERROR) => dep_err = true,
                None | Some(true) => {
                    let node = &self.nodes[d.0 as usize];
                    if dflags.contains(Dflags::REQUIRED)
                        && node.crc == Crc::None
                        && !node.buildable.is_buildable()
                    {
                        missing_static = true;
                    }
                }
                _ => {}
            }
        }
        if missing_static {
            self.jobs[j.0 as usize].run_status = RunStatus::MissingStatic;
            self.finish_job(rq, j);
            return true;
        }
        if dep_err {
            self.jobs[j.0 as usize].run_status = RunStatus::DepErr;
            self.finish_job(rq, j);
            return true;
        }
        self.jobs[j.0 as usize].run_status = RunStatus::Ok;

        match self.rerun_reason(j) {
            Some(reason) => {
                // a run we already paid for in this request that came back
                // Lost/Killed surfaces as an error; the user retries
                {
                    let req = self.reqs.get_mut(&rq).unwrap();
                    let already = req.job_info(j).n_submits > 0;
                    if already
                        && matches!(
                            self.jobs[j.0 as usize].status,
                            Status::Lost | Status::Killed
                        )
                    {
                        self.finish_job(rq, j);
                        return true;
                    }
                }
                let n_submits = {
                    let req = self.reqs.get_mut(&rq).unwrap();
                    let ji = req.job_info(j);
                    ji.n_submits += 1;
                    ji.n_submits
                };
                if n_submits > self.cfg.submit_max {
                    self.jobs[j.0 as usize].run_status = RunStatus::Err;
                    if let Some(req) = self.reqs.get_mut(&rq) {
                        req.errors.push((
                            *self.jobs[j.0 as usize].targets.first().unwrap_or(&NodeId(0)),
                            "job keeps requiring reruns".to_string(),
                        ));
                    }
                    self.finish_job(rq, j);
                    return true;
                }
                let seq_id = self.next_seq;
                self.next_seq += 1;
                {
                    let job = &mut self.jobs[j.0 as usize];
                    job.running = true;
                    job.seq_id = seq_id;
                    job.start_chrono = self.chrono;
                }
                {
                    let req = self.reqs.get_mut(&rq).unwrap();
                    let ji = req.job_info(j);
                    ji.step = JobStep::Queued;
                    ji.n_wait = 1;
                    req.summary.jobs_run += 1;
                }
                tracing::info!(job = %self.jobs[j.0 as usize].full_name, %seq_id, %reason, "submit");
                self.backend.submit(Submission { job: j, seq_id, reason });
                false
            }
            None => {
                if let Some(req) = self.reqs.get_mut(&rq) {
                    req.summary.up_to_date += 1;
                }
                self.finish_job(rq, j);
                true
            }
        }
    }

    /// Why the job must run again; `None` = up to date.
    fn rerun_reason(&mut self, j: JobId) -> Option<String> {
        {
            let job = &self.jobs[j.0 as usize];
            if job.status == Status::New {
                return Some("never ran".to_string());
            }
            if matches!(job.status, Status::Lost | Status::Killed) {
                return Some(format!("previous run was {:?}", job.status).to_lowercase());
            }
            if job.cmd_gen != job.rule_cmd_gen {
                return Some("rule command changed".to_string());
            }
        }
        // targets: missing, poluted or manually modified. Only meaningful
        // when the last run succeeded: an errored job's current outcome IS
        // its error, a missing target does not call for a rerun.
        let (targets, specs) = {
            let job = &self.jobs[j.0 as usize];
            if job.status != Status::Ok {
                (Vec::new(), Vec::new())
            } else {
                let targets: Vec<NodeId> = job
                    .targets
                    .iter()
                    .chain(job.star_targets.iter())
                    .copied()
                    .collect();
                (targets, job.target_specs.clone())
            }
        };
        for t in targets {
            let (name, actual, crc, manual) = {
                let node = &self.nodes[t.0 as usize];
                let d = self.disk_sig(&node.name);
                (node.name.clone(), node.actual_job, node.crc, node.manual(d))
            };
            if actual.is_some() && actual != Some(j) {
                return Some(format!("target {name} owned by another job"));
            }
            let phony = specs
                .iter()
                .any(|s| s.pattern == name && s.tflags.contains(Tflags::PHONY));
            match manual {
                Manual::Clean => {}
                Manual::Disappeared => {
                    if !phony && crc != Crc::None {
                        return Some(format!("target {name} missing on disk"));
                    }
                }
                Manual::Modified => {
                    // steady rewrites only refresh the date; real changes rerun
                    let disk_crc = ferret_solve::crc_of(&self.abs(&name));
                    if disk_crc.matches(crc, ferret_proto::Accesses::ALL) {
                        let chrono = self.chrono;
                        let epoch = self.req_chrono;
                        let sig = self.disk_sig(&name);
                        self.nodes[t.0 as usize].refresh(disk_crc, sig, chrono, epoch);
                    } else {
                        return Some(format!("target {name} was manually modified"));
                    }
                }
            }
        }
        // deps: any content drift from what the job last saw
        let (start_chrono, end_chrono) = {
            let job = &self.jobs[j.0 as usize];
            (job.start_chrono, job.end_chrono)
        };
        let deps = self.jobs[j.0 as usize].deps.clone();
        for dep in &deps {
            if dep.garbage {
                return Some(format!(
                    "dep {} changed while the job ran",
                    self.nodes[dep.node.0 as usize].name
                ));
            }
            let node = &self.nodes[dep.node.0 as usize];
            // a dep refreshed by a run that ended strictly inside this job's
            // own window may have been read on either side of the rewrite;
            // file dates cannot settle which, so the recorded content is
            // distrusted (modular compare, the counters wrap)
            if start_chrono.is_before(node.crc_chrono, self.chrono)
                && node.crc_chrono.is_before(end_chrono, self.chrono)
            {
                return Some(format!("dep {} was rewritten during the run", node.name));
            }
            if !node.crc.matches(dep.crc_seen, dep.accesses) {
                return Some(format!("dep {} changed", node.name));
            }
        }
        None
    }

    fn finish_job(&mut self, rq: ReqId, j: JobId) {
        if let Some(req) = self.reqs.get_mut(&rq) {
            let ji = req.job_info(j);
            ji.step = JobStep::Done;
            ji.n_wait = 0;
            if self.jobs[j.0 as usize].err() {
                req.summary.jobs_failed += 1;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Execution interface (backend / supervisor driven)
    // -------------------------------------------------------------------------

    /// Build the start reply for a supervisor that just dialed in.
    pub fn start_info(&mut self, seq_id: SeqId, j: JobId) -> StartReply {
        let Some(job) = self.jobs.get(j.0 as usize) else {
            return StartReply::default(); // run=false
        };
        if !job.running || job.seq_id != seq_id {
            return StartReply::default(); // stale supervisor: give up
        }
        let small_id = (j.0 % 1024) + 1;
        for req in self.reqs.values_mut() {
            if let Some(ji) = req.jobs.get_mut(&j) {
                if ji.step == JobStep::Queued {
                    ji.step = JobStep::Exec;
                }
            }
        }
        let job = &self.jobs[j.0 as usize];
        StartReply {
            run: true,
            cwd: String::new(),
            env: vec![("PATH".to_string(), ferret_proto::ENV_PASS_MARKER.to_string())],
            interpreter: job.interpreter.clone(),
            cmd: job.cmd.clone(),
            targets: job.target_specs.clone(),
            static_deps: job.static_deps.clone(),
            autodep_env: AutodepEnv {
                root_dir: self.cfg.root_dir.clone(),
                tmp_dir: format!("{}/{small_id}", self.cfg.tmp_root),
                tmp_view: self.cfg.tmp_view.clone(),
                src_dirs: self
                    .rules
                    .src_dirs
                    .iter()
                    .map(|d| format!("{d}/"))
                    .collect(),
                lnk_support: self.cfg.lnk_support,
                reliable_dirs: self.cfg.reliable_dirs,
                service: String::new(), // stamped by the supervisor
                admin_dir: self.cfg.admin_dir.clone(),
                disabled: false,
            },
            kill_sigs: self.cfg.kill_sigs.clone(),
            timeout_ms: self.cfg.timeout_ms,
            stdin: String::new(),
            stdout: String::new(),
            live_out: self.cfg.live_out,
            keep_tmp: self.cfg.keep_tmp,
            remote_admin_dir: format!("{}/{}", self.cfg.root_dir, self.cfg.admin_dir),
            small_id,
        }
    }

    /// Ingest an end-of-job digest: update target nodes, record deps with
    /// their parallel groups, advance the chronology, wake every waiter.
    pub fn end_job(&mut self, seq_id: SeqId, j: JobId, digest: &JobDigest) -> Result<(), EngineError> {
        let job = self
            .jobs
            .get(j.0 as usize)
            .ok_or(EngineError::UnknownJob(j))?;
        if job.seq_id != seq_id {
            return Err(EngineError::StaleSeq { job: j, seq_id });
        }
        self.chrono = self.chrono.next();
        let chrono = self.chrono;

        // targets: refresh each node's content from the digest
        let mut star_targets = Vec::new();
        let mut target_sigs = Vec::new();
        let statics = self.jobs[j.0 as usize].targets.clone();
        for (path, td) in &digest.targets {
            let n = self.node(path);
            let sig = self.disk_sig(path);
            let crc = if td.unlink { Crc::None } else { td.crc };
            let epoch = self.req_chrono;
            let modified = self.nodes[n.0 as usize].refresh(crc, sig, chrono, epoch);
            self.nodes[n.0 as usize].actual_job = Some(j);
            if td.unlink {
                self.nodes[n.0 as usize].unlinked = true;
            }
            if !statics.contains(&n) {
                star_targets.push(n);
            }
            target_sigs.push(sig);
            tracing::debug!(target = %path, ?crc, modified, "target refreshed");
            if modified {
                // requests that had already settled on this node's content
                // without analyzing this job just had it changed under them
                for req in self.reqs.values_mut() {
                    if req.zombie || req.jobs.contains_key(&j) {
                        continue;
                    }
                    if let Some(ri) = req.nodes.get_mut(&n) {
                        if ri.done >= NodeGoal::Status && !ri.overwritten {
                            ri.overwritten = true;
                            req.errors.push((
                                n,
                                "file was overwritten while the request ran".to_string(),
                            ));
                        }
                    }
                }
            }
        }
        // an errored job is deemed to produce every potential target
        if !digest.status.is_ok() {
            for &t in &statics {
                self.nodes[t.0 as usize].actual_job = Some(j);
            }
        }
        // deps, preserving chronological parallel groups
        let mut deps = Vec::with_capacity(digest.deps.len());
        for (path, dd) in &digest.deps {
            let n = self.node(path);
            // acquire the crc the job actually consumed: if the node's disk
            // signature still matches what the job saw, its current crc is
            // what was read; unknown nodes (hidden deps) read the disk now
            let needs_read = {
                let node = &self.nodes[n.0 as usize];
                !dd.garbage && (node.sig != dd.sig || node.crc == Crc::Unknown)
            };
            if needs_read {
                let sig_now = self.disk_sig(path);
                if sig_now == dd.sig {
                    let crc = ferret_solve::crc_of(&self.abs(path));
                    let epoch = self.req_chrono;
                    self.nodes[n.0 as usize].refresh(crc, sig_now, chrono, epoch);
                }
            }
            let node = &self.nodes[n.0 as usize];
            let crc_seen = if dd.garbage {
                Crc::Unknown
            } else if node.sig == dd.sig && node.crc != Crc::Unknown {
                node.crc
            } else if !dd.sig.exists() {
                Crc::None
            } else {
                Crc::Unknown
            };
            deps.push(Dep {
                node: n,
                accesses: dd.accesses,
                dflags: dd.dflags,
                parallel: dd.parallel,
                crc_seen,
                garbage: dd.garbage,
            });
        }
        {
            let job = &mut self.jobs[j.0 as usize];
            job.running = false;
            job.status = digest.status;
            job.cmd_gen = job.rule_cmd_gen;
            job.end_chrono = chrono;
            job.exec_time_ms = digest.stats.job_ms;
            job.star_targets = star_targets;
            job.target_sigs = target_sigs;
            job.deps = deps;
            if !digest.analysis_err.is_empty() {
                job.run_status = RunStatus::Err;
            }
        }
        // wake every request that waits on this job
        let reqs: Vec<ReqId> = self.reqs.keys().copied().collect();
        for rq in reqs {
            let has = self
                .reqs
                .get_mut(&rq)
                .map(|r| r.jobs.contains_key(&j))
                .unwrap_or(false);
            if has {
                let req = self.reqs.get_mut(&rq).unwrap();
                let ji = req.job_info(j);
                if ji.step >= JobStep::Queued && ji.step < JobStep::Done {
                    ji.n_wait = 0;
                    self.wakes.push_back((rq, Wake::Job(j)));
                }
            }
        }
        self.drain();
        Ok(())
    }

    /// The supervisor vanished: record the job as lost so requests surface
    /// an error instead of hanging. Retryable by the user.
    pub fn job_lost(&mut self, j: JobId) -> Result<(), EngineError> {
        let job = self
            .jobs
            .get(j.0 as usize)
            .ok_or(EngineError::UnknownJob(j))?;
        if !job.running {
            return Ok(());
        }
        let seq_id = job.seq_id;
        tracing::warn!(job = %job.full_name, %seq_id, "job lost");
        let digest = JobDigest {
            status: Status::Lost,
            ..Default::default()
        };
        self.end_job(seq_id, j, &digest)
    }

    /// Mid-run dep check for a running job.
    pub fn chk_deps(&mut self, deps: &[(String, DepDigest)]) -> ChkDepsVerdict {
        for (path, dd) in deps {
            if let Some(n) = self.lookup_node(path) {
                if self.node_ok(n) == Some(false) {
                    return ChkDepsVerdict::Err;
                }
            }
            let sig = self.disk_sig(path);
            if !dd.accesses.is_empty() && sig != dd.sig {
                return ChkDepsVerdict::Changed;
            }
        }
        ChkDepsVerdict::Ok
    }

    /// Content digests for specific paths, as currently known.
    pub fn dep_infos(&mut self, paths: &[String]) -> Vec<Crc> {
        paths
            .iter()
            .map(|p| match self.lookup_node(p) {
                Some(n) if self.nodes[n.0 as usize].crc != Crc::Unknown => {
                    self.nodes[n.0 as usize].crc
                }
                _ => ferret_solve::crc_of(&self.abs(p)),
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Invalidate every node's match so the next pass redoes
    /// `set_buildable`; called when rules changed.
    pub fn invalidate_matches(&mut self) {
        self.match_gen += 1;
    }

    /// Forget what we know about a node (and optionally its producer's
    /// targets and deps), forcing re-analysis on the next request.
    pub fn forget(&mut self, name: &str, targets: bool, deps: bool) -> bool {
        let Some(n) = self.lookup_node(name) else {
            return false;
        };
        let node = &mut self.nodes[n.0 as usize];
        node.match_gen = 0;
        node.buildable = Buildable::Unknown;
        node.conform_idx = None;
        node.status = NodeStatus::Unknown;
        let producer = node.actual_job;
        if let Some(jid) = producer {
            let job = &mut self.jobs[jid.0 as usize];
            job.status = Status::New;
            if targets {
                for t in job.targets.clone() {
                    self.nodes[t.0 as usize].crc = Crc::Unknown;
                }
            }
            if deps {
                self.jobs[jid.0 as usize].deps.clear();
            }
        }
        true
    }

    /// Mark a job frozen (trusted like a source) or thaw it.
    pub fn freeze(&mut self, full_name: &str, frozen: bool) -> bool {
        match self.lookup_job(full_name) {
            Some(j) => {
                self.jobs[j.0 as usize].frozen = frozen;
                true
            }
            None => false,
        }
    }
}
