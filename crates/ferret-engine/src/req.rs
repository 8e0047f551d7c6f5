//! Per-request bookkeeping.
//!
//! Requests share the graph; everything request-specific lives here, in side
//! tables keyed by `(req, node)` / `(req, job)` so the graph itself stays
//! request-agnostic.

use crate::{JobId, JobStep, NodeId, ReqChrono};
use std::collections::HashMap;

/// Analysis depth requested for a node, in increasing order of ambition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeGoal {
    #[default]
    None,
    /// Just know whether the node can be made.
    Makable,
    /// Know its up-to-date content digest.
    Status,
    /// Have the file present on disk.
    Dsk,
}

/// Per-(req, node) analysis state. Watchers of nodes are jobs.
#[derive(Debug, Default)]
pub struct NodeReqInfo {
    pub goal: NodeGoal,
    /// Analysis completed up to this goal.
    pub done: NodeGoal,
    /// Outstanding candidate jobs we are waiting for.
    pub n_wait: u32,
    /// Jobs to wake when this node completes; None stands for the request's
    /// root watcher.
    pub watchers: Vec<Option<JobId>>,
    /// A job this request never analyzed rewrote the node after this
    /// request had already settled on its content.
    pub overwritten: bool,
    /// An analysis frame for this node is on the stack right now: reaching
    /// it again means the dep graph cycles through it.
    pub visiting: bool,
}

impl NodeReqInfo {
    pub fn is_done(&self, goal: NodeGoal) -> bool {
        self.done >= goal
    }
}

/// Per-(req, job) analysis state. Watchers of jobs are nodes.
#[derive(Debug, Default)]
pub struct JobReqInfo {
    pub step: JobStep,
    /// Outstanding deps we are waiting for.
    pub n_wait: u32,
    pub watchers: Vec<NodeId>,
    /// Submissions already done for this request, to break resubmit loops.
    pub n_submits: u8,
}

/// Counters reported to the user when a request completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReqSummary {
    pub jobs_run: u32,
    pub jobs_failed: u32,
    pub up_to_date: u32,
}

/// One user build request.
#[derive(Debug)]
pub struct Req {
    pub roots: Vec<NodeId>,
    /// A cancelled request: no further work is queued on its behalf, its
    /// done-level snaps to the maximum so waiters drain.
    pub zombie: bool,
    pub chrono: ReqChrono,
    pub summary: ReqSummary,
    pub nodes: HashMap<NodeId, NodeReqInfo>,
    pub jobs: HashMap<JobId, JobReqInfo>,
    /// Errors to surface to the user, per node.
    pub errors: Vec<(NodeId, String)>,
    /// Frozen jobs already warned about.
    pub frozen_warned: Vec<JobId>,
}

impl Req {
    pub fn new(roots: Vec<NodeId>, chrono: ReqChrono) -> Self {
        Req {
            roots,
            zombie: false,
            chrono,
            summary: ReqSummary::default(),
            nodes: HashMap::new(),
            jobs: HashMap::new(),
            errors: Vec::new(),
            frozen_warned: Vec::new(),
        }
    }

    pub fn node_info(&mut self, node: NodeId) -> &mut NodeReqInfo {
        self.nodes.entry(node).or_default()
    }

    pub fn job_info(&mut self, job: JobId) -> &mut JobReqInfo {
        self.jobs.entry(job).or_default()
    }

    /// All roots analyzed to their goal?
    pub fn done(&self) -> bool {
        self.roots.iter().all(|r| {
            self.nodes
                .get(r)
                .map(|ri| ri.done >= ri.goal)
                .unwrap_or(false)
        })
    }
}
