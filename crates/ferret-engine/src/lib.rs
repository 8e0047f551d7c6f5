//! The persistent build graph and its make loop.
//!
//! The graph is bipartite: *nodes* (files) point to the candidate *jobs*
//! that could produce them, jobs point to the nodes they depend on and
//! produce. Both live in arenas and refer to each other by index, so the
//! node↔job reference cycle never owns anything. Per-request analysis state
//! lives in side tables keyed by `(req, index)`.
//!
//! The engine is single-threaded; concurrency lives around it. Everything
//! that happens elsewhere (job completions, request arrivals) enters through
//! method calls, and the only ordering the engine relies on is that a job's
//! end is observed before any dependent analysis that uses it, which the
//! caller's event channel provides by construction.

mod chrono;
mod engine;
mod job;
mod node;
mod req;
mod rules;

pub use chrono::{JobChrono, ReqChrono};
pub use engine::{Backend, Engine, EngineConfig, Submission};
pub use job::{JobData, JobStep, RunStatus, Special};
pub use node::{Buildable, NodeData, NodeStatus};
pub use req::{Req, ReqSummary};
pub use rules::{JobProto, Rule, RuleSet};

/// Index of a node in the node arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// Index of a job in the job arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u32);

/// Index of a live request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReqId(pub u32);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "N{}", self.0)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "J{}", self.0)
    }
}

impl std::fmt::Display for ReqId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "R{}", self.0)
    }
}

/// Engine-level failures surfaced to the caller (requests keep their own
/// per-node error reporting; these are operational).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unknown request {0}")]
    UnknownReq(ReqId),

    #[error("unknown job {0}")]
    UnknownJob(JobId),

    #[error("job {job} reported with stale sequence {seq_id}")]
    StaleSeq { job: JobId, seq_id: u64 },
}

#[cfg(test)]
mod tests;
