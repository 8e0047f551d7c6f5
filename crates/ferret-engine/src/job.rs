//! Per-job state.

use crate::{JobChrono, NodeId};
use ferret_proto::{Accesses, Crc, Dflags, FileSig, Status, TargetSpec};

/// Why a job cannot run, distinct from how its execution ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunStatus {
    #[default]
    Ok,
    /// Some dep is in error.
    DepErr,
    /// A required static dep cannot be made.
    MissingStatic,
    /// An error was seen before even starting (bad targets, ...).
    Err,
}

/// Analysis progress of a job within one request, in chronological order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobStep {
    #[default]
    None,
    /// Analyzing deps.
    Dep,
    /// Submitted, waiting for the backend to pick it up.
    Queued,
    /// Executing.
    Exec,
    /// Done (or impossible to execute).
    Done,
}

/// Special jobs have no rule command; the engine fabricates their outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Special {
    /// The rule chain recurses forever; this job reports the cycle once.
    Infinite,
}

/// One recorded dependency edge.
#[derive(Debug, Clone)]
pub struct Dep {
    pub node: NodeId,
    pub accesses: Accesses,
    pub dflags: Dflags,
    /// Same parallel group as the previous dep: order within the group is
    /// not significant.
    pub parallel: bool,
    /// Content the job saw when it last ran.
    pub crc_seen: Crc,
    /// The file changed while the job ran; its content is unreliable.
    pub garbage: bool,
}

/// One rule applied to one target: the unit of execution.
#[derive(Debug, Default)]
pub struct JobData {
    /// Unique (rule, target) name.
    pub full_name: String,
    pub rule_name: String,
    pub prio: i32,
    /// A sure job produces its targets data-independently.
    pub sure: bool,
    pub special: Option<Special>,
    /// Static targets, instantiated from the rule.
    pub targets: Vec<NodeId>,
    pub target_specs: Vec<TargetSpec>,
    /// Star targets learned from an actual run.
    pub star_targets: Vec<NodeId>,
    pub static_deps: Vec<(String, Dflags)>,
    /// Full dep list as recorded by the last run.
    pub deps: Vec<Dep>,
    pub cmd: String,
    pub interpreter: Vec<String>,
    /// Last execution outcome.
    pub status: Status,
    pub run_status: RunStatus,
    /// Generation of the rule command this job last ran with.
    pub cmd_gen: u32,
    /// Generation the rule currently has; differs after an edit.
    pub rule_cmd_gen: u32,
    /// A frozen job is trusted like a source: never rerun, warned when read.
    pub frozen: bool,
    /// At-most-one concurrent execution across all requests.
    pub running: bool,
    /// Sequence id of the running (or last) execution.
    pub seq_id: u64,
    pub start_chrono: JobChrono,
    pub end_chrono: JobChrono,
    /// Best known execution time.
    pub exec_time_ms: u64,
    /// Disk signature of each target when the job last ended, parallel to
    /// `targets` then `star_targets`.
    pub target_sigs: Vec<FileSig>,
}

impl JobData {
    pub fn err(&self) -> bool {
        matches!(self.status, Status::Err | Status::Lost | Status::Killed)
            || self.run_status != RunStatus::Ok
    }

    /// Does this job (claim to) produce `node`? Sure jobs claim statically;
    /// others claim after a run proved it (star targets included).
    pub fn produces(&self, node: NodeId) -> bool {
        if self.targets.contains(&node) {
            return true;
        }
        self.star_targets.contains(&node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_order_is_chronological() {
        assert!(JobStep::None < JobStep::Dep);
        assert!(JobStep::Dep < JobStep::Queued);
        assert!(JobStep::Queued < JobStep::Exec);
        assert!(JobStep::Exec < JobStep::Done);
    }

    #[test]
    fn err_covers_both_status_kinds() {
        let mut j = JobData::default();
        assert!(!j.err());
        j.status = Status::Err;
        assert!(j.err());
        j.status = Status::Ok;
        j.run_status = RunStatus::DepErr;
        assert!(j.err());
    }
}
