//! Per-node state.

use crate::{JobChrono, JobId, NodeId, ReqChrono};
use ferret_proto::{Crc, FileSig};

/// Data-independent classification: could some rule produce this file?
/// Ordered so that `<= No` means "not buildable, no candidates".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Buildable {
    /// Name longer than the configured maximum (warned once).
    LongName,
    /// Matches an anti-pattern: declared non-buildable.
    Anti,
    /// A source dir: only its existing content is buildable.
    SrcDir,
    No,
    /// Buildability is data dependent (a star target may or may not appear).
    Maybe,
    /// Inside a source dir.
    SubSrcDir,
    Yes,
    /// Listed in the manifest.
    Src,
    /// Under analysis; blocks further recursion so rule chains cannot loop.
    /// Never persists past a completed pass.
    Loop,
    /// Not yet computed.
    #[default]
    Unknown,
}

impl Buildable {
    pub fn is_src(self) -> bool {
        matches!(self, Buildable::Src | Buildable::SubSrcDir | Buildable::SrcDir)
    }

    pub fn is_buildable(self) -> bool {
        matches!(
            self,
            Buildable::Maybe | Buildable::Yes | Buildable::Src | Buildable::SubSrcDir
        )
    }
}

/// How the node is (or is not) produced, once analysis settled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NodeStatus {
    /// Produced by the conform job.
    Plain,
    /// Several jobs at equal priority claim it: an error on the node.
    Multi,
    /// A source (or a file inside a source dir).
    Src,
    /// A source dir (or a dir inside one).
    SrcDir,
    /// No job produces it.
    None,
    /// Its uphill dir is a symlink: the node will vanish when the dir's
    /// producer reruns, unless it is a static dep.
    Transcient,
    /// Its uphill dir is a regular file: the node cannot exist.
    Uphill,
    #[default]
    Unknown,
}

/// One file known to the engine.
#[derive(Debug, Default)]
pub struct NodeData {
    pub name: String,
    /// Uphill directory node, created on demand.
    pub dir: Option<NodeId>,
    /// Last known content digest.
    pub crc: Crc,
    /// Disk signature observed when `crc` was computed.
    pub sig: FileSig,
    pub buildable: Buildable,
    /// Candidate producing jobs, decreasing priority (one tier).
    pub job_tgts: Vec<JobId>,
    /// Index into `job_tgts` of the conform producer.
    pub conform_idx: Option<usize>,
    pub status: NodeStatus,
    /// Job that actually generated the node on disk.
    pub actual_job: Option<JobId>,
    /// Node was unlinked by another rule; disk must be reconsulted.
    pub unlinked: bool,
    /// Valid iff equal to the engine's current match generation.
    pub match_gen: u32,
    /// End stamp of the job run that last set `crc`. A dep whose stamp
    /// falls strictly inside a consumer's run window is distrusted.
    pub crc_chrono: JobChrono,
    /// Request epoch at which `crc`/`sig` were last verified against the
    /// disk: requests opened at or before it need not re-read.
    pub coherent_req: ReqChrono,
    /// LongName was already reported to the user.
    pub long_warned: bool,
}

/// Manual-modification verdict against the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Manual {
    /// Disk agrees with what the engine believes.
    Clean,
    /// The file disappeared.
    Disappeared,
    /// The file was modified (or appeared) behind the engine's back.
    Modified,
}

impl NodeData {
    pub fn new(name: String) -> Self {
        NodeData {
            name,
            ..Default::default()
        }
    }

    pub fn conform_job(&self) -> Option<JobId> {
        match self.status {
            NodeStatus::Plain => self.conform_idx.map(|i| self.job_tgts[i]),
            _ => None,
        }
    }

    /// Compare the engine's belief with the disk signature `d`.
    pub fn manual(&self, d: FileSig) -> Manual {
        if self.crc == Crc::None {
            if !d.exists() {
                Manual::Clean
            } else {
                Manual::Modified // created behind our back
            }
        } else if !d.exists() {
            Manual::Disappeared
        } else if d == self.sig {
            Manual::Clean
        } else {
            Manual::Modified
        }
    }

    /// Record a fresh (crc, sig) pair; true if the content actually changed.
    pub fn refresh(&mut self, crc: Crc, sig: FileSig, chrono: JobChrono, epoch: ReqChrono) -> bool {
        let modified = !crc.matches(self.crc, ferret_proto::Accesses::ALL);
        self.crc = crc;
        self.sig = sig;
        self.crc_chrono = chrono;
        self.coherent_req = epoch;
        self.unlinked = false;
        modified
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferret_proto::{Accesses, ContentHash, FileTag};

    #[test]
    fn buildable_order_matches_semantics() {
        assert!(Buildable::Anti <= Buildable::No);
        assert!(Buildable::SrcDir <= Buildable::No);
        assert!(Buildable::Maybe > Buildable::No);
        assert!(!Buildable::Anti.is_buildable());
        assert!(Buildable::Src.is_buildable() && Buildable::Src.is_src());
    }

    #[test]
    fn manual_detection() {
        let mut n = NodeData::new("f".to_string());
        let sig = FileSig::new(FileTag::Reg, 100, 5);
        n.refresh(Crc::Plain(ContentHash::from_bytes(b"x")), sig, JobChrono(1), ReqChrono(1));
        assert_eq!(n.manual(sig), Manual::Clean);
        assert_eq!(n.manual(FileSig::new(FileTag::Reg, 200, 5)), Manual::Modified);
        assert_eq!(n.manual(FileSig::default()), Manual::Disappeared);

        let absent = NodeData::new("g".to_string());
        assert_eq!(absent.manual(FileSig::default()), Manual::Clean);
        assert_eq!(absent.manual(sig), Manual::Modified);
    }

    #[test]
    fn refresh_reports_modification_and_stamps_both_clocks() {
        let mut n = NodeData::new("f".to_string());
        let sig = FileSig::new(FileTag::Reg, 100, 5);
        assert!(n.refresh(Crc::Plain(ContentHash::from_bytes(b"x")), sig, JobChrono(1), ReqChrono(3)));
        assert_eq!(n.crc_chrono, JobChrono(1));
        assert_eq!(n.coherent_req, ReqChrono(3));
        // steady rewrite: same content, newer date
        let sig2 = FileSig::new(FileTag::Reg, 300, 5);
        assert!(!n.refresh(Crc::Plain(ContentHash::from_bytes(b"x")), sig2, JobChrono(2), ReqChrono(4)));
        assert_eq!(n.sig, sig2);
        assert_eq!(n.coherent_req, ReqChrono(4));
        let _ = Accesses::ALL;
    }
}
