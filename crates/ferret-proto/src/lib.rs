//! Wire protocol definitions shared by the build server, the per-job
//! supervisor and the libc interposer.
//!
//! Three surfaces live here:
//! - the `Jobs` service (supervisor → server): start/end/chk_deps/
//!   dep_infos/live_out
//! - the `Supervisor` service (server → supervisor): heartbeat/kill
//! - the framed access channel (interposer → supervisor): one
//!   [`AccessReport`] per recorded filesystem access
//!
//! Everything that crosses a socket derives `Facet`; the access channel is
//! newline-framed `facet-json` because the interposer side must stay free of
//! async machinery.

use facet::Facet;
use jiff::civil::DateTime;

/// Job server protocol version.
/// Bump this when making breaking changes to the RPC interface.
pub const PROTOCOL_VERSION: u32 = 1;

/// How many job traces are kept on disk before the slots are overwritten.
pub const JOB_HISTORY: u64 = 1000;

/// Env var holding the facet-json encoded [`AutodepEnv`] for the interposer.
pub const AUTODEP_ENV_VAR: &str = "FERRET_AUTODEP_ENV";

/// Env var capturing `LD_LIBRARY_PATH` as it was when the job started, so
/// that later mutations by the job do not mislead ELF dependency discovery.
pub const LD_LIBRARY_PATH_VAR: &str = "FERRET_LD_LIBRARY_PATH";

/// Marker value in an env template meaning "inherit this variable from the
/// caller's environment" instead of using a literal value.
pub const ENV_PASS_MARKER: &str = "\u{1}pass\u{1}";

/// Sequence number distinguishing successive executions of the same job.
pub type SeqId = u64;

/// Server-side job identifier (index into the server's job arena).
pub type JobIdx = u32;

// =============================================================================
// Content hashes
// =============================================================================

/// A blake3 content hash. Raw bytes internally, hex for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Facet)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// First 16 hex chars (8 bytes) for display.
    pub fn short_hex(&self) -> String {
        self.0[..8].iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 64 {
            return None;
        }
        let mut arr = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex_str = std::str::from_utf8(chunk).ok()?;
            arr[i] = u8::from_str_radix(hex_str, 16).ok()?;
        }
        Some(Self(arr))
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.short_hex())
    }
}

// =============================================================================
// Three-valued logic
// =============================================================================

/// Three-valued truth, ordered `No < Maybe < Yes`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Facet)]
#[repr(u8)]
pub enum Bool3 {
    #[default]
    No = 0,
    Maybe = 1,
    Yes = 2,
}

impl Bool3 {
    pub fn from_bool(b: bool) -> Self {
        if b {
            Bool3::Yes
        } else {
            Bool3::No
        }
    }
}

// =============================================================================
// Accesses
// =============================================================================

/// One way a file can be perceived by a job. Directories are deemed
/// non-existing in all cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Facet)]
#[repr(u8)]
pub enum Access {
    /// Accessed with readlink: regular files are deemed non-existing.
    Lnk = 0,
    /// Accessed with open: symlinks are deemed non-existing.
    Reg = 1,
    /// Accessed with a stat-like call: only the file kind is perceived.
    Stat = 2,
}

/// Bitset of [`Access`] values. Two file states are distinguishable as soon
/// as one of the listed accesses perceives a difference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Facet)]
pub struct Accesses(pub u8);

impl Accesses {
    pub const NONE: Accesses = Accesses(0);
    pub const LNK: Accesses = Accesses(1 << Access::Lnk as u8);
    pub const REG: Accesses = Accesses(1 << Access::Reg as u8);
    pub const STAT: Accesses = Accesses(1 << Access::Stat as u8);
    /// Accesses that perceive file content, not just its kind.
    pub const DATA: Accesses = Accesses(Self::LNK.0 | Self::REG.0);
    pub const ALL: Accesses = Accesses(Self::LNK.0 | Self::REG.0 | Self::STAT.0);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, a: Access) -> bool {
        self.0 & (1 << a as u8) != 0
    }
}

impl std::ops::BitOr for Accesses {
    type Output = Accesses;
    fn bitor(self, rhs: Accesses) -> Accesses {
        Accesses(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Accesses {
    fn bitor_assign(&mut self, rhs: Accesses) {
        self.0 |= rhs.0;
    }
}

impl std::ops::BitAnd for Accesses {
    type Output = Accesses;
    fn bitand(self, rhs: Accesses) -> Accesses {
        Accesses(self.0 & rhs.0)
    }
}

impl std::ops::Not for Accesses {
    type Output = Accesses;
    fn not(self) -> Accesses {
        Accesses(!self.0 & Accesses::ALL.0)
    }
}

// =============================================================================
// File classification
// =============================================================================

/// Where a resolved path falls among the tracked domains.
///
/// `Repo` and `SrcDirs` are the dependency domains: accesses there must be
/// reported as deps. The order is meaningful and mirrors that rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Facet)]
#[repr(u8)]
pub enum FileLoc {
    /// Inside the repository.
    Repo = 0,
    /// Found through one of the configured source dirs.
    SrcDirs = 1,
    /// The repository root itself.
    Root = 2,
    /// Inside the scratch (tmp) directory.
    Tmp = 3,
    /// Inside /proc.
    Proc = 4,
    /// Inside the engine's admin directory.
    Admin = 5,
    /// Everything else.
    #[default]
    Ext = 6,
}

impl FileLoc {
    /// True if an access at this location must be reported as a dependency.
    pub fn is_dep(self) -> bool {
        self <= FileLoc::SrcDirs
    }
}

/// Which symlinks the resolver honors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Facet)]
#[repr(u8)]
pub enum LnkSupport {
    /// Ignore symlinks entirely.
    None = 0,
    /// Honor only a final-component symlink.
    File = 1,
    /// Honor all symlinks. The pessimistic default.
    #[default]
    Full = 2,
}

/// Kind of an on-disk file as perceived by lstat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Facet)]
#[repr(u8)]
pub enum FileTag {
    /// No file (or an unsupported kind: fifo, device, ...).
    #[default]
    None = 0,
    Dir = 1,
    /// A symlink.
    Lnk = 2,
    /// A non-empty, non-executable regular file.
    Reg = 3,
    /// An empty regular file.
    Empty = 4,
    /// A regular file with the user-exec bit.
    Exe = 5,
}

impl FileTag {
    /// Tags that can be produced as a job target.
    pub fn is_target(self) -> bool {
        matches!(self, FileTag::Lnk | FileTag::Reg | FileTag::Empty | FileTag::Exe)
    }
}

/// Compact signature of a file's identity on disk: the tag in the low bits,
/// a hash of (mtime, size) above. Equal signatures mean the file has not
/// visibly changed; they say nothing about content equality across files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Facet)]
pub struct FileSig(pub u64);

const FILE_TAG_BITS: u32 = 3;

impl FileSig {
    pub fn new(tag: FileTag, mtime_ns: u64, sz: u64) -> Self {
        if !tag.is_target() {
            return FileSig(tag as u64);
        }
        let mut h = blake3::Hasher::new();
        h.update(&mtime_ns.to_le_bytes());
        h.update(&sz.to_le_bytes());
        let mut val = [0u8; 8];
        val.copy_from_slice(&h.finalize().as_bytes()[..8]);
        FileSig((u64::from_le_bytes(val) << FILE_TAG_BITS) | tag as u64)
    }

    pub fn tag(self) -> FileTag {
        match self.0 & ((1 << FILE_TAG_BITS) - 1) {
            0 => FileTag::None,
            1 => FileTag::Dir,
            2 => FileTag::Lnk,
            3 => FileTag::Reg,
            4 => FileTag::Empty,
            5 => FileTag::Exe,
            _ => FileTag::None,
        }
    }

    /// True if the signature designates an existing target-able file.
    pub fn exists(self) -> bool {
        self.tag().is_target()
    }
}

// =============================================================================
// Content digests (CRC)
// =============================================================================

/// A content digest tagged with the file kind.
///
/// Tagged variants (`None`/`Lnk`/`Reg`/`Empty`) depend only on the tag;
/// `Plain` carries an actual content hash.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Facet)]
#[repr(u8)]
pub enum Crc {
    /// Not computed yet.
    #[default]
    Unknown = 0,
    /// File does not exist (or is a dir, deemed non-existing).
    None = 1,
    /// File is a symlink whose content was not hashed.
    Lnk = 2,
    /// File is regular but its content was not hashed.
    Reg = 3,
    /// File is empty.
    Empty = 4,
    /// Hash of the file content (symlinks hash their target text).
    Plain(ContentHash) = 5,
}

impl Crc {
    pub fn is_lnk(self) -> bool {
        matches!(self, Crc::Lnk)
    }

    /// Whether `self` and `other` are indistinguishable through `accesses`.
    ///
    /// A `Stat` access only perceives existence and kind; `Lnk`/`Reg`
    /// accesses perceive content. `Unknown` never matches anything (we
    /// cannot prove indistinguishability), and two differing `Plain` values
    /// are conservatively deemed distinguishable by any content access.
    pub fn matches(self, other: Crc, accesses: Accesses) -> bool {
        if accesses.is_empty() {
            return true;
        }
        match (self, other) {
            (Crc::Unknown, _) | (_, Crc::Unknown) => false,
            (a, b) if a == b => true,
            (Crc::None, _) | (_, Crc::None) => false, // existence differs, any access sees it
            (a, b) => {
                // both exist but differ: content accesses perceive it
                if (accesses & Accesses::DATA) != Accesses::NONE {
                    return false;
                }
                // a pure stat only perceives the file kind
                a.is_lnk() == b.is_lnk()
            }
        }
    }
}

// =============================================================================
// Target & dep flags
// =============================================================================

/// Per-target rule flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Facet)]
pub struct Tflags(pub u8);

impl Tflags {
    /// Target is matched by a glob pattern, not an exact name.
    pub const STAR: Tflags = Tflags(1 << 0);
    /// Compute a content CRC at end of job.
    pub const CRC: Tflags = Tflags(1 << 1);
    /// Target may be read before being written (previous content survives).
    pub const INCREMENTAL: Tflags = Tflags(1 << 2);
    /// Manual modifications of this target are tolerated.
    pub const MANUAL_OK: Tflags = Tflags(1 << 3);
    /// Stat accesses on this target are significant.
    pub const STAT: Tflags = Tflags(1 << 4);
    /// The job may legitimately not produce this target.
    pub const PHONY: Tflags = Tflags(1 << 5);
    /// Writing to this target is allowed.
    pub const WRITE: Tflags = Tflags(1 << 6);

    pub fn contains(self, f: Tflags) -> bool {
        self.0 & f.0 == f.0
    }

    /// Flags assigned to a file that matches no target spec.
    pub fn unexpected() -> Tflags {
        Tflags::INCREMENTAL | Tflags::STAT
    }

    /// Check internal consistency; an inconsistent set becomes an analysis
    /// error on the job.
    pub fn chk(self) -> Result<(), String> {
        if self.contains(Tflags::CRC) && !self.contains(Tflags::WRITE) {
            return Err("crc requested on a non-writable target".to_string());
        }
        Ok(())
    }
}

impl std::ops::BitOr for Tflags {
    type Output = Tflags;
    fn bitor(self, rhs: Tflags) -> Tflags {
        Tflags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Tflags {
    fn bitor_assign(&mut self, rhs: Tflags) {
        self.0 |= rhs.0;
    }
}

/// Per-dep rule flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Facet)]
pub struct Dflags(pub u8);

impl Dflags {
    /// Dep was declared statically by the rule.
    pub const STATIC: Dflags = Dflags(1 << 0);
    /// Dep must exist for the job to run.
    pub const REQUIRED: Dflags = Dflags(1 << 1);
    /// An error on this dep does not propagate to the job.
    pub const IGNORE_ERROR: Dflags = Dflags(1 << 2);

    pub fn contains(self, f: Dflags) -> bool {
        self.0 & f.0 == f.0
    }
}

impl std::ops::BitOr for Dflags {
    type Output = Dflags;
    fn bitor(self, rhs: Dflags) -> Dflags {
        Dflags(self.0 | rhs.0)
    }
}

// =============================================================================
// Autodep environment
// =============================================================================

/// Everything the interposer needs to resolve and classify paths, handed to
/// the child through [`AUTODEP_ENV_VAR`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Facet)]
pub struct AutodepEnv {
    /// Absolute, canonical repository root.
    pub root_dir: String,
    /// Absolute, canonical on-disk scratch directory.
    pub tmp_dir: String,
    /// User-visible name of the scratch directory; empty if not mapped.
    pub tmp_view: String,
    /// Source dirs, each with a trailing `/`, absolute or repo-relative.
    pub src_dirs: Vec<String>,
    /// Which symlinks the resolver honors.
    pub lnk_support: LnkSupport,
    /// If true, dir coherence is enforced when files are updated (unlike NFS).
    pub reliable_dirs: bool,
    /// Where access reports go: `host:port`, or a path suffixed with `:` to
    /// append to a file (used by tests and by the server's own helpers).
    pub service: String,
    /// Admin subdir name under the root (holds traces and the backdoor).
    pub admin_dir: String,
    /// If true, accesses are not reported at all.
    pub disabled: bool,
}

impl AutodepEnv {
    /// Encode for transmission through the environment.
    pub fn encode(&self) -> String {
        facet_json::to_string(self)
    }

    pub fn decode(s: &str) -> Option<Self> {
        facet_json::from_str(s).ok()
    }

    /// Read from [`AUTODEP_ENV_VAR`], if present.
    pub fn from_env() -> Option<Self> {
        let raw = std::env::var(AUTODEP_ENV_VAR).ok()?;
        Self::decode(&raw)
    }
}

// =============================================================================
// Access channel (interposer → supervisor)
// =============================================================================

/// What a single report on the access channel means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Facet)]
#[repr(u8)]
pub enum AccessKind {
    /// One or more file accesses (reads, writes, unlinks).
    Access = 0,
    /// Confirm or retract the previous Maybe-write, once the syscall's
    /// return value is known.
    Confirm = 1,
    /// A repo dir was created/removed/renamed; its node must be refreshed.
    Guard = 2,
    /// The job touched the scratch dir (reported once).
    Tmp = 3,
    /// The child asks whether its deps so far are still up to date.
    ChkDeps = 4,
    /// The child asks for the content digests of specific paths.
    DepInfos = 5,
    /// Free-form trace text from the child.
    Trace = 6,
    /// Unrecoverable interposer-side error; the job must be failed.
    Panic = 7,
}

/// Digest of an access: how the file was perceived and whether it was (or is
/// about to be) written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Facet)]
pub struct AccessDigest {
    /// `No` = pure read, `Maybe` = write about to be attempted (waiting for
    /// confirm), `Yes` = confirmed write.
    pub write: Bool3,
    /// The write removes the file instead of producing it.
    pub unlink: bool,
    pub accesses: Accesses,
    pub dflags: Dflags,
}

/// One framed message on the access channel.
#[derive(Debug, Clone, Default, Facet)]
pub struct AccessReport {
    pub kind: u8,
    /// Accessed files with the signature observed at access time.
    pub files: Vec<(String, FileSig)>,
    pub digest: AccessDigest,
    /// For `Confirm`: whether the write actually succeeded.
    pub ok: bool,
    /// If true the sender blocks until a reply frame comes back.
    pub sync: bool,
    /// Identifies a group of accesses made in parallel; 0 = not parallel.
    pub parallel_id: u64,
    /// Comment for traces: which wrapper issued this.
    pub comment: String,
}

impl AccessReport {
    pub fn kind(&self) -> AccessKind {
        match self.kind {
            0 => AccessKind::Access,
            1 => AccessKind::Confirm,
            2 => AccessKind::Guard,
            3 => AccessKind::Tmp,
            4 => AccessKind::ChkDeps,
            5 => AccessKind::DepInfos,
            6 => AccessKind::Trace,
            _ => AccessKind::Panic,
        }
    }
}

/// Reply frame for sync access-channel requests.
#[derive(Debug, Clone, Default, Facet)]
pub struct AccessReply {
    /// For `ChkDeps`: the server's verdict.
    pub verdict: u8,
    /// For `DepInfos`: one entry per queried path.
    pub crcs: Vec<Crc>,
}

/// Verdict on a ChkDeps query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Facet)]
#[repr(u8)]
pub enum ChkDepsVerdict {
    /// All deps are up to date, keep going.
    #[default]
    Ok = 0,
    /// Some dep changed; the job should stop, it will be rerun.
    Changed = 1,
    /// Some dep is in error; the job should stop and fail.
    Err = 2,
}

impl ChkDepsVerdict {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => ChkDepsVerdict::Ok,
            1 => ChkDepsVerdict::Changed,
            _ => ChkDepsVerdict::Err,
        }
    }
}

// =============================================================================
// Job digests
// =============================================================================

/// Final status of one job execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Facet)]
#[repr(u8)]
pub enum Status {
    /// Not run yet.
    #[default]
    New = 0,
    Ok = 1,
    Err = 2,
    /// The supervisor disappeared; learned through a failed heartbeat.
    Lost = 3,
    /// Killed by the server (cancellation or timeout).
    Killed = 4,
}

impl Status {
    pub fn is_ok(self) -> bool {
        matches!(self, Status::Ok)
    }
}

/// One discovered dependency in an end-of-job digest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Facet)]
pub struct DepDigest {
    pub accesses: Accesses,
    pub dflags: Dflags,
    /// True if this dep belongs to the same parallel group as the previous
    /// one (the analyzer does not penalize intra-group reordering).
    pub parallel: bool,
    /// File signature observed at first access.
    pub sig: FileSig,
    /// True if the file changed between first access and end of job: we do
    /// not know what the job actually read.
    pub garbage: bool,
}

/// One produced (or unlinked) target in an end-of-job digest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Facet)]
pub struct TargetDigest {
    /// How the target was read before being written (incremental targets).
    pub accesses: Accesses,
    pub write: bool,
    pub tflags: Tflags,
    pub unlink: bool,
    pub crc: Crc,
}

/// Resource usage of one job execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Facet)]
pub struct JobStats {
    pub cpu_ms: u64,
    /// Wall time of the child itself.
    pub job_ms: u64,
    /// Wall time including supervisor overhead.
    pub total_ms: u64,
    pub mem_bytes: u64,
}

/// Everything the server learns from one job execution.
#[derive(Debug, Clone, Default, PartialEq, Facet)]
pub struct JobDigest {
    pub status: Status,
    pub targets: Vec<(String, TargetDigest)>,
    pub deps: Vec<(String, DepDigest)>,
    pub stdout: String,
    pub stderr: String,
    /// (reason, path) pairs for accesses the analyzer could not accept.
    pub analysis_err: Vec<(String, String)>,
    /// Raw wait status of the child.
    pub wstatus: i32,
    pub end_date: DateTime,
    pub stats: JobStats,
}

// =============================================================================
// Start / end payloads
// =============================================================================

/// One target spec from the job's rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Facet)]
pub struct TargetSpec {
    /// Exact name, or a glob when `STAR` is set in the flags.
    pub pattern: String,
    pub tflags: Tflags,
}

/// Supervisor → server: ready to run the job.
#[derive(Debug, Clone, Default, Facet)]
pub struct StartRequest {
    pub seq_id: SeqId,
    pub job: JobIdx,
    pub host: String,
    /// Port the supervisor listens on for heartbeat/kill.
    pub rpc_port: u16,
}

/// Server → supervisor: everything needed to run the job.
///
/// `proc` distinguishes "run it" from "give up" (the server may have lost
/// interest between submission and the supervisor coming up).
#[derive(Debug, Clone, Default, Facet)]
pub struct StartReply {
    /// False if the server asks the supervisor to give up.
    pub run: bool,
    /// Working dir relative to the root, with a trailing `/`, or empty.
    pub cwd: String,
    /// Env template; [`ENV_PASS_MARKER`] values are inherited from the
    /// supervisor's own environment.
    pub env: Vec<(String, String)>,
    /// Interpreter argv prefix (e.g. `["/bin/bash", "-e"]`).
    pub interpreter: Vec<String>,
    pub cmd: String,
    pub targets: Vec<TargetSpec>,
    pub static_deps: Vec<(String, Dflags)>,
    pub autodep_env: AutodepEnv,
    /// Signals sent in order by the killing procedure, each after a one
    /// second grace, before the final SIGKILL.
    pub kill_sigs: Vec<i32>,
    /// Absolute timeout from child start, in milliseconds; 0 = none.
    pub timeout_ms: u64,
    /// Redirect the child's stdin from this repo file; empty = /dev/null.
    pub stdin: String,
    /// Redirect the child's stdout to this repo target; empty = capture.
    pub stdout: String,
    pub live_out: bool,
    pub keep_tmp: bool,
    /// Where job traces live on the execution host.
    pub remote_admin_dir: String,
    /// Dense id identifying this job among currently running ones.
    pub small_id: u32,
}

/// Supervisor → server: the job is over.
#[derive(Debug, Clone, Default, Facet)]
pub struct EndRequest {
    pub seq_id: SeqId,
    pub job: JobIdx,
    pub host: String,
    pub digest: JobDigest,
}

/// Version information for a service.
#[derive(Debug, Clone, Facet)]
pub struct ServiceVersion {
    pub service: String,
    pub version: String,
    pub protocol_version: u32,
}

// =============================================================================
// Services
// =============================================================================

/// The build server as seen by supervisors.
#[rapace::service]
pub trait Jobs {
    /// Get service version information (for health checks and compatibility).
    async fn version(&self) -> ServiceVersion;

    /// Handshake: the supervisor is up and asks for its work order.
    async fn start(&self, req: StartRequest) -> StartReply;

    /// Final report. The ack matters: the supervisor must stay alive (and
    /// answer heartbeats) until the server has durably recorded the outcome.
    async fn end(&self, req: EndRequest) -> bool;

    /// Mid-run: are these deps still up to date?
    async fn chk_deps(
        &self,
        seq_id: SeqId,
        job: JobIdx,
        deps: Vec<(String, DepDigest)>,
    ) -> ChkDepsVerdict;

    /// Mid-run: content digests for specific paths.
    async fn dep_infos(&self, seq_id: SeqId, job: JobIdx, paths: Vec<String>) -> Vec<Crc>;

    /// A chunk of live output (complete lines).
    async fn live_out(&self, seq_id: SeqId, job: JobIdx, chunk: String) -> bool;
}

/// Outcome of one build request.
#[derive(Debug, Clone, Default, Facet)]
pub struct BuildResult {
    pub ok: bool,
    pub jobs_run: u32,
    pub jobs_failed: u32,
    pub up_to_date: u32,
    /// (file, message) pairs.
    pub errors: Vec<(String, String)>,
}

/// The build server as seen by clients.
#[rapace::service]
pub trait Build {
    /// Get service version information (for health checks and compatibility).
    async fn version(&self) -> ServiceVersion;

    /// Open a build request on these root files; returns a request token.
    async fn build(&self, roots: Vec<String>) -> u32;

    /// Block until the request completes, then return its outcome.
    async fn wait(&self, req: u32) -> BuildResult;

    /// Cancel a request: it goes zombie, running jobs it exclusively waits
    /// on are killed.
    async fn cancel(&self, req: u32) -> bool;
}

/// The per-job supervisor as seen by the server.
#[rapace::service]
pub trait Supervisor {
    /// Liveness probe. Returns false if the supervisor does not know this
    /// (seq_id, job): the server then records the job as Lost.
    async fn heartbeat(&self, seq_id: SeqId, job: JobIdx) -> bool;

    /// Cancel the job; the supervisor escalates through its kill signals.
    async fn kill(&self, seq_id: SeqId, job: JobIdx) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_hex_round_trip() {
        let h = ContentHash::from_bytes(b"out: compiled from in");
        let hex = h.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(ContentHash::from_hex(&hex), Some(h));
        assert_eq!(ContentHash::from_hex("abc"), None);
    }

    #[test]
    fn crc_tag_variants_depend_only_on_tag() {
        assert_eq!(Crc::Empty, Crc::Empty);
        assert_eq!(Crc::None, Crc::None);
        let a = Crc::Plain(ContentHash::from_bytes(b"x"));
        let b = Crc::Plain(ContentHash::from_bytes(b"x"));
        assert_eq!(a, b);
    }

    #[test]
    fn crc_match_respects_accesses() {
        let reg1 = Crc::Plain(ContentHash::from_bytes(b"1"));
        let reg2 = Crc::Plain(ContentHash::from_bytes(b"2"));
        // no access at all: nothing can be perceived
        assert!(reg1.matches(reg2, Accesses::NONE));
        // content access perceives the difference
        assert!(!reg1.matches(reg2, Accesses::REG));
        // a pure stat does not see content changes between two regular files
        assert!(reg1.matches(reg2, Accesses::STAT));
        // existence change is seen by any access
        assert!(!Crc::None.matches(reg1, Accesses::STAT));
        assert!(!Crc::None.matches(reg1, Accesses::LNK));
        // hashed values are conservative under any content access
        assert!(!reg1.matches(reg2, Accesses::LNK));
        // a stat perceives link-ness
        assert!(!Crc::Lnk.matches(Crc::Reg, Accesses::STAT));
        assert!(Crc::Empty.matches(Crc::Reg, Accesses::STAT));
        // unknown never matches
        assert!(!Crc::Unknown.matches(Crc::Unknown, Accesses::REG));
    }

    #[test]
    fn file_sig_tracks_tag_and_stamp() {
        let a = FileSig::new(FileTag::Reg, 1_000, 42);
        let b = FileSig::new(FileTag::Reg, 1_000, 42);
        let c = FileSig::new(FileTag::Reg, 2_000, 42);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.tag(), FileTag::Reg);
        assert!(a.exists());
        assert!(!FileSig::new(FileTag::Dir, 0, 0).exists());
        assert_eq!(FileSig::default().tag(), FileTag::None);
    }

    #[test]
    fn autodep_env_round_trips_through_encode() {
        let env = AutodepEnv {
            root_dir: "/work/repo".to_string(),
            tmp_dir: "/tmp/ferret/17".to_string(),
            tmp_view: "/tmp/job".to_string(),
            src_dirs: vec!["../shared-src/".to_string()],
            lnk_support: LnkSupport::Full,
            reliable_dirs: false,
            service: "127.0.0.1:9410".to_string(),
            admin_dir: ".ferret".to_string(),
            disabled: false,
        };
        let enc = env.encode();
        assert_eq!(AutodepEnv::decode(&enc), Some(env));
    }

    #[test]
    fn job_digest_round_trips_through_facet_json() {
        let digest = JobDigest {
            status: Status::Ok,
            targets: vec![(
                "out".to_string(),
                TargetDigest {
                    accesses: Accesses::NONE,
                    write: true,
                    tflags: Tflags::CRC | Tflags::WRITE,
                    unlink: false,
                    crc: Crc::Plain(ContentHash::from_bytes(b"payload")),
                },
            )],
            deps: vec![(
                "in".to_string(),
                DepDigest {
                    accesses: Accesses::REG,
                    dflags: Dflags::STATIC,
                    parallel: false,
                    sig: FileSig::new(FileTag::Reg, 123, 7),
                    garbage: false,
                },
            )],
            stdout: "hello\n".to_string(),
            stderr: String::new(),
            analysis_err: vec![],
            wstatus: 0,
            end_date: DateTime::constant(2025, 11, 3, 12, 0, 0, 0),
            stats: JobStats {
                cpu_ms: 12,
                job_ms: 40,
                total_ms: 55,
                mem_bytes: 1 << 20,
            },
        };
        let json = facet_json::to_string(&digest);
        let back: JobDigest = facet_json::from_str(&json).expect("deserializes");
        assert_eq!(back, digest);
    }
}
