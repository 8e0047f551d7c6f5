//! Build server internals: the engine task, its command channel, the two
//! rapace services (client-facing builds, supervisor-facing job RPC) and the
//! local backend that spawns supervisors.
//!
//! The engine is single-threaded on its own task; every service handler
//! talks to it through [`Cmd`] messages with oneshot replies. That channel
//! is also the ordering guarantee the graph relies on: a job's end is
//! enqueued before any analysis that could observe it.

use ferret_engine::{Backend, Engine, EngineConfig, JobId, ReqId, Rule, RuleSet, Submission};
use ferret_proto::{
    Build, BuildResult, ChkDepsVerdict, Crc, DepDigest, JobDigest, JobIdx, Jobs,
    SupervisorClient, SeqId, ServiceVersion, StartReply, StartRequest, TargetSpec, Tflags,
    PROTOCOL_VERSION,
};
use facet::Facet;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

// =============================================================================
// Rules file
// =============================================================================

/// On-disk form of one rule (`<root>/.ferret/rules.json`).
#[derive(Debug, Clone, Default, Facet)]
pub struct RuleFile {
    pub name: String,
    pub prio: i32,
    /// First pattern is the matching one; `*`-containing extras are star
    /// targets.
    pub targets: Vec<String>,
    pub deps: Vec<String>,
    pub cmd: String,
    #[facet(default)]
    pub interpreter: Vec<String>,
    #[facet(default)]
    pub sure: bool,
}

/// On-disk form of the whole rule set.
#[derive(Debug, Clone, Default, Facet)]
pub struct RulesFile {
    #[facet(default)]
    pub sources: Vec<String>,
    #[facet(default)]
    pub src_dirs: Vec<String>,
    #[facet(default)]
    pub anti: Vec<String>,
    pub rules: Vec<RuleFile>,
}

impl RulesFile {
    pub fn load(path: &camino::Utf8Path) -> eyre::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("cannot read rules at {path}: {e}"))?;
        facet_json::from_str(&text).map_err(|e| eyre::eyre!("bad rules file {path}: {e}"))
    }

    pub fn into_rule_set(self) -> RuleSet {
        RuleSet {
            sources: self.sources,
            src_dirs: self.src_dirs,
            anti: self.anti,
            rules: self
                .rules
                .into_iter()
                .map(|r| Rule {
                    name: r.name,
                    prio: r.prio,
                    targets: r
                        .targets
                        .into_iter()
                        .map(|pattern| {
                            let star = pattern.contains('*');
                            TargetSpec {
                                pattern,
                                tflags: if star {
                                    Tflags::STAR | Tflags::WRITE | Tflags::CRC
                                } else {
                                    Tflags::WRITE | Tflags::CRC
                                },
                            }
                        })
                        .collect(),
                    deps: r.deps,
                    cmd: r.cmd,
                    interpreter: r.interpreter,
                    sure: r.sure,
                    cmd_gen: 1,
                })
                .collect(),
        }
    }
}

// =============================================================================
// Supervisor registry
// =============================================================================

/// Where to reach each running job's supervisor, fed by Start requests and
/// drained on End / Lost.
pub type Registry = Arc<Mutex<HashMap<JobIdx, (SeqId, String)>>>;

/// Dial a supervisor and return a client, or None if unreachable.
pub async fn dial_supervisor(addr: &str) -> Option<SupervisorClient> {
    let stream = tokio::net::TcpStream::connect(addr).await.ok()?;
    let transport = rapace::Transport::stream(stream);
    let session = Arc::new(rapace::RpcSession::new(transport));
    let client = SupervisorClient::new(session.clone());
    tokio::spawn(async move {
        let _ = session.run().await;
    });
    Some(client)
}

// =============================================================================
// Local backend
// =============================================================================

/// Spawns one `ferret-exec` per submission on this host.
pub struct LocalBackend {
    /// Endpoint the supervisor dials back to (our job service).
    pub service: String,
    /// Path of the ferret-exec binary.
    pub exec_bin: camino::Utf8PathBuf,
    pub registry: Registry,
    pub handle: tokio::runtime::Handle,
}

impl Backend for LocalBackend {
    fn submit(&mut self, sub: Submission) {
        let spawned = std::process::Command::new(self.exec_bin.as_std_path())
            .arg(&self.service)
            .arg(sub.seq_id.to_string())
            .arg(sub.job.0.to_string())
            .arg("local")
            .spawn();
        match spawned {
            Ok(child) => {
                tracing::debug!(job = %sub.job, seq_id = sub.seq_id, pid = child.id(), "supervisor spawned");
                // the supervisor reports its own end; no wait here
                std::mem::forget(child);
            }
            Err(e) => {
                tracing::error!(job = %sub.job, "cannot spawn supervisor: {e}");
            }
        }
    }

    fn kill(&mut self, job: JobId, seq_id: SeqId) {
        let addr = {
            let reg = self.registry.lock().unwrap();
            reg.get(&job.0).filter(|(s, _)| *s == seq_id).map(|(_, a)| a.clone())
        };
        let Some(addr) = addr else {
            return; // not started yet; it will be told to give up at Start
        };
        self.handle.spawn(async move {
            if let Some(client) = dial_supervisor(&addr).await {
                client.kill(seq_id, job.0).await;
            }
        });
    }
}

// =============================================================================
// Engine task
// =============================================================================

/// Commands crossing from service handlers to the engine task.
pub enum Cmd {
    OpenReq {
        roots: Vec<String>,
        resp: oneshot::Sender<ReqId>,
    },
    WaitReq {
        req: ReqId,
        resp: oneshot::Sender<BuildResult>,
    },
    CancelReq {
        req: ReqId,
        resp: oneshot::Sender<bool>,
    },
    Start {
        seq_id: SeqId,
        job: JobIdx,
        resp: oneshot::Sender<StartReply>,
    },
    End {
        seq_id: SeqId,
        job: JobIdx,
        digest: Box<JobDigest>,
        resp: oneshot::Sender<bool>,
    },
    ChkDeps {
        deps: Vec<(String, DepDigest)>,
        resp: oneshot::Sender<ChkDepsVerdict>,
    },
    DepInfos {
        paths: Vec<String>,
        resp: oneshot::Sender<Vec<Crc>>,
    },
    LiveOut {
        job: JobIdx,
        chunk: String,
    },
    Lost {
        job: JobIdx,
    },
}

fn build_result(engine: &Engine, req: ReqId) -> BuildResult {
    let summary = engine.req_summary(req);
    let errors = engine.req_errors(req);
    BuildResult {
        ok: summary.jobs_failed == 0 && errors.is_empty(),
        jobs_run: summary.jobs_run,
        jobs_failed: summary.jobs_failed,
        up_to_date: summary.up_to_date,
        errors,
    }
}

/// Owns the engine; the sole place graph state is touched.
pub async fn engine_task(mut engine: Engine, mut rx: mpsc::UnboundedReceiver<Cmd>) {
    let mut waiters: Vec<(ReqId, oneshot::Sender<BuildResult>)> = Vec::new();
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Cmd::OpenReq { roots, resp } => {
                let rq = engine.open_req(roots);
                let _ = resp.send(rq);
            }
            Cmd::WaitReq { req, resp } => {
                if engine.req_done(req) {
                    let _ = resp.send(build_result(&engine, req));
                } else {
                    waiters.push((req, resp));
                }
            }
            Cmd::CancelReq { req, resp } => {
                engine.kill_req(req);
                let _ = resp.send(true);
            }
            Cmd::Start { seq_id, job, resp } => {
                let _ = resp.send(engine.start_info(seq_id, JobId(job)));
            }
            Cmd::End {
                seq_id,
                job,
                digest,
                resp,
            } => {
                let ok = match engine.end_job(seq_id, JobId(job), &digest) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!("end report rejected: {e}");
                        false
                    }
                };
                let _ = resp.send(ok);
            }
            Cmd::ChkDeps { deps, resp } => {
                let _ = resp.send(engine.chk_deps(&deps));
            }
            Cmd::DepInfos { paths, resp } => {
                let _ = resp.send(engine.dep_infos(&paths));
            }
            Cmd::LiveOut { job, chunk } => {
                for line in chunk.lines() {
                    tracing::info!(job, "| {line}");
                }
            }
            Cmd::Lost { job } => {
                if let Err(e) = engine.job_lost(JobId(job)) {
                    tracing::warn!("lost report rejected: {e}");
                }
            }
        }
        // settle whichever requests completed under this command
        waiters.retain_mut(|(req, resp)| {
            if engine.req_done(*req) {
                let resp = std::mem::replace(resp, oneshot::channel().0);
                let _ = resp.send(build_result(&engine, *req));
                false
            } else {
                true
            }
        });
    }
}

// =============================================================================
// Services
// =============================================================================

/// The supervisor-facing service.
#[derive(Clone)]
pub struct JobService {
    pub tx: mpsc::UnboundedSender<Cmd>,
    pub registry: Registry,
}

impl Jobs for JobService {
    async fn version(&self) -> ServiceVersion {
        ServiceVersion {
            service: "ferret-daemon".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    async fn start(&self, req: StartRequest) -> StartReply {
        let host = if req.host.is_empty() {
            "127.0.0.1".to_string()
        } else {
            req.host.clone()
        };
        self.registry
            .lock()
            .unwrap()
            .insert(req.job, (req.seq_id, format!("{host}:{}", req.rpc_port)));
        let (resp, rx) = oneshot::channel();
        let _ = self.tx.send(Cmd::Start {
            seq_id: req.seq_id,
            job: req.job,
            resp,
        });
        rx.await.unwrap_or_default()
    }

    async fn end(&self, req: ferret_proto::EndRequest) -> bool {
        self.registry.lock().unwrap().remove(&req.job);
        let (resp, rx) = oneshot::channel();
        let _ = self.tx.send(Cmd::End {
            seq_id: req.seq_id,
            job: req.job,
            digest: Box::new(req.digest),
            resp,
        });
        rx.await.unwrap_or(false)
    }

    async fn chk_deps(
        &self,
        _seq_id: SeqId,
        _job: JobIdx,
        deps: Vec<(String, DepDigest)>,
    ) -> ChkDepsVerdict {
        let (resp, rx) = oneshot::channel();
        let _ = self.tx.send(Cmd::ChkDeps { deps, resp });
        rx.await.unwrap_or(ChkDepsVerdict::Ok)
    }

    async fn dep_infos(&self, _seq_id: SeqId, _job: JobIdx, paths: Vec<String>) -> Vec<Crc> {
        let n = paths.len();
        let (resp, rx) = oneshot::channel();
        let _ = self.tx.send(Cmd::DepInfos { paths, resp });
        rx.await.unwrap_or_else(|_| vec![Crc::Unknown; n])
    }

    async fn live_out(&self, _seq_id: SeqId, job: JobIdx, chunk: String) -> bool {
        let _ = self.tx.send(Cmd::LiveOut { job, chunk });
        true
    }
}

/// The client-facing service.
#[derive(Clone)]
pub struct BuildService {
    pub tx: mpsc::UnboundedSender<Cmd>,
}

impl Build for BuildService {
    async fn version(&self) -> ServiceVersion {
        ServiceVersion {
            service: "ferret-daemon".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    async fn build(&self, roots: Vec<String>) -> u32 {
        let (resp, rx) = oneshot::channel();
        let _ = self.tx.send(Cmd::OpenReq { roots, resp });
        rx.await.map(|r| r.0).unwrap_or(u32::MAX)
    }

    async fn wait(&self, req: u32) -> BuildResult {
        let (resp, rx) = oneshot::channel();
        let _ = self.tx.send(Cmd::WaitReq {
            req: ReqId(req),
            resp,
        });
        rx.await.unwrap_or_default()
    }

    async fn cancel(&self, req: u32) -> bool {
        let (resp, rx) = oneshot::channel();
        let _ = self.tx.send(Cmd::CancelReq {
            req: ReqId(req),
            resp,
        });
        rx.await.unwrap_or(false)
    }
}

// =============================================================================
// Heartbeat sweep
// =============================================================================

/// Probe every registered supervisor; the ones that fail or disown their
/// job are reported lost. This is the only path by which the server learns
/// of a crashed supervisor.
pub async fn heartbeat_sweep(registry: Registry, tx: mpsc::UnboundedSender<Cmd>) {
    loop {
        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
        let entries: Vec<(JobIdx, SeqId, String)> = {
            let reg = registry.lock().unwrap();
            reg.iter().map(|(j, (s, a))| (*j, *s, a.clone())).collect()
        };
        for (job, seq_id, addr) in entries {
            let alive = match dial_supervisor(&addr).await {
                Some(client) => {
                    tokio::time::timeout(
                        std::time::Duration::from_secs(5),
                        client.heartbeat(seq_id, job),
                    )
                    .await
                    .ok()
                    .and_then(|r| r.ok())
                    .unwrap_or(false)
                }
                None => false,
            };
            if !alive {
                tracing::warn!(job, seq_id, %addr, "supervisor missed heartbeat");
                registry.lock().unwrap().remove(&job);
                let _ = tx.send(Cmd::Lost { job });
            }
        }
    }
}

/// Engine configuration derived from the daemon's environment.
pub fn engine_config(root_dir: &str) -> EngineConfig {
    EngineConfig {
        root_dir: root_dir.to_string(),
        tmp_root: format!("{root_dir}/.ferret/tmp"),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rules_file_round_trips_and_converts() {
        let json = r#"{
            "sources": ["in"],
            "src_dirs": [],
            "anti": ["*.tmp"],
            "rules": [
                {
                    "name": "compile",
                    "prio": 0,
                    "targets": ["out", "out.*.log"],
                    "deps": ["in"],
                    "cmd": "tr a-z A-Z < in > out",
                    "interpreter": [],
                    "sure": true
                }
            ]
        }"#;
        let rf: RulesFile = facet_json::from_str(json).expect("parses");
        let rs = rf.into_rule_set();
        assert_eq!(rs.sources, vec!["in"]);
        assert_eq!(rs.rules.len(), 1);
        let rule = &rs.rules[0];
        assert!(rule.targets[0].tflags.contains(Tflags::CRC));
        assert!(!rule.targets[0].tflags.contains(Tflags::STAR));
        assert!(rule.targets[1].tflags.contains(Tflags::STAR));
        assert!(rule.sure);
    }

    #[tokio::test]
    async fn engine_task_serves_open_and_wait() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let root = root.to_str().unwrap().to_string();
        std::fs::write(format!("{root}/in"), b"x").unwrap();

        struct NullBackend;
        impl Backend for NullBackend {
            fn submit(&mut self, _sub: Submission) {}
            fn kill(&mut self, _job: JobId, _seq: SeqId) {}
        }
        let rules = RuleSet {
            sources: vec!["in".to_string()],
            ..Default::default()
        };
        let engine = Engine::new(engine_config(&root), rules, Box::new(NullBackend));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(engine_task(engine, rx));

        // a source file is up to date without any job
        let (resp, r) = oneshot::channel();
        tx.send(Cmd::OpenReq {
            roots: vec!["in".to_string()],
            resp,
        })
        .unwrap();
        let rq = r.await.unwrap();
        let (resp, r) = oneshot::channel();
        tx.send(Cmd::WaitReq { req: rq, resp }).unwrap();
        let result = r.await.unwrap();
        assert!(result.ok, "{result:?}");
        assert_eq!(result.jobs_run, 0);
    }
}
