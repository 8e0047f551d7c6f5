//! ferret-exec - per-job supervisor
//!
//! Spawned by the server's backend, one process per job execution. It asks
//! the server for its work order, runs the child under the interposer,
//! gathers the access stream, serves server-initiated heartbeat/kill, and
//! reports a single end digest.
//!
//! Exit codes: 0 success, 2 post-execution server-side failure, 3 start
//! send failed (the server link died before a reply could arrive), 4 start
//! reply failed, 5 connect failed. Local setup failures (bad argv, cannot
//! bind the rpc listener) exit 1; they happen before anything is on the
//! wire and are not part of the server-facing contract.

mod analyze;
mod gather;

use eyre::Result;
use ferret_proto::{
    Accesses, AutodepEnv, Dflags, EndRequest, JobDigest, JobIdx, JobsClient, JobStats,
    Supervisor, SupervisorServer, SeqId, StartReply, StartRequest, Status, JOB_HISTORY,
};
use gather::Gather;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, UnixListener};
use tokio::sync::Mutex;

const N_CONNECTION_TRIALS: usize = 3;

#[derive(Debug)]
struct Args {
    /// Server endpoint (host:port).
    service: String,
    seq_id: SeqId,
    job: JobIdx,
    is_remote: bool,
}

impl Args {
    fn parse() -> Result<Self> {
        let argv: Vec<String> = std::env::args().collect();
        eyre::ensure!(
            argv.len() == 5,
            "usage: ferret-exec <server:port> <seq_id> <job> local|remote"
        );
        let is_remote = match argv[4].as_str() {
            "remote" => true,
            "local" => false,
            other => eyre::bail!("expected local|remote, got {other}"),
        };
        Ok(Args {
            service: argv[1].clone(),
            seq_id: argv[2].parse()?,
            job: argv[3].parse()?,
            is_remote,
        })
    }
}

/// Server-initiated side: heartbeat probes and kill orders.
#[derive(Clone)]
struct SupervisorService {
    seq_id: SeqId,
    job: JobIdx,
    kill_tx: tokio::sync::mpsc::UnboundedSender<()>,
}

impl Supervisor for SupervisorService {
    async fn heartbeat(&self, seq_id: SeqId, job: JobIdx) -> bool {
        // a stale (seq_id, job) means the server is probing a ghost: let it
        // record the job as lost
        seq_id == self.seq_id && job == self.job
    }

    async fn kill(&self, seq_id: SeqId, job: JobIdx) -> bool {
        if seq_id != self.seq_id || job != self.job {
            return false;
        }
        let _ = self.kill_tx.send(());
        true
    }
}

/// Connect to the server. The returned flag flips once the session dies, so
/// a missing start reply can be told apart from a request that never made
/// it onto the wire.
async fn connect_server(
    service: &str,
) -> Result<(Arc<JobsClient>, Arc<std::sync::atomic::AtomicBool>)> {
    let mut last_err = None;
    for _ in 0..N_CONNECTION_TRIALS {
        match TcpStream::connect(service).await {
            Ok(stream) => {
                let transport = rapace::Transport::stream(stream);
                let session = Arc::new(rapace::RpcSession::new(transport));
                let client = JobsClient::new(session.clone());
                let dead = Arc::new(std::sync::atomic::AtomicBool::new(false));
                let flag = dead.clone();
                tokio::spawn(async move {
                    if let Err(e) = session.run().await {
                        tracing::error!("server session error: {e}");
                    }
                    flag.store(true, std::sync::atomic::Ordering::Release);
                });
                return Ok((Arc::new(client), dead));
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(eyre::eyre!(
        "cannot connect to server at {service}: {}",
        last_err.unwrap()
    ))
}

/// Locate the interposer shared object: next to our own binary, unless
/// overridden.
fn preload_path() -> String {
    if let Ok(p) = std::env::var("FERRET_LD_SO") {
        return p;
    }
    let exe = std::env::current_exe().unwrap_or_default();
    let dir = exe.parent().unwrap_or_else(|| std::path::Path::new("."));
    dir.join("libferret_ld.so").to_string_lossy().into_owned()
}

fn empty_dir(dir: &str) -> std::io::Result<()> {
    match std::fs::read_dir(dir) {
        Ok(entries) => {
            for e in entries.flatten() {
                let p = e.path();
                if p.is_dir() && !p.is_symlink() {
                    let _ = std::fs::remove_dir_all(&p);
                } else {
                    let _ = std::fs::remove_file(&p);
                }
            }
            Ok(())
        }
        Err(_) => std::fs::create_dir_all(dir),
    }
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    // if spawned by the server, die when it dies
    ur_taking_me_with_you::die_with_parent();

    let overhead_start = std::time::Instant::now();
    let args = match Args::parse() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ferret_exec=info")),
        )
        .init();

    let Ok((client, session_dead)) = connect_server(&args.service).await else {
        return 5;
    };

    // rpc port for server-initiated heartbeat/kill
    let (kill_tx, kill_rx) = tokio::sync::mpsc::unbounded_channel();
    let supervisor = SupervisorService {
        seq_id: args.seq_id,
        job: args.job,
        kill_tx,
    };
    let Ok(rpc_listener) = TcpListener::bind("0.0.0.0:0").await else {
        return 1;
    };
    let rpc_port = rpc_listener.local_addr().map(|a| a.port()).unwrap_or(0);
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = rpc_listener.accept().await else {
                return;
            };
            let svc = supervisor.clone();
            tokio::spawn(async move {
                let transport = rapace::Transport::stream(socket);
                let server = SupervisorServer::new(svc);
                if let Err(e) = server.serve(transport).await {
                    tracing::debug!("supervisor rpc connection error: {e}");
                }
            });
        }
    });

    let host = if args.is_remote {
        hostname()
    } else {
        String::new()
    };
    let start_req = StartRequest {
        seq_id: args.seq_id,
        job: args.job,
        host: host.clone(),
        rpc_port,
    };
    let start = tokio::time::timeout(
        std::time::Duration::from_secs(60),
        client.start(start_req),
    )
    .await;
    let start: StartReply = match start {
        Ok(Ok(s)) => s,
        _ => {
            // a dead session means the request never reached the server;
            // a live one means the server simply did not answer
            return if session_dead.load(std::sync::atomic::Ordering::Acquire) {
                3
            } else {
                4
            };
        }
    };
    if !start.run {
        return 0; // the server asks us to give up
    }

    let mut end = EndRequest {
        seq_id: args.seq_id,
        job: args.job,
        host,
        digest: JobDigest {
            status: Status::Err,
            ..Default::default()
        },
    };

    match run_job(&args, &client, &start, kill_rx, &mut end.digest).await {
        Ok(()) => {}
        Err(e) => {
            end.digest.status = Status::Err;
            if end.digest.stderr.is_empty() {
                end.digest.stderr = e.to_string();
            }
        }
    }
    end.digest.stats.total_ms = overhead_start.elapsed().as_millis() as u64;
    end.digest.end_date = now_civil();

    // the ack matters: stay alive to answer heartbeats until the server has
    // durably recorded the outcome
    let acked = tokio::time::timeout(std::time::Duration::from_secs(60), client.end(end)).await;
    match acked {
        Ok(Ok(true)) => 0,
        _ => 2,
    }
}

async fn run_job(
    args: &Args,
    client: &Arc<JobsClient>,
    start: &StartReply,
    kill_rx: tokio::sync::mpsc::UnboundedReceiver<()>,
    digest: &mut JobDigest,
) -> Result<()> {
    let root = &start.autodep_env.root_dir;
    std::env::set_current_dir(root)
        .map_err(|e| eyre::eyre!("cannot chdir to root {root}: {e}"))?;

    // per-job trace file, fixed-width slot, rotated by overwrite
    let trace_path = format!(
        "{}/job_trace/{:03}",
        start.remote_admin_dir,
        args.seq_id % JOB_HISTORY
    );
    let _ = std::fs::create_dir_all(format!("{}/job_trace", start.remote_admin_dir));
    let _ = std::fs::remove_file(&trace_path); // a clashing older job may still write there

    let cwd_abs = if start.cwd.is_empty() {
        root.clone()
    } else {
        format!("{root}/{}", start.cwd.trim_end_matches('/'))
    };

    // tmp starts clean
    empty_dir(&start.autodep_env.tmp_dir)
        .map_err(|e| eyre::eyre!("cannot prepare tmp dir: {e}"))?;

    // access channel socket
    let sock_path = format!(
        "{}/job_sock/{:03}",
        start.remote_admin_dir,
        args.seq_id % JOB_HISTORY
    );
    let _ = std::fs::create_dir_all(format!("{}/job_sock", start.remote_admin_dir));
    let _ = std::fs::remove_file(&sock_path);
    let listener = UnixListener::bind(&sock_path)?;

    let mut autodep_env = start.autodep_env.clone();
    autodep_env.service = sock_path.clone();

    let gather = Arc::new(Mutex::new(Gather::default()));
    tokio::spawn(gather::serve_channel(
        listener,
        gather.clone(),
        client.clone(),
        args.seq_id,
        args.job,
    ));

    // static deps are recorded first, in rule order
    {
        let mut g = gather.lock().await;
        for (dep, dflags) in &start.static_deps {
            g.force_dep(
                dep.clone(),
                Accesses::NONE,
                *dflags | Dflags::STATIC,
                analyze::sig_of(root, dep),
            );
        }
        if !start.stdin.is_empty() {
            g.force_dep(
                start.stdin.clone(),
                Accesses::REG,
                Dflags::default(),
                analyze::sig_of(root, &start.stdin),
            );
        }
        if !start.stdout.is_empty() {
            g.force_target(start.stdout.clone());
        }
    }

    let child = spawn_child(start, &autodep_env, &cwd_abs, root)?;
    let job_start = std::time::Instant::now();
    let timeout = (start.timeout_ms > 0)
        .then(|| std::time::Duration::from_millis(start.timeout_ms));
    let result = gather::wait_child(
        child,
        start.live_out,
        client.clone(),
        args.seq_id,
        args.job,
        timeout,
        start.kill_sigs.clone(),
        kill_rx,
    )
    .await;
    let job_ms = job_start.elapsed().as_millis() as u64;

    let rusage = child_rusage();

    let g = gather.lock().await;
    let analysis = analyze::analyze(&g, start, root);
    let seen_tmp = g.seen_tmp;
    drop(g);

    // content digests on a pool sized to the queue
    let root_owned = root.clone();
    let (mut analysis, spurious) = tokio::task::spawn_blocking(move || {
        let mut a = analysis;
        let spurious = analyze::compute_crcs(&root_owned, &mut a);
        (a, spurious)
    })
    .await?;
    for s in spurious {
        analysis
            .analysis_err
            .push(("target was spuriously unlinked".to_string(), s));
    }

    if seen_tmp && !start.keep_tmp {
        let _ = empty_dir(&start.autodep_env.tmp_dir);
    }

    let mut status = result.status;
    if !analysis.analysis_err.is_empty() && status == Status::Ok {
        status = Status::Err;
    }
    *digest = JobDigest {
        status,
        targets: analysis.targets,
        deps: analysis.deps,
        stdout: result.stdout,
        stderr: result.stderr,
        analysis_err: analysis.analysis_err,
        wstatus: result.wstatus,
        end_date: now_civil(),
        stats: JobStats {
            cpu_ms: rusage,
            job_ms,
            total_ms: 0, // stamped by the caller, as late as possible
            mem_bytes: max_rss_bytes(),
        },
    };
    let _ = std::fs::write(&trace_path, facet_json::to_string(digest));
    Ok(())
}

fn spawn_child(
    start: &StartReply,
    autodep_env: &AutodepEnv,
    cwd_abs: &str,
    root: &str,
) -> Result<tokio::process::Child> {
    eyre::ensure!(
        !start.interpreter.is_empty(),
        "start reply carries no interpreter"
    );
    let mut cmd = tokio::process::Command::new(&start.interpreter[0]);
    for arg in &start.interpreter[1..] {
        cmd.arg(arg);
    }
    cmd.arg("-c").arg(&start.cmd);
    cmd.current_dir(cwd_abs);
    cmd.env_clear();

    let tmp_visible = if autodep_env.tmp_view.is_empty() {
        autodep_env.tmp_dir.clone()
    } else {
        autodep_env.tmp_view.clone()
    };
    cmd.env("PWD", cwd_abs);
    cmd.env("ROOT_DIR", root);
    cmd.env("TMPDIR", &tmp_visible);
    for (k, v) in &start.env {
        if v == ferret_proto::ENV_PASS_MARKER {
            if let Ok(outer) = std::env::var(k) {
                cmd.env(k, outer);
            }
        } else {
            cmd.env(k, v);
        }
    }
    cmd.env(ferret_proto::AUTODEP_ENV_VAR, autodep_env.encode());
    cmd.env(
        ferret_proto::LD_LIBRARY_PATH_VAR,
        std::env::var("LD_LIBRARY_PATH").unwrap_or_default(),
    );
    cmd.env("LD_PRELOAD", preload_path());

    // stdin: repo file or /dev/null; stdout: repo target or captured pipe
    let stdin: std::process::Stdio = if start.stdin.is_empty() {
        std::fs::File::open("/dev/null")?.into()
    } else {
        std::fs::File::open(format!("{root}/{}", start.stdin))?.into()
    };
    cmd.stdin(stdin);
    if start.stdout.is_empty() {
        cmd.stdout(std::process::Stdio::piped());
    } else {
        let path = format!("{root}/{}", start.stdout);
        if let Some(dir) = std::path::Path::new(&path).parent() {
            std::fs::create_dir_all(dir)?;
        }
        cmd.stdout(std::fs::File::create(path)?);
    }
    cmd.stderr(std::process::Stdio::piped());

    // own process group, so kill escalation reaches every descendant
    unsafe {
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }
    Ok(cmd.spawn()?)
}

fn child_rusage() -> u64 {
    let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
    if unsafe { libc::getrusage(libc::RUSAGE_CHILDREN, &mut ru) } != 0 {
        return 0;
    }
    let user = ru.ru_utime.tv_sec as u64 * 1_000 + ru.ru_utime.tv_usec as u64 / 1_000;
    let sys = ru.ru_stime.tv_sec as u64 * 1_000 + ru.ru_stime.tv_usec as u64 / 1_000;
    user + sys
}

fn max_rss_bytes() -> u64 {
    let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
    if unsafe { libc::getrusage(libc::RUSAGE_CHILDREN, &mut ru) } != 0 {
        return 0;
    }
    (ru.ru_maxrss as u64) << 10
}

fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

fn now_civil() -> jiff::civil::DateTime {
    jiff::Zoned::now().datetime()
}
