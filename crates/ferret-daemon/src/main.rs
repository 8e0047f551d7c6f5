//! ferret-daemon - build server
//!
//! Serves two endpoints: the job service (supervisors dial in for their
//! work orders and report results) and the build service (clients open
//! requests and wait on them). The engine itself runs on a dedicated task
//! fed by a command channel.

use camino::Utf8PathBuf;
use eyre::Result;
use ferret_daemon::{
    engine_config, engine_task, heartbeat_sweep, BuildService, JobService, LocalBackend, Registry,
    RulesFile,
};
use ferret_engine::Engine;
use ferret_proto::{BuildServer, JobsServer};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

#[derive(Debug)]
struct Args {
    /// Repository root (absolute).
    root: Utf8PathBuf,

    /// Job service bind address (host:port), dialed by supervisors.
    bind_jobs: String,

    /// Build service bind address (host:port), dialed by clients.
    bind_builds: String,
}

impl Args {
    fn from_env() -> Result<Self> {
        let root_raw = match std::env::var("FERRET_ROOT") {
            Ok(r) => r,
            Err(_) => std::env::current_dir()?.to_string_lossy().into_owned(),
        };
        let root = Utf8PathBuf::from(root_raw)
            .canonicalize_utf8()
            .map_err(|e| eyre::eyre!("cannot canonicalize root: {e}"))?;

        let bind_jobs =
            std::env::var("FERRET_JOBS").unwrap_or_else(|_| "127.0.0.1:9410".to_string());
        let bind_builds =
            std::env::var("FERRET_BUILDS").unwrap_or_else(|_| "127.0.0.1:9411".to_string());

        Ok(Args {
            root,
            bind_jobs,
            bind_builds,
        })
    }
}

/// Supervisors live next to us unless overridden.
fn exec_bin() -> Utf8PathBuf {
    if let Ok(p) = std::env::var("FERRET_EXEC_BIN") {
        return Utf8PathBuf::from(p);
    }
    let exe = std::env::current_exe().unwrap_or_default();
    let dir = exe.parent().unwrap_or_else(|| std::path::Path::new("."));
    Utf8PathBuf::from(dir.join("ferret-exec").to_string_lossy().into_owned())
}

#[tokio::main]
async fn main() -> Result<()> {
    // if spawned by a wrapper, die when it dies
    ur_taking_me_with_you::die_with_parent();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ferret_daemon=info")),
        )
        .init();

    let args = Args::from_env()?;
    tracing::info!("repository root {}", args.root);

    // admin area
    std::fs::create_dir_all(args.root.join(".ferret/tmp"))?;
    std::fs::create_dir_all(args.root.join(".ferret/job_trace"))?;

    let rules = RulesFile::load(&args.root.join(".ferret/rules.json"))?.into_rule_set();
    tracing::info!(
        "{} rules, {} sources",
        rules.rules.len(),
        rules.sources.len()
    );

    let registry: Registry = Registry::default();
    let backend = LocalBackend {
        service: args.bind_jobs.clone(),
        exec_bin: exec_bin(),
        registry: registry.clone(),
        handle: tokio::runtime::Handle::current(),
    };
    let engine = Engine::new(
        engine_config(args.root.as_str()),
        rules,
        Box::new(backend),
    );

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(engine_task(engine, rx));
    tokio::spawn(heartbeat_sweep(registry.clone(), tx.clone()));

    let job_service = JobService {
        tx: tx.clone(),
        registry: registry.clone(),
    };
    let build_service = BuildService { tx };

    let jobs_listener = TcpListener::bind(&args.bind_jobs).await?;
    tracing::info!("job service listening on {}", args.bind_jobs);
    tokio::spawn(async move {
        loop {
            let Ok((socket, peer_addr)) = jobs_listener.accept().await else {
                return;
            };
            let svc = job_service.clone();
            tokio::spawn(async move {
                tracing::debug!("supervisor connection from {peer_addr}");
                let transport = rapace::Transport::stream(socket);
                let server = JobsServer::new(svc);
                if let Err(e) = server.serve(transport).await {
                    tracing::debug!("supervisor connection error from {peer_addr}: {e}");
                }
            });
        }
    });

    let builds_listener = TcpListener::bind(&args.bind_builds).await?;
    tracing::info!("build service listening on {}", args.bind_builds);
    loop {
        let (socket, peer_addr) = builds_listener.accept().await?;
        let svc = build_service.clone();
        tokio::spawn(async move {
            tracing::debug!("client connection from {peer_addr}");
            let transport = rapace::Transport::stream(socket);
            let server = BuildServer::new(svc);
            if let Err(e) = server.serve(transport).await {
                tracing::warn!("client connection error from {peer_addr}: {e}");
            }
        });
    }
}
