//! Access gathering: the supervisor side of the interposer's channel, plus
//! the child's lifecycle (spawn, live output, timeout, kill escalation).

use ferret_proto::{
    AccessKind, AccessReply, AccessReport, Accesses, Bool3, ChkDepsVerdict, Dflags, FileSig,
    JobsClient, SeqId, Status,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;

/// Everything learned about one file across the job's lifetime.
#[derive(Debug, Clone, Default)]
pub struct AccessInfo {
    /// Read accesses (for targets: reads made before the write).
    pub accesses: Accesses,
    /// `Maybe` = announced but never confirmed (job interrupted in between);
    /// the disk is interrogated at end of job to settle it.
    pub write: Bool3,
    pub unlink: bool,
    pub dflags: Dflags,
    /// Signature observed at first access.
    pub sig: FileSig,
    /// First-access parallel group; 0 when not grouped.
    pub parallel_id: u64,
}

/// Ordered per-file access map plus job-wide flags.
#[derive(Debug, Default)]
pub struct Gather {
    pub accesses: Vec<(String, AccessInfo)>,
    index: HashMap<String, usize>,
    pub seen_tmp: bool,
    /// Repo dirs whose nodes must be refreshed (mkdir/rmdir/rename).
    pub guards: Vec<String>,
    /// Interposer-side fatal reports; any entry fails the job.
    pub panics: Vec<String>,
}

impl Gather {
    fn entry(&mut self, file: String) -> &mut AccessInfo {
        let idx = self.entry_idx(file);
        &mut self.accesses[idx].1
    }

    fn entry_idx(&mut self, file: String) -> usize {
        match self.index.get(&file) {
            Some(&i) => i,
            None => {
                let i = self.accesses.len();
                self.index.insert(file.clone(), i);
                self.accesses.push((file, AccessInfo::default()));
                i
            }
        }
    }

    /// Record one dep or target access coming from the channel. Returns the
    /// indices of entries left in Maybe state, for the following Confirm.
    pub fn access(&mut self, report: &AccessReport) -> Vec<(usize, Bool3)> {
        let mut pending = Vec::new();
        for (file, sig) in &report.files {
            let first = !self.index.contains_key(file);
            let idx = self.entry_idx(file.clone());
            let info = &mut self.accesses[idx].1;
            if first {
                info.sig = *sig;
                info.parallel_id = report.parallel_id;
            }
            if report.digest.write == Bool3::No {
                if info.write == Bool3::No {
                    info.accesses |= report.digest.accesses;
                }
                info.dflags = info.dflags | report.digest.dflags;
            } else {
                if info.write != Bool3::Yes {
                    pending.push((idx, info.write));
                }
                // reads bundled with the write happened before it
                if info.write == Bool3::No {
                    info.accesses |= report.digest.accesses;
                }
                info.write = Bool3::Maybe;
                info.unlink = report.digest.unlink;
            }
        }
        pending
    }

    /// Settle the pending Maybe-writes of one report with the syscall's
    /// outcome.
    pub fn confirm(&mut self, pending: &[(usize, Bool3)], ok: bool) {
        for &(idx, prev) in pending {
            let info = &mut self.accesses[idx].1;
            if ok {
                info.write = Bool3::Yes;
            } else {
                info.write = prev;
                if prev == Bool3::No {
                    info.unlink = false;
                }
            }
        }
    }

    /// Inject a dep the job did not utter itself (static deps, stdin).
    pub fn force_dep(&mut self, file: String, accesses: Accesses, dflags: Dflags, sig: FileSig) {
        let first = !self.index.contains_key(&file);
        let info = self.entry(file);
        if first {
            info.sig = sig;
        }
        info.accesses |= accesses;
        info.dflags = info.dflags | dflags;
    }

    /// Inject a target the engine imposes (stdout redirection).
    pub fn force_target(&mut self, file: String) {
        let info = self.entry(file);
        info.write = Bool3::Yes;
    }
}

/// Serve the access channel: one connection per recorded process.
pub async fn serve_channel(
    listener: UnixListener,
    gather: Arc<Mutex<Gather>>,
    client: Arc<JobsClient>,
    seq_id: SeqId,
    job: ferret_proto::JobIdx,
) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let gather = gather.clone();
        let client = client.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, gather, client, seq_id, job).await {
                tracing::debug!("access channel closed: {e}");
            }
        });
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    gather: Arc<Mutex<Gather>>,
    client: Arc<JobsClient>,
    seq_id: SeqId,
    job: ferret_proto::JobIdx,
) -> eyre::Result<()> {
    // Maybe-writes of the last Access report on this connection, waiting for
    // their Confirm
    let mut pending: Vec<(usize, Bool3)> = Vec::new();
    loop {
        let report = match read_frame(&mut stream).await {
            Ok(r) => r,
            Err(_) => return Ok(()), // process ended, gather keeps what it has
        };
        match report.kind() {
            AccessKind::Access => {
                let mut g = gather.lock().await;
                let p = g.access(&report);
                if !p.is_empty() {
                    pending = p;
                }
            }
            AccessKind::Confirm => {
                let mut g = gather.lock().await;
                g.confirm(&pending, report.ok);
                pending.clear();
            }
            AccessKind::Guard => {
                let mut g = gather.lock().await;
                for (f, _) in report.files {
                    g.guards.push(f);
                }
            }
            AccessKind::Tmp => {
                gather.lock().await.seen_tmp = true;
            }
            AccessKind::Trace => {
                tracing::debug!("child: {}", report.comment);
            }
            AccessKind::Panic => {
                let mut g = gather.lock().await;
                g.panics.push(report.comment);
            }
            AccessKind::ChkDeps => {
                let deps = {
                    let g = gather.lock().await;
                    crate::analyze::current_deps(&g)
                };
                let verdict = client.chk_deps(seq_id, job, deps).await?;
                write_frame(
                    &mut stream,
                    &AccessReply {
                        verdict: verdict as u8,
                        crcs: Vec::new(),
                    },
                )
                .await?;
            }
            AccessKind::DepInfos => {
                let paths: Vec<String> = report.files.iter().map(|(f, _)| f.clone()).collect();
                let crcs = client.dep_infos(seq_id, job, paths).await?;
                write_frame(&mut stream, &AccessReply { verdict: ChkDepsVerdict::Ok as u8, crcs })
                    .await?;
            }
        }
    }
}

async fn read_frame(stream: &mut UnixStream) -> eyre::Result<AccessReport> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await?;
    let len = u32::from_le_bytes(len) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    let txt = std::str::from_utf8(&buf)?;
    facet_json::from_str(txt).map_err(|e| eyre::eyre!("bad access frame: {e}"))
}

async fn write_frame(stream: &mut UnixStream, reply: &AccessReply) -> eyre::Result<()> {
    let json = facet_json::to_string(reply);
    stream.write_all(&(json.len() as u32).to_le_bytes()).await?;
    stream.write_all(json.as_bytes()).await?;
    Ok(())
}

// =============================================================================
// Child lifecycle
// =============================================================================

/// Outcome of the child run.
pub struct ChildResult {
    pub status: Status,
    pub wstatus: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Signal escalation: each configured signal, a one-second grace, then
/// SIGKILL until the process group dies.
pub async fn kill_escalation(pgid: i32, kill_sigs: Vec<i32>) {
    for i in 0.. {
        let sig = *kill_sigs.get(i).unwrap_or(&libc::SIGKILL);
        let alive = unsafe { libc::kill(-pgid, sig) } == 0;
        if !alive {
            return; // group already gone
        }
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }
}

/// Run the child to completion, streaming live output if asked.
pub async fn wait_child(
    mut child: tokio::process::Child,
    live_out: bool,
    client: Arc<JobsClient>,
    seq_id: SeqId,
    job: ferret_proto::JobIdx,
    timeout: Option<std::time::Duration>,
    kill_sigs: Vec<i32>,
    mut kill_rx: tokio::sync::mpsc::UnboundedReceiver<()>,
) -> ChildResult {
    let pgid = child.id().map(|p| p as i32).unwrap_or(0);
    let mut stdout_buf = String::new();
    let mut line_buf = String::new();

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    let stderr_task = tokio::spawn(async move {
        let mut out = String::new();
        if let Some(err) = stderr.as_mut() {
            let _ = err.read_to_string(&mut out).await;
        }
        out
    });

    let timeout_fut = async {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(timeout_fut);
    let mut killed = false;
    let mut chunk = [0u8; 4096];
    let wstatus = loop {
        let read_out = async {
            match stdout.as_mut() {
                Some(out) => out.read(&mut chunk).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            status = child.wait() => {
                // drain whatever stdout is left
                if let Some(out) = stdout.as_mut() {
                    let _ = out.read_to_string(&mut line_buf).await;
                    flush_live(&mut line_buf, &mut stdout_buf, live_out, true, &client, seq_id, job).await;
                }
                break status.map(wstatus_of).unwrap_or(-1);
            }
            n = read_out => {
                match n {
                    Ok(0) | Err(_) => { stdout = None; }
                    Ok(n) => {
                        line_buf.push_str(&String::from_utf8_lossy(&chunk[..n]));
                        flush_live(&mut line_buf, &mut stdout_buf, live_out, false, &client, seq_id, job).await;
                    }
                }
            }
            _ = &mut timeout_fut, if !killed => {
                killed = true;
                tokio::spawn(kill_escalation(pgid, kill_sigs.clone()));
            }
            _ = kill_rx.recv(), if !killed => {
                killed = true;
                tokio::spawn(kill_escalation(pgid, kill_sigs.clone()));
            }
        }
    };

    let stderr_text = stderr_task.await.unwrap_or_default();
    let status = if killed {
        Status::Killed
    } else if wstatus == 0 {
        Status::Ok
    } else {
        Status::Err
    };
    ChildResult {
        status,
        wstatus,
        stdout: stdout_buf,
        stderr: stderr_text,
    }
}

/// Emit complete lines to the server on the fly, keeping the incomplete tail
/// buffered so chunks stay line-coherent.
async fn flush_live(
    line_buf: &mut String,
    stdout_buf: &mut String,
    live_out: bool,
    flush_all: bool,
    client: &JobsClient,
    seq_id: SeqId,
    job: ferret_proto::JobIdx,
) {
    let upto = if flush_all {
        line_buf.len()
    } else {
        match line_buf.rfind('\n') {
            Some(p) => p + 1,
            None => return,
        }
    };
    if upto == 0 {
        return;
    }
    let chunk: String = line_buf.drain(..upto).collect();
    stdout_buf.push_str(&chunk);
    if live_out {
        client.live_out(seq_id, job, chunk).await;
    }
}

fn wstatus_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.into_raw()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferret_proto::AccessDigest;

    fn report(files: &[&str], write: Bool3, accesses: Accesses) -> AccessReport {
        AccessReport {
            kind: AccessKind::Access as u8,
            files: files.iter().map(|f| (f.to_string(), FileSig::default())).collect(),
            digest: AccessDigest {
                write,
                unlink: false,
                accesses,
                dflags: Dflags::default(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn reads_accumulate_until_a_write() {
        let mut g = Gather::default();
        g.access(&report(&["f"], Bool3::No, Accesses::REG));
        g.access(&report(&["f"], Bool3::No, Accesses::STAT));
        let pending = g.access(&report(&["f"], Bool3::Maybe, Accesses::NONE));
        g.confirm(&pending, true);
        g.access(&report(&["f"], Bool3::No, Accesses::LNK)); // read after own write: not a dep
        let info = &g.accesses[0].1;
        assert_eq!(info.write, Bool3::Yes);
        assert_eq!(info.accesses, Accesses::REG | Accesses::STAT);
    }

    #[test]
    fn failed_write_confirm_reverts() {
        let mut g = Gather::default();
        let pending = g.access(&report(&["f"], Bool3::Maybe, Accesses::NONE));
        g.confirm(&pending, false);
        assert_eq!(g.accesses[0].1.write, Bool3::No);
    }

    #[test]
    fn unconfirmed_write_stays_maybe() {
        let mut g = Gather::default();
        g.access(&report(&["f"], Bool3::Maybe, Accesses::NONE));
        assert_eq!(g.accesses[0].1.write, Bool3::Maybe);
    }

    #[test]
    fn order_of_first_access_is_preserved() {
        let mut g = Gather::default();
        g.access(&report(&["b"], Bool3::No, Accesses::REG));
        g.access(&report(&["a"], Bool3::No, Accesses::REG));
        g.access(&report(&["b"], Bool3::No, Accesses::STAT));
        let names: Vec<_> = g.accesses.iter().map(|(f, _)| f.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }
}
