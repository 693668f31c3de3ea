use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ProbeError, Result};

use super::dispatcher::{JobOutcome, run_job};
use super::engine::{AnalysisEngine, EngineFactory};
use super::job::JobDescriptor;

/// Parent → worker message, one JSON document per line.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "job", rename_all = "snake_case")]
pub enum WorkerRequest {
    Analyze(JobDescriptor),
}

/// Worker → parent message, one JSON document per line.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerReply {
    /// Engine built; the worker accepts requests.
    Ready,
    /// Engine construction failed; the worker exits.
    Unavailable { error: String },
    Completed,
    Failed { error: String },
    /// Interrupted mid-job.
    Aborted,
}

impl From<JobOutcome> for WorkerReply {
    fn from(outcome: JobOutcome) -> Self {
        match outcome {
            JobOutcome::Completed => WorkerReply::Completed,
            JobOutcome::Failed { error } => WorkerReply::Failed { error },
            JobOutcome::Aborted => WorkerReply::Aborted,
        }
    }
}

/// One pool member. A worker runs one job at a time; the pool decides when
/// to retire it.
#[async_trait]
pub trait Worker: Send {
    fn id(&self) -> &str;

    /// Runs one job. `Err` means the worker itself is unusable and must be
    /// discarded; job-level failures come back as [`JobOutcome::Failed`].
    async fn run(&mut self, job: &JobDescriptor) -> Result<JobOutcome>;

    /// Releases the worker after its last job finished.
    async fn retire(self: Box<Self>);

    /// Interrupts the worker and releases it, forcibly once `grace` elapses.
    async fn abort(self: Box<Self>, grace: Duration);
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, slot: usize) -> Result<Box<dyn Worker>>;
}

impl fmt::Debug for dyn WorkerLauncher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WorkerLauncher")
    }
}

/// Launches workers that run the engine on the current runtime. Each launch
/// builds a fresh engine, so recycling still resets engine state.
pub struct InProcessLauncher {
    factory: Arc<dyn EngineFactory>,
}

impl fmt::Debug for InProcessLauncher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcessLauncher").finish_non_exhaustive()
    }
}

impl InProcessLauncher {
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(&self, slot: usize) -> Result<Box<dyn Worker>> {
        let engine = self.factory.build()?;
        Ok(Box::new(InProcessWorker {
            id: format!("inproc-{slot}"),
            engine,
        }))
    }
}

struct InProcessWorker {
    id: String,
    engine: Arc<dyn AnalysisEngine>,
}

#[async_trait]
impl Worker for InProcessWorker {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&mut self, job: &JobDescriptor) -> Result<JobOutcome> {
        Ok(JobOutcome::from_result(self.engine.analyze(job).await))
    }

    async fn retire(self: Box<Self>) {}

    // Dropping the in-flight `run` future is the interrupt.
    async fn abort(self: Box<Self>, _grace: Duration) {}
}

/// Launches child processes that serve [`WorkerRequest`]s on stdin and
/// answer with [`WorkerReply`]s on stdout. Typically the current executable
/// with a hidden worker subcommand.
#[derive(Clone, Debug)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    grace: Duration,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            grace: Duration::from_secs(2),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// How long a retiring worker may take to exit before it is killed.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, slot: usize) -> Result<Box<dyn Worker>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                ProbeError::WorkerLaunch(format!(
                    "failed to spawn {}: {err}",
                    self.program.display()
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProbeError::WorkerLaunch("worker stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProbeError::WorkerLaunch("worker stdout not captured".into()))?;

        let id = match child.id() {
            Some(pid) => format!("proc-{slot}-{pid}"),
            None => format!("proc-{slot}"),
        };
        let mut worker = ProcessWorker {
            id,
            child,
            stdin: Some(stdin),
            replies: BufReader::new(stdout).lines(),
            grace: self.grace,
        };

        match worker.next_reply().await {
            Ok(Some(WorkerReply::Ready)) => {
                debug!(target: "dnsprobe::worker", worker = %worker.id, "worker process ready");
                Ok(Box::new(worker))
            }
            Ok(Some(WorkerReply::Unavailable { error })) => {
                worker.reap().await;
                Err(ProbeError::NetworkUnavailable(error))
            }
            Ok(Some(other)) => {
                worker.reap().await;
                Err(ProbeError::Protocol(format!(
                    "unexpected handshake from worker: {other:?}"
                )))
            }
            Ok(None) => {
                worker.reap().await;
                Err(ProbeError::WorkerLaunch(
                    "worker exited before handshake".into(),
                ))
            }
            Err(err) => {
                worker.reap().await;
                Err(err)
            }
        }
    }
}

struct ProcessWorker {
    id: String,
    child: Child,
    stdin: Option<ChildStdin>,
    replies: Lines<BufReader<ChildStdout>>,
    grace: Duration,
}

impl ProcessWorker {
    async fn next_reply(&mut self) -> Result<Option<WorkerReply>> {
        loop {
            let Some(line) = self.replies.next_line().await? else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(&line)?));
        }
    }

    #[cfg(unix)]
    fn interrupt(&mut self) {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id() else {
            return;
        };
        if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
            debug!(target: "dnsprobe::worker", worker = %self.id, error = %err, "interrupt delivery failed");
        }
    }

    #[cfg(not(unix))]
    fn interrupt(&mut self) {
        let _ = self.child.start_kill();
    }

    /// Waits up to `grace` for the child to exit, then kills it.
    async fn reap(&mut self) {
        self.stdin = None;
        match tokio::time::timeout(self.grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(target: "dnsprobe::worker", worker = %self.id, %status, "worker process exited");
            }
            Ok(Err(err)) => {
                warn!(target: "dnsprobe::worker", worker = %self.id, error = %err, "failed to wait for worker process");
            }
            Err(_) => {
                warn!(target: "dnsprobe::worker", worker = %self.id, "worker process did not exit in time; killing");
                if let Err(err) = self.child.kill().await {
                    warn!(target: "dnsprobe::worker", worker = %self.id, error = %err, "failed to kill worker process");
                }
            }
        }
    }
}

#[async_trait]
impl Worker for ProcessWorker {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&mut self, job: &JobDescriptor) -> Result<JobOutcome> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| ProbeError::Protocol("worker stdin already closed".into()))?;
        let mut line = serde_json::to_string(&WorkerRequest::Analyze(job.clone()))?;
        line.push('\n');
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;

        match self.next_reply().await? {
            Some(WorkerReply::Completed) => Ok(JobOutcome::Completed),
            Some(WorkerReply::Failed { error }) => Ok(JobOutcome::Failed { error }),
            Some(WorkerReply::Aborted) => Ok(JobOutcome::Aborted),
            Some(other) => Err(ProbeError::Protocol(format!(
                "unexpected reply from worker: {other:?}"
            ))),
            None => Err(ProbeError::Protocol("worker exited mid-job".into())),
        }
    }

    async fn retire(mut self: Box<Self>) {
        // EOF on stdin tells the child to exit.
        self.reap().await;
    }

    async fn abort(mut self: Box<Self>, grace: Duration) {
        self.interrupt();
        self.grace = grace;
        let drained = tokio::time::timeout(grace, async {
            while let Ok(Some(reply)) = self.next_reply().await {
                if reply == WorkerReply::Aborted {
                    break;
                }
            }
        })
        .await;
        if drained.is_err() {
            debug!(target: "dnsprobe::worker", worker = %self.id, "worker did not acknowledge interrupt");
        }
        self.reap().await;
    }
}

async fn write_reply<W>(writer: &mut W, reply: &WorkerReply) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_string(reply)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Worker side of the process protocol.
///
/// Builds an engine, announces readiness, then answers one request per line
/// until EOF. `interrupt` firing while idle ends the loop quietly; firing
/// mid-job answers [`WorkerReply::Aborted`] and ends the loop.
pub async fn serve<R, W>(
    factory: &dyn EngineFactory,
    reader: R,
    mut writer: W,
    interrupt: CancellationToken,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let engine = match factory.build() {
        Ok(engine) => engine,
        Err(err) => {
            write_reply(
                &mut writer,
                &WorkerReply::Unavailable {
                    error: err.to_string(),
                },
            )
            .await?;
            return Err(err);
        }
    };
    write_reply(&mut writer, &WorkerReply::Ready).await?;

    let mut lines = reader.lines();
    let mut served = 0u64;
    loop {
        let line = tokio::select! {
            biased;
            _ = interrupt.cancelled() => {
                debug!(target: "dnsprobe::worker", served, "interrupted while idle");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            debug!(target: "dnsprobe::worker", served, "request stream closed; retiring");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let WorkerRequest::Analyze(job) = serde_json::from_str(&line)?;
        let outcome = run_job(engine.as_ref(), &job, &interrupt).await;
        served += 1;
        let aborted = outcome == JobOutcome::Aborted;
        write_reply(&mut writer, &WorkerReply::from(outcome)).await?;
        if aborted {
            info!(target: "dnsprobe::worker", domain = %job.canonical_name(), "job interrupted; worker exiting");
            break;
        }
    }
    Ok(())
}

/// Runs [`serve`] over the process's stdin/stdout.
pub async fn serve_stdio(factory: &dyn EngineFactory, interrupt: CancellationToken) -> Result<()> {
    let reader = BufReader::new(tokio::io::stdin());
    let writer = tokio::io::stdout();
    serve(factory, reader, writer, interrupt).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::job::{ClientAddresses, JobTemplate};
    use chrono::Utc;
    use tokio::io::{AsyncReadExt, duplex};

    #[derive(Debug)]
    struct ScriptedEngine;

    #[async_trait]
    impl AnalysisEngine for ScriptedEngine {
        async fn analyze(&self, job: &JobDescriptor) -> Result<()> {
            match job.name.as_str() {
                "broken.example" => Err(ProbeError::analysis(&job.name, "REFUSED")),
                "slow.example" => {
                    tokio::time::sleep(Duration::from_secs(3_600)).await;
                    Ok(())
                }
                _ => Ok(()),
            }
        }
    }

    #[derive(Debug)]
    struct Factory {
        available: bool,
    }

    impl EngineFactory for Factory {
        fn client_addresses(&self) -> Result<ClientAddresses> {
            Ok(ClientAddresses::default())
        }

        fn build(&self) -> Result<Arc<dyn AnalysisEngine>> {
            if self.available {
                Ok(Arc::new(ScriptedEngine))
            } else {
                Err(ProbeError::NetworkUnavailable("no interfaces".into()))
            }
        }
    }

    fn request(name: &str) -> String {
        let job = JobTemplate::default().job_for(name, Utc::now());
        let mut line = serde_json::to_string(&WorkerRequest::Analyze(job)).unwrap();
        line.push('\n');
        line
    }

    fn replies(raw: &str) -> Vec<WorkerReply> {
        raw.lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn answers_each_request_until_eof() {
        let (mut parent_tx, child_rx) = duplex(4096);
        let (child_tx, mut parent_rx) = duplex(4096);

        let input = format!("{}{}", request("ok.example"), request("broken.example"));
        parent_tx.write_all(input.as_bytes()).await.unwrap();
        drop(parent_tx);

        let factory = Factory { available: true };
        serve(
            &factory,
            BufReader::new(child_rx),
            child_tx,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let mut raw = String::new();
        parent_rx.read_to_string(&mut raw).await.unwrap();
        let got = replies(&raw);
        assert_eq!(got[0], WorkerReply::Ready);
        assert_eq!(got[1], WorkerReply::Completed);
        assert!(matches!(&got[2], WorkerReply::Failed { error } if error.contains("REFUSED")));
        assert_eq!(got.len(), 3);
    }

    #[tokio::test]
    async fn unavailable_engine_is_reported_before_exit() {
        let (_parent_tx, child_rx) = duplex(1024);
        let (child_tx, mut parent_rx) = duplex(1024);

        let factory = Factory { available: false };
        let err = serve(
            &factory,
            BufReader::new(child_rx),
            child_tx,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.is_fatal());

        let mut raw = String::new();
        parent_rx.read_to_string(&mut raw).await.unwrap();
        assert!(matches!(
            replies(&raw).as_slice(),
            [WorkerReply::Unavailable { .. }]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_mid_job_replies_aborted() {
        let (mut parent_tx, child_rx) = duplex(4096);
        let (child_tx, mut parent_rx) = duplex(4096);
        parent_tx
            .write_all(request("slow.example").as_bytes())
            .await
            .unwrap();

        let interrupt = CancellationToken::new();
        let child = {
            let interrupt = interrupt.clone();
            tokio::spawn(async move {
                let factory = Factory { available: true };
                serve(&factory, BufReader::new(child_rx), child_tx, interrupt).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        interrupt.cancel();
        child.await.unwrap().unwrap();

        let mut raw = String::new();
        parent_rx.read_to_string(&mut raw).await.unwrap();
        assert_eq!(replies(&raw), vec![WorkerReply::Ready, WorkerReply::Aborted]);
    }

    #[tokio::test]
    async fn interrupt_while_idle_exits_quietly() {
        let (_parent_tx, child_rx) = duplex(1024);
        let (child_tx, mut parent_rx) = duplex(1024);
        let interrupt = CancellationToken::new();
        interrupt.cancel();

        let factory = Factory { available: true };
        serve(&factory, BufReader::new(child_rx), child_tx, interrupt)
            .await
            .unwrap();

        let mut raw = String::new();
        parent_rx.read_to_string(&mut raw).await.unwrap();
        assert_eq!(replies(&raw), vec![WorkerReply::Ready]);
    }

    #[test]
    fn wire_format_is_tagged() {
        let reply = serde_json::to_string(&WorkerReply::Failed {
            error: "timeout".into(),
        })
        .unwrap();
        assert_eq!(reply, r#"{"status":"failed","error":"timeout"}"#);
        let ready = serde_json::to_string(&WorkerReply::Ready).unwrap();
        assert_eq!(ready, r#"{"status":"ready"}"#);
    }
}
