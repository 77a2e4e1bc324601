/// Adapter Module
///
/// Runs the external, protocol-specific TVL computation. The adapter is opaque:
/// it reads the staged batch from its fixed input path and writes its result to
/// its fixed output path. Only the exit status and captured output are inspected.
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use super::stage::CycleArtifacts;
use crate::error::{AdapterFailure, Result};

/// Number of trailing output lines kept for diagnostics
const TAIL_LINES: usize = 20;

/// Longest wait for captured output once the shell has exited
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Outcome of a completed adapter process
#[derive(Debug, Clone)]
pub struct AdapterRun {
    /// `None` when the process was ended by a signal
    pub exit_code: Option<i32>,
    pub output: PathBuf,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl AdapterRun {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stderr_tail(&self) -> String {
        tail(&self.stderr, TAIL_LINES)
    }

    pub fn stdout_tail(&self) -> String {
        tail(&self.stdout, TAIL_LINES)
    }
}

#[async_trait]
pub trait AdapterInvoker: Send + Sync {
    /// Run to completion. Errors only when the process could not run or timed out;
    /// a non-zero exit is reported through `AdapterRun::exit_code`.
    async fn run(&self, staged: &CycleArtifacts) -> Result<AdapterRun>;
}

/// Runs the adapter through `sh -c` in its working directory
#[derive(Debug, Clone)]
pub struct ShellAdapter {
    command: String,
    timeout: Duration,
}

impl ShellAdapter {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self { command: command.into(), timeout }
    }

    fn spawn(&self, staged: &CycleArtifacts) -> std::io::Result<ProcessGroup> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .current_dir(staged.workdir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // own process group so npm/node children can be killed together with sh
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn()?;
        Ok(ProcessGroup { pgid: child.id(), child })
    }
}

/// The adapter shell and everything it started. Dropping it kills the whole group,
/// so a cancelled cycle leaves no process behind that could still write artifacts.
struct ProcessGroup {
    child: Child,
    /// Recorded at spawn; `Child::id` is gone once the shell has been reaped
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn kill(&mut self) {
        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            if let Some(pgid) = self.pgid.and_then(|id| i32::try_from(id).ok()) {
                match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(e) => tracing::warn!("Failed to kill adapter process group {}: {}", pgid, e),
                }
            }
        }

        if let Err(e) = self.child.start_kill() {
            // already reaped
            tracing::debug!("Adapter shell not killed: {}", e);
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[async_trait]
impl AdapterInvoker for ShellAdapter {
    async fn run(&self, staged: &CycleArtifacts) -> Result<AdapterRun> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.timeout;
        tracing::info!("Running adapter in {}: {}", staged.workdir().display(), self.command);

        let mut group = self
            .spawn(staged)
            .map_err(|source| AdapterFailure::Spawn { workdir: staged.workdir().to_path_buf(), source })?;

        let mut stdout = drain(group.child.stdout.take());
        let mut stderr = drain(group.child.stderr.take());

        let waited = tokio::time::timeout_at(deadline, group.child.wait()).await;
        let status = match waited {
            Ok(status) => {
                status.map_err(|source| AdapterFailure::Spawn { workdir: staged.workdir().to_path_buf(), source })?
            }
            Err(_) => {
                tracing::error!("Adapter exceeded {:?}, terminating", self.timeout);
                group.kill();
                stdout.abort();
                stderr.abort();
                return Err(AdapterFailure::TimedOut(self.timeout).into());
            }
        };

        // the shell is done; background leftovers would otherwise hold the pipes open
        group.kill();

        // draining never extends the run past its deadline
        let drained = tokio::time::timeout_at(deadline.min(tokio::time::Instant::now() + DRAIN_GRACE), async {
            ((&mut stdout).await.unwrap_or_default(), (&mut stderr).await.unwrap_or_default())
        })
        .await;
        let (stdout_text, stderr_text) = match drained {
            Ok(texts) => texts,
            Err(_) => {
                tracing::warn!("Adapter output pipes still open after exit, discarding captured output");
                stdout.abort();
                stderr.abort();
                (String::new(), String::new())
            }
        };

        let run = AdapterRun {
            exit_code: status.code(),
            output: staged.output_path().to_path_buf(),
            stdout: stdout_text,
            stderr: stderr_text,
            elapsed: started.elapsed(),
        };

        tracing::info!("Adapter finished with {:?} after {:.1}s", run.exit_code, run.elapsed.as_secs_f64());
        tracing::debug!("Adapter stdout tail:\n{}", run.stdout_tail());

        Ok(run)
    }
}

/// Read a child pipe to the end on a separate task so the child never blocks on a full pipe
fn drain<R>(pipe: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            if let Err(e) = pipe.read_to_end(&mut buf).await {
                tracing::debug!("Adapter pipe closed early: {}", e);
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
