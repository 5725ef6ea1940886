//! Repository lifecycle and the external git process.
//!
//! Everything that touches the on-disk repositories goes through a
//! [`GitBackend`]. [`GitCli`] implements it with the `git` executable.

use crate::sink::ResponseSink;
use crate::{Result, ServeError};
use async_trait::async_trait;
use gittp_git::ServiceType;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

/// Default deadline for one git process.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

/// Size of the reads from git's stdout.
const OUTPUT_CHUNK: usize = 64 * 1024;

/// One run of `git-upload-pack` or `git-receive-pack`.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    /// Service to run.
    pub service: ServiceType,
    /// Repository the service operates on.
    pub repo_path: &'a Path,
    /// Only advertise refs (`--advertise-refs`).
    pub advertise: bool,
}

impl Invocation<'_> {
    /// Arguments following the git subcommand.
    pub fn args(&self) -> Vec<&std::ffi::OsStr> {
        let mut args = vec![std::ffi::OsStr::new("--stateless-rpc")];
        if self.advertise {
            args.push(std::ffi::OsStr::new("--advertise-refs"));
        }
        args.push(self.repo_path.as_os_str());
        args
    }
}

/// Operations the bridge needs from the repository store.
#[async_trait]
pub trait GitBackend: Send + Sync {
    /// Returns true if a repository exists at `path`.
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    /// Creates a bare repository at `path`, including parent directories.
    /// Succeeds without changes if one is already there.
    async fn init_bare(&self, path: &Path) -> Result<()>;

    /// Returns a tar snapshot of the tree at `rev`.
    async fn archive(&self, path: &Path, rev: &str) -> Result<Vec<u8>>;

    /// Runs a pack service with `input` on stdin, sending its stdout to
    /// `output` as it is produced.
    async fn run_service(
        &self,
        invocation: &Invocation<'_>,
        input: &[u8],
        output: &mut dyn ResponseSink,
    ) -> Result<()>;
}

/// [`GitBackend`] driving the `git` executable.
///
/// Every git process runs under a deadline and is killed when it passes,
/// when the client goes away, or when the request is dropped.
#[derive(Debug, Clone)]
pub struct GitCli {
    git: PathBuf,
    timeout: Duration,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new("git", DEFAULT_COMMAND_TIMEOUT)
    }
}

impl GitCli {
    /// Creates a backend running `git` with the given per-command deadline.
    pub fn new(git: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            git: git.into(),
            timeout,
        }
    }

    /// Returns the per-command deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.git);
        command.kill_on_drop(true);
        command
    }

    /// Runs a short git command to completion under the deadline.
    async fn output(&self, command: &mut Command) -> io::Result<Output> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| timed_out(self.timeout))?
    }
}

fn timed_out(timeout: Duration) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("timed out after {}s", timeout.as_secs_f32()),
    )
}

fn exit_failure(output: &Output) -> String {
    format!(
        "{}: {}",
        output.status,
        String::from_utf8_lossy(&output.stderr).trim()
    )
}

#[async_trait]
impl GitBackend for GitCli {
    async fn init_bare(&self, path: &Path) -> Result<()> {
        let init_failure = |reason: String| ServeError::RepositoryInitFailure {
            path: path.display().to_string(),
            reason,
        };

        if path.join("HEAD").is_file() {
            tracing::debug!(path = %path.display(), "Repository already initialized");
            return Ok(());
        }

        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| init_failure(e.to_string()))?;

        let output = self
            .output(self.command().arg("init").arg("--bare").arg(path))
            .await
            .map_err(|e| init_failure(e.to_string()))?;

        if !output.status.success() {
            return Err(init_failure(exit_failure(&output)));
        }

        tracing::info!(path = %path.display(), "Initialized bare repository");
        Ok(())
    }

    async fn archive(&self, path: &Path, rev: &str) -> Result<Vec<u8>> {
        let failure = |reason: String| ServeError::CommandExecutionFailure {
            service: "git-archive".to_string(),
            reason,
        };

        let output = self
            .output(
                self.command()
                    .arg("archive")
                    .arg("--format=tar")
                    .arg(rev)
                    .current_dir(path),
            )
            .await
            .map_err(|e| failure(e.to_string()))?;

        if !output.status.success() {
            return Err(failure(exit_failure(&output)));
        }

        Ok(output.stdout)
    }

    async fn run_service(
        &self,
        invocation: &Invocation<'_>,
        input: &[u8],
        output: &mut dyn ResponseSink,
    ) -> Result<()> {
        let failure = |reason: String| ServeError::CommandExecutionFailure {
            service: invocation.service.to_string(),
            reason,
        };

        tracing::debug!(
            service = %invocation.service,
            repo = %invocation.repo_path.display(),
            advertise = invocation.advertise,
            input_bytes = input.len(),
            "Running git service"
        );

        let mut child = self
            .command()
            .arg(invocation.service.subcommand())
            .args(invocation.args())
            .current_dir(invocation.repo_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| failure(format!("spawn: {e}")))?;

        let stdin = child.stdin.take();
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| failure("stdout not captured".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| failure("stderr not captured".to_string()))?;

        let feed = async move {
            if let Some(mut stdin) = stdin {
                // The process may exit without draining stdin.
                if let Err(e) = stdin.write_all(input).await {
                    tracing::debug!(error = %e, "git stdin closed early");
                }
            }
        };

        let drain_stderr = async move {
            let mut text = Vec::new();
            if let Err(e) = stderr.read_to_end(&mut text).await {
                tracing::debug!(error = %e, "Could not read git stderr");
            }
            String::from_utf8_lossy(&text).into_owned()
        };

        let run = async {
            let copy = async {
                let copied = copy_output(&mut stdout, output).await;
                if copied.is_err() {
                    if let Err(e) = child.start_kill() {
                        tracing::debug!(error = %e, "Could not kill git process");
                    }
                }
                copied
            };

            let ((), copied, stderr_text) = tokio::join!(feed, copy, drain_stderr);
            let status = child.wait().await;
            (copied, status, stderr_text)
        };

        let finished = tokio::time::timeout(self.timeout, run).await;
        let (copied, status, stderr_text) = match finished {
            Ok(done) => done,
            Err(_) => {
                if let Err(e) = child.kill().await {
                    tracing::debug!(error = %e, "Could not kill timed out git process");
                }
                return Err(failure(timed_out(self.timeout).to_string()));
            }
        };

        let copied = copied.map_err(|e| failure(format!("copying output: {e}")))?;
        let status = status.map_err(|e| failure(format!("wait: {e}")))?;

        let stderr_text = stderr_text.trim();
        if !stderr_text.is_empty() {
            tracing::debug!(stderr = %stderr_text, "git stderr");
        }

        if !status.success() {
            return Err(failure(format!("{status}: {stderr_text}")));
        }

        tracing::debug!(service = %invocation.service, bytes = copied, "Git service finished");
        Ok(())
    }
}

/// Sends git's stdout to the client chunk by chunk.
async fn copy_output<R>(stdout: &mut R, output: &mut dyn ResponseSink) -> io::Result<u64>
where
    R: AsyncRead + Unpin + Send,
{
    let mut buf = vec![0u8; OUTPUT_CHUNK];
    let mut copied = 0u64;
    loop {
        let n = stdout.read(&mut buf).await?;
        if n == 0 {
            return Ok(copied);
        }
        output.send(&buf[..n]).await?;
        copied += n as u64;
    }
}
