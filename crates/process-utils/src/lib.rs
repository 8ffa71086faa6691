//! Child-process plumbing shared across the workspace.
//!
//! Every external tool the daemon drives (transcoders, converters, image
//! processors) goes through this crate: platform-safe command construction,
//! wall-clock timeouts, chunked stdout streaming and kill-on-cancel.

use std::collections::VecDeque;
use std::ffi::OsStr;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Default number of stderr lines retained for diagnostics.
pub const DEFAULT_STDERR_TAIL: usize = 32;

/// Errors from spawning and supervising child processes.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' timed out after {timeout:?}")]
    TimedOut { program: String, timeout: Duration },

    #[error("'{program}' was cancelled")]
    Cancelled { program: String },

    #[error("'{program}' exited with {status}: {stderr_tail}")]
    Exited {
        program: String,
        status: ExitStatus,
        stderr_tail: String,
    },

    #[error("io error while supervising '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for this crate.
pub type Result<T> = std::result::Result<T, ProcessError>;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

impl NoWindowExt for Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on
/// Windows and `kill_on_drop` set, so an abandoned handle never leaks a
/// running tool.
pub fn command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    cmd.no_window();
    cmd.kill_on_drop(true);
    cmd
}

/// Bounded ring of the most recent stderr lines of a child.
///
/// The collector task drains stderr continuously (so the child never blocks
/// on a full pipe) and keeps only the tail for error messages.
pub struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    collector: Option<tokio::task::JoinHandle<()>>,
}

impl StderrTail {
    /// Start draining `stderr`, retaining the last `cap` lines.
    pub fn collect<R>(stderr: R, cap: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let lines = Arc::new(Mutex::new(VecDeque::with_capacity(cap)));
        let sink = lines.clone();
        let collector = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                let mut tail = sink.lock().unwrap_or_else(|p| p.into_inner());
                if tail.len() == cap {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        });
        Self {
            lines,
            collector: Some(collector),
        }
    }

    /// Wait for the collector to hit EOF so the tail is complete. Called
    /// after the child exited; the pipe closes and the task ends.
    pub async fn drained(&mut self) {
        if let Some(handle) = self.collector.take() {
            let _ = handle.await;
        }
    }

    /// Snapshot of the retained lines, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// The retained lines joined for an error message.
    pub fn joined(&self) -> String {
        self.snapshot().join(" | ")
    }
}

/// Fixed-size chunk reader over an async byte stream.
pub struct ChunkReader<R> {
    inner: R,
    chunk_size: usize,
}

impl<R: AsyncRead + Unpin> ChunkReader<R> {
    pub fn new(inner: R, chunk_size: usize) -> Self {
        Self {
            inner,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Read the next chunk. Fills exactly the configured chunk size unless
    /// EOF arrives first; only EOF yields `None`.
    pub async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>> {
        let chunk = self.read_up_to(self.chunk_size).await?;
        if chunk.is_empty() { Ok(None) } else { Ok(Some(chunk)) }
    }

    /// Read up to `len` bytes, stopping early only at EOF. An empty buffer
    /// means EOF.
    pub async fn read_up_to(&mut self, len: usize) -> std::io::Result<Bytes> {
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = self.inner.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }
}

/// A spawned child wired for streaming: piped stdio, stderr tail collector,
/// and explicit kill.
pub struct StreamingChild {
    program: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr_tail: Option<StderrTail>,
}

impl StreamingChild {
    /// Spawn `cmd` with stdout/stderr piped (and stdin piped when
    /// `with_stdin`). The stderr tail collector starts immediately.
    pub fn spawn(mut cmd: Command, with_stdin: bool) -> Result<Self> {
        let program = program_name(&cmd);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if with_stdin { Stdio::piped() } else { Stdio::null() });

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;

        let stderr_tail = child
            .stderr
            .take()
            .map(|stderr| StderrTail::collect(stderr, DEFAULT_STDERR_TAIL));
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();

        debug!(program = %program, pid = ?child.id(), "spawned child process");

        Ok(Self {
            program,
            child,
            stdin,
            stdout,
            stderr_tail,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Take the stdin handle (encoder-style children).
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Take stdout as a fixed-size chunk reader.
    pub fn take_stdout_chunks(&mut self, chunk_size: usize) -> Option<ChunkReader<ChildStdout>> {
        self.stdout
            .take()
            .map(|stdout| ChunkReader::new(stdout, chunk_size))
    }

    /// Take the raw stdout handle (line-oriented consumers).
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Stderr tail collected so far.
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail
            .as_ref()
            .map(StderrTail::joined)
            .unwrap_or_default()
    }

    /// Stderr tail after the collector has drained to EOF. Only meaningful
    /// once the child has exited.
    async fn stderr_tail_complete(&mut self) -> String {
        if let Some(tail) = self.stderr_tail.as_mut() {
            tail.drained().await;
            tail.joined()
        } else {
            String::new()
        }
    }

    /// Non-blocking exit check.
    pub fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Kill the child. Errors are logged, not returned; the caller is
    /// already on a teardown path.
    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(program = %self.program, "failed to kill child: {}", e);
        }
    }

    /// Wait for exit. A non-success status becomes `ProcessError::Exited`
    /// carrying the stderr tail.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let status = self.child.wait().await.map_err(|source| ProcessError::Io {
            program: self.program.clone(),
            source,
        })?;
        if status.success() {
            Ok(status)
        } else {
            Err(ProcessError::Exited {
                program: self.program.clone(),
                status,
                stderr_tail: self.stderr_tail_complete().await,
            })
        }
    }

    /// Wait for exit under a wall-clock timeout and a cancellation token.
    /// Timeout or cancellation kills the child.
    pub async fn wait_with_deadline(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExitStatus> {
        tokio::select! {
            res = self.child.wait() => {
                let status = res.map_err(|source| ProcessError::Io {
                    program: self.program.clone(),
                    source,
                })?;
                if status.success() {
                    Ok(status)
                } else {
                    Err(ProcessError::Exited {
                        program: self.program.clone(),
                        status,
                        stderr_tail: self.stderr_tail_complete().await,
                    })
                }
            }
            _ = tokio::time::sleep(timeout) => {
                self.kill().await;
                Err(ProcessError::TimedOut { program: self.program.clone(), timeout })
            }
            _ = cancel.cancelled() => {
                self.kill().await;
                Err(ProcessError::Cancelled { program: self.program.clone() })
            }
        }
    }
}

/// Run a command to completion under a timeout, discarding stdout.
///
/// Convenience for tools whose only interesting output is the exit status
/// (single-shot converters and probes).
pub async fn run_with_timeout(
    cmd: Command,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ExitStatus> {
    let mut child = StreamingChild::spawn(cmd, false)?;
    // Drain stdout so the child never blocks on a full pipe.
    if let Some(stdout) = child.take_stdout() {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(_)) = reader.next_line().await {}
        });
    }
    child.wait_with_deadline(timeout, cancel).await
}

fn program_name(cmd: &Command) -> String {
    cmd.as_std().get_program().to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = command("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn run_success() {
        let cancel = CancellationToken::new();
        let status = run_with_timeout(sh("exit 0"), Duration::from_secs(5), &cancel)
            .await
            .unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn run_failure_carries_stderr_tail() {
        let cancel = CancellationToken::new();
        let err = run_with_timeout(sh("echo boom >&2; exit 3"), Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        match err {
            ProcessError::Exited { stderr_tail, .. } => {
                assert!(stderr_tail.contains("boom"), "tail was: {stderr_tail}");
            }
            other => panic!("expected Exited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_timeout_kills_child() {
        let cancel = CancellationToken::new();
        let err = run_with_timeout(sh("sleep 30"), Duration::from_millis(100), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn run_cancel_kills_child() {
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel_clone.cancel();
        });
        let err = run_with_timeout(sh("sleep 30"), Duration::from_secs(30), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn chunked_stdout() {
        let mut child = StreamingChild::spawn(sh("printf 'abcdefgh'"), false).unwrap();
        let mut chunks = child.take_stdout_chunks(4).unwrap();
        let first = chunks.next_chunk().await.unwrap().unwrap();
        assert_eq!(&first[..], b"abcd");
        let second = chunks.next_chunk().await.unwrap().unwrap();
        assert_eq!(&second[..], b"efgh");
        assert!(chunks.next_chunk().await.unwrap().is_none());
        child.wait().await.unwrap();
    }

    #[tokio::test]
    async fn stderr_tail_is_bounded() {
        let mut child =
            StreamingChild::spawn(sh("for i in $(seq 1 100); do echo line$i >&2; done"), false)
                .unwrap();
        child.wait().await.unwrap();
        // Give the collector a beat to drain.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let tail = child.stderr_tail();
        assert!(tail.contains("line100"));
        assert!(!tail.contains("line1 |"));
    }
}
