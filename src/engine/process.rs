//! Subprocess plumbing shared by the adapters that shell out to engine
//! tools (pg_dump, mysqldump, mongodump, and their restore counterparts).
//!
//! The tools are treated as opaque processes: argv is composed from
//! validated identifiers only, credentials travel via the environment,
//! stdout is streamed into the pipeline, and stderr is captured for error
//! reporting. Termination is explicit: SIGTERM, then SIGKILL after a grace
//! window.

use std::io::{Read, Write};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{DumpSink, RestoreSource};
use crate::error::{BackupError, Result};

/// How long a SIGTERMed tool gets before SIGKILL.
pub const KILL_GRACE: Duration = Duration::from_secs(10);

const READ_CHUNK: usize = 64 * 1024;
const STDERR_TAIL_CAP: usize = 16 * 1024;

/// An engine tool invocation: program, validated argv, and credential
/// environment variables.
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    fn spawn(&self, stdin: Stdio, stdout: Stdio) -> Result<Child> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        debug!(program = %self.program, "spawning engine tool");
        command.spawn().map_err(|e| BackupError::DumpFailed {
            message: format!("failed to spawn {}: {e}", self.program),
            stderr: None,
        })
    }
}

// Collect stderr, keeping only the tail so a chatty tool cannot balloon
// error metadata.
async fn collect_stderr(child: &mut Child) -> tokio::task::JoinHandle<String> {
    let mut stderr = child.stderr.take().expect("stderr piped");
    tokio::spawn(async move {
        let mut tail: Vec<u8> = Vec::new();
        let mut buf = vec![0u8; 4096];
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    tail.extend_from_slice(&buf[..n]);
                    if tail.len() > STDERR_TAIL_CAP {
                        let cut = tail.len() - STDERR_TAIL_CAP;
                        tail.drain(..cut);
                    }
                }
            }
        }
        String::from_utf8_lossy(&tail).into_owned()
    })
}

/// SIGTERM the child, give it [`KILL_GRACE`] to exit, then SIGKILL.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
        warn!(pid, "tool ignored SIGTERM, sending SIGKILL");
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

async fn wait_with_cancel(child: &mut Child, cancel: &CancellationToken) -> Result<std::process::ExitStatus> {
    tokio::select! {
        status = child.wait() => {
            status.map_err(|e| BackupError::Internal(format!("waiting for tool: {e}")))
        }
        _ = cancel.cancelled() => {
            terminate(child).await;
            Err(BackupError::Cancelled)
        }
    }
}

/// Run a dump tool, streaming its stdout into `sink`. Returns the stderr
/// tail (some tools log progress there even on success).
pub async fn run_dump_to_sink(
    command: ToolCommand,
    sink: &mut DumpSink<'_>,
    cancel: &CancellationToken,
) -> Result<String> {
    let mut child = command.spawn(Stdio::null(), Stdio::piped())?;
    let stderr_task = collect_stderr(&mut child).await;
    let mut stdout = child.stdout.take().expect("stdout piped");

    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let read = tokio::select! {
            read = stdout.read(&mut buf) => read,
            _ = cancel.cancelled() => {
                terminate(&mut child).await;
                return Err(BackupError::Cancelled);
            }
        };
        match read {
            Ok(0) => break,
            Ok(n) => sink.write_all(&buf[..n]).map_err(|e| BackupError::DumpFailed {
                message: format!("writing dump stream: {e}"),
                stderr: None,
            })?,
            Err(e) => {
                terminate(&mut child).await;
                return Err(BackupError::DumpFailed {
                    message: format!("reading {} output: {e}", command.program),
                    stderr: None,
                });
            }
        }
    }

    let status = wait_with_cancel(&mut child, cancel).await?;
    let stderr = stderr_task.await.unwrap_or_default();
    if !status.success() {
        return Err(BackupError::DumpFailed {
            message: format!("{} exited with {status}", command.program),
            stderr: Some(stderr),
        });
    }
    Ok(stderr)
}

/// Run a restore tool, feeding `source` into its stdin.
pub async fn run_restore_from_source(
    command: ToolCommand,
    source: &mut RestoreSource<'_>,
    cancel: &CancellationToken,
) -> Result<String> {
    let mut child = command.spawn(Stdio::piped(), Stdio::null())?;
    let stderr_task = collect_stderr(&mut child).await;
    let mut stdin = child.stdin.take().expect("stdin piped");

    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        if cancel.is_cancelled() {
            terminate(&mut child).await;
            return Err(BackupError::Cancelled);
        }
        let n = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                terminate(&mut child).await;
                return Err(crate::codec::map_read_error(e));
            }
        };
        let write = tokio::select! {
            write = stdin.write_all(&buf[..n]) => write,
            _ = cancel.cancelled() => {
                terminate(&mut child).await;
                return Err(BackupError::Cancelled);
            }
        };
        if let Err(e) = write {
            terminate(&mut child).await;
            let stderr = stderr_task.await.unwrap_or_default();
            return Err(BackupError::RestoreFailed {
                message: format!("feeding {}: {e}", command.program),
                stderr: Some(stderr),
            });
        }
    }
    drop(stdin);

    let status = wait_with_cancel(&mut child, cancel).await?;
    let stderr = stderr_task.await.unwrap_or_default();
    if !status.success() {
        return Err(BackupError::RestoreFailed {
            message: format!("{} exited with {status}", command.program),
            stderr: Some(stderr),
        });
    }
    Ok(stderr)
}

/// Run a tool that does its own file I/O (mongodump --out, mongorestore).
/// Only stderr is captured.
pub async fn run_to_completion(
    command: ToolCommand,
    cancel: &CancellationToken,
    restore: bool,
) -> Result<String> {
    let mut child = command.spawn(Stdio::null(), Stdio::null())?;
    let stderr_task = collect_stderr(&mut child).await;

    let status = wait_with_cancel(&mut child, cancel).await?;
    let stderr = stderr_task.await.unwrap_or_default();
    if !status.success() {
        let message = format!("{} exited with {status}", command.program);
        return Err(if restore {
            BackupError::RestoreFailed {
                message,
                stderr: Some(stderr),
            }
        } else {
            BackupError::DumpFailed {
                message,
                stderr: Some(stderr),
            }
        });
    }
    Ok(stderr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dump_streams_stdout() {
        let command = ToolCommand::new("sh").args(["-c", "printf 'dump-bytes'"]);
        let mut out: Vec<u8> = Vec::new();
        let mut sink = DumpSink::new(&mut out);
        let cancel = CancellationToken::new();
        run_dump_to_sink(command, &mut sink, &cancel).await.unwrap();
        assert_eq!(out, b"dump-bytes");
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_stderr() {
        let command = ToolCommand::new("sh").args(["-c", "echo boom >&2; exit 3"]);
        let mut out: Vec<u8> = Vec::new();
        let mut sink = DumpSink::new(&mut out);
        let cancel = CancellationToken::new();
        let err = run_dump_to_sink(command, &mut sink, &cancel)
            .await
            .unwrap_err();
        match err {
            BackupError::DumpFailed { stderr, .. } => {
                assert!(stderr.unwrap().contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_dump_failed() {
        let command = ToolCommand::new("definitely-not-a-real-tool-xyz");
        let mut out: Vec<u8> = Vec::new();
        let mut sink = DumpSink::new(&mut out);
        let cancel = CancellationToken::new();
        let err = run_dump_to_sink(command, &mut sink, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DumpFailed);
    }

    #[tokio::test]
    async fn test_cancellation_kills_subprocess() {
        let command = ToolCommand::new("sh").args(["-c", "sleep 60"]);
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel_clone.cancel();
        });

        let started = std::time::Instant::now();
        let mut out: Vec<u8> = Vec::new();
        let mut sink = DumpSink::new(&mut out);
        let err = run_dump_to_sink(command, &mut sink, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Cancelled);
        // Reaped well inside the 15 s bound; sleep dies on SIGTERM.
        assert!(started.elapsed() < Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_restore_feeds_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("restored.txt");
        let command = ToolCommand::new("sh").args([
            "-c".to_string(),
            format!("cat > {}", out_path.display()),
        ]);

        let mut data: &[u8] = b"restore payload";
        let mut source = RestoreSource::new(&mut data);
        let cancel = CancellationToken::new();
        run_restore_from_source(command, &mut source, &cancel)
            .await
            .unwrap();
        assert_eq!(std::fs::read(out_path).unwrap(), b"restore payload");
    }
}
