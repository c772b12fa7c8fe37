//! Runs `ansible-playbook` as a child process under a deadline.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::OutputCapture;
use crate::error::{EXIT_TIMEOUT, ProvisionError};

/// How long output readers may keep going once the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct PlaybookRunner {
    command: Vec<String>,
    timeout: Duration,
    kill_grace: Duration,
    max_output_bytes: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    NonZeroExit { code: i32 },
    TimedOut { after: Duration },
    Cancelled,
}

#[derive(Clone, Debug)]
pub struct PlaybookRun {
    pub outcome: RunOutcome,
    pub exit_code: i32,
    pub output: String,
    pub truncated: bool,
    pub elapsed: Duration,
    program: String,
}

impl PlaybookRun {
    pub fn succeeded(&self) -> bool {
        self.outcome == RunOutcome::Succeeded
    }

    pub fn error(&self) -> Option<ProvisionError> {
        let program = self.program.clone();
        match self.outcome {
            RunOutcome::Succeeded => None,
            RunOutcome::NonZeroExit { code } => {
                Some(ProvisionError::ProcessNonZeroExit { program, code })
            }
            RunOutcome::TimedOut { after } => Some(ProvisionError::ProcessTimeout { program, after }),
            RunOutcome::Cancelled => Some(ProvisionError::ProcessCancelled { program }),
        }
    }
}

enum Waited {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

impl PlaybookRunner {
    /// `command` is the program followed by any fixed leading arguments.
    pub fn new(command: Vec<String>, timeout: Duration, max_output_bytes: usize) -> Self {
        Self {
            command,
            timeout,
            kill_grace: Duration::from_secs(5),
            max_output_bytes,
        }
    }

    pub fn with_kill_grace(mut self, kill_grace: Duration) -> Self {
        self.kill_grace = kill_grace;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn program(&self) -> &str {
        self.command
            .first()
            .map(String::as_str)
            .unwrap_or("ansible-playbook")
    }

    pub async fn run(
        &self,
        inventory: &Path,
        playbook: &Path,
        shutdown: &CancellationToken,
    ) -> Result<PlaybookRun, ProvisionError> {
        if let Err(source) = tokio::fs::metadata(playbook).await {
            return Err(ProvisionError::PlaybookNotFound {
                path: playbook.to_path_buf(),
                source,
            });
        }

        let started = Instant::now();
        if shutdown.is_cancelled() {
            return Ok(self.finish(RunOutcome::Cancelled, EXIT_TIMEOUT, None, started));
        }

        let mut child = self.spawn(inventory, playbook)?;
        info!(
            program = self.program(),
            pid = child.id(),
            playbook = %playbook.display(),
            "started playbook run"
        );

        let capture = Arc::new(Mutex::new(OutputCapture::new(self.max_output_bytes)));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump(stdout, "stdout", Arc::clone(&capture))));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump(stderr, "stderr", Arc::clone(&capture))));
        }

        let waited = tokio::select! {
            biased;
            _ = shutdown.cancelled() => Waited::Cancelled,
            status = child.wait() => Waited::Exited(status),
            _ = tokio::time::sleep(self.timeout) => Waited::TimedOut,
        };

        let (outcome, exit_code) = match waited {
            Waited::Exited(Ok(status)) => match status.code() {
                Some(0) => (RunOutcome::Succeeded, 0),
                Some(code) => (RunOutcome::NonZeroExit { code }, code),
                None => (RunOutcome::NonZeroExit { code: -1 }, -1),
            },
            Waited::Exited(Err(err)) => {
                warn!(error = %err, "lost track of playbook process");
                terminate(&mut child, self.kill_grace).await;
                (RunOutcome::NonZeroExit { code: -1 }, -1)
            }
            Waited::TimedOut => {
                warn!(timeout_secs = self.timeout.as_secs(), "playbook run hit deadline");
                terminate(&mut child, self.kill_grace).await;
                (
                    RunOutcome::TimedOut {
                        after: self.timeout,
                    },
                    EXIT_TIMEOUT,
                )
            }
            Waited::Cancelled => {
                warn!("shutdown requested; stopping playbook run");
                terminate(&mut child, self.kill_grace).await;
                (RunOutcome::Cancelled, EXIT_TIMEOUT)
            }
        };

        drain(readers).await;
        let captured = capture.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.finish(outcome, exit_code, Some(&*captured), started))
    }

    fn spawn(&self, inventory: &Path, playbook: &Path) -> Result<Child, ProvisionError> {
        let program = self.program().to_string();
        let mut command = Command::new(&program);
        if self.command.len() > 1 {
            command.args(&self.command[1..]);
        }
        command
            .arg("-i")
            .arg(inventory)
            .arg(playbook)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        {
            command.process_group(0);
        }
        command
            .spawn()
            .map_err(|source| ProvisionError::ProcessLaunch { program, source })
    }

    fn finish(
        &self,
        outcome: RunOutcome,
        exit_code: i32,
        capture: Option<&OutputCapture>,
        started: Instant,
    ) -> PlaybookRun {
        let elapsed = started.elapsed();
        let (output, truncated) = capture
            .map(OutputCapture::render_bounded)
            .unwrap_or_default();
        debug!(
            ?outcome,
            exit_code,
            truncated,
            elapsed_ms = elapsed.as_millis() as u64,
            "playbook run finished"
        );
        PlaybookRun {
            outcome,
            exit_code,
            output,
            truncated,
            elapsed,
            program: self.program().to_string(),
        }
    }
}

/// Tees one output stream into the log and the shared capture, line by line.
async fn pump<R>(reader: R, stream: &'static str, capture: Arc<Mutex<OutputCapture>>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = LineBuffer::default();
    loop {
        let chunk = match reader.fill_buf().await {
            Ok(chunk) if chunk.is_empty() => break,
            Ok(chunk) => chunk,
            Err(err) => {
                warn!(stream, error = %err, "failed reading playbook output");
                break;
            }
        };
        let (taken, complete) = line.feed(chunk);
        capture
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(&chunk[..taken]);
        reader.consume(taken);
        if let Some(text) = complete {
            info!(target: "ansible", stream, "{}", text.trim_end());
        }
    }
    if let Some(text) = line.finish() {
        info!(target: "ansible", stream, "{}", text.trim_end());
    }
}

/// Longest slice of output logged as one event; longer lines are split.
const MAX_LOG_LINE: usize = 8 * 1024;

#[derive(Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    /// Takes bytes up to the first newline or until the buffer is full.
    /// Returns how many bytes of `chunk` were taken and the line to log once
    /// one is complete.
    fn feed(&mut self, chunk: &[u8]) -> (usize, Option<String>) {
        let room = MAX_LOG_LINE - self.buf.len();
        let (taken, ends_line) = match chunk.iter().position(|byte| *byte == b'\n') {
            Some(at) if at < room => (at + 1, true),
            _ => (chunk.len().min(room), false),
        };
        self.buf.extend_from_slice(&chunk[..taken]);
        if ends_line || self.buf.len() >= MAX_LOG_LINE {
            (taken, self.finish())
        } else {
            (taken, None)
        }
    }

    fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Some(text)
    }
}

async fn drain(readers: Vec<JoinHandle<()>>) {
    for mut reader in readers {
        if tokio::time::timeout(DRAIN_GRACE, &mut reader).await.is_err() {
            reader.abort();
        }
    }
}

/// SIGTERM to the whole process group, SIGKILL once `grace` runs out.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let group = -(pid as i32);
            let _ = unsafe { libc::kill(group, libc::SIGTERM) };
            if tokio::time::timeout(grace, child.wait()).await.is_err() {
                debug!(pid, "playbook ignored SIGTERM");
            }
            // ansible forks workers; make sure none of them outlive the run.
            let _ = unsafe { libc::kill(group, libc::SIGKILL) };
        }
    }

    if let Err(err) = child.start_kill() {
        debug!(error = %err, "child already exited");
    }
    let _ = child.wait().await;
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    struct Stub {
        dir: TempDir,
    }

    impl Stub {
        fn new(body: &str) -> Self {
            let dir = tempdir().unwrap();
            std::fs::write(dir.path().join("tool.sh"), body).unwrap();
            std::fs::write(dir.path().join("inventory.ini"), "127.0.0.1\n").unwrap();
            std::fs::write(dir.path().join("postgresql.yml"), "- hosts: all\n").unwrap();
            Self { dir }
        }

        fn runner(&self, timeout: Duration, limit: usize) -> PlaybookRunner {
            let script = self.dir.path().join("tool.sh").display().to_string();
            PlaybookRunner::new(vec!["sh".to_string(), script], timeout, limit)
                .with_kill_grace(Duration::from_millis(200))
        }

        fn inventory(&self) -> std::path::PathBuf {
            self.dir.path().join("inventory.ini")
        }

        fn playbook(&self) -> std::path::PathBuf {
            self.dir.path().join("postgresql.yml")
        }
    }

    #[tokio::test]
    async fn successful_run_captures_output() {
        let stub = Stub::new("printf OK\n");
        let run = stub
            .runner(Duration::from_secs(10), 1024)
            .run(&stub.inventory(), &stub.playbook(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(run.succeeded());
        assert_eq!(run.exit_code, 0);
        assert_eq!(run.output, "OK");
        assert!(run.error().is_none());
    }

    #[tokio::test]
    async fn receives_inventory_and_playbook_arguments() {
        let stub = Stub::new("echo \"$1 $2 $3\"\n");
        let run = stub
            .runner(Duration::from_secs(10), 1024)
            .run(&stub.inventory(), &stub.playbook(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            run.output.trim_end(),
            format!(
                "-i {} {}",
                stub.inventory().display(),
                stub.playbook().display()
            )
        );
    }

    #[tokio::test]
    async fn nonzero_exit_keeps_tool_code_and_stderr() {
        let stub = Stub::new("echo failed >&2\nexit 3\n");
        let run = stub
            .runner(Duration::from_secs(10), 1024)
            .run(&stub.inventory(), &stub.playbook(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.outcome, RunOutcome::NonZeroExit { code: 3 });
        assert_eq!(run.exit_code, 3);
        assert!(run.output.contains("failed"));
        assert_eq!(run.error().unwrap().kind(), "process_nonzero_exit");
    }

    #[tokio::test]
    async fn deadline_kills_tool_and_keeps_partial_output() {
        let stub = Stub::new("echo starting\nsleep 30\necho never\n");
        let started = Instant::now();
        let run = stub
            .runner(Duration::from_millis(300), 1024)
            .run(&stub.inventory(), &stub.playbook(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(matches!(run.outcome, RunOutcome::TimedOut { .. }));
        assert_eq!(run.exit_code, EXIT_TIMEOUT);
        assert!(run.output.contains("starting"));
        assert!(!run.output.contains("never"));
        assert_eq!(run.error().unwrap().kind(), "process_timeout");
    }

    #[tokio::test]
    async fn shutdown_cancels_running_tool() {
        let stub = Stub::new("echo working\nsleep 30\n");
        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });
        let run = stub
            .runner(Duration::from_secs(60), 1024)
            .run(&stub.inventory(), &stub.playbook(), &shutdown)
            .await
            .unwrap();
        assert_eq!(run.outcome, RunOutcome::Cancelled);
        assert_eq!(run.exit_code, EXIT_TIMEOUT);
        assert!(!run.succeeded());
        assert_eq!(run.error().unwrap().kind(), "process_cancelled");
    }

    #[tokio::test]
    async fn already_cancelled_never_launches() {
        let stub = Stub::new("echo ran > \"$(dirname \"$0\")/marker\"\n");
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let run = stub
            .runner(Duration::from_secs(10), 1024)
            .run(&stub.inventory(), &stub.playbook(), &shutdown)
            .await
            .unwrap();
        assert_eq!(run.outcome, RunOutcome::Cancelled);
        assert!(!stub.dir.path().join("marker").exists());
    }

    #[tokio::test]
    async fn large_output_is_truncated() {
        let stub = Stub::new("i=0\nwhile [ $i -lt 200 ]; do echo 0123456789; i=$((i+1)); done\n");
        let run = stub
            .runner(Duration::from_secs(10), 100)
            .run(&stub.inventory(), &stub.playbook(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(run.succeeded());
        assert!(run.truncated);
        assert_eq!(
            run.output.len(),
            100 + crate::capture::TRUNCATION_MARKER.len()
        );
    }

    #[tokio::test]
    async fn invalid_utf8_output_stays_within_limit() {
        let stub = Stub::new(
            "i=0\nwhile [ $i -lt 100 ]; do printf '\\377'; i=$((i+1)); done\n",
        );
        let run = stub
            .runner(Duration::from_secs(10), 100)
            .run(&stub.inventory(), &stub.playbook(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(run.succeeded());
        assert!(run.truncated);
        assert!(run.output.len() <= 100 + crate::capture::TRUNCATION_MARKER.len());
        assert!(run.output.ends_with(crate::capture::TRUNCATION_MARKER));
    }

    #[test]
    fn line_buffer_splits_at_newlines() {
        let mut line = LineBuffer::default();
        let (taken, complete) = line.feed(b"ok: [db]\nchanged");
        assert_eq!(taken, 9);
        assert_eq!(complete.as_deref(), Some("ok: [db]\n"));
        let (taken, complete) = line.feed(b"changed");
        assert_eq!(taken, 7);
        assert!(complete.is_none());
        assert_eq!(line.finish().as_deref(), Some("changed"));
        assert!(line.finish().is_none());
    }

    #[test]
    fn line_buffer_never_grows_past_cap() {
        let mut line = LineBuffer::default();
        let chunk = vec![b'x'; 64 * 1024];
        let mut fed = 0;
        let mut emitted = 0;
        while fed < 1024 * 1024 {
            let (taken, complete) = line.feed(&chunk);
            assert!(taken > 0);
            assert!(line.buf.len() <= MAX_LOG_LINE);
            if let Some(text) = complete {
                assert_eq!(text.len(), MAX_LOG_LINE);
                emitted += 1;
            }
            fed += taken;
        }
        assert_eq!(emitted, 1024 * 1024 / MAX_LOG_LINE);
    }

    #[tokio::test]
    async fn long_unterminated_output_is_captured_bounded() {
        let capture = Arc::new(Mutex::new(OutputCapture::new(100)));
        let input = vec![b'y'; 200 * 1024];
        pump(input.as_slice(), "stdout", Arc::clone(&capture)).await;
        let capture = capture.lock().unwrap();
        assert_eq!(capture.total_bytes(), 200 * 1024);
        assert_eq!(
            capture.render().len(),
            100 + crate::capture::TRUNCATION_MARKER.len()
        );
    }

    #[tokio::test]
    async fn missing_playbook_is_not_launched() {
        let stub = Stub::new("exit 0\n");
        let err = stub
            .runner(Duration::from_secs(10), 1024)
            .run(
                &stub.inventory(),
                &stub.dir.path().join("mysql.yml"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "playbook_not_found");
        assert_eq!(err.exit_code(), Some(127));
    }

    #[tokio::test]
    async fn unknown_program_is_a_launch_error() {
        let stub = Stub::new("exit 0\n");
        let runner = PlaybookRunner::new(
            vec!["/nonexistent/ansible-playbook".to_string()],
            Duration::from_secs(10),
            1024,
        );
        let err = runner
            .run(&stub.inventory(), &stub.playbook(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "process_launch_error");
    }
}
