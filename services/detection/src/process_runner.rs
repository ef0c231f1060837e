//! Launches the external detector and collects what it prints.
//!
//! Standard output and standard error are drained concurrently into separate
//! buffers. Both buffers are decoded only after the child has exited and both
//! pipes reached end-of-file, so callers never observe partial output.

use crate::config::DetectorConfig;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

/// Errors that prevent a detector run from producing an outcome.
///
/// A non-zero exit is not an error here; it is reported through
/// [`ProcessOutcome::exit_code`].
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to start {program}: {source}")]
    Start {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("detector timed out after {limit:?}")]
    Timeout { limit: Duration },

    #[error("failed to collect detector output: {0}")]
    Io(#[source] io::Error),
}

/// Result of one finished detector run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// Exit code, `-1` when the child was terminated by a signal
    pub exit_code: i32,
    pub stdout_text: String,
    pub stderr_text: String,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs the configured detector program.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new(config: &DetectorConfig) -> Self {
        info!(
            program = %config.program,
            args = ?config.args,
            timeout_secs = config.timeout_secs,
            "Process runner initialized"
        );

        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            working_dir: config.working_dir.clone(),
            timeout: config.timeout(),
        }
    }

    /// Run the detector against `image_arg` and wait for it to exit.
    #[instrument(skip(self), fields(program = %self.program))]
    pub async fn run(&self, image_arg: &str) -> Result<ProcessOutcome, RunnerError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(image_arg)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| RunnerError::Start {
            program: self.program.clone(),
            source,
        })?;

        debug!(pid = ?child.id(), "Detector started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let collect = async {
            let (stdout, stderr, status) =
                tokio::join!(drain(stdout), drain(stderr), child.wait());
            Ok::<_, io::Error>((stdout?, stderr?, status?))
        };

        let collected = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, collect).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(limit = ?limit, "Detector exceeded run limit, killing it");
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "Failed to kill detector");
                    }
                    return Err(RunnerError::Timeout { limit });
                }
            },
            None => collect.await,
        };

        let (stdout, stderr, status) = collected.map_err(RunnerError::Io)?;

        let outcome = ProcessOutcome {
            exit_code: status.code().unwrap_or(-1),
            stdout_text: String::from_utf8_lossy(&stdout).into_owned(),
            stderr_text: String::from_utf8_lossy(&stderr).into_owned(),
        };

        debug!(
            exit_code = outcome.exit_code,
            stdout_bytes = stdout.len(),
            stderr_bytes = stderr.len(),
            "Detector exited"
        );

        Ok(outcome)
    }
}

/// Read a child pipe to end-of-file
async fn drain<R>(pipe: Option<R>) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell_runner(script: &str, timeout_secs: u64) -> ProcessRunner {
        ProcessRunner::new(&DetectorConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "detector".to_string()],
            working_dir: None,
            timeout_secs,
            max_concurrent_jobs: 1,
        })
    }

    #[tokio::test]
    async fn test_collects_both_streams() {
        let runner = shell_runner(
            r#"echo "image: $1"; echo "warming up" >&2; echo "Detected 2 objects""#,
            10,
        );

        let outcome = runner.run("/tmp/uploads/ab12.jpg").await.unwrap();

        assert!(outcome.success());
        assert_eq!(
            outcome.stdout_text,
            "image: /tmp/uploads/ab12.jpg\nDetected 2 objects\n"
        );
        assert_eq!(outcome.stderr_text, "warming up\n");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_an_outcome() {
        let runner = shell_runner("echo 'model weights missing' >&2; exit 3", 10);

        let outcome = runner.run("img.png").await.unwrap();

        assert!(!outcome.success());
        assert_eq!(outcome.exit_code, 3);
        assert_eq!(outcome.stderr_text.trim(), "model weights missing");
    }

    #[tokio::test]
    async fn test_missing_program_is_start_failure() {
        let runner = ProcessRunner::new(&DetectorConfig {
            program: "/nonexistent/detector-binary".to_string(),
            args: vec![],
            working_dir: None,
            timeout_secs: 10,
            max_concurrent_jobs: 1,
        });

        let err = runner.run("img.png").await.unwrap_err();
        assert!(matches!(err, RunnerError::Start { .. }));
    }

    #[tokio::test]
    async fn test_hung_detector_is_killed() {
        let runner = shell_runner("sleep 30", 1);

        let started = std::time::Instant::now();
        let err = runner.run("img.png").await.unwrap_err();

        assert!(matches!(err, RunnerError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_large_output_does_not_deadlock() {
        // Larger than a pipe buffer on both streams
        let runner = shell_runner(
            "i=0; while [ $i -lt 20000 ]; do echo line-$i; echo err-$i >&2; i=$((i+1)); done",
            30,
        );

        let outcome = runner.run("img.png").await.unwrap();

        assert_eq!(outcome.stdout_text.lines().count(), 20000);
        assert_eq!(outcome.stderr_text.lines().count(), 20000);
        assert_eq!(outcome.stdout_text.lines().last(), Some("line-19999"));
    }
}
