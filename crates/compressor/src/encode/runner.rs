//! Encoder subprocess supervision
//!
//! Spawns one ffmpeg pass, streams its stderr line by line to a callback and
//! enforces cancellation and an overall timeout. ffmpeg redraws its stats line
//! with `\r`, so both `\r` and `\n` end a line.

use crate::config::EncoderConfig;
use log::{debug, warn};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// Default overall time limit for one pass.
pub const DEFAULT_PASS_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

/// Default time a killed encoder gets to exit before we stop waiting.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Default number of trailing diagnostic lines kept for error reports.
pub const DEFAULT_TAIL_LINES: usize = 20;

/// Error type for encoder runs
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Encoder exited with code {code}{}", format_tail(.tail))]
    Failed { code: i32, tail: Vec<String> },

    #[error("Encoder was terminated by a signal{}", format_tail(.tail))]
    Terminated { tail: Vec<String> },

    #[error("Encoder timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Encoding was cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// Trailing stderr lines captured before the failure, if any.
    pub fn diagnostic_tail(&self) -> &[String] {
        match self {
            RunnerError::Failed { tail, .. } | RunnerError::Terminated { tail } => tail,
            _ => &[],
        }
    }
}

fn format_tail(tail: &[String]) -> String {
    match tail.last() {
        Some(last) => format!(": {}", last),
        None => String::new(),
    }
}

/// Result of a pass that exited successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassOutcome {
    pub exit_code: i32,
    /// Number of non-empty diagnostic lines delivered.
    pub lines: usize,
}

/// Bounded ring of the most recent diagnostic lines.
#[derive(Debug)]
struct DiagnosticTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl DiagnosticTail {
    fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, line: &str) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    fn into_vec(self) -> Vec<String> {
        self.lines.into()
    }
}

/// Splits a byte stream into lines ended by `\r` or `\n`.
struct LineSplitter<R> {
    reader: R,
    partial: Vec<u8>,
    ready: VecDeque<String>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> LineSplitter<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            partial: Vec::new(),
            ready: VecDeque::new(),
            eof: false,
        }
    }

    fn finish_line(&mut self) {
        let bytes = std::mem::take(&mut self.partial);
        self.ready
            .push_back(String::from_utf8_lossy(&bytes).into_owned());
    }

    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(line) = self.ready.pop_front() {
                return Ok(Some(line));
            }
            if self.eof {
                return Ok(None);
            }

            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                self.eof = true;
                if !self.partial.is_empty() {
                    self.finish_line();
                }
                continue;
            }
            for &byte in &chunk[..n] {
                if byte == b'\r' || byte == b'\n' {
                    self.finish_line();
                } else {
                    self.partial.push(byte);
                }
            }
        }
    }
}

/// Runs encoder passes for one ffmpeg binary.
#[derive(Debug, Clone)]
pub struct EncoderRunner {
    program: PathBuf,
    prefix_args: Vec<String>,
    timeout: Duration,
    grace: Duration,
    tail_lines: usize,
}

impl EncoderRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
            timeout: DEFAULT_PASS_TIMEOUT,
            grace: DEFAULT_CANCEL_GRACE,
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }

    pub fn from_config(cfg: &EncoderConfig) -> Self {
        Self::new(&cfg.ffmpeg_bin)
            .with_timeout(Duration::from_secs(cfg.encode_timeout_secs))
            .with_grace(Duration::from_secs(cfg.cancel_grace_secs))
            .with_tail_lines(cfg.diagnostic_tail_lines)
    }

    /// Arguments placed before every pass's own arguments, for encoders
    /// reached through a wrapper (`nice`, a container runtime, a shell).
    pub fn with_prefix_args(mut self, args: Vec<String>) -> Self {
        self.prefix_args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_tail_lines(mut self, tail_lines: usize) -> Self {
        self.tail_lines = tail_lines;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Run one pass with `args`, delivering each diagnostic line to `on_line`
    /// in emission order.
    ///
    /// Cancelling `cancel` kills the encoder and waits (up to the grace
    /// period) for it to exit before returning [`RunnerError::Cancelled`].
    pub async fn run_pass<F>(
        &self,
        args: &[String],
        mut on_line: F,
        cancel: &CancellationToken,
    ) -> Result<PassOutcome, RunnerError>
    where
        F: FnMut(&str),
    {
        if cancel.is_cancelled() {
            return Err(RunnerError::Cancelled);
        }

        debug!(
            "Executing encoder: {} {} {}",
            self.program.display(),
            self.prefix_args.join(" "),
            args.join(" ")
        );

        let mut child = Command::new(&self.program)
            .args(&self.prefix_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        let stderr = child.stderr.take().ok_or_else(|| {
            RunnerError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "encoder stderr was not captured",
            ))
        })?;

        let mut stderr_lines = LineSplitter::new(stderr);
        let mut tail = DiagnosticTail::new(self.tail_lines);
        let mut lines = 0usize;

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.terminate(&mut child).await;
                    return Err(RunnerError::Cancelled);
                }
                _ = &mut deadline => {
                    warn!("Encoder exceeded {:?}; killing it", self.timeout);
                    self.terminate(&mut child).await;
                    return Err(RunnerError::TimedOut(self.timeout));
                }
                line = stderr_lines.next_line() => match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        lines += 1;
                        tail.push(line);
                        on_line(line);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        self.terminate(&mut child).await;
                        return Err(RunnerError::Io(e));
                    }
                },
            }
        }

        // stderr closed; the process is exiting or has already exited.
        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.terminate(&mut child).await;
                return Err(RunnerError::Cancelled);
            }
            _ = &mut deadline => {
                self.terminate(&mut child).await;
                return Err(RunnerError::TimedOut(self.timeout));
            }
            status = child.wait() => status?,
        };

        if status.success() {
            return Ok(PassOutcome { exit_code: 0, lines });
        }

        let tail = tail.into_vec();
        match status.code() {
            Some(code) => Err(RunnerError::Failed { code, tail }),
            None => Err(RunnerError::Terminated { tail }),
        }
    }

    async fn terminate(&self, child: &mut Child) {
        if let Err(e) = child.start_kill() {
            debug!("Encoder kill failed (likely already exited): {}", e);
        }
        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(Ok(status)) => debug!("Encoder exited after kill: {}", status),
            Ok(Err(e)) => warn!("Failed to reap encoder: {}", e),
            Err(_) => warn!("Encoder did not exit within {:?} of being killed", self.grace),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    fn shell_runner() -> EncoderRunner {
        EncoderRunner::new("sh").with_grace(Duration::from_secs(2))
    }

    fn script(body: &str) -> Vec<String> {
        vec!["-c".to_string(), body.to_string()]
    }

    #[tokio::test]
    async fn test_lines_split_on_cr_and_lf() {
        let runner = shell_runner();
        let token = CancellationToken::new();
        let mut seen = Vec::new();

        let outcome = runner
            .run_pass(
                &script("printf 'header\\nframe=1 time=00:00:01.00\\rframe=2 time=00:00:02.00\\r\\nlast\\n' >&2"),
                |line| seen.push(line.to_string()),
                &token,
            )
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, 0);
        assert_eq!(
            seen,
            vec![
                "header".to_string(),
                "frame=1 time=00:00:01.00".to_string(),
                "frame=2 time=00:00:02.00".to_string(),
                "last".to_string(),
            ]
        );
        assert_eq!(outcome.lines, 4);
    }

    #[tokio::test]
    async fn test_nonzero_exit_reports_tail() {
        let runner = shell_runner().with_tail_lines(2);
        let token = CancellationToken::new();

        let err = runner
            .run_pass(
                &script("echo one >&2; echo two >&2; echo 'Unknown encoder' >&2; exit 3"),
                |_| {},
                &token,
            )
            .await
            .unwrap_err();

        match &err {
            RunnerError::Failed { code, tail } => {
                assert_eq!(*code, 3);
                assert_eq!(tail, &vec!["two".to_string(), "Unknown encoder".to_string()]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(err.to_string().contains("Unknown encoder"));
        assert_eq!(err.diagnostic_tail().len(), 2);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let runner = EncoderRunner::new("/nonexistent/path/to/ffmpeg");
        let token = CancellationToken::new();
        let err = runner.run_pass(&[], |_| {}, &token).await.unwrap_err();
        assert!(matches!(err, RunnerError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_cancel_kills_encoder() {
        let runner = shell_runner();
        let token = CancellationToken::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let sink = seen.clone();
        let err = runner
            .run_pass(
                &script("echo 'time=00:00:01.00' >&2; exec sleep 30"),
                move |line| sink.lock().unwrap().push(line.to_string()),
                &token,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RunnerError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_already_cancelled_never_spawns() {
        let runner = EncoderRunner::new("/nonexistent/path/to/ffmpeg");
        let token = CancellationToken::new();
        token.cancel();
        let err = runner.run_pass(&[], |_| {}, &token).await.unwrap_err();
        assert!(matches!(err, RunnerError::Cancelled));
    }

    #[tokio::test]
    async fn test_timeout_kills_encoder() {
        let runner = shell_runner().with_timeout(Duration::from_millis(300));
        let token = CancellationToken::new();
        let started = Instant::now();

        let err = runner
            .run_pass(&script("exec sleep 30"), |_| {}, &token)
            .await
            .unwrap_err();

        assert!(matches!(err, RunnerError::TimedOut(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_prefix_args_come_first() {
        let runner = EncoderRunner::new("sh").with_prefix_args(script("echo \"$0 $1\" >&2"));
        let token = CancellationToken::new();
        let mut seen = Vec::new();

        runner
            .run_pass(
                &["first".to_string(), "second".to_string()],
                |line| seen.push(line.to_string()),
                &token,
            )
            .await
            .unwrap();

        assert_eq!(seen, vec!["first second".to_string()]);
    }

    #[test]
    fn test_diagnostic_tail_bounded() {
        let mut tail = DiagnosticTail::new(3);
        for i in 0..10 {
            tail.push(&i.to_string());
        }
        assert_eq!(tail.into_vec(), vec!["7", "8", "9"]);

        let mut empty = DiagnosticTail::new(0);
        empty.push("ignored");
        assert!(empty.into_vec().is_empty());
    }
}
