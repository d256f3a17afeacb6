//! Subprocess supervision: merged output streaming and readiness detection.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::provision::CommandOutput;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// How subprocess output is echoed to the log.
#[derive(Debug, Clone)]
pub struct StreamLog {
    pub label: String,
    pub enabled: bool,
}

impl StreamLog {
    pub fn new(label: impl Into<String>, enabled: bool) -> Self {
        Self {
            label: label.into(),
            enabled,
        }
    }

    fn chunk(&self, stream: StreamKind, chunk: &str) {
        if !self.enabled {
            return;
        }
        for line in chunk.lines().filter(|l| !l.is_empty()) {
            tracing::info!("[{}][{}] {}", self.label, stream.as_str(), line);
        }
    }
}

/// Which buffer output currently goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Preamble,
    Recording,
}

/// Two-state output accumulator.
///
/// Starts in `Preamble`. The only transition is to `Recording`, taken the
/// first time the trigger predicate accepts a chunk; that chunk itself stays
/// in the preamble.
#[derive(Debug)]
pub struct OutputRecorder {
    mode: OutputMode,
    preamble: String,
    recorded: String,
}

impl Default for OutputRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputRecorder {
    pub fn new() -> Self {
        Self {
            mode: OutputMode::Preamble,
            preamble: String::new(),
            recorded: String::new(),
        }
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    /// Feed one chunk. Returns `true` only for the chunk that caused the transition.
    pub fn feed<F>(&mut self, chunk: &str, trigger: &mut F) -> bool
    where
        F: FnMut(&str) -> bool + ?Sized,
    {
        match self.mode {
            OutputMode::Recording => {
                self.recorded.push_str(chunk);
                false
            }
            OutputMode::Preamble => {
                self.preamble.push_str(chunk);
                if trigger(chunk) {
                    self.mode = OutputMode::Recording;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Append text that did not come from the process (spawn errors, timeouts).
    pub fn note(&mut self, text: &str) {
        match self.mode {
            OutputMode::Preamble => self.preamble.push_str(text),
            OutputMode::Recording => self.recorded.push_str(text),
        }
    }

    /// Recorded output, or the preamble if the trigger never fired.
    pub fn into_output(self) -> String {
        match self.mode {
            OutputMode::Recording => self.recorded,
            OutputMode::Preamble => self.preamble,
        }
    }
}

/// Result of a supervised run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub output: String,
    pub triggered: bool,
    pub timed_out: bool,
    /// Set when the run was stopped through the abort channel
    pub aborted: bool,
}

/// Why supervision stopped waiting on the process.
enum Stop {
    Exited,
    TimedOut,
    Aborted(String),
}

/// Resolves with the first abort reason; never resolves without a channel.
async fn abort_requested(abort: Option<mpsc::UnboundedReceiver<String>>) -> String {
    if let Some(mut rx) = abort {
        if let Some(reason) = rx.recv().await {
            return reason;
        }
    }
    std::future::pending().await
}

fn forward_lines<R>(reader: R, stream: StreamKind, tx: mpsc::UnboundedSender<(StreamKind, String)>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let chunk = String::from_utf8_lossy(&buf).into_owned();
                    if tx.send((stream, chunk)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("Failed to read {}: {}", stream.as_str(), e);
                    break;
                }
            }
        }
    });
}

/// Run `cmd`, merging stdout and stderr, and switch to recording once
/// `trigger` accepts a chunk.
///
/// Spawn failures are reported in the output text rather than as an error,
/// so the caller always gets something back. A non-zero exit code is returned
/// as-is. A reason received on `abort` kills the process like a timeout does
/// and is appended to the output.
pub async fn run_and_trigger<F>(
    mut cmd: Command,
    log: &StreamLog,
    timeout: Option<Duration>,
    abort: Option<mpsc::UnboundedReceiver<String>>,
    mut trigger: F,
) -> ProcessOutput
where
    F: FnMut(&str) -> bool,
{
    let mut recorder = OutputRecorder::new();

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::error!(label = %log.label, "Failed to spawn process: {}", e);
            recorder.note(&e.to_string());
            return ProcessOutput {
                exit_code: -1,
                output: recorder.into_output(),
                triggered: false,
                timed_out: false,
                aborted: false,
            };
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        forward_lines(stdout, StreamKind::Stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(stderr, StreamKind::Stderr, tx.clone());
    }
    drop(tx);

    let mut triggered = false;
    let drain = async {
        while let Some((stream, chunk)) = rx.recv().await {
            log.chunk(stream, &chunk);
            if recorder.feed(&chunk, &mut trigger) {
                triggered = true;
            }
        }
    };
    let supervised = async {
        tokio::select! {
            _ = drain => Stop::Exited,
            reason = abort_requested(abort) => Stop::Aborted(reason),
        }
    };

    let stop = match timeout {
        Some(limit) => tokio::time::timeout(limit, supervised)
            .await
            .unwrap_or(Stop::TimedOut),
        None => supervised.await,
    };

    let note = match &stop {
        Stop::Exited => None,
        Stop::TimedOut => {
            let secs = timeout.map(|t| t.as_secs()).unwrap_or_default();
            tracing::warn!(label = %log.label, "Process timed out after {}s, killing it", secs);
            Some(format!("\nExecution timed out after {}s\n", secs))
        }
        Stop::Aborted(reason) => {
            tracing::warn!(label = %log.label, "Run aborted, killing process: {}", reason);
            Some(format!("\n{}\n", reason))
        }
    };
    if let Some(note) = note {
        if let Err(e) = child.kill().await {
            tracing::warn!(label = %log.label, "Failed to kill process: {}", e);
        }
        recorder.note(&note);
    }

    let exit_code = match child.wait().await {
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => {
            tracing::error!(label = %log.label, "Failed to wait for process: {}", e);
            recorder.note(&e.to_string());
            -1
        }
    };

    ProcessOutput {
        exit_code,
        output: recorder.into_output(),
        triggered,
        timed_out: matches!(stop, Stop::TimedOut),
        aborted: matches!(stop, Stop::Aborted(_)),
    }
}

/// Run `cmd` to completion and capture its merged output.
pub async fn run_command(cmd: Command, log: &StreamLog) -> std::io::Result<CommandOutput> {
    let mut cmd = cmd;
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd.spawn()?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        forward_lines(stdout, StreamKind::Stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(stderr, StreamKind::Stderr, tx.clone());
    }
    drop(tx);

    let mut output = String::new();
    while let Some((stream, chunk)) = rx.recv().await {
        log.chunk(stream, &chunk);
        output.push_str(&chunk);
    }

    let status = child.wait().await?;
    Ok(CommandOutput {
        exit_code: status.code().unwrap_or(-1),
        output,
    })
}
