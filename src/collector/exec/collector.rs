//! Subprocess collector.
//!
//! Runs a command and forwards every non-empty stdout line to the delivery
//! queue verbatim. Lines are validated later by the sender.
//!
//! With a non-zero interval the command is expected to print and exit each
//! pass; the pass always runs to completion. With interval zero it is a
//! long-running process: the pass lasts as long as the process does, and a
//! stop request ends it early.
//!
//! Output lines that are not valid UTF-8 are logged and skipped.

use std::collections::BTreeMap;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::collector::{Collector, CollectorContext, CollectorError, Schedule};
use crate::queue::MetricSink;

/// Exit status a command uses to ask never to be run again.
pub const DISABLE_EXIT_CODE: i32 = 13;

/// Default time between SIGTERM and SIGKILL.
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

fn default_grace_period() -> Duration {
    DEFAULT_GRACE_PERIOD
}

/// Options for a subprocess collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Program to run.
    pub command: String,
    /// Program arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Time between SIGTERM and SIGKILL on shutdown (default: 5s).
    #[serde(default = "default_grace_period", with = "humantime_serde")]
    pub grace_period: Duration,
}

impl ExecConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn validate(&self) -> Result<(), CollectorError> {
        if self.command.trim().is_empty() {
            return Err(CollectorError::Config("exec command must not be empty".into()));
        }
        Ok(())
    }
}

/// Collector backed by an external command.
pub struct ExecCollector {
    name: String,
    config: ExecConfig,
    sink: MetricSink,
    stop: CancellationToken,
    schedule: Schedule,
    child: Option<Child>,
}

impl ExecCollector {
    /// Defaults to [`Schedule::Continuous`].
    pub fn new(
        name: impl Into<String>,
        config: ExecConfig,
        sink: MetricSink,
        stop: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            sink,
            stop,
            schedule: Schedule::Continuous,
            child: None,
        }
    }

    /// Only continuous collectors end a pass early on stop.
    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Registry constructor.
    pub fn from_context(ctx: CollectorContext) -> Result<Box<dyn Collector>, CollectorError> {
        let config: ExecConfig = ctx.options()?;
        config.validate()?;
        let name = ctx.name().to_string();
        let schedule = ctx.schedule();
        Ok(Box::new(
            Self::new(name, config, ctx.sink, ctx.stop).with_schedule(schedule),
        ))
    }

    fn spawn(&self) -> Result<Child, CollectorError> {
        let child = Command::new(&self.config.command)
            .args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        tracing::debug!(command = %self.config.command, pid = ?child.id(), "Spawned collector process");
        Ok(child)
    }

    /// Stop the running process: SIGTERM, then SIGKILL after the grace period.
    async fn terminate(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }

        let grace = self.config.grace_period;
        if !send_terminate(&mut child) {
            tracing::debug!("Collector process already gone");
        }
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(%status, "Collector process exited after SIGTERM");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Failed to wait for collector process");
            }
            Err(_) => {
                tracing::warn!(
                    grace_ms = grace.as_millis(),
                    "Collector process ignored SIGTERM, sending SIGKILL"
                );
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "Failed to kill collector process");
                }
            }
        }
    }

    fn forward(&self, raw: Vec<u8>) {
        match String::from_utf8(raw) {
            Ok(line) => {
                let line = line.trim();
                if !line.is_empty() {
                    self.sink.put(line);
                }
            }
            Err(e) => {
                tracing::warn!(
                    line = %String::from_utf8_lossy(e.as_bytes()),
                    "Skipping collector output that is not valid UTF-8"
                );
            }
        }
    }

    fn check_status(&self, status: ExitStatus) -> Result<(), CollectorError> {
        match status.code() {
            Some(0) => Ok(()),
            Some(DISABLE_EXIT_CODE) => Err(CollectorError::PermanentlyDisabled(format!(
                "'{}' exited with status {}",
                self.config.command, DISABLE_EXIT_CODE
            ))),
            Some(code) => Err(CollectorError::Failed(format!(
                "'{}' exited with status {code}",
                self.config.command
            ))),
            None => Err(CollectorError::Failed(format!(
                "'{}' was terminated by a signal",
                self.config.command
            ))),
        }
    }
}

impl std::fmt::Debug for ExecCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecCollector")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("schedule", &self.schedule)
            .field("pid", &self.child.as_ref().and_then(Child::id))
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Collector for ExecCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn collect(&mut self) -> Result<(), CollectorError> {
        // Leftover from a pass that failed mid-read.
        self.terminate().await;

        let mut child = self.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CollectorError::Failed("stdout not captured".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr).instrument(tracing::Span::current()));
        }
        self.child = Some(child);

        let watch_stop = self.schedule == Schedule::Continuous;
        let stop = self.stop.clone();
        let mut segments = BufReader::new(stdout).split(b'\n');
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled(), if watch_stop => return Ok(()),
                segment = segments.next_segment() => match segment? {
                    Some(raw) => self.forward(raw),
                    None => break,
                },
            }
        }

        let status = match self.child.as_mut() {
            Some(child) => tokio::select! {
                biased;
                _ = stop.cancelled(), if watch_stop => return Ok(()),
                status = child.wait() => status?,
            },
            None => return Ok(()),
        };
        self.child = None;
        self.check_status(status)
    }

    async fn close(&mut self) {
        self.terminate().await;
    }
}

async fn forward_stderr<R: AsyncRead + Unpin>(stderr: R) {
    let mut segments = BufReader::new(stderr).split(b'\n');
    while let Ok(Some(raw)) = segments.next_segment().await {
        let line = String::from_utf8_lossy(&raw);
        tracing::warn!(stderr = %line.trim_end(), "Collector process wrote to stderr");
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return false;
    };
    #[allow(clippy::cast_possible_wrap)]
    let target = Pid::from_raw(pid as i32);
    kill(target, Signal::SIGTERM).is_ok()
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) -> bool {
    child.start_kill().is_ok()
}
