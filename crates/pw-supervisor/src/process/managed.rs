//! Supervised process lifecycle
//!
//! A [`ManagedProcess`] owns one logical process role. Starting it launches
//! the OS process and spawns a supervision task that copies output to the
//! configured sinks, relaunches the process whenever it exits on its own,
//! and terminates it (SIGTERM, then SIGKILL after the grace period) when
//! [`ManagedProcess::stop`] is called or the supervision context is
//! cancelled.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use pw_core::config::ProcessConfig;

use super::launcher::{ChildProcess, ExitInfo, LaunchSpec, OutputStream, ProcessLauncher, StopSignal};
use super::sink::OutputSink;
use super::ProcessError;

/// Timing knobs for supervision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisionOptions {
    /// Time between SIGTERM and SIGKILL
    pub grace_period: Duration,
    /// Pause before relaunching after an unexpected exit
    pub restart_delay: Duration,
    /// How long output may keep flowing after the process exited
    pub drain_timeout: Duration,
}

impl Default for SupervisionOptions {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            restart_delay: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(2),
        }
    }
}

impl From<&ProcessConfig> for SupervisionOptions {
    fn from(config: &ProcessConfig) -> Self {
        Self {
            grace_period: config.grace_period,
            restart_delay: config.restart_delay,
            ..Self::default()
        }
    }
}

/// Lifecycle state of a managed process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running,
    /// Exited on its own; a relaunch is pending
    Exited,
    /// Stopped explicitly
    Stopped,
    /// Supervision context was cancelled
    Cancelled,
    /// Launch or relaunch failed; supervision is over
    StartFailed,
}

impl ProcessState {
    /// No further launches will happen
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Cancelled | Self::StartFailed)
    }
}

/// Observable status of a managed process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessStatus {
    pub state: ProcessState,
    pub pid: Option<u32>,
    /// Successful launches so far, including relaunches
    pub launches: u32,
    pub last_exit: Option<ExitInfo>,
}

impl Default for ProcessStatus {
    fn default() -> Self {
        Self {
            state: ProcessState::NotStarted,
            pid: None,
            launches: 0,
            last_exit: None,
        }
    }
}

/// Why supervision ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Stopped,
    Cancelled,
}

impl Termination {
    fn state(self) -> ProcessState {
        match self {
            Self::Stopped => ProcessState::Stopped,
            Self::Cancelled => ProcessState::Cancelled,
        }
    }
}

/// Requests a stop from outside the task driving the process
#[derive(Debug, Clone)]
pub struct StopHandle(CancellationToken);

impl StopHandle {
    pub fn stop(&self) {
        self.0.cancel();
    }
}

/// One supervised process role
pub struct ManagedProcess {
    name: String,
    spec: LaunchSpec,
    launcher: Arc<dyn ProcessLauncher>,
    sinks: Vec<Arc<dyn OutputSink>>,
    options: SupervisionOptions,
    status: Arc<watch::Sender<ProcessStatus>>,
    stop: CancellationToken,
    task: Option<JoinHandle<Result<Termination, ProcessError>>>,
}

impl ManagedProcess {
    pub fn new(name: impl Into<String>, spec: LaunchSpec, launcher: Arc<dyn ProcessLauncher>) -> Self {
        let (status, _) = watch::channel(ProcessStatus::default());
        Self {
            name: name.into(),
            spec,
            launcher,
            sinks: Vec::new(),
            options: SupervisionOptions::default(),
            status: Arc::new(status),
            stop: CancellationToken::new(),
            task: None,
        }
    }

    pub fn with_options(mut self, options: SupervisionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Run the process as the given OS user and group
    ///
    /// Only affects launches after the next [`start`](Self::start).
    pub fn set_credentials(&mut self, uid: u32, gid: u32) {
        if self.task.is_some() {
            warn!("Credentials for {} changed after start; ignored", self.name);
            return;
        }
        self.spec.credentials = Some((uid, gid));
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ProcessStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProcessStatus> {
        self.status.subscribe()
    }

    /// OS pid of the current instance
    pub fn pid(&self) -> Option<u32> {
        self.status.borrow().pid
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stop.clone())
    }

    /// Launch the process and supervise it in a background task
    ///
    /// Launch errors are returned directly; the process is not retried.
    pub fn start(&mut self, cancel: &CancellationToken) -> Result<(), ProcessError> {
        let supervision = self.prepare()?;
        let first = supervision.launch(cancel)?;

        let stop = self.stop.clone();
        let cancel = cancel.clone();
        self.task = Some(tokio::spawn(supervision.supervise(first, stop, cancel)));
        Ok(())
    }

    /// Launch the process and supervise it on the current task
    ///
    /// Returns once a stop is requested through a [`StopHandle`], `cancel`
    /// fires, or a relaunch fails.
    pub async fn execute_and_restart(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Termination, ProcessError> {
        let supervision = self.prepare()?;
        let first = supervision.launch(cancel)?;
        supervision
            .supervise(first, self.stop.clone(), cancel.clone())
            .await
    }

    /// Stop the process and wait until it has exited
    ///
    /// Safe to call more than once and on a process that never started.
    pub async fn stop(&mut self) {
        self.stop.cancel();

        let Some(task) = self.task.take() else {
            self.status.send_if_modified(|status| {
                if status.state == ProcessState::NotStarted {
                    status.state = ProcessState::Stopped;
                    true
                } else {
                    false
                }
            });
            return;
        };

        match task.await {
            Ok(Ok(termination)) => debug!("Supervision of {} ended: {:?}", self.name, termination),
            Ok(Err(e)) => debug!("Supervision of {} ended early: {}", self.name, e),
            Err(e) => error!("Supervisor task for {} failed: {}", self.name, e),
        }
    }

    fn prepare(&self) -> Result<Arc<Supervision>, ProcessError> {
        if self.task.is_some() || self.status.borrow().state != ProcessState::NotStarted {
            return Err(ProcessError::AlreadyStarted(self.name.clone()));
        }

        Ok(Arc::new(Supervision {
            name: Arc::from(self.name.as_str()),
            spec: self.spec.clone(),
            launcher: self.launcher.clone(),
            sinks: Arc::from(self.sinks.clone()),
            options: self.options.clone(),
            status: self.status.clone(),
        }))
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        // The supervision task terminates the child on its own
        self.stop.cancel();
    }
}

/// Supervision state shared with the background task
struct Supervision {
    name: Arc<str>,
    spec: LaunchSpec,
    launcher: Arc<dyn ProcessLauncher>,
    sinks: Arc<[Arc<dyn OutputSink>]>,
    options: SupervisionOptions,
    status: Arc<watch::Sender<ProcessStatus>>,
}

/// A live OS process and the tasks copying its output
struct RunningChild {
    child: Box<dyn ChildProcess>,
    pid: Option<u32>,
    streams: Vec<JoinHandle<()>>,
    quiesce: CancellationToken,
}

impl Supervision {
    fn launch(&self, cancel: &CancellationToken) -> Result<RunningChild, ProcessError> {
        let mut child = match self.launcher.launch(&self.spec) {
            Ok(child) => child,
            Err(e) => {
                self.status.send_modify(|status| {
                    status.state = ProcessState::StartFailed;
                    status.pid = None;
                });
                return Err(e);
            }
        };

        let pid = child.id();
        let quiesce = cancel.child_token();
        let mut streams = Vec::with_capacity(2);
        for (stream, output) in [("stdout", child.take_stdout()), ("stderr", child.take_stderr())] {
            if let Some(output) = output {
                streams.push(tokio::spawn(copy_lines(
                    self.name.clone(),
                    stream,
                    output,
                    self.sinks.clone(),
                    quiesce.clone(),
                )));
            }
        }

        self.status.send_modify(|status| {
            status.state = ProcessState::Running;
            status.pid = pid;
            status.launches += 1;
        });
        info!("Started {} (pid {})", self.name, display_pid(pid));

        Ok(RunningChild {
            child,
            pid,
            streams,
            quiesce,
        })
    }

    async fn supervise(
        self: Arc<Self>,
        mut running: RunningChild,
        stop: CancellationToken,
        cancel: CancellationToken,
    ) -> Result<Termination, ProcessError> {
        loop {
            let exit = tokio::select! {
                biased;
                _ = stop.cancelled() => return Ok(self.shut_down(running, Termination::Stopped).await),
                _ = cancel.cancelled() => return Ok(self.shut_down(running, Termination::Cancelled).await),
                exit = running.child.wait() => exit,
            };
            self.reap(running, exit).await;

            info!(
                "{} exited unexpectedly; restarting in {:?}",
                self.name, self.options.restart_delay
            );
            tokio::select! {
                biased;
                _ = stop.cancelled() => return Ok(self.finish(Termination::Stopped)),
                _ = cancel.cancelled() => return Ok(self.finish(Termination::Cancelled)),
                _ = tokio::time::sleep(self.options.restart_delay) => {}
            }

            running = match self.launch(&cancel) {
                Ok(running) => running,
                Err(e) => {
                    error!("Failed to relaunch {}: {}", self.name, e);
                    return Err(e);
                }
            };
        }
    }

    async fn shut_down(&self, running: RunningChild, termination: Termination) -> Termination {
        self.terminate(running).await;
        self.finish(termination)
    }

    fn finish(&self, termination: Termination) -> Termination {
        self.status
            .send_modify(|status| status.state = termination.state());
        termination
    }

    /// SIGTERM, then SIGKILL once the grace period runs out
    async fn terminate(&self, mut running: RunningChild) {
        if let Ok(Some(exit)) = running.child.try_wait() {
            self.reap(running, Ok(exit)).await;
            return;
        }

        info!("Stopping {} (pid {})", self.name, display_pid(running.pid));
        if let Err(e) = running.child.signal(StopSignal::Terminate) {
            warn!("Failed to signal {}: {}", self.name, e);
        }

        let graceful = tokio::time::timeout(self.options.grace_period, running.child.wait()).await;
        let exit = match graceful {
            Ok(exit) => exit,
            Err(_) => {
                warn!(
                    "{} did not exit within {:?}; killing",
                    self.name, self.options.grace_period
                );
                if let Err(e) = running.child.signal(StopSignal::Kill) {
                    warn!("Failed to kill {}: {}", self.name, e);
                }
                running.child.wait().await
            }
        };

        self.reap(running, exit).await;
    }

    /// Drain output of an exited child and record how it ended
    async fn reap(&self, running: RunningChild, exit: io::Result<ExitInfo>) {
        let RunningChild {
            child,
            pid,
            streams,
            quiesce,
        } = running;
        drop(child);

        let drained = futures::future::join_all(streams);
        tokio::pin!(drained);
        if tokio::time::timeout(self.options.drain_timeout, &mut drained)
            .await
            .is_err()
        {
            debug!("Output of {} still open after exit; detaching", self.name);
            quiesce.cancel();
            drained.await;
        }

        let last_exit = match exit {
            Ok(info) => {
                info!("{} (pid {}) exited with {}", self.name, display_pid(pid), info);
                Some(info)
            }
            Err(e) => {
                warn!("Failed to wait for {}: {}", self.name, e);
                None
            }
        };

        self.status.send_modify(|status| {
            status.state = ProcessState::Exited;
            status.pid = None;
            status.last_exit = last_exit;
        });
    }
}

fn display_pid(pid: Option<u32>) -> String {
    pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string())
}

/// Copy complete lines from one output stream to every sink
/// Longest line handed to the sinks in one piece
pub const MAX_LINE_BYTES: usize = 64 * 1024;

async fn copy_lines(
    process: Arc<str>,
    stream: &'static str,
    output: OutputStream,
    sinks: Arc<[Arc<dyn OutputSink>]>,
    quiesce: CancellationToken,
) {
    let mut reader = BufReader::new(output);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        // Output without newlines is emitted in chunks of at most MAX_LINE_BYTES
        let mut limited = (&mut reader).take(MAX_LINE_BYTES as u64);
        let read = tokio::select! {
            _ = quiesce.cancelled() => break,
            read = limited.read_until(b'\n', &mut buf) => read,
        };

        match read {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(trim_line_ending(&buf));
                for sink in sinks.iter() {
                    sink.write_line(&process, &line);
                }
            }
            Err(e) => {
                warn!("Error reading {} of {}: {}", stream, process, e);
                break;
            }
        }
    }
}

fn trim_line_ending(buf: &[u8]) -> &[u8] {
    let buf = buf.strip_suffix(b"\n").unwrap_or(buf);
    buf.strip_suffix(b"\r").unwrap_or(buf)
}
