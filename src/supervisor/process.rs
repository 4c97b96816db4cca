//! Process management for tunnel executables
//!
//! Handles spawning, output capture, exit tracking and grace-then-force
//! termination of a single child process.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use super::stream::spawn_reader;
use crate::error::{Result, TunnelError};

/// Buffered output events before readers apply backpressure
const EVENT_BUFFER: usize = 256;
/// How long the exit watcher waits for readers to flush after exit
const READER_DRAIN: Duration = Duration::from_millis(250);
/// Upper bound on waiting for the OS to reap a force-killed child
const FORCE_KILL_WAIT: Duration = Duration::from_secs(5);

/// Command line for a supervised process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
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
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Program name for log lines and error messages
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }
}

/// Which pipe a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSource {
    Stdout,
    Stderr,
}

/// One line of child output, without its line terminator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub source: OutputSource,
    pub text: String,
}

/// How a process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, `None` when terminated by a signal
    pub code: Option<i32>,
    /// Set when waiting on the process itself failed
    pub error: Option<String>,
}

impl ExitInfo {
    pub fn describe(&self) -> String {
        match (&self.error, self.code) {
            (Some(e), _) => format!("wait failed: {}", e),
            (None, Some(code)) => format!("exit code {}", code),
            (None, None) => "terminated by signal".to_string(),
        }
    }
}

/// Events delivered by a supervised process, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Line(OutputLine),
    IoError(String),
    /// Always the last event; sent after both readers finished (or timed out)
    Exited(ExitInfo),
}

/// Requests handled by the task that owns the `Child`.
///
/// Only that task signals the pid, and only until it has reaped the
/// child, so a recycled pid is never signalled.
enum Control {
    /// SIGTERM; replies whether the signal was delivered
    Terminate(oneshot::Sender<bool>),
    Kill,
}

/// A running child process owned by exactly one caller
pub struct SupervisedProcess {
    program: String,
    pid: Option<u32>,
    events: mpsc::Receiver<ProcessEvent>,
    exit: watch::Receiver<Option<ExitInfo>>,
    /// Cleared as soon as the child is reaped, before output is drained
    running: Arc<AtomicBool>,
    control: mpsc::Sender<Control>,
    readers: Vec<AbortHandle>,
    drain: Option<JoinHandle<()>>,
}

impl SupervisedProcess {
    /// Spawn `spec` with captured stdout/stderr.
    ///
    /// Fails with [`TunnelError::Spawn`] when the executable is missing or
    /// cannot be launched.
    pub fn spawn(spec: &CommandSpec) -> Result<Self> {
        let program = spec.program_name();

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref dir) = spec.current_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| TunnelError::Spawn {
            program: program.clone(),
            message: e.to_string(),
            remediation: None,
        })?;

        let pid = child.id();
        info!(program = %program, pid = ?pid, "Spawned tunnel process");

        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, OutputSource::Stdout, event_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, OutputSource::Stderr, event_tx.clone()));
        }
        let reader_aborts = readers.iter().map(|h| h.abort_handle()).collect();

        let (exit_tx, exit_rx) = watch::channel(None);
        let (control_tx, control_rx) = mpsc::channel(4);
        let running = Arc::new(AtomicBool::new(true));

        tokio::spawn(watch_exit(
            child,
            readers,
            event_tx,
            exit_tx,
            control_rx,
            running.clone(),
            program.clone(),
        ));

        Ok(Self {
            program,
            pid,
            events: event_rx,
            exit: exit_rx,
            running,
            control: control_tx,
            readers: reader_aborts,
            drain: None,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Next output/exit event; `None` once the process was killed or drained
    pub async fn next_event(&mut self) -> Option<ProcessEvent> {
        self.events.recv().await
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit.borrow().clone()
    }

    /// False once the child has been reaped, even while its output is
    /// still being drained
    pub fn is_alive(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Wait until the process has exited
    pub async fn wait_exit(&self) -> ExitInfo {
        let mut rx = self.exit.clone();
        match rx.wait_for(|info| info.is_some()).await {
            Ok(info) => info.clone().unwrap_or(ExitInfo {
                code: None,
                error: None,
            }),
            // Watcher task is gone (runtime shutting down); nothing left to wait on
            Err(_) => ExitInfo {
                code: None,
                error: Some("exit watcher stopped".into()),
            },
        }
    }

    /// Keep consuming output in the background once nobody reads it.
    ///
    /// `on_exit` runs if the process exits on its own. It does not run for
    /// exits caused by [`kill`](Self::kill).
    pub fn drain_in_background<F>(&mut self, on_exit: F)
    where
        F: FnOnce(ExitInfo) + Send + 'static,
    {
        if self.drain.is_some() {
            return;
        }
        let (_, closed) = mpsc::channel(1);
        let mut events = std::mem::replace(&mut self.events, closed);
        let program = self.program.clone();

        self.drain = Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ProcessEvent::Line(_) => {}
                    ProcessEvent::IoError(e) => warn!(program = %program, error = %e, "Output error"),
                    ProcessEvent::Exited(info) => {
                        warn!(program = %program, status = %info.describe(), "Tunnel process exited");
                        on_exit(info);
                        break;
                    }
                }
            }
        }));
    }

    /// Terminate the process: SIGTERM, then force kill after `grace`.
    ///
    /// Safe to call repeatedly and on an already exited process. When this
    /// returns the process is gone and no further events are delivered.
    pub async fn kill(&mut self, grace: Duration) {
        if let Some(drain) = self.drain.take() {
            drain.abort();
        }

        if self.is_alive() {
            let graceful = self.request_terminate().await;
            let exited = graceful && tokio::time::timeout(grace, self.wait_exit()).await.is_ok();

            if !exited {
                debug!(program = %self.program, pid = ?self.pid, "Grace period elapsed, force killing");
                let _ = self.control.send(Control::Kill).await;
                if tokio::time::timeout(FORCE_KILL_WAIT, self.wait_exit())
                    .await
                    .is_err()
                {
                    warn!(program = %self.program, pid = ?self.pid, "Process did not exit after force kill");
                }
            }
        }

        self.detach();
    }

    async fn request_terminate(&self) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.control.send(Control::Terminate(reply_tx)).await.is_err() {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    fn detach(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
        self.events.close();
        while self.events.try_recv().is_ok() {}
    }
}

impl Drop for SupervisedProcess {
    fn drop(&mut self) {
        if let Some(drain) = self.drain.take() {
            drain.abort();
        }
        if self.is_alive() {
            warn!(program = %self.program, pid = ?self.pid, "SupervisedProcess dropped while still running, killing child process");
            let _ = self.control.try_send(Control::Kill);
        }
        for reader in &self.readers {
            reader.abort();
        }
    }
}

/// Owns the child: handles signal requests until it exits, then publishes
/// the exit
async fn watch_exit(
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    events: mpsc::Sender<ProcessEvent>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    mut control: mpsc::Receiver<Control>,
    running: Arc<AtomicBool>,
    program: String,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(request) = control.recv() => match request {
                Control::Terminate(reply) => {
                    // `id()` is None once the child has been reaped
                    let sent = child.id().is_some_and(signal_terminate);
                    let _ = reply.send(sent);
                }
                Control::Kill => {
                    if let Err(e) = child.start_kill() {
                        warn!(program = %program, error = %e, "Failed to kill process");
                    }
                    break child.wait().await;
                }
            },
        }
    };
    running.store(false, Ordering::SeqCst);

    let info = match status {
        Ok(status) => ExitInfo {
            code: status.code(),
            error: None,
        },
        Err(e) => ExitInfo {
            code: None,
            error: Some(e.to_string()),
        },
    };

    // Let readers flush what the process printed right before exiting
    let _ = tokio::time::timeout(READER_DRAIN, futures::future::join_all(readers)).await;

    debug!(program = %program, status = %info.describe(), "Process exited");
    exit_tx.send_replace(Some(info.clone()));
    let _ = events.send(ProcessEvent::Exited(info)).await;
}

#[cfg(unix)]
fn signal_terminate(pid: u32) -> bool {
    // SAFETY: kill(2) has no memory-safety preconditions
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn signal_terminate(_pid: u32) -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    async fn collect_lines(process: &mut SupervisedProcess) -> (Vec<String>, Option<ExitInfo>) {
        let mut lines = Vec::new();
        while let Some(event) = process.next_event().await {
            match event {
                ProcessEvent::Line(line) => lines.push(line.text),
                ProcessEvent::IoError(_) => {}
                ProcessEvent::Exited(info) => return (lines, Some(info)),
            }
        }
        (lines, None)
    }

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let spec = CommandSpec::new("/definitely/not/a/real/tunnel-binary");
        match SupervisedProcess::spawn(&spec) {
            Err(TunnelError::Spawn { program, .. }) => assert_eq!(program, "tunnel-binary"),
            Err(other) => panic!("expected spawn error, got {:?}", other),
            Ok(_) => panic!("expected spawn error"),
        }
    }

    #[tokio::test]
    async fn test_captures_stdout_and_stderr_before_exit() {
        let mut process =
            SupervisedProcess::spawn(&sh("echo out; echo err 1>&2; exit 3")).unwrap();
        let (mut lines, exit) = collect_lines(&mut process).await;
        lines.sort();
        assert_eq!(lines, vec!["err", "out"]);
        assert_eq!(exit.unwrap().code, Some(3));
        assert!(!process.is_alive());
    }

    #[tokio::test]
    async fn test_env_is_passed() {
        let spec = sh("echo $TUNNEL_TEST_VALUE").env("TUNNEL_TEST_VALUE", "hello");
        let mut process = SupervisedProcess::spawn(&spec).unwrap();
        let (lines, _) = collect_lines(&mut process).await;
        assert_eq!(lines, vec!["hello"]);
    }

    #[tokio::test]
    async fn test_kill_graceful() {
        let mut process = SupervisedProcess::spawn(&sh("sleep 30")).unwrap();
        assert!(process.is_alive());
        process.kill(Duration::from_secs(2)).await;
        assert!(!process.is_alive());
        assert!(process.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_kill_forces_when_sigterm_ignored() {
        let mut process =
            SupervisedProcess::spawn(&sh("trap '' TERM; echo ready; while true; do sleep 1; done"))
                .unwrap();
        // Make sure the trap is installed before signalling
        match process.next_event().await {
            Some(ProcessEvent::Line(line)) => assert_eq!(line.text, "ready"),
            other => panic!("expected ready line, got {:?}", other),
        }

        let started = std::time::Instant::now();
        process.kill(Duration::from_millis(200)).await;
        assert!(!process.is_alive());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(process.exit_info().unwrap().code, None);
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let mut process = SupervisedProcess::spawn(&sh("exit 0")).unwrap();
        process.wait_exit().await;
        process.kill(Duration::from_millis(50)).await;
        process.kill(Duration::from_millis(50)).await;
        assert_eq!(process.exit_info().unwrap().code, Some(0));
    }

    #[tokio::test]
    async fn test_reaped_child_is_not_alive_while_grandchild_holds_output() {
        // The background sleep inherits stdout, so the readers stay open
        // well past the drain window
        let mut process = SupervisedProcess::spawn(&sh("sleep 2 & exit 0")).unwrap();
        let pid = process.pid().unwrap() as libc::pid_t;

        tokio::time::timeout(Duration::from_millis(200), async {
            while process.is_alive() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("reaped child still reported alive");
        assert!(unsafe { libc::kill(pid, 0) } != 0);

        // Nothing left to signal: returns without waiting out the grace period
        let started = std::time::Instant::now();
        process.kill(Duration::from_secs(5)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(process.wait_exit().await.code, Some(0));
    }

    #[tokio::test]
    async fn test_drain_reports_unexpected_exit() {
        let mut process = SupervisedProcess::spawn(&sh("echo up; sleep 0.2; exit 7")).unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        process.drain_in_background(move |info| {
            let _ = tx.send(info);
        });
        let info = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.code, Some(7));
    }

    #[tokio::test]
    async fn test_drain_silent_on_kill() {
        let mut process = SupervisedProcess::spawn(&sh("sleep 30")).unwrap();
        let (tx, mut rx) = tokio::sync::oneshot::channel::<ExitInfo>();
        process.drain_in_background(move |info| {
            let _ = tx.send(info);
        });
        process.kill(Duration::from_secs(1)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }
}
