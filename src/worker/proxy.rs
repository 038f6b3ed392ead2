//! Parent-side handle that makes one worker process callable.
//!
//! Each proxy runs four small tasks around its child process:
//!
//! - a writer draining an outgoing message channel into the child's stdin,
//! - a stdout reader dispatching protocol messages (stray lines go to a tail),
//! - a stderr reader filling a second tail,
//! - a supervisor awaiting the exit and failing every pending call with the
//!   crash diagnostics.
//!
//! Calls are strictly sequential per proxy. Once the worker died unexpectedly
//! every later call fails immediately with the same error, without being sent.

use std::collections::HashMap;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::ipc::{LineReader, LineWriter, OutputTail};
use super::protocol::{ParentMessage, WorkerMessage};
use super::signals::{CrashDetails, ExitContext};
use super::spawn::{WorkerOptions, spawn_worker};
use super::value::Value;
use super::watchdog::MemoryWatchdog;
use crate::error::{Result, StryxError};
use crate::logging::forward_worker_log;

/// How long the readers may keep draining output after the process exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// How long to wait for the exit after `DisposeCompleted` or a kill.
const EXIT_WAIT: Duration = Duration::from_secs(1);

struct PendingCall {
    method: String,
    reply: oneshot::Sender<Result<Value>>,
}

#[derive(Default)]
struct State {
    pending: HashMap<u64, PendingCall>,
    /// Set once the worker died unexpectedly.
    crash: Option<CrashDetails>,
    exited: bool,
    /// Receives Ready/Initialized/InitError until the handshake is over.
    handshake: Option<mpsc::UnboundedSender<WorkerMessage>>,
    dispose_ack: Option<oneshot::Sender<()>>,
    stdout_tail: OutputTail,
    stderr_tail: OutputTail,
}

/// State shared between the proxy and its tasks.
struct Shared {
    pid: u32,
    label: String,
    state: Mutex<State>,
    killed_by_parent: AtomicBool,
    killed_by_watchdog: Arc<AtomicBool>,
    disposing: AtomicBool,
    /// A call timed out; the worker's internal state is unknown.
    tainted: AtomicBool,
}

impl Shared {
    fn new(pid: u32, label: &str, handshake: mpsc::UnboundedSender<WorkerMessage>) -> Self {
        Self {
            pid,
            label: label.to_string(),
            state: Mutex::new(State {
                handshake: Some(handshake),
                ..Default::default()
            }),
            killed_by_parent: AtomicBool::new(false),
            killed_by_watchdog: Arc::new(AtomicBool::new(false)),
            disposing: AtomicBool::new(false),
            tainted: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Handle one line of the worker's stdout.
    fn dispatch(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let message = match WorkerMessage::from_line(line) {
            Ok(message) => message,
            Err(_) => {
                trace!(target: "stryx::worker", pid = self.pid, "stdout: {}", line);
                self.lock().stdout_tail.push(line);
                return;
            }
        };

        match message {
            WorkerMessage::Log { record } => forward_worker_log(&record),
            WorkerMessage::Result {
                correlation_id,
                result,
            } => self.settle(correlation_id, |_| Ok(result)),
            WorkerMessage::Rejection {
                correlation_id,
                error,
            } => self.settle(correlation_id, |method| {
                Err(StryxError::Rejection { method, error })
            }),
            WorkerMessage::DisposeCompleted => {
                if let Some(ack) = self.lock().dispose_ack.take() {
                    let _ = ack.send(());
                }
            }
            message @ (WorkerMessage::Ready
            | WorkerMessage::Initialized
            | WorkerMessage::InitError { .. }) => {
                let state = self.lock();
                match &state.handshake {
                    Some(handshake) => {
                        let _ = handshake.send(message);
                    }
                    None => warn!(pid = self.pid, ?message, "Unexpected handshake message"),
                }
            }
        }
    }

    fn settle(&self, correlation_id: u64, outcome: impl FnOnce(String) -> Result<Value>) {
        let pending = self.lock().pending.remove(&correlation_id);
        match pending {
            Some(call) => {
                let _ = call.reply.send(outcome(call.method));
            }
            None => debug!(
                pid = self.pid,
                correlation_id, "Dropping reply to an abandoned call"
            ),
        }
    }

    /// Record the exit and fail every call still waiting for an answer.
    fn on_exit(&self, status: Option<ExitStatus>) {
        let context = ExitContext {
            killed_by_parent: self.killed_by_parent.load(Ordering::SeqCst),
            killed_by_watchdog: self.killed_by_watchdog.load(Ordering::SeqCst),
        };
        let expected = self.disposing.load(Ordering::SeqCst) && !context.killed_by_watchdog;

        let mut state = self.lock();
        state.exited = true;
        state.handshake = None;
        state.dispose_ack = None;
        let details = CrashDetails::new(
            self.pid,
            status,
            context,
            state.stdout_tail.snapshot(),
            state.stderr_tail.snapshot(),
        );
        let pending: Vec<PendingCall> = state.pending.drain().map(|(_, call)| call).collect();

        if expected {
            debug!(pid = self.pid, label = %self.label, reason = %details.reason, "Worker exited");
        } else {
            warn!(
                pid = self.pid,
                label = %self.label,
                reason = %details.reason,
                pending = pending.len(),
                "Worker exited unexpectedly"
            );
            state.crash = Some(details.clone());
        }
        drop(state);

        for call in pending {
            let error = if expected {
                StryxError::Disposed
            } else {
                details.clone().into()
            };
            let _ = call.reply.send(Err(error));
        }
    }

    fn terminal_error(&self) -> StryxError {
        self.lock()
            .crash
            .clone()
            .map(StryxError::from)
            .unwrap_or(StryxError::Disposed)
    }
}

/// A worker process made callable.
pub struct WorkerProxy {
    shared: Arc<Shared>,
    outgoing: mpsc::UnboundedSender<ParentMessage>,
    exited: watch::Receiver<bool>,
    call_lock: tokio::sync::Mutex<()>,
    next_correlation_id: AtomicU64,
    disposed: AtomicBool,
    shutdown_timeout: Duration,
}

impl WorkerProxy {
    /// Spawn a worker and complete its handshake.
    ///
    /// Any handshake failure, including the worker dying or not answering
    /// within the startup timeout, is reported as [`StryxError::Init`].
    pub async fn start(options: &WorkerOptions) -> Result<Self> {
        let mut child = spawn_worker(options)?;
        let pid = child
            .id()
            .ok_or_else(|| StryxError::Spawn("Worker exited before reporting a pid".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| StryxError::Spawn("Child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StryxError::Spawn("Child stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| StryxError::Spawn("Child stderr not captured".into()))?;

        let (handshake_tx, mut handshake_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new(pid, &options.label, handshake_tx));
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (exit_tx, exited) = watch::channel(false);

        tokio::spawn(write_loop(LineWriter::new(stdin), outgoing_rx, pid));
        let stdout_task = tokio::spawn(read_stdout(LineReader::new(stdout), Arc::clone(&shared)));
        let stderr_task = tokio::spawn(read_stderr(LineReader::new(stderr), Arc::clone(&shared)));

        if let (Some(watchdog), Some(limit_mib)) = (&options.watchdog, options.memory_limit_mib) {
            watchdog.register(
                pid,
                limit_mib,
                &options.label,
                Arc::clone(&shared.killed_by_watchdog),
            );
        }
        tokio::spawn(supervise(
            child,
            Arc::clone(&shared),
            [stdout_task, stderr_task],
            exit_tx,
            options.watchdog.clone(),
        ));

        debug!(pid, label = %options.label, plugin = %options.plugin.name, "Worker spawned");

        let proxy = Self {
            shared,
            outgoing,
            exited,
            call_lock: tokio::sync::Mutex::new(()),
            next_correlation_id: AtomicU64::new(1),
            disposed: AtomicBool::new(false),
            shutdown_timeout: options.shutdown_timeout,
        };

        let init = ParentMessage::Init {
            plugin: options.plugin.name.clone(),
            options: options.plugin.options.clone(),
            working_dir: options
                .working_dir
                .as_ref()
                .map(|dir| dir.to_string_lossy().into_owned()),
            log_level: options.log_level.to_string().to_lowercase(),
        };
        let outcome =
            tokio::time::timeout(options.startup_timeout, proxy.handshake(&mut handshake_rx, init))
                .await
                .unwrap_or_else(|_| {
                    Err(StryxError::Init {
                        message: format!(
                            "Worker {} did not complete its handshake within {}ms",
                            pid,
                            options.startup_timeout.as_millis()
                        ),
                    })
                });

        match outcome {
            Ok(()) => {
                proxy.shared.lock().handshake = None;
                debug!(pid, label = %options.label, "Worker initialized");
                Ok(proxy)
            }
            Err(e) => {
                proxy.dispose().await;
                Err(e)
            }
        }
    }

    async fn handshake(
        &self,
        messages: &mut mpsc::UnboundedReceiver<WorkerMessage>,
        init: ParentMessage,
    ) -> Result<()> {
        match messages.recv().await {
            Some(WorkerMessage::Ready) => {}
            Some(other) => {
                return Err(StryxError::Init {
                    message: format!("Expected ready message, got {:?}", other),
                });
            }
            None => return Err(self.exit_during_startup()),
        }

        self.send(init)?;

        match messages.recv().await {
            Some(WorkerMessage::Initialized) => Ok(()),
            Some(WorkerMessage::InitError { error }) => Err(StryxError::Init {
                message: error.to_string(),
            }),
            Some(other) => Err(StryxError::Init {
                message: format!("Expected initialized message, got {:?}", other),
            }),
            None => Err(self.exit_during_startup()),
        }
    }

    fn exit_during_startup(&self) -> StryxError {
        let message = match self.shared.lock().crash.as_ref() {
            Some(crash) => crash.to_string(),
            None => format!("Worker {} exited during startup", self.pid()),
        };
        StryxError::Init { message }
    }

    pub fn pid(&self) -> u32 {
        self.shared.pid
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Diagnostics of the unexpected exit, if the worker crashed.
    pub fn crash_details(&self) -> Option<CrashDetails> {
        self.shared.lock().crash.clone()
    }

    /// Whether the worker can take another call.
    pub fn is_usable(&self) -> bool {
        if self.disposed.load(Ordering::SeqCst) || self.shared.tainted.load(Ordering::SeqCst) {
            return false;
        }
        let state = self.shared.lock();
        state.crash.is_none() && !state.exited
    }

    /// Mark the worker as untrustworthy; it will not be reused.
    pub fn taint(&self) {
        self.shared.tainted.store(true, Ordering::SeqCst);
    }

    /// Invoke `method` on the worker's subject.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.call_with_timeout(method, args, None).await
    }

    /// Invoke `method`, giving up after `timeout`.
    ///
    /// A timed-out call taints the worker and fails with [`StryxError::CallTimeout`].
    pub async fn call_with_timeout(
        &self,
        method: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(StryxError::Disposed);
        }
        let _turn = self.call_lock.lock().await;

        let correlation_id = self.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        let (reply, response) = oneshot::channel();
        {
            let mut state = self.shared.lock();
            if let Some(crash) = &state.crash {
                return Err(crash.clone().into());
            }
            if state.exited || self.disposed.load(Ordering::SeqCst) {
                return Err(StryxError::Disposed);
            }
            state.pending.insert(
                correlation_id,
                PendingCall {
                    method: method.to_string(),
                    reply,
                },
            );
        }

        trace!(pid = self.pid(), correlation_id, method, "Calling worker");
        if self.send(ParentMessage::call(correlation_id, method, args)).is_err() {
            // The writer is gone, so the process is going down; its exit settles the call.
            debug!(pid = self.pid(), method, "Worker input closed while calling");
        }

        let outcome = match timeout {
            None => response.await,
            Some(limit) => match tokio::time::timeout(limit, response).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.taint();
                    self.shared.lock().pending.remove(&correlation_id);
                    debug!(
                        pid = self.pid(),
                        method,
                        timeout_ms = limit.as_millis() as u64,
                        "Worker call timed out"
                    );
                    return Err(StryxError::CallTimeout {
                        method: method.to_string(),
                        timeout: limit,
                    });
                }
            },
        };
        outcome.unwrap_or_else(|_| Err(self.shared.terminal_error()))
    }

    /// Shut the worker down.
    ///
    /// An idle, healthy worker gets a `Dispose` message and `shutdown_timeout`
    /// to acknowledge it; a busy, tainted or unresponsive one is killed.
    /// Idempotent, and never waits longer than the shutdown timeout plus a
    /// short grace for the kill.
    pub async fn dispose(&self) {
        let mut exited = self.exited.clone();
        if self.disposed.swap(true, Ordering::SeqCst) {
            let _ = tokio::time::timeout(
                self.shutdown_timeout + EXIT_WAIT,
                exited.wait_for(|exited| *exited),
            )
            .await;
            return;
        }
        self.shared.disposing.store(true, Ordering::SeqCst);

        let idle = self.call_lock.try_lock().is_ok();
        let graceful =
            idle && !self.shared.tainted.load(Ordering::SeqCst) && !*exited.borrow();
        if graceful {
            let (ack_tx, ack_rx) = oneshot::channel();
            self.shared.lock().dispose_ack = Some(ack_tx);
            if self.send(ParentMessage::Dispose).is_ok() {
                let acknowledged = matches!(
                    tokio::time::timeout(self.shutdown_timeout, ack_rx).await,
                    Ok(Ok(()))
                );
                if acknowledged {
                    trace!(pid = self.pid(), "Worker acknowledged dispose");
                    let _ = tokio::time::timeout(EXIT_WAIT, exited.wait_for(|exited| *exited)).await;
                } else {
                    debug!(pid = self.pid(), "Worker did not acknowledge dispose in time");
                }
            }
        }

        if !*exited.borrow() {
            self.kill();
            let _ = tokio::time::timeout(EXIT_WAIT, exited.wait_for(|exited| *exited)).await;
        }

        let leftover: Vec<PendingCall> = self
            .shared
            .lock()
            .pending
            .drain()
            .map(|(_, call)| call)
            .collect();
        for call in leftover {
            let _ = call.reply.send(Err(StryxError::Disposed));
        }
        debug!(pid = self.pid(), label = %self.label(), "Worker disposed");
    }

    fn send(&self, message: ParentMessage) -> Result<()> {
        self.outgoing
            .send(message)
            .map_err(|_| StryxError::Protocol(format!("Worker {} input is closed", self.pid())))
    }

    fn kill(&self) {
        self.shared.killed_by_parent.store(true, Ordering::SeqCst);
        match kill(Pid::from_raw(self.pid() as i32), Signal::SIGKILL) {
            Ok(()) => debug!(pid = self.pid(), "Killed worker"),
            Err(Errno::ESRCH) => {}
            Err(e) => warn!(pid = self.pid(), error = %e, "Failed to kill worker"),
        }
    }
}

impl Drop for WorkerProxy {
    fn drop(&mut self) {
        if !*self.exited.borrow() {
            self.kill();
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: LineWriter<W>,
    mut messages: mpsc::UnboundedReceiver<ParentMessage>,
    pid: u32,
) {
    while let Some(message) = messages.recv().await {
        let line = match message.to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!(pid, error = %e, "Failed to encode message for worker");
                continue;
            }
        };
        if let Err(e) = writer.write_line(&line).await {
            debug!(pid, error = %e, "Worker stdin closed");
            break;
        }
    }
}

async fn read_stdout<R: AsyncRead + Unpin>(mut reader: LineReader<R>, shared: Arc<Shared>) {
    loop {
        match reader.read_line().await {
            Ok(Some(line)) => shared.dispatch(&line),
            Ok(None) => break,
            Err(e) => {
                debug!(pid = shared.pid, error = %e, "Failed to read worker stdout");
                break;
            }
        }
    }
}

async fn read_stderr<R: AsyncRead + Unpin>(mut reader: LineReader<R>, shared: Arc<Shared>) {
    loop {
        match reader.read_line().await {
            Ok(Some(line)) => {
                debug!(target: "stryx::worker", pid = shared.pid, "stderr: {}", line);
                shared.lock().stderr_tail.push(&line);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(pid = shared.pid, error = %e, "Failed to read worker stderr");
                break;
            }
        }
    }
}

async fn supervise(
    mut child: Child,
    shared: Arc<Shared>,
    readers: [JoinHandle<()>; 2],
    exit_tx: watch::Sender<bool>,
    watchdog: Option<Arc<MemoryWatchdog>>,
) {
    let status = match child.wait().await {
        Ok(status) => Some(status),
        Err(e) => {
            warn!(pid = shared.pid, error = %e, "Failed to wait for worker");
            None
        }
    };

    // Let the readers drain what the worker wrote before it exited
    for mut reader in readers {
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut reader)
            .await
            .is_err()
        {
            reader.abort();
        }
    }
    if let Some(watchdog) = watchdog {
        watchdog.unregister(shared.pid);
    }

    shared.on_exit(status);
    let _ = exit_tx.send(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::signals::TerminationReason;
    use crate::worker::value::ErrorValue;
    use std::os::unix::process::ExitStatusExt;

    fn shared() -> (Shared, mpsc::UnboundedReceiver<WorkerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Shared::new(4242, "test-runner", tx), rx)
    }

    fn pending(shared: &Shared, id: u64, method: &str) -> oneshot::Receiver<Result<Value>> {
        let (reply, response) = oneshot::channel();
        shared.lock().pending.insert(
            id,
            PendingCall {
                method: method.to_string(),
                reply,
            },
        );
        response
    }

    fn line(message: WorkerMessage) -> String {
        message.to_line().unwrap()
    }

    #[test]
    fn test_result_settles_matching_call() {
        let (shared, _rx) = shared();
        let mut first = pending(&shared, 1, "dryRun");
        let mut second = pending(&shared, 2, "mutantRun");

        shared.dispatch(&line(WorkerMessage::Result {
            correlation_id: 2,
            result: Value::from("done"),
        }));

        assert!(first.try_recv().is_err());
        assert_eq!(second.try_recv().unwrap().unwrap(), Value::from("done"));
        assert_eq!(shared.lock().pending.len(), 1);
    }

    #[test]
    fn test_rejection_names_method() {
        let (shared, _rx) = shared();
        let mut response = pending(&shared, 7, "check");

        shared.dispatch(&line(WorkerMessage::rejection(
            7,
            ErrorValue::new("TypeError", "x is undefined"),
        )));

        match response.try_recv().unwrap() {
            Err(StryxError::Rejection { method, error }) => {
                assert_eq!(method, "check");
                assert_eq!(error.message, "x is undefined");
            }
            other => panic!("Expected Rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_stray_output_goes_to_tail() {
        let (shared, _rx) = shared();
        shared.dispatch("console.log from a test");
        shared.dispatch("");
        assert_eq!(
            shared.lock().stdout_tail.snapshot(),
            vec!["console.log from a test"]
        );
    }

    #[test]
    fn test_handshake_messages_forwarded() {
        let (shared, mut rx) = shared();
        shared.dispatch(&line(WorkerMessage::Ready));
        assert_eq!(rx.try_recv().unwrap(), WorkerMessage::Ready);

        shared.lock().handshake = None;
        shared.dispatch(&line(WorkerMessage::Initialized));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unexpected_exit_fails_pending_and_future_calls() {
        let (shared, _rx) = shared();
        let mut response = pending(&shared, 1, "mutantRun");
        shared.lock().stderr_tail.push("thread 'main' panicked");

        shared.on_exit(Some(ExitStatus::from_raw(3 << 8)));

        match response.try_recv().unwrap() {
            Err(StryxError::Crashed(details)) => {
                assert_eq!(details.pid, 4242);
                assert_eq!(details.exit_code, Some(3));
                assert_eq!(details.reason, TerminationReason::Exited(3));
                assert_eq!(details.recent_stderr, vec!["thread 'main' panicked"]);
            }
            other => panic!("Expected Crashed, got {:?}", other),
        }
        assert!(matches!(shared.terminal_error(), StryxError::Crashed(_)));
    }

    #[test]
    fn test_watchdog_kill_is_out_of_memory() {
        let (shared, _rx) = shared();
        let mut response = pending(&shared, 1, "mutantRun");
        shared.killed_by_watchdog.store(true, Ordering::SeqCst);

        shared.on_exit(Some(ExitStatus::from_raw(Signal::SIGKILL as i32)));

        assert!(matches!(
            response.try_recv().unwrap(),
            Err(StryxError::OutOfMemory(_))
        ));
    }

    #[test]
    fn test_exit_while_disposing_is_not_a_crash() {
        let (shared, _rx) = shared();
        let mut response = pending(&shared, 1, "mutantRun");
        shared.disposing.store(true, Ordering::SeqCst);
        shared.killed_by_parent.store(true, Ordering::SeqCst);

        shared.on_exit(Some(ExitStatus::from_raw(Signal::SIGKILL as i32)));

        assert!(matches!(
            response.try_recv().unwrap(),
            Err(StryxError::Disposed)
        ));
        assert!(shared.lock().crash.is_none());
        assert!(matches!(shared.terminal_error(), StryxError::Disposed));
    }
}
