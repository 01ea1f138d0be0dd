//! C4: supervises exactly one subprocess speaking newline-delimited
//! JSON-RPC over stdio (spec.md §4.4).

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout as tokio_timeout;
use tracing::{debug, error, info, warn};
use turbomcp_protocol::MessageId;
use turbomcp_protocol::jsonrpc::{JsonRpcRequest, JsonRpcResponse, JsonRpcVersion};

use crate::config::env_key_allowed;
use crate::error::{GatewayError, GatewayResult};

/// Maximum bytes accepted for a single stdout line before it is treated as
/// malformed (mirrors the teacher's stdio frontend line-size guard,
/// tightened to the gateway's 8 MiB inbound body cap).
const MAX_LINE_SIZE: usize = 8 * 1024 * 1024;

/// How long to wait for an ack after requesting graceful `shutdown`.
const SHUTDOWN_ACK_GRACE: Duration = Duration::from_secs(1);
/// How long to wait after `SIGTERM` before escalating to `SIGKILL`.
const SIGTERM_GRACE: Duration = Duration::from_secs(5);
/// No stdout activity for this long, with requests outstanding, is a hang.
const HANG_TIMEOUT: Duration = Duration::from_secs(120);
const HANG_CHECK_INTERVAL: Duration = Duration::from_secs(5);
/// Bounded write queue depth; `send` backpressures once full.
const WRITE_QUEUE_DEPTH: usize = 256;
const STDERR_RING_CAPACITY: usize = 200;

/// Subprocess lifecycle state (spec.md §4.4 states).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Spawning,
    Running,
    Crashed,
    Terminated,
}

struct PendingEntry {
    responder: oneshot::Sender<GatewayResult<JsonRpcResponse>>,
}

struct Shared {
    state: Mutex<ProcessState>,
    pending: DashMap<MessageId, PendingEntry>,
    last_stdout_read: Mutex<Instant>,
    pid: Mutex<Option<u32>>,
    last_error: Mutex<Option<String>>,
    stderr_ring: Mutex<VecDeque<String>>,
    write_tx: mpsc::Sender<Vec<u8>>,
    shutdown_ack: Mutex<Option<oneshot::Sender<()>>>,
    shutting_down: std::sync::atomic::AtomicBool,
}

/// A supervised stdio subprocess.
#[derive(Clone)]
pub struct StdioProcess {
    shared: Arc<Shared>,
    request_timeout: Duration,
}

impl StdioProcess {
    /// Spawn the subprocess. `env` is merged on top of the fixed
    /// whitelist; parent-process secrets are never inherited.
    pub async fn spawn(
        command: &str,
        args: &[String],
        cwd: Option<&PathBuf>,
        env: &std::collections::HashMap<String, String>,
        request_timeout: Duration,
    ) -> GatewayResult<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args);
        cmd.env_clear();
        for (key, value) in std::env::vars() {
            if env_key_allowed(&key) {
                cmd.env(key, value);
            }
        }
        for (key, value) in env {
            cmd.env(key, value);
        }
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child: Child = cmd.spawn().map_err(|e| {
            GatewayError::process_crashed(format!("failed to spawn '{command}': {e}"))
        })?;

        let pid = child.id();
        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);

        let shared = Arc::new(Shared {
            state: Mutex::new(ProcessState::Spawning),
            pending: DashMap::new(),
            last_stdout_read: Mutex::new(Instant::now()),
            pid: Mutex::new(pid),
            last_error: Mutex::new(None),
            stderr_ring: Mutex::new(VecDeque::with_capacity(STDERR_RING_CAPACITY)),
            write_tx,
            shutdown_ack: Mutex::new(None),
            shutting_down: std::sync::atomic::AtomicBool::new(false),
        });

        *shared.state.lock() = ProcessState::Running;

        spawn_writer_task(stdin, write_rx);
        spawn_reader_task(Arc::clone(&shared), stdout);
        spawn_stderr_task(Arc::clone(&shared), stderr);
        spawn_wait_task(Arc::clone(&shared), child);
        spawn_hang_monitor(Arc::clone(&shared));

        info!(command, pid, "spawned stdio subprocess");
        Ok(Self { shared, request_timeout })
    }

    pub fn state(&self) -> ProcessState {
        *self.shared.state.lock()
    }

    pub fn pid(&self) -> Option<u32> {
        *self.shared.pid.lock()
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    pub fn stderr_logs(&self) -> Vec<String> {
        self.shared.stderr_ring.lock().iter().cloned().collect()
    }

    /// Send a request and await its paired response, honoring the
    /// per-server request deadline (spec.md §4.4.5). Expiry rejects the
    /// caller but leaves the subprocess running.
    pub async fn send(&self, request: JsonRpcRequest) -> GatewayResult<JsonRpcResponse> {
        if *self.shared.state.lock() != ProcessState::Running {
            return Err(GatewayError::process_crashed("subprocess is not running"));
        }

        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .insert(request.id.clone(), PendingEntry { responder: tx });

        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');
        if self.shared.write_tx.send(line).await.is_err() {
            self.shared.pending.remove(&request.id);
            return Err(GatewayError::process_crashed("subprocess stdin closed"));
        }

        match tokio_timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                // Sender dropped without a response: process exited mid-flight.
                Err(GatewayError::process_crashed("subprocess exited before responding"))
            }
            Err(_) => {
                self.shared.pending.remove(&request.id);
                Err(GatewayError::timeout("stdio request", self.request_timeout.as_millis() as u64))
            }
        }
    }

    /// Best-effort graceful shutdown: JSON-RPC `shutdown` request, 1s for
    /// ack, `SIGTERM`, 5s, then `SIGKILL` (spec.md §4.4.8).
    pub async fn terminate(&self) {
        self.shared.shutting_down.store(true, std::sync::atomic::Ordering::SeqCst);

        let (ack_tx, ack_rx) = oneshot::channel();
        *self.shared.shutdown_ack.lock() = Some(ack_tx);

        let shutdown_req = JsonRpcRequest {
            jsonrpc: JsonRpcVersion,
            method: "shutdown".to_string(),
            params: None,
            id: MessageId::String("__gateway_shutdown__".to_string()),
        };
        if let Ok(mut bytes) = serde_json::to_vec(&shutdown_req) {
            bytes.push(b'\n');
            let _ = self.shared.write_tx.send(bytes).await;
        }

        if tokio_timeout(SHUTDOWN_ACK_GRACE, ack_rx).await.is_err() {
            debug!("no shutdown ack within grace period; escalating");
        }

        if let Some(pid) = self.pid() {
            #[cfg(unix)]
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            #[cfg(not(unix))]
            {
                let _ = pid;
            }
        }

        tokio::time::sleep(SIGTERM_GRACE).await;

        if *self.shared.state.lock() == ProcessState::Running {
            if let Some(pid) = self.pid() {
                #[cfg(unix)]
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGKILL);
                }
                #[cfg(not(unix))]
                {
                    let _ = pid;
                }
            }
        }
        *self.shared.state.lock() = ProcessState::Terminated;
    }
}

fn spawn_writer_task(mut stdin: tokio::process::ChildStdin, mut rx: mpsc::Receiver<Vec<u8>>) {
    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if stdin.write_all(&bytes).await.is_err() {
                break;
            }
            if stdin.flush().await.is_err() {
                break;
            }
        }
    });
}

fn spawn_reader_task(shared: Arc<Shared>, stdout: tokio::process::ChildStdout) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    *shared.last_stdout_read.lock() = Instant::now();
                    if line.len() > MAX_LINE_SIZE {
                        warn!("stdout line exceeded max size; dropping");
                        continue;
                    }
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    handle_line(&shared, trimmed);
                }
                Err(e) => {
                    error!(error = %e, "error reading subprocess stdout");
                    break;
                }
            }
        }
    });
}

fn handle_line(shared: &Arc<Shared>, line: &str) {
    let Ok(value) = serde_json::from_str::<Value>(line) else {
        warn!("subprocess emitted non-JSON line; dropping");
        return;
    };

    // Notifications have no `id`; responses always do (possibly null).
    if value.get("id").is_none() {
        debug!(method = ?value.get("method"), "subprocess notification");
        return;
    }

    match serde_json::from_value::<JsonRpcResponse>(value.clone()) {
        Ok(response) => {
            let Some(id) = response.id.0.clone() else {
                warn!("subprocess response has null id; dropping");
                return;
            };
            if id == MessageId::String("__gateway_shutdown__".to_string()) {
                if let Some(ack) = shared.shutdown_ack.lock().take() {
                    let _ = ack.send(());
                }
                return;
            }
            if let Some((_, entry)) = shared.pending.remove(&id) {
                let _ = entry.responder.send(Ok(response));
            } else {
                warn!(?id, "response for unknown/already-completed request id; dropping");
            }
        }
        Err(e) => {
            warn!(error = %e, "malformed response envelope from subprocess");
        }
    }
}

fn spawn_stderr_task(shared: Arc<Shared>, stderr: tokio::process::ChildStderr) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim_end().to_string();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let mut ring = shared.stderr_ring.lock();
                    if ring.len() >= STDERR_RING_CAPACITY {
                        ring.pop_front();
                    }
                    ring.push_back(trimmed);
                }
                Err(_) => break,
            }
        }
    });
}

fn spawn_wait_task(shared: Arc<Shared>, mut child: Child) {
    tokio::spawn(async move {
        let status = child.wait().await;
        let was_shutting_down = shared.shutting_down.load(std::sync::atomic::Ordering::SeqCst);
        let description = match status {
            Ok(status) => format!("exit status: {status}"),
            Err(e) => format!("wait error: {e}"),
        };
        *shared.last_error.lock() = Some(description.clone());
        *shared.state.lock() =
            if was_shutting_down { ProcessState::Terminated } else { ProcessState::Crashed };

        let pending: Vec<MessageId> = shared.pending.iter().map(|e| e.key().clone()).collect();
        for id in pending {
            if let Some((_, entry)) = shared.pending.remove(&id) {
                let _ = entry.responder.send(Err(GatewayError::process_crashed(format!(
                    "subprocess exited ({description})"
                ))));
            }
        }
        if !was_shutting_down {
            warn!(%description, "subprocess exited unexpectedly");
        }
    });
}

fn spawn_hang_monitor(shared: Arc<Shared>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HANG_CHECK_INTERVAL);
        loop {
            interval.tick().await;
            if *shared.state.lock() != ProcessState::Running {
                break;
            }
            if shared.pending.is_empty() {
                continue;
            }
            let idle = shared.last_stdout_read.lock().elapsed();
            if idle > HANG_TIMEOUT {
                warn!(idle_secs = idle.as_secs(), "subprocess hang detected; killing");
                if let Some(pid) = *shared.pid.lock() {
                    #[cfg(unix)]
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGKILL);
                    }
                    #[cfg(not(unix))]
                    {
                        let _ = pid;
                    }
                }
                *shared.last_error.lock() = Some("killed after hang detection (120s)".to_string());
                *shared.state.lock() = ProcessState::Crashed;
                let pending: Vec<MessageId> = shared.pending.iter().map(|e| e.key().clone()).collect();
                for id in pending {
                    if let Some((_, entry)) = shared.pending.remove(&id) {
                        let _ = entry
                            .responder
                            .send(Err(GatewayError::timeout("stdio request (hung process)", HANG_TIMEOUT.as_millis() as u64)));
                    }
                }
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn spawn_echo_and_send_request_round_trips() {
        // /bin/cat echoes each stdin line back on stdout unchanged, which
        // happens to be a valid (if synthetic) JSON-RPC response when the
        // caller writes one.
        let process = StdioProcess::spawn(
            "cat",
            &[],
            None,
            &std::collections::HashMap::new(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(process.state(), ProcessState::Running);

        let request = JsonRpcRequest {
            jsonrpc: JsonRpcVersion,
            method: "ping".to_string(),
            params: None,
            id: MessageId::Number(1),
        };
        // `cat` does not itself echo JSON-RPC *responses*; craft the wire
        // line expectation by writing a response directly is out of scope
        // for this unit test. We instead assert the send path at least
        // reaches the timeout branch without panicking when nothing
        // structurally valid comes back.
        let result = tokio::time::timeout(Duration::from_millis(200), process.send(request)).await;
        assert!(result.is_err() || result.unwrap().is_err());
        process.terminate().await;
    }

    #[tokio::test]
    async fn spawning_nonexistent_command_fails() {
        let result = StdioProcess::spawn(
            "definitely-not-a-real-binary-xyz",
            &[],
            None,
            &std::collections::HashMap::new(),
            Duration::from_secs(5),
        )
        .await;
        assert!(result.is_err());
    }
}
