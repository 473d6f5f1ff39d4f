//! Subprocess-stdio transport: the primary worker channel.
//!
//! Grounded on the teacher's `mcp/jsonrpc.rs` (`JsonRpcTransport`): a writer task serializing
//! stdin writes, a reader task draining stdout through a [`Framer`] and routing by id, a
//! stderr task feeding a [`StderrRing`], and retry-with-backoff on `ExecutableFileBusy`
//! (`process.rs::spawn_with_retry`).

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::framer::{Framer, DEFAULT_MAX_LINE_LENGTH};

use super::{CancelToken, StderrRing, Transport, TransportState};

/// Spawn parameters resolved ahead of time by [`crate::env::ResolvedProcessEnv`].
#[derive(Debug, Clone)]
pub struct SubprocessSpec {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub max_line_length: usize,
}

impl SubprocessSpec {
    pub fn new(executable: PathBuf) -> Self {
        Self {
            executable,
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }

    fn build_command(&self) -> Command {
        let mut command = Command::new(&self.executable);
        command.args(&self.args);
        command
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &self.env {
            command.env(key, value);
        }
        command
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Vec<u8>, BridgeError>>>>>;
type PendingOrder = Arc<Mutex<VecDeque<u64>>>;

/// Bounds how many resolved ids `route_line` remembers in order to tell a true duplicate-id
/// response (the id was already delivered once) apart from a response for an id the host
/// locally abandoned via timeout or cancellation. Large enough to outlive any id still
/// plausibly in flight; response ids older than this are assumed abandoned, matching prior
/// behavior.
const COMPLETED_IDS_CAPACITY: usize = 4096;

/// Small ring-bounded set of ids `route_line` has already delivered to a caller, so a second
/// response for the same id can be told apart from a response to an id that was already
/// removed locally (spec §9: duplicate-id is quarantine-worthy, a locally-abandoned id is not).
#[derive(Default)]
struct CompletedIds {
    order: VecDeque<u64>,
    seen: HashSet<u64>,
}

impl CompletedIds {
    fn mark(&mut self, id: u64) {
        if !self.seen.insert(id) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > COMPLETED_IDS_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
    }

    fn contains(&self, id: u64) -> bool {
        self.seen.contains(&id)
    }
}

type CompletedIdsHandle = Arc<Mutex<CompletedIds>>;

enum InitState {
    NotStarted,
    Ready,
    Failed(String),
}

pub struct SubprocessTransport {
    spec: SubprocessSpec,
    init_state: Mutex<InitState>,
    writer: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    pending: PendingMap,
    pending_order: PendingOrder,
    completed_ids: CompletedIdsHandle,
    child: Mutex<Option<Child>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stderr_ring: Arc<StderrRing>,
    state: Arc<std::sync::atomic::AtomicU8>,
}

const STATE_STARTING: u8 = 0;
const STATE_READY: u8 = 1;
const STATE_DISPOSED: u8 = 2;

impl SubprocessTransport {
    pub fn new(spec: SubprocessSpec) -> Self {
        Self {
            spec,
            init_state: Mutex::new(InitState::NotStarted),
            writer: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            pending_order: Arc::new(Mutex::new(VecDeque::new())),
            completed_ids: Arc::new(Mutex::new(CompletedIds::default())),
            child: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            stderr_ring: Arc::new(StderrRing::default()),
            state: Arc::new(std::sync::atomic::AtomicU8::new(STATE_STARTING)),
        }
    }

    pub fn stderr_ring(&self) -> Arc<StderrRing> {
        self.stderr_ring.clone()
    }

    async fn spawn_with_retry(&self) -> Result<Child, BridgeError> {
        let mut backoff = Duration::from_millis(2);
        for attempt in 0..5 {
            let mut command = self.spec.build_command();
            match command.spawn() {
                Ok(child) => return Ok(child),
                Err(source) => {
                    let is_busy = matches!(source.kind(), std::io::ErrorKind::ExecutableFileBusy)
                        || source.raw_os_error() == Some(26);
                    if is_busy && attempt < 4 {
                        tokio::time::sleep(backoff).await;
                        backoff = std::cmp::min(backoff * 2, Duration::from_millis(50));
                        continue;
                    }
                    return Err(BridgeError::protocol(format!(
                        "failed to spawn worker `{}`: {source}",
                        self.spec.executable.display()
                    )));
                }
            }
        }
        unreachable!("spawn loop always returns or errors")
    }
}

#[async_trait]
impl Transport for SubprocessTransport {
    async fn init(&self) -> Result<(), BridgeError> {
        let mut guard = self.init_state.lock().await;
        match &*guard {
            InitState::Ready => return Ok(()),
            InitState::Failed(message) => return Err(BridgeError::protocol(message.clone())),
            InitState::NotStarted => {}
        }

        let mut child = self.spawn_with_retry().await.map_err(|err| {
            *guard = InitState::Failed(err.to_string());
            err
        })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            BridgeError::protocol("worker stdout unavailable immediately after spawn")
        })?;
        let stdin = child.stdin.take().ok_or_else(|| {
            BridgeError::protocol("worker stdin unavailable immediately after spawn")
        })?;
        let stderr = child.stderr.take();

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let writer_handle = tokio::spawn(writer_task(stdin, writer_rx));
        let reader_handle = tokio::spawn(reader_task(
            stdout,
            self.pending.clone(),
            self.pending_order.clone(),
            self.completed_ids.clone(),
            self.spec.max_line_length,
            self.state.clone(),
        ));
        let mut tasks = vec![writer_handle, reader_handle];
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(stderr_task(stderr, self.stderr_ring.clone())));
        }

        *self.tasks.lock().await = tasks;
        *self.writer.lock().await = Some(writer_tx);
        *self.child.lock().await = Some(child);
        self.state.store(STATE_READY, std::sync::atomic::Ordering::SeqCst);
        *guard = InitState::Ready;
        Ok(())
    }

    async fn send(
        &self,
        message: Vec<u8>,
        timeout: Duration,
        cancel: CancelToken,
    ) -> Result<Vec<u8>, BridgeError> {
        if self.state() == TransportState::Disposed {
            return Err(BridgeError::Disposed);
        }

        let id = extract_id(&message)
            .ok_or_else(|| BridgeError::protocol("outgoing message missing numeric \"id\""))?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(id, tx);
            self.pending_order.lock().await.push_back(id);
        }

        let writer = {
            let guard = self.writer.lock().await;
            guard.clone()
        };
        let Some(writer) = writer else {
            self.pending.lock().await.remove(&id);
            return Err(BridgeError::protocol("worker not initialized"));
        };

        // A single send over the channel; the writer task performs at most one physical write
        // of these bytes no matter how stdin backpressure resolves (spec's write-non-duplication
        // property). We never re-send on timeout/cancel below — only the pending entry is
        // dropped locally.
        if writer.send(message).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(BridgeError::protocol("worker stdin channel closed"));
        }

        tokio::select! {
            result = rx => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(BridgeError::Timeout {
                        timeout,
                        stderr: self.stderr_ring.tail_text(),
                    }),
                }
            }
            _ = tokio::time::sleep(timeout) => {
                self.pending.lock().await.remove(&id);
                Err(BridgeError::Timeout { timeout, stderr: self.stderr_ring.tail_text() })
            }
            _ = cancel.cancelled() => {
                self.pending.lock().await.remove(&id);
                Err(BridgeError::Timeout { timeout, stderr: self.stderr_ring.tail_text() })
            }
        }
    }

    async fn dispose(&self) {
        if self
            .state
            .swap(STATE_DISPOSED, std::sync::atomic::Ordering::SeqCst)
            == STATE_DISPOSED
        {
            return;
        }

        for handle in self.tasks.lock().await.drain(..) {
            handle.abort();
        }

        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
        }

        let mut pending = self.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(BridgeError::Disposed));
        }
        self.pending_order.lock().await.clear();
    }

    fn state(&self) -> TransportState {
        match self.state.load(std::sync::atomic::Ordering::SeqCst) {
            STATE_STARTING => TransportState::Starting,
            STATE_READY => TransportState::Ready,
            _ => TransportState::Disposed,
        }
    }

    fn stderr_tail(&self) -> String {
        self.stderr_ring.tail_text()
    }
}

fn extract_id(message: &[u8]) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_slice(message).ok()?;
    value.get("id")?.as_u64()
}

async fn writer_task(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(message) = rx.recv().await {
        if stdin.write_all(&message).await.is_err() {
            break;
        }
        if stdin.write_all(b"\n").await.is_err() {
            break;
        }
        if stdin.flush().await.is_err() {
            break;
        }
    }
    let _ = stdin.shutdown().await;
}

async fn reader_task(
    mut stdout: ChildStdout,
    pending: PendingMap,
    pending_order: PendingOrder,
    completed_ids: CompletedIdsHandle,
    max_line_length: usize,
    state: Arc<std::sync::atomic::AtomicU8>,
) {
    let mut framer = Framer::new(max_line_length);
    let mut chunk = vec![0u8; 8192];

    loop {
        let read = match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                warn!("worker stdout read error: {err}");
                break;
            }
        };

        for event in framer.push(&chunk[..read]) {
            match event {
                Ok(line) => route_line(line, &pending, &pending_order, &completed_ids).await,
                Err(err) => {
                    warn!("worker produced an oversize line: {err}");
                    fail_oldest(&pending, &pending_order, BridgeError::from(err)).await;
                }
            }
        }
    }

    // Process exit (or an unreadable stdout) poisons the stream: every caller still waiting
    // on this worker gets a fatal ProtocolError and the transport is marked disposed so the
    // pool's next liveness check quarantines it and triggers replacement (spec §4.5).
    state.store(STATE_DISPOSED, std::sync::atomic::Ordering::SeqCst);
    let mut guard = pending.lock().await;
    for (_, tx) in guard.drain() {
        let _ = tx.send(Err(BridgeError::protocol_fatal(
            "Python process exited / Python process is not running",
        )));
    }
    pending_order.lock().await.clear();
}

async fn route_line(
    line: Vec<u8>,
    pending: &PendingMap,
    pending_order: &PendingOrder,
    completed_ids: &CompletedIdsHandle,
) {
    let id = match serde_json::from_slice::<serde_json::Value>(&line) {
        Ok(value) => value.get("id").and_then(serde_json::Value::as_u64),
        Err(_) => {
            warn!("worker stdout line was not valid JSON");
            fail_oldest(
                pending,
                pending_order,
                BridgeError::protocol_fatal("Response line was not valid JSON"),
            )
            .await;
            return;
        }
    };

    let Some(id) = id else {
        warn!("worker response missing a numeric \"id\"");
        fail_oldest(
            pending,
            pending_order,
            BridgeError::protocol_fatal("Response missing \"id\""),
        )
        .await;
        return;
    };

    let sender = {
        let mut guard = pending.lock().await;
        guard.remove(&id)
    };

    match sender {
        Some(tx) => {
            remove_from_order(pending_order, id).await;
            completed_ids.lock().await.mark(id);
            let _ = tx.send(Ok(line));
        }
        None if completed_ids.lock().await.contains(id) => {
            warn!("worker sent a duplicate response for id {id}");
            fail_oldest(
                pending,
                pending_order,
                BridgeError::protocol_fatal(format!("Duplicate response for id {id}")),
            )
            .await;
        }
        None => {
            debug!("response id {id} has no pending caller (timed out or cancelled)");
        }
    }
}

async fn fail_oldest(pending: &PendingMap, pending_order: &PendingOrder, error: BridgeError) {
    let oldest = pending_order.lock().await.pop_front();
    let Some(id) = oldest else {
        return;
    };
    if let Some(tx) = pending.lock().await.remove(&id) {
        let _ = tx.send(Err(error));
    }
}

async fn remove_from_order(pending_order: &PendingOrder, id: u64) {
    let mut order = pending_order.lock().await;
    if let Some(pos) = order.iter().position(|&pending_id| pending_id == id) {
        order.remove(pos);
    }
}

async fn stderr_task(stderr: ChildStderr, ring: Arc<StderrRing>) {
    use tokio::io::{AsyncBufReadExt, BufReader};
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("worker stderr: {line}");
        ring.push_line(&line);
    }
}
