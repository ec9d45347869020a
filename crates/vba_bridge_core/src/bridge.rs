//! Serializing façade around a single automation connection.
//!
//! One dedicated OS thread owns the adapter for its whole lifetime. Async callers
//! enqueue [`Operation`]s and await the reply; the worker executes them strictly
//! one at a time, in submission order.

use crate::adapter::{AutomationAdapter, CommandKind, ExecutionState};
use crate::error::{AdapterError, BridgeError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Identifies who submitted a call, so a disconnecting session can cancel only its own work.
pub type CallOwner = u64;

/// Owner used for target-wide work such as shutdown cleanup.
pub const SYSTEM_OWNER: CallOwner = 0;

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Attach { document: Option<String> },
    Detach,
    ReadModule { name: String },
    WriteModule { name: String, text: String },
    GetState,
    SendCommand(CommandKind),
    ListProjects,
    Evaluate { expression: String },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Attach { .. } => "attach",
            Operation::Detach => "detach",
            Operation::ReadModule { .. } => "read_module",
            Operation::WriteModule { .. } => "write_module",
            Operation::GetState => "get_state",
            Operation::SendCommand(_) => "send_command",
            Operation::ListProjects => "list_projects",
            Operation::Evaluate { .. } => "evaluate",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Done,
    Text(String),
    State(ExecutionState),
    Projects(Vec<String>),
}

struct PendingCall {
    id: u64,
    owner: CallOwner,
    operation: Operation,
    timeout: Duration,
    deadline: Instant,
    reply: oneshot::Sender<Result<Reply, BridgeError>>,
}

impl PendingCall {
    fn cancel(self) {
        let _ = self
            .reply
            .send(Err(BridgeError::Cancelled(self.operation.name())));
    }
}

#[derive(Default)]
struct CallQueue {
    calls: VecDeque<PendingCall>,
    closed: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<CallQueue>,
    ready: Condvar,
    executing: AtomicUsize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, CallQueue> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct AutomationBridge {
    name: String,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AutomationBridge {
    /// Starts the worker thread. `factory` runs on that thread, so adapters with
    /// thread affinity are created where they will be used.
    pub fn spawn<F, A>(name: impl Into<String>, factory: F) -> std::io::Result<Self>
    where
        F: FnOnce() -> A + Send + 'static,
        A: AutomationAdapter,
    {
        let name = name.into();
        let shared = Arc::new(Shared::default());
        let worker_shared = shared.clone();
        let worker_name = name.clone();

        let worker = thread::Builder::new()
            .name(format!("bridge-{name}"))
            .spawn(move || worker_loop(worker_name, factory(), worker_shared))?;

        tracing::info!(bridge = %name, "Automation bridge started");

        Ok(Self {
            name,
            shared,
            next_id: AtomicU64::new(1),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues `operation` and waits for its reply for at most `timeout`.
    ///
    /// A timed-out call never blocks the queue: if the worker has not started it
    /// yet it is skipped, otherwise its late result is discarded.
    pub async fn call(
        &self,
        owner: CallOwner,
        operation: Operation,
        timeout: Duration,
    ) -> Result<Reply, BridgeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = operation.name();
        let (tx, rx) = oneshot::channel();

        {
            let mut queue = self.shared.lock();
            if queue.closed {
                return Err(BridgeError::Closed);
            }
            queue.calls.push_back(PendingCall {
                id,
                owner,
                operation,
                timeout,
                deadline: Instant::now() + timeout,
                reply: tx,
            });
        }
        self.shared.ready.notify_one();

        tracing::debug!(bridge = %self.name, id, owner, operation = name, "Queued bridge call");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::Closed),
            Err(_) => {
                tracing::warn!(bridge = %self.name, id, operation = name, ?timeout, "Bridge call timed out");
                Err(BridgeError::Timeout {
                    operation: name,
                    after: timeout,
                })
            }
        }
    }

    /// Fails every not-yet-started call from `owner` with `Cancelled`.
    pub fn cancel_pending(&self, owner: CallOwner) -> usize {
        let cancelled: Vec<PendingCall> = {
            let mut queue = self.shared.lock();
            let (mine, rest): (VecDeque<_>, VecDeque<_>) =
                queue.calls.drain(..).partition(|call| call.owner == owner);
            queue.calls = rest;
            mine.into_iter().collect()
        };
        let count = cancelled.len();
        cancelled.into_iter().for_each(PendingCall::cancel);
        if count > 0 {
            tracing::debug!(bridge = %self.name, owner, count, "Cancelled pending bridge calls");
        }
        count
    }

    /// Closes the queue and fails unstarted calls with `Cancelled`. Does not wait
    /// for a call the adapter is still executing.
    pub fn shutdown(&self) -> usize {
        let drained: Vec<PendingCall> = {
            let mut queue = self.shared.lock();
            if queue.closed {
                return 0;
            }
            queue.closed = true;
            queue.calls.drain(..).collect()
        };
        self.shared.ready.notify_all();

        let count = drained.len();
        drained.into_iter().for_each(PendingCall::cancel);
        tracing::info!(bridge = %self.name, cancelled = count, "Automation bridge shutting down");

        if let Ok(mut worker) = self.worker.lock() {
            // Detach the handle; the worker exits on its own once the adapter returns.
            worker.take();
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Calls the adapter is executing right now. Never exceeds one.
    pub fn executing(&self) -> usize {
        self.shared.executing.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.shared.lock().calls.len()
    }
}

impl Drop for AutomationBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<A: AutomationAdapter>(name: String, mut adapter: A, shared: Arc<Shared>) {
    loop {
        let next = {
            let mut queue = shared.lock();
            loop {
                if let Some(call) = queue.calls.pop_front() {
                    break Some(call);
                }
                if queue.closed {
                    break None;
                }
                queue = shared
                    .ready
                    .wait(queue)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        };
        let Some(call) = next else {
            break;
        };

        if call.reply.is_closed() {
            tracing::debug!(bridge = %name, id = call.id, "Skipping abandoned bridge call");
            continue;
        }
        if Instant::now() >= call.deadline {
            let _ = call.reply.send(Err(BridgeError::Timeout {
                operation: call.operation.name(),
                after: call.timeout,
            }));
            continue;
        }

        shared.executing.fetch_add(1, Ordering::SeqCst);
        let result = execute(&mut adapter, call.operation);
        shared.executing.fetch_sub(1, Ordering::SeqCst);

        if let Err(e) = &result {
            tracing::debug!(bridge = %name, id = call.id, error = %e, "Adapter call failed");
        }
        let _ = call.reply.send(result.map_err(BridgeError::from));
    }

    adapter.detach();
    tracing::info!(bridge = %name, "Automation bridge stopped");
}

fn execute<A: AutomationAdapter>(adapter: &mut A, operation: Operation) -> Result<Reply, AdapterError> {
    match operation {
        Operation::Attach { document } => adapter.attach(document.as_deref()).map(|_| Reply::Done),
        Operation::Detach => {
            adapter.detach();
            Ok(Reply::Done)
        }
        Operation::ReadModule { name } => adapter.read_module(&name).map(Reply::Text),
        Operation::WriteModule { name, text } => {
            adapter.write_module(&name, &text).map(|_| Reply::Done)
        }
        Operation::GetState => adapter.get_state().map(Reply::State),
        Operation::SendCommand(command) => adapter.send_command(command).map(|_| Reply::Done),
        Operation::ListProjects => adapter.list_projects().map(Reply::Projects),
        Operation::Evaluate { expression } => adapter.evaluate(&expression).map(Reply::Text),
    }
}
