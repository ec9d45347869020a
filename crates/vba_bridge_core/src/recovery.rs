//! Retry, circuit breaking and guaranteed breakpoint cleanup around the bridge.

use crate::adapter::{CommandKind, ExecutionState};
use crate::breakpoints::insert_marker;
use crate::bridge::{AutomationBridge, CallOwner, Operation, Reply};
use crate::config::DebugConfig;
use crate::error::{AdapterError, BridgeError, DebugError};
use crate::source::ModuleText;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// `base * 2^attempt`, capped.
pub fn backoff(base: Duration, attempt: u32, cap: Duration) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt)).min(cap)
}

/// One session's view of a shared bridge.
///
/// Every call is tagged with the session's owner id, retried on transient
/// failures and counted towards a consecutive-failure breaker. Once the
/// breaker trips, calls fail fast with [`DebugError::CircuitOpen`] until
/// [`RecoveringBridge::reset`].
pub struct RecoveringBridge {
    bridge: Arc<AutomationBridge>,
    owner: CallOwner,
    config: DebugConfig,
    failures: AtomicU32,
}

impl RecoveringBridge {
    pub fn new(bridge: Arc<AutomationBridge>, owner: CallOwner, config: DebugConfig) -> Self {
        Self {
            bridge,
            owner,
            config,
            failures: AtomicU32::new(0),
        }
    }

    pub fn owner(&self) -> CallOwner {
        self.owner
    }

    pub fn bridge(&self) -> &Arc<AutomationBridge> {
        &self.bridge
    }

    pub fn config(&self) -> &DebugConfig {
        &self.config
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn is_degraded(&self) -> bool {
        let threshold = self.config.circuit_threshold;
        threshold > 0 && self.consecutive_failures() >= threshold
    }

    pub fn reset(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }

    async fn call_with(
        &self,
        operation: Operation,
        timeout: Duration,
        retries: u32,
    ) -> Result<Reply, DebugError> {
        if self.is_degraded() {
            return Err(DebugError::CircuitOpen {
                failures: self.consecutive_failures(),
            });
        }

        let mut attempt = 0;
        loop {
            match self.bridge.call(self.owner, operation.clone(), timeout).await {
                Ok(reply) => {
                    self.reset();
                    return Ok(reply);
                }
                Err(err) if err.is_transient() && attempt < retries => {
                    let delay = backoff(self.config.retry_base_delay, attempt, Duration::MAX);
                    tracing::warn!(
                        owner = self.owner,
                        operation = operation.name(),
                        attempt = attempt + 1,
                        ?delay,
                        "Retrying bridge call: {err}"
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(self.record_failure(err)),
            }
        }
    }

    fn record_failure(&self, err: BridgeError) -> DebugError {
        match &err {
            e if e.is_transient() || e.is_disconnect() => {}
            BridgeError::Cancelled(_) => return err.into(),
            // The target answered, so the connection itself is healthy.
            _ => {
                self.reset();
                return err.into();
            }
        }

        let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        let threshold = self.config.circuit_threshold;
        if threshold > 0 && failures >= threshold {
            tracing::error!(owner = self.owner, failures, "Circuit opened: {err}");
            return DebugError::CircuitOpen { failures };
        }
        err.into()
    }

    pub async fn attach(&self, document: Option<&str>) -> Result<(), DebugError> {
        let operation = Operation::Attach {
            document: document.map(str::to_string),
        };
        match self
            .call_with(operation, self.config.command_timeout, self.config.retry_count)
            .await
        {
            Ok(Reply::Done) => Ok(()),
            Ok(_) => Err(BridgeError::UnexpectedReply("attach").into()),
            Err(DebugError::Bridge(BridgeError::Adapter(AdapterError::Attach(reason)))) => {
                Err(DebugError::Attach(reason))
            }
            Err(err) => Err(err),
        }
    }

    pub async fn detach(&self) -> Result<(), DebugError> {
        self.call_with(Operation::Detach, self.config.call_timeout, 0)
            .await
            .map(|_| ())
    }

    pub async fn read_module(&self, name: &str) -> Result<String, DebugError> {
        let operation = Operation::ReadModule {
            name: name.to_string(),
        };
        match self
            .call_with(operation, self.config.call_timeout, self.config.retry_count)
            .await?
        {
            Reply::Text(text) => Ok(text),
            _ => Err(BridgeError::UnexpectedReply("read_module").into()),
        }
    }

    /// Whole-module replacement. Safe to retry since the same text is written each time.
    pub async fn write_module(&self, name: &str, text: &str) -> Result<(), DebugError> {
        let operation = Operation::WriteModule {
            name: name.to_string(),
            text: text.to_string(),
        };
        self.call_with(operation, self.config.call_timeout, self.config.retry_count)
            .await
            .map(|_| ())
    }

    pub async fn get_state(&self) -> Result<ExecutionState, DebugError> {
        match self
            .call_with(Operation::GetState, self.config.call_timeout, self.config.retry_count)
            .await?
        {
            Reply::State(state) => Ok(state),
            _ => Err(BridgeError::UnexpectedReply("get_state").into()),
        }
    }

    /// Single state poll with no retry and no effect on the breaker; the
    /// monitor applies its own backoff.
    pub async fn poll_state(&self) -> Result<ExecutionState, BridgeError> {
        match self
            .bridge
            .call(self.owner, Operation::GetState, self.config.call_timeout)
            .await?
        {
            Reply::State(state) => Ok(state),
            _ => Err(BridgeError::UnexpectedReply("get_state")),
        }
    }

    /// Execution commands are never retried: a repeated step would run twice.
    pub async fn send_command(&self, command: CommandKind) -> Result<(), DebugError> {
        self.call_with(
            Operation::SendCommand(command),
            self.config.command_timeout,
            0,
        )
        .await
        .map(|_| ())
    }

    pub async fn list_projects(&self) -> Result<Vec<String>, DebugError> {
        match self
            .call_with(Operation::ListProjects, self.config.call_timeout, self.config.retry_count)
            .await?
        {
            Reply::Projects(projects) => Ok(projects),
            _ => Err(BridgeError::UnexpectedReply("list_projects").into()),
        }
    }

    pub async fn evaluate(&self, expression: &str) -> Result<String, DebugError> {
        let operation = Operation::Evaluate {
            expression: expression.to_string(),
        };
        match self.call_with(operation, self.config.call_timeout, 0).await? {
            Reply::Text(value) => Ok(value),
            _ => Err(BridgeError::UnexpectedReply("evaluate").into()),
        }
    }
}

/// The original text of a line that holds (or is about to hold) an injected marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalLineRecord {
    pub module: String,
    pub line: u32,
    pub original: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupFailure {
    pub module: String,
    pub line: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    fn success(&mut self) {
        self.succeeded += 1;
    }

    fn failure(&mut self, module: &str, line: u32, reason: impl Into<String>) {
        self.failed += 1;
        self.failures.push(CleanupFailure {
            module: module.to_string(),
            line,
            reason: reason.into(),
        });
    }

    pub fn merge(&mut self, other: CleanupReport) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.failures.extend(other.failures);
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }
}

impl fmt::Display for CleanupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} succeeded / {} failed", self.succeeded, self.failed)?;
        for failure in &self.failures {
            write!(f, "; {}:{} {}", failure.module, failure.line, failure.reason)?;
        }
        Ok(())
    }
}

type RecordKey = (String, u32);

/// Every marker that may currently be present in a target, shared by all
/// sessions debugging that target.
///
/// Records are added before the write that injects the marker and removed only
/// after the write that restores the line succeeded, so the registry never
/// understates what the target holds. All read-modify-write sequences on module
/// text hold [`CleanupRegistry::lock_writes`].
#[derive(Default)]
pub struct CleanupRegistry {
    records: Mutex<BTreeMap<RecordKey, String>>,
    writes: tokio::sync::Mutex<()>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<RecordKey, String>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn lock_writes(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.writes.lock().await
    }

    /// Returns false if a record for this line already exists.
    pub(crate) fn register(&self, module: &str, line: u32, original: &str) -> bool {
        let mut records = self.lock();
        let key = (module.to_string(), line);
        if records.contains_key(&key) {
            return false;
        }
        records.insert(key, original.to_string());
        true
    }

    pub(crate) fn unregister(&self, module: &str, line: u32) -> Option<OriginalLineRecord> {
        self.lock()
            .remove(&(module.to_string(), line))
            .map(|original| OriginalLineRecord {
                module: module.to_string(),
                line,
                original,
            })
    }

    pub fn record(&self, module: &str, line: u32) -> Option<OriginalLineRecord> {
        self.lock()
            .get(&(module.to_string(), line))
            .map(|original| OriginalLineRecord {
                module: module.to_string(),
                line,
                original: original.clone(),
            })
    }

    pub fn records(&self) -> Vec<OriginalLineRecord> {
        self.lock()
            .iter()
            .map(|((module, line), original)| OriginalLineRecord {
                module: module.clone(),
                line: *line,
                original: original.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Restores every recorded line, optionally only in `module`. Never fails;
    /// lines that could not be restored stay registered and are reported.
    pub async fn cleanup(&self, bridge: &RecoveringBridge, module: Option<&str>) -> CleanupReport {
        let _writes = self.lock_writes().await;
        let keys: Vec<RecordKey> = self
            .lock()
            .keys()
            .filter(|(name, _)| module.map_or(true, |m| m == name.as_str()))
            .cloned()
            .collect();
        let report = self.restore_locked(bridge, keys).await;
        if !report.is_clean() {
            tracing::error!(?module, %report, "Breakpoint cleanup incomplete");
        } else if report.total() > 0 {
            tracing::info!(?module, %report, "Breakpoint cleanup finished");
        }
        report
    }

    /// Restores the given lines. The caller must hold [`CleanupRegistry::lock_writes`].
    pub(crate) async fn restore_locked(
        &self,
        bridge: &RecoveringBridge,
        keys: Vec<RecordKey>,
    ) -> CleanupReport {
        let mut by_module: BTreeMap<String, Vec<u32>> = BTreeMap::new();
        for (module, line) in keys {
            by_module.entry(module).or_default().push(line);
        }

        let mut report = CleanupReport::default();
        for (module, lines) in by_module {
            let text = match bridge.read_module(&module).await {
                Ok(text) => text,
                Err(err) => {
                    for line in lines {
                        report.failure(&module, line, err.to_string());
                    }
                    continue;
                }
            };

            let mut parsed = ModuleText::parse(&text);
            let mut restored = Vec::new();
            for line in lines {
                let Some(record) = self.record(&module, line) else {
                    continue;
                };
                match restore_line(&mut parsed, &record) {
                    Ok(()) => restored.push(line),
                    Err(reason) => report.failure(&module, line, reason),
                }
            }

            let rendered = parsed.render();
            if rendered != text {
                if let Err(err) = bridge.write_module(&module, &rendered).await {
                    for line in restored {
                        report.failure(&module, line, err.to_string());
                    }
                    continue;
                }
            }
            for line in restored {
                self.unregister(&module, line);
                report.success();
            }
        }
        report
    }
}

/// Puts `record.original` back into `module`. A marker is looked for at the
/// recorded line first, then anywhere in the module in case lines shifted.
fn restore_line(module: &mut ModuleText, record: &OriginalLineRecord) -> Result<(), String> {
    let marked = insert_marker(&record.original);
    let current = module
        .line(record.line)
        .ok_or_else(|| format!("line {} is past the end of the module", record.line))?;

    if current == record.original {
        return Ok(());
    }
    if current == marked {
        module.replace(record.line, &record.original);
        return Ok(());
    }

    let moved: Vec<u32> = module
        .bodies()
        .enumerate()
        .filter(|(_, body)| *body == marked)
        .map(|(index, _)| index as u32 + 1)
        .collect();
    if let [line] = moved.as_slice() {
        module.replace(*line, &record.original);
        return Ok(());
    }

    Err(format!(
        "no marker found; line now reads '{}'",
        current.trim()
    ))
}
