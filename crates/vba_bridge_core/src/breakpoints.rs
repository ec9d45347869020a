//! Breakpoints as reversible source edits.
//!
//! A breakpoint is a `Stop: ` statement spliced in after a line's indentation.
//! The original line is recorded in the shared [`CleanupRegistry`] before the
//! module is written, and every read-modify-write of module text holds the
//! registry's write gate so concurrent edits to one module cannot interleave.

use crate::bridge::CallOwner;
use crate::error::{AdapterError, BridgeError, DebugError};
use crate::recovery::{CleanupRegistry, CleanupReport, RecoveringBridge};
use crate::source::{classify_lines, LineKind, ModuleText};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub const MARKER: &str = "Stop: ";

pub type BreakpointId = u64;

pub fn insert_marker(body: &str) -> String {
    let indent = body.len() - body.trim_start().len();
    format!("{}{}{}", &body[..indent], MARKER, &body[indent..])
}

/// Inverse of [`insert_marker`], or `None` if the line carries no marker.
pub fn strip_marker(body: &str) -> Option<String> {
    let indent = body.len() - body.trim_start().len();
    body[indent..]
        .strip_prefix(MARKER)
        .map(|rest| format!("{}{}", &body[..indent], rest))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    /// We wrote a marker into the line.
    Injected,
    /// The line already was a `Stop` statement; nothing was written.
    PreExisting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Breakpoint {
    pub id: BreakpointId,
    pub module: String,
    pub line: u32,
    pub verified: bool,
    pub marker: Option<MarkerKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reverification {
    Intact,
    /// The target lost the marker and it was written again.
    Reinjected,
    /// The line no longer exists in a recognisable form; the breakpoint was dropped.
    Lost(String),
}

struct Entry {
    breakpoint: Breakpoint,
    owners: BTreeSet<CallOwner>,
}

type Key = (String, u32);

/// Logical breakpoints for one target, shared by every session attached to it.
/// A breakpoint set by several sessions is restored when the last one removes it.
pub struct BreakpointManager {
    registry: Arc<CleanupRegistry>,
    entries: Mutex<BTreeMap<Key, Entry>>,
    next_id: AtomicU64,
}

impl BreakpointManager {
    pub fn new(registry: Arc<CleanupRegistry>) -> Self {
        Self {
            registry,
            entries: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &Arc<CleanupRegistry> {
        &self.registry
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<Key, Entry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_id(&self) -> BreakpointId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// An unverified breakpoint carrying the reason it could not be set.
    pub fn rejected(&self, module: &str, line: u32, reason: impl Into<String>) -> Breakpoint {
        Breakpoint {
            id: self.next_id(),
            module: module.to_string(),
            line,
            verified: false,
            marker: None,
            message: Some(reason.into()),
        }
    }

    pub fn get(&self, module: &str, line: u32) -> Option<Breakpoint> {
        self.lock()
            .get(&(module.to_string(), line))
            .map(|entry| entry.breakpoint.clone())
    }

    pub fn is_verified_at(&self, module: &str, line: u32) -> bool {
        self.lock()
            .get(&(module.to_string(), line))
            .is_some_and(|entry| entry.breakpoint.verified)
    }

    /// Breakpoints owned by `owner`, or all of them.
    pub fn breakpoints(&self, owner: Option<CallOwner>) -> Vec<Breakpoint> {
        self.lock()
            .values()
            .filter(|entry| owner.map_or(true, |o| entry.owners.contains(&o)))
            .map(|entry| entry.breakpoint.clone())
            .collect()
    }

    /// Sets a breakpoint for the session behind `bridge`. Setting an existing
    /// breakpoint again returns it unchanged without touching the module.
    pub async fn set(
        &self,
        bridge: &RecoveringBridge,
        module: &str,
        line: u32,
    ) -> Result<Breakpoint, DebugError> {
        let _writes = self.registry.lock_writes().await;
        let owner = bridge.owner();

        let existing = self
            .lock()
            .get_mut(&(module.to_string(), line))
            .map(|entry| {
                entry.owners.insert(owner);
                entry.breakpoint.clone()
            });
        if let Some(breakpoint) = existing {
            return Ok(breakpoint);
        }

        let text = bridge
            .read_module(module)
            .await
            .map_err(|err| as_injection_failure(module, line, err))?;
        let mut parsed = ModuleText::parse(&text);
        let (kind, inside) = classify_lines(&parsed)
            .into_iter()
            .nth(line.saturating_sub(1) as usize)
            .filter(|_| line > 0)
            .ok_or_else(|| {
                DebugError::injection_failed(
                    module,
                    line,
                    format!("module has only {} lines", parsed.len()),
                )
            })?;
        let current = parsed.line(line).unwrap_or_default().to_string();

        // A recorded marker with no breakpoint is a timed-out write that landed anyway.
        let ours = self
            .registry
            .record(module, line)
            .is_some_and(|record| insert_marker(&record.original) == current);
        let marker = if ours {
            tracing::info!(module, line, "Adopted marker from an earlier timed-out write");
            MarkerKind::Injected
        } else {
            match (kind, inside) {
                (LineKind::Stop, true) => MarkerKind::PreExisting,
                (LineKind::Statement, true) => {
                    self.registry.unregister(module, line);
                    self.registry.register(module, line, &current);
                    parsed.replace(line, &insert_marker(&current));

                    if let Err(err) = bridge.write_module(module, &parsed.render()).await {
                        // A timed-out write may still land, so its record stays for cleanup.
                        if !matches!(err, DebugError::Bridge(BridgeError::Timeout { .. })) {
                            self.registry.unregister(module, line);
                        }
                        return Err(as_injection_failure(module, line, err));
                    }
                    MarkerKind::Injected
                }
                (kind, inside) => {
                    return Err(DebugError::injection_failed(
                        module,
                        line,
                        not_executable(&kind, inside),
                    ))
                }
            }
        };

        let breakpoint = Breakpoint {
            id: self.next_id(),
            module: module.to_string(),
            line,
            verified: true,
            marker: Some(marker),
            message: None,
        };
        self.lock().insert(
            (module.to_string(), line),
            Entry {
                breakpoint: breakpoint.clone(),
                owners: BTreeSet::from([owner]),
            },
        );
        tracing::info!(module, line, owner, ?marker, "Breakpoint set");
        Ok(breakpoint)
    }

    /// Drops the session's claim on a breakpoint and restores the line once no
    /// session holds it. Removing an unknown breakpoint is a no-op.
    pub async fn remove(&self, bridge: &RecoveringBridge, module: &str, line: u32) -> CleanupReport {
        let _writes = self.registry.lock_writes().await;
        let key = (module.to_string(), line);

        let restore = {
            let mut entries = self.lock();
            let Some(entry) = entries.get_mut(&key) else {
                return CleanupReport::default();
            };
            entry.owners.remove(&bridge.owner());
            if !entry.owners.is_empty() {
                return CleanupReport::default();
            }
            entries
                .remove(&key)
                .is_some_and(|entry| entry.breakpoint.marker == Some(MarkerKind::Injected))
        };
        tracing::info!(module, line, "Breakpoint removed");

        if restore {
            self.registry.restore_locked(bridge, vec![key]).await
        } else {
            CleanupReport::default()
        }
    }

    /// Removes every breakpoint, or every breakpoint in `module`, regardless of owner.
    pub async fn remove_all(&self, bridge: &RecoveringBridge, module: Option<&str>) -> CleanupReport {
        self.lock()
            .retain(|(name, _), _| module.is_some_and(|m| m != name.as_str()));
        self.registry.cleanup(bridge, module).await
    }

    /// Releases everything the session behind `bridge` holds, and restores
    /// records no breakpoint owns (markers from writes that timed out).
    pub async fn release(&self, bridge: &RecoveringBridge) -> CleanupReport {
        let _writes = self.registry.lock_writes().await;
        let owner = bridge.owner();

        let keys: Vec<Key> = {
            let mut entries = self.lock();
            let mut released = Vec::new();
            entries.retain(|key, entry| {
                entry.owners.remove(&owner);
                if entry.owners.is_empty() {
                    if entry.breakpoint.marker == Some(MarkerKind::Injected) {
                        released.push(key.clone());
                    }
                    false
                } else {
                    true
                }
            });
            let orphaned: Vec<Key> = self
                .registry
                .records()
                .into_iter()
                .map(|record| (record.module, record.line))
                .filter(|key| !entries.contains_key(key) && !released.contains(key))
                .collect();
            released.extend(orphaned);
            released
        };
        self.registry.restore_locked(bridge, keys).await
    }

    /// Replaces the session's breakpoints in `module` with `lines`. Results are in
    /// request order; a failed line yields an unverified breakpoint with its reason.
    pub async fn replace_module(
        &self,
        bridge: &RecoveringBridge,
        module: &str,
        lines: &[u32],
    ) -> Result<Vec<Breakpoint>, DebugError> {
        let stale: Vec<u32> = self
            .breakpoints(Some(bridge.owner()))
            .into_iter()
            .filter(|bp| bp.module == module && !lines.contains(&bp.line))
            .map(|bp| bp.line)
            .collect();
        for line in stale {
            let report = self.remove(bridge, module, line).await;
            if !report.is_clean() {
                tracing::warn!(module, line, %report, "Breakpoint removal left the line marked");
            }
        }

        let mut results = Vec::with_capacity(lines.len());
        for &line in lines {
            match self.set(bridge, module, line).await {
                Ok(breakpoint) => results.push(breakpoint),
                Err(DebugError::InjectionFailed { reason, .. }) => {
                    tracing::warn!(module, line, "Breakpoint not verified: {reason}");
                    results.push(self.rejected(module, line, reason));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(results)
    }

    /// Checks the session's breakpoints against the target's current text after a
    /// reconnect, re-injecting markers the target lost.
    pub async fn reverify(
        &self,
        bridge: &RecoveringBridge,
    ) -> Result<Vec<(Breakpoint, Reverification)>, DebugError> {
        let _writes = self.registry.lock_writes().await;
        let mut by_module: BTreeMap<String, Vec<Breakpoint>> = BTreeMap::new();
        for breakpoint in self.breakpoints(Some(bridge.owner())) {
            by_module
                .entry(breakpoint.module.clone())
                .or_default()
                .push(breakpoint);
        }

        let mut outcomes = Vec::new();
        for (module, breakpoints) in by_module {
            let text = bridge.read_module(&module).await?;
            let mut parsed = ModuleText::parse(&text);
            let mut module_outcomes = Vec::new();

            for breakpoint in breakpoints {
                let outcome = self.reverify_line(&mut parsed, &breakpoint);
                if outcome != Reverification::Intact {
                    let desync = DebugError::StateDesync {
                        module: module.clone(),
                        line: breakpoint.line,
                        detail: format!("{outcome:?}"),
                    };
                    tracing::warn!("{desync}");
                }
                module_outcomes.push((breakpoint, outcome));
            }

            let rendered = parsed.render();
            if rendered != text {
                if let Err(err) = bridge.write_module(&module, &rendered).await {
                    let reason = err.to_string();
                    for (breakpoint, outcome) in &mut module_outcomes {
                        if *outcome == Reverification::Reinjected {
                            *outcome = Reverification::Lost(reason.clone());
                            self.forget(&breakpoint.module, breakpoint.line);
                        }
                    }
                }
            }
            outcomes.extend(module_outcomes.into_iter().map(|(mut breakpoint, outcome)| {
                if let Reverification::Lost(reason) = &outcome {
                    breakpoint.verified = false;
                    breakpoint.message = Some(reason.clone());
                }
                (breakpoint, outcome)
            }));
        }
        Ok(outcomes)
    }

    fn reverify_line(&self, module: &mut ModuleText, breakpoint: &Breakpoint) -> Reverification {
        let (name, line) = (breakpoint.module.as_str(), breakpoint.line);
        let current = module.line(line).map(str::to_string);

        if breakpoint.marker == Some(MarkerKind::PreExisting) {
            let still_stop = current
                .as_deref()
                .is_some_and(|body| crate::source::classify(body) == LineKind::Stop);
            if still_stop {
                return Reverification::Intact;
            }
            self.forget(name, line);
            return Reverification::Lost("the Stop statement is gone".into());
        }

        let Some(record) = self.registry.record(name, line) else {
            self.forget(name, line);
            return Reverification::Lost("no original text recorded".into());
        };
        let Some(current) = current else {
            self.forget(name, line);
            return Reverification::Lost(format!("line {line} is past the end of the module"));
        };

        if current == insert_marker(&record.original) {
            Reverification::Intact
        } else if current == record.original {
            module.replace(line, &insert_marker(&record.original));
            Reverification::Reinjected
        } else {
            self.forget(name, line);
            Reverification::Lost(format!("line now reads '{}'", current.trim()))
        }
    }

    /// Drops a breakpoint whose marker is known to be absent from the target.
    fn forget(&self, module: &str, line: u32) {
        self.lock().remove(&(module.to_string(), line));
        self.registry.unregister(module, line);
    }
}

fn as_injection_failure(module: &str, line: u32, err: DebugError) -> DebugError {
    match err {
        DebugError::Bridge(BridgeError::Adapter(
            e @ (AdapterError::NotFound(_) | AdapterError::Locked(_) | AdapterError::Unsupported(_)),
        )) => DebugError::injection_failed(module, line, e.to_string()),
        DebugError::Bridge(e @ BridgeError::Timeout { .. }) => {
            DebugError::injection_failed(module, line, e.to_string())
        }
        other => other,
    }
}

fn not_executable(kind: &LineKind, inside: bool) -> String {
    if !inside {
        return "line is outside any procedure".into();
    }
    let what = match kind {
        LineKind::Blank => "blank",
        LineKind::Comment => "a comment",
        LineKind::Directive => "a directive",
        LineKind::Declaration => "a declaration",
        LineKind::ProcedureStart(_) => "a procedure header",
        LineKind::ProcedureEnd => "a procedure end",
        LineKind::BlockStructure => "block structure",
        LineKind::Label => "a label",
        LineKind::Continuation => "a continuation line",
        LineKind::Stop | LineKind::Statement => "executable",
    };
    format!("line is {what}, not an executable statement")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::AutomationBridge;
    use crate::config::DebugConfig;
    use crate::memory::MemoryTarget;
    use std::time::Duration;

    const MODULE: &str = "Option Explicit\r\n\
Private total As Long\r\n\
\r\n\
Public Sub Main()\r\n\
    Dim i As Long\r\n\
    For i = 1 To 3\r\n\
        total = total + i\r\n\
    Next\r\n\
    If total > 3 Then\r\n\
        Debug.Print total\r\n\
    End If\r\n\
    Helper\r\n\
End Sub\r\n\
\r\n\
Private Sub Helper()\r\n\
    Stop\r\n\
    total = 0\r\n\
End Sub\r\n";

    struct Fixture {
        target: MemoryTarget,
        bridge: Arc<AutomationBridge>,
        manager: BreakpointManager,
    }

    impl Fixture {
        async fn new() -> Self {
            let target = MemoryTarget::new().with_module("Mod1", MODULE);
            let adapter = target.clone();
            let bridge = Arc::new(AutomationBridge::spawn("bp", move || adapter).unwrap());
            let manager = BreakpointManager::new(Arc::new(CleanupRegistry::new()));
            let fixture = Self {
                target,
                bridge,
                manager,
            };
            fixture.session(1).attach(None).await.unwrap();
            fixture
        }

        fn session(&self, owner: CallOwner) -> RecoveringBridge {
            let config = DebugConfig::default().with_retries(0, Duration::ZERO);
            RecoveringBridge::new(self.bridge.clone(), owner, config)
        }

        fn text(&self) -> String {
            self.target.module("Mod1").unwrap()
        }
    }

    fn markers(text: &str) -> usize {
        text.lines().filter(|l| strip_marker(l).is_some()).count()
    }

    #[test]
    fn test_marker_is_reversible() {
        for body in ["x = 1", "    total = total + i", "\tCall Foo", ""] {
            let marked = insert_marker(body);
            assert!(marked.trim_start().starts_with(MARKER));
            assert_eq!(strip_marker(&marked).as_deref(), Some(body));
        }
        assert_eq!(strip_marker("    x = 1"), None);
    }

    #[tokio::test]
    async fn test_set_injects_marker() {
        let fx = Fixture::new().await;
        let session = fx.session(1);

        let bp = fx.manager.set(&session, "Mod1", 7).await.unwrap();
        assert!(bp.verified);
        assert_eq!(bp.marker, Some(MarkerKind::Injected));
        assert!(fx.text().contains("        Stop: total = total + i\r\n"));
        assert_eq!(
            fx.manager.registry().record("Mod1", 7).unwrap().original,
            "        total = total + i"
        );
    }

    #[tokio::test]
    async fn test_set_twice_is_idempotent() {
        let fx = Fixture::new().await;
        let session = fx.session(1);

        let first = fx.manager.set(&session, "Mod1", 7).await.unwrap();
        let second = fx.manager.set(&session, "Mod1", 7).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(markers(&fx.text()), 1);
        assert_eq!(fx.target.write_count(), 1);
    }

    #[tokio::test]
    async fn test_non_executable_lines_are_rejected() {
        let fx = Fixture::new().await;
        let session = fx.session(1);

        for line in [1, 2, 3, 4, 5, 8, 9, 11, 13, 99] {
            let err = fx.manager.set(&session, "Mod1", line).await.unwrap_err();
            assert!(
                matches!(err, DebugError::InjectionFailed { line: l, .. } if l == line),
                "line {line}: {err}"
            );
        }
        assert_eq!(fx.text(), MODULE);
        assert!(fx.manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_existing_stop_is_not_rewritten() {
        let fx = Fixture::new().await;
        let session = fx.session(1);

        let bp = fx.manager.set(&session, "Mod1", 16).await.unwrap();
        assert!(bp.verified);
        assert_eq!(bp.marker, Some(MarkerKind::PreExisting));
        assert_eq!(fx.target.write_count(), 0);

        let report = fx.manager.remove(&session, "Mod1", 16).await;
        assert_eq!(report.total(), 0);
        assert_eq!(fx.text(), MODULE);
    }

    #[tokio::test]
    async fn test_protected_line_leaves_no_trace() {
        let fx = Fixture::new().await;
        let session = fx.session(1);
        fx.target.protect_line("Mod1", 10);

        let err = fx.manager.set(&session, "Mod1", 10).await.unwrap_err();
        assert!(matches!(err, DebugError::InjectionFailed { line: 10, .. }));
        assert_eq!(fx.text(), MODULE);
        assert!(fx.manager.registry().record("Mod1", 10).is_none());
        assert!(fx.manager.get("Mod1", 10).is_none());
    }

    #[tokio::test]
    async fn test_set_remove_sequences_restore_original() {
        let fx = Fixture::new().await;
        let session = fx.session(1);
        let lines = [6, 7, 10, 12, 17];

        let mut seed = 17u32;
        for _ in 0..40 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let line = lines[(seed >> 16) as usize % lines.len()];
            if seed & 1 == 0 {
                fx.manager.set(&session, "Mod1", line).await.unwrap();
            } else {
                assert!(fx.manager.remove(&session, "Mod1", line).await.is_clean());
            }
            assert_eq!(markers(&fx.text()), fx.manager.breakpoints(None).len());
        }

        let report = fx.manager.remove_all(&session, None).await;
        assert!(report.is_clean());
        assert_eq!(fx.text(), MODULE);
        assert!(fx.manager.breakpoints(None).is_empty());
    }

    #[tokio::test]
    async fn test_shared_breakpoint_survives_until_last_owner() {
        let fx = Fixture::new().await;
        let (alice, bob) = (fx.session(1), fx.session(2));

        let a = fx.manager.set(&alice, "Mod1", 12).await.unwrap();
        let b = fx.manager.set(&bob, "Mod1", 12).await.unwrap();
        assert_eq!(a.id, b.id);

        fx.manager.remove(&alice, "Mod1", 12).await;
        assert_eq!(markers(&fx.text()), 1);

        let report = fx.manager.release(&bob).await;
        assert_eq!(report.succeeded, 1);
        assert_eq!(fx.text(), MODULE);
    }

    #[tokio::test]
    async fn test_replace_module_reports_in_request_order() {
        let fx = Fixture::new().await;
        let session = fx.session(1);

        fx.manager.set(&session, "Mod1", 6).await.unwrap();
        let result = fx
            .manager
            .replace_module(&session, "Mod1", &[12, 2, 7])
            .await
            .unwrap();
        let summary: Vec<(u32, bool)> = result.iter().map(|bp| (bp.line, bp.verified)).collect();
        assert_eq!(summary, vec![(12, true), (2, false), (7, true)]);
        assert!(result[1].message.is_some());
        assert!(fx.manager.get("Mod1", 6).is_none());
        assert_eq!(markers(&fx.text()), 2);
    }

    #[tokio::test]
    async fn test_leading_stop_in_source_is_left_alone() {
        let fx = Fixture::new().await;
        let session = fx.session(1);
        let original = MODULE.replace("    Helper\r\n", "    Stop: Helper\r\n");
        fx.target.set_module("Mod1", &original);

        let bp = fx.manager.set(&session, "Mod1", 12).await.unwrap();
        assert!(bp.verified);
        assert_eq!(bp.marker, Some(MarkerKind::PreExisting));
        assert!(fx.manager.registry().is_empty());

        let report = fx.manager.remove(&session, "Mod1", 12).await;
        assert_eq!(report.total(), 0);
        assert_eq!(fx.text(), original);
        assert_eq!(fx.target.write_count(), 0);
    }

    #[tokio::test]
    async fn test_recorded_marker_is_adopted() {
        let fx = Fixture::new().await;
        let session = fx.session(1);
        // What a timed-out write that still landed leaves behind.
        fx.manager.registry().register("Mod1", 12, "    Helper");
        fx.target
            .set_module("Mod1", &MODULE.replace("    Helper\r\n", "    Stop: Helper\r\n"));

        let bp = fx.manager.set(&session, "Mod1", 12).await.unwrap();
        assert_eq!(bp.marker, Some(MarkerKind::Injected));
        assert_eq!(markers(&fx.text()), 1);
        assert_eq!(fx.target.write_count(), 0);

        fx.manager.remove(&session, "Mod1", 12).await;
        assert_eq!(fx.text(), MODULE);
        assert!(fx.manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_release_restores_write_that_landed_after_timeout() {
        let fx = Fixture::new().await;
        let config = DebugConfig::default()
            .with_retries(0, Duration::ZERO)
            .with_call_timeout(Duration::from_millis(100));
        let session = RecoveringBridge::new(fx.bridge.clone(), 1, config);
        fx.target.set_write_delay(Duration::from_millis(300));

        let err = fx.manager.set(&session, "Mod1", 7).await.unwrap_err();
        assert!(matches!(err, DebugError::InjectionFailed { line: 7, .. }));
        assert!(fx.manager.get("Mod1", 7).is_none());
        assert!(fx.manager.registry().record("Mod1", 7).is_some());

        tokio::time::sleep(Duration::from_millis(400)).await;
        fx.target.set_write_delay(Duration::ZERO);
        assert_eq!(markers(&fx.text()), 1);

        let report = fx.manager.release(&session).await;
        assert_eq!(report.succeeded, 1);
        assert!(report.is_clean());
        assert_eq!(fx.text(), MODULE);
        assert!(fx.manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_sets_on_one_module_keep_both_markers() {
        let fx = Fixture::new().await;
        let (alice, bob) = (fx.session(1), fx.session(2));
        fx.target.set_delay(Duration::from_millis(5));

        let (a, b) = tokio::join!(
            fx.manager.set(&alice, "Mod1", 7),
            fx.manager.set(&bob, "Mod1", 12),
        );
        assert!(a.unwrap().verified);
        assert!(b.unwrap().verified);

        let text = fx.text();
        assert!(text.contains("        Stop: total = total + i\r\n"));
        assert!(text.contains("    Stop: Helper\r\n"));
        assert_eq!(markers(&text), 2);
        assert_eq!(fx.target.write_count(), 2);

        fx.target.set_delay(Duration::ZERO);
        fx.manager.release(&alice).await;
        fx.manager.release(&bob).await;
        assert_eq!(fx.text(), MODULE);
    }

    #[tokio::test]
    async fn test_reverify_reinjects_lost_markers() {
        let fx = Fixture::new().await;
        let session = fx.session(1);
        for line in [7, 10, 12] {
            fx.manager.set(&session, "Mod1", line).await.unwrap();
        }

        // The target reloaded the module from disk, without any markers.
        let reloaded = fx.text().replace("Stop: Helper", "Helper");
        fx.target.set_module("Mod1", &reloaded);

        let outcomes = fx.manager.reverify(&session).await.unwrap();
        let summary: Vec<(u32, Reverification)> = outcomes
            .into_iter()
            .map(|(bp, outcome)| (bp.line, outcome))
            .collect();
        assert_eq!(
            summary,
            vec![
                (7, Reverification::Intact),
                (10, Reverification::Intact),
                (12, Reverification::Reinjected),
            ]
        );
        assert_eq!(markers(&fx.text()), 3);
    }

    #[tokio::test]
    async fn test_reverify_does_not_adopt_edited_line() {
        let fx = Fixture::new().await;
        let session = fx.session(1);
        fx.manager.set(&session, "Mod1", 7).await.unwrap();

        let edited = fx
            .text()
            .replace("Stop: total = total + i", "Stop: total = total + 2 * i");
        fx.target.set_module("Mod1", &edited);

        let outcomes = fx.manager.reverify(&session).await.unwrap();
        assert!(matches!(outcomes[0].1, Reverification::Lost(_)));
        assert!(!outcomes[0].0.verified);
        assert!(fx.manager.get("Mod1", 7).is_none());
        assert_eq!(fx.text(), edited);
    }
}
