//! One editor's debugging conversation with a target.

use crate::adapter::{CommandKind, Location};
use crate::breakpoints::{Breakpoint, BreakpointManager, Reverification};
use crate::bridge::CallOwner;
use crate::config::DebugConfig;
use crate::error::DebugError;
use crate::inspector::{self, FrameVariables, StackFrame, VariableEntry};
use crate::monitor::{ExecutionMonitor, MonitorEvent, StopReason};
use crate::recovery::{backoff, CleanupReport, RecoveringBridge};
use crate::target::TargetHandle;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub type SessionId = CallOwner;

const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(30);
const LOCALS_SCOPE: u64 = 1;
const GLOBALS_SCOPE: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Uninitialized,
    Initializing,
    Attached,
    Debugging,
    Disconnecting,
    Terminated,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionMode::Uninitialized => "uninitialized",
            SessionMode::Initializing => "initializing",
            SessionMode::Attached => "attached",
            SessionMode::Debugging => "debugging",
            SessionMode::Disconnecting => "disconnecting",
            SessionMode::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartKind {
    Launch,
    Attach,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputCategory {
    Console,
    Stderr,
}

impl OutputCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputCategory::Console => "console",
            OutputCategory::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Initialized,
    Stopped {
        reason: StopReason,
        frame: Option<StackFrame>,
    },
    Continued,
    Terminated,
    /// A breakpoint's verification changed outside a `setBreakpoints` reply.
    Breakpoint(Breakpoint),
    Output {
        category: OutputCategory,
        text: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub name: &'static str,
    pub reference: u64,
}

pub struct Session {
    id: SessionId,
    mode: SessionMode,
    paused: bool,
    start: Option<StartKind>,
    document: Option<String>,
    reconnects: u32,
    config: DebugConfig,
    target: Arc<TargetHandle>,
    bridge: Arc<RecoveringBridge>,
    events: mpsc::UnboundedSender<SessionEvent>,
    monitor: Option<ExecutionMonitor>,
    monitor_tx: mpsc::UnboundedSender<MonitorEvent>,
    monitor_rx: mpsc::UnboundedReceiver<MonitorEvent>,
    stop: Option<Location>,
    variables: Option<FrameVariables>,
}

impl Session {
    pub fn new(
        id: SessionId,
        target: Arc<TargetHandle>,
        config: DebugConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let bridge = Arc::new(RecoveringBridge::new(target.bridge.clone(), id, config.clone()));
        let (monitor_tx, monitor_rx) = mpsc::unbounded_channel();
        Self {
            id,
            mode: SessionMode::Uninitialized,
            paused: false,
            start: None,
            document: None,
            reconnects: 0,
            config,
            target,
            bridge,
            events,
            monitor: None,
            monitor_tx,
            monitor_rx,
            stop: None,
            variables: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn is_paused(&self) -> bool {
        self.mode == SessionMode::Debugging && self.paused
    }

    pub fn start_kind(&self) -> Option<StartKind> {
        self.start
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    pub fn manager(&self) -> &BreakpointManager {
        &self.target.manager
    }

    fn state_name(&self) -> String {
        if self.is_paused() {
            "paused".to_string()
        } else {
            self.mode.to_string()
        }
    }

    fn require(&self, command: &str, allowed: &[SessionMode]) -> Result<(), DebugError> {
        if allowed.contains(&self.mode) {
            Ok(())
        } else {
            Err(DebugError::invalid_state(command, self.state_name()))
        }
    }

    fn require_paused(&self, command: &str) -> Result<(), DebugError> {
        if self.is_paused() {
            Ok(())
        } else {
            Err(DebugError::invalid_state(command, self.state_name()))
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn output(&self, category: OutputCategory, text: impl Into<String>) {
        self.emit(SessionEvent::Output {
            category,
            text: text.into(),
        });
    }

    fn transition(&mut self, to: SessionMode) {
        tracing::info!(session = self.id, from = %self.mode, to = %to, "Session transition");
        self.mode = to;
    }

    pub fn initialize(&mut self) -> Result<(), DebugError> {
        self.require("initialize", &[SessionMode::Uninitialized])?;
        self.transition(SessionMode::Initializing);
        Ok(())
    }

    /// `launch` and `attach` both connect to an already running host.
    pub async fn start(&mut self, kind: StartKind, document: Option<String>) -> Result<(), DebugError> {
        let command = match kind {
            StartKind::Launch => "launch",
            StartKind::Attach => "attach",
        };
        self.require(command, &[SessionMode::Initializing])?;

        self.bridge.attach(document.as_deref()).await?;
        self.start = Some(kind);
        self.document = document;
        self.transition(SessionMode::Attached);

        match self.bridge.list_projects().await {
            Ok(projects) if !projects.is_empty() => {
                self.output(OutputCategory::Console, format!("Projects: {}", projects.join(", ")))
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(session = self.id, "Cannot list projects: {err}"),
        }
        self.emit(SessionEvent::Initialized);
        Ok(())
    }

    pub async fn set_breakpoints(&mut self, module: &str, lines: &[u32]) -> Result<Vec<Breakpoint>, DebugError> {
        self.require(
            "setBreakpoints",
            &[SessionMode::Attached, SessionMode::Debugging],
        )?;
        self.target
            .manager
            .replace_module(&self.bridge, module, lines)
            .await
    }

    /// Starts watching execution; the host runs code on its own from here.
    pub fn configuration_done(&mut self) -> Result<(), DebugError> {
        self.require(
            "configurationDone",
            &[SessionMode::Attached, SessionMode::Debugging],
        )?;
        self.enter_debugging();
        Ok(())
    }

    fn enter_debugging(&mut self) {
        if self.mode == SessionMode::Attached {
            self.transition(SessionMode::Debugging);
        }
        if self.monitor.is_none() {
            self.start_monitor();
        }
    }

    fn start_monitor(&mut self) {
        let manager = self.target.manager.clone();
        self.monitor = Some(ExecutionMonitor::spawn(
            self.bridge.clone(),
            &self.config,
            move |location: &Location| manager.is_verified_at(&location.module, location.line),
            self.monitor_tx.clone(),
        ));
    }

    /// `continue`, `next`, `stepIn`, `stepOut` and `pause`.
    pub async fn execute(&mut self, command: CommandKind) -> Result<(), DebugError> {
        let name = command_name(command);
        match command {
            CommandKind::Continue => {
                self.require(name, &[SessionMode::Attached, SessionMode::Debugging])?
            }
            CommandKind::Pause => {
                self.require(name, &[SessionMode::Debugging])?;
                if self.paused {
                    return Err(DebugError::invalid_state(name, self.state_name()));
                }
            }
            _ => self.require_paused(name)?,
        }

        self.enter_debugging();
        self.bridge.send_command(command).await?;
        if let Some(monitor) = &self.monitor {
            monitor.command_sent(command);
        }
        if command != CommandKind::Pause {
            self.paused = false;
            self.stop = None;
            self.variables = None;
        }
        Ok(())
    }

    pub async fn stack_trace(&mut self) -> Result<Vec<StackFrame>, DebugError> {
        self.require_paused("stackTrace")?;
        match &self.stop {
            Some(location) => Ok(vec![inspector::frame(&self.bridge, location).await]),
            None => Ok(Vec::new()),
        }
    }

    /// Only the single frame from [`Session::stack_trace`] (id 0) has scopes.
    pub fn scopes(&self, frame_id: u64) -> Result<Vec<Scope>, DebugError> {
        self.require_paused("scopes")?;
        if frame_id != 0 {
            return Err(DebugError::UnknownFrame { frame: frame_id });
        }
        Ok(vec![
            Scope {
                name: "Locals",
                reference: LOCALS_SCOPE,
            },
            Scope {
                name: "Globals",
                reference: GLOBALS_SCOPE,
            },
        ])
    }

    /// Resolves a scope reference from [`Session::scopes`]. Unknown references are empty.
    pub async fn variables(&mut self, reference: u64) -> Result<Vec<VariableEntry>, DebugError> {
        self.require_paused("variables")?;
        let Some(location) = self.stop.clone() else {
            return Ok(Vec::new());
        };
        if reference / 1000 != 0 {
            return Ok(Vec::new());
        }

        if self.variables.is_none() {
            let listed = inspector::variables(&self.bridge, &location, true).await?;
            self.variables = Some(listed);
        }
        let cached = self.variables.as_ref();
        Ok(match reference % 1000 {
            LOCALS_SCOPE => cached.map(|v| v.locals.clone()).unwrap_or_default(),
            GLOBALS_SCOPE => cached.map(|v| v.globals.clone()).unwrap_or_default(),
            _ => Vec::new(),
        })
    }

    pub async fn evaluate(&mut self, expression: &str) -> Result<String, DebugError> {
        self.require_paused("evaluate")?;
        self.bridge.evaluate(expression).await
    }

    /// Waits for the next event from the execution monitor. Never resolves
    /// while no monitor is running.
    pub async fn next_monitor_event(&mut self) -> Option<MonitorEvent> {
        self.monitor_rx.recv().await
    }

    pub async fn handle_monitor_event(&mut self, event: MonitorEvent) {
        if self.mode != SessionMode::Debugging {
            return;
        }
        match event {
            MonitorEvent::Stopped { reason, location } => {
                self.paused = true;
                self.variables = None;
                self.stop = location.clone();
                let frame = match &location {
                    Some(location) => Some(inspector::frame(&self.bridge, location).await),
                    None => None,
                };
                tracing::info!(session = self.id, reason = reason.as_str(), ?location, "Stopped");
                self.emit(SessionEvent::Stopped { reason, frame });
            }
            MonitorEvent::Continued => {
                self.paused = false;
                self.stop = None;
                self.variables = None;
                self.emit(SessionEvent::Continued);
            }
            MonitorEvent::Ended => {
                self.paused = false;
                self.stop = None;
                self.output(OutputCategory::Console, "Execution finished");
            }
            MonitorEvent::Degraded { failures, error } => self.output(
                OutputCategory::Stderr,
                format!("Lost contact with the host ({failures} failed polls): {error}"),
            ),
            MonitorEvent::Recovered => self.output(OutputCategory::Console, "Contact with the host restored"),
            MonitorEvent::Disconnected(reason) => {
                tracing::warn!(session = self.id, "Transport lost: {reason}");
                if let Err(err) = self.reconnect().await {
                    self.fail(&err).await;
                }
            }
        }
    }

    /// Reacts to an error a request produced: reconnects on transport loss,
    /// tears the session down on fatal errors, ignores the rest.
    pub async fn handle_error(&mut self, err: &DebugError) {
        let live = matches!(self.mode, SessionMode::Attached | SessionMode::Debugging);
        if live && err.is_disconnect() {
            if let Err(err) = self.reconnect().await {
                self.fail(&err).await;
            }
        } else if err.is_fatal() && self.mode != SessionMode::Terminated {
            self.fail(err).await;
        }
    }

    /// Re-attaches with backoff and re-verifies this session's breakpoints.
    pub async fn reconnect(&mut self) -> Result<(), DebugError> {
        self.monitor = None;
        self.paused = false;
        self.stop = None;
        self.variables = None;
        self.reconnects += 1;

        let attempts = self.config.reconnect_attempts;
        let mut attached = false;
        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = backoff(self.config.reconnect_backoff, attempt - 1, MAX_RECONNECT_BACKOFF);
                tokio::time::sleep(delay).await;
            }
            self.bridge.reset();
            match self.bridge.attach(self.document.as_deref()).await {
                Ok(()) => {
                    attached = true;
                    break;
                }
                Err(err) => {
                    tracing::warn!(session = self.id, attempt = attempt + 1, "Reconnect failed: {err}")
                }
            }
        }
        if !attached {
            return Err(DebugError::ReconnectExhausted { attempts });
        }

        let outcomes = self.target.manager.reverify(&self.bridge).await?;
        for (breakpoint, outcome) in outcomes {
            match outcome {
                Reverification::Intact => {}
                Reverification::Reinjected => {
                    self.emit(SessionEvent::Breakpoint(breakpoint))
                }
                Reverification::Lost(reason) => {
                    self.output(
                        OutputCategory::Stderr,
                        format!("Breakpoint {}:{} lost: {reason}", breakpoint.module, breakpoint.line),
                    );
                    self.emit(SessionEvent::Breakpoint(breakpoint));
                }
            }
        }

        self.output(OutputCategory::Console, "Reconnected to the host");
        if self.mode == SessionMode::Debugging {
            self.start_monitor();
        }
        Ok(())
    }

    /// Forced teardown after an unrecoverable error.
    pub async fn fail(&mut self, err: &DebugError) -> CleanupReport {
        tracing::error!(session = self.id, "Session failed: {err}");
        self.output(OutputCategory::Stderr, err.to_string());
        self.teardown().await
    }

    pub async fn disconnect(&mut self) -> Result<CleanupReport, DebugError> {
        if self.mode == SessionMode::Terminated {
            return Err(DebugError::invalid_state("disconnect", self.mode));
        }
        Ok(self.teardown().await)
    }

    async fn teardown(&mut self) -> CleanupReport {
        self.transition(SessionMode::Disconnecting);
        self.monitor = None;
        let cancelled = self.target.bridge.cancel_pending(self.id);
        if cancelled > 0 {
            tracing::debug!(session = self.id, cancelled, "Cancelled pending calls");
        }

        // Cleanup must not be refused by a breaker tripped on the way here.
        self.bridge.reset();
        let report = self.target.manager.release(&self.bridge).await;
        if report.is_clean() {
            if report.total() > 0 {
                self.output(
                    OutputCategory::Console,
                    format!("Removed {} breakpoint(s)", report.succeeded),
                );
            }
        } else {
            self.output(OutputCategory::Stderr, format!("Breakpoint cleanup: {report}"));
        }

        self.transition(SessionMode::Terminated);
        self.emit(SessionEvent::Terminated);
        report
    }
}

pub fn command_name(command: CommandKind) -> &'static str {
    match command {
        CommandKind::StepOver => "next",
        CommandKind::StepIn => "stepIn",
        CommandKind::StepOut => "stepOut",
        CommandKind::Continue => "continue",
        CommandKind::Pause => "pause",
    }
}
