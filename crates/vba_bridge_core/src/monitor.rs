//! Turns state polling into discrete execution events.
//!
//! [`TransitionDetector`] is the pure state machine; [`ExecutionMonitor`] runs
//! it against a [`StateSource`] on an interval, backing off while polls fail.

use crate::adapter::{CommandKind, ExecutionMode, ExecutionState, Location};
use crate::config::DebugConfig;
use crate::error::BridgeError;
use crate::recovery::{backoff, RecoveringBridge};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Breakpoint,
    Step,
    Pause,
    /// Break mode entered for no reason we caused, typically a runtime error.
    Exception,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::Breakpoint => "breakpoint",
            StopReason::Step => "step",
            StopReason::Pause => "pause",
            StopReason::Exception => "exception",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    Stopped {
        reason: StopReason,
        location: Option<Location>,
    },
    Continued,
    /// Execution returned to design mode.
    Ended,
    Degraded {
        failures: u32,
        error: String,
    },
    Recovered,
    Disconnected(String),
}

/// Compares each polled state with the previous one.
///
/// Commands bump an epoch; a poll that started before the latest command is
/// discarded since it may describe the state before that command took effect.
#[derive(Debug, Default)]
pub struct TransitionDetector {
    previous: Option<ExecutionState>,
    last_command: Option<CommandKind>,
    awaiting: bool,
    epoch: u64,
}

impl TransitionDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn current(&self) -> Option<&ExecutionState> {
        self.previous.as_ref()
    }

    pub fn command_sent(&mut self, command: CommandKind) {
        self.last_command = Some(command);
        self.awaiting = true;
        self.epoch += 1;
    }

    /// Forgets the previous state, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.previous = None;
        self.awaiting = false;
        self.epoch += 1;
    }

    pub fn observe<F>(&mut self, epoch: u64, state: ExecutionState, is_breakpoint: F) -> Option<MonitorEvent>
    where
        F: Fn(&Location) -> bool,
    {
        if epoch != self.epoch {
            return None;
        }
        let previous = self.previous.replace(state.clone());
        let previous_mode = previous.as_ref().map(|s| s.mode);

        match state.mode {
            ExecutionMode::Paused => {
                let changed = previous.as_ref() != Some(&state);
                if !changed && !self.awaiting {
                    return None;
                }
                let reason = self.stop_reason(state.location.as_ref(), is_breakpoint);
                self.awaiting = false;
                self.last_command = None;
                Some(MonitorEvent::Stopped {
                    reason,
                    location: state.location,
                })
            }
            ExecutionMode::Running => {
                self.awaiting = false;
                (previous_mode != Some(ExecutionMode::Running)).then_some(MonitorEvent::Continued)
            }
            ExecutionMode::Design => {
                self.awaiting = false;
                self.last_command = None;
                matches!(
                    previous_mode,
                    Some(ExecutionMode::Running | ExecutionMode::Paused)
                )
                .then_some(MonitorEvent::Ended)
            }
        }
    }

    fn stop_reason<F>(&self, location: Option<&Location>, is_breakpoint: F) -> StopReason
    where
        F: Fn(&Location) -> bool,
    {
        if location.is_some_and(|l| is_breakpoint(l)) {
            return StopReason::Breakpoint;
        }
        match self.last_command {
            Some(command) if command.is_step() => StopReason::Step,
            Some(CommandKind::Pause) => StopReason::Pause,
            _ => StopReason::Exception,
        }
    }
}

/// Anything that can report the target's execution state.
pub trait StateSource: Send + Sync + 'static {
    fn poll(&self) -> impl Future<Output = Result<ExecutionState, BridgeError>> + Send;
}

impl StateSource for RecoveringBridge {
    fn poll(&self) -> impl Future<Output = Result<ExecutionState, BridgeError>> + Send {
        self.poll_state()
    }
}

#[derive(Debug, Clone)]
struct PollTiming {
    interval: Duration,
    max_backoff: Duration,
    degraded_after: u32,
}

/// A running poll loop. Dropping it stops the loop.
pub struct ExecutionMonitor {
    detector: Arc<Mutex<TransitionDetector>>,
    state: watch::Receiver<Option<ExecutionState>>,
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

impl ExecutionMonitor {
    pub fn spawn<S, F>(
        source: Arc<S>,
        config: &DebugConfig,
        is_breakpoint: F,
        events: mpsc::UnboundedSender<MonitorEvent>,
    ) -> Self
    where
        S: StateSource,
        F: Fn(&Location) -> bool + Send + 'static,
    {
        let detector = Arc::new(Mutex::new(TransitionDetector::new()));
        let (state_tx, state) = watch::channel(None);
        let wake = Arc::new(Notify::new());
        let timing = PollTiming {
            interval: config.poll_interval,
            max_backoff: config.max_poll_backoff,
            degraded_after: config.degraded_after,
        };

        let task = tokio::spawn(poll_loop(
            source,
            detector.clone(),
            timing,
            is_breakpoint,
            events,
            state_tx,
            wake.clone(),
        ));

        Self {
            detector,
            state,
            wake,
            task,
        }
    }

    /// Records a command the session just sent and polls right away.
    pub fn command_sent(&self, command: CommandKind) {
        lock(&self.detector).command_sent(command);
        self.wake.notify_one();
    }

    pub fn reset(&self) {
        lock(&self.detector).reset();
        self.wake.notify_one();
    }

    /// Most recently polled state.
    pub fn latest(&self) -> Option<ExecutionState> {
        self.state.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for ExecutionMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn lock(detector: &Mutex<TransitionDetector>) -> MutexGuard<'_, TransitionDetector> {
    detector.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn poll_loop<S, F>(
    source: Arc<S>,
    detector: Arc<Mutex<TransitionDetector>>,
    timing: PollTiming,
    is_breakpoint: F,
    events: mpsc::UnboundedSender<MonitorEvent>,
    state_tx: watch::Sender<Option<ExecutionState>>,
    wake: Arc<Notify>,
) where
    S: StateSource,
    F: Fn(&Location) -> bool + Send + 'static,
{
    let mut failures = 0u32;
    loop {
        let epoch = lock(&detector).epoch();
        let event = match source.poll().await {
            Ok(state) => {
                let recovered = failures >= timing.degraded_after && timing.degraded_after > 0;
                failures = 0;
                if recovered {
                    tracing::info!("State polling recovered");
                    if events.send(MonitorEvent::Recovered).is_err() {
                        break;
                    }
                }
                let event = lock(&detector).observe(epoch, state.clone(), &is_breakpoint);
                state_tx.send_replace(Some(state));
                event
            }
            Err(err) => {
                failures += 1;
                tracing::warn!(failures, "State poll failed: {err}");
                if err.is_disconnect() && failures == 1 {
                    Some(MonitorEvent::Disconnected(err.to_string()))
                } else if failures == timing.degraded_after {
                    Some(MonitorEvent::Degraded {
                        failures,
                        error: err.to_string(),
                    })
                } else {
                    None
                }
            }
        };

        if let Some(event) = event {
            tracing::debug!(?event, "Execution event");
            if events.send(event).is_err() {
                break;
            }
        }

        let delay = if failures == 0 {
            timing.interval
        } else {
            backoff(timing.interval, failures, timing.max_backoff)
        };
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wake.notified() => {}
        }
    }
    tracing::debug!("Execution monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AdapterError;
    use std::collections::VecDeque;

    fn at(line: u32) -> ExecutionState {
        ExecutionState::paused_at(Location::new("Mod1", Some("Main"), line))
    }

    fn bp_at_12(location: &Location) -> bool {
        location.module == "Mod1" && location.line == 12
    }

    fn stopped(reason: StopReason, line: u32) -> Option<MonitorEvent> {
        Some(MonitorEvent::Stopped {
            reason,
            location: Some(Location::new("Mod1", Some("Main"), line)),
        })
    }

    #[test]
    fn test_unchanged_state_emits_nothing() {
        let mut detector = TransitionDetector::new();
        assert_eq!(detector.observe(0, ExecutionState::design(), bp_at_12), None);
        for _ in 0..5 {
            assert_eq!(detector.observe(0, ExecutionState::design(), bp_at_12), None);
        }
        assert_eq!(
            detector.observe(0, ExecutionState::running(), bp_at_12),
            Some(MonitorEvent::Continued)
        );
        assert_eq!(detector.observe(0, ExecutionState::running(), bp_at_12), None);
        assert_eq!(detector.observe(0, at(12), bp_at_12), stopped(StopReason::Breakpoint, 12));
        assert_eq!(detector.observe(0, at(12), bp_at_12), None);
    }

    #[test]
    fn test_step_between_polls_is_seen() {
        let mut detector = TransitionDetector::new();
        detector.observe(0, at(5), bp_at_12);

        detector.command_sent(CommandKind::StepOver);
        let epoch = detector.epoch();
        assert_eq!(detector.observe(epoch, at(6), bp_at_12), stopped(StopReason::Step, 6));
    }

    #[test]
    fn test_continue_back_to_same_breakpoint() {
        let mut detector = TransitionDetector::new();
        detector.observe(0, at(12), bp_at_12);

        detector.command_sent(CommandKind::Continue);
        let epoch = detector.epoch();
        assert_eq!(
            detector.observe(epoch, at(12), bp_at_12),
            stopped(StopReason::Breakpoint, 12)
        );
        assert_eq!(detector.observe(epoch, at(12), bp_at_12), None);
    }

    #[test]
    fn test_poll_from_before_command_is_ignored() {
        let mut detector = TransitionDetector::new();
        let before = detector.epoch();
        detector.observe(before, at(5), bp_at_12);

        detector.command_sent(CommandKind::StepIn);
        assert_eq!(detector.observe(before, at(5), bp_at_12), None);
        assert_eq!(
            detector.observe(detector.epoch(), at(5), bp_at_12),
            stopped(StopReason::Step, 5)
        );
    }

    #[test]
    fn test_pause_and_unexplained_breaks() {
        let mut detector = TransitionDetector::new();
        detector.observe(0, ExecutionState::running(), bp_at_12);
        detector.command_sent(CommandKind::Pause);
        let epoch = detector.epoch();
        assert_eq!(detector.observe(epoch, at(7), bp_at_12), stopped(StopReason::Pause, 7));

        detector.command_sent(CommandKind::Continue);
        let epoch = detector.epoch();
        assert_eq!(
            detector.observe(epoch, ExecutionState::running(), bp_at_12),
            Some(MonitorEvent::Continued)
        );
        assert_eq!(detector.observe(epoch, at(9), bp_at_12), stopped(StopReason::Exception, 9));
    }

    #[test]
    fn test_return_to_design_ends_run() {
        let mut detector = TransitionDetector::new();
        detector.observe(0, at(12), bp_at_12);
        detector.command_sent(CommandKind::Continue);
        let epoch = detector.epoch();
        assert_eq!(
            detector.observe(epoch, ExecutionState::design(), bp_at_12),
            Some(MonitorEvent::Ended)
        );
    }

    /// Replays scripted poll results, repeating the last one forever.
    struct Scripted {
        script: Mutex<VecDeque<Result<ExecutionState, BridgeError>>>,
        last: Mutex<Result<ExecutionState, BridgeError>>,
        polls: std::sync::atomic::AtomicUsize,
    }

    impl Scripted {
        fn new(script: Vec<Result<ExecutionState, BridgeError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(Ok(ExecutionState::design())),
                polls: Default::default(),
            })
        }

        fn polls(&self) -> usize {
            self.polls.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    impl StateSource for Scripted {
        fn poll(&self) -> impl Future<Output = Result<ExecutionState, BridgeError>> + Send {
            self.polls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let mut last = self.last.lock().unwrap();
            if let Some(next) = self.script.lock().unwrap().pop_front() {
                *last = next;
            }
            std::future::ready(last.clone())
        }
    }

    fn config() -> DebugConfig {
        let mut config = DebugConfig::default().with_poll_interval(Duration::from_secs(2));
        config.max_poll_backoff = Duration::from_secs(10);
        config.degraded_after = 3;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_emits_transitions_once() {
        let source = Scripted::new(vec![
            Ok(ExecutionState::design()),
            Ok(ExecutionState::running()),
            Ok(ExecutionState::running()),
            Ok(at(12)),
        ]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = ExecutionMonitor::spawn(source.clone(), &config(), bp_at_12, tx);

        assert_eq!(rx.recv().await, Some(MonitorEvent::Continued));
        assert_eq!(rx.recv().await, stopped(StopReason::Breakpoint, 12));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
        assert!(source.polls() > 10);
        assert_eq!(monitor.latest(), Some(at(12)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_backs_off_and_reports_degraded() {
        let busy = || Err(BridgeError::Adapter(AdapterError::Busy("dialog".into())));
        let source = Scripted::new(vec![
            Ok(ExecutionState::running()),
            busy(),
            busy(),
            busy(),
            busy(),
            Ok(ExecutionState::running()),
        ]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let start = tokio::time::Instant::now();
        let _monitor = ExecutionMonitor::spawn(source.clone(), &config(), bp_at_12, tx);

        assert_eq!(rx.recv().await, Some(MonitorEvent::Continued));
        assert!(matches!(
            rx.recv().await,
            Some(MonitorEvent::Degraded { failures: 3, .. })
        ));
        assert_eq!(rx.recv().await, Some(MonitorEvent::Recovered));

        // 2s, then 4s, 8s, 10s, 10s of backoff instead of five 2s ticks.
        assert!(start.elapsed() >= Duration::from_secs(34));
        assert_eq!(source.polls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_reports_disconnect_once() {
        let gone = || {
            Err(BridgeError::Adapter(AdapterError::Disconnected(
                "host closed".into(),
            )))
        };
        let source = Scripted::new(vec![gone(), gone()]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _monitor = ExecutionMonitor::spawn(source, &config(), bp_at_12, tx);

        assert!(matches!(rx.recv().await, Some(MonitorEvent::Disconnected(_))));
        assert!(matches!(rx.recv().await, Some(MonitorEvent::Degraded { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_triggers_immediate_poll() {
        let source = Scripted::new(vec![Ok(at(5)), Ok(at(6))]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = ExecutionMonitor::spawn(source.clone(), &config(), bp_at_12, tx);

        assert_eq!(rx.recv().await, stopped(StopReason::Exception, 5));
        let start = tokio::time::Instant::now();
        monitor.command_sent(CommandKind::StepOver);
        assert_eq!(rx.recv().await, stopped(StopReason::Step, 6));
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
