//! In-memory automation target.
//!
//! Stands in for a real host: holds module text, honours locked modules and
//! protected lines, and lets callers script execution state, delays and
//! connection loss. Clones share the same target, so a test can keep one
//! handle while the bridge worker owns another.

use crate::adapter::{AutomationAdapter, CommandKind, ExecutionMode, ExecutionState, Location, ModuleStore};
use crate::error::AdapterError;
use crate::source::{exported_module_name, split_export_header};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
struct TargetState {
    projects: Vec<String>,
    modules: BTreeMap<String, String>,
    locked: HashSet<String>,
    protected: HashSet<(String, u32)>,
    values: HashMap<String, String>,
    attached: bool,
    unreachable: bool,
    mode: Option<ExecutionMode>,
    location: Option<Location>,
    delay: Duration,
    write_delay: Duration,
    injected_failures: Vec<AdapterError>,
    commands: Vec<CommandKind>,
    writes: usize,
}

#[derive(Debug, Default)]
struct Gauge {
    executing: AtomicUsize,
    max_executing: AtomicUsize,
}

struct GaugeGuard<'a>(&'a Gauge);

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.executing.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTarget {
    state: Arc<Mutex<TargetState>>,
    gauge: Arc<Gauge>,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(self, name: &str, text: &str) -> Self {
        self.set_module(name, text);
        self
    }

    /// Seeds modules from a directory of exported `.bas`/`.cls`/`.frm` files.
    /// Export metadata at the top of each file is dropped; the rest is kept verbatim.
    pub fn load_dir(self, dir: &Path) -> std::io::Result<Self> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(name) = exported_module_name(&path) else {
                continue;
            };
            let text = std::fs::read_to_string(&path)?;
            tracing::debug!(module = name, path = %path.display(), "Loaded module");
            self.set_module(name, split_export_header(&text).1);
        }
        Ok(self)
    }

    fn lock(&self) -> MutexGuard<'_, TargetState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_module(&self, name: &str, text: &str) {
        self.lock().modules.insert(name.to_string(), text.to_string());
    }

    pub fn module(&self, name: &str) -> Option<String> {
        self.lock().modules.get(name).cloned()
    }

    pub fn set_projects(&self, projects: &[&str]) {
        self.lock().projects = projects.iter().map(|p| p.to_string()).collect();
    }

    pub fn lock_module(&self, name: &str) {
        self.lock().locked.insert(name.to_string());
    }

    pub fn unlock_module(&self, name: &str) {
        self.lock().locked.remove(name);
    }

    /// Rejects any write that changes `line` of `module`.
    pub fn protect_line(&self, module: &str, line: u32) {
        self.lock().protected.insert((module.to_string(), line));
    }

    pub fn set_value(&self, name: &str, value: &str) {
        self.lock().values.insert(name.to_ascii_lowercase(), value.to_string());
    }

    /// Every subsequent module write blocks the worker for `delay`, on top of
    /// any delay set with [`MemoryTarget::set_delay`].
    pub fn set_write_delay(&self, delay: Duration) {
        self.lock().write_delay = delay;
    }

    /// Every subsequent call blocks the worker for `delay`.
    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = delay;
    }

    /// The next calls fail with the given errors, in order.
    pub fn fail_next(&self, errors: Vec<AdapterError>) {
        let mut state = self.lock();
        state.injected_failures = errors;
        state.injected_failures.reverse();
    }

    /// Simulates transport loss: calls fail with `Disconnected` and attach fails
    /// until [`MemoryTarget::restore_connection`].
    pub fn drop_connection(&self) {
        let mut state = self.lock();
        state.attached = false;
        state.unreachable = true;
    }

    pub fn restore_connection(&self) {
        self.lock().unreachable = false;
    }

    pub fn halt_at(&self, module: &str, procedure: Option<&str>, line: u32) {
        let mut state = self.lock();
        state.mode = Some(ExecutionMode::Paused);
        state.location = Some(Location::new(module, procedure, line));
    }

    pub fn set_mode(&self, mode: ExecutionMode) {
        let mut state = self.lock();
        state.mode = Some(mode);
        if mode != ExecutionMode::Paused {
            state.location = None;
        }
    }

    pub fn is_attached(&self) -> bool {
        self.lock().attached
    }

    pub fn commands(&self) -> Vec<CommandKind> {
        self.lock().commands.clone()
    }

    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    /// Highest number of calls ever observed executing at the same time.
    pub fn max_concurrent_calls(&self) -> usize {
        self.gauge.max_executing.load(Ordering::SeqCst)
    }

    /// Marks a call as executing, applies the scripted delay and injected failures.
    fn enter(&self, needs_attach: bool) -> Result<GaugeGuard<'_>, AdapterError> {
        let now = self.gauge.executing.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.max_executing.fetch_max(now, Ordering::SeqCst);
        let guard = GaugeGuard(&self.gauge);

        let (delay, injected) = {
            let mut state = self.lock();
            (state.delay, state.injected_failures.pop())
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if let Some(err) = injected {
            return Err(err);
        }
        if needs_attach {
            let state = self.lock();
            if state.unreachable || !state.attached {
                return Err(AdapterError::Disconnected("target not attached".into()));
            }
        }
        Ok(guard)
    }
}

impl ModuleStore for MemoryTarget {
    fn read_module(&mut self, name: &str) -> Result<String, AdapterError> {
        let _call = self.enter(true)?;
        self.lock()
            .modules
            .get(name)
            .cloned()
            .ok_or_else(|| AdapterError::NotFound(name.to_string()))
    }

    fn write_module(&mut self, name: &str, text: &str) -> Result<(), AdapterError> {
        let _call = self.enter(true)?;
        let write_delay = self.lock().write_delay;
        if !write_delay.is_zero() {
            std::thread::sleep(write_delay);
        }
        let mut state = self.lock();
        if state.locked.contains(name) {
            return Err(AdapterError::Locked(format!("{name} is protected")));
        }
        let current = state
            .modules
            .get(name)
            .ok_or_else(|| AdapterError::NotFound(name.to_string()))?;

        let changes_protected = state
            .protected
            .iter()
            .filter(|(module, _)| module == name)
            .find(|(_, line)| nth_line(current, *line) != nth_line(text, *line));
        if let Some((_, line)) = changes_protected {
            return Err(AdapterError::Locked(format!("{name} line {line} is protected")));
        }

        state.modules.insert(name.to_string(), text.to_string());
        state.writes += 1;
        Ok(())
    }
}

impl AutomationAdapter for MemoryTarget {
    fn attach(&mut self, _document: Option<&str>) -> Result<(), AdapterError> {
        let _call = self.enter(false)?;
        let mut state = self.lock();
        if state.unreachable {
            return Err(AdapterError::Attach("host is not reachable".into()));
        }
        state.attached = true;
        Ok(())
    }

    fn detach(&mut self) {
        self.lock().attached = false;
    }

    fn get_state(&mut self) -> Result<ExecutionState, AdapterError> {
        let _call = self.enter(true)?;
        let state = self.lock();
        Ok(ExecutionState {
            mode: state.mode.unwrap_or(ExecutionMode::Design),
            location: state.location.clone(),
        })
    }

    fn send_command(&mut self, command: CommandKind) -> Result<(), AdapterError> {
        let _call = self.enter(true)?;
        let mut state = self.lock();
        state.commands.push(command);
        match command {
            CommandKind::Pause => {
                if state.mode == Some(ExecutionMode::Running) {
                    state.mode = Some(ExecutionMode::Paused);
                }
            }
            _ => {
                state.mode = Some(ExecutionMode::Running);
                state.location = None;
            }
        }
        Ok(())
    }

    fn list_projects(&mut self) -> Result<Vec<String>, AdapterError> {
        let _call = self.enter(true)?;
        Ok(self.lock().projects.clone())
    }

    fn evaluate(&mut self, expression: &str) -> Result<String, AdapterError> {
        let _call = self.enter(true)?;
        let state = self.lock();
        if state.mode != Some(ExecutionMode::Paused) {
            return Err(AdapterError::Unsupported(
                "evaluation requires break mode".into(),
            ));
        }
        state
            .values
            .get(&expression.trim().to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| AdapterError::Unsupported(format!("cannot evaluate '{expression}'")))
    }
}

fn nth_line(text: &str, line: u32) -> Option<&str> {
    let index = usize::try_from(line).ok()?.checked_sub(1)?;
    text.lines().nth(index)
}
