//! Automation target backed by a directory of exported modules.
//!
//! Module text is read from and written back to the `.bas`/`.cls`/`.frm` files
//! themselves, keeping each file's export header. The host side (an add-in or
//! a macro that re-imports changed files) reports through a control directory:
//!
//! - `.vba-debug/state.json` holds the current [`ExecutionState`]. No file means design mode.
//! - `.vba-debug/values.json` maps expression text to its value while paused.
//! - `.vba-debug/commands` receives one JSON line per debugger command.

use crate::adapter::{AutomationAdapter, CommandKind, ExecutionMode, ExecutionState, ModuleStore};
use crate::error::AdapterError;
use crate::source::{exported_module_name, split_export_header};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const CONTROL_DIR: &str = ".vba-debug";

#[derive(Serialize)]
struct CommandRecord {
    command: CommandKind,
}

#[derive(Debug, Clone)]
pub struct ExportDirTarget {
    root: PathBuf,
    attached: bool,
}

impl ExportDirTarget {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            attached: false,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn control(&self, file: &str) -> PathBuf {
        self.root.join(CONTROL_DIR).join(file)
    }

    fn require_attached(&self) -> Result<(), AdapterError> {
        if self.attached {
            Ok(())
        } else {
            Err(AdapterError::Disconnected("target not attached".into()))
        }
    }

    /// Finds the exported file for `name`. Module names are case-insensitive in VBA.
    fn module_path(&self, name: &str) -> Result<PathBuf, AdapterError> {
        let entries = fs::read_dir(&self.root).map_err(|err| io_error(&self.root.display().to_string(), err))?;
        entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .find(|path| exported_module_name(path).is_some_and(|stem| stem.eq_ignore_ascii_case(name)))
            .ok_or_else(|| AdapterError::NotFound(name.to_string()))
    }

    fn read_file(path: &Path) -> Result<String, AdapterError> {
        fs::read_to_string(path).map_err(|err| io_error(&path.display().to_string(), err))
    }
}

fn io_error(context: &str, err: io::Error) -> AdapterError {
    match err.kind() {
        io::ErrorKind::NotFound => AdapterError::NotFound(context.to_string()),
        io::ErrorKind::PermissionDenied => AdapterError::Locked(format!("{context}: {err}")),
        io::ErrorKind::InvalidData => AdapterError::Unsupported(format!("{context} is not UTF-8 text")),
        _ => AdapterError::Disconnected(format!("{context}: {err}")),
    }
}

impl ModuleStore for ExportDirTarget {
    fn read_module(&mut self, name: &str) -> Result<String, AdapterError> {
        self.require_attached()?;
        let path = self.module_path(name)?;
        let text = Self::read_file(&path)?;
        Ok(split_export_header(&text).1.to_string())
    }

    fn write_module(&mut self, name: &str, text: &str) -> Result<(), AdapterError> {
        self.require_attached()?;
        let path = self.module_path(name)?;
        let context = path.display().to_string();
        let metadata = fs::metadata(&path).map_err(|err| io_error(&context, err))?;
        if metadata.permissions().readonly() {
            return Err(AdapterError::Locked(format!("{context} is read-only")));
        }

        let current = Self::read_file(&path)?;
        let (header, _) = split_export_header(&current);
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or(name);
        let staged = path.with_file_name(format!(".{file_name}.tmp"));
        fs::write(&staged, format!("{header}{text}")).map_err(|err| io_error(&context, err))?;
        // Rename so the host never picks up a half-written file.
        fs::rename(&staged, &path).map_err(|err| {
            let _ = fs::remove_file(&staged);
            io_error(&context, err)
        })?;
        tracing::debug!(module = name, path = %context, "Wrote module");
        Ok(())
    }
}

impl AutomationAdapter for ExportDirTarget {
    fn attach(&mut self, document: Option<&str>) -> Result<(), AdapterError> {
        if !self.root.is_dir() {
            return Err(AdapterError::Attach(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }
        fs::create_dir_all(self.root.join(CONTROL_DIR))
            .map_err(|err| AdapterError::Attach(format!("cannot create {CONTROL_DIR}: {err}")))?;
        if let Some(document) = document {
            tracing::debug!(document, root = %self.root.display(), "Document ignored; the directory is the project");
        }
        self.attached = true;
        Ok(())
    }

    fn detach(&mut self) {
        self.attached = false;
    }

    fn get_state(&mut self) -> Result<ExecutionState, AdapterError> {
        self.require_attached()?;
        let path = self.control("state.json");
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(ExecutionState::design()),
            Err(err) => return Err(io_error(&path.display().to_string(), err)),
        };
        // A partial file means the host is mid-write; the next poll sees it whole.
        serde_json::from_str(&text)
            .map_err(|err| AdapterError::Busy(format!("state file unreadable: {err}")))
    }

    fn send_command(&mut self, command: CommandKind) -> Result<(), AdapterError> {
        self.require_attached()?;
        let path = self.control("commands");
        let context = path.display().to_string();
        let line = serde_json::to_string(&CommandRecord { command })
            .map_err(|err| AdapterError::Unsupported(err.to_string()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| io_error(&context, err))?;
        writeln!(file, "{line}").map_err(|err| io_error(&context, err))
    }

    fn list_projects(&mut self) -> Result<Vec<String>, AdapterError> {
        self.require_attached()?;
        let name = self
            .root
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("VBAProject");
        Ok(vec![name.to_string()])
    }

    fn evaluate(&mut self, expression: &str) -> Result<String, AdapterError> {
        if self.get_state()?.mode != ExecutionMode::Paused {
            return Err(AdapterError::Unsupported(
                "evaluation requires break mode".into(),
            ));
        }
        let path = self.control("values.json");
        let values: HashMap<String, String> = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|err| AdapterError::Busy(format!("values file unreadable: {err}")))?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(io_error(&path.display().to_string(), err)),
        };
        let wanted = expression.trim();
        values
            .into_iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(wanted))
            .map(|(_, value)| value)
            .ok_or_else(|| AdapterError::Unsupported(format!("cannot evaluate '{expression}'")))
    }
}
