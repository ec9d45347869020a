//! The capability contract an automation target has to offer.
//!
//! Everything above this module talks to the host only through [`AutomationAdapter`],
//! and only from the bridge's dedicated worker thread.

use crate::error::AdapterError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Design,
    Running,
    Paused,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionMode::Design => "design",
            ExecutionMode::Running => "running",
            ExecutionMode::Paused => "paused",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub module: String,
    pub procedure: Option<String>,
    /// 1-based source line.
    pub line: u32,
}

impl Location {
    pub fn new(module: impl Into<String>, procedure: Option<&str>, line: u32) -> Self {
        Self {
            module: module.into(),
            procedure: procedure.map(str::to_string),
            line,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub mode: ExecutionMode,
    pub location: Option<Location>,
}

impl ExecutionState {
    pub fn design() -> Self {
        Self {
            mode: ExecutionMode::Design,
            location: None,
        }
    }

    pub fn running() -> Self {
        Self {
            mode: ExecutionMode::Running,
            location: None,
        }
    }

    pub fn paused_at(location: Location) -> Self {
        Self {
            mode: ExecutionMode::Paused,
            location: Some(location),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    StepOver,
    StepIn,
    StepOut,
    Continue,
    Pause,
}

impl CommandKind {
    pub fn is_step(self) -> bool {
        matches!(
            self,
            CommandKind::StepOver | CommandKind::StepIn | CommandKind::StepOut
        )
    }
}

/// Whole-module text access. The unit of mutation is always the full module.
pub trait ModuleStore {
    fn read_module(&mut self, name: &str) -> Result<String, AdapterError>;
    fn write_module(&mut self, name: &str, text: &str) -> Result<(), AdapterError>;
}

/// Narrow, synchronous, non-reentrant view of the host's automation surface.
///
/// Implementations may have thread affinity; the bridge constructs them on the
/// worker thread that will own them and never shares them.
pub trait AutomationAdapter: ModuleStore {
    /// Connects to the host. `document` selects a specific open document when given.
    fn attach(&mut self, document: Option<&str>) -> Result<(), AdapterError>;

    fn detach(&mut self);

    fn get_state(&mut self) -> Result<ExecutionState, AdapterError>;

    fn send_command(&mut self, command: CommandKind) -> Result<(), AdapterError>;

    fn list_projects(&mut self) -> Result<Vec<String>, AdapterError>;

    /// Best-effort expression evaluation while paused.
    fn evaluate(&mut self, expression: &str) -> Result<String, AdapterError> {
        Err(AdapterError::Unsupported(format!(
            "cannot evaluate '{expression}'"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ReadOnly;

    impl ModuleStore for ReadOnly {
        fn read_module(&mut self, name: &str) -> Result<String, AdapterError> {
            Err(AdapterError::NotFound(name.to_string()))
        }

        fn write_module(&mut self, name: &str, _text: &str) -> Result<(), AdapterError> {
            Err(AdapterError::Locked(name.to_string()))
        }
    }

    impl AutomationAdapter for ReadOnly {
        fn attach(&mut self, _document: Option<&str>) -> Result<(), AdapterError> {
            Ok(())
        }

        fn detach(&mut self) {}

        fn get_state(&mut self) -> Result<ExecutionState, AdapterError> {
            Ok(ExecutionState::design())
        }

        fn send_command(&mut self, _command: CommandKind) -> Result<(), AdapterError> {
            Ok(())
        }

        fn list_projects(&mut self) -> Result<Vec<String>, AdapterError> {
            Ok(vec![])
        }
    }

    #[test]
    fn test_evaluate_defaults_to_unsupported() {
        let mut adapter = ReadOnly;
        let err = adapter.evaluate("x + 1").unwrap_err();
        assert!(matches!(err, AdapterError::Unsupported(_)));
    }

    #[test]
    fn test_step_commands() {
        assert!(CommandKind::StepOver.is_step());
        assert!(CommandKind::StepIn.is_step());
        assert!(CommandKind::StepOut.is_step());
        assert!(!CommandKind::Continue.is_step());
        assert!(!CommandKind::Pause.is_step());
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let state = ExecutionState::paused_at(Location::new("Mod1", Some("Main"), 12));
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["mode"], "paused");
        assert_eq!(json["location"]["module"], "Mod1");
        assert_eq!(json["location"]["line"], 12);
    }
}
