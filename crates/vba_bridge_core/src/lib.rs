//! VBA Bridge Core
//!
//! Debugging support for VBA code running inside an automation host. The host
//! only offers a single-threaded, polled automation surface, so breakpoints
//! are source edits, execution events are derived from state polling, and
//! every call goes through one serializing bridge per target.

pub mod adapter;
pub mod breakpoints;
pub mod bridge;
pub mod config;
pub mod error;
pub mod export_dir;
pub mod inspector;
pub mod memory;
pub mod monitor;
pub mod recovery;
pub mod session;
pub mod source;
pub mod target;

// Re-export commonly used types
pub use adapter::{AutomationAdapter, CommandKind, ExecutionMode, ExecutionState, Location, ModuleStore};
pub use breakpoints::{Breakpoint, BreakpointManager, MarkerKind};
pub use bridge::{AutomationBridge, CallOwner};
pub use config::DebugConfig;
pub use error::{AdapterError, BridgeError, DebugError};
pub use export_dir::ExportDirTarget;
pub use memory::MemoryTarget;
pub use monitor::{MonitorEvent, StopReason};
pub use recovery::{CleanupRegistry, CleanupReport, RecoveringBridge};
pub use session::{Session, SessionEvent, SessionId, SessionMode};
pub use target::TargetHandle;

/// Result type alias using DebugError
pub type Result<T> = std::result::Result<T, DebugError>;
