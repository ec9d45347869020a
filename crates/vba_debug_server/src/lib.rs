//! Debug adapter server for VBA code: speaks the Debug Adapter Protocol to
//! editors and drives the host through `vba_bridge_core`.

pub mod protocol;
pub mod server;

pub use server::{Server, ServerConfig};
