use crate::adapter::AutomationAdapter;
use crate::breakpoints::BreakpointManager;
use crate::bridge::{AutomationBridge, SYSTEM_OWNER};
use crate::config::DebugConfig;
use crate::recovery::{CleanupRegistry, CleanupReport, RecoveringBridge};
use std::sync::Arc;

/// Everything sessions debugging the same target share: one bridge, one
/// cleanup registry and one breakpoint table.
pub struct TargetHandle {
    pub name: String,
    pub bridge: Arc<AutomationBridge>,
    pub registry: Arc<CleanupRegistry>,
    pub manager: Arc<BreakpointManager>,
}

impl TargetHandle {
    pub fn spawn<F, A>(name: impl Into<String>, factory: F) -> std::io::Result<Self>
    where
        F: FnOnce() -> A + Send + 'static,
        A: AutomationAdapter,
    {
        let name = name.into();
        let bridge = Arc::new(AutomationBridge::spawn(name.clone(), factory)?);
        let registry = Arc::new(CleanupRegistry::new());
        let manager = Arc::new(BreakpointManager::new(registry.clone()));
        Ok(Self {
            name,
            bridge,
            registry,
            manager,
        })
    }

    /// Restores every marker any session left in this target.
    pub async fn cleanup(&self, config: &DebugConfig) -> CleanupReport {
        let system = RecoveringBridge::new(self.bridge.clone(), SYSTEM_OWNER, config.clone());
        let report = self.manager.remove_all(&system, None).await;
        tracing::info!(target_name = %self.name, %report, "Target cleanup");
        report
    }

    /// Cleans up, then stops the bridge worker.
    pub async fn shutdown(&self, config: &DebugConfig) -> CleanupReport {
        let report = self.cleanup(config).await;
        let cancelled = self.bridge.shutdown();
        if cancelled > 0 {
            tracing::warn!(target_name = %self.name, cancelled, "Cancelled queued calls at shutdown");
        }
        report
    }
}
