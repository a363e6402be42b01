//! Reload lifecycle events

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use crate::instance::InstanceId;

/// Reload lifecycle event
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum ReloadEvent {
    /// A watched file has a newer modification time
    ChangeDetected { path: PathBuf, modified: SystemTime },
    /// A new instance was dispatched
    InstanceStarted {
        instance_id: InstanceId,
        entry_point: PathBuf,
    },
    /// The instance failed to load or failed while running
    InstanceFailed {
        instance_id: Option<InstanceId>,
        error: String,
    },
    /// The instance was torn down
    InstanceStopped {
        instance_id: InstanceId,
        /// Whether it was still running and had to be aborted
        forced: bool,
    },
    /// Registry state created since the baseline was removed
    Purged {
        removed_names: usize,
        removed_files: usize,
        failures: usize,
    },
    /// A full stop, purge, start cycle finished
    ReloadCompleted {
        instance_id: Option<InstanceId>,
        duration: Duration,
    },
}

impl ReloadEvent {
    /// Short tag for logs and assertions
    pub fn name(&self) -> &'static str {
        match self {
            ReloadEvent::ChangeDetected { .. } => "change_detected",
            ReloadEvent::InstanceStarted { .. } => "instance_started",
            ReloadEvent::InstanceFailed { .. } => "instance_failed",
            ReloadEvent::InstanceStopped { .. } => "instance_stopped",
            ReloadEvent::Purged { .. } => "purged",
            ReloadEvent::ReloadCompleted { .. } => "reload_completed",
        }
    }
}
