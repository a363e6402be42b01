//! Instance supervisor
//!
//! Owns the single current instance: loads it from the entry point, runs it on
//! its own tokio task, and tears it down. Termination is a hard abort of that
//! task followed by the instance's own teardown controls. Nothing waits for
//! the instance to reach a safe point; after close the supervisor only waits,
//! up to the stop timeout, for execution the abort could not reach to exit.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use colored::Colorize;
use futures::FutureExt;
use relive_kernel::{
    EntryPoint, Instance, InstanceError, InstanceId, InstanceResult, ModuleRegistry,
    QualifiedName, ReloadEvent,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Time given to in-flight rendering between abort and close
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(75);

/// Upper bound on waiting for a closed instance to exit
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Supervisor errors
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Instance {0} is still running")]
    AlreadyRunning(InstanceId),

    #[error(transparent)]
    Instance(#[from] InstanceError),
}

/// The instance currently owned by the supervisor
struct RunningInstance {
    id: InstanceId,
    entry_point: PathBuf,
    instance: Arc<dyn Instance>,
    task: JoinHandle<InstanceResult<()>>,
    started_at: Instant,
}

/// Lifecycle owner for at most one running instance
pub struct InstanceSupervisor {
    loader: Arc<dyn EntryPoint>,
    registry: Arc<ModuleRegistry>,
    grace_period: Duration,
    stop_timeout: Duration,
    current: Option<RunningInstance>,
    event_tx: broadcast::Sender<ReloadEvent>,
}

impl InstanceSupervisor {
    pub fn new(loader: Arc<dyn EntryPoint>, registry: Arc<ModuleRegistry>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            loader,
            registry,
            grace_period: DEFAULT_GRACE_PERIOD,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            current: None,
            event_tx,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    /// Publish lifecycle events on an existing channel
    pub fn with_events(mut self, event_tx: broadcast::Sender<ReloadEvent>) -> Self {
        self.event_tx = event_tx;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReloadEvent> {
        self.event_tx.subscribe()
    }

    /// Whether the current instance is still executing
    pub fn is_alive(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    pub fn current_id(&self) -> Option<InstanceId> {
        self.current.as_ref().map(|running| running.id)
    }

    /// Name the current instance declared for itself
    pub fn definition_name(&self) -> Option<QualifiedName> {
        self.current
            .as_ref()
            .and_then(|running| running.instance.definition_name())
    }

    /// Load `entry_point` and start running it without waiting for it to finish.
    ///
    /// Refused while another instance is alive. A previous instance that
    /// already ended on its own is torn down first.
    pub async fn start(&mut self, entry_point: &Path) -> Result<InstanceId, SupervisorError> {
        if let Some(running) = &self.current {
            if !running.task.is_finished() {
                return Err(SupervisorError::AlreadyRunning(running.id));
            }
            self.stop().await;
        }

        let instance = match self.loader.load(entry_point, self.registry.clone()) {
            Ok(instance) => instance,
            Err(e) => {
                report_failure(None, &e);
                let _ = self.event_tx.send(ReloadEvent::InstanceFailed {
                    instance_id: None,
                    error: e.to_string(),
                });
                return Err(e.into());
            }
        };

        let id = InstanceId::new();
        let task = tokio::spawn(run_instance(id, instance.clone(), self.event_tx.clone()));

        info!("Started instance {} from {}", id, entry_point.display());
        let _ = self.event_tx.send(ReloadEvent::InstanceStarted {
            instance_id: id,
            entry_point: entry_point.to_path_buf(),
        });

        self.current = Some(RunningInstance {
            id,
            entry_point: entry_point.to_path_buf(),
            instance,
            task,
            started_at: Instant::now(),
        });

        Ok(id)
    }

    /// Tear down the current instance; a no-op when there is none.
    ///
    /// Aborts the instance task if it is still running, stops animation,
    /// waits the grace period, closes the instance, then waits (bounded by
    /// the stop timeout) for its execution to exit. Returns the id of the
    /// instance that was torn down.
    pub async fn stop(&mut self) -> Option<InstanceId> {
        let Some(running) = self.current.take() else {
            debug!("No instance to stop");
            return None;
        };

        let forced = !running.task.is_finished();
        if forced {
            running.task.abort();
        }

        running.instance.stop_animating();
        tokio::time::sleep(self.grace_period).await;
        running.instance.close();
        if tokio::time::timeout(self.stop_timeout, running.instance.wait_closed())
            .await
            .is_err()
        {
            warn!(
                "Instance {} still running {:?} after close, continuing",
                running.id, self.stop_timeout
            );
        }

        info!(
            "Stopped instance {} ({}) after {:?}{}",
            running.id,
            running.entry_point.display(),
            running.started_at.elapsed(),
            if forced { ", aborted" } else { "" }
        );
        let _ = self.event_tx.send(ReloadEvent::InstanceStopped {
            instance_id: running.id,
            forced,
        });

        Some(running.id)
    }
}

/// Body of an instance task: run to completion, report any failure, and hand
/// the failure back as the task's result.
async fn run_instance(
    id: InstanceId,
    instance: Arc<dyn Instance>,
    event_tx: broadcast::Sender<ReloadEvent>,
) -> InstanceResult<()> {
    let result = match AssertUnwindSafe(instance.run()).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(InstanceError::Panicked(panic_message(panic.as_ref()))),
    };

    match &result {
        Ok(()) => info!("Instance {} finished", id),
        Err(e) => {
            report_failure(Some(id), e);
            let _ = event_tx.send(ReloadEvent::InstanceFailed {
                instance_id: Some(id),
                error: e.to_string(),
            });
        }
    }

    result
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Log an instance failure and print it as a red banner with its cause chain
pub fn report_failure(id: Option<InstanceId>, err: &InstanceError) {
    error!(instance = ?id, "{}", err);

    let header = match id {
        Some(id) => format!("==== instance {} failed ====", id),
        None => "==== instance failed to load ====".to_string(),
    };
    eprintln!("{}", header.red().bold());
    for (depth, line) in err.chain().iter().enumerate() {
        if depth == 0 {
            eprintln!("{}", line.as_str().red().bold());
        } else {
            eprintln!("{}", format!("  caused by: {}", line).red());
        }
    }
}
