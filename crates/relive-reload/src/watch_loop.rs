//! Watch loop
//!
//! Polls the watched files on a fixed cadence and, on a change, runs the
//! reload cycle: stop the current instance, purge the registry back to its
//! baseline, start a fresh instance. The three phases always run in that
//! order on the loop's own task.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use relive_kernel::{EntryPoint, InstanceId, ModuleRegistry, ReloadEvent};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::baseline::RegistryBaseline;
use crate::purger::{PurgePolicy, PurgeReport, RegistryPurger};
use crate::supervisor::{
    DEFAULT_GRACE_PERIOD, DEFAULT_STOP_TIMEOUT, InstanceSupervisor, SupervisorError,
};
use crate::watcher::{ChangeDetector, FsWake, WatchConfig, WatchError, WatchSet};

/// Delay between two polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(330);

/// Watch loop configuration
#[derive(Debug, Clone)]
pub struct WatchLoopConfig {
    pub poll_interval: Duration,
    /// Passed to the supervisor
    pub grace_period: Duration,
    /// Passed to the supervisor
    pub stop_timeout: Duration,
    pub watch: WatchConfig,
    pub purge: PurgePolicy,
    /// Wake the loop early on file system events
    pub fs_events: bool,
}

impl Default for WatchLoopConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            grace_period: DEFAULT_GRACE_PERIOD,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            watch: WatchConfig::default(),
            purge: PurgePolicy::default(),
            fs_events: false,
        }
    }
}

impl WatchLoopConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    pub fn with_watch_config(mut self, watch: WatchConfig) -> Self {
        self.watch = watch;
        self
    }

    pub fn with_purge_policy(mut self, purge: PurgePolicy) -> Self {
        self.purge = purge;
        self
    }

    pub fn with_fs_events(mut self, enabled: bool) -> Self {
        self.fs_events = enabled;
        self
    }
}

/// Orchestration errors
#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

/// Where the loop is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// No instance started yet
    Idle,
    Polling,
    Changed,
    StoppingInstance,
    Purging,
    StartingInstance,
}

/// Change-driven reload orchestrator
pub struct WatchLoop {
    config: WatchLoopConfig,
    detector: ChangeDetector,
    baseline: RegistryBaseline,
    purger: RegistryPurger,
    supervisor: InstanceSupervisor,
    fs_wake: Option<FsWake>,
    state: LoopState,
    event_tx: broadcast::Sender<ReloadEvent>,
}

impl WatchLoop {
    /// Build a loop for `entry_point`, watching everything under `roots`.
    ///
    /// The registry baseline is captured here, before anything is loaded.
    /// An empty root list, a missing root or a missing entry point is an
    /// error; a failure to set up file system events only disables them.
    pub fn new(
        entry_point: &Path,
        roots: &[PathBuf],
        loader: Arc<dyn EntryPoint>,
        registry: Arc<ModuleRegistry>,
        config: WatchLoopConfig,
    ) -> Result<Self, ReloadError> {
        let baseline = RegistryBaseline::capture(&registry);
        let watch_set = WatchSet::expand(roots, entry_point, &config.watch)?;
        info!(
            "Watching {} files for {}",
            watch_set.len(),
            watch_set.entry_point().display()
        );

        let fs_wake = if config.fs_events {
            match FsWake::new(roots, &config.watch) {
                Ok(wake) => Some(wake),
                Err(e) => {
                    warn!("File system events unavailable, polling only: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let (event_tx, _) = broadcast::channel(256);
        let supervisor = InstanceSupervisor::new(loader, registry.clone())
            .with_grace_period(config.grace_period)
            .with_stop_timeout(config.stop_timeout)
            .with_events(event_tx.clone());
        let purger = RegistryPurger::new(registry, config.purge.clone());

        Ok(Self {
            config,
            detector: ChangeDetector::new(watch_set),
            baseline,
            purger,
            supervisor,
            fs_wake,
            state: LoopState::Idle,
            event_tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReloadEvent> {
        self.event_tx.subscribe()
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn baseline(&self) -> &RegistryBaseline {
        &self.baseline
    }

    pub fn supervisor(&self) -> &InstanceSupervisor {
        &self.supervisor
    }

    pub fn watch_set(&self) -> &WatchSet {
        self.detector.watch_set()
    }

    pub fn config(&self) -> &WatchLoopConfig {
        &self.config
    }

    /// Start an instance of the entry point.
    ///
    /// The loop moves on to polling whether or not the instance loaded, so
    /// that the next edit retries.
    pub async fn start(&mut self) -> Result<InstanceId, ReloadError> {
        self.state = LoopState::StartingInstance;
        let entry_point = self.detector.watch_set().entry_point().to_path_buf();
        let result = self.supervisor.start(&entry_point).await;
        self.state = LoopState::Polling;
        Ok(result?)
    }

    /// Run one poll cycle; true when a change triggered a reload
    pub async fn tick(&mut self) -> bool {
        self.state = LoopState::Polling;
        let Some(change) = self.detector.poll() else {
            return false;
        };

        self.state = LoopState::Changed;
        let _ = self.event_tx.send(ReloadEvent::ChangeDetected {
            path: change.path,
            modified: change.modified,
        });

        if let Err(e) = self.reload().await {
            warn!("Reload did not start a new instance: {}", e);
        }
        true
    }

    /// Stop the current instance, purge the registry and start a new instance
    pub async fn reload(&mut self) -> Result<InstanceId, ReloadError> {
        let started = Instant::now();
        let extra_names: Vec<_> = self.supervisor.definition_name().into_iter().collect();

        self.state = LoopState::StoppingInstance;
        self.supervisor.stop().await;

        self.state = LoopState::Purging;
        let report = self.purger.purge_with(&self.baseline, &extra_names);
        self.publish_purge(&report);

        let result = self.start().await;
        let duration = started.elapsed();
        debug!("Reload cycle took {:?}", duration);
        let _ = self.event_tx.send(ReloadEvent::ReloadCompleted {
            instance_id: result.as_ref().ok().copied(),
            duration,
        });

        result
    }

    /// Start the first instance, then poll until `shutdown` resolves.
    ///
    /// The current instance is stopped before returning.
    pub async fn run_until<F>(&mut self, shutdown: F)
    where
        F: Future,
    {
        tokio::pin!(shutdown);

        if self.state == LoopState::Idle {
            if let Err(e) = self.start().await {
                warn!("Initial start failed, waiting for a change: {}", e);
            }
        }

        loop {
            self.tick().await;

            let interval = self.config.poll_interval;
            let pause = async {
                match &self.fs_wake {
                    Some(wake) => {
                        tokio::select! {
                            _ = tokio::time::sleep(interval) => {}
                            _ = wake.notified() => debug!("Woken by file system event"),
                        }
                    }
                    None => tokio::time::sleep(interval).await,
                }
            };

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down watch loop");
                    break;
                }
                _ = pause => {}
            }
        }

        self.supervisor.stop().await;
    }

    /// Poll forever
    pub async fn run(&mut self) {
        self.run_until(std::future::pending::<()>()).await;
    }

    fn publish_purge(&self, report: &PurgeReport) {
        let _ = self.event_tx.send(ReloadEvent::Purged {
            removed_names: report.removed_names.len(),
            removed_files: report.removed_files.len(),
            failures: report.failures.len(),
        });
    }
}
