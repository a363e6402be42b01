//! relive reload loop
//!
//! Watches source files and restarts a supervised program whenever one of
//! them changes:
//!
//! - [`ChangeDetector`] polls modification times of the [`WatchSet`]
//! - [`RegistryBaseline`] records the registry before anything is loaded
//! - [`RegistryPurger`] rewinds the registry to that baseline between runs
//! - [`InstanceSupervisor`] starts and tears down the single running instance
//! - [`WatchLoop`] ties them together: stop, purge, start on every change
//! - [`RhaiEntryPoint`] runs Rhai scripts as supervised instances
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use relive_kernel::ModuleRegistry;
//! use relive_reload::{RhaiEntryPoint, WatchLoop, WatchLoopConfig};
//!
//! let registry = Arc::new(ModuleRegistry::from_current_dir()?);
//! let mut watch_loop = WatchLoop::new(
//!     "sketch.rhai".as_ref(),
//!     &["lib".into()],
//!     Arc::new(RhaiEntryPoint::new()),
//!     registry,
//!     WatchLoopConfig::default(),
//! )?;
//! watch_loop.run_until(tokio::signal::ctrl_c()).await;
//! ```

pub mod baseline;
pub mod purger;
pub mod rhai_host;
pub mod supervisor;
pub mod watch_loop;
pub mod watcher;

pub use baseline::RegistryBaseline;
pub use purger::{PurgeDepth, PurgeFailure, PurgePolicy, PurgeReport, RegistryPurger};
pub use rhai_host::{DEFAULT_FRAME_RATE, RhaiEntryPoint, RhaiSketch};
pub use supervisor::{
    DEFAULT_GRACE_PERIOD, DEFAULT_STOP_TIMEOUT, InstanceSupervisor, SupervisorError, report_failure,
};
pub use watch_loop::{DEFAULT_POLL_INTERVAL, LoopState, ReloadError, WatchLoop, WatchLoopConfig};
pub use watcher::{ChangeDetector, ChangeEvent, FsWake, WatchConfig, WatchError, WatchSet};
