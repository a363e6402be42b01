//! CLI definitions using clap

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use relive_kernel::QualifiedName;
use relive_reload::{PurgeDepth, PurgePolicy, WatchConfig, WatchLoopConfig};

/// relive - run a script and restart it whenever its sources change
#[derive(Parser, Debug)]
#[command(name = "relive")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Script to run
    pub entry_point: PathBuf,

    /// Files or directories to watch [default: the entry point's directory]
    pub roots: Vec<PathBuf>,

    /// Delay between polls, in milliseconds
    #[arg(long, env = "RELIVE_POLL_MS", default_value_t = 330)]
    pub poll_ms: u64,

    /// Time given to the old instance between abort and close, in milliseconds
    #[arg(long, env = "RELIVE_GRACE_MS", default_value_t = 75)]
    pub grace_ms: u64,

    /// How long to wait for a closed instance to exit, in milliseconds
    #[arg(long, env = "RELIVE_STOP_TIMEOUT_MS", default_value_t = 2000)]
    pub stop_timeout_ms: u64,

    /// How deep a purge reaches into removed definitions
    #[arg(long, value_enum, env = "RELIVE_PURGE_DEPTH", default_value_t = PurgeDepthArg::TopLevel)]
    pub purge_depth: PurgeDepthArg,

    /// Source extension to watch under directory roots (repeatable)
    #[arg(long = "ext", env = "RELIVE_EXT", value_delimiter = ',')]
    pub extensions: Vec<String>,

    /// Definition that is never purged (repeatable)
    #[arg(long = "protect", env = "RELIVE_PROTECT", value_delimiter = ',')]
    pub protected: Vec<String>,

    /// Keep load-path entries added by the script across reloads
    #[arg(long, env = "RELIVE_KEEP_LOAD_PATHS")]
    pub keep_load_paths: bool,

    /// Keep globals set by the script across reloads
    #[arg(long, env = "RELIVE_KEEP_GLOBALS")]
    pub keep_globals: bool,

    /// Wake up on file system events instead of waiting for the next poll
    #[arg(long, env = "RELIVE_FS_EVENTS")]
    pub fs_events: bool,

    /// Frame rate for scripts that define `draw`
    #[arg(long, env = "RELIVE_FRAME_RATE", default_value_t = 60)]
    pub frame_rate: u64,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PurgeDepthArg {
    TopLevel,
    Recursive,
}

impl From<PurgeDepthArg> for PurgeDepth {
    fn from(arg: PurgeDepthArg) -> Self {
        match arg {
            PurgeDepthArg::TopLevel => PurgeDepth::TopLevel,
            PurgeDepthArg::Recursive => PurgeDepth::Recursive,
        }
    }
}

impl Cli {
    /// Watch roots, falling back to the entry point's directory
    pub fn watch_roots(&self) -> Vec<PathBuf> {
        if !self.roots.is_empty() {
            return self.roots.clone();
        }
        let dir = match self.entry_point.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        vec![dir.to_path_buf()]
    }

    pub fn watch_loop_config(&self) -> anyhow::Result<WatchLoopConfig> {
        let mut watch = WatchConfig::default();
        if !self.extensions.is_empty() {
            watch = watch.with_extensions(&self.extensions);
        }

        let mut purge = PurgePolicy::new()
            .with_depth(self.purge_depth.into())
            .with_rewind_load_paths(!self.keep_load_paths)
            .with_rewind_globals(!self.keep_globals);
        for name in &self.protected {
            let name = QualifiedName::parse(name)
                .with_context(|| format!("Invalid --protect name '{}'", name))?;
            purge = purge.with_protected(name);
        }

        Ok(WatchLoopConfig::new()
            .with_poll_interval(Duration::from_millis(self.poll_ms))
            .with_grace_period(Duration::from_millis(self.grace_ms))
            .with_stop_timeout(Duration::from_millis(self.stop_timeout_ms))
            .with_watch_config(watch)
            .with_purge_policy(purge)
            .with_fs_events(self.fs_events))
    }
}
