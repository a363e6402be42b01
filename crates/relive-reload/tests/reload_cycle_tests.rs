//! Integration tests for the reload cycle
//!
//! Drives a WatchLoop over real files on disk: edit a watched file, run one
//! poll cycle, and check what the supervisor and the registry went through.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use relive_kernel::{
    DefinitionKind, EntryPoint, Instance, InstanceError, InstanceResult, ModuleRegistry,
    QualifiedName, ReloadEvent,
};
use relive_reload::{LoopState, RhaiEntryPoint, WatchLoop, WatchLoopConfig};
use tempfile::TempDir;
use tokio::sync::broadcast;

// ============================================================================
// Helper Functions
// ============================================================================

fn name(s: &str) -> QualifiedName {
    QualifiedName::parse(s).unwrap()
}

fn touch_future(path: &Path, secs: u64) {
    let file = File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(secs))
        .unwrap();
}

fn rewrite(path: &Path, contents: &str, secs: u64) {
    fs::write(path, contents).unwrap();
    touch_future(path, secs);
}

fn sketch_dir(entry_contents: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    fs::create_dir(dir.path().join("lib")).unwrap();
    fs::write(dir.path().join("lib/ball.rhai"), "// ball").unwrap();
    let entry = dir.path().join("sketch.rhai");
    fs::write(&entry, entry_contents).unwrap();
    (dir, entry)
}

fn config() -> WatchLoopConfig {
    WatchLoopConfig::new()
        .with_poll_interval(Duration::from_millis(10))
        .with_grace_period(Duration::from_millis(5))
}

fn drain(events: &mut broadcast::Receiver<ReloadEvent>) -> Vec<&'static str> {
    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.name());
    }
    names
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

// ============================================================================
// Scripted instances
// ============================================================================

#[derive(Default)]
struct Counters {
    loads: AtomicUsize,
    closes: AtomicUsize,
}

/// Defines `Sketch1`, records `/tmp/a.rhai`, then runs until aborted; or fails
/// straight away when `fail` is set
struct Recording {
    registry: Arc<ModuleRegistry>,
    counters: Arc<Counters>,
    fail: bool,
}

#[async_trait]
impl Instance for Recording {
    async fn run(&self) -> InstanceResult<()> {
        if self.fail {
            return Err(InstanceError::Runtime {
                message: "undefined method `ellipse'".to_string(),
                source: None,
            });
        }
        self.registry
            .define(&name("Sketch1"), DefinitionKind::Class)?;
        self.registry.record_loaded("/tmp/a.rhai");
        std::future::pending::<()>().await;
        Ok(())
    }

    fn close(&self) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Reads the entry point: `fail` fails at run time, `broken` fails to load
struct RecordingLoader(Arc<Counters>);

impl EntryPoint for RecordingLoader {
    fn load(&self, path: &Path, registry: Arc<ModuleRegistry>) -> InstanceResult<Arc<dyn Instance>> {
        self.0.loads.fetch_add(1, Ordering::SeqCst);
        let contents = fs::read_to_string(path).map_err(|e| InstanceError::load(path, e))?;
        if contents.contains("broken") {
            return Err(InstanceError::load(
                path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, "syntax error"),
            ));
        }
        Ok(Arc::new(Recording {
            registry,
            counters: self.0.clone(),
            fail: contents.contains("fail"),
        }))
    }
}

fn recording_loop(entry_contents: &str) -> (TempDir, PathBuf, WatchLoop, Arc<ModuleRegistry>, Arc<Counters>) {
    let (dir, entry) = sketch_dir(entry_contents);
    let registry = Arc::new(ModuleRegistry::new(dir.path()));
    registry
        .define_host(&name("Kernel"), DefinitionKind::Module)
        .unwrap();
    registry.record_loaded("/usr/lib/relive/prelude.rhai");

    let counters = Arc::new(Counters::default());
    let watch_loop = WatchLoop::new(
        &entry,
        &[dir.path().to_path_buf()],
        Arc::new(RecordingLoader(counters.clone())),
        registry.clone(),
        config(),
    )
    .unwrap();
    (dir, entry, watch_loop, registry, counters)
}

// ============================================================================
// Reload cycle
// ============================================================================

#[tokio::test]
async fn test_edit_triggers_stop_purge_start_in_order() {
    let (dir, _entry, mut watch_loop, registry, counters) = recording_loop("// sketch");
    let mut events = watch_loop.subscribe();

    let first = watch_loop.start().await.unwrap();
    wait_for(|| registry.contains(&name("Sketch1"))).await;
    assert!(registry.is_loaded("/tmp/a.rhai"));

    touch_future(&dir.path().join("lib/ball.rhai"), 5);
    assert!(watch_loop.tick().await);

    assert_eq!(
        drain(&mut events),
        vec![
            "instance_started",
            "change_detected",
            "instance_stopped",
            "purged",
            "instance_started",
            "reload_completed",
        ]
    );

    let second = watch_loop.supervisor().current_id().unwrap();
    assert_ne!(first, second);
    assert_eq!(counters.loads.load(Ordering::SeqCst), 2);
    assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    assert_eq!(watch_loop.state(), LoopState::Polling);

    // baseline survives every purge
    assert!(registry.contains(&name("Kernel")));
    assert!(registry.is_loaded("/usr/lib/relive/prelude.rhai"));

    // no further change, no further cycle
    assert!(!watch_loop.tick().await);
    assert!(drain(&mut events).is_empty());
}

#[tokio::test]
async fn test_purge_removes_instance_state_before_restart() {
    let (dir, _entry, mut watch_loop, registry, _counters) = recording_loop("// sketch");
    let mut events = watch_loop.subscribe();

    watch_loop.start().await.unwrap();
    wait_for(|| registry.contains(&name("Sketch1"))).await;

    touch_future(&dir.path().join("lib/ball.rhai"), 5);
    watch_loop.tick().await;

    let purged = loop {
        match events.recv().await.unwrap() {
            ReloadEvent::Purged {
                removed_names,
                removed_files,
                failures,
            } => break (removed_names, removed_files, failures),
            _ => continue,
        }
    };
    assert_eq!(purged, (1, 1, 0));
}

#[tokio::test]
async fn test_failing_instance_does_not_block_next_cycle() {
    let (_dir, entry, mut watch_loop, registry, counters) = recording_loop("fail");
    let mut events = watch_loop.subscribe();

    let first = watch_loop.start().await.unwrap();
    wait_for(|| !watch_loop.supervisor().is_alive()).await;

    rewrite(&entry, "// fixed", 5);
    assert!(watch_loop.tick().await);

    let second = watch_loop.supervisor().current_id().unwrap();
    assert_ne!(first, second);
    wait_for(|| registry.contains(&name("Sketch1"))).await;
    assert_eq!(counters.loads.load(Ordering::SeqCst), 2);

    let names = drain(&mut events);
    assert_eq!(names[0], "instance_started");
    assert_eq!(names[1], "instance_failed");
    assert!(names.ends_with(&["instance_started", "reload_completed"]));
}

#[tokio::test]
async fn test_load_failure_is_retried_on_next_edit() {
    let (_dir, entry, mut watch_loop, _registry, counters) = recording_loop("broken");

    assert!(watch_loop.start().await.is_err());
    assert_eq!(watch_loop.state(), LoopState::Polling);
    assert!(watch_loop.supervisor().current_id().is_none());

    // still broken: the cycle runs, no instance comes up
    rewrite(&entry, "broken again", 5);
    assert!(watch_loop.tick().await);
    assert!(watch_loop.supervisor().current_id().is_none());

    rewrite(&entry, "// fixed", 10);
    assert!(watch_loop.tick().await);
    assert!(watch_loop.supervisor().is_alive());
    assert_eq!(counters.loads.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_forced_reload_without_changes() {
    let (_dir, _entry, mut watch_loop, registry, _counters) = recording_loop("// sketch");

    let first = watch_loop.start().await.unwrap();
    wait_for(|| registry.contains(&name("Sketch1"))).await;

    let second = watch_loop.reload().await.unwrap();
    assert_ne!(first, second);
    wait_for(|| registry.contains(&name("Sketch1"))).await;
}

// ============================================================================
// Rhai end to end
// ============================================================================

#[tokio::test]
async fn test_rhai_sketch_reloads_with_fresh_definitions() {
    let dir = TempDir::new().unwrap();
    fs::create_dir(dir.path().join("lib")).unwrap();
    let helper = dir.path().join("lib/palette.rhai");
    fs::write(&helper, r#"define_value("PALETTE", "warm");"#).unwrap();
    let entry = dir.path().join("bouncing_ball.rhai");
    fs::write(
        &entry,
        r#"
            add_load_path("lib");
            require("palette");
            define_class("BouncingBall");
            define_class("Sketch1");
            fn draw() { set_global("frame", frame_count()); }
        "#,
    )
    .unwrap();

    let registry = Arc::new(ModuleRegistry::new(dir.path()));
    let mut watch_loop = WatchLoop::new(
        &entry,
        &[dir.path().to_path_buf()],
        Arc::new(RhaiEntryPoint::new()),
        registry.clone(),
        config(),
    )
    .unwrap();
    assert_eq!(watch_loop.watch_set().len(), 2);

    watch_loop.start().await.unwrap();
    wait_for(|| registry.global("frame").is_some()).await;
    assert!(registry.contains(&name("Sketch1")));
    assert!(registry.is_loaded(&helper));

    rewrite(
        &entry,
        r#"
            add_load_path("lib");
            require("palette");
            define_class("BouncingBall");
            define_class("Sketch2");
            fn draw() { set_global("frame", frame_count()); }
        "#,
        5,
    );
    assert!(watch_loop.tick().await);

    wait_for(|| registry.contains(&name("Sketch2"))).await;
    assert!(!registry.contains(&name("Sketch1")));
    // re-required after the purge forgot it
    wait_for(|| registry.is_loaded(&helper)).await;
    assert!(registry.contains(&name("PALETTE")));

    watch_loop
        .run_until(tokio::time::sleep(Duration::from_millis(30)))
        .await;
    assert!(!watch_loop.supervisor().is_alive());
}

#[tokio::test]
async fn test_slow_require_spanning_reload_keeps_new_record() {
    let dir = TempDir::new().unwrap();
    fs::create_dir(dir.path().join("lib")).unwrap();
    let slow = dir.path().join("lib/slow.rhai");
    fs::write(&slow, "let n = 0; loop { n += 1; }").unwrap();
    let entry = dir.path().join("sketch.rhai");
    fs::write(&entry, r#"add_load_path("lib"); require("slow");"#).unwrap();

    let registry = Arc::new(ModuleRegistry::new(dir.path()));
    let mut watch_loop = WatchLoop::new(
        &entry,
        &[dir.path().to_path_buf()],
        Arc::new(RhaiEntryPoint::new()),
        registry.clone(),
        config(),
    )
    .unwrap();

    let first = watch_loop.start().await.unwrap();
    wait_for(|| registry.is_loaded(&slow)).await;

    // the old script thread is still inside require when the reload stops it
    let second = watch_loop.reload().await.unwrap();
    assert_ne!(first, second);
    wait_for(|| registry.is_loaded(&slow)).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(registry.is_loaded(&slow));
    assert_eq!(registry.loaded_files().len(), 1);

    watch_loop
        .run_until(tokio::time::sleep(Duration::from_millis(30)))
        .await;
    assert!(!watch_loop.supervisor().is_alive());
}
