//! Source file change detection
//!
//! Expands watch roots into a fixed [`WatchSet`] and polls modification times
//! against the last-observed baseline. An optional [`FsWake`] uses file system
//! events to cut the sleep between polls short; the mtime comparison stays the
//! single source of truth.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use relive_kernel::clean_path;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Watch errors
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("No watch roots given")]
    NoRoots,

    #[error("Watch root does not exist: {}", .0.display())]
    MissingRoot(PathBuf),

    #[error("Entry point does not exist: {}", .0.display())]
    MissingEntryPoint(PathBuf),

    #[error("Watched file is missing: {}", .0.display())]
    Missing(PathBuf),

    #[error("Cannot read modification time of {}", .path.display())]
    Metadata {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot resolve {}", .path.display())]
    Resolve {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("File system events unavailable")]
    Events(#[from] notify::Error),
}

/// Detected modification of a watched file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Changed file
    pub path: PathBuf,
    /// Its new modification time
    pub modified: SystemTime,
}

/// Watch configuration
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Source file extensions picked up under watch roots
    pub extensions: Vec<String>,
    /// Ignore patterns (`*suffix`, `prefix*` or exact file name)
    pub ignore_patterns: Vec<String>,
    /// Follow symbolic links while expanding roots
    pub follow_links: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            extensions: vec!["rhai".to_string()],
            ignore_patterns: vec!["*.tmp".to_string(), "*.swp".to_string(), "*~".to_string()],
            follow_links: false,
        }
    }
}

impl WatchConfig {
    /// Create a new watch config
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source extension to watch
    pub fn with_extension(mut self, ext: &str) -> Self {
        let ext = ext.trim_start_matches('.').to_string();
        if !self.extensions.contains(&ext) {
            self.extensions.push(ext);
        }
        self
    }

    /// Replace the watched extensions
    pub fn with_extensions<I, S>(mut self, exts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.extensions = exts
            .into_iter()
            .map(|e| e.as_ref().trim_start_matches('.').to_string())
            .collect();
        self
    }

    /// Add ignore pattern
    pub fn with_ignore(mut self, pattern: &str) -> Self {
        self.ignore_patterns.push(pattern.to_string());
        self
    }

    pub fn with_follow_links(mut self, follow: bool) -> Self {
        self.follow_links = follow;
        self
    }

    /// Check if a path found under a watch root should be watched
    pub fn should_watch(&self, path: &Path) -> bool {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if !self.extensions.is_empty() && !self.extensions.iter().any(|e| e == ext) {
            return false;
        }

        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        for pattern in &self.ignore_patterns {
            if let Some(suffix) = pattern.strip_prefix('*') {
                if file_name.ends_with(suffix) {
                    return false;
                }
            } else if let Some(prefix) = pattern.strip_suffix('*') {
                if file_name.starts_with(prefix) {
                    return false;
                }
            } else if file_name == pattern {
                return false;
            }
        }

        true
    }
}

/// Fixed, ordered set of files to monitor plus the last-observed modification time
#[derive(Debug, Clone)]
pub struct WatchSet {
    files: Vec<PathBuf>,
    entry_point: PathBuf,
    last_checked: SystemTime,
}

impl WatchSet {
    /// Expand `roots` recursively and append the entry point.
    ///
    /// A root that is a file is watched as-is, whatever its extension. Paths
    /// are made absolute and kept once, first occurrence wins.
    pub fn expand(
        roots: &[PathBuf],
        entry_point: &Path,
        config: &WatchConfig,
    ) -> Result<Self, WatchError> {
        if roots.is_empty() {
            return Err(WatchError::NoRoots);
        }
        if !entry_point.is_file() {
            return Err(WatchError::MissingEntryPoint(entry_point.to_path_buf()));
        }

        let mut files = Vec::new();
        for root in roots {
            if !root.exists() {
                return Err(WatchError::MissingRoot(root.clone()));
            }

            if root.is_file() {
                files.push(absolute(root)?);
                continue;
            }

            let walker = WalkDir::new(root)
                .follow_links(config.follow_links)
                .sort_by_file_name();
            for entry in walker {
                match entry {
                    Ok(entry) if entry.file_type().is_file() && config.should_watch(entry.path()) => {
                        files.push(absolute(entry.path())?);
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Skipping unreadable entry under {:?}: {}", root, e),
                }
            }
        }

        let entry_point = absolute(entry_point)?;
        files.push(entry_point.clone());

        let mut seen = HashSet::new();
        files.retain(|path| seen.insert(path.clone()));

        debug!("Watching {} files", files.len());

        Ok(Self {
            files,
            entry_point,
            last_checked: SystemTime::now(),
        })
    }

    /// Watched files, in poll order
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn entry_point(&self) -> &Path {
        &self.entry_point
    }

    pub fn last_checked(&self) -> SystemTime {
        self.last_checked
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.iter().any(|p| p == path)
    }
}

/// Absolute and lexically cleaned, so `lib/../sketch.rhai` and `sketch.rhai` compare equal
fn absolute(path: &Path) -> Result<PathBuf, WatchError> {
    std::path::absolute(path)
        .map(|abs| clean_path(&abs))
        .map_err(|source| WatchError::Resolve {
            path: path.to_path_buf(),
            source,
        })
}

/// Polls a [`WatchSet`] for files modified after the last observed change
#[derive(Debug)]
pub struct ChangeDetector {
    set: WatchSet,
    /// Files already reported missing, so each disappearance warns once
    missing: HashSet<PathBuf>,
}

impl ChangeDetector {
    pub fn new(set: WatchSet) -> Self {
        Self {
            set,
            missing: HashSet::new(),
        }
    }

    pub fn watch_set(&self) -> &WatchSet {
        &self.set
    }

    /// Report the first file newer than the last observed change.
    ///
    /// Advances the baseline to that file's modification time and stops
    /// there; remaining files are left for the next poll. Missing or
    /// unreadable files are skipped for this poll.
    pub fn poll(&mut self) -> Option<ChangeEvent> {
        for path in &self.set.files {
            let modified = match modified_time(path) {
                Ok(modified) => {
                    if self.missing.remove(path) {
                        info!("{} is back", path.display());
                    }
                    modified
                }
                Err(e) => {
                    if self.missing.insert(path.clone()) {
                        warn!("{}; skipping", e);
                    } else {
                        debug!("{}; skipping", e);
                    }
                    continue;
                }
            };

            if modified > self.set.last_checked {
                info!("{} changed", path.display());
                self.set.last_checked = modified;
                return Some(ChangeEvent {
                    path: path.clone(),
                    modified,
                });
            }
        }

        None
    }

    /// Whether any watched file changed since the last observed change
    pub fn any_changed(&mut self) -> bool {
        self.poll().is_some()
    }
}

fn modified_time(path: &Path) -> Result<SystemTime, WatchError> {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                WatchError::Missing(path.to_path_buf())
            } else {
                WatchError::Metadata {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })
}

/// Wakes the poll loop early when the file system reports activity under a root
pub struct FsWake {
    /// Kept alive for as long as events should be delivered
    _watcher: RecommendedWatcher,
    signal: Arc<Notify>,
}

impl FsWake {
    /// Watch `roots` (directories recursively) for events on watchable files
    pub fn new(roots: &[PathBuf], config: &WatchConfig) -> Result<Self, WatchError> {
        let signal = Arc::new(Notify::new());
        let notifier = signal.clone();
        let filter = config.clone();

        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| match result {
                Ok(event) => {
                    let relevant = matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) && event.paths.iter().any(|p| filter.should_watch(p));
                    if relevant {
                        notifier.notify_one();
                    }
                }
                Err(e) => debug!("File system event error: {}", e),
            },
            Config::default(),
        )?;

        for root in roots {
            let mode = if root.is_dir() {
                RecursiveMode::Recursive
            } else {
                RecursiveMode::NonRecursive
            };
            watcher.watch(root, mode)?;
        }

        info!("File system events enabled for {} roots", roots.len());

        Ok(Self {
            _watcher: watcher,
            signal,
        })
    }

    /// Resolve on the next relevant event
    pub async fn notified(&self) {
        self.signal.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::time::Duration;
    use tempfile::TempDir;

    fn touch_future(path: &Path, secs: u64) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(secs))
            .unwrap();
    }

    fn sketch_dir() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("lib")).unwrap();
        fs::write(dir.path().join("lib/ball.rhai"), "// ball").unwrap();
        fs::write(dir.path().join("lib/notes.txt"), "notes").unwrap();
        fs::write(dir.path().join("lib/ball.rhai.swp"), "").unwrap();
        let entry = dir.path().join("sketch.rhai");
        fs::write(&entry, "// sketch").unwrap();
        (dir, entry)
    }

    #[test]
    fn test_watch_config_default() {
        let config = WatchConfig::default();
        assert_eq!(config.extensions, vec!["rhai".to_string()]);
        assert!(!config.follow_links);
    }

    #[test]
    fn test_should_watch() {
        let config = WatchConfig::default().with_extension(".rb");

        assert!(config.should_watch(Path::new("/sketches/ball.rhai")));
        assert!(config.should_watch(Path::new("/sketches/ball.rb")));

        assert!(!config.should_watch(Path::new("/sketches/notes.txt")));
        assert!(!config.should_watch(Path::new("/sketches/ball.rhai.swp")));
        assert!(!config.should_watch(Path::new("/sketches/ball.rhai~")));
    }

    #[test]
    fn test_expand_roots() {
        let (dir, entry) = sketch_dir();
        let set = WatchSet::expand(&[dir.path().to_path_buf()], &entry, &WatchConfig::default())
            .unwrap();

        // entry point appears once even though the root also contains it
        assert_eq!(set.len(), 2);
        assert!(set.contains(&dir.path().join("lib/ball.rhai")));
        assert!(set.contains(&entry));
        assert!(set.files().iter().all(|p| p.is_absolute()));
    }

    #[test]
    fn test_expand_rejects_bad_input() {
        let (dir, entry) = sketch_dir();
        let config = WatchConfig::default();

        assert!(matches!(
            WatchSet::expand(&[], &entry, &config),
            Err(WatchError::NoRoots)
        ));
        assert!(matches!(
            WatchSet::expand(&[dir.path().join("nope")], &entry, &config),
            Err(WatchError::MissingRoot(_))
        ));
        assert!(matches!(
            WatchSet::expand(&[dir.path().to_path_buf()], &dir.path().join("gone.rhai"), &config),
            Err(WatchError::MissingEntryPoint(_))
        ));
    }

    #[test]
    fn test_change_reported_once() {
        let (dir, entry) = sketch_dir();
        let set = WatchSet::expand(&[dir.path().to_path_buf()], &entry, &WatchConfig::default())
            .unwrap();
        let mut detector = ChangeDetector::new(set);

        assert!(!detector.any_changed());

        let ball = dir.path().join("lib/ball.rhai");
        touch_future(&ball, 5);

        let event = detector.poll().unwrap();
        assert_eq!(event.path, ball);
        assert_eq!(detector.watch_set().last_checked(), event.modified);

        assert!(!detector.any_changed());
        assert!(!detector.any_changed());
    }

    #[test]
    fn test_missing_file_is_skipped() {
        let (dir, entry) = sketch_dir();
        let set = WatchSet::expand(&[dir.path().to_path_buf()], &entry, &WatchConfig::default())
            .unwrap();
        let mut detector = ChangeDetector::new(set);

        fs::remove_file(dir.path().join("lib/ball.rhai")).unwrap();
        touch_future(&entry, 5);

        // the missing file is passed over and the entry point still reports
        let event = detector.poll().unwrap();
        assert_eq!(event.path, entry);
        assert!(!detector.any_changed());
    }

    #[test]
    fn test_expand_cleans_parent_segments() {
        let (dir, entry) = sketch_dir();
        let root = dir.path().join("lib").join("..");
        let set = WatchSet::expand(&[root], &entry, &WatchConfig::default()).unwrap();

        assert_eq!(set.len(), 2);
        assert!(set.contains(&dir.path().join("lib/ball.rhai")));
        assert!(set.contains(&entry));
        assert!(
            set.files()
                .iter()
                .all(|p| !p.components().any(|c| c == std::path::Component::ParentDir))
        );
    }

    #[tokio::test]
    async fn test_fs_wake_on_edit() {
        let (dir, _entry) = sketch_dir();
        let wake = FsWake::new(&[dir.path().to_path_buf()], &WatchConfig::default()).unwrap();

        // let the backend register its watches
        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::write(dir.path().join("lib/ball.rhai"), "// ball, bouncier").unwrap();

        tokio::time::timeout(Duration::from_secs(5), wake.notified())
            .await
            .expect("no file system event for an edited source file");
    }
}
