//! Registry baseline
//!
//! Snapshot of the registry taken before any instance runs. Everything in it
//! is pre-existing environment; everything else is instance-created state.

use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use relive_kernel::{ModuleRegistry, QualifiedName};
use tracing::info;

/// Immutable snapshot of top-level names, loaded files, load paths and globals
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryBaseline {
    defined_names: BTreeSet<QualifiedName>,
    /// Normalized to absolute paths
    loaded_files: BTreeSet<PathBuf>,
    load_paths: BTreeSet<PathBuf>,
    global_names: BTreeSet<String>,
}

impl RegistryBaseline {
    /// Capture the current registry state.
    ///
    /// Must run before the first instance starts: anything an instance defines
    /// before the capture is treated as pre-existing and never purged.
    pub fn capture(registry: &ModuleRegistry) -> Self {
        let baseline = Self {
            defined_names: registry.top_level_names(),
            loaded_files: registry
                .loaded_files()
                .iter()
                .map(|path| registry.normalize(path))
                .collect(),
            load_paths: registry
                .load_paths()
                .iter()
                .map(|path| registry.normalize(path))
                .collect(),
            global_names: registry.global_names(),
        };

        info!(
            "Captured registry baseline: {} names, {} loaded files, {} load paths, {} globals",
            baseline.defined_names.len(),
            baseline.loaded_files.len(),
            baseline.load_paths.len(),
            baseline.global_names.len()
        );

        baseline
    }

    pub fn defined_names(&self) -> &BTreeSet<QualifiedName> {
        &self.defined_names
    }

    pub fn loaded_files(&self) -> &BTreeSet<PathBuf> {
        &self.loaded_files
    }

    pub fn load_paths(&self) -> &BTreeSet<PathBuf> {
        &self.load_paths
    }

    pub fn global_names(&self) -> &BTreeSet<String> {
        &self.global_names
    }

    pub fn contains_name(&self, name: &QualifiedName) -> bool {
        self.defined_names.contains(name)
    }

    /// `path` must already be normalized
    pub fn contains_file(&self, path: &Path) -> bool {
        self.loaded_files.contains(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relive_kernel::DefinitionKind;

    #[test]
    fn test_capture_normalizes_loaded_files() {
        let registry = ModuleRegistry::new("/work");
        registry
            .define(&QualifiedName::parse("Kernel").unwrap(), DefinitionKind::Module)
            .unwrap();
        registry.record_loaded("lib/./util.rhai");
        registry.add_load_path("vendor");
        registry.set_global("debug", serde_json::json!(false));

        let baseline = RegistryBaseline::capture(&registry);

        assert!(baseline.contains_name(&QualifiedName::parse("Kernel").unwrap()));
        assert!(baseline.contains_file(Path::new("/work/lib/util.rhai")));
        assert!(baseline.load_paths().contains(Path::new("/work/vendor")));
        assert!(baseline.global_names().contains("debug"));
    }

    #[test]
    fn test_baseline_does_not_track_later_changes() {
        let registry = ModuleRegistry::new("/work");
        let baseline = RegistryBaseline::capture(&registry);

        registry
            .define(&QualifiedName::parse("Sketch1").unwrap(), DefinitionKind::Class)
            .unwrap();

        assert!(baseline.defined_names().is_empty());
        assert_ne!(baseline, RegistryBaseline::capture(&registry));
    }
}
