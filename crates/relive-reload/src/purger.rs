//! Registry purging
//!
//! Removes every definition, loaded-file record, load-path entry and global
//! created since the [`RegistryBaseline`], so the next instance re-executes its
//! entry point from a clean slate. Cleanup is best effort: a removal that fails
//! is logged and recorded, and the remaining removals still run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use relive_kernel::{ModuleRegistry, QualifiedName};
use tracing::{debug, info, warn};

use crate::baseline::RegistryBaseline;

/// How deep a purge reaches into removed namespaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurgeDepth {
    /// Remove new top-level modules and classes only; plain values stay
    #[default]
    TopLevel,
    /// Remove every new entry, members first, never touching host definitions
    Recursive,
}

/// Purge configuration
#[derive(Debug, Clone)]
pub struct PurgePolicy {
    pub depth: PurgeDepth,
    /// Never removed, even when created after the baseline
    pub protected_names: BTreeSet<QualifiedName>,
    /// Drop load-path entries added since the baseline
    pub rewind_load_paths: bool,
    /// Drop globals created since the baseline
    pub rewind_globals: bool,
}

impl Default for PurgePolicy {
    fn default() -> Self {
        Self {
            depth: PurgeDepth::default(),
            protected_names: BTreeSet::new(),
            rewind_load_paths: true,
            rewind_globals: true,
        }
    }
}

impl PurgePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_depth(mut self, depth: PurgeDepth) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_protected(mut self, name: QualifiedName) -> Self {
        self.protected_names.insert(name);
        self
    }

    pub fn with_rewind_load_paths(mut self, enabled: bool) -> Self {
        self.rewind_load_paths = enabled;
        self
    }

    pub fn with_rewind_globals(mut self, enabled: bool) -> Self {
        self.rewind_globals = enabled;
        self
    }
}

/// A single removal that could not be performed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeFailure {
    pub target: String,
    pub reason: String,
}

/// What a purge removed
#[derive(Debug, Clone, Default, Serialize)]
pub struct PurgeReport {
    pub removed_names: Vec<QualifiedName>,
    /// Plain values left in place by a top-level purge
    pub kept_values: Vec<QualifiedName>,
    pub removed_files: Vec<PathBuf>,
    pub removed_load_paths: Vec<PathBuf>,
    pub removed_globals: Vec<String>,
    pub failures: Vec<PurgeFailure>,
}

impl PurgeReport {
    /// Nothing was removed and nothing failed
    pub fn is_empty(&self) -> bool {
        self.removed_names.is_empty()
            && self.removed_files.is_empty()
            && self.removed_load_paths.is_empty()
            && self.removed_globals.is_empty()
            && self.failures.is_empty()
    }

    fn fail(&mut self, target: impl ToString, reason: impl ToString) {
        let failure = PurgeFailure {
            target: target.to_string(),
            reason: reason.to_string(),
        };
        warn!("Could not purge {}: {}", failure.target, failure.reason);
        self.failures.push(failure);
    }
}

/// Restores a [`ModuleRegistry`] to the shape of a [`RegistryBaseline`]
pub struct RegistryPurger {
    registry: Arc<ModuleRegistry>,
    policy: PurgePolicy,
}

impl RegistryPurger {
    pub fn new(registry: Arc<ModuleRegistry>, policy: PurgePolicy) -> Self {
        Self { registry, policy }
    }

    pub fn policy(&self) -> &PurgePolicy {
        &self.policy
    }

    /// Purge everything created since `baseline`
    pub fn purge(&self, baseline: &RegistryBaseline) -> PurgeReport {
        self.purge_with(baseline, &[])
    }

    /// Purge everything created since `baseline`, plus `extra_names`.
    ///
    /// `extra_names` are names an instance declared for itself; they may be
    /// nested (`Sketches::Bouncing`) and are skipped quietly when absent.
    pub fn purge_with(
        &self,
        baseline: &RegistryBaseline,
        extra_names: &[QualifiedName],
    ) -> PurgeReport {
        let mut report = PurgeReport::default();

        for name in self.names_to_remove(baseline, extra_names) {
            match self.policy.depth {
                PurgeDepth::TopLevel => self.remove_top_level(&name, &mut report),
                PurgeDepth::Recursive => {
                    self.remove_recursive(&name, &mut report);
                }
            }
        }

        self.purge_loaded_files(baseline, &mut report);

        if self.policy.rewind_load_paths {
            self.purge_load_paths(baseline, &mut report);
        }
        if self.policy.rewind_globals {
            self.purge_globals(baseline, &mut report);
        }

        info!(
            "Purged names: [{}]",
            report
                .removed_names
                .iter()
                .map(QualifiedName::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        );
        info!(
            "Purged files: [{}]",
            report
                .removed_files
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        if let Ok(json) = serde_json::to_string(&report) {
            debug!("Purge report: {}", json);
        }

        report
    }

    /// Current top-level names minus the baseline and protected names,
    /// followed by any extra names not already covered
    pub fn names_to_remove(
        &self,
        baseline: &RegistryBaseline,
        extra_names: &[QualifiedName],
    ) -> Vec<QualifiedName> {
        let removable =
            |name: &QualifiedName| !baseline.contains_name(name) && !self.policy.protected_names.contains(name);

        let mut names: Vec<QualifiedName> = self
            .registry
            .top_level_names()
            .into_iter()
            .filter(|name| removable(name))
            .collect();

        for name in extra_names {
            if removable(name) && !names.contains(name) && self.registry.contains(name) {
                names.push(name.clone());
            }
        }

        names
    }

    fn remove_top_level(&self, name: &QualifiedName, report: &mut PurgeReport) {
        let Some(def) = self.registry.get(name) else {
            debug!("{} already gone", name);
            return;
        };

        if !def.kind.is_namespace() {
            debug!("Keeping value {}", name);
            report.kept_values.push(name.clone());
            return;
        }
        if def.contains_host() {
            report.fail(name, "contains host definitions");
            return;
        }

        match self.registry.remove(name) {
            Ok(_) => report.removed_names.push(name.clone()),
            Err(e) => report.fail(name, e),
        }
    }

    /// Remove `name` after its members. Returns whether it was removed.
    ///
    /// Host definitions are neither entered nor removed, and a namespace that
    /// still holds one afterwards is kept as well.
    fn remove_recursive(&self, name: &QualifiedName, report: &mut PurgeReport) -> bool {
        let Some(def) = self.registry.get(name) else {
            debug!("{} already gone", name);
            return true;
        };

        if def.is_host() {
            debug!("Keeping host definition {}", name);
            return false;
        }

        let mut emptied = true;
        if def.kind.is_namespace() {
            for member in def.member_names() {
                emptied &= self.remove_recursive(&name.child(member), report);
            }
        }

        if !emptied {
            report.fail(name, "still holds host definitions");
            return false;
        }

        match self.registry.remove(name) {
            Ok(_) => {
                report.removed_names.push(name.clone());
                true
            }
            Err(e) => {
                report.fail(name, e);
                false
            }
        }
    }

    fn purge_loaded_files(&self, baseline: &RegistryBaseline, report: &mut PurgeReport) {
        let new_files: BTreeSet<PathBuf> = self
            .registry
            .loaded_files()
            .iter()
            .map(|path| self.registry.normalize(path))
            .filter(|path| !baseline.contains_file(path))
            .collect();

        for path in new_files {
            match self.registry.forget_loaded(&path) {
                Ok(()) => report.removed_files.push(path),
                Err(e) => report.fail(path.display(), e),
            }
        }
    }

    fn purge_load_paths(&self, baseline: &RegistryBaseline, report: &mut PurgeReport) {
        for dir in self.registry.load_paths() {
            if baseline.load_paths().contains(&dir) {
                continue;
            }
            match self.registry.remove_load_path(&dir) {
                Ok(()) => report.removed_load_paths.push(dir),
                Err(e) => report.fail(dir.display(), e),
            }
        }
    }

    fn purge_globals(&self, baseline: &RegistryBaseline, report: &mut PurgeReport) {
        for name in self.registry.global_names() {
            if baseline.global_names().contains(&name) {
                continue;
            }
            match self.registry.remove_global(&name) {
                Ok(_) => report.removed_globals.push(name),
                Err(e) => report.fail(&name, e),
            }
        }
    }
}
