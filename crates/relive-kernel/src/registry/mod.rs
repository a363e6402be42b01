//! Module registry
//!
//! The explicit host environment a supervised program mutates while it runs:
//! - a tree of named definitions (modules, classes, plain values)
//! - the record of source files that have already been loaded
//! - the load path used to resolve relative file references
//! - global variables
//!
//! The reload loop snapshots this state before the first instance starts and
//! later removes whatever an instance added on top of it.

mod error;
mod name;

pub use error::{RegistryError, RegistryResult};
pub use name::{QualifiedName, SEPARATOR};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// What a registry binding holds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DefinitionKind {
    /// A namespace with no instances of its own
    Module,
    /// A namespace that also describes instances
    Class,
    /// A plain constant value
    Value(serde_json::Value),
}

impl DefinitionKind {
    /// Modules and classes can hold nested members
    pub fn is_namespace(&self) -> bool {
        matches!(self, DefinitionKind::Module | DefinitionKind::Class)
    }

    pub fn label(&self) -> &'static str {
        match self {
            DefinitionKind::Module => "module",
            DefinitionKind::Class => "class",
            DefinitionKind::Value(_) => "value",
        }
    }
}

/// Who created a definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Owned by the host platform. Never removed, at any depth.
    Host,
    /// Created by user code
    #[default]
    User,
}

/// A single registry binding and its nested members
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Definition {
    pub kind: DefinitionKind,
    pub origin: Origin,
    members: BTreeMap<String, Definition>,
}

impl Definition {
    fn new(kind: DefinitionKind, origin: Origin) -> Self {
        Self {
            kind,
            origin,
            members: BTreeMap::new(),
        }
    }

    /// Names of members nested directly inside this definition
    pub fn member_names(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    pub fn is_host(&self) -> bool {
        self.origin == Origin::Host
    }

    /// Whether this definition or anything nested in it is host-owned
    pub fn contains_host(&self) -> bool {
        self.is_host() || self.members.values().any(Definition::contains_host)
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    root: BTreeMap<String, Definition>,
    loaded_files: Vec<PathBuf>,
    load_paths: Vec<PathBuf>,
    globals: BTreeMap<String, serde_json::Value>,
}

impl RegistryState {
    /// Members map of the namespace enclosing `name`
    fn container(&self, name: &QualifiedName) -> RegistryResult<&BTreeMap<String, Definition>> {
        let Some(parent) = name.parent() else {
            return Ok(&self.root);
        };

        let mut current = &self.root;
        for segment in parent.segments() {
            let def = current
                .get(segment)
                .ok_or_else(|| RegistryError::MissingContainer {
                    name: name.clone(),
                    container: parent.clone(),
                })?;
            if !def.kind.is_namespace() {
                return Err(RegistryError::NotANamespace(parent.clone()));
            }
            current = &def.members;
        }
        Ok(current)
    }

    fn container_mut(
        &mut self,
        name: &QualifiedName,
    ) -> RegistryResult<&mut BTreeMap<String, Definition>> {
        let Some(parent) = name.parent() else {
            return Ok(&mut self.root);
        };

        let mut current = &mut self.root;
        for segment in parent.segments() {
            let def = current
                .get_mut(segment)
                .ok_or_else(|| RegistryError::MissingContainer {
                    name: name.clone(),
                    container: parent.clone(),
                })?;
            if !def.kind.is_namespace() {
                return Err(RegistryError::NotANamespace(parent.clone()));
            }
            current = &mut def.members;
        }
        Ok(current)
    }
}

/// Shared, internally synchronized registry of definitions and loaded files.
///
/// Relative paths are resolved against `working_dir` and cleaned lexically
/// before any comparison, so `lib/a.rhai`, `./lib/a.rhai` and
/// `/project/lib/a.rhai` all name the same loaded file.
#[derive(Debug)]
pub struct ModuleRegistry {
    state: RwLock<RegistryState>,
    working_dir: PathBuf,
}

impl ModuleRegistry {
    /// Create an empty registry resolving relative paths against `working_dir`
    pub fn new<P: AsRef<Path>>(working_dir: P) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            working_dir: clean_path(working_dir.as_ref()),
        }
    }

    /// Create an empty registry rooted at the process working directory
    pub fn from_current_dir() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_dir()?))
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Absolute, lexically cleaned form of `path`
    pub fn normalize<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            clean_path(path)
        } else {
            clean_path(&self.working_dir.join(path))
        }
    }

    // ------------------------------------------------------------------
    // Definitions
    // ------------------------------------------------------------------

    /// Bind a user definition.
    ///
    /// Re-declaring a module or class of the same kind reopens it and keeps its
    /// members; re-declaring a value overwrites it. Binding a name to a
    /// different kind than it already has is a [`RegistryError::Redefinition`].
    pub fn define(&self, name: &QualifiedName, kind: DefinitionKind) -> RegistryResult<()> {
        self.define_with_origin(name, kind, Origin::User)
    }

    /// Bind a definition owned by the host platform
    pub fn define_host(&self, name: &QualifiedName, kind: DefinitionKind) -> RegistryResult<()> {
        self.define_with_origin(name, kind, Origin::Host)
    }

    fn define_with_origin(
        &self,
        name: &QualifiedName,
        kind: DefinitionKind,
        origin: Origin,
    ) -> RegistryResult<()> {
        let mut state = self.state.write();
        let container = state.container_mut(name)?;

        match container.get_mut(name.last_segment()) {
            Some(existing) => {
                if std::mem::discriminant(&existing.kind) != std::mem::discriminant(&kind) {
                    return Err(RegistryError::Redefinition {
                        name: name.clone(),
                        existing: existing.kind.label(),
                    });
                }
                if kind.is_namespace() {
                    debug!("Reopening {} {}", kind.label(), name);
                } else {
                    existing.kind = kind;
                }
            }
            None => {
                debug!("Defining {} {}", kind.label(), name);
                container.insert(
                    name.last_segment().to_string(),
                    Definition::new(kind, origin),
                );
            }
        }

        Ok(())
    }

    /// Remove the binding for `name` from its immediate container.
    ///
    /// The container must already exist; host definitions are refused.
    pub fn remove(&self, name: &QualifiedName) -> RegistryResult<Definition> {
        let mut state = self.state.write();
        let container = state.container_mut(name)?;

        let is_host = container
            .get(name.last_segment())
            .map(Definition::is_host)
            .ok_or_else(|| RegistryError::NotDefined(name.clone()))?;
        if is_host {
            return Err(RegistryError::Protected(name.clone()));
        }

        container
            .remove(name.last_segment())
            .ok_or_else(|| RegistryError::NotDefined(name.clone()))
    }

    /// Snapshot of the definition bound to `name`
    pub fn get(&self, name: &QualifiedName) -> Option<Definition> {
        let state = self.state.read();
        state
            .container(name)
            .ok()
            .and_then(|c| c.get(name.last_segment()))
            .cloned()
    }

    pub fn contains(&self, name: &QualifiedName) -> bool {
        self.get(name).is_some()
    }

    /// Every name bound in the root namespace
    pub fn top_level_names(&self) -> BTreeSet<QualifiedName> {
        let state = self.state.read();
        state
            .root
            .keys()
            .filter_map(|key| QualifiedName::parse(key).ok())
            .collect()
    }

    /// Fully qualified names of the members nested directly inside `name`
    pub fn member_names(&self, name: &QualifiedName) -> RegistryResult<Vec<QualifiedName>> {
        let def = self
            .get(name)
            .ok_or_else(|| RegistryError::NotDefined(name.clone()))?;
        Ok(def.member_names().map(|member| name.child(member)).collect())
    }

    // ------------------------------------------------------------------
    // Loaded files
    // ------------------------------------------------------------------

    /// Record `path` as loaded, exactly as given.
    ///
    /// Returns `false` when the file was already recorded under any spelling.
    pub fn record_loaded<P: AsRef<Path>>(&self, path: P) -> bool {
        let path = path.as_ref();
        let normalized = self.normalize(path);

        let mut state = self.state.write();
        if state
            .loaded_files
            .iter()
            .any(|p| self.normalize(p) == normalized)
        {
            return false;
        }
        state.loaded_files.push(path.to_path_buf());
        true
    }

    pub fn is_loaded<P: AsRef<Path>>(&self, path: P) -> bool {
        let normalized = self.normalize(path);
        let state = self.state.read();
        state
            .loaded_files
            .iter()
            .any(|p| self.normalize(p) == normalized)
    }

    /// Loaded-file records as they were recorded (possibly relative)
    pub fn loaded_files(&self) -> Vec<PathBuf> {
        self.state.read().loaded_files.clone()
    }

    /// Drop every record that normalizes to `path`, so the next request reloads it
    pub fn forget_loaded<P: AsRef<Path>>(&self, path: P) -> RegistryResult<()> {
        let normalized = self.normalize(path.as_ref());
        let mut state = self.state.write();
        let before = state.loaded_files.len();
        state
            .loaded_files
            .retain(|p| self.normalize(p) != normalized);

        if state.loaded_files.len() == before {
            return Err(RegistryError::NotLoaded(normalized));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Load path
    // ------------------------------------------------------------------

    /// Append a directory to the load path (ignored if already present)
    pub fn add_load_path<P: AsRef<Path>>(&self, dir: P) {
        let normalized = self.normalize(dir);
        let mut state = self.state.write();
        if !state.load_paths.contains(&normalized) {
            state.load_paths.push(normalized);
        }
    }

    pub fn load_paths(&self) -> Vec<PathBuf> {
        self.state.read().load_paths.clone()
    }

    pub fn remove_load_path<P: AsRef<Path>>(&self, dir: P) -> RegistryResult<()> {
        let normalized = self.normalize(dir);
        let mut state = self.state.write();
        let before = state.load_paths.len();
        state.load_paths.retain(|p| p != &normalized);

        if state.load_paths.len() == before {
            return Err(RegistryError::UnknownLoadPath(normalized));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Globals
    // ------------------------------------------------------------------

    pub fn set_global(&self, name: &str, value: serde_json::Value) {
        self.state.write().globals.insert(name.to_string(), value);
    }

    pub fn global(&self, name: &str) -> Option<serde_json::Value> {
        self.state.read().globals.get(name).cloned()
    }

    pub fn global_names(&self) -> BTreeSet<String> {
        self.state.read().globals.keys().cloned().collect()
    }

    pub fn remove_global(&self, name: &str) -> RegistryResult<serde_json::Value> {
        self.state
            .write()
            .globals
            .remove(name)
            .ok_or_else(|| RegistryError::UnknownGlobal(name.to_string()))
    }
}

/// Lexically clean a path: drop `.` components and let `..` pop its parent.
///
/// Does not touch the filesystem, so it works for files that no longer exist.
/// Lexically drop `.` and resolve `..` without touching the file system
pub fn clean_path(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !cleaned.pop() {
                    cleaned.push(component);
                }
            }
            other => cleaned.push(other),
        }
    }
    cleaned
}
