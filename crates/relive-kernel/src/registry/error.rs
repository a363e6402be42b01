//! Typed errors for the module registry.

use std::path::PathBuf;

use thiserror::Error;

use super::QualifiedName;

/// Errors raised by [`ModuleRegistry`](super::ModuleRegistry) operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RegistryError {
    /// The string is not a valid `::`-separated name.
    #[error("Invalid qualified name: {0:?}")]
    InvalidName(String),

    /// Nothing is bound under this name.
    #[error("Not defined: {0}")]
    NotDefined(QualifiedName),

    /// The enclosing namespace of a nested name does not exist.
    #[error("Enclosing namespace {container} of {name} is not defined")]
    MissingContainer {
        name: QualifiedName,
        container: QualifiedName,
    },

    /// A plain value was used where a module or class was required.
    #[error("{0} is not a module or class")]
    NotANamespace(QualifiedName),

    /// The definition belongs to the host platform and cannot be removed.
    #[error("{0} is owned by the host and cannot be removed")]
    Protected(QualifiedName),

    /// The name is already bound to a definition of another kind.
    #[error("{name} is already defined as a {existing}")]
    Redefinition {
        name: QualifiedName,
        existing: &'static str,
    },

    /// The file is not in the loaded-file record.
    #[error("Not a loaded file: {}", .0.display())]
    NotLoaded(PathBuf),

    /// The directory is not on the load path.
    #[error("Not on the load path: {}", .0.display())]
    UnknownLoadPath(PathBuf),

    /// No global variable with this name.
    #[error("Unknown global: {0}")]
    UnknownGlobal(String),
}

/// Convenience result alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;
