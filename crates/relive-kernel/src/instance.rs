//! Instance contracts
//!
//! A supervised program is reached only through these two traits: an
//! [`EntryPoint`] turns a file path into an [`Instance`], and the instance
//! runs until it ends or is torn down.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::registry::{ModuleRegistry, QualifiedName, RegistryError};

/// Boxed error used as the source of instance failures
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for instance operations
pub type InstanceResult<T> = Result<T, InstanceError>;

/// Errors raised while loading or running an instance.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InstanceError {
    /// The entry point could not be turned into an instance.
    #[error("Failed to load entry point {}", .path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    /// The instance failed while running.
    #[error("Instance failed: {message}")]
    Runtime {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// The instance panicked.
    #[error("Instance panicked: {0}")]
    Panicked(String),

    /// A registry operation failed on behalf of the instance.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl InstanceError {
    pub fn load<E: Into<BoxError>>(path: &Path, source: E) -> Self {
        Self::Load {
            path: path.to_path_buf(),
            source: source.into(),
        }
    }

    pub fn runtime<E: Into<BoxError>>(message: impl Into<String>, source: E) -> Self {
        Self::Runtime {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Render this error followed by each of its sources, outermost first
    pub fn chain(&self) -> Vec<String> {
        let mut chain = vec![self.to_string()];
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }
        chain
    }
}

/// Unique identity of one instance run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One running execution of a supervised program
#[async_trait]
pub trait Instance: Send + Sync {
    /// Run the program. Does not return until it ends or is terminated.
    async fn run(&self) -> InstanceResult<()>;

    /// Stop any animation or render loop
    fn stop_animating(&self) {}

    /// Release everything the instance holds (windows, handles, threads)
    fn close(&self) {}

    /// Resolve once every execution path of the instance has exited.
    ///
    /// Called after [`close`](Instance::close). Instances that run only on the
    /// task that calls [`run`](Instance::run) have nothing left to wait for.
    async fn wait_closed(&self) {}

    /// The registry name the instance defines for itself, if any.
    ///
    /// Purged together with everything else created since the baseline.
    fn definition_name(&self) -> Option<QualifiedName> {
        None
    }
}

/// Loader that turns a file path into an [`Instance`]
pub trait EntryPoint: Send + Sync {
    /// Load `path` against `registry`.
    ///
    /// Must not block on running the program: that happens in [`Instance::run`].
    fn load(&self, path: &Path, registry: Arc<ModuleRegistry>) -> InstanceResult<Arc<dyn Instance>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Idle;

    #[async_trait]
    impl Instance for Idle {
        async fn run(&self) -> InstanceResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_default_controls_are_noops() {
        let instance = Idle;
        instance.stop_animating();
        instance.close();
        instance.wait_closed().await;
        assert!(instance.definition_name().is_none());
        assert!(instance.run().await.is_ok());
    }

    #[test]
    fn test_error_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "sketch.rhai missing");
        let err = InstanceError::load(Path::new("sketch.rhai"), io);
        let chain = err.chain();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0], "Failed to load entry point sketch.rhai");
        assert_eq!(chain[1], "sketch.rhai missing");
    }

    #[test]
    fn test_instance_ids_are_distinct() {
        assert_ne!(InstanceId::new(), InstanceId::new());
    }
}
