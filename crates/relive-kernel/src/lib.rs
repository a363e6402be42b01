//! relive kernel
//!
//! Core contracts shared by the reload loop and the programs it supervises:
//! - [`Instance`] / [`EntryPoint`]: the narrow interface a supervised program exposes
//! - [`ModuleRegistry`]: the explicit host environment (definitions, loaded files,
//!   load paths, globals) that a purge restores to its baseline shape
//! - [`ReloadEvent`]: lifecycle notifications broadcast by the reload loop

pub mod event;
pub mod instance;
pub mod registry;

pub use event::ReloadEvent;
pub use instance::{BoxError, EntryPoint, Instance, InstanceError, InstanceId, InstanceResult};
pub use registry::{
    Definition, DefinitionKind, ModuleRegistry, Origin, QualifiedName, RegistryError,
    RegistryResult, clean_path,
};
