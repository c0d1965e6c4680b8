//! Component managers: a component instance whose lifecycle follows the
//! availability of the services it depends on.
//!
//! A [`ComponentManager`] owns one instance, a set of [`ServiceDependency`]s
//! and a set of [`ProvidedService`]s. Once enabled it initializes the
//! instance, starts it when every required dependency is resolved and then
//! registers the provided services; losing a required dependency stops it
//! and withdraws them again.

/// Service dependencies and their update strategies.
pub mod dependency;
/// Component error types.
pub mod error;
mod manager;
/// Services provided by a component.
pub mod provided;
/// Component lifecycle states.
pub mod state;

pub use dependency::{Cardinality, ServiceDependency, UpdateStrategy};
pub use error::{ComponentError, Result};
pub use manager::{ComponentManager, Lifecycle, LifecycleCallback};
pub use provided::ProvidedService;
pub use state::ComponentState;
