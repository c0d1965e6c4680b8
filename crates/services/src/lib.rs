//! Dynamic service registry.
//!
//! Services are registered under a name with a property map and a ranking,
//! looked up by name and [filter](lattice_core::Filter), and observed through
//! trackers that keep a live, ranked view of every match.
//!
//! Notification is synchronous: by the time `register_*` or `unregister`
//! returns, every interested tracker has run its callbacks.

/// Registry configuration.
pub mod config;
mod entry;
/// Registry error types.
pub mod error;
mod handle;
mod registry;
/// Type-erased service payloads and factories.
pub mod service;
/// Process-wide static bundles.
pub mod static_bundles;
/// Service trackers and their callbacks.
pub mod tracker;
mod usage;

pub use config::RegistryConfig;
pub use entry::RegistrationState;
pub use error::{RegistryError, Result, WaitTarget};
pub use handle::{ServiceRegistration, ServiceTracker};
pub use lattice_core::{EMPTY_BUNDLE_ID, EmptyBundle, Filter, FilterError, Properties, ResourceBundle, keys};
pub use registry::{RegisterOptions, ServiceRegistry, UseOptions};
pub use service::{ServiceFactory, ServiceObject, function_service_name, service_name};
pub use static_bundles::{clear_static_bundles, register_static_bundle, static_bundles};
pub use tracker::{TrackedService, TrackerOptions};

#[cfg(test)]
pub(crate) mod test_support {
	use std::sync::Arc;

	use lattice_core::ResourceBundle;

	use crate::{RegistryConfig, ServiceRegistry};

	/// Registry that ignores static bundles, so tests do not race the global list.
	pub(crate) fn registry() -> Arc<ServiceRegistry> {
		ServiceRegistry::with_config(RegistryConfig {
			install_static_bundles: false,
			..RegistryConfig::named("test")
		})
	}

	#[derive(Debug)]
	pub(crate) struct TestBundle(pub i64);

	impl ResourceBundle for TestBundle {
		fn id(&self) -> i64 {
			self.0
		}

		fn name(&self) -> &str {
			"test-bundle"
		}
	}

	pub(crate) fn bundle(id: i64) -> Arc<dyn ResourceBundle> {
		Arc::new(TestBundle(id))
	}
}
