//! Process-wide bundles activated in every new registry.
//!
//! The list is append-only while the process runs. Each registry consults
//! it exactly once, during construction; bundles added later only reach
//! registries created afterwards. [`clear_static_bundles`] exists for
//! teardown between tests.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::handle::ServiceRegistration;
use crate::registry::ServiceRegistry;

/// Activator run against each new registry. The returned registrations live
/// as long as the registry (or until [`ServiceRegistry::shutdown`]).
pub type StaticActivator = Arc<dyn Fn(&Arc<ServiceRegistry>) -> Vec<ServiceRegistration> + Send + Sync>;

#[derive(Clone)]
struct StaticBundle {
	name: String,
	activator: StaticActivator,
}

impl fmt::Debug for StaticBundle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("StaticBundle").field("name", &self.name).finish_non_exhaustive()
	}
}

static STATIC_BUNDLES: Mutex<Vec<StaticBundle>> = Mutex::new(Vec::new());

/// Appends a bundle to the process-wide list.
pub fn register_static_bundle(
	name: impl Into<String>,
	activator: impl Fn(&Arc<ServiceRegistry>) -> Vec<ServiceRegistration> + Send + Sync + 'static,
) {
	let name = name.into();
	debug!(bundle = %name, "registered static bundle");
	STATIC_BUNDLES.lock().push(StaticBundle {
		name,
		activator: Arc::new(activator),
	});
}

/// Names of the registered static bundles, in registration order.
pub fn static_bundles() -> Vec<String> {
	STATIC_BUNDLES.lock().iter().map(|b| b.name.clone()).collect()
}

/// Empties the list. Registries that already activated bundles keep their
/// registrations.
pub fn clear_static_bundles() {
	STATIC_BUNDLES.lock().clear();
}

/// Runs every activator against `registry`. Activators run outside the
/// global lock so they may register further static bundles.
pub(crate) fn activate_all(registry: &Arc<ServiceRegistry>) -> Vec<ServiceRegistration> {
	let bundles = STATIC_BUNDLES.lock().clone();
	let mut registrations = Vec::new();
	for bundle in bundles {
		let installed = (bundle.activator)(registry);
		debug!(
			registry = registry.name(),
			bundle = %bundle.name,
			services = installed.len(),
			"activated static bundle"
		);
		registrations.extend(installed);
	}
	registrations
}
