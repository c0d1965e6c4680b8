//! Owning handles for registrations and trackers.
//!
//! Both handles are move-only. Dropping a live handle unregisters or stops
//! it; explicit `unregister()`/`stop()` followed by the drop has the same
//! effect as either alone. [`Default`] handles are invalid and inert, which
//! also makes `std::mem::take` the way to move ownership out of a field.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::warn;

use crate::entry::{RegistrationState, SharedState};
use crate::error::Result;
use crate::registry::ServiceRegistry;
use crate::tracker::{TrackedService, TrackerEntry};

/// Handle to a registered service.
#[derive(Debug)]
#[must_use = "dropping the registration unregisters the service"]
pub struct ServiceRegistration {
	registry: Weak<ServiceRegistry>,
	svc_id: i64,
	svc_name: String,
	state: Arc<SharedState>,
}

impl Default for ServiceRegistration {
	fn default() -> Self {
		Self {
			registry: Weak::new(),
			svc_id: -1,
			svc_name: String::new(),
			state: SharedState::new(RegistrationState::Unregistered),
		}
	}
}

impl ServiceRegistration {
	pub(crate) fn new(registry: Weak<ServiceRegistry>, svc_id: i64, svc_name: String, state: Arc<SharedState>) -> Self {
		Self {
			registry,
			svc_id,
			svc_name,
			state,
		}
	}

	/// `-1` for default handles.
	pub fn service_id(&self) -> i64 {
		self.svc_id
	}

	pub fn service_name(&self) -> &str {
		&self.svc_name
	}

	pub fn registration_state(&self) -> RegistrationState {
		self.state.get()
	}

	/// Whether this handle still owns a registered service.
	pub fn valid(&self) -> bool {
		self.svc_id > 0 && self.registry.strong_count() > 0 && self.state.get() == RegistrationState::Registered
	}

	/// Unregisters the service. Waits for in-flight users, bounded by the
	/// registry's configured timeout if any; a timeout is logged.
	pub fn unregister(&mut self) {
		let Some(registry) = self.take_registry() else {
			return;
		};
		if let Err(err) = registry.unregister_entry(self.svc_id, registry.config().unregister_timeout()) {
			warn!(registry = registry.name(), svc_id = self.svc_id, %err, "unregister did not drain");
		}
	}

	/// Unregisters the service, waiting at most `timeout` for in-flight users.
	///
	/// On timeout the service is already invisible to lookups and trackers;
	/// only the wait was cut short.
	pub fn unregister_within(&mut self, timeout: Duration) -> Result<()> {
		match self.take_registry() {
			Some(registry) => registry.unregister_entry(self.svc_id, Some(timeout)),
			None => Ok(()),
		}
	}

	/// Disarms the handle without unregistering, returning the service id.
	pub(crate) fn detach(&mut self) -> i64 {
		self.registry = Weak::new();
		self.svc_id
	}

	fn take_registry(&mut self) -> Option<Arc<ServiceRegistry>> {
		std::mem::take(&mut self.registry).upgrade()
	}
}

impl Drop for ServiceRegistration {
	fn drop(&mut self) {
		self.unregister();
	}
}

/// Handle to a live service tracker.
#[derive(Default)]
#[must_use = "dropping the tracker stops it"]
pub struct ServiceTracker {
	registry: Weak<ServiceRegistry>,
	entry: Option<Arc<TrackerEntry>>,
}

impl ServiceTracker {
	pub(crate) fn new(registry: Weak<ServiceRegistry>, entry: Arc<TrackerEntry>) -> Self {
		Self {
			registry,
			entry: Some(entry),
		}
	}

	/// A tracker that tracks nothing, returned for unparsable filters.
	pub(crate) fn invalid() -> Self {
		Self::default()
	}

	/// `false` for trackers created with an invalid filter, default handles
	/// and stopped trackers.
	pub fn valid(&self) -> bool {
		self.entry.is_some()
	}

	/// `-1` for invalid trackers.
	pub fn tracker_id(&self) -> i64 {
		self.entry.as_ref().map_or(-1, |e| e.tracker_id)
	}

	pub fn service_name(&self) -> &str {
		self.entry.as_ref().map_or("", |e| e.svc_name.as_str())
	}

	/// Canonical text of the tracker's filter.
	pub fn filter(&self) -> String {
		self.entry.as_ref().map(|e| e.filter.to_string()).unwrap_or_default()
	}

	/// Number of currently matched services.
	pub fn track_count(&self) -> usize {
		self.entry.as_ref().map_or(0, |e| e.track_count())
	}

	/// Matched services in ranking order.
	pub fn tracked_services(&self) -> Vec<TrackedService> {
		self.entry.as_ref().map(|e| e.tracked()).unwrap_or_default()
	}

	/// The highest ranked match.
	pub fn highest(&self) -> Option<TrackedService> {
		self.entry.as_ref().and_then(|e| e.highest())
	}

	/// Stops tracking. Fires `remove` for every match and a final `set(None)`.
	pub fn stop(&mut self) {
		let Some((registry, entry)) = self.take() else {
			return;
		};
		if let Err(err) = registry.remove_tracker(&entry, registry.config().unregister_timeout()) {
			warn!(registry = registry.name(), tracker_id = entry.tracker_id, %err, "tracker stop did not drain");
		}
	}

	/// Stops tracking, waiting at most `timeout` for in-flight notifications.
	pub fn stop_within(&mut self, timeout: Duration) -> Result<()> {
		match self.take() {
			Some((registry, entry)) => registry.remove_tracker(&entry, Some(timeout)),
			None => Ok(()),
		}
	}

	/// Detaches the entry. Without a registry nobody else can reach it, so
	/// its matches are released here.
	fn take(&mut self) -> Option<(Arc<ServiceRegistry>, Arc<TrackerEntry>)> {
		let entry = self.entry.take()?;
		let Some(registry) = std::mem::take(&mut self.registry).upgrade() else {
			entry.clear();
			return None;
		};
		Some((registry, entry))
	}
}

impl Drop for ServiceTracker {
	fn drop(&mut self) {
		self.stop();
	}
}

impl std::fmt::Debug for ServiceTracker {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ServiceTracker")
			.field("tracker_id", &self.tracker_id())
			.field("service_name", &self.service_name())
			.field("filter", &self.filter())
			.field("track_count", &self.track_count())
			.finish()
	}
}
