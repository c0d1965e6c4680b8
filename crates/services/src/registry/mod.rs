//! The concurrent service registry.
//!
//! # Role
//!
//! Maps service names to ranked sets of [`ServiceEntry`]s, answers lookups
//! and keeps every [`TrackerEntry`] in sync with registrations.
//!
//! # Invariants
//!
//! - Service ids start at 1, increase monotonically and are never reused.
//!   - Enforced in: [`ServiceRegistry::register_payload`]
//!   - Tested by: `registry::invariants::test_service_ids_are_never_reused`
//!   - Failure symptom: a stale handle unregisters someone else's service.
//! - `unregister` returns only after trackers were told and every in-flight
//!   use of the entry was released.
//!   - Enforced in: [`ServiceRegistry::unregister_entry`]
//!   - Tested by: `registry::tests::unregister_waits_for_in_flight_use`
//!   - Failure symptom: a service is invoked after its owner tore it down.
//! - At quiescence every tracker holds exactly the registered entries it wants.
//!   - Enforced in: [`ServiceRegistry::track_services_named`], [`ServiceRegistry::update_trackers`]
//!   - Tested by: `registry::invariants::test_trackers_converge`
//!   - Failure symptom: dependencies stay resolved on a service that is gone.
//!
//! # Concurrency
//!
//! Two tables, each under its own mutex: services then trackers, always in
//! that order. Neither lock is held while user callbacks or factories run;
//! entries and trackers are captured with their usage counts raised and the
//! locks released before notification.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use lattice_core::{Filter, empty_bundle, keys};
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::{debug, error, warn};

use crate::config::RegistryConfig;
use crate::entry::{RankKey, RegistrationState, ServiceEntry};
use crate::error::{RegistryError, Result, WaitTarget};
use crate::handle::{ServiceRegistration, ServiceTracker};
use crate::service::{ServiceFactory, ServiceObject, ServicePayload, function_service_name, service_name};
use crate::static_bundles;
use crate::tracker::{TrackedService, TrackerEntry, TrackerOptions};
use crate::usage::{Counted, InUse};

mod options;

#[cfg(test)]
mod invariants;
#[cfg(test)]
mod tests;

pub use options::{RegisterOptions, UseOptions};

type Used = SmallVec<[InUse<ServiceEntry>; 4]>;

#[derive(Default)]
struct ServicesTable {
	by_name: FxHashMap<String, BTreeMap<RankKey, Arc<ServiceEntry>>>,
	by_id: FxHashMap<i64, Arc<ServiceEntry>>,
}

impl ServicesTable {
	/// Matching entries in ranking order. An empty name matches every service.
	fn matching(&self, svc_name: &str, filter: &Filter) -> Vec<&Arc<ServiceEntry>> {
		if svc_name.is_empty() {
			let mut all: Vec<_> = self.by_id.values().filter(|e| filter.matches(&e.properties)).collect();
			all.sort_by_key(|e| e.key());
			all
		} else {
			self.by_name
				.get(svc_name)
				.into_iter()
				.flat_map(|set| set.values())
				.filter(|e| filter.matches(&e.properties))
				.collect()
		}
	}

	/// Like [`Self::matching`], with each entry's usage raised.
	fn collect(&self, svc_name: &str, filter: &Filter, limit: Option<usize>) -> Used {
		self.matching(svc_name, filter)
			.into_iter()
			.take(limit.unwrap_or(usize::MAX))
			.map(InUse::acquire)
			.collect()
	}
}

#[derive(Default)]
struct TrackersTable {
	by_name: FxHashMap<String, FxHashMap<i64, Arc<TrackerEntry>>>,
}

impl TrackersTable {
	fn interested_in(&self, entry: &ServiceEntry) -> SmallVec<[InUse<TrackerEntry>; 4]> {
		[entry.svc_name.as_str(), ""]
			.into_iter()
			.filter_map(|name| self.by_name.get(name))
			.flat_map(|trackers| trackers.values())
			.filter(|tracker| tracker.wants(entry))
			.map(InUse::acquire)
			.collect()
	}

	fn len(&self) -> usize {
		self.by_name.values().map(FxHashMap::len).sum()
	}
}

/// Process-local registry of services and trackers.
///
/// Always lives in an [`Arc`]; handles keep a [`Weak`] back-reference and
/// become no-ops once the registry is gone.
pub struct ServiceRegistry {
	config: RegistryConfig,
	me: Weak<ServiceRegistry>,
	next_svc_id: AtomicI64,
	next_tracker_id: AtomicI64,
	services: Mutex<ServicesTable>,
	/// Signalled on every registration, for `wait_for` lookups.
	registered: Condvar,
	trackers: Mutex<TrackersTable>,
	static_registrations: Mutex<Vec<ServiceRegistration>>,
}

impl ServiceRegistry {
	pub fn new(name: impl Into<String>) -> Arc<Self> {
		Self::with_config(RegistryConfig::named(name))
	}

	/// Creates a registry and, unless disabled, activates the static bundles.
	pub fn with_config(config: RegistryConfig) -> Arc<Self> {
		let install = config.install_static_bundles;
		let registry = Arc::new_cyclic(|me| Self {
			config,
			me: me.clone(),
			next_svc_id: AtomicI64::new(1),
			next_tracker_id: AtomicI64::new(1),
			services: Mutex::new(ServicesTable::default()),
			registered: Condvar::new(),
			trackers: Mutex::new(TrackersTable::default()),
			static_registrations: Mutex::new(Vec::new()),
		});
		if install {
			let registrations = static_bundles::activate_all(&registry);
			registry.static_registrations.lock().extend(registrations);
		}
		registry
	}

	pub fn name(&self) -> &str {
		&self.config.name
	}

	pub fn config(&self) -> &RegistryConfig {
		&self.config
	}

	/// Registers `service` under the name of `I`.
	pub fn register_service<I>(&self, service: Arc<I>, options: RegisterOptions) -> ServiceRegistration
	where
		I: ?Sized + Send + Sync + 'static,
	{
		self.register_service_named(service_name::<I>(), ServiceObject::new(service), options)
	}

	/// Registers a type-erased service under an explicit name.
	///
	/// # Panics
	///
	/// Panics if `svc_name` is empty.
	pub fn register_service_named(&self, svc_name: &str, service: ServiceObject, options: RegisterOptions) -> ServiceRegistration {
		self.register_payload(svc_name, ServicePayload::Instance(service), options)
	}

	/// Registers a factory that hands each requesting bundle its own instance of `I`.
	pub fn register_service_factory<I>(&self, factory: Arc<dyn ServiceFactory>, options: RegisterOptions) -> ServiceRegistration
	where
		I: ?Sized + 'static,
	{
		self.register_service_factory_named(service_name::<I>(), factory, options)
	}

	/// # Panics
	///
	/// Panics if `svc_name` is empty.
	pub fn register_service_factory_named(
		&self,
		svc_name: &str,
		factory: Arc<dyn ServiceFactory>,
		options: RegisterOptions,
	) -> ServiceRegistration {
		self.register_payload(svc_name, ServicePayload::Factory(factory), options)
	}

	/// Registers a function under `function_name`, qualified by its type `F`.
	///
	/// # Panics
	///
	/// Panics if `function_name` is empty.
	pub fn register_function_service<F>(&self, function_name: &str, function: Arc<F>, mut options: RegisterOptions) -> ServiceRegistration
	where
		F: ?Sized + Send + Sync + 'static,
	{
		assert!(!function_name.is_empty(), "function name must not be empty");
		options.properties.set(keys::FUNCTION_NAME, function_name);
		let svc_name = function_service_name::<F>(function_name);
		self.register_service_named(&svc_name, ServiceObject::new(function), options)
	}

	fn register_payload(&self, svc_name: &str, payload: ServicePayload, options: RegisterOptions) -> ServiceRegistration {
		assert!(!svc_name.is_empty(), "service name must not be empty");

		let svc_id = self.next_svc_id.fetch_add(1, Ordering::AcqRel);
		let owner = options.owner.unwrap_or_else(empty_bundle);
		let mut properties = options.properties;
		properties.set(keys::SERVICE_NAME, svc_name);
		properties.set(keys::SERVICE_ID, svc_id);
		properties.set(keys::SERVICE_BUNDLE_ID, owner.id());

		let entry = Arc::new(ServiceEntry::new(svc_id, svc_name.to_owned(), properties, owner, payload));
		// Held until trackers were notified, so unregister cannot overtake us.
		let registering = InUse::acquire(&entry);
		{
			let mut services = self.services.lock();
			services
				.by_name
				.entry(svc_name.to_owned())
				.or_default()
				.insert(entry.key(), Arc::clone(&entry));
			services.by_id.insert(svc_id, Arc::clone(&entry));
			self.registered.notify_all();
		}
		debug!(
			registry = %self.config.name,
			svc_id,
			svc_name,
			ranking = entry.ranking,
			owner = entry.owner.id(),
			"registered service"
		);

		self.update_trackers(&entry, true);
		entry.state.set(RegistrationState::Registered);
		drop(registering);
		ServiceRegistration::new(self.me.clone(), svc_id, svc_name.to_owned(), Arc::clone(&entry.state))
	}

	/// Removes `svc_id`, notifies trackers and waits for in-flight users.
	///
	/// Unknown ids are logged and ignored; ids `<= 0` are ignored silently.
	pub(crate) fn unregister_entry(&self, svc_id: i64, timeout: Option<Duration>) -> Result<()> {
		if svc_id <= 0 {
			return Ok(());
		}
		let entry = {
			let mut services = self.services.lock();
			let Some(entry) = services.by_id.remove(&svc_id) else {
				drop(services);
				warn!(registry = %self.config.name, svc_id, "cannot unregister unknown service");
				return Ok(());
			};
			if let Some(set) = services.by_name.get_mut(&entry.svc_name) {
				set.remove(&entry.key());
				if set.is_empty() {
					services.by_name.remove(&entry.svc_name);
				}
			}
			entry.state.set(RegistrationState::Unregistering);
			entry
		};

		self.update_trackers(&entry, false);
		if !entry.usage().wait(timeout) {
			return Err(RegistryError::Timeout {
				target: WaitTarget::Service(svc_id),
				waited: timeout.unwrap_or_default(),
			});
		}
		entry.state.set(RegistrationState::Unregistered);
		debug!(registry = %self.config.name, svc_id, svc_name = %entry.svc_name, "unregistered service");
		Ok(())
	}

	fn update_trackers(&self, entry: &Arc<ServiceEntry>, added: bool) {
		let trackers = self.trackers.lock().interested_in(entry);
		for tracker in &trackers {
			if added {
				tracker.add_match(entry);
			} else {
				tracker.rem_match(entry);
			}
		}
	}

	/// Ids of the matching services in ranking order. An empty `svc_name`
	/// searches every service.
	pub fn find_services(&self, svc_name: &str, filter: &str) -> Vec<i64> {
		let Some(filter) = self.lookup_filter(filter) else {
			return Vec::new();
		};
		let services = self.services.lock();
		services.matching(svc_name, &filter).iter().map(|e| e.svc_id).collect()
	}

	pub fn find_service(&self, svc_name: &str, filter: &str) -> Option<i64> {
		self.find_services(svc_name, filter).into_iter().next()
	}

	/// Typed [`Self::find_services`].
	pub fn find_services_of<I: ?Sized + 'static>(&self, filter: &str) -> Vec<i64> {
		self.find_services(service_name::<I>(), filter)
	}

	/// Calls `f` with the best matching service. Returns `false` if nothing matched.
	pub fn use_service_with(&self, svc_name: &str, options: &UseOptions, f: impl FnOnce(&TrackedService)) -> bool {
		let mut f = Some(f);
		self.use_matching(svc_name, options, Some(1), |svc| {
			if let Some(f) = f.take() {
				f(svc);
			}
		}) > 0
	}

	/// Calls `f` once per matching service in ranking order; returns the count.
	pub fn use_services_with(&self, svc_name: &str, options: &UseOptions, f: impl FnMut(&TrackedService)) -> usize {
		self.use_matching(svc_name, options, None, f)
	}

	/// Typed [`Self::use_service_with`] for services registered as `I`.
	pub fn use_service<I>(&self, options: &UseOptions, f: impl FnOnce(&I)) -> bool
	where
		I: ?Sized + Send + Sync + 'static,
	{
		let mut f = Some(f);
		self.use_typed::<I>(service_name::<I>(), options, Some(1), |svc| {
			if let Some(f) = f.take() {
				f(svc);
			}
		}) > 0
	}

	pub fn use_services<I>(&self, options: &UseOptions, f: impl FnMut(&I)) -> usize
	where
		I: ?Sized + Send + Sync + 'static,
	{
		self.use_typed::<I>(service_name::<I>(), options, None, f)
	}

	/// Uses the service with id `svc_id`, if it is registered as `I`.
	pub fn use_service_with_id<I>(&self, svc_id: i64, options: &UseOptions, f: impl FnOnce(&I)) -> bool
	where
		I: ?Sized + Send + Sync + 'static,
	{
		let options = UseOptions {
			filter: format!("({}={svc_id})", keys::SERVICE_ID),
			..options.clone()
		};
		self.use_service::<I>(&options, f)
	}

	/// Calls the function service registered under `function_name` with type `F`.
	pub fn use_function_service<F>(&self, function_name: &str, options: &UseOptions, f: impl FnOnce(&F)) -> bool
	where
		F: ?Sized + Send + Sync + 'static,
	{
		let mut f = Some(f);
		let svc_name = function_service_name::<F>(function_name);
		self.use_typed::<F>(&svc_name, options, Some(1), |svc| {
			if let Some(f) = f.take() {
				f(svc);
			}
		}) > 0
	}

	fn use_typed<I>(&self, svc_name: &str, options: &UseOptions, limit: Option<usize>, mut f: impl FnMut(&I)) -> usize
	where
		I: ?Sized + Send + Sync + 'static,
	{
		self.use_matching(svc_name, options, limit, |tracked| match tracked.downcast::<I>() {
			Some(svc) => f(&svc),
			None => warn!(
				svc_name,
				svc_id = tracked.service_id(),
				expected = std::any::type_name::<I>(),
				"service registered with a different type"
			),
		})
	}

	fn use_matching(&self, svc_name: &str, options: &UseOptions, limit: Option<usize>, mut f: impl FnMut(&TrackedService)) -> usize {
		let Some(filter) = self.lookup_filter(&options.filter) else {
			return 0;
		};
		let requester = options.requester.clone().unwrap_or_else(empty_bundle);
		let used = self.collect_waiting(svc_name, &filter, limit, options.wait_for);
		for entry in &used {
			let service = entry.service_for(requester.as_ref());
			f(&TrackedService::new(entry, service));
			entry.release_for(requester.as_ref());
		}
		used.len()
	}

	fn collect_waiting(&self, svc_name: &str, filter: &Filter, limit: Option<usize>, wait_for: Option<Duration>) -> Used {
		let mut services = self.services.lock();
		let used = services.collect(svc_name, filter, limit);
		let Some(wait_for) = wait_for.filter(|_| used.is_empty()) else {
			return used;
		};
		let deadline = Instant::now() + wait_for;
		loop {
			let timed_out = self.registered.wait_until(&mut services, deadline).timed_out();
			let used = services.collect(svc_name, filter, limit);
			if !used.is_empty() || timed_out {
				return used;
			}
		}
	}

	fn lookup_filter(&self, text: &str) -> Option<Filter> {
		match parse_filter(text) {
			Ok(filter) => Some(filter),
			Err(err) => {
				warn!(registry = %self.config.name, %err, "ignoring lookup with invalid filter");
				None
			}
		}
	}

	/// Tracks services registered as `I`.
	pub fn track_services<I: ?Sized + 'static>(&self, options: TrackerOptions) -> ServiceTracker {
		self.track_services_named(service_name::<I>(), options)
	}

	/// Starts tracking `svc_name` (every name if empty).
	///
	/// The tracker is seeded with all current matches before this returns. An
	/// invalid filter yields an invalid tracker that tracks nothing.
	pub fn track_services_named(&self, svc_name: &str, options: TrackerOptions) -> ServiceTracker {
		let filter = match parse_filter(&options.filter) {
			Ok(filter) => filter,
			Err(err) => {
				error!(registry = %self.config.name, svc_name, %err, "cannot create tracker");
				return ServiceTracker::invalid();
			}
		};

		let tracker_id = self.next_tracker_id.fetch_add(1, Ordering::AcqRel);
		let requester = options.requester.clone().unwrap_or_else(empty_bundle);
		let tracker = Arc::new(TrackerEntry::new(tracker_id, svc_name.to_owned(), filter, requester, options));
		let tracker_guard = InUse::acquire(&tracker);

		let seed = {
			let services = self.services.lock();
			let mut trackers = self.trackers.lock();
			let seed = services.collect(svc_name, &tracker.filter, None);
			trackers
				.by_name
				.entry(svc_name.to_owned())
				.or_default()
				.insert(tracker_id, Arc::clone(&tracker));
			seed
		};
		debug!(
			registry = %self.config.name,
			tracker_id,
			svc_name,
			filter = %tracker.filter,
			seeded = seed.len(),
			"tracking services"
		);

		for entry in &seed {
			tracker.add_match(entry);
		}
		drop(seed);
		drop(tracker_guard);
		ServiceTracker::new(self.me.clone(), tracker)
	}

	/// Detaches `tracker`, waits for in-flight notifications, then clears it.
	pub(crate) fn remove_tracker(&self, tracker: &Arc<TrackerEntry>, timeout: Option<Duration>) -> Result<()> {
		let removed = {
			let mut trackers = self.trackers.lock();
			let removed = trackers
				.by_name
				.get_mut(&tracker.svc_name)
				.and_then(|set| set.remove(&tracker.tracker_id));
			if trackers.by_name.get(&tracker.svc_name).is_some_and(FxHashMap::is_empty) {
				trackers.by_name.remove(&tracker.svc_name);
			}
			removed
		};
		if removed.is_none() {
			return Ok(());
		}

		let drained = tracker.usage().wait(timeout);
		tracker.clear();
		debug!(registry = %self.config.name, tracker_id = tracker.tracker_id, "stopped tracker");
		if drained {
			Ok(())
		} else {
			Err(RegistryError::Timeout {
				target: WaitTarget::Tracker(tracker.tracker_id),
				waited: timeout.unwrap_or_default(),
			})
		}
	}

	pub fn nr_of_registered_services(&self) -> usize {
		self.services.lock().by_id.len()
	}

	pub fn nr_of_service_trackers(&self) -> usize {
		self.trackers.lock().len()
	}

	/// Names with at least one registered service, sorted.
	pub fn list_all_registered_service_names(&self) -> Vec<String> {
		let mut names: Vec<String> = self.services.lock().by_name.keys().cloned().collect();
		names.sort();
		names
	}

	/// Current state of `svc_id`; unknown ids report `Unregistered`.
	pub fn registration_state(&self, svc_id: i64) -> RegistrationState {
		self.services
			.lock()
			.by_id
			.get(&svc_id)
			.map_or(RegistrationState::Unregistered, |e| e.state.get())
	}

	/// Unregisters the services installed by static bundles.
	pub fn shutdown(&self) {
		let registrations = std::mem::take(&mut *self.static_registrations.lock());
		drop(registrations);
	}
}

impl Drop for ServiceRegistry {
	fn drop(&mut self) {
		for mut registration in std::mem::take(self.static_registrations.get_mut()) {
			let svc_id = registration.detach();
			if let Err(err) = self.unregister_entry(svc_id, self.config.unregister_timeout()) {
				warn!(registry = %self.config.name, %err, "static bundle service did not drain");
			}
		}
		let services = self.services.get_mut().by_id.len();
		let trackers = self.trackers.get_mut().len();
		if services > 0 || trackers > 0 {
			warn!(
				registry = %self.config.name,
				services,
				trackers,
				"registry dropped with live registrations"
			);
		}
	}
}

impl std::fmt::Debug for ServiceRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ServiceRegistry")
			.field("name", &self.config.name)
			.field("services", &self.nr_of_registered_services())
			.field("trackers", &self.nr_of_service_trackers())
			.finish()
	}
}

fn parse_filter(text: &str) -> Result<Filter> {
	Filter::parse(text).map_err(|source| RegistryError::InvalidFilter {
		filter: text.to_owned(),
		source,
	})
}
