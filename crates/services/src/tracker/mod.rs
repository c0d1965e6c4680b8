//! Live, ranked views over the services matching a name and filter.
//!
//! # Role
//!
//! A [`TrackerEntry`] is seeded with every matching service when created and
//! then kept current by the registry on each register/unregister. Every
//! change is reported through the callbacks in [`TrackerOptions`].
//!
//! # Invariants
//!
//! - Callbacks for one change fire in the order pre-hook, `set` (only when
//!   the highest match changed), `add`/`remove`, `update`, post-hook.
//!   - Enforced in: `TrackerEntry::dispatch`
//!   - Tested by: `tracker::tests::callbacks_fire_in_order`
//!   - Failure symptom: dependents observe an update before the matching add.
//! - Changes to one tracker are serialized; two events never interleave their
//!   callback sequences.
//!   - Enforced in: `TrackerEntry::dispatch_lock`
//!   - Tested by: `tracker::tests::concurrent_registrations_serialize_callbacks`
//!   - Failure symptom: `add` for one service fires between `set` and `add` of another.
//! - An entry is matched at most once and never after it started unregistering.
//!   - Enforced in: [`TrackerEntry::add_match`]
//!   - Tested by: `registry::tests::tracker_and_registration_race`
//!   - Failure symptom: duplicate `add` callbacks or stale services after removal.
//!
//! # Concurrency
//!
//! Match state lives under a short-lived `RwLock` that is never held while
//! user callbacks run, so callbacks may query the tracker (e.g. its count).
//! Dispatch is serialized by a reentrant lock so a callback that registers a
//! service matching the same tracker does not deadlock its own thread.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use lattice_core::{Filter, Properties, ResourceBundle, keys};
use parking_lot::{ReentrantMutex, RwLock};

use crate::entry::{RankKey, ServiceEntry};
use crate::service::ServiceObject;
use crate::usage::{Counted, UsageCounter};

#[cfg(test)]
mod tests;

/// A matched service as seen by one requester.
#[derive(Clone)]
pub struct TrackedService {
	service: ServiceObject,
	properties: Arc<Properties>,
	owner: Arc<dyn ResourceBundle>,
}

impl TrackedService {
	pub(crate) fn new(entry: &ServiceEntry, service: ServiceObject) -> Self {
		Self {
			service,
			properties: Arc::clone(&entry.properties),
			owner: Arc::clone(&entry.owner),
		}
	}

	pub fn service(&self) -> &ServiceObject {
		&self.service
	}

	/// The service as `Arc<I>`, if it was registered as that type.
	pub fn downcast<I>(&self) -> Option<Arc<I>>
	where
		I: ?Sized + Send + Sync + 'static,
	{
		self.service.downcast()
	}

	pub fn properties(&self) -> &Properties {
		&self.properties
	}

	pub fn owner(&self) -> &Arc<dyn ResourceBundle> {
		&self.owner
	}

	pub fn service_id(&self) -> i64 {
		self.properties.get_as_i64(keys::SERVICE_ID, -1)
	}

	pub fn ranking(&self) -> i64 {
		self.properties.get_as_i64(keys::SERVICE_RANKING, 0)
	}
}

impl fmt::Debug for TrackedService {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TrackedService")
			.field("service_id", &self.service_id())
			.field("ranking", &self.ranking())
			.field("owner", &self.owner.id())
			.finish()
	}
}

/// Called with the new highest match, or `None` once nothing matches.
pub type SetCallback = Arc<dyn Fn(Option<&TrackedService>) + Send + Sync>;
/// Called once per service entering or leaving the matched set.
pub type ServiceCallback = Arc<dyn Fn(&TrackedService) + Send + Sync>;
/// Called after every change with all matches in ranking order.
pub type UpdateCallback = Arc<dyn Fn(&[TrackedService]) + Send + Sync>;
/// Called before and after each change is dispatched.
pub type HookCallback = Arc<dyn Fn() + Send + Sync>;

/// Filter and callbacks for [`ServiceRegistry::track_services`](crate::ServiceRegistry::track_services).
#[derive(Clone, Default)]
pub struct TrackerOptions {
	/// LDAP-style filter; empty matches every service of the tracked name.
	pub filter: String,
	/// Bundle the resolved services are requested for. Defaults to the
	/// empty bundle.
	pub requester: Option<Arc<dyn ResourceBundle>>,
	pub set: Option<SetCallback>,
	pub add: Option<ServiceCallback>,
	pub remove: Option<ServiceCallback>,
	pub update: Option<UpdateCallback>,
	pub pre_update_hook: Option<HookCallback>,
	pub post_update_hook: Option<HookCallback>,
}

impl TrackerOptions {
	pub fn with_filter(filter: impl Into<String>) -> Self {
		Self {
			filter: filter.into(),
			..Self::default()
		}
	}

	pub fn on_set(mut self, f: impl Fn(Option<&TrackedService>) + Send + Sync + 'static) -> Self {
		self.set = Some(Arc::new(f));
		self
	}

	pub fn on_add(mut self, f: impl Fn(&TrackedService) + Send + Sync + 'static) -> Self {
		self.add = Some(Arc::new(f));
		self
	}

	pub fn on_remove(mut self, f: impl Fn(&TrackedService) + Send + Sync + 'static) -> Self {
		self.remove = Some(Arc::new(f));
		self
	}

	pub fn on_update(mut self, f: impl Fn(&[TrackedService]) + Send + Sync + 'static) -> Self {
		self.update = Some(Arc::new(f));
		self
	}
}

impl fmt::Debug for TrackerOptions {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TrackerOptions")
			.field("filter", &self.filter)
			.field("requester", &self.requester.as_ref().map(|b| b.id()))
			.field("set", &self.set.is_some())
			.field("add", &self.add.is_some())
			.field("remove", &self.remove.is_some())
			.field("update", &self.update.is_some())
			.finish_non_exhaustive()
	}
}

struct Matched {
	entry: Arc<ServiceEntry>,
	tracked: TrackedService,
}

#[derive(Default)]
struct MatchState {
	matches: BTreeMap<RankKey, Matched>,
	highest: Option<i64>,
}

impl MatchState {
	/// Updates the cached highest id, returning the new highest if it changed.
	fn refresh_highest(&mut self) -> Option<Option<TrackedService>> {
		let first = self.matches.first_key_value();
		let highest = first.map(|(key, _)| key.svc_id);
		if highest == self.highest {
			return None;
		}
		self.highest = highest;
		Some(first.map(|(_, m)| m.tracked.clone()))
	}

	fn snapshot(&self) -> Vec<TrackedService> {
		self.matches.values().map(|m| m.tracked.clone()).collect()
	}
}

enum Change {
	Added(TrackedService),
	Removed(TrackedService),
}

/// Registry-side state of one tracker.
pub(crate) struct TrackerEntry {
	pub(crate) tracker_id: i64,
	pub(crate) svc_name: String,
	pub(crate) filter: Filter,
	requester: Arc<dyn ResourceBundle>,
	options: TrackerOptions,
	usage: UsageCounter,
	dispatch_lock: ReentrantMutex<()>,
	state: RwLock<MatchState>,
}

impl Counted for TrackerEntry {
	fn usage(&self) -> &UsageCounter {
		&self.usage
	}
}

impl TrackerEntry {
	pub(crate) fn new(
		tracker_id: i64,
		svc_name: String,
		filter: Filter,
		requester: Arc<dyn ResourceBundle>,
		options: TrackerOptions,
	) -> Self {
		Self {
			tracker_id,
			svc_name,
			filter,
			requester,
			options,
			usage: UsageCounter::new(),
			dispatch_lock: ReentrantMutex::new(()),
			state: RwLock::new(MatchState::default()),
		}
	}

	/// Whether `entry` belongs in this tracker's view. An empty tracked name
	/// matches services of every name.
	pub(crate) fn wants(&self, entry: &ServiceEntry) -> bool {
		(self.svc_name.is_empty() || self.svc_name == entry.svc_name) && self.filter.matches(&entry.properties)
	}

	pub(crate) fn track_count(&self) -> usize {
		self.state.read().matches.len()
	}

	pub(crate) fn tracked(&self) -> Vec<TrackedService> {
		self.state.read().snapshot()
	}

	pub(crate) fn highest(&self) -> Option<TrackedService> {
		self.state.read().matches.first_key_value().map(|(_, m)| m.tracked.clone())
	}

	pub(crate) fn add_match(&self, entry: &Arc<ServiceEntry>) {
		let _dispatch = self.dispatch_lock.lock();
		let key = entry.key();
		if !entry.is_live() || self.state.read().matches.contains_key(&key) {
			return;
		}

		entry.usage().incr();
		let service = entry.service_for(self.requester.as_ref());
		let tracked = TrackedService::new(entry, service);
		let (highest, snapshot) = {
			let mut state = self.state.write();
			state.matches.insert(
				key,
				Matched {
					entry: Arc::clone(entry),
					tracked: tracked.clone(),
				},
			);
			(state.refresh_highest(), self.options.update.as_ref().map(|_| state.snapshot()))
		};
		self.dispatch(Change::Added(tracked), highest, snapshot);
	}

	pub(crate) fn rem_match(&self, entry: &ServiceEntry) {
		let _dispatch = self.dispatch_lock.lock();
		let Some((matched, highest, snapshot)) = ({
			let mut state = self.state.write();
			state.matches.remove(&entry.key()).map(|matched| {
				let highest = state.refresh_highest();
				let snapshot = self.options.update.as_ref().map(|_| state.snapshot());
				(matched, highest, snapshot)
			})
		}) else {
			return;
		};

		self.dispatch(Change::Removed(matched.tracked), highest, snapshot);
		matched.entry.release_for(self.requester.as_ref());
		matched.entry.usage().decr();
	}

	/// Removes every match, lowest ranked first, so `set` fires once with `None`.
	pub(crate) fn clear(&self) {
		let entries: Vec<Arc<ServiceEntry>> = self
			.state
			.read()
			.matches
			.values()
			.rev()
			.map(|m| Arc::clone(&m.entry))
			.collect();
		for entry in entries {
			self.rem_match(&entry);
		}
	}

	fn dispatch(&self, change: Change, highest: Option<Option<TrackedService>>, snapshot: Option<Vec<TrackedService>>) {
		let opts = &self.options;
		if let Some(hook) = &opts.pre_update_hook {
			hook();
		}
		if let (Some(set), Some(highest)) = (&opts.set, &highest) {
			set(highest.as_ref());
		}
		match &change {
			Change::Added(svc) => {
				if let Some(add) = &opts.add {
					add(svc);
				}
			}
			Change::Removed(svc) => {
				if let Some(remove) = &opts.remove {
					remove(svc);
				}
			}
		}
		if let (Some(update), Some(snapshot)) = (&opts.update, &snapshot) {
			update(snapshot);
		}
		if let Some(hook) = &opts.post_update_hook {
			hook();
		}
	}
}
