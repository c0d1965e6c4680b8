//! Service dependencies of a component.
//!
//! # Role
//!
//! A [`ServiceDependency`] owns one service tracker while enabled and
//! translates tracker events into typed callbacks on the component instance.
//! Its resolution (at least one match) feeds the component state machine.
//!
//! # Invariants
//!
//! - The match count mirrors the tracker's add/remove stream, so resolution
//!   is correct while the tracker is still seeding inside `enable`.
//!   - Enforced in: [`ServiceDependency::handle_add`], [`ServiceDependency::handle_remove`]
//!   - Tested by: `manager::tests::adding_a_resolved_required_dependency_does_not_restart`
//!   - Failure symptom: a started component stops and restarts when a
//!     required dependency that is already satisfied gets enabled.
//! - Typed callbacks never run concurrently for one dependency.
//!   - Enforced in: [`ServiceDependency::invoke`] (`callback_lock`)
//!   - Tested by: `manager::tests::many_cardinality_forwards_add_remove_update`
//!   - Failure symptom: component code observes interleaved add/remove.
//!
//! # Concurrency
//!
//! - The configuration mutex is only held to copy values out; user callbacks
//!   run under the reentrant `callback_lock` and nothing else.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use lattice_core::Filter;
use lattice_services::{ServiceTracker, TrackedService, TrackerOptions};
use parking_lot::{Mutex, ReentrantMutex};
use tracing::debug;
use uuid::Uuid;

use crate::error::{ComponentError, Result};
use crate::manager::ComponentInner;

/// How many matches a dependency forwards to the component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cardinality {
	/// Only the highest ranked match, through the `set` callback.
	#[default]
	One,
	/// Every match, through the add/remove/update callbacks.
	Many,
}

/// What happens to the component while a dependency is updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateStrategy {
	/// Stop the component for the duration of the update and restart it after.
	#[default]
	Suspense,
	/// Keep the component running; callbacks only serialize on the dependency lock.
	Locking,
}

type SetFn<C, I> = Arc<dyn Fn(&C, Option<Arc<I>>) + Send + Sync>;
type ServiceFn<C, I> = Arc<dyn Fn(&C, Arc<I>) + Send + Sync>;
type UpdateFn<C, I> = Arc<dyn Fn(&C, Vec<Arc<I>>) + Send + Sync>;

struct DependencyConfig<C, I: ?Sized> {
	filter: String,
	required: bool,
	cardinality: Cardinality,
	strategy: UpdateStrategy,
	set: Option<SetFn<C, I>>,
	add: Option<ServiceFn<C, I>>,
	remove: Option<ServiceFn<C, I>>,
	update: Option<UpdateFn<C, I>>,
}

impl<C, I: ?Sized> Default for DependencyConfig<C, I> {
	fn default() -> Self {
		Self {
			filter: String::new(),
			required: true,
			cardinality: Cardinality::default(),
			strategy: UpdateStrategy::default(),
			set: None,
			add: None,
			remove: None,
			update: None,
		}
	}
}

/// A typed dependency of component `C` on services of type `I`.
///
/// Configuration changes take effect the next time the dependency is enabled.
pub struct ServiceDependency<C, I: ?Sized> {
	uuid: Uuid,
	svc_name: String,
	me: Weak<Self>,
	component: Weak<ComponentInner<C>>,
	config: Mutex<DependencyConfig<C, I>>,
	enabled: AtomicBool,
	matched: AtomicUsize,
	tracker: Mutex<Option<ServiceTracker>>,
	callback_lock: ReentrantMutex<()>,
}

impl<C, I> ServiceDependency<C, I>
where
	C: Send + Sync + 'static,
	I: ?Sized + Send + Sync + 'static,
{
	pub(crate) fn new(svc_name: &str, component: Weak<ComponentInner<C>>) -> Arc<Self> {
		Arc::new_cyclic(|me| Self {
			uuid: Uuid::new_v4(),
			svc_name: svc_name.to_owned(),
			me: me.clone(),
			component,
			config: Mutex::new(DependencyConfig::default()),
			enabled: AtomicBool::new(false),
			matched: AtomicUsize::new(0),
			tracker: Mutex::new(None),
			callback_lock: ReentrantMutex::new(()),
		})
	}

	pub fn uuid(&self) -> Uuid {
		self.uuid
	}

	pub fn service_name(&self) -> &str {
		&self.svc_name
	}

	pub fn filter(&self) -> String {
		self.config.lock().filter.clone()
	}

	pub fn is_required(&self) -> bool {
		self.config.lock().required
	}

	pub fn cardinality(&self) -> Cardinality {
		self.config.lock().cardinality
	}

	pub fn strategy(&self) -> UpdateStrategy {
		self.config.lock().strategy
	}

	pub fn is_enabled(&self) -> bool {
		self.enabled.load(Ordering::SeqCst)
	}

	/// At least one service currently matches.
	pub fn is_resolved(&self) -> bool {
		self.matched.load(Ordering::SeqCst) > 0
	}

	/// Sets the tracker filter after checking that it parses.
	pub fn set_filter(&self, filter: impl Into<String>) -> Result<&Self> {
		let filter = filter.into();
		if let Err(source) = Filter::parse(&filter) {
			return Err(ComponentError::InvalidFilter { filter, source });
		}
		self.config.lock().filter = filter;
		Ok(self)
	}

	pub fn set_required(&self, required: bool) -> &Self {
		self.config.lock().required = required;
		self
	}

	pub fn set_cardinality(&self, cardinality: Cardinality) -> &Self {
		self.config.lock().cardinality = cardinality;
		self
	}

	pub fn set_strategy(&self, strategy: UpdateStrategy) -> &Self {
		self.config.lock().strategy = strategy;
		self
	}

	/// Called with the highest ranked match (or `None`) for [`Cardinality::One`].
	pub fn on_set(&self, f: impl Fn(&C, Option<Arc<I>>) + Send + Sync + 'static) -> &Self {
		self.config.lock().set = Some(Arc::new(f));
		self
	}

	/// Called for every added match with [`Cardinality::Many`].
	pub fn on_add(&self, f: impl Fn(&C, Arc<I>) + Send + Sync + 'static) -> &Self {
		self.config.lock().add = Some(Arc::new(f));
		self
	}

	/// Called for every removed match with [`Cardinality::Many`].
	pub fn on_remove(&self, f: impl Fn(&C, Arc<I>) + Send + Sync + 'static) -> &Self {
		self.config.lock().remove = Some(Arc::new(f));
		self
	}

	/// Called with all matches, highest ranked first, with [`Cardinality::Many`].
	pub fn on_update(&self, f: impl Fn(&C, Vec<Arc<I>>) + Send + Sync + 'static) -> &Self {
		self.config.lock().update = Some(Arc::new(f));
		self
	}

	/// Starts tracking. Existing matches are delivered before this returns.
	pub fn enable(&self) {
		if self.enabled.swap(true, Ordering::SeqCst) {
			return;
		}
		let Some(component) = self.component.upgrade() else {
			return;
		};
		let filter = self.filter();
		debug!(svc = %self.svc_name, %filter, component = %component.name, "enabling service dependency");
		let tracker = component
			.registry
			.track_services_named(&self.svc_name, self.tracker_options(filter, &component));
		*self.tracker.lock() = Some(tracker);
		if !self.is_enabled() {
			// disabled while the tracker was being seeded
			let tracker = self.tracker.lock().take();
			drop(tracker);
		}
		component.update_state();
	}

	/// Stops tracking; every match is removed through the callbacks first.
	pub fn disable(&self) {
		if !self.enabled.swap(false, Ordering::SeqCst) {
			return;
		}
		let tracker = self.tracker.lock().take();
		drop(tracker);
		debug!(svc = %self.svc_name, "disabled service dependency");
		if let Some(component) = self.component.upgrade() {
			component.update_state();
		}
	}

	fn tracker_options(&self, filter: String, component: &ComponentInner<C>) -> TrackerOptions {
		let (set, add, remove, update) = (self.me.clone(), self.me.clone(), self.me.clone(), self.me.clone());
		let (pre, post) = (self.me.clone(), self.me.clone());
		let mut options = TrackerOptions::with_filter(filter)
			.on_set(move |svc| {
				if let Some(dep) = set.upgrade() {
					dep.handle_set(svc);
				}
			})
			.on_add(move |svc| {
				if let Some(dep) = add.upgrade() {
					dep.handle_add(svc);
				}
			})
			.on_remove(move |svc| {
				if let Some(dep) = remove.upgrade() {
					dep.handle_remove(svc);
				}
			})
			.on_update(move |svcs| {
				if let Some(dep) = update.upgrade() {
					dep.handle_update(svcs);
				}
			});
		options.requester = Some(Arc::clone(&component.owner));
		options.pre_update_hook = Some(Arc::new(move || {
			if let Some(dep) = pre.upgrade() {
				dep.pre_update();
			}
		}));
		options.post_update_hook = Some(Arc::new(move || {
			if let Some(dep) = post.upgrade() {
				dep.post_update();
			}
		}));
		options
	}

	/// Teardown of a disabled dependency never suspends: the component is
	/// either being disabled itself or no longer waits on this dependency.
	fn suspends(&self) -> bool {
		self.is_enabled() && self.strategy() == UpdateStrategy::Suspense
	}

	fn pre_update(&self) {
		if !self.suspends() {
			return;
		}
		if let Some(component) = self.component.upgrade() {
			component.suspend();
		}
	}

	fn post_update(&self) {
		let Some(component) = self.component.upgrade() else {
			return;
		};
		component.resume();
		component.update_state();
	}

	fn handle_set(&self, svc: Option<&TrackedService>) {
		let callback = {
			let config = self.config.lock();
			match config.cardinality {
				Cardinality::One => config.set.clone(),
				Cardinality::Many => None,
			}
		};
		if let Some(callback) = callback {
			let svc = svc.and_then(TrackedService::downcast::<I>);
			self.invoke(|instance| callback(instance, svc));
		}
	}

	fn handle_add(&self, svc: &TrackedService) {
		self.matched.fetch_add(1, Ordering::SeqCst);
		let callback = self.many_callback(|config| config.add.clone());
		if let (Some(callback), Some(svc)) = (callback, svc.downcast::<I>()) {
			self.invoke(|instance| callback(instance, svc));
		}
	}

	fn handle_remove(&self, svc: &TrackedService) {
		let _ = self
			.matched
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
		let callback = self.many_callback(|config| config.remove.clone());
		if let (Some(callback), Some(svc)) = (callback, svc.downcast::<I>()) {
			self.invoke(|instance| callback(instance, svc));
		}
	}

	fn handle_update(&self, svcs: &[TrackedService]) {
		if let Some(callback) = self.many_callback(|config| config.update.clone()) {
			let svcs = svcs.iter().filter_map(TrackedService::downcast::<I>).collect();
			self.invoke(|instance| callback(instance, svcs));
		}
	}

	fn many_callback<T>(&self, pick: impl FnOnce(&DependencyConfig<C, I>) -> Option<T>) -> Option<T> {
		let config = self.config.lock();
		match config.cardinality {
			Cardinality::Many => pick(&config),
			Cardinality::One => None,
		}
	}

	fn invoke(&self, f: impl FnOnce(&C)) {
		let Some(component) = self.component.upgrade() else {
			return;
		};
		let _serial = self.callback_lock.lock();
		f(&component.instance);
	}
}

impl<C, I: ?Sized> fmt::Debug for ServiceDependency<C, I> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let config = self.config.lock();
		f.debug_struct("ServiceDependency")
			.field("uuid", &self.uuid)
			.field("svc_name", &self.svc_name)
			.field("filter", &config.filter)
			.field("required", &config.required)
			.field("cardinality", &config.cardinality)
			.field("strategy", &config.strategy)
			.field("enabled", &self.enabled.load(Ordering::SeqCst))
			.finish_non_exhaustive()
	}
}

/// Object-safe view the manager keeps of every dependency.
pub(crate) trait DependencyControl: Send + Sync {
	fn uuid(&self) -> Uuid;
	fn is_enabled(&self) -> bool;
	fn is_required(&self) -> bool;
	fn is_resolved(&self) -> bool;
	fn enable(&self);
	fn disable(&self);
	fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<C, I> DependencyControl for ServiceDependency<C, I>
where
	C: Send + Sync + 'static,
	I: ?Sized + Send + Sync + 'static,
{
	fn uuid(&self) -> Uuid {
		self.uuid
	}

	fn is_enabled(&self) -> bool {
		ServiceDependency::is_enabled(self)
	}

	fn is_required(&self) -> bool {
		ServiceDependency::is_required(self)
	}

	fn is_resolved(&self) -> bool {
		ServiceDependency::is_resolved(self)
	}

	fn enable(&self) {
		ServiceDependency::enable(self);
	}

	fn disable(&self) {
		ServiceDependency::disable(self);
	}

	fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
		self
	}
}
