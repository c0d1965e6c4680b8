//! Component manager: drives one component instance through its lifecycle.
//!
//! # Role
//!
//! Owns the instance, its [`ServiceDependency`]s and [`ProvidedService`]s, and
//! moves the component between [`ComponentState`]s whenever enablement,
//! dependency resolution or suspension changes.
//!
//! # Invariants
//!
//! - Provided services are registered iff the component is `Started`.
//!   - Enforced in: `ComponentInner::update_service_registrations`
//!   - Tested by: `manager::tests::provided_services_follow_started_state`
//!   - Failure symptom: consumers see services of a stopped component.
//! - A required, enabled, unresolved dependency keeps the component out of `Started`.
//!   - Enforced in: `ComponentInner::dependencies_resolved`
//!   - Tested by: `manager::tests::required_dependency_gates_start`
//!   - Failure symptom: `start` runs before the component can work.
//!
//! # Concurrency
//!
//! - The state mutex is never held while lifecycle or dependency callbacks run.
//! - One thread drains transitions at a time. Requests arriving meanwhile
//!   (from another thread, or re-entrantly from a callback) only mark the
//!   state dirty and the draining thread loops until the target is stable.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use lattice_core::{ResourceBundle, empty_bundle};
use lattice_services::{ServiceRegistry, service_name};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::dependency::{DependencyControl, ServiceDependency};
use crate::provided::{ProvidedControl, ProvidedService};
use crate::state::{Action, ComponentState, StateData, step};

/// Callback run on the component instance during a lifecycle transition.
pub type LifecycleCallback<C> = Arc<dyn Fn(&C) + Send + Sync>;

/// Lifecycle callbacks of a component. Missing callbacks are skipped.
pub struct Lifecycle<C> {
	pub init: Option<LifecycleCallback<C>>,
	pub start: Option<LifecycleCallback<C>>,
	pub stop: Option<LifecycleCallback<C>>,
	pub deinit: Option<LifecycleCallback<C>>,
}

impl<C> Default for Lifecycle<C> {
	fn default() -> Self {
		Self {
			init: None,
			start: None,
			stop: None,
			deinit: None,
		}
	}
}

impl<C> Clone for Lifecycle<C> {
	fn clone(&self) -> Self {
		Self {
			init: self.init.clone(),
			start: self.start.clone(),
			stop: self.stop.clone(),
			deinit: self.deinit.clone(),
		}
	}
}

impl<C> Lifecycle<C> {
	pub fn on_init(mut self, f: impl Fn(&C) + Send + Sync + 'static) -> Self {
		self.init = Some(Arc::new(f));
		self
	}

	pub fn on_start(mut self, f: impl Fn(&C) + Send + Sync + 'static) -> Self {
		self.start = Some(Arc::new(f));
		self
	}

	pub fn on_stop(mut self, f: impl Fn(&C) + Send + Sync + 'static) -> Self {
		self.stop = Some(Arc::new(f));
		self
	}

	pub fn on_deinit(mut self, f: impl Fn(&C) + Send + Sync + 'static) -> Self {
		self.deinit = Some(Arc::new(f));
		self
	}

	fn callback(&self, action: Action) -> Option<LifecycleCallback<C>> {
		match action {
			Action::Init => self.init.clone(),
			Action::Start => self.start.clone(),
			Action::Stop => self.stop.clone(),
			Action::Deinit => self.deinit.clone(),
		}
	}
}

/// A dependency or provided service together with its typed handle.
struct Slot<T: ?Sized> {
	control: Arc<T>,
	any: Arc<dyn Any + Send + Sync>,
}

/// Shared component state; dependencies and provided services hold it weakly.
pub(crate) struct ComponentInner<C> {
	pub(crate) uuid: Uuid,
	pub(crate) name: String,
	pub(crate) owner: Arc<dyn ResourceBundle>,
	pub(crate) registry: Arc<ServiceRegistry>,
	pub(crate) instance: Arc<C>,
	lifecycle: RwLock<Lifecycle<C>>,
	dependencies: Mutex<IndexMap<Uuid, Slot<dyn DependencyControl>>>,
	provided: Mutex<IndexMap<Uuid, Slot<dyn ProvidedControl>>>,
	state: Mutex<StateData>,
}

impl<C: Send + Sync + 'static> ComponentInner<C> {
	fn dependencies(&self) -> Vec<Arc<dyn DependencyControl>> {
		self.dependencies.lock().values().map(|slot| Arc::clone(&slot.control)).collect()
	}

	fn provided(&self) -> Vec<Arc<dyn ProvidedControl>> {
		self.provided.lock().values().map(|slot| Arc::clone(&slot.control)).collect()
	}

	fn dependencies_resolved(&self) -> bool {
		self.dependencies()
			.iter()
			.all(|dep| !dep.is_enabled() || !dep.is_required() || dep.is_resolved())
	}

	fn set_enabled(&self, enabled: bool) {
		for dep in self.dependencies() {
			if enabled { dep.enable() } else { dep.disable() }
		}
		for provided in self.provided() {
			if enabled { provided.enable() } else { provided.disable() }
		}
		self.state.lock().enabled = enabled;
		self.update_state();
	}

	/// Moves the component towards its target state until it is stable.
	pub(crate) fn update_state(&self) {
		{
			let mut state = self.state.lock();
			state.dirty = true;
			if state.draining {
				return;
			}
			state.draining = true;
		}
		let _drain = DrainGuard(&self.state);
		loop {
			{
				let mut state = self.state.lock();
				if !state.dirty {
					state.draining = false;
					return;
				}
				state.dirty = false;
			}
			while let Some((action, next)) = self.next_step() {
				self.transition(action, next);
			}
		}
	}

	fn next_step(&self) -> Option<(Option<Action>, ComponentState)> {
		let resolved = self.dependencies_resolved();
		let state = self.state.lock();
		step(state.current, state.target(resolved))
	}

	fn transition(&self, action: Option<Action>, next: ComponentState) {
		let from = self.state.lock().current;
		info!(component = %self.name, uuid = %self.uuid, %from, to = %next, "component transition");
		if let Some(callback) = action.and_then(|action| self.lifecycle.read().callback(action)) {
			callback(&self.instance);
		}
		{
			let mut state = self.state.lock();
			state.current = next;
			match action {
				Some(Action::Init) => state.initialized = true,
				Some(Action::Deinit) => state.initialized = false,
				_ => {}
			}
		}
		if matches!(action, Some(Action::Start | Action::Stop)) {
			self.update_service_registrations();
		}
	}

	/// Registers enabled provided services while started, withdraws the rest.
	pub(crate) fn update_service_registrations(&self) {
		let started = self.state.lock().current == ComponentState::Started;
		for provided in self.provided() {
			if started && provided.is_enabled() {
				provided.register();
			} else {
				provided.unregister();
			}
		}
	}

	pub(crate) fn suspend(&self) {
		let count = {
			let mut state = self.state.lock();
			if state.suspended {
				return;
			}
			state.suspended = true;
			state.suspended_count += 1;
			state.suspended_count
		};
		info!(component = %self.name, suspended_count = count, "suspending component");
		self.update_state();
	}

	pub(crate) fn resume(&self) {
		{
			let mut state = self.state.lock();
			if !state.suspended {
				return;
			}
			state.suspended = false;
		}
		debug!(component = %self.name, "resuming component");
		self.update_state();
	}
}

/// Releases the drain flag if a callback panics mid-transition.
struct DrainGuard<'a>(&'a Mutex<StateData>);

impl Drop for DrainGuard<'_> {
	fn drop(&mut self) {
		if std::thread::panicking() {
			self.0.lock().draining = false;
		}
	}
}

/// Manages the lifecycle of one component instance of type `C`.
///
/// Dropping the manager disables the component: dependencies stop tracking,
/// provided services are unregistered and `stop`/`deinit` run as needed.
pub struct ComponentManager<C: Send + Sync + 'static> {
	inner: Arc<ComponentInner<C>>,
}

impl<C: Send + Sync + 'static> ComponentManager<C> {
	/// Creates a disabled component. Without an owner the component acts for
	/// the framework bundle.
	pub fn new(
		registry: Arc<ServiceRegistry>,
		owner: Option<Arc<dyn ResourceBundle>>,
		name: impl Into<String>,
		instance: Arc<C>,
	) -> Self {
		let inner = ComponentInner {
			uuid: Uuid::new_v4(),
			name: name.into(),
			owner: owner.unwrap_or_else(empty_bundle),
			registry,
			instance,
			lifecycle: RwLock::new(Lifecycle::default()),
			dependencies: Mutex::new(IndexMap::new()),
			provided: Mutex::new(IndexMap::new()),
			state: Mutex::new(StateData::default()),
		};
		debug!(component = %inner.name, uuid = %inner.uuid, "created component");
		Self { inner: Arc::new(inner) }
	}

	pub fn uuid(&self) -> Uuid {
		self.inner.uuid
	}

	pub fn name(&self) -> &str {
		&self.inner.name
	}

	pub fn instance(&self) -> &Arc<C> {
		&self.inner.instance
	}

	pub fn state(&self) -> ComponentState {
		self.inner.state.lock().current
	}

	pub fn is_enabled(&self) -> bool {
		self.inner.state.lock().enabled
	}

	/// Enabled and every enabled required dependency has a match.
	pub fn is_resolved(&self) -> bool {
		self.is_enabled() && self.inner.dependencies_resolved()
	}

	/// How often a suspense-strategy dependency suspended the component.
	pub fn suspended_count(&self) -> usize {
		self.inner.state.lock().suspended_count
	}

	/// Replaces the lifecycle callbacks. Takes effect on the next transition.
	pub fn set_callbacks(&self, lifecycle: Lifecycle<C>) {
		*self.inner.lifecycle.write() = lifecycle;
	}

	/// Enables the component together with every dependency and provided service.
	pub fn enable(&self) {
		self.inner.set_enabled(true);
	}

	pub fn disable(&self) {
		self.inner.set_enabled(false);
	}

	pub fn set_enabled(&self, enabled: bool) {
		self.inner.set_enabled(enabled);
	}

	/// Adds a disabled dependency on services registered under the name of `I`.
	pub fn add_service_dependency<I>(&self) -> Arc<ServiceDependency<C, I>>
	where
		I: ?Sized + Send + Sync + 'static,
	{
		self.add_service_dependency_named(service_name::<I>())
	}

	/// Adds a disabled dependency on services registered under `svc_name`.
	///
	/// # Panics
	///
	/// Panics if `svc_name` is empty.
	pub fn add_service_dependency_named<I>(&self, svc_name: &str) -> Arc<ServiceDependency<C, I>>
	where
		I: ?Sized + Send + Sync + 'static,
	{
		assert!(!svc_name.is_empty(), "dependency service name must not be empty");
		let dep = ServiceDependency::<C, I>::new(svc_name, Arc::downgrade(&self.inner));
		let slot = Slot {
			control: Arc::clone(&dep) as Arc<dyn DependencyControl>,
			any: Arc::clone(&dep).into_any(),
		};
		self.inner.dependencies.lock().insert(dep.uuid(), slot);
		dep
	}

	/// The dependency with `uuid`, if it exists and tracks `I`.
	pub fn find_service_dependency<I>(&self, uuid: Uuid) -> Option<Arc<ServiceDependency<C, I>>>
	where
		I: ?Sized + Send + Sync + 'static,
	{
		let any = self.inner.dependencies.lock().get(&uuid).map(|slot| Arc::clone(&slot.any))?;
		any.downcast().ok()
	}

	/// Disables and removes a dependency. Returns `false` for unknown uuids.
	pub fn remove_service_dependency(&self, uuid: Uuid) -> bool {
		let removed = self.inner.dependencies.lock().shift_remove(&uuid);
		let Some(slot) = removed else {
			info!(component = %self.inner.name, %uuid, "no service dependency to remove");
			return false;
		};
		slot.control.disable();
		self.inner.update_state();
		true
	}

	pub fn nr_of_service_dependencies(&self) -> usize {
		self.inner.dependencies.lock().len()
	}

	/// Adds a disabled provided service registered under the name of `I`.
	///
	/// `cast` turns the component instance into the registered service, e.g.
	/// `|cmp| cmp as Arc<dyn Greeter>`.
	pub fn add_provided_service<I>(
		&self,
		cast: impl Fn(Arc<C>) -> Arc<I> + Send + Sync + 'static,
	) -> Arc<ProvidedService<C, I>>
	where
		I: ?Sized + Send + Sync + 'static,
	{
		self.add_provided_service_named(service_name::<I>(), cast)
	}

	/// # Panics
	///
	/// Panics if `svc_name` is empty.
	pub fn add_provided_service_named<I>(
		&self,
		svc_name: &str,
		cast: impl Fn(Arc<C>) -> Arc<I> + Send + Sync + 'static,
	) -> Arc<ProvidedService<C, I>>
	where
		I: ?Sized + Send + Sync + 'static,
	{
		assert!(!svc_name.is_empty(), "provided service name must not be empty");
		let provided = ProvidedService::<C, I>::new(svc_name, Arc::downgrade(&self.inner), Arc::new(cast));
		let slot = Slot {
			control: Arc::clone(&provided) as Arc<dyn ProvidedControl>,
			any: Arc::clone(&provided).into_any(),
		};
		self.inner.provided.lock().insert(provided.uuid(), slot);
		provided
	}

	/// The provided service with `uuid`, if it exists and provides `I`.
	pub fn find_provided_service<I>(&self, uuid: Uuid) -> Option<Arc<ProvidedService<C, I>>>
	where
		I: ?Sized + Send + Sync + 'static,
	{
		let any = self.inner.provided.lock().get(&uuid).map(|slot| Arc::clone(&slot.any))?;
		any.downcast().ok()
	}

	/// Unregisters and removes a provided service. Returns `false` for unknown uuids.
	pub fn remove_provided_service(&self, uuid: Uuid) -> bool {
		let removed = self.inner.provided.lock().shift_remove(&uuid);
		let Some(slot) = removed else {
			info!(component = %self.inner.name, %uuid, "no provided service to remove");
			return false;
		};
		slot.control.unregister();
		true
	}

	pub fn nr_of_provided_services(&self) -> usize {
		self.inner.provided.lock().len()
	}
}

impl<C: Send + Sync + 'static> Drop for ComponentManager<C> {
	fn drop(&mut self) {
		self.inner.set_enabled(false);
	}
}

impl<C: Send + Sync + 'static> fmt::Debug for ComponentManager<C> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ComponentManager")
			.field("name", &self.inner.name)
			.field("uuid", &self.inner.uuid)
			.field("state", &self.state())
			.field("dependencies", &self.nr_of_service_dependencies())
			.field("provided", &self.nr_of_provided_services())
			.finish()
	}
}
