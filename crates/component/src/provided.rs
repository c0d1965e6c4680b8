use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use lattice_core::{Properties, keys};
use lattice_services::{RegisterOptions, ServiceObject, ServiceRegistration};
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::manager::ComponentInner;

type CastFn<C, I> = Arc<dyn Fn(Arc<C>) -> Arc<I> + Send + Sync>;

/// A service the component registers while it is started.
///
/// The registration carries the configured properties plus
/// `service.component.id` set to the component uuid. Property changes apply
/// to the next registration.
pub struct ProvidedService<C, I: ?Sized> {
	uuid: Uuid,
	svc_name: String,
	component: Weak<ComponentInner<C>>,
	cast: CastFn<C, I>,
	properties: Mutex<Properties>,
	enabled: AtomicBool,
	registration: Mutex<Option<ServiceRegistration>>,
}

impl<C, I> ProvidedService<C, I>
where
	C: Send + Sync + 'static,
	I: ?Sized + Send + Sync + 'static,
{
	pub(crate) fn new(svc_name: &str, component: Weak<ComponentInner<C>>, cast: CastFn<C, I>) -> Arc<Self> {
		Arc::new(Self {
			uuid: Uuid::new_v4(),
			svc_name: svc_name.to_owned(),
			component,
			cast,
			properties: Mutex::new(Properties::new()),
			enabled: AtomicBool::new(false),
			registration: Mutex::new(None),
		})
	}

	pub fn uuid(&self) -> Uuid {
		self.uuid
	}

	pub fn service_name(&self) -> &str {
		&self.svc_name
	}

	pub fn properties(&self) -> Properties {
		self.properties.lock().clone()
	}

	pub fn add_property(&self, key: impl Into<String>, value: impl ToString) -> &Self {
		self.properties.lock().set(key, value);
		self
	}

	pub fn set_properties(&self, properties: Properties) -> &Self {
		*self.properties.lock() = properties;
		self
	}

	pub fn is_enabled(&self) -> bool {
		self.enabled.load(Ordering::SeqCst)
	}

	/// Id of the live registration, if the service is currently registered.
	pub fn service_id(&self) -> Option<i64> {
		self.registration.lock().as_ref().map(ServiceRegistration::service_id)
	}

	/// Registers the service now if the component is started, otherwise on start.
	pub fn enable(&self) {
		if !self.enabled.swap(true, Ordering::SeqCst) {
			self.sync_registration();
		}
	}

	pub fn disable(&self) {
		if self.enabled.swap(false, Ordering::SeqCst) {
			self.sync_registration();
		}
	}

	fn sync_registration(&self) {
		if let Some(component) = self.component.upgrade() {
			component.update_service_registrations();
		}
	}

	fn register(&self) {
		if self.registration.lock().is_some() {
			return;
		}
		let Some(component) = self.component.upgrade() else {
			return;
		};
		let mut properties = self.properties();
		properties.set(keys::SERVICE_COMPONENT_ID, component.uuid);
		let service = ServiceObject::new((self.cast)(Arc::clone(&component.instance)));
		let options = RegisterOptions::with_properties(properties).owned_by(Arc::clone(&component.owner));
		let registration = component.registry.register_service_named(&self.svc_name, service, options);
		debug!(svc = %self.svc_name, svc_id = registration.service_id(), component = %component.name, "registered provided service");

		let mut slot = self.registration.lock();
		if slot.is_none() {
			*slot = Some(registration);
			return;
		}
		// another thread registered first; ours is withdrawn on drop
		drop(slot);
		drop(registration);
	}

	fn unregister(&self) {
		let registration = self.registration.lock().take();
		if let Some(registration) = registration {
			debug!(svc = %self.svc_name, svc_id = registration.service_id(), "unregistering provided service");
			drop(registration);
		}
	}
}

impl<C, I: ?Sized> fmt::Debug for ProvidedService<C, I> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ProvidedService")
			.field("uuid", &self.uuid)
			.field("svc_name", &self.svc_name)
			.field("enabled", &self.enabled.load(Ordering::SeqCst))
			.field("registered", &self.registration.lock().is_some())
			.finish_non_exhaustive()
	}
}

/// Object-safe view the manager keeps of every provided service.
pub(crate) trait ProvidedControl: Send + Sync {
	fn uuid(&self) -> Uuid;
	fn is_enabled(&self) -> bool;
	fn enable(&self);
	fn disable(&self);
	fn register(&self);
	fn unregister(&self);
	fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<C, I> ProvidedControl for ProvidedService<C, I>
where
	C: Send + Sync + 'static,
	I: ?Sized + Send + Sync + 'static,
{
	fn uuid(&self) -> Uuid {
		self.uuid
	}

	fn is_enabled(&self) -> bool {
		ProvidedService::is_enabled(self)
	}

	fn enable(&self) {
		ProvidedService::enable(self);
	}

	fn disable(&self) {
		ProvidedService::disable(self);
	}

	fn register(&self) {
		ProvidedService::register(self);
	}

	fn unregister(&self) {
		ProvidedService::unregister(self);
	}

	fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
		self
	}
}
