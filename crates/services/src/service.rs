//! Type-erased service payloads.
//!
//! The registry stores services as [`ServiceObject`]s keyed by a string name.
//! Typed APIs wrap an `Arc<I>` (where `I` may be a trait object) and recover
//! it with [`ServiceObject::downcast`] at the boundary.

use std::any::{Any, type_name};
use std::fmt;
use std::sync::Arc;

use lattice_core::{Properties, ResourceBundle};

/// A shared, type-erased service instance.
#[derive(Clone)]
pub struct ServiceObject(Arc<dyn Any + Send + Sync>);

impl ServiceObject {
	pub fn new<I>(service: Arc<I>) -> Self
	where
		I: ?Sized + Send + Sync + 'static,
	{
		Self(Arc::new(service))
	}

	/// Recovers the `Arc<I>` this object was created from.
	pub fn downcast<I>(&self) -> Option<Arc<I>>
	where
		I: ?Sized + Send + Sync + 'static,
	{
		self.0.downcast_ref::<Arc<I>>().cloned()
	}

	/// Whether both objects wrap the same allocation.
	pub fn ptr_eq(&self, other: &ServiceObject) -> bool {
		Arc::ptr_eq(&self.0, &other.0)
	}
}

impl fmt::Debug for ServiceObject {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_tuple("ServiceObject").field(&Arc::as_ptr(&self.0)).finish()
	}
}

/// Produces one service instance per requesting bundle.
pub trait ServiceFactory: Send + Sync {
	/// Creates the instance handed to `requester`. Called once per bundle
	/// while that bundle holds at least one reference to the service.
	fn create_bundle_specific_service(&self, requester: &dyn ResourceBundle, properties: &Properties) -> ServiceObject;

	/// Called when `requester` released its last reference to its instance.
	fn bundle_specific_service_removed(&self, requester: &dyn ResourceBundle, properties: &Properties);
}

/// Either a shared instance or a per-bundle factory, never both.
#[derive(Clone)]
pub(crate) enum ServicePayload {
	Instance(ServiceObject),
	Factory(Arc<dyn ServiceFactory>),
}

/// Default registry name for services of type `I`.
pub fn service_name<I: ?Sized + 'static>() -> &'static str {
	type_name::<I>()
}

/// Registry name for a function service: the function name qualified with
/// the function's type.
pub fn function_service_name<F: ?Sized + 'static>(function_name: &str) -> String {
	format!("{function_name} [{}]", type_name::<F>())
}
