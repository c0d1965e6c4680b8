use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use lattice_core::{Properties, ResourceBundle};

/// Settings for registering a service.
#[derive(Clone, Default)]
pub struct RegisterOptions {
	/// Copied into the entry, then augmented with the registry-owned keys.
	pub properties: Properties,
	/// Owning bundle. Defaults to the empty bundle.
	pub owner: Option<Arc<dyn ResourceBundle>>,
}

impl RegisterOptions {
	pub fn with_properties(properties: Properties) -> Self {
		Self {
			properties,
			owner: None,
		}
	}

	pub fn owned_by(mut self, owner: Arc<dyn ResourceBundle>) -> Self {
		self.owner = Some(owner);
		self
	}
}

impl fmt::Debug for RegisterOptions {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RegisterOptions")
			.field("properties", &self.properties)
			.field("owner", &self.owner.as_ref().map(|b| b.id()))
			.finish()
	}
}

/// Settings for finding or using services.
#[derive(Clone, Default)]
pub struct UseOptions {
	/// LDAP-style filter; empty matches everything.
	pub filter: String,
	/// Bundle the service is resolved for. Defaults to the empty bundle.
	pub requester: Option<Arc<dyn ResourceBundle>>,
	/// When nothing matches, wait up to this long for a matching registration.
	pub wait_for: Option<Duration>,
}

impl UseOptions {
	pub fn with_filter(filter: impl Into<String>) -> Self {
		Self {
			filter: filter.into(),
			..Self::default()
		}
	}

	pub fn requested_by(mut self, requester: Arc<dyn ResourceBundle>) -> Self {
		self.requester = Some(requester);
		self
	}

	pub fn waiting_for(mut self, timeout: Duration) -> Self {
		self.wait_for = Some(timeout);
		self
	}
}

impl fmt::Debug for UseOptions {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("UseOptions")
			.field("filter", &self.filter)
			.field("requester", &self.requester.as_ref().map(|b| b.id()))
			.field("wait_for", &self.wait_for)
			.finish()
	}
}
