//! Registry configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Tunables for a [`ServiceRegistry`](crate::ServiceRegistry).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
	/// Name reported by [`ServiceRegistry::name`](crate::ServiceRegistry::name) and in logs.
	pub name: String,
	/// Upper bound for implicit unregister/stop waits (handle drops and
	/// `unregister()`/`stop()`). `None` waits until in-flight users finish.
	pub unregister_timeout_ms: Option<u64>,
	/// Whether the process-wide static bundles are activated on construction.
	pub install_static_bundles: bool,
}

impl Default for RegistryConfig {
	fn default() -> Self {
		Self {
			name: "default".to_owned(),
			unregister_timeout_ms: None,
			install_static_bundles: true,
		}
	}
}

impl RegistryConfig {
	pub fn named(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			..Self::default()
		}
	}

	/// Parses a config from TOML. Missing keys take their defaults.
	pub fn from_toml_str(text: &str) -> Result<Self> {
		Ok(toml::from_str(text)?)
	}

	pub fn unregister_timeout(&self) -> Option<Duration> {
		self.unregister_timeout_ms.map(Duration::from_millis)
	}
}
