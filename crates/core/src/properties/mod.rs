//! Ordered string property maps attached to every registered service.
//!
//! Keys and values are both strings. Typed reads (`get_as_i64`,
//! `get_as_bool`) parse on demand and fall back to a caller supplied default,
//! so a malformed `service.ranking` degrades to rank 0 rather than failing a
//! registration.
//!
//! Insertion order is preserved for iteration and serialization.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};


/// Well-known property keys written or read by the registry.
pub mod keys {
	/// Name the service was registered under.
	pub const SERVICE_NAME: &str = "service.name";
	/// Registry-assigned service id.
	pub const SERVICE_ID: &str = "service.id";
	/// Id of the owning bundle.
	pub const SERVICE_BUNDLE_ID: &str = "service.bundle.id";
	/// Integer ranking; higher ranks sort first. Defaults to 0.
	pub const SERVICE_RANKING: &str = "service.ranking";
	/// Uuid of the component instance that provides the service.
	pub const SERVICE_COMPONENT_ID: &str = "service.component.id";
	/// Name of a registered function service.
	pub const FUNCTION_NAME: &str = "function.name";
}

/// Ordered `String -> String` map.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties {
	entries: IndexMap<String, String>,
}

impl Properties {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn get(&self, key: &str) -> Option<&str> {
		self.entries.get(key).map(String::as_str)
	}

	/// Returns `default` when the key is missing or does not parse as an integer.
	pub fn get_as_i64(&self, key: &str, default: i64) -> i64 {
		self.get(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
	}

	/// Accepts `true`/`false` in any case; anything else yields `default`.
	pub fn get_as_bool(&self, key: &str, default: bool) -> bool {
		match self.get(key).map(str::trim) {
			Some(v) if v.eq_ignore_ascii_case("true") => true,
			Some(v) if v.eq_ignore_ascii_case("false") => false,
			_ => default,
		}
	}

	/// Inserts or overwrites `key`. Overwriting keeps the original position.
	pub fn set(&mut self, key: impl Into<String>, value: impl ToString) {
		self.entries.insert(key.into(), value.to_string());
	}

	pub fn remove(&mut self, key: &str) -> Option<String> {
		self.entries.shift_remove(key)
	}

	pub fn contains(&self, key: &str) -> bool {
		self.entries.contains_key(key)
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
		self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
	}
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for Properties {
	fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
		let mut props = Properties::new();
		for (k, v) in iter {
			props.set(k, v);
		}
		props
	}
}

impl<K: Into<String>, V: ToString, const N: usize> From<[(K, V); N]> for Properties {
	fn from(entries: [(K, V); N]) -> Self {
		entries.into_iter().collect()
	}
}

impl fmt::Display for Properties {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("{")?;
		for (i, (k, v)) in self.iter().enumerate() {
			if i > 0 {
				f.write_str(", ")?;
			}
			write!(f, "{k}={v}")?;
		}
		f.write_str("}")
	}
}
