use std::time::Duration;

use lattice_core::FilterError;

/// What a bounded wait was waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
	Service(i64),
	Tracker(i64),
}

impl std::fmt::Display for WaitTarget {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Service(id) => write!(f, "service {id}"),
			Self::Tracker(id) => write!(f, "tracker {id}"),
		}
	}
}

/// Errors reported by the registry.
///
/// Not-found outcomes are not errors: lookups return `None`, `false` or an
/// empty list, and unregistering an unknown id is a no-op.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
	#[error("invalid filter `{filter}`: {source}")]
	InvalidFilter {
		filter: String,
		#[source]
		source: FilterError,
	},

	/// The entry was removed but in-flight users did not release it in time.
	#[error("{target} still in use after {waited:?}")]
	Timeout { target: WaitTarget, waited: Duration },

	#[error("invalid registry config: {0}")]
	Config(#[from] toml::de::Error),
}

pub type Result<T, E = RegistryError> = std::result::Result<T, E>;
