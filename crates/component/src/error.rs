use lattice_core::FilterError;

/// Errors reported while configuring a component.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ComponentError {
	#[error("invalid dependency filter `{filter}`: {source}")]
	InvalidFilter {
		filter: String,
		#[source]
		source: FilterError,
	},
}

pub type Result<T, E = ComponentError> = std::result::Result<T, E>;
