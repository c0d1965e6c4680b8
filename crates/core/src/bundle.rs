use std::fmt;
use std::sync::{Arc, LazyLock};

/// Id reserved for the framework-level sentinel bundle.
pub const EMPTY_BUNDLE_ID: i64 = i64::MAX;

/// An owner or requester of services.
///
/// The registry only cares about the numeric id; the name is used in log
/// output.
pub trait ResourceBundle: Send + Sync {
	fn id(&self) -> i64;

	fn name(&self) -> &str;
}

impl fmt::Debug for dyn ResourceBundle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ResourceBundle")
			.field("id", &self.id())
			.field("name", &self.name())
			.finish()
	}
}

/// Bundle used when a caller registers or consumes a service without naming one.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyBundle;

impl ResourceBundle for EmptyBundle {
	fn id(&self) -> i64 {
		EMPTY_BUNDLE_ID
	}

	fn name(&self) -> &str {
		"framework"
	}
}

static EMPTY: LazyLock<Arc<dyn ResourceBundle>> = LazyLock::new(|| Arc::new(EmptyBundle));

/// Returns the shared sentinel bundle.
pub fn empty_bundle() -> Arc<dyn ResourceBundle> {
	Arc::clone(&EMPTY)
}
