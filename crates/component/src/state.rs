//! Lifecycle states and the single-step transition table.
//!
//! # Invariants
//!
//! - A transition moves at most one level; losing a required dependency
//!   demotes `Started` to `Initialized`, never further on its own.
//!   - Enforced in: [`step`]
//!   - Tested by: `state::tests::steps_move_one_level`
//!   - Failure symptom: components are deinitialized when a dependency blips.
//! - `init`/`deinit` and `start`/`stop` alternate strictly.
//!   - Enforced in: [`step`] (`Init` only from `Uninitialized`, `Start` only from `Initialized`)
//!   - Tested by: `manager::tests::lifecycle_callbacks_balance`
//!   - Failure symptom: double starts or stops of the component instance.

use std::fmt;

/// Lifecycle state of a managed component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ComponentState {
	#[default]
	Disabled,
	/// Enabled, instance not initialized.
	Uninitialized,
	/// `init` ran; waiting for required dependencies (or suspended).
	Initialized,
	/// `start` ran and provided services are registered.
	Started,
}

impl fmt::Display for ComponentState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Disabled => "Disabled",
			Self::Uninitialized => "ComponentUninitialized",
			Self::Initialized => "ComponentInitialized",
			Self::Started => "ComponentStarted",
		})
	}
}

/// Lifecycle callback run while moving between two states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
	Init,
	Start,
	Stop,
	Deinit,
}

/// Mutable state guarded by the manager's state mutex.
#[derive(Debug, Default)]
pub(crate) struct StateData {
	pub(crate) current: ComponentState,
	pub(crate) enabled: bool,
	pub(crate) initialized: bool,
	pub(crate) suspended: bool,
	pub(crate) suspended_count: usize,
	/// Set while a thread drains transitions.
	pub(crate) draining: bool,
	/// A state change arrived that the draining thread has not looked at yet.
	pub(crate) dirty: bool,
}

impl StateData {
	/// The state the component should settle in.
	pub(crate) fn target(&self, resolved: bool) -> ComponentState {
		if !self.enabled {
			ComponentState::Disabled
		} else if resolved && !self.suspended {
			ComponentState::Started
		} else if self.initialized {
			ComponentState::Initialized
		} else {
			ComponentState::Uninitialized
		}
	}
}

/// Next state (and callback) on the way from `from` to `to`, or `None` when
/// already there.
pub(crate) fn step(from: ComponentState, to: ComponentState) -> Option<(Option<Action>, ComponentState)> {
	use ComponentState::*;

	match (from, to) {
		_ if from == to => None,
		(Disabled, _) => Some((None, Uninitialized)),
		(Uninitialized, Disabled) => Some((None, Disabled)),
		(Uninitialized, _) => Some((Some(Action::Init), Initialized)),
		(Initialized, Started) => Some((Some(Action::Start), Started)),
		(Initialized, _) => Some((Some(Action::Deinit), Uninitialized)),
		(Started, _) => Some((Some(Action::Stop), Initialized)),
	}
}
