//! Registered service records and their canonical ordering.
//!
//! # Invariants
//!
//! - Ranking then id defines a strict total order: higher ranking first, ties
//!   broken by the lower (older) service id.
//!   - Enforced in: [`RankKey::cmp`]
//!   - Tested by: `registry::tests::prop_find_services_is_ranked`
//!   - Failure symptom: lookups and trackers disagree on the best service.
//! - A factory instance is created once per requesting bundle and released
//!   when that bundle's last reference goes away.
//!   - Enforced in: [`ServiceEntry::service_for`], [`ServiceEntry::release_for`]
//!   - Tested by: `registry::tests::factory_instances_are_per_bundle`
//!   - Failure symptom: factories leak instances or hand one bundle's instance to another.

use std::cmp::Ordering;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering as AtomicOrdering};

use lattice_core::{Properties, ResourceBundle};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::service::{ServiceObject, ServicePayload};
use crate::usage::{Counted, UsageCounter};

/// Sort key shared by the registry's per-name sets and every tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RankKey {
	pub(crate) ranking: i64,
	pub(crate) svc_id: i64,
}

impl Ord for RankKey {
	fn cmp(&self, other: &Self) -> Ordering {
		other
			.ranking
			.cmp(&self.ranking)
			.then_with(|| self.svc_id.cmp(&other.svc_id))
	}
}

impl PartialOrd for RankKey {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

/// Lifecycle of a service registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegistrationState {
	/// Visible to lookups; existing trackers are still being notified.
	Registering = 0,
	/// Visible to lookups and all trackers.
	Registered = 1,
	/// Removed from lookups; waiting for in-flight users to release it.
	Unregistering = 2,
	Unregistered = 3,
}

/// Registration state shared between an entry and its handle.
#[derive(Debug)]
pub(crate) struct SharedState(AtomicU8);

impl SharedState {
	pub(crate) fn new(state: RegistrationState) -> Arc<Self> {
		Arc::new(Self(AtomicU8::new(state as u8)))
	}

	pub(crate) fn get(&self) -> RegistrationState {
		match self.0.load(AtomicOrdering::Acquire) {
			0 => RegistrationState::Registering,
			1 => RegistrationState::Registered,
			2 => RegistrationState::Unregistering,
			_ => RegistrationState::Unregistered,
		}
	}

	pub(crate) fn set(&self, state: RegistrationState) {
		self.0.store(state as u8, AtomicOrdering::Release);
	}
}

/// One registered service.
pub(crate) struct ServiceEntry {
	pub(crate) svc_id: i64,
	pub(crate) svc_name: String,
	pub(crate) ranking: i64,
	pub(crate) properties: Arc<Properties>,
	pub(crate) owner: Arc<dyn ResourceBundle>,
	payload: ServicePayload,
	pub(crate) state: Arc<SharedState>,
	usage: UsageCounter,
	/// Factory instances by requester bundle id, with their reference counts.
	bundle_instances: Mutex<FxHashMap<i64, (ServiceObject, usize)>>,
}

impl Counted for ServiceEntry {
	fn usage(&self) -> &UsageCounter {
		&self.usage
	}
}

impl ServiceEntry {
	pub(crate) fn new(
		svc_id: i64,
		svc_name: String,
		properties: Properties,
		owner: Arc<dyn ResourceBundle>,
		payload: ServicePayload,
	) -> Self {
		let ranking = properties.get_as_i64(lattice_core::keys::SERVICE_RANKING, 0);
		Self {
			svc_id,
			svc_name,
			ranking,
			properties: Arc::new(properties),
			owner,
			payload,
			state: SharedState::new(RegistrationState::Registering),
			usage: UsageCounter::new(),
			bundle_instances: Mutex::new(FxHashMap::default()),
		}
	}

	pub(crate) fn key(&self) -> RankKey {
		RankKey {
			ranking: self.ranking,
			svc_id: self.svc_id,
		}
	}

	/// Whether the entry is still registered (or being registered).
	pub(crate) fn is_live(&self) -> bool {
		matches!(
			self.state.get(),
			RegistrationState::Registering | RegistrationState::Registered
		)
	}

	pub(crate) fn is_factory(&self) -> bool {
		matches!(self.payload, ServicePayload::Factory(_))
	}

	/// Resolves the service for `requester`. Every call must be paired with
	/// [`Self::release_for`].
	pub(crate) fn service_for(&self, requester: &dyn ResourceBundle) -> ServiceObject {
		match &self.payload {
			ServicePayload::Instance(svc) => svc.clone(),
			ServicePayload::Factory(factory) => {
				let mut instances = self.bundle_instances.lock();
				let (svc, refs) = instances.entry(requester.id()).or_insert_with(|| {
					let svc = factory.create_bundle_specific_service(requester, &self.properties);
					(svc, 0)
				});
				*refs += 1;
				svc.clone()
			}
		}
	}

	pub(crate) fn release_for(&self, requester: &dyn ResourceBundle) {
		let ServicePayload::Factory(factory) = &self.payload else {
			return;
		};
		let released = {
			let mut instances = self.bundle_instances.lock();
			match instances.get_mut(&requester.id()) {
				Some((_, refs)) if *refs > 1 => {
					*refs -= 1;
					false
				}
				Some(_) => instances.remove(&requester.id()).is_some(),
				None => false,
			}
		};
		if released {
			factory.bundle_specific_service_removed(requester, &self.properties);
		}
	}
}

impl std::fmt::Debug for ServiceEntry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ServiceEntry")
			.field("svc_id", &self.svc_id)
			.field("svc_name", &self.svc_name)
			.field("ranking", &self.ranking)
			.field("owner", &self.owner.id())
			.field("factory", &self.is_factory())
			.finish()
	}
}
