#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use lattice_core::{Properties, keys};
use parking_lot::Mutex as TestMutex;

use super::*;
use crate::test_support::registry;

fn named(props: Properties) -> RegisterOptions {
	RegisterOptions::with_properties(props)
}

fn svc(n: u32) -> ServiceObject {
	ServiceObject::new(Arc::new(n))
}

fn tracked_ids(tracker: &ServiceTracker) -> Vec<i64> {
	tracker.tracked_services().iter().map(TrackedService::service_id).collect()
}

/// Invariant: Service ids increase monotonically and are never handed out twice,
/// even after the service that held an id is unregistered.
pub(crate) fn inv_service_ids_are_never_reused() {
	let registry = registry();
	let mut seen = Vec::new();
	for round in 0..3 {
		let regs: Vec<_> = (0..4)
			.map(|i| registry.register_service_named("ids", svc(round * 10 + i), RegisterOptions::default()))
			.collect();
		seen.extend(regs.iter().map(ServiceRegistration::service_id));
	}
	let mut sorted = seen.clone();
	sorted.sort_unstable();
	sorted.dedup();
	assert_eq!(sorted, seen);
	assert_eq!(seen.first(), Some(&1));
	assert_eq!(registry.nr_of_registered_services(), 0);
}

#[cfg_attr(test, test)]
pub(crate) fn test_service_ids_are_never_reused() {
	inv_service_ids_are_never_reused()
}

/// Invariant: At every quiescent point a tracker matches exactly the
/// registered services of its name that satisfy its filter.
pub(crate) fn inv_trackers_converge() {
	let filter = "(|(color=red)(color=blue))";
	let registry = registry();
	let tracker = registry.track_services_named("conv", TrackerOptions::with_filter(filter));
	let all = registry.track_services_named("", TrackerOptions::default());

	let colors = ["red", "green", "blue", "red", "blue", "green"];
	let mut regs: Vec<_> = colors
		.iter()
		.enumerate()
		.map(|(i, color)| {
			let props = Properties::from([("color", *color)]);
			registry.register_service_named("conv", svc(i as u32), named(props))
		})
		.collect();
	let _other = registry.register_service_named("other", svc(99), named(Properties::from([("color", "red")])));

	assert_eq!(tracked_ids(&tracker), registry.find_services("conv", filter));
	assert_eq!(all.track_count(), colors.len() + 1);

	drop(regs.remove(0));
	drop(regs.remove(1));
	assert_eq!(tracked_ids(&tracker), registry.find_services("conv", filter));
	assert_eq!(tracker.track_count(), 2);
	assert_eq!(all.track_count(), colors.len() - 1);

	regs.clear();
	assert_eq!(tracker.track_count(), 0);
	assert_eq!(all.track_count(), 1);
}

#[cfg_attr(test, test)]
pub(crate) fn test_trackers_converge() {
	inv_trackers_converge()
}

/// Invariant: `set` fires if and only if the highest ranked match changes.
pub(crate) fn inv_set_fires_only_on_new_highest() {
	let registry = registry();
	let highest: Arc<TestMutex<Vec<Option<i64>>>> = Arc::default();
	let tracker = {
		let highest = Arc::clone(&highest);
		registry.track_services_named(
			"rank",
			TrackerOptions::default().on_set(move |svc| highest.lock().push(svc.map(TrackedService::service_id))),
		)
	};
	let ranked = |rank: i64| named(Properties::from([(keys::SERVICE_RANKING, rank)]));

	let mut a = registry.register_service_named("rank", svc(1), ranked(0));
	let mut b = registry.register_service_named("rank", svc(2), ranked(100));
	let low = registry.register_service_named("rank", svc(3), ranked(-5));
	assert_eq!(*highest.lock(), vec![Some(1), Some(2)]);

	drop(low);
	b.unregister();
	assert_eq!(*highest.lock(), vec![Some(1), Some(2), Some(1)]);
	a.unregister();
	assert_eq!(*highest.lock(), vec![Some(1), Some(2), Some(1), None]);
	assert!(registry.find_services("rank", "").is_empty());
	drop(tracker);
	assert_eq!(highest.lock().len(), 4);
}

#[cfg_attr(test, test)]
pub(crate) fn test_set_fires_only_on_new_highest() {
	inv_set_fires_only_on_new_highest()
}

/// Invariant: Unregister and stop are idempotent, whether repeated explicitly
/// or followed by the handle's drop.
pub(crate) fn inv_unregister_and_stop_are_idempotent() {
	let registry = registry();
	let removed = Arc::new(AtomicUsize::new(0));
	let mut tracker = {
		let removed = Arc::clone(&removed);
		registry.track_services_named(
			"idem",
			TrackerOptions::default().on_remove(move |_| {
				removed.fetch_add(1, AtomicOrdering::SeqCst);
			}),
		)
	};
	let mut reg = registry.register_service_named("idem", svc(1), RegisterOptions::default());

	reg.unregister();
	reg.unregister();
	drop(reg);
	assert_eq!(removed.load(AtomicOrdering::SeqCst), 1);
	assert_eq!(registry.nr_of_registered_services(), 0);

	let _reg = registry.register_service_named("idem", svc(2), RegisterOptions::default());
	assert_eq!(registry.nr_of_service_trackers(), 1);
	tracker.stop();
	tracker.stop();
	assert!(!tracker.valid());
	drop(tracker);
	assert_eq!(removed.load(AtomicOrdering::SeqCst), 2);
	assert_eq!(registry.nr_of_service_trackers(), 0);
}

#[cfg_attr(test, test)]
pub(crate) fn test_unregister_and_stop_are_idempotent() {
	inv_unregister_and_stop_are_idempotent()
}
