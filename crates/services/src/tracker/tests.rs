use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use lattice_core::{Properties, keys};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use super::*;
use crate::test_support::registry;
use crate::{RegisterOptions, ServiceObject, ServiceRegistry, ServiceTracker};

type Log = Arc<Mutex<Vec<String>>>;

fn svc() -> ServiceObject {
	ServiceObject::new(Arc::new(()))
}

fn ranked(rank: i64) -> RegisterOptions {
	RegisterOptions::with_properties(Properties::from([(keys::SERVICE_RANKING, rank)]))
}

/// Tracker on `name` that logs every callback as a short string.
fn logging_tracker(registry: &ServiceRegistry, name: &str, log: &Log) -> ServiceTracker {
	let (set, add, rem, upd, pre, post) = (log.clone(), log.clone(), log.clone(), log.clone(), log.clone(), log.clone());
	registry.track_services_named(
		name,
		TrackerOptions {
			pre_update_hook: Some(Arc::new(move || pre.lock().push("pre".into()))),
			post_update_hook: Some(Arc::new(move || post.lock().push("post".into()))),
			..TrackerOptions::default()
				.on_set(move |svc| {
					let id = svc.map_or("none".to_owned(), |s| s.service_id().to_string());
					set.lock().push(format!("set {id}"));
				})
				.on_add(move |svc| add.lock().push(format!("add {}", svc.service_id())))
				.on_remove(move |svc| rem.lock().push(format!("rem {}", svc.service_id())))
				.on_update(move |all| {
					let ids: Vec<String> = all.iter().map(|s| s.service_id().to_string()).collect();
					upd.lock().push(format!("update [{}]", ids.join(",")));
				})
		},
	)
}

fn drain(log: &Log) -> Vec<String> {
	std::mem::take(&mut *log.lock())
}

#[test]
fn callbacks_fire_in_order() {
	let registry = registry();
	let log = Log::default();
	let _tracker = logging_tracker(&registry, "order", &log);

	let mut low = registry.register_service_named("order", svc(), ranked(0));
	assert_eq!(drain(&log), vec!["pre", "set 1", "add 1", "update [1]", "post"]);

	let high = registry.register_service_named("order", svc(), ranked(10));
	assert_eq!(drain(&log), vec!["pre", "set 2", "add 2", "update [2,1]", "post"]);

	let lower = registry.register_service_named("order", svc(), ranked(-1));
	assert_eq!(drain(&log), vec!["pre", "add 3", "update [2,1,3]", "post"]);

	drop(high);
	assert_eq!(drain(&log), vec!["pre", "set 1", "rem 2", "update [1,3]", "post"]);

	low.unregister();
	assert_eq!(drain(&log), vec!["pre", "set 3", "rem 1", "update [3]", "post"]);

	drop(lower);
	assert_eq!(drain(&log), vec!["pre", "set none", "rem 3", "update []", "post"]);
}

#[test]
fn tracker_is_seeded_with_existing_services() {
	let registry = registry();
	let _a = registry.register_service_named("seed", svc(), ranked(1));
	let _b = registry.register_service_named("seed", svc(), ranked(5));
	let _c = registry.register_service_named("seed", svc(), RegisterOptions::with_properties(Properties::from([("skip", "yes")])));

	let log = Log::default();
	let tracker = registry.track_services_named(
		"seed",
		TrackerOptions::with_filter("(!(skip=*))").on_add({
			let log = log.clone();
			move |svc| log.lock().push(format!("add {}", svc.service_id()))
		}),
	);
	assert_eq!(tracker.track_count(), 2);
	assert_eq!(tracker.filter(), "(!(skip=*))");
	assert_eq!(tracker.service_name(), "seed");
	assert_eq!(drain(&log), vec!["add 2", "add 1"]);
	assert_eq!(tracker.highest().map(|s| s.service_id()), Some(2));
	let ranks: Vec<i64> = tracker.tracked_services().iter().map(TrackedService::ranking).collect();
	assert_eq!(ranks, vec![5, 1]);
}

#[test]
fn stop_removes_everything_and_unsets_once() {
	let registry = registry();
	let _a = registry.register_service_named("stop", svc(), ranked(1));
	let _b = registry.register_service_named("stop", svc(), ranked(2));
	let log = Log::default();
	let mut tracker = logging_tracker(&registry, "stop", &log);
	drain(&log);
	assert_eq!(registry.nr_of_service_trackers(), 1);

	tracker.stop();
	assert_eq!(
		drain(&log),
		vec!["pre", "rem 1", "update [2]", "post", "pre", "set none", "rem 2", "update []", "post"]
	);
	assert_eq!(tracker.track_count(), 0);
	assert_eq!(registry.nr_of_service_trackers(), 0);

	// Stopped trackers no longer observe registrations.
	let _c = registry.register_service_named("stop", svc(), ranked(3));
	assert!(drain(&log).is_empty());
}

#[test]
fn invalid_filter_yields_invalid_tracker() {
	let registry = registry();
	let _a = registry.register_service_named("bad", svc(), RegisterOptions::default());
	let added = Arc::new(AtomicUsize::new(0));
	let tracker = {
		let added = Arc::clone(&added);
		registry.track_services_named(
			"bad",
			TrackerOptions::with_filter("(name=").on_add(move |_| {
				added.fetch_add(1, Ordering::SeqCst);
			}),
		)
	};

	assert!(!tracker.valid());
	assert_eq!(tracker.tracker_id(), -1);
	assert_eq!(tracker.track_count(), 0);
	assert_eq!(registry.nr_of_service_trackers(), 0);
	let _b = registry.register_service_named("bad", svc(), RegisterOptions::default());
	assert_eq!(added.load(Ordering::SeqCst), 0);
}

#[test]
fn tracker_counts() {
	let registry = registry();
	let t1 = registry.track_services_named("count", TrackerOptions::default());
	let t2 = registry.track_services_named("count", TrackerOptions::with_filter("(x=1)"));
	let mut t3 = registry.track_services_named("other", TrackerOptions::default());
	assert_eq!(registry.nr_of_service_trackers(), 3);
	assert_eq!((t1.tracker_id(), t2.tracker_id(), t3.tracker_id()), (1, 2, 3));

	let _a = registry.register_service_named("count", svc(), RegisterOptions::default());
	let _b = registry.register_service_named("count", svc(), RegisterOptions::with_properties(Properties::from([("x", 1)])));
	assert_eq!((t1.track_count(), t2.track_count(), t3.track_count()), (2, 1, 0));

	let moved = std::mem::take(&mut t3);
	assert!(!t3.valid());
	assert_eq!(registry.nr_of_service_trackers(), 3);
	drop(moved);
	assert_eq!(registry.nr_of_service_trackers(), 2);
}

#[test]
fn callbacks_may_call_back_into_the_registry() {
	let registry = registry();
	let counts = Arc::new(Mutex::new(Vec::new()));
	let tracker = {
		let counts = Arc::clone(&counts);
		let weak = Arc::downgrade(&registry);
		registry.track_services_named(
			"reenter",
			TrackerOptions::default().on_add(move |_| {
				if let Some(registry) = weak.upgrade() {
					counts.lock().push(registry.find_services("reenter", "").len());
				}
			}),
		)
	};

	let _a = registry.register_service_named("reenter", svc(), RegisterOptions::default());
	let _b = registry.register_service_named("reenter", svc(), RegisterOptions::default());
	assert_eq!(*counts.lock(), vec![1, 2]);
	assert_eq!(tracker.track_count(), 2);
}

#[test]
fn concurrent_registrations_serialize_callbacks() {
	let registry = registry();
	let log = Log::default();
	let _tracker = logging_tracker(&registry, "concurrent", &log);

	let workers: Vec<_> = (0..4)
		.map(|_| {
			let registry = Arc::clone(&registry);
			thread::spawn(move || {
				for _ in 0..20 {
					let reg = registry.register_service_named("concurrent", svc(), RegisterOptions::default());
					drop(reg);
				}
			})
		})
		.collect();
	for worker in workers {
		worker.join().unwrap();
	}

	let events = drain(&log);
	let mut open = false;
	for event in &events {
		match event.as_str() {
			"pre" => {
				assert!(!open, "nested dispatch in {events:?}");
				open = true;
			}
			"post" => {
				assert!(open, "unbalanced post in {events:?}");
				open = false;
			}
			_ => assert!(open, "callback outside dispatch in {events:?}"),
		}
	}
	assert!(!open);
	let adds = events.iter().filter(|e| e.starts_with("add")).count();
	let rems = events.iter().filter(|e| e.starts_with("rem")).count();
	assert_eq!((adds, rems), (80, 80));
}

#[test]
fn stopping_after_registry_drop_releases_matches() {
	let registry = registry();
	let log = Log::default();
	let tracker = logging_tracker(&registry, "orphan", &log);
	let reg = registry.register_service_named("orphan", svc(), RegisterOptions::default());
	drain(&log);

	drop(registry);
	assert_eq!(tracker.track_count(), 1);
	drop(tracker);
	assert_eq!(drain(&log), vec!["pre", "set none", "rem 1", "update []", "post"]);

	// the registry is gone; unregistering is a no-op
	drop(reg);
	assert!(drain(&log).is_empty());
}
