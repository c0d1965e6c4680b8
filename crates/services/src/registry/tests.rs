use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Barrier, mpsc};
use std::thread;
use std::time::Duration;

use lattice_core::{EMPTY_BUNDLE_ID, Properties, ResourceBundle, keys};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use rstest::rstest;

use super::*;
use crate::service::ServiceFactory;
use crate::test_support::{bundle, registry};

trait Calc: Send + Sync {
	fn calc(&self, x: i32) -> i32;
}

struct Add(i32);

impl Calc for Add {
	fn calc(&self, x: i32) -> i32 {
		x + self.0
	}
}

fn calc(n: i32) -> Arc<dyn Calc> {
	Arc::new(Add(n))
}

fn ranked(rank: i64) -> RegisterOptions {
	RegisterOptions::with_properties(Properties::from([(keys::SERVICE_RANKING, rank)]))
}

#[test]
fn registration_lifecycle() {
	let registry = registry();
	assert_eq!(registry.nr_of_registered_services(), 0);

	let mut reg = registry.register_service::<dyn Calc>(calc(1), RegisterOptions::default());
	assert!(reg.valid());
	assert_eq!(reg.service_id(), 1);
	assert_eq!(reg.service_name(), service_name::<dyn Calc>());
	assert_eq!(reg.registration_state(), RegistrationState::Registered);
	assert_eq!(registry.registration_state(1), RegistrationState::Registered);
	assert_eq!(registry.nr_of_registered_services(), 1);

	reg.unregister();
	assert!(!reg.valid());
	assert_eq!(reg.registration_state(), RegistrationState::Unregistered);
	assert_eq!(registry.registration_state(1), RegistrationState::Unregistered);
	assert_eq!(registry.nr_of_registered_services(), 0);

	// Second unregister and the drop are no-ops.
	reg.unregister();
	drop(reg);
	assert_eq!(registry.nr_of_registered_services(), 0);
}

#[test]
fn moved_registration_owns_the_service() {
	let registry = registry();
	let mut first = registry.register_service::<dyn Calc>(calc(1), RegisterOptions::default());
	let id = first.service_id();

	let moved = std::mem::take(&mut first);
	assert!(!first.valid());
	assert_eq!(first.service_id(), -1);
	drop(first);
	assert_eq!(registry.nr_of_registered_services(), 1);

	assert_eq!(moved.service_id(), id);
	drop(moved);
	assert_eq!(registry.nr_of_registered_services(), 0);
}

#[test]
fn service_ids_increase() {
	let registry = registry();
	let a = registry.register_service::<dyn Calc>(calc(1), RegisterOptions::default());
	let b = registry.register_service_named("other", ServiceObject::new(Arc::new(1u8)), RegisterOptions::default());
	let c = registry.register_service::<dyn Calc>(calc(2), RegisterOptions::default());
	assert_eq!((a.service_id(), b.service_id(), c.service_id()), (1, 2, 3));
}

#[test]
#[should_panic(expected = "service name must not be empty")]
fn empty_service_name_is_rejected() {
	let registry = registry();
	let _reg = registry.register_service_named("", ServiceObject::new(Arc::new(1u8)), RegisterOptions::default());
}

#[test]
fn registered_properties_are_augmented() {
	let registry = registry();
	let owner = bundle(3);
	let _reg = registry.register_service::<dyn Calc>(
		calc(1),
		RegisterOptions::with_properties(Properties::from([("loc", "NL")])).owned_by(owner),
	);

	let mut seen = None;
	assert!(registry.use_service_with(service_name::<dyn Calc>(), &UseOptions::default(), |svc| {
		seen = Some(svc.properties().clone());
	}));
	let props = seen.unwrap();
	assert_eq!(props.get("loc"), Some("NL"));
	assert_eq!(props.get(keys::SERVICE_ID), Some("1"));
	assert_eq!(props.get(keys::SERVICE_NAME), Some(service_name::<dyn Calc>()));
	assert_eq!(props.get(keys::SERVICE_BUNDLE_ID), Some("3"));
}

#[rstest]
#[case(&[0, 100], &[2, 1])]
#[case(&[0, 0, 0], &[1, 2, 3])]
#[case(&[-100, 110, 0, 80, -100, 100, 0], &[2, 6, 4, 3, 7, 1, 5])]
fn find_services_orders_by_ranking(#[case] rankings: &[i64], #[case] expected: &[i64]) {
	let registry = registry();
	let _regs: Vec<_> = rankings
		.iter()
		.map(|&rank| registry.register_service::<dyn Calc>(calc(1), ranked(rank)))
		.collect();
	assert_eq!(registry.find_services_of::<dyn Calc>(""), expected.to_vec());
	assert_eq!(registry.find_service(service_name::<dyn Calc>(), ""), expected.first().copied());
}

proptest! {
	/// Lookups list services by ranking descending, then by registration order.
	#[test]
	fn prop_find_services_is_ranked(rankings in prop::collection::vec(-5i64..5, 0..12)) {
		let registry = registry();
		let regs: Vec<_> = rankings
			.iter()
			.map(|&rank| registry.register_service::<dyn Calc>(calc(0), ranked(rank)))
			.collect();

		let mut expected: Vec<(i64, i64)> = regs.iter().zip(&rankings).map(|(r, &rank)| (rank, r.service_id())).collect();
		expected.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
		let expected: Vec<i64> = expected.into_iter().map(|(_, id)| id).collect();

		prop_assert_eq!(registry.find_services_of::<dyn Calc>(""), expected);
	}
}

#[test]
fn find_services_with_filters() {
	let registry = registry();
	let _a = registry.register_service::<dyn Calc>(
		calc(1),
		RegisterOptions::with_properties(Properties::from([("loc", "front")])),
	);
	let _b = registry.register_service::<dyn Calc>(
		calc(2),
		RegisterOptions::with_properties(Properties::from([("answer", "42")])),
	);
	let _c = registry.register_service_named("other", ServiceObject::new(Arc::new(1u8)), RegisterOptions::default());

	assert_eq!(registry.find_services_of::<dyn Calc>("(loc=*)"), vec![1]);
	assert_eq!(registry.find_services_of::<dyn Calc>("(answer=42)"), vec![2]);
	assert_eq!(registry.find_services_of::<dyn Calc>("(!(loc=*))"), vec![2]);
	assert_eq!(registry.find_services("", "(!(loc=*))"), vec![2, 3]);
	assert_eq!(registry.find_services("", ""), vec![1, 2, 3]);
	assert_eq!(registry.find_service("missing", ""), None);
}

#[test]
fn invalid_lookup_filter_finds_nothing() {
	let registry = registry();
	let _a = registry.register_service::<dyn Calc>(calc(1), RegisterOptions::default());

	assert!(registry.find_services_of::<dyn Calc>("(loc=").is_empty());
	assert!(!registry.use_service::<dyn Calc>(&UseOptions::with_filter("(&"), |_| {}));
}

#[test]
fn use_service_picks_the_highest() {
	let registry = registry();
	let _low = registry.register_service::<dyn Calc>(calc(1), ranked(0));
	let _high = registry.register_service::<dyn Calc>(calc(100), ranked(10));

	let mut result = 0;
	assert!(registry.use_service::<dyn Calc>(&UseOptions::default(), |c| result = c.calc(1)));
	assert_eq!(result, 101);

	let mut results = Vec::new();
	let count = registry.use_services::<dyn Calc>(&UseOptions::default(), |c| results.push(c.calc(1)));
	assert_eq!(count, 2);
	assert_eq!(results, vec![101, 2]);
}

#[test]
fn use_service_reports_owner() {
	let registry = registry();
	let _unowned = registry.register_service::<dyn Calc>(calc(1), RegisterOptions::default());

	let mut owner = 0;
	assert!(registry.use_service_with(service_name::<dyn Calc>(), &UseOptions::default(), |svc| {
		owner = svc.owner().id();
	}));
	assert_eq!(owner, EMPTY_BUNDLE_ID);
	assert_eq!(owner, i64::MAX);
}

#[test]
fn use_service_without_match_returns_false() {
	let registry = registry();
	let mut called = false;
	assert!(!registry.use_service::<dyn Calc>(&UseOptions::default(), |_| called = true));
	assert_eq!(registry.use_services::<dyn Calc>(&UseOptions::default(), |_| called = true), 0);
	assert!(!called);
}

#[test]
fn use_service_with_id_selects_one() {
	let registry = registry();
	let _a = registry.register_service::<dyn Calc>(calc(1), ranked(5));
	let b = registry.register_service::<dyn Calc>(calc(2), RegisterOptions::default());

	let mut result = 0;
	assert!(registry.use_service_with_id::<dyn Calc>(b.service_id(), &UseOptions::default(), |c| result = c.calc(0)));
	assert_eq!(result, 2);
	assert!(!registry.use_service_with_id::<dyn Calc>(99, &UseOptions::default(), |_| {}));
}

#[test]
fn use_service_waits_for_registration() {
	let registry = registry();
	let (ready_tx, ready_rx) = mpsc::channel();
	let user = {
		let registry = Arc::clone(&registry);
		thread::spawn(move || {
			ready_tx.send(()).unwrap();
			let mut result = 0;
			let options = UseOptions::default().waiting_for(Duration::from_secs(5));
			let found = registry.use_service::<dyn Calc>(&options, |c| result = c.calc(1));
			(found, result)
		})
	};
	ready_rx.recv().unwrap();
	thread::sleep(Duration::from_millis(20));
	let _reg = registry.register_service::<dyn Calc>(calc(41), RegisterOptions::default());

	assert_eq!(user.join().unwrap(), (true, 42));
}

#[test]
fn use_service_wait_times_out() {
	let registry = registry();
	let options = UseOptions::default().waiting_for(Duration::from_millis(20));
	assert!(!registry.use_service::<dyn Calc>(&options, |_| {}));
}

#[test]
fn unregister_waits_for_in_flight_use() {
	let registry = registry();
	let mut reg = registry.register_service::<dyn Calc>(calc(1), RegisterOptions::default());

	let (entered_tx, entered_rx) = mpsc::channel();
	let (release_tx, release_rx) = mpsc::channel::<()>();
	let finished = Arc::new(AtomicUsize::new(0));
	let user = {
		let registry = Arc::clone(&registry);
		let finished = Arc::clone(&finished);
		thread::spawn(move || {
			registry.use_service::<dyn Calc>(&UseOptions::default(), |_| {
				entered_tx.send(()).unwrap();
				release_rx.recv().unwrap();
				finished.store(1, AtomicOrdering::SeqCst);
			});
		})
	};
	entered_rx.recv().unwrap();

	let unregistering = thread::spawn(move || {
		reg.unregister();
		reg
	});
	thread::sleep(Duration::from_millis(30));
	assert!(!unregistering.is_finished());
	assert_eq!(registry.registration_state(1), RegistrationState::Unregistered);
	assert!(registry.find_services_of::<dyn Calc>("").is_empty());

	release_tx.send(()).unwrap();
	let reg = unregistering.join().unwrap();
	assert_eq!(finished.load(AtomicOrdering::SeqCst), 1);
	assert_eq!(reg.registration_state(), RegistrationState::Unregistered);
	user.join().unwrap();
}

#[test]
fn bounded_unregister_reports_timeout() {
	let registry = registry();
	let mut reg = registry.register_service::<dyn Calc>(calc(1), RegisterOptions::default());

	let (entered_tx, entered_rx) = mpsc::channel();
	let (release_tx, release_rx) = mpsc::channel::<()>();
	let user = {
		let registry = Arc::clone(&registry);
		thread::spawn(move || {
			registry.use_service::<dyn Calc>(&UseOptions::default(), |_| {
				entered_tx.send(()).unwrap();
				release_rx.recv().unwrap();
			});
		})
	};
	entered_rx.recv().unwrap();

	let err = reg.unregister_within(Duration::from_millis(20)).unwrap_err();
	assert!(matches!(
		err,
		RegistryError::Timeout {
			target: WaitTarget::Service(1),
			..
		}
	));
	assert_eq!(reg.registration_state(), RegistrationState::Unregistering);
	assert_eq!(registry.nr_of_registered_services(), 0);

	release_tx.send(()).unwrap();
	user.join().unwrap();
	// The handle is already disarmed.
	assert!(reg.unregister_within(Duration::from_millis(20)).is_ok());
}

#[test]
fn unknown_ids_are_ignored() {
	let registry = registry();
	assert!(registry.unregister_entry(42, None).is_ok());
	assert!(registry.unregister_entry(0, None).is_ok());
	assert!(registry.unregister_entry(-1, None).is_ok());
}

#[test]
fn lists_registered_names() {
	let registry = registry();
	let a = registry.register_service_named("b.svc", ServiceObject::new(Arc::new(1u8)), RegisterOptions::default());
	let _b = registry.register_service_named("a.svc", ServiceObject::new(Arc::new(2u8)), RegisterOptions::default());
	let _c = registry.register_service_named("a.svc", ServiceObject::new(Arc::new(3u8)), RegisterOptions::default());

	assert_eq!(registry.list_all_registered_service_names(), vec!["a.svc".to_owned(), "b.svc".to_owned()]);
	drop(a);
	assert_eq!(registry.list_all_registered_service_names(), vec!["a.svc".to_owned()]);
}

#[test]
fn function_services_are_named_by_function_and_type() {
	type Doubler = dyn Fn(i32) -> i32 + Send + Sync;
	let registry = registry();
	let double: Arc<Doubler> = Arc::new(|x: i32| x * 2);
	let _reg = registry.register_function_service::<Doubler>("double", double, RegisterOptions::default());

	let mut result = 0;
	assert!(registry.use_function_service::<Doubler>("double", &UseOptions::default(), |f| result = f(21)));
	assert_eq!(result, 42);
	assert!(!registry.use_function_service::<Doubler>("triple", &UseOptions::default(), |_| {}));
	assert_eq!(
		registry.find_services("", "(function.name=double)"),
		vec![1],
	);
}

#[derive(Default)]
struct CountingFactory {
	created: AtomicUsize,
	removed: AtomicUsize,
}

impl ServiceFactory for CountingFactory {
	fn create_bundle_specific_service(&self, requester: &dyn ResourceBundle, _properties: &Properties) -> ServiceObject {
		self.created.fetch_add(1, AtomicOrdering::SeqCst);
		let offset = i32::try_from(requester.id()).unwrap_or(0);
		ServiceObject::new::<dyn Calc>(calc(offset))
	}

	fn bundle_specific_service_removed(&self, _requester: &dyn ResourceBundle, _properties: &Properties) {
		self.removed.fetch_add(1, AtomicOrdering::SeqCst);
	}
}

#[test]
fn factory_instances_are_per_bundle() {
	let registry = registry();
	let factory = Arc::new(CountingFactory::default());
	let _reg = registry.register_service_factory::<dyn Calc>(factory.clone(), RegisterOptions::default());

	let mut results = Vec::new();
	for id in [1, 2] {
		let options = UseOptions::default().requested_by(bundle(id));
		assert!(registry.use_service::<dyn Calc>(&options, |c| results.push(c.calc(10))));
	}
	assert_eq!(results, vec![11, 12]);
	assert_eq!(factory.created.load(AtomicOrdering::SeqCst), 2);
	assert_eq!(factory.removed.load(AtomicOrdering::SeqCst), 2);
}

#[test]
fn factory_instance_is_shared_while_held() {
	let registry = registry();
	let factory = Arc::new(CountingFactory::default());
	let _reg = registry.register_service_factory::<dyn Calc>(factory.clone(), RegisterOptions::default());

	let requester = bundle(5);
	let tracker = registry.track_services::<dyn Calc>(TrackerOptions {
		requester: Some(Arc::clone(&requester)),
		..TrackerOptions::default()
	});
	assert_eq!(tracker.track_count(), 1);

	let options = UseOptions::default().requested_by(requester);
	assert!(registry.use_service::<dyn Calc>(&options, |c| assert_eq!(c.calc(0), 5)));
	assert_eq!(factory.created.load(AtomicOrdering::SeqCst), 1);
	assert_eq!(factory.removed.load(AtomicOrdering::SeqCst), 0);

	drop(tracker);
	assert_eq!(factory.removed.load(AtomicOrdering::SeqCst), 1);
}

#[test]
fn tracker_and_registration_race() {
	const THREADS: usize = 4;
	const PER_THREAD: usize = 25;

	let registry = registry();
	let adds = Arc::new(AtomicUsize::new(0));
	let removes = Arc::new(AtomicUsize::new(0));
	let barrier = Arc::new(Barrier::new(THREADS + 1));

	let workers: Vec<_> = (0..THREADS)
		.map(|_| {
			let registry = Arc::clone(&registry);
			let barrier = Arc::clone(&barrier);
			thread::spawn(move || {
				barrier.wait();
				let regs: Vec<_> = (0..PER_THREAD)
					.map(|_| registry.register_service::<dyn Calc>(calc(1), RegisterOptions::default()))
					.collect();
				drop(regs);
			})
		})
		.collect();

	barrier.wait();
	let tracker = {
		let adds = Arc::clone(&adds);
		let removes = Arc::clone(&removes);
		registry.track_services::<dyn Calc>(
			TrackerOptions::default()
				.on_add(move |_| {
					adds.fetch_add(1, AtomicOrdering::SeqCst);
				})
				.on_remove(move |_| {
					removes.fetch_add(1, AtomicOrdering::SeqCst);
				}),
		)
	};
	for worker in workers {
		worker.join().unwrap();
	}

	assert_eq!(registry.nr_of_registered_services(), 0);
	assert_eq!(tracker.track_count(), 0);
	assert_eq!(adds.load(AtomicOrdering::SeqCst), removes.load(AtomicOrdering::SeqCst));
}
