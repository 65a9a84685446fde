use std::sync::{Arc, Mutex};

use manifold::{Reactor, ReactorConfig, TimerContext, TimerOptions};
use manifold_timing::{Nanos, init_global_with_mock};

/// Drift is exact under the mock clock: the fire observes precisely how
/// far past the deadline the clock had moved, and never fires early.
///
/// One test per binary: the mock clock is process-global.
#[test]
fn drift_is_now_minus_deadline_and_never_negative() {
    let clock = init_global_with_mock();

    let reactor = Reactor::new(ReactorConfig::default()).unwrap();
    let fired: Arc<Mutex<Vec<TimerContext>>> = Arc::new(Mutex::new(Vec::new()));

    let deadline = Nanos::now().saturating_add(Nanos::from_millis(100));
    let sink = Arc::clone(&fired);
    reactor.schedule_timer_at(
        deadline,
        TimerOptions::default(),
        Box::new(move |context| sink.lock().unwrap().push(context)),
    );

    // The deadline has not arrived: nothing fires.
    reactor.poll(Some(Nanos::ZERO)).unwrap();
    clock.increment(Nanos::from_millis(60));
    reactor.poll(Some(Nanos::ZERO)).unwrap();
    assert!(fired.lock().unwrap().is_empty());

    // Jump 90ms past the deadline; the fire reports that exact drift.
    clock.increment(Nanos::from_millis(130));
    reactor.poll(Some(Nanos::ZERO)).unwrap();

    let contexts = fired.lock().unwrap();
    assert_eq!(contexts.len(), 1);
    assert_eq!(contexts[0].deadline, deadline);
    assert_eq!(contexts[0].drift, Nanos::from_millis(90));
    assert_eq!(contexts[0].now, deadline.saturating_add(Nanos::from_millis(90)));
    drop(contexts);

    // A periodic timer reschedules from its deadline, so drift does not
    // accumulate across periods.
    let periodic_fires: Arc<Mutex<Vec<TimerContext>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&periodic_fires);
    let start = Nanos::now().saturating_add(Nanos::from_millis(10));
    reactor.schedule_timer_at(
        start,
        TimerOptions { period: Some(Nanos::from_millis(10)), drift_report: true },
        Box::new(move |context| sink.lock().unwrap().push(context)),
    );

    clock.increment(Nanos::from_millis(35));
    reactor.poll(Some(Nanos::ZERO)).unwrap();

    let contexts = periodic_fires.lock().unwrap();
    assert_eq!(contexts.len(), 3);
    assert_eq!(contexts[0].deadline, start);
    assert_eq!(contexts[1].deadline, start.saturating_add(Nanos::from_millis(10)));
    assert_eq!(contexts[2].deadline, start.saturating_add(Nanos::from_millis(20)));
    for context in contexts.iter() {
        assert!(context.now >= context.deadline);
    }
}
