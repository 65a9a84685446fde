use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use manifold::{
    Data, Endpoint, ReceiveOptions, Scheduler, SchedulerConfig, SendOptions, SessionEvent,
    SocketConfig, SocketHandle, Transport,
};

fn wait_for(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "condition never became true");
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Driver threads do all the polling; the test thread only submits work
/// and observes callbacks, which arrive on the socket's strand.
#[test]
fn pool_drives_udp_traffic_without_explicit_polling() {
    let mut scheduler = Scheduler::new(SchedulerConfig::default()).unwrap();

    let sink_handle = SocketHandle::open(Transport::Udp4).unwrap();
    sink_handle.bind(&"127.0.0.1:0".parse::<Endpoint>().unwrap()).unwrap();
    let target = sink_handle.local_endpoint().unwrap();

    let ready = Arc::new(Mutex::new(false));
    let flag = Arc::clone(&ready);
    let sink = scheduler
        .reactor()
        .attach_datagram(
            sink_handle,
            SocketConfig::default(),
            Arc::new(move |event| {
                if matches!(event, SessionEvent::ReadQueueLowWatermark(_)) {
                    *flag.lock().unwrap() = true;
                }
            }),
        )
        .unwrap();

    let source_handle = SocketHandle::open(Transport::Udp4).unwrap();
    source_handle.bind(&"127.0.0.1:0".parse::<Endpoint>().unwrap()).unwrap();
    let source = scheduler
        .reactor()
        .attach_datagram(source_handle, SocketConfig::default(), Arc::new(|_| {}))
        .unwrap();

    let sent = Arc::new(Mutex::new(false));
    let sent_flag = Arc::clone(&sent);
    source
        .send(
            Data::from(&b"pooled"[..]),
            SendOptions::to(target),
            Some(Box::new(move |context| {
                assert_eq!(context.error, None);
                *sent_flag.lock().unwrap() = true;
            })),
        )
        .unwrap();

    wait_for(|| *sent.lock().unwrap());
    wait_for(|| *ready.lock().unwrap());

    let (data, _) = sink.receive(&ReceiveOptions::default()).unwrap();
    assert_eq!(data.to_vec(), b"pooled");

    scheduler.stop();
}

/// Dynamic balancing: several threads share one reactor; callbacks for a
/// single socket never interleave because its strand serializes them.
#[test]
fn dynamic_pool_serializes_per_socket_callbacks() {
    let config = SchedulerConfig {
        min_threads: 3,
        max_threads: 3,
        dynamic_load_balancing: true,
        ..Default::default()
    };
    let mut scheduler = Scheduler::new(config).unwrap();

    let sink_handle = SocketHandle::open(Transport::Udp4).unwrap();
    sink_handle.bind(&"127.0.0.1:0".parse::<Endpoint>().unwrap()).unwrap();
    let target = sink_handle.local_endpoint().unwrap();

    // The observer asserts it is never re-entered concurrently.
    let inside = Arc::new(Mutex::new(()));
    let events_seen = Arc::new(Mutex::new(0_usize));
    let counter = Arc::clone(&events_seen);
    let guard = Arc::clone(&inside);
    let _sink = scheduler
        .reactor()
        .attach_datagram(
            sink_handle,
            SocketConfig::default(),
            Arc::new(move |_event| {
                let _exclusive = guard.try_lock().expect("observer re-entered concurrently");
                *counter.lock().unwrap() += 1;
            }),
        )
        .unwrap();

    let source_handle = SocketHandle::open(Transport::Udp4).unwrap();
    source_handle.bind(&"127.0.0.1:0".parse::<Endpoint>().unwrap()).unwrap();
    let source = scheduler
        .reactor()
        .attach_datagram(source_handle, SocketConfig::default(), Arc::new(|_| {}))
        .unwrap();

    for _ in 0..32 {
        source.send(Data::from(&b"burst"[..]), SendOptions::to(target.clone()), None).unwrap();
    }

    wait_for(|| *events_seen.lock().unwrap() >= 1);
    scheduler.stop();
}
