use std::{
    io::Write,
    net::TcpStream,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use manifold::{
    Endpoint, Observer, Reactor, ReactorConfig, ReceiveOptions, SessionEvent, SocketConfig,
    SocketHandle, Transport, TriggerMode,
};
use manifold_timing::Nanos;

type Events = Arc<Mutex<Vec<SessionEvent>>>;

fn pump_until(reactor: &Arc<Reactor>, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "test pump timed out");
        reactor.poll(Some(Nanos::from_millis(10))).unwrap();
    }
}

/// Data arriving in separate bursts must be fully drained under an
/// edge-triggered reactor: the session reads to `WouldBlock` on each
/// transition, so nothing is stranded in the kernel.
#[test]
fn edge_triggered_session_drains_across_bursts() {
    let config = ReactorConfig { trigger: TriggerMode::Edge, ..Default::default() };
    let reactor = Reactor::new(config).unwrap();

    let listener_handle = SocketHandle::open(Transport::Tcp4).unwrap();
    listener_handle.set_reuse_address(true).unwrap();
    listener_handle.bind(&"127.0.0.1:0".parse::<Endpoint>().unwrap()).unwrap();
    listener_handle.listen(4).unwrap();
    let addr = listener_handle.local_endpoint().unwrap().to_string();

    let accepted: Arc<Mutex<Option<SocketHandle>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&accepted);
    let _listener = reactor
        .attach_listener(
            listener_handle,
            SocketConfig::default(),
            Arc::new(|_| {}),
            Arc::new(move |handle, _peer| {
                *slot.lock().unwrap() = Some(handle);
            }),
        )
        .unwrap();

    let mut client = TcpStream::connect(addr.as_str()).unwrap();
    pump_until(&reactor, || accepted.lock().unwrap().is_some());

    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let observer: Observer = Arc::new(move |event| sink.lock().unwrap().push(event));
    let server_handle = accepted.lock().unwrap().take().unwrap();
    let server = reactor
        .attach_stream(server_handle, SocketConfig::default(), observer)
        .unwrap();

    // Two bursts with a pause between them: two distinct edges.
    client.write_all(&vec![1_u8; 2048]).unwrap();
    client.flush().unwrap();
    pump_until(&reactor, || server.read_queue_size() >= 2048);

    client.write_all(&vec![2_u8; 2048]).unwrap();
    client.flush().unwrap();
    pump_until(&reactor, || server.read_queue_size() == 4096);

    // The ready event latched once: the low watermark (1 byte) was crossed
    // by the first burst and never re-armed because nothing was consumed.
    let lows = events
        .lock()
        .unwrap()
        .iter()
        .filter(|event| matches!(event, SessionEvent::ReadQueueLowWatermark(_)))
        .count();
    assert_eq!(lows, 1);

    let options = ReceiveOptions { min_size: 4096, max_size: 4096, deadline: None };
    let (data, _) = server.receive(&options).unwrap();
    assert_eq!(data.len(), 4096);
    assert_eq!(&data.to_vec()[..2048], vec![1_u8; 2048].as_slice());
    assert_eq!(&data.to_vec()[2048..], vec![2_u8; 2048].as_slice());
}

/// The poll backend reports level-triggered readiness; with edge trigger
/// configured, the reactor suppresses repeats until the condition clears.
#[test]
fn edge_emulation_over_poll_backend_drains_too() {
    let config = ReactorConfig {
        driver: manifold::DriverName::Poll,
        trigger: TriggerMode::Edge,
        ..Default::default()
    };
    let reactor = Reactor::new(config).unwrap();

    let listener_handle = SocketHandle::open(Transport::Tcp4).unwrap();
    listener_handle.set_reuse_address(true).unwrap();
    listener_handle.bind(&"127.0.0.1:0".parse::<Endpoint>().unwrap()).unwrap();
    listener_handle.listen(4).unwrap();
    let addr = listener_handle.local_endpoint().unwrap().to_string();

    let accepted: Arc<Mutex<Option<SocketHandle>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&accepted);
    let _listener = reactor
        .attach_listener(
            listener_handle,
            SocketConfig::default(),
            Arc::new(|_| {}),
            Arc::new(move |handle, _peer| {
                *slot.lock().unwrap() = Some(handle);
            }),
        )
        .unwrap();

    let mut client = TcpStream::connect(addr.as_str()).unwrap();
    pump_until(&reactor, || accepted.lock().unwrap().is_some());

    let server_handle = accepted.lock().unwrap().take().unwrap();
    let server = reactor
        .attach_stream(server_handle, SocketConfig::default(), Arc::new(|_| {}))
        .unwrap();

    client.write_all(b"first").unwrap();
    client.flush().unwrap();
    pump_until(&reactor, || server.read_queue_size() == 5);

    client.write_all(b"second").unwrap();
    client.flush().unwrap();
    pump_until(&reactor, || server.read_queue_size() == 11);

    let options = ReceiveOptions { min_size: 11, max_size: 11, deadline: None };
    let (data, _) = server.receive(&options).unwrap();
    assert_eq!(data.to_vec(), b"firstsecond");
}
