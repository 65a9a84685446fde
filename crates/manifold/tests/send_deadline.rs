use std::{
    net::TcpStream,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use manifold::{
    Data, Endpoint, Error, Reactor, ReactorConfig, SendOptions, SocketConfig, SocketHandle,
    Transport,
};
use manifold_timing::Nanos;

fn pump_until(reactor: &Arc<Reactor>, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "test pump timed out");
        reactor.poll(Some(Nanos::from_millis(5))).unwrap();
    }
}

/// An entry that cannot drain before its deadline fails with `Timeout`
/// and is removed from the queue; entries without a deadline survive.
#[test]
fn undrainable_send_times_out_at_its_deadline() {
    let reactor = Reactor::new(ReactorConfig::default()).unwrap();

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

    // The peer never reads, so a small kernel buffer backs up quickly.
    let peer = TcpStream::connect(addr.as_str()).unwrap();
    pump_until(&reactor, || accepted.lock().unwrap().is_some());

    let server_handle = accepted.lock().unwrap().take().unwrap();
    server_handle.set_send_buffer_size(8 * 1024).unwrap();
    let server = reactor
        .attach_stream(server_handle, SocketConfig::default(), Arc::new(|_| {}))
        .unwrap();

    // Saturate the socket until entries start queueing.
    let filler = vec![0_u8; 64 * 1024];
    let fill_deadline = Instant::now() + Duration::from_secs(5);
    while server.write_queue_size() == 0 {
        assert!(Instant::now() < fill_deadline, "kernel buffer never filled");
        server.send(Data::from(filler.as_slice()), SendOptions::default(), None).unwrap();
        reactor.poll(Some(Nanos::from_millis(1))).unwrap();
    }

    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&outcomes);
    let options = SendOptions::default()
        .with_deadline(Nanos::now().saturating_add(Nanos::from_millis(50)));
    let queued_before = server.write_queue_size();
    server
        .send(
            Data::Bytes(vec![9_u8; 128]),
            options,
            Some(Box::new(move |context| sink.lock().unwrap().push(context))),
        )
        .unwrap();

    let started = Instant::now();
    pump_until(&reactor, || !outcomes.lock().unwrap().is_empty());

    let contexts = outcomes.lock().unwrap();
    assert_eq!(contexts.len(), 1);
    assert_eq!(contexts[0].error, Some(Error::Timeout));
    // The callback fired at (not meaningfully before) the deadline.
    assert!(started.elapsed() >= Duration::from_millis(40));
    // The expired entry is gone while the undeadlined backlog remains
    // (the peer still is not reading).
    assert!(server.write_queue_size() > 0);
    assert!(server.write_queue_size() <= queued_before);

    drop(peer);
}

/// Cancellation by token removes a queued entry and fires `Canceled`;
/// repeating the cancel is a harmless no-op.
#[test]
fn cancel_by_token_fails_the_entry_once() {
    let reactor = Reactor::new(ReactorConfig::default()).unwrap();

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

    let peer = TcpStream::connect(addr.as_str()).unwrap();
    pump_until(&reactor, || accepted.lock().unwrap().is_some());

    let server_handle = accepted.lock().unwrap().take().unwrap();
    server_handle.set_send_buffer_size(8 * 1024).unwrap();
    let server = reactor
        .attach_stream(server_handle, SocketConfig::default(), Arc::new(|_| {}))
        .unwrap();

    let filler = vec![0_u8; 64 * 1024];
    let fill_deadline = Instant::now() + Duration::from_secs(5);
    while server.write_queue_size() == 0 {
        assert!(Instant::now() < fill_deadline, "kernel buffer never filled");
        server.send(Data::from(filler.as_slice()), SendOptions::default(), None).unwrap();
        reactor.poll(Some(Nanos::from_millis(1))).unwrap();
    }

    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&outcomes);
    server
        .send(
            Data::Bytes(vec![5_u8; 64]),
            SendOptions::default().with_token(42),
            Some(Box::new(move |context| sink.lock().unwrap().push(context.error))),
        )
        .unwrap();

    server.cancel(42).unwrap();
    pump_until(&reactor, || !outcomes.lock().unwrap().is_empty());
    assert_eq!(*outcomes.lock().unwrap(), vec![Some(Error::Canceled)]);

    // Idempotent.
    server.cancel(42).unwrap();

    drop(peer);
}
