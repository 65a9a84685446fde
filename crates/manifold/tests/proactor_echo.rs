use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use manifold::{
    Completion, Data, Endpoint, Error, Notification, OpCode, Proactor, ReactorConfig, SendOptions,
    SocketConfig, SocketHandle, TimestampKind, Transport,
};
use manifold_timing::Nanos;

fn pump_until(proactor: &Proactor, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "test pump timed out");
        proactor.poll(Some(Nanos::from_millis(10))).unwrap();
    }
}

type Completions = Arc<Mutex<Vec<Completion>>>;

fn recorder() -> (Completions, impl Fn() -> Box<dyn FnOnce(Completion) + Send>) {
    let completions: Completions = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&completions);
    (completions, move || {
        let sink = Arc::clone(&sink);
        Box::new(move |completion| sink.lock().unwrap().push(completion))
    })
}

#[test]
fn accept_connect_send_recv_complete_in_order() {
    let proactor = Proactor::new(ReactorConfig::default()).unwrap();

    let listener_handle = SocketHandle::open(Transport::Tcp4).unwrap();
    listener_handle.set_reuse_address(true).unwrap();
    listener_handle.bind(&"127.0.0.1:0".parse::<Endpoint>().unwrap()).unwrap();
    listener_handle.listen(4).unwrap();
    let addr = listener_handle.local_endpoint().unwrap();

    let (listener_completions, listener_callback) = recorder();
    let listener = proactor.attach(listener_handle, SocketConfig::default(), None).unwrap();
    listener.submit_accept(1, listener_callback()).unwrap();

    let (client_completions, client_callback) = recorder();
    let client_handle = SocketHandle::open(Transport::Tcp4).unwrap();
    let client = proactor.attach(client_handle, SocketConfig::default(), None).unwrap();
    client.submit_connect(addr, 2, client_callback()).unwrap();

    pump_until(&proactor, || {
        !listener_completions.lock().unwrap().is_empty() &&
            !client_completions.lock().unwrap().is_empty()
    });

    {
        let mut listener_done = listener_completions.lock().unwrap();
        let accepted = listener_done.pop().unwrap();
        assert_eq!(accepted.opcode, OpCode::Accept);
        assert_eq!(accepted.user_tag, 1);
        assert!(accepted.error.is_none());

        let client_done = client_completions.lock().unwrap();
        assert_eq!(client_done[0].opcode, OpCode::Connect);
        assert!(client_done[0].error.is_none());

        // Wire the accepted side up for the echo.
        let (server_handle, peer) = accepted.accepted.unwrap();
        assert!(peer.is_ip());

        let (server_completions, server_callback) = recorder();
        let server = proactor.attach(server_handle, SocketConfig::default(), None).unwrap();
        server.submit_recv(1024, None, 3, server_callback()).unwrap();

        client
            .submit_send(Data::from(&b"ping"[..]), SendOptions::default(), 4, client_callback())
            .unwrap();
        drop(client_done);

        pump_until(&proactor, || {
            server_completions.lock().unwrap().iter().any(|c| c.opcode == OpCode::Recv)
        });

        let server_done = server_completions.lock().unwrap();
        let received = &server_done[0];
        assert_eq!(received.user_tag, 3);
        assert_eq!(received.bytes_transferred, 4);
        assert_eq!(received.data.as_deref(), Some(&b"ping"[..]));
        assert!(received.error.is_none());
    }

    let client_done = client_completions.lock().unwrap();
    let send_completion =
        client_done.iter().find(|c| c.opcode == OpCode::Send).expect("send never completed");
    assert_eq!(send_completion.user_tag, 4);
    assert_eq!(send_completion.bytes_transferred, 4);
}

#[test]
fn send_notifications_report_schedule_then_sent() {
    let proactor = Proactor::new(ReactorConfig::default()).unwrap();

    let receiver = SocketHandle::open(Transport::Udp4).unwrap();
    receiver.bind(&"127.0.0.1:0".parse::<Endpoint>().unwrap()).unwrap();
    let target = receiver.local_endpoint().unwrap();

    let notifications = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&notifications);

    let sender_handle = SocketHandle::open(Transport::Udp4).unwrap();
    sender_handle.bind(&"127.0.0.1:0".parse::<Endpoint>().unwrap()).unwrap();
    let (completions, callback) = recorder();
    let sender = proactor
        .attach(
            sender_handle,
            SocketConfig::default(),
            Some(Arc::new(move |notification| sink.lock().unwrap().push(notification))),
        )
        .unwrap();

    sender
        .submit_send(Data::from(&b"stamped"[..]), SendOptions::to(target), 9, callback())
        .unwrap();
    pump_until(&proactor, || !completions.lock().unwrap().is_empty());

    let recorded = notifications.lock().unwrap();
    let kinds: Vec<TimestampKind> = recorded
        .iter()
        .filter_map(|notification| match notification {
            Notification::Timestamp(ts) => {
                assert_eq!(ts.id, 9);
                Some(ts.kind)
            }
            Notification::ZeroCopy(_) => None,
        })
        .collect();
    assert_eq!(kinds, vec![TimestampKind::Scheduled, TimestampKind::Sent]);
}

#[test]
fn recv_deadline_times_out_when_nothing_arrives() {
    let proactor = Proactor::new(ReactorConfig::default()).unwrap();

    let handle = SocketHandle::open(Transport::Udp4).unwrap();
    handle.bind(&"127.0.0.1:0".parse::<Endpoint>().unwrap()).unwrap();
    let (completions, callback) = recorder();
    let socket = proactor.attach(handle, SocketConfig::default(), None).unwrap();

    socket
        .submit_recv(
            512,
            Some(Nanos::now().saturating_add(Nanos::from_millis(50))),
            7,
            callback(),
        )
        .unwrap();

    let started = Instant::now();
    pump_until(&proactor, || !completions.lock().unwrap().is_empty());

    let done = completions.lock().unwrap();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].opcode, OpCode::Recv);
    assert_eq!(done[0].error, Some(Error::Timeout));
    assert!(started.elapsed() >= Duration::from_millis(40));
}

#[test]
fn detach_cancels_in_flight_operations_then_completes() {
    let proactor = Proactor::new(ReactorConfig::default()).unwrap();

    let handle = SocketHandle::open(Transport::Udp4).unwrap();
    handle.bind(&"127.0.0.1:0".parse::<Endpoint>().unwrap()).unwrap();
    let (completions, callback) = recorder();
    let socket = proactor.attach(handle, SocketConfig::default(), None).unwrap();

    socket.submit_recv(512, None, 1, callback()).unwrap();
    socket.submit_recv(512, None, 2, callback()).unwrap();
    socket.detach(99, callback()).unwrap();

    pump_until(&proactor, || completions.lock().unwrap().len() == 3);

    let done = completions.lock().unwrap();
    let cancelled: Vec<u64> = done
        .iter()
        .filter(|c| c.opcode == OpCode::Recv)
        .map(|c| {
            assert_eq!(c.error, Some(Error::Canceled));
            c.user_tag
        })
        .collect();
    assert_eq!(cancelled, vec![1, 2]);

    let detached: Vec<&Completion> =
        done.iter().filter(|c| c.opcode == OpCode::Detach).collect();
    assert_eq!(detached.len(), 1);
    assert_eq!(detached[0].user_tag, 99);
    assert!(detached[0].error.is_none());

    // Cancelled operations complete before the detach completion.
    let detach_index = done.iter().position(|c| c.opcode == OpCode::Detach).unwrap();
    assert_eq!(detach_index, 2);
}
