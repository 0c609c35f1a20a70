//! Integration Tests for the Network Frame
//!
//! Real loopback sockets, no mocks:
//! - listen setup errors and bind failures
//! - accept, frame delivery in both directions, close notifications
//! - synchronous and asynchronous dialing
//! - idle timeout

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use fabric_network::{CloseReason, NetworkFrame, SessionDelegate, SessionId, INVALID_SESSION};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Connect(SessionId),
    Message(SessionId, Bytes),
    Close(SessionId, CloseReason),
}

struct RecordingDelegate {
    events: Sender<Event>,
}

impl SessionDelegate for RecordingDelegate {
    fn on_connect(&self, session_id: SessionId, _peer: SocketAddr) {
        let _ = self.events.send(Event::Connect(session_id));
    }

    fn on_message(&self, session_id: SessionId, data: Bytes) {
        let _ = self.events.send(Event::Message(session_id, data));
    }

    fn on_close(&self, session_id: SessionId, reason: CloseReason) {
        let _ = self.events.send(Event::Close(session_id, reason));
    }
}

fn frame_with_events(threads: usize) -> (NetworkFrame, Receiver<Event>) {
    let (tx, rx) = unbounded();
    let frame = NetworkFrame::new(Arc::new(RecordingDelegate { events: tx }), threads).unwrap();
    (frame, rx)
}

fn write_client_frame(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(&(payload.len() as u32).to_be_bytes()).unwrap();
    stream.write_all(payload).unwrap();
    stream.flush().unwrap();
}

fn read_client_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).unwrap();
    let mut payload = vec![0u8; u32::from_be_bytes(len) as usize];
    stream.read_exact(&mut payload).unwrap();
    payload
}

fn expect_connect(events: &Receiver<Event>) -> SessionId {
    match events.recv_timeout(WAIT).expect("no connect event") {
        Event::Connect(id) => id,
        other => panic!("expected connect, got {:?}", other),
    }
}

fn closed_port() -> u16 {
    let probe = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);
    port
}

#[test_log::test]
fn test_listen_unresolvable_host_is_setup_error() {
    let (frame, _events) = frame_with_events(1);

    let err = frame
        .listen("no-such-host.invalid", "9000")
        .expect_err("resolution must fail");

    assert!(err.is_fatal_setup());
    assert!(frame.local_addr().is_none());
    assert_ne!(frame.error_code(), 0);
}

#[test_log::test]
fn test_bind_failure_leaves_frame_non_listening() {
    let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port().to_string();

    let (frame, _events) = frame_with_events(1);
    frame.listen("127.0.0.1", &port).expect("bind failure is not raised");

    assert!(frame.local_addr().is_none());
    assert_ne!(frame.error_code(), 0);
    assert!(!frame.error_message().is_empty());
}

#[test_log::test]
fn test_accept_and_exchange_frames() {
    let (frame, events) = frame_with_events(2);
    frame.listen("127.0.0.1", "0").unwrap();
    frame.run().unwrap();

    let addr = frame.local_addr().expect("listening");
    let mut client = TcpStream::connect(addr).unwrap();
    let session = expect_connect(&events);

    write_client_frame(&mut client, b"ping");
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        Event::Message(session, Bytes::from_static(b"ping"))
    );

    frame.send(session, Bytes::from_static(b"pong")).unwrap();
    client.set_read_timeout(Some(WAIT)).unwrap();
    assert_eq!(read_client_frame(&mut client), b"pong");

    drop(client);
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        Event::Close(session, CloseReason::Remote)
    );

    frame.stop();
}

#[test_log::test]
fn test_accept_rearms_for_many_clients() {
    let (frame, events) = frame_with_events(3);
    frame.listen("127.0.0.1", "0").unwrap();
    frame.run().unwrap();
    let addr = frame.local_addr().unwrap();

    let clients: Vec<TcpStream> = (0..6).map(|_| TcpStream::connect(addr).unwrap()).collect();
    let mut sessions: Vec<SessionId> = (0..6).map(|_| expect_connect(&events)).collect();
    sessions.sort_unstable();
    sessions.dedup();
    assert_eq!(sessions.len(), 6);

    // round-robin placement spreads sessions over every context
    let mut contexts: Vec<u8> = sessions.iter().map(|id| fabric_network::decode_context(*id)).collect();
    contexts.sort_unstable();
    contexts.dedup();
    assert_eq!(contexts, vec![0, 1, 2]);

    drop(clients);
    frame.stop();
}

#[test_log::test]
fn test_local_close_reaches_peer_and_delegate() {
    let (frame, events) = frame_with_events(1);
    frame.listen("127.0.0.1", "0").unwrap();
    frame.run().unwrap();

    let mut client = TcpStream::connect(frame.local_addr().unwrap()).unwrap();
    let session = expect_connect(&events);

    assert!(frame.close_session(session, CloseReason::Local));
    assert!(!frame.close_session(session, CloseReason::Local));

    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        Event::Close(session, CloseReason::Local)
    );

    client.set_read_timeout(Some(WAIT)).unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).unwrap(), 0);

    assert!(frame.send(session, Bytes::from_static(b"late")).is_err());
    frame.stop();
}

#[test_log::test]
fn test_local_close_writes_queued_frames_first() {
    let (frame, events) = frame_with_events(1);
    frame.listen("127.0.0.1", "0").unwrap();
    frame.run().unwrap();

    let mut client = TcpStream::connect(frame.local_addr().unwrap()).unwrap();
    client.set_read_timeout(Some(WAIT)).unwrap();
    let session = expect_connect(&events);

    for reply in [&b"one"[..], b"two", b"three"] {
        frame.send(session, Bytes::copy_from_slice(reply)).unwrap();
    }
    assert!(frame.close_session(session, CloseReason::Local));

    assert_eq!(read_client_frame(&mut client), b"one");
    assert_eq!(read_client_frame(&mut client), b"two");
    assert_eq!(read_client_frame(&mut client), b"three");
    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).unwrap(), 0);

    frame.stop();
}

#[test_log::test]
fn test_sync_connect_to_closed_port_returns_sentinel() {
    let (frame, _events) = frame_with_events(1);
    frame.run().unwrap();

    let port = closed_port().to_string();
    let session = frame.sync_connect("127.0.0.1", &port);

    assert_eq!(session, INVALID_SESSION);
    assert_ne!(frame.error_code(), 0);
    frame.stop();
}

#[test_log::test]
fn test_sync_connect_between_two_frames() {
    let (server, server_events) = frame_with_events(1);
    server.listen("127.0.0.1", "0").unwrap();
    server.run().unwrap();
    let port = server.local_addr().unwrap().port().to_string();

    let (client, client_events) = frame_with_events(1);
    client.run().unwrap();

    let outbound = client.sync_connect("127.0.0.1", &port);
    assert_ne!(outbound, INVALID_SESSION);
    assert_eq!(expect_connect(&client_events), outbound);
    let inbound = expect_connect(&server_events);

    client.send(outbound, Bytes::from_static(b"hello")).unwrap();
    assert_eq!(
        server_events.recv_timeout(WAIT).unwrap(),
        Event::Message(inbound, Bytes::from_static(b"hello"))
    );

    client.stop();
    assert_eq!(
        server_events.recv_timeout(WAIT).unwrap(),
        Event::Close(inbound, CloseReason::Remote)
    );
    server.stop();
}

#[test_log::test]
fn test_async_connect_registers_session() {
    let (server, server_events) = frame_with_events(1);
    server.listen("127.0.0.1", "0").unwrap();
    server.run().unwrap();
    let port = server.local_addr().unwrap().port().to_string();

    let (client, client_events) = frame_with_events(2);
    client.run().unwrap();
    client.async_connect("127.0.0.1", &port);

    let outbound = expect_connect(&client_events);
    expect_connect(&server_events);
    assert_eq!(client.session_count(), 1);
    assert!(client.send(outbound, Bytes::from_static(b"x")).is_ok());

    client.stop();
    server.stop();
}

#[test_log::test]
fn test_async_connect_failure_creates_no_session() {
    let (frame, events) = frame_with_events(1);
    frame.run().unwrap();

    frame.async_connect("127.0.0.1", &closed_port().to_string());

    assert!(events.recv_timeout(Duration::from_millis(500)).is_err());
    assert_eq!(frame.session_count(), 0);
    assert_ne!(frame.error_code(), 0);
    frame.stop();
}

#[test_log::test]
fn test_idle_timeout_closes_session() {
    let (frame, events) = frame_with_events(1);
    frame.set_timeout(100);
    frame.listen("127.0.0.1", "0").unwrap();
    frame.run().unwrap();

    let _client = TcpStream::connect(frame.local_addr().unwrap()).unwrap();
    let session = expect_connect(&events);

    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        Event::Close(session, CloseReason::Timeout)
    );
    frame.stop();
}

#[test_log::test]
fn test_stop_closes_sessions_and_is_idempotent() {
    let (frame, events) = frame_with_events(2);
    frame.listen("127.0.0.1", "0").unwrap();
    frame.run().unwrap();
    frame.run().unwrap();

    let _client = TcpStream::connect(frame.local_addr().unwrap()).unwrap();
    let session = expect_connect(&events);

    frame.stop();
    frame.stop();

    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        Event::Close(session, CloseReason::Shutdown)
    );
    assert_eq!(frame.session_count(), 0);
    assert!(!frame.is_running());
}
