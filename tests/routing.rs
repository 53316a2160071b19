//! Integration tests for forwarding between live streams.
//!
//! These tests open real loopback sockets and drive the streams through the
//! registry the way the console application does.

use std::collections::BTreeSet;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::{sleep, timeout};

use stream_router::tcp::TcpSettings;
use stream_router::udp::UdpSettings;
use stream_router::{Direction, Error, LinkFabric, StreamRegistry, TransportSettings};

const WAIT: Duration = Duration::from_secs(5);

/// Collects at least `want` messages from an unconnected stream's inbox.
async fn drain_until(fabric: &LinkFabric, id: usize, want: usize) -> Vec<Bytes> {
    let mut got = Vec::new();
    let _ = timeout(WAIT, async {
        while got.len() < want {
            got.extend(fabric.try_drain(id));
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    got
}

async fn read_exactly(conn: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(WAIT, conn.read_exact(&mut buf))
        .await
        .expect("Timeout")
        .expect("Read failed");
    buf
}

fn tcp_client(port: u16) -> Option<TransportSettings> {
    Some(TransportSettings::Tcp(TcpSettings::client("127.0.0.1", port)))
}

fn temp_file(name: &str, contents: &str) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!("stream_router_{}_{}", std::process::id(), name));
    std::fs::write(&path, contents).unwrap();
    path
}

#[tokio::test]
async fn test_fan_out_to_linked_streams() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut registry = StreamRegistry::new(3);
    let fabric = registry.fabric().clone();
    let a = registry.stream_mut(0).unwrap();
    a.set_transport(tcp_client(port)).unwrap();
    a.update_link(1).unwrap();
    a.update_link(2).unwrap();
    a.connect().await.unwrap();

    let (mut peer, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    peer.write_all(b"$GPRMC,hello\r\n").await.unwrap();

    let expected = vec![Bytes::from_static(b"$GPRMC,hello\r\n")];
    assert_eq!(drain_until(&fabric, 1, 1).await, expected);
    assert_eq!(drain_until(&fabric, 2, 1).await, expected);

    sleep(Duration::from_millis(100)).await;
    assert!(fabric.try_drain(1).is_empty());
    assert!(fabric.try_drain(2).is_empty());

    registry.stream_mut(0).unwrap().disconnect().await.unwrap();
    // Nothing was ever queued for A itself
    assert!(fabric.try_drain(0).is_empty());
}

#[tokio::test]
async fn test_link_toggled_twice_while_connected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut registry = StreamRegistry::new(3);
    let fabric = registry.fabric().clone();
    let a = registry.stream_mut(0).unwrap();
    a.set_transport(tcp_client(port)).unwrap();
    a.update_link(1).unwrap();
    a.connect().await.unwrap();

    a.update_link(2).unwrap();
    a.update_link(2).unwrap();
    assert_eq!(a.linked_ids(), &BTreeSet::from([1]));

    let (mut peer, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    peer.write_all(b"data").await.unwrap();

    assert_eq!(drain_until(&fabric, 1, 1).await, vec![Bytes::from_static(b"data")]);
    sleep(Duration::from_millis(100)).await;
    assert!(fabric.try_drain(2).is_empty());

    registry.close_all().await;
}

#[tokio::test]
async fn test_forwarded_data_reaches_tcp_server_client() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut registry = StreamRegistry::new(2);
    registry
        .stream_mut(1)
        .unwrap()
        .set_transport(Some(TransportSettings::Tcp(TcpSettings::server(0))))
        .unwrap();
    registry.stream_mut(1).unwrap().connect().await.unwrap();
    let server_port = registry.stream(1).unwrap().local_addr().unwrap().port();
    let mut consumer = TcpStream::connect(("127.0.0.1", server_port)).await.unwrap();
    // Let the server stream accept before anything is routed to it
    sleep(Duration::from_millis(200)).await;

    let a = registry.stream_mut(0).unwrap();
    a.set_transport(tcp_client(port)).unwrap();
    a.update_link(1).unwrap();
    a.connect().await.unwrap();
    let (mut source, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    source.write_all(b"$GPGGA,relay\r\n").await.unwrap();

    assert_eq!(read_exactly(&mut consumer, 14).await, b"$GPGGA,relay\r\n");

    // And back the other way with a command on the source stream
    registry.stream(0).unwrap().send_command("reply\r\n");
    assert_eq!(read_exactly(&mut source, 7).await, b"reply\r\n");

    registry.close_all().await;
}

#[tokio::test]
async fn test_tcp_server_without_client_disconnects() {
    let mut registry = StreamRegistry::new(1);
    let stream = registry.stream_mut(0).unwrap();
    stream
        .set_transport(Some(TransportSettings::Tcp(TcpSettings::server(0))))
        .unwrap();
    stream.connect().await.unwrap();

    assert!(stream.is_connected());
    assert!(stream.is_connected());
    assert!(stream.local_addr().is_some());

    // Settings are locked while connected
    assert!(matches!(
        stream.set_line_termination("\n"),
        Err(Error::Settings(_))
    ));
    // Connecting again only logs
    stream.connect().await.unwrap();

    timeout(Duration::from_secs(3), stream.disconnect())
        .await
        .expect("disconnect did not finish")
        .unwrap();
    assert!(!stream.is_connected());
    assert!(!stream.is_connected());
    assert_eq!(stream.input_rate(), 0.0);
    assert_eq!(stream.output_rate(), 0.0);
    assert!(stream.local_addr().is_none());
}

#[tokio::test]
async fn test_udp_specific_host_and_visibility() {
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_port = peer.local_addr().unwrap().port();

    let mut registry = StreamRegistry::new(2);
    let fabric = registry.fabric().clone();
    let stream = registry.stream_mut(0).unwrap();
    stream
        .set_transport(Some(TransportSettings::Udp(UdpSettings::specific("127.0.0.1", peer_port))))
        .unwrap();
    stream.update_link(1).unwrap();
    assert!(stream.toggle_incoming_visibility());
    stream.connect().await.unwrap();

    stream.send_command("ping");
    let mut buf = [0u8; 64];
    let (n, from) = timeout(WAIT, peer.recv_from(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"ping");

    peer.send_to(b"pong", ("127.0.0.1", from.port())).await.unwrap();
    assert_eq!(drain_until(&fabric, 1, 1).await, vec![Bytes::from_static(b"pong")]);

    let shown = stream.drain_show_data();
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].stream_id, 0);
    assert_eq!(shown[0].direction, Direction::Incoming);
    assert_eq!(shown[0].text, "pong");

    stream.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_startup_and_shutdown_scripts() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let startup = temp_file("startup.txt", "$PMTK220,1000*1F\n\nLOG BESTPOS\n");
    let shutdown = temp_file("shutdown.txt", "UNLOGALL\n");

    let mut registry = StreamRegistry::new(1);
    let stream = registry.stream_mut(0).unwrap();
    stream.set_transport(tcp_client(port)).unwrap();
    stream.set_startup_script(true, &startup).unwrap();
    stream.set_shutdown_script(true, &shutdown).unwrap();
    stream.connect().await.unwrap();

    let (mut peer, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    let expected = b"$PMTK220,1000*1F\r\nLOG BESTPOS\r\n";
    assert_eq!(read_exactly(&mut peer, expected.len()).await, expected);

    stream.disconnect().await.unwrap();
    let mut rest = Vec::new();
    timeout(WAIT, peer.read_to_end(&mut rest)).await.unwrap().unwrap();
    assert_eq!(rest, b"UNLOGALL\r\n");

    std::fs::remove_file(startup).unwrap();
    std::fs::remove_file(shutdown).unwrap();
}

#[tokio::test]
async fn test_missing_startup_script_fails_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut registry = StreamRegistry::new(1);
    let stream = registry.stream_mut(0).unwrap();
    stream.set_transport(tcp_client(port)).unwrap();
    stream
        .set_startup_script(true, "/definitely/not/a/script.txt")
        .unwrap();

    let err = stream.connect().await.unwrap_err();
    assert!(matches!(err, Error::StreamThread(_)));
    assert!(!stream.is_connected());
}

#[tokio::test]
async fn test_tcp_client_stream_survives_outage() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut registry = StreamRegistry::new(2);
    let fabric = registry.fabric().clone();
    let stream = registry.stream_mut(0).unwrap();
    stream.set_transport(tcp_client(addr.port())).unwrap();
    stream.update_link(1).unwrap();
    stream.connect().await.unwrap();

    let (first, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    drop(first);
    drop(listener);

    // Long enough for the backoff to outgrow the rate window, with inbox
    // traffic interrupting the worker meanwhile
    for _ in 0..6 {
        stream.send_command("lost while down\r\n");
        sleep(Duration::from_millis(500)).await;
    }
    assert!(stream.is_connected());

    let listener = TcpListener::bind(addr).await.unwrap();
    let (mut peer, _) = timeout(Duration::from_secs(10), listener.accept())
        .await
        .expect("stream did not reconnect")
        .unwrap();

    peer.write_all(b"after outage").await.unwrap();
    assert_eq!(
        drain_until(&fabric, 1, 1).await,
        vec![Bytes::from_static(b"after outage")]
    );
    stream.send_command("hello again\r\n");
    assert_eq!(read_exactly(&mut peer, 13).await, b"hello again\r\n");

    stream.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_traffic_log_follows_visibility() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let shown_log = temp_file("shown.log", "");
    let hidden_log = temp_file("hidden.log", "");

    let mut registry = StreamRegistry::new(3);
    let fabric = registry.fabric().clone();
    for (id, log) in [(0, &shown_log), (1, &hidden_log)] {
        let stream = registry.stream_mut(id).unwrap();
        stream.set_transport(tcp_client(port)).unwrap();
        stream.set_logging(true, log).unwrap();
        stream.update_link(2).unwrap();
    }
    let shown = registry.stream_mut(0).unwrap();
    shown.toggle_incoming_visibility();
    shown.toggle_outgoing_visibility();

    for id in 0..2 {
        registry.stream_mut(id).unwrap().connect().await.unwrap();
        let (mut peer, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        peer.write_all(b"in-line\r\n").await.unwrap();
        assert_eq!(drain_until(&fabric, 2, 1).await.len(), 1);
        registry.stream(id).unwrap().send_command("out-line\r\n");
        assert_eq!(read_exactly(&mut peer, 10).await, b"out-line\r\n");
        registry.stream_mut(id).unwrap().disconnect().await.unwrap();
    }

    let text = std::fs::read_to_string(&shown_log).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    for (line, expected) in lines.iter().zip(["<< in-line", ">> out-line"]) {
        let (timestamp, rest) = line.split_once(' ').unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());
        assert_eq!(rest, expected);
    }
    assert_eq!(std::fs::read_to_string(&hidden_log).unwrap(), "");

    std::fs::remove_file(shown_log).unwrap();
    std::fs::remove_file(hidden_log).unwrap();
}

#[tokio::test]
async fn test_unwritable_log_fails_connect_and_closes_transport() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut registry = StreamRegistry::new(1);
    let stream = registry.stream_mut(0).unwrap();
    stream.set_transport(tcp_client(port)).unwrap();
    stream
        .set_logging(true, "/definitely/not/a/dir/stream.log")
        .unwrap();

    let err = stream.connect().await.unwrap_err();
    assert!(matches!(err, Error::StreamThread(_)));
    assert!(!stream.is_connected());

    // The connection opened for the stream was shut down again
    let (mut peer, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    let mut rest = Vec::new();
    timeout(WAIT, peer.read_to_end(&mut rest)).await.unwrap().unwrap();
    assert!(rest.is_empty());
}
