//! Handshake behaviour against scripted daemons.

mod common;

use std::os::unix::net::UnixStream;

use common::{FakeDaemon, Graph};
use nixfs_daemon::{protocol, DaemonClient, Error};
use nixfs_daemon::wire;

#[test]
fn negotiates_the_minimum_of_both_versions() {
    let (stream, daemon) = FakeDaemon::spawn(protocol::CLIENT_VERSION.0, Graph::new());
    let client = DaemonClient::handshake(stream).expect("handshake");
    assert_eq!(client.version(), protocol::CLIENT_VERSION);
    client.close().unwrap();
    daemon.join();
}

#[test]
fn newer_daemon_is_capped_at_the_client_version() {
    let (stream, daemon) = FakeDaemon::spawn((1 << 8) | 0xff, Graph::new());
    let client = DaemonClient::handshake(stream).expect("handshake");
    assert_eq!(client.version(), protocol::CLIENT_VERSION);
    client.close().unwrap();
    daemon.join();
}

#[test]
fn old_daemon_skips_every_gated_field() {
    let path = "/nix/store/b6gvzjyb2pg0kjfwrjmg1vfhpfs2e4dk-tool".to_owned();
    let mut graph = Graph::new();
    graph.insert(path.clone(), Vec::new());

    let (stream, daemon) = FakeDaemon::spawn((1 << 8) | 10, graph);
    let mut client = DaemonClient::handshake(stream).expect("handshake");
    assert_eq!(client.version().minor(), 10);

    // Below 1.16 the trust flag, signatures and content address are absent,
    // and below 1.17 there is no validity word either.
    let info = client.query_path_info(&path).expect("query");
    assert!(!info.ultimate);
    assert!(info.sigs.is_empty());
    assert!(info.ca.is_empty());

    client.close().unwrap();
    assert_eq!(daemon.join(), 1);
}

#[test]
fn rejects_a_wrong_server_magic() {
    let (client_end, mut server_end) = UnixStream::pair().expect("socketpair");
    let server = std::thread::spawn(move || {
        let _magic = wire::read_u64(&mut server_end).unwrap();
        let _version = wire::read_u64(&mut server_end).unwrap();
        wire::write_u64(&mut server_end, 0xdead_beef).unwrap();
        wire::write_u64(&mut server_end, protocol::CLIENT_VERSION.0).unwrap();
    });

    let err = DaemonClient::handshake(client_end).unwrap_err();
    assert!(matches!(err, Error::InvalidMagic { magic: 0xdead_beef }));
    server.join().unwrap();
}

#[test]
fn daemon_reported_errors_become_typed_failures() {
    let (stream, daemon) =
        FakeDaemon::spawn_failing(protocol::CLIENT_VERSION.0, "path is not valid");
    let mut client = DaemonClient::handshake(stream).expect("handshake");
    let err = client.query_path_info("/nix/store/whatever").unwrap_err();
    match err {
        Error::Daemon { message } => assert_eq!(message, "path is not valid"),
        other => panic!("expected a daemon error, got {other:?}"),
    }
    client.close().unwrap();
    assert_eq!(daemon.join(), 1);
}

#[test]
fn legacy_error_frames_are_understood_too() {
    // 1.20 predates structured errors; the payload is message plus status.
    let (stream, daemon) = FakeDaemon::spawn_failing((1 << 8) | 20, "no such path");
    let mut client = DaemonClient::handshake(stream).expect("handshake");
    let err = client.query_path_info("/nix/store/whatever").unwrap_err();
    match err {
        Error::Daemon { message } => assert_eq!(message, "no such path"),
        other => panic!("expected a daemon error, got {other:?}"),
    }
    client.close().unwrap();
    assert_eq!(daemon.join(), 1);
}

#[test]
fn missing_paths_are_reported_per_path() {
    let (stream, daemon) = FakeDaemon::spawn(protocol::CLIENT_VERSION.0, Graph::new());
    let mut client = DaemonClient::handshake(stream).expect("handshake");
    let err = client.query_path_info("/nix/store/does-not-exist").unwrap_err();
    assert!(matches!(err, Error::InvalidPathInfo { path } if path == "/nix/store/does-not-exist"));
    client.close().unwrap();
    assert_eq!(daemon.join(), 1);
}
