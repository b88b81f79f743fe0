//! A scripted Nix daemon speaking the wire protocol over a socketpair.

use std::collections::BTreeMap;
use std::os::unix::net::UnixStream;
use std::thread::JoinHandle;

use nixfs_daemon::protocol::{self, stderr};
use nixfs_daemon::wire;

/// Reference graph served by the fake daemon: path to its references.
pub type Graph = BTreeMap<String, Vec<String>>;

/// Handle to the daemon thread.
pub struct FakeDaemon {
    handle: JoinHandle<u64>,
}

impl FakeDaemon {
    /// Spawn a daemon advertising `version` and serving `graph`.
    ///
    /// Returns the client end of the socketpair and the daemon handle. The
    /// daemon asserts the exact bytes the handshake is allowed to produce
    /// for its version, so a client writing a gated field at the wrong
    /// revision fails the test.
    pub fn spawn(version: u64, graph: Graph) -> (UnixStream, Self) {
        let (client_end, server_end) = UnixStream::pair().expect("socketpair");
        let handle = std::thread::spawn(move || serve(server_end, version, graph));
        (client_end, Self { handle })
    }

    /// Spawn a daemon that answers every query with a reported error.
    pub fn spawn_failing(version: u64, message: &str) -> (UnixStream, Self) {
        let (client_end, server_end) = UnixStream::pair().expect("socketpair");
        let message = message.to_owned();
        let handle = std::thread::spawn(move || serve_failing(server_end, version, &message));
        (client_end, Self { handle })
    }

    /// Wait for the daemon to exit; returns how many queries it served.
    pub fn join(self) -> u64 {
        self.handle.join().expect("fake daemon panicked")
    }
}

fn handshake(s: &mut UnixStream, version: u64) -> u64 {
    let magic = wire::read_u64(s).expect("client magic");
    assert_eq!(magic, protocol::CLIENT_MAGIC);
    let client_version = wire::read_u64(s).expect("client version");
    wire::write_u64(s, protocol::SERVER_MAGIC).unwrap();
    wire::write_u64(s, version).unwrap();

    let minor = version.min(client_version) & 0xff;
    if minor >= 38 {
        let features = wire::read_strings(s).unwrap();
        assert!(features.is_empty(), "client advertises no features");
        wire::write_strings(s, &[]).unwrap();
    }
    if minor >= 14 {
        assert_eq!(wire::read_u64(s).unwrap(), 0, "obsolete cpu affinity word");
    }
    if minor >= 11 {
        assert_eq!(wire::read_u64(s).unwrap(), 0, "obsolete reserve-space word");
    }
    if minor >= 33 {
        wire::write_string(s, "2.18.1").unwrap();
    }
    if minor >= 35 {
        wire::write_u64(s, 1).unwrap();
    }
    wire::write_u64(s, stderr::LAST).unwrap();
    minor
}

fn serve(mut s: UnixStream, version: u64, graph: Graph) -> u64 {
    let minor = handshake(&mut s, version);

    let mut queries = 0;
    while let Ok(op) = wire::read_u64(&mut s) {
        assert_eq!(op, protocol::OP_QUERY_PATH_INFO, "unexpected opcode");
        let path = wire::read_string(&mut s).unwrap();
        queries += 1;
        match graph.get(&path) {
            Some(refs) => {
                // A log line before the terminal frame, as real daemons emit.
                wire::write_u64(&mut s, stderr::NEXT).unwrap();
                wire::write_string(&mut s, &format!("querying info about '{path}'")).unwrap();
                wire::write_u64(&mut s, stderr::LAST).unwrap();
                if minor >= 17 {
                    wire::write_u64(&mut s, 1).unwrap();
                }
                wire::write_string(&mut s, "").unwrap();
                wire::write_string(&mut s, "sha256:0000000000000000000000000000000000000000000000000000").unwrap();
                wire::write_strings(&mut s, refs).unwrap();
                wire::write_u64(&mut s, 1_700_000_000).unwrap();
                wire::write_u64(&mut s, 4096).unwrap();
                if minor >= 16 {
                    wire::write_u64(&mut s, 1).unwrap();
                    wire::write_strings(&mut s, &[]).unwrap();
                    wire::write_string(&mut s, "").unwrap();
                }
            }
            None => {
                wire::write_u64(&mut s, stderr::LAST).unwrap();
                assert!(minor >= 17, "this fake cannot signal not-found below 1.17");
                wire::write_u64(&mut s, 0).unwrap();
            }
        }
    }
    queries
}

fn serve_failing(mut s: UnixStream, version: u64, message: &str) -> u64 {
    let minor = handshake(&mut s, version);

    let mut queries = 0;
    while let Ok(op) = wire::read_u64(&mut s) {
        assert_eq!(op, protocol::OP_QUERY_PATH_INFO, "unexpected opcode");
        let _path = wire::read_string(&mut s).unwrap();
        queries += 1;
        wire::write_u64(&mut s, stderr::ERROR).unwrap();
        if minor >= 26 {
            wire::write_string(&mut s, "Error").unwrap();
            wire::write_u64(&mut s, 0).unwrap();
            wire::write_string(&mut s, "Error").unwrap();
            wire::write_string(&mut s, message).unwrap();
            wire::write_u64(&mut s, 0).unwrap();
            wire::write_u64(&mut s, 1).unwrap();
            wire::write_u64(&mut s, 0).unwrap();
            wire::write_string(&mut s, "while reading path info").unwrap();
        } else {
            wire::write_string(&mut s, message).unwrap();
            wire::write_u64(&mut s, 1).unwrap();
        }
    }
    queries
}
