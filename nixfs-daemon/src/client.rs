//! Session management and the `query-path-info` operation.

use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::Path;

use crate::error::{Error, Result};
use crate::protocol::{self, stderr, ProtocolVersion};
use crate::wire;

/// Metadata the daemon returns for one valid store path.
///
/// Produced fresh per query and never cached by identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathInfo {
    /// Store path of the deriver, or empty when unknown.
    pub deriver: String,
    /// Hash of the path's NAR serialization.
    pub nar_hash: String,
    /// Absolute store paths this path references; may include itself.
    pub references: Vec<String>,
    /// Registration time, in seconds since the epoch.
    pub registration_time: u64,
    /// Size of the NAR serialization in bytes.
    pub nar_size: u64,
    /// Whether the path is ultimately trusted.
    pub ultimate: bool,
    /// Signatures over the path metadata.
    pub sigs: Vec<String>,
    /// Content-addressing descriptor, or empty for input-addressed paths.
    pub ca: String,
}

/// One negotiated session with the Nix daemon.
///
/// The type is generic over the transport so tests can drive it through a
/// socketpair; production sessions run over the daemon's Unix socket.
#[derive(Debug)]
pub struct DaemonClient<S> {
    stream: S,
    version: ProtocolVersion,
}

impl DaemonClient<UnixStream> {
    /// Connect to the daemon socket and perform the handshake.
    pub fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)?;
        Self::handshake(stream)
    }

    /// Shut down the socket once the session is no longer needed.
    pub fn close(self) -> Result<()> {
        self.stream.shutdown(Shutdown::Both)?;
        Ok(())
    }
}

impl<S: Read + Write> DaemonClient<S> {
    /// Run the version-negotiated handshake over an established transport.
    ///
    /// The exchange, gated on the minor of the negotiated revision:
    /// magic words and versions both ways, then (>= 38) an empty client
    /// feature list against the server's, (>= 14) the obsolete CPU affinity
    /// word, (>= 11) the obsolete reserve-space word, (>= 33) the daemon
    /// version string, (>= 35) the trust indicator, and finally one stderr
    /// frame that must terminate cleanly.
    ///
    /// On failure the transport is dropped, which closes it.
    pub fn handshake(mut stream: S) -> Result<Self> {
        wire::write_u64(&mut stream, protocol::CLIENT_MAGIC)?;
        wire::write_u64(&mut stream, protocol::CLIENT_VERSION.0)?;
        stream.flush()?;

        let magic = wire::read_u64(&mut stream)?;
        if magic != protocol::SERVER_MAGIC {
            return Err(Error::InvalidMagic { magic });
        }
        let server = ProtocolVersion(wire::read_u64(&mut stream)?);
        let version = protocol::CLIENT_VERSION.negotiate(server);
        tracing::debug!(%version, "daemon handshake");

        let mut client = Self { stream, version };
        if version.minor() >= 38 {
            wire::write_strings(&mut client.stream, &[])?;
            client.stream.flush()?;
            let _server_features = wire::read_strings(&mut client.stream)?;
        }
        if version.minor() >= 14 {
            // Obsolete CPU affinity.
            wire::write_u64(&mut client.stream, 0)?;
        }
        if version.minor() >= 11 {
            // Obsolete reserve-space.
            wire::write_u64(&mut client.stream, 0)?;
        }
        client.stream.flush()?;
        if version.minor() >= 33 {
            let daemon_version = wire::read_string(&mut client.stream)?;
            tracing::debug!(%daemon_version, "connected");
        }
        if version.minor() >= 35 {
            // Trust indicator: 0 undefined, 1 trusted, 2 not trusted.
            let _trusted = wire::read_u64(&mut client.stream)?;
        }
        client.drain_stderr()?;
        Ok(client)
    }

    /// The protocol revision negotiated during the handshake.
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Query the daemon for metadata about one absolute store path.
    pub fn query_path_info(&mut self, path: &str) -> Result<PathInfo> {
        wire::write_u64(&mut self.stream, protocol::OP_QUERY_PATH_INFO)?;
        wire::write_string(&mut self.stream, path)?;
        self.stream.flush()?;
        self.drain_stderr()?;

        if self.version.minor() >= 17 {
            let valid = wire::read_u64(&mut self.stream)?;
            if valid != 1 {
                return Err(Error::InvalidPathInfo { path: path.to_owned() });
            }
        }

        let deriver = wire::read_string(&mut self.stream)?;
        let nar_hash = wire::read_string(&mut self.stream)?;
        let references = wire::read_strings(&mut self.stream)?;
        let registration_time = wire::read_u64(&mut self.stream)?;
        let nar_size = wire::read_u64(&mut self.stream)?;

        let (ultimate, sigs, ca) = if self.version.minor() >= 16 {
            (
                wire::read_bool(&mut self.stream)?,
                wire::read_strings(&mut self.stream)?,
                wire::read_string(&mut self.stream)?,
            )
        } else {
            (false, Vec::new(), String::new())
        };

        Ok(PathInfo {
            deriver,
            nar_hash,
            references,
            registration_time,
            nar_size,
            ultimate,
            sigs,
            ca,
        })
    }

    /// Drain stderr frames until the daemon signals completion.
    ///
    /// Log lines are forwarded to tracing; a reported error aborts the
    /// request. The remaining tags belong to build-type operations this
    /// client never issues and stay protocol errors.
    fn drain_stderr(&mut self) -> Result<()> {
        loop {
            let tag = wire::read_u64(&mut self.stream)?;
            match tag {
                stderr::LAST => return Ok(()),
                stderr::NEXT => {
                    let line = wire::read_string(&mut self.stream)?;
                    tracing::debug!(target: "nixfs_daemon::stderr", "{}", line.trim_end());
                }
                stderr::ERROR => return Err(self.read_daemon_error()),
                _ => return Err(Error::UnexpectedStderr { tag }),
            }
        }
    }

    /// Decode the payload of an error frame into [`Error::Daemon`].
    fn read_daemon_error(&mut self) -> Error {
        match self.decode_daemon_error() {
            Ok(error) | Err(error) => error,
        }
    }

    fn decode_daemon_error(&mut self) -> Result<Error> {
        if self.version.minor() >= 26 {
            // Structured error: type tag, verbosity, name, message, a
            // position flag and a chain of traces. Only the message is kept.
            let _kind = wire::read_string(&mut self.stream)?;
            let _level = wire::read_u64(&mut self.stream)?;
            let _name = wire::read_string(&mut self.stream)?;
            let message = wire::read_string(&mut self.stream)?;
            let _have_pos = wire::read_u64(&mut self.stream)?;
            let traces = wire::read_u64(&mut self.stream)?;
            for _ in 0..traces {
                let _have_pos = wire::read_u64(&mut self.stream)?;
                let _trace = wire::read_string(&mut self.stream)?;
            }
            Ok(Error::Daemon { message })
        } else {
            let message = wire::read_string(&mut self.stream)?;
            let _status = wire::read_u64(&mut self.stream)?;
            Ok(Error::Daemon { message })
        }
    }
}
