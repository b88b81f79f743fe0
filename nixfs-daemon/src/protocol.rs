//! Wire constants of the Nix daemon protocol.

/// Magic word the client sends to open a session.
pub const CLIENT_MAGIC: u64 = 0x6e69_7863;

/// Magic word a real daemon answers with.
pub const SERVER_MAGIC: u64 = 0x6478_696f;

/// Newest protocol revision this client speaks: major 1, minor 38.
pub const CLIENT_VERSION: ProtocolVersion = ProtocolVersion((1 << 8) | 38);

/// Operation code for `query-path-info`.
///
/// The daemon knows many more opcodes; this client only ever asks for path
/// metadata, so only this one is spelled out.
pub const OP_QUERY_PATH_INFO: u64 = 26;

/// Tags of the stderr sub-channel interleaved with typed responses.
pub mod stderr {
    /// A log line follows as one string.
    pub const NEXT: u64 = 0x6f6c_6d67;
    /// The daemon wants data from a source. Never sent for query operations.
    pub const READ: u64 = 0x6461_7461;
    /// Data for a sink follows. Never sent for query operations.
    pub const WRITE: u64 = 0x6461_7416;
    /// Terminates the sub-channel; the typed response follows.
    pub const LAST: u64 = 0x616c_7473;
    /// The request failed; an error payload follows.
    pub const ERROR: u64 = 0x6378_7470;
    /// A build or substitution activity started.
    pub const START_ACTIVITY: u64 = 0x5354_5254;
    /// An activity stopped.
    pub const STOP_ACTIVITY: u64 = 0x5354_4f50;
    /// A progress result for a running activity.
    pub const RESULT: u64 = 0x5253_4c54;
}

/// A protocol revision: major version in the high byte, minor in the low.
///
/// Every conditional wire field is gated on the minor of the negotiated
/// revision, never on a hardcoded one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolVersion(pub u64);

impl ProtocolVersion {
    /// The minor revision.
    pub fn minor(self) -> u64 {
        self.0 & 0xff
    }

    /// The revision both peers support: whichever is older.
    pub fn negotiate(self, other: ProtocolVersion) -> ProtocolVersion {
        ProtocolVersion(self.0.min(other.0))
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", (self.0 >> 8) & 0xff, self.0 & 0xff)
    }
}
