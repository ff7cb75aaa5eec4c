pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned by the session-level API. Per-packet protocol violations
/// (malformed STUN, failed integrity, unknown transaction) are never surfaced
/// as an `Error` — they are logged and the offending packet is dropped, since
/// a single bad datagram must never abort the session (see recovery policy).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("candidate arena already holds the maximum of {max} candidates")]
    TooManyCandidates { max: usize },

    #[error("component id {0} does not map to a known socket (expected 1 or 2)")]
    UnknownComponent(u16),

    #[error("no remote credentials have been set for this session")]
    MissingRemoteCredentials,

    #[error("stream index {0} is out of range")]
    UnknownStream(usize),
}
