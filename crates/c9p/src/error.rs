//! Error types and error handling policy of the client.
//!
//! Servers report failures as `Rlerror` messages carrying a Linux errno;
//! those surface as [`Error::No`]. Everything else in the taxonomy is
//! client-side: codec failures, protocol violations, transport loss, and
//! caller mistakes such as operating on a clunked fid.

use std::fmt;
use std::io;

use nix::errno::Errno;

/// Errno constants, as the rest of the crate consumes them.
pub mod errno {
    pub use nix::errno::Errno::*;
}

/// The error type of all client operations.
#[derive(Debug)]
pub enum Error {
    /// Errno-style error returned by the server in `Rlerror`.
    ///
    /// `ENOENT`, `EEXIST` and `EACCES` are the expected, recoverable cases
    /// (not-found, already-exists, permission-denied); see
    /// [`Error::is_not_found`] and friends.
    No(Errno),

    /// An I/O error occurred on the transport.
    Io(io::Error),

    /// An inbound message could not be decoded.
    ///
    /// The offending frame is dropped; the length-delimited framing
    /// resynchronizes at the next frame boundary.
    MalformedMessage(String),

    /// The server replied with a message type that does not answer the
    /// request that was sent under the same tag.
    UnexpectedReply {
        expected: &'static str,
        got: crate::fcall::MsgType,
    },

    /// The transport closed or failed; the session and every fid issued by
    /// it are dead. All pending and future transactions fail with this.
    ConnectionClosed,

    /// Version negotiation failed at connect time; carries the version
    /// string the server offered.
    IncompatibleVersion(String),

    /// A walk stopped short of the requested path. `resolved` of
    /// `requested` components existed; the next one did not.
    WalkIncomplete { resolved: usize, requested: usize },

    /// Operation on a fid handle that is already clunked or removed.
    HandleClosed,

    /// A write completed partially; carries the byte counts.
    IncompleteWrite { wrote: u64, expected: u64 },

    /// The caller-supplied timeout elapsed before the reply arrived. The
    /// transaction tag stays reserved until the dispatcher resolves it.
    Timeout,
}

impl Error {
    /// Whether the error means "the named object does not exist".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::No(Errno::ENOENT) | Error::WalkIncomplete { .. }
        )
    }

    /// Whether the error means "the name is already taken".
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::No(Errno::EEXIST))
    }

    /// Whether the error means "permission denied".
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Error::No(Errno::EACCES) | Error::No(Errno::EPERM))
    }

    /// Build the server-error variant from a raw `Rlerror` ecode.
    pub fn from_ecode(ecode: u32) -> Error {
        Error::No(Errno::from_raw(ecode as i32))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::No(errno) => write!(f, "server error: {}", errno.desc()),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::MalformedMessage(detail) => write!(f, "malformed message: {}", detail),
            Error::UnexpectedReply { expected, got } => {
                write!(f, "unexpected reply: expected {}, got {:?}", expected, got)
            }
            Error::ConnectionClosed => write!(f, "connection closed"),
            Error::IncompatibleVersion(ver) => {
                write!(f, "incompatible protocol version: server offered {:?}", ver)
            }
            Error::WalkIncomplete {
                resolved,
                requested,
            } => write!(
                f,
                "no such file or directory: walk stopped after {} of {} components",
                resolved, requested
            ),
            Error::HandleClosed => write!(f, "fid handle is closed"),
            Error::IncompleteWrite { wrote, expected } => {
                write!(f, "incomplete write: {} of {} bytes", wrote, expected)
            }
            Error::Timeout => write!(f, "transaction timed out"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::No(errno)
    }
}
