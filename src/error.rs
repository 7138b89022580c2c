// error.rs - Error taxonomy for the EtherNet/IP session layer

use crate::status::CipStatus;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EnipLinkError>;

/// All failure kinds surfaced by the library.
///
/// CIP-level errors reported by the device (`general_status != 0`) are
/// normally *returned* inside operation results, not raised; the
/// [`EnipLinkError::Cip`] variant is reserved for operations whose contract
/// has no status channel (Forward Open/Close, single-attribute helpers).
#[derive(Error, Debug)]
pub enum EnipLinkError {
    /// Malformed or semantically invalid configuration input.
    #[error("invalid configuration: {reason}")]
    ConfigInvalid { reason: String },

    /// The assembly alias is not present in the loaded configuration.
    #[error("unknown assembly alias '{0}'")]
    UnknownAlias(String),

    /// No session with this identifier exists.
    #[error("unknown session '{0}'")]
    UnknownSession(String),

    /// TCP connect/read/write failure or transport-level timeout. The owning
    /// connection transitions to `Broken`.
    #[error("transport failure: {reason}")]
    Transport {
        reason: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// RegisterSession was refused: non-zero encapsulation status or a zero
    /// session handle in the reply.
    #[error("session registration refused (status 0x{status:08X})")]
    RegisterFailed { status: u32 },

    /// An encapsulation reply carried a non-zero `status` field.
    #[error("encapsulation error status 0x{status:08X}")]
    EnipProtocol { status: u32 },

    /// A CIP reply with non-zero general status, on an operation that cannot
    /// carry the status as a value.
    #[error("CIP service failed: {status}")]
    Cip { status: CipStatus },

    /// A received frame violated a decode-side invariant. The owning
    /// connection transitions to `Broken`.
    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: String },

    /// No pooled connection became available within the deadline.
    #[error("timed out waiting for a pooled connection")]
    PoolTimeout,

    /// The pool has been drained and no longer lends connections.
    #[error("connection pool is closed")]
    PoolClosed,

    /// The session was closed (explicitly, or after re-establishment gave
    /// up) and can no longer serve operations.
    #[error("session is closed")]
    SessionClosed,

    /// The operation was aborted by its deadline or an explicit signal.
    #[error("operation cancelled")]
    Cancelled,
}

impl EnipLinkError {
    pub fn config(reason: impl Into<String>) -> Self {
        EnipLinkError::ConfigInvalid {
            reason: reason.into(),
        }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        EnipLinkError::Transport {
            reason: reason.into(),
            source: None,
        }
    }

    pub fn transport_io(reason: impl Into<String>, source: std::io::Error) -> Self {
        EnipLinkError::Transport {
            reason: reason.into(),
            source: Some(source),
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        EnipLinkError::MalformedFrame {
            reason: reason.into(),
        }
    }

    /// Whether this failure must demote the connection it occurred on to
    /// `Broken`, so the pool replaces it instead of reusing it.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            EnipLinkError::Transport { .. }
                | EnipLinkError::MalformedFrame { .. }
                | EnipLinkError::RegisterFailed { .. }
                | EnipLinkError::Cancelled
        )
    }
}

impl From<std::io::Error> for EnipLinkError {
    fn from(err: std::io::Error) -> Self {
        EnipLinkError::Transport {
            reason: "socket I/O failure".to_string(),
            source: Some(err),
        }
    }
}
