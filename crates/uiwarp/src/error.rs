//! Error types for the MPA, DDP and RDMAP layers.

use thiserror::Error;

use crate::registry::AccessFlags;

/// Errors raised by the protocol stack and the verbs surface.
#[derive(Debug, Error)]
pub enum IwarpError {
    /// Short read, bad length field, or a header that does not fit its frame.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// What was wrong with the frame.
        reason: String,
    },

    /// Payload does not fit the 16-bit MPA length field.
    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge {
        /// Requested payload size.
        size: usize,
        /// Largest payload the frame can carry.
        max_size: usize,
    },

    /// The handshake record did not start with a known MPA key.
    #[error("invalid MPA key in handshake record")]
    InvalidMpaKey,

    /// The peer sent bytes after its declared private data.
    #[error("peer sent {extra} unexpected bytes after MPA request")]
    ExtraHandshakeData {
        /// Number of bytes found past the private data.
        extra: usize,
    },

    /// The peer answered the MPA request with the Reject bit set.
    #[error("MPA request rejected by peer")]
    HandshakeRejected,

    /// Private data exceeds the MPA limit.
    #[error("private data too large: {len} bytes (max {max})")]
    PrivateDataTooLarge {
        /// Supplied length.
        len: usize,
        /// Allowed maximum.
        max: usize,
    },

    /// The STag is not registered on this stream.
    #[error("invalid stag 0x{stag:08X}")]
    InvalidStag {
        /// Offending steering tag.
        stag: u32,
    },

    /// Another live region already owns the derived STag.
    #[error("stag 0x{stag:08X} already registered")]
    StagInUse {
        /// Colliding steering tag.
        stag: u32,
    },

    /// Zero-length regions have no addressable bytes and cannot carry a tag.
    #[error("cannot register a zero-length region")]
    EmptyRegion,

    /// The region belongs to another protection domain.
    #[error("protection domain mismatch: expected {expected}, got {got}")]
    ProtectionDomainMismatch {
        /// Domain of the stream.
        expected: u32,
        /// Domain of the region.
        got: u32,
    },

    /// The region lacks the access rights the operation needs.
    #[error("access denied on stag 0x{stag:08X}: requires {required:?}")]
    AccessDenied {
        /// Steering tag of the region.
        stag: u32,
        /// Rights that were missing.
        required: AccessFlags,
    },

    /// Tagged offset (or offset plus length) outside the region.
    #[error("tagged offset 0x{offset:X}+{len} out of range for stag 0x{stag:08X}")]
    TaggedOffsetOutOfRange {
        /// Steering tag of the region.
        stag: u32,
        /// Offending tagged offset.
        offset: u64,
        /// Length being placed or read.
        len: usize,
    },

    /// Untagged queue number out of range.
    #[error("invalid queue number {0}")]
    InvalidQueueNumber(u32),

    /// Message sequence number went backwards on an untagged queue.
    #[error("MSN regression on queue {qn}: got {msn}, expected at least {expected}")]
    MsnRegression {
        /// Queue number.
        qn: u32,
        /// Received sequence number.
        msn: u32,
        /// Next expected sequence number.
        expected: u32,
    },

    /// No untagged buffer posted on the queue.
    #[error("no untagged buffer posted on queue {qn}")]
    NoUntaggedBuffer {
        /// Queue number.
        qn: u32,
    },

    /// Incoming untagged message does not fit the posted buffer.
    #[error("message too long for buffer on queue {qn}: {len} bytes (capacity {capacity})")]
    MessageTooLong {
        /// Queue number.
        qn: u32,
        /// Bytes the message needs.
        len: usize,
        /// Capacity of the posted buffer.
        capacity: usize,
    },

    /// RDMAP opcode not defined.
    #[error("unknown RDMAP opcode 0x{0:X}")]
    UnknownOpcode(u8),

    /// DDP or RDMAP version bits did not match.
    #[error("unsupported {layer} version {got}")]
    UnsupportedVersion {
        /// Layer that carried the version.
        layer: &'static str,
        /// Version received.
        got: u8,
    },

    /// Work Request rejected before it reached a queue.
    #[error("invalid work request {wr_id}: {reason}")]
    InvalidWorkRequest {
        /// Id of the rejected request.
        wr_id: u64,
        /// Why it was rejected.
        reason: String,
    },

    /// The queue's other end is gone.
    #[error("work queue closed")]
    QueueClosed,

    /// The queue is still referenced by a work queue or a stream.
    #[error("{what} still in use")]
    ResourceBusy {
        /// Kind of resource.
        what: &'static str,
    },

    /// Stream configuration rejected.
    #[error("invalid config: {reason}")]
    InvalidConfig {
        /// What was wrong.
        reason: String,
    },

    /// Operation on a stream that is not connected.
    #[error("not connected")]
    NotConnected,

    /// Socket failure, EOF included.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl IwarpError {
    pub(crate) fn frame(reason: impl Into<String>) -> Self {
        IwarpError::InvalidFrame {
            reason: reason.into(),
        }
    }
}

/// Result alias for the crate.
pub type Result<T> = std::result::Result<T, IwarpError>;
