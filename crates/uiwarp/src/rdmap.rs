//! RDMAP operation codes, control octet and the small wire messages carried
//! over DDP's untagged queues.

use std::collections::VecDeque;

use bytes::{Buf, BufMut};
use parking_lot::Mutex;

use crate::ddp::TaggedMeta;
use crate::error::{IwarpError, Result};
use crate::registry::AccessFlags;

/// RDMAP version carried in the top bits of the control octet.
pub const RDMAP_VERSION: u8 = 1;
/// Untagged queue for the Send family.
pub const QN_SEND: u32 = 0;
/// Untagged queue for Read Requests.
pub const QN_READ_REQUEST: u32 = 1;
/// Untagged queue for Terminate messages.
pub const QN_TERMINATE: u32 = 2;
/// Read Request payload size.
pub const RDMAP_READ_REQ_SIZE: usize = 28;
/// Terminate control word size.
pub const RDMAP_TERMINATE_SIZE: usize = 4;

const RDMAP_MASK_OPCODE: u8 = 0x0F;
const RDMAP_SHIFT_VERSION: u8 = 6;

/// RDMAP operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RdmapOpcode {
    /// Tagged placement into the peer.
    Write = 0,
    /// Request for a tagged placement back.
    ReadRequest = 1,
    /// Answer to a Read Request.
    ReadResponse = 2,
    /// Untagged message.
    Send = 3,
    /// Send that also invalidates a peer STag.
    SendInvalidate = 4,
    /// Send with Solicited Event.
    SendSolicited = 5,
    /// Solicited Send that also invalidates a peer STag.
    SendSolicitedInvalidate = 6,
    /// Connection teardown.
    Terminate = 7,
}

impl TryFrom<u8> for RdmapOpcode {
    type Error = IwarpError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => RdmapOpcode::Write,
            1 => RdmapOpcode::ReadRequest,
            2 => RdmapOpcode::ReadResponse,
            3 => RdmapOpcode::Send,
            4 => RdmapOpcode::SendInvalidate,
            5 => RdmapOpcode::SendSolicited,
            6 => RdmapOpcode::SendSolicitedInvalidate,
            7 => RdmapOpcode::Terminate,
            other => return Err(IwarpError::UnknownOpcode(other)),
        })
    }
}

impl RdmapOpcode {
    /// One of the four Send variants.
    pub fn is_send(self) -> bool {
        matches!(
            self,
            RdmapOpcode::Send
                | RdmapOpcode::SendInvalidate
                | RdmapOpcode::SendSolicited
                | RdmapOpcode::SendSolicitedInvalidate
        )
    }

    /// Carries an STag to invalidate in rsvdULP2.
    pub fn invalidates(self) -> bool {
        matches!(
            self,
            RdmapOpcode::SendInvalidate | RdmapOpcode::SendSolicitedInvalidate
        )
    }

    /// Travels on DDP's tagged model.
    pub fn is_tagged(self) -> bool {
        matches!(self, RdmapOpcode::Write | RdmapOpcode::ReadResponse)
    }

    /// Untagged queue the operation uses; `None` for tagged operations.
    pub fn queue_number(self) -> Option<u32> {
        match self {
            RdmapOpcode::Write | RdmapOpcode::ReadResponse => None,
            RdmapOpcode::ReadRequest => Some(QN_READ_REQUEST),
            RdmapOpcode::Terminate => Some(QN_TERMINATE),
            _ => Some(QN_SEND),
        }
    }

    /// Control octet for this opcode.
    pub fn control(self) -> u8 {
        (RDMAP_VERSION << RDMAP_SHIFT_VERSION) | self as u8
    }

    /// Parses a control octet, checking the version.
    pub fn from_control(octet: u8) -> Result<Self> {
        let version = octet >> RDMAP_SHIFT_VERSION;
        if version != RDMAP_VERSION {
            return Err(IwarpError::UnsupportedVersion {
                layer: "RDMAP",
                got: version,
            });
        }
        RdmapOpcode::try_from(octet & RDMAP_MASK_OPCODE)
    }
}

/// Read Requests a stream has sent and not yet seen answered, oldest first.
///
/// Read Responses carry no request id. A response belongs to the oldest
/// outstanding Read and every one of its segments must land inside that Read's
/// sink. Tagged Writes need `REMOTE_WRITE`; no other opcode may be tagged.
#[derive(Debug, Default)]
pub struct PendingReads {
    reads: Mutex<VecDeque<(u64, ReadRequest)>>,
}

impl PendingReads {
    /// No outstanding Reads.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a Read Request for work request `wr_id`. Call before the
    /// request is written so a fast response always finds it.
    pub fn push(&self, wr_id: u64, req: ReadRequest) {
        self.reads.lock().push_back((wr_id, req));
    }

    /// Outstanding Reads.
    pub fn len(&self) -> usize {
        self.reads.lock().len()
    }

    /// True if no Read is outstanding.
    pub fn is_empty(&self) -> bool {
        self.reads.lock().is_empty()
    }

    /// Decides whether a tagged segment may be placed and which right it needs.
    pub fn admit(&self, meta: &TaggedMeta, len: usize) -> Result<AccessFlags> {
        match RdmapOpcode::from_control(meta.rsvd_ulp)? {
            RdmapOpcode::Write => Ok(AccessFlags::REMOTE_WRITE),
            RdmapOpcode::ReadResponse => {
                let reads = self.reads.lock();
                let (wr_id, req) = reads
                    .front()
                    .ok_or_else(|| IwarpError::frame("read response without an outstanding read"))?;
                if !sink_covers(req, meta.stag, meta.to, len) {
                    return Err(IwarpError::frame(format!(
                        "read response segment at stag 0x{:08X} to 0x{:X} len {len} \
                         outside the sink of read {wr_id}",
                        meta.stag, meta.to
                    )));
                }
                Ok(AccessFlags::LOCAL_WRITE)
            }
            other => Err(IwarpError::frame(format!(
                "{other:?} received on the tagged buffer model"
            ))),
        }
    }

    /// Retires the oldest outstanding Read.
    pub fn complete(&self) -> Option<(u64, ReadRequest)> {
        self.reads.lock().pop_front()
    }

    /// Removes every outstanding Read, oldest first.
    pub fn drain(&self) -> Vec<(u64, ReadRequest)> {
        self.reads.lock().drain(..).collect()
    }
}

fn sink_covers(req: &ReadRequest, stag: u32, to: u64, len: usize) -> bool {
    if stag != req.sink_stag || to < req.sink_to {
        return false;
    }
    match (to - req.sink_to).checked_add(len as u64) {
        Some(end) => end <= u64::from(req.size),
        None => false,
    }
}

/// Body of a Read Request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    /// Initiator's sink STag.
    pub sink_stag: u32,
    /// Initiator's sink address.
    pub sink_to: u64,
    /// Bytes to read.
    pub size: u32,
    /// Responder's source STag.
    pub src_stag: u32,
    /// Responder's source address.
    pub src_to: u64,
}

impl ReadRequest {
    /// Wire form.
    pub fn encode(&self) -> [u8; RDMAP_READ_REQ_SIZE] {
        let mut out = [0u8; RDMAP_READ_REQ_SIZE];
        let mut buf = &mut out[..];
        buf.put_u32(self.sink_stag);
        buf.put_u64(self.sink_to);
        buf.put_u32(self.size);
        buf.put_u32(self.src_stag);
        buf.put_u64(self.src_to);
        out
    }

    /// Parses the wire form.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.remaining() < RDMAP_READ_REQ_SIZE {
            return Err(IwarpError::frame(format!(
                "read request of {} bytes, need {RDMAP_READ_REQ_SIZE}",
                buf.remaining()
            )));
        }
        Ok(Self {
            sink_stag: buf.get_u32(),
            sink_to: buf.get_u64(),
            size: buf.get_u32(),
            src_stag: buf.get_u32(),
            src_to: buf.get_u64(),
        })
    }
}

/// Layer that raised a Terminate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TerminateLayer {
    /// RDMAP.
    Rdmap = 0,
    /// DDP.
    Ddp = 1,
    /// Lower layer (MPA).
    Llp = 2,
}

/// Terminate control word: layer, error type and error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminateMessage {
    /// Originating layer.
    pub layer: TerminateLayer,
    /// Error type, 4 bits.
    pub error_type: u8,
    /// Error code.
    pub error_code: u8,
}

impl TerminateMessage {
    /// Orderly close requested by the application.
    pub fn local_close() -> Self {
        Self {
            layer: TerminateLayer::Rdmap,
            error_type: 0,
            error_code: 0,
        }
    }

    /// Wire form.
    pub fn encode(&self) -> [u8; RDMAP_TERMINATE_SIZE] {
        let word = (u32::from(self.layer as u8) << 28)
            | (u32::from(self.error_type & 0x0F) << 24)
            | (u32::from(self.error_code) << 16);
        word.to_be_bytes()
    }

    /// Parses the wire form.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.remaining() < RDMAP_TERMINATE_SIZE {
            return Err(IwarpError::frame("truncated terminate message"));
        }
        let word = buf.get_u32();
        let layer = match word >> 28 {
            0 => TerminateLayer::Rdmap,
            1 => TerminateLayer::Ddp,
            2 => TerminateLayer::Llp,
            other => {
                return Err(IwarpError::frame(format!("unknown terminate layer {other}")))
            }
        };
        Ok(Self {
            layer,
            error_type: ((word >> 24) & 0x0F) as u8,
            error_code: ((word >> 16) & 0xFF) as u8,
        })
    }
}
