//! DDP: segmentation of outbound messages and direct placement of inbound ones.
//!
//! Every segment is one MPA frame holding a control octet, the tagged or
//! untagged header and up to `mulpdu` payload bytes. Segments of a message
//! arrive in order; the one with the Last bit set closes the message.

use std::io::{Read, Write};
use std::sync::Arc;

use bytes::{Buf, BufMut};
use tracing::{debug, trace};

use crate::error::{IwarpError, Result};
use crate::mpa::{mpa_recv, mpa_send, MpaRecvState};
use crate::registry::{
    AccessFlags, MemoryRegion, ProtectionDomain, TagRegistry, UntaggedBuffer, UntaggedQueue,
};

/// Size of the control octet.
pub const DDP_CTRL_SIZE: usize = 1;
/// Tagged header after the control octet: rsvdULP, STag, TO.
pub const DDP_TAGGED_HDR_SIZE: usize = 13;
/// Untagged header after the control octet: rsvdULP1, rsvdULP2, QN, MSN, MO.
pub const DDP_UNTAGGED_HDR_SIZE: usize = 17;
/// DDP version carried in the low bits of the control octet.
pub const DDP_VERSION: u8 = 1;
/// Untagged queues per stream.
pub const DDP_NUM_QUEUES: usize = 3;

const DDP_FLAG_TAGGED: u8 = 0x80;
const DDP_FLAG_LAST: u8 = 0x40;
const DDP_MASK_VERSION: u8 = 0x03;

/// The control octet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DdpControl {
    /// Tagged buffer model.
    pub tagged: bool,
    /// Last segment of the message.
    pub last: bool,
}

impl DdpControl {
    /// Encodes with the DDP version in the low bits.
    pub fn to_byte(self) -> u8 {
        let mut b = DDP_VERSION;
        if self.tagged {
            b |= DDP_FLAG_TAGGED;
        }
        if self.last {
            b |= DDP_FLAG_LAST;
        }
        b
    }

    /// Decodes, rejecting a foreign version.
    pub fn from_byte(b: u8) -> Result<Self> {
        let version = b & DDP_MASK_VERSION;
        if version != DDP_VERSION {
            return Err(IwarpError::UnsupportedVersion {
                layer: "DDP",
                got: version,
            });
        }
        Ok(Self {
            tagged: b & DDP_FLAG_TAGGED != 0,
            last: b & DDP_FLAG_LAST != 0,
        })
    }
}

/// Tagged segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaggedMeta {
    /// Upper-layer octet (the RDMAP control octet).
    pub rsvd_ulp: u8,
    /// Steering tag of the target region.
    pub stag: u32,
    /// Tagged Offset of this segment's first byte.
    pub to: u64,
}

impl TaggedMeta {
    /// Appends the wire form.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.rsvd_ulp);
        buf.put_u32(self.stag);
        buf.put_u64(self.to);
    }

    /// Parses the wire form.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.remaining() < DDP_TAGGED_HDR_SIZE {
            return Err(IwarpError::frame("truncated DDP tagged header"));
        }
        Ok(Self {
            rsvd_ulp: buf.get_u8(),
            stag: buf.get_u32(),
            to: buf.get_u64(),
        })
    }
}

/// Untagged segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UntaggedMeta {
    /// Upper-layer octet (the RDMAP control octet).
    pub rsvd_ulp1: u8,
    /// Upper-layer word (STag to invalidate).
    pub rsvd_ulp2: u32,
    /// Queue number.
    pub qn: u32,
    /// Message sequence number.
    pub msn: u32,
    /// Message offset of this segment's first byte.
    pub mo: u32,
}

impl UntaggedMeta {
    /// Appends the wire form.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.rsvd_ulp1);
        buf.put_u32(self.rsvd_ulp2);
        buf.put_u32(self.qn);
        buf.put_u32(self.msn);
        buf.put_u32(self.mo);
    }

    /// Parses the wire form.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.remaining() < DDP_UNTAGGED_HDR_SIZE {
            return Err(IwarpError::frame("truncated DDP untagged header"));
        }
        Ok(Self {
            rsvd_ulp1: buf.get_u8(),
            rsvd_ulp2: buf.get_u32(),
            qn: buf.get_u32(),
            msn: buf.get_u32(),
            mo: buf.get_u32(),
        })
    }
}

/// Calls `f(parts, offset, last)` once per segment of at most `mulpdu` bytes,
/// gathering across element boundaries. Returns the segment count.
fn for_each_segment<F>(sg_list: &[&[u8]], mulpdu: usize, mut f: F) -> Result<usize>
where
    F: FnMut(&[&[u8]], usize, bool) -> Result<()>,
{
    let total: usize = sg_list.iter().map(|s| s.len()).sum();
    let count = if total == 0 {
        1
    } else {
        total.div_ceil(mulpdu)
    };

    let mut elems = sg_list.iter().copied().filter(|s| !s.is_empty());
    let mut current: &[u8] = &[];
    let mut offset = 0;
    let mut parts: Vec<&[u8]> = Vec::with_capacity(sg_list.len());
    for seg in 0..count {
        parts.clear();
        let mut need = (total - offset).min(mulpdu);
        let seg_len = need;
        while need > 0 {
            if current.is_empty() {
                current = match elems.next() {
                    Some(next) => next,
                    None => break,
                };
            }
            let take = current.len().min(need);
            let (head, tail) = current.split_at(take);
            parts.push(head);
            current = tail;
            need -= take;
        }
        f(&parts, offset, seg + 1 == count)?;
        offset += seg_len;
    }
    Ok(count)
}

/// Outbound half of a DDP connection.
#[derive(Debug)]
pub struct DdpSender<W> {
    writer: W,
    mulpdu: usize,
}

impl<W: Write> DdpSender<W> {
    /// Wraps `writer`; segments carry at most `mulpdu` payload bytes.
    pub fn new(writer: W, mulpdu: usize) -> Self {
        Self {
            writer,
            mulpdu: mulpdu.max(1),
        }
    }

    /// Payload bound per segment.
    pub fn mulpdu(&self) -> usize {
        self.mulpdu
    }

    /// Underlying writer.
    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    /// Unwraps the writer.
    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Sends a tagged message starting at `meta.to`. Returns the segment count.
    pub fn send_tagged(&mut self, meta: TaggedMeta, sg_list: &[&[u8]]) -> Result<usize> {
        let writer = &mut self.writer;
        let count = for_each_segment(sg_list, self.mulpdu, |parts, offset, last| {
            let mut hdr = [0u8; DDP_CTRL_SIZE + DDP_TAGGED_HDR_SIZE];
            let mut cursor = &mut hdr[..];
            cursor.put_u8(DdpControl { tagged: true, last }.to_byte());
            TaggedMeta {
                to: meta.to.wrapping_add(offset as u64),
                ..meta
            }
            .encode(&mut cursor);
            let mut frame: Vec<&[u8]> = Vec::with_capacity(parts.len() + 1);
            frame.push(&hdr);
            frame.extend_from_slice(parts);
            mpa_send(&mut *writer, &frame)?;
            trace!(stag = meta.stag, offset, last, "sent tagged segment");
            Ok(())
        })?;
        debug!(stag = meta.stag, to = meta.to, segments = count, "sent tagged message");
        Ok(count)
    }

    /// Sends an untagged message; `meta.mo` is ignored and restarts at 0.
    pub fn send_untagged(&mut self, meta: UntaggedMeta, sg_list: &[&[u8]]) -> Result<usize> {
        let writer = &mut self.writer;
        let count = for_each_segment(sg_list, self.mulpdu, |parts, offset, last| {
            let mo = u32::try_from(offset).map_err(|_| IwarpError::PayloadTooLarge {
                size: offset,
                max_size: u32::MAX as usize,
            })?;
            let mut hdr = [0u8; DDP_CTRL_SIZE + DDP_UNTAGGED_HDR_SIZE];
            let mut cursor = &mut hdr[..];
            cursor.put_u8(DdpControl { tagged: false, last }.to_byte());
            UntaggedMeta { mo, ..meta }.encode(&mut cursor);
            let mut frame: Vec<&[u8]> = Vec::with_capacity(parts.len() + 1);
            frame.push(&hdr);
            frame.extend_from_slice(parts);
            mpa_send(&mut *writer, &frame)?;
            trace!(qn = meta.qn, msn = meta.msn, mo, last, "sent untagged segment");
            Ok(())
        })?;
        debug!(qn = meta.qn, msn = meta.msn, segments = count, "sent untagged message");
        Ok(count)
    }
}

/// Per-stream placement state: tag registry and untagged queues.
#[derive(Debug)]
pub struct DdpContext {
    pd: ProtectionDomain,
    registry: TagRegistry,
    queues: [UntaggedQueue; DDP_NUM_QUEUES],
}

impl DdpContext {
    /// Empty context for `pd`.
    pub fn new(pd: ProtectionDomain) -> Self {
        Self {
            pd,
            registry: TagRegistry::new(pd),
            queues: std::array::from_fn(|qn| UntaggedQueue::new(qn as u32)),
        }
    }

    /// Protection domain of the stream.
    pub fn pd(&self) -> ProtectionDomain {
        self.pd
    }

    /// Tag registry.
    pub fn registry(&self) -> &TagRegistry {
        &self.registry
    }

    /// Untagged queue `qn`.
    pub fn queue(&self, qn: u32) -> Result<&UntaggedQueue> {
        self.queues
            .get(qn as usize)
            .ok_or(IwarpError::InvalidQueueNumber(qn))
    }

    /// Appends `buffers` in order to queue `qn`.
    pub fn post_recv<I>(&self, qn: u32, buffers: I) -> Result<()>
    where
        I: IntoIterator<Item = UntaggedBuffer>,
    {
        let queue = self.queue(qn)?;
        for buffer in buffers {
            if let Some(other) = buffer.domains().find(|pd| *pd != self.pd) {
                return Err(IwarpError::ProtectionDomainMismatch {
                    expected: self.pd.id(),
                    got: other.id(),
                });
            }
            trace!(qn, capacity = buffer.capacity(), "posted untagged buffer");
            queue.post(buffer);
        }
        Ok(())
    }

    /// Registers a region for tagged placement.
    pub fn register_tagged_buffer(&self, region: Arc<MemoryRegion>) -> Result<u32> {
        self.registry.register(region)
    }

    /// Invalidates a tag.
    pub fn deregister_tagged_buffer(&self, stag: u32) -> Result<Arc<MemoryRegion>> {
        self.registry.deregister(stag)
    }
}

/// A fully reassembled message.
#[derive(Debug)]
pub enum DdpMessage {
    /// Placed into a registered region.
    Tagged {
        /// Upper-layer octet of the first segment.
        rsvd_ulp: u8,
        /// Target tag.
        stag: u32,
        /// Tagged Offset of the first byte.
        to: u64,
        /// Payload bytes placed.
        len: usize,
        /// Segments received.
        segments: usize,
    },
    /// Placed into the oldest buffer posted on `qn`.
    Untagged {
        /// Upper-layer octet.
        rsvd_ulp1: u8,
        /// Upper-layer word.
        rsvd_ulp2: u32,
        /// Queue number.
        qn: u32,
        /// Message sequence number.
        msn: u32,
        /// Payload bytes placed.
        len: usize,
        /// Segments received.
        segments: usize,
        /// The consumed buffer, now holding the message.
        buffer: UntaggedBuffer,
    },
}

impl DdpMessage {
    /// Payload length.
    pub fn len(&self) -> usize {
        match self {
            DdpMessage::Tagged { len, .. } | DdpMessage::Untagged { len, .. } => *len,
        }
    }

    /// True for an empty message.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Segments the message arrived in.
    pub fn segments(&self) -> usize {
        match self {
            DdpMessage::Tagged { segments, .. } | DdpMessage::Untagged { segments, .. } => {
                *segments
            }
        }
    }
}

enum SegmentHeader {
    Tagged(TaggedMeta),
    Untagged(UntaggedMeta),
}

/// Admission check run before every tagged segment is placed.
///
/// Returns the access right the target region must grant, or an error to
/// refuse the segment before any byte of it is written.
pub trait TaggedPolicy {
    /// Checks one segment of `len` payload bytes described by `meta`.
    fn admit(&self, meta: &TaggedMeta, len: usize) -> Result<AccessFlags>;
}

impl<F> TaggedPolicy for F
where
    F: Fn(&TaggedMeta, usize) -> Result<AccessFlags>,
{
    fn admit(&self, meta: &TaggedMeta, len: usize) -> Result<AccessFlags> {
        self(meta, len)
    }
}

fn remote_write(_meta: &TaggedMeta, _len: usize) -> Result<AccessFlags> {
    Ok(AccessFlags::REMOTE_WRITE)
}

/// Inbound half of a DDP connection.
pub struct DdpReceiver<R> {
    reader: R,
    ctx: Arc<DdpContext>,
    policy: Box<dyn TaggedPolicy + Send>,
}

impl<R: Read> DdpReceiver<R> {
    /// Reads from `reader`, placing into buffers owned by `ctx`.
    pub fn new(reader: R, ctx: Arc<DdpContext>) -> Self {
        Self {
            reader,
            ctx,
            policy: Box::new(remote_write),
        }
    }

    /// Replaces the tagged admission check. The default admits every segment
    /// and requires `REMOTE_WRITE` on the target region.
    pub fn with_policy(mut self, policy: impl TaggedPolicy + Send + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    /// Placement context.
    pub fn context(&self) -> &Arc<DdpContext> {
        &self.ctx
    }

    /// Blocks until one whole message has been placed.
    pub fn recv(&mut self) -> Result<DdpMessage> {
        let (state, control, header) = self.read_header()?;
        match header {
            SegmentHeader::Tagged(meta) => self.recv_tagged(state, control, meta),
            SegmentHeader::Untagged(meta) => self.recv_untagged(state, control, meta),
        }
    }

    fn read_header(&mut self) -> Result<(MpaRecvState, DdpControl, SegmentHeader)> {
        let mut state = MpaRecvState::new();
        let mut ctrl = [0u8; DDP_CTRL_SIZE];
        mpa_recv(&mut self.reader, &mut state, &mut ctrl)?;
        let control = DdpControl::from_byte(ctrl[0])?;

        let hdr_len = if control.tagged {
            DDP_TAGGED_HDR_SIZE
        } else {
            DDP_UNTAGGED_HDR_SIZE
        };
        let ulpdu_len = state.ulpdu_len().unwrap_or(0);
        if ulpdu_len < DDP_CTRL_SIZE + hdr_len {
            return Err(IwarpError::frame(format!(
                "MPA frame of {ulpdu_len} bytes cannot hold a DDP header"
            )));
        }

        let mut raw = [0u8; DDP_UNTAGGED_HDR_SIZE];
        mpa_recv(&mut self.reader, &mut state, &mut raw[..hdr_len])?;
        let header = if control.tagged {
            SegmentHeader::Tagged(TaggedMeta::decode(&raw[..hdr_len])?)
        } else {
            SegmentHeader::Untagged(UntaggedMeta::decode(&raw[..hdr_len])?)
        };
        Ok((state, control, header))
    }

    fn recv_tagged(
        &mut self,
        mut state: MpaRecvState,
        mut control: DdpControl,
        first: TaggedMeta,
    ) -> Result<DdpMessage> {
        let mut meta = first;
        let mut len = 0;
        let mut segments = 0;
        loop {
            if meta.stag != first.stag {
                return Err(IwarpError::frame(format!(
                    "tagged segment for stag 0x{:08X} inside message for 0x{:08X}",
                    meta.stag, first.stag
                )));
            }
            let seg_len = state.remaining();
            let required = self.policy.admit(&meta, seg_len)?;
            // Re-resolved per segment so an invalidation between segments is seen.
            let (region, offset) =
                self.ctx
                    .registry
                    .resolve_range(meta.stag, required, meta.to, seg_len)?;
            {
                let mut bytes = region.write();
                mpa_recv(
                    &mut self.reader,
                    &mut state,
                    &mut bytes[offset..offset + seg_len],
                )?;
            }
            trace!(stag = meta.stag, to = meta.to, seg_len, last = control.last, "placed tagged segment");
            len += seg_len;
            segments += 1;
            if control.last {
                break;
            }
            let (next_state, next_control, header) = self.read_header()?;
            meta = match header {
                SegmentHeader::Tagged(m) => m,
                SegmentHeader::Untagged(_) => {
                    return Err(IwarpError::frame("untagged segment inside tagged message"))
                }
            };
            state = next_state;
            control = next_control;
        }
        debug!(stag = first.stag, to = first.to, len, segments, "received tagged message");
        Ok(DdpMessage::Tagged {
            rsvd_ulp: first.rsvd_ulp,
            stag: first.stag,
            to: first.to,
            len,
            segments,
        })
    }

    fn recv_untagged(
        &mut self,
        mut state: MpaRecvState,
        mut control: DdpControl,
        first: UntaggedMeta,
    ) -> Result<DdpMessage> {
        let ctx = Arc::clone(&self.ctx);
        let queue = ctx.queue(first.qn)?;
        queue.check_msn(first.msn)?;
        let buffer = queue
            .pop()
            .ok_or(IwarpError::NoUntaggedBuffer { qn: first.qn })?;

        let mut meta = first;
        let mut len = 0;
        let mut segments = 0;
        loop {
            if meta.qn != first.qn || meta.msn != first.msn {
                return Err(IwarpError::frame(format!(
                    "segment qn {} msn {} inside message qn {} msn {}",
                    meta.qn, meta.msn, first.qn, first.msn
                )));
            }
            let seg_len = state.remaining();
            let mo = meta.mo as usize;
            let end = mo + seg_len;
            if end > buffer.capacity() {
                return Err(IwarpError::MessageTooLong {
                    qn: first.qn,
                    len: end,
                    capacity: buffer.capacity(),
                });
            }
            for (region, offset, n) in buffer.map_range(mo, seg_len) {
                let mut bytes = region.write();
                mpa_recv(&mut self.reader, &mut state, &mut bytes[offset..offset + n])?;
            }
            trace!(qn = meta.qn, msn = meta.msn, mo, seg_len, last = control.last, "placed untagged segment");
            len += seg_len;
            segments += 1;
            if control.last {
                break;
            }
            let (next_state, next_control, header) = self.read_header()?;
            meta = match header {
                SegmentHeader::Untagged(m) => m,
                SegmentHeader::Tagged(_) => {
                    return Err(IwarpError::frame("tagged segment inside untagged message"))
                }
            };
            state = next_state;
            control = next_control;
        }
        queue.advance(first.msn);
        debug!(qn = first.qn, msn = first.msn, len, segments, "received untagged message");
        Ok(DdpMessage::Untagged {
            rsvd_ulp1: first.rsvd_ulp1,
            rsvd_ulp2: first.rsvd_ulp2,
            qn: first.qn,
            msn: first.msn,
            len,
            segments,
            buffer,
        })
    }
}

impl<R> std::fmt::Debug for DdpReceiver<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DdpReceiver")
            .field("pd", &self.ctx.pd)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn ctx() -> Arc<DdpContext> {
        Arc::new(DdpContext::new(ProtectionDomain::new()))
    }

    fn wire_tagged(mulpdu: usize, meta: TaggedMeta, payload: &[u8]) -> Vec<u8> {
        let mut tx = DdpSender::new(Vec::new(), mulpdu);
        tx.send_tagged(meta, &[payload]).unwrap();
        tx.into_inner()
    }

    fn untagged(qn: u32, msn: u32) -> UntaggedMeta {
        UntaggedMeta {
            rsvd_ulp1: 0,
            rsvd_ulp2: 0,
            qn,
            msn,
            mo: 0,
        }
    }

    #[test]
    fn test_control_octet() {
        let c = DdpControl {
            tagged: true,
            last: false,
        };
        assert_eq!(c.to_byte(), 0x81);
        assert_eq!(DdpControl::from_byte(0xC1).unwrap(), DdpControl { tagged: true, last: true });
        assert!(matches!(
            DdpControl::from_byte(0x40),
            Err(IwarpError::UnsupportedVersion { layer: "DDP", got: 0 })
        ));
    }

    #[test]
    fn test_header_encoding() {
        let mut buf = Vec::new();
        TaggedMeta {
            rsvd_ulp: 0x41,
            stag: 0x0102_0304,
            to: 0x10,
        }
        .encode(&mut buf);
        assert_eq!(buf.len(), DDP_TAGGED_HDR_SIZE);
        assert_eq!(&buf[..5], &[0x41, 1, 2, 3, 4]);

        let mut buf = Vec::new();
        let meta = UntaggedMeta {
            rsvd_ulp1: 0x43,
            rsvd_ulp2: 9,
            qn: 1,
            msn: 2,
            mo: 3,
        };
        meta.encode(&mut buf);
        assert_eq!(buf.len(), DDP_UNTAGGED_HDR_SIZE);
        assert_eq!(UntaggedMeta::decode(&buf).unwrap(), meta);
        assert!(UntaggedMeta::decode(&buf[..10]).is_err());
    }

    #[test]
    fn test_segmentation_gathers_across_elements() {
        let mut seen = Vec::new();
        let count = for_each_segment(&[&b"abc"[..], &b""[..], &b"defgh"[..]], 3, |parts, offset, last| {
            seen.push((parts.concat(), offset, last));
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 3);
        assert_eq!(seen[0], (b"abc".to_vec(), 0, false));
        assert_eq!(seen[1], (b"def".to_vec(), 3, false));
        assert_eq!(seen[2], (b"gh".to_vec(), 6, true));
    }

    #[test]
    fn test_empty_message_is_one_segment() {
        let count = for_each_segment(&[], 16, |parts, _, last| {
            assert!(parts.is_empty());
            assert!(last);
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_tagged_multi_segment_placement() {
        let ctx = ctx();
        let mr = MemoryRegion::new(ctx.pd(), 32, AccessFlags::ALL);
        let stag = ctx.register_tagged_buffer(Arc::clone(&mr)).unwrap();
        let payload: Vec<u8> = (0..20).collect();
        let wire = wire_tagged(
            8,
            TaggedMeta {
                rsvd_ulp: 0,
                stag,
                to: mr.addr() + 4,
            },
            &payload,
        );

        let mut rx = DdpReceiver::new(Cursor::new(wire), Arc::clone(&ctx));
        let msg = rx.recv().unwrap();
        assert_eq!(msg.len(), 20);
        assert_eq!(msg.segments(), 3);
        assert_eq!(&mr.to_vec()[4..24], payload.as_slice());
    }

    #[test]
    fn test_unknown_stag_leaves_memory_untouched() {
        let ctx = ctx();
        let mr = MemoryRegion::new(ctx.pd(), 8, AccessFlags::ALL);
        let wire = wire_tagged(
            64,
            TaggedMeta {
                rsvd_ulp: 0,
                stag: mr.stag(),
                to: mr.addr(),
            },
            &[0xFF; 8],
        );
        let mut rx = DdpReceiver::new(Cursor::new(wire), ctx);
        assert!(matches!(rx.recv(), Err(IwarpError::InvalidStag { .. })));
        assert_eq!(mr.to_vec(), vec![0u8; 8]);
    }

    #[test]
    fn test_tagged_offset_out_of_range() {
        let ctx = ctx();
        let mr = MemoryRegion::new(ctx.pd(), 8, AccessFlags::ALL);
        let stag = ctx.register_tagged_buffer(Arc::clone(&mr)).unwrap();
        let wire = wire_tagged(
            64,
            TaggedMeta {
                rsvd_ulp: 0,
                stag,
                to: mr.addr() + 4,
            },
            &[1; 8],
        );
        let mut rx = DdpReceiver::new(Cursor::new(wire), ctx);
        assert!(matches!(
            rx.recv(),
            Err(IwarpError::TaggedOffsetOutOfRange { .. })
        ));
        assert_eq!(mr.to_vec(), vec![0u8; 8]);
    }

    #[test]
    fn test_tagged_access_policy_enforced() {
        let ctx = ctx();
        let mr = MemoryRegion::new(ctx.pd(), 8, AccessFlags::LOCAL_WRITE);
        let stag = ctx.register_tagged_buffer(Arc::clone(&mr)).unwrap();
        let meta = TaggedMeta {
            rsvd_ulp: 2,
            stag,
            to: mr.addr(),
        };

        let wire = wire_tagged(64, meta, &[7; 8]);
        let mut rx = DdpReceiver::new(Cursor::new(wire.clone()), Arc::clone(&ctx));
        assert!(matches!(rx.recv(), Err(IwarpError::AccessDenied { .. })));

        let mut rx = DdpReceiver::new(Cursor::new(wire), ctx)
            .with_policy(|_: &TaggedMeta, _: usize| -> Result<AccessFlags> {
                Ok(AccessFlags::LOCAL_WRITE)
            });
        rx.recv().unwrap();
        assert_eq!(mr.to_vec(), vec![7u8; 8]);
    }

    #[test]
    fn test_policy_refusal_leaves_region_untouched() {
        let ctx = ctx();
        let mr = MemoryRegion::new(ctx.pd(), 32, AccessFlags::ALL);
        let stag = ctx.register_tagged_buffer(Arc::clone(&mr)).unwrap();
        let base = mr.addr();
        let meta = TaggedMeta {
            rsvd_ulp: 0,
            stag,
            to: base,
        };

        // Only the first 8 bytes may be written; the second segment is refused.
        let wire = wire_tagged(8, meta, &[9; 16]);
        let mut rx = DdpReceiver::new(Cursor::new(wire), ctx).with_policy(
            move |meta: &TaggedMeta, len: usize| -> Result<AccessFlags> {
                if meta.to + len as u64 <= base + 8 {
                    Ok(AccessFlags::LOCAL_WRITE)
                } else {
                    Err(IwarpError::frame("outside the allowed window"))
                }
            },
        );
        assert!(matches!(rx.recv(), Err(IwarpError::InvalidFrame { .. })));
        let placed = mr.to_vec();
        assert_eq!(&placed[..8], &[9u8; 8][..]);
        assert!(placed[8..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_untagged_placement_into_gather_buffer() {
        let ctx = ctx();
        let a = MemoryRegion::new(ctx.pd(), 5, AccessFlags::ALL);
        let b = MemoryRegion::new(ctx.pd(), 16, AccessFlags::ALL);
        let mut buffer = UntaggedBuffer::new();
        buffer.push(Arc::clone(&a), 0, 5).unwrap();
        buffer.push(Arc::clone(&b), 0, 16).unwrap();
        ctx.post_recv(0, [buffer]).unwrap();

        let payload: Vec<u8> = (100..118).collect();
        let mut tx = DdpSender::new(Vec::new(), 4);
        let meta = UntaggedMeta {
            rsvd_ulp2: 0xAB,
            ..untagged(0, 1)
        };
        assert_eq!(tx.send_untagged(meta, &[&payload[..]]).unwrap(), 5);

        let mut rx = DdpReceiver::new(Cursor::new(tx.into_inner()), Arc::clone(&ctx));
        match rx.recv().unwrap() {
            DdpMessage::Untagged {
                qn,
                msn,
                len,
                rsvd_ulp2,
                buffer,
                ..
            } => {
                assert_eq!((qn, msn, len, rsvd_ulp2), (0, 1, 18, 0xAB));
                assert_eq!(buffer.copy_out(len), payload);
            }
            other => panic!("unexpected message {other:?}"),
        }
        assert_eq!(a.to_vec(), payload[..5].to_vec());
        assert_eq!(&b.to_vec()[..13], &payload[5..]);
        assert_eq!(ctx.queue(0).unwrap().expected_msn(), 2);
    }

    #[test]
    fn test_untagged_errors() {
        let ctx = ctx();
        let mut tx = DdpSender::new(Vec::new(), 64);
        tx.send_untagged(untagged(0, 1), &[&b"hello"[..]]).unwrap();
        let wire = tx.into_inner();

        // Nothing posted.
        let mut rx = DdpReceiver::new(Cursor::new(wire.clone()), Arc::clone(&ctx));
        assert!(matches!(
            rx.recv(),
            Err(IwarpError::NoUntaggedBuffer { qn: 0 })
        ));

        // Posted buffer too small.
        let small = MemoryRegion::new(ctx.pd(), 2, AccessFlags::ALL);
        ctx.post_recv(0, [UntaggedBuffer::whole(small).unwrap()]).unwrap();
        let mut rx = DdpReceiver::new(Cursor::new(wire), Arc::clone(&ctx));
        assert!(matches!(
            rx.recv(),
            Err(IwarpError::MessageTooLong { qn: 0, .. })
        ));

        // Queue number out of range.
        let mut tx = DdpSender::new(Vec::new(), 64);
        tx.send_untagged(untagged(7, 1), &[&b"x"[..]]).unwrap();
        let mut rx = DdpReceiver::new(Cursor::new(tx.into_inner()), ctx);
        assert!(matches!(rx.recv(), Err(IwarpError::InvalidQueueNumber(7))));
    }

    #[test]
    fn test_msn_regression_rejected() {
        let ctx = ctx();
        for _ in 0..2 {
            let mr = MemoryRegion::new(ctx.pd(), 8, AccessFlags::ALL);
            ctx.post_recv(1, [UntaggedBuffer::whole(mr).unwrap()]).unwrap();
        }
        let mut tx = DdpSender::new(Vec::new(), 64);
        tx.send_untagged(untagged(1, 1), &[&b"one"[..]]).unwrap();
        tx.send_untagged(untagged(1, 1), &[&b"dup"[..]]).unwrap();

        let mut rx = DdpReceiver::new(Cursor::new(tx.into_inner()), Arc::clone(&ctx));
        rx.recv().unwrap();
        assert!(matches!(
            rx.recv(),
            Err(IwarpError::MsnRegression {
                qn: 1,
                msn: 1,
                expected: 2
            })
        ));
        assert_eq!(ctx.queue(1).unwrap().len(), 1);
    }

    #[test]
    fn test_post_recv_rejects_foreign_domain() {
        let ctx = ctx();
        let foreign = MemoryRegion::new(ProtectionDomain::new(), 8, AccessFlags::ALL);
        let buffer = UntaggedBuffer::whole(foreign).unwrap();
        assert!(matches!(
            ctx.post_recv(0, [buffer]),
            Err(IwarpError::ProtectionDomainMismatch { .. })
        ));
        assert!(ctx.post_recv(3, []).is_err());
    }

    #[test]
    fn test_short_frame_rejected() {
        let mut wire = Vec::new();
        let frame = [DdpControl { tagged: true, last: true }.to_byte(), 0, 0];
        mpa_send(&mut wire, &[&frame[..]]).unwrap();
        let mut rx = DdpReceiver::new(Cursor::new(wire), ctx());
        assert!(matches!(rx.recv(), Err(IwarpError::InvalidFrame { .. })));
    }
}
