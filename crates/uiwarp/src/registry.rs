//! Memory regions, the per-stream tag registry and untagged buffer queues.
//!
//! A region's steering tag is the low 32 bits of its base address, and a
//! Tagged Offset is an absolute address inside `[base, base + len)`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam::queue::SegQueue;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{IwarpError, Result};

static PD_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Access rights attached to a memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessFlags(u32);

impl AccessFlags {
    /// Local gather source.
    pub const LOCAL_READ: Self = Self(1);
    /// Local scatter target (receive buffers, Read sinks).
    pub const LOCAL_WRITE: Self = Self(2);
    /// Source of a peer's RDMA Read.
    pub const REMOTE_READ: Self = Self(4);
    /// Target of a peer's RDMA Write.
    pub const REMOTE_WRITE: Self = Self(8);
    /// Every right.
    pub const ALL: Self = Self(0xF);

    /// True if every bit of `other` is set.
    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// No rights.
    pub fn empty() -> Self {
        Self(0)
    }

    /// Raw bits.
    pub fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for AccessFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Default for AccessFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Opaque protection domain id. Regions and streams are scoped to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtectionDomain(u32);

impl ProtectionDomain {
    /// Allocates a fresh domain id.
    pub fn new() -> Self {
        Self(PD_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Wraps a caller-supplied id.
    pub fn from_id(id: u32) -> Self {
        Self(id)
    }

    /// The numeric id.
    pub fn id(self) -> u32 {
        self.0
    }
}

impl Default for ProtectionDomain {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered buffer. Its bytes never move, so its address is stable.
#[derive(Debug)]
pub struct MemoryRegion {
    pd: ProtectionDomain,
    access: AccessFlags,
    base: u64,
    len: usize,
    buf: RwLock<Box<[u8]>>,
}

impl MemoryRegion {
    /// Zero-filled region of `len` bytes.
    pub fn new(pd: ProtectionDomain, len: usize, access: AccessFlags) -> Arc<Self> {
        Self::from_vec(pd, vec![0u8; len], access)
    }

    /// Region taking ownership of `data`.
    pub fn from_vec(pd: ProtectionDomain, data: Vec<u8>, access: AccessFlags) -> Arc<Self> {
        let buf = data.into_boxed_slice();
        let base = buf.as_ptr() as u64;
        let len = buf.len();
        Arc::new(Self {
            pd,
            access,
            base,
            len,
            buf: RwLock::new(buf),
        })
    }

    /// Steering tag derived from the base address.
    pub fn stag(&self) -> u32 {
        self.base as u32
    }

    /// Base address; the Tagged Offset of the first byte.
    pub fn addr(&self) -> u64 {
        self.base
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-length region.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Owning protection domain.
    pub fn pd(&self) -> ProtectionDomain {
        self.pd
    }

    /// Granted access rights.
    pub fn access(&self) -> AccessFlags {
        self.access
    }

    /// Shared view of the bytes. Re-entrant for the same thread.
    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.buf.read_recursive()
    }

    /// Exclusive view of the bytes.
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.buf.write()
    }

    /// Copy of the whole region.
    pub fn to_vec(&self) -> Vec<u8> {
        self.read().to_vec()
    }

    /// True if `[addr, addr + len)` lies inside the region.
    pub fn contains_range(&self, addr: u64, len: usize) -> bool {
        let limit = self.base + self.len as u64;
        match addr.checked_add(len as u64) {
            Some(end) => addr >= self.base && addr < limit && end <= limit,
            None => false,
        }
    }

    /// Validates an access and returns the byte offset of `addr` in the region.
    pub fn check(
        &self,
        pd: ProtectionDomain,
        required: AccessFlags,
        addr: u64,
        len: usize,
    ) -> Result<usize> {
        if self.pd != pd {
            return Err(IwarpError::ProtectionDomainMismatch {
                expected: pd.id(),
                got: self.pd.id(),
            });
        }
        if !self.access.contains(required) {
            return Err(IwarpError::AccessDenied {
                stag: self.stag(),
                required,
            });
        }
        if !self.contains_range(addr, len) {
            return Err(IwarpError::TaggedOffsetOutOfRange {
                stag: self.stag(),
                offset: addr,
                len,
            });
        }
        Ok((addr - self.base) as usize)
    }
}

/// STag to region table owned by one stream.
#[derive(Debug)]
pub struct TagRegistry {
    pd: ProtectionDomain,
    regions: DashMap<u32, Arc<MemoryRegion>>,
}

impl TagRegistry {
    /// Empty registry for regions of `pd`.
    pub fn new(pd: ProtectionDomain) -> Self {
        Self {
            pd,
            regions: DashMap::new(),
        }
    }

    /// Makes `region` reachable by its tag.
    pub fn register(&self, region: Arc<MemoryRegion>) -> Result<u32> {
        if region.is_empty() {
            return Err(IwarpError::EmptyRegion);
        }
        if region.pd() != self.pd {
            return Err(IwarpError::ProtectionDomainMismatch {
                expected: self.pd.id(),
                got: region.pd().id(),
            });
        }
        let stag = region.stag();
        match self.regions.entry(stag) {
            Entry::Occupied(_) => Err(IwarpError::StagInUse { stag }),
            Entry::Vacant(slot) => {
                debug!(stag, addr = region.addr(), len = region.len(), "registered tagged buffer");
                slot.insert(region);
                Ok(stag)
            }
        }
    }

    /// Invalidates `stag`. In-flight placements keep their reference.
    pub fn deregister(&self, stag: u32) -> Result<Arc<MemoryRegion>> {
        let (_, region) = self
            .regions
            .remove(&stag)
            .ok_or(IwarpError::InvalidStag { stag })?;
        debug!(stag, "deregistered tagged buffer");
        Ok(region)
    }

    /// Looks up a live tag.
    pub fn resolve(&self, stag: u32) -> Result<Arc<MemoryRegion>> {
        self.regions
            .get(&stag)
            .map(|r| Arc::clone(r.value()))
            .ok_or(IwarpError::InvalidStag { stag })
    }

    /// Resolves `stag` and validates the access in one step.
    pub fn resolve_range(
        &self,
        stag: u32,
        required: AccessFlags,
        addr: u64,
        len: usize,
    ) -> Result<(Arc<MemoryRegion>, usize)> {
        let region = self.resolve(stag)?;
        let offset = region.check(self.pd, required, addr, len)?;
        Ok((region, offset))
    }

    /// True if `stag` is registered.
    pub fn contains(&self, stag: u32) -> bool {
        self.regions.contains_key(&stag)
    }

    /// Number of live tags.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

#[derive(Debug, Clone)]
struct BufferPart {
    region: Arc<MemoryRegion>,
    offset: usize,
    len: usize,
}

/// Receive buffer for one untagged message, possibly spanning several regions.
#[derive(Debug, Clone, Default)]
pub struct UntaggedBuffer {
    parts: Vec<BufferPart>,
    capacity: usize,
}

impl UntaggedBuffer {
    /// Empty buffer; add parts with [`UntaggedBuffer::push`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer over a single byte range.
    pub fn single(region: Arc<MemoryRegion>, offset: usize, len: usize) -> Result<Self> {
        let mut buf = Self::new();
        buf.push(region, offset, len)?;
        Ok(buf)
    }

    /// Buffer covering all of `region`.
    pub fn whole(region: Arc<MemoryRegion>) -> Result<Self> {
        let len = region.len();
        Self::single(region, 0, len)
    }

    /// Appends `len` bytes of `region` starting at `offset`.
    pub fn push(&mut self, region: Arc<MemoryRegion>, offset: usize, len: usize) -> Result<()> {
        if !region.access().contains(AccessFlags::LOCAL_WRITE) {
            return Err(IwarpError::AccessDenied {
                stag: region.stag(),
                required: AccessFlags::LOCAL_WRITE,
            });
        }
        if offset.checked_add(len).map_or(true, |end| end > region.len()) {
            return Err(IwarpError::TaggedOffsetOutOfRange {
                stag: region.stag(),
                offset: region.addr() + offset as u64,
                len,
            });
        }
        if len > 0 {
            self.parts.push(BufferPart {
                region,
                offset,
                len,
            });
            self.capacity += len;
        }
        Ok(())
    }

    /// Total bytes the buffer can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Protection domains of the regions behind the buffer.
    pub(crate) fn domains(&self) -> impl Iterator<Item = ProtectionDomain> + '_ {
        self.parts.iter().map(|p| p.region.pd())
    }

    /// Maps message bytes `[mo, mo + len)` onto `(region, region offset, len)` chunks.
    pub(crate) fn map_range(&self, mo: usize, len: usize) -> Vec<(&Arc<MemoryRegion>, usize, usize)> {
        let mut chunks = Vec::new();
        let mut skip = mo;
        let mut left = len;
        for part in &self.parts {
            if left == 0 {
                break;
            }
            if skip >= part.len {
                skip -= part.len;
                continue;
            }
            let take = (part.len - skip).min(left);
            chunks.push((&part.region, part.offset + skip, take));
            skip = 0;
            left -= take;
        }
        chunks
    }

    /// Copies out the first `len` message bytes.
    pub fn copy_out(&self, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len.min(self.capacity));
        for (region, offset, n) in self.map_range(0, len) {
            out.extend_from_slice(&region.read()[offset..offset + n]);
        }
        out
    }
}

/// FIFO of posted untagged buffers for one queue number.
#[derive(Debug)]
pub struct UntaggedQueue {
    qn: u32,
    buffers: SegQueue<UntaggedBuffer>,
    expected_msn: AtomicU32,
}

impl UntaggedQueue {
    /// Empty queue expecting MSN 1.
    pub fn new(qn: u32) -> Self {
        Self {
            qn,
            buffers: SegQueue::new(),
            expected_msn: AtomicU32::new(1),
        }
    }

    /// Queue number.
    pub fn qn(&self) -> u32 {
        self.qn
    }

    /// Appends a buffer.
    pub fn post(&self, buffer: UntaggedBuffer) {
        self.buffers.push(buffer);
    }

    /// Oldest posted buffer.
    pub fn pop(&self) -> Option<UntaggedBuffer> {
        self.buffers.pop()
    }

    /// Buffers currently posted.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// True if nothing is posted.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Lowest MSN the next message may carry.
    pub fn expected_msn(&self) -> u32 {
        self.expected_msn.load(Ordering::Acquire)
    }

    /// Rejects a sequence number below the expected one.
    pub fn check_msn(&self, msn: u32) -> Result<()> {
        let expected = self.expected_msn();
        if msn < expected {
            return Err(IwarpError::MsnRegression {
                qn: self.qn,
                msn,
                expected,
            });
        }
        Ok(())
    }

    /// Records that message `msn` has been placed.
    pub fn advance(&self, msn: u32) {
        self.expected_msn
            .store(msn.wrapping_add(1), Ordering::Release);
    }
}
