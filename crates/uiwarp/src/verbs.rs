//! Verbs-style work requests, completions and the bounded queues that carry them.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender, TryRecvError, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{IwarpError, Result};
use crate::registry::{MemoryRegion, ProtectionDomain};

static CQ_COUNTER: AtomicU32 = AtomicU32::new(1);
static WQ_COUNTER: AtomicU32 = AtomicU32::new(1);

/// One local buffer of a work request, named by the lkey of a registered region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScatterGatherElement {
    /// Start address inside the region.
    pub addr: u64,
    /// Bytes.
    pub length: u32,
    /// STag of the local region.
    pub lkey: u32,
}

impl ScatterGatherElement {
    /// Element covering all of `region`.
    pub fn from_region(region: &MemoryRegion) -> Self {
        Self {
            addr: region.addr(),
            length: region.len() as u32,
            lkey: region.stag(),
        }
    }
}

/// Operation of a Send-Queue work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WrOpcode {
    /// Plain Send.
    Send,
    /// Send invalidating `invalidate_rkey` on the peer.
    SendInvalidate,
    /// Solicited Send.
    SendSolicited,
    /// Solicited Send with invalidate.
    SendSolicitedInvalidate,
    /// RDMA Write to `remote`.
    RdmaWrite,
    /// RDMA Read from `remote`.
    RdmaRead,
    /// Terminate the connection.
    Terminate,
}

impl WrOpcode {
    /// Completion opcode reported for this request.
    pub fn completion_opcode(self) -> WcOpcode {
        match self {
            WrOpcode::Send => WcOpcode::Send,
            WrOpcode::SendInvalidate => WcOpcode::SendInvalidate,
            WrOpcode::SendSolicited => WcOpcode::SendSolicited,
            WrOpcode::SendSolicitedInvalidate => WcOpcode::SendSolicitedInvalidate,
            WrOpcode::RdmaWrite => WcOpcode::RdmaWrite,
            WrOpcode::RdmaRead => WcOpcode::RdmaRead,
            WrOpcode::Terminate => WcOpcode::Terminate,
        }
    }
}

/// Peer buffer targeted by a Write or Read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAddr {
    /// Peer STag.
    pub rkey: u32,
    /// Peer address (Tagged Offset).
    pub addr: u64,
}

/// Work request for the Send Queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendWorkRequest {
    /// Caller-chosen id, echoed in the completion.
    pub id: u64,
    /// Operation.
    pub opcode: WrOpcode,
    /// Local buffers; the sink for a Read.
    pub sg_list: Vec<ScatterGatherElement>,
    /// Peer buffer for Write and Read.
    pub remote: Option<RemoteAddr>,
    /// Peer STag to invalidate for the invalidate variants.
    pub invalidate_rkey: Option<u32>,
}

impl SendWorkRequest {
    /// Plain Send.
    pub fn send(id: u64, sg_list: Vec<ScatterGatherElement>) -> Self {
        Self {
            id,
            opcode: WrOpcode::Send,
            sg_list,
            remote: None,
            invalidate_rkey: None,
        }
    }

    /// Send with Invalidate of `rkey`.
    pub fn send_with_invalidate(id: u64, sg_list: Vec<ScatterGatherElement>, rkey: u32) -> Self {
        Self {
            id,
            opcode: WrOpcode::SendInvalidate,
            sg_list,
            remote: None,
            invalidate_rkey: Some(rkey),
        }
    }

    /// RDMA Write of `sg_list` to `remote`.
    pub fn write(id: u64, sg_list: Vec<ScatterGatherElement>, remote: RemoteAddr) -> Self {
        Self {
            id,
            opcode: WrOpcode::RdmaWrite,
            sg_list,
            remote: Some(remote),
            invalidate_rkey: None,
        }
    }

    /// RDMA Read of `sink.length` bytes from `remote` into `sink`.
    pub fn read(id: u64, sink: ScatterGatherElement, remote: RemoteAddr) -> Self {
        Self {
            id,
            opcode: WrOpcode::RdmaRead,
            sg_list: vec![sink],
            remote: Some(remote),
            invalidate_rkey: None,
        }
    }

    /// Terminate.
    pub fn terminate(id: u64) -> Self {
        Self {
            id,
            opcode: WrOpcode::Terminate,
            sg_list: Vec::new(),
            remote: None,
            invalidate_rkey: None,
        }
    }

    /// Total bytes named by the scatter-gather list.
    pub fn total_length(&self) -> u64 {
        self.sg_list.iter().map(|s| u64::from(s.length)).sum()
    }
}

/// Work request for the Receive Queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecvWorkRequest {
    /// Caller-chosen id, echoed in the completion.
    pub id: u64,
    /// Buffers an incoming Send is placed into, in order.
    pub sg_list: Vec<ScatterGatherElement>,
}

impl RecvWorkRequest {
    /// Receive into `sg_list`.
    pub fn new(id: u64, sg_list: Vec<ScatterGatherElement>) -> Self {
        Self { id, sg_list }
    }
}

/// Completion opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WcOpcode {
    /// Send finished.
    Send,
    /// Send with Invalidate finished.
    SendInvalidate,
    /// Solicited Send finished.
    SendSolicited,
    /// Solicited Send with Invalidate finished.
    SendSolicitedInvalidate,
    /// Write handed to the wire.
    RdmaWrite,
    /// Read data placed.
    RdmaRead,
    /// Terminate sent.
    Terminate,
    /// Incoming Send matched a Receive.
    Recv,
}

/// Completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WcStatus {
    /// Operation succeeded.
    Success,
    /// Buffer bounds or message size violated.
    LocalLengthError,
    /// Unknown lkey, wrong domain or missing rights.
    LocalProtectionError,
    /// Malformed request.
    LocalQpOperationError,
    /// Flushed because the stream terminated.
    WrFlushError,
    /// Connection failed while executing.
    FatalError,
}

impl WcStatus {
    /// Status for a request that failed with `err`.
    pub fn from_error(err: &IwarpError) -> Self {
        match err {
            IwarpError::InvalidStag { .. }
            | IwarpError::AccessDenied { .. }
            | IwarpError::ProtectionDomainMismatch { .. } => WcStatus::LocalProtectionError,
            IwarpError::TaggedOffsetOutOfRange { .. }
            | IwarpError::PayloadTooLarge { .. }
            | IwarpError::MessageTooLong { .. } => WcStatus::LocalLengthError,
            IwarpError::Io(_) | IwarpError::NotConnected | IwarpError::QueueClosed => {
                WcStatus::FatalError
            }
            _ => WcStatus::LocalQpOperationError,
        }
    }
}

/// Result of one work request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkCompletion {
    /// Id of the work request.
    pub wr_id: u64,
    /// What completed.
    pub opcode: WcOpcode,
    /// Outcome.
    pub status: WcStatus,
    /// Bytes transferred.
    pub byte_len: u32,
    /// STag the peer invalidated, for a Receive matched by Send with Invalidate.
    pub invalidated_rkey: Option<u32>,
}

impl WorkCompletion {
    /// Successful completion.
    pub fn success(wr_id: u64, opcode: WcOpcode, byte_len: u32) -> Self {
        Self {
            wr_id,
            opcode,
            status: WcStatus::Success,
            byte_len,
            invalidated_rkey: None,
        }
    }

    /// Failed completion.
    pub fn error(wr_id: u64, opcode: WcOpcode, status: WcStatus) -> Self {
        Self {
            wr_id,
            opcode,
            status,
            byte_len: 0,
            invalidated_rkey: None,
        }
    }

    /// True for `WcStatus::Success`.
    pub fn is_success(&self) -> bool {
        self.status == WcStatus::Success
    }
}

/// Bounded completion queue.
///
/// Pushes block while the queue is full. Several work queues, and so several
/// streams, may share one completion queue.
#[derive(Debug)]
pub struct CompletionQueue {
    id: u32,
    capacity: usize,
    tx: Sender<WorkCompletion>,
    rx: Receiver<WorkCompletion>,
}

impl CompletionQueue {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = channel::bounded(capacity);
        Self {
            id: CQ_COUNTER.fetch_add(1, Ordering::Relaxed),
            capacity,
            tx,
            rx,
        }
    }

    /// Queue id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Maximum visible completions.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Visible completions.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// True if nothing is visible.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Dequeues up to `max_entries` completions without blocking.
    pub fn poll(&self, max_entries: usize) -> Vec<WorkCompletion> {
        let mut out = Vec::new();
        while out.len() < max_entries {
            match self.rx.try_recv() {
                Ok(wc) => out.push(wc),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        out
    }

    /// Publishes a completion, waiting up to `timeout` for room. Hands the
    /// completion back if the queue stayed full.
    pub(crate) fn push_timeout(
        &self,
        wc: WorkCompletion,
        timeout: Duration,
    ) -> std::result::Result<(), WorkCompletion> {
        self.tx
            .send_timeout(wc, timeout)
            .map_err(SendTimeoutError::into_inner)
    }

    /// Publishes without blocking; a full queue drops the entry.
    pub(crate) fn try_push(&self, wc: WorkCompletion) -> bool {
        match self.tx.try_send(wc) {
            Ok(()) => true,
            Err(TrySendError::Full(wc)) | Err(TrySendError::Disconnected(wc)) => {
                warn!(cq = self.id, wr_id = wc.wr_id, "completion queue full, dropping completion");
                false
            }
        }
    }
}

/// Allocates a completion queue holding up to `capacity` entries.
pub fn create_cq(capacity: usize) -> Result<Arc<CompletionQueue>> {
    if capacity == 0 {
        return Err(IwarpError::InvalidConfig {
            reason: "completion queue capacity must be non-zero".to_string(),
        });
    }
    let cq = Arc::new(CompletionQueue::new(capacity));
    debug!(cq = cq.id, capacity, "created completion queue");
    Ok(cq)
}

/// Releases a completion queue no work queue is bound to any more.
pub fn destroy_cq(cq: Arc<CompletionQueue>) -> Result<()> {
    let cq = Arc::try_unwrap(cq).map_err(|_| IwarpError::ResourceBusy {
        what: "completion queue",
    })?;
    debug!(cq = cq.id, dropped = cq.len(), "destroyed completion queue");
    Ok(())
}

/// Dequeues up to `max_entries` completions from `cq` without blocking.
pub fn poll_cq(cq: &CompletionQueue, max_entries: usize) -> Vec<WorkCompletion> {
    cq.poll(max_entries)
}

/// Kind of work queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WqType {
    /// Carries Send work requests.
    Send,
    /// Carries Receive work requests.
    Receive,
}

/// Items on a Send Queue. Read Responses are queued by the receive thread.
#[derive(Debug)]
pub(crate) enum SendOp {
    Post(SendWorkRequest),
    ReadResponse {
        sink_stag: u32,
        sink_to: u64,
        source: Arc<MemoryRegion>,
        offset: usize,
        len: usize,
    },
}

#[derive(Debug)]
enum WqChannel {
    Send(Sender<SendOp>, Receiver<SendOp>),
    Receive(Sender<RecvWorkRequest>, Receiver<RecvWorkRequest>),
}

/// Bounded work queue bound to a protection domain and a completion queue.
#[derive(Debug)]
pub struct WorkQueue {
    id: u32,
    capacity: usize,
    pd: ProtectionDomain,
    cq: Arc<CompletionQueue>,
    channel: WqChannel,
}

impl WorkQueue {
    /// Queue id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Send or Receive.
    pub fn wq_type(&self) -> WqType {
        match self.channel {
            WqChannel::Send(..) => WqType::Send,
            WqChannel::Receive(..) => WqType::Receive,
        }
    }

    /// Maximum queued requests.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Protection domain.
    pub fn pd(&self) -> ProtectionDomain {
        self.pd
    }

    /// Bound completion queue.
    pub fn cq(&self) -> &Arc<CompletionQueue> {
        &self.cq
    }

    /// Requests waiting for a worker thread.
    pub fn len(&self) -> usize {
        match &self.channel {
            WqChannel::Send(_, rx) => rx.len(),
            WqChannel::Receive(_, rx) => rx.len(),
        }
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn send_channel(&self) -> Option<(&Sender<SendOp>, &Receiver<SendOp>)> {
        match &self.channel {
            WqChannel::Send(tx, rx) => Some((tx, rx)),
            WqChannel::Receive(..) => None,
        }
    }

    pub(crate) fn recv_channel(
        &self,
    ) -> Option<(&Sender<RecvWorkRequest>, &Receiver<RecvWorkRequest>)> {
        match &self.channel {
            WqChannel::Receive(tx, rx) => Some((tx, rx)),
            WqChannel::Send(..) => None,
        }
    }
}

/// Allocates a work queue of `wq_type` holding up to `capacity` requests.
pub fn create_wq(
    wq_type: WqType,
    capacity: usize,
    pd: ProtectionDomain,
    cq: Arc<CompletionQueue>,
) -> Result<Arc<WorkQueue>> {
    if capacity == 0 {
        return Err(IwarpError::InvalidConfig {
            reason: "work queue capacity must be non-zero".to_string(),
        });
    }
    let channel = match wq_type {
        WqType::Send => {
            let (tx, rx) = channel::bounded(capacity);
            WqChannel::Send(tx, rx)
        }
        WqType::Receive => {
            let (tx, rx) = channel::bounded(capacity);
            WqChannel::Receive(tx, rx)
        }
    };
    let wq = Arc::new(WorkQueue {
        id: WQ_COUNTER.fetch_add(1, Ordering::Relaxed),
        capacity,
        pd,
        cq,
        channel,
    });
    debug!(wq = wq.id, ?wq_type, capacity, pd = pd.id(), "created work queue");
    Ok(wq)
}

/// Releases a work queue no stream uses any more.
pub fn destroy_wq(wq: Arc<WorkQueue>) -> Result<()> {
    let wq = Arc::try_unwrap(wq).map_err(|_| IwarpError::ResourceBusy { what: "work queue" })?;
    debug!(wq = wq.id, pending = wq.len(), "destroyed work queue");
    Ok(())
}
