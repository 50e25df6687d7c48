//! RDMAP streams over a connected TCP socket.
//!
//! A stream owns a DDP context and two threads. The send thread drains the
//! Send Queue, turns each work request into RDMAP messages and publishes one
//! completion per request. It also serves Read Responses queued by the receive
//! thread; those publish nothing. The receive thread places one message at a
//! time and dispatches on its RDMAP opcode.
//!
//! Any protocol or socket error seen by the receive thread, a Terminate in
//! either direction, or [`RdmapStream::kill`] moves the stream to
//! [`StreamState::Terminated`] and shuts the socket down, which unblocks both
//! threads. Work still queued at that point completes with
//! [`WcStatus::WrFlushError`].

use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::config::StreamConfig;
use crate::ddp::{
    DdpContext, DdpMessage, DdpReceiver, DdpSender, TaggedMeta, TaggedPolicy, UntaggedMeta,
    DDP_NUM_QUEUES,
};
use crate::error::{IwarpError, Result};
use crate::metrics::{StreamMetrics, StreamMetricsSnapshot};
use crate::rdmap::{
    PendingReads, RdmapOpcode, ReadRequest, TerminateMessage, QN_READ_REQUEST, QN_SEND,
    QN_TERMINATE, RDMAP_READ_REQ_SIZE, RDMAP_TERMINATE_SIZE,
};
use crate::registry::{AccessFlags, MemoryRegion, ProtectionDomain, UntaggedBuffer};
use crate::verbs::{
    CompletionQueue, RecvWorkRequest, ScatterGatherElement, SendOp, SendWorkRequest, WcOpcode,
    WcStatus, WorkCompletion, WorkQueue, WqType, WrOpcode,
};

/// Lifecycle of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    /// Being set up.
    Connecting = 0,
    /// Both threads running.
    Connected = 1,
    /// Stopped; no further traffic.
    Terminated = 2,
}

impl From<u8> for StreamState {
    fn from(value: u8) -> Self {
        match value {
            0 => StreamState::Connecting,
            1 => StreamState::Connected,
            _ => StreamState::Terminated,
        }
    }
}

/// Everything `rdmap_init_stream` needs.
#[derive(Debug)]
pub struct StreamInitAttr {
    /// Connected socket that already completed the MPA handshake.
    pub socket: TcpStream,
    /// Protection domain of the stream.
    pub pd: ProtectionDomain,
    /// Send-type work queue.
    pub send_q: Arc<WorkQueue>,
    /// Receive-type work queue.
    pub recv_q: Arc<WorkQueue>,
    /// Tunables.
    pub config: StreamConfig,
}

enum Flow {
    Continue,
    Stop,
}

struct StreamShared {
    state: AtomicU8,
    ctx: Arc<DdpContext>,
    send_q: Arc<WorkQueue>,
    recv_q: Arc<WorkQueue>,
    socket: TcpStream,
    post_lock: Mutex<()>,
    reads: PendingReads,
    metrics: StreamMetrics,
    config: StreamConfig,
}

impl StreamShared {
    fn state(&self) -> StreamState {
        StreamState::from(self.state.load(Ordering::SeqCst))
    }

    fn is_connected(&self) -> bool {
        self.state() == StreamState::Connected
    }

    fn terminate(&self, reason: &str) {
        let prev = StreamState::from(
            self.state
                .swap(StreamState::Terminated as u8, Ordering::SeqCst),
        );
        if prev == StreamState::Terminated {
            return;
        }
        info!(reason, "stream terminated");
        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            debug!(error = %e, "socket shutdown failed");
        }
    }

    fn send_tx(&self) -> Result<&Sender<SendOp>> {
        self.send_q
            .send_channel()
            .map(|(tx, _)| tx)
            .ok_or(IwarpError::QueueClosed)
    }

    fn recv_tx(&self) -> Result<&Sender<RecvWorkRequest>> {
        self.recv_q
            .recv_channel()
            .map(|(tx, _)| tx)
            .ok_or(IwarpError::QueueClosed)
    }

    /// Blocking enqueue that gives up once the stream leaves Connected.
    fn enqueue<T>(&self, tx: &Sender<T>, mut item: T) -> Result<()> {
        let interval = self.config.send_poll_interval();
        loop {
            if !self.is_connected() {
                return Err(IwarpError::NotConnected);
            }
            match tx.send_timeout(item, interval) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(back)) => item = back,
                Err(SendTimeoutError::Disconnected(_)) => return Err(IwarpError::QueueClosed),
            }
        }
    }

    /// Publishes `wc`, waiting for room while the stream is connected.
    fn complete(&self, cq: &CompletionQueue, mut wc: WorkCompletion) {
        let interval = self.config.send_poll_interval();
        loop {
            match cq.push_timeout(wc, interval) {
                Ok(()) => {
                    self.metrics.inc_completions();
                    return;
                }
                Err(back) if self.is_connected() => wc = back,
                Err(back) => {
                    warn!(
                        cq = cq.id(),
                        wr_id = back.wr_id,
                        "completion queue full after termination, dropping completion"
                    );
                    return;
                }
            }
        }
    }

    fn fail_request(&self, cq: &CompletionQueue, wr_id: u64, opcode: WcOpcode, err: IwarpError) {
        let status = WcStatus::from_error(&err);
        self.metrics.inc_errors();
        if status == WcStatus::FatalError {
            error!(wr_id, ?opcode, error = %err, "work request failed on the wire");
        } else {
            warn!(wr_id, ?opcode, ?status, error = %err, "work request failed");
        }
        self.complete(cq, WorkCompletion::error(wr_id, opcode, status));
        if status == WcStatus::FatalError {
            self.terminate("send path failed");
        }
    }
}

/// A running stream. Dropping it kills it.
pub struct RdmapStream {
    shared: Arc<StreamShared>,
    send_thread: Option<JoinHandle<()>>,
    recv_thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for RdmapStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdmapStream")
            .field("state", &self.state())
            .field("pd", &self.pd())
            .field("metrics", &self.shared.metrics)
            .finish()
    }
}

impl RdmapStream {
    /// Validates `attr`, pre-posts the internal receive pools and starts both threads.
    pub fn start(attr: StreamInitAttr) -> Result<Self> {
        let StreamInitAttr {
            socket,
            pd,
            send_q,
            recv_q,
            config,
        } = attr;
        config.validate()?;
        if send_q.wq_type() != WqType::Send || recv_q.wq_type() != WqType::Receive {
            return Err(IwarpError::InvalidConfig {
                reason: "stream needs one Send and one Receive work queue".to_string(),
            });
        }
        for wq in [&send_q, &recv_q] {
            if wq.pd() != pd {
                return Err(IwarpError::ProtectionDomainMismatch {
                    expected: pd.id(),
                    got: wq.pd().id(),
                });
            }
        }
        socket.set_nodelay(config.nodelay)?;

        let ctx = Arc::new(DdpContext::new(pd));
        let internal = AccessFlags::LOCAL_READ | AccessFlags::LOCAL_WRITE;
        for _ in 0..config.max_pending_read_requests {
            let region = MemoryRegion::new(pd, RDMAP_READ_REQ_SIZE, internal);
            ctx.post_recv(QN_READ_REQUEST, [UntaggedBuffer::whole(region)?])?;
        }
        for _ in 0..config.terminate_buffers {
            let region = MemoryRegion::new(pd, RDMAP_TERMINATE_SIZE, internal);
            ctx.post_recv(QN_TERMINATE, [UntaggedBuffer::whole(region)?])?;
        }

        let reader = socket.try_clone()?;
        let writer = socket.try_clone()?;
        let peer = socket.peer_addr().ok();
        let shared = Arc::new(StreamShared {
            state: AtomicU8::new(StreamState::Connecting as u8),
            ctx,
            send_q,
            recv_q,
            socket,
            post_lock: Mutex::new(()),
            reads: PendingReads::new(),
            metrics: StreamMetrics::new(),
            config,
        });
        shared
            .state
            .store(StreamState::Connected as u8, Ordering::SeqCst);

        let send_thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("uiwarp-send".to_string())
                .spawn(move || send_loop(shared, writer))?
        };
        let recv_thread = {
            let s = Arc::clone(&shared);
            match thread::Builder::new()
                .name("uiwarp-recv".to_string())
                .spawn(move || recv_loop(s, reader))
            {
                Ok(handle) => handle,
                Err(e) => {
                    shared.terminate("failed to spawn receive thread");
                    if send_thread.join().is_err() {
                        warn!("send thread panicked");
                    }
                    return Err(e.into());
                }
            }
        };

        info!(pd = pd.id(), ?peer, "stream connected");
        Ok(Self {
            shared,
            send_thread: Some(send_thread),
            recv_thread: Some(recv_thread),
        })
    }

    /// Current state.
    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    /// True while both threads are running.
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Protection domain.
    pub fn pd(&self) -> ProtectionDomain {
        self.shared.ctx.pd()
    }

    /// Placement context: tag registry and untagged queues.
    pub fn context(&self) -> &Arc<DdpContext> {
        &self.shared.ctx
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> StreamMetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Registers `region` for tagged access by the peer and for use as an lkey.
    pub fn register(&self, region: Arc<MemoryRegion>) -> Result<u32> {
        self.shared.ctx.register_tagged_buffer(region)
    }

    /// Invalidates `stag`.
    pub fn invalidate(&self, stag: u32) -> Result<()> {
        self.shared.ctx.deregister_tagged_buffer(stag).map(|_| ())
    }

    /// Posts a Send-family or Terminate request.
    pub fn send(&self, wr: SendWorkRequest) -> Result<()> {
        check_work_request(
            &wr,
            &[
                WrOpcode::Send,
                WrOpcode::SendInvalidate,
                WrOpcode::SendSolicited,
                WrOpcode::SendSolicitedInvalidate,
                WrOpcode::Terminate,
            ],
            "send",
        )?;
        self.post(wr)
    }

    /// Posts an RDMA Write request.
    pub fn write(&self, wr: SendWorkRequest) -> Result<()> {
        check_work_request(&wr, &[WrOpcode::RdmaWrite], "write")?;
        self.post(wr)
    }

    /// Posts an RDMA Read request.
    pub fn read(&self, wr: SendWorkRequest) -> Result<()> {
        check_work_request(&wr, &[WrOpcode::RdmaRead], "read")?;
        self.post(wr)
    }

    /// Posts a Terminate request.
    pub fn terminate(&self, wr_id: u64) -> Result<()> {
        self.send(SendWorkRequest::terminate(wr_id))
    }

    fn post(&self, wr: SendWorkRequest) -> Result<()> {
        trace!(wr_id = wr.id, opcode = ?wr.opcode, "posting send work request");
        let tx = self.shared.send_tx()?;
        self.shared.enqueue(tx, SendOp::Post(wr))
    }

    /// Posts a receive buffer and the request that will complete when it fills.
    pub fn post_recv(&self, wr: RecvWorkRequest) -> Result<()> {
        if !self.is_connected() {
            return Err(IwarpError::NotConnected);
        }
        let registry = self.shared.ctx.registry();
        let mut buffer = UntaggedBuffer::new();
        for sge in &wr.sg_list {
            let len = sge.length as usize;
            let (region, offset) =
                registry.resolve_range(sge.lkey, AccessFlags::LOCAL_WRITE, sge.addr, len)?;
            buffer.push(region, offset, len)?;
        }

        // The request must be queued before its buffer can be consumed.
        let _guard = self.shared.post_lock.lock();
        let wr_id = wr.id;
        self.shared.enqueue(self.shared.recv_tx()?, wr)?;
        self.shared.ctx.post_recv(QN_SEND, [buffer])?;
        trace!(wr_id, "posted receive work request");
        Ok(())
    }

    /// Stops both threads and waits for them.
    pub fn kill(&mut self) {
        self.shared.terminate("stream killed");
        for handle in [self.send_thread.take(), self.recv_thread.take()]
            .into_iter()
            .flatten()
        {
            let name = handle.thread().name().unwrap_or("uiwarp").to_string();
            if handle.join().is_err() {
                warn!(thread = %name, "stream thread panicked");
            }
        }
    }
}

impl Drop for RdmapStream {
    fn drop(&mut self) {
        self.kill();
    }
}

fn check_work_request(wr: &SendWorkRequest, allowed: &[WrOpcode], verb: &str) -> Result<()> {
    let reason = if !allowed.contains(&wr.opcode) {
        Some(format!("opcode {:?} cannot be posted with {verb}", wr.opcode))
    } else if matches!(wr.opcode, WrOpcode::RdmaWrite | WrOpcode::RdmaRead) && wr.remote.is_none()
    {
        Some("missing remote address".to_string())
    } else if wr.opcode == WrOpcode::RdmaRead && wr.sg_list.len() != 1 {
        Some(format!(
            "read needs exactly one scatter-gather element, got {}",
            wr.sg_list.len()
        ))
    } else if matches!(
        wr.opcode,
        WrOpcode::SendInvalidate | WrOpcode::SendSolicitedInvalidate
    ) && wr.invalidate_rkey.is_none()
    {
        Some("missing stag to invalidate".to_string())
    } else {
        None
    };
    match reason {
        Some(reason) => {
            warn!(wr_id = wr.id, %reason, "rejected work request");
            Err(IwarpError::InvalidWorkRequest {
                wr_id: wr.id,
                reason,
            })
        }
        None => Ok(()),
    }
}

fn rdmap_opcode(opcode: WrOpcode) -> RdmapOpcode {
    match opcode {
        WrOpcode::Send => RdmapOpcode::Send,
        WrOpcode::SendInvalidate => RdmapOpcode::SendInvalidate,
        WrOpcode::SendSolicited => RdmapOpcode::SendSolicited,
        WrOpcode::SendSolicitedInvalidate => RdmapOpcode::SendSolicitedInvalidate,
        WrOpcode::RdmaWrite => RdmapOpcode::Write,
        WrOpcode::RdmaRead => RdmapOpcode::ReadRequest,
        WrOpcode::Terminate => RdmapOpcode::Terminate,
    }
}

/// Resolves local sources, read-locks them and hands `f` their byte slices.
fn with_sources<T>(
    ctx: &DdpContext,
    sg_list: &[ScatterGatherElement],
    f: impl FnOnce(&[&[u8]]) -> Result<T>,
) -> Result<T> {
    let mut parts = Vec::with_capacity(sg_list.len());
    for sge in sg_list {
        let len = sge.length as usize;
        let (region, offset) =
            ctx.registry()
                .resolve_range(sge.lkey, AccessFlags::LOCAL_READ, sge.addr, len)?;
        parts.push((region, offset, len));
    }
    let guards: Vec<_> = parts.iter().map(|(region, _, _)| region.read()).collect();
    let slices: Vec<&[u8]> = guards
        .iter()
        .zip(&parts)
        .map(|(bytes, (_, offset, len))| &bytes[*offset..*offset + *len])
        .collect();
    f(&slices)
}

struct SendPath {
    tx: DdpSender<TcpStream>,
    msn: [u32; DDP_NUM_QUEUES],
}

impl SendPath {
    fn send_untagged(&mut self, op: RdmapOpcode, rsvd_ulp2: u32, sg_list: &[&[u8]]) -> Result<usize> {
        let qn = op.queue_number().unwrap_or(QN_SEND);
        let meta = UntaggedMeta {
            rsvd_ulp1: op.control(),
            rsvd_ulp2,
            qn,
            msn: self.msn[qn as usize],
            mo: 0,
        };
        let segments = self.tx.send_untagged(meta, sg_list)?;
        self.msn[qn as usize] = meta.msn.wrapping_add(1);
        Ok(segments)
    }
}

fn send_loop(shared: Arc<StreamShared>, writer: TcpStream) {
    let rx = match shared.send_q.send_channel() {
        Some((_, rx)) => rx.clone(),
        None => {
            error!("send thread started without a send queue");
            shared.terminate("no send queue");
            return;
        }
    };
    let mut path = SendPath {
        tx: DdpSender::new(writer, shared.config.mulpdu),
        msn: [1; DDP_NUM_QUEUES],
    };
    let interval = shared.config.send_poll_interval();
    debug!(mulpdu = path.tx.mulpdu(), "send thread started");

    while shared.is_connected() {
        let op = match rx.recv_timeout(interval) {
            Ok(op) => op,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        match op {
            SendOp::Post(wr) => execute(&shared, &mut path, wr),
            SendOp::ReadResponse {
                sink_stag,
                sink_to,
                source,
                offset,
                len,
            } => {
                let bytes = source.read();
                let meta = TaggedMeta {
                    rsvd_ulp: RdmapOpcode::ReadResponse.control(),
                    stag: sink_stag,
                    to: sink_to,
                };
                match path.tx.send_tagged(meta, &[&bytes[offset..offset + len]]) {
                    Ok(segments) => {
                        shared.metrics.record_sent(segments, len);
                        shared.metrics.inc_read_responses();
                        debug!(sink_stag, len, "served read response");
                    }
                    Err(e) => {
                        shared.metrics.inc_errors();
                        error!(sink_stag, error = %e, "read response failed");
                        shared.terminate("read response failed");
                    }
                }
            }
        }
    }

    flush_send_queue(&shared, &rx);
    debug!("send thread exiting");
}

fn execute(shared: &StreamShared, path: &mut SendPath, wr: SendWorkRequest) {
    let cq = shared.send_q.cq();
    let wc_opcode = wr.opcode.completion_opcode();
    if wr.opcode == WrOpcode::RdmaRead {
        post_read_request(shared, path, &wr);
        return;
    }

    let byte_len = match u32::try_from(wr.total_length()) {
        Ok(len) => len,
        Err(_) => {
            let err = IwarpError::PayloadTooLarge {
                size: wr.total_length() as usize,
                max_size: u32::MAX as usize,
            };
            shared.fail_request(cq, wr.id, wc_opcode, err);
            return;
        }
    };
    let op = rdmap_opcode(wr.opcode);
    let sent = match wr.opcode {
        WrOpcode::RdmaWrite => match wr.remote {
            Some(remote) => with_sources(&shared.ctx, &wr.sg_list, |slices| {
                let meta = TaggedMeta {
                    rsvd_ulp: op.control(),
                    stag: remote.rkey,
                    to: remote.addr,
                };
                path.tx.send_tagged(meta, slices)
            }),
            None => Err(IwarpError::InvalidWorkRequest {
                wr_id: wr.id,
                reason: "missing remote address".to_string(),
            }),
        },
        WrOpcode::Terminate => {
            let body = TerminateMessage::local_close().encode();
            path.send_untagged(op, 0, &[&body[..]])
        }
        _ => with_sources(&shared.ctx, &wr.sg_list, |slices| {
            path.send_untagged(op, wr.invalidate_rkey.unwrap_or(0), slices)
        }),
    };

    match sent {
        Ok(segments) => {
            shared.metrics.record_sent(segments, byte_len as usize);
            debug!(wr_id = wr.id, ?op, byte_len, segments, "work request sent");
            shared.complete(cq, WorkCompletion::success(wr.id, wc_opcode, byte_len));
            if wr.opcode == WrOpcode::Terminate {
                shared.terminate("terminate sent");
            }
        }
        Err(e) => shared.fail_request(cq, wr.id, wc_opcode, e),
    }
}

/// Sends a Read Request. It is recorded as outstanding before it reaches the
/// wire; its completion is published when the matching response is placed.
fn post_read_request(shared: &StreamShared, path: &mut SendPath, wr: &SendWorkRequest) {
    let cq = shared.send_q.cq();
    let req = match prepare_read(&shared.ctx, wr) {
        Ok(req) => req,
        Err(e) => return shared.fail_request(cq, wr.id, WcOpcode::RdmaRead, e),
    };
    shared.reads.push(wr.id, req);
    let body = req.encode();
    match path.send_untagged(RdmapOpcode::ReadRequest, 0, &[&body[..]]) {
        Ok(segments) => {
            shared.metrics.record_sent(segments, 0);
            debug!(wr_id = wr.id, src_stag = req.src_stag, size = req.size, "read request sent");
        }
        Err(e) => {
            // The outstanding read is flushed when the thread exits.
            shared.metrics.inc_errors();
            error!(wr_id = wr.id, error = %e, "read request failed");
            shared.terminate("read request failed");
        }
    }
}

fn prepare_read(ctx: &DdpContext, wr: &SendWorkRequest) -> Result<ReadRequest> {
    let invalid = |reason: &str| IwarpError::InvalidWorkRequest {
        wr_id: wr.id,
        reason: reason.to_string(),
    };
    let sink = wr
        .sg_list
        .first()
        .ok_or_else(|| invalid("missing sink element"))?;
    let remote = wr.remote.ok_or_else(|| invalid("missing remote address"))?;
    ctx.registry().resolve_range(
        sink.lkey,
        AccessFlags::LOCAL_WRITE,
        sink.addr,
        sink.length as usize,
    )?;
    Ok(ReadRequest {
        sink_stag: sink.lkey,
        sink_to: sink.addr,
        size: sink.length,
        src_stag: remote.rkey,
        src_to: remote.addr,
    })
}

fn flush_send_queue(shared: &StreamShared, rx: &Receiver<SendOp>) {
    let cq = shared.send_q.cq();
    let mut flushed = 0usize;
    while let Ok(op) = rx.try_recv() {
        if let SendOp::Post(wr) = op {
            let wc = WorkCompletion::error(wr.id, wr.opcode.completion_opcode(), WcStatus::WrFlushError);
            if cq.try_push(wc) {
                flushed += 1;
            }
        }
    }
    for (wr_id, _) in shared.reads.drain() {
        let wc = WorkCompletion::error(wr_id, WcOpcode::RdmaRead, WcStatus::WrFlushError);
        if cq.try_push(wc) {
            flushed += 1;
        }
    }
    if flushed > 0 {
        debug!(flushed, "flushed send queue");
    }
}

/// Tagged placement checks of one stream: Writes need `REMOTE_WRITE`, Read
/// Responses must fit the sink of the oldest outstanding Read.
struct TaggedAdmission(Arc<StreamShared>);

impl TaggedPolicy for TaggedAdmission {
    fn admit(&self, meta: &TaggedMeta, len: usize) -> Result<AccessFlags> {
        self.0.reads.admit(meta, len)
    }
}

fn recv_loop(shared: Arc<StreamShared>, reader: TcpStream) {
    let mut rx = DdpReceiver::new(reader, Arc::clone(&shared.ctx))
        .with_policy(TaggedAdmission(Arc::clone(&shared)));
    debug!("receive thread started");

    while shared.is_connected() {
        match rx.recv().and_then(|msg| dispatch(&shared, msg)) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Stop) => break,
            Err(e) => {
                if shared.is_connected() {
                    shared.metrics.inc_errors();
                    match &e {
                        IwarpError::Io(io) => warn!(error = %io, "connection lost"),
                        _ => error!(error = %e, "protocol error, terminating stream"),
                    }
                } else {
                    debug!(error = %e, "receive loop stopped");
                }
                break;
            }
        }
    }

    shared.terminate("receive loop ended");
    flush_recv_queue(&shared);
    debug!("receive thread exiting");
}

fn dispatch(shared: &StreamShared, msg: DdpMessage) -> Result<Flow> {
    shared.metrics.record_received(msg.segments(), msg.len());
    match msg {
        DdpMessage::Tagged {
            rsvd_ulp,
            stag,
            to,
            len,
            ..
        } => match RdmapOpcode::from_control(rsvd_ulp)? {
            RdmapOpcode::Write => {
                debug!(stag, to, len, "rdma write placed");
                Ok(Flow::Continue)
            }
            RdmapOpcode::ReadResponse => {
                let (wr_id, _) = shared
                    .reads
                    .complete()
                    .ok_or_else(|| IwarpError::frame("read response without an outstanding read"))?;
                debug!(wr_id, stag, len, "read completed");
                let wc = WorkCompletion::success(wr_id, WcOpcode::RdmaRead, len as u32);
                shared.complete(shared.send_q.cq(), wc);
                Ok(Flow::Continue)
            }
            other => Err(IwarpError::frame(format!(
                "{other:?} received on the tagged buffer model"
            ))),
        },
        DdpMessage::Untagged {
            rsvd_ulp1,
            rsvd_ulp2,
            qn,
            msn,
            len,
            buffer,
            ..
        } => {
            let op = RdmapOpcode::from_control(rsvd_ulp1)?;
            if op.queue_number() != Some(qn) {
                return Err(IwarpError::InvalidQueueNumber(qn));
            }
            match op {
                RdmapOpcode::ReadRequest => {
                    serve_read_request(shared, &buffer, len)?;
                    shared.ctx.post_recv(QN_READ_REQUEST, [buffer])?;
                    Ok(Flow::Continue)
                }
                RdmapOpcode::Terminate => {
                    match TerminateMessage::decode(&buffer.copy_out(len)) {
                        Ok(term) => info!(
                            layer = ?term.layer,
                            error_type = term.error_type,
                            error_code = term.error_code,
                            "terminate received"
                        ),
                        Err(e) => warn!(error = %e, "malformed terminate received"),
                    }
                    shared.terminate("terminate received");
                    Ok(Flow::Stop)
                }
                _ => {
                    complete_receive(shared, op, rsvd_ulp2, msn, len)?;
                    Ok(Flow::Continue)
                }
            }
        }
    }
}

fn serve_read_request(shared: &StreamShared, buffer: &UntaggedBuffer, len: usize) -> Result<()> {
    let req = ReadRequest::decode(&buffer.copy_out(len))?;
    let size = req.size as usize;
    let (source, offset) = shared.ctx.registry().resolve_range(
        req.src_stag,
        AccessFlags::REMOTE_READ,
        req.src_to,
        size,
    )?;
    debug!(src_stag = req.src_stag, sink_stag = req.sink_stag, size, "read request accepted");
    shared.enqueue(
        shared.send_tx()?,
        SendOp::ReadResponse {
            sink_stag: req.sink_stag,
            sink_to: req.sink_to,
            source,
            offset,
            len: size,
        },
    )
}

fn complete_receive(
    shared: &StreamShared,
    op: RdmapOpcode,
    rsvd_ulp2: u32,
    msn: u32,
    len: usize,
) -> Result<()> {
    let invalidated = if op.invalidates() {
        shared.ctx.deregister_tagged_buffer(rsvd_ulp2)?;
        info!(stag = rsvd_ulp2, "stag invalidated by peer");
        Some(rsvd_ulp2)
    } else {
        None
    };
    let wr = shared
        .recv_q
        .recv_channel()
        .and_then(|(_, rx)| rx.try_recv().ok())
        .ok_or(IwarpError::NoUntaggedBuffer { qn: QN_SEND })?;
    debug!(wr_id = wr.id, msn, len, ?op, "receive completed");
    shared.complete(
        shared.recv_q.cq(),
        WorkCompletion {
            wr_id: wr.id,
            opcode: WcOpcode::Recv,
            status: WcStatus::Success,
            byte_len: len as u32,
            invalidated_rkey: invalidated,
        },
    );
    Ok(())
}

fn flush_recv_queue(shared: &StreamShared) {
    if let Ok(queue) = shared.ctx.queue(QN_SEND) {
        while queue.pop().is_some() {}
    }
    let Some((_, rx)) = shared.recv_q.recv_channel() else {
        return;
    };
    let cq = shared.recv_q.cq();
    let mut flushed = 0usize;
    while let Ok(wr) = rx.try_recv() {
        if cq.try_push(WorkCompletion::error(wr.id, WcOpcode::Recv, WcStatus::WrFlushError)) {
            flushed += 1;
        }
    }
    if flushed > 0 {
        debug!(flushed, "flushed receive queue");
    }
}

/// Starts a stream over an MPA-connected socket.
pub fn rdmap_init_stream(attr: StreamInitAttr) -> Result<RdmapStream> {
    RdmapStream::start(attr)
}

/// Stops a stream and joins its threads.
pub fn kill_stream(mut stream: RdmapStream) {
    stream.kill();
}

/// Posts a Send-family or Terminate work request.
pub fn rdmap_send(stream: &RdmapStream, wr: SendWorkRequest) -> Result<()> {
    stream.send(wr)
}

/// Posts an RDMA Write work request.
pub fn rdmap_write(stream: &RdmapStream, wr: SendWorkRequest) -> Result<()> {
    stream.write(wr)
}

/// Posts an RDMA Read work request.
pub fn rdmap_read(stream: &RdmapStream, wr: SendWorkRequest) -> Result<()> {
    stream.read(wr)
}

/// Posts a receive work request.
pub fn rdma_post_recv(stream: &RdmapStream, wr: RecvWorkRequest) -> Result<()> {
    stream.post_recv(wr)
}

/// Registers a tagged buffer; returns its STag.
pub fn rdma_register(stream: &RdmapStream, region: Arc<MemoryRegion>) -> Result<u32> {
    stream.register(region)
}

/// Invalidates a tagged buffer.
pub fn rdma_invalidate(stream: &RdmapStream, stag: u32) -> Result<()> {
    stream.invalidate(stag)
}
