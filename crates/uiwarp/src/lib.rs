#![warn(missing_docs)]

//! Userspace iWARP: MPA framing, DDP placement and RDMAP verbs over a plain TCP stream.
//!
//! A connection is set up by running the MPA handshake on a connected
//! [`std::net::TcpStream`] ([`mpa_client_connect`] / [`mpa_server_accept`]) and
//! then handing the socket to [`rdmap_init_stream`] together with a Send and a
//! Receive [`WorkQueue`]. Work requests posted on the stream are executed by its
//! send thread; results are read from the bound [`CompletionQueue`] with
//! [`poll_cq`].

pub mod config;
pub mod ddp;
pub mod error;
pub mod metrics;
pub mod mpa;
pub mod rdmap;
pub mod registry;
pub mod stream;
pub mod verbs;

pub use config::StreamConfig;
pub use ddp::{
    DdpContext, DdpMessage, DdpReceiver, DdpSender, TaggedMeta, TaggedPolicy, UntaggedMeta,
};
pub use error::{IwarpError, Result};
pub use metrics::{StreamMetrics, StreamMetricsSnapshot};
pub use mpa::{
    mpa_client_connect, mpa_client_connect as mpa_connect, mpa_recv, mpa_send, mpa_server_accept,
    mpa_server_accept as mpa_accept, MpaPeer, MpaRecvState,
};
pub use rdmap::{PendingReads, RdmapOpcode, ReadRequest, TerminateMessage};
pub use registry::{AccessFlags, MemoryRegion, ProtectionDomain, TagRegistry, UntaggedBuffer};
pub use stream::{
    kill_stream, rdma_invalidate, rdma_post_recv, rdma_register, rdmap_init_stream, rdmap_read,
    rdmap_send, rdmap_write, RdmapStream, StreamInitAttr, StreamState,
};
pub use verbs::{
    create_cq, create_wq, destroy_cq, destroy_wq, poll_cq, CompletionQueue, RecvWorkRequest,
    RemoteAddr, ScatterGatherElement, SendWorkRequest, WcOpcode, WcStatus, WorkCompletion,
    WorkQueue, WqType, WrOpcode,
};
