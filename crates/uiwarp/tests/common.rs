//! Common fixtures for the loopback integration tests.

use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use tracing_subscriber::EnvFilter;
use uiwarp::{
    create_cq, create_wq, mpa_client_connect, mpa_server_accept, rdmap_init_stream,
    CompletionQueue, MemoryRegion, ProtectionDomain, RdmapStream, StreamConfig, StreamInitAttr,
    WorkCompletion, WqType,
};

/// How long any single wait in a test may take.
pub const WAIT: Duration = Duration::from_secs(5);

/// Prints library logs when `RUST_LOG` is set.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// One side of a connection: its stream and the single CQ both work queues share.
pub struct Endpoint {
    pub stream: RdmapStream,
    pub pd: ProtectionDomain,
    pub cq: Arc<CompletionQueue>,
}

impl Endpoint {
    /// Starts a stream on `socket` with its own completion queue.
    pub fn start(socket: TcpStream, config: StreamConfig) -> Self {
        Self::with_cq(socket, config, create_cq(64).unwrap())
    }

    /// Starts a stream on `socket` whose work queues both complete on `cq`.
    pub fn with_cq(socket: TcpStream, config: StreamConfig, cq: Arc<CompletionQueue>) -> Self {
        let pd = ProtectionDomain::new();
        let send_q = create_wq(WqType::Send, 64, pd, Arc::clone(&cq)).unwrap();
        let recv_q = create_wq(WqType::Receive, 64, pd, Arc::clone(&cq)).unwrap();
        let stream = rdmap_init_stream(StreamInitAttr {
            socket,
            pd,
            send_q,
            recv_q,
            config,
        })
        .unwrap();
        Self { stream, pd, cq }
    }

    /// Registers a region with `data` as its contents.
    pub fn region(&self, data: Vec<u8>, access: uiwarp::AccessFlags) -> Arc<MemoryRegion> {
        let region = MemoryRegion::from_vec(self.pd, data, access);
        self.stream.register(Arc::clone(&region)).unwrap();
        region
    }

    /// Waits until `n` completions have been polled.
    pub fn wait_completions(&self, n: usize) -> Vec<WorkCompletion> {
        let deadline = Instant::now() + WAIT;
        let mut out = Vec::new();
        while out.len() < n {
            assert!(
                Instant::now() < deadline,
                "timed out with {} of {n} completions: {out:?}",
                out.len()
            );
            out.extend(self.cq.poll(n - out.len()));
            thread::sleep(Duration::from_millis(1));
        }
        out
    }
}

/// Two loopback sockets that completed the MPA handshake, client side first.
pub fn mpa_socket_pair() -> (TcpStream, TcpStream) {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (mut socket, _) = listener.accept().unwrap();
        let peer = mpa_server_accept(&mut socket, b"server").unwrap();
        assert_eq!(peer.private_data, b"client");
        socket
    });
    let mut client = TcpStream::connect(addr).unwrap();
    let peer = mpa_client_connect(&mut client, b"client").unwrap();
    assert_eq!(peer.private_data, b"server");
    (client, server.join().unwrap())
}

/// Client and server connected over loopback with the MPA handshake done.
pub fn connected_pair() -> (Endpoint, Endpoint) {
    connected_pair_with(StreamConfig::default())
}

/// Same as [`connected_pair`] with a custom stream config on both sides.
pub fn connected_pair_with(config: StreamConfig) -> (Endpoint, Endpoint) {
    let (client, server) = mpa_socket_pair();
    (
        Endpoint::start(client, config.clone()),
        Endpoint::start(server, config),
    )
}

/// Polls `cond` until it holds or the wait expires.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}
