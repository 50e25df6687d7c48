//! MPA: connection handshake and length-prefixed framing over a TCP stream.
//!
//! A frame is a 2-byte big-endian ULPDU length, the ULPDU, zero padding up to a
//! 4-byte boundary and a 4-byte CRC trailer. The trailer is always written as zero
//! and never checked; markers are not supported.

use std::io::{self, IoSlice, Read, Write};
use std::net::TcpStream;

use tracing::{debug, info, trace};

use crate::error::{IwarpError, Result};

/// Length of the handshake key.
pub const MPA_KEY_LEN: usize = 16;
/// Key opening an MPA request.
pub const MPA_KEY_REQ: &[u8; MPA_KEY_LEN] = b"MPA ID Req Frame";
/// Key opening an MPA reply.
pub const MPA_KEY_REP: &[u8; MPA_KEY_LEN] = b"MPA ID Rep Frame";
/// Request/reply record size without private data (key + bits + pd_len).
pub const MPA_RR_HDR_SIZE: usize = MPA_KEY_LEN + 4;
/// MPA revision this implementation speaks.
pub const MPA_REVISION_1: u8 = 1;
/// Largest private data accepted in a request or reply.
pub const MPA_MAX_PRIVDATA: usize = 256;
/// Size of the frame length field.
pub const MPA_HDR_SIZE: usize = 2;
/// Size of the CRC trailer.
pub const MPA_CRC_SIZE: usize = 4;
/// Largest ULPDU a frame can declare.
pub const MPA_MAX_ULPDU: usize = u16::MAX as usize;
/// Effective maximum segment size assumed for the stream.
pub const EMSS: usize = 65535;
/// Default maximum DDP payload per frame, EMSS minus framing and marker overhead.
pub const DEFAULT_MULPDU: usize = EMSS - (6 + 4 * (EMSS / 512 + 1) + EMSS % 4);

const MPA_FLAG_MARKERS: u16 = 0x8000;
const MPA_FLAG_CRC: u16 = 0x4000;
const MPA_FLAG_REJECT: u16 = 0x2000;
const MPA_FLAG_ENHANCED: u16 = 0x1000;
const MPA_MASK_REVISION: u16 = 0x00FF;

/// How far past the private data the acceptor looks for stray bytes.
const EXTRA_DATA_PROBE: usize = 4;

/// Which side of the handshake a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpaKey {
    /// Sent by the connecting side.
    Request,
    /// Sent by the accepting side.
    Reply,
}

impl MpaKey {
    fn bytes(self) -> &'static [u8; MPA_KEY_LEN] {
        match self {
            MpaKey::Request => MPA_KEY_REQ,
            MpaKey::Reply => MPA_KEY_REP,
        }
    }
}

/// Flag bits of a request/reply record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MpaRrFlags {
    /// Markers requested.
    pub markers: bool,
    /// CRC requested.
    pub crc: bool,
    /// Connection rejected (reply only).
    pub reject: bool,
    /// Enhanced connection setup.
    pub enhanced: bool,
}

impl MpaRrFlags {
    fn to_bits(self, revision: u8) -> u16 {
        let mut bits = u16::from(revision);
        if self.markers {
            bits |= MPA_FLAG_MARKERS;
        }
        if self.crc {
            bits |= MPA_FLAG_CRC;
        }
        if self.reject {
            bits |= MPA_FLAG_REJECT;
        }
        if self.enhanced {
            bits |= MPA_FLAG_ENHANCED;
        }
        bits
    }

    fn from_bits(bits: u16) -> Self {
        Self {
            markers: bits & MPA_FLAG_MARKERS != 0,
            crc: bits & MPA_FLAG_CRC != 0,
            reject: bits & MPA_FLAG_REJECT != 0,
            enhanced: bits & MPA_FLAG_ENHANCED != 0,
        }
    }
}

/// Fixed part of an MPA request or reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpaRrHeader {
    /// Request or reply.
    pub key: MpaKey,
    /// Flag bits.
    pub flags: MpaRrFlags,
    /// Protocol revision.
    pub revision: u8,
    /// Length of the private data that follows.
    pub pd_len: u16,
}

impl MpaRrHeader {
    /// Encodes the record header in wire order.
    pub fn encode(&self) -> [u8; MPA_RR_HDR_SIZE] {
        let mut out = [0u8; MPA_RR_HDR_SIZE];
        out[..MPA_KEY_LEN].copy_from_slice(self.key.bytes());
        out[16..18].copy_from_slice(&self.flags.to_bits(self.revision).to_be_bytes());
        out[18..20].copy_from_slice(&self.pd_len.to_be_bytes());
        out
    }

    /// Decodes a record header, rejecting unknown keys.
    pub fn decode(raw: &[u8; MPA_RR_HDR_SIZE]) -> Result<Self> {
        let key = match &raw[..MPA_KEY_LEN] {
            k if k == MPA_KEY_REQ => MpaKey::Request,
            k if k == MPA_KEY_REP => MpaKey::Reply,
            _ => return Err(IwarpError::InvalidMpaKey),
        };
        let bits = u16::from_be_bytes([raw[16], raw[17]]);
        Ok(Self {
            key,
            flags: MpaRrFlags::from_bits(bits),
            revision: (bits & MPA_MASK_REVISION) as u8,
            pd_len: u16::from_be_bytes([raw[18], raw[19]]),
        })
    }
}

/// What the peer sent during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MpaPeer {
    /// Revision the peer announced.
    pub revision: u8,
    /// Private data the peer attached.
    pub private_data: Vec<u8>,
}

fn send_rr<W: Write>(w: &mut W, key: MpaKey, private_data: &[u8]) -> Result<usize> {
    if private_data.len() > MPA_MAX_PRIVDATA {
        return Err(IwarpError::PrivateDataTooLarge {
            len: private_data.len(),
            max: MPA_MAX_PRIVDATA,
        });
    }
    let hdr = MpaRrHeader {
        key,
        flags: MpaRrFlags::default(),
        revision: MPA_REVISION_1,
        pd_len: private_data.len() as u16,
    };
    let encoded = hdr.encode();
    let mut slices = [IoSlice::new(&encoded), IoSlice::new(private_data)];
    write_all_vectored(w, &mut slices)?;
    w.flush()?;
    debug!(key = ?key, pd_len = private_data.len(), "sent MPA request/reply");
    Ok(MPA_RR_HDR_SIZE + private_data.len())
}

fn recv_rr(stream: &TcpStream) -> Result<(MpaRrHeader, Vec<u8>)> {
    let mut reader = stream;
    let mut raw = [0u8; MPA_RR_HDR_SIZE];
    read_exact_framed(&mut reader, &mut raw, "MPA request/reply header")?;
    let hdr = MpaRrHeader::decode(&raw)?;
    debug!(key = ?hdr.key, revision = hdr.revision, pd_len = hdr.pd_len, "received MPA request/reply");

    let pd_len = usize::from(hdr.pd_len);
    if pd_len > MPA_MAX_PRIVDATA {
        return Err(IwarpError::PrivateDataTooLarge {
            len: pd_len,
            max: MPA_MAX_PRIVDATA,
        });
    }
    let mut private_data = vec![0u8; pd_len];
    read_exact_framed(&mut reader, &mut private_data, "MPA private data")?;

    if hdr.key == MpaKey::Request {
        let extra = probe_trailing_bytes(stream)?;
        if extra > 0 {
            return Err(IwarpError::ExtraHandshakeData { extra });
        }
    }
    Ok((hdr, private_data))
}

/// Non-blocking look past the request; the initiator must wait for the reply.
fn probe_trailing_bytes(stream: &TcpStream) -> Result<usize> {
    stream.set_nonblocking(true)?;
    let mut probe = [0u8; EXTRA_DATA_PROBE];
    let peeked = stream.peek(&mut probe);
    stream.set_nonblocking(false)?;
    match peeked {
        Ok(0) => Err(IwarpError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "peer closed during MPA handshake",
        ))),
        Ok(n) => Ok(n),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Active side of the handshake: send the request, wait for the reply.
pub fn mpa_client_connect(stream: &mut TcpStream, private_data: &[u8]) -> Result<MpaPeer> {
    send_rr(stream, MpaKey::Request, private_data)?;
    let (hdr, pdata) = recv_rr(stream)?;
    if hdr.key != MpaKey::Reply {
        return Err(IwarpError::InvalidMpaKey);
    }
    if hdr.flags.reject {
        return Err(IwarpError::HandshakeRejected);
    }
    info!(revision = hdr.revision, "MPA connection established (client)");
    Ok(MpaPeer {
        revision: hdr.revision,
        private_data: pdata,
    })
}

/// Passive side of the handshake: wait for the request, send the reply.
pub fn mpa_server_accept(stream: &mut TcpStream, private_data: &[u8]) -> Result<MpaPeer> {
    let (hdr, pdata) = recv_rr(stream)?;
    if hdr.key != MpaKey::Request {
        return Err(IwarpError::InvalidMpaKey);
    }
    send_rr(stream, MpaKey::Reply, private_data)?;
    info!(revision = hdr.revision, "MPA connection established (server)");
    Ok(MpaPeer {
        revision: hdr.revision,
        private_data: pdata,
    })
}

/// Zero bytes needed after a ULPDU of `ulpdu_len` to align the frame to 4 bytes.
pub fn mpa_pad_len(ulpdu_len: usize) -> usize {
    (4 - (MPA_HDR_SIZE + ulpdu_len) % 4) % 4
}

/// Writes one frame gathering `sg_list` as its ULPDU. Returns bytes on the wire.
pub fn mpa_send<W: Write>(w: &mut W, sg_list: &[&[u8]]) -> Result<usize> {
    let len: usize = sg_list.iter().map(|s| s.len()).sum();
    if len > MPA_MAX_ULPDU {
        return Err(IwarpError::PayloadTooLarge {
            size: len,
            max_size: MPA_MAX_ULPDU,
        });
    }
    if len == 0 {
        return Err(IwarpError::frame("refusing to send an empty MPA frame"));
    }

    let header = (len as u16).to_be_bytes();
    let pad = [0u8; 3];
    let pad_len = mpa_pad_len(len);
    // CRC is not generated; the trailer is a fixed zero word.
    let trailer = 0u32.to_be_bytes();

    let mut slices = Vec::with_capacity(sg_list.len() + 3);
    slices.push(IoSlice::new(&header));
    slices.extend(sg_list.iter().filter(|s| !s.is_empty()).map(|s| IoSlice::new(s)));
    if pad_len > 0 {
        slices.push(IoSlice::new(&pad[..pad_len]));
    }
    slices.push(IoSlice::new(&trailer));

    write_all_vectored(w, &mut slices)?;
    w.flush()?;
    trace!(ulpdu_len = len, pad_len, "sent MPA frame");
    Ok(MPA_HDR_SIZE + len + pad_len + MPA_CRC_SIZE)
}

/// Progress through one incoming frame, carried across `mpa_recv` calls.
#[derive(Debug, Clone, Default)]
pub struct MpaRecvState {
    ulpdu_len: Option<u16>,
    payload_rcvd: usize,
    pad_len: usize,
    complete: bool,
    crc: u32,
}

impl MpaRecvState {
    /// Fresh state for the next frame.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declared ULPDU length, once the header has been read.
    pub fn ulpdu_len(&self) -> Option<usize> {
        self.ulpdu_len.map(usize::from)
    }

    /// ULPDU bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.ulpdu_len().unwrap_or(0) - self.payload_rcvd
    }

    /// True once payload, padding and trailer have all been consumed.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Trailer word of the last completed frame.
    pub fn crc(&self) -> u32 {
        self.crc
    }

    /// Bytes of this frame read so far, header and trailer included.
    pub fn bytes_received(&self) -> usize {
        if self.ulpdu_len.is_none() {
            return 0;
        }
        let trailer = if self.complete {
            self.pad_len + MPA_CRC_SIZE
        } else {
            0
        };
        MPA_HDR_SIZE + self.payload_rcvd + trailer
    }

    /// Forgets the current frame.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Reads up to `dst.len()` ULPDU bytes of the current frame straight into `dst`.
///
/// The first call on a fresh state consumes the length header. The call that
/// takes the last ULPDU byte also consumes the padding and the trailer. Returns
/// the number of frame bytes received so far.
pub fn mpa_recv<R: Read>(r: &mut R, state: &mut MpaRecvState, dst: &mut [u8]) -> Result<usize> {
    let ulpdu_len = match state.ulpdu_len {
        Some(len) => usize::from(len),
        None => {
            let mut hdr = [0u8; MPA_HDR_SIZE];
            r.read_exact(&mut hdr)?;
            let len = u16::from_be_bytes(hdr);
            if len == 0 {
                return Err(IwarpError::frame("MPA frame declares a zero-length ULPDU"));
            }
            trace!(ulpdu_len = len, "received MPA frame header");
            state.ulpdu_len = Some(len);
            usize::from(len)
        }
    };
    if state.complete {
        return Ok(state.bytes_received());
    }

    let n = dst.len().min(ulpdu_len - state.payload_rcvd);
    read_exact_framed(r, &mut dst[..n], "MPA payload")?;
    state.payload_rcvd += n;

    if state.payload_rcvd == ulpdu_len {
        let pad_len = mpa_pad_len(ulpdu_len);
        let mut pad = [0u8; 3];
        read_exact_framed(r, &mut pad[..pad_len], "MPA padding")?;
        let mut crc = [0u8; MPA_CRC_SIZE];
        read_exact_framed(r, &mut crc, "MPA trailer")?;
        state.pad_len = pad_len;
        state.crc = u32::from_be_bytes(crc);
        state.complete = true;
    }
    Ok(state.bytes_received())
}

fn read_exact_framed<R: Read>(r: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    r.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => {
            IwarpError::frame(format!("short read in {what} ({} bytes expected)", buf.len()))
        }
        _ => IwarpError::Io(e),
    })
}

fn write_all_vectored<W: Write>(w: &mut W, mut bufs: &mut [IoSlice<'_>]) -> io::Result<()> {
    IoSlice::advance_slices(&mut bufs, 0);
    while !bufs.is_empty() {
        match w.write_vectored(bufs) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole MPA frame",
                ))
            }
            Ok(n) => IoSlice::advance_slices(&mut bufs, n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::net::TcpListener;
    use std::thread;

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_default_mulpdu() {
        assert_eq!(DEFAULT_MULPDU, 65014);
    }

    #[test]
    fn test_pad_len_aligns_frame() {
        for len in 1..64 {
            assert_eq!((MPA_HDR_SIZE + len + mpa_pad_len(len)) % 4, 0);
            assert!(mpa_pad_len(len) < 4);
        }
        assert_eq!(mpa_pad_len(2), 0);
        assert_eq!(mpa_pad_len(3), 3);
    }

    #[test]
    fn test_send_frame_layout() {
        let mut wire = Vec::new();
        let written = mpa_send(&mut wire, &[&b"abc"[..], &b""[..], &b"de"[..]]).unwrap();
        assert_eq!(written, wire.len());
        assert_eq!(&wire[..2], &[0, 5]);
        assert_eq!(&wire[2..7], b"abcde");
        assert_eq!(&wire[7..8], &[0]);
        assert_eq!(&wire[8..], &[0, 0, 0, 0]);
        assert_eq!(wire.len() % 4, 0);
    }

    #[test]
    fn test_send_rejects_oversized_payload() {
        let big = vec![0u8; MPA_MAX_ULPDU + 1];
        let mut wire = Vec::new();
        let err = mpa_send(&mut wire, &[&big[..]]).unwrap_err();
        assert!(matches!(err, IwarpError::PayloadTooLarge { .. }));
        assert!(wire.is_empty());
    }

    #[test]
    fn test_incremental_recv() {
        let mut wire = Vec::new();
        mpa_send(&mut wire, &[&b"0123456789"[..]]).unwrap();
        let mut cursor = Cursor::new(wire.clone());
        let mut state = MpaRecvState::new();

        let mut first = [0u8; 3];
        let got = mpa_recv(&mut cursor, &mut state, &mut first).unwrap();
        assert_eq!(got, MPA_HDR_SIZE + 3);
        assert_eq!(&first, b"012");
        assert_eq!(state.remaining(), 7);
        assert!(!state.is_complete());

        let mut rest = [0u8; 16];
        let got = mpa_recv(&mut cursor, &mut state, &mut rest).unwrap();
        assert!(state.is_complete());
        assert_eq!(got, wire.len());
        assert_eq!(&rest[..7], b"3456789");
        assert_eq!(state.crc(), 0);
        assert_eq!(cursor.position() as usize, wire.len());

        // Further reads are no-ops.
        assert_eq!(mpa_recv(&mut cursor, &mut state, &mut rest).unwrap(), wire.len());
    }

    #[test]
    fn test_recv_zero_length_rejected() {
        let mut cursor = Cursor::new(vec![0u8, 0, 0, 0, 0, 0, 0, 0]);
        let mut state = MpaRecvState::new();
        let err = mpa_recv(&mut cursor, &mut state, &mut [0u8; 4]).unwrap_err();
        assert!(matches!(err, IwarpError::InvalidFrame { .. }));
    }

    #[test]
    fn test_recv_short_payload_is_framing_error() {
        let mut cursor = Cursor::new(vec![0u8, 8, 1, 2, 3]);
        let mut state = MpaRecvState::new();
        let err = mpa_recv(&mut cursor, &mut state, &mut [0u8; 8]).unwrap_err();
        assert!(matches!(err, IwarpError::InvalidFrame { .. }));
    }

    #[test]
    fn test_rr_header_roundtrip_and_bad_key() {
        let hdr = MpaRrHeader {
            key: MpaKey::Reply,
            flags: MpaRrFlags {
                reject: true,
                ..Default::default()
            },
            revision: MPA_REVISION_1,
            pd_len: 7,
        };
        assert_eq!(MpaRrHeader::decode(&hdr.encode()).unwrap(), hdr);

        let mut raw = hdr.encode();
        raw[0] = b'X';
        assert!(matches!(
            MpaRrHeader::decode(&raw),
            Err(IwarpError::InvalidMpaKey)
        ));
    }

    #[test]
    fn test_handshake_exchanges_private_data() {
        let (mut client, mut server) = loopback_pair();
        let server_thread = thread::spawn(move || mpa_server_accept(&mut server, b"world").unwrap());
        let peer = mpa_client_connect(&mut client, b"hello").unwrap();
        let server_peer = server_thread.join().unwrap();

        assert_eq!(peer.private_data, b"world");
        assert_eq!(peer.revision, MPA_REVISION_1);
        assert_eq!(server_peer.private_data, b"hello");
    }

    #[test]
    fn test_handshake_without_private_data() {
        let (mut client, mut server) = loopback_pair();
        let server_thread = thread::spawn(move || mpa_server_accept(&mut server, &[]).unwrap());
        let peer = mpa_client_connect(&mut client, &[]).unwrap();
        assert!(peer.private_data.is_empty());
        assert!(server_thread.join().unwrap().private_data.is_empty());
    }

    #[test]
    fn test_extra_data_after_request_rejected() {
        let (mut client, mut server) = loopback_pair();
        let hdr = MpaRrHeader {
            key: MpaKey::Request,
            flags: MpaRrFlags::default(),
            revision: MPA_REVISION_1,
            pd_len: 0,
        };
        let mut raw = hdr.encode().to_vec();
        raw.extend_from_slice(b"junk");
        client.write_all(&raw).unwrap();

        let err = mpa_server_accept(&mut server, &[]).unwrap_err();
        assert!(matches!(err, IwarpError::ExtraHandshakeData { extra: 4 }));
    }

    #[test]
    fn test_rejected_reply() {
        let (mut client, mut server) = loopback_pair();
        let server_thread = thread::spawn(move || {
            let mut request = [0u8; MPA_RR_HDR_SIZE];
            server.read_exact(&mut request).unwrap();
            let reply = MpaRrHeader {
                key: MpaKey::Reply,
                flags: MpaRrFlags {
                    reject: true,
                    ..Default::default()
                },
                revision: MPA_REVISION_1,
                pd_len: 0,
            };
            server.write_all(&reply.encode()).unwrap();
        });
        let err = mpa_client_connect(&mut client, &[]).unwrap_err();
        assert!(matches!(err, IwarpError::HandshakeRejected));
        server_thread.join().unwrap();
    }

    #[test]
    fn test_private_data_limit() {
        let (mut client, _server) = loopback_pair();
        let pdata = vec![0u8; MPA_MAX_PRIVDATA + 1];
        let err = mpa_client_connect(&mut client, &pdata).unwrap_err();
        assert!(matches!(err, IwarpError::PrivateDataTooLarge { .. }));
    }
}
