//! Property-based tests for DDP segmentation and placement.

use std::io::Cursor;
use std::sync::Arc;

use proptest::prelude::*;
use uiwarp::{
    mpa_recv, AccessFlags, DdpContext, DdpMessage, DdpReceiver, DdpSender, IwarpError,
    MemoryRegion, MpaRecvState, ProtectionDomain, TaggedMeta, UntaggedBuffer, UntaggedMeta,
};

const TAGGED_FLAG: u8 = 0x80;
const LAST_FLAG: u8 = 0x40;
const TAGGED_HDR: usize = 1 + 13;
const UNTAGGED_HDR: usize = 1 + 17;

/// A segment size and a payload of zero to four segments' worth.
fn mulpdu_and_payload() -> impl Strategy<Value = (usize, Vec<u8>)> {
    (1usize..48).prop_flat_map(|mulpdu| {
        (
            Just(mulpdu),
            prop::collection::vec(any::<u8>(), 0..=mulpdu * 4),
        )
    })
}

fn messages_strategy() -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..8)
}

fn untagged(qn: u32, msn: u32, rsvd_ulp2: u32) -> UntaggedMeta {
    UntaggedMeta {
        rsvd_ulp1: 0,
        rsvd_ulp2,
        qn,
        msn,
        mo: 0,
    }
}

/// Splits a wire capture into `(control octet, payload length)` per frame.
fn frames(wire: Vec<u8>) -> Vec<(u8, usize)> {
    let total = wire.len() as u64;
    let mut cursor = Cursor::new(wire);
    let mut out = Vec::new();
    let mut ulpdu = vec![0u8; 65535];
    while cursor.position() < total {
        let mut state = MpaRecvState::new();
        mpa_recv(&mut cursor, &mut state, &mut ulpdu).unwrap();
        assert!(state.is_complete());
        let len = state.ulpdu_len().unwrap();
        let ctrl = ulpdu[0];
        let hdr = if ctrl & TAGGED_FLAG != 0 {
            TAGGED_HDR
        } else {
            UNTAGGED_HDR
        };
        out.push((ctrl, len - hdr));
    }
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_tagged_placement_matches_payload((mulpdu, payload) in mulpdu_and_payload()) {
        let pd = ProtectionDomain::new();
        let ctx = Arc::new(DdpContext::new(pd));
        let region = MemoryRegion::new(pd, payload.len().max(1), AccessFlags::REMOTE_WRITE);
        let stag = ctx.register_tagged_buffer(Arc::clone(&region)).unwrap();

        let mut tx = DdpSender::new(Vec::new(), mulpdu);
        let meta = TaggedMeta { rsvd_ulp: 0x40, stag, to: region.addr() };
        tx.send_tagged(meta, &[&payload[..]]).unwrap();

        let mut rx = DdpReceiver::new(Cursor::new(tx.into_inner()), ctx);
        match rx.recv().unwrap() {
            DdpMessage::Tagged { stag: got, len, segments, .. } => {
                prop_assert_eq!(got, stag);
                prop_assert_eq!(len, payload.len());
                prop_assert_eq!(segments, payload.len().div_ceil(mulpdu).max(1));
            }
            other => prop_assert!(false, "unexpected message {:?}", other),
        }
        prop_assert_eq!(&region.to_vec()[..payload.len()], &payload[..]);
    }

    #[test]
    fn test_untagged_placement_spans_buffer_parts(
        (mulpdu, payload) in mulpdu_and_payload(),
        split in 0usize..64,
    ) {
        let pd = ProtectionDomain::new();
        let ctx = Arc::new(DdpContext::new(pd));
        let first_len = split.min(payload.len()) + 1;
        let second_len = payload.len() + 1;
        let first = MemoryRegion::new(pd, first_len, AccessFlags::LOCAL_WRITE);
        let second = MemoryRegion::new(pd, second_len, AccessFlags::LOCAL_WRITE);
        let mut buffer = UntaggedBuffer::new();
        buffer.push(Arc::clone(&first), 0, first_len).unwrap();
        buffer.push(Arc::clone(&second), 0, second_len).unwrap();
        ctx.post_recv(0, [buffer]).unwrap();

        let mut tx = DdpSender::new(Vec::new(), mulpdu);
        tx.send_untagged(untagged(0, 1, 0), &[&payload[..]]).unwrap();

        let mut rx = DdpReceiver::new(Cursor::new(tx.into_inner()), Arc::clone(&ctx));
        let msg = rx.recv().unwrap();
        prop_assert_eq!(msg.len(), payload.len());
        let mut placed = first.to_vec();
        placed.extend_from_slice(&second.to_vec());
        prop_assert_eq!(&placed[..payload.len()], &payload[..]);
        prop_assert_eq!(ctx.queue(0).unwrap().expected_msn(), 2);
    }

    #[test]
    fn test_segment_count_and_last_flag((mulpdu, payload) in mulpdu_and_payload(), tagged in any::<bool>()) {
        let mut tx = DdpSender::new(Vec::new(), mulpdu);
        let count = if tagged {
            tx.send_tagged(TaggedMeta { rsvd_ulp: 0, stag: 1, to: 0 }, &[&payload[..]]).unwrap()
        } else {
            tx.send_untagged(untagged(0, 1, 0), &[&payload[..]]).unwrap()
        };
        let expected = payload.len().div_ceil(mulpdu).max(1);
        prop_assert_eq!(count, expected);

        let frames = frames(tx.into_inner());
        prop_assert_eq!(frames.len(), expected);
        let mut total = 0;
        for (i, (ctrl, len)) in frames.iter().enumerate() {
            prop_assert_eq!(ctrl & TAGGED_FLAG != 0, tagged);
            prop_assert_eq!(ctrl & LAST_FLAG != 0, i + 1 == expected);
            prop_assert!(*len <= mulpdu);
            total += len;
        }
        prop_assert_eq!(total, payload.len());
    }

    #[test]
    fn test_untagged_messages_fill_buffers_in_order(
        messages in messages_strategy(),
        mulpdu in 1usize..32,
    ) {
        let pd = ProtectionDomain::new();
        let ctx = Arc::new(DdpContext::new(pd));
        let regions: Vec<_> = messages
            .iter()
            .map(|_| MemoryRegion::new(pd, 64, AccessFlags::LOCAL_WRITE))
            .collect();
        for region in &regions {
            ctx.post_recv(0, [UntaggedBuffer::whole(Arc::clone(region)).unwrap()]).unwrap();
        }

        let mut tx = DdpSender::new(Vec::new(), mulpdu);
        for (i, msg) in messages.iter().enumerate() {
            tx.send_untagged(untagged(0, i as u32 + 1, i as u32), &[&msg[..]]).unwrap();
        }
        // A replay of the first message must be refused.
        tx.send_untagged(untagged(0, 1, 0), &[&b"late"[..]]).unwrap();

        let mut rx = DdpReceiver::new(Cursor::new(tx.into_inner()), Arc::clone(&ctx));
        for (i, msg) in messages.iter().enumerate() {
            match rx.recv().unwrap() {
                DdpMessage::Untagged { msn, rsvd_ulp2, len, buffer, .. } => {
                    prop_assert_eq!(msn, i as u32 + 1);
                    prop_assert_eq!(rsvd_ulp2, i as u32);
                    prop_assert_eq!(len, msg.len());
                    prop_assert_eq!(buffer.copy_out(len), msg.clone());
                }
                other => prop_assert!(false, "unexpected message {:?}", other),
            }
            prop_assert_eq!(&regions[i].to_vec()[..msg.len()], &msg[..]);
        }
        let expected = messages.len() as u32 + 1;
        let regression = matches!(
            rx.recv(),
            Err(IwarpError::MsnRegression { qn: 0, msn: 1, expected: e }) if e == expected
        );
        prop_assert!(regression);
    }
}
