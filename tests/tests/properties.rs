//! Property tests for the transport's core invariants: segment
//! reassembly under arbitrary reordering and duplication, message
//! accounting, and congestion-window bounds.

use proptest::prelude::*;
use skein_core::{Eid, StreamHandle, StreamId};
use skein_stream::proto::FLOW_HDR;
use skein_stream::stream::{BaseStream, RxSegment, StreamState};

/// Build a sender-side stream, segment `payload` into packets, and return
/// the prepared wire segments (as the receiver would see them).
fn segments_for(payload: &[u8], end_flags: u8, mtu: usize) -> Vec<RxSegment> {
    let mut tx = BaseStream::new(StreamHandle(1), Eid::from("tx"), 16);
    tx.state = StreamState::Connected;
    tx.sid = StreamId(1);
    tx.mature = true;
    tx.write_segments(payload, end_flags, mtu);
    tx.tqueue
        .iter()
        .map(|pkt| {
            let mut pkt = pkt.clone();
            tx.tx_prepare(&mut pkt, StreamId::ROOT);
            RxSegment { rsn: pkt.tsn, buf: pkt.buf, hdr_len: pkt.hdr_len, consumed: 0 }
        })
        .collect()
}

fn receiver() -> BaseStream {
    let mut rx = BaseStream::new(StreamHandle(2), Eid::from("rx"), 16);
    rx.state = StreamState::Connected;
    rx.sid = StreamId(0x8001);
    rx
}

proptest! {
    /// Any delivery order with arbitrary duplication reassembles the
    /// exact byte sequence, and the coverage accounting never slips:
    /// in-order bytes plus reorder-parked segments cover each position
    /// at most once.
    #[test]
    fn reassembly_is_order_and_duplication_independent(
        payload in proptest::collection::vec(any::<u8>(), 1..4000),
        order in proptest::collection::vec(any::<prop::sample::Index>(), 0..64),
        mtu in 16usize..512,
    ) {
        let segs = segments_for(&payload, skein_stream::proto::FLAG_MESSAGE, mtu);
        let mut rx = receiver();

        // A shuffled, duplicated prefix of deliveries...
        for idx in &order {
            let seg = &segs[idx.index(segs.len())];
            rx.rx_segment(seg.clone());
            prop_assert!(rx.message_bytes_queued() <= rx.bytes_available());
        }
        // ...followed by one pass of everything, so delivery completes.
        for seg in &segs {
            rx.rx_segment(seg.clone());
            prop_assert!(rx.message_bytes_queued() <= rx.bytes_available());
        }

        prop_assert_eq!(rx.bytes_available(), payload.len() as u64);
        let got = rx.read_message(usize::MAX / 2).expect("a complete message");
        prop_assert_eq!(got, payload);
        prop_assert_eq!(rx.bytes_available(), 0);
    }

    /// Message boundaries never merge or split, whatever the segment
    /// interleaving of two consecutive messages.
    #[test]
    fn message_boundaries_never_merge(
        first in proptest::collection::vec(any::<u8>(), 1..1500),
        second in proptest::collection::vec(any::<u8>(), 1..1500),
        mtu in 32usize..256,
    ) {
        let mut tx = BaseStream::new(StreamHandle(1), Eid::from("tx"), 16);
        tx.state = StreamState::Connected;
        tx.sid = StreamId(1);
        tx.mature = true;
        tx.write_segments(&first, skein_stream::proto::FLAG_MESSAGE, mtu);
        tx.write_segments(&second, skein_stream::proto::FLAG_MESSAGE, mtu);
        let segs: Vec<RxSegment> = tx
            .tqueue
            .iter()
            .map(|pkt| {
                let mut pkt = pkt.clone();
                tx.tx_prepare(&mut pkt, StreamId::ROOT);
                RxSegment { rsn: pkt.tsn, buf: pkt.buf, hdr_len: pkt.hdr_len, consumed: 0 }
            })
            .collect();

        // Deliver in reverse to maximize reorder-buffer churn.
        let mut rx = receiver();
        for seg in segs.iter().rev() {
            rx.rx_segment(seg.clone());
        }
        prop_assert_eq!(rx.pending_messages(), 2);
        prop_assert_eq!(rx.read_message(usize::MAX / 2).expect("first"), first);
        prop_assert_eq!(rx.read_message(usize::MAX / 2).expect("second"), second);
    }

    /// The congestion window stays inside its configured bounds under
    /// arbitrary sequences of acks, losses, round trips and timeouts.
    #[test]
    fn congestion_window_stays_bounded(
        mode in prop::sample::select(vec![
            skein_core::CongestionMode::Tcp,
            skein_core::CongestionMode::Aggressive,
            skein_core::CongestionMode::Delay,
            skein_core::CongestionMode::Vegas,
        ]),
        ops in proptest::collection::vec((0u8..5, 1u64..64, 1u64..2_000_000), 1..200),
    ) {
        let min = 2;
        let max = 64;
        let mut cc = skein_stream::congestion::Congestion::new(mode, min, max);
        for (op, n, t) in ops {
            match op {
                0 => { let _ = cc.may_transmit(n); }
                1 => cc.on_acks(n, n * 2, t as f64, 1000.0),
                2 => cc.on_loss(),
                3 => cc.on_round_trip(t as f64, n as f64, n as f64 / t as f64, n * 2, n),
                _ => cc.on_rtx_timeout(n),
            }
            prop_assert!(cc.window() >= min && cc.window() <= max,
                "window {} out of [{min}, {max}]", cc.window());
        }
    }
}

#[test]
fn flags_ride_the_type_byte() {
    // The receiver reads subtype flags straight out of the parked buffer;
    // the offset must match the wire layout.
    let segs = segments_for(b"x", skein_stream::proto::FLAG_MESSAGE, 64);
    assert_eq!(segs.len(), 1);
    let flags = segs[0].buf[FLOW_HDR + 2] & 0x0f;
    assert_ne!(flags & skein_stream::proto::FLAG_MESSAGE, 0);
    assert_ne!(flags & skein_stream::proto::FLAG_PUSH, 0);
}
