//! ACK processing: splits at ack boundaries, cursor monotonicity, duplicate-ACK counting and
//! the FIN sequence-space rules.

use super::TestConn;
use crate::TcpFlags;

const FIRST: u32 = 1000;

#[test]
fn test_ack_splits_range() {
    let mut t = TestConn::new(FIRST);
    t.send(FIRST, 1000, 0);
    t.ack(FIRST + 400, 65535, 20);

    assert_eq!(t.bounds(), vec![(0, 400), (400, 1000)]);
    let acked = t.ranges()[0];
    assert!(acked.is_acked());
    assert_eq!(acked.ack_count, 1);
    assert_eq!(acked.send_ack_time_diff(), 20_000);
    assert!(!t.ranges()[1].is_acked());
}

#[test]
fn test_ack_covers_multiple_ranges() {
    let mut t = TestConn::new(FIRST);
    t.send(FIRST, 500, 0);
    t.send(FIRST + 500, 500, 10);
    t.ack(FIRST + 1000, 65535, 30);

    assert!(t.ranges().iter().all(|r| r.is_acked()));
    let cursor = t.conn.rm.highest_acked().unwrap();
    assert_eq!(cursor.start, 500);
}

#[test]
fn test_cursor_never_moves_backward() {
    let mut t = TestConn::new(FIRST);
    t.send(FIRST, 1000, 0);
    t.ack(FIRST + 400, 65535, 20);
    assert_eq!(t.conn.rm.highest_acked().unwrap().start, 400);

    // an old ack must not move the cursor back
    t.ack(FIRST + 200, 65535, 30);
    assert_eq!(t.conn.rm.highest_acked().unwrap().start, 400);
}

#[test]
fn test_duplicate_acks_counted_on_equal_window() {
    let mut t = TestConn::new(FIRST);
    t.send(FIRST, 1000, 0);
    t.send(FIRST + 1000, 1000, 10);

    t.ack(FIRST + 1000, 500, 20);
    t.ack(FIRST + 1000, 500, 25);
    t.ack(FIRST + 1000, 500, 30);

    let br = t.ranges()[0];
    assert_eq!(br.dupack_count, 2);
    assert_eq!(br.ack_count, 3);
}

#[test]
fn test_zero_window_probe_is_not_duplicate() {
    let mut t = TestConn::new(FIRST);
    t.send(FIRST, 1000, 0);
    t.ack(FIRST + 1000, 500, 20);
    t.ack(FIRST + 1000, 0, 25);

    assert_eq!(t.ranges()[0].dupack_count, 0);
}

#[test]
fn test_window_change_is_not_duplicate() {
    let mut t = TestConn::new(FIRST);
    t.send(FIRST, 1000, 0);
    t.ack(FIRST + 1000, 500, 20);
    t.ack(FIRST + 1000, 800, 25);

    let br = t.ranges()[0];
    assert_eq!(br.dupack_count, 0);
    assert_eq!(br.tcp_window, 800);
}

#[test]
fn test_fin_ack_lands_on_anchor() {
    let mut t = TestConn::new(FIRST);
    t.send(FIRST, 1000, 0);
    t.send_flags(FIRST + 1000, 0, 10, TcpFlags::FIN | TcpFlags::ACK);

    // the FIN consumes one sequence number, so its ack is one past the anchor
    t.ack(FIRST + 1001, 65535, 30);

    let anchor = t.ranges()[1];
    assert_eq!((anchor.start, anchor.end), (1000, 1000));
    assert_eq!(anchor.ack_count, 1);
    assert!(anchor.is_acked());
    // the data before the FIN was acked on the way
    assert!(t.ranges()[0].is_acked());
}

#[test]
fn test_fin_on_data_packet_one_byte_gap() {
    let mut t = TestConn::new(FIRST);
    t.send(FIRST, 500, 0);
    t.send_flags(FIRST + 500, 500, 10, TcpFlags::FIN | TcpFlags::ACK);
    t.ack(FIRST + 500, 65535, 20);

    // ack of the FIN: one past the final data byte
    t.ack(FIRST + 1001, 65535, 40);

    let last = t.ranges()[1];
    assert_eq!(last.fin, 1);
    assert!(last.is_acked());
}

#[test]
fn test_ack_for_unsent_data_is_counted_not_fatal() {
    let mut t = TestConn::new(FIRST);
    t.send(FIRST, 1000, 0);
    t.ack(FIRST + 5000, 65535, 20);

    assert_eq!(t.conn.ack_failures, 0); // the data range did get acked on the walk
    t.ack(FIRST + 7000, 65535, 30);
    assert_eq!(t.conn.ack_failures, 1);
    assert!(t.conn.failure.is_none());
}

#[test]
fn test_ack_suppressed_for_echo_of_own_ack() {
    let mut t = TestConn::new(FIRST);
    t.send(FIRST, 1000, 0);
    // outgoing bare ack creates an anchor whose TSecr is the peer's current TSval
    let mut seg = crate::DataSeg {
        seq_absolute: FIRST + 1000,
        payload_size: 0,
        flags: TcpFlags::ACK,
        tstamp_pcap: super::ms(15),
        tstamp_tcp: 77,
        tstamp_tcp_echo: 42,
        ..crate::DataSeg::default()
    };
    t.conn.register_sent(&mut seg, &t.cfg.clone());

    // the peer acks the whole stream carrying TSval 42: for the anchor this is the very ack
    // the anchor itself acknowledged, so no ack time is recorded on it
    let mut ack = crate::DataSeg {
        ack_absolute: FIRST + 1001,
        window: 100,
        flags: TcpFlags::ACK,
        tstamp_pcap: super::ms(30),
        tstamp_tcp: 42,
        ..crate::DataSeg::default()
    };
    t.conn.register_ack(&mut ack);

    assert!(t.ranges()[0].is_acked());
    let anchor = t.ranges()[1];
    assert_eq!((anchor.start, anchor.end), (1000, 1000));
    assert!(!anchor.is_acked());
    assert_eq!(anchor.ack_count, 1);
}
