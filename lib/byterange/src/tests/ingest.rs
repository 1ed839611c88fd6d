//! Sent-side ingest: range creation, retransmit and RDB classification, splits, wraparound
//! and the port-reuse guard.

use super::TestConn;
use crate::{SentKind, TcpFlags};

const FIRST: u32 = 1000;

#[test]
fn test_fresh_send() {
    let mut t = TestConn::new(FIRST);
    t.send(FIRST, 1000, 0);

    assert_eq!(t.bounds(), vec![(0, 1000)]);
    let br = t.ranges()[0];
    assert_eq!(br.packet_sent_count, 1);
    assert_eq!(br.byte_count(), 1000);
    assert_eq!(t.conn.tot_new_data_sent, 1000);
    assert_eq!(t.conn.rm.last_seq, 1000);
}

#[test]
fn test_identical_retransmit() {
    let mut t = TestConn::new(FIRST);
    t.send(FIRST, 1000, 0);
    t.send(FIRST, 1000, 50);

    // covers the existing range exactly on both ends: recorded on that range only
    assert_eq!(t.bounds(), vec![(0, 1000)]);
    let br = t.ranges()[0];
    assert_eq!(br.packet_sent_count, 1);
    assert_eq!(br.packet_retrans_count, 1);
    assert_eq!(br.data_retrans_count, 1);
    assert_eq!(t.conn.tot_retrans_bytes_sent, 1000);
    assert_eq!(t.conn.nr_packet_retrans, 1);
}

#[test]
fn test_rdb_bundle() {
    let mut t = TestConn::new(FIRST);
    t.send(FIRST, 1000, 0);
    // resends [500, 1000) bundled with 500 new bytes
    t.send(FIRST + 500, 1000, 20);

    assert_eq!(t.bounds(), vec![(0, 500), (500, 1000), (1000, 1500)]);
    let middle = t.ranges()[1];
    assert_eq!(middle.rdb_count, 1);
    assert_eq!(t.conn.tot_rdb_bytes_sent, 500);
    assert_eq!(t.conn.tot_new_data_sent, 1500);
    assert_eq!(t.conn.bundle_count, 1);
    assert_eq!(t.conn.rm.last_seq, 1500);

    // byte conservation across the classification
    assert_eq!(
        t.conn.tot_bytes_sent,
        t.conn.tot_new_data_sent + t.conn.tot_rdb_bytes_sent + t.conn.tot_retrans_bytes_sent
    );
}

#[test]
fn test_partial_retransmit_splits_in_middle() {
    let mut t = TestConn::new(FIRST);
    t.send(FIRST, 1000, 0);
    // retransmit of the middle 200 bytes only
    t.send(FIRST + 400, 200, 30);

    assert_eq!(t.bounds(), vec![(0, 400), (400, 600), (600, 1000)]);
    let middle = t.ranges()[1];
    assert_eq!(middle.data_retrans_count, 1);
    assert_eq!(middle.packet_retrans_count, 1);
    // the outer pieces keep the original send history but no extra events
    assert_eq!(t.ranges()[0].data_retrans_count, 0);
    assert_eq!(t.ranges()[2].data_retrans_count, 0);
}

#[test]
fn test_retransmit_spanning_two_ranges() {
    let mut t = TestConn::new(FIRST);
    t.send(FIRST, 500, 0);
    t.send(FIRST + 500, 500, 10);
    // one retransmit packet covering both
    t.send(FIRST, 1000, 50);

    assert_eq!(t.bounds(), vec![(0, 500), (500, 1000)]);
    let (a, b) = (t.ranges()[0], t.ranges()[1]);
    // packet identity lands on the head range only
    assert_eq!(a.packet_retrans_count, 1);
    assert_eq!(b.packet_retrans_count, 0);
    assert_eq!(a.data_retrans_count, 1);
    assert_eq!(b.data_retrans_count, 1);
}

#[test]
fn test_wraparound_relative_seqs() {
    let first = 0xFFFF_FF00u32;
    let mut t = TestConn::new(first);
    t.send(first, 100, 0);
    // 256 bytes past first the absolute space wraps to 0
    t.send(0, 100, 10);

    assert_eq!(t.bounds(), vec![(0, 100), (256, 356)]);
}

#[test]
fn test_pure_ack_attaches_to_control_anchor() {
    let mut t = TestConn::new(FIRST);
    t.send(FIRST, 1000, 0);
    t.send_flags(FIRST + 1000, 0, 10, TcpFlags::FIN | TcpFlags::ACK);
    // a later bare ack at the position one past the FIN anchor folds onto it
    t.send_flags(FIRST + 1001, 0, 20, TcpFlags::ACK);

    assert_eq!(t.bounds(), vec![(0, 1000), (1000, 1000)]);
    let anchor = t.ranges()[1];
    assert_eq!(anchor.fin, 1);
    assert_eq!(anchor.acked_sent, 1);
}

#[test]
fn test_first_packet_without_syn_hijacks_anchor() {
    let mut t = TestConn::new(FIRST);
    // the capture starts with a bare ack, then data arrives at the same position
    t.send_flags(FIRST, 0, 0, TcpFlags::ACK);
    assert_eq!(t.bounds(), vec![(0, 0)]);

    t.send(FIRST, 1000, 10);
    assert_eq!(t.bounds(), vec![(0, 1000)]);
    let br = t.ranges()[0];
    assert_eq!(br.acked_sent, 1);
    assert_eq!(br.packet_sent_count, 1);
    assert_eq!(br.original_payload_size, 1000);
}

#[test]
fn test_syn_retry_reanchors() {
    let mut t = TestConn::new(FIRST);
    t.send_flags(FIRST, 0, 0, TcpFlags::SYN);
    // retry after timeout with the same seq: counted on the same anchor
    t.send_flags(FIRST, 0, 1000, TcpFlags::SYN);

    assert_eq!(t.bounds(), vec![(0, 0)]);
    assert_eq!(t.ranges()[0].syn, 2);
    assert!(!t.conn.closed);
}

#[test]
fn test_syn_port_reuse_closes_connection() {
    let mut t = TestConn::new(FIRST);
    t.send_flags(FIRST, 0, 0, TcpFlags::SYN);
    t.send(FIRST + 1, 500, 10);

    // a SYN far away in sequence space is a new connection on the same port
    t.send_flags(50_000, 0, 5_000, TcpFlags::SYN);
    assert!(t.conn.closed);

    let ranges_before = t.conn.rm.range_count();
    t.send(50_001, 500, 5_010);
    assert_eq!(t.conn.rm.range_count(), ranges_before);
    assert!(t.conn.ignored_count >= 2);
}

#[test]
fn test_trace_gap_leaves_hole() {
    let mut t = TestConn::new(FIRST);
    t.send(FIRST, 1000, 0);
    // the capture dropped everything in [1000, 2000)
    t.send(FIRST + 2000, 100, 50);

    assert_eq!(t.bounds(), vec![(0, 1000), (2000, 2100)]);
    // the covered span was not advanced past the hole, which validation reports
    assert!(t.conn.validate_ranges().is_err());
}

#[test]
fn test_rdb_packet_identity_on_bundled_head() {
    let mut t = TestConn::new(FIRST);
    t.send(FIRST, 500, 0);
    t.send(FIRST + 500, 500, 10);
    // bundle resending all of [500, 1000) plus 500 new bytes; the bundled head starts
    // exactly on a range boundary
    t.send(FIRST + 500, 1000, 20);

    assert_eq!(t.bounds(), vec![(0, 500), (500, 1000), (1000, 1500)]);
    let head = t.ranges()[1];
    // identity recorded on the first covered range; the new-data tail carries none
    assert_eq!(head.packet_sent_count, 2);
    assert_eq!(head.rdb_count, 1);
    let tail = t.ranges()[2];
    assert_eq!(tail.packet_sent_count, 0);
    assert!(tail
        .sent_tstamp_pcap
        .iter()
        .all(|&(_, k)| k == SentKind::None));
}

#[test]
fn test_received_only_range_is_flagged() {
    let mut t = TestConn::with_recv(FIRST);
    t.send(FIRST, 1000, 0);
    // the receiver saw 500 bytes the sender capture never recorded
    t.recv(FIRST + 2000, 500, 100, 99);

    assert_eq!(t.bounds(), vec![(0, 1000), (2000, 2500)]);
    let ghost = t.ranges()[1];
    assert_eq!(ghost.data_received_count, 1);
    assert_eq!(ghost.data_sent_count(), 0);
}

#[test]
fn test_sojourn_sample_attaches_without_split() {
    let mut t = TestConn::new(FIRST);
    t.send(FIRST, 1000, 10);
    t.sojourn(FIRST, 1000, 4);

    assert_eq!(t.bounds(), vec![(0, 1000)]);
    let br = t.ranges()[0];
    assert_eq!(br.sojourn_tstamps.len(), 1);
    assert_eq!(br.sojourn_times(), vec![(1000, 6000)]);
}

#[test]
fn test_event_conservation_with_mixed_traffic() {
    let mut t = TestConn::new(FIRST);
    t.send(FIRST, 1000, 0);
    t.send(FIRST + 1000, 1000, 10);
    t.send(FIRST + 500, 500, 20); // retransmit
    t.send(FIRST + 1500, 1000, 30); // rdb: 500 old + 500 new
    t.send(FIRST + 2500, 200, 40); // new

    assert_eq!(
        t.conn.tot_bytes_sent,
        t.conn.tot_new_data_sent + t.conn.tot_rdb_bytes_sent + t.conn.tot_retrans_bytes_sent
    );
    assert!(t.conn.validate_ranges().is_ok());
}
