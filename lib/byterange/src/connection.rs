use std::time::Duration;

use crate::manager::RangeManager;
use crate::seq::{self, Seq};
use crate::stats::{ConnStats, PacketsStats};
use crate::util::{dur_ms, dur_us};
use crate::{Config, DataSeg, SeqError, TcpFlags};

/// A SYN whose absolute sequence number moves more than this far from the connection's anchor
/// is a new connection reusing the port, not a retry.
const SYN_REUSE_DELTA: i64 = 10;

/// Which of a connection's event streams an absolute sequence number belongs to. Each stream
/// keeps its own monotone anchor for the relative lift.
#[derive(Copy, Clone, Debug)]
enum RelSeqStream {
    SendOut,
    SendAck,
    RecvInn,
    Sojourn,
}

/// One wire packet bucketed for throughput accounting.
#[derive(Copy, Clone, Debug)]
pub struct PacketSize {
    pub time: Duration,
    pub packet_size: u32,
    pub payload_size: u16,
    pub retrans: bool,
}

/// Sums over one throughput bucket.
#[derive(Copy, Clone, Debug, Default)]
pub struct PacketSizeGroup {
    pub count: u64,
    pub bytes: u64,
    pub payload_bytes: u64,
    pub retrans_count: u64,
}

impl PacketSizeGroup {
    fn add(&mut self, ps: &PacketSize) {
        self.count += 1;
        self.bytes += ps.packet_size as u64;
        self.payload_bytes += ps.payload_size as u64;
        self.retrans_count += ps.retrans as u64;
    }
}

/// One observed TCP connection (one data direction): the range map plus the connection-wide
/// classification state and counters. All `register_*` entry points take raw absolute sequence
/// numbers and perform the relative lift internally.
#[derive(Debug)]
pub struct Connection {
    /// Printable connection key ("src:port-dst:port").
    pub key: String,
    pub rm: RangeManager,

    // relative-lift anchors, one pair per event stream
    last_largest_end_seq: u64,
    last_largest_seq_absolute: u32,
    last_largest_start_seq: u64,
    last_largest_ack_seq: u64,
    last_largest_ack_seq_absolute: u32,
    last_largest_recv_end_seq: u64,
    last_largest_recv_seq_absolute: u32,
    last_largest_sojourn_end_seq: u64,
    last_largest_sojourn_seq_absolute: u32,

    // ingest totals
    pub tot_bytes_sent: u64,
    pub tot_new_data_sent: u64,
    pub tot_rdb_bytes_sent: u64,
    pub tot_retrans_bytes_sent: u64,
    pub tot_packet_size: u64,
    pub nr_packets_sent: u64,
    pub nr_data_packets_sent: u64,
    pub nr_packet_retrans: u64,
    pub bundle_count: u64,

    /// Packets ignored after the connection closed or failed.
    pub ignored_count: u64,
    /// Events dropped for out-of-window sequence numbers.
    pub dropped_events: u64,
    /// ACKs that could not be attributed to any range.
    pub ack_failures: u64,

    /// Port was reused by a new connection; later packets are ignored.
    pub closed: bool,
    /// Set when analysis of this connection failed fatally; the reason is reported at the end
    /// of the run and the connection is excluded from statistics.
    pub failure: Option<String>,

    first_send_time: Option<Duration>,
    /// Per-bucket packets for throughput and per-packet ITT output.
    pub packet_sizes: Vec<Vec<PacketSize>>,
    pub packet_size_groups: Vec<PacketSizeGroup>,

    packets_stats: Option<PacketsStats>,
}

impl Connection {
    pub fn new(key: String, first_seq: u32) -> Self {
        Self {
            key,
            rm: RangeManager::new(first_seq),
            last_largest_end_seq: 0,
            last_largest_seq_absolute: 0,
            last_largest_start_seq: 0,
            last_largest_ack_seq: 0,
            last_largest_ack_seq_absolute: 0,
            last_largest_recv_end_seq: 0,
            last_largest_recv_seq_absolute: 0,
            last_largest_sojourn_end_seq: 0,
            last_largest_sojourn_seq_absolute: 0,
            tot_bytes_sent: 0,
            tot_new_data_sent: 0,
            tot_rdb_bytes_sent: 0,
            tot_retrans_bytes_sent: 0,
            tot_packet_size: 0,
            nr_packets_sent: 0,
            nr_data_packets_sent: 0,
            nr_packet_retrans: 0,
            bundle_count: 0,
            ignored_count: 0,
            dropped_events: 0,
            ack_failures: 0,
            closed: false,
            failure: None,
            first_send_time: None,
            packet_sizes: Vec::new(),
            packet_size_groups: Vec::new(),
            packets_stats: None,
        }
    }

    fn relative(&self, stream: RelSeqStream, abs: u32) -> Result<u64, SeqError> {
        let (largest_rel, largest_abs) = match stream {
            RelSeqStream::SendOut => (self.last_largest_end_seq, self.last_largest_seq_absolute),
            RelSeqStream::SendAck => (
                self.last_largest_ack_seq,
                self.last_largest_ack_seq_absolute,
            ),
            RelSeqStream::RecvInn => (
                self.last_largest_recv_end_seq,
                self.last_largest_recv_seq_absolute,
            ),
            RelSeqStream::Sojourn => (
                self.last_largest_sojourn_end_seq,
                self.last_largest_sojourn_seq_absolute,
            ),
        };
        seq::relative_of(
            Seq::new(abs),
            Seq::new(self.rm.first_seq),
            largest_rel,
            Seq::new(largest_abs),
        )
    }

    fn poison(&mut self, why: String) {
        log::warn!("{}: {why}; skipping the rest of this connection", self.key);
        if self.failure.is_none() {
            self.failure = Some(why);
        }
    }

    /// Classify and register one outgoing segment: new data, RDB bundle or retransmission.
    pub fn register_sent(&mut self, seg: &mut DataSeg, cfg: &Config) {
        self.tot_packet_size += seg.total_size as u64;
        self.nr_packets_sent += 1;
        if self.first_send_time.is_none() {
            self.first_send_time = Some(seg.tstamp_pcap);
        }

        if self.failure.is_some() || self.closed {
            self.ignored_count += 1;
            return;
        }

        match self.relative(RelSeqStream::SendOut, seg.seq_absolute) {
            Ok(rel) => {
                seg.seq = rel;
                seg.end_seq = rel + seg.payload_size as u64;
            }
            Err(SeqError::OutOfWindow) => {
                if seg.flags.contains(TcpFlags::SYN) {
                    if !self.handle_syn_jump(seg) {
                        return;
                    }
                } else {
                    log::warn!(
                        "{}: seq {} precedes the first seq of the connection; dropping",
                        self.key,
                        seg.seq_absolute
                    );
                    self.dropped_events += 1;
                    return;
                }
            }
            Err(SeqError::InvalidSequence) => {
                self.poison("sequence number calculation failed".to_owned());
                return;
            }
        }

        // a seq jump without matching data is a SYN retry or a reused port
        if seg.end_seq > self.last_largest_end_seq
            && self.last_largest_end_seq + 1 != seg.seq
            && seg.flags.contains(TcpFlags::SYN)
            && seg.seq != 0
            && !self.handle_syn_jump(seg)
        {
            return;
        }

        if seg.payload_size == 0 {
            // pure control packet (SYN/FIN/RST or a bare ack on this side)
            self.insert_sent(seg, cfg);
            return;
        }

        if seg.end_seq > self.last_largest_end_seq {
            if seg.seq < self.last_largest_end_seq {
                // old and new data in one segment: an RDB bundle
                self.tot_rdb_bytes_sent += self.last_largest_end_seq - seg.seq;
                self.tot_new_data_sent += seg.end_seq - self.last_largest_end_seq;
                self.bundle_count += 1;
                seg.is_rdb = true;
                seg.rdb_end_seq = self.last_largest_end_seq;
            } else {
                self.tot_new_data_sent += seg.payload_size as u64;
            }
            self.last_largest_end_seq = seg.end_seq;
            self.last_largest_seq_absolute =
                seg.seq_absolute.wrapping_add(seg.payload_size as u32);
        } else {
            self.nr_packet_retrans += 1;
            self.tot_retrans_bytes_sent += seg.payload_size as u64;
            seg.retrans = true;
        }

        self.nr_data_packets_sent += 1;
        self.last_largest_start_seq = seg.seq;
        self.tot_bytes_sent += seg.payload_size as u64;

        self.insert_sent(seg, cfg);
        self.register_packet_size(seg, cfg);
    }

    /// A SYN that does not continue the known stream. Within a small delta it is a retry after
    /// timeout and re-anchors the relative space; beyond it the port was reused for a new
    /// connection and this one is closed. Returns whether to keep processing the segment.
    fn handle_syn_jump(&mut self, seg: &mut DataSeg) -> bool {
        let delta = (seg.seq_absolute as i64 - self.rm.first_seq as i64).abs();
        if delta > SYN_REUSE_DELTA {
            log::info!(
                "{}: new SYN moves the sequence number by {delta} with {} ranges registered; \
                 assuming the port was reused and closing this connection",
                self.key,
                self.rm.range_count()
            );
            self.closed = true;
            self.ignored_count += 1;
            false
        } else {
            self.rm.first_seq = seg.seq_absolute;
            seg.seq = 0;
            seg.end_seq = 0;
            true
        }
    }

    fn insert_sent(&mut self, seg: &DataSeg, cfg: &Config) {
        if let Err(e) = self.rm.insert_sent_range(seg, cfg) {
            self.poison(format!("inserting sent range failed: {e:?}"));
        }
    }

    /// Register an incoming ACK against the range map.
    pub fn register_ack(&mut self, seg: &mut DataSeg) {
        if self.failure.is_some() {
            self.ignored_count += 1;
            return;
        }
        match self.relative(RelSeqStream::SendAck, seg.ack_absolute) {
            Ok(rel) => seg.ack = rel,
            Err(_) => {
                self.dropped_events += 1;
                return;
            }
        }
        match self.rm.process_ack(seg) {
            Ok(()) => {
                self.last_largest_ack_seq = seg.ack;
                self.last_largest_ack_seq_absolute = seg.ack_absolute;
            }
            Err(e) => {
                log::debug!("{}: ack {} not attributed: {e:?}", self.key, seg.ack);
                self.ack_failures += 1;
            }
        }
    }

    /// Register a receiver-side arrival of this direction's bytes.
    pub fn register_received(&mut self, seg: &mut DataSeg) {
        if self.failure.is_some() {
            self.ignored_count += 1;
            return;
        }
        match self.relative(RelSeqStream::RecvInn, seg.seq_absolute) {
            Ok(rel) => {
                seg.seq = rel;
                seg.end_seq = rel + seg.payload_size as u64;
            }
            Err(_) => {
                self.dropped_events += 1;
                return;
            }
        }
        if seg.seq <= self.last_largest_recv_end_seq
            && seg.end_seq > self.last_largest_recv_end_seq
        {
            seg.in_sequence = true;
        }
        if let Err(e) = self.rm.insert_received_range(seg) {
            self.poison(format!("inserting received range failed: {e:?}"));
            return;
        }
        self.last_largest_recv_end_seq = seg.end_seq;
        self.last_largest_recv_seq_absolute =
            seg.seq_absolute.wrapping_add(seg.payload_size as u32);
    }

    /// Attach a kernel-entry timestamp from the sojourn side channel.
    pub fn register_sojourn(&mut self, seg: &mut DataSeg) {
        if self.failure.is_some() {
            self.ignored_count += 1;
            return;
        }
        match self.relative(RelSeqStream::Sojourn, seg.seq_absolute) {
            Ok(rel) => {
                seg.seq = rel;
                seg.end_seq = rel + seg.payload_size as u64;
            }
            Err(_) => {
                self.dropped_events += 1;
                return;
            }
        }
        if let Err(e) = self.rm.insert_sojourn_range(seg) {
            self.poison(format!("inserting sojourn sample failed: {e:?}"));
            return;
        }
        self.last_largest_sojourn_end_seq = seg.end_seq;
        self.last_largest_sojourn_seq_absolute =
            seg.seq_absolute.wrapping_add(seg.payload_size as u32);
    }

    fn register_packet_size(&mut self, seg: &DataSeg, cfg: &Config) {
        let first = self.first_send_time.unwrap_or(seg.tstamp_pcap);
        let width = cfg.throughput_aggr_ms.max(1) as i64;
        let bucket = ((dur_ms(seg.tstamp_pcap) - dur_ms(first)).max(0) / width) as usize;

        if self.packet_sizes.len() <= bucket {
            self.packet_sizes.resize(bucket + 1, Vec::new());
            self.packet_size_groups
                .resize(bucket + 1, PacketSizeGroup::default());
        }
        let ps = PacketSize {
            time: seg.tstamp_pcap,
            packet_size: seg.total_size,
            payload_size: seg.payload_size,
            retrans: seg.retrans,
        };
        self.packet_sizes[bucket].push(ps);
        self.packet_size_groups[bucket].add(&ps);
    }

    // --- analysis -----------------------------------------------------------------------

    /// Fix the analysis window and derive the retransmission, RDB and loss counters.
    pub fn calculate_retrans_and_rdb_stats(&mut self, cfg: &Config) {
        self.rm.set_analyse_range_interval(cfg);
        self.rm.calculate_retrans_and_rdb_stats(cfg);
    }

    /// Duration in seconds, of the analysis window or of the whole connection.
    pub fn duration(&self, analysed_window: bool) -> f64 {
        if analysed_window {
            self.rm.analysed_duration_secs()
        } else {
            self.rm.duration()
        }
    }

    /// Unique data bytes covered by the analysis window.
    pub fn num_unique_bytes(&self) -> u64 {
        let mut first: Option<u64> = None;
        let mut last = 0;
        for br in self.rm.analysed_ranges() {
            if br.byte_count() > 0 {
                if first.is_none() {
                    first = Some(br.start);
                }
                last = br.end;
            }
        }
        first.map_or(0, |f| last - f)
    }

    /// Check the range map against the connection totals.
    pub fn validate_ranges(&self) -> Result<(), crate::InvariantViolation> {
        self.rm.validate_content(
            self.tot_bytes_sent,
            self.tot_new_data_sent,
            self.tot_rdb_bytes_sent,
            self.tot_retrans_bytes_sent,
        )
    }

    /// Per-packet statistics over the analysis window, computed once and cached.
    pub fn packets_stats(&mut self, cfg: &Config) -> &PacketsStats {
        if self.packets_stats.is_none() {
            let mut bs = PacketsStats::new(cfg);
            self.rm.gen_stats(&self.key, &mut bs);
            self.packets_stats = Some(bs);
        }
        self.packets_stats.as_ref().unwrap()
    }

    /// Fold this connection's analysed counters into the cross-connection sums.
    pub fn add_conn_stats(&self, cs: &mut ConnStats) {
        let a = &self.rm.analysed;
        cs.conns += 1;
        cs.duration_sec += self.duration(true) as u64;
        cs.analysed_duration_sec += self
            .rm
            .analyse_time_sec_end
            .saturating_sub(self.rm.analyse_time_sec_start) as u64;
        cs.analysed_start_sec += self.rm.analyse_time_sec_start as u64;
        cs.analysed_end_sec += self.rm.analyse_time_sec_end as u64;
        cs.tot_bytes_sent += a.bytes_sent;
        cs.tot_retrans_bytes_sent += a.bytes_retransmitted;
        cs.nr_packets_sent += a.packet_sent_count;
        cs.nr_packets_sent_found_in_dump += a.packet_sent_count_in_dump;
        cs.nr_packets_received_found_in_dump += a.packet_received_count;
        cs.nr_data_packets_sent += a.data_packet_count;
        cs.nr_packet_retrans += a.retr_packet_count;
        cs.nr_packet_retrans_no_payload += a.retr_no_payload_packet_count;
        cs.bundle_count += a.rdb_packet_count;
        cs.tot_unique_bytes += self.num_unique_bytes();
        cs.tot_unique_bytes_sent += a.bytes_sent_unique;
        cs.tot_packet_size += self.tot_packet_size;
        cs.redundant_bytes += self.rm.redundant_bytes;
        cs.rdb_bytes_sent += self.rm.rdb_byte_miss + self.rm.rdb_byte_hits;
        cs.rdb_packet_hits += self.rm.rdb_packet_hits;
        cs.rdb_packet_misses += self.rm.rdb_packet_misses;
        cs.rdb_byte_hits += self.rm.rdb_byte_hits;
        cs.rdb_byte_misses += self.rm.rdb_byte_miss;
        cs.ack_count += a.ack_count;
        cs.syn_count += a.syn_count;
        cs.fin_count += a.fin_count;
        cs.rst_count += a.rst_count;
        cs.pure_acks_count += a.pure_acks_count;
        cs.ranges_sent += a.sent_ranges_count;
        cs.ranges_lost += a.lost_ranges_count;
        cs.bytes_lost += a.lost_bytes;
        cs.packets_lost += a.lost_packets;

        let unique = self.num_unique_bytes();
        if a.bytes_sent >= unique && a.bytes_sent - unique != a.redundant_bytes {
            log::debug!(
                "{}: redundant bytes ({}) do not match bytes_sent - unique ({})",
                self.key,
                a.redundant_bytes,
                a.bytes_sent - unique
            );
        }
    }

    /// Per-packet (send time us, ITT ms, payload, wire size) records from the throughput
    /// buckets, for the per-packet output file.
    pub fn packet_itt_records(&self) -> Vec<(i64, i64, u16, u32)> {
        let mut records = Vec::new();
        let mut prev_us: Option<i64> = None;
        for bucket in &self.packet_sizes {
            for ps in bucket {
                let t_us = dur_us(ps.time);
                let itt_ms = prev_us.map_or(0, |p| (t_us - p) / 1000);
                prev_us = Some(t_us);
                records.push((t_us, itt_ms, ps.payload_size, ps.packet_size));
            }
        }
        records
    }
}
