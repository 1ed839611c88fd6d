use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Included, Unbounded};
use std::time::Duration;

use slotmap::SlotMap;

use crate::range::ByteRange;
use crate::stats::{LatencyItem, LossInterval, PacketStats, PacketsStats};
use crate::util::{dur_ms, dur_us, secs_between};
use crate::{
    AckError, Config, DataSeg, InsertError, InsertType, InvariantViolation, RecvType, SentKind,
    TcpFlags,
};

slotmap::new_key_type! {
    /// Stable handle to a [`ByteRange`] in the manager's arena. Splitting a range never
    /// invalidates handles: the head keeps its id, the tail gets a fresh one.
    pub struct RangeId;
}

/// A segment may legitimately span a few ranges; thousands means the map has degenerated or the
/// trace is hostile.
const RECURSION_LIMIT: u32 = 1500;

/// Only drift windows of this many ranges are examined at each end of the trace.
const DRIFT_WINDOW: usize = 200;

/// Receive-matching failures within this tail fraction of the trace are expected (the receiver
/// capture usually stops before the last packets) and are reported separately.
const MATCH_FAIL_END_FRACTION: f64 = 0.01;

/// Counters produced by [`RangeManager::calculate_retrans_and_rdb_stats`] over the analysis
/// window. `packet_sent_count` is segmentation-adjusted (one per data range plus control
/// packets); `packet_sent_count_in_dump` matches what wireshark would count.
#[derive(Clone, Copy, Debug, Default)]
pub struct AnalysedCounters {
    pub packet_sent_count: u64,
    pub packet_sent_count_in_dump: u64,
    pub packet_received_count: u64,
    pub data_packet_count: u64,
    pub retr_packet_count: u64,
    pub retr_no_payload_packet_count: u64,
    pub rdb_packet_count: u64,
    pub bytes_sent: u64,
    pub bytes_sent_unique: u64,
    pub bytes_retransmitted: u64,
    pub redundant_bytes: u64,
    pub sent_ranges_count: u64,
    pub lost_ranges_count: u64,
    pub lost_bytes: u64,
    pub lost_packets: u64,
    pub syn_count: u64,
    pub fin_count: u64,
    pub rst_count: u64,
    pub pure_acks_count: u64,
    pub ack_count: u64,
    pub max_range_payload: u64,
}

enum StepOutcome {
    Done,
    Continue(u64),
}

/// Per-direction range bookkeeping for one connection: an ordered, non-overlapping partition of
/// the transmitted relative-seq span into [`ByteRange`]s, plus the passes that derive loss,
/// latency and retransmission statistics from it after ingest.
#[derive(Debug)]
pub struct RangeManager {
    arena: SlotMap<RangeId, ByteRange>,
    index: BTreeMap<u64, RangeId>,

    /// First absolute sequence number of the direction; anchor of the relative space.
    pub first_seq: u32,
    /// Relative end of the covered span; equals the unique byte count.
    pub last_seq: u64,
    /// Cached ACK cursor; never moves backward.
    highest_acked: Option<RangeId>,

    // analysis window, fixed once ingest is complete
    window_start_key: Option<u64>,
    window_end_key: Option<u64>,
    pub analyse_time_sec_start: u32,
    pub analyse_time_sec_end: u32,

    /// Lowest drift-compensated one-way delay; baseline for the delay-variation outputs.
    pub lowest_recv_diff: i64,
    /// Estimated clock drift between the two capture hosts in ms/s.
    pub drift: f64,
    /// Delay variation (ms above baseline) to number of bytes.
    pub byte_latency_variation_cdf: BTreeMap<i64, u64>,

    pub analysed: AnalysedCounters,
    /// Bytes carried by full retransmissions, counted at ingest.
    pub redundant_bytes: u64,
    pub rdb_packet_hits: u64,
    pub rdb_packet_misses: u64,
    pub rdb_byte_hits: u64,
    pub rdb_byte_miss: u64,
}

impl RangeManager {
    pub fn new(first_seq: u32) -> Self {
        Self {
            arena: SlotMap::with_key(),
            index: BTreeMap::new(),
            first_seq,
            last_seq: 0,
            highest_acked: None,
            window_start_key: None,
            window_end_key: None,
            analyse_time_sec_start: 0,
            analyse_time_sec_end: 0,
            lowest_recv_diff: i64::MAX,
            drift: 0.0,
            byte_latency_variation_cdf: BTreeMap::new(),
            analysed: AnalysedCounters::default(),
            redundant_bytes: 0,
            rdb_packet_hits: 0,
            rdb_packet_misses: 0,
            rdb_byte_hits: 0,
            rdb_byte_miss: 0,
        }
    }

    pub fn range_count(&self) -> usize {
        self.index.len()
    }

    /// Unique bytes covered by the map (the relative span).
    pub fn num_bytes(&self) -> u64 {
        self.last_seq
    }

    /// All ranges in ascending start order.
    pub fn ranges(&self) -> impl DoubleEndedIterator<Item = &ByteRange> + '_ {
        self.index.values().map(move |&id| &self.arena[id])
    }

    /// Ranges inside the analysis window, in ascending start order.
    pub fn analysed_ranges(&self) -> impl DoubleEndedIterator<Item = &ByteRange> + '_ {
        self.window_key_bounds()
            .map(move |(_, &id)| &self.arena[id])
    }

    fn window_key_bounds(
        &self,
    ) -> std::collections::btree_map::Range<'_, u64, RangeId> {
        let lower = match self.window_start_key {
            Some(k) => Included(k),
            None => Unbounded,
        };
        let upper = match self.window_end_key {
            Some(k) => Excluded(k),
            None => Unbounded,
        };
        self.index.range((lower, upper))
    }

    pub fn highest_acked(&self) -> Option<&ByteRange> {
        self.highest_acked.map(|id| &self.arena[id])
    }

    pub fn last_range(&self) -> Option<&ByteRange> {
        self.index.values().next_back().map(|&id| &self.arena[id])
    }

    /// Capture time of the first transmission in the trace.
    pub fn first_send_time(&self) -> Option<Duration> {
        self.ranges()
            .find_map(|br| br.sent_tstamp_pcap.first().map(|&(t, _)| t))
    }

    /// Duration of the analysis window in seconds.
    pub fn analysed_duration_secs(&self) -> f64 {
        let first = self
            .analysed_ranges()
            .find_map(|br| br.sent_tstamp_pcap.first().map(|&(t, _)| t));
        let last = self
            .analysed_ranges()
            .rev()
            .find_map(|br| br.sent_tstamp_pcap.first().map(|&(t, _)| t));
        match (first, last) {
            (Some(f), Some(l)) => secs_between(l, f).max(0.0),
            _ => 0.0,
        }
    }

    /// Trace duration in seconds, first send to the last range's first send.
    pub fn duration(&self) -> f64 {
        let (Some(first), Some(last)) = (
            self.first_send_time(),
            self.ranges()
                .rev()
                .find_map(|br| br.sent_tstamp_pcap.first().map(|&(t, _)| t)),
        ) else {
            return 0.0;
        };
        secs_between(last, first)
    }

    fn next_key(&self, key: u64) -> Option<u64> {
        self.index
            .range((Excluded(key), Unbounded))
            .next()
            .map(|(&k, _)| k)
    }

    fn prev_key(&self, key: u64) -> Option<u64> {
        self.index.range(..key).next_back().map(|(&k, _)| k)
    }

    fn is_last_key(&self, key: u64) -> bool {
        self.index.keys().next_back() == Some(&key)
    }

    fn insert_range(&mut self, br: ByteRange) -> RangeId {
        let start = br.start;
        let id = self.arena.insert(br);
        if let Some(old) = self.index.insert(start, id) {
            // duplicate starts break the no-overlap invariant; keep the newer range but shout
            log::error!("duplicate range start {start} in the map; replacing the old range");
            self.arena.remove(old);
        }
        id
    }

    // --- ingest -------------------------------------------------------------------------

    /// Register all bytes of an outgoing segment and advance the covered span.
    pub fn insert_sent_range(&mut self, seg: &DataSeg, cfg: &Config) -> Result<(), InsertError> {
        let (start, end) = (seg.seq, seg.end_seq);
        self.insert_byte_range(start, end, InsertType::Sent, seg)?;

        if seg.payload_size == 0 {
            // first or second packet in the stream, or a bare control packet
            if !seg.flags.contains(TcpFlags::RST) {
                self.last_seq = end;
                if seg.flags.contains(TcpFlags::SYN) {
                    self.last_seq += 1;
                }
            }
        } else if start == self.last_seq {
            // next packet in sequence
            self.last_seq = start + seg.payload_size as u64;
        } else if start > self.last_seq {
            if cfg.validate_ranges {
                log::warn!(
                    "missing bytes in the send stream: expected seq {}, got {start}; \
                     the capture probably dropped packets",
                    self.last_seq
                );
            }
        } else if end > self.last_seq {
            // old and new bytes bundled together
            self.last_seq = start + seg.payload_size as u64;
        } else {
            // all bytes already registered: a full retransmission
            self.redundant_bytes += end - start;
        }
        Ok(())
    }

    /// Register a receiver-side arrival.
    pub fn insert_received_range(&mut self, seg: &DataSeg) -> Result<(), InsertError> {
        log::trace!(
            "inserting receive data [{}, {})",
            seg.seq,
            seg.end_seq
        );
        self.insert_byte_range(seg.seq, seg.end_seq, InsertType::Recv, seg)
    }

    /// Attach kernel-entry timestamps from the sojourn side channel.
    pub fn insert_sojourn_range(&mut self, seg: &DataSeg) -> Result<(), InsertError> {
        self.insert_byte_range(seg.seq, seg.end_seq, InsertType::Sojourn, seg)
    }

    /// Fold one event covering `[start, end)` into the map, splitting existing ranges where the
    /// event intersects them off-boundary. Implemented as a bounded loop: each iteration handles
    /// the portion of the event covered by one existing range and hands the remainder to the
    /// next. Only iteration 0 carries packet identity (see [`SentKind`]).
    pub fn insert_byte_range(
        &mut self,
        start: u64,
        end: u64,
        itype: InsertType,
        seg: &DataSeg,
    ) -> Result<(), InsertError> {
        let mut cursor = start;
        let mut level: u32 = 0;
        loop {
            if level > RECURSION_LIMIT {
                return Err(InsertError::RecursionTooDeep { start: cursor, end });
            }
            match self.insert_step(cursor, end, itype, seg, level) {
                StepOutcome::Done => return Ok(()),
                StepOutcome::Continue(next) => {
                    cursor = next;
                    level += 1;
                }
            }
        }
    }

    fn insert_step(
        &mut self,
        start: u64,
        end: u64,
        itype: InsertType,
        seg: &DataSeg,
        level: u32,
    ) -> StepOutcome {
        let this_is_rdb_data = seg.is_rdb && seg.rdb_end_seq > start;

        if start == end {
            return self.insert_zero_length(start, itype, seg, level, this_is_rdb_data);
        }

        if let Some(&id) = self.index.get(&start) {
            let cur_end = self.arena[id].end;

            if cur_end == end {
                // same boundaries: a duplicate transmission (or arrival) of exactly this range
                record_on_match(&mut self.arena[id], itype, seg, level, this_is_rdb_data, end);
                return StepOutcome::Done;
            }

            if cur_end < end {
                // the event spans beyond this range
                match itype {
                    InsertType::Sent => {
                        let is_last = self.is_last_key(start);
                        let br = &mut self.arena[id];
                        if br.byte_count() == 0 {
                            if is_last {
                                // the final range held only control packets; give it the payload
                                br.end = end;
                                br.original_payload_size = br.byte_count();
                                br.increase_sent(
                                    seg.tstamp_tcp,
                                    seg.tstamp_tcp_echo,
                                    seg.tstamp_pcap,
                                    this_is_rdb_data,
                                    SentKind::Pkt,
                                );
                                return StepOutcome::Done;
                            }
                            // a mid-map control anchor cannot absorb payload; fall through to
                            // whatever follows (the iteration bound catches degenerate maps)
                        } else {
                            let kind = head_kind(seg, level);
                            if level == 0 && seg.flags.contains(TcpFlags::FIN) {
                                br.fin += 1;
                            }
                            br.increase_sent(
                                seg.tstamp_tcp,
                                seg.tstamp_tcp_echo,
                                seg.tstamp_pcap,
                                this_is_rdb_data,
                                kind,
                            );
                            br.data_retrans_count += seg.retrans as u32;
                            br.rdb_count += seg.is_rdb as u32;
                        }
                    }
                    InsertType::Recv => {
                        let br = &mut self.arena[id];
                        br.increase_received(seg.tstamp_tcp, seg.tstamp_pcap, seg.in_sequence);
                        if level == 0 {
                            br.packet_received_count += 1;
                        }
                    }
                    InsertType::Sojourn => {
                        let is_last = self.is_last_key(start);
                        let br = &mut self.arena[id];
                        if !br.add_segment_entered_kernel_time(cur_end, seg.tstamp_pcap) {
                            log::debug!("sojourn sample rejected by range [{start}, {cur_end})");
                        }
                        if is_last {
                            // nothing follows to carry the rest of the sample
                            return StepOutcome::Done;
                        }
                    }
                }
                return StepOutcome::Continue(cur_end);
            }

            // cur_end > end: the event covers a prefix of this range
            if itype == InsertType::Sojourn {
                let br = &mut self.arena[id];
                if !br.add_segment_entered_kernel_time(end, seg.tstamp_pcap) {
                    log::debug!("sojourn sample rejected by range [{start}, {cur_end})");
                }
                return StepOutcome::Done;
            }
            let tail = self.arena[id].split_end(end, cur_end);
            record_on_match(&mut self.arena[id], itype, seg, level, this_is_rdb_data, end);
            self.insert_range(tail);
            return StepOutcome::Done;
        }

        // no range starts here; an event below last_seq intersects the middle of one
        if start < self.last_seq {
            let floor = self
                .index
                .range(..start)
                .next_back()
                .map(|(&k, &id)| (k, id));
            if let Some((_, id)) = floor {
                let (cur_start, cur_end) = {
                    let b = &self.arena[id];
                    (b.start, b.end)
                };
                if cur_start <= start && start <= cur_end {
                    if itype == InsertType::Sojourn {
                        // sojourn events never split
                        let br = &mut self.arena[id];
                        let sub_end = end.min(cur_end);
                        if !br.add_segment_entered_kernel_time(sub_end, seg.tstamp_pcap) {
                            log::debug!(
                                "sojourn sample rejected by range [{cur_start}, {cur_end})"
                            );
                        }
                        return if end > cur_end {
                            StepOutcome::Continue(cur_end)
                        } else {
                            StepOutcome::Done
                        };
                    }

                    let mut target = self.arena[id].split_end(start, cur_end);
                    if end > cur_end {
                        // spans beyond the covering range; record here and carry on
                        record_split_event(&mut target, itype, seg, level, this_is_rdb_data);
                        self.insert_range(target);
                        return StepOutcome::Continue(cur_end);
                    }
                    if end < cur_end {
                        // the event sits in the middle; give the untouched suffix back
                        let suffix = target.split_end(end, cur_end);
                        self.insert_range(suffix);
                    }
                    if itype == InsertType::Sent && seg.flags.contains(TcpFlags::FIN) {
                        target.fin = 1;
                    }
                    record_split_event(&mut target, itype, seg, level, this_is_rdb_data);
                    self.insert_range(target);
                    return StepOutcome::Done;
                }
            }
        }

        // fresh data at or beyond the covered span
        match itype {
            InsertType::Sent => {
                let mut br = ByteRange::new(start, end);
                br.original_payload_size = seg.payload_size as u64;
                br.original_packet_is_rdb = seg.is_rdb;
                // an RDB segment's identity is recorded on the bundled head, not the new tail
                let kind = if seg.is_rdb {
                    SentKind::None
                } else {
                    SentKind::Pkt
                };
                br.increase_sent(
                    seg.tstamp_tcp,
                    seg.tstamp_tcp_echo,
                    seg.tstamp_pcap,
                    this_is_rdb_data,
                    kind,
                );
                if seg.flags.contains(TcpFlags::SYN) {
                    br.syn = 1;
                } else if seg.flags.contains(TcpFlags::FIN) {
                    br.fin = 1;
                }
                self.insert_range(br);
            }
            InsertType::Recv => {
                if start > self.last_seq {
                    // the receiver saw bytes the sender capture never did
                    log::warn!(
                        "received byte range [{start}, {end}) does not exist in the sender \
                         capture"
                    );
                    let mut br = ByteRange::new(start, end);
                    br.original_payload_size = seg.payload_size as u64;
                    br.increase_received(seg.tstamp_tcp, seg.tstamp_pcap, seg.in_sequence);
                    if level == 0 {
                        br.packet_received_count += 1;
                    }
                    if seg.flags.contains(TcpFlags::SYN) {
                        br.syn = 1;
                    } else if seg.flags.contains(TcpFlags::FIN) {
                        br.fin = 1;
                    }
                    self.insert_range(br);
                } else {
                    log::warn!(
                        "no sender range matches received bytes [{start}, {end}); dropping"
                    );
                }
            }
            InsertType::Sojourn => {
                log::debug!("sojourn sample [{start}, {end}) matches no range; dropping");
            }
        }
        StepOutcome::Done
    }

    fn insert_zero_length(
        &mut self,
        mut start: u64,
        itype: InsertType,
        seg: &DataSeg,
        level: u32,
        this_is_rdb_data: bool,
    ) -> StepOutcome {
        let ctl = seg
            .flags
            .intersects(TcpFlags::SYN | TcpFlags::FIN | TcpFlags::RST);

        // a pure ack one past the last data byte belongs to the preceding range
        if !ctl
            && !self.index.contains_key(&start)
            && start > 0
            && self.index.contains_key(&(start - 1))
        {
            start -= 1;
        }

        if let Some(&id) = self.index.get(&start) {
            let br = &mut self.arena[id];
            match itype {
                InsertType::Sent => {
                    let kind;
                    if seg.flags.intersects(TcpFlags::SYN | TcpFlags::FIN) {
                        br.syn += seg.flags.contains(TcpFlags::SYN) as u32;
                        br.fin += seg.flags.contains(TcpFlags::FIN) as u32;
                        kind = SentKind::Rtr;
                    } else if seg.flags.contains(TcpFlags::RST) {
                        br.rst += 1;
                        kind = SentKind::Rst;
                    } else {
                        kind = SentKind::PureAck;
                    }
                    br.increase_sent(
                        seg.tstamp_tcp,
                        seg.tstamp_tcp_echo,
                        seg.tstamp_pcap,
                        this_is_rdb_data,
                        kind,
                    );
                }
                InsertType::Recv => {
                    if seg.flags.intersects(TcpFlags::SYN | TcpFlags::FIN) {
                        br.increase_received(seg.tstamp_tcp, seg.tstamp_pcap, seg.in_sequence);
                    }
                    if level == 0 {
                        br.packet_received_count += 1;
                    }
                }
                InsertType::Sojourn => {
                    log::debug!("zero-length sojourn event at {start} dropped");
                }
            }
            return StepOutcome::Done;
        }

        if itype == InsertType::Sojourn {
            log::debug!("zero-length sojourn event at {start} dropped");
            return StepOutcome::Done;
        }

        // no range to attach to; create a control anchor at this stream position
        let mut br = ByteRange::new(start, start);
        br.packet_retrans_count += seg.retrans as u32;
        br.rdb_count += seg.is_rdb as u32;
        if seg.flags.contains(TcpFlags::SYN) {
            br.syn = 1;
        } else if seg.flags.contains(TcpFlags::FIN) {
            br.fin = 1;
        } else if seg.flags.contains(TcpFlags::RST) {
            br.rst = 1;
        }
        match itype {
            InsertType::Sent => {
                let kind = if br.syn + br.fin + br.rst > 0 {
                    SentKind::Pkt
                } else {
                    SentKind::PureAck
                };
                br.increase_sent(
                    seg.tstamp_tcp,
                    seg.tstamp_tcp_echo,
                    seg.tstamp_pcap,
                    this_is_rdb_data,
                    kind,
                );
            }
            InsertType::Recv => {
                br.increase_received(seg.tstamp_tcp, seg.tstamp_pcap, seg.in_sequence);
                if level == 0 {
                    br.packet_received_count += 1;
                }
            }
            InsertType::Sojourn => unreachable!(),
        }
        self.insert_range(br);
        StepOutcome::Done
    }

    // --- acknowledgments ----------------------------------------------------------------

    /// Attribute an incoming ACK to the ranges it covers, recording first-ACK times and
    /// duplicate-ACK counts. Resumes from the cached cursor, which never moves backward.
    pub fn process_ack(&mut self, seg: &DataSeg) -> Result<(), AckError> {
        let ack = seg.ack;
        let mut key = match self.highest_acked {
            Some(id) => self.arena[id].start,
            None => match self.index.keys().next() {
                Some(&k) => k,
                None => return Ok(()),
            },
        };

        // everything below the cursor was acked before (index keys are range starts)
        if ack < key {
            log::trace!("ack {ack} covers only data acked before");
            return Ok(());
        }

        let mut newly_acked = false;
        loop {
            let id = self.index[&key];
            let (cur_start, cur_end, cur_bytes) = {
                let b = &self.arena[id];
                (b.start, b.end, b.byte_count())
            };

            // covers exactly up to this range
            if ack == cur_end || (cur_bytes == 0 && ack.wrapping_sub(1) == cur_end) {
                let at_cursor = self.highest_acked == Some(id);
                let br = &mut self.arena[id];
                if !br.is_acked() {
                    if cur_bytes == 0 {
                        // likely the ack closing the stream; TSecr tells us whether this range
                        // is in fact an ack of the very ack we are processing
                        match br.tstamps_tcp.first() {
                            Some(&(_, echo)) if echo == seg.tstamp_tcp => {}
                            Some(_) => br.insert_ack_time(seg.tstamp_pcap),
                            None => {}
                        }
                    } else {
                        br.insert_ack_time(seg.tstamp_pcap);
                    }
                } else if at_cursor {
                    // zero-window probes never count as duplicates
                    if seg.window > 0 && seg.window == br.tcp_window {
                        br.dupack_count += 1;
                    }
                }
                br.ack_count += 1;
                br.tcp_window = seg.window;
                self.highest_acked = Some(id);
                return Ok(());
            }

            // covers more than this range: ack it and walk on
            if ack > cur_end {
                let br = &mut self.arena[id];
                if let Some(&(sent, _)) = br.sent_tstamp_pcap.first() {
                    if seg.tstamp_pcap < sent {
                        log::warn!(
                            "ack time is earlier than the send time of range \
                             [{cur_start}, {cur_end})"
                        );
                        return Err(AckError::BeforeSend);
                    }
                }
                if !br.is_acked() {
                    br.insert_ack_time(seg.tstamp_pcap);
                    newly_acked = true;
                }
                self.highest_acked = Some(id);
                match self.next_key(key) {
                    Some(k) => {
                        key = k;
                        continue;
                    }
                    None => {
                        if newly_acked {
                            return Ok(());
                        }
                        log::debug!("no range found for ack {ack}");
                        return Err(AckError::ForUnsentData);
                    }
                }
            }

            // covers part of this range: split at the ack boundary
            if cur_start < ack && ack < cur_end {
                let tail = self.arena[id].split_end(ack, cur_end);
                let br = &mut self.arena[id];
                br.insert_ack_time(seg.tstamp_pcap);
                br.tcp_window = seg.window;
                br.ack_count += 1;
                let tail_id = self.insert_range(tail);
                // the unacked tail becomes the cursor so the next ack starts there
                self.highest_acked = Some(tail_id);
                return Ok(());
            }

            // ack at or before this range's start: an old ack, or the ack of a FIN
            return self.process_old_ack(key, ack);
        }
    }

    fn process_old_ack(&mut self, key: u64, ack: u64) -> Result<(), AckError> {
        let Some(first_prev) = self.prev_key(key) else {
            log::warn!("ack {ack} precedes all known ranges; capture may have started mid-stream");
            return Err(AckError::MissingHistory);
        };

        // a FIN consumes one sequence number without carrying data, so the ack of a FIN sits
        // one byte past the end of the range holding it
        if ack.wrapping_sub(1) == self.arena[self.index[&first_prev]].end {
            let mut k = first_prev;
            loop {
                let id = self.index[&k];
                if self.arena[id].fin > 0 {
                    self.arena[id].ack_count += 1;
                    return Ok(());
                }
                let br = &self.arena[id];
                if br.packet_sent_count == br.data_sent_count() {
                    break;
                }
                match self.prev_key(k) {
                    Some(p) => k = p,
                    None => break,
                }
            }
        }

        // an ack for data acked long ago: find its range and count it
        let mut k = first_prev;
        loop {
            let id = self.index[&k];
            let end = self.arena[id].end;
            if ack == end {
                self.arena[id].ack_count += 1;
                return Ok(());
            }
            if ack > end {
                // lands in a gap between ranges; recognized but nothing to count
                return Ok(());
            }
            match self.prev_key(k) {
                Some(p) => k = p,
                None => {
                    log::warn!("failed to find a range for ack {ack}");
                    return Err(AckError::ForUnsentData);
                }
            }
        }
    }

    // --- validation ---------------------------------------------------------------------

    /// Post-ingest consistency check: full coverage of the span, aligned edges, and byte
    /// conservation against the connection totals.
    pub fn validate_content(
        &self,
        tot_bytes_sent: u64,
        tot_new_data: u64,
        tot_rdb_bytes: u64,
        tot_retrans_bytes: u64,
    ) -> Result<(), InvariantViolation> {
        let Some(first) = self.ranges().next() else {
            return Ok(());
        };
        if first.start != 0 {
            return Err(InvariantViolation::FirstRangeStart { start: first.start });
        }
        if let Some(last) = self.last_range() {
            if !(last.end <= self.last_seq && last.end + 1 >= self.last_seq) {
                return Err(InvariantViolation::LastRangeEnd {
                    end: last.end,
                    last_seq: self.last_seq,
                });
            }
        }
        let sum = tot_new_data + tot_rdb_bytes + tot_retrans_bytes;
        if tot_bytes_sent != sum {
            return Err(InvariantViolation::ByteAccounting {
                tot_bytes_sent,
                sum,
            });
        }

        let mut prev: Option<&ByteRange> = None;
        for cur in self.ranges() {
            if let Some(p) = prev {
                let gap_allowed = p.byte_count() == 0 || cur.byte_count() == 0 || p.fin > 0;
                if p.end != cur.start && !gap_allowed {
                    return Err(InvariantViolation::Coverage {
                        gap_start: p.end,
                        gap_end: cur.start,
                    });
                }
            }
            prev = Some(cur);
        }
        Ok(())
    }

    // --- analysis window ----------------------------------------------------------------

    /// Fix the range window the statistics passes operate on, from the configured start
    /// offset, end offset or duration. Must be called once ingest is complete; the window
    /// cursors are plain map keys and remain valid because no further splits happen.
    pub fn set_analyse_range_interval(&mut self, cfg: &Config) {
        self.window_start_key = self.index.keys().next().copied();
        self.window_end_key = None;
        self.analyse_time_sec_start = cfg.analyse_start;

        let Some(first_ts) = self.first_send_time() else {
            self.analyse_time_sec_end = 0;
            return;
        };
        let last_ts = self
            .ranges()
            .rev()
            .find_map(|br| br.sent_tstamp_pcap.first().map(|&(t, _)| t))
            .unwrap_or(first_ts);
        self.analyse_time_sec_end = secs_between(last_ts, first_ts).max(0.0) as u32;

        if cfg.analyse_start > 0 {
            for (&k, &id) in self.index.iter() {
                let Some(&(t, _)) = self.arena[id].sent_tstamp_pcap.first() else {
                    continue;
                };
                let offset = secs_between(t, first_ts);
                if offset >= cfg.analyse_start as f64 {
                    self.window_start_key = Some(k);
                    self.analyse_time_sec_start = offset as u32;
                    break;
                }
            }
        }

        if cfg.analyse_end > 0 {
            for (&k, &id) in self.index.iter().rev() {
                let Some(&(t, _)) = self.arena[id].sent_tstamp_pcap.first() else {
                    continue;
                };
                if secs_between(last_ts, t) >= cfg.analyse_end as f64 {
                    self.window_end_key = self.next_key(k);
                    self.analyse_time_sec_end = secs_between(t, first_ts).max(0.0) as u32;
                    break;
                }
            }
        } else if cfg.analyse_duration > 0 {
            let Some(start_key) = self.window_start_key else {
                return;
            };
            let begin_ts = self
                .index
                .range(start_key..)
                .find_map(|(_, &id)| self.arena[id].sent_tstamp_pcap.first().map(|&(t, _)| t))
                .unwrap_or(first_ts);
            let keys: Vec<u64> = self.index.range(start_key..).map(|(&k, _)| k).collect();
            let within = keys.partition_point(|k| {
                let id = self.index[k];
                match self.arena[id].sent_tstamp_pcap.first() {
                    Some(&(t, _)) => {
                        secs_between(t, begin_ts).max(0.0) as u64 <= cfg.analyse_duration as u64
                    }
                    None => true,
                }
            });
            if within > 0 {
                self.window_end_key = keys.get(within).copied();
                self.analyse_time_sec_end = self.analyse_time_sec_start + cfg.analyse_duration;
            }
        }
    }

    // --- statistics passes --------------------------------------------------------------

    /// Walk the analysis window once, producing the `analysed` counters, the RDB hit/miss
    /// classification and the loss totals. Requires the receive matching from a receiver dump
    /// for the loss parts; without one the loss counters stay zero.
    pub fn calculate_retrans_and_rdb_stats(&mut self, cfg: &Config) {
        let keys: Vec<u64> = self.window_key_bounds().map(|(&k, _)| k).collect();
        let total_ranges = self.index.len() as u64;
        let before_end_limit =
            (total_ranges as f64 * (1.0 - MATCH_FAIL_END_FRACTION)) as u64;

        let mut match_fails_before_end = 0u64;
        let mut match_fails_at_end = 0u64;
        let mut lost_packets = 0u64;
        let mut prev_lost: Vec<(u32, Duration)> = Vec::new();
        let mut prev_pack_lost = false;

        for (pos, &k) in keys.iter().enumerate() {
            let id = self.index[&k];

            if cfg.with_recv {
                let matched = self.arena[id].match_received_type();
                let br = &self.arena[id];
                if !matched && br.data_sent_count() > 0 && br.byte_count() > 0 {
                    if (pos as u64) < before_end_limit {
                        match_fails_before_end += 1;
                        log::debug!(
                            "no send of range [{}, {}) matches the received TCP timestamp",
                            br.start,
                            br.end
                        );
                    } else {
                        match_fails_at_end += 1;
                    }
                }
            }

            let br = &mut self.arena[id];
            let byte_count = br.byte_count();

            let mut rdb_count = br.rdb_count as u64;
            if rdb_count > 0 && br.recv_type == RecvType::Rdb {
                // one bundled transfer was the delivery that counted
                rdb_count -= 1;
                br.rdb_byte_hits = byte_count;
                self.rdb_byte_hits += byte_count;
            }
            if br.recv_type == RecvType::Rdb {
                self.rdb_packet_hits += 1;
            }
            br.rdb_byte_miss = rdb_count * byte_count;
            self.rdb_byte_miss += br.rdb_byte_miss;

            let a = &mut self.analysed;
            a.sent_ranges_count += br.data_sent_count() as u64;
            a.redundant_bytes +=
                byte_count * (br.data_retrans_count as u64 + br.rdb_count as u64);
            if byte_count > 0 {
                // one per range plus its retransmissions, however the wire segmented them
                a.data_packet_count += 1 + br.data_retrans_count as u64;
            } else {
                a.retr_no_payload_packet_count += br.packet_retrans_count as u64;
            }
            a.syn_count += br.syn as u64;
            a.fin_count += br.fin as u64;
            a.rst_count += br.rst as u64;
            a.pure_acks_count += br.acked_sent as u64;
            a.rdb_packet_count += br.original_packet_is_rdb as u64;
            a.bytes_sent += br.data_sent_count() as u64 * byte_count;
            a.bytes_sent_unique += byte_count;

            a.packet_sent_count += (br.syn + br.rst) as u64;
            if byte_count == 0 {
                a.packet_sent_count += br.fin as u64;
            } else {
                a.packet_sent_count += 1;
            }
            a.packet_sent_count += br.data_retrans_count as u64;
            a.packet_sent_count += br.acked_sent as u64;
            a.max_range_payload = a.max_range_payload.max(byte_count);

            a.retr_packet_count += br.packet_retrans_count as u64;
            a.bytes_retransmitted += br.data_retrans_count as u64 * byte_count;
            a.ack_count += br.ack_count as u64;
            a.packet_sent_count_in_dump +=
                (br.packet_sent_count + br.packet_retrans_count + br.acked_sent) as u64;
            a.packet_received_count += br.packet_received_count as u64;

            if cfg.with_recv && byte_count > 0 {
                let sent = br.data_sent_count() as u64;
                let recvd = br.data_received_count as u64;
                if sent > recvd {
                    let lost = sent - recvd;
                    a.lost_ranges_count += lost;
                    a.lost_bytes += lost * byte_count;

                    // a lost packet spanning several ranges must only be counted once
                    let mut lost_adj = lost;
                    if prev_pack_lost {
                        for (ts, _) in &br.lost_tstamps_tcp {
                            if prev_lost.iter().any(|(pts, _)| pts == ts) {
                                lost_adj = lost_adj.saturating_sub(1);
                                if lost_adj == 0 {
                                    break;
                                }
                            }
                        }
                    }
                    lost_packets += lost_adj;
                    prev_pack_lost = true;
                } else {
                    prev_pack_lost = false;
                }
                prev_lost = br.lost_tstamps_tcp.clone();
            }
        }

        self.analysed.lost_packets = lost_packets;
        self.rdb_packet_misses = self
            .analysed
            .rdb_packet_count
            .saturating_sub(self.rdb_packet_hits);

        if match_fails_before_end > 0 {
            log::warn!(
                "failed to match the received TCP timestamp for {match_fails_before_end} of \
                 {total_ranges} ranges; the sender capture may have dropped packets"
            );
        }
        if match_fails_at_end > 0 {
            log::info!(
                "failed to match the received TCP timestamp for {match_fails_at_end} ranges at \
                 the end of the stream; presumably the receiver capture stopped early"
            );
        }
    }

    /// One-way-delay pipeline: compute per-range receive diffs, estimate the clock drift
    /// between the capture hosts, and compensate the diffs for it.
    pub fn calculate_latency_variation(&mut self, cfg: &Config) {
        self.register_recv_diffs(cfg);
        self.calculate_clock_drift();
        self.do_drift_compensation();
    }

    fn register_recv_diffs(&mut self, cfg: &Config) {
        let keys: Vec<u64> = self.index.keys().copied().collect();
        let mut app_anchor: Option<Duration> = None;

        for k in keys {
            let id = self.index[&k];
            let br = &mut self.arena[id];
            if br.data_received_count == 0 {
                continue;
            }
            br.match_received_type();
            if !cfg.transport {
                // in application-layer mode the delay of an out-of-order arrival runs until
                // the arrival that made it deliverable
                if br.app_layer_latency_tstamp {
                    app_anchor = br.received_tstamp_pcap;
                }
                br.calculate_recv_diff(app_anchor);
            } else {
                br.calculate_recv_diff(None);
            }
        }
    }

    fn calculate_clock_drift(&mut self) {
        let n = DRIFT_WINDOW.min(self.index.len() / 2);

        fn min_diff<'a>(
            ranges: impl Iterator<Item = &'a ByteRange>,
        ) -> Option<(i64, Duration)> {
            let mut best: Option<(i64, Duration)> = None;
            for br in ranges {
                if br.recv_diff > 0 && best.map_or(true, |(d, _)| br.recv_diff < d) {
                    if let Some(&(t, _)) = br.sent_tstamp_pcap.first() {
                        best = Some((br.recv_diff, t));
                    }
                }
            }
            best
        }

        let start = min_diff(self.ranges().take(n));
        let end = min_diff(self.ranges().rev().take(n));

        let (Some((d_s, t_s)), Some((d_e, t_e))) = (start, end) else {
            log::warn!(
                "cannot estimate clock drift: no positive one-way delay samples near the trace \
                 edges"
            );
            self.drift = 0.0;
            return;
        };
        let duration_sec = secs_between(t_e, t_s);
        if duration_sec <= 0.0 {
            log::warn!("cannot estimate clock drift: degenerate sample interval");
            self.drift = 0.0;
            return;
        }
        self.drift = (d_e - d_s) as f64 / duration_sec;
        log::debug!("clock drift: {:.6} ms/s", self.drift);
    }

    fn do_drift_compensation(&mut self) {
        let Some(first_ts) = self.first_send_time() else {
            return;
        };
        let drift = self.drift;
        let keys: Vec<u64> = self.window_key_bounds().map(|(&k, _)| k).collect();

        for k in keys {
            let id = self.index[&k];
            let br = &mut self.arena[id];
            if br.recv_diff > 0 {
                let elapsed = br
                    .sent_tstamp_pcap
                    .first()
                    .map(|&(t, _)| secs_between(t, first_ts))
                    .unwrap_or(0.0);
                br.recv_diff = (br.recv_diff as f64 - drift * elapsed) as i64;
                if br.recv_diff < self.lowest_recv_diff {
                    self.lowest_recv_diff = br.recv_diff;
                }
            }
        }
    }

    /// Bucket drift-compensated delay variation into the per-connection CDF map.
    pub fn make_byte_latency_variation_cdf(&mut self) {
        let lowest = if self.lowest_recv_diff == i64::MAX {
            0
        } else {
            self.lowest_recv_diff
        };
        let keys: Vec<u64> = self.window_key_bounds().map(|(&k, _)| k).collect();
        for k in keys {
            let id = self.index[&k];
            let br = &self.arena[id];
            if br.data_received_count == 0 {
                continue;
            }
            let diff = br.recv_diff - lowest;
            *self.byte_latency_variation_cdf.entry(diff).or_insert(0) += br.byte_count();
        }
    }

    /// Group sent packets/bytes and lost packets/bytes into `loss_aggr_ms`-wide time buckets.
    /// `loss` receives this connection's buckets, `all_loss` accumulates across connections.
    pub fn calculate_loss_grouped_by_interval(
        &self,
        first_tstamp_ms: i64,
        all_loss: &mut Vec<LossInterval>,
        loss: &mut Vec<LossInterval>,
        cfg: &Config,
    ) {
        let width = cfg.loss_aggr_ms.max(1) as i64;
        let bucket = |t: Duration| ((dur_ms(t) - first_tstamp_ms).max(0) / width) as usize;

        // totals over everything sent
        let mut total_count: Vec<f64> = Vec::new();
        let mut total_bytes: Vec<f64> = Vec::new();
        let mut total_new_bytes: Vec<f64> = Vec::new();
        let grow = |v: &mut Vec<f64>, idx: usize| {
            if v.len() <= idx {
                v.resize(idx + 1, 0.0);
            }
        };

        for br in self.analysed_ranges() {
            let Some(&(first_sent, _)) = br.sent_tstamp_pcap.first() else {
                continue;
            };
            if br.packet_sent_count > 0 {
                let idx = bucket(first_sent);
                grow(&mut total_new_bytes, idx);
                total_new_bytes[idx] += br.original_payload_size as f64;
            }
            for &(t, _) in &br.sent_tstamp_pcap {
                let idx = bucket(t);
                grow(&mut total_count, idx);
                grow(&mut total_bytes, idx);
                total_count[idx] += 1.0;
                total_bytes[idx] += br.byte_count() as f64;
            }
        }

        let grow_loss = |v: &mut Vec<LossInterval>, idx: usize| {
            if v.len() <= idx {
                v.resize(idx + 1, LossInterval::default());
            }
        };

        for br in self.analysed_ranges() {
            let first_sent = br.sent_tstamp_pcap.first().map(|&(t, _)| t);
            // new bytes are charged to the bucket of the first send, if that send was lost
            if let (Some(first_sent), Some(&(_, first_lost))) =
                (first_sent, br.lost_tstamps_tcp.first())
            {
                if br.packet_sent_count > 0 && first_lost == first_sent {
                    let idx = bucket(first_sent);
                    grow_loss(loss, idx);
                    loss[idx].new_bytes += br.original_payload_size as f64;
                }
            }
            for &(_, t) in &br.lost_tstamps_tcp {
                let idx = bucket(t);
                grow_loss(loss, idx);
                loss[idx].cnt_bytes += 1.0;
                loss[idx].all_bytes += br.byte_count() as f64;
            }
        }

        let num_buckets = loss.len();
        if all_loss.len() < num_buckets {
            all_loss.resize(num_buckets, LossInterval::default());
        }
        for idx in 0..num_buckets {
            let totals = (
                total_count.get(idx).copied().unwrap_or(0.0),
                total_bytes.get(idx).copied().unwrap_or(0.0),
                total_new_bytes.get(idx).copied().unwrap_or(0.0),
            );
            all_loss[idx] += loss[idx];
            all_loss[idx].add_total(totals.0, totals.1, totals.2);
            loss[idx].add_total(totals.0, totals.1, totals.2);
        }
    }

    /// Emit per-packet statistics and the latency/length/ITT summaries over the analysis
    /// window.
    pub fn gen_stats(&self, conn_key: &str, bs: &mut PacketsStats) {
        let keys: Vec<u64> = self.window_key_bounds().map(|(&k, _)| k).collect();

        for (pos, &k) in keys.iter().enumerate() {
            let br = &self.arena[self.index[&k]];
            let payload = br.original_payload_size;

            if payload != 0 {
                // one length sample per sent copy
                bs.packet_length.add(payload as i64);
                for _ in 0..br.num_retrans() {
                    bs.packet_length.add(payload as i64);
                }
            }

            for &(t, kind) in &br.sent_tstamp_pcap {
                let ps = match kind {
                    SentKind::None => continue,
                    SentKind::Pkt => {
                        let mut ps =
                            PacketStats::new(kind, conn_key, dur_us(t) as u64, payload);
                        ps.sojourn_times = br.sojourn_times();
                        ps.ack_latency_us = br.send_ack_time_diff();
                        ps
                    }
                    SentKind::Rtr => {
                        // a collapsed retransmit can span into the following range, whose
                        // retransmitted data then has no retransmit packet of its own
                        let mut length = payload;
                        if let Some(&next_k) = keys.get(pos + 1) {
                            let next = &self.arena[self.index[&next_k]];
                            if next.packet_retrans_count < next.data_retrans_count {
                                length += next.data_retrans_count as u64 * next.byte_count();
                            }
                        }
                        PacketStats::new(kind, conn_key, dur_us(t) as u64, length)
                    }
                    SentKind::PureAck | SentKind::Rst => {
                        PacketStats::new(kind, conn_key, dur_us(t) as u64, 0)
                    }
                };
                bs.add_packet_stats(ps);
            }

            let dupacks = br.dupack_count as usize;
            if bs.dupacks.len() < dupacks {
                bs.dupacks.resize(dupacks, 0);
            }
            for slot in bs.dupacks.iter_mut().take(dupacks) {
                *slot += 1;
            }

            let latency = br.send_ack_time_diff();
            if latency != 0 {
                bs.latency.add(latency);
            } else if !br.is_acked() {
                continue;
            }

            let retrans = br.num_retrans() as usize;
            if bs.retrans.len() < retrans {
                bs.retrans.resize(retrans, 0);
            }
            for slot in bs.retrans.iter_mut().take(retrans) {
                *slot += 1;
            }
        }

        bs.sort_and_compute_itt();
        bs.make_stats();
    }

    /// Ack-latency time series, one vector per retransmission rank (rank 0 holds everything).
    pub fn gen_ack_latency_data(
        &self,
        first_tstamp_ms: i64,
        diff_times: &mut Vec<Vec<LatencyItem>>,
        conn_key: &str,
    ) {
        if diff_times.is_empty() {
            diff_times.push(Vec::new());
        }
        for br in self.analysed_ranges() {
            let ack_us = br.send_ack_time_diff();
            if ack_us <= 0 {
                continue;
            }
            let Some(&(t, _)) = br.sent_tstamp_pcap.first() else {
                continue;
            };
            let time_ms = (dur_ms(t) - first_tstamp_ms).max(0) as u64;
            let rank = br.num_retrans() as usize;
            if diff_times.len() <= rank {
                diff_times.resize(rank + 1, Vec::new());
            }
            let item = LatencyItem::new(time_ms, ack_us / 1000, conn_key);
            if rank > 0 {
                diff_times[rank].push(item.clone());
            }
            diff_times[0].push(item);
        }
    }

    /// Sent times with drift-compensated delay variation, for the queueing-delay output.
    pub fn queueing_delay_items(&self, first_tstamp_ms: i64, conn_key: &str) -> Vec<LatencyItem> {
        let lowest = if self.lowest_recv_diff == i64::MAX {
            0
        } else {
            self.lowest_recv_diff
        };
        let mut items = Vec::new();
        for br in self.analysed_ranges() {
            if br.data_received_count == 0 {
                continue;
            }
            let diff = br.recv_diff - lowest;
            let Some(&(t, _)) = br.sent_tstamp_pcap.get(br.send_tcp_stamp_recv_index) else {
                continue;
            };
            if diff >= 0 {
                items.push(LatencyItem::new(
                    (dur_ms(t) - first_tstamp_ms).max(0) as u64,
                    diff,
                    conn_key,
                ));
            }
        }
        items
    }
}

/// Record a data-bearing event on a range whose boundaries exactly frame it (duplicate
/// transmission, exact arrival, or the prefix produced by a split at `end`).
fn record_on_match(
    br: &mut ByteRange,
    itype: InsertType,
    seg: &DataSeg,
    level: u32,
    this_is_rdb_data: bool,
    end: u64,
) {
    match itype {
        InsertType::Sent => {
            let kind = head_kind(seg, level);
            if level == 0 && seg.flags.contains(TcpFlags::FIN) {
                br.fin += 1;
            }
            br.increase_sent(
                seg.tstamp_tcp,
                seg.tstamp_tcp_echo,
                seg.tstamp_pcap,
                this_is_rdb_data,
                kind,
            );
            br.data_retrans_count += seg.retrans as u32;
            br.rdb_count += seg.is_rdb as u32;
            if seg.flags.contains(TcpFlags::SYN) {
                br.syn += 1;
            }
        }
        InsertType::Recv => {
            br.increase_received(seg.tstamp_tcp, seg.tstamp_pcap, seg.in_sequence);
            if level == 0 {
                br.packet_received_count += 1;
            }
        }
        InsertType::Sojourn => {
            let _ = br.add_segment_entered_kernel_time(end, seg.tstamp_pcap);
        }
    }
}

/// Record an event on the range a split carved out for it. A sent event landing here is a
/// retransmission or RDB bundle of already-covered bytes.
fn record_split_event(
    br: &mut ByteRange,
    itype: InsertType,
    seg: &DataSeg,
    level: u32,
    this_is_rdb_data: bool,
) {
    match itype {
        InsertType::Sent => {
            let kind = if level == 0 {
                SentKind::Rtr
            } else {
                SentKind::None
            };
            br.increase_sent(
                seg.tstamp_tcp,
                seg.tstamp_tcp_echo,
                seg.tstamp_pcap,
                this_is_rdb_data,
                kind,
            );
            br.data_retrans_count += 1;
            br.rdb_count += seg.is_rdb as u32;
        }
        InsertType::Recv => {
            br.increase_received(seg.tstamp_tcp, seg.tstamp_pcap, seg.in_sequence);
            if level == 0 {
                br.packet_received_count += 1;
            }
        }
        InsertType::Sojourn => {
            unreachable!("sojourn events are handled without splitting");
        }
    }
}

/// Packet-identity kind for an event landing on an existing range head.
fn head_kind(seg: &DataSeg, level: u32) -> SentKind {
    if level != 0 {
        SentKind::None
    } else if seg.retrans {
        SentKind::Rtr
    } else {
        SentKind::Pkt
    }
}
