use std::time::Duration;

use crate::util::{dur_ms, dur_us};
use crate::{RecvType, SentKind};

/// A maximal contiguous interval `[start, end)` of relative sequence numbers whose bytes all
/// share the same set of send events. Zero-length ranges (`start == end`) anchor pure control
/// packets (SYN/FIN/RST/plain ACK) at a stream position.
///
/// Every transmission, arrival and acknowledgment observed for the interval is recorded here;
/// the derived fields (`recv_diff`, `recv_type`, RDB hit/miss counts) are filled in by the
/// post-ingest passes on [`RangeManager`](crate::RangeManager).
#[derive(Clone, Debug, Default)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,

    // packet-identity counters; only ever bumped for the range at the head of a packet
    pub packet_sent_count: u32,
    pub packet_retrans_count: u32,
    pub acked_sent: u32,
    pub packet_received_count: u32,

    // data-event counters; bumped on every range a packet's payload touches
    pub data_retrans_count: u32,
    pub rdb_count: u32,
    pub data_received_count: u32,

    pub ack_count: u32,
    pub dupack_count: u32,

    // control flag counters; a SYN/FIN/RST retry bumps these again
    pub syn: u32,
    pub fin: u32,
    pub rst: u32,

    /// Every send of these bytes, in capture order, with its packet-identity kind.
    pub sent_tstamp_pcap: Vec<(Duration, SentKind)>,
    /// TCP timestamp (TSval, TSecr) per regular send, in send order.
    pub tstamps_tcp: Vec<(u32, u32)>,
    /// TCP timestamp (TSval, TSecr) per RDB-bundled send, in send order.
    pub rdb_tstamps_tcp: Vec<(u32, u32)>,
    /// Which of `sent_tstamp_pcap`'s entries were RDB-bundled; parallel to it. This is what lets
    /// the receive-type matcher line the two TCP-timestamp vectors back up with the send order.
    pub(crate) sent_is_rdb: Vec<bool>,

    /// Capture time of the first ACK covering this range.
    pub ack_tstamp: Option<Duration>,
    /// Receiver-side capture time of the first arrival.
    pub received_tstamp_pcap: Option<Duration>,
    /// TCP timestamp value carried by the first arrival.
    pub received_tstamp_tcp: u32,
    /// Sends whose TCP timestamp never showed up at the receiver: (TSval, send capture time).
    pub lost_tstamps_tcp: Vec<(u32, Duration)>,

    /// Sojourn samples: (sub-range end seq, time the segment entered the kernel).
    pub sojourn_tstamps: Vec<(u64, Duration)>,

    /// One-way delay sample in milliseconds, drift-compensated after the latency passes.
    pub recv_diff: i64,
    pub recv_type: RecvType,
    /// Payload size of the packet that created this range.
    pub original_payload_size: u64,
    pub original_packet_is_rdb: bool,
    /// Receive window of the most recent ACK landing on this range.
    pub tcp_window: u16,
    pub rdb_byte_miss: u64,
    pub rdb_byte_hits: u64,
    /// Index into `sent_tstamp_pcap` of the send the receiver's TCP timestamp matched.
    pub send_tcp_stamp_recv_index: usize,
    /// The first arrival extended the receiver's in-order prefix, so it is a valid
    /// application-layer delivery anchor.
    pub(crate) app_layer_latency_tstamp: bool,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            ..Default::default()
        }
    }

    #[inline]
    pub fn byte_count(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    #[inline]
    pub fn is_acked(&self) -> bool {
        self.ack_tstamp.is_some()
    }

    /// Number of data-bearing send events recorded for this range.
    #[inline]
    pub fn data_sent_count(&self) -> u32 {
        self.sent_tstamp_pcap.len() as u32
    }

    /// Retransmission rank of this range (how many times its bytes were retransmitted).
    #[inline]
    pub fn num_retrans(&self) -> u32 {
        self.data_retrans_count
    }

    /// Truncate this range to `[self.start, at)` and return the tail `[at, new_end)`.
    ///
    /// The tail inherits the per-byte event history (send and receive timestamps, data-level
    /// counters): after a split each byte must still carry the same set of events it had before.
    /// Packet-identity counters and kinds stay on the head so a packet in the dump is never
    /// counted twice; inherited send entries are therefore re-marked [`SentKind::None`].
    /// The caller must insert the returned range into the map.
    pub fn split_end(&mut self, at: u64, new_end: u64) -> ByteRange {
        debug_assert!(self.start < at && at <= new_end);

        let mut tail = ByteRange::new(at, new_end);
        tail.sent_tstamp_pcap = self
            .sent_tstamp_pcap
            .iter()
            .map(|&(t, _)| (t, SentKind::None))
            .collect();
        tail.tstamps_tcp = self.tstamps_tcp.clone();
        tail.rdb_tstamps_tcp = self.rdb_tstamps_tcp.clone();
        tail.sent_is_rdb = self.sent_is_rdb.clone();
        tail.data_retrans_count = self.data_retrans_count;
        tail.rdb_count = self.rdb_count;
        tail.data_received_count = self.data_received_count;
        tail.received_tstamp_pcap = self.received_tstamp_pcap;
        tail.received_tstamp_tcp = self.received_tstamp_tcp;
        tail.app_layer_latency_tstamp = self.app_layer_latency_tstamp;
        tail.ack_tstamp = self.ack_tstamp;
        tail.original_payload_size = self.original_payload_size;
        tail.original_packet_is_rdb = self.original_packet_is_rdb;

        // sojourn samples follow the sub-range they belong to
        let (head_sojourn, tail_sojourn) = self
            .sojourn_tstamps
            .drain(..)
            .partition(|&(sub_end, _)| sub_end <= at);
        self.sojourn_tstamps = head_sojourn;
        tail.sojourn_tstamps = tail_sojourn;

        self.end = at;
        tail
    }

    /// Record a transmission of these bytes. `is_rdb_data` routes the TCP timestamp to the RDB
    /// vector; `kind` carries packet identity (see [`SentKind`]).
    pub fn increase_sent(
        &mut self,
        tstamp_tcp: u32,
        tstamp_tcp_echo: u32,
        tstamp_pcap: Duration,
        is_rdb_data: bool,
        kind: SentKind,
    ) {
        if is_rdb_data {
            self.rdb_tstamps_tcp.push((tstamp_tcp, tstamp_tcp_echo));
        } else {
            self.tstamps_tcp.push((tstamp_tcp, tstamp_tcp_echo));
        }
        self.sent_is_rdb.push(is_rdb_data);
        self.sent_tstamp_pcap.push((tstamp_pcap, kind));

        match kind {
            SentKind::Pkt => self.packet_sent_count += 1,
            SentKind::Rtr => self.packet_retrans_count += 1,
            SentKind::PureAck => self.acked_sent += 1,
            SentKind::Rst | SentKind::None => {}
        }
    }

    /// Record a receiver-side arrival. The first arrival pins the receive timestamps; later
    /// arrivals (retransmits of already-delivered data) only bump the counter.
    pub fn increase_received(&mut self, tstamp_tcp: u32, tstamp_pcap: Duration, in_sequence: bool) {
        if self.received_tstamp_pcap.is_none() {
            self.received_tstamp_pcap = Some(tstamp_pcap);
            self.received_tstamp_tcp = tstamp_tcp;
            self.app_layer_latency_tstamp = in_sequence;
        }
        self.data_received_count += 1;
    }

    /// Record the capture time of the first ACK covering this range. Later ACKs are ignored;
    /// the caller guards with [`is_acked`](Self::is_acked).
    pub fn insert_ack_time(&mut self, tstamp_pcap: Duration) {
        if self.ack_tstamp.is_none() {
            self.ack_tstamp = Some(tstamp_pcap);
        }
    }

    /// Attach a sojourn sample if `sub_end_seq` lies within `(start, end]`.
    pub fn add_segment_entered_kernel_time(&mut self, sub_end_seq: u64, tstamp_pcap: Duration) -> bool {
        if sub_end_seq > self.start && sub_end_seq <= self.end {
            self.sojourn_tstamps.push((sub_end_seq, tstamp_pcap));
            true
        } else {
            false
        }
    }

    /// Time from first send to first ACK in microseconds; 0 if the range was never acked.
    pub fn send_ack_time_diff(&self) -> i64 {
        let (Some(ack), Some(&(sent, _))) = (self.ack_tstamp, self.sent_tstamp_pcap.first()) else {
            return 0;
        };
        let diff = dur_us(ack) - dur_us(sent);
        if diff < 0 {
            log::warn!(
                "ack time precedes send time for range [{}, {}) ({} us)",
                self.start,
                self.end,
                diff
            );
            return 0;
        }
        diff
    }

    /// Sojourn times as (sub-range end seq, microseconds spent in the kernel before the wire).
    pub fn sojourn_times(&self) -> Vec<(u64, i64)> {
        let Some(&(wire, _)) = self.sent_tstamp_pcap.first() else {
            return Vec::new();
        };
        self.sojourn_tstamps
            .iter()
            .map(|&(sub_end, entered)| (sub_end, dur_us(wire) - dur_us(entered)))
            .collect()
    }

    /// Classify how the receiver saw this range by matching its received TCP timestamp against
    /// the recorded sends, and collect the sends that never arrived into `lost_tstamps_tcp`.
    /// Returns false when the range was received but no send matches (a capture anomaly).
    ///
    /// Idempotent: a second call on an already-classified range is a no-op.
    pub(crate) fn match_received_type(&mut self) -> bool {
        if self.recv_type != RecvType::Def || !self.lost_tstamps_tcp.is_empty() {
            return self.recv_type != RecvType::Def;
        }
        if self.data_received_count == 0 {
            // nothing arrived; every send of these bytes was lost
            self.collect_lost(None);
            return false;
        }

        let mut reg_i = 0usize;
        let mut matched: Option<usize> = None;
        for (i, &is_rdb) in self.sent_is_rdb.iter().enumerate() {
            let tsval = if is_rdb {
                self.rdb_tstamps_tcp[reg_rdb_index(&self.sent_is_rdb, i)].0
            } else {
                self.tstamps_tcp[reg_i].0
            };
            if matched.is_none() && tsval == self.received_tstamp_tcp {
                matched = Some(i);
                self.send_tcp_stamp_recv_index = i;
                self.recv_type = if is_rdb {
                    RecvType::Rdb
                } else if reg_i == 0 {
                    RecvType::Data
                } else {
                    RecvType::Retr
                };
            }
            if !is_rdb {
                reg_i += 1;
            }
        }
        self.collect_lost(matched);
        matched.is_some()
    }

    /// Push every send except `matched` into `lost_tstamps_tcp`.
    fn collect_lost(&mut self, matched: Option<usize>) {
        let mut reg_i = 0usize;
        let mut rdb_i = 0usize;
        for (i, &is_rdb) in self.sent_is_rdb.iter().enumerate() {
            let tsval = if is_rdb {
                let v = self.rdb_tstamps_tcp[rdb_i].0;
                rdb_i += 1;
                v
            } else {
                let v = self.tstamps_tcp[reg_i].0;
                reg_i += 1;
                v
            };
            if Some(i) != matched {
                self.lost_tstamps_tcp.push((tsval, self.sent_tstamp_pcap[i].0));
            }
        }
    }

    /// Compute the one-way delay sample for this range in milliseconds. In transport mode the
    /// anchor is this range's own arrival; in application-layer mode it is the arrival that last
    /// extended the receiver's in-order prefix (`app_anchor`), since that is when the data
    /// became deliverable to the application.
    pub(crate) fn calculate_recv_diff(&mut self, app_anchor: Option<Duration>) {
        let Some(own) = self.received_tstamp_pcap else {
            return;
        };
        let Some(&(sent, _)) = self.sent_tstamp_pcap.get(self.send_tcp_stamp_recv_index) else {
            return;
        };
        let recv = app_anchor.unwrap_or(own);
        self.recv_diff = dur_ms(recv) - dur_ms(sent);
    }
}

/// Index of entry `i` of the interleaved send order within the RDB timestamp vector.
fn reg_rdb_index(sent_is_rdb: &[bool], i: usize) -> usize {
    sent_is_rdb[..i].iter().filter(|&&x| x).count()
}
