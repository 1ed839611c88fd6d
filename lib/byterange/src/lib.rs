//! Byte-range bookkeeping for offline TCP trace analysis. This is a sans-I/O library: it never
//! touches pcap files or sockets, it just accepts per-segment observations ([`DataSeg`]) and
//! answers questions about them. The caller (normally the `rdbtrace` binary) decodes the capture,
//! routes each segment to the right [`Connection`], and reads the derived statistics back out
//! after ingest.
//!
//! A connection's transmitted byte stream is covered by a partitioned ordered map of
//! [`ByteRange`]s, each holding every send, receive and acknowledgment event observed for its
//! bytes. Ranges split dynamically when a new observation intersects an existing range at an
//! off-boundary offset, so after ingest every byte shares its range with exactly the bytes that
//! have the same event history. On top of that structure the [`RangeManager`] computes
//! retransmission and redundant-data-bundling (RDB) classification, ACK latency,
//! clock-drift-compensated one-way delay, loss buckets and per-packet statistics.
//!
//! Sequence numbers are handled in two spaces: the 32-bit wrapping TCP space ([`seq`] helpers)
//! and a monotone 64-bit "relative" space anchored at the connection's first observed sequence
//! number, which is what all range bookkeeping uses.

#![forbid(unsafe_code)]

use std::time::Duration;

mod connection;
mod manager;
mod range;
mod seq;
mod stats;
mod util;

#[cfg(test)]
mod tests;

pub use crate::connection::{Connection, PacketSize, PacketSizeGroup};
pub use crate::manager::{AnalysedCounters, RangeId, RangeManager};
pub use crate::range::ByteRange;
pub use crate::stats::{
    AggrPacketStats, BaseStats, ConnStats, ExtendedStats, LatencyItem, LossInterval, PacketStats,
    PacketsStats, Percentiles, SummaryStats,
};

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct TcpFlags: u8 {
        const FIN = 1 << 0;
        const SYN = 1 << 1;
        const RST = 1 << 2;
        const PSH = 1 << 3;
        const ACK = 1 << 4;
        const URG = 1 << 5;
        const ECE = 1 << 6;
        const CWR = 1 << 7;
    }
}

/// One decoded TCP segment observation. The decoder fills the absolute fields; the relative
/// fields (`seq`, `end_seq`, `ack`) are filled by the owning [`Connection`] before the segment
/// reaches the range map, and the classification fields (`retrans`, `is_rdb`, `rdb_end_seq`,
/// `in_sequence`) are filled during registration.
#[derive(Clone, Debug, Default)]
pub struct DataSeg {
    /// Relative sequence number of the first payload byte.
    pub seq: u64,
    /// Absolute (on-the-wire) sequence number.
    pub seq_absolute: u32,
    /// Relative sequence number one past the last payload byte.
    pub end_seq: u64,
    pub payload_size: u16,
    /// Total size of the packet on the wire, for throughput accounting.
    pub total_size: u32,
    pub flags: TcpFlags,
    /// Classified as a retransmission of already-registered bytes.
    pub retrans: bool,
    /// Classified as an RDB bundle: old not-yet-acked bytes resent together with new payload.
    pub is_rdb: bool,
    /// Relative end of the bundled (old) part of an RDB segment.
    pub rdb_end_seq: u64,
    /// Capture timestamp.
    pub tstamp_pcap: Duration,
    /// TCP timestamp option value (TSval), 0 if absent.
    pub tstamp_tcp: u32,
    /// TCP timestamp echo (TSecr), 0 if absent.
    pub tstamp_tcp_echo: u32,
    pub window: u16,
    /// Relative acknowledgment number (ACK stream only).
    pub ack: u64,
    /// Absolute acknowledgment number from the header.
    pub ack_absolute: u32,
    /// Receiver-side arrival extended the in-order prefix of the stream.
    pub in_sequence: bool,
}

/// What kind of transmission a send-timestamp entry on a [`ByteRange`] represents.
///
/// `None` marks entries that carry timing data but no packet identity: continuation entries from
/// a segment spanning multiple ranges, entries inherited by a split, and the bundled head of an
/// RDB segment. Packet-level counters only ever count the other kinds, so one packet in the dump
/// is counted exactly once however many ranges it touches.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum SentKind {
    #[default]
    None,
    Pkt,
    Rtr,
    Rst,
    PureAck,
}

/// How the receiver-side dump saw a range arrive: not at all (`Def`), as the original
/// transmission (`Data`), as the bundled part of an RDB segment (`Rdb`), or as a retransmission
/// (`Retr`).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum RecvType {
    #[default]
    Def,
    Data,
    Rdb,
    Retr,
}

/// Which event stream an `insert_byte_range` call comes from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InsertType {
    Sent,
    Recv,
    Sojourn,
}

/// Analysis configuration, constructed once at program start and passed by reference into the
/// core. Field semantics follow the command line of the analyzer binary.
#[derive(Clone, Debug)]
pub struct Config {
    /// A receiver-side dump is available; enables loss and one-way-delay analysis.
    pub with_recv: bool,
    /// Compute loss grouped over time intervals.
    pub with_loss: bool,
    /// Emit byte-latency-variation CDFs.
    pub with_cdf: bool,
    /// Compute transport-layer delay instead of application-layer delay.
    pub transport: bool,
    /// Print relative instead of absolute sequence numbers.
    pub relative_seq: bool,
    pub aggregate: bool,
    pub agg_only: bool,
    /// Loss bucket width in milliseconds.
    pub loss_aggr_ms: u64,
    /// Throughput bucket width in milliseconds.
    pub throughput_aggr_ms: u64,
    /// Start of the analysis window, seconds from the first packet. 0 means the whole trace.
    pub analyse_start: u32,
    /// End of the analysis window, seconds before the last packet. 0 means the whole trace.
    pub analyse_end: u32,
    /// Length of the analysis window in seconds. 0 means the whole trace.
    pub analyse_duration: u32,
    /// Extra percentiles to compute, comma separated (e.g. "1,25,50,75,99").
    pub percentiles: String,
    /// Check map invariants after ingest.
    pub validate_ranges: bool,
    /// Cap on the per-rank retransmit histogram length in reports.
    pub max_retrans_stats: u32,
    /// Sender address as it appears in the receiver dump (NAT).
    pub send_nat_ip: String,
    /// Receiver address as it appears in the receiver dump (NAT).
    pub recv_nat_ip: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            with_recv: false,
            with_loss: false,
            with_cdf: false,
            transport: false,
            relative_seq: false,
            aggregate: false,
            agg_only: false,
            loss_aggr_ms: 1000,
            throughput_aggr_ms: 1000,
            analyse_start: 0,
            analyse_end: 0,
            analyse_duration: 0,
            percentiles: String::new(),
            validate_ranges: true,
            max_retrans_stats: 6,
            send_nat_ip: String::new(),
            recv_nat_ip: String::new(),
        }
    }
}

// errors for operations on the range map and sequence space

/// Failure to lift an absolute sequence number into the relative space.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SeqError {
    /// The sequence number precedes the connection's first sequence number.
    OutOfWindow,
    /// The computed relative value is beyond any plausible trace length.
    InvalidSequence,
}

#[derive(Debug)]
pub enum InsertError {
    /// A single segment required more range-map iterations than the hard bound allows. Either
    /// the trace is hostile or the map has degenerated; the connection is poisoned.
    RecursionTooDeep { start: u64, end: u64 },
}

/// Non-fatal reasons an ACK could not be attributed to a range.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AckError {
    /// The ACK acknowledges data no sent range covers.
    ForUnsentData,
    /// The ACK's capture timestamp precedes the send time of the data it acknowledges.
    BeforeSend,
    /// The ACK lands at the start of the oldest known range; the capture probably started
    /// mid-stream.
    MissingHistory,
}

/// A post-ingest consistency check failed. Which one, and the values involved.
#[derive(Clone, Debug)]
pub enum InvariantViolation {
    FirstRangeStart { start: u64 },
    LastRangeEnd { end: u64, last_seq: u64 },
    Coverage { gap_start: u64, gap_end: u64 },
    ByteAccounting { tot_bytes_sent: u64, sum: u64 },
}
