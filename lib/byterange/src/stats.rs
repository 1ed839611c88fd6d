//! Statistics containers shared by the core and the output layer: per-connection summaries,
//! per-packet records, and the cross-connection aggregates.

use std::fmt;

use crate::{Config, SentKind};

/// Counter, min, max and sum of a sample stream.
#[derive(Clone, Copy, Debug)]
pub struct BaseStats {
    counter: u64,
    pub min: i64,
    pub max: i64,
    pub cum: i64,
    /// False once an aggregation step found nothing to aggregate.
    pub valid: bool,
}

impl Default for BaseStats {
    fn default() -> Self {
        Self {
            counter: 0,
            min: i64::MAX,
            max: 0,
            cum: 0,
            valid: true,
        }
    }
}

impl BaseStats {
    pub fn add(&mut self, val: i64) {
        self.counter += 1;
        self.min = self.min.min(val);
        self.max = self.max.max(val);
        self.cum += val;
    }

    pub fn avg(&self) -> f64 {
        if self.counter == 0 {
            return 0.0;
        }
        self.cum as f64 / self.counter as f64
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn add_to_aggregate(&mut self, rhs: &BaseStats) {
        if !rhs.valid {
            log::warn!("skipping invalid statistics in aggregation");
            return;
        }
        self.min = self.min.min(rhs.min);
        self.max = self.max.max(rhs.max);
        self.cum += rhs.cum;
        self.counter += 1;
    }
}

/// User-requested percentile points over a sorted sample vector. The 25/50/75 points double as
/// quartiles in reports.
#[derive(Clone, Debug, Default)]
pub struct Percentiles {
    /// (requested percentile, computed value); in request order.
    pub points: Vec<(f64, f64)>,
}

impl Percentiles {
    /// Parse a comma-separated percentile list ("1,25,50,75,99"). Values at or above 100 are
    /// rejected with a warning.
    pub fn parse(spec: &str) -> Self {
        let mut points = Vec::new();
        for token in spec.split(',').filter(|t| !t.is_empty()) {
            match token.trim().parse::<f64>() {
                Ok(p) if p > 0.0 && p < 100.0 => points.push((p, 0.0)),
                _ => log::warn!("invalid percentile '{token}'"),
            }
        }
        Self { points }
    }

    pub fn compute(&mut self, sorted: &[f64]) {
        if sorted.is_empty() {
            return;
        }
        for (p, value) in &mut self.points {
            let idx = ((sorted.len() as f64 * (*p / 100.0)).ceil() as usize)
                .min(sorted.len() - 1);
            *value = sorted[idx];
        }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// [`BaseStats`] plus the raw samples, so standard deviation and percentiles can be computed
/// once the stream is complete.
#[derive(Clone, Debug, Default)]
pub struct ExtendedStats {
    pub base: BaseStats,
    values: Vec<f64>,
    pub std_dev: f64,
    pub percentiles: Percentiles,
}

impl ExtendedStats {
    pub fn new(percentile_spec: &str) -> Self {
        Self {
            percentiles: Percentiles::parse(percentile_spec),
            ..Default::default()
        }
    }

    pub fn add(&mut self, val: i64) {
        self.base.add(val);
        self.values.push(val as f64);
    }

    pub fn add_to_aggregate(&mut self, rhs: &ExtendedStats) {
        self.base.add_to_aggregate(&rhs.base);
        self.values.extend_from_slice(&rhs.values);
    }

    /// Finish the stream: standard deviation and percentile points. Marks the stats invalid
    /// when no samples arrived.
    pub fn make_stats(&mut self) {
        if self.values.is_empty() {
            self.base.valid = false;
            return;
        }
        let mean = self.base.avg();
        let sq_sum: f64 = self.values.iter().map(|v| (v - mean) * (v - mean)).sum();
        self.std_dev = (sq_sum / self.values.len() as f64).sqrt();

        self.values.sort_by(|a, b| a.total_cmp(b));
        self.percentiles.compute(&self.values);
    }
}

/// One entry of an ack-latency or delay-variation time series.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LatencyItem {
    pub time_ms: u64,
    pub latency_ms: i64,
    pub conn_key: String,
}

impl LatencyItem {
    pub fn new(time_ms: u64, latency_ms: i64, conn_key: &str) -> Self {
        Self {
            time_ms,
            latency_ms,
            conn_key: conn_key.to_owned(),
        }
    }
}

impl fmt::Display for LatencyItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.time_ms, self.latency_ms, self.conn_key)
    }
}

/// Loss observed within one aggregation interval, together with the interval's totals so
/// relative loss can be reported.
#[derive(Clone, Copy, Debug, Default)]
pub struct LossInterval {
    /// Lost packets.
    pub cnt_bytes: f64,
    /// Lost bytes.
    pub all_bytes: f64,
    /// Lost bytes that were new data when first sent.
    pub new_bytes: f64,
    /// Packets sent in the interval.
    pub tot_cnt_bytes: f64,
    /// Bytes sent in the interval.
    pub tot_all_bytes: f64,
    /// New bytes sent in the interval.
    pub tot_new_bytes: f64,
}

impl LossInterval {
    pub fn new(cnt_bytes: f64, all_bytes: f64, new_bytes: f64) -> Self {
        Self {
            cnt_bytes,
            all_bytes,
            new_bytes,
            ..Default::default()
        }
    }

    pub fn add_total(&mut self, packets: f64, all_bytes: f64, new_bytes: f64) {
        self.tot_cnt_bytes += packets;
        self.tot_all_bytes += all_bytes;
        self.tot_new_bytes += new_bytes;
    }
}

impl std::ops::AddAssign for LossInterval {
    fn add_assign(&mut self, rhs: Self) {
        self.cnt_bytes += rhs.cnt_bytes;
        self.all_bytes += rhs.all_bytes;
        self.new_bytes += rhs.new_bytes;
    }
}

/// One transmitted packet, as reconstructed from the range map.
#[derive(Clone, Debug)]
pub struct PacketStats {
    pub kind: SentKind,
    pub conn_key: String,
    pub send_time_us: u64,
    pub length: u64,
    /// Inter-transmission time to the previous packet of the same connection, filled after
    /// sorting.
    pub itt_us: Option<u64>,
    pub ack_latency_us: i64,
    pub sojourn_times: Vec<(u64, i64)>,
}

impl PacketStats {
    pub fn new(kind: SentKind, conn_key: &str, send_time_us: u64, length: u64) -> Self {
        Self {
            kind,
            conn_key: conn_key.to_owned(),
            send_time_us,
            length,
            itt_us: None,
            ack_latency_us: 0,
            sojourn_times: Vec::new(),
        }
    }
}

/// Per-connection packet statistics: latency, packet length and inter-transmission time,
/// per-rank retransmit and duplicate-ACK histograms, and the per-packet records behind them.
#[derive(Clone, Debug, Default)]
pub struct PacketsStats {
    pub latency: ExtendedStats,
    pub packet_length: ExtendedStats,
    pub itt: ExtendedStats,
    /// `retrans[r]` counts ranges retransmitted more than `r` times.
    pub retrans: Vec<u64>,
    /// `dupacks[r]` counts ranges that saw more than `r` duplicate ACKs.
    pub dupacks: Vec<u64>,
    pub packet_stats: Vec<PacketStats>,
}

impl PacketsStats {
    pub fn new(cfg: &Config) -> Self {
        Self {
            latency: ExtendedStats::new(&cfg.percentiles),
            packet_length: ExtendedStats::new(&cfg.percentiles),
            itt: ExtendedStats::new(&cfg.percentiles),
            ..Default::default()
        }
    }

    pub fn add_packet_stats(&mut self, ps: PacketStats) {
        self.packet_stats.push(ps);
    }

    /// Order the packets by (connection, send time) and derive per-packet ITT.
    pub fn sort_and_compute_itt(&mut self) {
        self.packet_stats
            .sort_by(|a, b| (&a.conn_key, a.send_time_us).cmp(&(&b.conn_key, b.send_time_us)));

        for i in 1..self.packet_stats.len() {
            let prev_time = self.packet_stats[i - 1].send_time_us;
            let cur = &mut self.packet_stats[i];
            let itt = cur.send_time_us.saturating_sub(prev_time);
            cur.itt_us = Some(itt);
            self.itt.add(itt as i64);
        }
    }

    pub fn make_stats(&mut self) {
        self.latency.make_stats();
        self.packet_length.make_stats();
        self.itt.make_stats();
    }

    pub fn has_stats(&self) -> bool {
        !self.packet_stats.is_empty()
            || self.latency.base.counter() > 0
            || self.packet_length.base.counter() > 0
    }
}

/// Min/avg/max summaries of the three [`PacketsStats`] streams, for the aggregate report.
#[derive(Clone, Copy, Debug, Default)]
pub struct SummaryStats {
    pub latency: BaseStats,
    pub packet_length: BaseStats,
    pub itt: BaseStats,
}

/// Cross-connection aggregation of [`PacketsStats`].
#[derive(Clone, Debug, Default)]
pub struct AggrPacketStats {
    pub aggregated: PacketsStats,
    pub minimum: SummaryStats,
    pub average: SummaryStats,
    pub maximum: SummaryStats,
}

impl AggrPacketStats {
    pub fn new(cfg: &Config) -> Self {
        Self {
            aggregated: PacketsStats::new(cfg),
            ..Default::default()
        }
    }

    pub fn add(&mut self, bs: &PacketsStats) {
        self.aggregated.latency.add_to_aggregate(&bs.latency);
        self.average.latency.add(bs.latency.base.avg() as i64);
        self.minimum.latency.add(bs.latency.base.min);
        self.maximum.latency.add(bs.latency.base.max);

        self.aggregated
            .packet_length
            .add_to_aggregate(&bs.packet_length);
        self.average
            .packet_length
            .add(bs.packet_length.base.avg() as i64);
        self.minimum.packet_length.add(bs.packet_length.base.min);
        self.maximum.packet_length.add(bs.packet_length.base.max);

        self.aggregated.itt.add_to_aggregate(&bs.itt);
        self.average.itt.add(bs.itt.base.avg() as i64);
        self.minimum.itt.add(bs.itt.base.min);
        self.maximum.itt.add(bs.itt.base.max);

        if self.aggregated.retrans.len() < bs.retrans.len() {
            self.aggregated.retrans.resize(bs.retrans.len(), 0);
        }
        for (slot, count) in self.aggregated.retrans.iter_mut().zip(&bs.retrans) {
            *slot += count;
        }

        if self.aggregated.dupacks.len() < bs.dupacks.len() {
            self.aggregated.dupacks.resize(bs.dupacks.len(), 0);
        }
        for (slot, count) in self.aggregated.dupacks.iter_mut().zip(&bs.dupacks) {
            *slot += count;
        }
    }

    /// Finish the aggregated streams after every connection was added.
    pub fn make_stats(&mut self) {
        self.aggregated.make_stats();
    }
}

/// Per-connection sums handed to the aggregate report. One instance accumulates across
/// connections when aggregation is enabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConnStats {
    pub conns: u64,
    pub duration_sec: u64,
    pub analysed_duration_sec: u64,
    pub analysed_start_sec: u64,
    pub analysed_end_sec: u64,
    pub tot_bytes_sent: u64,
    pub tot_retrans_bytes_sent: u64,
    pub tot_unique_bytes: u64,
    pub tot_unique_bytes_sent: u64,
    pub tot_packet_size: u64,
    pub nr_packets_sent: u64,
    pub nr_packets_sent_found_in_dump: u64,
    pub nr_packets_received_found_in_dump: u64,
    pub nr_data_packets_sent: u64,
    pub nr_packet_retrans: u64,
    pub nr_packet_retrans_no_payload: u64,
    pub bundle_count: u64,
    pub redundant_bytes: u64,
    pub rdb_packet_hits: u64,
    pub rdb_packet_misses: u64,
    pub rdb_bytes_sent: u64,
    pub rdb_byte_hits: u64,
    pub rdb_byte_misses: u64,
    pub ack_count: u64,
    pub syn_count: u64,
    pub fin_count: u64,
    pub rst_count: u64,
    pub pure_acks_count: u64,
    pub ranges_sent: u64,
    pub ranges_lost: u64,
    pub bytes_lost: u64,
    pub packets_lost: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_stats() {
        let mut bs = BaseStats::default();
        bs.add(10);
        bs.add(30);
        bs.add(20);
        assert_eq!(bs.min, 10);
        assert_eq!(bs.max, 30);
        assert_eq!(bs.cum, 60);
        assert_eq!(bs.counter(), 3);
        assert_eq!(bs.avg(), 20.0);
    }

    #[test]
    fn test_extended_stats_stddev() {
        let mut es = ExtendedStats::default();
        for v in [2, 4, 4, 4, 5, 5, 7, 9] {
            es.add(v);
        }
        es.make_stats();
        assert!((es.std_dev - 2.0).abs() < 1e-9);
        assert!(es.base.valid);
    }

    #[test]
    fn test_extended_stats_empty_is_invalid() {
        let mut es = ExtendedStats::default();
        es.make_stats();
        assert!(!es.base.valid);
    }

    #[test]
    fn test_percentiles_parse_rejects_garbage() {
        let p = Percentiles::parse("25,50,banana,150,99");
        let requested: Vec<f64> = p.points.iter().map(|&(p, _)| p).collect();
        assert_eq!(requested, vec![25.0, 50.0, 99.0]);
    }

    #[test]
    fn test_percentiles_compute() {
        let mut p = Percentiles::parse("50,90");
        let values: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        p.compute(&values);
        assert_eq!(p.points[0].1, 51.0);
        assert_eq!(p.points[1].1, 91.0);
    }

    #[test]
    fn test_itt_ordering() {
        let mut ps = PacketsStats::default();
        ps.add_packet_stats(PacketStats::new(SentKind::Pkt, "c", 3000, 100));
        ps.add_packet_stats(PacketStats::new(SentKind::Pkt, "c", 1000, 100));
        ps.add_packet_stats(PacketStats::new(SentKind::Pkt, "c", 2000, 100));
        ps.sort_and_compute_itt();

        let itts: Vec<Option<u64>> = ps.packet_stats.iter().map(|p| p.itt_us).collect();
        assert_eq!(itts, vec![None, Some(1000), Some(1000)]);
        assert_eq!(ps.itt.base.counter(), 2);
    }
}
