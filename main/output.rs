//! Report printing and statistics file output. Consumes what the core computed; no analysis
//! happens here.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::Context;
use byterange::{
    AggrPacketStats, Config, ConnStats, Connection, ExtendedStats, LatencyItem, LossInterval,
    PacketsStats, RecvType,
};

use crate::cli::CliArgs;
use crate::dump::{ConnKey, Dump};

pub fn print_statistics(dump: &mut Dump, args: &CliArgs) {
    let cfg = dump.config().clone();
    let mut aggregated = ConnStats::default();
    let mut aggr_packets = AggrPacketStats::new(&cfg);
    let mut failures: Vec<(String, String)> = Vec::new();

    let keys: Vec<ConnKey> = dump.connections.keys().copied().collect();
    for key in keys {
        let conn = dump.connections.get_mut(&key).expect("key just listed");
        if let Some(why) = &conn.failure {
            failures.push((key.to_string(), why.clone()));
            continue;
        }

        let mut cs = ConnStats::default();
        conn.add_conn_stats(&mut cs);
        let bs = conn.packets_stats(&cfg).clone();

        if !cfg.agg_only {
            print_connection(&key, conn, &cs, &cfg);
            print_packets_stats(&bs, &cfg);
            if args.print_packets {
                print_packet_details(conn, &cfg);
            }
        }
        if cfg.aggregate {
            conn.add_conn_stats(&mut aggregated);
            aggr_packets.add(&bs);
        }
    }

    if cfg.aggregate {
        aggr_packets.make_stats();
        print_aggregate(&aggregated, &aggr_packets, &cfg);
    }

    print_run_summary(dump, &failures);
}

fn print_connection(key: &ConnKey, conn: &Connection, cs: &ConnStats, cfg: &Config) {
    let a = &conn.rm.analysed;
    println!();
    println!("==== Connection: {key} ====");
    println!(
        "  Duration: {:.1} sec (analysed window: {} - {} sec)",
        conn.duration(false),
        conn.rm.analyse_time_sec_start,
        conn.rm.analyse_time_sec_end
    );
    println!(
        "  Bytes: sent: {}, unique: {}, retransmitted: {}, RDB: {}, redundant: {}",
        a.bytes_sent,
        cs.tot_unique_bytes,
        a.bytes_retransmitted,
        conn.tot_rdb_bytes_sent,
        conn.rm.redundant_bytes
    );
    println!(
        "  Packets: in dump: {}, adjusted for segmentation: {}, data: {}, pure acks: {}",
        a.packet_sent_count_in_dump, a.packet_sent_count, a.data_packet_count, a.pure_acks_count
    );
    println!(
        "  Retransmissions: {} packets ({} without payload), acks received: {}",
        a.retr_packet_count, a.retr_no_payload_packet_count, a.ack_count
    );
    println!(
        "  SYN: {}, FIN: {}, RST: {}",
        a.syn_count, a.fin_count, a.rst_count
    );
    if a.rdb_packet_count > 0 {
        println!(
            "  RDB: bundles: {}, packet hits: {}, packet misses: {}, byte hits: {}, byte \
             misses: {}",
            a.rdb_packet_count,
            conn.rm.rdb_packet_hits,
            conn.rm.rdb_packet_misses,
            conn.rm.rdb_byte_hits,
            conn.rm.rdb_byte_miss
        );
    }
    if cfg.with_recv {
        println!(
            "  Loss: range transmissions: {}, bytes: {}, packets: {}, received packets in \
             dump: {}",
            a.lost_ranges_count, a.lost_bytes, a.lost_packets, a.packet_received_count
        );
        println!(
            "  One-way delay: clock drift: {:.4} ms/s, lowest delay variation baseline: {} ms",
            conn.rm.drift,
            if conn.rm.lowest_recv_diff == i64::MAX {
                0
            } else {
                conn.rm.lowest_recv_diff
            }
        );
    }
    if conn.ignored_count + conn.dropped_events + conn.ack_failures > 0 {
        println!(
            "  Anomalies: ignored packets: {}, dropped events: {}, unattributed acks: {}",
            conn.ignored_count, conn.dropped_events, conn.ack_failures
        );
    }
}

fn print_packets_stats(bs: &PacketsStats, cfg: &Config) {
    print_stats("Latency", "usec", &bs.latency);
    print_stats("Payload", "bytes", &bs.packet_length);
    print_stats("ITT", "usec", &bs.itt);

    let cap = cfg.max_retrans_stats as usize;
    if !bs.retrans.is_empty() {
        let shown = &bs.retrans[..bs.retrans.len().min(cap)];
        let counts: Vec<String> = shown
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{}. retrans: {c}", i + 1))
            .collect();
        println!("  Occurrences of retransmissions: {}", counts.join(", "));
    }
    if !bs.dupacks.is_empty() {
        let shown = &bs.dupacks[..bs.dupacks.len().min(cap)];
        let counts: Vec<String> = shown
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{}. dupack: {c}", i + 1))
            .collect();
        println!("  Occurrences of duplicate acks: {}", counts.join(", "));
    }
}

fn print_stats(name: &str, unit: &str, stats: &ExtendedStats) {
    if !stats.base.valid || stats.base.counter() == 0 {
        println!("  {name}: no samples");
        return;
    }
    println!(
        "  {name}: min: {} {unit}, avg: {:.1} {unit}, max: {} {unit}, stddev: {:.1} ({} samples)",
        stats.base.min,
        stats.base.avg(),
        stats.base.max,
        stats.std_dev,
        stats.base.counter()
    );
    for &(pct, value) in &stats.percentiles.points {
        let quartile = match pct {
            p if p == 25.0 => " (first quartile)",
            p if p == 50.0 => " (median)",
            p if p == 75.0 => " (third quartile)",
            _ => "",
        };
        println!("    {pct:>5.1}th percentile{quartile}: {value:.1} {unit}");
    }
}

fn print_packet_details(conn: &Connection, cfg: &Config) {
    println!("  Packet details for conn: {}", conn.key);
    let first_seq = conn.rm.first_seq as u64;
    let seq_of = |rel: u64| {
        if cfg.relative_seq {
            rel
        } else {
            (first_seq + rel) % (1u64 << 32)
        }
    };
    for br in conn.rm.analysed_ranges() {
        print!(
            "  R({:>6}): {:>10} - {:<10} snt-pkt: {}, snt-ack: {}, rcv-pkt: {}, sent: {}, \
             rcv: {}, retr-pkt: {}, retr-dta: {}, rdb-cnt: {}, ACKtime: {:>6}",
            br.byte_count(),
            seq_of(br.start),
            seq_of(br.end),
            br.packet_sent_count,
            br.acked_sent,
            br.packet_received_count,
            br.data_sent_count(),
            br.data_received_count,
            br.packet_retrans_count,
            br.data_retrans_count,
            br.rdb_count,
            br.send_ack_time_diff() / 1000,
        );
        if cfg.with_recv {
            let recv = match br.recv_type {
                RecvType::Def => "DEF",
                RecvType::Data => "DTA",
                RecvType::Rdb => "RDB",
                RecvType::Retr => "RTR",
            };
            print!(", RCV: {recv}");
            if br.data_sent_count() > br.data_received_count {
                print!("   LOST {} times", br.data_sent_count() - br.data_received_count);
            }
        }
        if !br.sojourn_tstamps.is_empty() {
            let times: Vec<String> = br
                .sojourn_times()
                .iter()
                .take(3)
                .map(|&(_, us)| us.to_string())
                .collect();
            print!(", SOJ({}): {}", br.sojourn_tstamps.len(), times.join(", "));
        }
        if br.syn > 0 {
            print!(" SYN({})", br.syn);
        }
        if br.rst > 0 {
            print!(" RST({})", br.rst);
        }
        if br.fin > 0 {
            print!(" FIN({})", br.fin);
        }
        println!();
    }
}

fn print_aggregate(cs: &ConnStats, aggr: &AggrPacketStats, cfg: &Config) {
    println!();
    println!("==== Aggregate statistics for {} connections ====", cs.conns);
    println!(
        "  Duration: {} sec analysed across connections",
        cs.analysed_duration_sec
    );
    println!(
        "  Bytes: sent: {}, unique: {}, retransmitted: {}, redundant: {}, lost: {}",
        cs.tot_bytes_sent,
        cs.tot_unique_bytes_sent,
        cs.tot_retrans_bytes_sent,
        cs.redundant_bytes,
        cs.bytes_lost
    );
    println!(
        "  Packets: in dump: {}, adjusted: {}, data: {}, retransmissions: {}, pure acks: {}",
        cs.nr_packets_sent_found_in_dump,
        cs.nr_packets_sent,
        cs.nr_data_packets_sent,
        cs.nr_packet_retrans,
        cs.pure_acks_count
    );
    if cs.bundle_count > 0 {
        println!(
            "  RDB: bundles: {}, packet hits: {}, packet misses: {}, byte hits: {}, byte \
             misses: {}",
            cs.bundle_count,
            cs.rdb_packet_hits,
            cs.rdb_packet_misses,
            cs.rdb_byte_hits,
            cs.rdb_byte_misses
        );
    }
    if cfg.with_recv {
        println!(
            "  Loss: range transmissions: {}, packets: {}, received packets in dump: {}",
            cs.ranges_lost, cs.packets_lost, cs.nr_packets_received_found_in_dump
        );
    }

    println!("  -- aggregated over all packets --");
    print_stats("Latency", "usec", &aggr.aggregated.latency);
    print_stats("Payload", "bytes", &aggr.aggregated.packet_length);
    print_stats("ITT", "usec", &aggr.aggregated.itt);
    println!("  -- per-connection extremes --");
    println!(
        "  Latency: min of mins: {} usec, avg of avgs: {:.1} usec, max of maxes: {} usec",
        aggr.minimum.latency.min,
        aggr.average.latency.avg(),
        aggr.maximum.latency.max
    );
    println!(
        "  ITT: min of mins: {} usec, avg of avgs: {:.1} usec, max of maxes: {} usec",
        aggr.minimum.itt.min,
        aggr.average.itt.avg(),
        aggr.maximum.itt.max
    );

    let cap = cfg.max_retrans_stats as usize;
    if !aggr.aggregated.retrans.is_empty() {
        let shown = &aggr.aggregated.retrans[..aggr.aggregated.retrans.len().min(cap)];
        let counts: Vec<String> = shown
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{}. retrans: {c}", i + 1))
            .collect();
        println!("  Occurrences of retransmissions: {}", counts.join(", "));
    }
}

fn print_run_summary(dump: &Dump, failures: &[(String, String)]) {
    let s = &dump.stats;
    println!();
    println!("==== Dump summary ====");
    println!(
        "  Sender dump: {} packets, {} TCP, {} sent, {} acks, {} filtered out, {} unmatched",
        s.sender_packets,
        s.sender_tcp_packets,
        s.sent_packet_count,
        s.ack_packet_count,
        s.filtered_out,
        s.unmatched
    );
    if s.receiver_packets > 0 {
        println!(
            "  Receiver dump: {} packets, {} arrivals registered",
            s.receiver_packets, s.recv_packet_count
        );
    }
    if s.sojourn_packet_count > 0 {
        println!("  Sojourn dump: {} samples registered", s.sojourn_packet_count);
    }
    if !failures.is_empty() {
        println!("  {} connection(s) failed analysis:", failures.len());
        for (key, why) in failures {
            println!("    {key}: {why}");
        }
    }
}

// --- statistics files ---------------------------------------------------------------------

pub fn write_statistics_files(dump: &Dump, dir: &Path, name: &str) -> anyhow::Result<()> {
    let cfg = dump.config().clone();
    let prefix = Prefix { dir, name };
    let first_tstamp_ms = dump.first_sent_tstamp_ms();

    write_ack_latency_files(dump, &cfg, &prefix, first_tstamp_ms)?;
    write_packet_itt_files(dump, &cfg, &prefix)?;
    write_throughput_files(dump, &cfg, &prefix)?;
    if cfg.with_recv && cfg.with_loss {
        write_loss_files(dump, &cfg, &prefix, first_tstamp_ms)?;
    }
    if cfg.with_recv && cfg.with_cdf {
        write_latency_variation_cdf_files(dump, &cfg, &prefix)?;
        write_queueing_delay_files(dump, &cfg, &prefix, first_tstamp_ms)?;
    }
    Ok(())
}

struct Prefix<'a> {
    dir: &'a Path,
    name: &'a str,
}

fn new_stream(path: &Path, header: &str) -> anyhow::Result<BufWriter<File>> {
    let file =
        File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut stream = BufWriter::new(file);
    if !header.is_empty() {
        writeln!(stream, "{header}")?;
    }
    Ok(stream)
}

fn dat_path(prefix: &Prefix<'_>, family: &str, suffix: &str) -> std::path::PathBuf {
    prefix
        .dir
        .join(format!("{}{family}-{suffix}.dat", prefix.name))
}

/// Ack-latency time series, one file per retransmission rank; rank "all" holds every sample.
fn write_ack_latency_files(
    dump: &Dump,
    cfg: &Config,
    prefix: &Prefix<'_>,
    first_tstamp_ms: i64,
) -> anyhow::Result<()> {
    let mut aggregated: Vec<Vec<LatencyItem>> = Vec::new();

    for (key, conn) in &dump.connections {
        if conn.failure.is_some() {
            continue;
        }
        let mut series: Vec<Vec<LatencyItem>> = Vec::new();
        conn.rm
            .gen_ack_latency_data(first_tstamp_ms, &mut series, &key.to_string());

        if cfg.aggregate {
            if aggregated.len() < series.len() {
                aggregated.resize(series.len(), Vec::new());
            }
            for (agg, s) in aggregated.iter_mut().zip(&series) {
                agg.extend(s.iter().cloned());
            }
        }
        if !cfg.agg_only {
            write_latency_series(&series, cfg, prefix, &key.to_string())?;
        }
    }

    if cfg.aggregate {
        write_latency_series(&aggregated, cfg, prefix, "aggr")?;
    }
    Ok(())
}

fn write_latency_series(
    series: &[Vec<LatencyItem>],
    cfg: &Config,
    prefix: &Prefix<'_>,
    suffix: &str,
) -> anyhow::Result<()> {
    let cap = (cfg.max_retrans_stats as usize + 1).min(series.len());
    for (rank, items) in series.iter().take(cap).enumerate() {
        if items.is_empty() {
            continue;
        }
        let family = if rank == 0 {
            "ack-latency-all".to_owned()
        } else {
            format!("ack-latency-retr{rank}")
        };
        let mut stream = new_stream(
            &dat_path(prefix, &family, suffix),
            "time_ms,latency_ms,stream_id",
        )?;
        for item in items {
            writeln!(stream, "{item}")?;
        }
    }
    Ok(())
}

/// Per-packet send times, inter-transmission times and byte counts.
fn write_packet_itt_files(dump: &Dump, cfg: &Config, prefix: &Prefix<'_>) -> anyhow::Result<()> {
    for (key, conn) in &dump.connections {
        if conn.failure.is_some() || cfg.agg_only {
            continue;
        }
        let mut stream = new_stream(
            &dat_path(prefix, "packet-itt", &key.to_string()),
            "time_us,itt_ms,payload_bytes,packet_bytes",
        )?;
        for (time_us, itt_ms, payload, size) in conn.packet_itt_records() {
            writeln!(stream, "{time_us},{itt_ms},{payload},{size}")?;
        }
    }
    Ok(())
}

/// Bytes on the wire per throughput aggregation interval.
fn write_throughput_files(dump: &Dump, cfg: &Config, prefix: &Prefix<'_>) -> anyhow::Result<()> {
    for (key, conn) in &dump.connections {
        if conn.failure.is_some() || cfg.agg_only || conn.packet_size_groups.is_empty() {
            continue;
        }
        let mut stream = new_stream(
            &dat_path(prefix, "throughput", &key.to_string()),
            "interval,packets,bytes,payload_bytes,retransmissions,throughput_bps",
        )?;
        for (idx, group) in conn.packet_size_groups.iter().enumerate() {
            let bits_per_sec =
                group.bytes as f64 * 8.0 * 1000.0 / cfg.throughput_aggr_ms.max(1) as f64;
            writeln!(
                stream,
                "{idx},{},{},{},{},{bits_per_sec:.0}",
                group.count, group.bytes, group.payload_bytes, group.retrans_count
            )?;
        }
    }
    Ok(())
}

/// Loss per aggregation interval, absolute and relative to what was sent.
fn write_loss_files(
    dump: &Dump,
    cfg: &Config,
    prefix: &Prefix<'_>,
    first_tstamp_ms: i64,
) -> anyhow::Result<()> {
    let mut all_loss: Vec<LossInterval> = Vec::new();

    for (key, conn) in &dump.connections {
        if conn.failure.is_some() {
            continue;
        }
        let mut loss: Vec<LossInterval> = Vec::new();
        conn.rm
            .calculate_loss_grouped_by_interval(first_tstamp_ms, &mut all_loss, &mut loss, cfg);
        if !cfg.agg_only {
            write_loss_intervals(&loss, prefix, &key.to_string())?;
        }
    }
    if cfg.aggregate {
        write_loss_intervals(&all_loss, prefix, "aggr")?;
    }
    Ok(())
}

fn write_loss_intervals(
    intervals: &[LossInterval],
    prefix: &Prefix<'_>,
    suffix: &str,
) -> anyhow::Result<()> {
    let mut stream = new_stream(
        &dat_path(prefix, "loss", suffix),
        "interval,lost_packets,lost_bytes,lost_new_bytes,sent_packets,sent_bytes,\
         sent_new_bytes,packet_loss_rate",
    )?;
    for (idx, li) in intervals.iter().enumerate() {
        let rate = if li.tot_cnt_bytes > 0.0 {
            li.cnt_bytes / li.tot_cnt_bytes
        } else {
            0.0
        };
        writeln!(
            stream,
            "{idx},{},{},{},{},{},{},{rate:.6}",
            li.cnt_bytes, li.all_bytes, li.new_bytes, li.tot_cnt_bytes, li.tot_all_bytes,
            li.tot_new_bytes
        )?;
    }
    Ok(())
}

/// Byte-latency-variation CDF: fraction of bytes at or below each delay-variation value.
fn write_latency_variation_cdf_files(
    dump: &Dump,
    cfg: &Config,
    prefix: &Prefix<'_>,
) -> anyhow::Result<()> {
    let mut aggregated: std::collections::BTreeMap<i64, u64> = std::collections::BTreeMap::new();

    for (key, conn) in &dump.connections {
        if conn.failure.is_some() {
            continue;
        }
        let cdf = &conn.rm.byte_latency_variation_cdf;
        if cfg.aggregate {
            for (&diff, &bytes) in cdf {
                *aggregated.entry(diff).or_insert(0) += bytes;
            }
        }
        if !cfg.agg_only {
            let mut stream = new_stream(
                &dat_path(prefix, "latency-variation-cdf", &key.to_string()),
                &format!("#-- drift: {:.4} ms/s", conn.rm.drift),
            )?;
            write_cdf(&mut stream, cdf)?;
        }
    }
    if cfg.aggregate {
        let mut stream = new_stream(&dat_path(prefix, "latency-variation-cdf", "aggr"), "")?;
        write_cdf(&mut stream, &aggregated)?;
    }
    Ok(())
}

fn write_cdf(
    stream: &mut BufWriter<File>,
    cdf: &std::collections::BTreeMap<i64, u64>,
) -> anyhow::Result<()> {
    let total: u64 = cdf.values().sum();
    if total == 0 {
        return Ok(());
    }
    writeln!(stream, "#relative_delay_ms cdf")?;
    let mut cum = 0u64;
    for (&diff, &bytes) in cdf {
        cum += bytes;
        writeln!(stream, "{diff:>10} {:.10}", cum as f64 / total as f64)?;
    }
    Ok(())
}

/// Sent times with queueing-delay variation per connection.
fn write_queueing_delay_files(
    dump: &Dump,
    cfg: &Config,
    prefix: &Prefix<'_>,
    first_tstamp_ms: i64,
) -> anyhow::Result<()> {
    let mut aggr_stream = if cfg.aggregate {
        Some(new_stream(
            &dat_path(prefix, "queueing-delay", "aggr"),
            "time_ms,delay_variation_ms,stream_id",
        )?)
    } else {
        None
    };

    for (key, conn) in &dump.connections {
        if conn.failure.is_some() {
            continue;
        }
        let items = conn
            .rm
            .queueing_delay_items(first_tstamp_ms, &key.to_string());
        if let Some(stream) = aggr_stream.as_mut() {
            for item in &items {
                writeln!(stream, "{item}")?;
            }
        }
        if !cfg.agg_only {
            let mut stream = new_stream(
                &dat_path(prefix, "queueing-delay", &key.to_string()),
                "time_ms,delay_variation_ms,stream_id",
            )?;
            for item in &items {
                writeln!(stream, "{item}")?;
            }
        }
    }
    Ok(())
}
