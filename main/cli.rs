use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::Parser;

use byterange::Config;

const ABOUT: &str = "\
    Analyze sender-side (and optionally receiver-side) TCP packet captures for latency, \
    retransmission, redundant data bundling, loss and throughput behavior.";

#[derive(Debug, Clone, Parser)]
#[command(name = "rdbtrace", version, about = ABOUT)]
#[command(next_display_order = None)]
pub struct CliArgs {
    /// Sender-side pcap file
    #[arg(short = 'f', long = "sender-dump", value_name = "FILE")]
    pub sender_dump: PathBuf,

    /// Receiver-side pcap file; enables loss and one-way-delay analysis
    #[arg(short = 'g', long = "receiver-dump", value_name = "FILE")]
    pub receiver_dump: Option<PathBuf>,

    /// Pcap with kernel-entry timestamps of outgoing segments, for sojourn-time analysis
    #[arg(long = "sojourn-dump", value_name = "FILE")]
    pub sojourn_dump: Option<PathBuf>,

    /// Sender IP address
    #[arg(short = 's', long = "src-ip", value_name = "IP")]
    pub src_ip: Ipv4Addr,

    /// Receiver IP address; all receivers are analyzed if not given
    #[arg(short = 'r', long = "dst-ip", value_name = "IP")]
    pub dst_ip: Option<Ipv4Addr>,

    /// Sender port; all sender ports are analyzed if not given
    #[arg(short = 'q', long = "src-port", value_name = "PORT")]
    pub src_port: Option<u16>,

    /// Receiver port; all receiver ports are analyzed if not given
    #[arg(short = 'p', long = "dst-port", value_name = "PORT")]
    pub dst_port: Option<u16>,

    /// Sender-side external NAT address as it appears in the receiver dump
    #[arg(short = 'm', long = "send-nat-ip", value_name = "IP")]
    pub send_nat_ip: Option<Ipv4Addr>,

    /// Receiver-side local address as it appears in the receiver dump
    #[arg(short = 'n', long = "recv-nat-ip", value_name = "IP")]
    pub recv_nat_ip: Option<Ipv4Addr>,

    /// Compute transport-layer delays (application-layer delays if not set)
    #[arg(short = 't', long)]
    pub transport: bool,

    /// Write byte-latency-variation CDF data
    #[arg(short = 'c', long = "cdf")]
    pub with_cdf: bool,

    /// Compute loss grouped over time intervals (requires a receiver dump)
    #[arg(short = 'L', long = "loss")]
    pub with_loss: bool,

    /// Loss aggregation interval in milliseconds
    #[arg(long = "loss-interval", value_name = "MS", default_value_t = 1000)]
    pub loss_aggr_ms: u64,

    /// Throughput aggregation interval in milliseconds
    #[arg(long = "throughput-interval", value_name = "MS", default_value_t = 1000)]
    pub throughput_aggr_ms: u64,

    /// Produce statistics aggregated over all connections
    #[arg(short = 'a', long)]
    pub aggregate: bool,

    /// Only print aggregated statistics
    #[arg(short = 'A', long = "aggregate-only")]
    pub agg_only: bool,

    /// Print relative sequence numbers
    #[arg(short = 'l', long = "relative-seq")]
    pub relative_seq: bool,

    /// Print details for every byte range
    #[arg(short = 'y', long = "print-packets")]
    pub print_packets: bool,

    /// Start of the analysis window, seconds from the start of the trace
    #[arg(long = "analyse-start", value_name = "SEC", default_value_t = 0)]
    pub analyse_start: u32,

    /// End of the analysis window, seconds before the end of the trace
    #[arg(long = "analyse-end", value_name = "SEC", default_value_t = 0)]
    pub analyse_end: u32,

    /// Length of the analysis window in seconds
    #[arg(long = "analyse-duration", value_name = "SEC", default_value_t = 0)]
    pub analyse_duration: u32,

    /// Extra percentiles to compute, comma separated (for example "1,25,50,75,99")
    #[arg(long, value_name = "LIST", default_value = "")]
    pub percentiles: String,

    /// Skip the range-map consistency checks after ingest
    #[arg(long = "no-validate")]
    pub no_validate: bool,

    /// Longest per-rank retransmission histogram to print
    #[arg(long = "max-retrans-stats", value_name = "N", default_value_t = 6)]
    pub max_retrans_stats: u32,

    /// Write comma-separated statistics files with this filename prefix
    #[arg(short = 'u', long = "prefix", value_name = "PREFIX")]
    pub prefix: Option<String>,

    /// Directory for the statistics files (implies file output)
    #[arg(short = 'o', long = "output-dir", value_name = "DIR")]
    pub output_dir: Option<PathBuf>,
}

impl CliArgs {
    pub fn to_config(&self) -> Config {
        Config {
            with_recv: self.receiver_dump.is_some(),
            with_loss: self.with_loss,
            with_cdf: self.with_cdf,
            transport: self.transport,
            relative_seq: self.relative_seq,
            aggregate: self.aggregate || self.agg_only,
            agg_only: self.agg_only,
            loss_aggr_ms: self.loss_aggr_ms,
            throughput_aggr_ms: self.throughput_aggr_ms,
            analyse_start: self.analyse_start,
            analyse_end: self.analyse_end,
            analyse_duration: self.analyse_duration,
            percentiles: self.percentiles.clone(),
            validate_ranges: !self.no_validate,
            max_retrans_stats: self.max_retrans_stats,
            send_nat_ip: self
                .send_nat_ip
                .map(|ip| ip.to_string())
                .unwrap_or_default(),
            recv_nat_ip: self
                .recv_nat_ip
                .map(|ip| ip.to_string())
                .unwrap_or_default(),
        }
    }

    /// Output directory and filename prefix for the statistics files, or None when no file
    /// output was requested.
    pub fn file_output(&self) -> Option<(PathBuf, String)> {
        if self.output_dir.is_none() && self.prefix.is_none() {
            return None;
        }
        let dir = self
            .output_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        let name = self.prefix.clone().unwrap_or_default();
        Some((dir, name))
    }
}
