//! The trace driver: routes decoded packets to their connections across the sender pass, the
//! optional receiver pass and the optional sojourn pass, then runs the analysis pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;

use byterange::{Config, Connection, TcpFlags};

use crate::cli::CliArgs;
use crate::decode::{self, DecodedPacket};

/// Connection identity in the data direction (sender to receiver). Ordered so reports come out
/// deterministically.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConnKey {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
}

impl fmt::Display for ConnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}-{}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

/// Packet counters over a whole run, printed in the final summary.
#[derive(Debug, Default)]
pub struct DumpStats {
    pub sender_packets: u64,
    pub sender_tcp_packets: u64,
    pub sent_packet_count: u64,
    pub ack_packet_count: u64,
    pub receiver_packets: u64,
    pub recv_packet_count: u64,
    pub sojourn_packet_count: u64,
    pub filtered_out: u64,
    pub unmatched: u64,
}

pub struct Dump {
    cfg: Config,
    src_ip: Ipv4Addr,
    dst_ip: Option<Ipv4Addr>,
    src_port: Option<u16>,
    dst_port: Option<u16>,
    send_nat_ip: Option<Ipv4Addr>,
    recv_nat_ip: Option<Ipv4Addr>,
    pub connections: BTreeMap<ConnKey, Connection>,
    pub stats: DumpStats,
}

impl Dump {
    pub fn new(args: &CliArgs, cfg: Config) -> Self {
        Self {
            cfg,
            src_ip: args.src_ip,
            dst_ip: args.dst_ip,
            src_port: args.src_port,
            dst_port: args.dst_port,
            send_nat_ip: args.send_nat_ip,
            recv_nat_ip: args.recv_nat_ip,
            connections: BTreeMap::new(),
            stats: DumpStats::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    fn endpoints_match(
        &self,
        src_ip: Ipv4Addr,
        src_port: u16,
        dst_ip: Ipv4Addr,
        dst_port: u16,
    ) -> bool {
        src_ip == self.src_ip
            && self.dst_ip.map_or(true, |ip| ip == dst_ip)
            && self.src_port.map_or(true, |p| p == src_port)
            && self.dst_port.map_or(true, |p| p == dst_port)
    }

    /// First pass over the sender-side capture: outgoing packets feed the range maps, incoming
    /// packets feed ACK processing.
    pub fn analyse_sender(&mut self, path: &Path) -> anyhow::Result<()> {
        log::info!("processing sender dump {}", path.display());

        let stats = decode::read_pcap(path, |pkt| self.route_sender_packet(pkt))?;
        self.stats.sender_packets = stats.packets;
        self.stats.sender_tcp_packets = stats.tcp_packets;
        if stats.skipped > 0 {
            log::debug!("{} non-TCP or undecodable packets skipped", stats.skipped);
        }

        if self.connections.is_empty() {
            anyhow::bail!(
                "no TCP connections from {} found in {}",
                self.src_ip,
                path.display()
            );
        }
        log::info!("found {} connection(s)", self.connections.len());
        Ok(())
    }

    fn route_sender_packet(&mut self, mut pkt: DecodedPacket) {
        if self.endpoints_match(pkt.src_ip, pkt.src_port, pkt.dst_ip, pkt.dst_port) {
            // outgoing data
            let key = ConnKey {
                src_ip: pkt.src_ip,
                src_port: pkt.src_port,
                dst_ip: pkt.dst_ip,
                dst_port: pkt.dst_port,
            };
            let first_seq = pkt.seg.seq_absolute;
            let conn = self
                .connections
                .entry(key)
                .or_insert_with(|| Connection::new(key.to_string(), first_seq));
            conn.register_sent(&mut pkt.seg, &self.cfg);
            self.stats.sent_packet_count += 1;
        } else if self.endpoints_match(pkt.dst_ip, pkt.dst_port, pkt.src_ip, pkt.src_port) {
            // incoming packet of an analyzed flow: process its acknowledgment
            if !pkt.seg.flags.contains(TcpFlags::ACK) {
                return;
            }
            let key = ConnKey {
                src_ip: pkt.dst_ip,
                src_port: pkt.dst_port,
                dst_ip: pkt.src_ip,
                dst_port: pkt.src_port,
            };
            match self.connections.get_mut(&key) {
                Some(conn) => {
                    conn.register_ack(&mut pkt.seg);
                    self.stats.ack_packet_count += 1;
                }
                None => self.stats.unmatched += 1,
            }
        } else {
            self.stats.filtered_out += 1;
        }
    }

    /// Second pass over the receiver-side capture: arrivals of the analyzed data direction,
    /// with NAT addresses mapped back onto the sender-side identities.
    pub fn process_recvd(&mut self, path: &Path) -> anyhow::Result<()> {
        log::info!("processing receiver dump {}", path.display());

        let stats = decode::read_pcap(path, |pkt| self.route_receiver_packet(pkt))?;
        self.stats.receiver_packets = stats.packets;
        Ok(())
    }

    fn route_receiver_packet(&mut self, mut pkt: DecodedPacket) {
        let src_ip = self.denat_src(pkt.src_ip);
        let dst_ip = self.denat_dst(pkt.dst_ip);
        if !self.endpoints_match(src_ip, pkt.src_port, dst_ip, pkt.dst_port) {
            self.stats.filtered_out += 1;
            return;
        }
        let key = ConnKey {
            src_ip,
            src_port: pkt.src_port,
            dst_ip,
            dst_port: pkt.dst_port,
        };
        match self.connections.get_mut(&key) {
            Some(conn) => {
                conn.register_received(&mut pkt.seg);
                self.stats.recv_packet_count += 1;
            }
            None => self.stats.unmatched += 1,
        }
    }

    /// Optional pass over a capture taken at the kernel entry point of the sender, attaching
    /// sojourn (queueing) samples to the ranges.
    pub fn process_sojourn(&mut self, path: &Path) -> anyhow::Result<()> {
        log::info!("processing sojourn dump {}", path.display());

        decode::read_pcap(path, |mut pkt| {
            if !self.endpoints_match(pkt.src_ip, pkt.src_port, pkt.dst_ip, pkt.dst_port)
                || pkt.seg.payload_size == 0
            {
                return;
            }
            let key = ConnKey {
                src_ip: pkt.src_ip,
                src_port: pkt.src_port,
                dst_ip: pkt.dst_ip,
                dst_port: pkt.dst_port,
            };
            if let Some(conn) = self.connections.get_mut(&key) {
                conn.register_sojourn(&mut pkt.seg);
                self.stats.sojourn_packet_count += 1;
            }
        })?;
        Ok(())
    }

    fn denat_src(&self, ip: Ipv4Addr) -> Ipv4Addr {
        match self.send_nat_ip {
            Some(nat) if nat == ip => self.src_ip,
            _ => ip,
        }
    }

    fn denat_dst(&self, ip: Ipv4Addr) -> Ipv4Addr {
        match (self.recv_nat_ip, self.dst_ip) {
            (Some(nat), Some(real)) if nat == ip => real,
            _ => ip,
        }
    }

    /// Run the post-ingest analysis pipeline on every connection: window selection, the
    /// counting pass, validation and (with a receiver dump) the latency pipeline.
    pub fn finish(&mut self) {
        for (key, conn) in &mut self.connections {
            if conn.failure.is_some() {
                continue;
            }
            conn.calculate_retrans_and_rdb_stats(&self.cfg);
            if self.cfg.with_recv {
                conn.rm.calculate_latency_variation(&self.cfg);
                if self.cfg.with_cdf {
                    conn.rm.make_byte_latency_variation_cdf();
                }
            }
            if self.cfg.validate_ranges {
                if let Err(violation) = conn.validate_ranges() {
                    log::warn!("{key}: range validation failed: {violation:?}");
                    conn.failure = Some(format!("range validation failed: {violation:?}"));
                }
            }
        }
    }

    /// Capture time of the earliest transmission across all connections, the epoch for every
    /// time-series output.
    pub fn first_sent_tstamp_ms(&self) -> i64 {
        self.connections
            .values()
            .filter_map(|c| c.rm.first_send_time())
            .map(|t| t.as_millis() as i64)
            .min()
            .unwrap_or(0)
    }
}
