//! Pcap reading and header decoding. Each TCP/IPv4 packet in a capture becomes one
//! [`DecodedPacket`] carrying the addresses and a partially filled [`DataSeg`]; everything
//! else about a packet (direction, connection, classification) is decided by the dump driver.

use std::fs::File;
use std::io::BufReader;
use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::Context;
use etherparse::{IpHeader, PacketHeaders, TcpOptionElement, TransportHeader};
use pcap_file::pcap::PcapReader;
use pcap_file::DataLink;

use byterange::{DataSeg, TcpFlags};

#[derive(Debug)]
pub struct DecodedPacket {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
    pub seg: DataSeg,
}

/// Per-file decode counters, reported at the end of the run.
#[derive(Debug, Default)]
pub struct DecodeStats {
    pub packets: u64,
    pub tcp_packets: u64,
    pub skipped: u64,
}

/// Read `path` and hand every decodable TCP/IPv4 packet to `handler` in capture order.
pub fn read_pcap(
    path: &Path,
    mut handler: impl FnMut(DecodedPacket),
) -> anyhow::Result<DecodeStats> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut reader = PcapReader::new(BufReader::new(file))
        .with_context(|| format!("reading pcap header of {}", path.display()))?;

    let datalink = reader.header().datalink;
    if datalink != DataLink::ETHERNET {
        anyhow::bail!(
            "{}: unsupported link type {:?}; only ethernet captures are supported",
            path.display(),
            datalink
        );
    }

    let mut stats = DecodeStats::default();
    while let Some(next) = reader.next_packet() {
        let pkt = next.with_context(|| format!("reading packet from {}", path.display()))?;
        stats.packets += 1;
        match decode_packet(&pkt.data, pkt.timestamp) {
            Some(decoded) => {
                stats.tcp_packets += 1;
                handler(decoded);
            }
            None => stats.skipped += 1,
        }
    }
    Ok(stats)
}

/// Decode one ethernet frame; returns None for anything that is not TCP over IPv4.
fn decode_packet(data: &[u8], timestamp: std::time::Duration) -> Option<DecodedPacket> {
    let headers = match PacketHeaders::from_ethernet_slice(data) {
        Ok(h) => h,
        Err(e) => {
            log::debug!("undecodable frame: {e:?}");
            return None;
        }
    };

    let (ip, _ext) = match headers.ip? {
        IpHeader::Version4(ip, ext) => (ip, ext),
        IpHeader::Version6(..) => return None,
    };
    let tcp = match headers.transport? {
        TransportHeader::Tcp(tcp) => tcp,
        _ => return None,
    };

    // payload length from the IP header, not the captured bytes: the snap length may have
    // truncated the frame and ethernet padding may have extended it
    let payload_size = ip.payload_len.saturating_sub(tcp.header_len());

    let mut flags = TcpFlags::empty();
    for (set, flag) in [
        (tcp.fin, TcpFlags::FIN),
        (tcp.syn, TcpFlags::SYN),
        (tcp.rst, TcpFlags::RST),
        (tcp.psh, TcpFlags::PSH),
        (tcp.ack, TcpFlags::ACK),
        (tcp.urg, TcpFlags::URG),
        (tcp.ece, TcpFlags::ECE),
        (tcp.cwr, TcpFlags::CWR),
    ] {
        if set {
            flags |= flag;
        }
    }

    let mut tstamp_tcp = 0;
    let mut tstamp_tcp_echo = 0;
    for opt in tcp.options_iterator().flatten() {
        if let TcpOptionElement::Timestamp(tsval, tsecr) = opt {
            tstamp_tcp = tsval;
            tstamp_tcp_echo = tsecr;
            break;
        }
    }

    let seg = DataSeg {
        seq_absolute: tcp.sequence_number,
        ack_absolute: tcp.acknowledgment_number,
        payload_size,
        total_size: ip.payload_len as u32 + ip.header_len() as u32,
        flags,
        tstamp_pcap: timestamp,
        tstamp_tcp,
        tstamp_tcp_echo,
        window: tcp.window_size,
        ..DataSeg::default()
    };

    Some(DecodedPacket {
        src_ip: Ipv4Addr::from(ip.source),
        src_port: tcp.source_port,
        dst_ip: Ipv4Addr::from(ip.destination),
        dst_port: tcp.destination_port,
        seg,
    })
}
