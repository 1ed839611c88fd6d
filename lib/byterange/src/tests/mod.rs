//! Scenario tests for the range bookkeeping core: synthetic `DataSeg` streams are pushed
//! through a [`Connection`] and the resulting ranges, counters and derived statistics are
//! checked. The helpers here stand in for the pcap decode layer.

mod ack;
mod analysis;
mod ingest;

use std::time::Duration;

use crate::{ByteRange, Config, Connection, DataSeg, TcpFlags};

pub(crate) fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

/// One connection under test, with automatic TCP timestamp values on sends so receiver-side
/// matching can be exercised.
pub(crate) struct TestConn {
    pub conn: Connection,
    pub cfg: Config,
    next_tsval: u32,
}

impl TestConn {
    pub fn new(first_abs: u32) -> Self {
        Self::with_config(first_abs, Config::default())
    }

    pub fn with_recv(first_abs: u32) -> Self {
        Self::with_config(
            first_abs,
            Config {
                with_recv: true,
                ..Config::default()
            },
        )
    }

    pub fn with_config(first_abs: u32, cfg: Config) -> Self {
        Self {
            conn: Connection::new("10.0.0.1:5000-10.0.0.2:80".to_owned(), first_abs),
            cfg,
            next_tsval: 0,
        }
    }

    /// Send a data segment; returns the TCP timestamp value it carried.
    pub fn send(&mut self, abs: u32, payload: u16, at_ms: u64) -> u32 {
        self.send_flags(abs, payload, at_ms, TcpFlags::ACK)
    }

    pub fn send_flags(&mut self, abs: u32, payload: u16, at_ms: u64, flags: TcpFlags) -> u32 {
        self.next_tsval += 1;
        let tsval = self.next_tsval;
        let mut seg = DataSeg {
            seq_absolute: abs,
            payload_size: payload,
            total_size: payload as u32 + 40,
            flags,
            tstamp_pcap: ms(at_ms),
            tstamp_tcp: tsval,
            ..DataSeg::default()
        };
        self.conn.register_sent(&mut seg, &self.cfg);
        tsval
    }

    pub fn ack(&mut self, abs_ack: u32, window: u16, at_ms: u64) {
        self.ack_flags(abs_ack, window, at_ms, TcpFlags::ACK)
    }

    pub fn ack_flags(&mut self, abs_ack: u32, window: u16, at_ms: u64, flags: TcpFlags) {
        self.next_tsval += 1;
        let mut seg = DataSeg {
            ack_absolute: abs_ack,
            window,
            flags,
            tstamp_pcap: ms(at_ms),
            // the peer's TSval; offset so it never collides with an outgoing TSecr
            tstamp_tcp: 0x4000_0000 + self.next_tsval,
            ..DataSeg::default()
        };
        self.conn.register_ack(&mut seg);
    }

    /// Receiver-side arrival carrying the TCP timestamp of the send it delivers.
    pub fn recv(&mut self, abs: u32, payload: u16, at_ms: u64, tsval: u32) {
        let mut seg = DataSeg {
            seq_absolute: abs,
            payload_size: payload,
            tstamp_pcap: ms(at_ms),
            tstamp_tcp: tsval,
            ..DataSeg::default()
        };
        self.conn.register_received(&mut seg);
    }

    /// Kernel-entry sample for `[abs, abs + payload)` taken at `entered_ms`.
    pub fn sojourn(&mut self, abs: u32, payload: u16, entered_ms: u64) {
        let mut seg = DataSeg {
            seq_absolute: abs,
            payload_size: payload,
            tstamp_pcap: ms(entered_ms),
            ..DataSeg::default()
        };
        self.conn.register_sojourn(&mut seg);
    }

    /// Fix the analysis window and run the counting pass, as the driver does after ingest.
    pub fn finish(&mut self) {
        self.conn.calculate_retrans_and_rdb_stats(&self.cfg);
    }

    pub fn ranges(&self) -> Vec<&ByteRange> {
        self.conn.rm.ranges().collect()
    }

    pub fn bounds(&self) -> Vec<(u64, u64)> {
        self.conn.rm.ranges().map(|r| (r.start, r.end)).collect()
    }
}
