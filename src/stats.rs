//! Exchange statistics for `--stats` output and `CartesianStencil::report`.

use std::time::{Duration, Instant};

/// Counters and phase timings accumulated across halo exchanges.
///
/// Reset with `zero`; the stencil bumps the counters on every exchange.
#[derive(Debug, Clone)]
pub struct ExchangeStats {
    start: Instant,
    pub exchanges: u64,
    pub packets: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub copies: u64,
    pub merges_shm: u64,
    pub merges: u64,
    pub decompressions: u64,
    pub gather: Duration,
    pub communicate: Duration,
    pub merge: Duration,
    pub decompress: Duration,
}

impl Default for ExchangeStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ExchangeStats {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            exchanges: 0,
            packets: 0,
            bytes_sent: 0,
            bytes_received: 0,
            copies: 0,
            merges_shm: 0,
            merges: 0,
            decompressions: 0,
            gather: Duration::ZERO,
            communicate: Duration::ZERO,
            merge: Duration::ZERO,
            decompress: Duration::ZERO,
        }
    }

    pub fn zero(&mut self) {
        *self = Self::new();
    }

    /// Fold another rank's counters into this one.
    pub fn accumulate(&mut self, other: &ExchangeStats) {
        self.exchanges += other.exchanges;
        self.packets += other.packets;
        self.bytes_sent += other.bytes_sent;
        self.bytes_received += other.bytes_received;
        self.copies += other.copies;
        self.merges_shm += other.merges_shm;
        self.merges += other.merges;
        self.decompressions += other.decompressions;
        self.gather += other.gather;
        self.communicate += other.communicate;
        self.merge += other.merge;
        self.decompress += other.decompress;
    }

    /// Print the stats table to stderr.
    pub fn display(&self, label: &str) {
        let total = self.start.elapsed();
        eprintln!();
        eprintln!("=== gridhalo exchange stats: {} ===", label);
        eprintln!("  Exchanges:              {}", self.exchanges);
        if self.exchanges == 0 {
            return;
        }
        let per = |d: Duration| d.as_secs_f64() * 1e6 / self.exchanges as f64;
        eprintln!("  Packets:                {}", self.packets);
        eprintln!("  Bytes sent/received:    {} / {}", self.bytes_sent, self.bytes_received);
        eprintln!("  Buffer copies:          {}", self.copies);
        eprintln!("  Merges (shm/general):   {} / {}", self.merges_shm, self.merges);
        eprintln!("  Decompressions:         {}", self.decompressions);
        eprintln!("    Gather:               {:>10.1}us/exchange", per(self.gather));
        eprintln!("    Communicate:          {:>10.1}us/exchange", per(self.communicate));
        eprintln!("    Merge:                {:>10.1}us/exchange", per(self.merge));
        eprintln!("    Decompress:           {:>10.1}us/exchange", per(self.decompress));
        if self.communicate > Duration::ZERO {
            let mb_s = self.bytes_received as f64 / self.communicate.as_secs_f64() / 1e6;
            eprintln!("    Receive bandwidth:    {:>10.1}MB/s", mb_s);
        }
        eprintln!("  ─────────────────────────────────");
        eprintln!("  Total:                  {:>8.3}s", total.as_secs_f64());
    }
}
