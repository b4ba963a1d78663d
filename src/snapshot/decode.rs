//! Fixed-width little-endian record layouts shared with the kernel probes.
//!
//! A size mismatch is a layout defect and is returned as [`DecodeError`]
//! instead of being truncated or padded.

use crate::error::DecodeError;

/// log2 latency buckets covering roughly 1ns to 1s.
pub const MAX_SLOTS: usize = 27;

pub const CGROUP_KEY_SIZE: usize = 8;

/// A record with a compiled, fixed binary layout.
pub trait Record: Sized {
    const NAME: &'static str;
    const SIZE: usize;

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError>;

    fn encode(&self) -> Vec<u8>;
}

fn expect_size(record: &'static str, bytes: &[u8], expected: usize) -> Result<(), DecodeError> {
    if bytes.len() != expected {
        return Err(DecodeError::SizeMismatch {
            record,
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

fn le_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

fn le_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

fn le_u64_array<const N: usize>(bytes: &[u8], offset: usize) -> [u64; N] {
    let mut out = [0u64; N];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = le_u64(bytes, offset + i * 8);
    }
    out
}

fn put_u64s(out: &mut Vec<u8>, values: &[u64]) {
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
}

/// Cgroup id stored as the whole key or as the key's leading 8 bytes.
pub fn decode_cgroup_id(key: &[u8]) -> Result<u64, DecodeError> {
    if key.len() < CGROUP_KEY_SIZE {
        return Err(DecodeError::SizeMismatch {
            record: "cgroup key",
            expected: CGROUP_KEY_SIZE,
            actual: key.len(),
        });
    }
    Ok(le_u64(key, 0))
}

pub fn encode_cgroup_key(cgroup_id: u64) -> [u8; CGROUP_KEY_SIZE] {
    cgroup_id.to_le_bytes()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterRecord {
    pub count: u64,
}

impl Record for CounterRecord {
    const NAME: &'static str = "counter";
    const SIZE: usize = 8;

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        expect_size(Self::NAME, bytes, Self::SIZE)?;
        Ok(Self {
            count: le_u64(bytes, 0),
        })
    }

    fn encode(&self) -> Vec<u8> {
        self.count.to_le_bytes().to_vec()
    }
}

/// `struct hist_value { u64 slots[27]; u64 count; u64 sum_ns; }`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistogramRecord {
    pub slots: [u64; MAX_SLOTS],
    pub count: u64,
    pub sum_ns: u64,
}

impl Default for HistogramRecord {
    fn default() -> Self {
        Self {
            slots: [0; MAX_SLOTS],
            count: 0,
            sum_ns: 0,
        }
    }
}

impl HistogramRecord {
    /// Mean value in nanoseconds; `None` for an empty record.
    pub fn average_ns(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum_ns as f64 / self.count as f64)
    }

    pub fn average_seconds(&self) -> Option<f64> {
        self.average_ns().map(|ns| ns / 1_000_000_000.0)
    }
}

impl Record for HistogramRecord {
    const NAME: &'static str = "histogram";
    const SIZE: usize = MAX_SLOTS * 8 + 16;

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        expect_size(Self::NAME, bytes, Self::SIZE)?;
        Ok(Self {
            slots: le_u64_array(bytes, 0),
            count: le_u64(bytes, MAX_SLOTS * 8),
            sum_ns: le_u64(bytes, MAX_SLOTS * 8 + 8),
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        put_u64s(&mut out, &self.slots);
        put_u64s(&mut out, &[self.count, self.sum_ns]);
        out
    }
}

/// `struct tcp_stats`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpStatsRecord {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub retransmits: u64,
    pub connections: u64,
    pub rtt_sum_us: u64,
    pub rtt_count: u64,
}

impl TcpStatsRecord {
    pub fn average_rtt_seconds(&self) -> Option<f64> {
        (self.rtt_count > 0).then(|| self.rtt_sum_us as f64 / self.rtt_count as f64 / 1_000_000.0)
    }
}

impl Record for TcpStatsRecord {
    const NAME: &'static str = "tcp_stats";
    const SIZE: usize = 48;

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        expect_size(Self::NAME, bytes, Self::SIZE)?;
        let [bytes_sent, bytes_received, retransmits, connections, rtt_sum_us, rtt_count] =
            le_u64_array::<6>(bytes, 0);
        Ok(Self {
            bytes_sent,
            bytes_received,
            retransmits,
            connections,
            rtt_sum_us,
            rtt_count,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        put_u64s(
            &mut out,
            &[
                self.bytes_sent,
                self.bytes_received,
                self.retransmits,
                self.connections,
                self.rtt_sum_us,
                self.rtt_count,
            ],
        );
        out
    }
}

/// `struct syscall_key { u64 cgroup_id; u32 syscall_nr; u32 _pad; }`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SyscallKey {
    pub cgroup_id: u64,
    pub syscall_nr: u32,
}

impl Record for SyscallKey {
    const NAME: &'static str = "syscall key";
    const SIZE: usize = 16;

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        expect_size(Self::NAME, bytes, Self::SIZE)?;
        Ok(Self {
            cgroup_id: le_u64(bytes, 0),
            syscall_nr: le_u32(bytes, 8),
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.cgroup_id.to_le_bytes());
        out.extend_from_slice(&self.syscall_nr.to_le_bytes());
        out.extend_from_slice(&[0u8; 4]);
        out
    }
}

/// `struct syscall_stats { u64 count; u64 error_count; u64 latency_sum_ns; u64 latency_slots[27]; }`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallStatsRecord {
    pub count: u64,
    pub error_count: u64,
    pub latency_sum_ns: u64,
    pub latency_slots: [u64; MAX_SLOTS],
}

impl SyscallStatsRecord {
    pub fn average_latency_seconds(&self) -> Option<f64> {
        (self.count > 0)
            .then(|| self.latency_sum_ns as f64 / self.count as f64 / 1_000_000_000.0)
    }
}

impl Record for SyscallStatsRecord {
    const NAME: &'static str = "syscall stats";
    const SIZE: usize = 24 + MAX_SLOTS * 8;

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        expect_size(Self::NAME, bytes, Self::SIZE)?;
        Ok(Self {
            count: le_u64(bytes, 0),
            error_count: le_u64(bytes, 8),
            latency_sum_ns: le_u64(bytes, 16),
            latency_slots: le_u64_array(bytes, 24),
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        put_u64s(&mut out, &[self.count, self.error_count, self.latency_sum_ns]);
        put_u64s(&mut out, &self.latency_slots);
        out
    }
}

/// `struct cache_stats`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStatsRecord {
    pub accesses: u64,
    pub additions: u64,
    pub dirtied: u64,
    pub buf_dirtied: u64,
}

impl Record for CacheStatsRecord {
    const NAME: &'static str = "cache_stats";
    const SIZE: usize = 32;

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        expect_size(Self::NAME, bytes, Self::SIZE)?;
        let [accesses, additions, dirtied, buf_dirtied] = le_u64_array::<4>(bytes, 0);
        Ok(Self {
            accesses,
            additions,
            dirtied,
            buf_dirtied,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        put_u64s(
            &mut out,
            &[self.accesses, self.additions, self.dirtied, self.buf_dirtied],
        );
        out
    }
}

/// `struct exec_stats`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecStatsRecord {
    pub execs: u64,
    pub exits: u64,
    pub forks: u64,
}

impl Record for ExecStatsRecord {
    const NAME: &'static str = "exec_stats";
    const SIZE: usize = 24;

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        expect_size(Self::NAME, bytes, Self::SIZE)?;
        let [execs, exits, forks] = le_u64_array::<3>(bytes, 0);
        Ok(Self { execs, exits, forks })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        put_u64s(&mut out, &[self.execs, self.exits, self.forks]);
        out
    }
}
