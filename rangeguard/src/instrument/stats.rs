//! Instrumentation statistics
//!
//! [`InstrumentStats`] accumulates across functions and runs until it is
//! explicitly reset; it can be shared between threads. [`InstrumentReport`]
//! describes a single run.

use std::fmt::Write as _;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// How much the oracle knew, in bits, over every inspected value
#[derive(Debug, Default)]
pub struct InstrumentStats {
    total_bits: AtomicU64,
    known_bits: AtomicU64,
    interval_bits: AtomicU64,
}

/// Point-in-time copy of [`InstrumentStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub total_bits: u64,
    pub known_bits: u64,
    pub interval_bits: u64,
}

const COUNTERS: [(&str, &str); 3] = [
    ("TotalBits", "Total bits of integer values inspected"),
    ("KnownBits", "Bits fixed by known-bits facts"),
    ("IntervalBits", "Bits of information in range facts"),
];

impl InstrumentStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the totals of one collection run
    pub fn record(&self, total_bits: u64, known_bits: u64, interval_bits: u64) {
        self.total_bits.fetch_add(total_bits, Ordering::Relaxed);
        self.known_bits.fetch_add(known_bits, Ordering::Relaxed);
        self.interval_bits.fetch_add(interval_bits, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_bits: self.total_bits.load(Ordering::Relaxed),
            known_bits: self.known_bits.load(Ordering::Relaxed),
            interval_bits: self.interval_bits.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.total_bits.store(0, Ordering::Relaxed);
        self.known_bits.store(0, Ordering::Relaxed);
        self.interval_bits.store(0, Ordering::Relaxed);
    }

    /// One `<value> <Name> - <description>` line per counter
    pub fn report(&self) -> String {
        let snapshot = self.snapshot();
        let values = [snapshot.total_bits, snapshot.known_bits, snapshot.interval_bits];
        let mut out = String::new();
        for ((name, description), value) in COUNTERS.iter().zip(values) {
            let _ = writeln!(out, "{value} {name} - {description}");
        }
        out
    }
}

/// What one instrumentation run did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InstrumentReport {
    /// Functions instrumented
    pub functions: usize,
    /// Non-trivial facts collected
    pub facts: usize,
    /// Guards inserted, unconditional ones included
    pub sites: usize,
    /// Sites that always trap
    pub unconditional_sites: usize,
    /// Facts whose guard had no terms under the current configuration
    pub skipped: usize,
}

impl AddAssign for InstrumentReport {
    fn add_assign(&mut self, other: Self) {
        self.functions += other.functions;
        self.facts += other.facts;
        self.sites += other.sites;
        self.unconditional_sites += other.unconditional_sites;
        self.skipped += other.skipped;
    }
}
