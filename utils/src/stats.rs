//! Protocol statistics counters.
//!
//! Counters are registered at construction under slash-separated names
//! (`udp/overflow`, `error/bad_sender`); incrementing an unregistered name
//! is a silent no-op so hot paths never branch on configuration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter names the node registers by default.
pub const DEFAULT_COUNTERS: &[&str] = &[
    "udp/overflow",
    "error/bad_sender",
    "error/parse",
    "error/not_live",
    "error/handshake",
    "message/handshake",
    "message/keepalive",
    "message/publish",
    "message/confirm_req",
    "message/confirm_ack",
    "message/telemetry",
    "bootstrap/pull",
    "bootstrap/pull_failed",
    "bootstrap/requeue",
    "block/processed",
    "block/gap",
    "block/fork",
    "confirmation/blocks_confirmed",
    "confirmation/blocks_confirmed_bounded",
    "confirmation/blocks_confirmed_unbounded",
];

/// A thread-safe counter collection for protocol statistics.
pub struct Stats {
    counters: HashMap<&'static str, AtomicU64>,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new(DEFAULT_COUNTERS)
    }
}

impl Stats {
    pub fn new(names: &[&'static str]) -> Self {
        let mut counters = HashMap::new();
        for &name in names {
            counters.insert(name, AtomicU64::new(0));
        }
        Self { counters }
    }

    pub fn inc(&self, name: &str) {
        self.add(name, 1);
    }

    pub fn add(&self, name: &str, value: u64) {
        if let Some(counter) = self.counters.get(name) {
            counter.fetch_add(value, Ordering::Relaxed);
        }
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<&'static str, u64> {
        self.counters
            .iter()
            .map(|(&k, v)| (k, v.load(Ordering::Relaxed)))
            .collect()
    }
}
