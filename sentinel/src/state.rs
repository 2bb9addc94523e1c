use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::time::Instant;

use sentinel_common::Event;

/// An exported event as seen by the agent.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EventRecord {
    pub timestamp: i64,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl EventRecord {
    /// Convert a kernel-side Event into an EventRecord.
    ///
    /// Addresses are already in host byte order, so `Ipv4Addr::from` yields
    /// the dotted quad directly. The timestamp is assigned here in userspace.
    pub fn from_ebpf(event: &Event) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp_millis(),
            src_ip: Ipv4Addr::from(event.src_addr),
            dst_ip: Ipv4Addr::from(event.dst_addr),
            src_port: event.src_port,
            dst_port: event.dst_port,
        }
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct SourceStats {
    pub events: u64,
    pub distinct_ports: usize,
    pub last_port: u16,
    #[serde(skip)]
    pub last_seen: Instant,
    #[serde(skip)]
    ports: Vec<u16>,
}

/// Bound on the per-source port set used for `distinct_ports`.
const MAX_TRACKED_PORTS: usize = 64;

impl SourceStats {
    fn new(record: &EventRecord) -> Self {
        Self {
            events: 1,
            distinct_ports: 1,
            last_port: record.dst_port,
            last_seen: Instant::now(),
            ports: vec![record.dst_port],
        }
    }

    fn merge(&mut self, record: &EventRecord) {
        self.events += 1;
        self.last_port = record.dst_port;
        self.last_seen = Instant::now();
        if self.ports.len() < MAX_TRACKED_PORTS && !self.ports.contains(&record.dst_port) {
            self.ports.push(record.dst_port);
            self.distinct_ports = self.ports.len();
        }
    }
}

pub struct TelemetryState {
    pub sources: DashMap<Ipv4Addr, SourceStats>,
    pub events_total: AtomicU64,
    pub malformed_records: AtomicU64,
    pub auto_denylisted: AtomicU64,
    recent: Mutex<VecDeque<EventRecord>>,
    recent_capacity: usize,
}

impl TelemetryState {
    pub fn new(recent_capacity: usize) -> Self {
        Self {
            sources: DashMap::new(),
            events_total: AtomicU64::new(0),
            malformed_records: AtomicU64::new(0),
            auto_denylisted: AtomicU64::new(0),
            recent: Mutex::new(VecDeque::with_capacity(recent_capacity)),
            recent_capacity,
        }
    }

    pub fn update(&self, record: &EventRecord) {
        self.sources
            .entry(record.src_ip)
            .and_modify(|stats| stats.merge(record))
            .or_insert_with(|| SourceStats::new(record));

        self.events_total.fetch_add(1, Ordering::Relaxed);

        if self.recent_capacity == 0 {
            return;
        }
        let mut recent = match self.recent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if recent.len() == self.recent_capacity {
            recent.pop_front();
        }
        recent.push_back(record.clone());
    }

    pub fn record_malformed(&self) {
        self.malformed_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auto_denylisted(&self) {
        self.auto_denylisted.fetch_add(1, Ordering::Relaxed);
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<EventRecord> {
        let recent = match self.recent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        recent.iter().rev().take(limit).cloned().collect()
    }

    pub fn cleanup_stale_sources(&self, timeout: tokio::time::Duration) {
        let now = Instant::now();
        self.sources
            .retain(|_, stats| now.duration_since(stats.last_seen) <= timeout);
    }
}
