use aya::maps::{MapData, RingBuf};
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::sync::Arc;

use sentinel_common::Event;

use crate::denylist::DenylistStore;
use crate::ring;
use crate::state::{EventRecord, TelemetryState};

/// Detection rule applied to each exported event. A match denylists the
/// event's source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    /// Source port is a multiple of `n`. `n == 0` never matches.
    SrcPortMultipleOf(u16),
    DstPort(u16),
    Source(Ipv4Addr),
}

impl Rule {
    pub fn matches(&self, record: &EventRecord) -> bool {
        match *self {
            Rule::SrcPortMultipleOf(0) => false,
            Rule::SrcPortMultipleOf(n) => record.src_port % n == 0,
            Rule::DstPort(port) => record.dst_port == port,
            Rule::Source(addr) => record.src_ip == addr,
        }
    }
}

/// Anything the consumer can drain raw event records from.
pub trait EventSource {
    /// Hands every currently available record to `f` and returns how many
    /// there were. Never waits.
    fn drain(&mut self, f: &mut dyn FnMut(&[u8])) -> usize;
}

impl EventSource for RingBuf<MapData> {
    fn drain(&mut self, f: &mut dyn FnMut(&[u8])) -> usize {
        let mut n = 0;
        while let Some(item) = self.next() {
            f(&*item);
            n += 1;
        }
        n
    }
}

impl EventSource for ring::Consumer {
    fn drain(&mut self, f: &mut dyn FnMut(&[u8])) -> usize {
        let mut n = 0;
        while let Some(record) = self.pop() {
            f(record.as_slice());
            n += 1;
        }
        n
    }
}

/// Consumer side of the telemetry stream: decodes records, keeps statistics
/// and feeds rule matches back into the denylist.
pub struct Analyzer {
    rules: Vec<Rule>,
    state: Arc<TelemetryState>,
    denylist: Arc<dyn DenylistStore>,
}

impl Analyzer {
    pub fn new(
        rules: Vec<Rule>,
        state: Arc<TelemetryState>,
        denylist: Arc<dyn DenylistStore>,
    ) -> Self {
        Self {
            rules,
            state,
            denylist,
        }
    }

    pub fn handle(&self, raw: &[u8]) {
        let Some(event) = Event::from_bytes(raw) else {
            tracing::warn!("Skipping short event record ({} bytes)", raw.len());
            self.state.record_malformed();
            return;
        };
        let record = EventRecord::from_ebpf(&event);
        tracing::debug!(
            "Received packet: {}:{} -> {}:{}",
            record.src_ip,
            record.src_port,
            record.dst_ip,
            record.dst_port
        );
        self.state.update(&record);

        let Some(rule) = self.rules.iter().find(|rule| rule.matches(&record)) else {
            return;
        };
        match self.denylist.insert(record.src_ip) {
            Ok(true) => {
                self.state.record_auto_denylisted();
                tracing::warn!("Denylisted {} (matched {:?})", record.src_ip, rule);
            }
            // Events already in flight when the entry landed.
            Ok(false) => {}
            Err(e) => tracing::error!("Failed to denylist {}: {:#}", record.src_ip, e),
        }
    }

    /// Drains `source` once, returning the number of records handled.
    pub fn poll(&self, source: &mut dyn EventSource) -> usize {
        source.drain(&mut |raw| self.handle(raw))
    }
}

/// Continuously drain `source`, sleeping `idle` whenever it is empty.
pub async fn run<S: EventSource>(analyzer: Analyzer, mut source: S, idle: tokio::time::Duration) {
    tracing::info!("Waiting for events...");
    loop {
        analyzer.poll(&mut source);
        // Yield briefly to avoid busy-spinning when the ring buffer is empty.
        tokio::time::sleep(idle).await;
    }
}
