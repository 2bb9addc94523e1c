use anyhow::Context;
use aya::maps::{MapData, PerCpuArray};
use sentinel_common::Outcome;
use serde::Serialize;
use std::sync::Mutex;

/// Classifier outcome totals, summed over all CPUs.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct ClassifierCounters {
    pub malformed: u64,
    pub unsupported: u64,
    pub denylisted: u64,
    pub non_tcp: u64,
    pub exported: u64,
    pub export_skipped: u64,
}

impl ClassifierCounters {
    pub fn get(&self, outcome: Outcome) -> u64 {
        match outcome {
            Outcome::Malformed => self.malformed,
            Outcome::Unsupported => self.unsupported,
            Outcome::Denylisted => self.denylisted,
            Outcome::NonTcp => self.non_tcp,
            Outcome::Exported => self.exported,
            Outcome::ExportSkipped => self.export_skipped,
        }
    }

    pub fn add(&mut self, outcome: Outcome, n: u64) {
        let slot = match outcome {
            Outcome::Malformed => &mut self.malformed,
            Outcome::Unsupported => &mut self.unsupported,
            Outcome::Denylisted => &mut self.denylisted,
            Outcome::NonTcp => &mut self.non_tcp,
            Outcome::Exported => &mut self.exported,
            Outcome::ExportSkipped => &mut self.export_skipped,
        };
        *slot += n;
    }

    pub fn packets(&self) -> u64 {
        Outcome::ALL.iter().map(|o| self.get(*o)).sum()
    }

    pub fn dropped(&self) -> u64 {
        self.denylisted
    }
}

pub trait CounterSource: Send + Sync {
    fn snapshot(&self) -> anyhow::Result<ClassifierCounters>;
}

/// The per-CPU `STATS` map of the loaded program.
pub struct KernelCounters {
    map: Mutex<PerCpuArray<MapData, u64>>,
}

impl KernelCounters {
    pub fn new(map: PerCpuArray<MapData, u64>) -> Self {
        Self {
            map: Mutex::new(map),
        }
    }
}

impl CounterSource for KernelCounters {
    fn snapshot(&self) -> anyhow::Result<ClassifierCounters> {
        let map = self
            .map
            .lock()
            .map_err(|_| anyhow::anyhow!("stats map lock poisoned"))?;
        let mut counters = ClassifierCounters::default();
        for outcome in Outcome::ALL {
            let per_cpu = map
                .get(&outcome.index(), 0)
                .with_context(|| format!("failed to read {} counter", outcome.name()))?;
            counters.add(outcome, per_cpu.iter().sum());
        }
        Ok(counters)
    }
}
