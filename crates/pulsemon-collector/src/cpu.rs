use crate::Collector;
use anyhow::Result;
use pulsemon_common::types::Metric;
use sysinfo::System;

const PREFIX: &str = "CPUutilization";

/// Per-core utilisation as `CPUutilization0`, `CPUutilization1`, ...
///
/// The first reading after construction compares against the refresh done in
/// [`CpuCollector::new`], so it is only meaningful once some time has passed.
pub struct CpuCollector {
    system: System,
}

impl CpuCollector {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_all();
        Self { system }
    }
}

impl Default for CpuCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for CpuCollector {
    fn name(&self) -> &str {
        "cpu"
    }

    fn collect(&mut self) -> Result<Vec<Metric>> {
        self.system.refresh_cpu_all();
        Ok(self
            .system
            .cpus()
            .iter()
            .enumerate()
            .map(|(i, cpu)| Metric::gauge(format!("{PREFIX}{i}"), f64::from(cpu.cpu_usage())))
            .collect())
    }
}
