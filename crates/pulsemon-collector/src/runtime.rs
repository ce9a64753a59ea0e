use crate::Collector;
use anyhow::{anyhow, Result};
use pulsemon_common::types::Metric;
use rand::Rng;
use sysinfo::{Pid, System};

/// Readings about the agent process itself, plus the `RandomValue` gauge.
pub struct RuntimeCollector {
    system: System,
    pid: Pid,
}

impl RuntimeCollector {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(std::process::id()),
        }
    }
}

impl Default for RuntimeCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for RuntimeCollector {
    fn name(&self) -> &str {
        "runtime"
    }

    fn collect(&mut self) -> Result<Vec<Metric>> {
        self.system.refresh_all();
        let process = self
            .system
            .process(self.pid)
            .ok_or_else(|| anyhow!("process {} not found", self.pid))?;

        Ok(vec![
            Metric::gauge("ResidentMemory", process.memory() as f64),
            Metric::gauge("VirtualMemory", process.virtual_memory() as f64),
            Metric::gauge("ProcessCPUUsage", f64::from(process.cpu_usage())),
            Metric::gauge("ProcessUptime", process.run_time() as f64),
            Metric::gauge("RandomValue", rand::thread_rng().gen::<f64>()),
        ])
    }
}
