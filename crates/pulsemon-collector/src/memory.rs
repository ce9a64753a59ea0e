use crate::Collector;
use anyhow::Result;
use pulsemon_common::types::Metric;
use sysinfo::System;

pub struct MemoryCollector {
    system: System,
}

impl MemoryCollector {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for MemoryCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for MemoryCollector {
    fn name(&self) -> &str {
        "memory"
    }

    fn collect(&mut self) -> Result<Vec<Metric>> {
        self.system.refresh_memory();

        let total = self.system.total_memory();
        let free = self.system.free_memory();
        let used = self.system.used_memory();

        Ok(vec![
            Metric::gauge("TotalMemory", total as f64),
            Metric::gauge("FreeMemory", free as f64),
            Metric::gauge("UsedMemory", used as f64),
        ])
    }
}
