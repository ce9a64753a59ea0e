//! Metric collection for the pulsemon agent.
//!
//! Each [`Collector`] gathers one category of readings (process runtime,
//! host memory, per-core CPU) and returns them as wire-ready [`Metric`]s.
//! The agent's poll loop merges every collector's output into its sample
//! set on each tick.

pub mod cpu;
pub mod memory;
pub mod runtime;

use anyhow::Result;
use pulsemon_common::types::Metric;

/// A metric source polled by the agent.
///
/// `collect` takes `&mut self` so implementations can keep a refreshed
/// `sysinfo` handle between calls; CPU usage in particular is computed
/// from the difference between two refreshes.
pub trait Collector: Send {
    /// Short name used in logs, e.g. `"cpu"`.
    fn name(&self) -> &str;

    /// Current readings.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying system query fails.
    fn collect(&mut self) -> Result<Vec<Metric>>;
}

/// Every collector the agent runs by default.
pub fn default_collectors() -> Vec<Box<dyn Collector>> {
    vec![
        Box::new(runtime::RuntimeCollector::new()),
        Box::new(memory::MemoryCollector::new()),
        Box::new(cpu::CpuCollector::new()),
    ]
}
