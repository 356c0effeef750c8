use crate::{CollectionTask, Collector};
use anyhow::Result;
use sysinfo::System;
use tally_common::types::Metric;

/// ADDITIONAL task: host memory and per-core CPU utilisation.
pub struct SystemCollector {
    system: System,
}

impl SystemCollector {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_all();
        Self { system }
    }
}

impl Default for SystemCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for SystemCollector {
    fn task(&self) -> CollectionTask {
        CollectionTask::Additional
    }

    fn name(&self) -> &str {
        "system"
    }

    fn collect(&mut self) -> Result<Vec<Metric>> {
        self.system.refresh_memory();
        self.system.refresh_cpu_usage();

        let mut metrics = vec![
            Metric::gauge("TotalMemory", self.system.total_memory() as f64),
            Metric::gauge("FreeMemory", self.system.free_memory() as f64),
            Metric::gauge("AvailableMemory", self.system.available_memory() as f64),
            Metric::gauge("UsedMemory", self.system.used_memory() as f64),
        ];

        // Cores are numbered from 1.
        for (i, cpu) in self.system.cpus().iter().enumerate() {
            metrics.push(Metric::gauge(
                format!("CPUutilization{}", i + 1),
                f64::from(cpu.cpu_usage()),
            ));
        }

        Ok(metrics)
    }
}
