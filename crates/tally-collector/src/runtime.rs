use crate::{CollectionTask, Collector};
use anyhow::{anyhow, Result};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tally_common::types::Metric;

/// GENERAL task: resource usage of the agent process itself, a random
/// gauge and the poll counter.
pub struct RuntimeCollector {
    system: System,
    pid: Pid,
}

impl RuntimeCollector {
    pub fn new() -> Result<Self> {
        let pid = sysinfo::get_current_pid().map_err(|e| anyhow!("cannot resolve own pid: {e}"))?;
        Ok(Self {
            system: System::new(),
            pid,
        })
    }
}

impl Collector for RuntimeCollector {
    fn task(&self) -> CollectionTask {
        CollectionTask::General
    }

    fn name(&self) -> &str {
        "runtime"
    }

    fn collect(&mut self) -> Result<Vec<Metric>> {
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        let process = self
            .system
            .process(self.pid)
            .ok_or_else(|| anyhow!("process {} not found", self.pid))?;
        let disk = process.disk_usage();

        Ok(vec![
            Metric::gauge("Alloc", process.memory() as f64),
            Metric::gauge("Sys", process.virtual_memory() as f64),
            Metric::gauge("ProcessCPU", f64::from(process.cpu_usage())),
            Metric::gauge("DiskReadBytes", disk.total_read_bytes as f64),
            Metric::gauge("DiskWrittenBytes", disk.total_written_bytes as f64),
            Metric::gauge("RandomValue", rand::random::<f64>()),
            Metric::counter("PollCount", 1),
        ])
    }
}
