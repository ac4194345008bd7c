// appinapp-core/src/stats.rs
use sysinfo::{Pid, ProcessesToUpdate, System};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessUsage {
    pub cpu: f32,
    pub memory_mib: u64,
}

/// Resource usage of the host process and its child processes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AppStats {
    pub main: ProcessUsage,
    pub renderer: ProcessUsage,
}

impl AppStats {
    pub fn total(&self) -> ProcessUsage {
        ProcessUsage {
            cpu: self.main.cpu + self.renderer.cpu,
            memory_mib: self.main.memory_mib + self.renderer.memory_mib,
        }
    }
}

/// Keeps a `System` between samples so CPU usage has a baseline.
pub struct StatsSampler {
    sys: System,
    pid: Option<Pid>,
}

impl Default for StatsSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsSampler {
    pub fn new() -> Self {
        Self {
            sys: System::new(),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    pub fn sample(&mut self) -> AppStats {
        self.sys.refresh_processes(ProcessesToUpdate::All, true);

        let Some(pid) = self.pid else {
            return AppStats::default();
        };

        let mut stats = AppStats::default();
        let mut main_bytes = 0;
        let mut child_bytes = 0;
        if let Some(process) = self.sys.process(pid) {
            stats.main.cpu = process.cpu_usage();
            main_bytes = process.memory();
        }
        for process in self.sys.processes().values() {
            if process.parent() == Some(pid) {
                stats.renderer.cpu += process.cpu_usage();
                child_bytes += process.memory();
            }
        }
        stats.main.memory_mib = main_bytes / 1024 / 1024;
        stats.renderer.memory_mib = child_bytes / 1024 / 1024;
        stats
    }
}
