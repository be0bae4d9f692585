//! Scheduler Statistics
//!
//! Snapshot types consumed by the utilization report and the `vmstat`
//! style front-end queries. Paging counters live in `osim_mm::MemoryStats`.

/// Tick accounting snapshot.
///
/// `active_ticks` is the estimate `cpu_tick * active cores at sample
/// time`; `idle_ticks` is the remainder against `cpu_tick * num_cpu`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub cpu_tick: u64,
    pub active_ticks: u64,
    pub idle_ticks: u64,
}

/// One row of the utilization report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSnapshot {
    pub name: String,
    pub start_time: String,
    /// Core that last executed the process, -1 if it never ran.
    pub core: i32,
    pub instruction_pointer: usize,
    pub total_instructions: usize,
    pub finished: bool,
}
