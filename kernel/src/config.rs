//! Run Configuration
//!
//! The immutable configuration record handed in by the front end. The
//! emulator never reads the config file itself; whoever embeds it loads
//! one of these and passes it to `Scheduler::new`.

use std::fmt;

/// Scheduling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPolicy {
    /// First come, first served: a dispatched process runs to completion.
    Fcfs,
    /// Round robin with a fixed quantum of advanced steps.
    Rr,
}

/// Immutable configuration for one emulator run.
#[derive(Debug, Clone)]
pub struct Config {
    /// Worker cores, 1..=128.
    pub num_cpu: usize,
    pub scheduler: SchedulerPolicy,
    /// RR quantum in advanced steps, >= 1. Ignored under FCFS.
    pub quantum_cycles: u32,
    /// Pacing units between generated process spawns, >= 1.
    pub batch_freq: u32,
    /// Generated program length range, 1 <= min <= max.
    pub min_ins: usize,
    pub max_ins: usize,
    /// Pacing units slept between worker loop iterations.
    pub delay_per_exec: u64,
    /// Emulated physical memory in bytes.
    pub max_overall_mem: usize,
    /// Frame (and page) size in bytes; a power of two.
    pub mem_per_frame: usize,
    /// Per-process virtual size range in bytes.
    pub min_mem_per_proc: usize,
    pub max_mem_per_proc: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            num_cpu: 4,
            scheduler: SchedulerPolicy::Rr,
            quantum_cycles: 5,
            batch_freq: 1,
            min_ins: 1000,
            max_ins: 2000,
            delay_per_exec: 0,
            max_overall_mem: 16384,
            mem_per_frame: 16,
            min_mem_per_proc: 64,
            max_mem_per_proc: 4096,
        }
    }
}

impl Config {
    /// Check every range constraint. Call once before building a
    /// scheduler; the rest of the emulator assumes a valid record.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_cpu < 1 || self.num_cpu > 128 {
            return Err(ConfigError::CpuCount(self.num_cpu));
        }
        if self.quantum_cycles < 1 {
            return Err(ConfigError::Quantum);
        }
        if self.batch_freq < 1 {
            return Err(ConfigError::BatchFreq);
        }
        if self.min_ins < 1 || self.min_ins > self.max_ins {
            return Err(ConfigError::InstructionRange(self.min_ins, self.max_ins));
        }
        if self.mem_per_frame < 2 || !self.mem_per_frame.is_power_of_two() {
            return Err(ConfigError::FrameSize(self.mem_per_frame));
        }
        if self.max_overall_mem < self.mem_per_frame {
            return Err(ConfigError::OverallMem(self.max_overall_mem));
        }
        if self.min_mem_per_proc < 2 || self.min_mem_per_proc > self.max_mem_per_proc {
            return Err(ConfigError::ProcessMemRange(
                self.min_mem_per_proc,
                self.max_mem_per_proc,
            ));
        }
        Ok(())
    }
}

/// Constraint violations reported by [`Config::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    CpuCount(usize),
    Quantum,
    BatchFreq,
    InstructionRange(usize, usize),
    FrameSize(usize),
    OverallMem(usize),
    ProcessMemRange(usize, usize),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::CpuCount(n) => write!(f, "num_cpu {} outside 1..=128", n),
            ConfigError::Quantum => write!(f, "quantum_cycles must be at least 1"),
            ConfigError::BatchFreq => write!(f, "batch_freq must be at least 1"),
            ConfigError::InstructionRange(min, max) => {
                write!(f, "instruction range {}..={} is invalid", min, max)
            }
            ConfigError::FrameSize(n) => {
                write!(f, "mem_per_frame {} is not a power of two >= 2", n)
            }
            ConfigError::OverallMem(n) => {
                write!(f, "max_overall_mem {} holds no whole frame", n)
            }
            ConfigError::ProcessMemRange(min, max) => {
                write!(f, "process memory range {}..={} is invalid", min, max)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
