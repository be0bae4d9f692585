//! Osim Kernel Core
//!
//! The emulator's scheduling side: the instruction model, process control
//! blocks, the single-step interpreter, and the multi-core scheduler that
//! drives them over the `osim-mm` paging layer.

use std::time::Duration;

pub mod config;
pub mod instruction;
pub mod process;
pub mod stats;
pub mod time;

pub use config::{Config, ConfigError, SchedulerPolicy};
pub use instruction::{Instruction, ParseError, Value};
pub use process::interp::StepOutcome;
pub use process::pcb::Pcb;
pub use process::sched::{AdmissionError, Scheduler};
pub use stats::{ProcessSnapshot, SchedulerStats};

/// One pacing unit. Worker inter-step delays, generator cadence and the
/// SLEEP instruction all scale from this.
pub const PACING: Duration = Duration::from_millis(50);
