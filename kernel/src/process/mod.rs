//! Process Management
//!
//! Process control blocks, the single-step interpreter, and the scheduler.

pub mod interp;
pub mod pcb;
pub mod sched;

pub use interp::{step_once, StepOutcome, SYMBOL_TABLE_ADDR};
pub use pcb::{ForContext, Pcb, MAX_FOR_DEPTH, MAX_VARIABLES};
pub use sched::{AdmissionError, Scheduler};
