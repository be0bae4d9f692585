//! Instruction Interpreter
//!
//! Executes one PCB instruction per call. A page fault is serviced in
//! place and reported as `Retry`, leaving the instruction pointer
//! untouched so the scheduler re-attempts the same instruction; an
//! access violation terminates the process on the spot.

use std::thread;

use osim_mm::{MemoryError, MemoryManager};

use crate::instruction::Instruction;
use crate::process::pcb::{ForContext, Pcb};
use crate::time;
use crate::PACING;

/// Virtual address of the per-process variable table. Instructions that
/// touch variables demand this page resident before executing.
pub const SYMBOL_TABLE_ADDR: u32 = 0;

/// What a single step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The instruction executed and the pointer advanced.
    Advanced,
    /// A page fault was serviced; the same instruction must run again.
    Retry,
    /// The process finished, normally or by violation.
    Terminated,
}

/// Execute the instruction under `pcb.instruction_pointer` on `core`.
pub fn step_once(pcb: &mut Pcb, core: usize, mm: &MemoryManager) -> StepOutcome {
    if pcb.is_finished {
        return StepOutcome::Terminated;
    }
    if pcb.instruction_pointer >= pcb.total_instructions() {
        finish(pcb);
        return StepOutcome::Terminated;
    }

    let instr = pcb.program()[pcb.instruction_pointer].clone();

    // Control flow never touches memory.
    match instr {
        Instruction::ForStart { count } => {
            pcb.for_stack.push(ForContext {
                start_index: pcb.instruction_pointer,
                remaining: count,
            });
            advance(pcb);
            return StepOutcome::Advanced;
        }
        Instruction::ForEnd => {
            match pcb.for_stack.last_mut() {
                Some(top) => {
                    top.remaining = top.remaining.saturating_sub(1);
                    if top.remaining > 0 {
                        pcb.instruction_pointer = top.start_index + 1;
                    } else {
                        pcb.for_stack.pop();
                        advance(pcb);
                    }
                }
                // A lone FOR_END in a malformed program just advances.
                None => advance(pcb),
            }
            return StepOutcome::Advanced;
        }
        _ => {}
    }

    if let Err(fault) = mm.ensure_pages_present(&pcb.name, &required_addrs(&instr)) {
        return handle_fault(pcb, core, mm, fault);
    }

    match execute(pcb, core, mm, &instr) {
        Ok(()) => {
            pcb.last_executed_core = core as i32;
            advance(pcb);
            StepOutcome::Advanced
        }
        Err(fault) => handle_fault(pcb, core, mm, fault),
    }
}

/// Addresses an instruction touches, demanded resident before it runs.
/// Variable-table instructions need the symbol-table page; READ/WRITE
/// need the page of their operand address.
fn required_addrs(instr: &Instruction) -> Vec<u32> {
    match instr {
        Instruction::Declare { .. }
        | Instruction::Add { .. }
        | Instruction::Subtract { .. }
        | Instruction::Print { .. } => vec![SYMBOL_TABLE_ADDR],
        Instruction::Read { addr, .. } | Instruction::Write { addr, .. } => vec![*addr],
        Instruction::Sleep { .. } | Instruction::ForStart { .. } | Instruction::ForEnd => {
            Vec::new()
        }
    }
}

fn execute(
    pcb: &mut Pcb,
    core: usize,
    mm: &MemoryManager,
    instr: &Instruction,
) -> Result<(), MemoryError> {
    match instr {
        Instruction::Declare { var, value } => {
            pcb.set_variable(var, *value);
        }
        Instruction::Add { dest, lhs, rhs } => {
            let sum = pcb.resolve(lhs).saturating_add(pcb.resolve(rhs));
            pcb.set_variable(dest, sum);
        }
        Instruction::Subtract { dest, lhs, rhs } => {
            let difference = pcb.resolve(lhs).saturating_sub(pcb.resolve(rhs));
            pcb.set_variable(dest, difference);
        }
        Instruction::Print { message } => {
            let line = format!("[{}] [Core {}] {}", time::clock_time(), core, message);
            pcb.log(line);
        }
        Instruction::Sleep { ticks } => {
            thread::sleep(PACING * u32::from(*ticks));
        }
        Instruction::Read { dest, addr } => {
            let value = mm.read(&pcb.name, *addr)?;
            pcb.set_variable(dest, value);
            let line = format!(
                "[{}] [Core {}] READ {} = {} from {:#x}",
                time::clock_time(),
                core,
                dest,
                value,
                addr
            );
            pcb.log(line);
        }
        Instruction::Write { addr, value } => {
            let word = pcb.resolve(value);
            mm.write(&pcb.name, *addr, word)?;
            let line = format!(
                "[{}] [Core {}] WRITE {} to {:#x}",
                time::clock_time(),
                core,
                word,
                addr
            );
            pcb.log(line);
        }
        // Handled before the memory pre-flight.
        Instruction::ForStart { .. } | Instruction::ForEnd => {}
    }
    Ok(())
}

/// Service a page fault and ask for a retry; anything else is an access
/// violation that terminates the process.
fn handle_fault(pcb: &mut Pcb, core: usize, mm: &MemoryManager, fault: MemoryError) -> StepOutcome {
    match fault {
        MemoryError::PageFault { addr, .. } => match mm.service_page_fault(&pcb.name, addr) {
            Ok(()) => StepOutcome::Retry,
            Err(violation) => terminate_with_violation(pcb, core, violation),
        },
        violation => terminate_with_violation(pcb, core, violation),
    }
}

fn terminate_with_violation(pcb: &mut Pcb, core: usize, violation: MemoryError) -> StepOutcome {
    let addr = violation.addr();
    let when = time::clock_time();
    let line = format!(
        "[{}] [Core {}] Memory access violation at {:#x}",
        when, core, addr
    );
    pcb.log(line);
    pcb.violation_time = Some(when);
    pcb.violation_addr = Some(addr);
    pcb.is_finished = true;
    log::debug!("{} terminated: {}", pcb.name, violation);
    StepOutcome::Terminated
}

fn advance(pcb: &mut Pcb) {
    pcb.instruction_pointer += 1;
    if pcb.instruction_pointer >= pcb.total_instructions() {
        finish(pcb);
    }
}

fn finish(pcb: &mut Pcb) {
    if pcb.is_finished {
        return;
    }
    pcb.is_finished = true;
    let line = format!("[Finished] Process {} completed.", pcb.name);
    pcb.log(line);
}
