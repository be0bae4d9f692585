//! Process Control Block
//!
//! Per-process state shared by the interpreter and the scheduler: the
//! program, variable table, loop stack, log buffer, and the bookkeeping
//! that survives the process for later inspection.

use std::collections::HashMap;

use rand::Rng;

use crate::instruction::{Instruction, Value};
use crate::time;

/// Cap on named variables per process. Declarations beyond the cap are
/// silently dropped; reads of unknown names resolve to zero.
pub const MAX_VARIABLES: usize = 32;

/// Loop nesting cap for generated programs.
pub const MAX_FOR_DEPTH: usize = 3;

/// An active FOR loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForContext {
    /// Index of the opening FOR_START instruction.
    pub start_index: usize,
    /// Iterations still owed, including the one in flight.
    pub remaining: u16,
}

/// Per-process state record.
///
/// The scheduler's process table owns the canonical instance; queues and
/// reports refer to it by name only.
pub struct Pcb {
    pub name: String,
    start_time: String,
    program: Vec<Instruction>,
    pub instruction_pointer: usize,
    variables: HashMap<String, u16>,
    pub for_stack: Vec<ForContext>,
    logs: String,
    pub is_finished: bool,
    /// Core that last executed an instruction, -1 if none did yet.
    pub last_executed_core: i32,
    /// Set only when an access violation terminated the process.
    pub violation_time: Option<String>,
    pub violation_addr: Option<u32>,
    /// Requested virtual size in bytes.
    pub allocated_bytes: usize,
}

impl Pcb {
    pub fn new(name: &str) -> Self {
        Pcb {
            name: name.to_string(),
            start_time: time::timestamp(),
            program: Vec::new(),
            instruction_pointer: 0,
            variables: HashMap::new(),
            for_stack: Vec::new(),
            logs: String::new(),
            is_finished: false,
            last_executed_core: -1,
            violation_time: None,
            violation_addr: None,
            allocated_bytes: 0,
        }
    }

    pub fn start_time(&self) -> &str {
        &self.start_time
    }

    pub fn add_instruction(&mut self, instruction: Instruction) {
        self.program.push(instruction);
    }

    pub fn program(&self) -> &[Instruction] {
        &self.program
    }

    pub fn total_instructions(&self) -> usize {
        self.program.len()
    }

    /// Accumulated log text.
    pub fn log_text(&self) -> &str {
        &self.logs
    }

    /// Append one line to the log.
    pub fn log(&mut self, line: impl AsRef<str>) {
        self.logs.push_str(line.as_ref());
        self.logs.push('\n');
    }

    pub fn variable(&self, name: &str) -> Option<u16> {
        self.variables.get(name).copied()
    }

    pub fn variable_count(&self) -> usize {
        self.variables.len()
    }

    /// Store `value` under `name`. At the cap, stores to names not yet
    /// declared are dropped.
    pub fn set_variable(&mut self, name: &str, value: u16) {
        if let Some(slot) = self.variables.get_mut(name) {
            *slot = value;
        } else if self.variables.len() < MAX_VARIABLES {
            self.variables.insert(name.to_string(), value);
        }
    }

    /// Resolve an operand. An unknown name auto-initializes to zero,
    /// which counts against the variable cap like a declaration.
    pub fn resolve(&mut self, value: &Value) -> u16 {
        match value {
            Value::Literal(literal) => *literal,
            Value::Var(name) => {
                if !self.variables.contains_key(name) {
                    self.set_variable(name, 0);
                }
                self.variable(name).unwrap_or(0)
            }
        }
    }

    /// Violation address rendered the way reports show it, e.g. `0x80`.
    pub fn violation_addr_hex(&self) -> Option<String> {
        self.violation_addr.map(|addr| format!("{:#x}", addr))
    }

    /// Fill the program with exactly `count` random instructions, FOR
    /// delimiters included. READ/WRITE addresses are drawn from
    /// `[0, max(16, max_addressable))`, so a generated program never
    /// leaves its own allocation.
    pub fn generate_program(&mut self, count: usize, max_addressable: usize, rng: &mut impl Rng) {
        let addr_span = max_addressable.max(16) as u32;
        let name = self.name.clone();
        generate_into(&mut self.program, count, 0, &name, addr_span, rng);
    }
}

fn generate_into(
    program: &mut Vec<Instruction>,
    mut budget: usize,
    depth: usize,
    name: &str,
    addr_span: u32,
    rng: &mut impl Rng,
) {
    while budget > 0 {
        // Occasionally open a loop; its delimiters and body all come out
        // of the same budget.
        if depth < MAX_FOR_DEPTH && budget >= 4 && rng.gen_ratio(1, 10) {
            let body = rng.gen_range(2..=4usize).min(budget - 2);
            program.push(Instruction::ForStart {
                count: rng.gen_range(1..=3),
            });
            generate_into(program, body, depth + 1, name, addr_span, rng);
            program.push(Instruction::ForEnd);
            budget -= body + 2;
            continue;
        }
        program.push(random_basic(name, addr_span, rng));
        budget -= 1;
    }
}

fn random_basic(name: &str, addr_span: u32, rng: &mut impl Rng) -> Instruction {
    match rng.gen_range(0..7) {
        0 => Instruction::Declare {
            var: random_var(rng),
            value: rng.gen(),
        },
        1 => Instruction::Add {
            dest: random_var(rng),
            lhs: random_value(rng),
            rhs: random_value(rng),
        },
        2 => Instruction::Subtract {
            dest: random_var(rng),
            lhs: random_value(rng),
            rhs: random_value(rng),
        },
        3 => Instruction::Print {
            message: format!("Hello world from {}!", name),
        },
        4 => Instruction::Sleep {
            ticks: rng.gen_range(1..=3),
        },
        5 => Instruction::Read {
            dest: random_var(rng),
            addr: rng.gen_range(0..addr_span),
        },
        _ => Instruction::Write {
            addr: rng.gen_range(0..addr_span),
            value: random_value(rng),
        },
    }
}

fn random_var(rng: &mut impl Rng) -> String {
    format!("var{}", rng.gen_range(0..MAX_VARIABLES))
}

fn random_value(rng: &mut impl Rng) -> Value {
    if rng.gen_bool(0.5) {
        Value::Literal(rng.gen())
    } else {
        Value::Var(random_var(rng))
    }
}
