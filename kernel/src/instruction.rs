//! Instruction Model
//!
//! The emulator's fixed ISA. Arity and operand typing are carried by the
//! enum variants, so any constructed instruction is well-formed by
//! definition. The text parser accepts the console syntax used for
//! user-supplied programs (semicolon-separated lines).

use std::fmt;

/// A literal or named operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Literal(u16),
    Var(String),
}

/// One program instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// `DECLARE <var> <u16>` - define a variable.
    Declare { var: String, value: u16 },
    /// `ADD <dest> <op> <op>` - saturating unsigned add.
    Add { dest: String, lhs: Value, rhs: Value },
    /// `SUBTRACT <dest> <op> <op>` - floored unsigned subtract.
    Subtract { dest: String, lhs: Value, rhs: Value },
    /// `PRINT "<message>"` - append a timestamped line to the process log.
    Print { message: String },
    /// `SLEEP <u16>` - block the executing core for that many pacing units.
    Sleep { ticks: u16 },
    /// `READ <dest> <hex-addr>` - load a word from emulated memory.
    Read { dest: String, addr: u32 },
    /// `WRITE <hex-addr> <u16-or-var>` - store a word to emulated memory.
    Write { addr: u32, value: Value },
    /// `FOR_START <u16>` - open a loop running the body that many times.
    ForStart { count: u16 },
    /// `FOR_END` - close the innermost loop.
    ForEnd,
}

impl Instruction {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Instruction::Declare { .. } => "DECLARE",
            Instruction::Add { .. } => "ADD",
            Instruction::Subtract { .. } => "SUBTRACT",
            Instruction::Print { .. } => "PRINT",
            Instruction::Sleep { .. } => "SLEEP",
            Instruction::Read { .. } => "READ",
            Instruction::Write { .. } => "WRITE",
            Instruction::ForStart { .. } => "FOR_START",
            Instruction::ForEnd => "FOR_END",
        }
    }

    /// Parse one instruction line.
    pub fn parse_line(line: &str) -> Result<Instruction, ParseError> {
        let line = line.trim();
        let mut tokens = line.split_whitespace();
        let opcode = tokens.next().ok_or(ParseError::Empty)?;

        match opcode {
            "DECLARE" => Ok(Instruction::Declare {
                var: next_name(&mut tokens, "DECLARE")?,
                value: next_literal(&mut tokens, "DECLARE")?,
            }),
            "ADD" | "SUBTRACT" => {
                let opcode: &'static str = if opcode == "ADD" { "ADD" } else { "SUBTRACT" };
                let dest = next_name(&mut tokens, opcode)?;
                let lhs = next_value(&mut tokens, opcode)?;
                let rhs = next_value(&mut tokens, opcode)?;
                if opcode == "ADD" {
                    Ok(Instruction::Add { dest, lhs, rhs })
                } else {
                    Ok(Instruction::Subtract { dest, lhs, rhs })
                }
            }
            "PRINT" => {
                let rest = line["PRINT".len()..].trim();
                let first = rest.find('"').ok_or(ParseError::UnterminatedString)?;
                let last = rest.rfind('"').ok_or(ParseError::UnterminatedString)?;
                if first == last {
                    return Err(ParseError::UnterminatedString);
                }
                Ok(Instruction::Print {
                    message: rest[first + 1..last].to_string(),
                })
            }
            "SLEEP" => Ok(Instruction::Sleep {
                ticks: next_literal(&mut tokens, "SLEEP")?,
            }),
            "READ" => Ok(Instruction::Read {
                dest: next_name(&mut tokens, "READ")?,
                addr: next_address(&mut tokens, "READ")?,
            }),
            "WRITE" => Ok(Instruction::Write {
                addr: next_address(&mut tokens, "WRITE")?,
                value: next_value(&mut tokens, "WRITE")?,
            }),
            "FOR_START" => Ok(Instruction::ForStart {
                count: next_literal(&mut tokens, "FOR_START")?,
            }),
            "FOR_END" => Ok(Instruction::ForEnd),
            other => Err(ParseError::UnknownOpcode(other.to_string())),
        }
    }

    /// Parse a semicolon-separated batch. Offending lines are skipped
    /// with a diagnostic; the rest of the batch is kept.
    pub fn parse_program(text: &str) -> (Vec<Instruction>, Vec<ParseError>) {
        let mut program = Vec::new();
        let mut errors = Vec::new();
        for piece in text.split(';') {
            if piece.trim().is_empty() {
                continue;
            }
            match Instruction::parse_line(piece) {
                Ok(instr) => program.push(instr),
                Err(err) => {
                    log::warn!("skipping instruction {:?}: {}", piece.trim(), err);
                    errors.push(err);
                }
            }
        }
        (program, errors)
    }
}

fn next_name<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
    opcode: &'static str,
) -> Result<String, ParseError> {
    tokens
        .next()
        .map(str::to_string)
        .ok_or(ParseError::MissingOperand(opcode))
}

fn next_literal<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
    opcode: &'static str,
) -> Result<u16, ParseError> {
    let token = tokens.next().ok_or(ParseError::MissingOperand(opcode))?;
    token
        .parse()
        .map_err(|_| ParseError::InvalidLiteral(token.to_string()))
}

/// A token starting with a digit is a `u16` literal, anything else names
/// a variable.
fn next_value<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
    opcode: &'static str,
) -> Result<Value, ParseError> {
    let token = tokens.next().ok_or(ParseError::MissingOperand(opcode))?;
    if token.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        token
            .parse()
            .map(Value::Literal)
            .map_err(|_| ParseError::InvalidLiteral(token.to_string()))
    } else {
        Ok(Value::Var(token.to_string()))
    }
}

/// Hex address, with or without a `0x` prefix.
fn next_address<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
    opcode: &'static str,
) -> Result<u32, ParseError> {
    let token = tokens.next().ok_or(ParseError::MissingOperand(opcode))?;
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    u32::from_str_radix(digits, 16).map_err(|_| ParseError::InvalidAddress(token.to_string()))
}

/// Why a line was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    Empty,
    UnknownOpcode(String),
    MissingOperand(&'static str),
    InvalidLiteral(String),
    InvalidAddress(String),
    UnterminatedString,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Empty => write!(f, "empty instruction"),
            ParseError::UnknownOpcode(op) => write!(f, "unknown opcode {:?}", op),
            ParseError::MissingOperand(op) => write!(f, "{} is missing an operand", op),
            ParseError::InvalidLiteral(tok) => write!(f, "{:?} is not a 16-bit literal", tok),
            ParseError::InvalidAddress(tok) => write!(f, "{:?} is not a hex address", tok),
            ParseError::UnterminatedString => write!(f, "PRINT message must be double-quoted"),
        }
    }
}

impl std::error::Error for ParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_declare() {
        assert_eq!(
            Instruction::parse_line("DECLARE x 65530"),
            Ok(Instruction::Declare {
                var: "x".to_string(),
                value: 65530
            })
        );
    }

    #[test]
    fn test_parse_arithmetic_operands() {
        assert_eq!(
            Instruction::parse_line("ADD x x 10"),
            Ok(Instruction::Add {
                dest: "x".to_string(),
                lhs: Value::Var("x".to_string()),
                rhs: Value::Literal(10)
            })
        );
        assert_eq!(
            Instruction::parse_line("SUBTRACT y 7 z"),
            Ok(Instruction::Subtract {
                dest: "y".to_string(),
                lhs: Value::Literal(7),
                rhs: Value::Var("z".to_string())
            })
        );
    }

    #[test]
    fn test_parse_print_keeps_inner_text() {
        assert_eq!(
            Instruction::parse_line("PRINT \"hello there\""),
            Ok(Instruction::Print {
                message: "hello there".to_string()
            })
        );
        assert_eq!(
            Instruction::parse_line("PRINT hello"),
            Err(ParseError::UnterminatedString)
        );
    }

    #[test]
    fn test_parse_addresses() {
        assert_eq!(
            Instruction::parse_line("READ r 0x1F"),
            Ok(Instruction::Read {
                dest: "r".to_string(),
                addr: 0x1F
            })
        );
        assert_eq!(
            Instruction::parse_line("WRITE 40 9"),
            Ok(Instruction::Write {
                addr: 0x40,
                value: Value::Literal(9)
            })
        );
        assert_eq!(
            Instruction::parse_line("WRITE 0xG0 9"),
            Err(ParseError::InvalidAddress("0xG0".to_string()))
        );
    }

    #[test]
    fn test_parse_for_loop() {
        assert_eq!(
            Instruction::parse_line("FOR_START 3"),
            Ok(Instruction::ForStart { count: 3 })
        );
        assert_eq!(Instruction::parse_line("FOR_END"), Ok(Instruction::ForEnd));
    }

    #[test]
    fn test_parse_program_skips_bad_lines() {
        let (program, errors) =
            Instruction::parse_program("DECLARE x 1; BOGUS y; PRINT \"ok\";; SLEEP 2");
        assert_eq!(program.len(), 3);
        assert_eq!(program[0].mnemonic(), "DECLARE");
        assert_eq!(program[1].mnemonic(), "PRINT");
        assert_eq!(program[2].mnemonic(), "SLEEP");
        assert_eq!(errors, vec![ParseError::UnknownOpcode("BOGUS".to_string())]);
    }

    #[test]
    fn test_rejects_oversized_literal() {
        assert_eq!(
            Instruction::parse_line("DECLARE x 70000"),
            Err(ParseError::InvalidLiteral("70000".to_string()))
        );
    }
}
