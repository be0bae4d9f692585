//! Wall-Clock Formatting
//!
//! Timestamp helpers shared by the PCB and the interpreter's log lines.

use chrono::Local;

/// Full timestamp used for process start times, e.g.
/// `08/01/2026 09:15:42PM`.
pub fn timestamp() -> String {
    Local::now().format("%m/%d/%Y %I:%M:%S%p").to_string()
}

/// Clock-only form used in log lines, e.g. `09:15:42PM`.
pub fn clock_time() -> String {
    Local::now().format("%I:%M:%S%p").to_string()
}
