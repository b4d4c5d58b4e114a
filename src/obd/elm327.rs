//! # ELM327 Response Parsing
//!
//! An ELM327 adapter answers each command with one or more lines and ends
//! with a `>` prompt. A Mode 01 answer looks like `41 0C 1A F8`; adapters
//! configured with `ATS0` drop the spaces (`410C1AF8`).

use super::pids::Pid;
use crate::error::{CartelemError, Result};

/// Prompt byte that terminates every adapter reply
pub const ELM_PROMPT: u8 = b'>';

/// Commands sent once after the port opens
pub const INIT_COMMANDS: &[&str] = &[
    "ATZ",   // reset
    "ATE0",  // echo off
    "ATL0",  // linefeeds off
    "ATS0",  // spaces off
    "ATSP0", // automatic protocol
];

/// Replies meaning the vehicle does not answer this PID
const UNSUPPORTED_MARKERS: &[&str] = &["NO DATA", "UNABLE TO CONNECT", "STOPPED", "ERROR", "?"];

/// Interpreted adapter reply to a PID request
#[derive(Debug, Clone, PartialEq)]
pub enum PidResponse {
    /// Decoded engineering value
    Value(f64),
    /// Vehicle or adapter says the PID is not available
    Unsupported(String),
}

/// Strip the prompt, echo and status chatter from a raw reply
fn reply_lines(raw: &str) -> Vec<String> {
    raw.split(|c| c == '\r' || c == '\n')
        .map(|line| line.trim().trim_end_matches(ELM_PROMPT as char).trim())
        .filter(|line| !line.is_empty())
        .filter(|line| !line.eq_ignore_ascii_case("SEARCHING..."))
        .map(str::to_ascii_uppercase)
        .collect()
}

fn hex_digit(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

/// Parse hex digit pairs, ignoring whitespace
fn hex_bytes(line: &str) -> Result<Vec<u8>> {
    let digits: Vec<u8> = line.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.is_empty() || digits.len() % 2 != 0 {
        return Err(CartelemError::Parse(format!("odd or empty hex payload: {:?}", line)));
    }
    digits
        .chunks(2)
        .map(|pair| match (hex_digit(pair[0]), hex_digit(pair[1])) {
            (Some(hi), Some(lo)) => Ok(hi << 4 | lo),
            _ => Err(CartelemError::Parse(format!("non-hex payload: {:?}", line))),
        })
        .collect()
}

/// Interpret the adapter reply to `pid.request()`
///
/// # Errors
///
/// Returns `Parse` when the reply is neither a recognizable "unsupported"
/// marker nor a well-formed `41 <pid> <data>` line.
pub fn parse_pid_response(pid: Pid, raw: &str) -> Result<PidResponse> {
    let lines = reply_lines(raw);
    let request = pid.request();

    if lines.is_empty() {
        return Ok(PidResponse::Unsupported("empty reply".to_string()));
    }

    for line in &lines {
        // Echo of our own request when ATE0 did not take
        if line.replace(' ', "") == request {
            continue;
        }

        if let Some(marker) = UNSUPPORTED_MARKERS.iter().find(|m| line.contains(*m)) {
            return Ok(PidResponse::Unsupported(marker.to_string()));
        }

        let bytes = hex_bytes(line)?;
        if bytes.len() >= 2 && bytes[0] == 0x41 && bytes[1] == pid.code() {
            return pid.decode(&bytes[2..]).map(PidResponse::Value);
        }
    }

    Err(CartelemError::Parse(format!(
        "no response for {} in reply {:?}",
        pid,
        lines.join(" | ")
    )))
}
