//! Byte layout of one execution record:
//!
//! ```text
//! <start time>\n
//! <u32 big-endian output length, u32::MAX while open>
//! <output bytes>
//! \n<end time>\n<True|False>\n
//! ```

use crate::backup::execution::{Execution, ExecutionResult};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use chrono::{DateTime, SecondsFormat, Utc};

pub const OPEN_SENTINEL: u32 = u32::MAX;
const LENGTH_SIZE: usize = 4;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    Closed(Execution),
    /// Header written, footer not. The writer may be running or dead.
    Open {
        start_time: DateTime<Utc>,
        output: Vec<u8>,
    },
}

fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Start line plus the open sentinel.
pub fn header(start_time: &DateTime<Utc>) -> Vec<u8> {
    let mut bytes = format!("{}\n", format_time(start_time)).into_bytes();
    bytes.extend_from_slice(&OPEN_SENTINEL.to_be_bytes());
    bytes
}

/// Offset of the length field within a record starting at `start_time`.
pub fn length_offset(start_time: &DateTime<Utc>) -> u64 {
    (format_time(start_time).len() + 1) as u64
}

pub fn encode_length(length: u64) -> Result<[u8; LENGTH_SIZE]> {
    match u32::try_from(length) {
        Ok(length) if length != OPEN_SENTINEL => Ok(length.to_be_bytes()),
        _ => Err(malformed(format!(
            "execution output of {length} bytes does not fit a record"
        ))),
    }
}

pub fn footer(result: &ExecutionResult) -> Vec<u8> {
    format!(
        "\n{}\n{}\n",
        format_time(&result.end_time()),
        if result.succeeded() { "True" } else { "False" }
    )
    .into_bytes()
}

fn malformed<S: Into<String>>(reason: S) -> Error {
    Error::unexpected_output("execution record", reason)
}

pub fn parse(bytes: &[u8]) -> Result<Record> {
    let newline = bytes
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| malformed("missing start time"))?;
    let start_time = parse_time(&bytes[..newline])?;
    let rest = &bytes[newline + 1..];
    if rest.len() < LENGTH_SIZE {
        return Err(malformed("missing length field"));
    }
    let (length, rest) = rest.split_at(LENGTH_SIZE);
    let length = u32::from_be_bytes([length[0], length[1], length[2], length[3]]);

    if length == OPEN_SENTINEL {
        return Ok(Record::Open {
            start_time,
            output: rest.to_vec(),
        });
    }

    let length = length as usize;
    if rest.len() < length {
        return Err(malformed("output shorter than its length field"));
    }
    let (output, footer) = rest.split_at(length);
    let footer = footer
        .strip_prefix(b"\n")
        .ok_or_else(|| malformed("missing footer"))?;
    let footer = String::from_utf8_lossy(footer);
    let mut lines = footer.lines();
    let (Some(end_time), Some(succeeded)) = (lines.next(), lines.next()) else {
        return Err(malformed("incomplete footer"));
    };
    let succeeded = match succeeded {
        "True" => true,
        "False" => false,
        other => return Err(malformed(format!("bad success flag {other:?}"))),
    };
    Ok(Record::Closed(Execution::new(
        start_time,
        String::from_utf8_lossy(output),
        Some(ExecutionResult::new(
            parse_time(end_time.as_bytes())?,
            succeeded,
        )),
    )))
}

/// Splits a complete footer off the end of an open record's output.
pub fn split_trailing_footer(output: &[u8]) -> Option<(&[u8], ExecutionResult)> {
    let body = output.strip_suffix(b"\n")?;
    let flag_start = body.iter().rposition(|b| *b == b'\n')?;
    let succeeded = match &body[flag_start + 1..] {
        b"True" => true,
        b"False" => false,
        _ => return None,
    };
    let body = &body[..flag_start];
    let time_start = body.iter().rposition(|b| *b == b'\n')?;
    let end_time = parse_time(&body[time_start + 1..]).ok()?;
    Some((&body[..time_start], ExecutionResult::new(end_time, succeeded)))
}

fn parse_time(bytes: &[u8]) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(&String::from_utf8_lossy(bytes))?.with_timezone(&Utc))
}
