//! Resolution of records left open.
//!
//! An open record is either being written right now or its writer died. The
//! writer holds an exclusive `flock` on the record for as long as it lives,
//! so a fresh non-blocking lock attempt tells the two apart. Locks belong to
//! open file descriptions, which makes the probe see a writer in the same
//! process as well.
//!
//! A writer appends the footer before it writes the output length, so a dead
//! writer's open record ending in a complete footer finished its run.

use crate::backup::execution::{Execution, ExecutionResult};
use crate::backup::execution_log::record::split_trailing_footer;
use crate::backup::result_error::result::Result;
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::Path;

pub const CRASH_ANNOTATION: &str =
    "\n*** Execution ended abnormally: the process writing this log exited before closing it ***\n";

pub trait WriterProbe: Send + Sync {
    fn writer_alive(&self, record: &Path) -> Result<bool>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FlockProbe;

impl WriterProbe for FlockProbe {
    fn writer_alive(&self, record: &Path) -> Result<bool> {
        let file = File::open(record)?;
        match flock(file.as_raw_fd(), FlockArg::LockSharedNonblock) {
            // Dropping `file` releases the probe's lock.
            Ok(()) => Ok(false),
            Err(Errno::EWOULDBLOCK) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }
}

/// Whether process `pid` exists, whoever owns it.
pub fn process_alive(pid: i32) -> bool {
    pid > 0 && !matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

/// Turns an open record into an [`Execution`]: unfinished while its writer
/// lives. Otherwise the result its footer holds if the writer got that far,
/// or failed with [`CRASH_ANNOTATION`] appended and the last modification of
/// the record as end time.
pub fn resolve_open_record(
    record: &Path,
    start_time: DateTime<Utc>,
    output: &[u8],
    probe: &dyn WriterProbe,
) -> Result<Execution> {
    if probe.writer_alive(record)? {
        return Ok(Execution::new(
            start_time,
            String::from_utf8_lossy(output),
            None,
        ));
    }
    if let Some((output, result)) = split_trailing_footer(output) {
        return Ok(Execution::new(
            start_time,
            String::from_utf8_lossy(output),
            Some(result),
        ));
    }
    let output = String::from_utf8_lossy(output);
    let end_time: DateTime<Utc> = std::fs::metadata(record)?.modified()?.into();
    Ok(Execution::new(
        start_time,
        format!("{output}{CRASH_ANNOTATION}"),
        Some(ExecutionResult::new(end_time.max(start_time), false)),
    ))
}
