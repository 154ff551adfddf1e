//! Durable per-rule execution history.
//!
//! Records live in `<log dir>/<rule>/<n>` with `n` counting up from 1. A
//! record is created under a temporary name, locked, given its header and
//! only then renamed into place, so readers never see a record without a
//! header or without a live lock while its writer runs. Temporary records
//! of writers that died before the rename are removed by the next writer.
//! Reads never modify records.

pub mod crash;
pub mod record;

use crate::backup::execution::{Execution, ExecutionResult};
use crate::backup::function_path;
use crate::backup::logger::{LineBuffered, LogTarget, Logger, Severity};
use crate::backup::result_error::panic_message;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use chrono::{DateTime, Utc};
use crash::{process_alive, resolve_open_record, FlockProbe, WriterProbe};
use function_name::named;
use itertools::Itertools;
use nix::fcntl::{flock, FlockArg};
use record::Record;
use std::fs::{File, OpenOptions};
use std::io;
use std::io::{Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const PENDING_PREFIX: &str = ".pending-";

pub struct PersistentExecutionLog {
    directory: PathBuf,
    probe: Box<dyn WriterProbe>,
}

/// Output sink writing straight into the record file.
struct RecordSink(File);

impl LogTarget for RecordSink {
    fn write_output(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.0.write_all(bytes)
    }

    fn log(&mut self, _severity: Severity, message: &str) -> io::Result<()> {
        self.0.write_all(format!("{message}\n").as_bytes())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl PersistentExecutionLog {
    pub fn new<P: AsRef<Path>>(log_dir: P, rule_name: &str) -> Self {
        Self::with_probe(log_dir, rule_name, FlockProbe)
    }

    pub fn with_probe<P: AsRef<Path>, W: WriterProbe + 'static>(
        log_dir: P,
        rule_name: &str,
        probe: W,
    ) -> Self {
        Self {
            directory: log_dir.as_ref().join(rule_name),
            probe: Box::new(probe),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn file_names(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            if let Ok(name) = entry?.file_name().into_string() {
                names.push(name);
            }
        }
        Ok(names)
    }

    fn record_numbers(&self) -> Result<Vec<u64>> {
        let mut numbers = self
            .file_names()?
            .iter()
            .filter_map(|n| n.parse().ok())
            .collect_vec();
        numbers.sort_unstable();
        Ok(numbers)
    }

    /// Temporary records with the pid of the process creating them.
    fn pending_records(&self) -> Result<Vec<(PathBuf, i32)>> {
        Ok(self
            .file_names()?
            .into_iter()
            .filter_map(|name| {
                let pid = name.strip_prefix(PENDING_PREFIX)?.parse().ok()?;
                Some((self.directory.join(name), pid))
            })
            .collect_vec())
    }

    fn remove_stale_pending_records(&self) -> Result<()> {
        for (path, pid) in self.pending_records()? {
            if process_alive(pid) {
                continue;
            }
            debug!("Removing {path:?} left by dead process {pid}");
            match std::fs::remove_file(&path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        Ok(())
    }

    fn read_record(&self, number: u64) -> Result<Execution> {
        let path = self.directory.join(number.to_string());
        let bytes = std::fs::read(&path)?;
        match record::parse(&bytes).add_msg(format!("Reading {path:?} failed"))? {
            Record::Closed(execution) => Ok(execution),
            Record::Open { start_time, output } => {
                resolve_open_record(&path, start_time, &output, self.probe.as_ref())
            }
        }
    }

    /// Every execution, oldest first.
    #[named]
    pub fn executions(&self) -> Result<Vec<Execution>> {
        self.record_numbers()?
            .into_iter()
            .map(|number| self.read_record(number))
            .try_collect::<_, Vec<_>, _>()
            .add_fn_name(function_path!())
    }

    #[named]
    pub fn last_execution(&self) -> Result<Option<Execution>> {
        self.record_numbers()?
            .last()
            .map(|number| self.read_record(*number))
            .transpose()
            .add_fn_name(function_path!())
    }

    pub fn last_execution_time(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.last_execution()?.map(|e| *e.start_time()))
    }

    /// Whether a live process is writing the newest record or is about to
    /// create one.
    pub fn is_executing(&self) -> Result<bool> {
        if self
            .pending_records()?
            .iter()
            .any(|(_, pid)| process_alive(*pid))
        {
            return Ok(true);
        }
        Ok(self.last_execution()?.is_some_and(|e| !e.finished()))
    }

    fn create_record(&self, start_time: &DateTime<Utc>) -> Result<(File, PathBuf)> {
        std::fs::create_dir_all(&self.directory)?;
        self.remove_stale_pending_records()?;
        let pending = self
            .directory
            .join(format!("{PENDING_PREFIX}{}", std::process::id()));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&pending)?;
        flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock)?;
        file.write_all(&record::header(start_time))?;
        file.flush()?;

        let number = self.record_numbers()?.last().map_or(1, |n| n + 1);
        let path = self.directory.join(number.to_string());
        std::fs::rename(&pending, &path)?;
        Ok((file, path))
    }

    /// Records one execution. `callback` receives a logger writing into the
    /// record and reports success. Errors and panics of the callback are
    /// appended to the record, which is then closed as failed, and passed on.
    #[named]
    pub fn write_execution<F>(&self, callback: F) -> Result<bool>
    where
        F: FnOnce(&Logger) -> Result<bool>,
    {
        let start_time = Utc::now();
        let (mut file, path) = self
            .create_record(&start_time)
            .add_msg(format!("Creating execution record in {:?} failed", self.directory))
            .add_fn_name(function_path!())?;
        debug!("Writing execution record {path:?}");

        let logger = Logger::new(LineBuffered::new(RecordSink(file.try_clone()?)));
        let outcome = catch_unwind(AssertUnwindSafe(|| callback(&logger)));
        let flushed = logger.flush();

        let (succeeded, epilogue) = match &outcome {
            Ok(Ok(succeeded)) => (*succeeded, None),
            Ok(Err(e)) => (false, Some(format!("{e}\n"))),
            Err(payload) => (false, Some(format!("{}\n", panic_message(payload.as_ref())))),
        };
        let closed = close_record(
            &mut file,
            &start_time,
            epilogue.as_deref(),
            ExecutionResult::new(Utc::now(), succeeded),
        )
        .add_msg(format!("Closing execution record {path:?} failed"))
        .add_fn_name(function_path!());
        if let Err(e) = &closed {
            warn!("{e}");
        }

        match outcome {
            Err(payload) => resume_unwind(payload),
            Ok(result) => {
                let succeeded = result?;
                flushed?;
                closed?;
                Ok(succeeded)
            }
        }
    }
}

/// Appends `epilogue` and the footer, then replaces the open sentinel with
/// the output length. The footer reaches the disk first, so a record with a
/// length field always has a complete footer and a record without one is
/// recognised by its trailing footer.
fn close_record(
    file: &mut File,
    start_time: &DateTime<Utc>,
    epilogue: Option<&str>,
    result: ExecutionResult,
) -> Result<()> {
    let header_length = record::header(start_time).len() as u64;
    let end = file.seek(SeekFrom::End(0))?;
    if let Some(epilogue) = epilogue {
        file.write_all(epilogue.as_bytes())?;
    }
    let output_length = end - header_length + epilogue.map_or(0, |e| e.len() as u64);
    file.write_all(&record::footer(&result))?;
    file.sync_data()?;
    file.seek(SeekFrom::Start(record::length_offset(start_time)))?;
    file.write_all(&record::encode_length(output_length)?)?;
    file.sync_all()?;
    Ok(())
}
