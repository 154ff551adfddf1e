use crate::backup::logger::{LogTarget, Severity};
use crate::backup::options::bool_option;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use crate::backup::rule::Scheduling;
use chrono::Local;
use nix::libc;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::io::Write;
use std::path::Path;
use std::sync::Once;

pub const LOG_FILE_OPTION: &str = "LogFile";
pub const LOG_STDERR_OPTION: &str = "LogStderr";
pub const SYSLOG_OPTION: &str = "Syslog";

static TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Builds the extra sinks a scheduling asks for.
pub trait SinkFactory: Send + Sync {
    fn sinks_for(&self, scheduling: &Scheduling) -> Result<Vec<Box<dyn LogTarget>>>;
}

/// Sinks selected by the `LogFile`, `LogStderr` and `Syslog` options.
pub struct StandardSinks {
    syslog_ident: String,
}

impl StandardSinks {
    pub fn new<S: Into<String>>(syslog_ident: S) -> Self {
        Self {
            syslog_ident: syslog_ident.into(),
        }
    }
}

impl SinkFactory for StandardSinks {
    fn sinks_for(&self, scheduling: &Scheduling) -> Result<Vec<Box<dyn LogTarget>>> {
        let mut sinks: Vec<Box<dyn LogTarget>> = Vec::new();
        if let Some(path) = scheduling.option(LOG_FILE_OPTION) {
            sinks.push(Box::new(
                TimestampedFile::open(path)
                    .add_msg(format!("Opening log file {path:?} failed"))?,
            ));
        }
        if bool_option(scheduling.options(), LOG_STDERR_OPTION, false)? {
            sinks.push(Box::new(StderrSink));
        }
        if bool_option(scheduling.options(), SYSLOG_OPTION, true)? {
            sinks.push(Box::new(SyslogSink::new(
                &self.syslog_ident,
                scheduling.rule_name(),
            )));
        }
        Ok(sinks)
    }
}

/// Appends lines to a file, each prefixed with the local time.
pub struct TimestampedFile {
    file: File,
}

impl TimestampedFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self { file })
    }

    fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        let mut entry = format!("{} ", Local::now().format(TIMESTAMP_FORMAT)).into_bytes();
        entry.extend_from_slice(line);
        if !line.ends_with(b"\n") {
            entry.push(b'\n');
        }
        self.file.write_all(&entry)
    }
}

impl LogTarget for TimestampedFile {
    fn write_output(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.write_line(bytes)
    }

    fn log(&mut self, _severity: Severity, message: &str) -> io::Result<()> {
        self.write_line(message.as_bytes())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

pub struct StderrSink;

impl LogTarget for StderrSink {
    fn write_output(&mut self, bytes: &[u8]) -> io::Result<()> {
        io::stderr().write_all(bytes)
    }

    fn log(&mut self, _severity: Severity, message: &str) -> io::Result<()> {
        writeln!(io::stderr(), "{message}")
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

static OPEN_SYSLOG: Once = Once::new();

pub struct SyslogSink {
    prefix: String,
}

impl SyslogSink {
    pub fn new(ident: &str, rule_name: &str) -> Self {
        OPEN_SYSLOG.call_once(|| {
            let ident = c_string(ident);
            // openlog keeps the pointer, so the ident lives for the process.
            let ident: &'static CString = Box::leak(Box::new(ident));
            unsafe { libc::openlog(ident.as_ptr(), libc::LOG_PID, libc::LOG_USER) };
        });
        Self {
            prefix: format!("{rule_name}: "),
        }
    }

    fn send(&self, severity: Severity, message: &str) {
        let priority = match severity {
            Severity::Debug => libc::LOG_DEBUG,
            Severity::Info => libc::LOG_INFO,
            Severity::Notice => libc::LOG_NOTICE,
            Severity::Warning => libc::LOG_WARNING,
            Severity::Err => libc::LOG_ERR,
        };
        let message = c_string(&format!("{}{}", self.prefix, message));
        unsafe { libc::syslog(priority, c"%s".as_ptr(), message.as_ptr()) };
    }
}

fn c_string(s: &str) -> CString {
    CString::new(s.replace('\0', "")).unwrap_or_default()
}

impl LogTarget for SyslogSink {
    fn write_output(&mut self, bytes: &[u8]) -> io::Result<()> {
        let line = String::from_utf8_lossy(bytes);
        let line = line.trim_end_matches('\n');
        if !line.is_empty() {
            self.send(Severity::Info, line);
        }
        Ok(())
    }

    fn log(&mut self, severity: Severity, message: &str) -> io::Result<()> {
        self.send(severity, message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::options::OptionMap;
    use tempfile::TempDir;

    fn scheduling(options: &[(&str, &str)]) -> Scheduling {
        Scheduling::new(
            "rule",
            options
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<OptionMap>(),
            None,
        )
    }

    #[test]
    fn test_timestamped_file_prefixes_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rule.log");
        let mut sink = TimestampedFile::open(&path).unwrap();
        sink.write_output(b"copied 3 files\n").unwrap();
        sink.log(Severity::Err, "failed").unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" copied 3 files"));
        assert!(lines[1].ends_with(" failed"));
        assert!(chrono::NaiveDateTime::parse_from_str(&lines[0][..19], TIMESTAMP_FORMAT).is_ok());
    }

    #[test]
    fn test_standard_sinks_selection() {
        let dir = TempDir::new().unwrap();
        let factory = StandardSinks::new("k-dispatch-test");

        let none = factory
            .sinks_for(&scheduling(&[("Syslog", "no")]))
            .unwrap();
        assert!(none.is_empty());

        let log_file = dir.path().join("out.log");
        let all_but_syslog = factory
            .sinks_for(&scheduling(&[
                ("Syslog", "no"),
                ("LogStderr", "yes"),
                ("LogFile", log_file.to_str().unwrap()),
            ]))
            .unwrap();
        assert_eq!(all_but_syslog.len(), 2);
        assert!(log_file.exists());

        assert!(factory
            .sinks_for(&scheduling(&[("Syslog", "sometimes")]))
            .is_err());
    }
}
