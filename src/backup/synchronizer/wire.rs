use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use chrono::{DateTime, FixedOffset, SecondsFormat, TimeZone, Utc};
use itertools::Itertools;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

/// Renders a version the way `restore` and `list-files` expect it: a W3C
/// datetime followed by the same instant as Unix seconds.
pub fn version_args(version: &DateTime<Utc>) -> [String; 2] {
    [
        version.to_rfc3339_opts(SecondsFormat::Secs, false),
        version.timestamp().to_string(),
    ]
}

/// Parses `<secs>[,<millis>]` or a W3C datetime with numeric zone offset.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    let value = value.trim();
    if let Some(parsed) = parse_unix_timestamp(value) {
        return parsed;
    }
    let parsed = DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::<FixedOffset>::parse_from_str(value, "%Y-%m-%dT%H:%M%:z"))?;
    Ok(parsed.with_timezone(&Utc))
}

fn parse_unix_timestamp(value: &str) -> Option<Result<DateTime<Utc>>> {
    let (seconds, millis) = match value.split_once(',') {
        Some((seconds, millis)) => (seconds, Some(millis)),
        None => (value, None),
    };
    let seconds = seconds.parse::<i64>().ok()?;
    let millis = match millis {
        None => 0,
        Some(m) if !m.is_empty() && m.len() <= 3 && m.bytes().all(|b| b.is_ascii_digit()) => {
            // "5" means 500 milliseconds, not 5.
            format!("{m:0<3}").parse::<u32>().ok()?
        }
        Some(_) => return None,
    };
    Some(
        Utc.timestamp_opt(seconds, millis * 1_000_000)
            .single()
            .ok_or_else(|| {
                Error::unexpected_output("versions-of", format!("timestamp {value:?} out of range"))
            }),
    )
}

/// Splits output into items. Output containing a NUL byte is NUL-delimited,
/// otherwise it is line-delimited. Empty items are dropped.
pub fn split_items(output: &[u8]) -> Vec<&[u8]> {
    let separator = if output.contains(&0) { 0 } else { b'\n' };
    output
        .split(move |b| *b == separator)
        .filter(|item| !item.is_empty())
        .collect_vec()
}

pub fn parse_versions(output: &[u8]) -> Result<Vec<DateTime<Utc>>> {
    split_items(output)
        .into_iter()
        .map(|item| parse_timestamp(&String::from_utf8_lossy(item)))
        .try_collect()
}

/// Turns NUL-delimited `list-files` output into paths, preserving names with
/// newlines or non-UTF-8 bytes.
pub fn parse_file_list(output: &[u8]) -> Vec<PathBuf> {
    output
        .split(|b| *b == 0)
        .filter(|item| !item.is_empty())
        .map(|item| PathBuf::from(OsStr::from_bytes(item)))
        .collect_vec()
}

/// Parses `writes-to` output: 1-based port indices, one per line.
pub fn parse_port_indices(output: &[u8]) -> Result<Vec<usize>> {
    String::from_utf8_lossy(output)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| match line.parse::<usize>() {
            Ok(index) if index > 0 => Ok(index),
            _ => Err(Error::unexpected_output(
                "writes-to",
                format!("{line:?} is not a port number"),
            )),
        })
        .try_collect()
}

/// Parses `info-of-port` output. Empty output means there is no such port.
pub fn parse_port_info(output: &[u8]) -> Result<Option<(bool, Vec<String>)>> {
    let text = String::from_utf8_lossy(output);
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    let Some(flag) = lines.next() else {
        return Ok(None);
    };
    let written_to = match flag {
        "0" => false,
        "1" => true,
        other => {
            return Err(Error::unexpected_output(
                "info-of-port",
                format!("write flag must be 0 or 1, got {other:?}"),
            ))
        }
    };
    Ok(Some((written_to, lines.map(str::to_owned).collect_vec())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timestamp_forms() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(parse_timestamp("1709294400").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-03-01T13:00:00+01:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-03-01T13:00+01:00").unwrap(), expected);
        assert_eq!(
            parse_timestamp("1709294400,5").unwrap(),
            expected + chrono::Duration::milliseconds(500)
        );
        assert_eq!(
            parse_timestamp("1709294400,042").unwrap(),
            expected + chrono::Duration::milliseconds(42)
        );
        assert!(parse_timestamp("yesterday").is_err());
        assert!(parse_timestamp("1709294400,abc").is_err());
    }

    #[test]
    fn test_version_args() {
        let version = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(
            version_args(&version),
            ["2024-03-01T12:00:00+00:00".to_string(), "1709294400".to_string()]
        );
    }

    #[test]
    fn test_split_items_prefers_nul() {
        assert_eq!(split_items(b"a\nb\n\n"), vec![b"a".as_slice(), b"b"]);
        assert_eq!(split_items(b"a\nb\0c\0"), vec![b"a\nb".as_slice(), b"c"]);
    }

    #[test]
    fn test_parse_file_list_keeps_newlines() {
        assert_eq!(
            parse_file_list(b"dir/\0odd\nname\0"),
            vec![PathBuf::from("dir/"), PathBuf::from("odd\nname")]
        );
    }

    #[test]
    fn test_parse_port_info() {
        assert_eq!(parse_port_info(b"").unwrap(), None);
        assert_eq!(
            parse_port_info(b"1\nfile\nssh\n").unwrap(),
            Some((true, vec!["file".to_string(), "ssh".to_string()]))
        );
        assert!(parse_port_info(b"yes\nfile\n").is_err());
    }

    #[test]
    fn test_parse_port_indices() {
        assert_eq!(parse_port_indices(b"2\n3\n").unwrap(), vec![2, 3]);
        assert!(parse_port_indices(b"0\n").is_err());
    }
}
