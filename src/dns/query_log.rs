//! append-only log of answered queries
//!
//! Separate from the diagnostic log. One line is written per answered query,
//! either with the address given to the client or with a note that the
//! answer came from upstream.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

pub const DEFAULT_QUERY_LOG_PATH: &str = "./log.txt";

const REMOTE_NOTE: &str = "Not found in local. Returned from remote DNS server.";

/// What the relay answered with
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoggedAnswer {
    Address(Ipv4Addr),
    Remote,
}

pub fn format_entry(now: DateTime<Local>, domain: &str, answer: LoggedAnswer) -> String {
    let timestamp = now.format("%Y-%m-%d %H:%M:%S");

    match answer {
        LoggedAnswer::Address(addr) => format!("{}  {}  {}", timestamp, domain, addr),
        LoggedAnswer::Remote => format!("{}  {}  {}", timestamp, domain, REMOTE_NOTE),
    }
}

pub struct QueryLog {
    path: PathBuf,
    file: File,
}

impl QueryLog {
    /// Opens `path` for appending, creating it if needed
    pub fn open<P: AsRef<Path>>(path: P) -> std::io::Result<QueryLog> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;

        Ok(QueryLog {
            path: path.as_ref().to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one entry. A failed write is logged and otherwise ignored.
    pub fn record(&mut self, domain: &str, answer: LoggedAnswer) {
        let line = format_entry(Local::now(), domain, answer);

        if let Err(e) = writeln!(self.file, "{}", line) {
            log::warn!("Failed to write query log {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use chrono::TimeZone;

    #[test]
    fn test_format_entry() {
        let now = Local.with_ymd_and_hms(2021, 3, 7, 9, 5, 1).unwrap();

        assert_eq!(
            "2021-03-07 09:05:01  example.com  1.2.3.4",
            format_entry(now, "example.com", LoggedAnswer::Address("1.2.3.4".parse().unwrap()))
        );
        assert_eq!(
            "2021-03-07 09:05:01  example.com  Not found in local. Returned from remote DNS server.",
            format_entry(now, "example.com", LoggedAnswer::Remote)
        );
    }

    #[test]
    fn test_record_appends() {
        let path = std::env::temp_dir().join(format!("dnsrelay-query-log-{}.txt", std::process::id()));
        let _ = std::fs::remove_file(&path);

        {
            let mut log = QueryLog::open(&path).unwrap();
            log.record("a.com", LoggedAnswer::Address(Ipv4Addr::new(10, 0, 0, 1)));
        }
        {
            let mut log = QueryLog::open(&path).unwrap();
            log.record("b.com", LoggedAnswer::Remote);
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(2, lines.len());
        assert!(lines[0].ends_with("  a.com  10.0.0.1"));
        assert!(lines[1].ends_with("  b.com  Not found in local. Returned from remote DNS server."));

        std::fs::remove_file(&path).unwrap();
    }
}
