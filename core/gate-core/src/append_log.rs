//! Line-oriented, size-capped JSON logs.
//!
//! Each record is one compact JSON object on its own line. Writers append under
//! the log's [`LockGuard`](crate::lock::LockGuard); readers never take the lock
//! and tolerate a slightly stale tail.
//!
//! # Capping
//!
//! After an append, if the file holds more than `max_lines` lines, the newest
//! `max_lines` are kept and the rest dropped from the front. The rewrite goes
//! through a temp file + rename in the same directory, so a concurrent reader
//! sees either the old file or the trimmed one. Lines are kept verbatim: fields
//! a reader does not know about survive trimming.
//!
//! # Corruption
//!
//! A line that fails to parse is skipped. One bad line never rejects the file,
//! and skipped lines are not logged (truncation races produce them routinely).

use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs_err as fs;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::{GateError, Result};
use crate::lock::{lock_path_for, with_lock, LockOptions, LockOutcome};

/// Records that carry a timestamp in seconds since the Unix epoch.
pub trait Timestamped {
    fn timestamp(&self) -> f64;
}

/// What an [`AppendLog::append`] call actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// False when the lock timed out and the append ran fail-open.
    pub locked: bool,
    /// Lines removed from the front by capping.
    pub trimmed: usize,
}

/// Handle to one append-only log file.
#[derive(Debug, Clone)]
pub struct AppendLog {
    path: PathBuf,
    lock_options: LockOptions,
    fail_open: bool,
}

impl AppendLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        AppendLog {
            path: path.into(),
            lock_options: LockOptions::default(),
            fail_open: false,
        }
    }

    pub fn with_lock_options(mut self, options: LockOptions) -> Self {
        self.lock_options = options;
        self
    }

    /// On lock timeout, append anyway and skip capping instead of failing.
    pub fn fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> PathBuf {
        lock_path_for(&self.path)
    }

    /// Appends `record` as one line and caps the file at `max_lines` lines.
    ///
    /// When the append runs fail-open the capping rewrite is skipped; rewriting
    /// without exclusion could drop another writer's line. The next locked
    /// append trims instead.
    pub fn append<R: Serialize>(&self, record: &R, max_lines: usize) -> Result<AppendOutcome> {
        let line = serde_json::to_string(record)
            .map_err(|e| GateError::json("serialize log record", e))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| GateError::io("create log directory", e))?;
        }

        with_lock(
            &self.lock_path(),
            &self.lock_options,
            self.fail_open,
            |outcome| {
                self.append_line(&line)?;
                let trimmed = match outcome {
                    LockOutcome::Held => self.trim_to(max_lines.max(1))?,
                    LockOutcome::FailedOpen => 0,
                };
                Ok(AppendOutcome {
                    locked: outcome == LockOutcome::Held,
                    trimmed,
                })
            },
        )
    }

    /// Returns records matching `predicate` whose timestamp is at least
    /// `now - within_secs`, oldest first. A missing file reads as empty.
    pub fn read_recent<R, P>(&self, mut predicate: P, within_secs: f64, now: f64) -> Result<Vec<R>>
    where
        R: DeserializeOwned + Timestamped,
        P: FnMut(&R) -> bool,
    {
        let cutoff = now - within_secs;
        Ok(self
            .read_all::<R>()?
            .into_iter()
            .filter(|record| {
                let ts = record.timestamp();
                ts.is_finite() && ts >= cutoff && predicate(record)
            })
            .collect())
    }

    /// Every parseable record in file order.
    pub fn read_all<R: DeserializeOwned>(&self) -> Result<Vec<R>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(GateError::io("read log", err)),
        };

        Ok(non_empty_lines(&bytes)
            .filter_map(|line| serde_json::from_slice::<R>(line).ok())
            .collect())
    }

    /// Number of non-empty lines, parseable or not.
    pub fn line_count(&self) -> Result<usize> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(non_empty_lines(&bytes).count()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(0),
            Err(err) => Err(GateError::io("read log", err)),
        }
    }

    fn append_line(&self, line: &str) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(|e| GateError::io("open log for append", e))?;

        // A crash mid-write can leave a torn last line; start ours on a fresh one.
        let mut payload = String::with_capacity(line.len() + 2);
        if ends_without_newline(&mut file).map_err(|e| GateError::io("inspect log tail", e))? {
            payload.push('\n');
        }
        payload.push_str(line);
        payload.push('\n');

        file.write_all(payload.as_bytes())
            .map_err(|e| GateError::io("append log record", e))
    }

    fn trim_to(&self, max_lines: usize) -> Result<usize> {
        let bytes = fs::read(&self.path).map_err(|e| GateError::io("read log for capping", e))?;
        let lines: Vec<&[u8]> = non_empty_lines(&bytes).collect();
        if lines.len() <= max_lines {
            return Ok(0);
        }

        let dropped = lines.len() - max_lines;
        let mut kept = Vec::with_capacity(bytes.len());
        for line in &lines[dropped..] {
            kept.extend_from_slice(line);
            kept.push(b'\n');
        }

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut temp_file =
            NamedTempFile::new_in(parent).map_err(|e| GateError::io("create capped log", e))?;
        temp_file
            .write_all(&kept)
            .map_err(|e| GateError::io("write capped log", e))?;
        temp_file
            .flush()
            .map_err(|e| GateError::io("flush capped log", e))?;
        temp_file
            .persist(&self.path)
            .map_err(|e| GateError::io("replace capped log", e.error))?;

        Ok(dropped)
    }
}

fn non_empty_lines(bytes: &[u8]) -> impl Iterator<Item = &[u8]> {
    bytes
        .split(|b| *b == b'\n')
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
}

fn ends_without_newline(file: &mut fs::File) -> std::io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Row {
        ts: f64,
        name: String,
    }

    impl Timestamped for Row {
        fn timestamp(&self) -> f64 {
            self.ts
        }
    }

    fn row(ts: f64, name: &str) -> Row {
        Row {
            ts,
            name: name.to_string(),
        }
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let temp = tempdir().unwrap();
        let log = AppendLog::new(temp.path().join("absent.jsonl"));
        assert!(log.read_all::<Row>().unwrap().is_empty());
        assert_eq!(log.line_count().unwrap(), 0);
    }

    #[test]
    fn appended_records_read_back_in_order() {
        let temp = tempdir().unwrap();
        let log = AppendLog::new(temp.path().join("rows.jsonl"));
        let rows: Vec<Row> = (0..5).map(|i| row(i as f64, &format!("r{i}"))).collect();

        for r in &rows {
            let outcome = log.append(r, 100).unwrap();
            assert!(outcome.locked);
            assert_eq!(outcome.trimmed, 0);
        }

        assert_eq!(log.read_all::<Row>().unwrap(), rows);
        assert!(!log.lock_path().exists());
    }

    #[test]
    fn capping_keeps_newest_records() {
        let temp = tempdir().unwrap();
        let log = AppendLog::new(temp.path().join("rows.jsonl"));

        for i in 0..7 {
            log.append(&row(i as f64, &format!("r{i}")), 4).unwrap();
        }

        let names: Vec<String> = log
            .read_all::<Row>()
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["r3", "r4", "r5", "r6"]);
        assert_eq!(log.line_count().unwrap(), 4);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("rows.jsonl");
        std::fs::write(
            &path,
            b"{\"ts\":1.0,\"name\":\"a\"}\nnot json at all\n{\"ts\":2.0,\n\xff\xfe\n{\"ts\":3.0,\"name\":\"c\"}\n",
        )
        .unwrap();

        let rows = AppendLog::new(&path).read_all::<Row>().unwrap();
        assert_eq!(rows, vec![row(1.0, "a"), row(3.0, "c")]);
    }

    #[test]
    fn read_recent_filters_by_window_and_predicate() {
        let temp = tempdir().unwrap();
        let log = AppendLog::new(temp.path().join("rows.jsonl"));
        log.append(&row(10.0, "old"), 100).unwrap();
        log.append(&row(95.0, "keep"), 100).unwrap();
        log.append(&row(96.0, "other"), 100).unwrap();
        log.append(&row(99.0, "keep"), 100).unwrap();

        let hits: Vec<Row> = log
            .read_recent(|r: &Row| r.name == "keep", 10.0, 100.0)
            .unwrap();
        assert_eq!(hits, vec![row(95.0, "keep"), row(99.0, "keep")]);

        let boundary: Vec<Row> = log.read_recent(|_: &Row| true, 5.0, 100.0).unwrap();
        assert_eq!(boundary, vec![row(95.0, "keep"), row(96.0, "other"), row(99.0, "keep")]);
    }

    #[test]
    fn torn_tail_does_not_swallow_next_record() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("rows.jsonl");
        std::fs::write(&path, "{\"ts\":1.0,\"name\":\"a\"}\n{\"ts\":2.0,\"na").unwrap();

        let log = AppendLog::new(&path);
        log.append(&row(3.0, "c"), 100).unwrap();

        assert_eq!(log.read_all::<Row>().unwrap(), vec![row(1.0, "a"), row(3.0, "c")]);
    }

    #[test]
    fn capping_preserves_unknown_fields() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("rows.jsonl");
        std::fs::write(
            &path,
            "{\"ts\":1.0,\"name\":\"a\"}\n{\"ts\":2.0,\"name\":\"b\",\"source\":\"ext\"}\n",
        )
        .unwrap();

        let log = AppendLog::new(&path);
        let outcome = log.append(&row(3.0, "c"), 2).unwrap();
        assert_eq!(outcome.trimmed, 1);

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"source\":\"ext\""));
        assert!(!content.contains("\"name\":\"a\""));
    }

    #[test]
    fn fail_open_append_skips_capping() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("rows.jsonl");
        let options = LockOptions {
            timeout: std::time::Duration::from_millis(30),
            poll_interval: std::time::Duration::from_millis(5),
            stale_age: std::time::Duration::from_secs(60),
        };
        let log = AppendLog::new(&path)
            .with_lock_options(options)
            .fail_open(true);
        log.append(&row(1.0, "a"), 1).unwrap();

        let _held = crate::lock::LockGuard::acquire(&log.lock_path(), &options).unwrap();
        let outcome = log.append(&row(2.0, "b"), 1).unwrap();

        assert!(!outcome.locked);
        assert_eq!(outcome.trimmed, 0);
        assert_eq!(log.line_count().unwrap(), 2);
    }

    #[test]
    fn strict_append_surfaces_lock_timeout() {
        let temp = tempdir().unwrap();
        let options = LockOptions {
            timeout: std::time::Duration::from_millis(30),
            poll_interval: std::time::Duration::from_millis(5),
            stale_age: std::time::Duration::from_secs(60),
        };
        let log = AppendLog::new(temp.path().join("rows.jsonl")).with_lock_options(options);
        let _held = crate::lock::LockGuard::acquire(&log.lock_path(), &options).unwrap();

        let err = log.append(&row(1.0, "a"), 10).unwrap_err();
        assert!(matches!(err, GateError::LockTimeout { .. }));
        assert_eq!(log.line_count().unwrap(), 0);
    }
}
