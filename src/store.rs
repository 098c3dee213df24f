//! On-disk state store: three JSON tables plus two newline-delimited
//! journals.
//!
//! Readers never lock: they read whatever is currently on disk and must
//! tolerate the file being replaced underneath them by an atomic rename.
//! Writers always go through [`crate::mutator::AtomicMutator`], which uses
//! the write helpers here.

use crate::error::SwarmError;
use crate::model::{Agent, CoordinationEvent, TelemetrySpan, WorkItem};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Identifies one of the three mutable tables, used to pick a lock scope
/// and a file path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Agents,
    WorkClaims,
    CoordinationLog,
}

impl Table {
    pub fn file_name(&self) -> &'static str {
        match self {
            Table::Agents => "agents.json",
            Table::WorkClaims => "work_claims.json",
            Table::CoordinationLog => "coordination_log.json",
        }
    }

    pub fn lock_file_name(&self) -> &'static str {
        match self {
            Table::Agents => "agents.lock",
            Table::WorkClaims => "work_claims.lock",
            Table::CoordinationLog => "coordination_log.lock",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
    crash_before_rename: Arc<AtomicBool>,
}

impl StateStore {
    /// Open (creating if needed) the state directory at `root`, including
    /// the `archive/` subdirectory and empty table/journal files.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, SwarmError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        fs::create_dir_all(root.join("archive"))?;

        let store = Self { root, crash_before_rename: Arc::new(AtomicBool::new(false)) };
        for table in [Table::Agents, Table::WorkClaims, Table::CoordinationLog] {
            if !store.table_path(table).exists() {
                store.write_table_raw(table, "[]")?;
            }
        }
        for journal in [store.telemetry_journal_path(), store.fast_path_log_path()] {
            OpenOptions::new().create(true).append(true).open(journal)?;
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn table_path(&self, table: Table) -> PathBuf {
        self.root.join(table.file_name())
    }

    pub fn lock_path(&self, table: Table) -> PathBuf {
        self.root.join(table.lock_file_name())
    }

    pub fn telemetry_journal_path(&self) -> PathBuf {
        self.root.join("telemetry_spans.jsonl")
    }

    pub fn fast_path_log_path(&self) -> PathBuf {
        self.root.join("fast_path_claims.jsonl")
    }

    pub fn health_report_path(&self) -> PathBuf {
        self.root.join("system_health_report.json")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join("archive")
    }

    // -- typed table reads --------------------------------------------

    pub fn read_agents(&self) -> Result<Vec<Agent>, SwarmError> {
        self.read_table(Table::Agents)
    }

    pub fn read_work_claims(&self) -> Result<Vec<WorkItem>, SwarmError> {
        self.read_table(Table::WorkClaims)
    }

    pub fn read_coordination_log(&self) -> Result<Vec<CoordinationEvent>, SwarmError> {
        self.read_table(Table::CoordinationLog)
    }

    /// Generic typed read of any table, used by the mutator's
    /// read-modify-write cycle.
    pub fn read_table_typed<T: DeserializeOwned>(&self, table: Table) -> Result<Vec<T>, SwarmError> {
        self.read_table(table)
    }

    fn read_table<T: DeserializeOwned>(&self, table: Table) -> Result<Vec<T>, SwarmError> {
        let path = self.table_path(table);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&contents).map_err(|e| SwarmError::Corrupt {
            table: table.file_name().to_string(),
            message: e.to_string(),
        })
    }

    /// Read the raw bytes of a table snapshot, for the mutator's
    /// compare-and-swap fallback.
    pub fn read_table_raw(&self, table: Table) -> Result<String, SwarmError> {
        match fs::read_to_string(self.table_path(table)) {
            Ok(c) => Ok(c),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok("[]".to_string()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write `records` to `table` via write-to-temp + atomic rename. The
    /// previous snapshot remains fully readable until the rename completes.
    pub fn write_table<T: Serialize>(&self, table: Table, records: &[T]) -> Result<(), SwarmError> {
        let json = serde_json::to_string_pretty(records)?;
        self.write_table_raw(table, &json)
    }

    fn write_table_raw(&self, table: Table, json: &str) -> Result<(), SwarmError> {
        let target = self.table_path(table);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        tmp.write_all(json.as_bytes())?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        if self.crash_before_rename.swap(false, Ordering::SeqCst) {
            return Err(SwarmError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "simulated crash before rename (fault injected via arm_crash_before_next_rename)",
            )));
        }
        tmp.persist(&target).map_err(|e| e.error)?;
        Ok(())
    }

    /// Test-only fault injection: the next call to [`Self::write_table`]
    /// (on this handle or any clone sharing its `Arc`) durably flushes its
    /// temp file but returns an error instead of renaming it into place,
    /// simulating a crash between write and commit. Consumed after firing
    /// once. Used to exercise crash-consistency: the prior snapshot must
    /// remain intact and readable after the simulated crash.
    pub fn arm_crash_before_next_rename(&self) {
        self.crash_before_rename.store(true, Ordering::SeqCst);
    }

    // -- journals -------------------------------------------------------

    /// Append one JSON line to the telemetry journal. Tolerant of a
    /// previously half-written trailing line: the caller's append truncates
    /// it away before writing the new record.
    pub fn append_telemetry_span(&self, span: &TelemetrySpan) -> Result<(), SwarmError> {
        append_jsonl(&self.telemetry_journal_path(), span)
    }

    pub fn read_telemetry_spans(&self) -> Result<Vec<TelemetrySpan>, SwarmError> {
        read_jsonl(&self.telemetry_journal_path())
    }

    pub fn append_fast_path_record(&self, line: &str) -> Result<(), SwarmError> {
        truncate_trailing_malformed_line(&self.fast_path_log_path())?;
        let mut f = OpenOptions::new().create(true).append(true).open(self.fast_path_log_path())?;
        writeln!(f, "{line}")?;
        Ok(())
    }

    pub fn read_fast_path_lines(&self) -> Result<Vec<String>, SwarmError> {
        let path = self.fast_path_log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&path)?;
        let reader = BufReader::new(file);
        let mut lines = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if serde_json::from_str::<serde_json::Value>(&line).is_ok() {
                lines.push(line);
            }
            // A malformed trailing line (half-written at crash time) is
            // silently dropped; it will be truncated away on the next
            // append.
        }
        Ok(lines)
    }

    /// Replace the fast-path log with `remaining` lines, used by the
    /// compactor after a successful replay.
    pub fn rewrite_fast_path_log(&self, remaining: &[String]) -> Result<(), SwarmError> {
        let target = self.fast_path_log_path();
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        for line in remaining {
            writeln!(tmp, "{line}")?;
        }
        tmp.flush()?;
        tmp.persist(&target).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn write_health_report<T: Serialize>(&self, report: &T) -> Result<(), SwarmError> {
        let json = serde_json::to_string_pretty(report)?;
        let target = self.health_report_path();
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        tmp.write_all(json.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&target).map_err(|e| e.error)?;
        Ok(())
    }
}

fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> Result<(), SwarmError> {
    truncate_trailing_malformed_line(path)?;
    let line = serde_json::to_string(record)?;
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(f, "{line}")?;
    Ok(())
}

fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, SwarmError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(record) = serde_json::from_str(&line) {
            out.push(record);
        }
        // Malformed trailing line: dropped, same policy as fast-path reads.
    }
    Ok(out)
}

/// If the journal's last line fails to parse as JSON (a half-written
/// append interrupted by a crash), truncate it away so the next append
/// starts clean. A fully-written malformed line in the *middle* of the
/// file is left alone — that would indicate corruption beyond what this
/// append-time recovery is meant to handle.
fn truncate_trailing_malformed_line(path: &Path) -> Result<(), SwarmError> {
    if !path.exists() {
        return Ok(());
    }
    let contents = fs::read_to_string(path)?;
    if contents.is_empty() || contents.ends_with('\n') {
        return Ok(());
    }
    let last_newline = contents.rfind('\n').map(|i| i + 1).unwrap_or(0);
    let trimmed = &contents[..last_newline];
    fs::write(path, trimmed)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgentStatus, Priority, WorkStatus};
    use std::collections::BTreeSet;

    fn sample_agent() -> Agent {
        Agent {
            agent_id: "agent_1".to_string(),
            team: "core".to_string(),
            specialization: "integration".to_string(),
            capacity: 100,
            max_concurrent_work: 3,
            status: AgentStatus::Active,
            last_heartbeat_ns: 1,
            capabilities: BTreeSet::new(),
        }
    }

    #[test]
    fn round_trips_table_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        store.write_table(Table::Agents, &[sample_agent()]).unwrap();
        let agents = store.read_agents().unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].agent_id, "agent_1");
    }

    #[test]
    fn empty_table_reads_as_empty_vec() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        assert!(store.read_work_claims().unwrap().is_empty());
    }

    #[test]
    fn corrupt_table_surfaces_corrupt_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        fs::write(store.table_path(Table::Agents), b"not json").unwrap();
        let err = store.read_agents().unwrap_err();
        assert!(matches!(err, SwarmError::Corrupt { .. }));
    }

    #[test]
    fn telemetry_journal_truncates_half_written_trailing_line() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        fs::write(store.telemetry_journal_path(), b"{\"trace_id\":\"abc\"").unwrap();

        let span = TelemetrySpan {
            trace_id: "t1".into(),
            span_id: "s1".into(),
            parent_span_id: None,
            operation_name: "coordination.claim".into(),
            start_time_ns: 1,
            duration_ns: 1,
            status: crate::model::SpanStatus::Ok,
            attributes: Default::default(),
            service: crate::model::ServiceInfo { name: "swarmsh".into(), version: "0".into() },
        };
        store.append_telemetry_span(&span).unwrap();

        let spans = store.read_telemetry_spans().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].trace_id, "t1");
    }

    #[test]
    fn unknown_priority_parses_as_usage_error() {
        use std::str::FromStr;
        assert!(Priority::from_str("urgent").is_err());
        assert!(WorkStatus::Pending.is_terminal() == false);
    }
}
