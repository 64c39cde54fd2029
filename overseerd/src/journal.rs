//! Per-execution log journal.
//!
//! Two sinks fed from one strictly increasing sequence: a bounded in-memory
//! ring for live tailing and an append-only line-delimited JSON file at
//! `<managed_root>/.logs/<execution_id>.jsonl` for durability and replay.
//! The file is fsynced once, at terminal exit.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use overseer_common::envelope::{LogPayload, LogRecord, LogStream};
use overseer_common::error::{RunnerError, RunnerResult};

pub const LOGS_DIR: &str = ".logs";

struct Ring {
    records: VecDeque<LogRecord>,
    bytes: usize,
    capacity_bytes: usize,
}

impl Ring {
    fn push(&mut self, record: LogRecord) {
        self.bytes += record.payload.len();
        self.records.push_back(record);
        while self.bytes > self.capacity_bytes {
            match self.records.pop_front() {
                Some(old) => self.bytes -= old.payload.len(),
                None => break,
            }
        }
    }
}

pub struct ExecutionJournal {
    execution_id: Uuid,
    path: PathBuf,
    file: Mutex<File>,
    ring: Mutex<Ring>,
    seq: AtomicU64,
}

impl ExecutionJournal {
    /// Open (or create) the journal for one execution.
    pub fn open(
        managed_root: &Path,
        execution_id: Uuid,
        ring_capacity_bytes: usize,
    ) -> RunnerResult<Self> {
        let dir = managed_root.join(LOGS_DIR);
        std::fs::create_dir_all(&dir)
            .map_err(|e| RunnerError::io(format!("create {}", dir.display()), e))?;
        let path = dir.join(format!("{execution_id}.jsonl"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| RunnerError::io(format!("open {}", path.display()), e))?;

        Ok(Self {
            execution_id,
            path,
            file: Mutex::new(file),
            ring: Mutex::new(Ring {
                records: VecDeque::new(),
                bytes: 0,
                capacity_bytes: ring_capacity_bytes,
            }),
            seq: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a byte (line) record, assigning the next sequence number.
    pub fn append_bytes(&self, stream: LogStream, line: String) -> RunnerResult<LogRecord> {
        self.append(
            stream,
            LogPayload::Bytes {
                bytes: line,
            },
        )
    }

    /// Append a structured system record (dispatch audit, exit report).
    pub fn append_system(&self, json_patch: Value) -> RunnerResult<LogRecord> {
        self.append(LogStream::System, LogPayload::JsonPatch { json_patch })
    }

    fn append(&self, stream: LogStream, payload: LogPayload) -> RunnerResult<LogRecord> {
        let record = LogRecord {
            execution_id: self.execution_id,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            stream,
            ts: Utc::now(),
            payload,
        };

        let line = serde_json::to_string(&record).map_err(|e| RunnerError::Fatal {
            context: format!("serialise log record: {e}"),
        })? + "\n";
        {
            let mut file = self.file.lock().expect("journal file lock");
            file.write_all(line.as_bytes())
                .map_err(|e| RunnerError::io(format!("append {}", self.path.display()), e))?;
        }
        self.ring.lock().expect("journal ring lock").push(record.clone());
        Ok(record)
    }

    /// Records still held by the in-memory ring, oldest first.
    pub fn recent(&self) -> Vec<LogRecord> {
        self.ring
            .lock()
            .expect("journal ring lock")
            .records
            .iter()
            .cloned()
            .collect()
    }

    /// Flush to stable storage; called once at terminal exit.
    pub fn finalize(&self) -> RunnerResult<()> {
        let file = self.file.lock().expect("journal file lock");
        file.sync_all()
            .map_err(|e| RunnerError::io(format!("fsync {}", self.path.display()), e))
    }
}

/// Replay a journal file into records, verifying the sequence is gap-free.
pub fn replay(path: &Path) -> RunnerResult<Vec<LogRecord>> {
    use std::io::{BufRead, BufReader};

    let file =
        File::open(path).map_err(|e| RunnerError::io(format!("open {}", path.display()), e))?;
    let reader = BufReader::new(file);

    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|e| RunnerError::io(format!("read {}", path.display()), e))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: LogRecord = serde_json::from_str(&line).map_err(|e| RunnerError::Fatal {
            context: format!("corrupt journal line in {}: {e}", path.display()),
        })?;
        if record.seq != records.len() as u64 {
            return Err(RunnerError::Fatal {
                context: format!(
                    "journal {} has a sequence gap: expected {}, found {}",
                    path.display(),
                    records.len(),
                    record.seq
                ),
            });
        }
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sequence_is_strictly_increasing_and_replayable() {
        let tmp = TempDir::new().unwrap();
        let id = Uuid::new_v4();
        let journal = ExecutionJournal::open(tmp.path(), id, 64 * 1024).unwrap();

        journal
            .append_bytes(LogStream::Stdout, "line one\n".into())
            .unwrap();
        journal
            .append_bytes(LogStream::Stderr, "line two\n".into())
            .unwrap();
        journal
            .append_system(serde_json::json!({"event": "exit", "code": 0}))
            .unwrap();
        journal.finalize().unwrap();

        let records = replay(journal.path()).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].seq, 0);
        assert_eq!(records[2].seq, 2);
        assert_eq!(records[1].stream, LogStream::Stderr);
    }

    #[test]
    fn ring_is_bounded_by_bytes() {
        let tmp = TempDir::new().unwrap();
        let journal = ExecutionJournal::open(tmp.path(), Uuid::new_v4(), 64).unwrap();

        for i in 0..16 {
            journal
                .append_bytes(LogStream::Stdout, format!("0123456789 line {i}\n"))
                .unwrap();
        }
        let recent = journal.recent();
        assert!(recent.len() < 16, "old records must be evicted");
        // But the file keeps everything.
        let all = replay(journal.path()).unwrap();
        assert_eq!(all.len(), 16);
    }

    #[test]
    fn gap_detection_on_replay() {
        let tmp = TempDir::new().unwrap();
        let id = Uuid::new_v4();
        let journal = ExecutionJournal::open(tmp.path(), id, 1024).unwrap();
        journal
            .append_bytes(LogStream::Stdout, "a\n".into())
            .unwrap();
        let path = journal.path().to_path_buf();
        drop(journal);

        // Append a record with a gapped sequence.
        let forged = LogRecord {
            execution_id: id,
            seq: 5,
            stream: LogStream::Stdout,
            ts: Utc::now(),
            payload: LogPayload::Bytes { bytes: "z\n".into() },
        };
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{}", serde_json::to_string(&forged).unwrap()).unwrap();

        assert!(replay(&path).is_err());
    }
}
