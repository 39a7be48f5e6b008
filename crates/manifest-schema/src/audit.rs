//! Audit log types for tracking every command launched during a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a launched command was used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandRole {
    /// Extraction command producing the record stream.
    Extraction,
    /// Tabular converter fed from the record stream.
    Converter,
    /// External sink writer fed from the record stream.
    SinkWriter,
    /// Evidence mount step.
    Mount,
    /// Evidence unmount step.
    Unmount,
    /// Standard survey recipe.
    Survey,
    /// Ad-hoc query script.
    Query,
}

/// A single audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Sequence number within the run.
    pub seq: u64,
    /// When the command was launched.
    pub started_at: DateTime<Utc>,
    /// When the command exited.
    pub completed_at: DateTime<Utc>,
    /// Duration in milliseconds.
    pub duration_ms: u64,
    /// Rendered command line.
    pub command: String,
    /// What the command was used for.
    pub role: CommandRole,
    /// Exit code, `None` when killed by a signal or never launched.
    pub exit_code: Option<i32>,
    /// Whether the command exited with status 0.
    pub success: bool,
    /// Bytes read from stdout.
    pub stdout_bytes: u64,
    /// Bytes read from stderr.
    pub stderr_bytes: u64,
    /// Launch error or trimmed stderr on failure.
    pub error: Option<String>,
}

impl AuditEntry {
    /// Create a new audit entry.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        command: String,
        role: CommandRole,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        exit_code: Option<i32>,
        stdout_bytes: u64,
        stderr_bytes: u64,
        error: Option<String>,
    ) -> Self {
        let duration = completed_at - started_at;
        let duration_ms = duration.num_milliseconds().max(0) as u64;
        let success = exit_code.map(|c| c == 0).unwrap_or(false);

        Self {
            seq: 0,
            started_at,
            completed_at,
            duration_ms,
            command,
            role,
            exit_code,
            success,
            stdout_bytes,
            stderr_bytes,
            error,
        }
    }

    /// Entry for a command that could not be launched at all.
    pub fn launch_failure(command: String, role: CommandRole, error: String) -> Self {
        let now = Utc::now();
        Self::new(command, role, now, now, None, 0, 0, Some(error))
    }
}

/// Collection of audit entries (written as JSONL).
#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    entries: Vec<AuditEntry>,
    next_seq: u64,
}

impl AuditLog {
    /// Create a new empty audit log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry to the audit log.
    pub fn add(&mut self, mut entry: AuditEntry) {
        entry.seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(entry);
    }

    /// Get all entries.
    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    /// Convert to JSONL format.
    pub fn to_jsonl(&self) -> String {
        self.entries
            .iter()
            .filter_map(|e| serde_json::to_string(e).ok())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Parse from JSONL format.
    pub fn from_jsonl(content: &str) -> Result<Self, serde_json::Error> {
        let mut log = Self::new();
        for line in content.lines() {
            if !line.trim().is_empty() {
                let entry: AuditEntry = serde_json::from_str(line)?;
                log.entries.push(entry);
            }
        }
        if let Some(last) = log.entries.last() {
            log.next_seq = last.seq + 1;
        }
        Ok(log)
    }
}
