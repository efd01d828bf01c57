//! Durable state and artifact I/O for MIRA: the delivery ledger, tabular
//! source/sink capabilities, pre-run artifact cleanup, and the run journal.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Local;
use mira_core::{Row, Table};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mira-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Delivery ledger
// ---------------------------------------------------------------------------

const LEDGER_HEADER: &str = "key";

/// What to do when the ledger file exists but cannot be read or parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptLedgerPolicy {
    /// Treat the ledger as empty. Never blocks legitimate new sends, at the
    /// cost of possible duplicate resends after corruption.
    FailOpen,
    /// Refuse to run the owning job until the ledger is repaired.
    FailClosed,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger {path} is unreadable: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("ledger {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("ledger {path} append failed: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Append-only set of identity keys that were already delivered.
///
/// On disk this is a one-column table: a `key` header line followed by one
/// hex digest per line. Entries are never rewritten or removed; `commit` is
/// only called after the paired delivery succeeded, so a crash between
/// delivery and commit costs at most a duplicate resend on the next run.
#[derive(Debug, Clone)]
pub struct DeliveryLedger {
    path: PathBuf,
    policy: CorruptLedgerPolicy,
}

impl DeliveryLedger {
    pub fn new(path: impl Into<PathBuf>, policy: CorruptLedgerPolicy) -> Self {
        Self {
            path: path.into(),
            policy,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every persisted key. A missing file is an empty ledger, not an
    /// error; anything else unreadable falls to the configured policy.
    pub async fn load(&self) -> Result<HashSet<String>, LedgerError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(HashSet::new());
            }
            Err(err) => {
                return self.degrade(LedgerError::Unreadable {
                    path: self.path.clone(),
                    source: err,
                });
            }
        };

        let mut lines = text.lines();
        match lines.next() {
            Some(header) if header.trim() == LEDGER_HEADER => {}
            _ => {
                return self.degrade(LedgerError::Corrupt {
                    path: self.path.clone(),
                    reason: format!("missing `{LEDGER_HEADER}` header"),
                });
            }
        }

        Ok(lines
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn degrade(&self, err: LedgerError) -> Result<HashSet<String>, LedgerError> {
        match self.policy {
            CorruptLedgerPolicy::FailOpen => {
                warn!(ledger = %self.path.display(), error = %err,
                      "ledger unreadable; failing open to an empty key set");
                Ok(HashSet::new())
            }
            CorruptLedgerPolicy::FailClosed => Err(err),
        }
    }

    /// Appends the keys as new durable entries. Existing lines are never
    /// touched. The file is flushed and synced before returning so a success
    /// here means the keys survive a crash.
    pub async fn commit(&self, keys: &[String]) -> Result<(), LedgerError> {
        if keys.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| LedgerError::Write {
                    path: self.path.clone(),
                    source,
                })?;
        }

        let mut file = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .await
            .map_err(|source| LedgerError::Write {
                path: self.path.clone(),
                source,
            })?;

        let fresh = file
            .metadata()
            .await
            .map(|m| m.len() == 0)
            .unwrap_or(false);

        let mut out = String::new();
        if fresh {
            out.push_str(LEDGER_HEADER);
            out.push('\n');
        }
        for key in keys {
            out.push_str(key);
            out.push('\n');
        }

        let write = async {
            file.write_all(out.as_bytes()).await?;
            file.flush().await?;
            file.sync_all().await
        };
        write.await.map_err(|source| LedgerError::Write {
            path: self.path.clone(),
            source,
        })?;

        info!(ledger = %self.path.display(), appended = keys.len(), "ledger commit");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tabular source / sink capabilities
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source {path} is unreadable: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("source {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Capability: load the operational export as an in-memory table.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn load(&self) -> Result<Table, SourceError>;
}

/// JSON table document on disk: `{ "schema": { "columns": [...] }, "rows": [[...]] }`.
#[derive(Debug, Clone)]
pub struct JsonTableSource {
    path: PathBuf,
}

impl JsonTableSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RecordSource for JsonTableSource {
    async fn load(&self) -> Result<Table, SourceError> {
        let text = fs::read_to_string(&self.path)
            .await
            .map_err(|source| SourceError::Unreadable {
                path: self.path.clone(),
                source,
            })?;
        serde_json::from_str(&text).map_err(|source| SourceError::Malformed {
            path: self.path.clone(),
            source,
        })
    }
}

/// Capability: write one artifact holding the given columns and rows.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn write(&self, path: &Path, columns: &[String], rows: &[Row]) -> anyhow::Result<()>;
}

/// CSV artifact writer with an atomic temp-file rename, so a job that dies
/// mid-write never leaves a half-formed artifact at the published path.
#[derive(Debug, Clone, Default)]
pub struct CsvSink;

impl CsvSink {
    fn escape(cell: &str) -> String {
        if cell.contains(',') || cell.contains('"') || cell.contains('\n') {
            format!("\"{}\"", cell.replace('"', "\"\""))
        } else {
            cell.to_string()
        }
    }

    fn render(columns: &[String], rows: &[Row]) -> String {
        let mut out = String::new();
        out.push_str(
            &columns
                .iter()
                .map(|c| Self::escape(c))
                .collect::<Vec<_>>()
                .join(","),
        );
        out.push('\n');
        for row in rows {
            out.push_str(
                &row.iter()
                    .map(|v| Self::escape(&v.render()))
                    .collect::<Vec<_>>()
                    .join(","),
            );
            out.push('\n');
        }
        out
    }
}

#[async_trait]
impl RecordSink for CsvSink {
    async fn write(&self, path: &Path, columns: &[String], rows: &[Row]) -> anyhow::Result<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let body = Self::render(columns, rows);
        fs::write(&temp_path, body.as_bytes())
            .await
            .with_context(|| format!("writing temp artifact {}", temp_path.display()))?;

        match fs::rename(&temp_path, path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp artifact {} -> {}",
                        temp_path.display(),
                        path.display()
                    )
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Artifact cleanup
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: usize,
    pub missing_dirs: usize,
}

/// Removes stale output artifacts before a run so a job that failed after a
/// partial write cannot get its previous output re-attached by mistake.
#[derive(Debug, Clone)]
pub struct CleanupManager {
    directories: Vec<PathBuf>,
    extensions: Vec<String>,
}

impl CleanupManager {
    pub fn new(directories: Vec<PathBuf>, extensions: Vec<String>) -> Self {
        let extensions = extensions
            .into_iter()
            .map(|e| e.trim_start_matches('.').to_lowercase())
            .collect();
        Self {
            directories,
            extensions,
        }
    }

    fn managed(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|m| m == &e.to_lowercase()))
            .unwrap_or(false)
    }

    /// Deletes every managed-extension file in the configured directories.
    /// Missing directories are logged and skipped, never fatal.
    pub async fn sweep(&self) -> anyhow::Result<CleanupReport> {
        let mut report = CleanupReport::default();

        for dir in &self.directories {
            let mut entries = match fs::read_dir(dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    warn!(dir = %dir.display(), "cleanup directory does not exist; skipping");
                    report.missing_dirs += 1;
                    continue;
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("listing cleanup directory {}", dir.display()));
                }
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .with_context(|| format!("reading cleanup directory {}", dir.display()))?
            {
                let path = entry.path();
                if !path.is_file() || !self.managed(&path) {
                    continue;
                }
                fs::remove_file(&path)
                    .await
                    .with_context(|| format!("deleting stale artifact {}", path.display()))?;
                info!(artifact = %path.display(), "deleted stale artifact");
                report.removed += 1;
            }
        }

        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Run journal
// ---------------------------------------------------------------------------

/// Append-only daily log of gate decisions and job outcomes. Execution is
/// unattended, so this file is the operator's only record of what happened.
#[derive(Debug, Clone)]
pub struct RunJournal {
    dir: PathBuf,
}

impl RunJournal {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for_today(&self) -> PathBuf {
        self.dir
            .join(format!("mira_{}.log", Local::now().format("%Y-%m-%d")))
    }

    pub async fn record(&self, message: &str) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating journal directory {}", self.dir.display()))?;

        let path = self.path_for_today();
        let line = format!("[{}] {}\n", Local::now().format("%Y-%m-%d %H:%M:%S"), message);

        let mut file = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .await
            .with_context(|| format!("opening journal {}", path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("appending to journal {}", path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing journal {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mira_core::FieldValue;
    use tempfile::tempdir;

    #[test]
    fn digest_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn missing_ledger_is_an_empty_set() {
        let dir = tempdir().expect("tempdir");
        let ledger = DeliveryLedger::new(
            dir.path().join("state/sent_keys.csv"),
            CorruptLedgerPolicy::FailOpen,
        );
        assert!(ledger.load().await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn commits_accumulate_and_never_rewrite() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("sent_keys.csv");
        let ledger = DeliveryLedger::new(&path, CorruptLedgerPolicy::FailOpen);

        ledger
            .commit(&["aaa".into(), "bbb".into()])
            .await
            .expect("first commit");
        let after_first = std::fs::read_to_string(&path).expect("read");
        ledger.commit(&["ccc".into()]).await.expect("second commit");
        let after_second = std::fs::read_to_string(&path).expect("read");

        // Append-only: the earlier content survives byte for byte.
        assert!(after_second.starts_with(&after_first));
        assert_eq!(after_second, "key\naaa\nbbb\nccc\n");

        let keys = ledger.load().await.expect("load");
        assert_eq!(keys.len(), 3);
        assert!(keys.contains("aaa") && keys.contains("bbb") && keys.contains("ccc"));
    }

    #[tokio::test]
    async fn empty_commit_is_a_no_op() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("sent_keys.csv");
        let ledger = DeliveryLedger::new(&path, CorruptLedgerPolicy::FailOpen);
        ledger.commit(&[]).await.expect("commit");
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn corrupt_ledger_fails_open_or_closed_per_policy() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("sent_keys.csv");
        std::fs::write(&path, "not-a-header\nzzz\n").expect("write");

        let open = DeliveryLedger::new(&path, CorruptLedgerPolicy::FailOpen);
        assert!(open.load().await.expect("fail-open load").is_empty());

        let closed = DeliveryLedger::new(&path, CorruptLedgerPolicy::FailClosed);
        assert!(matches!(
            closed.load().await,
            Err(LedgerError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn json_source_round_trips_a_table() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("export.json");
        std::fs::write(
            &path,
            r#"{
                "schema": { "columns": ["Patient Name", "Total"] },
                "rows": [["Asha", 1], ["Ravi", 2]]
            }"#,
        )
        .expect("write");

        let table = JsonTableSource::new(&path).load().await.expect("load");
        assert_eq!(table.schema.columns, vec!["Patient Name", "Total"]);
        assert_eq!(table.rows.len(), 2);
    }

    #[tokio::test]
    async fn missing_source_reports_unreadable() {
        let dir = tempdir().expect("tempdir");
        let source = JsonTableSource::new(dir.path().join("absent.json"));
        assert!(matches!(
            source.load().await,
            Err(SourceError::Unreadable { .. })
        ));
    }

    #[tokio::test]
    async fn csv_sink_escapes_and_publishes_atomically() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out/report.csv");
        let columns = vec!["Name".to_string(), "Note".to_string()];
        let rows = vec![vec![
            FieldValue::Text("Rao, Asha".into()),
            FieldValue::Text("said \"ok\"".into()),
        ]];

        CsvSink.write(&path, &columns, &rows).await.expect("write");

        let body = std::fs::read_to_string(&path).expect("read");
        assert_eq!(body, "Name,Note\n\"Rao, Asha\",\"said \"\"ok\"\"\"\n");

        // No stray temp files left behind.
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn cleanup_only_touches_managed_extensions() {
        let dir = tempdir().expect("tempdir");
        let out = dir.path().join("output");
        std::fs::create_dir_all(&out).expect("mkdir");
        std::fs::write(out.join("old_report.csv"), "x").expect("write");
        std::fs::write(out.join("old_report.XLSX"), "x").expect("write");
        std::fs::write(out.join("notes.txt"), "keep me").expect("write");

        let manager = CleanupManager::new(
            vec![out.clone(), dir.path().join("never_created")],
            vec!["csv".into(), ".xlsx".into()],
        );
        let report = manager.sweep().await.expect("sweep");

        assert_eq!(report.removed, 2);
        assert_eq!(report.missing_dirs, 1);
        assert!(out.join("notes.txt").exists());
        assert!(!out.join("old_report.csv").exists());
        assert!(!out.join("old_report.XLSX").exists());
    }

    #[tokio::test]
    async fn journal_appends_timestamped_lines() {
        let dir = tempdir().expect("tempdir");
        let journal = RunJournal::new(dir.path().join("logs"));
        journal.record("gate ready").await.expect("first");
        journal.record("job ok").await.expect("second");

        let body = std::fs::read_to_string(journal.path_for_today()).expect("read");
        let lines: Vec<_> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("gate ready"));
        assert!(lines[1].ends_with("job ok"));
        assert!(lines[0].starts_with('['));
    }
}
