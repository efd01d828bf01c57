//! Core domain model for MIRA: tabular records, job definitions, and the
//! filter/identity configuration consumed by the selection engine.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mira-core";

/// A single scalar cell in a tabular record.
///
/// Untagged so that JSON table documents read naturally: numbers become
/// `Number`, RFC 3339 strings become `DateTime`, everything else textual
/// becomes `Text`, and `null` becomes `Empty`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    DateTime(DateTime<Utc>),
    Text(String),
    Empty,
}

impl FieldValue {
    /// Textual rendering used for canonicalization and artifact output.
    /// `Empty` renders as the empty string; whole numbers drop the `.0`.
    pub fn render(&self) -> String {
        match self {
            FieldValue::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    format!("{n}")
                }
            }
            FieldValue::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
            FieldValue::Text(s) => s.clone(),
            FieldValue::Empty => String::new(),
        }
    }

    /// Calendar-date view of the cell, for date-window predicates.
    ///
    /// Native date-times use their UTC date; textual cells are tried against
    /// the serializations seen in real exports. Anything else is `None`, which
    /// the selection engine treats as "does not match", never as an error.
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            FieldValue::DateTime(dt) => Some(dt.date_naive()),
            FieldValue::Text(s) => parse_text_date(s.trim()),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Empty => true,
            FieldValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }
}

fn parse_text_date(s: &str) -> Option<NaiveDate> {
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.date_naive());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%d/%m/%Y %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.date());
        }
    }
    for fmt in ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
    }
    None
}

/// Ordered column names of a tabular export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub columns: Vec<String>,
}

impl Schema {
    pub fn new(columns: Vec<String>) -> Self {
        Self { columns }
    }

    /// Case-insensitive, whitespace-trimmed column lookup. Exports rename and
    /// re-pad headers between refreshes; resolution happens once per job, not
    /// per row.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        let wanted = name.trim().to_lowercase();
        self.columns
            .iter()
            .position(|c| c.trim().to_lowercase() == wanted)
    }
}

/// One row of field values, positionally aligned with a [`Schema`].
pub type Row = Vec<FieldValue>;

/// An in-memory tabular record collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub schema: Schema,
    pub rows: Vec<Row>,
}

impl Table {
    pub fn new(schema: Schema, rows: Vec<Row>) -> Self {
        Self { schema, rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Inclusive calendar window relative to the run date, counted in days back.
///
/// `{ from_days_back: 15, to_days_back: 1 }` is "the last 15 days ending
/// yesterday"; `{ 1, 0 }` is "yesterday and today"; `{ 1, 1 }` is "yesterday
/// only".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub from_days_back: i64,
    pub to_days_back: i64,
}

impl DateWindow {
    pub fn resolve(&self, run_date: NaiveDate) -> (NaiveDate, NaiveDate) {
        (
            run_date - chrono::Duration::days(self.from_days_back),
            run_date - chrono::Duration::days(self.to_days_back),
        )
    }

    pub fn contains(&self, date: NaiveDate, run_date: NaiveDate) -> bool {
        let (start, end) = self.resolve(run_date);
        date >= start && date <= end
    }
}

/// Comparison applied by one filter predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    /// Case-insensitive, trimmed equality against a fixed value.
    Equals { value: String },
    /// Case-insensitive, trimmed membership in a fixed set.
    OneOf { values: Vec<String> },
    /// Cell parses to a calendar date inside the window.
    DateWithin { window: DateWindow },
}

/// One field predicate. Predicates on a job are an ordered conjunction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub field: String,
    /// Required predicates abort the job when the column is missing from the
    /// schema; optional ones are silently skipped (soft filter).
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub comparison: Comparison,
}

fn default_required() -> bool {
    true
}

/// Whether a job tracks per-identity delivery state across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Filter, write, deliver. Every run sends the full matching set.
    Snapshot,
    /// Filter, then deliver only identities absent from the delivery ledger.
    Incremental,
}

/// Trailing synthetic row appended to an artifact: a label in one column and
/// the matched-row count in another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub label_field: String,
    pub label: String,
    pub count_field: String,
}

/// Static configuration for one extraction job. Loaded from the job registry;
/// never mutated at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    pub kind: JobKind,
    #[serde(default)]
    pub predicates: Vec<Predicate>,
    /// Fields whose normalized values define "the same real-world event" for
    /// incremental jobs. Order matters: it fixes the canonical signature.
    #[serde(default)]
    pub identity_fields: Vec<String>,
    pub output_fields: Vec<String>,
    #[serde(default)]
    pub summary: Option<SummaryRow>,
    /// Artifact file name, relative to the run's artifact directory.
    pub artifact: String,
    pub subject: String,
    pub body: String,
    pub recipients: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
}

/// Per-run identifiers threaded through spans, journals, and summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunContext {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
}

impl RunContext {
    pub fn for_today() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            run_date: chrono::Local::now().date_naive(),
        }
    }
}
