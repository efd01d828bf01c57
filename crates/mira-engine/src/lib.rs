//! Row selection and incremental delivery: schema resolution, predicate
//! filtering, record canonicalization, identity digests, unsent-delta
//! computation, report assembly, and the outbound delivery seam.

use std::collections::HashSet;
use std::path::PathBuf;

use chrono::NaiveDate;
use mira_core::{Comparison, FieldValue, JobDefinition, JobKind, Row, Schema, Table};
use thiserror::Error;
use tracing::info;

pub const CRATE_NAME: &str = "mira-engine";

/// Joins canonical signature fragments. U+001F never occurs in business data,
/// unlike `|`, which can show up in free-text cells.
const SIGNATURE_SEPARATOR: char = '\u{1f}';

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("required column `{0}` is missing from the source schema")]
    MissingColumn(String),
}

// ---------------------------------------------------------------------------
// Schema resolution
// ---------------------------------------------------------------------------

/// Column indexes for one job against one concrete schema, resolved once and
/// reused for every row. Predicate slots hold `None` when an optional
/// predicate's column is absent (soft filter).
#[derive(Debug, Clone)]
pub struct ResolvedJob {
    predicate_columns: Vec<Option<usize>>,
    identity_columns: Vec<usize>,
    output_columns: Vec<usize>,
    output_names: Vec<String>,
}

impl ResolvedJob {
    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }
}

/// Maps every field the job names onto the schema. Required predicate fields
/// and (for incremental jobs) identity fields must resolve or the job fails
/// fast; output fields are best-effort, matching what the export provides.
pub fn resolve_job(schema: &Schema, job: &JobDefinition) -> Result<ResolvedJob, EngineError> {
    let mut predicate_columns = Vec::with_capacity(job.predicates.len());
    for predicate in &job.predicates {
        match schema.index_of(&predicate.field) {
            Some(idx) => predicate_columns.push(Some(idx)),
            None if predicate.required => {
                return Err(EngineError::MissingColumn(predicate.field.clone()));
            }
            None => predicate_columns.push(None),
        }
    }

    let mut identity_columns = Vec::new();
    if job.kind == JobKind::Incremental {
        for field in &job.identity_fields {
            let idx = schema
                .index_of(field)
                .ok_or_else(|| EngineError::MissingColumn(field.clone()))?;
            identity_columns.push(idx);
        }
    }

    let mut output_columns = Vec::new();
    let mut output_names = Vec::new();
    for field in &job.output_fields {
        if let Some(idx) = schema.index_of(field) {
            output_columns.push(idx);
            output_names.push(schema.columns[idx].trim().to_string());
        }
    }

    Ok(ResolvedJob {
        predicate_columns,
        identity_columns,
        output_columns,
        output_names,
    })
}

// ---------------------------------------------------------------------------
// Row selection
// ---------------------------------------------------------------------------

fn normalize(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn predicate_matches(
    cell: &FieldValue,
    comparison: &Comparison,
    run_date: NaiveDate,
) -> bool {
    match comparison {
        Comparison::Equals { value } => normalize(&cell.render()) == normalize(value),
        Comparison::OneOf { values } => {
            let cell = normalize(&cell.render());
            values.iter().any(|v| normalize(v) == cell)
        }
        Comparison::DateWithin { window } => cell
            .as_date()
            .map(|d| window.contains(d, run_date))
            .unwrap_or(false),
    }
}

/// Applies the job's predicate conjunction and collapses rows that are exact
/// duplicates across the output fields (first occurrence wins). Returns row
/// indices into the table, in original order.
pub fn select_rows(
    table: &Table,
    job: &JobDefinition,
    resolved: &ResolvedJob,
    run_date: NaiveDate,
) -> Vec<usize> {
    let mut seen_outputs: HashSet<Vec<String>> = HashSet::new();
    let mut selected = Vec::new();

    'rows: for (idx, row) in table.rows.iter().enumerate() {
        for (predicate, column) in job.predicates.iter().zip(&resolved.predicate_columns) {
            let Some(column) = column else { continue };
            let cell = row.get(*column).unwrap_or(&FieldValue::Empty);
            if !predicate_matches(cell, &predicate.comparison, run_date) {
                continue 'rows;
            }
        }

        let projection: Vec<String> = resolved
            .output_columns
            .iter()
            .map(|c| row.get(*c).unwrap_or(&FieldValue::Empty).render())
            .collect();
        if seen_outputs.insert(projection) {
            selected.push(idx);
        }
    }

    selected
}

// ---------------------------------------------------------------------------
// Canonical identity
// ---------------------------------------------------------------------------

/// Order-stable textual signature over the identity fields: each value
/// trimmed, inner whitespace collapsed, lowercased, nulls as empty strings,
/// joined with the reserved separator.
pub fn canonical_signature(row: &Row, resolved: &ResolvedJob) -> String {
    let mut parts = Vec::with_capacity(resolved.identity_columns.len());
    for column in &resolved.identity_columns {
        let cell = row.get(*column).unwrap_or(&FieldValue::Empty);
        parts.push(normalize(&cell.render()));
    }
    parts.join(&SIGNATURE_SEPARATOR.to_string())
}

/// Fixed-length idempotency key for a canonical signature.
pub fn identity_key(signature: &str) -> String {
    mira_storage::sha256_hex(signature.as_bytes())
}

// ---------------------------------------------------------------------------
// Incremental delta
// ---------------------------------------------------------------------------

/// The "new since last successful send" subset of a selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    /// Row indices into the source table, original order, deduplicated by
    /// identity key (first occurrence wins).
    pub indices: Vec<usize>,
    /// Identity keys paired with `indices`; committed to the ledger only
    /// after the delivery succeeds.
    pub keys: Vec<String>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Partitions the selected rows against the ledger key set. Rows whose key is
/// already in the ledger are dropped silently; re-running with an unchanged
/// ledger and source yields the same delta.
pub fn compute_delta(
    table: &Table,
    resolved: &ResolvedJob,
    selected: &[usize],
    ledger_keys: &HashSet<String>,
) -> Delta {
    let mut seen: HashSet<String> = HashSet::new();
    let mut indices = Vec::new();
    let mut keys = Vec::new();

    for &idx in selected {
        let signature = canonical_signature(&table.rows[idx], resolved);
        let key = identity_key(&signature);
        if ledger_keys.contains(&key) || !seen.insert(key.clone()) {
            continue;
        }
        indices.push(idx);
        keys.push(key);
    }

    Delta { indices, keys }
}

// ---------------------------------------------------------------------------
// Report assembly
// ---------------------------------------------------------------------------

/// Output projection of the surviving rows, ready for the record sink.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl Report {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Projects rows onto the resolved output fields and, when the job configures
/// one and both of its fields made it into the projection, appends the
/// synthetic summary row.
pub fn build_report(
    table: &Table,
    job: &JobDefinition,
    resolved: &ResolvedJob,
    indices: &[usize],
) -> Report {
    let mut rows: Vec<Row> = indices
        .iter()
        .map(|&idx| {
            resolved
                .output_columns
                .iter()
                .map(|&c| table.rows[idx].get(c).cloned().unwrap_or(FieldValue::Empty))
                .collect()
        })
        .collect();

    if let Some(summary) = &job.summary {
        let label_idx = output_position(resolved, &summary.label_field);
        let count_idx = output_position(resolved, &summary.count_field);
        if let (Some(label_idx), Some(count_idx)) = (label_idx, count_idx) {
            if !rows.is_empty() {
                let mut summary_row: Row =
                    vec![FieldValue::Empty; resolved.output_names.len()];
                summary_row[label_idx] = FieldValue::Text(summary.label.clone());
                summary_row[count_idx] = FieldValue::Number(indices.len() as f64);
                rows.push(summary_row);
            }
        }
    }

    Report {
        columns: resolved.output_names.clone(),
        rows,
    }
}

fn output_position(resolved: &ResolvedJob, field: &str) -> Option<usize> {
    let wanted = field.trim().to_lowercase();
    resolved
        .output_names
        .iter()
        .position(|name| name.to_lowercase() == wanted)
}

/// Expands `{run_date}` and `{yesterday}` in a subject template and, for
/// incremental sends, appends the new-row count.
pub fn render_subject(template: &str, run_date: NaiveDate, new_rows: Option<usize>) -> String {
    let yesterday = run_date - chrono::Duration::days(1);
    let mut subject = template
        .replace("{run_date}", &run_date.format("%d/%m/%Y").to_string())
        .replace("{yesterday}", &yesterday.format("%d/%m/%Y").to_string());
    if let Some(count) = new_rows {
        subject.push_str(&format!(" | New rows: {count}"));
    }
    subject
}

// ---------------------------------------------------------------------------
// Delivery capability
// ---------------------------------------------------------------------------

/// One outbound send: message plus artifact attachments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub recipients: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<PathBuf>,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Capability: hand an artifact and message to the recipient list. The
/// transport itself lives outside the core; implementations report failure
/// and the caller skips the ledger commit so the rows stay pending.
#[async_trait::async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, message: &OutboundMessage) -> Result<(), DeliveryError>;
}

/// Default delivery: records the send in the log and succeeds. Stands in for
/// the mail transport in local runs and tests.
#[derive(Debug, Clone, Default)]
pub struct JournalingDelivery;

#[async_trait::async_trait]
impl Delivery for JournalingDelivery {
    async fn deliver(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        info!(
            recipients = message.recipients.len(),
            cc = message.cc.len(),
            attachments = message.attachments.len(),
            subject = %message.subject,
            "outbound delivery (journaled)"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mira_core::{Comparison, DateWindow, JobKind, Predicate, Schema, SummaryRow};

    fn text(s: &str) -> FieldValue {
        FieldValue::Text(s.into())
    }

    fn appointments_table() -> Table {
        let schema = Schema::new(vec![
            "Patient Name".into(),
            "Appt. Status".into(),
            "Appt. Payment Status".into(),
            "Hospital Name".into(),
            "Appointment Date".into(),
        ]);
        let rows = vec![
            vec![
                text("Asha Rao"),
                text("Cancelled"),
                text("Paid"),
                text("A"),
                text("2026-03-15"),
            ],
            vec![
                text("Ravi Iyer"),
                text("Completed"),
                text("Paid"),
                text("A"),
                text("2026-03-15"),
            ],
            vec![
                text("Meena Nair"),
                text("Cancelled"),
                text("Unpaid"),
                text("A"),
                text("2026-03-15"),
            ],
        ];
        Table::new(schema, rows)
    }

    fn base_job(kind: JobKind) -> JobDefinition {
        JobDefinition {
            name: "cancelled-paid".into(),
            kind,
            predicates: vec![
                Predicate {
                    field: "Appt. Status".into(),
                    required: true,
                    comparison: Comparison::Equals {
                        value: "cancelled".into(),
                    },
                },
                Predicate {
                    field: "Appt. Payment Status".into(),
                    required: true,
                    comparison: Comparison::Equals {
                        value: "paid".into(),
                    },
                },
                Predicate {
                    field: "Hospital Name".into(),
                    required: true,
                    comparison: Comparison::OneOf {
                        values: vec!["A".into()],
                    },
                },
            ],
            identity_fields: vec!["Patient Name".into(), "Appointment Date".into()],
            output_fields: vec![
                "Patient Name".into(),
                "Hospital Name".into(),
                "Appointment Date".into(),
            ],
            summary: None,
            artifact: "cancelled_paid.csv".into(),
            subject: "Cancelled & Paid".into(),
            body: "see attachment".into(),
            recipients: vec!["ops@example.com".into()],
            cc: vec![],
        }
    }

    fn run_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 16).unwrap()
    }

    #[test]
    fn conjunction_selects_only_fully_matching_rows() {
        let table = appointments_table();
        let job = base_job(JobKind::Snapshot);
        let resolved = resolve_job(&table.schema, &job).unwrap();
        let selected = select_rows(&table, &job, &resolved, run_date());
        assert_eq!(selected, vec![0]);
    }

    #[test]
    fn missing_required_column_fails_fast() {
        let table = appointments_table();
        let mut job = base_job(JobKind::Snapshot);
        job.predicates.push(Predicate {
            field: "Consider Patient".into(),
            required: true,
            comparison: Comparison::Equals { value: "yes".into() },
        });
        let err = resolve_job(&table.schema, &job).unwrap_err();
        assert!(matches!(err, EngineError::MissingColumn(f) if f == "Consider Patient"));
    }

    #[test]
    fn missing_optional_column_is_a_soft_filter() {
        let table = appointments_table();
        let mut job = base_job(JobKind::Snapshot);
        job.predicates.push(Predicate {
            field: "Consider Patient".into(),
            required: false,
            comparison: Comparison::Equals { value: "yes".into() },
        });
        let resolved = resolve_job(&table.schema, &job).unwrap();
        let selected = select_rows(&table, &job, &resolved, run_date());
        assert_eq!(selected, vec![0]);
    }

    #[test]
    fn date_window_filters_and_unparseable_dates_never_match() {
        let schema = Schema::new(vec!["Name".into(), "Appointment Date".into()]);
        let rows = vec![
            vec![text("in-window"), text("2026-03-15")],
            vec![text("out-of-window"), text("2026-02-01")],
            vec![text("garbage-date"), text("sometime soon")],
            vec![text("empty-date"), FieldValue::Empty],
        ];
        let table = Table::new(schema, rows);
        let job = JobDefinition {
            name: "windowed".into(),
            kind: JobKind::Snapshot,
            predicates: vec![Predicate {
                field: "Appointment Date".into(),
                required: true,
                comparison: Comparison::DateWithin {
                    window: DateWindow {
                        from_days_back: 1,
                        to_days_back: 1,
                    },
                },
            }],
            identity_fields: vec![],
            output_fields: vec!["Name".into()],
            summary: None,
            artifact: "windowed.csv".into(),
            subject: "s".into(),
            body: "b".into(),
            recipients: vec![],
            cc: vec![],
        };
        let resolved = resolve_job(&table.schema, &job).unwrap();
        let selected = select_rows(&table, &job, &resolved, run_date());
        assert_eq!(selected, vec![0]);
    }

    #[test]
    fn exact_duplicate_output_rows_collapse_to_first() {
        let schema = Schema::new(vec!["Name".into(), "Status".into()]);
        let rows = vec![
            vec![text("Asha"), text("Cancelled")],
            vec![text("Asha"), text("Cancelled")],
            vec![text("Ravi"), text("Cancelled")],
        ];
        let table = Table::new(schema, rows);
        let job = JobDefinition {
            name: "dupes".into(),
            kind: JobKind::Snapshot,
            predicates: vec![],
            identity_fields: vec![],
            output_fields: vec!["Name".into(), "Status".into()],
            summary: None,
            artifact: "d.csv".into(),
            subject: "s".into(),
            body: "b".into(),
            recipients: vec![],
            cc: vec![],
        };
        let resolved = resolve_job(&table.schema, &job).unwrap();
        let selected = select_rows(&table, &job, &resolved, run_date());
        assert_eq!(selected, vec![0, 2]);
    }

    #[test]
    fn canonicalization_is_stable_under_case_and_whitespace() {
        let job = base_job(JobKind::Incremental);
        let schema = appointments_table().schema;
        let resolved = resolve_job(&schema, &job).unwrap();

        let a = vec![
            text("  Asha   Rao "),
            text("Cancelled"),
            text("Paid"),
            text("A"),
            text("2026-03-15"),
        ];
        let b = vec![
            text("ASHA RAO"),
            text("cancelled"),
            text("paid"),
            text("a"),
            text("2026-03-15"),
        ];

        let sig_a = canonical_signature(&a, &resolved);
        let sig_b = canonical_signature(&b, &resolved);
        assert_eq!(sig_a, sig_b);
        assert_eq!(identity_key(&sig_a), identity_key(&sig_b));
        assert_eq!(identity_key(&sig_a).len(), 64);
    }

    #[test]
    fn distinct_identities_get_distinct_keys() {
        let job = base_job(JobKind::Incremental);
        let schema = appointments_table().schema;
        let resolved = resolve_job(&schema, &job).unwrap();
        let table = appointments_table();
        let sig_0 = canonical_signature(&table.rows[0], &resolved);
        let sig_1 = canonical_signature(&table.rows[1], &resolved);
        assert_ne!(identity_key(&sig_0), identity_key(&sig_1));
    }

    #[test]
    fn delta_is_idempotent_across_a_commit() {
        let table = appointments_table();
        let job = base_job(JobKind::Incremental);
        let resolved = resolve_job(&table.schema, &job).unwrap();
        let selected = select_rows(&table, &job, &resolved, run_date());

        let mut ledger: HashSet<String> = HashSet::new();
        let first = compute_delta(&table, &resolved, &selected, &ledger);
        assert_eq!(first.indices, vec![0]);
        assert_eq!(first.keys.len(), 1);

        // Re-running with an unchanged ledger returns the same delta.
        let again = compute_delta(&table, &resolved, &selected, &ledger);
        assert_eq!(again, first);

        // After the commit, nothing is pending.
        ledger.extend(first.keys.iter().cloned());
        let second = compute_delta(&table, &resolved, &selected, &ledger);
        assert!(second.is_empty());
    }

    #[test]
    fn delta_deduplicates_by_identity_first_occurrence_wins() {
        let schema = Schema::new(vec!["Patient Name".into(), "Appointment Date".into()]);
        let rows = vec![
            vec![text("Asha Rao"), text("2026-03-15")],
            vec![text("asha  rao"), text("2026-03-15")],
        ];
        let table = Table::new(schema, rows);
        let job = JobDefinition {
            name: "dup-identity".into(),
            kind: JobKind::Incremental,
            predicates: vec![],
            identity_fields: vec!["Patient Name".into(), "Appointment Date".into()],
            output_fields: vec!["Patient Name".into()],
            summary: None,
            artifact: "d.csv".into(),
            subject: "s".into(),
            body: "b".into(),
            recipients: vec![],
            cc: vec![],
        };
        let resolved = resolve_job(&table.schema, &job).unwrap();
        // Both rows survive selection (different raw output text) but share
        // an identity after normalization.
        let selected = select_rows(&table, &job, &resolved, run_date());
        assert_eq!(selected.len(), 2);
        let delta = compute_delta(&table, &resolved, &selected, &HashSet::new());
        assert_eq!(delta.indices, vec![0]);
    }

    #[test]
    fn report_appends_summary_row_when_configured() {
        let schema = Schema::new(vec!["Patient Name".into(), "Total".into()]);
        let rows = vec![
            vec![text("Asha"), FieldValue::Number(1.0)],
            vec![text("Ravi"), FieldValue::Number(1.0)],
        ];
        let table = Table::new(schema, rows);
        let job = JobDefinition {
            name: "summary".into(),
            kind: JobKind::Snapshot,
            predicates: vec![],
            identity_fields: vec![],
            output_fields: vec!["Patient Name".into(), "Total".into()],
            summary: Some(SummaryRow {
                label_field: "Patient Name".into(),
                label: "Total Patients".into(),
                count_field: "Total".into(),
            }),
            artifact: "s.csv".into(),
            subject: "s".into(),
            body: "b".into(),
            recipients: vec![],
            cc: vec![],
        };
        let resolved = resolve_job(&table.schema, &job).unwrap();
        let report = build_report(&table, &job, &resolved, &[0, 1]);
        assert_eq!(report.row_count(), 3);
        let last = report.rows.last().unwrap();
        assert_eq!(last[0], FieldValue::Text("Total Patients".into()));
        assert_eq!(last[1], FieldValue::Number(2.0));

        // No summary row on an empty report.
        let empty = build_report(&table, &job, &resolved, &[]);
        assert_eq!(empty.row_count(), 0);
    }

    #[tokio::test]
    async fn journaling_delivery_always_succeeds() {
        let message = OutboundMessage {
            recipients: vec!["ops@example.com".into()],
            cc: vec![],
            subject: "s".into(),
            body: "b".into(),
            attachments: vec![PathBuf::from("out/report.csv")],
        };
        JournalingDelivery.deliver(&message).await.unwrap();
    }

    #[test]
    fn subject_rendering_expands_dates_and_counts() {
        let date = run_date();
        assert_eq!(
            render_subject("Dropouts - {yesterday}", date, None),
            "Dropouts - 15/03/2026"
        );
        assert_eq!(
            render_subject("Completed ({run_date})", date, Some(4)),
            "Completed (16/03/2026) | New rows: 4"
        );
    }
}
