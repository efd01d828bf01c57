//! Readiness-gated orchestration: waits for the source export to be fresh,
//! sweeps stale artifacts, then runs the configured jobs sequentially with
//! per-job failure isolation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use mira_core::{JobDefinition, JobKind, RunContext};
use mira_engine::{
    build_report, compute_delta, render_subject, resolve_job, select_rows, Delivery, Delta,
    OutboundMessage, Report,
};
use mira_storage::{
    CleanupManager, CorruptLedgerPolicy, CsvSink, DeliveryLedger, JsonTableSource, RecordSink,
    RecordSource, RunJournal,
};
use serde::{Deserialize, Serialize};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mira-sched";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Process-wide configuration, read once at start-up and passed down
/// immutably. No component reads the environment after this.
#[derive(Debug, Clone)]
pub struct SchedConfig {
    pub source_path: PathBuf,
    pub jobs_path: PathBuf,
    pub artifacts_dir: PathBuf,
    pub ledger_path: PathBuf,
    pub logs_dir: PathBuf,
    pub max_wait: Duration,
    pub recheck_interval: Duration,
    pub cleanup_extensions: Vec<String>,
    pub watch_cron: String,
    pub ledger_policy: CorruptLedgerPolicy,
}

impl SchedConfig {
    pub fn from_env() -> Self {
        Self {
            source_path: env_path("MIRA_SOURCE", "data/export.json"),
            jobs_path: env_path("MIRA_JOBS", "jobs.yaml"),
            artifacts_dir: env_path("MIRA_ARTIFACTS_DIR", "output"),
            ledger_path: env_path("MIRA_LEDGER", "state/sent_keys.csv"),
            logs_dir: env_path("MIRA_LOGS_DIR", "logs"),
            max_wait: Duration::from_secs(env_u64("MIRA_MAX_WAIT_SECS", 6 * 3600)),
            recheck_interval: Duration::from_secs(env_u64("MIRA_RECHECK_SECS", 1800)),
            cleanup_extensions: std::env::var("MIRA_CLEANUP_EXTS")
                .map(|v| v.split(',').map(|e| e.trim().to_string()).collect())
                .unwrap_or_else(|_| vec!["csv".into(), "xlsx".into(), "xls".into()]),
            watch_cron: std::env::var("MIRA_WATCH_CRON")
                .unwrap_or_else(|_| "0 30 10 * * *".to_string()),
            ledger_policy: std::env::var("MIRA_LEDGER_FAIL_CLOSED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .map(|closed| {
                    if closed {
                        CorruptLedgerPolicy::FailClosed
                    } else {
                        CorruptLedgerPolicy::FailOpen
                    }
                })
                .unwrap_or(CorruptLedgerPolicy::FailOpen),
        }
    }
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Deserialize)]
struct JobRegistryFile {
    jobs: Vec<JobDefinition>,
}

/// Loads and validates the job registry. The job list is fixed and
/// sequential; this is not a workflow engine.
pub async fn load_job_registry(path: &PathBuf) -> Result<Vec<JobDefinition>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading job registry {}", path.display()))?;
    let registry: JobRegistryFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    validate_jobs(&registry.jobs)?;
    Ok(registry.jobs)
}

fn validate_jobs(jobs: &[JobDefinition]) -> Result<()> {
    let mut incremental = 0usize;
    for job in jobs {
        if job.output_fields.is_empty() {
            bail!("job `{}` declares no output fields", job.name);
        }
        if job.kind == JobKind::Incremental {
            incremental += 1;
            if job.identity_fields.is_empty() {
                bail!("incremental job `{}` declares no identity fields", job.name);
            }
        }
    }
    // The ledger is single-writer: exactly one job may own it.
    if incremental > 1 {
        bail!("at most one incremental job may own the delivery ledger, found {incremental}");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Freshness gate
// ---------------------------------------------------------------------------

/// Reads the source's last-modified signal. Production uses file mtime; tests
/// substitute a fake.
pub trait FreshnessProbe: Send + Sync {
    /// `None` means the signal is unreadable right now, which the gate treats
    /// as "not fresh yet", never as a timeout.
    fn last_modified(&self) -> Option<DateTime<Local>>;
}

#[derive(Debug, Clone)]
pub struct FileFreshnessProbe {
    path: PathBuf,
}

impl FileFreshnessProbe {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl FreshnessProbe for FileFreshnessProbe {
    fn last_modified(&self) -> Option<DateTime<Local>> {
        std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Local>::from)
    }
}

/// Terminal states of the freshness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    Ready,
    TimedOut,
}

/// WAITING until the source was modified on the run date, with a bounded
/// total wait and a fixed recheck interval. The whole process suspends
/// between checks; nothing else runs concurrently.
#[derive(Debug, Clone, Copy)]
pub struct FreshnessGate {
    max_wait: Duration,
    recheck_interval: Duration,
}

impl FreshnessGate {
    pub fn new(max_wait: Duration, recheck_interval: Duration) -> Self {
        Self {
            max_wait,
            recheck_interval,
        }
    }

    pub async fn wait(&self, probe: &dyn FreshnessProbe, run_date: NaiveDate) -> GateOutcome {
        let started = tokio::time::Instant::now();
        loop {
            if started.elapsed() >= self.max_wait {
                warn!(waited_secs = started.elapsed().as_secs(), "freshness wait timed out");
                return GateOutcome::TimedOut;
            }

            match probe.last_modified() {
                Some(modified) if modified.date_naive() == run_date => {
                    info!(%modified, "source is fresh");
                    return GateOutcome::Ready;
                }
                Some(modified) => {
                    info!(%modified, recheck_secs = self.recheck_interval.as_secs(),
                          "source not updated yet; rechecking");
                }
                None => {
                    warn!("freshness signal unreadable; treating as not fresh yet");
                }
            }

            tokio::time::sleep(self.recheck_interval).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded { delivered_rows: usize },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobOutcome {
    pub job: String,
    pub status: JobStatus,
}

/// Ephemeral outcome of one orchestrator invocation. Everything here is
/// discarded at process exit except what the ledger persisted.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub gate: GateOutcome,
    pub artifacts_removed: usize,
    pub jobs: Vec<JobOutcome>,
}

impl RunSummary {
    pub fn failed_jobs(&self) -> usize {
        self.jobs
            .iter()
            .filter(|o| matches!(o.status, JobStatus::Failed { .. }))
            .count()
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Sequentially invokes the configured jobs against one source snapshot,
/// isolating each job's failure so later jobs still run. There is no per-job
/// timeout: a hung job blocks the run (known gap, single-operator tool).
pub struct Orchestrator {
    config: SchedConfig,
    jobs: Vec<JobDefinition>,
    source: Arc<dyn RecordSource>,
    sink: Arc<dyn RecordSink>,
    delivery: Arc<dyn Delivery>,
    probe: Arc<dyn FreshnessProbe>,
    journal: RunJournal,
}

impl Orchestrator {
    pub fn new(config: SchedConfig, jobs: Vec<JobDefinition>, delivery: Arc<dyn Delivery>) -> Self {
        let source = Arc::new(JsonTableSource::new(config.source_path.clone()));
        let probe = Arc::new(FileFreshnessProbe::new(config.source_path.clone()));
        let journal = RunJournal::new(config.logs_dir.clone());
        Self {
            config,
            jobs,
            source,
            sink: Arc::new(CsvSink),
            delivery,
            probe,
            journal,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn RecordSource>) -> Self {
        self.source = source;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn FreshnessProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// One full run: gate, cleanup, then every job in order. Per-job errors
    /// are logged and recorded, never propagated; only the freshness timeout
    /// aborts before jobs start.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let ctx = RunContext::for_today();
        let started_at = Utc::now();
        let span = info_span!("run", run_id = %ctx.run_id);

        async {
            self.journal
                .record(&format!("run {} started", ctx.run_id))
                .await?;

            let gate = FreshnessGate::new(self.config.max_wait, self.config.recheck_interval)
                .wait(self.probe.as_ref(), ctx.run_date)
                .await;

            if gate == GateOutcome::TimedOut {
                self.journal
                    .record("source never became fresh; aborting run before any job")
                    .await?;
                return Ok(RunSummary {
                    run_id: ctx.run_id,
                    run_date: ctx.run_date,
                    started_at,
                    finished_at: Utc::now(),
                    gate,
                    artifacts_removed: 0,
                    jobs: Vec::new(),
                });
            }

            self.journal.record("source is fresh; pre-run cleanup").await?;
            let cleanup = CleanupManager::new(
                vec![self.config.artifacts_dir.clone()],
                self.config.cleanup_extensions.clone(),
            )
            .sweep()
            .await
            .context("pre-run artifact cleanup")?;
            self.journal
                .record(&format!(
                    "cleanup removed {} stale artifact(s), {} missing dir(s)",
                    cleanup.removed, cleanup.missing_dirs
                ))
                .await?;

            let mut outcomes = Vec::with_capacity(self.jobs.len());
            for job in &self.jobs {
                self.journal
                    .record(&format!("job `{}` starting", job.name))
                    .await?;
                info!(job = %job.name, "job starting");

                match self.run_job(&ctx, job).await {
                    Ok(delivered_rows) => {
                        info!(job = %job.name, delivered_rows, "job succeeded");
                        self.journal
                            .record(&format!(
                                "job `{}` succeeded; delivered {} row(s)",
                                job.name, delivered_rows
                            ))
                            .await?;
                        outcomes.push(JobOutcome {
                            job: job.name.clone(),
                            status: JobStatus::Succeeded { delivered_rows },
                        });
                    }
                    Err(err) => {
                        error!(job = %job.name, error = format!("{err:#}"), "job failed");
                        self.journal
                            .record(&format!("job `{}` failed: {err:#}", job.name))
                            .await?;
                        outcomes.push(JobOutcome {
                            job: job.name.clone(),
                            status: JobStatus::Failed {
                                error: format!("{err:#}"),
                            },
                        });
                    }
                }
            }

            let summary = RunSummary {
                run_id: ctx.run_id,
                run_date: ctx.run_date,
                started_at,
                finished_at: Utc::now(),
                gate,
                artifacts_removed: cleanup.removed,
                jobs: outcomes,
            };
            self.journal
                .record(&format!(
                    "run {} completed; {} job(s), {} failed",
                    ctx.run_id,
                    summary.jobs.len(),
                    summary.failed_jobs()
                ))
                .await?;
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    async fn run_job(&self, ctx: &RunContext, job: &JobDefinition) -> Result<usize> {
        let table = self.source.load().await.context("loading source export")?;
        let resolved = resolve_job(&table.schema, job)?;
        let selected = select_rows(&table, job, &resolved, ctx.run_date);

        match job.kind {
            JobKind::Snapshot => {
                let report = build_report(&table, job, &resolved, &selected);
                let artifact = self.write_artifact(job, &report).await?;
                let subject = render_subject(&job.subject, ctx.run_date, None);
                self.deliver(job, subject, vec![artifact]).await?;
                Ok(selected.len())
            }
            JobKind::Incremental => {
                let ledger =
                    DeliveryLedger::new(&self.config.ledger_path, self.config.ledger_policy);
                let sent = ledger.load().await.context("loading delivery ledger")?;
                let delta = compute_delta(&table, &resolved, &selected, &sent);

                if delta.is_empty() {
                    info!(job = %job.name, "no new rows since last send; skipping delivery");
                    return Ok(0);
                }

                let report = build_report(&table, job, &resolved, &delta.indices);
                let artifact = self.write_artifact(job, &report).await?;
                let subject = render_subject(&job.subject, ctx.run_date, Some(delta.keys.len()));
                self.deliver(job, subject, vec![artifact]).await?;

                // Commit only after the delivery succeeded; a failure above
                // leaves the same rows pending for the next run.
                ledger
                    .commit(&delta.keys)
                    .await
                    .context("committing delivery ledger")?;
                Ok(delta.indices.len())
            }
        }
    }

    async fn write_artifact(&self, job: &JobDefinition, report: &Report) -> Result<PathBuf> {
        let path = self.config.artifacts_dir.join(&job.artifact);
        self.sink
            .write(&path, &report.columns, &report.rows)
            .await
            .with_context(|| format!("writing artifact {}", path.display()))?;
        Ok(path)
    }

    async fn deliver(
        &self,
        job: &JobDefinition,
        subject: String,
        attachments: Vec<PathBuf>,
    ) -> Result<()> {
        let message = OutboundMessage {
            recipients: job.recipients.clone(),
            cc: job.cc.clone(),
            subject,
            body: job.body.clone(),
            attachments,
        };
        self.delivery
            .deliver(&message)
            .await
            .context("delivering report")?;
        Ok(())
    }

    /// Computes the pending unsent delta for one incremental job without
    /// writing artifacts, delivering, or committing the ledger.
    pub async fn pending_delta(&self, job_name: &str) -> Result<(Report, Delta)> {
        let job = self
            .jobs
            .iter()
            .find(|j| j.name == job_name)
            .with_context(|| format!("no job named `{job_name}` in the registry"))?;
        if job.kind != JobKind::Incremental {
            bail!("job `{job_name}` is a snapshot job; only incremental jobs have a delta");
        }

        let ctx = RunContext::for_today();
        let table = self.source.load().await.context("loading source export")?;
        let resolved = resolve_job(&table.schema, job)?;
        let selected = select_rows(&table, job, &resolved, ctx.run_date);

        let ledger = DeliveryLedger::new(&self.config.ledger_path, self.config.ledger_policy);
        let sent = ledger.load().await.context("loading delivery ledger")?;
        let delta = compute_delta(&table, &resolved, &selected, &sent);
        let report = build_report(&table, job, &resolved, &delta.indices);
        Ok((report, delta))
    }

    /// Daily watch mode: triggers `run_once` on the configured cron schedule
    /// until interrupted.
    pub async fn watch(self: Arc<Self>) -> Result<()> {
        let mut scheduler = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.watch_cron.clone();

        let orchestrator = self.clone();
        let job = Job::new_async(cron.as_str(), move |_id, _lock| {
            let orchestrator = orchestrator.clone();
            Box::pin(async move {
                match orchestrator.run_once().await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        gate = ?summary.gate,
                        failed = summary.failed_jobs(),
                        "scheduled run finished"
                    ),
                    Err(err) => error!(error = format!("{err:#}"), "scheduled run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduled run for cron `{cron}`"))?;

        scheduler.add(job).await.context("adding scheduled run")?;
        scheduler.start().await.context("starting scheduler")?;
        info!(%cron, "watch mode started; waiting for interrupt");

        tokio::signal::ctrl_c()
            .await
            .context("waiting for interrupt")?;
        scheduler.shutdown().await.context("stopping scheduler")?;
        Ok(())
    }
}
