//! Sync orchestration: source registry, incremental windows, chunked
//! persistence, and per-run reports.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Days, NaiveDate, Utc};
use mrf_connectors::{connector_for_source, normalize, ApiConnector, SourceConnector};
use mrf_core::{
    normalize_email, AdSpendRecord, CanonicalLead, CanonicalPurchase, CanonicalRecord, DateRange,
    SourcePlatform,
};
use mrf_store::{FunnelStore, HttpClientConfig, HttpFetcher, StoreError, UpsertOutcome};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mrf-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub mode: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub fixtures_root: PathBuf,
    pub snapshot_path: PathBuf,
    pub reports_root: PathBuf,
    /// Days before the watermark that each incremental run re-fetches, so
    /// late vendor revisions get picked up.
    pub lookback_days: u32,
    /// Window size for a connector that has never synced.
    pub initial_backfill_days: u32,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            fixtures_root: std::env::var("MRF_FIXTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./fixtures")),
            snapshot_path: std::env::var("MRF_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/funnel.json")),
            reports_root: std::env::var("MRF_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            lookback_days: std::env::var("MRF_LOOKBACK_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
            initial_backfill_days: std::env::var("MRF_INITIAL_BACKFILL_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            user_agent: std::env::var("MRF_USER_AGENT")
                .unwrap_or_else(|_| "mrf-sync/0.1".to_string()),
            http_timeout_secs: std::env::var("MRF_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no connector registered for {0}")]
    UnknownConnector(String),
    #[error(
        "window {range} for {source_id} ends behind the watermark {watermark}; \
         re-running it needs an explicit backfill override"
    )]
    WindowBehindWatermark {
        source_id: String,
        range: DateRange,
        watermark: NaiveDate,
    },
}

/// Connector run lifecycle. Done and Failed are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Pending,
    Fetching,
    Normalizing,
    Persisting,
    Done,
    Failed(String),
}

impl RunPhase {
    fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Done | RunPhase::Failed(_))
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunPhase::Pending => f.write_str("pending"),
            RunPhase::Fetching => f.write_str("fetching"),
            RunPhase::Normalizing => f.write_str("normalizing"),
            RunPhase::Persisting => f.write_str("persisting"),
            RunPhase::Done => f.write_str("done"),
            RunPhase::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug)]
struct RunState {
    source_id: String,
    phase: RunPhase,
}

impl RunState {
    fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            phase: RunPhase::Pending,
        }
    }

    fn advance(&mut self, next: RunPhase) {
        if self.phase.is_terminal() {
            warn!(
                source_id = %self.source_id,
                current = %self.phase,
                requested = %next,
                "ignoring transition out of a terminal phase"
            );
            return;
        }
        info!(source_id = %self.source_id, from = %self.phase, to = %next, "sync phase");
        self.phase = next;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectorRunReport {
    pub source_id: String,
    pub phase: RunPhase,
    pub window: Option<DateRange>,
    pub fetched_payloads: usize,
    pub normalized_records: usize,
    pub skipped_payloads: usize,
    pub inserted: usize,
    pub updated: usize,
    pub failed_records: usize,
    pub watermark: Option<NaiveDate>,
}

impl ConnectorRunReport {
    fn empty(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            phase: RunPhase::Pending,
            window: None,
            fetched_payloads: 0,
            normalized_records: 0,
            skipped_payloads: 0,
            inserted: 0,
            updated: 0,
            failed_records: 0,
            watermark: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub connectors: Vec<ConnectorRunReport>,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// How the caller scopes a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncWindow {
    /// Explicit inclusive date range, e.g. a deliberate backfill.
    Explicit(DateRange),
    /// Resume from the connector watermark minus the lookback.
    Incremental,
}

fn effective_window(
    window: SyncWindow,
    source_id: &str,
    watermark: Option<NaiveDate>,
    config: &SyncConfig,
    today: NaiveDate,
    backfill: bool,
) -> Result<DateRange, SyncError> {
    match window {
        SyncWindow::Explicit(range) => {
            if let Some(wm) = watermark {
                if range.end < wm && !backfill {
                    return Err(SyncError::WindowBehindWatermark {
                        source_id: source_id.to_string(),
                        range,
                        watermark: wm,
                    });
                }
            }
            Ok(range)
        }
        SyncWindow::Incremental => {
            let start = match watermark {
                Some(wm) => wm
                    .checked_sub_days(Days::new(u64::from(config.lookback_days)))
                    .unwrap_or(wm),
                None => today
                    .checked_sub_days(Days::new(u64::from(config.initial_backfill_days)))
                    .unwrap_or(today),
            };
            let start = start.min(today);
            Ok(DateRange { start, end: today })
        }
    }
}

#[derive(Debug, Default)]
struct ChunkOutcome {
    inserted: usize,
    updated: usize,
    failed: usize,
    first_dirty_day: Option<NaiveDate>,
}

/// Persist records one calendar day at a time, in date order. Later days
/// are still written after a dirty one (upserts are idempotent, a re-run
/// redoes them), but the dirty day caps how far the watermark may move.
async fn persist_in_daily_chunks(store: &FunnelStore, records: Vec<CanonicalRecord>) -> ChunkOutcome {
    let mut by_day: BTreeMap<NaiveDate, Vec<CanonicalRecord>> = BTreeMap::new();
    for record in records {
        by_day.entry(record.record_date()).or_default().push(record);
    }

    let mut outcome = ChunkOutcome::default();
    for (day, chunk) in by_day {
        for result in store.upsert_batch(chunk).await {
            match result {
                Ok(UpsertOutcome::Inserted) => outcome.inserted += 1,
                Ok(UpsertOutcome::Updated) => outcome.updated += 1,
                Err(err) => {
                    warn!(day = %day, error = %err, "record rejected during persist");
                    outcome.failed += 1;
                    outcome.first_dirty_day.get_or_insert(day);
                }
            }
        }
    }
    outcome
}

/// Latest date the watermark may move to: the end of the window when every
/// chunk was clean, otherwise the day before the first dirty chunk. A dirty
/// first day means no advance at all.
fn clean_through(first_dirty_day: Option<NaiveDate>, range: DateRange) -> Option<NaiveDate> {
    match first_dirty_day {
        None => Some(range.end),
        Some(dirty) if dirty > range.start => dirty.pred_opt().map(|d| d.min(range.end)),
        Some(_) => None,
    }
}

/// Reject a lead webhook with no usable email before it reaches the
/// normalizer; everything else goes through the same path as batch sync.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook payload has no usable email")]
    MissingEmail,
    #[error(transparent)]
    Normalization(#[from] mrf_connectors::NormalizationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub async fn ingest_webhook_lead(
    store: &FunnelStore,
    payload: &JsonValue,
) -> Result<UpsertOutcome, WebhookError> {
    let has_email = payload
        .get("email")
        .and_then(JsonValue::as_str)
        .and_then(normalize_email)
        .is_some();
    if !has_email {
        return Err(WebhookError::MissingEmail);
    }
    let records = normalize(payload, SourcePlatform::Kajabi)?;
    let mut last = UpsertOutcome::Inserted;
    for record in records {
        last = store.upsert(record).await?;
    }
    Ok(last)
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: FunnelStore,
    http: HttpFetcher,
}

impl SyncPipeline {
    /// Open the pipeline over the configured snapshot, starting empty on
    /// first run.
    pub async fn open(config: SyncConfig) -> Result<Self> {
        let store = FunnelStore::load_or_default(&config.snapshot_path).await?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self {
            config,
            store,
            http,
        })
    }

    pub fn store(&self) -> &FunnelStore {
        &self.store
    }

    /// Run one sync pass. `selector` is either `all` or a single source id
    /// from the registry. One connector failing does not stop the others.
    pub async fn run(
        &self,
        selector: &str,
        window: SyncWindow,
        backfill: bool,
    ) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let today = started_at.date_naive();

        let registry = self.load_source_registry().await?;
        let selected: Vec<SourceConfig> = match selector {
            "all" => registry.sources.into_iter().filter(|s| s.enabled).collect(),
            one => {
                let source = registry
                    .sources
                    .into_iter()
                    .find(|s| s.source_id == one)
                    .ok_or_else(|| SyncError::UnknownConnector(one.to_string()))?;
                vec![source]
            }
        };

        let mut connectors = Vec::with_capacity(selected.len());
        for source in &selected {
            connectors.push(self.run_connector(source, window, backfill, today).await);
        }

        self.store.persist(&self.config.snapshot_path).await?;

        let finished_at = Utc::now();
        let reports_dir = self
            .write_reports(run_id, started_at, finished_at, &connectors)
            .await?;
        let manifest_path = self.export_parquet_snapshots(&reports_dir).await?;

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            connectors,
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest: manifest_path.display().to_string(),
        })
    }

    fn connector_for(&self, source: &SourceConfig) -> Option<Box<dyn SourceConnector>> {
        if source.mode == "api" {
            let platform = SourcePlatform::parse(&source.source_id)?;
            let base_url = source.base_url.clone()?;
            return Some(Box::new(ApiConnector::new(
                platform.as_str(),
                platform,
                base_url,
            )));
        }
        connector_for_source(&source.source_id, &self.config.fixtures_root)
    }

    async fn run_connector(
        &self,
        source: &SourceConfig,
        window: SyncWindow,
        backfill: bool,
        today: NaiveDate,
    ) -> ConnectorRunReport {
        let mut state = RunState::new(&source.source_id);
        let mut report = ConnectorRunReport::empty(&source.source_id);

        let watermark = self.store.watermark(&source.source_id).await;
        report.watermark = watermark;

        let range = match effective_window(
            window,
            &source.source_id,
            watermark,
            &self.config,
            today,
            backfill,
        ) {
            Ok(range) => range,
            Err(err) => {
                state.advance(RunPhase::Failed(err.to_string()));
                report.phase = state.phase;
                return report;
            }
        };
        report.window = Some(range);

        let Some(connector) = self.connector_for(source) else {
            state.advance(RunPhase::Failed(
                SyncError::UnknownConnector(source.source_id.clone()).to_string(),
            ));
            report.phase = state.phase;
            return report;
        };

        state.advance(RunPhase::Fetching);
        let payloads = match connector.fetch(&self.http, range).await {
            Ok(payloads) => payloads,
            Err(err) => {
                // nothing fetched means nothing persisted; the watermark
                // stays where the last clean run left it
                state.advance(RunPhase::Failed(err.to_string()));
                report.phase = state.phase;
                return report;
            }
        };
        report.fetched_payloads = payloads.len();

        state.advance(RunPhase::Normalizing);
        let mut records = Vec::new();
        for payload in &payloads {
            match normalize(&payload.body, payload.platform) {
                Ok(mut normalized) => records.append(&mut normalized),
                Err(err) => {
                    warn!(source_id = %source.source_id, error = %err, "payload skipped");
                    report.skipped_payloads += 1;
                }
            }
        }
        report.normalized_records = records.len();

        state.advance(RunPhase::Persisting);
        let outcome = persist_in_daily_chunks(&self.store, records).await;
        report.inserted = outcome.inserted;
        report.updated = outcome.updated;
        report.failed_records = outcome.failed;

        // the watermark only moves forward: a clean backfill of an old
        // window does not un-succeed the days after it
        if let Some(target) = clean_through(outcome.first_dirty_day, range) {
            if watermark.map_or(true, |wm| target > wm) {
                if let Err(err) = self
                    .store
                    .advance_watermark(&source.source_id, target, false)
                    .await
                {
                    state.advance(RunPhase::Failed(err.to_string()));
                    report.phase = state.phase;
                    return report;
                }
                report.watermark = Some(target);
            }
        }

        state.advance(RunPhase::Done);
        report.phase = state.phase;
        report
    }

    async fn load_source_registry(&self) -> Result<SourceRegistry> {
        let path = self.config.workspace_root.join("sources.yaml");
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    async fn write_reports(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        connectors: &[ConnectorRunReport],
    ) -> Result<PathBuf> {
        let reports_dir = self.config.reports_root.join(run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let (leads, purchases, ad_spend) = self.store.counts().await;
        let brief = format!(
            "# MRF Sync Brief\n\n- Run ID: `{run_id}`\n- Started: {started_at}\n- Finished: {finished_at}\n- Store rows: {leads} leads, {purchases} purchase claims, {ad_spend} spend rows\n\n## Connectors\n{}\n",
            connectors
                .iter()
                .map(|c| format!(
                    "- {}: {} (fetched {}, inserted {}, updated {}, failed {})",
                    c.source_id, c.phase, c.fetched_payloads, c.inserted, c.updated, c.failed_records
                ))
                .collect::<Vec<_>>()
                .join("\n")
        );
        fs::write(reports_dir.join("sync_brief.md"), brief)
            .await
            .context("writing sync_brief.md")?;

        let summary_json = serde_json::to_vec_pretty(&serde_json::json!({
            "run_id": run_id,
            "started_at": started_at,
            "finished_at": finished_at,
            "connectors": connectors,
        }))
        .context("serializing run summary")?;
        fs::write(reports_dir.join("sync_summary.json"), summary_json)
            .await
            .context("writing sync_summary.json")?;

        Ok(reports_dir)
    }

    async fn export_parquet_snapshots(&self, reports_dir: &PathBuf) -> Result<PathBuf> {
        let snapshot_dir = reports_dir.join("snapshots");
        fs::create_dir_all(&snapshot_dir)
            .await
            .with_context(|| format!("creating {}", snapshot_dir.display()))?;

        let everything = DateRange {
            start: NaiveDate::MIN,
            end: NaiveDate::MAX,
        };
        let leads = self.store.leads_in_range(everything).await;
        let purchases = self.store.purchases_in_range(everything).await;
        let ad_spend = self.store.ad_spend_in_range(everything).await;

        let leads_path = snapshot_dir.join("leads.parquet");
        let purchases_path = snapshot_dir.join("purchases.parquet");
        let ad_spend_path = snapshot_dir.join("ad_spend.parquet");

        write_leads_parquet(&leads_path, &leads)?;
        write_purchases_parquet(&purchases_path, &purchases)?;
        write_ad_spend_parquet(&ad_spend_path, &ad_spend)?;

        let manifest = ParquetManifest {
            schema_version: 1,
            files: vec![
                manifest_entry("leads", reports_dir, &leads_path)?,
                manifest_entry("purchases", reports_dir, &purchases_path)?,
                manifest_entry("ad_spend", reports_dir, &ad_spend_path)?,
            ],
        };

        let manifest_path = snapshot_dir.join("manifest.json");
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
        fs::write(&manifest_path, bytes)
            .await
            .with_context(|| format!("writing {}", manifest_path.display()))?;

        Ok(manifest_path)
    }
}

pub async fn run_sync_from_env(
    selector: &str,
    window: SyncWindow,
    backfill: bool,
) -> Result<SyncRunSummary> {
    let pipeline = SyncPipeline::open(SyncConfig::from_env()).await?;
    pipeline.run(selector, window, backfill).await
}

fn write_parquet(path: &PathBuf, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_leads_parquet(path: &PathBuf, leads: &[CanonicalLead]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("email", DataType::Utf8, false),
        ArrowField::new("created_at", DataType::Utf8, false),
        ArrowField::new("source_platform", DataType::Utf8, false),
        ArrowField::new("resolved_platform", DataType::Utf8, false),
        ArrowField::new("utm_source", DataType::Utf8, true),
        ArrowField::new("utm_medium", DataType::Utf8, true),
        ArrowField::new("utm_campaign", DataType::Utf8, true),
    ]));

    let emails = StringArray::from(leads.iter().map(|l| Some(l.email.as_str())).collect::<Vec<_>>());
    let created_ats = StringArray::from(
        leads
            .iter()
            .map(|l| Some(l.created_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let source_platforms = StringArray::from(
        leads
            .iter()
            .map(|l| Some(l.source_platform.as_str()))
            .collect::<Vec<_>>(),
    );
    let resolved_platforms = StringArray::from(
        leads
            .iter()
            .map(|l| Some(l.resolved_platform.as_str()))
            .collect::<Vec<_>>(),
    );
    let utm_sources =
        StringArray::from(leads.iter().map(|l| l.utm_source.as_deref()).collect::<Vec<_>>());
    let utm_mediums =
        StringArray::from(leads.iter().map(|l| l.utm_medium.as_deref()).collect::<Vec<_>>());
    let utm_campaigns =
        StringArray::from(leads.iter().map(|l| l.utm_campaign.as_deref()).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(emails),
            Arc::new(created_ats),
            Arc::new(source_platforms),
            Arc::new(resolved_platforms),
            Arc::new(utm_sources),
            Arc::new(utm_mediums),
            Arc::new(utm_campaigns),
        ],
    )
    .context("building leads record batch")?;
    write_parquet(path, batch)
}

fn write_purchases_parquet(path: &PathBuf, purchases: &[CanonicalPurchase]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("date", DataType::Utf8, false),
        ArrowField::new("reporting_platform", DataType::Utf8, false),
        ArrowField::new("resolved_platform", DataType::Utf8, false),
        ArrowField::new("source", DataType::Utf8, true),
        ArrowField::new("medium", DataType::Utf8, true),
        ArrowField::new("campaign", DataType::Utf8, true),
        ArrowField::new("item_name", DataType::Utf8, true),
        ArrowField::new("purchase_count", DataType::UInt64, false),
        ArrowField::new("revenue", DataType::Utf8, false),
    ]));

    let dates = StringArray::from(
        purchases
            .iter()
            .map(|p| Some(p.date.to_string()))
            .collect::<Vec<_>>(),
    );
    let reporting = StringArray::from(
        purchases
            .iter()
            .map(|p| Some(p.reporting_platform.as_str()))
            .collect::<Vec<_>>(),
    );
    let resolved = StringArray::from(
        purchases
            .iter()
            .map(|p| Some(p.resolved_platform.as_str()))
            .collect::<Vec<_>>(),
    );
    let sources =
        StringArray::from(purchases.iter().map(|p| p.source.as_deref()).collect::<Vec<_>>());
    let mediums =
        StringArray::from(purchases.iter().map(|p| p.medium.as_deref()).collect::<Vec<_>>());
    let campaigns =
        StringArray::from(purchases.iter().map(|p| p.campaign.as_deref()).collect::<Vec<_>>());
    let item_names =
        StringArray::from(purchases.iter().map(|p| p.item_name.as_deref()).collect::<Vec<_>>());
    let counts = UInt64Array::from(purchases.iter().map(|p| p.purchase_count).collect::<Vec<_>>());
    // fixed-point revenue goes out as text so nothing re-rounds it
    let revenues = StringArray::from(
        purchases
            .iter()
            .map(|p| Some(p.revenue.to_string()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(dates),
            Arc::new(reporting),
            Arc::new(resolved),
            Arc::new(sources),
            Arc::new(mediums),
            Arc::new(campaigns),
            Arc::new(item_names),
            Arc::new(counts),
            Arc::new(revenues),
        ],
    )
    .context("building purchases record batch")?;
    write_parquet(path, batch)
}

fn write_ad_spend_parquet(path: &PathBuf, rows: &[AdSpendRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("date", DataType::Utf8, false),
        ArrowField::new("platform", DataType::Utf8, false),
        ArrowField::new("campaign_id", DataType::Utf8, false),
        ArrowField::new("adset_id", DataType::Utf8, true),
        ArrowField::new("ad_id", DataType::Utf8, true),
        ArrowField::new("spend", DataType::Utf8, false),
    ]));

    let dates = StringArray::from(rows.iter().map(|s| Some(s.date.to_string())).collect::<Vec<_>>());
    let platforms = StringArray::from(
        rows.iter()
            .map(|s| Some(s.platform.as_str()))
            .collect::<Vec<_>>(),
    );
    let campaign_ids = StringArray::from(
        rows.iter()
            .map(|s| Some(s.campaign_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let adset_ids = StringArray::from(rows.iter().map(|s| s.adset_id.as_deref()).collect::<Vec<_>>());
    let ad_ids = StringArray::from(rows.iter().map(|s| s.ad_id.as_deref()).collect::<Vec<_>>());
    let spends = StringArray::from(
        rows.iter()
            .map(|s| Some(s.spend.to_string()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(dates),
            Arc::new(platforms),
            Arc::new(campaign_ids),
            Arc::new(adset_ids),
            Arc::new(ad_ids),
            Arc::new(spends),
        ],
    )
    .context("building ad_spend record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &PathBuf, path: &PathBuf) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrf_core::PlatformLabel;
    use rust_decimal::Decimal;
    use tempfile::tempdir;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 1, d).unwrap()
    }

    fn test_config(workspace: &std::path::Path) -> SyncConfig {
        SyncConfig {
            workspace_root: workspace.to_path_buf(),
            fixtures_root: std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures"),
            snapshot_path: workspace.join("data/funnel.json"),
            reports_root: workspace.join("reports"),
            lookback_days: 1,
            initial_backfill_days: 30,
            user_agent: "mrf-test/0".to_string(),
            http_timeout_secs: 5,
        }
    }

    fn write_registry(workspace: &std::path::Path) {
        let yaml = r#"
sources:
  - source_id: kajabi
    display_name: Kajabi
    enabled: true
    mode: fixture
  - source_id: stripe
    display_name: Stripe
    enabled: true
    mode: fixture
  - source_id: hotmart
    display_name: Hotmart
    enabled: true
    mode: fixture
  - source_id: google_ads
    display_name: Google Ads
    enabled: true
    mode: fixture
  - source_id: meta_ads
    display_name: Meta Ads
    enabled: true
    mode: fixture
  - source_id: ga4
    display_name: GA4
    enabled: true
    mode: fixture
"#;
        std::fs::write(workspace.join("sources.yaml"), yaml).expect("registry written");
    }

    fn config_for_windows() -> SyncConfig {
        SyncConfig {
            workspace_root: PathBuf::from("."),
            fixtures_root: PathBuf::from("fixtures"),
            snapshot_path: PathBuf::from("data/funnel.json"),
            reports_root: PathBuf::from("reports"),
            lookback_days: 2,
            initial_backfill_days: 30,
            user_agent: "mrf-test/0".to_string(),
            http_timeout_secs: 5,
        }
    }

    #[test]
    fn incremental_window_resumes_behind_watermark_by_lookback() {
        let config = config_for_windows();
        let range = effective_window(
            SyncWindow::Incremental,
            "ga4",
            Some(day(20)),
            &config,
            day(25),
            false,
        )
        .unwrap();
        assert_eq!(range.start, day(18));
        assert_eq!(range.end, day(25));
    }

    #[test]
    fn incremental_window_without_watermark_backfills() {
        let config = config_for_windows();
        let range = effective_window(SyncWindow::Incremental, "ga4", None, &config, day(31), false)
            .unwrap();
        assert_eq!(range.start, day(1));
        assert_eq!(range.end, day(31));
    }

    #[test]
    fn explicit_window_behind_watermark_needs_override() {
        let config = config_for_windows();
        let range = DateRange::new(day(1), day(5)).unwrap();
        let err = effective_window(
            SyncWindow::Explicit(range),
            "ga4",
            Some(day(20)),
            &config,
            day(25),
            false,
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::WindowBehindWatermark { .. }));

        let re_run = effective_window(
            SyncWindow::Explicit(range),
            "ga4",
            Some(day(20)),
            &config,
            day(25),
            true,
        )
        .unwrap();
        assert_eq!(re_run, range);
    }

    #[test]
    fn failed_phase_is_terminal() {
        let mut state = RunState::new("ga4");
        state.advance(RunPhase::Fetching);
        state.advance(RunPhase::Failed("boom".to_string()));
        state.advance(RunPhase::Done);
        assert!(matches!(state.phase, RunPhase::Failed(_)));
    }

    #[tokio::test]
    async fn dirty_day_caps_the_clean_prefix() {
        let store = FunnelStore::new();
        let good = |d: u32| {
            CanonicalRecord::AdSpend(AdSpendRecord {
                date: day(d),
                platform: PlatformLabel::MetaAds,
                campaign_id: "m-5001".to_string(),
                adset_id: None,
                ad_id: None,
                spend: Decimal::new(100, 2),
            })
        };
        let bad = CanonicalRecord::AdSpend(AdSpendRecord {
            date: day(2),
            platform: PlatformLabel::MetaAds,
            campaign_id: "".to_string(),
            adset_id: None,
            ad_id: None,
            spend: Decimal::new(100, 2),
        });

        let outcome = persist_in_daily_chunks(&store, vec![good(1), bad, good(2), good(3)]).await;
        assert_eq!(outcome.inserted, 3);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.first_dirty_day, Some(day(2)));

        // the watermark may reach the day before the dirty chunk, never past it
        let range = DateRange::new(day(1), day(3)).unwrap();
        assert_eq!(clean_through(outcome.first_dirty_day, range), Some(day(1)));
        assert_eq!(clean_through(None, range), Some(day(3)));
        assert_eq!(clean_through(Some(day(1)), range), None);
    }

    #[tokio::test]
    async fn full_fixture_run_is_idempotent_and_advances_watermarks() {
        let workspace = tempdir().expect("tempdir");
        write_registry(workspace.path());
        let pipeline = SyncPipeline::open(test_config(workspace.path()))
            .await
            .expect("pipeline");

        let window = SyncWindow::Explicit(DateRange::new(day(1), day(31)).unwrap());
        let summary = pipeline.run("all", window, false).await.expect("first run");
        assert_eq!(summary.connectors.len(), 6);
        for connector in &summary.connectors {
            assert_eq!(connector.phase, RunPhase::Done, "{}", connector.source_id);
            assert_eq!(connector.failed_records, 0, "{}", connector.source_id);
            assert_eq!(connector.watermark, Some(day(31)), "{}", connector.source_id);
        }
        let (leads, purchases, ad_spend) = pipeline.store().counts().await;
        assert_eq!(leads, 3);
        assert!(purchases > 0);
        assert_eq!(ad_spend, 4);

        let manifest: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&summary.parquet_manifest).expect("manifest readable"),
        )
        .expect("manifest parses");
        assert_eq!(manifest["files"].as_array().map(Vec::len), Some(3));

        // re-running the same window must not duplicate anything
        let again = pipeline.run("all", window, true).await.expect("second run");
        for connector in &again.connectors {
            assert_eq!(connector.inserted, 0, "{}", connector.source_id);
        }
        let (leads2, purchases2, ad_spend2) = pipeline.store().counts().await;
        assert_eq!((leads2, purchases2, ad_spend2), (leads, purchases, ad_spend));
    }

    #[tokio::test]
    async fn repeated_window_without_override_is_rejected_per_connector() {
        let workspace = tempdir().expect("tempdir");
        write_registry(workspace.path());
        let pipeline = SyncPipeline::open(test_config(workspace.path()))
            .await
            .expect("pipeline");

        let full = SyncWindow::Explicit(DateRange::new(day(1), day(31)).unwrap());
        pipeline.run("all", full, false).await.expect("first run");

        let early = SyncWindow::Explicit(DateRange::new(day(1), day(5)).unwrap());
        let summary = pipeline.run("ga4", early, false).await.expect("guarded run");
        assert_eq!(summary.connectors.len(), 1);
        assert!(matches!(summary.connectors[0].phase, RunPhase::Failed(_)));
        // the guard leaves the watermark alone
        assert_eq!(pipeline.store().watermark("ga4").await, Some(day(31)));
    }

    #[tokio::test]
    async fn clean_backfill_does_not_regress_the_watermark() {
        let workspace = tempdir().expect("tempdir");
        write_registry(workspace.path());
        let pipeline = SyncPipeline::open(test_config(workspace.path()))
            .await
            .expect("pipeline");

        let full = SyncWindow::Explicit(DateRange::new(day(1), day(31)).unwrap());
        pipeline.run("ga4", full, false).await.expect("first run");
        assert_eq!(pipeline.store().watermark("ga4").await, Some(day(31)));

        // re-running an old window with the override succeeds but the days
        // after it are still known-synced
        let early = SyncWindow::Explicit(DateRange::new(day(1), day(5)).unwrap());
        let summary = pipeline.run("ga4", early, true).await.expect("backfill run");
        assert_eq!(summary.connectors[0].phase, RunPhase::Done);
        assert_eq!(pipeline.store().watermark("ga4").await, Some(day(31)));
    }

    #[tokio::test]
    async fn double_webhook_delivery_leaves_one_resolved_lead() {
        let store = FunnelStore::new();
        let payload = serde_json::json!({
            "email": "Dana@Example.com",
            "created_at": "2023-01-09T10:00:00Z",
            "gclid": "Cj0-double-delivery",
            "custom_fields": {"utm_source": "google", "utm_medium": "cpc"}
        });

        let first = ingest_webhook_lead(&store, &payload).await.expect("first");
        let second = ingest_webhook_lead(&store, &payload).await.expect("second");
        assert_eq!(first, UpsertOutcome::Inserted);
        assert_eq!(second, UpsertOutcome::Updated);

        let leads = store
            .leads_in_range(DateRange::new(day(1), day(31)).unwrap())
            .await;
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].email, "dana@example.com");
        assert_eq!(leads[0].resolved_platform, PlatformLabel::GoogleAds);
    }

    #[tokio::test]
    async fn webhook_without_email_is_rejected() {
        let store = FunnelStore::new();
        let payload = serde_json::json!({"created_at": "2023-01-09T10:00:00Z"});
        let err = ingest_webhook_lead(&store, &payload).await.unwrap_err();
        assert!(matches!(err, WebhookError::MissingEmail));
        let (leads, _, _) = store.counts().await;
        assert_eq!(leads, 0);
    }
}
