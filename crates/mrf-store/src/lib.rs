//! Idempotent canonical-record store, sync watermarks, and HTTP fetch
//! utilities for MRF.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use mrf_core::{
    resolve_lead_platform, AdSpendRecord, CanonicalLead, CanonicalPurchase, CanonicalRecord,
    DateRange, LeadKey, PurchaseKey, SpendKey,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "mrf-store";

/// Result of a single upsert against a natural key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("watermark for {connector} would regress from {current} to {requested}")]
    WatermarkRegression {
        connector: String,
        current: NaiveDate,
        requested: NaiveDate,
    },
}

#[derive(Debug, Default)]
struct StoreState {
    leads: BTreeMap<LeadKey, CanonicalLead>,
    purchases: BTreeMap<PurchaseKey, CanonicalPurchase>,
    ad_spend: BTreeMap<SpendKey, AdSpendRecord>,
    watermarks: BTreeMap<String, NaiveDate>,
}

/// On-disk layout: rows only, keys are re-derived on load.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreSnapshot {
    schema_version: u32,
    leads: Vec<CanonicalLead>,
    purchases: Vec<CanonicalPurchase>,
    ad_spend: Vec<AdSpendRecord>,
    watermarks: BTreeMap<String, NaiveDate>,
}

const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

impl StoreState {
    fn to_snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            leads: self.leads.values().cloned().collect(),
            purchases: self.purchases.values().cloned().collect(),
            ad_spend: self.ad_spend.values().cloned().collect(),
            watermarks: self.watermarks.clone(),
        }
    }

    fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let mut state = StoreState {
            watermarks: snapshot.watermarks,
            ..Default::default()
        };
        for lead in snapshot.leads {
            state.leads.insert(lead.natural_key(), lead);
        }
        for purchase in snapshot.purchases {
            state.purchases.insert(purchase.natural_key(), purchase);
        }
        for spend in snapshot.ad_spend {
            state.ad_spend.insert(spend.natural_key(), spend);
        }
        state
    }
}

/// Keyed store with entity-specific merge-on-conflict rules.
///
/// The interior mutex is the single serialization point for conflicting
/// writes: webhook ingestion and backfill runs both funnel through here.
#[derive(Debug, Default)]
pub struct FunnelStore {
    state: Mutex<StoreState>,
}

impl FunnelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert one record under its natural key. Re-delivery of logically
    /// identical input leaves exactly one row behind.
    pub async fn upsert(&self, record: CanonicalRecord) -> Result<UpsertOutcome, StoreError> {
        validate(&record)?;
        let mut state = self.state.lock().await;
        Ok(apply_upsert(&mut state, record))
    }

    /// Upsert a whole sync batch in arrival order. One bad record does not
    /// abort the rest; the caller gets a per-record outcome list.
    pub async fn upsert_batch(
        &self,
        records: Vec<CanonicalRecord>,
    ) -> Vec<Result<UpsertOutcome, StoreError>> {
        let mut state = self.state.lock().await;
        records
            .into_iter()
            .map(|record| {
                validate(&record)?;
                Ok(apply_upsert(&mut state, record))
            })
            .collect()
    }

    pub async fn leads_in_range(&self, range: DateRange) -> Vec<CanonicalLead> {
        let state = self.state.lock().await;
        state
            .leads
            .values()
            .filter(|l| range.contains(l.created_at.date_naive()))
            .cloned()
            .collect()
    }

    pub async fn purchases_in_range(&self, range: DateRange) -> Vec<CanonicalPurchase> {
        let state = self.state.lock().await;
        state
            .purchases
            .values()
            .filter(|p| range.contains(p.date))
            .cloned()
            .collect()
    }

    pub async fn ad_spend_in_range(&self, range: DateRange) -> Vec<AdSpendRecord> {
        let state = self.state.lock().await;
        state
            .ad_spend
            .values()
            .filter(|s| range.contains(s.date))
            .cloned()
            .collect()
    }

    pub async fn counts(&self) -> (usize, usize, usize) {
        let state = self.state.lock().await;
        (
            state.leads.len(),
            state.purchases.len(),
            state.ad_spend.len(),
        )
    }

    /// Latest date through which this connector's sync fully succeeded.
    pub async fn watermark(&self, connector: &str) -> Option<NaiveDate> {
        let state = self.state.lock().await;
        state.watermarks.get(connector).copied()
    }

    /// Advance a connector watermark. Regression is rejected unless the
    /// caller holds an explicit backfill override.
    pub async fn advance_watermark(
        &self,
        connector: &str,
        date: NaiveDate,
        backfill_override: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(current) = state.watermarks.get(connector).copied() {
            if date < current && !backfill_override {
                return Err(StoreError::WatermarkRegression {
                    connector: connector.to_string(),
                    current,
                    requested: date,
                });
            }
        }
        state.watermarks.insert(connector.to_string(), date);
        Ok(())
    }

    /// Persist the full store as one JSON document via atomic temp-file
    /// rename, so a crashed write never leaves a torn snapshot behind.
    pub async fn persist(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let bytes = {
            let state = self.state.lock().await;
            serde_json::to_vec_pretty(&state.to_snapshot()).context("serializing store snapshot")?
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating snapshot directory {}", parent.display()))?;
        }
        let temp_path = snapshot_temp_path(path);
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp snapshot {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot {}", temp_path.display()))?;
        drop(file);

        fs::rename(&temp_path, path).await.with_context(|| {
            format!(
                "atomically renaming snapshot {} -> {}",
                temp_path.display(),
                path.display()
            )
        })?;
        debug!(path = %path.display(), bytes = bytes.len(), "store snapshot persisted");
        Ok(())
    }

    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading store snapshot {}", path.display()))?;
        let snapshot: StoreSnapshot = serde_json::from_str(&text)
            .with_context(|| format!("parsing store snapshot {}", path.display()))?;
        Ok(Self {
            state: Mutex::new(StoreState::from_snapshot(snapshot)),
        })
    }

    /// Load if the snapshot exists, otherwise start empty.
    pub async fn load_or_default(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if fs::try_exists(path)
            .await
            .with_context(|| format!("checking snapshot path {}", path.display()))?
        {
            Self::load(path).await
        } else {
            Ok(Self::new())
        }
    }
}

fn snapshot_temp_path(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!(".{}.tmp", Uuid::new_v4()))
}

fn validate(record: &CanonicalRecord) -> Result<(), StoreError> {
    match record {
        CanonicalRecord::Lead(lead) => {
            if lead.email.trim().is_empty() {
                return Err(StoreError::InvalidRecord("lead with empty email".into()));
            }
        }
        CanonicalRecord::Purchase(p) => {
            if p.revenue.is_sign_negative() {
                return Err(StoreError::InvalidRecord(format!(
                    "purchase with negative revenue {}",
                    p.revenue
                )));
            }
        }
        CanonicalRecord::AdSpend(s) => {
            if s.campaign_id.trim().is_empty() {
                return Err(StoreError::InvalidRecord(
                    "ad spend with empty campaign_id".into(),
                ));
            }
            if s.spend.is_sign_negative() {
                return Err(StoreError::InvalidRecord(format!(
                    "ad spend with negative amount {}",
                    s.spend
                )));
            }
        }
    }
    Ok(())
}

fn apply_upsert(state: &mut StoreState, record: CanonicalRecord) -> UpsertOutcome {
    match record {
        CanonicalRecord::Lead(incoming) => {
            let key = incoming.natural_key();
            match state.leads.get_mut(&key) {
                Some(existing) => {
                    merge_lead(existing, incoming);
                    UpsertOutcome::Updated
                }
                None => {
                    state.leads.insert(key, incoming);
                    UpsertOutcome::Inserted
                }
            }
        }
        // Latest sync is authoritative for a platform's own report: ad
        // networks revise historical counts within their lookback window.
        CanonicalRecord::Purchase(incoming) => {
            let key = incoming.natural_key();
            match state.purchases.insert(key, incoming) {
                Some(_) => UpsertOutcome::Updated,
                None => UpsertOutcome::Inserted,
            }
        }
        CanonicalRecord::AdSpend(incoming) => {
            let key = incoming.natural_key();
            match state.ad_spend.insert(key, incoming) {
                Some(_) => UpsertOutcome::Updated,
                None => UpsertOutcome::Inserted,
            }
        }
    }
}

/// Lead conflict rule: keep the earliest created_at, fill only missing
/// fields from the incoming delivery, never erase a value with null.
fn merge_lead(existing: &mut CanonicalLead, incoming: CanonicalLead) {
    if incoming.created_at < existing.created_at {
        existing.created_at = incoming.created_at;
    }
    fill_missing(&mut existing.utm_source, incoming.utm_source);
    fill_missing(&mut existing.utm_medium, incoming.utm_medium);
    fill_missing(&mut existing.utm_campaign, incoming.utm_campaign);
    fill_missing(&mut existing.utm_content, incoming.utm_content);
    fill_missing(&mut existing.campaign_id, incoming.campaign_id);
    fill_missing(&mut existing.adset_id, incoming.adset_id);
    fill_missing(&mut existing.ad_id, incoming.ad_id);
    for (network, click_id) in incoming.click_ids {
        existing.click_ids.entry(network).or_insert(click_id);
    }
    existing.resolved_platform = resolve_lead_platform(
        &existing.click_ids,
        existing.utm_source.as_deref(),
        existing.utm_medium.as_deref(),
    );
}

fn fill_missing(slot: &mut Option<String>, incoming: Option<String>) {
    if slot.is_none() {
        *slot = incoming;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Retrying JSON fetcher shared by API-mode connectors. Each vendor call is
/// a bounded synchronous round-trip; transient failures back off
/// exponentially up to the policy's attempt count.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_json(&self, url: &str) -> Result<serde_json::Value, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        return Ok(resp.json().await?);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use mrf_core::{PlatformLabel, SourcePlatform};
    use rust_decimal::Decimal;
    use tempfile::tempdir;

    fn lead(email: &str, utm_campaign: Option<&str>) -> CanonicalRecord {
        CanonicalRecord::Lead(CanonicalLead {
            email: email.to_string(),
            created_at: Utc.with_ymd_and_hms(2023, 1, 1, 12, 0, 0).single().unwrap(),
            source_platform: SourcePlatform::Kajabi,
            utm_source: Some("google".into()),
            utm_medium: Some("cpc".into()),
            utm_campaign: utm_campaign.map(str::to_string),
            utm_content: None,
            click_ids: Default::default(),
            campaign_id: None,
            adset_id: None,
            ad_id: None,
            resolved_platform: PlatformLabel::GoogleAds,
        })
    }

    fn purchase(revenue: i64) -> CanonicalRecord {
        CanonicalRecord::Purchase(CanonicalPurchase {
            date: NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            source: Some("google".into()),
            medium: Some("cpc".into()),
            campaign: Some("spring".into()),
            item_name: None,
            purchase_count: 3,
            revenue: Decimal::new(revenue, 2),
            reporting_platform: SourcePlatform::Ga4,
            resolved_platform: PlatformLabel::GoogleAds,
            campaign_id: None,
            adset_id: None,
            ad_id: None,
        })
    }

    #[tokio::test]
    async fn redelivery_is_idempotent() {
        let store = FunnelStore::new();
        assert_eq!(
            store.upsert(lead("a@x.com", Some("spring"))).await.unwrap(),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            store.upsert(lead("a@x.com", Some("spring"))).await.unwrap(),
            UpsertOutcome::Updated
        );
        let (leads, _, _) = store.counts().await;
        assert_eq!(leads, 1);
    }

    #[tokio::test]
    async fn lead_merge_fills_missing_but_never_erases() {
        let store = FunnelStore::new();
        store.upsert(lead("a@x.com", None)).await.unwrap();
        store.upsert(lead("a@x.com", Some("summer"))).await.unwrap();
        store.upsert(lead("a@x.com", None)).await.unwrap();

        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2023, 1, 2).unwrap(),
        )
        .unwrap();
        let leads = store.leads_in_range(range).await;
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].utm_campaign.as_deref(), Some("summer"));
    }

    #[tokio::test]
    async fn purchase_upsert_replaces_revised_counts() {
        let store = FunnelStore::new();
        store.upsert(purchase(1000)).await.unwrap();
        store.upsert(purchase(1250)).await.unwrap();

        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
        )
        .unwrap();
        let purchases = store.purchases_in_range(range).await;
        assert_eq!(purchases.len(), 1);
        assert_eq!(purchases[0].revenue, Decimal::new(1250, 2));
    }

    #[tokio::test]
    async fn batch_isolates_per_record_failures() {
        let store = FunnelStore::new();
        let bad = CanonicalRecord::AdSpend(AdSpendRecord {
            date: NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            platform: PlatformLabel::MetaAds,
            campaign_id: "".into(),
            adset_id: None,
            ad_id: None,
            spend: Decimal::ZERO,
        });
        let outcomes = store
            .upsert_batch(vec![purchase(1000), bad, lead("a@x.com", None)])
            .await;
        assert!(outcomes[0].is_ok());
        assert!(outcomes[1].is_err());
        assert!(outcomes[2].is_ok());
        let (leads, purchases, spend) = store.counts().await;
        assert_eq!((leads, purchases, spend), (1, 1, 0));
    }

    #[tokio::test]
    async fn watermark_rejects_regression_without_override() {
        let store = FunnelStore::new();
        let d1 = NaiveDate::from_ymd_opt(2023, 3, 10).unwrap();
        let d0 = NaiveDate::from_ymd_opt(2023, 3, 1).unwrap();
        store.advance_watermark("ga4", d1, false).await.unwrap();
        let err = store.advance_watermark("ga4", d0, false).await.unwrap_err();
        assert!(matches!(err, StoreError::WatermarkRegression { .. }));
        store.advance_watermark("ga4", d0, true).await.unwrap();
        assert_eq!(store.watermark("ga4").await, Some(d0));
    }

    #[tokio::test]
    async fn snapshot_round_trips_via_atomic_rename() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("funnel.json");
        let store = FunnelStore::new();
        store.upsert(purchase(500)).await.unwrap();
        store
            .advance_watermark("ga4", NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(), false)
            .await
            .unwrap();
        store.persist(&path).await.unwrap();

        let reloaded = FunnelStore::load(&path).await.unwrap();
        let (_, purchases, _) = reloaded.counts().await;
        assert_eq!(purchases, 1);
        assert_eq!(
            reloaded.watermark("ga4").await,
            NaiveDate::from_ymd_opt(2023, 1, 1)
        );
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }
}
