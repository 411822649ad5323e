//! Funnel metric aggregation over the reconciled store.

use std::collections::BTreeMap;

use mrf_core::{DateRange, PlatformLabel, SourcePlatform};
use mrf_store::FunnelStore;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "mrf-metrics";

/// Rollup hierarchy, coarse to fine: Global ⊇ Platform ⊇ Campaign ⊇ Adset ⊇ Ad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentDimension {
    Global,
    Platform,
    Campaign,
    Adset,
    Ad,
}

/// Segment identifier; components beyond the requested dimension are None.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct SegmentKey {
    pub platform: Option<PlatformLabel>,
    pub campaign: Option<String>,
    pub adset: Option<String>,
    pub ad: Option<String>,
}

impl SegmentKey {
    /// Drop components finer than `dimension`, so that coarser rows are
    /// exactly the fold of finer rows sharing the kept prefix.
    fn truncate(mut self, dimension: SegmentDimension) -> Self {
        if dimension < SegmentDimension::Ad {
            self.ad = None;
        }
        if dimension < SegmentDimension::Adset {
            self.adset = None;
        }
        if dimension < SegmentDimension::Campaign {
            self.campaign = None;
        }
        if dimension < SegmentDimension::Platform {
            self.platform = None;
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentMetric {
    pub dimension: SegmentDimension,
    pub key: SegmentKey,
    pub spend: Decimal,
    pub revenue: Decimal,
    pub purchases: u64,
    pub leads: u64,
    /// revenue / spend; None when there is no spend.
    pub roas: Option<Decimal>,
    /// spend / purchases; None when there are no purchases.
    pub cpa: Option<Decimal>,
    /// spend / leads; None when there are no leads.
    pub cpl: Option<Decimal>,
    /// purchases / leads; None when there are no leads.
    pub cr: Option<Decimal>,
}

/// Which platform's purchase/revenue claim feeds the computation. Exactly
/// one reporting platform per computation; claims are never summed across
/// platforms into a "total".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricOptions {
    pub revenue_source: SourcePlatform,
}

impl Default for MetricOptions {
    fn default() -> Self {
        // the analytics platform is the configured single source of truth
        // for global rollups
        Self {
            revenue_source: SourcePlatform::Ga4,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Accumulator {
    spend: Decimal,
    revenue: Decimal,
    purchases: u64,
    leads: u64,
}

/// Compute segment metrics for one dimension over a date range. Base facts
/// are gathered at the finest key each row carries, then folded up to the
/// requested dimension, so coarse rows are sums of fine rows rather than an
/// independent query.
pub async fn compute_segment_metrics(
    store: &FunnelStore,
    dimension: SegmentDimension,
    range: DateRange,
    options: MetricOptions,
) -> Vec<SegmentMetric> {
    let mut buckets: BTreeMap<SegmentKey, Accumulator> = BTreeMap::new();

    for spend in store.ad_spend_in_range(range).await {
        let key = SegmentKey {
            platform: Some(spend.platform),
            campaign: Some(spend.campaign_id.clone()),
            adset: spend.adset_id.clone(),
            ad: spend.ad_id.clone(),
        }
        .truncate(dimension);
        buckets.entry(key).or_default().spend += spend.spend;
    }

    for purchase in store.purchases_in_range(range).await {
        if purchase.reporting_platform != options.revenue_source {
            continue;
        }
        // Analytics claims carry campaign names but no network ids, so with
        // an analytics revenue source the campaign-level revenue buckets sit
        // beside the id-keyed spend buckets instead of joining them; only
        // network claims, which carry ids, line up with spend below Platform.
        let key = SegmentKey {
            platform: Some(purchase.resolved_platform),
            campaign: purchase.campaign_id.clone().or(purchase.campaign.clone()),
            adset: purchase.adset_id.clone(),
            ad: purchase.ad_id.clone(),
        }
        .truncate(dimension);
        let acc = buckets.entry(key).or_default();
        acc.revenue += purchase.revenue;
        acc.purchases += purchase.purchase_count;
    }

    for lead in store.leads_in_range(range).await {
        let key = SegmentKey {
            platform: Some(lead.resolved_platform),
            campaign: lead.campaign_id.clone().or(lead.utm_campaign.clone()),
            adset: lead.adset_id.clone(),
            ad: lead.ad_id.clone(),
        }
        .truncate(dimension);
        buckets.entry(key).or_default().leads += 1;
    }

    buckets
        .into_iter()
        .map(|(key, acc)| {
            let purchases_dec = Decimal::from(acc.purchases);
            let leads_dec = Decimal::from(acc.leads);
            SegmentMetric {
                dimension,
                key,
                spend: acc.spend,
                revenue: acc.revenue,
                purchases: acc.purchases,
                leads: acc.leads,
                roas: protected_div(acc.revenue, acc.spend),
                cpa: protected_div(acc.spend, purchases_dec),
                cpl: protected_div(acc.spend, leads_dec),
                cr: protected_div(purchases_dec, leads_dec),
            }
        })
        .collect()
}

/// Division that yields None on a zero denominator instead of infinity or
/// an error.
pub fn protected_div(numerator: Decimal, denominator: Decimal) -> Option<Decimal> {
    if denominator.is_zero() {
        None
    } else {
        numerator.checked_div(denominator)
    }
}
