//! Canonical event schema and channel attribution for MRF.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "mrf-core";

/// System that emitted a raw record (or claims credit for one).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourcePlatform {
    Kajabi,
    Stripe,
    Hotmart,
    GoogleAds,
    MetaAds,
    Ga4,
}

impl SourcePlatform {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourcePlatform::Kajabi => "kajabi",
            SourcePlatform::Stripe => "stripe",
            SourcePlatform::Hotmart => "hotmart",
            SourcePlatform::GoogleAds => "google_ads",
            SourcePlatform::MetaAds => "meta_ads",
            SourcePlatform::Ga4 => "ga4",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "kajabi" => Some(SourcePlatform::Kajabi),
            "stripe" => Some(SourcePlatform::Stripe),
            "hotmart" => Some(SourcePlatform::Hotmart),
            "google_ads" => Some(SourcePlatform::GoogleAds),
            "meta_ads" => Some(SourcePlatform::MetaAds),
            "ga4" => Some(SourcePlatform::Ga4),
            _ => None,
        }
    }
}

impl fmt::Display for SourcePlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Acquisition channel assigned by the attribution resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformLabel {
    GoogleAds,
    MetaAds,
    Organic,
    Unknown,
}

impl PlatformLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformLabel::GoogleAds => "google_ads",
            PlatformLabel::MetaAds => "meta_ads",
            PlatformLabel::Organic => "organic",
            PlatformLabel::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PlatformLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Assign a channel label from UTM source/medium.
///
/// The rule table is deliberately small and auditable; first match wins.
/// Unrecognized source with a paid medium and genuinely organic traffic are
/// distinct business situations that currently share the fallthrough rows;
/// keep it that way until product says otherwise.
pub fn resolve_platform(utm_source: Option<&str>, utm_medium: Option<&str>) -> PlatformLabel {
    const PAID_MEDIUMS: [&str; 2] = ["cpc", "ppc"];

    let source = utm_source.map(|s| s.trim().to_ascii_lowercase());
    let medium = utm_medium.map(|m| m.trim().to_ascii_lowercase());
    let paid = medium
        .as_deref()
        .map(|m| PAID_MEDIUMS.contains(&m))
        .unwrap_or(false);

    if !paid {
        return PlatformLabel::Organic;
    }
    match source.as_deref() {
        Some("google") => PlatformLabel::GoogleAds,
        Some("facebook") | Some("instagram") => PlatformLabel::MetaAds,
        _ => PlatformLabel::Unknown,
    }
}

/// Channel resolution for leads: an explicit click id outranks the UTM table.
pub fn resolve_lead_platform(
    click_ids: &BTreeMap<String, String>,
    utm_source: Option<&str>,
    utm_medium: Option<&str>,
) -> PlatformLabel {
    if click_ids.contains_key("gclid") {
        return PlatformLabel::GoogleAds;
    }
    if click_ids.contains_key("fbclid") {
        return PlatformLabel::MetaAds;
    }
    resolve_platform(utm_source, utm_medium)
}

/// Lowercase + trim; empty input collapses to None.
pub fn normalize_email(raw: &str) -> Option<String> {
    let trimmed = raw.trim().to_ascii_lowercase();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Inclusive calendar-day window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        if start <= end {
            Some(Self { start, end })
        } else {
            None
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.start.iter_days().take_while(move |d| *d <= self.end)
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// A prospective customer signup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalLead {
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub source_platform: SourcePlatform,
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_campaign: Option<String>,
    pub utm_content: Option<String>,
    pub click_ids: BTreeMap<String, String>,
    pub campaign_id: Option<String>,
    pub adset_id: Option<String>,
    pub ad_id: Option<String>,
    pub resolved_platform: PlatformLabel,
}

impl CanonicalLead {
    pub fn natural_key(&self) -> LeadKey {
        LeadKey {
            email: self.email.clone(),
            source_platform: self.source_platform,
            // second precision: re-deliveries carry the same wall-clock second
            created_at_epoch_secs: self.created_at.timestamp(),
        }
    }
}

/// Daily purchase/revenue claim as reported by one platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalPurchase {
    pub date: NaiveDate,
    pub source: Option<String>,
    pub medium: Option<String>,
    pub campaign: Option<String>,
    pub item_name: Option<String>,
    pub purchase_count: u64,
    pub revenue: Decimal,
    pub reporting_platform: SourcePlatform,
    pub resolved_platform: PlatformLabel,
    pub campaign_id: Option<String>,
    pub adset_id: Option<String>,
    pub ad_id: Option<String>,
}

impl CanonicalPurchase {
    pub fn natural_key(&self) -> PurchaseKey {
        PurchaseKey {
            date: self.date,
            source: self.source.clone().unwrap_or_default(),
            medium: self.medium.clone().unwrap_or_default(),
            campaign: self.campaign.clone().unwrap_or_default(),
            item_name: self.item_name.clone().unwrap_or_default(),
            reporting_platform: self.reporting_platform,
        }
    }
}

/// Daily spend by ad-hierarchy node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdSpendRecord {
    pub date: NaiveDate,
    pub platform: PlatformLabel,
    pub campaign_id: String,
    pub adset_id: Option<String>,
    pub ad_id: Option<String>,
    pub spend: Decimal,
}

impl AdSpendRecord {
    pub fn natural_key(&self) -> SpendKey {
        SpendKey {
            date: self.date,
            platform: self.platform,
            campaign_id: self.campaign_id.clone(),
            adset_id: self.adset_id.clone().unwrap_or_default(),
            ad_id: self.ad_id.clone().unwrap_or_default(),
        }
    }
}

/// Composite natural key for leads (email + origin + second-precision time).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LeadKey {
    pub email: String,
    pub source_platform: SourcePlatform,
    pub created_at_epoch_secs: i64,
}

/// Composite natural key for purchase claims. Optional segment components
/// normalize to "" so the key is always fully defined.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PurchaseKey {
    pub date: NaiveDate,
    pub source: String,
    pub medium: String,
    pub campaign: String,
    pub item_name: String,
    pub reporting_platform: SourcePlatform,
}

/// Composite natural key for daily ad spend.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SpendKey {
    pub date: NaiveDate,
    pub platform: PlatformLabel,
    pub campaign_id: String,
    pub adset_id: String,
    pub ad_id: String,
}

/// Tagged union handed from normalizers into the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CanonicalRecord {
    Lead(CanonicalLead),
    Purchase(CanonicalPurchase),
    AdSpend(AdSpendRecord),
}

impl CanonicalRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            CanonicalRecord::Lead(_) => "lead",
            CanonicalRecord::Purchase(_) => "purchase",
            CanonicalRecord::AdSpend(_) => "ad_spend",
        }
    }

    /// Calendar day the record belongs to, for chunked windows.
    pub fn record_date(&self) -> NaiveDate {
        match self {
            CanonicalRecord::Lead(lead) => lead.created_at.date_naive(),
            CanonicalRecord::Purchase(p) => p.date,
            CanonicalRecord::AdSpend(s) => s.date,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn attribution_rule_table_is_deterministic() {
        assert_eq!(
            resolve_platform(Some("google"), Some("cpc")),
            PlatformLabel::GoogleAds
        );
        assert_eq!(
            resolve_platform(Some("google"), Some("ppc")),
            PlatformLabel::GoogleAds
        );
        assert_eq!(
            resolve_platform(Some("facebook"), Some("cpc")),
            PlatformLabel::MetaAds
        );
        assert_eq!(
            resolve_platform(Some("instagram"), Some("ppc")),
            PlatformLabel::MetaAds
        );
        assert_eq!(resolve_platform(None, None), PlatformLabel::Organic);
        assert_eq!(
            resolve_platform(Some("newsletter"), Some("email")),
            PlatformLabel::Organic
        );
        assert_eq!(
            resolve_platform(Some("bing"), Some("cpc")),
            PlatformLabel::Unknown
        );
    }

    #[test]
    fn attribution_normalizes_case_and_whitespace() {
        assert_eq!(
            resolve_platform(Some(" Google "), Some("CPC")),
            PlatformLabel::GoogleAds
        );
    }

    #[test]
    fn click_id_outranks_utm_table() {
        let mut click_ids = BTreeMap::new();
        click_ids.insert("fbclid".to_string(), "abc".to_string());
        assert_eq!(
            resolve_lead_platform(&click_ids, Some("google"), Some("cpc")),
            PlatformLabel::MetaAds
        );
        assert_eq!(
            resolve_lead_platform(&BTreeMap::new(), Some("google"), Some("cpc")),
            PlatformLabel::GoogleAds
        );
    }

    #[test]
    fn email_normalization_trims_and_lowercases() {
        assert_eq!(normalize_email("  A@X.Com "), Some("a@x.com".to_string()));
        assert_eq!(normalize_email("   "), None);
    }

    #[test]
    fn lead_key_truncates_to_second_precision() {
        let base = Utc.with_ymd_and_hms(2023, 1, 1, 12, 0, 0).single().unwrap();
        let lead = CanonicalLead {
            email: "a@x.com".into(),
            created_at: base + chrono::Duration::milliseconds(750),
            source_platform: SourcePlatform::Kajabi,
            utm_source: None,
            utm_medium: None,
            utm_campaign: None,
            utm_content: None,
            click_ids: BTreeMap::new(),
            campaign_id: None,
            adset_id: None,
            ad_id: None,
            resolved_platform: PlatformLabel::Organic,
        };
        let mut redelivered = lead.clone();
        redelivered.created_at = base;
        assert_eq!(lead.natural_key(), redelivered.natural_key());
    }

    #[test]
    fn spend_key_normalizes_optional_hierarchy_to_empty() {
        let record = AdSpendRecord {
            date: NaiveDate::from_ymd_opt(2023, 5, 1).unwrap(),
            platform: PlatformLabel::GoogleAds,
            campaign_id: "c1".into(),
            adset_id: None,
            ad_id: None,
            spend: Decimal::new(1050, 2),
        };
        let key = record.natural_key();
        assert_eq!(key.adset_id, "");
        assert_eq!(key.ad_id, "");
    }
}
