//! Golden tests over the checked-in vendor fixture payloads.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use mrf_connectors::{connector_for_source, normalize, ALL_SOURCE_IDS};
use mrf_core::{CanonicalRecord, DateRange, PlatformLabel, SourcePlatform};
use mrf_store::{HttpClientConfig, HttpFetcher};
use rust_decimal::Decimal;

fn fixtures_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .canonicalize()
        .expect("fixtures root")
}

fn january() -> DateRange {
    DateRange::new(
        NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
        NaiveDate::from_ymd_opt(2023, 1, 31).unwrap(),
    )
    .unwrap()
}

async fn normalized_fixture_records(source_id: &str) -> Vec<CanonicalRecord> {
    let connector = connector_for_source(source_id, fixtures_root()).expect("known source");
    let http = HttpFetcher::new(HttpClientConfig::default()).expect("http client");
    let payloads = connector.fetch(&http, january()).await.expect("fixtures load");
    payloads
        .iter()
        .flat_map(|p| normalize(&p.body, p.platform).expect("fixture normalizes"))
        .collect()
}

#[tokio::test]
async fn every_registered_source_has_a_loadable_fixture() {
    for source_id in ALL_SOURCE_IDS {
        let records = normalized_fixture_records(source_id).await;
        assert!(!records.is_empty(), "no records for {source_id}");
    }
}

#[tokio::test]
async fn kajabi_fixture_leads_resolve_expected_channels() {
    let records = normalized_fixture_records("kajabi").await;
    let leads: Vec<_> = records
        .iter()
        .filter_map(|r| match r {
            CanonicalRecord::Lead(l) => Some(l),
            _ => None,
        })
        .collect();
    assert_eq!(leads.len(), 3);
    assert_eq!(leads[0].email, "ana@example.com");
    assert_eq!(leads[0].resolved_platform, PlatformLabel::GoogleAds);
    assert_eq!(leads[0].click_ids.get("gclid").map(String::as_str), Some("Cj0KCQiA-spring-001"));
    assert_eq!(leads[1].resolved_platform, PlatformLabel::MetaAds);
    assert_eq!(leads[2].resolved_platform, PlatformLabel::Organic);
    assert_eq!(leads[2].utm_source, None);
}

#[tokio::test]
async fn ga4_fixture_claims_total_to_expected_revenue() {
    let records = normalized_fixture_records("ga4").await;
    let total: Decimal = records
        .iter()
        .filter_map(|r| match r {
            CanonicalRecord::Purchase(p) => Some(p.revenue),
            _ => None,
        })
        .sum();
    assert_eq!(total, Decimal::new(39600, 2));
}

#[tokio::test]
async fn payment_processor_fixtures_skip_non_final_states() {
    let stripe = normalized_fixture_records("stripe").await;
    // the failed payment in the fixture is filtered out
    assert_eq!(stripe.len(), 2);
    let hotmart = normalized_fixture_records("hotmart").await;
    assert_eq!(hotmart.len(), 1);
    for record in stripe.iter().chain(hotmart.iter()) {
        let CanonicalRecord::Purchase(p) = record else {
            panic!("processors only emit purchases");
        };
        assert_eq!(p.purchase_count, 1);
        assert!(matches!(
            p.reporting_platform,
            SourcePlatform::Stripe | SourcePlatform::Hotmart
        ));
    }
}

#[tokio::test]
async fn ad_network_fixtures_split_spend_from_claims() {
    for source_id in ["google_ads", "meta_ads"] {
        let records = normalized_fixture_records(source_id).await;
        let spend_rows = records
            .iter()
            .filter(|r| matches!(r, CanonicalRecord::AdSpend(_)))
            .count();
        let claim_rows = records
            .iter()
            .filter(|r| matches!(r, CanonicalRecord::Purchase(_)))
            .count();
        assert_eq!(spend_rows, 2, "{source_id}");
        assert_eq!(claim_rows, 2, "{source_id}");
    }
}
