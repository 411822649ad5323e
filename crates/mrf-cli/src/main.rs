use anyhow::{bail, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use mrf_core::{DateRange, SourcePlatform};
use mrf_metrics::{compute_segment_metrics, MetricOptions, SegmentDimension};
use mrf_sync::{SyncConfig, SyncPipeline, SyncWindow};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "mrf-cli")]
#[command(about = "Marketing Revenue Funnel command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a sync pass over the source registry.
    Sync {
        /// "all" or a single source id from sources.yaml.
        #[arg(long, default_value = "all")]
        connector: String,
        /// Explicit window start; omit both dates for an incremental run.
        #[arg(long)]
        start: Option<NaiveDate>,
        #[arg(long)]
        end: Option<NaiveDate>,
        /// Allow re-running a window behind the watermark.
        #[arg(long)]
        backfill: bool,
    },
    /// Compute funnel metrics over the persisted store.
    Metrics {
        /// global | platform | campaign | adset | ad
        #[arg(long, default_value = "platform")]
        dimension: String,
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        /// Reporting platform whose purchase claims feed the numbers.
        #[arg(long, default_value = "ga4")]
        revenue_source: String,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("MRF_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn parse_dimension(input: &str) -> Result<SegmentDimension> {
    Ok(match input {
        "global" => SegmentDimension::Global,
        "platform" => SegmentDimension::Platform,
        "campaign" => SegmentDimension::Campaign,
        "adset" => SegmentDimension::Adset,
        "ad" => SegmentDimension::Ad,
        other => bail!("unknown dimension {other:?}"),
    })
}

fn parse_window(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Result<SyncWindow> {
    match (start, end) {
        (None, None) => Ok(SyncWindow::Incremental),
        (Some(start), Some(end)) => DateRange::new(start, end)
            .map(SyncWindow::Explicit)
            .ok_or_else(|| anyhow::anyhow!("window start {start} is after end {end}")),
        _ => bail!("--start and --end must be given together"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        connector: "all".to_string(),
        start: None,
        end: None,
        backfill: false,
    }) {
        Commands::Sync {
            connector,
            start,
            end,
            backfill,
        } => {
            let window = parse_window(start, end)?;
            let pipeline = SyncPipeline::open(SyncConfig::from_env()).await?;
            let summary = pipeline.run(&connector, window, backfill).await?;
            println!(
                "sync complete: run_id={} reports={}",
                summary.run_id, summary.reports_dir
            );
            for report in &summary.connectors {
                println!(
                    "  {}: {} (fetched {}, inserted {}, updated {}, failed {})",
                    report.source_id,
                    report.phase,
                    report.fetched_payloads,
                    report.inserted,
                    report.updated,
                    report.failed_records
                );
            }
        }
        Commands::Metrics {
            dimension,
            start,
            end,
            revenue_source,
        } => {
            let dimension = parse_dimension(&dimension)?;
            let Some(range) = DateRange::new(start, end) else {
                bail!("window start {start} is after end {end}");
            };
            let Some(revenue_source) = SourcePlatform::parse(&revenue_source) else {
                bail!("unknown revenue source {revenue_source:?}");
            };

            let pipeline = SyncPipeline::open(SyncConfig::from_env()).await?;
            let rows = compute_segment_metrics(
                pipeline.store(),
                dimension,
                range,
                MetricOptions { revenue_source },
            )
            .await;

            println!("{} rows for {range}", rows.len());
            for row in rows {
                let segment = [
                    row.key.platform.map(|p| p.to_string()),
                    row.key.campaign,
                    row.key.adset,
                    row.key.ad,
                ]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" / ");
                let segment = if segment.is_empty() {
                    "global".to_string()
                } else {
                    segment
                };
                println!(
                    "  {segment}: spend={} revenue={} purchases={} leads={} roas={} cpa={} cpl={} cr={}",
                    row.spend,
                    row.revenue,
                    row.purchases,
                    row.leads,
                    fmt_opt(row.roas),
                    fmt_opt(row.cpa),
                    fmt_opt(row.cpl),
                    fmt_opt(row.cr),
                );
            }
        }
    }

    Ok(())
}

fn fmt_opt<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}
