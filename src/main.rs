use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crypto_analytics::cache::ReadCache;
use crypto_analytics::cancel::CancelToken;
use crypto_analytics::config::{
    CorrelationSettings, FetchSettings, StrengthSettings, correlation_database_url,
    strength_database_url,
};
use crypto_analytics::loader::PriceMatrixLoader;
use crypto_analytics::pipeline::{
    CorrelationJob, JobOutcome, Pipeline, StrengthJob, acquire_lock,
};
use crypto_analytics::predictor::{LogisticModel, latest_features};
use crypto_analytics::records::{
    ASSET_PRICES_TABLE, CORRELATION_TABLE, RELATIVE_STRENGTH_TABLE, WIDE_CORRELATION_TABLE,
};
use crypto_analytics::source::{CsvSource, PriceSource, YahooSource};
use crypto_analytics::store::{ResultStore, SeriesQuery};
use crypto_analytics::summary::build_summary;
use crypto_analytics::{
    AllArgs, CorrelationArgs, FetchArgs, LastUpdateArgs, PredictArgs, RankArgs, RunArgs,
    StrengthArgs, SummaryArgs, rankings,
};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rebuild the rolling correlation table
    Correlation {
        #[command(flatten)]
        job: CorrelationArgs,
        #[command(flatten)]
        fetch: FetchArgs,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Rebuild the relative strength and asset price tables
    Strength {
        #[command(flatten)]
        job: StrengthArgs,
        #[command(flatten)]
        fetch: FetchArgs,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Run both jobs concurrently (default)
    All {
        #[command(flatten)]
        job: AllArgs,
        #[command(flatten)]
        fetch: FetchArgs,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Print gainers/losers, correlation and relative strength rankings as JSON
    Rank(RankArgs),
    /// Print the versioned data summary as JSON
    Summary(SummaryArgs),
    /// Score the latest indicators of a ticker with a logistic model
    Predict(PredictArgs),
    /// Print the latest stored date of every table
    LastUpdate(LastUpdateArgs),
}

const RANK_PERIOD_DAYS: i64 = 30;
const RANK_TOP: usize = 5;
const RANK_WINDOW: u32 = 30;
const SUMMARY_LIMIT: usize = 5;

fn apply_rank_defaults(args: &mut RankArgs) {
    args.period_days.get_or_insert(RANK_PERIOD_DAYS);
    args.top.get_or_insert(RANK_TOP);
    args.window.get_or_insert(RANK_WINDOW);
}

fn apply_summary_defaults(args: &mut SummaryArgs) {
    args.limit.get_or_insert(SUMMARY_LIMIT);
}

fn apply_predict_defaults(args: &mut PredictArgs) {
    if args.model.is_none() {
        args.model = Some(PathBuf::from("logistic_regression_model.json"));
    }
    if args.ticker.is_none() {
        args.ticker = Some("BTC-USD".to_string());
    }
}

fn build_loader(fetch: &FetchArgs) -> Result<Arc<PriceMatrixLoader>> {
    let settings = FetchSettings::from_args(fetch)?;
    let source: Arc<dyn PriceSource> = match &fetch.csv_dir {
        Some(dir) => Arc::new(CsvSource::new(dir.clone())),
        None => Arc::new(YahooSource::new(Duration::from_secs(settings.timeout_secs))?),
    };
    Ok(Arc::new(PriceMatrixLoader::new(source, settings)))
}

fn cancel_token(run: &RunArgs) -> CancelToken {
    let cancel = match run.budget_secs {
        Some(secs) => CancelToken::with_budget(Duration::from_secs(secs)),
        None => CancelToken::new(),
    };
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling before the next write");
            on_signal.cancel();
        }
    });
    cancel
}

fn finish(outcomes: &[JobOutcome]) -> Result<()> {
    let mut failed = Vec::new();
    for outcome in outcomes {
        match outcome {
            Ok(report) => {
                for (table, rows) in &report.tables {
                    println!("{}: {} rows -> {}", report.job, rows, table);
                }
                for path in &report.exported {
                    println!("{}: exported {}", report.job, path.display());
                }
            }
            Err(failure) => {
                println!("{}", failure);
                failed.push(failure.job.to_string());
            }
        }
    }
    if !failed.is_empty() {
        bail!("failed jobs: {}", failed.join(", "));
    }
    Ok(())
}

async fn run_all(job: AllArgs, fetch: FetchArgs, run: RunArgs) -> Result<()> {
    let _lock = run.lock_file.as_deref().map(acquire_lock).transpose()?;
    let loader = build_loader(&fetch)?;
    let correlation = CorrelationSettings::from_args(CorrelationArgs {
        start: job.start.clone(),
        end: job.end.clone(),
        database_url: job.correlation_database_url,
        export_dir: job.export_dir,
        ..Default::default()
    })?;
    let strength = StrengthSettings::from_args(StrengthArgs {
        start: job.start,
        end: job.end,
        database_url: job.strength_database_url,
        ..Default::default()
    })?;
    let correlation_store = ResultStore::connect(&correlation.universe.database_url).await?;
    let strength_store = ResultStore::connect(&strength.universe.database_url).await?;

    let cancel = cancel_token(&run);
    let report = Pipeline::new()
        .run_all(
            &CorrelationJob::new(correlation, loader.clone(), correlation_store),
            &StrengthJob::new(strength, loader, strength_store),
            &cancel,
        )
        .await;
    finish(&report.outcomes)
}

async fn open_stores(
    correlation_url: Option<String>,
    strength_url: Option<String>,
) -> Result<ReadCache> {
    let correlation = ResultStore::connect(&correlation_database_url(correlation_url)).await?;
    let strength = ResultStore::connect(&strength_database_url(strength_url)).await?;
    Ok(ReadCache::new(correlation, strength))
}

async fn rank(args: &RankArgs) -> Result<serde_json::Value> {
    let cache = open_stores(
        args.correlation_database_url.clone(),
        args.strength_database_url.clone(),
    )
    .await?;
    let (period_days, top, window) = (
        args.period_days.unwrap_or(RANK_PERIOD_DAYS),
        args.top.unwrap_or(RANK_TOP),
        args.window.unwrap_or(RANK_WINDOW),
    );

    let prices = cache.asset_prices(&SeriesQuery::default()).await?;
    let mut corr_query = SeriesQuery::default().window(window);
    if let Some(asset) = &args.asset {
        corr_query = corr_query.asset(asset.clone());
    }
    let correlations = cache.correlations(&corr_query).await?;
    let all_pairs = cache
        .correlations(&SeriesQuery::default().window(window))
        .await?;
    let strength = cache
        .relative_strength(&SeriesQuery::default().window(window))
        .await?;

    let mut mean_by_pair = rankings::mean_correlation_by_pair(&correlations);
    mean_by_pair.truncate(top);
    let mut strongest = rankings::relative_strength_ranking(&strength, window);
    strongest.truncate(top);
    Ok(json!({
        "performers": rankings::top_performers(&prices, period_days, top),
        "correlations": rankings::top_correlations(&correlations, top),
        "mean_correlation_by_pair": mean_by_pair,
        "relative_strength": strongest,
        "assets": rankings::assets_in_pairs(all_pairs.iter().map(|r| r.pair.as_str())),
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    match args.command {
        Some(Command::Correlation { job, fetch, run }) => {
            let _lock = run.lock_file.as_deref().map(acquire_lock).transpose()?;
            let settings = CorrelationSettings::from_args(job)?;
            let store = ResultStore::connect(&settings.universe.database_url).await?;
            let job = CorrelationJob::new(settings, build_loader(&fetch)?, store);
            let outcome = Pipeline::new().run_job(&job, &cancel_token(&run)).await;
            finish(&[outcome])?;
        }
        Some(Command::Strength { job, fetch, run }) => {
            let _lock = run.lock_file.as_deref().map(acquire_lock).transpose()?;
            let settings = StrengthSettings::from_args(job)?;
            let store = ResultStore::connect(&settings.universe.database_url).await?;
            let job = StrengthJob::new(settings, build_loader(&fetch)?, store);
            let outcome = Pipeline::new().run_job(&job, &cancel_token(&run)).await;
            finish(&[outcome])?;
        }
        Some(Command::All { job, fetch, run }) => {
            run_all(job, fetch, run).await?;
        }
        Some(Command::Rank(mut rank_args)) => {
            apply_rank_defaults(&mut rank_args);
            let out = rank(&rank_args).await?;
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Some(Command::Summary(mut summary_args)) => {
            apply_summary_defaults(&mut summary_args);
            let cache = open_stores(
                summary_args.correlation_database_url,
                summary_args.strength_database_url,
            )
            .await?;
            let all = SeriesQuery::default();
            let summary = build_summary(
                &*cache.asset_prices(&all).await?,
                &*cache.relative_strength(&all).await?,
                &*cache.correlations(&all).await?,
                summary_args.limit.unwrap_or(SUMMARY_LIMIT),
            );
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Some(Command::Predict(mut predict_args)) => {
            apply_predict_defaults(&mut predict_args);
            let model_path = predict_args.model.unwrap_or_default();
            let ticker = predict_args.ticker.unwrap_or_default().to_uppercase();
            let model = LogisticModel::load(&model_path)?;
            let store =
                ResultStore::connect(&strength_database_url(predict_args.strength_database_url))
                    .await?;
            let rows = store
                .asset_prices(&SeriesQuery::default().asset(ticker.clone()))
                .await?;
            let features = latest_features(&rows, &ticker)
                .with_context(|| format!("no complete indicator row for {}", ticker))?;
            let probability = model.predict_probability(&features);
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "ticker": ticker,
                    "probability_up": probability,
                }))?
            );
        }
        Some(Command::LastUpdate(last_args)) => {
            let correlation =
                ResultStore::connect(&correlation_database_url(last_args.correlation_database_url))
                    .await?;
            let strength =
                ResultStore::connect(&strength_database_url(last_args.strength_database_url))
                    .await?;
            let mut out = BTreeMap::new();
            for table in [CORRELATION_TABLE, WIDE_CORRELATION_TABLE] {
                out.insert(table, correlation.last_update(table).await?);
            }
            for table in [RELATIVE_STRENGTH_TABLE, ASSET_PRICES_TABLE] {
                out.insert(table, strength.last_update(table).await?);
            }
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        None => {
            // Default behavior: rebuild every table with default settings
            println!("Running both jobs with default arguments...");
            run_all(AllArgs::default(), FetchArgs::default(), RunArgs::default()).await?;
        }
    }
    Ok(())
}
