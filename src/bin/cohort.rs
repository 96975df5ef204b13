//! Kuba Cohort command line client
//!
//! Tracks events and runs cohort queries against a Redis bit store.
//!
//! # Commands
//!
//! - `track` - Record that an entity performed an action
//! - `has` - Check whether an entity performed an action in a window
//! - `count` - Count a cohort built from events
//! - `members` - List the entity ids of a cohort
//! - `counts` - Per-period counts of one action
//! - `check-config` - Validate configuration and print a summary
//!
//! # Configuration
//!
//! Read from, in order:
//! 1. `--config <path>` or the `COHORT_CONFIG` environment variable
//! 2. `./cohort.toml` in the current directory
//! 3. Default configuration
//!
//! `COHORT_*` variables and `RUST_LOG` override file values.
//!
//! # Example Usage
//!
//! ```bash
//! cohort track video:watch 12 --at 2024-03-05T10:07:00Z
//! cohort count video:watch --not shop:purchase \
//!     --start 2024-03-01T00:00:00Z --end 2024-04-01T00:00:00Z
//! cohort counts video:watch --granularity day \
//!     --start 2024-03-01T00:00:00Z --end 2024-03-08T00:00:00Z
//! ```

use chrono::{DateTime, Utc, Weekday};
use clap::{Parser, Subcommand, ValueEnum};
use kuba_cohort::{
    store::redis::{util::sanitize_url, RedisBitStore},
    CohortConfig, CohortEngine, CohortExpr, CountsQuery, EntityId, Granularity, TimeRange,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// CLI Definition
// =============================================================================

#[derive(Parser)]
#[command(name = "cohort")]
#[command(version)]
#[command(about = "Time-bucketed bitmap cohort analytics", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "COHORT_CONFIG")]
    config: Option<PathBuf>,

    /// Override the Redis URL
    #[arg(long, global = true)]
    redis_url: Option<String>,
}

/// Query window shared by the read commands
#[derive(clap::Args)]
struct Window {
    /// Window start (RFC 3339); defaults to the start of the current UTC day
    #[arg(long)]
    start: Option<DateTime<Utc>>,

    /// Window end (RFC 3339, exclusive); defaults to one day after start
    #[arg(long)]
    end: Option<DateTime<Utc>>,

    /// Finest bucket granularity used to cover the window; must not be finer
    /// than the granularity the events were tracked at
    #[arg(long)]
    leaf: Option<Granularity>,
}

/// Cohort definition shared by `count` and `members`
#[derive(clap::Args)]
struct CohortArgs {
    /// Events combined with --op, as category:action
    #[arg(required = true)]
    events: Vec<String>,

    /// How the events are combined
    #[arg(long, value_enum, default_value = "and")]
    op: Combine,

    /// Events whose entities are removed from the result, as category:action
    #[arg(long = "not")]
    exclude: Vec<String>,

    #[command(flatten)]
    window: Window,
}

#[derive(Clone, Copy, ValueEnum)]
enum Combine {
    And,
    Or,
    Xor,
}

#[derive(Subcommand)]
enum Commands {
    /// Record that an entity performed an action
    Track {
        /// Event as category:action
        event: String,

        /// Entity id (bit offset)
        entity: EntityId,

        /// Event time (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,

        /// Tracking granularity; coarser buckets are updated as well
        #[arg(long)]
        granularity: Option<Granularity>,
    },

    /// Check whether an entity performed an action in a window
    Has {
        /// Event as category:action
        event: String,

        /// Entity id
        entity: EntityId,

        #[command(flatten)]
        window: Window,
    },

    /// Count the entities in a cohort
    Count(CohortArgs),

    /// List the entity ids in a cohort
    Members {
        #[command(flatten)]
        cohort: CohortArgs,

        /// Print at most this many ids
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Per-period counts of one action
    Counts {
        /// Event as category:action
        event: String,

        /// Reporting granularity
        #[arg(long, default_value = "day")]
        granularity: Granularity,

        /// Report 0/1 presence of this entity instead of counts
        #[arg(long)]
        entity: Option<EntityId>,

        /// Override the first day of week
        #[arg(long)]
        first_day_of_week: Option<Weekday>,

        #[command(flatten)]
        window: Window,
    },

    /// Validate configuration and print a summary
    CheckConfig,
}

// =============================================================================
// Helpers
// =============================================================================

fn load_config(cli: &Cli) -> Result<CohortConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => CohortConfig::from_file_with_env(path)?,
        None if Path::new("cohort.toml").exists() => CohortConfig::from_file_with_env("cohort.toml")?,
        None => CohortConfig::from_env(),
    };
    if let Some(url) = &cli.redis_url {
        config.redis.url = url.clone();
    }
    config.validate()?;
    Ok(config)
}

fn init_tracing(config: &CohortConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.monitoring.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

async fn connect(config: &CohortConfig) -> Result<CohortEngine, Box<dyn std::error::Error>> {
    let store = RedisBitStore::connect(config.to_redis_config()).await?;
    info!(redis = %sanitize_url(&config.redis.url), "Connected to Redis");
    Ok(CohortEngine::new(Arc::new(store), config.to_engine_config()?)?)
}

fn split_event(event: &str) -> Result<(&str, &str), String> {
    event
        .split_once(':')
        .ok_or_else(|| format!("event '{}' must be written as category:action", event))
}

fn resolve_window(window: &Window) -> kuba_cohort::Result<TimeRange> {
    let start = window
        .start
        .unwrap_or_else(|| TimeRange::day_of(Utc::now()).start);
    let end = window.end.unwrap_or(start + chrono::Duration::days(1));
    TimeRange::new(start, end)
}

fn build_cohort(
    engine: &CohortEngine,
    args: &CohortArgs,
) -> Result<CohortExpr, Box<dyn std::error::Error>> {
    let range = resolve_window(&args.window)?;
    let leaf = args.window.leaf.unwrap_or(engine.config().default_granularity);

    let leaf_event = |name: &str| -> Result<CohortExpr, String> {
        let (category, action) = split_event(name)?;
        Ok(engine.event(category, action, range).with_granularity(leaf).into())
    };

    let included = args
        .events
        .iter()
        .map(|e| leaf_event(e))
        .collect::<Result<Vec<_>, _>>()?;
    let mut expr = match args.op {
        Combine::And => CohortExpr::and(included),
        Combine::Or => CohortExpr::or(included),
        Combine::Xor => CohortExpr::xor(included),
    };

    if !args.exclude.is_empty() {
        let excluded = args
            .exclude
            .iter()
            .map(|e| leaf_event(e))
            .collect::<Result<Vec<_>, _>>()?;
        expr = CohortExpr::and([expr, CohortExpr::not(CohortExpr::or(excluded))]);
    }

    debug!("Cohort expression: {}", expr);
    Ok(expr)
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(&config);

    if let Commands::CheckConfig = cli.command {
        println!("Configuration is valid!");
        println!();
        println!("Redis:");
        println!("  URL: {}", sanitize_url(&config.redis.url));
        println!("  Pool size: {}", config.redis.pool_size);
        println!("  TLS: {}", config.redis.tls_enabled);
        println!();
        println!("Engine:");
        println!("  Namespace: {}", config.engine.namespace);
        println!("  First day of week: {}", config.engine.first_day_of_week);
        println!("  Default granularity: {}", config.engine.default_granularity);
        println!("  Max concurrent fetches: {}", config.engine.max_concurrent_fetches);
        println!();
        println!("Log level: {}", config.monitoring.log_level);
        return Ok(());
    }

    let engine = connect(&config).await?;

    match &cli.command {
        Commands::Track {
            event,
            entity,
            at,
            granularity,
        } => {
            let (category, action) = split_event(event)?;
            let granularity = granularity.unwrap_or(engine.config().default_granularity);
            let at = at.unwrap_or_else(Utc::now);
            let newly_set = engine
                .track_event_at(category, action, *entity, granularity, at)
                .await?;
            println!("{}", if newly_set { "tracked" } else { "already tracked" });
        },
        Commands::Has {
            event,
            entity,
            window,
        } => {
            let (category, action) = split_event(event)?;
            let range = resolve_window(window)?;
            let found = match window.leaf {
                Some(leaf) => {
                    engine
                        .has_event_with_granularity(category, action, *entity, leaf, &range)
                        .await?
                },
                None => engine.has_event(category, action, *entity, &range).await?,
            };
            println!("{}", found);
        },
        Commands::Count(args) => {
            let expr = build_cohort(&engine, args)?;
            println!("{}", engine.count(&expr).await?);
        },
        Commands::Members { cohort, limit } => {
            let expr = build_cohort(&engine, cohort)?;
            let members = engine.entities(&expr).await?;
            for id in members.take(limit.unwrap_or(usize::MAX)) {
                println!("{}", id);
            }
        },
        Commands::Counts {
            event,
            granularity,
            entity,
            first_day_of_week,
            window,
        } => {
            let (category, action) = split_event(event)?;
            let mut query = CountsQuery::new(category, action, resolve_window(window)?, *granularity);
            if let Some(entity) = entity {
                query = query.for_entity(*entity);
            }
            if let Some(weekday) = first_day_of_week {
                query = query.with_first_day_of_week(*weekday);
            }
            for period in engine.get_counts(&query).await? {
                println!("{}\t{}", period.period_start.to_rfc3339(), period.count);
            }
        },
        Commands::CheckConfig => {},
    }

    Ok(())
}
