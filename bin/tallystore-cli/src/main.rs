//! Tallystore CLI - admin command line for local stores
//!
//! Opens one store directory and runs a single operation against it.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tallystore_common::{Error as StoreError, PoolConfig, StoreSettings, StoredValue, Timestamp};
use tallystore_engine::store::DATA_FILE;
use tallystore_engine::{
    BufferPool, Criteria, FieldValue, MetricQueryField, MetricStore, SearchSummary,
    StateQueryField, StateStore, StoreInfo, split_condition,
};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tallystore-cli")]
#[command(about = "Tallystore Admin CLI")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "TALLYSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Store directory
    #[arg(short, long)]
    store: PathBuf,

    /// Store flavour
    #[arg(short, long, value_enum, default_value = "metric")]
    kind: Kind,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Kind {
    Metric,
    State,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ValueKind {
    String,
    Integer,
    Float,
    Boolean,
    Bytes,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(flatten)]
    Store(StoreCommand),
    /// Show buffer pool classes as configured
    PoolStats,
}

/// Operations against the store directory
#[derive(Subcommand, Debug)]
enum StoreCommand {
    /// Insert an observation (metric) or a state (state). Creates the store
    /// if it does not exist.
    Insert {
        key: String,
        value: String,
        /// Observation or effective time (RFC 3339, defaults to now)
        #[arg(short, long)]
        time: Option<String>,
        /// Payload type for state stores
        #[arg(long, value_enum, default_value = "string")]
        value_type: ValueKind,
    },
    /// Show the aggregate (metric) or the state in effect (state) at a time
    Get {
        key: String,
        #[arg(short, long)]
        time: Option<String>,
    },
    /// Scan rows matching every `--where` condition
    Search {
        /// Condition such as `count>=2` or `key^=host`, repeatable
        #[arg(short, long = "where")]
        conditions: Vec<String>,
        /// Fields to print, comma separated
        #[arg(short, long, value_delimiter = ',')]
        fields: Vec<String>,
        /// Stop after this many matches
        #[arg(short, long, value_parser = clap::value_parser!(u64).range(1..))]
        limit: Option<u64>,
    },
    /// Merge another store of the same schema into this one
    Merge {
        source: PathBuf,
        /// Delete the source directory after a successful merge
        #[arg(long)]
        remove: bool,
    },
    /// Delete data older than a cutoff
    Retain {
        /// Age such as `30d`, `12h`, `90m` or `45s`
        #[arg(long, conflicts_with = "before")]
        older_than: Option<String>,
        /// Absolute cutoff (RFC 3339)
        #[arg(long)]
        before: Option<String>,
    },
    /// Drop state entries that repeat the previous payload for their key
    Condense {
        /// Age such as `30d`, `12h`, `90m` or `45s`
        #[arg(long, conflicts_with = "before")]
        older_than: Option<String>,
        /// Absolute cutoff (RFC 3339)
        #[arg(long)]
        before: Option<String>,
    },
    /// Reclaim free pages in the data file
    Compact,
    /// Show schema and table sizes
    Info,
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    store: StoreSettings,
    #[serde(default)]
    pool: PoolConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Default)]
struct LoggingConfig {
    #[serde(default)]
    level: Option<String>,
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let config_str = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&config_str).with_context(|| format!("parsing config {}", path.display()))
}

fn parse_time(value: Option<&str>) -> Result<Timestamp> {
    match value {
        Some(s) => Ok(DateTime::parse_from_rfc3339(s)
            .with_context(|| format!("invalid time '{s}'"))?
            .with_timezone(&Utc)),
        None => Ok(Utc::now()),
    }
}

/// Parse `<n><unit>` with unit one of s, m, h, d
fn parse_age(age: &str) -> Result<Duration> {
    let age = age.trim();
    let Some(unit) = age.chars().last() else {
        bail!("empty age");
    };
    let amount: i64 = age[..age.len() - unit.len_utf8()]
        .parse()
        .with_context(|| format!("invalid age '{age}'"))?;
    let duration = match unit {
        's' => Duration::try_seconds(amount),
        'm' => Duration::try_minutes(amount),
        'h' => Duration::try_hours(amount),
        'd' => Duration::try_days(amount),
        _ => bail!("unknown age unit '{unit}', expected s, m, h or d"),
    };
    duration.with_context(|| format!("age '{age}' out of range"))
}

fn parse_stored_value(kind: ValueKind, raw: &str) -> Result<StoredValue> {
    Ok(match kind {
        ValueKind::String => StoredValue::string(raw),
        ValueKind::Integer => StoredValue::integer(raw.parse()?),
        ValueKind::Float => StoredValue::float(raw.parse()?),
        ValueKind::Boolean => StoredValue::boolean(raw.parse()?),
        ValueKind::Bytes => StoredValue::bytes(raw.as_bytes()),
    })
}

fn metric_value(field: MetricQueryField, raw: &str) -> Result<FieldValue> {
    Ok(match field {
        MetricQueryField::Key => FieldValue::Bytes(raw.as_bytes().to_vec()),
        MetricQueryField::Bucket => FieldValue::Time(parse_time(Some(raw))?),
        _ => FieldValue::Int(raw.parse().with_context(|| format!("'{raw}' is not a number"))?),
    })
}

fn state_value(field: StateQueryField, raw: &str) -> Result<FieldValue> {
    Ok(match field {
        StateQueryField::Key | StateQueryField::Value => FieldValue::Bytes(raw.as_bytes().to_vec()),
        StateQueryField::Time | StateQueryField::InsertTime => {
            FieldValue::Time(parse_time(Some(raw))?)
        }
    })
}

/// AND together `field<op>value` conditions
fn build_criteria<F>(
    conditions: &[String],
    value: impl Fn(F, &str) -> Result<FieldValue>,
) -> Result<Criteria<F>>
where
    F: Copy + FromStr<Err = StoreError>,
{
    let mut criteria = Criteria::All;
    for expr in conditions {
        let (name, op, raw) = split_condition(expr)?;
        let field: F = name.parse()?;
        criteria = criteria.and(Criteria::condition(field, op, value(field, raw)?));
    }
    Ok(criteria)
}

fn parse_fields<F>(names: &[String], default: &[F]) -> Result<Vec<F>>
where
    F: Copy + FromStr<Err = StoreError>,
{
    if names.is_empty() {
        return Ok(default.to_vec());
    }
    names
        .iter()
        .map(|n| n.trim().parse().map_err(anyhow::Error::from))
        .collect()
}

fn print_row(values: &[FieldValue]) {
    let cells: Vec<String> = values.iter().map(ToString::to_string).collect();
    println!("{}", cells.join("\t"));
}

fn print_summary(summary: &SearchSummary) {
    println!(
        "-- {} matched, {} scanned, {} corrupt skipped{}",
        summary.matched,
        summary.scanned,
        summary.skipped_corrupt,
        if summary.stopped_early { ", stopped early" } else { "" }
    );
}

fn print_info(info: &StoreInfo) {
    println!("Store: {}", info.path.display());
    println!("Schema: {}", info.schema);
    println!("Rows: {}", info.rows);
    println!("Keys: {}", info.keys);
    println!("Values: {}", info.values);
    println!("File size: {} bytes", info.file_size);
}

fn print_pool_stats(pool: &BufferPool) {
    println!(
        "{:>10} {:>6} {:>8} {:>10} {:>8}",
        "CAPACITY", "MAX", "CREATED", "AVAILABLE", "ON LOAN"
    );
    for class in pool.stats() {
        println!(
            "{:>10} {:>6} {:>8} {:>10} {:>8}",
            class.capacity, class.max, class.created, class.available, class.on_loan
        );
    }
}

fn exists(store: &Path) -> bool {
    store.join(DATA_FILE).exists()
}

fn run_metric(
    path: &Path,
    command: &StoreCommand,
    settings: &StoreSettings,
    pool: Arc<BufferPool>,
) -> Result<()> {
    let create = matches!(command, StoreCommand::Insert { .. }) && !exists(path);
    let mut store = if create {
        info!("Creating metric store at {}", path.display());
        MetricStore::create(path, settings, pool)?
    } else {
        MetricStore::open(path, settings, pool)?
    };

    match command {
        StoreCommand::Insert { key, value, time, .. } => {
            let value: u64 = value.parse().with_context(|| format!("'{value}' is not a number"))?;
            let time = parse_time(time.as_deref())?;
            let mut writer = store.writer();
            store.insert(&mut writer, key.as_bytes(), time, value)?;
            writer.close()?;
            println!("Inserted {value} for '{key}' at {}", time.to_rfc3339());
        }
        StoreCommand::Get { key, time } => {
            let time = parse_time(time.as_deref())?;
            match store.get(key.as_bytes(), time)? {
                Some(metric) => {
                    println!("Key: {key}");
                    for slot in store.layout().slots() {
                        let value = metric.get(slot.field);
                        println!(
                            "  {}: {}",
                            slot.field.name(),
                            value.map_or_else(|| "-".to_string(), |v| v.to_string())
                        );
                    }
                }
                None => println!("No data for '{key}' at {}", time.to_rfc3339()),
            }
        }
        StoreCommand::Search { conditions, fields, limit } => {
            let criteria = build_criteria(conditions, metric_value)?;
            let fields = parse_fields(
                fields,
                &[MetricQueryField::Key, MetricQueryField::Bucket, MetricQueryField::Count],
            )?;
            let mut remaining = limit.unwrap_or(u64::MAX);
            let summary = store.search(&criteria, &fields, |row| {
                print_row(&row.values);
                remaining -= 1;
                if remaining == 0 { ControlFlow::Break(()) } else { ControlFlow::Continue(()) }
            })?;
            print_summary(&summary);
        }
        StoreCommand::Merge { source, remove } => {
            let mut writer = store.writer();
            let merged = if *remove {
                store.merge_and_remove(&mut writer, source)?
            } else {
                store.merge(&mut writer, source)?
            };
            writer.close()?;
            println!("Merged {merged} rows from {}", source.display());
        }
        StoreCommand::Retain { older_than, before } => {
            let cutoff = cutoff(older_than.as_deref(), before.as_deref())?;
            let mut writer = store.writer();
            let deleted = store.delete_old_data(&mut writer, cutoff)?;
            writer.close()?;
            println!("Deleted {deleted} rows older than {}", cutoff.to_rfc3339());
        }
        StoreCommand::Condense { .. } => bail!("condense applies to state stores only"),
        StoreCommand::Compact => {
            let compacted = store.compact()?;
            println!("Compaction {}", if compacted { "done" } else { "had nothing to do" });
        }
        StoreCommand::Info => print_info(&store.info()?),
    }
    store.close();
    Ok(())
}

fn run_state(
    path: &Path,
    command: &StoreCommand,
    settings: &StoreSettings,
    pool: Arc<BufferPool>,
) -> Result<()> {
    let create = matches!(command, StoreCommand::Insert { .. }) && !exists(path);
    let mut store = if create {
        info!("Creating state store at {}", path.display());
        StateStore::create(path, settings, pool)?
    } else {
        StateStore::open(path, settings, pool)?
    };

    match command {
        StoreCommand::Insert {
            key,
            value,
            time,
            value_type,
        } => {
            let value = parse_stored_value(*value_type, value)?;
            let time = parse_time(time.as_deref())?;
            let mut writer = store.writer();
            let stored = store.put(&mut writer, key.as_bytes(), time, &value)?;
            writer.close()?;
            println!("Stored '{key}' at {} as {stored}", time.to_rfc3339());
        }
        StoreCommand::Get { key, time } => {
            let time = parse_time(time.as_deref())?;
            match store.get(key.as_bytes(), time)? {
                Some(entry) => {
                    println!("Key: {key}");
                    println!("  since: {}", entry.time.to_rfc3339());
                    println!("  value: {}", entry.value.render());
                    println!("  type: {:?}", entry.value.value_type);
                    println!("  inserted: {}", entry.inserted.to_rfc3339());
                }
                None => println!("No state for '{key}' at {}", time.to_rfc3339()),
            }
        }
        StoreCommand::Search { conditions, fields, limit } => {
            let criteria = build_criteria(conditions, state_value)?;
            let fields = parse_fields(
                fields,
                &[StateQueryField::Key, StateQueryField::Time, StateQueryField::Value],
            )?;
            let mut remaining = limit.unwrap_or(u64::MAX);
            let summary = store.search(&criteria, &fields, |row| {
                print_row(&row.values);
                remaining -= 1;
                if remaining == 0 { ControlFlow::Break(()) } else { ControlFlow::Continue(()) }
            })?;
            print_summary(&summary);
        }
        StoreCommand::Merge { source, remove } => {
            let mut writer = store.writer();
            let merged = if *remove {
                store.merge_and_remove(&mut writer, source)?
            } else {
                store.merge(&mut writer, source)?
            };
            writer.close()?;
            println!("Merged {merged} entries from {}", source.display());
        }
        StoreCommand::Retain { older_than, before } => {
            let cutoff = cutoff(older_than.as_deref(), before.as_deref())?;
            let mut writer = store.writer();
            let deleted = store.delete_old_data(&mut writer, cutoff)?;
            writer.close()?;
            println!("Deleted {deleted} entries older than {}", cutoff.to_rfc3339());
        }
        StoreCommand::Condense { older_than, before } => {
            let cutoff = cutoff(older_than.as_deref(), before.as_deref())?;
            let mut writer = store.writer();
            let dropped = store.condense(&mut writer, cutoff)?;
            writer.close()?;
            println!("Dropped {dropped} repeated entries before {}", cutoff.to_rfc3339());
        }
        StoreCommand::Compact => {
            let compacted = store.compact()?;
            println!("Compaction {}", if compacted { "done" } else { "had nothing to do" });
        }
        StoreCommand::Info => print_info(&store.info()?),
    }
    store.close();
    Ok(())
}

/// Cutoff from either an age relative to now or an absolute time
fn cutoff(older_than: Option<&str>, before: Option<&str>) -> Result<Timestamp> {
    match (older_than, before) {
        (Some(age), None) => {
            let Some(cutoff) = Utc::now().checked_sub_signed(parse_age(age)?) else {
                bail!("age '{age}' reaches past the earliest supported time");
            };
            Ok(cutoff)
        }
        (None, Some(before)) => parse_time(Some(before)),
        _ => bail!("needs exactly one of --older-than or --before"),
    }
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    // Command line takes precedence over the config file
    let log_level = args
        .log_level
        .clone()
        .or_else(|| config.logging.level.clone())
        .unwrap_or_else(|| "warn".to_string());

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    debug!("Settings: {:?}", config.store);
    let pool = Arc::new(BufferPool::new(&config.pool));

    let command = match &args.command {
        Commands::PoolStats => {
            print_pool_stats(&pool);
            return Ok(());
        }
        Commands::Store(command) => command,
    };

    match args.kind {
        Kind::Metric => run_metric(&args.store, command, &config.store, pool),
        Kind::State => run_state(&args.store, command, &config.store, pool),
    }
}
