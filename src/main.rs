use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use proxion::{
    build_tasks, fold_outcomes, logging, CheckerConfig, CheckerPool, Config, FilterCriteria,
    HttpProber, JsonFileStore, PoolConfig, PoolStatus, Protocol, ProxyParser, ProxyRecord,
    RecordStore, StatusReporter,
};
use rand::seq::SliceRandom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// A proxy checker with a concurrent worker pool
#[derive(Parser)]
#[command(name = "proxion")]
#[command(about = "Check proxies concurrently and keep a database of working ones")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Show verbose info
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding the proxy database (default: ~/.cache/proxion)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Proxy database file name
    #[arg(long, global = true, default_value = proxion::DEFAULT_DB_FILE)]
    db_file: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Add proxies to the database
    #[command(visible_alias = "a")]
    Add {
        /// Literal proxies (IP:PORT) or files containing one proxy per line
        #[arg(required = true)]
        proxies: Vec<String>,
    },
    /// Remove proxies from the database
    #[command(visible_alias = "r")]
    Remove {
        /// Literal proxies (IP:PORT) or files containing one proxy per line
        #[arg(required = true)]
        proxies: Vec<String>,
    },
    /// Query the database for proxies
    #[command(visible_alias = "q")]
    Query {
        /// Number of proxies to return (0 = all)
        #[arg(short, long, default_value = "0")]
        num: usize,
        /// Don't shuffle the result
        #[arg(long)]
        no_shuffle: bool,
        /// Output format
        #[arg(short, long, value_enum, default_value = "json")]
        format: OutputFormat,
        /// Print JSON on a single line
        #[arg(long)]
        json_inline: bool,
        /// Only print the endpoints
        #[arg(long)]
        no_info: bool,
        /// Only return proxies known to work with these protocols
        #[arg(short, long, num_args = 1..)]
        protocols: Vec<String>,
    },
    /// Check proxies
    #[command(visible_alias = "c")]
    Check {
        /// Timeout in seconds
        #[arg(short, long, default_value = "10")]
        timeout: u64,
        /// Number of concurrent workers (default: CPUs - 1)
        #[arg(short, long)]
        max_threads: Option<usize>,
        /// Don't shuffle the job list
        #[arg(long)]
        no_shuffle: bool,
        /// Protocols to check for (default: all)
        #[arg(short, long, num_args = 1..)]
        protocols: Vec<String>,
        /// Skip proxies checked more recently than this [s, m, h, d, w, mo, y] (e.g. 10s, 20d, 3mo, 1y)
        #[arg(long)]
        older: Option<String>,
        /// Latency filter in seconds: +N keeps proxies at most N, -N keeps proxies at least N
        #[arg(long, allow_negative_numbers = true)]
        latency: Option<i64>,
        /// Keep only proxies exiting in these countries (e.g. US DE)
        #[arg(long, num_args = 1..)]
        exit_country: Vec<String>,
        /// Exclude proxies that lack the value a filter needs
        #[arg(short, long)]
        strict: bool,
        /// Check these proxies instead of the database
        #[arg(short, long, num_args = 1.., conflicts_with = "file")]
        literal: Vec<String>,
        /// Check proxies from these files instead of the database
        #[arg(short, long, num_args = 1..)]
        file: Vec<PathBuf>,
        /// Also write working endpoints to this file
        #[arg(short, long)]
        good: Option<PathBuf>,
        /// URL to probe through each proxy
        #[arg(long, default_value = "https://ipinfo.io/")]
        test_url: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Json,
    Grep,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let mut config = Config::new().with_db_file(cli.db_file.clone());
    if let Some(dir) = cli.store.clone() {
        if dir.is_dir() {
            config = config.with_store_dir(dir);
        } else {
            warn!("No such directory: {}, using default", dir.display());
        }
    }
    info!("Using proxy database {}", config.db_path().display());
    let mut store = JsonFileStore::open(config.db_path())
        .with_context(|| format!("Failed to open {}", config.db_path().display()))?;

    match cli.command {
        Commands::Add { proxies } => {
            let records = gather_records(&proxies)?;
            let added = store.insert_new(&records)?;
            info!("Added {} proxies ({} already known)", added, records.len() - added);
        }
        Commands::Remove { proxies } => {
            let endpoints: Vec<String> = gather_records(&proxies)?
                .iter()
                .map(|r| r.endpoint().to_string())
                .collect();
            let removed = store.remove_many(&endpoints)?;
            info!("Removed {} proxies", removed);
        }
        Commands::Query {
            num,
            no_shuffle,
            format,
            json_inline,
            no_info,
            protocols,
        } => {
            let output = query(
                &store,
                num,
                !no_shuffle,
                format,
                json_inline,
                !no_info,
                &protocols,
            )?;
            println!("{}", output);
        }
        Commands::Check {
            timeout,
            max_threads,
            no_shuffle,
            protocols,
            older,
            latency,
            exit_country,
            strict,
            literal,
            file,
            good,
            test_url,
        } => {
            let mut criteria = FilterCriteria::new()
                .with_exit_countries(&exit_country)?
                .with_strict(strict);
            if !protocols.is_empty() {
                criteria = criteria.with_protocol_names(&protocols)?;
            }
            if let Some(older) = older {
                criteria = criteria.with_staleness(&older)?;
            }
            if let Some(latency) = latency {
                criteria = criteria.with_latency_bound(latency);
            }

            let checklist = if !literal.is_empty() {
                info!("Checking proxies from CLI arguments");
                literal
                    .iter()
                    .map(|p| ProxyRecord::new(p))
                    .collect::<proxion::Result<Vec<_>>>()?
            } else if !file.is_empty() {
                info!("Checking proxies from CLI argument files");
                let mut records = Vec::new();
                for path in &file {
                    records.extend(ProxyParser::parse_file(path).with_context(|| {
                        format!("Failed to read proxies from {}", path.display())
                    })?);
                }
                records
            } else {
                info!("Checking proxies from the proxy database");
                store.load_all()?
            };

            let tasks = build_tasks(&checklist, &criteria, !no_shuffle)?;
            if tasks.is_empty() {
                info!("No proxies match the filters, nothing to check");
                return Ok(());
            }

            let checker_config = CheckerConfig::new()
                .with_timeout(Duration::from_secs(timeout))
                .with_test_url(test_url);
            let mut pool_config = PoolConfig::new();
            if let Some(threads) = max_threads {
                pool_config = pool_config.with_concurrency(threads);
            }
            info!(
                "Timeout {}s, shuffle {}, up to {} workers",
                timeout, !no_shuffle, pool_config.concurrency
            );

            let pool = CheckerPool::new(Arc::new(HttpProber::with_config(checker_config)), pool_config);
            let handle = pool.handle();

            let interrupt = handle.clone();
            tokio::spawn(async move {
                if signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, stopping workers");
                    interrupt.cancel();
                }
            });

            let (done_tx, done_rx) = oneshot::channel::<()>();
            let status_handle = handle.clone();
            let reporter = tokio::spawn(async move {
                StatusReporter::new(move || status_handle.snapshot())
                    .run_until(async {
                        let _ = done_rx.await;
                    })
                    .await;
            });

            let report = pool.run(tasks).await?;
            let _ = done_tx.send(());
            let _ = reporter.await;
            info!("{}", handle.snapshot());

            let records = fold_outcomes(&report.successes);
            let saved = store.merge_many(&records)?;
            info!("Saved {} working proxies to the database", saved);
            if let Some(path) = good {
                ProxyParser::save_to_file(&records, &path)?;
                info!("Wrote working endpoints to {}", path.display());
            }

            match report.status {
                PoolStatus::Completed => {}
                PoolStatus::Cancelled => warn!(
                    "Check interrupted after {}/{} jobs, partial results saved",
                    report.completed, report.total
                ),
                PoolStatus::Failed => {
                    let names: Vec<String> =
                        report.unsupported.iter().map(|p| p.to_string()).collect();
                    error!(
                        "Skipped {} jobs: protocol(s) {} are not supported by this build. \
                         Those proxies were NOT checked, they are not down.",
                        report.skipped,
                        names.join(", ")
                    );
                    bail!("unsupported protocol(s): {}", names.join(", "));
                }
            }
        }
    }

    Ok(())
}

/// Treat each argument as a file of proxies if it exists, otherwise as a
/// literal IP:PORT.
fn gather_records(args: &[String]) -> Result<Vec<ProxyRecord>> {
    let mut records = Vec::new();
    for arg in args {
        let path = Path::new(arg);
        if path.is_file() {
            let parsed = ProxyParser::parse_file(path)
                .with_context(|| format!("Failed to read proxies from {}", arg))?;
            info!("Read {} proxies from {}", parsed.len(), arg);
            records.extend(parsed);
        } else {
            match ProxyRecord::new(arg) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Invalid argument {}: {}", arg, e),
            }
        }
    }
    if records.is_empty() {
        return Err(anyhow!("no valid proxies given"));
    }
    Ok(records)
}

fn query(
    store: &JsonFileStore,
    num: usize,
    shuffle: bool,
    format: OutputFormat,
    json_inline: bool,
    info: bool,
    protocols: &[String],
) -> Result<String> {
    let wanted = protocols
        .iter()
        .map(|p| p.parse::<Protocol>())
        .collect::<proxion::Result<Vec<_>>>()?;

    let mut records: Vec<ProxyRecord> = store
        .load_all()?
        .into_iter()
        .filter(|r| wanted.is_empty() || wanted.iter().any(|p| r.protocols.contains(p)))
        .collect();
    if shuffle {
        records.shuffle(&mut rand::thread_rng());
    }
    if num > 0 {
        records.truncate(num);
    }

    let output = match format {
        OutputFormat::Json => {
            let values: Vec<serde_json::Value> = if info {
                records
                    .iter()
                    .map(serde_json::to_value)
                    .collect::<serde_json::Result<_>>()?
            } else {
                records
                    .iter()
                    .map(|r| serde_json::Value::from(r.endpoint()))
                    .collect()
            };
            if json_inline {
                serde_json::to_string(&values)?
            } else {
                serde_json::to_string_pretty(&values)?
            }
        }
        OutputFormat::Grep => records
            .iter()
            .map(|r| {
                if !info {
                    return r.endpoint().to_string();
                }
                let protos: Vec<&str> = r.protocols.iter().map(|p| p.as_str()).collect();
                format!(
                    "{} ,protos:{} ,last_check:{} ,last_lat:{} ,exit_country:{}",
                    r.endpoint(),
                    protos.join("|"),
                    r.last_checked_at
                        .map(|t| t.timestamp().to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    r.last_latency_secs
                        .map(|l| format!("{:.3}", l))
                        .unwrap_or_else(|| "-".to_string()),
                    r.exit_country.as_deref().unwrap_or("-"),
                )
            })
            .collect::<Vec<_>>()
            .join("\n"),
    };
    Ok(output)
}
