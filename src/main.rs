use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use open_proxy_engine::{
    config::{SettingsWatcher, Settings},
    database::{NewUser, ProxyDatabase},
    logging,
    proxy::{Checker, Judge, Protocol, ProxyParser, ReqwestProber},
    queue::MemoryWorkStore,
    Engine,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Distributed proxy checking and scheduling engine
#[derive(Parser)]
#[command(name = "open-proxy-engine")]
#[command(about = "Distributed proxy checking and scheduling engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML settings file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database URL, overrides the settings file
    #[arg(short, long, global = true)]
    database: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the checking engine until interrupted
    Run {
        /// How often the settings file is polled for changes, in seconds
        #[arg(long, default_value = "5")]
        reload_secs: u64,
    },
    /// Import proxies from a file for a user
    Import {
        /// Input file containing proxies
        input: PathBuf,
        /// Owning user ID
        #[arg(short, long)]
        user: i64,
        /// Protocol for lines without a scheme (http, https, socks4, socks5)
        #[arg(short = 't', long, default_value = "http")]
        proxy_type: String,
    },
    /// Create a user
    AddUser {
        name: String,
        /// Per-check timeout in milliseconds
        #[arg(long, default_value = "7500")]
        timeout_ms: u64,
        #[arg(long, default_value = "2")]
        retries: u32,
        /// Remove proxies after `threshold` consecutive failures
        #[arg(long)]
        auto_remove: bool,
        /// Defaults to the configured auto-remove threshold
        #[arg(long)]
        threshold: Option<u32>,
        /// Comma separated protocols to check (http,https,socks4,socks5)
        #[arg(long, default_value = "http,https,socks4,socks5")]
        protocols: String,
        /// Judge scheme used for SOCKS checks (http or https)
        #[arg(long, default_value = "http")]
        socks_judge: String,
    },
    /// Register a judge for a user
    AddJudge {
        #[arg(short, long)]
        user: i64,
        url: String,
        /// Regular expression a valid response must match
        #[arg(long)]
        regex: Option<String>,
    },
    /// Check proxies once and save results
    Check {
        /// Input file containing proxies
        input: PathBuf,
        /// Output file for good proxies
        #[arg(short, long)]
        good: Option<PathBuf>,
        /// Output file for bad proxies
        #[arg(short, long)]
        bad: Option<PathBuf>,
        /// Proxy type (http, https, socks4, socks5)
        #[arg(short = 't', long, default_value = "http")]
        proxy_type: String,
        /// Number of concurrent checks
        #[arg(short = 'n', long, default_value = "10")]
        threads: usize,
        /// Timeout in seconds
        #[arg(long, default_value = "10")]
        timeout: u64,
        #[arg(long, default_value = "0")]
        retries: u32,
        /// Judge URL to test proxies against
        #[arg(long, default_value = "http://azenv.net/")]
        judge: String,
        /// Regular expression a valid response must match
        #[arg(long)]
        regex: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;
    logging::init(settings.logging.format);

    let database_url = cli
        .database
        .clone()
        .unwrap_or_else(|| settings.database.url.clone());

    match cli.command {
        Commands::Run { reload_secs } => {
            let db = ProxyDatabase::new(&database_url)
                .await
                .with_context(|| format!("opening database {database_url}"))?;
            let store = Arc::new(MemoryWorkStore::new());

            let (watcher, rx) = match &cli.config {
                Some(path) => {
                    let (watcher, rx) =
                        SettingsWatcher::new(path.clone(), Duration::from_secs(reload_secs.max(1)))?;
                    (Some(watcher), rx)
                }
                // without a file the settings never change
                None => (None, watch::channel(settings).1),
            };

            let mut handle = Engine::start(rx, store, db, Arc::new(ReqwestProber)).await?;
            if let Some(watcher) = watcher {
                handle.attach(tokio::spawn(watcher.run(handle.shutdown_token())));
            }

            tokio::signal::ctrl_c().await?;
            info!("interrupt received, shutting down");
            handle.shutdown().await;
        }
        Commands::Import {
            input,
            user,
            proxy_type,
        } => {
            let protocol = parse_protocol(&proxy_type)?;
            let proxies = ProxyParser::parse_file(&input, protocol)?;
            let db = ProxyDatabase::new(&database_url).await?;
            let items = db.add_proxies_for_user(user, &proxies).await?;
            println!("Imported {} proxies from {:?} for user {}", items.len(), input, user);
        }
        Commands::AddUser {
            name,
            timeout_ms,
            retries,
            auto_remove,
            threshold,
            protocols,
            socks_judge,
        } => {
            let protocols = Protocol::parse_list(&protocols);
            if protocols.is_empty() {
                return Err(anyhow!("At least one valid protocol is required"));
            }
            let db = ProxyDatabase::new(&database_url).await?;
            let id = db
                .add_user(&NewUser {
                    name: name.clone(),
                    timeout_ms,
                    retries,
                    auto_remove,
                    auto_remove_threshold: threshold.unwrap_or(settings.auto_remove.threshold),
                    protocols,
                    socks_judge_protocol: parse_protocol(&socks_judge)?,
                })
                .await?;
            println!("User added: {} ({})", name, id);
        }
        Commands::AddJudge { user, url, regex } => {
            let judge = Judge::new(&url, regex.as_deref())?;
            let db = ProxyDatabase::new(&database_url).await?;
            db.add_judge(user, &judge.url, regex.as_deref()).await?;
            println!("Judge added for user {}: {}", user, judge.url);
        }
        Commands::Check {
            input,
            good,
            bad,
            proxy_type,
            threads,
            timeout,
            retries,
            judge,
            regex,
        } => {
            let protocol = parse_protocol(&proxy_type)?;
            let proxies = ProxyParser::parse_file(&input, protocol)?;
            let judge = Judge::new(&judge, regex.as_deref())?;

            println!("Loaded {} proxies from {:?}", proxies.len(), input);
            println!("Checking with {} threads, timeout: {}s", threads, timeout);
            println!("Judge: {}", judge.url);
            println!();

            let checker = Checker::new(Arc::new(ReqwestProber), settings.checker.local_ip.clone());
            let results = checker
                .check_many(
                    &CancellationToken::new(),
                    proxies,
                    &judge,
                    Duration::from_secs(timeout),
                    retries,
                    threads,
                )
                .await;
            let (good_results, bad_results): (Vec<_>, Vec<_>) =
                results.into_iter().partition(|(_, outcome)| outcome.alive);

            println!(
                "Results: {} good, {} bad",
                good_results.len(),
                bad_results.len()
            );

            if let Some(good_path) = good {
                let good_proxies: Vec<_> = good_results.iter().map(|(p, _)| p.clone()).collect();
                ProxyParser::save_to_file(&good_proxies, &good_path)?;
                println!("Saved {} good proxies to {:?}", good_proxies.len(), good_path);
            }

            if let Some(bad_path) = bad {
                let bad_proxies: Vec<_> = bad_results.iter().map(|(p, _)| p.clone()).collect();
                ProxyParser::save_to_file(&bad_proxies, &bad_path)?;
                println!("Saved {} bad proxies to {:?}", bad_proxies.len(), bad_path);
            }

            if !good_results.is_empty() {
                println!("\nWorking proxies:");
                for (proxy, outcome) in &good_results {
                    if let (Some(time), Some(level)) = (outcome.latency_ms, outcome.anonymity) {
                        println!("  {} ({}ms, {})", proxy.to_full_string(), time, level);
                    }
                }
            }
        }
    }

    Ok(())
}

fn parse_protocol(s: &str) -> Result<Protocol> {
    s.parse::<Protocol>().map_err(|e| anyhow!(e))
}
