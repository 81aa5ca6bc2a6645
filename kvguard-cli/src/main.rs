use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use colored::Colorize;
use kvguard::{Pool, PoolConfig, ServerDescriptor};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{error, info};

const DEFAULT_SERVER: &str = "127.0.0.1:6379";

#[derive(Parser, Debug)]
#[command(name = "kvguard")]
#[command(about = "KVGuard CLI - one-shot commands over a failover Redis pool", long_about = None)]
struct Args {
    /// Pool configuration file (YAML)
    #[arg(short, long, conflicts_with = "servers")]
    config: Option<PathBuf>,

    /// Backend address, in failover order (repeatable)
    #[arg(short, long = "server", value_name = "HOST:PORT")]
    servers: Vec<String>,

    /// Password for every --server backend
    #[arg(long)]
    auth: Option<String>,

    /// Database index for every --server backend
    #[arg(long)]
    db: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show health of every backend
    Status,
    /// Read a key
    Get { key: String },
    /// Write a key
    Set {
        key: String,
        value: String,
        /// Time-to-live in seconds
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Acquire a distributed lock
    Lock {
        key: String,
        #[arg(long, default_value_t = 5)]
        retries: u32,
        /// Lock TTL in seconds
        #[arg(long, default_value_t = 3600)]
        expire: u64,
    },
    /// Release a distributed lock
    Unlock { key: String },
    /// Add an entry to a reliable queue
    Enqueue {
        queue: String,
        key: String,
        data: String,
    },
    /// Take the oldest entry of a reliable queue
    Dequeue { queue: String },
}

fn parse_server(spec: &str) -> Result<ServerDescriptor> {
    let (host, port) = spec
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("expected HOST:PORT, got {spec:?}"))?;
    let port = port
        .parse::<u16>()
        .with_context(|| format!("invalid port in {spec:?}"))?;
    Ok(ServerDescriptor::new(host, port))
}

fn load_config(args: &Args) -> Result<PoolConfig> {
    if let Some(path) = &args.config {
        return PoolConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()));
    }

    let specs = if args.servers.is_empty() {
        vec![DEFAULT_SERVER.to_string()]
    } else {
        args.servers.clone()
    };
    let servers = specs
        .iter()
        .map(|spec| {
            let mut server = parse_server(spec)?;
            if let Some(auth) = &args.auth {
                server = server.with_auth(auth.as_str());
            }
            if let Some(db) = args.db {
                server = server.with_db(db);
            }
            Ok(server)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(PoolConfig::new(servers))
}

async fn execute(pool: &Pool, command: &Commands) -> Result<String> {
    let start = Instant::now();

    let response = match command {
        Commands::Status => {
            let mut lines = Vec::new();
            for status in pool.status() {
                let marker = if status.active { "*" } else { " " };
                let health = if status.alive {
                    "alive".green()
                } else {
                    "down".red()
                };
                lines.push(format!(
                    "{marker} {} {health} entropy={}/{}",
                    status.address,
                    status.entropy,
                    pool.policy().max_fail
                ));
            }
            if lines.is_empty() {
                "(no reachable backend)".red().to_string()
            } else {
                lines.join("\n")
            }
        }
        Commands::Get { key } => match pool.kv().get_string(key).await? {
            Some(value) => format!("\"{value}\""),
            None => "(nil)".dimmed().to_string(),
        },
        Commands::Set { key, value, ttl } => {
            match ttl {
                Some(ttl) => pool.kv().set_ex(key, value.as_str(), *ttl).await?,
                None => pool.kv().set(key, value.as_str()).await?,
            }
            "OK".green().to_string()
        }
        Commands::Lock {
            key,
            retries,
            expire,
        } => {
            pool.lock().lock(key, *retries, *expire).await?;
            format!("{} {key} for {expire}s", "LOCKED".green())
        }
        Commands::Unlock { key } => {
            pool.lock().unlock(key).await?;
            "OK".green().to_string()
        }
        Commands::Enqueue { queue, key, data } => {
            pool.queue().enqueue(queue, key, data).await?;
            "OK".green().to_string()
        }
        Commands::Dequeue { queue } => match pool.queue().dequeue(queue).await? {
            Some(entry) => match entry.payload {
                Some(payload) => format!(
                    "{} \"{}\"",
                    entry.key.bold(),
                    String::from_utf8_lossy(&payload)
                ),
                None => format!("{} {}", entry.key.bold(), "(payload missing)".yellow()),
            },
            None => "(empty)".dimmed().to_string(),
        },
    };

    let elapsed = start.elapsed();
    Ok(format!(
        "{}\n{}",
        response,
        format!("({elapsed:.2?})").dimmed()
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_writer(std::io::stdout)
        .with_env_filter(tracing_subscriber::EnvFilter::new(log_level))
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let pool = Pool::connect(config)
        .await
        .context("failed to build pool")?;

    let result = execute(&pool, &args.command).await;
    pool.close();

    match result {
        Ok(output) => {
            info!("{}", output);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "{}", format!("Error: {e}").red());
            std::process::exit(1);
        }
    }
}
