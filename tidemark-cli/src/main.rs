//! CLI for the tidemark telemetry store.
//!
//! Provides commands for serving a simulated session, querying a running
//! store, validating configuration, and benchmarking the ingest path.

mod device;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{ArgGroup, Parser, Subcommand, ValueEnum};
use tidemark::{
    BufferConfig, DataSourceRegistry, EvictionPolicy, GatewayConfig, IngestRouter, Key, PollSpec,
    Query,
    QueryGateway, QueryMode, StoreConfig, TelemetryStore, Value, connect_stream,
};
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::EnvFilter;

/// tidemark: windowed telemetry store CLI.
#[derive(Parser)]
#[command(name = "tidemark", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Run a session fed by a simulated device and serve remote queries.
    Serve {
        /// Address to accept query connections on.
        #[arg(long, default_value = "127.0.0.1:7878")]
        listen: String,

        /// Store configuration file (JSON).
        #[arg(long)]
        config: Option<PathBuf>,

        /// Keys to poll from the device, comma separated.
        #[arg(long, value_delimiter = ',', default_value = "led_state")]
        keys: Vec<String>,

        /// Poll interval in milliseconds.
        #[arg(long, default_value = "50")]
        interval_ms: u64,
    },

    /// Query a running store.
    #[command(group(ArgGroup::new("mode").required(true)))]
    Query {
        /// Address of the store.
        #[arg(long, default_value = "127.0.0.1:7878")]
        addr: String,

        /// Key to query.
        key: String,

        /// Samples with START <= timestamp <= END (milliseconds).
        #[arg(long, num_args = 2, value_names = ["START", "END"], group = "mode")]
        window: Option<Vec<u64>>,

        /// The last N samples.
        #[arg(long, value_name = "N", group = "mode")]
        latest: Option<usize>,

        /// Samples within SPAN milliseconds of the newest one.
        #[arg(long, value_name = "SPAN", group = "mode")]
        recent: Option<u64>,

        /// Deadline in milliseconds [default: the config's
        /// `gateway.query_timeout_ms`, else 2000].
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Store configuration file (JSON) supplying the default deadline.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Validate a configuration file and print the resolved settings.
    CheckConfig {
        /// Path to the configuration file.
        path: PathBuf,
    },

    /// Run an ingest-path microbenchmark.
    Bench {
        /// Number of samples to ingest.
        #[arg(long, default_value = "10000000")]
        points: u64,

        /// Number of keys to spread samples over.
        #[arg(long, default_value = "20")]
        keys: u32,

        /// Buffer capacity per key.
        #[arg(long, default_value = "20000")]
        capacity: usize,
    },
}

/// Output format for query results.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// JSON object with a sample array.
    Json,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve {
            listen,
            config,
            keys,
            interval_ms,
        } => cmd_serve(&listen, config.as_deref(), &keys, interval_ms).await,
        Commands::Query {
            addr,
            key,
            window,
            latest,
            recent,
            timeout_ms,
            config,
            format,
        } => match query_mode(window.as_deref(), latest, recent)
            .and_then(|mode| Ok((mode, query_timeout(timeout_ms, config.as_deref())?)))
        {
            Ok((mode, timeout)) => cmd_query(&addr, &key, mode, timeout, &format).await,
            Err(e) => Err(e),
        },
        Commands::CheckConfig { path } => cmd_check_config(&path),
        Commands::Bench {
            points,
            keys,
            capacity,
        } => cmd_bench(points, keys, capacity),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Implements `tidemark serve`.
async fn cmd_serve(
    listen: &str,
    config_path: Option<&Path>,
    keys: &[String],
    interval_ms: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match config_path {
        Some(path) => StoreConfig::load(path)?,
        None => StoreConfig::default(),
    };
    if !keys.is_empty() {
        config
            .poll
            .subscriptions
            .push(PollSpec::new(keys, Duration::from_millis(interval_ms))?);
    }

    let (sink, device) = device::link();
    let store = Arc::new(TelemetryStore::open_with_poller(config, sink)?);
    tokio::spawn(device.run(Arc::clone(&store)));

    let listener = TcpListener::bind(listen).await?;
    tracing::info!(addr = %listener.local_addr()?, "serving queries");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("accept error: {e}");
                        continue;
                    }
                };

                let server = store.query_server();
                tokio::spawn(async move {
                    let (reader, writer) = stream.into_split();
                    if let Err(e) = server.serve_stream(reader, writer).await {
                        tracing::debug!(%peer, "connection error: {e}");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    store.disconnect();
    Ok(())
}

/// Builds the query mode from the mutually exclusive mode flags.
fn query_mode(
    window: Option<&[u64]>,
    latest: Option<usize>,
    recent: Option<u64>,
) -> Result<QueryMode, Box<dyn std::error::Error>> {
    match (window, latest, recent) {
        (Some(&[start, end]), None, None) => Ok(QueryMode::Window { start, end }),
        (None, Some(n), None) => Ok(QueryMode::Latest { n }),
        (None, None, Some(span)) => Ok(QueryMode::Recent { span }),
        _ => Err("exactly one of --window, --latest or --recent is required".into()),
    }
}

/// Resolves the query deadline: the flag, else the config file's gateway
/// setting, else the built-in default.
fn query_timeout(
    timeout_ms: Option<u64>,
    config_path: Option<&Path>,
) -> Result<Duration, Box<dyn std::error::Error>> {
    if let Some(ms) = timeout_ms {
        return Ok(Duration::from_millis(ms));
    }

    let gateway = match config_path {
        Some(path) => StoreConfig::load(path)?.gateway,
        None => GatewayConfig::default(),
    };
    Ok(gateway.query_timeout)
}

/// Implements `tidemark query <key>`.
async fn cmd_query(
    addr: &str,
    key: &str,
    mode: QueryMode,
    timeout: Duration,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let stream = TcpStream::connect(addr).await?;
    let (reader, writer) = stream.into_split();
    let gateway = QueryGateway::remote(connect_stream(reader, writer, timeout));

    let samples = gateway
        .query(Query {
            key: Key::new(key)?,
            mode,
        })
        .await?;

    match format {
        OutputFormat::Csv => {
            println!("# key={key}, points={}", samples.len());
            println!("timestamp_ms,value");
            for sample in &samples {
                println!("{},{}", sample.timestamp, format_value(&sample.value));
            }
        }
        OutputFormat::Json => {
            let output = serde_json::json!({
                "key": key,
                "count": samples.len(),
                "data": samples,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Implements `tidemark check-config <path>`.
fn cmd_check_config(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = StoreConfig::load(path)?;

    println!("Config: {}", path.display());
    println!();
    println!("Default buffer: {}", describe_buffer(&config.default_buffer));

    if !config.buffers.is_empty() {
        println!();
        println!("Buffers: {}", config.buffers.len());
        for (key, buffer) in &config.buffers {
            println!("  - {key}: {}", describe_buffer(buffer));
        }
    }

    println!();
    println!(
        "Poll: outstanding timeout {:?}, {} subscription(s)",
        config.poll.outstanding_timeout,
        config.poll.subscriptions.len()
    );
    for spec in &config.poll.subscriptions {
        let keys: Vec<&str> = spec.keys.iter().map(Key::as_str).collect();
        println!("  - every {:?}: {}", spec.interval, keys.join(", "));
    }

    println!();
    println!("Gateway: query timeout {:?}", config.gateway.query_timeout);

    Ok(())
}

/// Implements `tidemark bench`.
#[allow(clippy::cast_precision_loss)] // Benchmark stats are fine with f64 precision
fn cmd_bench(points: u64, key_count: u32, capacity: usize) -> Result<(), Box<dyn std::error::Error>> {
    if key_count == 0 {
        return Err("--keys must be at least 1".into());
    }

    println!("tidemark ingest benchmark");
    println!("  Points: {points}");
    println!("  Keys: {key_count}");
    println!("  Capacity: {capacity}");
    println!();

    let config = BufferConfig::new(capacity, EvictionPolicy::Fifo)?;
    let registry = Arc::new(DataSourceRegistry::new(config));
    let router = IngestRouter::new(Arc::clone(&registry));
    let keys: Vec<String> = (0..key_count).map(|i| format!("key_{i}")).collect();

    println!("Ingesting {points} samples across {key_count} keys...");

    let points_per_key = points / u64::from(key_count);
    let mut ts = 0u64;
    let start = Instant::now();

    for _ in 0..points_per_key {
        ts += 10;
        for (i, key) in keys.iter().enumerate() {
            router.ingest(key, i as f64, ts)?;
        }
    }

    let elapsed = start.elapsed();
    let total_writes = points_per_key * u64::from(key_count);
    let ns_per_write = elapsed.as_nanos() as f64 / total_writes.max(1) as f64;
    let writes_per_sec = total_writes as f64 / elapsed.as_secs_f64();

    let query_start = Instant::now();
    let mut returned = 0usize;
    for key in &keys {
        returned += registry
            .read(key, &QueryMode::Recent { span: 1_000 })?
            .len();
    }
    let query_elapsed = query_start.elapsed();

    println!();
    println!("Results:");
    println!("  Total writes: {total_writes}");
    println!("  Elapsed: {elapsed:.3?}");
    println!("  Avg latency: {ns_per_write:.1} ns/write");
    println!("  Throughput: {writes_per_sec:.0} writes/sec");
    println!("  Recent-window queries: {} keys, {returned} samples in {query_elapsed:.3?}", keys.len());
    println!();

    Ok(())
}

/// Formats a buffer configuration for display.
fn describe_buffer(config: &BufferConfig) -> String {
    match config.eviction {
        EvictionPolicy::Fifo => format!("capacity {}, fifo", config.capacity),
        EvictionPolicy::MaxAge { max_age_ms } => {
            format!("capacity {}, max age {max_age_ms} ms", config.capacity)
        }
    }
}

/// Formats a value as a CSV cell; vector components are `;`-separated.
fn format_value(value: &Value) -> String {
    match value {
        Value::Scalar(v) => v.to_string(),
        Value::Vector(vs) => vs
            .iter()
            .map(f64::to_string)
            .collect::<Vec<_>>()
            .join(";"),
    }
}
