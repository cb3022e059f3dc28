//! ThreatGraph: Sysmon stream to attack-story graph
//!
//! `produce` runs the streaming pipeline (queue → parse → rule-match →
//! graph-map → batched sinks); `analyze` reconstructs per-host attack
//! stories from an adjacency JSONL file offline.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::runtime::Builder;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use threatgraph::alerts::{Scorer, ScorerConfig};
use threatgraph::analyzer;
use threatgraph::config::{AppConfig, LoggingConfig};
use threatgraph::graph::Mapper;
use threatgraph::input::{QueueConfig, RedisQueueConsumer};
use threatgraph::pipeline::{Pipeline, PipelineConfig, PipelineError};
use threatgraph::rules::{NoopEngine, RuleEngine, SigmaEngine};
use threatgraph::sinks::{
    AdjacencySink, AlertSink, ClickHouseConfig, ClickHouseIoaSink, HttpConfig, HttpSink, IoaSink,
    JsonlWriter, RawSink,
};

#[derive(Parser)]
#[command(name = "threatgraph")]
#[command(about = "Sysmon event stream to time-respecting adjacency graph", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the streaming producer pipeline
    Produce {
        /// Path to the YAML configuration file
        config: Option<PathBuf>,
    },
    /// Reconstruct attack stories from an adjacency JSONL file
    Analyze {
        /// Adjacency JSONL input path
        #[arg(long, default_value = "output/adjacency.jsonl")]
        input: PathBuf,

        /// Optional IIP graph JSONL output path
        #[arg(long)]
        output: Option<PathBuf>,

        /// Scored TPG JSONL output path
        #[arg(long)]
        tactical_output: Option<PathBuf>,

        /// Incident JSONL output path
        #[arg(long)]
        incident_output: Option<PathBuf>,

        /// Minimum kill-chain sequence length for incidents
        #[arg(long, default_value_t = 2)]
        incident_min_seq: usize,
    },
}

fn main() {
    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Produce { config } => run_produce(config),
        Commands::Analyze {
            input,
            output,
            tactical_output,
            incident_output,
            incident_min_seq,
        } => run_analyze(
            &input,
            output.as_deref(),
            tactical_output.as_deref(),
            incident_output.as_deref(),
            incident_min_seq,
        ),
    };
    std::process::exit(code);
}

/// Config discovery: explicit argument, then ./threatgraph.yml, then
/// threatgraph.yml next to the executable.
fn find_config_file(config_arg: Option<PathBuf>) -> PathBuf {
    if let Some(path) = config_arg {
        if path.exists() {
            return path;
        }
        eprintln!(
            "Warning: config file not found at {:?}, trying default locations",
            path
        );
    }

    let local = PathBuf::from("threatgraph.yml");
    if local.exists() {
        return local;
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let beside_exe = dir.join("threatgraph.yml");
            if beside_exe.exists() {
                return beside_exe;
            }
        }
    }

    local
}

/// Initializes the process-wide logger. The returned guard must stay alive
/// for the life of the program to keep the file appender flushing.
fn init_logging(cfg: &LoggingConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    if !cfg.enabled {
        return None;
    }

    let file_layer = if cfg.file.is_empty() {
        None
    } else {
        let path = Path::new(&cfg.file);
        let dir = path.parent().filter(|d| !d.as_os_str().is_empty());
        if let Some(dir) = dir {
            if let Err(err) = std::fs::create_dir_all(dir) {
                eprintln!("Failed to create log directory {:?}: {}", dir, err);
            }
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "threatgraph.log".to_string());
        let appender = tracing_appender::rolling::never(
            dir.unwrap_or_else(|| Path::new(".")),
            file_name,
        );
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer()
            .with_writer(writer)
            .compact()
            .with_ansi(false)
            .with_filter(EnvFilter::new(&cfg.level));
        Some((layer, guard))
    };

    let console_layer = if cfg.console || file_layer.is_none() {
        Some(
            fmt::layer()
                .compact()
                .with_filter(EnvFilter::new(&cfg.level)),
        )
    } else {
        None
    };

    let (file_layer, guard) = match file_layer {
        Some((layer, guard)) => (Some(layer), Some(guard)),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .init();

    guard
}

fn run_produce(config_arg: Option<PathBuf>) -> i32 {
    let config_path = find_config_file(config_arg);
    let cfg = match AppConfig::load(&config_path) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("Failed to load config {:?}: {}", config_path, err);
            return 1;
        }
    };

    let _guard = init_logging(&cfg.logging);
    info!("ThreatGraph starting");
    info!(path = ?config_path, "Config loaded");

    let runtime = match Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(err) => {
            error!(error = %err, "Failed to build runtime");
            return 1;
        }
    };

    match runtime.block_on(produce(cfg)) {
        Ok(()) => {
            info!("ThreatGraph stopped");
            0
        }
        Err(err) => {
            error!(error = %err, "Fatal producer error");
            eprintln!("Fatal: {:#}", err);
            1
        }
    }
}

async fn produce(cfg: AppConfig) -> Result<()> {
    let consumer = RedisQueueConsumer::connect(QueueConfig {
        addr: cfg.input.queue.addr.clone(),
        password: cfg.input.queue.password.clone(),
        db: cfg.input.queue.db,
        key: cfg.input.queue.key.clone(),
        block_timeout: cfg.input.queue.block_timeout,
    })
    .await
    .context("create queue consumer")?;

    let engine: Arc<dyn RuleEngine> = if cfg.rules.enabled {
        if cfg.rules.path.trim().is_empty() {
            warn!("Rules enabled but rules.path is empty; IOA tagging disabled");
            Arc::new(NoopEngine)
        } else {
            let (engine, stats) = SigmaEngine::load(&cfg.rules.path)
                .with_context(|| format!("load Sigma rules from {}", cfg.rules.path))?;
            info!(
                loaded = stats.loaded,
                skipped_complex = stats.skipped_complex,
                skipped_datasource = stats.skipped_datasource,
                skipped_invalid = stats.skipped_invalid,
                files = stats.total_files,
                "Sigma rules loaded"
            );
            if stats.loaded == 0 {
                warn!("No compatible Sigma rules loaded; IOA tagging is effectively disabled");
            }
            Arc::new(engine)
        }
    } else {
        Arc::new(NoopEngine)
    };

    let mapper = Mapper::new(cfg.graph.write_vertex_rows, cfg.graph.include_edge_data);

    let adjacency_sink: Arc<dyn AdjacencySink> = match cfg.output.mode.as_str() {
        "file" => {
            let writer = JsonlWriter::append(&cfg.output.file.path)
                .await
                .context("create adjacency file writer")?;
            info!(path = %cfg.output.file.path, "Output mode: file");
            Arc::new(writer)
        }
        "http" => {
            let writer = HttpSink::new(HttpConfig {
                url: cfg.output.http.url.clone(),
                timeout: cfg.output.http.timeout,
                headers: cfg.output.http.headers.clone(),
            })
            .context("create adjacency HTTP writer")?;
            info!(url = %cfg.output.http.url, "Output mode: http");
            Arc::new(writer)
        }
        other => anyhow::bail!("unknown output mode: {}", other),
    };

    let ioa_sink: Option<Arc<dyn IoaSink>> = if cfg.ioa.enabled {
        Some(match cfg.ioa.output.mode.as_str() {
            "file" => {
                let writer = JsonlWriter::truncate(&cfg.ioa.output.file.path)
                    .await
                    .context("create IOA file writer")?;
                info!(path = %cfg.ioa.output.file.path, "IOA output mode: file");
                Arc::new(writer) as Arc<dyn IoaSink>
            }
            "clickhouse" => {
                let ch = &cfg.ioa.output.clickhouse;
                let writer = ClickHouseIoaSink::new(ClickHouseConfig {
                    url: ch.url.clone(),
                    database: ch.database.clone(),
                    table: ch.table.clone(),
                    username: ch.username.clone(),
                    password: ch.password.clone(),
                    timeout: ch.timeout,
                    headers: ch.headers.clone(),
                })
                .context("create IOA ClickHouse writer")?;
                info!(
                    url = %ch.url,
                    database = %ch.database,
                    table = %ch.table,
                    "IOA output mode: clickhouse"
                );
                Arc::new(writer) as Arc<dyn IoaSink>
            }
            other => anyhow::bail!("unknown IOA output mode: {}", other),
        })
    } else {
        None
    };

    let (scorer, alert_sink): (Option<Arc<Scorer>>, Option<Arc<dyn AlertSink>>) = if cfg
        .alerts
        .enabled
    {
        let scorer = Arc::new(Scorer::new(ScorerConfig {
            window: cfg.alerts.window,
            threshold: cfg.alerts.threshold,
            max_rows: cfg.alerts.max_rows,
            cooldown: cfg.alerts.cooldown,
        }));
        let sink: Arc<dyn AlertSink> = match cfg.alerts.output.mode.as_str() {
            "file" => {
                let writer = JsonlWriter::append(&cfg.alerts.output.file.path)
                    .await
                    .context("create alert file writer")?;
                info!(path = %cfg.alerts.output.file.path, "Alert output mode: file");
                Arc::new(writer)
            }
            "http" => {
                let writer = HttpSink::new(HttpConfig {
                    url: cfg.alerts.output.http.url.clone(),
                    timeout: cfg.alerts.output.http.timeout,
                    headers: cfg.alerts.output.http.headers.clone(),
                })
                .context("create alert HTTP writer")?;
                info!(url = %cfg.alerts.output.http.url, "Alert output mode: http");
                Arc::new(writer)
            }
            other => anyhow::bail!("unknown alert output mode: {}", other),
        };
        (Some(scorer), Some(sink))
    } else {
        (None, None)
    };

    let raw_sink: Option<Arc<dyn RawSink>> = if cfg.replay_capture.enabled {
        let writer = JsonlWriter::append(&cfg.replay_capture.file.path)
            .await
            .context("create replay capture writer")?;
        info!(path = %cfg.replay_capture.file.path, "Replay capture enabled");
        Some(Arc::new(writer))
    } else {
        None
    };

    let pipeline = Arc::new(Pipeline::new(
        Box::new(consumer),
        engine,
        mapper,
        adjacency_sink,
        ioa_sink,
        raw_sink,
        scorer,
        alert_sink,
        PipelineConfig {
            workers: cfg.pipeline.workers,
            batch_size: cfg.pipeline.batch_size,
            flush_interval: cfg.pipeline.flush_interval,
            raw_batch_size: cfg.replay_capture.batch_size,
            raw_flush_interval: cfg.replay_capture.flush_interval,
        },
    ));

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let run_handle = tokio::spawn(pipeline.clone().run(cancel_rx));

    wait_for_shutdown_signal().await;
    info!("Shutting down");
    let _ = cancel_tx.send(true);

    match run_handle.await {
        Ok(Err(PipelineError::Cancelled)) | Ok(Ok(())) => {}
        Err(err) => error!(error = %err, "Pipeline task failed"),
    }

    pipeline.close().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(err) => {
            error!(error = %err, "Failed to register SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl+C");
}

fn run_analyze(
    input: &Path,
    output: Option<&Path>,
    tactical_output: Option<&Path>,
    incident_output: Option<&Path>,
    incident_min_seq: usize,
) -> i32 {
    if tactical_output.is_none() && incident_output.is_none() {
        eprintln!("at least one of --tactical-output or --incident-output is required");
        return 2;
    }

    let rows = match analyzer::load_rows_jsonl(input) {
        Ok(rows) => rows,
        Err(err) => {
            eprintln!("failed to load adjacency rows: {:#}", err);
            return 1;
        }
    };

    let iips = analyzer::build_iip_graphs(&rows);
    if let Some(path) = output {
        if let Err(err) = analyzer::write_jsonl(path, &iips) {
            eprintln!("failed to write IIP graphs: {:#}", err);
            return 1;
        }
    }

    let scored = analyzer::build_scored_tpgs(&iips);
    if let Some(path) = tactical_output {
        if let Err(err) = analyzer::write_jsonl(path, &scored) {
            eprintln!("failed to write scored TPGs: {:#}", err);
            return 1;
        }
    }

    let mut incident_count = 0;
    if let Some(path) = incident_output {
        let incidents = analyzer::build_incidents(&scored, incident_min_seq);
        incident_count = incidents.len();
        if let Err(err) = analyzer::write_jsonl(path, &incidents) {
            eprintln!("failed to write incidents: {:#}", err);
            return 1;
        }
    }

    println!(
        "analyzed rows={} iips={} tpgs={} incidents={}",
        rows.len(),
        iips.len(),
        scored.len(),
        incident_count
    );
    0
}
