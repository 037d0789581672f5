//! Handover Engine CLI
//!
//! - `decide`: replay JSON-lines UE snapshots through the engine, one JSON
//!   decision per line on stdout
//! - `check-config`: validate a config file and print the resolved values
//! - `train`: submit a model training job to the provider and wait for it

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use handover_common::models::UeSnapshot;
use handover_common::protocol::TrainingRequest;
use handover_engine::decision::TracingSink;
use handover_engine::metrics::{MetricsServer, MetricsSource};
use handover_engine::prediction::HttpPredictionProvider;
use handover_engine::queue::OperationOutput;
use handover_engine::{EngineConfig, HandoverEngine};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "handover-engine", about = "ML-assisted handover decision engine")]
struct Cli {
    /// Engine configuration (TOML). Defaults apply when omitted.
    #[arg(long, global = true, env = "HANDOVER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decide handovers for a stream of UE snapshots.
    Decide {
        /// JSON-lines file of UE snapshots, or `-` for stdin.
        #[arg(long, default_value = "-")]
        input: String,

        /// Serve Prometheus metrics on this address while running.
        #[arg(long)]
        metrics_addr: Option<SocketAddr>,
    },
    /// Validate the configuration and print it fully resolved.
    CheckConfig,
    /// Run a training job on the prediction provider.
    Train {
        /// Model kind understood by the provider (e.g. `lgbm`, `lstm`).
        #[arg(long)]
        model: String,

        /// Dataset identifier passed through to the provider.
        #[arg(long)]
        dataset: Option<String>,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(p) => EngineConfig::from_path(p)
            .with_context(|| format!("loading config from {}", p.display())),
        None => Ok(EngineConfig::default()),
    }
}

fn build_engine(config: EngineConfig) -> anyhow::Result<Arc<HandoverEngine>> {
    let provider = HttpPredictionProvider::new(&config.provider)
        .context("building prediction provider client")?
        .with_training_timeout(config.queue.training_timeout);
    Ok(Arc::new(HandoverEngine::new(
        config,
        Arc::new(provider),
        Arc::new(TracingSink),
    )))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::CheckConfig => {
            print!("{}", config.to_toml_string());
            Ok(())
        }
        Command::Decide {
            input,
            metrics_addr,
        } => decide(config, &input, metrics_addr).await,
        Command::Train { model, dataset } => train(config, model, dataset).await,
    }
}

async fn decide(
    config: EngineConfig,
    input: &str,
    metrics_addr: Option<SocketAddr>,
) -> anyhow::Result<()> {
    tracing::info!(
        provider = %config.provider.base_url,
        mode = ?config.ml.mode,
        dispatch = ?config.ml.dispatch,
        "handover-engine starting"
    );
    let engine = build_engine(config)?;

    let _metrics_server = match metrics_addr {
        Some(addr) => {
            let source: Arc<dyn MetricsSource> = engine.clone();
            let server = MetricsServer::start(addr, source)
                .with_context(|| format!("binding metrics server on {addr}"))?;
            tracing::info!(addr = %server.addr(), "metrics server listening");
            Some(server)
        }
        None => None,
    };

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = if input == "-" {
        Box::new(BufReader::new(tokio::io::stdin()))
    } else {
        let file = tokio::fs::File::open(input)
            .await
            .with_context(|| format!("opening {input}"))?;
        Box::new(BufReader::new(file))
    };

    let mut lines = reader.lines();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let snapshot: UeSnapshot = match serde_json::from_str(line) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(line = line_no, error = %e, "skipping invalid snapshot");
                continue;
            }
        };
        let decision = engine.decide_and_apply(&snapshot).await;
        println!("{}", serde_json::to_string(&decision)?);
    }

    let counters = engine.metrics().counters();
    tracing::info!(
        decisions = counters.decisions_total(),
        applied = counters.handovers_applied,
        ml = counters.decisions_ml,
        rule = counters.decisions_rule,
        "input exhausted"
    );
    engine.shutdown().await;
    Ok(())
}

async fn train(config: EngineConfig, model: String, dataset: Option<String>) -> anyhow::Result<()> {
    let engine = build_engine(config)?;
    let mut request = TrainingRequest::new(model);
    request.dataset = dataset;

    let handle = engine.submit_training(request)?;
    tracing::info!(task_id = %handle.id(), "training job submitted");
    let output = handle.join().await.context("training job failed")?;
    if let OperationOutput::Training(report) = output {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    engine.shutdown().await;
    Ok(())
}
