//! verifyq CLI: operator interface to the verification queue.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use verifyq::config::Config;
use verifyq::config::secrets::redact_url;
use verifyq::engine::Engine;
use verifyq::pool::TokenPool;
use verifyq::queue::WorkQueue;
use verifyq::storage::{RetryPolicy, Stores};
use verifyq::telemetry::{TelemetryConfig, init_telemetry};
use verifyq::verifier::HttpVerifier;

#[derive(Parser)]
#[command(name = "verifyq", about = "Token-budgeted verification queue")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Verify pending items until the queue is empty or Ctrl-C
    Run {
        /// Override the batch size from the tuning file
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Add items from a file (one per line) to the pending queue
    Ingest {
        /// Input list
        file: PathBuf,
    },
    /// Token feed operations
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
    /// Print queue and result counts
    Status {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum TokenAction {
    /// Append tokens to the token store
    Add {
        /// Tokens to append
        #[arg(required = true)]
        tokens: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let mut config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "verifyq".to_string(),
        default_filter: config.log_level.clone(),
    })?;

    match cli.command {
        Command::Run { batch_size } => {
            if let Some(n) = batch_size {
                anyhow::ensure!(n > 0, "--batch-size must be at least 1");
                config.tuning.batch_size = n;
            }
            cmd_run(config).await
        }
        Command::Ingest { file } => cmd_ingest(config, file).await,
        Command::Token {
            action: TokenAction::Add { tokens },
        } => cmd_token_add(config, tokens).await,
        Command::Status { json } => cmd_status(config, json).await,
    }
}

async fn cmd_run(config: Config) -> anyhow::Result<()> {
    if let Some(proxy) = &config.proxy {
        info!(proxy = %redact_url(proxy), "using proxy");
    }
    let verifier = Arc::new(HttpVerifier::new(config.verifier()?)?);
    let engine = Engine::open_dir(&config.data_dir, config.tuning.clone()).await?;
    let scheduler = engine.scheduler(verifier);

    let sched = scheduler.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("stop requested, finishing in-flight verifications");
        sched.shutdown();
    });

    let summary = scheduler.run().await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn cmd_ingest(config: Config, file: PathBuf) -> anyhow::Result<()> {
    let content = tokio::fs::read_to_string(&file)
        .await
        .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", file.display()))?;
    let stores = Stores::files(&config.data_dir)?;
    let queue = WorkQueue::load(&stores, config.tuning.max_retries, RetryPolicy::default()).await?;
    let report = queue.ingest(content.lines()).await?;

    println!("Received:    {}", report.received);
    println!("Admitted:    {}", report.admitted);
    println!("Duplicates:  {}", report.duplicates);
    println!("Invalid:     {}", report.invalid);
    Ok(())
}

async fn cmd_token_add(config: Config, tokens: Vec<String>) -> anyhow::Result<()> {
    let stores = Stores::files(&config.data_dir)?;
    let pool = TokenPool::new(stores.tokens, config.tuning.token_limits(), RetryPolicy::default());
    for token in &tokens {
        pool.feed(token).await?;
    }
    println!("Appended {} token(s)", tokens.len());
    Ok(())
}

async fn cmd_status(config: Config, json: bool) -> anyhow::Result<()> {
    let stores = Stores::files(&config.data_dir)?;
    let queue = WorkQueue::load(&stores, config.tuning.max_retries, RetryPolicy::default()).await?;
    let counts = queue.counts().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&counts)?);
        return Ok(());
    }

    println!("Pending:     {}", counts.pending);
    println!("Claimed:     {}", counts.claimed);
    println!("Positive:    {}", counts.positive);
    println!("Negative:    {}", counts.negative);
    println!("Total:       {}", counts.total());
    println!(
        "State:       {}",
        if counts.is_complete() {
            "complete"
        } else {
            "in progress"
        }
    );
    Ok(())
}
