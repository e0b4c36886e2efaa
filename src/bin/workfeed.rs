//! workfeed CLI: run a queue-fed engine, or push work onto its queue.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use workfeed::config::Config;
use workfeed::config::secrets::redact_url;
use workfeed::engine::{CommandHandler, EngineConfig, LocalEngine, QueueFeed};
use workfeed::queue;
use workfeed::source::{WorkSource, resolve_queue_name};
use workfeed::telemetry::{TelemetryConfig, init_telemetry};

/// How long `serve` waits for running tasks after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "workfeed", about = "Feed a task engine from a message queue")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine, pulling tasks from the queue until Ctrl-C
    Serve {
        /// Executable run once per task, with the target as its argument
        #[arg(long)]
        handler: PathBuf,
        /// Queue to read from (default: "<name>:start_urls")
        #[arg(long)]
        queue: Option<String>,
        /// Component identifier (overrides FEED_NAME)
        #[arg(long)]
        name: Option<String>,
        /// Maximum concurrent tasks
        #[arg(long, default_value_t = 4)]
        max_concurrent: usize,
    },
    /// Publish payloads (e.g. URLs) to the queue
    Push {
        /// Payloads to enqueue, one message each
        #[arg(required = true)]
        payloads: Vec<String>,
        /// Queue to write to (default: "<name>:start_urls")
        #[arg(long)]
        queue: Option<String>,
        /// Component identifier (overrides FEED_NAME)
        #[arg(long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            handler,
            queue,
            name,
            max_concurrent,
        } => {
            let config = load_config(queue, name)?;
            cmd_serve(config, handler, max_concurrent).await
        }
        Command::Push {
            payloads,
            queue,
            name,
        } => {
            let config = load_config(queue, name)?;
            cmd_push(config, payloads).await
        }
    }
}

fn load_config(queue: Option<String>, name: Option<String>) -> anyhow::Result<Config> {
    let mut config = Config::from_env()?;
    if let Some(name) = name {
        config.feed_name = name;
    }
    if queue.is_some() {
        config.queue_name = queue;
    }
    Ok(config)
}

async fn cmd_serve(config: Config, handler: PathBuf, max_concurrent: usize) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "workfeed".to_string(),
        log_level: config.log_level.clone(),
    })?;

    info!(
        backend = %config.queue_backend,
        url = %redact_url(&config.queue_url),
        "connecting to queue"
    );

    let backend = config.queue_backend;
    let url = config.queue_url.clone();
    let options = config.connect_options();
    let source = WorkSource::configure(config.source_settings(), move || async move {
        queue::connect(backend, &url, &options).await
    })
    .await?;
    source.client().ensure_queue(source.queue()).await?;

    let handler = CommandHandler::new(handler);
    info!(handler = %handler.command().display(), max_concurrent, "starting engine");
    let (engine, signals) = LocalEngine::new(Arc::new(handler), EngineConfig { max_concurrent });
    let feed = Arc::new(QueueFeed::new(
        Arc::new(source),
        engine.clone(),
        config.feed_config(),
    ));

    if let Err(e) = feed.start().await {
        error!("initial refill failed: {e}");
    }

    let stopper = engine.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("interrupt received, shutting down");
        stopper.shutdown();
    });

    let listener = {
        let feed = Arc::clone(&feed);
        tokio::spawn(async move { feed.run(signals).await })
    };

    let exit = engine.run().await;
    if !engine.drain(SHUTDOWN_GRACE).await {
        warn!(
            in_flight = engine.in_flight(),
            "abandoning running tasks, their messages will be redelivered"
        );
    }
    feed.shutdown();
    listener.await??;

    info!(?exit, "workfeed stopped");
    Ok(())
}

async fn cmd_push(config: Config, payloads: Vec<String>) -> anyhow::Result<()> {
    let queue_name = resolve_queue_name(config.queue_name.as_deref(), &config.feed_name);
    let client = queue::connect(
        config.queue_backend,
        &config.queue_url,
        &config.connect_options(),
    )
    .await?;
    client.ensure_queue(&queue_name).await?;

    for payload in &payloads {
        client.publish(&queue_name, payload.as_bytes()).await?;
    }

    println!("Pushed {} message(s) to {queue_name}", payloads.len());
    Ok(())
}
