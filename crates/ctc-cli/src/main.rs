use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ctc_sync::{pipeline_from_config, CrawlerConfig, Scheduler};
use ctc_web::AppState;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "ctc")]
#[command(about = "Chess tournament calendar crawler")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
enum Commands {
    /// Crawl now, then again every interval until interrupted.
    Run {
        /// Hours between runs; overrides CRAWL_INTERVAL.
        #[arg(long, value_name = "HOURS", value_parser = clap::value_parser!(u64).range(1..))]
        interval: Option<u64>,
    },
    /// Crawl once and exit; fails with a non-zero status if the run fails.
    Crawl,
    /// Serve the query API.
    Serve {
        /// Overrides CTC_WEB_PORT.
        #[arg(long)]
        port: Option<u16>,
        /// Also run the crawl scheduler in the background.
        #[arg(long)]
        schedule: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let mut config = CrawlerConfig::from_env().context("reading configuration")?;

    match cli.command.unwrap_or(Commands::Run { interval: None }) {
        Commands::Run { interval } => {
            if let Some(hours) = interval {
                config.crawl_interval_hours = hours;
            }
            let pipeline = pipeline_from_config(&config).await?;
            Scheduler::new(pipeline, config.crawl_interval(), config.poll_interval())
                .run(shutdown_signal())
                .await;
        }
        Commands::Crawl => {
            let pipeline = pipeline_from_config(&config).await?;
            let report = pipeline.run_once().await.context("crawl failed")?;
            println!(
                "crawl complete: tournaments={} inserted={}",
                report.records.len(),
                report.inserted
            );
        }
        Commands::Serve { port, schedule } => {
            let port = port.unwrap_or(config.web_port);
            let pipeline = pipeline_from_config(&config).await?;
            let (stop_tx, stop_rx) = watch::channel(false);
            tokio::spawn(async move {
                shutdown_signal().await;
                let _ = stop_tx.send(true);
            });

            let scheduler = schedule.then(|| {
                let scheduler = Scheduler::new(
                    pipeline.clone(),
                    config.crawl_interval(),
                    config.poll_interval(),
                );
                let stop = stopped(stop_rx.clone());
                tokio::spawn(async move { scheduler.run(stop).await })
            });

            ctc_web::serve(AppState::with_pipeline(pipeline), port, stopped(stop_rx)).await?;
            if let Some(task) = scheduler {
                let runs = task.await.context("scheduler task panicked")?;
                info!(runs, "scheduler finished");
            }
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let json = std::env::var("CTC_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "listening for ctrl-c failed; running until killed");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
