use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ksa_pipeline::{AppConfig, Pipeline, Scheduler, DEFAULT_DATABASE_URL};
use ksa_storage::PgBackend;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ksa")]
#[command(about = "K-Startup announcement alert service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one check-and-notify cycle.
    Check,
    /// Seed the snapshot without sending notifications.
    Init {
        #[arg(long, default_value_t = 5)]
        max_pages: u32,
    },
    /// Send the currently open announcements to the channel.
    SendCurrent {
        #[arg(long, default_value_t = 5)]
        limit: u32,
    },
    /// Apply database migrations to the primary store.
    Migrate,
    /// Serve the JSON API and start the scheduler.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Check) {
        Commands::Check => {
            let config = AppConfig::from_env()?;
            let pipeline = Pipeline::from_config(&config)?;
            let outcome = pipeline.check_and_notify().await;
            println!(
                "check complete: success={} total={} ongoing={} new={}",
                outcome.success,
                outcome.total_announcements,
                outcome.ongoing_announcements,
                outcome.new_announcements
            );
            for error in &outcome.errors {
                eprintln!("error: {error}");
            }
            if !outcome.success {
                std::process::exit(1);
            }
        }
        Commands::Init { max_pages } => {
            let config = AppConfig::from_env()?;
            let pipeline = Pipeline::from_config(&config)?;
            let outcome = pipeline.initialize(max_pages).await?;
            println!(
                "init complete: processed={} ongoing={} unique={} pages={}",
                outcome.total_processed,
                outcome.ongoing_announcements,
                outcome.unique_announcements,
                outcome.pages_processed
            );
        }
        Commands::SendCurrent { limit } => {
            let config = AppConfig::from_env()?;
            let pipeline = Pipeline::from_config(&config)?;
            let outcome = pipeline.send_current(limit).await;
            println!("send-current complete: {}", outcome.message);
            if !outcome.success {
                std::process::exit(1);
            }
        }
        Commands::Migrate => {
            let database_url = std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
            let backend =
                PgBackend::connect_lazy(&database_url).context("preparing postgres backend")?;
            backend.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let config = AppConfig::from_env()?;
            let pipeline = Arc::new(Pipeline::from_config(&config)?);
            let scheduler = Arc::new(Scheduler::new(
                pipeline.clone(),
                config.window,
                config.check_cron.clone(),
            ));
            if config.scheduler_enabled {
                scheduler.start().await?;
            }
            ksa_web::serve(
                ksa_web::AppState {
                    pipeline,
                    scheduler,
                },
                config.web_port,
            )
            .await?;
        }
    }

    Ok(())
}
