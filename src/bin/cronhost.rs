//! `cronhost` CLI entrypoint.

use clap::{Parser, Subcommand};
use cronhost::catalog::Catalog;
use cronhost::config::HostConfig;
use cronhost::Host;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cronhost", about = "Timezone-aware cron job host")]
struct Cli {
    /// Path to the JSON configuration document.
    #[arg(long, global = true, default_value = "cronhost.json")]
    config: PathBuf,

    /// Enable verbose (debug-level) logging, overriding RUST_LOG.
    #[arg(long, global = true)]
    debug: bool,

    /// Address the optional health/metrics surface binds to (`run`) or is
    /// queried at (`status`). Only meaningful with the `http-api` feature.
    #[arg(long, global = true, default_value = "127.0.0.1:9090")]
    addr: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the host in the foreground (the default).
    Run,
    /// Load and validate the configuration, print a summary, and exit.
    Validate,
    /// Query a running instance's health snapshot over the HTTP surface.
    #[cfg(feature = "http-api")]
    Status,
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    match cli.command.unwrap_or(Command::Run) {
        Command::Validate => {
            let config = HostConfig::from_file(&cli.config)?;
            let (_catalog, report) = Catalog::load(&config);
            println!(
                "total={} validEnabled={} disabled={} invalidCron={} zoneFallbacks={}",
                report.total,
                report.valid_enabled,
                report.disabled,
                report.invalid_cron,
                report.zone_fallbacks
            );
            for issue in &report.issues {
                println!("  {issue:?}");
            }
            if report.warning_no_active_jobs {
                println!("warning: config is non-empty but produced zero active jobs");
            }
            Ok(())
        }
        Command::Run => {
            let host = Host::bootstrap_default(cli.config, true)?;

            let shutdown_scheduler = std::sync::Arc::clone(&host.scheduler);
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutdown signal received");
                shutdown_scheduler.request_shutdown();
            });

            #[cfg(feature = "http-api")]
            {
                let addr: std::net::SocketAddr = cli.addr.parse()?;
                let scheduler = std::sync::Arc::clone(&host.scheduler);
                let shutdown_rx = host.scheduler.shutdown_receiver();
                tokio::spawn(async move {
                    if let Err(e) = cronhost::http::serve(addr, scheduler, shutdown_rx).await {
                        tracing::error!(error = %e, "health/metrics surface exited");
                    }
                });
            }

            host.run().await;
            Ok(())
        }
        #[cfg(feature = "http-api")]
        Command::Status => {
            let url = format!("http://{}/health", cli.addr);
            let body = reqwest::get(&url).await?.text().await?;
            println!("{body}");
            Ok(())
        }
    }
}
