//! tilecast server — entry point.
//!
//! ```text
//! tilecast-server                  Run in the foreground
//! tilecast-server --config <path>  Load a custom config TOML
//! tilecast-server --gen-config     Write default config to stdout
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tilecast_core::pipeline::registry::DeviceRegistry;
use tilecast_core::{Broadcaster, Browser};

use tilecast_server::config::{prefers_reduced_motion, ServerConfig};
use tilecast_server::service::StreamService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "tilecast-server", about = "Web-view tile streaming server for embedded displays")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "tilecast.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&ServerConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let config = ServerConfig::load(&cli.config);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("tilecast-server v{}", env!("CARGO_PKG_VERSION"));
    info!("client port: {}", config.network.port);
    info!("browser endpoint: {}", config.browser.devtools_url);

    let reduced_motion = prefers_reduced_motion();
    if reduced_motion {
        info!("PREFERS_REDUCED_MOTION set — emulating reduced motion on all targets");
    }

    // A dead browser endpoint is a startup error, not something to limp
    // through.
    let browser = match Browser::connect(&config.browser.devtools_url).await {
        Ok(b) => Arc::new(b),
        Err(e) => {
            error!("cannot reach browser: {e}");
            std::process::exit(1);
        }
    };

    let broadcaster = Arc::new(Broadcaster::new());
    let registry = Arc::new(DeviceRegistry::new(
        browser,
        Arc::clone(&broadcaster),
        reduced_motion,
    ));

    // Periodic idle sweep.
    let sweep_registry = Arc::clone(&registry);
    let idle_ttl = Duration::from_secs(config.limits.idle_ttl_secs);
    let sweep_every = Duration::from_secs(config.limits.sweep_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        interval.tick().await; // skip the immediate first tick
        loop {
            interval.tick().await;
            let evicted = sweep_registry.cleanup_idle(idle_ttl).await;
            if evicted > 0 {
                info!("idle sweep evicted {evicted} session(s)");
            }
        }
    });

    let service = Arc::new(StreamService::new(
        config,
        Arc::clone(&registry),
        broadcaster,
    ));

    tokio::select! {
        result = service.run() => {
            if let Err(e) = result {
                error!("service error: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received — shutting down");
        }
    }

    registry.shutdown_all().await;
    Ok(())
}
