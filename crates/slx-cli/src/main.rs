//! 🚀 slx-cli: the front door, the bouncer, the maitre d' of the sluice.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! 📦 Loads config, sets up logging, wires Ctrl-C to a graceful shutdown, then lets the
//! library do the heavy lifting. Like a manager. 🦆

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use slx::{ShutdownTrigger, report};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// 🚰 Ship log records to an HTTP event collector, with backups for the ones that bounce.
#[derive(Debug, Parser)]
#[command(name = "slx", version, about)]
struct Cli {
    /// 📄 TOML config file. SLX_* environment variables are merged underneath it.
    #[arg(short, long, default_value = "slx.toml")]
    config: PathBuf,

    /// 🙈 Skip the summary table at the end.
    #[arg(long)]
    quiet: bool,
}

/// 🔧 Steps:
/// 1. Init tracing (so we can see what goes wrong, and when)
/// 2. Parse args
/// 3. Load config (the moment of truth)
/// 4. Run the thing, Ctrl-C starts the drain
/// 5. Print the summary, or the error chain (cry)
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    // 🔒 A missing file is fine: env vars alone can carry the whole config
    let config_file = cli
        .config
        .try_exists()
        .context(format!(
            "💀 Could not check whether '{}' exists. Permissions? A cursed mount?",
            cli.config.display()
        ))?
        .then_some(cli.config.as_path());

    let app_config = slx::app_config::load_config(config_file)
        .context("💀 In slx-cli, main, we couldn't load the config. Take a look at the file and the SLX_* variables.")?;

    let trigger = ShutdownTrigger::new(app_config.runtime.shutdown_grace());
    let listener = trigger.listener();
    let grace = app_config.runtime.shutdown_grace_secs;
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Ctrl-C: draining. In-flight batches get {grace}s, then the rest goes to backup.");
            trigger.trigger();
        }
    });

    match slx::run(app_config, listener).await {
        Ok(snapshot) => {
            if !cli.quiet {
                println!("{}", report::summary_table(&snapshot));
            }
            if snapshot.totals.backup_failures > 0 {
                error!(
                    "💀 {} batches could be neither delivered nor backed up. Check the logs above.",
                    snapshot.totals.backup_failures
                );
                std::process::exit(2);
            }
            info!("✅ all lanes drained");
            Ok(())
        }
        Err(err) => {
            error!("💀 error: {}", err);
            // -- 🧅 peel the onion of sadness, one tear-jerking layer at a time
            let mut the_vibes_are_giving_connection_issues = false;
            for cause in err.chain().skip(1) {
                error!("⚠️  cause: {}", cause);
                let cause_str = cause.to_string();
                if cause_str.contains("error sending request")
                    || cause_str.contains("Connection refused")
                    || cause_str.contains("dns error")
                {
                    the_vibes_are_giving_connection_issues = true;
                }
            }
            if the_vibes_are_giving_connection_issues {
                error!(
                    "🔧 hint: the collector isn't reachable. Double-check endpoint.Hec.url \
                     and that the collector is actually listening. Even servers need a nudge sometimes. ☕"
                );
            }
            std::process::exit(1);
        }
    }
}
