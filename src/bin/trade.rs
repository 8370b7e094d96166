//! Trading binary: runs the live/paper Trading Loop.
//!
//! Safety default: `config.json`'s `mode` field decides paper vs. live —
//! there is no CLI flag that overrides it, so a misplaced `--live` can't
//! flip real trading on by accident.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crypto_strategies::config::Config;
use crypto_strategies::trading_loop::TradingLoop;

#[derive(Parser, Debug)]
#[command(name = "trade")]
#[command(about = "Run the algorithmic trading loop (paper or live, per config.json)")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.json")]
    config: String,

    /// Run a single tick and exit, instead of looping forever
    #[arg(long)]
    once: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{level},hyper=warn,reqwest=warn")));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.verbose);
    dotenv::dotenv().ok();

    let config = Config::from_file(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config))?;

    info!(mode = %config.mode, symbols = ?config.symbols, "starting trading loop");

    let mut trading_loop = TradingLoop::new(config).await?;
    trading_loop.recover()?;
    trading_loop.run(args.once).await
}
