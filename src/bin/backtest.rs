//! Backtest binary: downloads (or loads) historical OHLCV candles and runs
//! the paper-execution simulator over them.

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crypto_strategies::backtest;
use crypto_strategies::config::Config;
use crypto_strategies::data;
use crypto_strategies::exchange::{ExchangeClient, ExchangeConfig};
use crypto_strategies::types::Symbol;

#[derive(Parser, Debug)]
#[command(name = "backtest")]
#[command(about = "Backtest the RSI+MACD+volume strategy on historical OHLCV data")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.json")]
    config: String,

    /// Comma-separated symbols to backtest (overrides config.symbols)
    #[arg(long)]
    symbols: Option<String>,

    /// Start datetime (UTC). Examples: 2024-01-01 or 2024-01-01T00:00:00Z
    #[arg(long)]
    start: Option<String>,

    /// End datetime (UTC). Examples: 2024-02-01 or 2024-02-01T00:00:00Z
    #[arg(long)]
    end: Option<String>,

    /// OHLCV timeframe (overrides config.strategy.timeframe)
    #[arg(long)]
    timeframe: Option<String>,

    /// Exchange REST base URL to fetch candle history from
    #[arg(long, default_value = "https://api.binance.com")]
    exchange: String,

    /// Optional path to write a JSON summary
    #[arg(long)]
    output_json: Option<String>,

    /// Verbose logging
    #[arg(long)]
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

    let timeframe = args.timeframe.unwrap_or_else(|| config.strategy.timeframe.clone());
    let timeframe_seconds = backtest::timeframe_to_seconds(&timeframe)?;

    let now = chrono::Utc::now();
    let start_dt = match &args.start {
        Some(s) => data::parse_bound(s, false)?,
        None => now - chrono::Duration::days(30),
    };
    let end_dt = match &args.end {
        Some(s) => data::parse_bound(s, true)?,
        None => now,
    };
    if end_dt <= start_dt {
        anyhow::bail!("--end must be after --start");
    }

    let symbols: Vec<Symbol> = match &args.symbols {
        Some(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Symbol::parse)
            .collect::<Result<_, _>>()?,
        None => config.symbols()?,
    };
    if symbols.is_empty() {
        anyhow::bail!("--symbols cannot be empty");
    }

    let warmup_candles = config.strategy.ohlcv_limit.max(50);
    let fetch_start_ms = (start_dt.timestamp_millis() - warmup_candles as i64 * timeframe_seconds as i64 * 1000).max(0);
    let trade_start_ms = start_dt.timestamp_millis();
    let trade_end_ms = end_dt.timestamp_millis();

    let exchange_config = ExchangeConfig {
        base_url: args.exchange,
        api_key: config.exchange.api_key.clone(),
        api_secret: config.exchange.api_secret.clone(),
        timeout_ms: config.exchange.timeout_ms,
    };
    let client = ExchangeClient::new(exchange_config);

    let total_candles = ((trade_end_ms - fetch_start_ms) / (timeframe_seconds as i64 * 1000)).max(1) as usize;
    let mut candles_by_symbol = std::collections::HashMap::new();
    for symbol in &symbols {
        tracing::info!(%symbol, "fetching candle history");
        let candles = client
            .fetch_ohlcv(symbol.as_str(), &timeframe, total_candles.min(1000))
            .await
            .with_context(|| format!("failed fetching candles for {symbol}"))?;
        if candles.is_empty() {
            anyhow::bail!("no candles returned for {symbol}");
        }
        candles_by_symbol.insert(symbol.clone(), candles);
    }

    let report = backtest::run(
        &candles_by_symbol,
        &timeframe,
        &config.strategy,
        &config.risk,
        config.paper.starting_cash_usdt,
        config.paper.fee_pct,
        trade_start_ms,
        trade_end_ms,
    )?;

    println!("Backtest results");
    println!("- Symbols: {}", report.symbols.join(", "));
    println!("- Timeframe: {}", report.timeframe);
    println!("- Starting equity: ${:.2}", report.metrics.starting_equity);
    println!("- Final equity:    ${:.2}", report.metrics.final_equity);
    println!("- Total return:    {:.2}%", report.metrics.total_return_pct);
    println!("- Trades:          {}", report.metrics.num_trades);
    println!("- Win rate:        {:.2}%", report.metrics.win_rate_pct);
    println!("- Max drawdown:    {:.2}%", report.metrics.max_drawdown_pct);
    println!("- Sharpe (ann.):   {:.3}", report.metrics.sharpe_ratio_annualized);
    match report.metrics.profit_factor {
        Some(pf) => println!("- Profit factor:   {pf:.3}"),
        None => println!("- Profit factor:   inf"),
    }

    if let Some(path) = args.output_json {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(&path, json).with_context(|| format!("failed writing {path}"))?;
        println!("\nSaved JSON summary to {path}");
    }

    Ok(())
}
