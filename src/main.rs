//! Tickbot - paper trading runner
//!
//! Replays JSON-lines feed messages from a file (first argument) or stdin
//! through a bot trading against the in-process paper exchange.
//!
//! Config files: tickbot.toml, tickbot.yaml, config.toml

use anyhow::Result;
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tickbot::bot::{Bot, BotState, FeedMessage};
use tickbot::config::{self, Config};
use tickbot::session::TradingSession;
use tickbot::trading::{LifecycleStats, PaperExchange, PositionFactory};
use tickbot::VERSION;

mod strategy;
use strategy::DipStrategy;

/// Interval between the synthetic ticks that drive a stopping bot
const WIND_DOWN_TICK_MS: u64 = 250;

#[tokio::main]
async fn main() -> Result<()> {
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown".to_string());
        eprintln!("PANIC at {}: {}", location, info);
        default_panic(info);
    }));

    let config = load_config().await?;

    let log_level = config.log_level.as_deref().unwrap_or("info");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    info!("Starting tickbot v{}", VERSION);
    config.validate()?;
    info!("Configuration loaded");
    info!("  Bot: {} on {}", config.bot.name, config.bot.product_id);
    info!("  Mode: {:?}", config.exchange.mode);
    info!("  Funds fraction: {}", config.position.avail_funds_perc);
    info!(
        "  Order retries: {} ({} per {}ms)",
        config.position.max_retries_on_order_fail,
        config.position.retry_limit,
        config.position.retry_interval_ms
    );

    if config.exchange.mode.is_live() {
        anyhow::bail!("Live mode needs an exchange event stream, only paper mode is supported");
    }

    let mut args = std::env::args().skip(1);
    let feed_path = args.next().map(PathBuf::from);
    let stats_path = args.next().map(PathBuf::from);

    let exchange = config
        .exchange
        .paper_balances
        .iter()
        .try_fold(PaperExchange::new(&config.bot.product_id)?, |exchange, (currency, amount)| {
            Ok::<_, anyhow::Error>(exchange.with_balance(currency, *amount))
        })?;
    let exchange = Arc::new(exchange);
    warn!("PAPER MODE - orders are filled by the in-process exchange");

    let session = TradingSession::new(&config.bot.product_id, exchange.clone());
    let events = exchange
        .events()
        .ok_or_else(|| anyhow::anyhow!("paper exchange event stream already taken"))?;
    let pump = session.pump(events);

    let stats = Arc::new(Mutex::new(LifecycleStats::new()));
    let factory = PositionFactory::new(session, exchange.clone(), config.position.clone());
    let strategy = DipStrategy::new(factory, stats.clone())
        .with_thresholds(config.strategy.dip, config.strategy.take_profit);
    let bot = Bot::new(&config.bot.name, strategy);
    info!("Bot {} ({}) ready in state {}", bot.name(), bot.id(), bot.state());

    let reader: Box<dyn AsyncRead + Unpin + Send> = match &feed_path {
        Some(path) => {
            info!("Replaying feed from {}", path.display());
            Box::new(tokio::fs::File::open(path).await?)
        }
        None => {
            info!("Replaying feed from stdin");
            Box::new(tokio::io::stdin())
        }
    };
    let mut lines = BufReader::new(reader).lines();

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if shutdown_tx.send(()).await.is_err() {
                break;
            }
        }
    });

    let mut processed = 0u64;
    let mut last_price = None;
    loop {
        tokio::select! {
            Some(_) = shutdown_rx.recv() => {
                info!("Shutdown signal received");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("Feed exhausted after {} messages", processed);
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let msg: FeedMessage = match serde_json::from_str(line) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("Skipping malformed feed line: {}", e);
                        continue;
                    }
                };
                let tick = msg.as_ticker().filter(|t| t.product_id == config.bot.product_id);
                if let Some(tick) = tick {
                    exchange.mark_price(tick.price);
                    last_price = Some(tick.price);
                }
                bot.process(&msg).await;
                processed += 1;
            }
        }
    }

    match last_price {
        Some(price) => {
            let timeout = config.bot.stop_timeout_ms.map(Duration::from_millis);
            wind_down(&bot, &exchange, price, timeout, &mut shutdown_rx).await?;
        }
        None => warn!("No price seen for {}, skipping graceful stop", config.bot.product_id),
    }

    // let the pump deliver what the last fills produced
    tokio::time::sleep(Duration::from_millis(50)).await;
    pump.abort();

    info!("Bot {} finished in state {}", bot.name(), bot.state());
    let summary = stats.lock().unwrap_or_else(PoisonError::into_inner).clone();
    info!("{}", summary.summary());
    for currency in config.exchange.paper_balances.keys() {
        info!("  {} balance: {}", currency, exchange.balance(currency).balance);
    }
    for order in exchange.open_orders() {
        warn!("Order {} still open at shutdown", order.id);
    }

    if let Some(path) = stats_path {
        if let Err(e) = summary.save_to_file(&path) {
            error!("Failed to save stats to {}: {}", path.display(), e);
        } else {
            info!("Stats saved to {}", path.display());
        }
    }

    Ok(())
}

/// Stop a trading bot and keep ticking it at `price` until it settles in
/// idle or error. A further shutdown signal abandons the wait.
async fn wind_down(
    bot: &Bot,
    exchange: &PaperExchange,
    price: Decimal,
    timeout: Option<Duration>,
    shutdown: &mut mpsc::Receiver<()>,
) -> Result<BotState> {
    if bot.state() == BotState::Trading {
        info!("Stopping bot {} (timeout {:?})", bot.name(), timeout);
        bot.stop(timeout)?;
    }
    if bot.state() != BotState::Exit {
        return Ok(bot.state());
    }

    let mut ticks = tokio::time::interval(Duration::from_millis(WIND_DOWN_TICK_MS));
    while !matches!(bot.state(), BotState::Idle | BotState::Error) {
        tokio::select! {
            Some(_) = shutdown.recv() => {
                warn!("Second shutdown signal, abandoning graceful stop in state {}", bot.state());
                break;
            }
            _ = ticks.tick() => {
                exchange.mark_price(price);
                bot.process(&FeedMessage::ticker(bot.product_id(), price)).await;
            }
        }
    }
    Ok(bot.state())
}

/// Load config from file or environment
async fn load_config() -> Result<Config> {
    match Config::load() {
        Ok(config) => {
            eprintln!("Loaded configuration from file");
            Ok(config)
        }
        Err(e) => {
            eprintln!("No config file ({}), using environment variables", e);
            config::from_env()
        }
    }
}
