use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use common::{
    AppConfig, CooldownState, FuturesMarketData, FuturesOrderExecutor, LogNotifier, Notifier,
    OperatingMode, OrderUpdate, RawChannelMessage, SignalPosition, TradeStatistics,
};
use engine::{
    reconcile_open_positions, CommandHandler, PositionManager, RetryPolicy, SignalPipeline,
    SignalTrader,
};
use paper::PaperExchange;
use risk::{CooldownController, ModeController, PositionSizer, StatisticsAggregator};
use signals::{ParserRegistry, SignalValidator};
use store::{JsonCollectionStore, JsonSingletonStore};
use telegram_ctrl::{run_command_bot, BotDeps, ChannelListener, TelegramChannelTransport};

#[tokio::main]
async fn main() {
    // ── Logging ──────────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    // ── Config ────────────────────────────────────────────────────────────────
    let cfg = match AppConfig::load(".") {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("configuration invalid: {e}");
            std::process::exit(1);
        }
    };
    info!(venue = %cfg.exchange.venue, dry_run = cfg.exchange.dry_run, "SignalBot starting");

    // ── Stores ────────────────────────────────────────────────────────────────
    let data_dir = Path::new(&cfg.persistence.data_dir);
    let positions: Arc<JsonCollectionStore<SignalPosition>> =
        match JsonCollectionStore::open(data_dir.join("positions.json")) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!("cannot open positions store: {e}");
                std::process::exit(1);
            }
        };
    let cooldown_store: Arc<JsonSingletonStore<CooldownState>> =
        Arc::new(JsonSingletonStore::open(data_dir.join("cooldown.json")).expect("store path"));
    let stats_store: Arc<JsonSingletonStore<TradeStatistics>> =
        Arc::new(JsonSingletonStore::open(data_dir.join("statistics.json")).expect("store path"));

    // ── Controllers ───────────────────────────────────────────────────────────
    let cooldown = Arc::new(
        CooldownController::load(cfg.cooldown.clone(), cooldown_store)
            .await
            .expect("cooldown state unreadable"),
    );
    let statistics = Arc::new(
        StatisticsAggregator::load(stats_store)
            .await
            .expect("statistics state unreadable"),
    );
    let mode = Arc::new(ModeController::new(OperatingMode::Automatic));
    mode.subscribe(|next| info!(mode = %next, "operating mode is now"))
        .await;

    // ── Exchange (real venue or in-process paper venue) ───────────────────────
    let (market, orders, update_tx): (
        Arc<dyn FuturesMarketData>,
        Arc<dyn FuturesOrderExecutor>,
        broadcast::Sender<OrderUpdate>,
    ) = if cfg.exchange.dry_run {
        info!("dry-run mode — orders stay in-process");
        let venue = PaperExchange::new(10_000.0, 5.0);
        (venue.clone(), venue.clone(), venue.update_sender())
    } else {
        match engine::connect(&cfg.exchange) {
            Ok(handle) => (handle.market, handle.orders, handle.updates),
            Err(e) => {
                error!("cannot connect exchange: {e}");
                std::process::exit(1);
            }
        }
    };

    // ── Notifications ─────────────────────────────────────────────────────────
    let notifier: Arc<dyn Notifier> = if cfg.telegram.bot_token.is_empty() {
        Arc::new(LogNotifier)
    } else {
        Arc::new(telegram_ctrl::TelegramNotifier::new(
            &cfg.telegram.bot_token,
            &cfg.telegram.notification_chat_ids,
        ))
    };

    // ── Startup reconciliation ────────────────────────────────────────────────
    match reconcile_open_positions(&orders, &positions).await {
        Ok(result) => {
            if result.is_clean() {
                info!(confirmed = result.confirmed.len(), "state reconciled with exchange");
            } else {
                let summary = result.summary();
                warn!("{summary}");
                notifier
                    .notify(&format!("⚠️ Startup reconciliation needs attention:\n{summary}"))
                    .await;
            }
        }
        Err(e) => {
            // Never trade on an unverified book.
            error!("startup reconciliation failed: {e}");
            std::process::exit(1);
        }
    }

    // ── Execution core ────────────────────────────────────────────────────────
    let retry = RetryPolicy::from_config(&cfg.retry);
    let trader = Arc::new(SignalTrader::new(
        cfg.exchange.venue,
        cfg.trading.clone(),
        cfg.entry.clone(),
        PositionSizer::new(cfg.sizing.clone()),
        market.clone(),
        orders.clone(),
        positions.clone(),
        cooldown.clone(),
        mode.clone(),
        notifier.clone(),
        retry.clone(),
    ));

    let manager = PositionManager::new(
        positions.clone(),
        orders.clone(),
        cooldown.clone(),
        statistics.clone(),
        mode.clone(),
        notifier.clone(),
        retry.clone(),
    )
    .await
    .expect("position index unbuildable");

    let registry = ParserRegistry::with_default_parsers();
    for channel in &cfg.channels {
        if registry.get(&channel.parser).is_none() {
            error!(
                channel = %channel.name,
                parser = %channel.parser,
                "channel references an unknown parser"
            );
            std::process::exit(1);
        }
    }
    let validator = SignalValidator::new(cfg.risk.clone(), cfg.exchange.venue);
    let pipeline = SignalPipeline::new(
        registry,
        validator,
        trader.clone(),
        &cfg.channels,
        cfg.trading.default_leverage,
    );

    // ── Channels, commands, shutdown plumbing ─────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (message_tx, message_rx) = mpsc::channel::<RawChannelMessage>(256);
    let (command_tx, command_rx) = mpsc::channel(32);

    let command_handler = CommandHandler::new(
        positions.clone(),
        market.clone(),
        trader.clone(),
        cooldown.clone(),
        mode.clone(),
        statistics.clone(),
        cfg.risk.clone(),
    );
    // ── Spawn all tasks ───────────────────────────────────────────────────────
    tokio::spawn(pipeline.run(message_rx, shutdown_rx.clone()));
    tokio::spawn(manager.run(update_tx.subscribe(), shutdown_rx.clone()));
    tokio::spawn(command_handler.run(command_rx, shutdown_rx.clone()));
    if cfg.telegram.bot_token.is_empty() {
        warn!("no telegram token configured — channel ingress and commands disabled");
        // Keep the idle pipeline and command handler alive anyway.
        std::mem::forget(message_tx);
        std::mem::forget(command_tx);
    } else {
        let transport = TelegramChannelTransport::new(
            &cfg.telegram.bot_token,
            Duration::from_millis(cfg.telegram.poll_base_delay_ms),
            Duration::from_millis(cfg.telegram.poll_max_delay_ms),
        );
        let listener = ChannelListener::new(
            transport.clone(),
            cfg.channels.clone(),
            message_tx,
            Duration::from_secs(cfg.telegram.poll_interval_secs),
        );
        let bot_deps = BotDeps {
            command_tx,
            command_chat_id: cfg.telegram.command_chat_id,
            authorized_user_ids: Arc::new(cfg.telegram.authorized_user_ids.clone()),
        };
        tokio::spawn(transport.run(shutdown_rx.clone()));
        tokio::spawn(listener.run(shutdown_rx.clone()));
        tokio::spawn(run_command_bot(
            cfg.telegram.bot_token.clone(),
            bot_deps,
            Duration::from_millis(cfg.telegram.poll_base_delay_ms),
            Duration::from_millis(cfg.telegram.poll_max_delay_ms),
        ));
    }

    // Autosave timer for the singleton stores.
    {
        let cooldown = cooldown.clone();
        let statistics = statistics.clone();
        let mut shutdown = shutdown_rx.clone();
        let period = Duration::from_secs(cfg.persistence.autosave_secs.max(5));
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                    _ = timer.tick() => {
                        if let Err(e) = cooldown.flush().await {
                            warn!(error = %e, "cooldown autosave failed");
                        }
                        if let Err(e) = statistics.flush().await {
                            warn!(error = %e, "statistics autosave failed");
                        }
                    }
                }
            }
        });
    }

    info!("all subsystems started");
    wait_for_signal().await;

    // ── Graceful shutdown: sources exit, the manager drains, stores flush. ────
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(Duration::from_secs(2)).await;
    if let Err(e) = cooldown.flush().await {
        warn!(error = %e, "final cooldown flush failed");
    }
    if let Err(e) = statistics.flush().await {
        warn!(error = %e, "final statistics flush failed");
    }
    info!("shutdown complete");
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
