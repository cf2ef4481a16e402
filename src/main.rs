use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use serde_json::json;
use tokio::sync::watch;
use tokio::time::{interval, sleep, Duration};

use tickflow::bus::EventBus;
use tickflow::logging::{error_log, json_log, obj, v_bool, v_num, v_str};
use tickflow::orchestrator::{
    SignalProducer, StrategyConfig, StrategyOrchestrator, SIGNALS_STREAM,
};
use tickflow::paper::RealtimePaperEngine;
use tickflow::policy::{PolicyEngine, PolicyObserver};
use tickflow::signal::{Priority, Side, SignalDecision};
use tickflow::state::{now_ms, Config};
use tickflow::storage::StateStore;

const TICKS_STREAM: &str = "ticks";

/// Alerting hook: blocked decisions and kill-switch flips become log records
/// an external notifier can tail.
struct AlertLogger;

impl PolicyObserver for AlertLogger {
    fn on_block(&self, decision: &SignalDecision) {
        json_log(
            "alert.signal_blocked",
            obj(&[
                ("symbol", v_str(&decision.symbol)),
                ("strategy", v_str(&decision.strategy)),
                ("reason", v_str(&decision.reason)),
            ]),
        );
    }

    fn on_kill_switch_toggle(&self, active: bool, reason: &str) {
        json_log(
            "alert.kill_switch",
            obj(&[("active", v_bool(active)), ("reason", v_str(reason))]),
        );
    }
}

/// Demo producer: submits a random-walk-flavored signal every few seconds.
/// Real strategies live out of process and call the same submit path.
struct DemoProducer {
    symbol: String,
}

#[async_trait]
impl SignalProducer for DemoProducer {
    async fn run(&self, orchestrator: Arc<StrategyOrchestrator>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = sleep(Duration::from_secs(5)) => {}
                _ = shutdown.changed() => return,
            }
            if *shutdown.borrow() {
                return;
            }
            let (side, confidence) = {
                let mut rng = rand::thread_rng();
                let side = if rng.gen_bool(0.5) { Side::Buy } else { Side::Sell };
                (side, rng.gen_range(0.3..0.95))
            };
            let mut meta = serde_json::Map::new();
            meta.insert("size_usd".to_string(), json!(250.0));
            if let Err(err) = orchestrator.submit_signal(
                &self.symbol,
                side,
                confidence,
                "demo",
                None,
                Some(meta),
            ) {
                json_log("demo.submit_rejected", obj(&[("error", v_str(&err.to_string()))]));
            }
        }
    }
}

/// Stand-in market data feed: publishes a random walk onto the ticks stream.
async fn run_demo_feed(bus: Arc<EventBus>, symbol: String, mut shutdown: watch::Receiver<bool>) {
    let mut price = 50_000.0;
    loop {
        tokio::select! {
            _ = sleep(Duration::from_secs(1)) => {}
            _ = shutdown.changed() => return,
        }
        if *shutdown.borrow() {
            return;
        }
        let step: f64 = rand::thread_rng().gen_range(-0.002..0.002);
        price *= 1.0 + step;
        let payload = json!({"symbol": symbol, "price": price, "ts_ms": now_ms()});
        if let Err(err) = bus.publish(TICKS_STREAM, "tick", &payload, "demo_feed") {
            error_log("demo.feed_error", obj(&[("error", v_str(&err.to_string()))]));
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    json_log(
        "startup",
        obj(&[
            ("sqlite_path", v_str(&cfg.sqlite_path)),
            ("starting_cash", v_num(cfg.starting_cash)),
            ("min_confidence", v_num(cfg.min_confidence)),
        ]),
    );

    let store = Arc::new(StateStore::new(&cfg.sqlite_path)?);
    let bus = Arc::new(EventBus::new(store.clone(), cfg.bus_maxlen));
    let policy = Arc::new(PolicyEngine::new(cfg.clone(), store.clone())?);
    policy.add_observer(Arc::new(AlertLogger));
    let paper = Arc::new(RealtimePaperEngine::new(
        cfg.clone(),
        store.clone(),
        policy.clone(),
    ));

    let orchestrator = Arc::new(StrategyOrchestrator::new(
        cfg.clone(),
        bus.clone(),
        policy.clone(),
    ));
    let symbol = std::env::var("SYMBOL").unwrap_or_else(|_| "BTCUSDT".to_string());
    orchestrator.register_strategy(
        StrategyConfig {
            name: "demo".to_string(),
            priority: Priority::Medium,
            enabled: true,
            budget_usd: 1000.0,
            max_positions: 3,
        },
        Some(Arc::new(DemoProducer {
            symbol: symbol.clone(),
        })),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let block_timeout = Duration::from_millis(cfg.block_timeout_ms);
    let batch_size = cfg.batch_size;

    let tick_consumer = {
        let bus = bus.clone();
        let paper = paper.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            bus.run_consumer(TICKS_STREAM, "paper", block_timeout, batch_size, rx, |event| {
                paper.handle_tick_event(event)
            })
            .await
        })
    };
    let signal_consumer = {
        let bus = bus.clone();
        let paper = paper.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            bus.run_consumer(SIGNALS_STREAM, "paper", block_timeout, batch_size, rx, |event| {
                paper.handle_decision_event(event)
            })
            .await
        })
    };
    let feed = tokio::spawn(run_demo_feed(bus.clone(), symbol, shutdown_rx.clone()));

    // External scheduler role: day rollover resets trade count and PnL.
    let daily_reset = {
        let policy = policy.clone();
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(86_400));
            tick.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(err) = policy.reset_daily_stats() {
                            error_log("daily_reset_error", obj(&[("error", v_str(&err.to_string()))]));
                        }
                    }
                    _ = rx.changed() => return,
                }
            }
        })
    };

    orchestrator.start();
    tokio::signal::ctrl_c().await?;
    json_log("shutdown", obj(&[]));

    orchestrator.stop().await;
    let _ = shutdown_tx.send(true);
    for (stream, consumer) in [(TICKS_STREAM, tick_consumer), (SIGNALS_STREAM, signal_consumer)] {
        if let Err(err) = consumer.await? {
            error_log(
                "consumer_exit_error",
                obj(&[("stream", v_str(stream)), ("error", v_str(&err.to_string()))]),
            );
        }
    }
    let _ = feed.await;
    let _ = daily_reset.await;

    let stats = paper.get_portfolio_stats();
    json_log(
        "final_portfolio",
        obj(&[
            ("cash", v_num(stats.cash)),
            ("realized", v_num(stats.realized)),
            ("equity", v_num(stats.equity)),
            ("drawdown", v_num(stats.drawdown)),
            ("open_positions", v_num(stats.positions.len() as f64)),
        ]),
    );
    Ok(())
}
