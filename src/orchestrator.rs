//! Priority-queue signal router between strategy producers and the bus.
//!
//! Producers only ever call `submit_signal`; a single dispatch task is the
//! sole reader of the queue and the sole writer of decision counters, so no
//! fine-grained cross-task locking is needed. Every dequeued request is gated
//! through the policy engine; only Allow decisions reach the "signals"
//! stream.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::bus::EventBus;
use crate::logging::{error_log, json_log, obj, params_hash, v_num, v_str};
use crate::policy::PolicyEngine;
use crate::retry::{retry_async, RetryConfig};
use crate::signal::{Decision, Priority, Side, SignalRequest, SubmitError};
use crate::state::{now_ms, Config};

pub const SIGNALS_STREAM: &str = "signals";

/// Registry entry for one strategy.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyConfig {
    pub name: String,
    pub priority: Priority,
    pub enabled: bool,
    pub budget_usd: f64,
    pub max_positions: u32,
}

/// An independent signal source. Spawned as its own task on `start()`; must
/// exit promptly when the shutdown watch flips. Interacts with the pipeline
/// only through `submit_signal`.
#[async_trait]
pub trait SignalProducer: Send + Sync {
    async fn run(&self, orchestrator: Arc<StrategyOrchestrator>, shutdown: watch::Receiver<bool>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct StrategyStats {
    pub config: StrategyConfig,
    pub submitted: u64,
    pub rejected: u64,
    pub open_positions: usize,
}

#[derive(Debug, Clone)]
pub struct OrchestratorStats {
    pub state: RunState,
    pub queue_depth: usize,
    pub signals_executed: u64,
    pub signals_blocked: u64,
    pub publish_failures: u64,
    pub strategies: Vec<StrategyStats>,
}

struct StrategyEntry {
    config: StrategyConfig,
    producer: Option<Arc<dyn SignalProducer>>,
    submitted: u64,
    rejected: u64,
    // Symbols with an approved, not-yet-exited entry. Tracks dispatched
    // decisions, not confirmed fills.
    open_symbols: HashSet<String>,
}

/// Queue key: priority first, then submission time, then a tiebreak counter
/// so equal-priority signals stay FIFO.
#[derive(Debug)]
struct QueuedSignal {
    priority: Priority,
    ts_ms: u64,
    seq: u64,
    request: SignalRequest,
}

impl PartialEq for QueuedSignal {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedSignal {}

impl PartialOrd for QueuedSignal {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedSignal {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.priority, self.ts_ms, self.seq).cmp(&(other.priority, other.ts_ms, other.seq))
    }
}

pub struct StrategyOrchestrator {
    cfg: Config,
    bus: Arc<EventBus>,
    policy: Arc<PolicyEngine>,
    registry: Mutex<HashMap<String, StrategyEntry>>,
    queue: Mutex<BinaryHeap<Reverse<QueuedSignal>>>,
    queue_notify: Notify,
    submit_seq: AtomicU64,
    signals_executed: AtomicU64,
    signals_blocked: AtomicU64,
    publish_failures: AtomicU64,
    run_state: Mutex<RunState>,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StrategyOrchestrator {
    pub fn new(cfg: Config, bus: Arc<EventBus>, policy: Arc<PolicyEngine>) -> Self {
        Self {
            cfg,
            bus,
            policy,
            registry: Mutex::new(HashMap::new()),
            queue: Mutex::new(BinaryHeap::new()),
            queue_notify: Notify::new(),
            submit_seq: AtomicU64::new(0),
            signals_executed: AtomicU64::new(0),
            signals_blocked: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            run_state: Mutex::new(RunState::NotStarted),
            shutdown_tx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn register_strategy(
        &self,
        config: StrategyConfig,
        producer: Option<Arc<dyn SignalProducer>>,
    ) {
        json_log(
            "orchestrator.register",
            obj(&[
                ("strategy", v_str(&config.name)),
                ("priority", v_num(config.priority.as_int() as f64)),
                ("budget_usd", v_num(config.budget_usd)),
            ]),
        );
        self.registry.lock().expect("registry lock").insert(
            config.name.clone(),
            StrategyEntry {
                config,
                producer,
                submitted: 0,
                rejected: 0,
                open_symbols: HashSet::new(),
            },
        );
    }

    /// Takes effect for subsequent submissions only; queued signals from a
    /// just-disabled strategy still dispatch.
    pub fn enable_strategy(&self, name: &str) -> Result<(), SubmitError> {
        self.set_enabled(name, true)
    }

    pub fn disable_strategy(&self, name: &str) -> Result<(), SubmitError> {
        self.set_enabled(name, false)
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), SubmitError> {
        let mut registry = self.registry.lock().expect("registry lock");
        let entry = registry
            .get_mut(name)
            .ok_or_else(|| SubmitError::UnknownStrategy(name.to_string()))?;
        entry.config.enabled = enabled;
        Ok(())
    }

    /// Validate at the boundary and enqueue. Rejected requests are counted
    /// and never enqueued.
    pub fn submit_signal(
        &self,
        symbol: &str,
        side: Side,
        confidence: f64,
        strategy: &str,
        priority: Option<Priority>,
        metadata: Option<Map<String, Value>>,
    ) -> Result<(), SubmitError> {
        if !(0.0..=1.0).contains(&confidence) {
            self.signals_blocked.fetch_add(1, Ordering::SeqCst);
            return Err(SubmitError::InvalidConfidence(format!("{}", confidence)));
        }

        let priority = {
            let mut registry = self.registry.lock().expect("registry lock");
            let entry = match registry.get_mut(strategy) {
                Some(entry) => entry,
                None => {
                    self.signals_blocked.fetch_add(1, Ordering::SeqCst);
                    return Err(SubmitError::UnknownStrategy(strategy.to_string()));
                }
            };
            if !entry.config.enabled {
                entry.rejected += 1;
                self.signals_blocked.fetch_add(1, Ordering::SeqCst);
                return Err(SubmitError::StrategyDisabled(strategy.to_string()));
            }
            entry.submitted += 1;
            priority.unwrap_or(entry.config.priority)
        };

        let ts_ms = now_ms();
        let seq = self.submit_seq.fetch_add(1, Ordering::SeqCst);
        let request = SignalRequest {
            symbol: symbol.to_string(),
            side,
            confidence,
            strategy: strategy.to_string(),
            priority,
            ts_ms,
            metadata: metadata.unwrap_or_default(),
        };
        json_log(
            "orchestrator.submit",
            obj(&[
                ("symbol", v_str(symbol)),
                ("strategy", v_str(strategy)),
                ("priority", v_num(priority.as_int() as f64)),
                (
                    "params_hash",
                    v_str(&params_hash(&format!(
                        "{}:{}:{}:{}",
                        symbol,
                        side.as_int(),
                        confidence,
                        strategy
                    ))),
                ),
            ]),
        );
        self.queue.lock().expect("queue lock").push(Reverse(QueuedSignal {
            priority,
            ts_ms,
            seq,
            request,
        }));
        self.queue_notify.notify_one();
        Ok(())
    }

    /// NotStarted/Stopped → Running. No-op while already Running.
    pub fn start(self: &Arc<Self>) {
        {
            let mut state = self.run_state.lock().expect("state lock");
            if *state == RunState::Running {
                return;
            }
            *state = RunState::Running;
        }
        let (tx, rx) = watch::channel(false);
        *self.shutdown_tx.lock().expect("shutdown lock") = Some(tx);

        let mut tasks = self.tasks.lock().expect("tasks lock");
        let me = self.clone();
        let loop_rx = rx.clone();
        tasks.push(tokio::spawn(async move {
            me.dispatch_loop(loop_rx).await;
        }));

        let producers: Vec<Arc<dyn SignalProducer>> = {
            let registry = self.registry.lock().expect("registry lock");
            registry.values().filter_map(|e| e.producer.clone()).collect()
        };
        for producer in producers {
            let me = self.clone();
            let rx = rx.clone();
            tasks.push(tokio::spawn(async move {
                producer.run(me, rx).await;
            }));
        }
        json_log("orchestrator.start", obj(&[]));
    }

    /// Cancel the dispatch loop and producer tasks and await their exit.
    /// No-op unless Running. The queue is not drained: pending signals
    /// survive a stop/start cycle.
    pub async fn stop(&self) {
        {
            let mut state = self.run_state.lock().expect("state lock");
            if *state != RunState::Running {
                return;
            }
            *state = RunState::Stopping;
        }
        if let Some(tx) = self.shutdown_tx.lock().expect("shutdown lock").take() {
            let _ = tx.send(true);
        }
        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().expect("tasks lock"));
        for handle in handles {
            let _ = handle.await;
        }
        *self.run_state.lock().expect("state lock") = RunState::Stopped;
        json_log("orchestrator.stop", obj(&[]));
    }

    async fn dispatch_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let idle = Duration::from_millis(self.cfg.dispatch_idle_ms);
        loop {
            if *shutdown.borrow() {
                return;
            }
            let next = self.queue.lock().expect("queue lock").pop();
            match next {
                Some(Reverse(queued)) => self.dispatch_one(queued.request).await,
                None => {
                    // Bounded wait so shutdown stays observable on an idle
                    // queue.
                    tokio::select! {
                        _ = self.queue_notify.notified() => {}
                        _ = sleep(idle) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }

    /// Strategy-level caps applied before the policy gate: an entry sized in
    /// `size_usd` is clamped to the strategy's budget, and a new-symbol entry
    /// is refused once the strategy holds `max_positions` symbols.
    fn apply_strategy_limits(&self, request: &mut SignalRequest) -> bool {
        if request.side != Side::Buy {
            return true;
        }
        let (budget_usd, max_positions, open, holds_symbol) = {
            let registry = self.registry.lock().expect("registry lock");
            match registry.get(&request.strategy) {
                Some(e) => (
                    e.config.budget_usd,
                    e.config.max_positions as usize,
                    e.open_symbols.len(),
                    e.open_symbols.contains(&request.symbol),
                ),
                None => return true,
            }
        };
        if !holds_symbol && open >= max_positions {
            json_log(
                "orchestrator.max_positions",
                obj(&[
                    ("strategy", v_str(&request.strategy)),
                    ("symbol", v_str(&request.symbol)),
                    ("open", v_num(open as f64)),
                ]),
            );
            return false;
        }
        if let Some(size_usd) = request.metadata.get("size_usd").and_then(Value::as_f64) {
            if size_usd > budget_usd {
                request
                    .metadata
                    .insert("size_usd".to_string(), Value::from(budget_usd));
                json_log(
                    "orchestrator.size_capped",
                    obj(&[
                        ("strategy", v_str(&request.strategy)),
                        ("requested_usd", v_num(size_usd)),
                        ("budget_usd", v_num(budget_usd)),
                    ]),
                );
            }
        }
        true
    }

    async fn dispatch_one(&self, mut request: SignalRequest) {
        if !self.apply_strategy_limits(&mut request) {
            self.signals_blocked.fetch_add(1, Ordering::SeqCst);
            return;
        }
        let decision = self.policy.evaluate_signal(
            &request.symbol,
            request.side,
            request.confidence,
            &request.strategy,
            &request.metadata,
        );
        if decision.decision != Decision::Allow {
            self.signals_blocked.fetch_add(1, Ordering::SeqCst);
            return;
        }

        let payload = match serde_json::to_value(&decision) {
            Ok(v) => v,
            Err(err) => {
                self.publish_failures.fetch_add(1, Ordering::SeqCst);
                error_log(
                    "orchestrator.encode_error",
                    obj(&[("error", v_str(&err.to_string()))]),
                );
                return;
            }
        };
        let published = retry_async(&RetryConfig::default(), "orchestrator.publish", || async {
            self.bus
                .publish(SIGNALS_STREAM, "signal_decision", &payload, "orchestrator")
                .map(|_| ())
        })
        .await;
        match published {
            Ok(()) => {
                self.signals_executed.fetch_add(1, Ordering::SeqCst);
                let mut registry = self.registry.lock().expect("registry lock");
                if let Some(entry) = registry.get_mut(&request.strategy) {
                    match request.side {
                        Side::Buy => {
                            entry.open_symbols.insert(request.symbol.clone());
                        }
                        Side::Sell => {
                            entry.open_symbols.remove(&request.symbol);
                        }
                        Side::Flat => {}
                    }
                }
            }
            Err(err) => {
                // Surfaced, never silently swallowed: counted and logged.
                self.publish_failures.fetch_add(1, Ordering::SeqCst);
                error_log(
                    "orchestrator.publish_error",
                    obj(&[
                        ("symbol", v_str(&request.symbol)),
                        ("error", v_str(&err.to_string())),
                    ]),
                );
            }
        }
    }

    pub fn get_stats(&self) -> OrchestratorStats {
        let strategies = self
            .registry
            .lock()
            .expect("registry lock")
            .values()
            .map(|e| StrategyStats {
                config: e.config.clone(),
                submitted: e.submitted,
                rejected: e.rejected,
                open_positions: e.open_symbols.len(),
            })
            .collect();
        OrchestratorStats {
            state: *self.run_state.lock().expect("state lock"),
            queue_depth: self.queue.lock().expect("queue lock").len(),
            signals_executed: self.signals_executed.load(Ordering::SeqCst),
            signals_blocked: self.signals_blocked.load(Ordering::SeqCst),
            publish_failures: self.publish_failures.load(Ordering::SeqCst),
            strategies,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StateStore;

    fn make_orchestrator() -> Arc<StrategyOrchestrator> {
        let cfg = Config::for_tests();
        let store = Arc::new(StateStore::new(":memory:").unwrap());
        let bus = Arc::new(EventBus::new(store.clone(), 1000));
        let policy = Arc::new(PolicyEngine::new(cfg.clone(), store).unwrap());
        Arc::new(StrategyOrchestrator::new(cfg, bus, policy))
    }

    fn lse(enabled: bool) -> StrategyConfig {
        StrategyConfig {
            name: "lse".to_string(),
            priority: Priority::Medium,
            enabled,
            budget_usd: 1000.0,
            max_positions: 3,
        }
    }

    #[tokio::test]
    async fn test_unknown_strategy_rejected_not_enqueued() {
        let orch = make_orchestrator();
        let err = orch
            .submit_signal("BTCUSDT", Side::Buy, 0.8, "ghost", None, None)
            .unwrap_err();
        assert_eq!(err, SubmitError::UnknownStrategy("ghost".to_string()));
        let stats = orch.get_stats();
        assert_eq!(stats.queue_depth, 0);
        assert_eq!(stats.signals_blocked, 1);
    }

    #[tokio::test]
    async fn test_disabled_strategy_rejected() {
        let orch = make_orchestrator();
        orch.register_strategy(lse(false), None);
        let err = orch
            .submit_signal("BTCUSDT", Side::Buy, 0.8, "lse", None, None)
            .unwrap_err();
        assert_eq!(err, SubmitError::StrategyDisabled("lse".to_string()));

        orch.enable_strategy("lse").unwrap();
        orch.submit_signal("BTCUSDT", Side::Buy, 0.8, "lse", None, None)
            .unwrap();
        assert_eq!(orch.get_stats().queue_depth, 1);
    }

    #[tokio::test]
    async fn test_priority_defaults_from_registry() {
        let orch = make_orchestrator();
        orch.register_strategy(lse(true), None);
        orch.submit_signal("BTCUSDT", Side::Buy, 0.8, "lse", None, None)
            .unwrap();
        let queued = orch.queue.lock().unwrap().pop().unwrap();
        assert_eq!(queued.0.priority, Priority::Medium);
    }

    #[tokio::test]
    async fn test_priority_then_fifo_ordering() {
        let orch = make_orchestrator();
        orch.register_strategy(lse(true), None);
        for (symbol, priority) in [
            ("LOW1", Priority::Low),
            ("CRIT", Priority::Critical),
            ("MED1", Priority::Medium),
            ("MED2", Priority::Medium),
        ] {
            orch.submit_signal(symbol, Side::Buy, 0.8, "lse", Some(priority), None)
                .unwrap();
        }
        let mut order = Vec::new();
        while let Some(Reverse(q)) = orch.queue.lock().unwrap().pop() {
            order.push(q.request.symbol);
        }
        assert_eq!(order, vec!["CRIT", "MED1", "MED2", "LOW1"]);
    }

    #[tokio::test]
    async fn test_dispatch_publishes_allowed_signals_in_priority_order() {
        let orch = make_orchestrator();
        orch.register_strategy(lse(true), None);
        for (symbol, priority) in [
            ("LOWUSDT", Priority::Low),
            ("CRITUSDT", Priority::Critical),
            ("MEDUSDT", Priority::Medium),
        ] {
            orch.submit_signal(symbol, Side::Buy, 0.8, "lse", Some(priority), None)
                .unwrap();
        }
        orch.start();
        sleep(Duration::from_millis(150)).await;
        orch.stop().await;

        let stats = orch.get_stats();
        assert_eq!(stats.signals_executed, 3);
        assert_eq!(stats.queue_depth, 0);

        let sub = orch.bus.subscribe(SIGNALS_STREAM, "check");
        let batch = sub
            .next_batch(Duration::from_millis(20), 10)
            .await
            .unwrap();
        let symbols: Vec<String> = batch
            .iter()
            .map(|e| e.payload_json().unwrap()["symbol"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(symbols, vec!["CRITUSDT", "MEDUSDT", "LOWUSDT"]);
    }

    #[tokio::test]
    async fn test_blocked_signal_counted_not_published() {
        let orch = make_orchestrator();
        orch.register_strategy(lse(true), None);
        orch.submit_signal("BTCUSDT", Side::Buy, 0.10, "lse", None, None)
            .unwrap();
        orch.start();
        sleep(Duration::from_millis(100)).await;
        orch.stop().await;

        let stats = orch.get_stats();
        assert_eq!(stats.signals_executed, 0);
        assert_eq!(stats.signals_blocked, 1);
        let info = orch.bus.stream_info(SIGNALS_STREAM).unwrap();
        assert_eq!(info.length, 0);
    }

    #[tokio::test]
    async fn test_budget_caps_entry_sizing() {
        let orch = make_orchestrator();
        orch.register_strategy(lse(true), None); // budget_usd 1000
        let mut meta = Map::new();
        meta.insert("size_usd".to_string(), serde_json::json!(5000.0));
        orch.submit_signal("BTCUSDT", Side::Buy, 0.8, "lse", None, Some(meta))
            .unwrap();
        orch.start();
        sleep(Duration::from_millis(100)).await;
        orch.stop().await;

        let sub = orch.bus.subscribe(SIGNALS_STREAM, "check");
        let batch = sub.next_batch(Duration::from_millis(20), 10).await.unwrap();
        assert_eq!(batch.len(), 1);
        let payload = batch[0].payload_json().unwrap();
        assert_eq!(payload["metadata"]["size_usd"], serde_json::json!(1000.0));
    }

    #[tokio::test]
    async fn test_max_positions_refuses_new_symbols() {
        let orch = make_orchestrator();
        let mut cfg = lse(true);
        cfg.max_positions = 1;
        orch.register_strategy(cfg, None);

        orch.submit_signal("BTCUSDT", Side::Buy, 0.8, "lse", None, None)
            .unwrap();
        orch.start();
        sleep(Duration::from_millis(100)).await;

        // One symbol held: a second symbol is refused, an add to the held
        // symbol is not.
        orch.submit_signal("ETHUSDT", Side::Buy, 0.8, "lse", None, None)
            .unwrap();
        orch.submit_signal("BTCUSDT", Side::Buy, 0.8, "lse", None, None)
            .unwrap();
        sleep(Duration::from_millis(100)).await;
        orch.stop().await;

        let stats = orch.get_stats();
        assert_eq!(stats.signals_executed, 2);
        assert_eq!(stats.signals_blocked, 1);
        assert_eq!(stats.strategies[0].open_positions, 1);
        assert_eq!(orch.bus.stream_info(SIGNALS_STREAM).unwrap().length, 2);

        // An exit frees the slot.
        orch.submit_signal("BTCUSDT", Side::Sell, 0.8, "lse", None, None)
            .unwrap();
        orch.start();
        sleep(Duration::from_millis(100)).await;
        orch.stop().await;
        assert_eq!(orch.get_stats().strategies[0].open_positions, 0);
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle_idempotent() {
        let orch = make_orchestrator();
        assert_eq!(orch.get_stats().state, RunState::NotStarted);
        orch.stop().await; // not running: no-op
        assert_eq!(orch.get_stats().state, RunState::NotStarted);

        orch.start();
        orch.start(); // running: no-op
        assert_eq!(orch.get_stats().state, RunState::Running);

        orch.stop().await;
        assert_eq!(orch.get_stats().state, RunState::Stopped);
        orch.stop().await; // stopped: no-op
        assert_eq!(orch.get_stats().state, RunState::Stopped);

        // Restartable: queue survives the cycle and dispatch resumes.
        orch.register_strategy(lse(true), None);
        orch.submit_signal("BTCUSDT", Side::Buy, 0.8, "lse", None, None)
            .unwrap();
        orch.start();
        sleep(Duration::from_millis(100)).await;
        orch.stop().await;
        assert_eq!(orch.get_stats().signals_executed, 1);
    }

    #[tokio::test]
    async fn test_invalid_confidence_rejected() {
        let orch = make_orchestrator();
        orch.register_strategy(lse(true), None);
        let err = orch
            .submit_signal("BTCUSDT", Side::Buy, 1.5, "lse", None, None)
            .unwrap_err();
        assert!(matches!(err, SubmitError::InvalidConfidence(_)));
        assert_eq!(orch.get_stats().queue_depth, 0);
    }
}
