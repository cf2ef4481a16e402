//! Stateful risk gate in front of every signal.
//!
//! `evaluate_signal` runs a fixed, short-circuiting rule pipeline; the first
//! failing rule decides the outcome. Blocks are decision values, not errors.
//! Counters, cooldowns and the kill switch are persisted write-through to the
//! state store; a persist failure fails closed (every decision becomes Block
//! until the store recovers). All mutation is serialized behind one mutex.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::logging::{error_log, json_log, obj, v_bool, v_num, v_str};
use crate::signal::{Decision, Side, SignalDecision};
use crate::state::{now_ts, Config};
use crate::storage::StateStore;

const POLICY_STATE_KEY: &str = "policy_state";

/// Audit/alerting hook. Implementations must not block.
pub trait PolicyObserver: Send + Sync {
    fn on_block(&self, _decision: &SignalDecision) {}
    fn on_kill_switch_toggle(&self, _active: bool, _reason: &str) {}
}

/// Persisted guardrail state. Survives process restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyState {
    pub daily_trades: u32,
    pub daily_pnl: f64,
    pub equity: f64,
    pub equity_peak: f64,
    pub positions: HashMap<String, f64>,
    pub kill_switch_active: bool,
    pub kill_switch_reason: String,
    pub symbol_cooldowns: HashMap<String, u64>,
    pub global_cooldown_until: u64,
}

impl PolicyState {
    fn fresh(equity: f64) -> Self {
        Self {
            daily_trades: 0,
            daily_pnl: 0.0,
            equity,
            equity_peak: equity,
            positions: HashMap::new(),
            kill_switch_active: false,
            kill_switch_reason: String::new(),
            symbol_cooldowns: HashMap::new(),
            global_cooldown_until: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PolicyStats {
    pub state: PolicyState,
    pub store_healthy: bool,
    pub blocks_by_rule: HashMap<String, u64>,
}

struct Inner {
    state: PolicyState,
    store_healthy: bool,
    blocks_by_rule: HashMap<String, u64>,
}

pub struct PolicyEngine {
    cfg: Config,
    store: Arc<StateStore>,
    inner: Mutex<Inner>,
    observers: Mutex<Vec<Arc<dyn PolicyObserver>>>,
}

impl PolicyEngine {
    /// Load persisted state (or start fresh at configured equity).
    pub fn new(cfg: Config, store: Arc<StateStore>) -> Result<Self> {
        let state = match store.get_kv(POLICY_STATE_KEY)? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => PolicyState::fresh(cfg.starting_cash),
        };
        Ok(Self {
            cfg,
            store,
            inner: Mutex::new(Inner {
                state,
                store_healthy: true,
                blocks_by_rule: HashMap::new(),
            }),
            observers: Mutex::new(Vec::new()),
        })
    }

    pub fn add_observer(&self, observer: Arc<dyn PolicyObserver>) {
        self.observers.lock().expect("observer lock").push(observer);
    }

    /// Run the rule pipeline. Fixed order, first failure wins:
    /// kill switch → store health → min confidence → daily trade count →
    /// daily loss → daily drawdown → symbol cooldown → global cooldown →
    /// exposure → entry headroom → spread. Cooldowns throttle, an entry that
    /// would overshoot the exposure cap gets Reduce, everything else blocks.
    pub fn evaluate_signal(
        &self,
        symbol: &str,
        side: Side,
        confidence: f64,
        strategy: &str,
        metadata: &Map<String, Value>,
    ) -> SignalDecision {
        let now = now_ts();
        let verdict = {
            let mut inner = self.inner.lock().expect("policy lock");
            let verdict =
                Self::first_failing_rule(&self.cfg, &inner, symbol, side, confidence, metadata, now);
            if let Some((rule, _, _)) = &verdict {
                *inner.blocks_by_rule.entry(rule.to_string()).or_insert(0) += 1;
            }
            verdict
        };

        let (decision, reason) = match verdict {
            Some((_, decision, reason)) => (decision, reason),
            None => (Decision::Allow, "all_checks_passed".to_string()),
        };

        let out = SignalDecision {
            symbol: symbol.to_string(),
            side,
            confidence,
            strategy: strategy.to_string(),
            decision,
            reason,
            metadata: metadata.clone(),
        };

        json_log(
            "policy.decision",
            obj(&[
                ("symbol", v_str(symbol)),
                ("side", v_num(side.as_int() as f64)),
                ("strategy", v_str(strategy)),
                ("decision", Value::String(format!("{:?}", out.decision))),
                ("reason", v_str(&out.reason)),
            ]),
        );

        if out.decision != Decision::Allow {
            for observer in self.observers.lock().expect("observer lock").iter() {
                observer.on_block(&out);
            }
        }
        out
    }

    fn first_failing_rule(
        cfg: &Config,
        inner: &Inner,
        symbol: &str,
        side: Side,
        confidence: f64,
        metadata: &Map<String, Value>,
        now: u64,
    ) -> Option<(&'static str, Decision, String)> {
        let state = &inner.state;

        if state.kill_switch_active {
            return Some((
                "kill_switch",
                Decision::Block,
                format!("kill_switch_active: {}", state.kill_switch_reason),
            ));
        }
        if !inner.store_healthy {
            return Some((
                "state_store",
                Decision::Block,
                "state_store_unavailable: failing closed".to_string(),
            ));
        }
        if confidence < cfg.min_confidence {
            return Some((
                "low_confidence",
                Decision::Block,
                format!("low_confidence: {:.2} < {:.2}", confidence, cfg.min_confidence),
            ));
        }
        if state.daily_trades >= cfg.max_trades_per_day {
            return Some((
                "max_daily_trades",
                Decision::Block,
                format!(
                    "max_daily_trades: {} >= {}",
                    state.daily_trades, cfg.max_trades_per_day
                ),
            ));
        }
        let equity = state.equity.max(1.0);
        if state.daily_pnl < 0.0 {
            let loss_pct = state.daily_pnl.abs() / equity;
            if loss_pct >= cfg.max_daily_loss_pct {
                return Some((
                    "daily_loss_limit",
                    Decision::Block,
                    format!(
                        "daily_loss_limit: {:.4} >= {:.4}",
                        loss_pct, cfg.max_daily_loss_pct
                    ),
                ));
            }
        }
        if state.equity_peak > 0.0 {
            let drawdown = (state.equity_peak - state.equity) / state.equity_peak;
            if drawdown >= cfg.max_drawdown_pct {
                return Some((
                    "daily_drawdown",
                    Decision::Block,
                    format!("daily_drawdown: {:.4} >= {:.4}", drawdown, cfg.max_drawdown_pct),
                ));
            }
        }
        if let Some(until) = state.symbol_cooldowns.get(symbol) {
            if *until > now {
                return Some((
                    "symbol_cooldown",
                    Decision::Throttle,
                    format!("symbol_cooldown: {}s remaining for {}", until - now, symbol),
                ));
            }
        }
        if state.global_cooldown_until > now {
            return Some((
                "global_cooldown",
                Decision::Throttle,
                format!(
                    "global_cooldown: {}s remaining",
                    state.global_cooldown_until - now
                ),
            ));
        }
        let notional_open: f64 = state.positions.values().map(|n| n.abs()).sum();
        let exposure = notional_open / equity;
        if exposure >= cfg.max_exposure_pct {
            return Some((
                "max_exposure",
                Decision::Block,
                format!("max_exposure: {:.4} >= {:.4}", exposure, cfg.max_exposure_pct),
            ));
        }
        // The cap is a post-condition of every entry: a sized buy must still
        // fit after its own notional is added. Exits only free exposure.
        if side == Side::Buy {
            if let Some(size_usd) = metadata.get("size_usd").and_then(Value::as_f64) {
                let post = (notional_open + size_usd.max(0.0)) / equity;
                if post > cfg.max_exposure_pct {
                    return Some((
                        "exposure_headroom",
                        Decision::Reduce,
                        format!(
                            "exposure_headroom: entry would lift exposure to {:.4} > {:.4}",
                            post, cfg.max_exposure_pct
                        ),
                    ));
                }
            }
        }
        if let Some(spread) = metadata.get("spread_pct").and_then(Value::as_f64) {
            if spread > cfg.max_spread_pct {
                return Some((
                    "wide_spread",
                    Decision::Block,
                    format!("wide_spread: {:.4} > {:.4}", spread, cfg.max_spread_pct),
                ));
            }
        }
        None
    }

    /// Account one realized trade: bump daily counters and arm cooldowns.
    /// Cooldown duration scales with outcome severity (stop-loss > loss > win).
    pub fn record_trade(&self, symbol: &str, pnl: f64, hit_stop_loss: bool) -> Result<()> {
        let now = now_ts();
        let cooldown = if hit_stop_loss {
            self.cfg.cooldown_stop_loss_secs
        } else if pnl < 0.0 {
            self.cfg.cooldown_loss_secs
        } else {
            self.cfg.cooldown_win_secs
        };

        let result = {
            let mut inner = self.inner.lock().expect("policy lock");
            inner.state.daily_trades += 1;
            inner.state.daily_pnl += pnl;
            inner
                .state
                .symbol_cooldowns
                .insert(symbol.to_string(), now + cooldown);
            inner.state.global_cooldown_until = now + self.cfg.global_cooldown_secs;
            self.persist_locked(&mut inner)
        };

        json_log(
            "policy.record_trade",
            obj(&[
                ("symbol", v_str(symbol)),
                ("pnl", v_num(pnl)),
                ("hit_stop_loss", v_bool(hit_stop_loss)),
                ("cooldown_secs", v_num(cooldown as f64)),
            ]),
        );
        result
    }

    /// Externally pushed exposure input. The engine never computes PnL.
    pub fn update_position(&self, symbol: &str, notional: f64) -> Result<()> {
        let mut inner = self.inner.lock().expect("policy lock");
        if notional.abs() < f64::EPSILON {
            inner.state.positions.remove(symbol);
        } else {
            inner.state.positions.insert(symbol.to_string(), notional);
        }
        self.persist_locked(&mut inner)
    }

    pub fn update_equity(&self, equity: f64) -> Result<()> {
        let mut inner = self.inner.lock().expect("policy lock");
        inner.state.equity = equity;
        if equity > inner.state.equity_peak {
            inner.state.equity_peak = equity;
        }
        self.persist_locked(&mut inner)
    }

    /// Idempotent: re-activating with a new reason keeps the original.
    pub fn activate_kill_switch(&self, reason: &str) -> Result<()> {
        let toggled = {
            let mut inner = self.inner.lock().expect("policy lock");
            if inner.state.kill_switch_active {
                false
            } else {
                inner.state.kill_switch_active = true;
                inner.state.kill_switch_reason = reason.to_string();
                self.persist_locked(&mut inner)?;
                true
            }
        };
        if toggled {
            json_log(
                "policy.kill_switch",
                obj(&[("active", v_bool(true)), ("reason", v_str(reason))]),
            );
            for observer in self.observers.lock().expect("observer lock").iter() {
                observer.on_kill_switch_toggle(true, reason);
            }
        }
        Ok(())
    }

    pub fn deactivate_kill_switch(&self) -> Result<()> {
        let toggled = {
            let mut inner = self.inner.lock().expect("policy lock");
            if !inner.state.kill_switch_active {
                false
            } else {
                inner.state.kill_switch_active = false;
                inner.state.kill_switch_reason = String::new();
                self.persist_locked(&mut inner)?;
                true
            }
        };
        if toggled {
            json_log("policy.kill_switch", obj(&[("active", v_bool(false))]));
            for observer in self.observers.lock().expect("observer lock").iter() {
                observer.on_kill_switch_toggle(false, "");
            }
        }
        Ok(())
    }

    /// Invoked by an external scheduler at day rollover. Resets only the
    /// trade count and PnL; cooldowns and kill switch are untouched.
    pub fn reset_daily_stats(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("policy lock");
        inner.state.daily_trades = 0;
        inner.state.daily_pnl = 0.0;
        self.persist_locked(&mut inner)?;
        json_log("policy.daily_reset", obj(&[]));
        Ok(())
    }

    pub fn stats(&self) -> PolicyStats {
        let inner = self.inner.lock().expect("policy lock");
        PolicyStats {
            state: inner.state.clone(),
            store_healthy: inner.store_healthy,
            blocks_by_rule: inner.blocks_by_rule.clone(),
        }
    }

    fn persist_locked(&self, inner: &mut Inner) -> Result<()> {
        let raw = serde_json::to_string(&inner.state)?;
        match self.store.put_kv(POLICY_STATE_KEY, &raw) {
            Ok(()) => {
                inner.store_healthy = true;
                Ok(())
            }
            Err(err) => {
                inner.store_healthy = false;
                error_log(
                    "policy.store_error",
                    obj(&[("error", v_str(&err.to_string()))]),
                );
                Err(err)
            }
        }
    }

    #[cfg(test)]
    fn mark_store_unhealthy(&self) {
        self.inner.lock().expect("policy lock").store_healthy = false;
    }
}
