//! Tick-driven paper accounting with slippage-aware fills.
//!
//! Prices only ever come from the latest streamed tick; the engine never
//! fetches a quote itself, so fills stay consistent with the PnL feed. The
//! positions map, cash balance and equity are one logical unit: every
//! mutation and recompute happens inside a single critical section.
//!
//! Accounting: equity = cash + Σ unrealized PnL. Long unrealized is
//! `(mark - avg) * qty`, short is `(avg - mark) * |qty|`. Every realized
//! close reports back into the policy engine so loss-limit and cooldown
//! state track actual fills.
//!
//! Drawdown and the equity fed to the risk gate are mark-to-market
//! (cash + position market value): converting cash into cost basis moves
//! value, it does not lose it, so an entry never reads as a drawdown.

use anyhow::{anyhow, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::bus::Event;
use crate::logging::{error_log, json_log, obj, v_num, v_str};
use crate::policy::PolicyEngine;
use crate::signal::ExecError;
use crate::state::Config;
use crate::storage::StateStore;

/// One open book entry. Created on first entry, removed at qty zero.
#[derive(Debug, Clone)]
pub struct Position {
    pub symbol: String,
    pub qty: f64,
    pub avg_price: f64,
    pub entry_ts_ms: u64,
}

impl Position {
    pub fn unrealized(&self, mark: f64) -> f64 {
        if self.qty >= 0.0 {
            (mark - self.avg_price) * self.qty
        } else {
            (self.avg_price - mark) * self.qty.abs()
        }
    }
}

/// Outcome of one simulated fill.
#[derive(Debug, Clone)]
pub struct FillReport {
    pub symbol: String,
    pub side: String,
    pub qty: f64,
    pub fill_price: f64,
    pub fee: f64,
    pub realized_pnl: Option<f64>,
    pub cash_after: f64,
}

#[derive(Debug, Clone)]
pub struct PositionStat {
    pub symbol: String,
    pub qty: f64,
    pub avg_price: f64,
    pub mark: f64,
    pub unrealized: f64,
}

#[derive(Debug, Clone)]
pub struct PortfolioStats {
    pub cash: f64,
    pub realized: f64,
    pub unrealized: f64,
    pub equity: f64,
    pub high_water: f64,
    pub drawdown: f64,
    pub positions: Vec<PositionStat>,
}

struct Book {
    cash: f64,
    realized: f64,
    positions: HashMap<String, Position>,
    marks: HashMap<String, f64>,
    equity: f64,
    mtm_equity: f64,
    high_water: f64,
    drawdown: f64,
    last_snapshot_bucket: Option<u64>,
}

impl Book {
    fn unrealized_total(&self) -> f64 {
        self.positions
            .values()
            .map(|p| {
                let mark = self.marks.get(&p.symbol).copied().unwrap_or(p.avg_price);
                p.unrealized(mark)
            })
            .sum()
    }

    /// Market value of the open book. A short contributes its posted basis
    /// plus PnL, so covering it returns exactly that much cash.
    fn market_value(&self) -> f64 {
        self.positions
            .values()
            .map(|p| {
                let mark = self.marks.get(&p.symbol).copied().unwrap_or(p.avg_price);
                if p.qty >= 0.0 {
                    p.qty * mark
                } else {
                    p.avg_price * p.qty.abs() + p.unrealized(mark)
                }
            })
            .sum()
    }

    fn recompute_equity(&mut self) {
        self.equity = self.cash + self.unrealized_total();
        // High-water and drawdown track mark-to-market value, not the
        // cash-plus-PnL figure: an entry moves value, it does not lose it.
        self.mtm_equity = self.cash + self.market_value();
        if self.mtm_equity > self.high_water {
            self.high_water = self.mtm_equity;
        }
        self.drawdown = if self.high_water > 0.0 {
            (self.high_water - self.mtm_equity) / self.high_water
        } else {
            0.0
        };
    }
}

pub struct RealtimePaperEngine {
    cfg: Config,
    store: Arc<StateStore>,
    policy: Arc<PolicyEngine>,
    book: Mutex<Book>,
}

impl RealtimePaperEngine {
    pub fn new(cfg: Config, store: Arc<StateStore>, policy: Arc<PolicyEngine>) -> Self {
        let cash = cfg.starting_cash;
        Self {
            cfg,
            store,
            policy,
            book: Mutex::new(Book {
                cash,
                realized: 0.0,
                positions: HashMap::new(),
                marks: HashMap::new(),
                equity: cash,
                mtm_equity: cash,
                high_water: cash,
                drawdown: 0.0,
                last_snapshot_bucket: None,
            }),
        }
    }

    /// Mark-to-market on a streamed tick. Updates the last-known price,
    /// recomputes equity/drawdown, pushes fresh exposure numbers into the
    /// policy engine, and persists an equity-curve row once per time bucket.
    pub fn on_tick(&self, symbol: &str, price: f64, ts_ms: u64) -> Result<()> {
        if price <= 0.0 {
            return Err(anyhow!("non-positive tick price {} for {}", price, symbol));
        }
        let mut book = self.book.lock().expect("book lock");
        book.marks.insert(symbol.to_string(), price);
        book.recompute_equity();

        let notional = book
            .positions
            .get(symbol)
            .map(|p| p.qty * price)
            .unwrap_or(0.0);
        let equity = book.mtm_equity;
        self.policy.update_position(symbol, notional)?;
        self.policy.update_equity(equity)?;

        let bucket = (ts_ms / 1000) / self.cfg.snapshot_secs.max(1);
        if book.last_snapshot_bucket != Some(bucket) {
            book.last_snapshot_bucket = Some(bucket);
            let (realized, unrealized) = (book.realized, book.unrealized_total());
            self.store.persist_equity_snapshot(
                ts_ms / 1000,
                book.cash,
                realized,
                unrealized,
                book.drawdown,
            )?;
        }
        Ok(())
    }

    /// Simulate one fill against the latest tick. Pre-check failures return
    /// before any mutation; a realized close reports its PnL into the policy
    /// engine's loss tracking.
    pub fn execute_signal(
        &self,
        symbol: &str,
        side: &str,
        size: f64,
        metadata: &Map<String, Value>,
    ) -> Result<FillReport, ExecError> {
        if side != "buy" && side != "sell" {
            return Err(ExecError::InvalidSignal(format!("bad side {:?}", side)));
        }
        if size <= 0.0 || !size.is_finite() {
            return Err(ExecError::InvalidSignal(format!("non-positive size {}", size)));
        }

        let mut book = self.book.lock().expect("book lock");
        let mark = *book
            .marks
            .get(symbol)
            .ok_or_else(|| ExecError::NoMarketData(symbol.to_string()))?;

        // Slippage worsens the price against the taker.
        let slip = self.cfg.slippage_bps / 10_000.0;
        let fill_price = if side == "buy" {
            mark * (1.0 + slip)
        } else {
            mark * (1.0 - slip)
        };

        let report = if side == "buy" {
            let fee = fill_price * size * self.cfg.fee_bps / 10_000.0;
            let cost = fill_price * size + fee;
            if cost > book.cash {
                return Err(ExecError::InsufficientBalance {
                    needed: cost,
                    available: book.cash,
                });
            }
            book.cash -= cost;
            let entry = book
                .positions
                .entry(symbol.to_string())
                .or_insert_with(|| Position {
                    symbol: symbol.to_string(),
                    qty: 0.0,
                    avg_price: 0.0,
                    entry_ts_ms: crate::state::now_ms(),
                });
            // Size-weighted average cost basis across adds.
            let total_qty = entry.qty + size;
            entry.avg_price = (entry.avg_price * entry.qty + fill_price * size) / total_qty;
            entry.qty = total_qty;
            FillReport {
                symbol: symbol.to_string(),
                side: side.to_string(),
                qty: size,
                fill_price,
                fee,
                realized_pnl: None,
                cash_after: book.cash,
            }
        } else {
            let open_qty = match book.positions.get(symbol) {
                Some(p) if p.qty > 0.0 => p.qty,
                _ => return Err(ExecError::NoPositionToClose(symbol.to_string())),
            };
            let qty = size.min(open_qty);
            let fee = fill_price * qty * self.cfg.fee_bps / 10_000.0;
            let avg = book.positions[symbol].avg_price;
            let realized = (fill_price - avg) * qty - fee;
            book.cash += fill_price * qty - fee;
            book.realized += realized;
            let remaining = {
                let p = book.positions.get_mut(symbol).expect("position present");
                p.qty -= qty;
                p.qty
            };
            if remaining.abs() < 1e-12 {
                book.positions.remove(symbol);
            }
            FillReport {
                symbol: symbol.to_string(),
                side: side.to_string(),
                qty,
                fill_price,
                fee,
                realized_pnl: Some(realized),
                cash_after: book.cash,
            }
        };

        book.recompute_equity();
        let notional = book
            .positions
            .get(symbol)
            .map(|p| {
                let mark = book.marks.get(symbol).copied().unwrap_or(p.avg_price);
                p.qty * mark
            })
            .unwrap_or(0.0);
        let equity = book.mtm_equity;
        drop(book);

        // Push fresh exposure and realized results into the risk tracker.
        // Persist failures there fail closed on the policy side; the fill
        // itself stands.
        if let Err(err) = self.policy.update_position(symbol, notional) {
            error_log("paper.policy_error", obj(&[("error", v_str(&err.to_string()))]));
        }
        if let Err(err) = self.policy.update_equity(equity) {
            error_log("paper.policy_error", obj(&[("error", v_str(&err.to_string()))]));
        }
        if let Some(realized) = report.realized_pnl {
            let hit_stop_loss = metadata
                .get("exit_reason")
                .and_then(Value::as_str)
                .map(|r| r == "stop_loss")
                .unwrap_or(false);
            if let Err(err) = self.policy.record_trade(symbol, realized, hit_stop_loss) {
                error_log("paper.policy_error", obj(&[("error", v_str(&err.to_string()))]));
            }
        }

        json_log(
            "paper.fill",
            obj(&[
                ("symbol", v_str(symbol)),
                ("side", v_str(side)),
                ("qty", v_num(report.qty)),
                ("fill_price", v_num(report.fill_price)),
                ("fee", v_num(report.fee)),
                ("realized", v_num(report.realized_pnl.unwrap_or(0.0))),
                ("cash", v_num(report.cash_after)),
            ]),
        );
        Ok(report)
    }

    /// Point-in-time snapshot; takes the book lock briefly, never blocks on
    /// I/O.
    pub fn get_portfolio_stats(&self) -> PortfolioStats {
        let book = self.book.lock().expect("book lock");
        let positions = book
            .positions
            .values()
            .map(|p| {
                let mark = book.marks.get(&p.symbol).copied().unwrap_or(p.avg_price);
                PositionStat {
                    symbol: p.symbol.clone(),
                    qty: p.qty,
                    avg_price: p.avg_price,
                    mark,
                    unrealized: p.unrealized(mark),
                }
            })
            .collect();
        PortfolioStats {
            cash: book.cash,
            realized: book.realized,
            unrealized: book.unrealized_total(),
            equity: book.equity,
            high_water: book.high_water,
            drawdown: book.drawdown,
            positions,
        }
    }

    /// Bus handler for the "ticks" stream: payload `{symbol, price}`.
    pub fn handle_tick_event(&self, event: &Event) -> Result<()> {
        let payload = event.payload_json()?;
        let symbol = payload["symbol"]
            .as_str()
            .ok_or_else(|| anyhow!("tick event {} missing symbol", event.id))?;
        let price = payload["price"]
            .as_f64()
            .ok_or_else(|| anyhow!("tick event {} missing price", event.id))?;
        self.on_tick(symbol, price, event.ts_ms)
    }

    /// Bus handler for the "signals" stream: turns an approved decision into
    /// a paper order. Order size comes from decision metadata (`qty`, or
    /// `size_usd` against the latest mark); a decision without sizing is a
    /// handler error and lands in the DLQ.
    pub fn handle_decision_event(&self, event: &Event) -> Result<()> {
        let payload = event.payload_json()?;
        let symbol = payload["symbol"]
            .as_str()
            .ok_or_else(|| anyhow!("decision event {} missing symbol", event.id))?
            .to_string();
        let side = match payload["side"].as_i64() {
            Some(1) => "buy",
            Some(-1) => "sell",
            Some(0) => return Ok(()), // flat: nothing to execute
            _ => return Err(anyhow!("decision event {} has bad side", event.id)),
        };
        let metadata = payload["metadata"].as_object().cloned().unwrap_or_default();

        let qty = if let Some(qty) = metadata.get("qty").and_then(Value::as_f64) {
            qty
        } else if let Some(size_usd) = metadata.get("size_usd").and_then(Value::as_f64) {
            let mark = {
                let book = self.book.lock().expect("book lock");
                book.marks.get(&symbol).copied()
            };
            match mark {
                Some(mark) if mark > 0.0 => size_usd / mark,
                _ => return Err(anyhow!("no mark to size {} usd for {}", size_usd, symbol)),
            }
        } else {
            return Err(anyhow!("decision event {} carries no qty/size_usd", event.id));
        };

        self.execute_signal(&symbol, side, qty, &metadata)
            .map(|_| ())
            .map_err(|e| anyhow!("{}", e))
    }
}
