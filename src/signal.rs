//! Core signal value types shared across the pipeline.
//!
//! A `SignalRequest` is a directional trade proposal from one strategy; a
//! `SignalDecision` is the policy gate's verdict on it. Blocks are data, not
//! errors: callers branch on `Decision`, never on `Err`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Trade direction. Wire contract is -1/0/1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum Side {
    Sell,
    Flat,
    Buy,
}

impl Side {
    pub fn as_int(&self) -> i8 {
        match self {
            Side::Sell => -1,
            Side::Flat => 0,
            Side::Buy => 1,
        }
    }
}

impl From<Side> for i8 {
    fn from(s: Side) -> i8 {
        s.as_int()
    }
}

impl TryFrom<i8> for Side {
    type Error = String;

    fn try_from(v: i8) -> Result<Self, String> {
        match v {
            -1 => Ok(Side::Sell),
            0 => Ok(Side::Flat),
            1 => Ok(Side::Buy),
            other => Err(format!("side must be -1, 0 or 1, got {}", other)),
        }
    }
}

/// Dispatch priority. Lower ordinal dequeues first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical = 1,
    High = 2,
    Medium = 3,
    Low = 4,
}

impl Priority {
    pub fn as_int(&self) -> u8 {
        *self as u8
    }
}

/// Policy verdict. The rule pipeline emits Allow/Block/Throttle; Reduce is
/// part of the wire contract for downstream sizers that scale entries down
/// instead of rejecting them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Allow,
    Block,
    Throttle,
    Reduce,
}

/// A timestamped trade proposal, created at submission and discarded after
/// dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRequest {
    pub symbol: String,
    pub side: Side,
    pub confidence: f64,
    pub strategy: String,
    pub priority: Priority,
    pub ts_ms: u64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// The policy gate's verdict on one request. Exactly one per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalDecision {
    pub symbol: String,
    pub side: Side,
    pub confidence: f64,
    pub strategy: String,
    pub decision: Decision,
    pub reason: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl SignalDecision {
    pub fn is_allow(&self) -> bool {
        self.decision == Decision::Allow
    }
}

/// Boundary validation failures at signal submission. Rejected requests are
/// never enqueued.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),
    #[error("strategy disabled: {0}")]
    StrategyDisabled(String),
    #[error("invalid confidence {0} (must be within [0, 1])")]
    InvalidConfidence(String),
}

/// Execution-time failures in the paper engine. Pre-check failures never
/// reach the fill simulator and never mutate balance or positions.
#[derive(Debug, Error, PartialEq)]
pub enum ExecError {
    #[error("invalid signal: {0}")]
    InvalidSignal(String),
    #[error("no market data for {0}: no tick observed yet")]
    NoMarketData(String),
    #[error("insufficient balance: need {needed:.2}, have {available:.2}")]
    InsufficientBalance { needed: f64, available: f64 },
    #[error("no open position to close for {0}")]
    NoPositionToClose(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_round_trip() {
        for v in [-1i8, 0, 1] {
            let side = Side::try_from(v).unwrap();
            assert_eq!(side.as_int(), v);
        }
        assert!(Side::try_from(2).is_err());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::Medium < Priority::Low);
        assert_eq!(Priority::Critical.as_int(), 1);
        assert_eq!(Priority::Low.as_int(), 4);
    }

    #[test]
    fn test_decision_serde_uppercase() {
        let json = serde_json::to_string(&Decision::Allow).unwrap();
        assert_eq!(json, "\"ALLOW\"");
        let back: Decision = serde_json::from_str("\"THROTTLE\"").unwrap();
        assert_eq!(back, Decision::Throttle);
    }

    #[test]
    fn test_signal_request_serde() {
        let req = SignalRequest {
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            confidence: 0.8,
            strategy: "lse".to_string(),
            priority: Priority::High,
            ts_ms: 1_700_000_000_000,
            metadata: Map::new(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"side\":1"), "side serializes as int: {}", json);
        let back: SignalRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.side, Side::Buy);
        assert_eq!(back.priority, Priority::High);
    }
}
