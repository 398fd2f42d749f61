use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One observation of a single perpetual instrument, as joined from the
/// 24h ticker, funding and open-interest endpoints within one cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    /// Last traded price; doubles as the close of the rolling 24h bar.
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    /// 24h change as a fraction (-0.025 = -2.5%).
    pub price_change_pct: f64,
    /// Current funding rate as a signed fraction (-0.001 = -0.10%).
    pub funding_rate: f64,
    pub open_interest: f64,
}

impl MarketSnapshot {
    /// Admission invariant for the store: price and OI must be strictly
    /// positive. Rows violating this are dropped, never persisted.
    pub fn is_admissible(&self) -> bool {
        self.close > 0.0 && self.open_interest > 0.0
    }
}

/// One persisted row of a symbol's time series, independent of which
/// on-disk layout it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRow {
    pub ts: DateTime<Utc>,
    pub price: f64,
    pub open_interest: f64,
    pub funding_rate: f64,
}

/// One kline bar as returned by the exchange, used only as chart input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KlineBar {
    pub open_ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// How many trigger conditions co-occur and how hard they fire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum SignalStrength {
    Weak,
    Moderate,
    Strong,
}

impl SignalStrength {
    pub fn rank(self) -> u8 {
        match self {
            SignalStrength::Weak => 1,
            SignalStrength::Moderate => 2,
            SignalStrength::Strong => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SignalStrength::Weak => "WEAK",
            SignalStrength::Moderate => "MODERATE",
            SignalStrength::Strong => "STRONG",
        }
    }
}

impl std::fmt::Display for SignalStrength {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Escalation tier, independent of strength. A single hard condition is
/// enough to flip a signal to Strong severity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Normal,
    Strong,
}

impl Severity {
    pub fn rank(self) -> u8 {
        match self {
            Severity::Normal => 0,
            Severity::Strong => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Normal => "NORMAL",
            Severity::Strong => "STRONG",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which OI window(s) fired for this signal.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum OiTrigger {
    #[default]
    #[serde(rename = "")]
    None,
    #[serde(rename = "15m")]
    Window15m,
    #[serde(rename = "1h")]
    Window1h,
    #[serde(rename = "both")]
    Both,
}

impl OiTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            OiTrigger::None => "",
            OiTrigger::Window15m => "15m",
            OiTrigger::Window1h => "1h",
            OiTrigger::Both => "both",
        }
    }
}

impl std::fmt::Display for OiTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Analysis result for one symbol at one evaluation instant.
///
/// Created once per analysis pass. The only mutation after creation is the
/// BTC veto step, which may flip `btc_veto` and rewrite `trend`/`advice`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SqueezeSignal {
    pub symbol: String,
    pub ts: DateTime<Utc>,
    pub price: f64,
    pub funding_rate: f64,
    pub current_oi: f64,
    pub oi_short_ma: f64,
    pub oi_long_ma: f64,
    pub oi_ratio: f64,
    pub is_extreme_funding: bool,
    pub is_oi_surge: bool,
    pub strength: SignalStrength,
    pub severity: Severity,
    /// Price change over the loaded window, or the 24h override when the
    /// collector supplied one.
    pub price_change_pct: f64,
    /// (short MA - long MA) / long MA.
    pub oi_change_pct: f64,
    pub oi_change_15m: f64,
    pub oi_change_1h: f64,
    pub oi_trigger: OiTrigger,
    pub trend: String,
    pub advice: String,
    pub btc_change_pct: f64,
    pub btc_veto: bool,
}

impl SqueezeSignal {
    pub fn is_strong(&self) -> bool {
        self.severity == Severity::Strong
    }

    /// Sort key for dispatch: Strong severity first, then strength.
    pub fn dispatch_rank(&self) -> (u8, u8) {
        (self.severity.rank(), self.strength.rank())
    }
}

/// Process-wide collector state. `Banned` is terminal for the run; there is
/// no automatic recovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BanState {
    #[default]
    Active,
    RateLimited,
    Banned,
}

/// Collector failure classes. Only `Banned` crosses component boundaries
/// and changes control flow; everything else degrades to "no data this
/// cycle" for the affected symbol or request.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("ip banned by exchange (http {status})")]
    Banned { status: u16 },
    #[error("request failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
    #[error("non-retryable http status {status}")]
    Rejected { status: u16 },
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected response shape: {0}")]
    Decode(String),
}

impl CollectError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, CollectError::Banned { .. })
    }
}
