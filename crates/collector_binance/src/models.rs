//! Wire DTOs for the Binance USD-M futures REST API. Numeric fields arrive
//! as strings and are parsed at the edge.

use chrono::{DateTime, TimeZone, Utc};
use core_types::KlineBar;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ExchangeInfo {
    pub symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub symbol: String,
    #[serde(default)]
    pub quote_asset: String,
    #[serde(default)]
    pub contract_type: String,
    #[serde(default)]
    pub status: String,
}

impl SymbolInfo {
    pub fn is_tradable_perp(&self, quote_asset: &str) -> bool {
        self.quote_asset == quote_asset
            && self.contract_type == "PERPETUAL"
            && self.status == "TRADING"
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker24hRaw {
    pub symbol: String,
    #[serde(default)]
    pub open_price: String,
    #[serde(default)]
    pub high_price: String,
    #[serde(default)]
    pub low_price: String,
    #[serde(default)]
    pub last_price: String,
    #[serde(default)]
    pub volume: String,
    #[serde(default)]
    pub quote_volume: String,
    #[serde(default)]
    pub price_change_percent: String,
}

/// Parsed 24h ticker stats for one instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct TickerStats {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    /// 24h change as a fraction (-0.025 = -2.5%).
    pub price_change_pct: f64,
}

impl Ticker24hRaw {
    /// None when the mandatory price fields do not parse; such tickers are
    /// skipped, never stored.
    pub fn parse(&self) -> Option<TickerStats> {
        let close = self.last_price.parse::<f64>().ok()?;
        let quote_volume = self.quote_volume.parse::<f64>().ok()?;
        Some(TickerStats {
            open: self.open_price.parse().unwrap_or(0.0),
            high: self.high_price.parse().unwrap_or(0.0),
            low: self.low_price.parse().unwrap_or(0.0),
            close,
            volume: self.volume.parse().unwrap_or(0.0),
            quote_volume,
            // Binance reports percent (-2.5 means -2.5%).
            price_change_pct: self.price_change_percent.parse::<f64>().unwrap_or(0.0) / 100.0,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PremiumIndexRaw {
    pub symbol: String,
    #[serde(default)]
    pub last_funding_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInterestRaw {
    #[allow(dead_code)]
    pub symbol: String,
    pub open_interest: String,
}

/// Kline rows arrive as heterogeneous JSON arrays:
/// [open_time, open, high, low, close, volume, close_time, ...].
pub fn parse_kline_rows(rows: &[Vec<serde_json::Value>]) -> Vec<KlineBar> {
    rows.iter()
        .filter_map(|row| {
            if row.len() < 6 {
                return None;
            }
            let open_ts = row[0].as_i64().and_then(ms_to_dt)?;
            Some(KlineBar {
                open_ts,
                open: value_to_f64(&row[1])?,
                high: value_to_f64(&row[2])?,
                low: value_to_f64(&row[3])?,
                close: value_to_f64(&row[4])?,
                volume: value_to_f64(&row[5])?,
            })
        })
        .collect()
}

fn ms_to_dt(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

fn value_to_f64(v: &serde_json::Value) -> Option<f64> {
    match v {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}
