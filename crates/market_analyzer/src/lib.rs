//! Rolling-window metric engine.
//!
//! Consumes a symbol's stored history plus the latest snapshot and emits a
//! classified [`SqueezeSignal`] or nothing. Classification runs two
//! independent tiers: `strength` measures how many trigger conditions
//! co-occur, `severity` is a separate must-escalate tripwire used for
//! notification urgency.

use std::collections::HashMap;

use chrono::Utc;
use core_types::{
    HistoryRow, MarketSnapshot, OiTrigger, Severity, SignalStrength, SqueezeSignal,
};
use market_store::TimeSeriesStore;
use serde::{Deserialize, Serialize};

/// Sampling cadence the fixed lookback offsets assume. The 15m/1h windows
/// are index offsets (-4 / -13), so with a different poll interval the
/// computed percentages describe a different time span.
pub const ASSUMED_CADENCE_SECS: u64 = 300;

/// 15 minutes back at the assumed cadence: current, -5m, -10m, -15m.
const OFFSET_15M: usize = 4;
/// One hour back: 12 periods plus the current sample.
const OFFSET_1H: usize = 13;

/// Funding pivot used by the trend table (0.05%).
const FUNDING_PIVOT: f64 = 0.0005;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalyzerConfig {
    pub short_window: usize,
    pub long_window: usize,
    /// Normal-tier funding threshold, signed (-0.0005 = -0.05%). The
    /// extremity flag fires on magnitude, either sign.
    pub normal_funding: f64,
    /// Strong-tier funding threshold, signed (-0.0010 = -0.10%).
    pub strong_funding: f64,
    pub normal_oi_ratio: f64,
    pub strong_oi_ratio: f64,
    /// Hard cutoffs that upgrade a double-trigger to Strong strength.
    pub hard_strong_funding: f64,
    pub hard_strong_ratio: f64,
    pub oi_15m_normal: f64,
    pub oi_15m_strong: f64,
    pub oi_1h_normal: f64,
    pub oi_1h_strong: f64,
    /// Reference-asset 24h change below which the market veto fires.
    pub btc_veto_threshold: f64,
    pub btc_veto_enabled: bool,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            short_window: 3,
            long_window: 13,
            normal_funding: -0.0005,
            strong_funding: -0.0010,
            normal_oi_ratio: 1.2,
            strong_oi_ratio: 2.0,
            hard_strong_funding: 0.003,
            hard_strong_ratio: 3.0,
            oi_15m_normal: 0.05,
            oi_15m_strong: 0.12,
            oi_1h_normal: 0.15,
            oi_1h_strong: 0.30,
            btc_veto_threshold: -0.01,
            btc_veto_enabled: true,
        }
    }
}

/// OI moving averages over the rolling history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OiMetrics {
    pub current: f64,
    pub short_ma: f64,
    pub long_ma: f64,
    pub ratio: f64,
}

pub struct MarketAnalyzer {
    cfg: AnalyzerConfig,
    store: TimeSeriesStore,
}

impl MarketAnalyzer {
    pub fn new(cfg: AnalyzerConfig, store: TimeSeriesStore) -> Self {
        Self { cfg, store }
    }

    pub fn cfg(&self) -> &AnalyzerConfig {
        &self.cfg
    }

    /// Analyze one symbol. Returns None for insufficient history or when no
    /// trigger condition fires; neither case is an error.
    pub fn analyze(
        &self,
        symbol: &str,
        history: &[HistoryRow],
        latest: Option<&MarketSnapshot>,
    ) -> Option<SqueezeSignal> {
        if history.len() < self.cfg.short_window {
            tracing::debug!(
                symbol,
                rows = history.len(),
                need = self.cfg.short_window,
                "insufficient history, skipping"
            );
            return None;
        }

        let stored_last = history.last()?;
        let price = latest.map(|s| s.close).unwrap_or(stored_last.price);
        let funding_rate = latest
            .map(|s| s.funding_rate)
            .unwrap_or(stored_last.funding_rate);

        let oi = oi_metrics(history, self.cfg.short_window, self.cfg.long_window);
        let (oi_change_15m, oi_change_1h) = dual_window_changes(history);
        let oi_trigger = classify_trigger(oi_change_15m, oi_change_1h, &self.cfg);

        let is_extreme_funding = funding_rate.abs() >= self.cfg.normal_funding.abs();
        let window_fired = oi_change_15m >= self.cfg.oi_15m_normal
            || oi_change_1h >= self.cfg.oi_1h_normal;
        let is_oi_surge = oi.ratio >= self.cfg.normal_oi_ratio || window_fired;

        let strength = classify_strength(
            is_extreme_funding,
            is_oi_surge,
            funding_rate,
            oi.ratio,
            &self.cfg,
        )?;
        let severity = classify_severity(
            funding_rate,
            oi.ratio,
            oi_change_15m,
            oi_change_1h,
            &self.cfg,
        );

        // Window-endpoint change unless the collector supplied the 24h
        // override, which wins.
        let price_change_pct = match latest {
            Some(snapshot) => snapshot.price_change_pct,
            None => {
                let first = &history[0];
                if first.price > 0.0 {
                    (price - first.price) / first.price
                } else {
                    0.0
                }
            }
        };
        let oi_change_pct = if oi.long_ma > 0.0 {
            (oi.short_ma - oi.long_ma) / oi.long_ma
        } else {
            0.0
        };

        let (trend, advice) = determine_trend(price_change_pct, oi_change_pct, funding_rate);

        Some(SqueezeSignal {
            symbol: symbol.to_string(),
            ts: Utc::now(),
            price,
            funding_rate,
            current_oi: oi.current,
            oi_short_ma: oi.short_ma,
            oi_long_ma: oi.long_ma,
            oi_ratio: oi.ratio,
            is_extreme_funding,
            is_oi_surge,
            strength,
            severity,
            price_change_pct,
            oi_change_pct,
            oi_change_15m,
            oi_change_1h,
            oi_trigger,
            trend: trend.to_string(),
            advice: advice.to_string(),
            btc_change_pct: 0.0,
            btc_veto: false,
        })
    }

    /// Run the per-symbol analysis over every stored history, filter by
    /// minimum strength and sort descending by (strength, oi_ratio). Ties
    /// keep input order.
    pub fn analyze_all(
        &self,
        latest: &HashMap<String, MarketSnapshot>,
        min_strength: SignalStrength,
    ) -> Vec<SqueezeSignal> {
        let symbols = match self.store.symbols() {
            Ok(symbols) => symbols,
            Err(err) => {
                tracing::warn!(error = %err, "cannot enumerate stored symbols");
                return Vec::new();
            }
        };

        let mut signals = Vec::new();
        for symbol in &symbols {
            let history = match self.store.load_history(symbol) {
                Ok(history) => history,
                Err(err) => {
                    tracing::warn!(symbol, error = %err, "history load failed");
                    continue;
                }
            };
            if let Some(signal) = self.analyze(symbol, &history, latest.get(symbol.as_str())) {
                if signal.strength.rank() >= min_strength.rank() {
                    tracing::debug!(
                        symbol,
                        strength = %signal.strength,
                        oi_ratio = signal.oi_ratio,
                        funding = signal.funding_rate,
                        "signal detected"
                    );
                    signals.push(signal);
                }
            }
        }

        signals.sort_by(|a, b| {
            b.strength
                .rank()
                .cmp(&a.strength.rank())
                .then(b.oi_ratio.total_cmp(&a.oi_ratio))
        });

        tracing::info!(
            analyzed = symbols.len(),
            signals = signals.len(),
            "analysis pass complete"
        );
        signals
    }

    /// Market-wide safety override. When the reference asset is dumping,
    /// Normal-severity signals are dropped and Strong ones are re-labelled
    /// as trap warnings; otherwise the change is only stamped for audit.
    pub fn apply_btc_veto(
        &self,
        signals: Vec<SqueezeSignal>,
        btc_change_pct: f64,
    ) -> Vec<SqueezeSignal> {
        if !self.cfg.btc_veto_enabled {
            return signals;
        }

        let dumping = btc_change_pct < self.cfg.btc_veto_threshold;
        if !dumping {
            return signals
                .into_iter()
                .map(|mut signal| {
                    signal.btc_change_pct = btc_change_pct;
                    signal
                })
                .collect();
        }

        tracing::warn!(
            change_pct = btc_change_pct * 100.0,
            "market veto triggered by reference dump"
        );

        let before = signals.len();
        let kept: Vec<SqueezeSignal> = signals
            .into_iter()
            .filter_map(|mut signal| {
                signal.btc_change_pct = btc_change_pct;
                signal.btc_veto = true;
                if signal.severity == Severity::Strong {
                    signal.trend = VETO_TREND.to_string();
                    signal.advice = VETO_ADVICE.to_string();
                    Some(signal)
                } else {
                    None
                }
            })
            .collect();

        let suppressed = before - kept.len();
        if suppressed > 0 {
            tracing::info!(suppressed, "veto suppressed normal-severity signals");
        }
        kept
    }

    /// Funding-rate breadth across the latest cycle, for the per-cycle log.
    pub fn market_summary(&self, latest: &HashMap<String, MarketSnapshot>) -> MarketSummary {
        let threshold = self.cfg.normal_funding.abs();
        let mut summary = MarketSummary {
            total_symbols: latest.len(),
            ..MarketSummary::default()
        };
        for snapshot in latest.values() {
            let fr = snapshot.funding_rate;
            if fr > 0.0 {
                summary.positive_funding += 1;
                if fr > threshold {
                    summary.extreme_positive += 1;
                }
            } else if fr < 0.0 {
                summary.negative_funding += 1;
                if fr < -threshold {
                    summary.extreme_negative += 1;
                }
            }
        }
        summary.sentiment = sentiment_label(
            summary.positive_funding,
            summary.negative_funding,
            summary.total_symbols,
        );
        summary
    }
}

const VETO_TREND: &str = "⛈️ 大盘暴跌 (BTC预警)";
const VETO_ADVICE: &str = "🛡️ 暂停交易 / 风险极高";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MarketSummary {
    pub total_symbols: usize,
    pub positive_funding: usize,
    pub negative_funding: usize,
    pub extreme_positive: usize,
    pub extreme_negative: usize,
    pub sentiment: &'static str,
}

fn sentiment_label(positive: usize, negative: usize, total: usize) -> &'static str {
    if total == 0 {
        return "NEUTRAL";
    }
    let positive_ratio = positive as f64 / total as f64;
    let negative_ratio = negative as f64 / total as f64;
    if positive_ratio > 0.7 {
        "🟢 EXTREMELY BULLISH"
    } else if positive_ratio > 0.55 {
        "🟢 BULLISH"
    } else if negative_ratio > 0.7 {
        "🔴 EXTREMELY BEARISH"
    } else if negative_ratio > 0.55 {
        "🔴 BEARISH"
    } else {
        "⚪ NEUTRAL"
    }
}

/// Short/long OI moving averages. The long window falls back to every
/// available point while the history is still shorter than it.
pub fn oi_metrics(history: &[HistoryRow], short_window: usize, long_window: usize) -> OiMetrics {
    let current = history.last().map(|r| r.open_interest).unwrap_or(0.0);
    if history.len() < short_window {
        return OiMetrics {
            current,
            short_ma: current,
            long_ma: current,
            ratio: 1.0,
        };
    }

    let short_ma = mean_tail(history, short_window);
    let long_ma = if history.len() >= long_window {
        mean_tail(history, long_window)
    } else {
        mean_tail(history, history.len())
    };
    let ratio = if long_ma > 0.0 { short_ma / long_ma } else { 1.0 };

    OiMetrics {
        current,
        short_ma,
        long_ma,
        ratio,
    }
}

fn mean_tail(history: &[HistoryRow], n: usize) -> f64 {
    let tail = &history[history.len().saturating_sub(n)..];
    if tail.is_empty() {
        return 0.0;
    }
    tail.iter().map(|r| r.open_interest).sum::<f64>() / tail.len() as f64
}

/// Fractional OI change over the 15-minute and 1-hour lookbacks, 0.0 when
/// the history is too short for an offset.
pub fn dual_window_changes(history: &[HistoryRow]) -> (f64, f64) {
    let current = match history.last() {
        Some(row) => row.open_interest,
        None => return (0.0, 0.0),
    };

    let change_at = |offset: usize| -> f64 {
        if history.len() < offset {
            return 0.0;
        }
        let past = history[history.len() - offset].open_interest;
        if past > 0.0 {
            (current - past) / past
        } else {
            0.0
        }
    };

    (change_at(OFFSET_15M), change_at(OFFSET_1H))
}

pub fn classify_trigger(change_15m: f64, change_1h: f64, cfg: &AnalyzerConfig) -> OiTrigger {
    let fired_15m = change_15m >= cfg.oi_15m_normal;
    let fired_1h = change_1h >= cfg.oi_1h_normal;
    match (fired_15m, fired_1h) {
        (true, true) => OiTrigger::Both,
        (true, false) => OiTrigger::Window15m,
        (false, true) => OiTrigger::Window1h,
        (false, false) => OiTrigger::None,
    }
}

/// Four-way strength classification; None suppresses signal creation.
pub fn classify_strength(
    is_extreme_funding: bool,
    is_oi_surge: bool,
    funding_rate: f64,
    oi_ratio: f64,
    cfg: &AnalyzerConfig,
) -> Option<SignalStrength> {
    match (is_extreme_funding, is_oi_surge) {
        (true, true) => {
            if funding_rate.abs() > cfg.hard_strong_funding && oi_ratio > cfg.hard_strong_ratio {
                Some(SignalStrength::Strong)
            } else {
                Some(SignalStrength::Moderate)
            }
        }
        (true, false) | (false, true) => Some(SignalStrength::Weak),
        (false, false) => None,
    }
}

/// Escalation tripwire: any single condition is enough.
pub fn classify_severity(
    funding_rate: f64,
    oi_ratio: f64,
    change_15m: f64,
    change_1h: f64,
    cfg: &AnalyzerConfig,
) -> Severity {
    if funding_rate <= cfg.strong_funding
        || funding_rate >= cfg.strong_funding.abs()
        || change_15m >= cfg.oi_15m_strong
        || change_1h >= cfg.oi_1h_strong
        || oi_ratio > cfg.strong_oi_ratio
    {
        Severity::Strong
    } else {
        Severity::Normal
    }
}

/// One row of the trend decision table.
pub struct TrendRule {
    pub name: &'static str,
    pub matches: fn(price_chg: f64, oi_chg: f64, funding: f64) -> bool,
    pub trend: &'static str,
    pub advice: &'static str,
}

/// Ordered decision table over (price change, OI change, funding rate).
/// Evaluated first-match-wins; the priority order is part of the contract.
pub const TREND_RULES: &[TrendRule] = &[
    TrendRule {
        name: "accumulation",
        matches: |price, oi, funding| price <= 0.0 && oi > 0.0 && funding < -FUNDING_PIVOT,
        trend: "📉 吸筹蓄力 (空头堆积)",
        advice: "👀 密切关注 / 埋伏突破",
    },
    TrendRule {
        name: "squeeze_ignition",
        matches: |price, oi, funding| price > 0.0 && oi > 0.0 && funding < 0.0,
        trend: "🚀 轧空启动 (趋势点火)",
        advice: "🔫 市价做多 / 顺势进场",
    },
    TrendRule {
        name: "short_covering",
        matches: |price, oi, _| price > 0.0 && oi < 0.0,
        trend: "💥 空头踩踏 (高潮派发)",
        advice: "💰 分批止盈 / 切勿追高",
    },
    TrendRule {
        name: "long_liquidation",
        matches: |price, oi, _| price < 0.0 && oi < 0.0,
        trend: "🩸 多头爆仓",
        advice: "⛔ 空仓观望 / 远离",
    },
    TrendRule {
        name: "long_crowding",
        matches: |price, oi, funding| price > 0.0 && oi > 0.0 && funding > FUNDING_PIVOT,
        trend: "⚠️ 多头拥挤 (警惕回调)",
        advice: "🛡️ 谨慎追多 / 收紧止损",
    },
];

const TREND_NEUTRAL: (&str, &str) = ("⚖️ 震荡整理 (方向不明)", "⏳ 等待明确信号");

pub fn determine_trend(
    price_change_pct: f64,
    oi_change_pct: f64,
    funding_rate: f64,
) -> (&'static str, &'static str) {
    for rule in TREND_RULES {
        if (rule.matches)(price_change_pct, oi_change_pct, funding_rate) {
            return (rule.trend, rule.advice);
        }
    }
    TREND_NEUTRAL
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn cfg() -> AnalyzerConfig {
        AnalyzerConfig::default()
    }

    fn history(oi_values: &[f64], funding_rate: f64) -> Vec<HistoryRow> {
        oi_values
            .iter()
            .enumerate()
            .map(|(i, oi)| HistoryRow {
                ts: Utc
                    .timestamp_opt(1_700_000_000 + (i as i64) * 300, 0)
                    .single()
                    .unwrap(),
                price: 1.0 + i as f64 * 0.01,
                open_interest: *oi,
                funding_rate,
            })
            .collect()
    }

    fn analyzer() -> (MarketAnalyzer, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = TimeSeriesStore::new(dir.path()).unwrap();
        (MarketAnalyzer::new(cfg(), store), dir)
    }

    #[test]
    fn short_history_yields_none() {
        let (analyzer, _dir) = analyzer();
        let rows = history(&[100.0, 102.0], -0.002);
        assert!(analyzer.analyze("XUSDT", &rows, None).is_none());
        assert!(analyzer.analyze("XUSDT", &[], None).is_none());
    }

    #[test]
    fn strength_strong_needs_hard_cutoffs() {
        let c = cfg();
        assert_eq!(
            classify_strength(true, true, -0.0012, 3.2, &c),
            Some(SignalStrength::Moderate),
            "funding below the hard cutoff stays moderate"
        );
        assert_eq!(
            classify_strength(true, true, -0.0032, 3.2, &c),
            Some(SignalStrength::Strong)
        );
        assert_eq!(
            classify_strength(true, false, -0.0032, 3.2, &c),
            Some(SignalStrength::Weak)
        );
        assert_eq!(classify_strength(false, false, 0.0, 1.0, &c), None);
    }

    #[test]
    fn strength_strong_with_relaxed_cutoffs() {
        // Hard cutoffs are configuration; with them at 0.001/3.0 the same
        // double trigger upgrades to Strong.
        let c = AnalyzerConfig {
            hard_strong_funding: 0.001,
            ..cfg()
        };
        assert_eq!(
            classify_strength(true, true, -0.0012, 3.2, &c),
            Some(SignalStrength::Strong)
        );
    }

    #[test]
    fn severity_trips_on_funding_alone() {
        let c = cfg();
        assert_eq!(
            classify_severity(-0.0012, 1.0, 0.0, 0.0, &c),
            Severity::Strong
        );
        assert_eq!(
            classify_severity(0.0012, 1.0, 0.0, 0.0, &c),
            Severity::Strong,
            "positive extreme funding trips too"
        );
        assert_eq!(
            classify_severity(-0.0008, 1.0, 0.0, 0.0, &c),
            Severity::Normal
        );
    }

    #[test]
    fn severity_trips_on_windows_and_ratio() {
        let c = cfg();
        assert_eq!(classify_severity(0.0, 1.0, 0.13, 0.0, &c), Severity::Strong);
        assert_eq!(classify_severity(0.0, 1.0, 0.0, 0.31, &c), Severity::Strong);
        assert_eq!(classify_severity(0.0, 2.1, 0.0, 0.0, &c), Severity::Strong);
        assert_eq!(classify_severity(0.0, 1.9, 0.04, 0.1, &c), Severity::Normal);
    }

    #[test]
    fn trigger_tag_matches_windows() {
        let c = cfg();
        assert_eq!(classify_trigger(0.13, 0.10, &c), OiTrigger::Window15m);
        assert_eq!(classify_trigger(0.02, 0.16, &c), OiTrigger::Window1h);
        assert_eq!(classify_trigger(0.06, 0.20, &c), OiTrigger::Both);
        assert_eq!(classify_trigger(0.01, 0.01, &c), OiTrigger::None);
    }

    #[test]
    fn dual_window_uses_fixed_offsets() {
        // 14 samples, flat at 100 except the last at 113.
        let mut values = vec![100.0; 13];
        values.push(113.0);
        let rows = history(&values, 0.0);
        let (c15, c1h) = dual_window_changes(&rows);
        assert!((c15 - 0.13).abs() < 1e-9);
        assert!((c1h - 0.13).abs() < 1e-9);

        // Too short for the 1h offset: only the 15m leg moves.
        let rows = history(&[100.0, 100.0, 100.0, 113.0], 0.0);
        let (c15, c1h) = dual_window_changes(&rows);
        assert!((c15 - 0.13).abs() < 1e-9);
        assert_eq!(c1h, 0.0);
    }

    #[test]
    fn oi_ratio_guards_division() {
        let rows = history(&[0.0, 0.0, 0.0], 0.0);
        let metrics = oi_metrics(&rows, 3, 13);
        assert_eq!(metrics.ratio, 1.0);
    }

    #[test]
    fn trend_table_first_match_wins() {
        assert_eq!(determine_trend(-0.01, 0.05, -0.0007).0, "📉 吸筹蓄力 (空头堆积)");
        assert_eq!(determine_trend(0.02, 0.05, -0.0001).0, "🚀 轧空启动 (趋势点火)");
        assert_eq!(determine_trend(0.02, -0.05, 0.0001).0, "💥 空头踩踏 (高潮派发)");
        assert_eq!(determine_trend(-0.02, -0.05, 0.0).0, "🩸 多头爆仓");
        assert_eq!(determine_trend(0.02, 0.05, 0.0007).0, "⚠️ 多头拥挤 (警惕回调)");
        // Positive price, rising OI, mildly positive funding: no rule fires.
        assert_eq!(determine_trend(0.02, 0.05, 0.0002).0, "⚖️ 震荡整理 (方向不明)");
    }

    #[test]
    fn analyze_emits_strong_severity_on_deep_funding() {
        let (analyzer, _dir) = analyzer();
        // OI ramps into the last sample; funding at the strong threshold.
        let rows = history(&[100.0, 100.0, 102.0, 150.0], -0.0015);
        let signal = analyzer.analyze("OPUSDT", &rows, None).unwrap();
        assert!(signal.oi_ratio > 1.0);
        assert_eq!(signal.severity, Severity::Strong);
        assert!(signal.is_extreme_funding);
    }

    #[test]
    fn analyze_prefers_snapshot_override() {
        let (analyzer, _dir) = analyzer();
        let rows = history(&[100.0, 102.0, 150.0], -0.0015);
        let snapshot = MarketSnapshot {
            symbol: "OPUSDT".to_string(),
            ts: Utc.timestamp_opt(1_700_001_000, 0).single().unwrap(),
            open: 1.0,
            high: 1.1,
            low: 0.9,
            close: 2.5,
            volume: 10.0,
            quote_volume: 2e7,
            price_change_pct: -0.04,
            funding_rate: -0.0021,
            open_interest: 150.0,
        };
        let signal = analyzer.analyze("OPUSDT", &rows, Some(&snapshot)).unwrap();
        assert_eq!(signal.price, 2.5);
        assert_eq!(signal.funding_rate, -0.0021);
        assert_eq!(signal.price_change_pct, -0.04);
    }

    #[test]
    fn veto_drops_normal_keeps_rewritten_strong() {
        let (analyzer, _dir) = analyzer();
        let rows = history(&[100.0, 102.0, 150.0], -0.0015);
        let mut strong = analyzer.analyze("AUSDT", &rows, None).unwrap();
        strong.severity = Severity::Strong;
        let mut normal = strong.clone();
        normal.symbol = "BUSDT".to_string();
        normal.severity = Severity::Normal;

        let out = analyzer.apply_btc_veto(vec![normal, strong.clone()], -0.02);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].symbol, "AUSDT");
        assert!(out[0].btc_veto);
        assert_eq!(out[0].advice, VETO_ADVICE);
        assert_eq!(out[0].btc_change_pct, -0.02);
    }

    #[test]
    fn no_veto_only_stamps_reference_change() {
        let (analyzer, _dir) = analyzer();
        let rows = history(&[100.0, 102.0, 150.0], -0.0015);
        let signal = analyzer.analyze("AUSDT", &rows, None).unwrap();
        let advice = signal.advice.clone();

        let out = analyzer.apply_btc_veto(vec![signal], 0.004);
        assert_eq!(out.len(), 1);
        assert!(!out[0].btc_veto);
        assert_eq!(out[0].btc_change_pct, 0.004);
        assert_eq!(out[0].advice, advice);
    }

    #[test]
    fn analyze_all_sorts_and_filters_by_strength() {
        let dir = TempDir::new().unwrap();
        let store = TimeSeriesStore::new(dir.path()).unwrap();
        let analyzer = MarketAnalyzer::new(cfg(), store.clone());

        // AUSDT: flat OI, extreme funding only -> Weak.
        // BUSDT: OI surge + extreme funding -> Moderate, higher ratio.
        for (symbol, values, funding) in [
            ("AUSDT", vec![100.0; 14], -0.0012),
            ("BUSDT", vec![100.0, 100.0, 100.0, 100.0, 300.0, 320.0, 340.0], -0.0012),
        ] {
            for (i, oi) in values.iter().enumerate() {
                let snap = MarketSnapshot {
                    symbol: symbol.to_string(),
                    ts: Utc
                        .timestamp_opt(1_700_000_000 + (i as i64) * 300, 0)
                        .single()
                        .unwrap(),
                    open: 1.0,
                    high: 1.0,
                    low: 1.0,
                    close: 1.0,
                    volume: 1.0,
                    quote_volume: 2e7,
                    price_change_pct: 0.0,
                    funding_rate: funding,
                    open_interest: *oi,
                };
                store.append_snapshot(&snap).unwrap();
            }
        }

        let all = analyzer.analyze_all(&HashMap::new(), SignalStrength::Weak);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].symbol, "BUSDT");
        assert!(all[0].strength > all[1].strength);

        let moderate_up = analyzer.analyze_all(&HashMap::new(), SignalStrength::Moderate);
        assert_eq!(moderate_up.len(), 1);
        assert_eq!(moderate_up[0].symbol, "BUSDT");
    }

    #[test]
    fn summary_counts_funding_breadth() {
        let (analyzer, _dir) = analyzer();
        let mut latest = HashMap::new();
        for (symbol, fr) in [("A", 0.0008), ("B", 0.0001), ("C", -0.0007), ("D", -0.0001)] {
            latest.insert(
                symbol.to_string(),
                MarketSnapshot {
                    symbol: symbol.to_string(),
                    ts: Utc.timestamp_opt(1_700_000_000, 0).single().unwrap(),
                    open: 1.0,
                    high: 1.0,
                    low: 1.0,
                    close: 1.0,
                    volume: 1.0,
                    quote_volume: 2e7,
                    price_change_pct: 0.0,
                    funding_rate: fr,
                    open_interest: 1.0,
                },
            );
        }
        let summary = analyzer.market_summary(&latest);
        assert_eq!(summary.total_symbols, 4);
        assert_eq!(summary.positive_funding, 2);
        assert_eq!(summary.negative_funding, 2);
        assert_eq!(summary.extreme_positive, 1);
        assert_eq!(summary.extreme_negative, 1);
        assert_eq!(summary.sentiment, "⚪ NEUTRAL");
    }
}
