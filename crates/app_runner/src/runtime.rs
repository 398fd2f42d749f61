//! Cycle wiring and the run loop.
//!
//! One cycle: collect -> store -> analyze_all -> market veto -> signal
//! history sink -> governed dispatch. Only a ban crosses this function as
//! an error; it stops the loop, which still runs the shutdown notification.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use alert_governor::{AlertGovernor, AlertSink};
use anyhow::{Context, Result};
use async_trait::async_trait;
use collector_binance::BinanceCollector;
use core_types::{CollectError, SignalStrength, SqueezeSignal};
use market_analyzer::{MarketAnalyzer, ASSUMED_CADENCE_SECS};
use market_store::TimeSeriesStore;
use notifier_telegram::{ChartRenderer, NoChartRenderer, TelegramNotifier};

use crate::config_loader::MonitorConfig;

const KLINE_INTERVAL: &str = "15m";
const KLINE_LIMIT: u32 = 50;

pub struct Monitor {
    cfg: MonitorConfig,
    collector: BinanceCollector,
    store: TimeSeriesStore,
    analyzer: MarketAnalyzer,
    governor: AlertGovernor,
    notifier: Arc<TelegramNotifier>,
    renderer: Arc<dyn ChartRenderer>,
    run_count: u64,
}

impl Monitor {
    pub fn new(cfg: MonitorConfig) -> Result<Self> {
        let store = TimeSeriesStore::new(Path::new(&cfg.data_dir))?;
        let collector = BinanceCollector::new(cfg.collector_config())?;
        let analyzer = MarketAnalyzer::new(cfg.thresholds.clone(), store.clone());
        let governor = AlertGovernor::new(cfg.governor_config());
        let notifier = Arc::new(TelegramNotifier::new(cfg.telegram_config())?);

        if cfg.check_interval_secs != ASSUMED_CADENCE_SECS {
            tracing::warn!(
                interval_s = cfg.check_interval_secs,
                assumed_s = ASSUMED_CADENCE_SECS,
                "poll interval differs from the lookback cadence assumption; \
                 15m/1h OI windows will describe a different time span"
            );
        }

        Ok(Self {
            cfg,
            collector,
            store,
            analyzer,
            governor,
            notifier,
            renderer: Arc::new(NoChartRenderer),
            run_count: 0,
        })
    }

    /// One full monitoring cycle. Only a ban propagates as Err.
    pub async fn run_once(&mut self) -> Result<Vec<SqueezeSignal>, CollectError> {
        self.run_count += 1;
        tracing::info!(cycle = self.run_count, "monitoring cycle started");

        let snapshots = self.collector.collect_cycle(&self.store).await?;
        if snapshots.is_empty() {
            tracing::warn!("no market data this cycle");
            return Ok(Vec::new());
        }

        // Collector keeps the reference symbol in the universe; an absence
        // here means its own fetch failed this cycle.
        let btc_change = match snapshots.get(self.cfg.reference_symbol.as_str()) {
            Some(snap) => snap.price_change_pct,
            None => {
                tracing::warn!(
                    symbol = %self.cfg.reference_symbol,
                    "reference snapshot missing, veto input defaults to 0"
                );
                0.0
            }
        };

        let summary = self.analyzer.market_summary(&snapshots);
        tracing::info!(
            symbols = summary.total_symbols,
            positive_funding = summary.positive_funding,
            negative_funding = summary.negative_funding,
            extreme_positive = summary.extreme_positive,
            extreme_negative = summary.extreme_negative,
            sentiment = summary.sentiment,
            "market summary"
        );

        let signals = self.analyzer.analyze_all(&snapshots, SignalStrength::Weak);
        let signals = self.analyzer.apply_btc_veto(signals, btc_change);

        if let Err(err) = self.store.append_signal_history(&signals) {
            tracing::error!(error = %err, "signal history append failed");
        }
        log_signal_digest(&signals);

        let sink = RichAlertSink {
            collector: self.collector.clone(),
            notifier: self.notifier.clone(),
            renderer: self.renderer.clone(),
        };
        self.governor.dispatch_cycle(&signals, &sink).await;

        Ok(signals)
    }

    /// Interval-paced loop until ctrl-c or a ban. Cycle runtime is deducted
    /// from the sleep so the cadence stays close to the configured interval.
    pub async fn run_forever(&mut self) -> Result<()> {
        let interval = Duration::from_secs(self.cfg.check_interval_secs);
        if self.notifier.is_enabled() {
            if let Err(err) = self.notifier.send_startup_message().await {
                tracing::warn!(error = %err, "startup notification failed");
            }
        }

        let mut stop_reason = "⏰ 收到退出信号";
        loop {
            let started = Instant::now();
            match self.run_once().await {
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(error = %err, "fatal collector error, stopping run loop");
                    stop_reason = "🚫 IP 被交易所封禁，采集已中止";
                    break;
                }
            }

            let sleep_for = interval.saturating_sub(started.elapsed());
            tracing::info!(
                next_cycle_s = sleep_for.as_secs(),
                "cycle complete, waiting for next run"
            );
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown requested");
                    break;
                }
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }

        if self.notifier.is_enabled() {
            if let Err(err) = self.notifier.send_shutdown_message(stop_reason).await {
                tracing::warn!(error = %err, "shutdown notification failed");
            }
        }
        tracing::info!("monitor stopped");
        Ok(())
    }
}

fn log_signal_digest(signals: &[SqueezeSignal]) {
    if signals.is_empty() {
        tracing::info!("no squeeze signals this cycle");
        return;
    }
    let strong = signals
        .iter()
        .filter(|s| s.strength == SignalStrength::Strong)
        .count();
    let moderate = signals
        .iter()
        .filter(|s| s.strength == SignalStrength::Moderate)
        .count();
    let weak = signals.len() - strong - moderate;
    tracing::info!(total = signals.len(), strong, moderate, weak, "squeeze signals detected");

    for signal in signals.iter().take(10) {
        tracing::info!(
            symbol = %signal.symbol,
            strength = %signal.strength,
            severity = %signal.severity,
            funding_pct = signal.funding_rate * 100.0,
            oi_ratio = signal.oi_ratio,
            trigger = %signal.oi_trigger,
            "signal"
        );
    }
}

/// Rich dispatch: fetch klines, render the chart, send photo + caption.
/// Any error here makes the governor fall back to the text-only attempt.
struct RichAlertSink {
    collector: BinanceCollector,
    notifier: Arc<TelegramNotifier>,
    renderer: Arc<dyn ChartRenderer>,
}

#[async_trait]
impl AlertSink for RichAlertSink {
    async fn send_rich(&self, signal: &SqueezeSignal) -> Result<bool> {
        let klines = self
            .collector
            .fetch_klines(&signal.symbol, KLINE_INTERVAL, KLINE_LIMIT)
            .await
            .with_context(|| format!("fetch klines for {}", signal.symbol))?;
        let chart = self
            .renderer
            .render(&signal.symbol, &klines, signal.is_strong())
            .context("render chart")?;
        self.notifier.send_signal(signal, chart).await
    }

    async fn send_degraded(&self, signal: &SqueezeSignal) -> Result<bool> {
        self.notifier.send_signal(signal, None).await
    }
}
