//! Binance USD-M futures collector.
//!
//! One collection cycle runs four read-only endpoint sweeps (instrument
//! discovery, 24h tickers, funding rates, per-symbol open interest) and
//! joins them into admitted [`MarketSnapshot`]s. The per-symbol open
//! interest sweep is the only fanned-out section and is capped by one
//! semaphore across the whole cycle. A 418/403 response flips the
//! process-wide ban flag, aborts the fan-out and unwinds the cycle; every
//! other failure degrades to "no data this cycle" for the affected request.

pub mod models;
pub mod retry;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use core_types::{BanState, CollectError, KlineBar, MarketSnapshot};
use market_store::TimeSeriesStore;
use parking_lot::RwLock;
use reqwest::{Client, Proxy, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::models::{
    parse_kline_rows, ExchangeInfo, OpenInterestRaw, PremiumIndexRaw, Ticker24hRaw, TickerStats,
};
use crate::retry::{AttemptError, RetryDecision, RetryPolicy, RetryState};

const EXCHANGE_INFO: &str = "/fapi/v1/exchangeInfo";
const TICKER_24HR: &str = "/fapi/v1/ticker/24hr";
const PREMIUM_INDEX: &str = "/fapi/v1/premiumIndex";
const OPEN_INTEREST: &str = "/fapi/v1/openInterest";
const KLINES: &str = "/fapi/v1/klines";

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub base_url: String,
    pub proxy_url: Option<String>,
    pub http_timeout: Duration,
    /// Hard ceiling on simultaneous in-flight requests across the fan-out.
    pub concurrency_limit: usize,
    pub rate_limit_wait: Duration,
    pub max_retries: u32,
    pub quote_asset: String,
    /// Minimum 24h quote volume for a symbol to enter the cycle.
    pub min_volume_24h: f64,
    /// Always collected even below the volume floor; feeds the market veto.
    pub reference_symbol: String,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            base_url: "https://fapi.binance.com".to_string(),
            proxy_url: None,
            http_timeout: Duration::from_secs(15),
            concurrency_limit: 5,
            rate_limit_wait: Duration::from_secs(5),
            max_retries: 3,
            quote_asset: "USDT".to_string(),
            min_volume_24h: 15_000_000.0,
            reference_symbol: "BTCUSDT".to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct BanFlag {
    state: RwLock<BanState>,
    banned_status: AtomicU16,
}

impl BanFlag {
    fn mark_banned(&self, status: u16) {
        *self.state.write() = BanState::Banned;
        self.banned_status.store(status, Ordering::Relaxed);
    }

    fn set_if_not_banned(&self, next: BanState) {
        let mut state = self.state.write();
        if *state != BanState::Banned {
            *state = next;
        }
    }

    fn get(&self) -> BanState {
        *self.state.read()
    }

    fn banned_error(&self) -> CollectError {
        CollectError::Banned {
            status: self.banned_status.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone)]
pub struct BinanceCollector {
    http: Client,
    cfg: Arc<CollectorConfig>,
    gate: Arc<Semaphore>,
    ban: Arc<BanFlag>,
}

impl BinanceCollector {
    pub fn new(cfg: CollectorConfig) -> Result<Self> {
        let mut builder = Client::builder().timeout(cfg.http_timeout);
        if let Some(proxy) = cfg.proxy_url.as_deref() {
            builder = builder.proxy(Proxy::all(proxy).context("parse proxy url")?);
        }
        let http = builder.build().context("build http client")?;

        tracing::info!(
            base_url = %cfg.base_url,
            timeout_s = cfg.http_timeout.as_secs(),
            concurrency = cfg.concurrency_limit,
            proxy = cfg.proxy_url.as_deref().unwrap_or("direct"),
            "collector initialized"
        );

        Ok(Self {
            http,
            gate: Arc::new(Semaphore::new(cfg.concurrency_limit.max(1))),
            cfg: Arc::new(cfg),
            ban: Arc::new(BanFlag::default()),
        })
    }

    pub fn ban_state(&self) -> BanState {
        self.ban.get()
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.cfg
    }

    /// One GET with retry/backoff. Once the ban flag is set every call
    /// fails immediately without touching the network.
    async fn fetch_json<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, CollectError> {
        let policy = RetryPolicy {
            max_attempts: self.cfg.max_retries.max(1),
            rate_limit_wait: self.cfg.rate_limit_wait,
        };
        let mut state = RetryState::new();
        let url = format!("{}{}", self.cfg.base_url, path);

        loop {
            if self.ban.get() == BanState::Banned {
                return Err(self.ban.banned_error());
            }

            let attempt_error = {
                let _permit = self
                    .gate
                    .acquire()
                    .await
                    .map_err(|_| CollectError::Network("request gate closed".to_string()))?;
                metrics::counter!("collector.requests").increment(1);

                match self.http.get(&url).query(params).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            self.ban.set_if_not_banned(BanState::Active);
                            return resp
                                .json::<T>()
                                .await
                                .map_err(|err| CollectError::Decode(err.to_string()));
                        }
                        classify_status(status, retry_after(&resp))
                    }
                    Err(err) => AttemptError::Network {
                        detail: err.to_string(),
                    },
                }
            };

            if let AttemptError::Banned { status } = &attempt_error {
                metrics::counter!("collector.banned").increment(1);
                self.ban.mark_banned(*status);
                tracing::error!(status = *status, url = %url, "ip banned by exchange, halting all requests");
            }

            match state.on_error(attempt_error, &policy) {
                RetryDecision::RetryAfter(delay) => {
                    self.ban.set_if_not_banned(BanState::RateLimited);
                    metrics::counter!("collector.retries").increment(1);
                    tracing::warn!(
                        url = %url,
                        attempt = state.attempts(),
                        wait_s = delay.as_secs(),
                        "request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::Abort(err) => {
                    if !err.is_fatal() {
                        tracing::warn!(url = %url, error = %err, "request given up");
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Universe discovery: tradable perpetuals on the configured quote asset.
    pub async fn discover_perp_symbols(&self) -> Result<Vec<String>, CollectError> {
        let info: ExchangeInfo = self.fetch_json(EXCHANGE_INFO, &[]).await?;
        let symbols: Vec<String> = info
            .symbols
            .into_iter()
            .filter(|s| s.is_tradable_perp(&self.cfg.quote_asset))
            .map(|s| s.symbol)
            .collect();
        tracing::info!(count = symbols.len(), "perpetual universe discovered");
        Ok(symbols)
    }

    /// 24h stats for every instrument in one request.
    pub async fn fetch_24h_tickers(&self) -> Result<HashMap<String, TickerStats>, CollectError> {
        let raw: Vec<Ticker24hRaw> = self.fetch_json(TICKER_24HR, &[]).await?;
        let mut out = HashMap::with_capacity(raw.len());
        for ticker in &raw {
            if let Some(stats) = ticker.parse() {
                out.insert(ticker.symbol.clone(), stats);
            }
        }
        tracing::info!(count = out.len(), "24h tickers fetched");
        Ok(out)
    }

    /// Current funding rate for every instrument in one request.
    pub async fn fetch_funding_rates(&self) -> Result<HashMap<String, f64>, CollectError> {
        let raw: Vec<PremiumIndexRaw> = self.fetch_json(PREMIUM_INDEX, &[]).await?;
        let mut out = HashMap::with_capacity(raw.len());
        for item in raw {
            if let Some(rate) = item.last_funding_rate.as_deref().and_then(|r| r.parse().ok()) {
                out.insert(item.symbol, rate);
            }
        }
        tracing::info!(count = out.len(), "funding rates fetched");
        Ok(out)
    }

    pub async fn fetch_open_interest(&self, symbol: &str) -> Result<f64, CollectError> {
        let raw: OpenInterestRaw = self
            .fetch_json(OPEN_INTEREST, &[("symbol", symbol.to_string())])
            .await?;
        raw.open_interest
            .parse::<f64>()
            .map_err(|err| CollectError::Decode(format!("open interest for {symbol}: {err}")))
    }

    /// Fan the per-symbol open interest fetch out under the concurrency
    /// gate. A ban from any task aborts the remaining in-flight tasks and
    /// unwinds; individual failures only drop that symbol.
    pub async fn fetch_open_interests(
        &self,
        symbols: &[String],
    ) -> Result<HashMap<String, f64>, CollectError> {
        let mut join_set = JoinSet::new();
        for symbol in symbols {
            let collector = self.clone();
            let symbol = symbol.clone();
            join_set.spawn(async move {
                let result = collector.fetch_open_interest(&symbol).await;
                (symbol, result)
            });
        }

        let mut out = HashMap::new();
        let mut failed = 0usize;
        while let Some(joined) = join_set.join_next().await {
            let Ok((symbol, result)) = joined else {
                failed += 1;
                continue;
            };
            match result {
                Ok(open_interest) => {
                    out.insert(symbol, open_interest);
                }
                Err(err) if err.is_fatal() => {
                    join_set.abort_all();
                    return Err(err);
                }
                Err(err) => {
                    failed += 1;
                    tracing::debug!(symbol = %symbol, error = %err, "open interest fetch failed");
                }
            }
        }

        if failed > 0 {
            metrics::counter!("collector.oi_fetch_failed").increment(failed as u64);
        }
        tracing::info!(ok = out.len(), failed, "open interest sweep complete");
        Ok(out)
    }

    /// Klines for one symbol, used as chart input on dispatch.
    pub async fn fetch_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<KlineBar>, CollectError> {
        let rows: Vec<Vec<serde_json::Value>> = self
            .fetch_json(
                KLINES,
                &[
                    ("symbol", symbol.to_string()),
                    ("interval", interval.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        Ok(parse_kline_rows(&rows))
    }

    /// One full discovery-and-snapshot cycle. Fails only on ban; any
    /// recoverable failure yields a partial or empty mapping.
    pub async fn collect_cycle(
        &self,
        store: &TimeSeriesStore,
    ) -> Result<HashMap<String, MarketSnapshot>, CollectError> {
        let started = Instant::now();

        let symbols = match self.discover_perp_symbols().await {
            Ok(symbols) => symbols,
            Err(err) => return recover_empty("discovery", err),
        };
        if symbols.is_empty() {
            tracing::warn!("discovery returned no symbols");
            return Ok(HashMap::new());
        }

        let tickers = match self.fetch_24h_tickers().await {
            Ok(tickers) => tickers,
            Err(err) => return recover_empty("tickers", err),
        };
        if tickers.is_empty() {
            tracing::warn!("no ticker data this cycle");
            return Ok(HashMap::new());
        }

        let filtered = filter_by_volume(
            &symbols,
            &tickers,
            self.cfg.min_volume_24h,
            &self.cfg.reference_symbol,
        );
        tracing::info!(
            universe = symbols.len(),
            eligible = filtered.len(),
            min_volume = self.cfg.min_volume_24h,
            "volume filter applied"
        );
        if filtered.is_empty() {
            return Ok(HashMap::new());
        }

        let funding = match self.fetch_funding_rates().await {
            Ok(funding) => funding,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                tracing::warn!(error = %err, "funding sweep failed, rates default to 0");
                HashMap::new()
            }
        };

        let open_interest = self.fetch_open_interests(&filtered).await?;

        let ts = Utc::now();
        let snapshots = join_cycle_data(&filtered, &tickers, &funding, &open_interest, ts);

        let mut persisted = 0usize;
        for snapshot in &snapshots {
            match store.append_snapshot(snapshot) {
                Ok(()) => persisted += 1,
                Err(err) => {
                    tracing::error!(symbol = %snapshot.symbol, error = %err, "persist failed")
                }
            }
        }

        let elapsed = started.elapsed();
        metrics::histogram!("collector.cycle_ms").record(elapsed.as_millis() as f64);
        tracing::info!(
            admitted = snapshots.len(),
            persisted,
            elapsed_ms = elapsed.as_millis() as u64,
            "collection cycle complete"
        );

        Ok(snapshots
            .into_iter()
            .map(|snap| (snap.symbol.clone(), snap))
            .collect())
    }
}

fn recover_empty(
    step: &str,
    err: CollectError,
) -> Result<HashMap<String, MarketSnapshot>, CollectError> {
    if err.is_fatal() {
        return Err(err);
    }
    tracing::warn!(step, error = %err, "cycle step failed, returning empty mapping");
    Ok(HashMap::new())
}

fn classify_status(status: StatusCode, wait_hint: Option<Duration>) -> AttemptError {
    match status.as_u16() {
        429 => {
            metrics::counter!("collector.rate_limited").increment(1);
            AttemptError::RateLimited { wait_hint }
        }
        403 | 418 => AttemptError::Banned {
            status: status.as_u16(),
        },
        code if (400..500).contains(&code) => AttemptError::Rejected { status: code },
        _ => AttemptError::Network {
            detail: format!("http {status}"),
        },
    }
}

fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Volume floor, with the reference symbol re-included unconditionally so
/// the market veto always has its input.
pub fn filter_by_volume(
    symbols: &[String],
    tickers: &HashMap<String, TickerStats>,
    min_quote_volume: f64,
    reference_symbol: &str,
) -> Vec<String> {
    let mut filtered: Vec<String> = symbols
        .iter()
        .filter(|symbol| {
            tickers
                .get(symbol.as_str())
                .is_some_and(|t| t.quote_volume >= min_quote_volume)
        })
        .cloned()
        .collect();

    if !filtered.iter().any(|s| s == reference_symbol)
        && symbols.iter().any(|s| s == reference_symbol)
    {
        filtered.push(reference_symbol.to_string());
    }
    filtered
}

/// 24h change fraction of the reference instrument, 0.0 when unavailable.
pub fn reference_change_pct(tickers: &HashMap<String, TickerStats>, symbol: &str) -> f64 {
    match tickers.get(symbol) {
        Some(stats) => stats.price_change_pct,
        None => {
            tracing::warn!(symbol, "reference ticker missing, veto input defaults to 0");
            0.0
        }
    }
}

/// Join the bulk sweeps by symbol. Symbols missing open interest or
/// violating the positive price/OI invariant are discarded here and never
/// reach the store.
pub fn join_cycle_data(
    symbols: &[String],
    tickers: &HashMap<String, TickerStats>,
    funding: &HashMap<String, f64>,
    open_interest: &HashMap<String, f64>,
    ts: DateTime<Utc>,
) -> Vec<MarketSnapshot> {
    symbols
        .iter()
        .filter_map(|symbol| {
            let stats = tickers.get(symbol)?;
            let oi = *open_interest.get(symbol)?;
            let snapshot = MarketSnapshot {
                symbol: symbol.clone(),
                ts,
                open: stats.open,
                high: stats.high,
                low: stats.low,
                close: stats.close,
                volume: stats.volume,
                quote_volume: stats.quote_volume,
                price_change_pct: stats.price_change_pct,
                funding_rate: funding.get(symbol).copied().unwrap_or(0.0),
                open_interest: oi,
            };
            snapshot.is_admissible().then_some(snapshot)
        })
        .collect()
}
