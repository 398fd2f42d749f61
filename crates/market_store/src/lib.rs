//! Durable per-symbol time series, one CSV log per instrument.
//!
//! The store is append-only from the collector's side and read-only from
//! the analyzer's side. Two on-disk layouts are accepted on read: the
//! current OHLCV layout and a legacy 4-column layout whose `price` column
//! is promoted to the trade price. Malformed or non-positive rows are
//! dropped at read time, never surfaced as errors.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use core_types::{HistoryRow, MarketSnapshot, SqueezeSignal};

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const SNAPSHOT_HEADER: &str = "timestamp,open,high,low,close,volume,funding_rate,open_interest";
const SIGNAL_HISTORY_FILE: &str = "signal_history.csv";
const SIGNAL_HISTORY_HEADER: &str = "timestamp,symbol,price,btc_change_pct,severity,funding_rate,oi_ratio,oi_change_pct,trend,advice,btc_veto";

#[derive(Debug, Clone)]
pub struct TimeSeriesStore {
    data_dir: PathBuf,
}

impl TimeSeriesStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("create data dir {}", data_dir.display()))?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn symbol_path(&self, symbol: &str) -> PathBuf {
        self.data_dir.join(format!("{symbol}.csv"))
    }

    /// Append one admitted snapshot to the symbol's log. The header is
    /// written only when the file does not exist yet.
    pub fn append_snapshot(&self, snapshot: &MarketSnapshot) -> Result<()> {
        let path = self.symbol_path(&snapshot.symbol);
        let write_header = !path.exists();

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;

        if write_header {
            writeln!(file, "{SNAPSHOT_HEADER}")?;
        }
        writeln!(
            file,
            "{},{},{},{},{},{},{},{}",
            snapshot.ts.format(TS_FORMAT),
            snapshot.open,
            snapshot.high,
            snapshot.low,
            snapshot.close,
            snapshot.volume,
            snapshot.funding_rate,
            snapshot.open_interest,
        )?;
        Ok(())
    }

    /// Load and sanitize one symbol's history, oldest first.
    ///
    /// A missing file is an empty history, not an error. Rows with an
    /// unparseable timestamp, NaN fields or non-positive price/OI are
    /// skipped; duplicated timestamps keep the last row written.
    pub fn load_history(&self, symbol: &str) -> Result<Vec<HistoryRow>> {
        let path = self.symbol_path(symbol);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        Ok(parse_history(&raw, symbol))
    }

    /// Symbols that have a stored history file.
    pub fn symbols(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.data_dir)
            .with_context(|| format!("read data dir {}", self.data_dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(stem) = name.strip_suffix(".csv") {
                if name != SIGNAL_HISTORY_FILE {
                    out.push(stem.to_string());
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Append flattened signals to the offline history log consumed by the
    /// dashboard.
    pub fn append_signal_history(&self, signals: &[SqueezeSignal]) -> Result<()> {
        if signals.is_empty() {
            return Ok(());
        }
        let path = self.data_dir.join(SIGNAL_HISTORY_FILE);
        let write_header = !path.exists();

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;

        if write_header {
            writeln!(file, "{SIGNAL_HISTORY_HEADER}")?;
        }
        for signal in signals {
            writeln!(
                file,
                "{},{},{:.6},{:.2}%,{},{:.4}%,{:.2}x,{:.2}%,{},{},{}",
                signal.ts.format(TS_FORMAT),
                signal.symbol,
                signal.price,
                signal.btc_change_pct * 100.0,
                signal.severity,
                signal.funding_rate * 100.0,
                signal.oi_ratio,
                signal.oi_change_pct * 100.0,
                csv_safe(&signal.trend),
                csv_safe(&signal.advice),
                if signal.btc_veto { "Yes" } else { "No" },
            )?;
        }
        Ok(())
    }
}

/// Keep free-text fields single-column; the narrative strings carry no
/// structural meaning for downstream readers.
fn csv_safe(text: &str) -> String {
    text.replace([',', '\n'], " ")
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Layout {
    /// timestamp,open,high,low,close,volume,funding_rate,open_interest
    Ohlcv,
    /// timestamp,price,open_interest,funding_rate
    Legacy,
}

fn parse_history(raw: &str, symbol: &str) -> Vec<HistoryRow> {
    let mut lines = raw.lines();
    let Some(header) = lines.next() else {
        return Vec::new();
    };
    let columns: Vec<&str> = header.split(',').map(str::trim).collect();
    let layout = if columns.contains(&"close") {
        Layout::Ohlcv
    } else if columns.contains(&"price") {
        Layout::Legacy
    } else {
        tracing::warn!(symbol, header, "unknown history layout, ignoring file");
        return Vec::new();
    };

    let mut dropped = 0usize;
    // Last write wins on duplicate timestamps.
    let mut by_ts: HashMap<i64, HistoryRow> = HashMap::new();
    for line in lines {
        match parse_row(line, layout) {
            Some(row) => {
                by_ts.insert(row.ts.timestamp(), row);
            }
            None => {
                if !line.trim().is_empty() {
                    dropped += 1;
                }
            }
        }
    }
    if dropped > 0 {
        tracing::debug!(symbol, dropped, "dropped malformed or invalid history rows");
    }

    let mut rows: Vec<HistoryRow> = by_ts.into_values().collect();
    rows.sort_by_key(|r| r.ts);
    rows
}

fn parse_row(line: &str, layout: Layout) -> Option<HistoryRow> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    let (ts, price, open_interest, funding_rate) = match layout {
        Layout::Ohlcv => {
            if fields.len() != 8 {
                return None;
            }
            (fields[0], fields[4], fields[7], fields[6])
        }
        Layout::Legacy => {
            if fields.len() != 4 {
                return None;
            }
            (fields[0], fields[1], fields[2], fields[3])
        }
    };

    let ts = parse_ts(ts)?;
    let price = parse_finite(price)?;
    let open_interest = parse_finite(open_interest)?;
    let funding_rate = parse_finite(funding_rate)?;
    if price <= 0.0 || open_interest <= 0.0 {
        return None;
    }
    Some(HistoryRow {
        ts,
        price,
        open_interest,
        funding_rate,
    })
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, TS_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

fn parse_finite(raw: &str) -> Option<f64> {
    let v = raw.parse::<f64>().ok()?;
    v.is_finite().then_some(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use core_types::{OiTrigger, Severity, SignalStrength};
    use tempfile::TempDir;

    fn snapshot(symbol: &str, secs: i64, close: f64, oi: f64) -> MarketSnapshot {
        MarketSnapshot {
            symbol: symbol.to_string(),
            ts: Utc.timestamp_opt(secs, 0).single().unwrap(),
            open: close * 0.99,
            high: close * 1.01,
            low: close * 0.98,
            close,
            volume: 1_000.0,
            quote_volume: 20_000_000.0,
            price_change_pct: 0.01,
            funding_rate: -0.0004,
            open_interest: oi,
        }
    }

    #[test]
    fn append_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = TimeSeriesStore::new(dir.path()).unwrap();

        store.append_snapshot(&snapshot("OPUSDT", 1_700_000_000, 1.5, 100.0)).unwrap();
        store.append_snapshot(&snapshot("OPUSDT", 1_700_000_300, 1.6, 110.0)).unwrap();

        let rows = store.load_history("OPUSDT").unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].ts < rows[1].ts);
        assert_eq!(rows[1].price, 1.6);
        assert_eq!(rows[1].open_interest, 110.0);

        // Header written exactly once.
        let raw = fs::read_to_string(dir.path().join("OPUSDT.csv")).unwrap();
        assert_eq!(raw.matches("timestamp,").count(), 1);
    }

    #[test]
    fn duplicate_timestamp_overwrites_instead_of_duplicating() {
        let dir = TempDir::new().unwrap();
        let store = TimeSeriesStore::new(dir.path()).unwrap();

        store.append_snapshot(&snapshot("OPUSDT", 1_700_000_000, 1.5, 100.0)).unwrap();
        store.append_snapshot(&snapshot("OPUSDT", 1_700_000_000, 1.7, 140.0)).unwrap();

        let rows = store.load_history("OPUSDT").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].price, 1.7);
        assert_eq!(rows[0].open_interest, 140.0);
    }

    #[test]
    fn legacy_layout_promotes_price_column() {
        let dir = TempDir::new().unwrap();
        let store = TimeSeriesStore::new(dir.path()).unwrap();
        fs::write(
            dir.path().join("DOGEUSDT.csv"),
            "timestamp,price,open_interest,funding_rate\n\
             2024-01-01 00:00:00,0.08,5000000,-0.0002\n\
             2024-01-01 00:05:00,0.081,5100000,-0.0003\n",
        )
        .unwrap();

        let rows = store.load_history("DOGEUSDT").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].price, 0.08);
        assert_eq!(rows[1].funding_rate, -0.0003);
    }

    #[test]
    fn invalid_rows_are_dropped_not_errors() {
        let dir = TempDir::new().unwrap();
        let store = TimeSeriesStore::new(dir.path()).unwrap();
        fs::write(
            dir.path().join("XUSDT.csv"),
            "timestamp,open,high,low,close,volume,funding_rate,open_interest\n\
             2024-01-01 00:00:00,1,1,1,1.0,10,-0.0001,100\n\
             garbage line\n\
             2024-01-01 00:05:00,1,1,1,0.0,10,-0.0001,100\n\
             2024-01-01 00:10:00,1,1,1,1.1,10,-0.0001,-5\n\
             2024-01-01 00:15:00,1,1,1,NaN,10,-0.0001,100\n\
             2024-01-01 00:20:00,1,1,1,1.2,10,-0.0002,120\n",
        )
        .unwrap();

        let rows = store.load_history("XUSDT").unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.price > 0.0 && r.open_interest > 0.0));
    }

    #[test]
    fn missing_file_is_empty_history() {
        let dir = TempDir::new().unwrap();
        let store = TimeSeriesStore::new(dir.path()).unwrap();
        assert!(store.load_history("NOPEUSDT").unwrap().is_empty());
    }

    #[test]
    fn symbols_lists_only_series_files() {
        let dir = TempDir::new().unwrap();
        let store = TimeSeriesStore::new(dir.path()).unwrap();
        store.append_snapshot(&snapshot("BTCUSDT", 1_700_000_000, 40_000.0, 80_000.0)).unwrap();
        store.append_snapshot(&snapshot("ETHUSDT", 1_700_000_000, 2_000.0, 900_000.0)).unwrap();
        store
            .append_signal_history(&[sample_signal("ETHUSDT")])
            .unwrap();

        assert_eq!(store.symbols().unwrap(), vec!["BTCUSDT", "ETHUSDT"]);
    }

    fn sample_signal(symbol: &str) -> SqueezeSignal {
        SqueezeSignal {
            symbol: symbol.to_string(),
            ts: Utc.timestamp_opt(1_700_000_600, 0).single().unwrap(),
            price: 2_000.0,
            funding_rate: -0.0012,
            current_oi: 1_000_000.0,
            oi_short_ma: 950_000.0,
            oi_long_ma: 800_000.0,
            oi_ratio: 1.19,
            is_extreme_funding: true,
            is_oi_surge: false,
            strength: SignalStrength::Weak,
            severity: Severity::Strong,
            price_change_pct: 0.02,
            oi_change_pct: 0.19,
            oi_change_15m: 0.04,
            oi_change_1h: 0.1,
            oi_trigger: OiTrigger::None,
            trend: "🚀 轧空启动 (趋势点火)".to_string(),
            advice: "🔫 市价做多 / 顺势进场".to_string(),
            btc_change_pct: 0.005,
            btc_veto: false,
        }
    }

    #[test]
    fn signal_history_appends_flattened_rows() {
        let dir = TempDir::new().unwrap();
        let store = TimeSeriesStore::new(dir.path()).unwrap();
        store.append_signal_history(&[sample_signal("ETHUSDT")]).unwrap();
        store.append_signal_history(&[sample_signal("ETHUSDT")]).unwrap();

        let raw = fs::read_to_string(dir.path().join("signal_history.csv")).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("timestamp,symbol"));
        assert!(lines[1].contains("ETHUSDT"));
        assert!(lines[1].contains("STRONG"));
        assert!(lines[1].contains("-0.1200%"));
    }
}
