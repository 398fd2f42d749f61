//! Telegram notification channel.
//!
//! Sends signal alerts through the Bot API, as a chart photo with caption
//! when a renderer produced an image and as HTML text otherwise. An
//! unconfigured notifier (missing token or chat id) is a no-op that reports
//! "not delivered" instead of raising.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use core_types::{KlineBar, Severity, SqueezeSignal};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Proxy};
use serde::Deserialize;

const API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Clone, Default)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
    pub proxy_url: Option<String>,
    pub http_timeout: Duration,
}

impl TelegramConfig {
    pub fn is_configured(&self) -> bool {
        self.bot_token.as_deref().is_some_and(|t| !t.is_empty())
            && self.chat_id.as_deref().is_some_and(|c| !c.is_empty())
    }
}

/// External chart producer. Invoked with numeric kline input; `Ok(None)`
/// means no image, and dispatch degrades to text.
pub trait ChartRenderer: Send + Sync {
    fn render(&self, symbol: &str, klines: &[KlineBar], is_strong: bool) -> Result<Option<Vec<u8>>>;
}

/// Default renderer: produces no image.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoChartRenderer;

impl ChartRenderer for NoChartRenderer {
    fn render(&self, _: &str, _: &[KlineBar], _: bool) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

pub struct TelegramNotifier {
    http: Client,
    cfg: TelegramConfig,
}

impl TelegramNotifier {
    pub fn new(cfg: TelegramConfig) -> Result<Self> {
        let timeout = if cfg.http_timeout.is_zero() {
            Duration::from_secs(15)
        } else {
            cfg.http_timeout
        };
        let mut builder = Client::builder().timeout(timeout);
        if let Some(proxy) = cfg.proxy_url.as_deref() {
            builder = builder.proxy(Proxy::all(proxy).context("parse proxy url")?);
        }
        let http = builder.build().context("build http client")?;

        if cfg.is_configured() {
            tracing::info!(chat_id = cfg.chat_id.as_deref().unwrap_or(""), "telegram notifier ready");
        } else {
            tracing::warn!("telegram not configured, alerts will be logged only");
        }

        Ok(Self { http, cfg })
    }

    pub fn is_enabled(&self) -> bool {
        self.cfg.is_configured()
    }

    fn api_url(&self, method: &str) -> Option<String> {
        let token = self.cfg.bot_token.as_deref()?;
        Some(format!("{API_BASE}/bot{token}/{method}"))
    }

    /// Send an HTML text message. `Ok(false)` when not configured.
    pub async fn send_message(
        &self,
        text: &str,
        reply_markup: Option<serde_json::Value>,
    ) -> Result<bool> {
        if !self.is_enabled() {
            return Ok(false);
        }
        let url = self.api_url("sendMessage").context("bot token missing")?;
        let mut payload = serde_json::json!({
            "chat_id": self.cfg.chat_id,
            "text": text,
            "parse_mode": "HTML",
        });
        if let Some(markup) = reply_markup {
            payload["reply_markup"] = markup;
        }

        let resp = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .context("telegram sendMessage")?;
        decode_api_response(resp).await
    }

    /// Send a chart photo with caption. `Ok(false)` when not configured.
    pub async fn send_photo(
        &self,
        png: Vec<u8>,
        caption: &str,
        reply_markup: Option<serde_json::Value>,
    ) -> Result<bool> {
        if !self.is_enabled() {
            return Ok(false);
        }
        let url = self.api_url("sendPhoto").context("bot token missing")?;
        let mut form = Form::new()
            .text("chat_id", self.cfg.chat_id.clone().unwrap_or_default())
            .text("caption", caption.to_string())
            .text("parse_mode", "HTML".to_string())
            .part(
                "photo",
                Part::bytes(png).file_name("chart.png").mime_str("image/png")?,
            );
        if let Some(markup) = reply_markup {
            form = form.text("reply_markup", markup.to_string());
        }

        let resp = self
            .http
            .post(&url)
            .multipart(form)
            .send()
            .await
            .context("telegram sendPhoto")?;
        decode_api_response(resp).await
    }

    /// Photo path when a chart is supplied, plain message otherwise.
    pub async fn send_signal(
        &self,
        signal: &SqueezeSignal,
        chart: Option<Vec<u8>>,
    ) -> Result<bool> {
        let message = format_signal_message(signal);
        let keyboard = inline_keyboard(&signal.symbol);
        match chart {
            Some(png) => self.send_photo(png, &message, Some(keyboard)).await,
            None => self.send_message(&message, Some(keyboard)).await,
        }
    }

    pub async fn send_startup_message(&self) -> Result<bool> {
        let message = "🚀 <b>SqueezeEdge 已启动</b>\n\n📊 监控中...\n🔔 检测到信号时将自动发送告警";
        self.send_message(message, None).await
    }

    pub async fn send_shutdown_message(&self, reason: &str) -> Result<bool> {
        let message = format!("📴 <b>SqueezeEdge 已停止</b>\n\n{reason}");
        self.send_message(&message, None).await
    }
}

async fn decode_api_response(resp: reqwest::Response) -> Result<bool> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("telegram api http {status}: {}", truncate(&body, 200));
    }
    let api: ApiResponse = resp.json().await.context("decode telegram response")?;
    if !api.ok {
        bail!(
            "telegram api rejected request: {}",
            api.description.unwrap_or_default()
        );
    }
    Ok(true)
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Action links shown under every alert.
pub fn inline_keyboard(symbol: &str) -> serde_json::Value {
    serde_json::json!({
        "inline_keyboard": [[
            {
                "text": "🔥 Trade on Binance",
                "url": format!("https://www.binance.com/zh-CN/futures/{symbol}")
            },
            {
                "text": "📈 View on TradingView",
                "url": format!("https://www.tradingview.com/chart/?symbol=BINANCE:{symbol}.P")
            }
        ]]
    })
}

/// Alert body, traffic-light style: 🔴 Strong severity demands attention,
/// 🟠 Normal goes on the watchlist.
pub fn format_signal_message(signal: &SqueezeSignal) -> String {
    let funding_pct = signal.funding_rate * 100.0;
    let price = format_price(signal.price);
    let (oi_emoji, oi_status) = oi_status(signal.oi_ratio);
    let fr_suffix = funding_suffix(signal.funding_rate);

    let btc_warning = if signal.btc_veto {
        format!(
            "⛈️⛈️ <b>大盘预警</b> ⛈️⛈️\n🔻 BTC 急跌: <b>{:.2}%</b>\n⚠️ <i>陷阱风险极高，谨慎交易!</i>\n\n",
            signal.btc_change_pct * 100.0
        )
    } else {
        String::new()
    };

    let mut message = if signal.severity == Severity::Strong {
        let header = if signal.btc_veto {
            "⛔ <b>信号被大盘压制 (VETOED)</b> ⛔"
        } else {
            "🚨 <b>强力轧空警报 (STRONG)</b> 🚨"
        };
        format!(
            "{btc_warning}{header}\n\n\
             🎯 <b>标的:</b> #{symbol}\n\
             💵 <b>价格:</b> ${price}\n\n\
             ━━━━━━━━━━━━━━━━━━━━━━━━━━\n\
             🔥 <b>核心数据</b>\n\
             ━━━━━━━━━━━━━━━━━━━━━━━━━━\n\
             💰 <b>费率:</b> {funding_pct:+.4}%{fr_suffix}\n\
             {oi_emoji} <b>持仓:</b> {ratio:.2}x ({oi_status})\n\n\
             📊 <b>持仓详情:</b>\n   当前: <b>{oi}</b>\n   短期均线: {short}\n   长期均线: {long}\n",
            symbol = signal.symbol,
            ratio = signal.oi_ratio,
            oi = format_number(signal.current_oi),
            short = format_number(signal.oi_short_ma),
            long = format_number(signal.oi_long_ma),
        )
    } else {
        format!(
            "{btc_warning}🟠 <b>潜在机会 (Normal)</b>\n\n\
             👀 <b>关注:</b> #{symbol}\n\
             💵 <b>价格:</b> ${price}\n\n\
             ━━━━━━━━━━━━━━━━━━━━━━\n\
             💰 <b>费率:</b> {funding_pct:+.4}%{fr_suffix}\n\
             {oi_emoji} <b>持仓:</b> {ratio:.2}x ({oi_status})\n\n\
             <b>持仓详情:</b>\n   当前: {oi}\n   短期均线: {short}\n   长期均线: {long}\n",
            symbol = signal.symbol,
            ratio = signal.oi_ratio,
            oi = format_number(signal.current_oi),
            short = format_number(signal.oi_short_ma),
            long = format_number(signal.oi_long_ma),
        )
    };

    message.push_str(&dual_window_section(signal));

    if !signal.trend.is_empty() && !signal.advice.is_empty() {
        message.push_str(&format!(
            "\n━━━━━━━━━━━━━━━━━━━━━━━━━━\n\
             🧭 <b>趋势判断</b>\n\
             ━━━━━━━━━━━━━━━━━━━━━━━━━━\n\
             📊 价格: <b>{:+.2}%</b> | 持仓: <b>{:+.2}%</b>\n\n\
             {}\n\n💡 <b>战术建议:</b> {}\n",
            signal.price_change_pct * 100.0,
            signal.oi_change_pct * 100.0,
            signal.trend,
            signal.advice,
        ));
    }

    message.push_str(&format!(
        "\n━━━━━━━━━━━━━━━━━━━━━━━━━━\n<i>⏰ {} UTC</i>",
        signal.ts.format("%Y-%m-%d %H:%M:%S")
    ));
    message
}

fn funding_suffix(funding_rate: f64) -> &'static str {
    if funding_rate.abs() >= 0.001 {
        " (极端)"
    } else if funding_rate.abs() >= 0.0005 {
        " (偏高)"
    } else {
        ""
    }
}

fn dual_window_section(signal: &SqueezeSignal) -> String {
    let pct_15m = signal.oi_change_15m * 100.0;
    let pct_1h = signal.oi_change_1h * 100.0;

    let (icon_15m, tag_15m) = window_badge(pct_15m, 12.0, 5.0, -5.0);
    let (icon_1h, tag_1h) = window_badge(pct_1h, 30.0, 15.0, -10.0);

    format!(
        "\n⏱️ <b>持仓异动:</b>\n   {icon_15m} 15m 增速: <b>{pct_15m:+.1}%</b>{tag_15m}\n   {icon_1h} 1h 累计: <b>{pct_1h:+.1}%</b>{tag_1h}\n"
    )
}

fn window_badge(pct: f64, strong: f64, normal: f64, drop: f64) -> (&'static str, &'static str) {
    if pct >= strong {
        ("🔥", " ⬅ <b>触发!</b>")
    } else if pct >= normal {
        ("⚡", " ⬅ 触发")
    } else if pct > 0.0 {
        ("📈", "")
    } else if pct < drop {
        ("📉", "")
    } else {
        ("➡️", "")
    }
}

fn oi_status(oi_ratio: f64) -> (&'static str, &'static str) {
    if oi_ratio >= 2.0 {
        ("🚀", "激增")
    } else if oi_ratio >= 1.5 {
        ("📈", "大幅增加")
    } else if oi_ratio >= 1.05 {
        ("↗️", "增加")
    } else if oi_ratio >= 0.95 {
        ("➡️", "持平")
    } else if oi_ratio >= 0.8 {
        ("↘️", "减少")
    } else {
        ("📉", "大幅减少")
    }
}

fn format_price(price: f64) -> String {
    if price >= 1_000.0 {
        format!("{price:.2}")
    } else if price >= 1.0 {
        format!("{price:.4}")
    } else if price >= 0.01 {
        format!("{price:.6}")
    } else {
        format!("{price:.8}")
    }
}

fn format_number(value: f64) -> String {
    if value >= 1e9 {
        format!("{:.2}B", value / 1e9)
    } else if value >= 1e6 {
        format!("{:.2}M", value / 1e6)
    } else if value >= 1e3 {
        format!("{:.2}K", value / 1e3)
    } else {
        format!("{value:.2}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use core_types::{OiTrigger, SignalStrength};

    fn signal(severity: Severity) -> SqueezeSignal {
        SqueezeSignal {
            symbol: "OPUSDT".to_string(),
            ts: Utc.timestamp_opt(1_700_000_000, 0).single().unwrap(),
            price: 1.5342,
            funding_rate: -0.0012,
            current_oi: 12_345_678.0,
            oi_short_ma: 11_000_000.0,
            oi_long_ma: 5_000_000.0,
            oi_ratio: 2.2,
            is_extreme_funding: true,
            is_oi_surge: true,
            strength: SignalStrength::Moderate,
            severity,
            price_change_pct: 0.034,
            oi_change_pct: 1.2,
            oi_change_15m: 0.13,
            oi_change_1h: 0.08,
            oi_trigger: OiTrigger::Window15m,
            trend: "🚀 轧空启动 (趋势点火)".to_string(),
            advice: "🔫 市价做多 / 顺势进场".to_string(),
            btc_change_pct: 0.0,
            btc_veto: false,
        }
    }

    #[test]
    fn strong_message_carries_alarm_header() {
        let message = format_signal_message(&signal(Severity::Strong));
        assert!(message.contains("强力轧空警报"));
        assert!(message.contains("#OPUSDT"));
        assert!(message.contains("-0.1200% (极端)"));
        assert!(message.contains("12.35M"));
        assert!(message.contains("🔥 15m 增速: <b>+13.0%</b> ⬅ <b>触发!</b>"));
        assert!(message.contains("战术建议"));
    }

    #[test]
    fn normal_message_is_watchlist_tier() {
        let message = format_signal_message(&signal(Severity::Normal));
        assert!(message.contains("潜在机会"));
        assert!(!message.contains("强力轧空警报"));
    }

    #[test]
    fn vetoed_message_shows_market_warning() {
        let mut sig = signal(Severity::Strong);
        sig.btc_veto = true;
        sig.btc_change_pct = -0.021;
        let message = format_signal_message(&sig);
        assert!(message.contains("大盘预警"));
        assert!(message.contains("-2.10%"));
        assert!(message.contains("VETOED"));
    }

    #[test]
    fn keyboard_links_binance_and_tradingview() {
        let keyboard = inline_keyboard("OPUSDT");
        let raw = keyboard.to_string();
        assert!(raw.contains("binance.com/zh-CN/futures/OPUSDT"));
        assert!(raw.contains("BINANCE:OPUSDT.P"));
    }

    #[test]
    fn price_formatting_scales_with_magnitude() {
        assert_eq!(format_price(42_123.456), "42123.46");
        assert_eq!(format_price(1.5342), "1.5342");
        assert_eq!(format_price(0.0421), "0.042100");
        assert_eq!(format_price(0.00001234), "0.00001234");
    }

    #[tokio::test]
    async fn unconfigured_notifier_is_noop() {
        let notifier = TelegramNotifier::new(TelegramConfig::default()).unwrap();
        assert!(!notifier.is_enabled());
        let delivered = notifier.send_message("hi", None).await.unwrap();
        assert!(!delivered);
        let delivered = notifier.send_signal(&signal(Severity::Normal), None).await.unwrap();
        assert!(!delivered);
    }
}
