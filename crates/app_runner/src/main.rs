use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use observability::{init_metrics, init_tracing};

mod config_loader;
mod runtime;

use config_loader::MonitorConfig;
use runtime::Monitor;

#[derive(Parser, Debug)]
#[command(name = "squeezeedge", about = "Binance USDT perpetual squeeze monitor", version)]
struct Cli {
    /// Run a single monitoring cycle and exit.
    #[arg(long)]
    once: bool,

    /// Poll interval in seconds, overriding the config file.
    #[arg(long)]
    interval: Option<u64>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,

    /// Print the effective configuration and exit.
    #[arg(long)]
    show_config: bool,

    /// Send a Telegram test message and exit.
    #[arg(long)]
    test_telegram: bool,

    #[arg(long, env = "SQUEEZEEDGE_CONFIG_PATH", default_value = "configs/monitor.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.debug && std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "debug");
    }
    let _guard = init_tracing("squeezeedge");
    let _metrics = init_metrics();

    let mut cfg = MonitorConfig::load(&cli.config);
    if let Some(interval) = cli.interval {
        cfg.check_interval_secs = interval;
    }

    if cli.show_config {
        println!("{}", toml::to_string_pretty(&cfg)?);
        return Ok(());
    }

    let errors = cfg.validate();
    if !errors.is_empty() {
        for error in &errors {
            tracing::error!(error, "invalid configuration");
        }
        bail!("configuration validation failed ({} errors)", errors.len());
    }

    tracing::info!(
        interval_s = cfg.check_interval_secs,
        min_volume = cfg.min_volume_24h,
        cooldown_min = cfg.cooldown_minutes,
        veto_threshold = cfg.thresholds.btc_veto_threshold,
        data_dir = %cfg.data_dir,
        "squeezeedge starting"
    );

    if cli.test_telegram {
        return test_telegram(&cfg).await;
    }

    let mut monitor = Monitor::new(cfg)?;
    if cli.once {
        let signals = monitor.run_once().await?;
        tracing::info!(signals = signals.len(), "single cycle finished");
        return Ok(());
    }

    monitor.run_forever().await
}

async fn test_telegram(cfg: &MonitorConfig) -> Result<()> {
    let notifier = notifier_telegram::TelegramNotifier::new(cfg.telegram_config())?;
    if !notifier.is_enabled() {
        bail!("telegram not configured; set TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID");
    }
    if notifier.send_startup_message().await? {
        tracing::info!("telegram test message delivered");
        Ok(())
    } else {
        bail!("telegram test message was not delivered")
    }
}
