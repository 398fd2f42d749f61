//! Alert governor: decides which signals actually reach the operator.
//!
//! Per symbol the governor runs a `NEVER_SENT -> SENT(last_time,
//! last_severity)` state machine with a cooldown window and a
//! Normal-to-Strong escalation bypass. Per cycle it orders the queue by
//! urgency, enforces an alert cap and falls back to a degraded text-only
//! attempt when a rich dispatch throws. A failing signal never aborts the
//! rest of the queue.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core_types::{Severity, SqueezeSignal};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GovernorConfig {
    pub cooldown_minutes: i64,
    pub max_alerts_per_cycle: usize,
    /// Only dispatch Strong-severity signals.
    pub strong_only: bool,
    /// Pause between consecutive sends.
    pub pacing_ms: u64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            cooldown_minutes: 60,
            max_alerts_per_cycle: 5,
            strong_only: false,
            pacing_ms: 1_000,
        }
    }
}

/// Last successful dispatch for one symbol.
#[derive(Debug, Clone, Copy, PartialEq)]
struct AlertRecord {
    last_sent: DateTime<Utc>,
    last_severity: Severity,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertDecision {
    pub send: bool,
    pub reason: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct DispatchStats {
    pub sent: usize,
    pub suppressed: usize,
    pub failed: usize,
    /// Signals beyond the per-cycle cap; they stay eligible next cycle.
    pub deferred: usize,
}

/// Downstream notification channel, one rich attempt (chart + caption) and
/// one degraded text-only attempt. `Ok(false)` means the channel is not
/// configured; that is a no-op, never an error.
#[async_trait]
pub trait AlertSink {
    async fn send_rich(&self, signal: &SqueezeSignal) -> Result<bool>;
    async fn send_degraded(&self, signal: &SqueezeSignal) -> Result<bool>;
}

pub struct AlertGovernor {
    cfg: GovernorConfig,
    history: HashMap<String, AlertRecord>,
}

impl AlertGovernor {
    pub fn new(cfg: GovernorConfig) -> Self {
        Self {
            cfg,
            history: HashMap::new(),
        }
    }

    /// Decision rule, evaluated in order: new symbol, cooldown elapsed,
    /// severity escalation, otherwise suppress with remaining time.
    pub fn decide(&self, signal: &SqueezeSignal, now: DateTime<Utc>) -> AlertDecision {
        let Some(record) = self.history.get(&signal.symbol) else {
            return AlertDecision {
                send: true,
                reason: "🆕 新信号".to_string(),
            };
        };

        let elapsed_min = (now - record.last_sent).num_seconds() as f64 / 60.0;
        if elapsed_min >= self.cfg.cooldown_minutes as f64 {
            return AlertDecision {
                send: true,
                reason: format!("⏰ 冷却已过 ({elapsed_min:.0}分钟)"),
            };
        }

        if signal.severity == Severity::Strong && record.last_severity == Severity::Normal {
            return AlertDecision {
                send: true,
                reason: "⬆️ 信号升级 (NORMAL → STRONG)".to_string(),
            };
        }

        let remaining = self.cfg.cooldown_minutes as f64 - elapsed_min;
        AlertDecision {
            send: false,
            reason: format!("🔇 冷却中 ({remaining:.0}分钟后解除)"),
        }
    }

    /// Update state after a successful send. Never called for failures.
    pub fn record(&mut self, signal: &SqueezeSignal, now: DateTime<Utc>) {
        self.history.insert(
            signal.symbol.clone(),
            AlertRecord {
                last_sent: now,
                last_severity: signal.severity,
            },
        );
    }

    pub fn tracked_symbols(&self) -> usize {
        self.history.len()
    }

    /// Dispatch one cycle's signals through the sink, most urgent first.
    pub async fn dispatch_cycle<S: AlertSink + Sync>(
        &mut self,
        signals: &[SqueezeSignal],
        sink: &S,
    ) -> DispatchStats {
        let mut queue: Vec<&SqueezeSignal> = signals
            .iter()
            .filter(|s| !self.cfg.strong_only || s.severity == Severity::Strong)
            .collect();
        // Stable sort: Strong severity first, then strength; ties keep the
        // analyzer's (strength, oi_ratio) order.
        queue.sort_by(|a, b| b.dispatch_rank().cmp(&a.dispatch_rank()));

        let mut stats = DispatchStats::default();
        for (idx, signal) in queue.iter().enumerate() {
            if stats.sent >= self.cfg.max_alerts_per_cycle {
                stats.deferred = queue.len() - idx;
                tracing::info!(
                    deferred = stats.deferred,
                    cap = self.cfg.max_alerts_per_cycle,
                    "alert cap reached, deferring remainder to next cycle"
                );
                break;
            }

            let now = Utc::now();
            let decision = self.decide(signal, now);
            if !decision.send {
                tracing::debug!(symbol = %signal.symbol, reason = %decision.reason, "suppressed");
                stats.suppressed += 1;
                continue;
            }
            tracing::debug!(symbol = %signal.symbol, reason = %decision.reason, "dispatching");

            let delivered = match sink.send_rich(signal).await {
                Ok(delivered) => delivered,
                Err(err) => {
                    tracing::warn!(
                        symbol = %signal.symbol,
                        error = %err,
                        "rich dispatch failed, degrading to text"
                    );
                    sink.send_degraded(signal).await.unwrap_or_else(|err| {
                        tracing::error!(symbol = %signal.symbol, error = %err, "degraded dispatch failed");
                        false
                    })
                }
            };

            if delivered {
                self.record(signal, now);
                stats.sent += 1;
                metrics::counter!("governor.alerts_sent").increment(1);
                if self.cfg.pacing_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(self.cfg.pacing_ms)).await;
                }
            } else {
                stats.failed += 1;
            }
        }

        if stats.suppressed > 0 {
            metrics::counter!("governor.alerts_suppressed").increment(stats.suppressed as u64);
            tracing::info!(
                suppressed = stats.suppressed,
                cooldown_min = self.cfg.cooldown_minutes,
                "suppressed repeat signals"
            );
        }
        if stats.sent > 0 {
            tracing::info!(sent = stats.sent, "alerts dispatched");
        }
        stats
    }
}
