//! Rate-limit and budget governor.
//!
//! Tracks per-tier token consumption in rolling 5-hour and 7-day windows
//! and coordinates a single global pause across all workers. The governor
//! never pauses on its own accounting — high readings only log warnings;
//! only an observed 429 (via [`record_rate_limit_hit`]) pauses, and resume
//! is lazy on the next [`check`].
//!
//! State is in-memory plus a JSON snapshot rewritten atomically after
//! every mutation, so a restart resumes with its windows intact.
//!
//! [`record_rate_limit_hit`]: RateLimitGovernor::record_rate_limit_hit
//! [`check`]: RateLimitGovernor::check

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::domain::errors::EngineResult;
use crate::domain::models::{GovernorConfig, ModelTier};
use crate::infrastructure::state::{read_json, write_json_atomic};

const FIVE_HOURS_SECS: i64 = 5 * 3600;
const SEVEN_DAYS_SECS: i64 = 7 * 24 * 3600;

/// One recorded usage event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct UsageEvent {
    observed_at: DateTime<Utc>,
    input_tokens: u64,
    output_tokens: u64,
}

impl UsageEvent {
    fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Global pause state after a rate-limit hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PauseState {
    pub reason: String,
    pub paused_tier: ModelTier,
    pub resume_at: DateTime<Utc>,
}

/// Verdict returned to schedulers and workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GovernorVerdict {
    Ok,
    Pause {
        until: DateTime<Utc>,
        reason: String,
    },
}

impl GovernorVerdict {
    pub fn is_paused(&self) -> bool {
        matches!(self, Self::Pause { .. })
    }
}

/// Usage percentages for one tier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierUsage {
    pub five_hour_tokens: u64,
    pub seven_day_tokens: u64,
    pub five_hour_pct: f64,
    pub seven_day_pct: f64,
}

/// Point-in-time summary across tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSummary {
    pub per_tier: BTreeMap<ModelTier, TierUsage>,
    pub paused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Inner {
    windows: BTreeMap<ModelTier, VecDeque<UsageEvent>>,
    pause: Option<PauseState>,
}

/// Token accounting and pause coordination.
pub struct RateLimitGovernor {
    config: GovernorConfig,
    inner: RwLock<Inner>,
    snapshot_path: Option<PathBuf>,
}

impl RateLimitGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner::default()),
            snapshot_path: None,
        }
    }

    /// Attach a snapshot file, loading any prior state from it.
    pub fn with_snapshot(mut self, path: PathBuf) -> Self {
        if let Ok(Some(inner)) = read_json::<Inner>(&path) {
            self.inner = RwLock::new(inner);
        }
        self.snapshot_path = Some(path);
        self
    }

    /// Append a usage event to the tier's window and trim events older
    /// than seven days.
    pub async fn record_usage(
        &self,
        task_id: &str,
        tier: ModelTier,
        input_tokens: u64,
        output_tokens: u64,
        observed_at: DateTime<Utc>,
    ) -> EngineResult<()> {
        let summary = {
            let mut inner = self.inner.write().await;
            let window = inner.windows.entry(tier).or_default();
            window.push_back(UsageEvent {
                observed_at,
                input_tokens,
                output_tokens,
            });
            let cutoff = observed_at - Duration::seconds(SEVEN_DAYS_SECS);
            while window
                .front()
                .is_some_and(|e| e.observed_at < cutoff)
            {
                window.pop_front();
            }

            let usage = self.tier_usage(&inner, tier, observed_at);
            self.persist(&inner)?;
            usage
        };

        if summary.five_hour_pct >= self.config.five_hour_warn_pct {
            warn!(
                task_id,
                tier = %tier,
                pct = format!("{:.0}%", summary.five_hour_pct * 100.0),
                "five-hour token window running hot"
            );
        }
        if summary.seven_day_pct >= self.config.seven_day_warn_pct {
            warn!(
                task_id,
                tier = %tier,
                pct = format!("{:.0}%", summary.seven_day_pct * 100.0),
                "seven-day token window running hot"
            );
        }
        Ok(())
    }

    /// Record a 429-like hit and set the global pause.
    ///
    /// `retry-after` (integer seconds) takes precedence over an
    /// `anthropic-ratelimit-unified-reset` RFC3339 timestamp; with neither
    /// usable, the default back-off applies.
    pub async fn record_rate_limit_hit(
        &self,
        tier: ModelTier,
        error_text: &str,
        headers: &HashMap<String, String>,
    ) -> EngineResult<DateTime<Utc>> {
        let now = Utc::now();
        let resume_at = parse_resume_time(headers, now)
            .unwrap_or_else(|| now + Duration::seconds(self.config.default_backoff_secs as i64));

        let mut inner = self.inner.write().await;
        inner.pause = Some(PauseState {
            reason: format!("rate limit on {tier}: {error_text}"),
            paused_tier: tier,
            resume_at,
        });
        self.persist(&inner)?;

        warn!(
            tier = %tier,
            resume_at = %resume_at,
            "rate limit hit; pausing all scheduling"
        );
        Ok(resume_at)
    }

    /// Consulted before every dispatch and attempt. Clears an expired
    /// pause as a side effect.
    pub async fn check(&self) -> GovernorVerdict {
        let now = Utc::now();

        // Fast path: read lock only.
        {
            let inner = self.inner.read().await;
            match &inner.pause {
                None => return GovernorVerdict::Ok,
                Some(pause) if pause.resume_at > now => {
                    return GovernorVerdict::Pause {
                        until: pause.resume_at,
                        reason: pause.reason.clone(),
                    }
                }
                Some(_) => {} // expired, fall through to clear
            }
        }

        let mut inner = self.inner.write().await;
        if inner
            .pause
            .as_ref()
            .is_some_and(|p| p.resume_at <= now)
        {
            info!("rate-limit pause expired; resuming");
            inner.pause = None;
            let _ = self.persist(&inner);
        }
        match &inner.pause {
            None => GovernorVerdict::Ok,
            Some(pause) => GovernorVerdict::Pause {
                until: pause.resume_at,
                reason: pause.reason.clone(),
            },
        }
    }

    pub async fn usage_summary(&self) -> UsageSummary {
        let now = Utc::now();
        let inner = self.inner.read().await;

        let mut per_tier = BTreeMap::new();
        for tier in ModelTier::all() {
            per_tier.insert(tier, self.tier_usage(&inner, tier, now));
        }

        let pause = inner.pause.as_ref().filter(|p| p.resume_at > now);
        UsageSummary {
            per_tier,
            paused: pause.is_some(),
            resume_at: pause.map(|p| p.resume_at),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn tier_usage(&self, inner: &Inner, tier: ModelTier, now: DateTime<Utc>) -> TierUsage {
        let five_hour_cutoff = now - Duration::seconds(FIVE_HOURS_SECS);
        let seven_day_cutoff = now - Duration::seconds(SEVEN_DAYS_SECS);

        let (mut five_hour, mut seven_day) = (0u64, 0u64);
        if let Some(window) = inner.windows.get(&tier) {
            for event in window {
                if event.observed_at >= seven_day_cutoff {
                    seven_day += event.total();
                }
                if event.observed_at >= five_hour_cutoff {
                    five_hour += event.total();
                }
            }
        }

        let five_ceiling = self.config.five_hour_ceilings.for_tier(tier).max(1);
        let seven_ceiling = self.config.seven_day_ceilings.for_tier(tier).max(1);
        TierUsage {
            five_hour_tokens: five_hour,
            seven_day_tokens: seven_day,
            five_hour_pct: five_hour as f64 / five_ceiling as f64,
            seven_day_pct: seven_day as f64 / seven_ceiling as f64,
        }
    }

    fn persist(&self, inner: &Inner) -> EngineResult<()> {
        if let Some(path) = &self.snapshot_path {
            write_json_atomic(path, inner)?;
        }
        Ok(())
    }
}

/// Extract a resume time from rate-limit response headers.
fn parse_resume_time(
    headers: &HashMap<String, String>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if let Some(value) = headers.get("retry-after") {
        if let Ok(seconds) = value.trim().parse::<i64>() {
            if seconds >= 0 {
                return Some(now + Duration::seconds(seconds));
            }
        }
    }
    if let Some(value) = headers.get("anthropic-ratelimit-unified-reset") {
        if let Ok(ts) = value.trim().parse::<DateTime<Utc>>() {
            if ts > now {
                return Some(ts);
            }
        }
    }
    None
}
