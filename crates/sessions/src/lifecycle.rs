//! Session reset lifecycle — daily + idle, with per-channel overrides.
//!
//! This is separate from the gateway's run-level idle watchdog
//! (`lifecycle.idle_watchdog_ms` in `aw_domain::config`), which fires while
//! a run is actively in flight. This lifecycle concerns a session with no
//! active run at all: one that's gone stale enough that its next message
//! should start fresh rather than resume.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::SessionEntry;

/// Per-channel or per-type override of the global reset parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResetOverride {
    pub daily_reset_hour: Option<u8>,
    pub idle_minutes: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionLifecycleConfig {
    pub daily_reset_hour: Option<u8>,
    pub idle_minutes: Option<u32>,
    #[serde(default)]
    pub reset_by_type: HashMap<String, ResetOverride>,
    #[serde(default)]
    pub reset_by_channel: HashMap<String, ResetOverride>,
}

#[derive(Debug, Clone)]
pub enum ResetReason {
    DailyReset { hour: u8 },
    IdleTimeout { idle_minutes: u32 },
}

impl std::fmt::Display for ResetReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DailyReset { hour } => write!(f, "daily reset (hour={hour})"),
            Self::IdleTimeout { idle_minutes } => write!(f, "idle timeout ({idle_minutes}m)"),
        }
    }
}

/// Context the Router supplies when checking whether a session is stale:
/// just enough to resolve per-channel/per-type overrides.
#[derive(Debug, Clone, Default)]
pub struct ResetContext {
    pub channel: Option<String>,
    pub is_direct: bool,
    pub has_thread: bool,
}

pub struct LifecycleManager {
    config: SessionLifecycleConfig,
}

impl LifecycleManager {
    pub fn new(config: SessionLifecycleConfig) -> Self {
        Self { config }
    }

    pub fn should_reset(
        &self,
        entry: &SessionEntry,
        ctx: &ResetContext,
        now: DateTime<Utc>,
    ) -> Option<ResetReason> {
        let (daily_hour, idle_mins) = self.resolve_params(ctx);

        if let Some(hour) = daily_hour {
            if crossed_daily_boundary(entry.updated_at, now, hour) {
                return Some(ResetReason::DailyReset { hour });
            }
        }

        if let Some(idle) = idle_mins {
            let elapsed = now.signed_duration_since(entry.updated_at).num_minutes();
            if elapsed >= idle as i64 {
                return Some(ResetReason::IdleTimeout { idle_minutes: idle });
            }
        }

        None
    }

    fn resolve_params(&self, ctx: &ResetContext) -> (Option<u8>, Option<u32>) {
        let mut daily = self.config.daily_reset_hour;
        let mut idle = self.config.idle_minutes;

        let msg_type = if ctx.has_thread {
            "thread"
        } else if ctx.is_direct {
            "direct"
        } else {
            "group"
        };

        if let Some(ovr) = self.config.reset_by_type.get(msg_type) {
            if ovr.daily_reset_hour.is_some() {
                daily = ovr.daily_reset_hour;
            }
            if ovr.idle_minutes.is_some() {
                idle = ovr.idle_minutes;
            }
        }

        if let Some(ch) = &ctx.channel {
            if let Some(ovr) = self.config.reset_by_channel.get(ch.as_str()) {
                if ovr.daily_reset_hour.is_some() {
                    daily = ovr.daily_reset_hour;
                }
                if ovr.idle_minutes.is_some() {
                    idle = ovr.idle_minutes;
                }
            }
        }

        (daily, idle)
    }
}

/// Check whether the daily boundary at `hour` was crossed between
/// `last_active` and `now`.
fn crossed_daily_boundary(last_active: DateTime<Utc>, now: DateTime<Utc>, hour: u8) -> bool {
    if now.signed_duration_since(last_active).num_seconds() < 60 {
        return false;
    }

    let Some(today_boundary) = now.date_naive().and_hms_opt(hour as u32, 0, 0) else {
        return false;
    };
    let today_boundary = today_boundary.and_utc();

    let boundary = if now >= today_boundary {
        today_boundary
    } else {
        today_boundary - chrono::Duration::days(1)
    };

    last_active < boundary && now >= boundary
}
