//! Per-origin request counting with a coarse fixed window.
//!
//! The counter map is wiped wholesale every period. A host can therefore
//! send `max` requests just before a reset and `max` more right after it;
//! the limiter bounds the average rate, not bursts across window edges.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::error::ConfigError;

static SETTING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+) (\d+)(?:\s*$|\s+(.+)$)").expect("static regex"));

static SCHEME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\w\-]+://").expect("static regex"));

/// Immutable limiter settings parsed from `<max> <periodMinutes> [exempt...]`.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub period_minutes: u64,
    pub exempt: Option<Regex>,
}

impl RateLimitConfig {
    /// Parses the textual setting. Returns `Ok(None)` when it does not
    /// describe a limit at all.
    ///
    /// Exempt entries are literal hosts or `/regex/` patterns, matched
    /// case-insensitively against the whole host.
    pub fn parse(setting: &str) -> Result<Option<Self>, ConfigError> {
        let Some(caps) = SETTING_RE.captures(setting) else {
            return Ok(None);
        };

        let max_requests = caps[1]
            .parse::<u32>()
            .map_err(|e| ConfigError::RateLimit(e.to_string()))?;
        let period_minutes = caps[2]
            .parse::<u64>()
            .map_err(|e| ConfigError::RateLimit(e.to_string()))?;
        if period_minutes == 0 {
            return Err(ConfigError::RateLimit(
                "period in minutes cannot be zero".into(),
            ));
        }

        let exempt = match caps.get(3) {
            Some(list) => Some(compile_exempt(list.as_str())?),
            None => None,
        };

        Ok(Some(Self {
            max_requests,
            period_minutes,
            exempt,
        }))
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_minutes * 60)
    }

    fn message(&self) -> String {
        let period = if self.period_minutes == 1 {
            " per minute".to_string()
        } else {
            format!(" per {} minutes", self.period_minutes)
        };
        format!(
            "The number of requests is limited to {}{}. Please self-host this proxy if you need more quota.",
            self.max_requests, period
        )
    }
}

fn compile_exempt(list: &str) -> Result<Regex, ConfigError> {
    let mut parts = Vec::new();
    for (i, host) in list.split_whitespace().enumerate() {
        let starts = host.starts_with('/');
        let ends = host.ends_with('/');
        if starts || ends {
            if host.len() == 1 || !starts || !ends {
                return Err(ConfigError::RateLimit(format!(
                    "regex at index {i} must start and end with a slash (\"/\")"
                )));
            }
            let pattern = &host[1..host.len() - 1];
            Regex::new(pattern)
                .map_err(|e| ConfigError::RateLimit(format!("regex at index {i}: {e}")))?;
            parts.push(pattern.to_string());
        } else {
            parts.push(regex::escape(host));
        }
    }
    Regex::new(&format!("(?i)^(?:{})$", parts.join("|")))
        .map_err(|e| ConfigError::RateLimit(e.to_string()))
}

/// Shared access counter consulted once per forwarded request.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    message: String,
    hits: DashMap<String, u32>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let message = config.message();
        Self {
            config,
            message,
            hits: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Returns a violation message once `origin` exceeds its quota.
    pub fn check(&self, origin: &str) -> Option<String> {
        let host = SCHEME_RE.replace(origin, "");
        if let Some(exempt) = &self.config.exempt {
            if exempt.is_match(&host) {
                return None;
            }
        }

        let mut count = self.hits.entry(host.into_owned()).or_insert(0);
        if *count >= self.config.max_requests {
            return Some(self.message.clone());
        }
        *count += 1;
        None
    }

    /// Clears every counter, starting a new window.
    pub fn reset(&self) {
        debug!(hosts = self.hits.len(), "Resetting rate limit window");
        self.hits.clear();
    }

    /// Spawns the window timer. The task ends once the limiter is dropped.
    pub fn spawn_reset(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let limiter: Weak<Self> = Arc::downgrade(self);
        let period = self.config.period();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match limiter.upgrade() {
                    Some(limiter) => limiter.reset(),
                    None => {
                        warn!("Rate limiter dropped, stopping window timer");
                        break;
                    }
                }
            }
        })
    }
}
