//! Coordinator configuration parsed from environment variables.
//!
//! Every knob has a default so a bare environment yields a working setup.
//! The lease TTL is a deployment choice; both 30s and 300s have been run in
//! production, 30s is the default here.

use std::time::Duration;

pub const DEFAULT_CLAIM_DURATION_MS: i64 = 30_000;
pub const DEFAULT_AUTO_RELEASE_ON_BLUR: bool = true;
pub const DEFAULT_VISUAL_CLAIM_TIMEOUT_MS: i64 = 300;
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_EXPIRY_GRACE_MS: i64 = 1_000;
pub const DEFAULT_PRESENCE_TIMEOUT_MS: i64 = 30_000;
pub const DEFAULT_CLAIM_CAS_RETRIES: usize = 3;
pub const DEFAULT_PUBLISH_RETRIES: usize = 2;
pub const DEFAULT_PUBLISH_RETRY_BASE_MS: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Lease TTL. Always positive.
    pub claim_duration_ms: i64,
    /// Whether losing window focus releases held leases immediately.
    pub auto_release_on_blur: bool,
    /// Minimum time to show pending-claim UI. Cosmetic only.
    pub visual_claim_timeout_ms: i64,
    pub sweep_interval_ms: u64,
    /// How long a locally expired lease stays `Expired` before reading as available.
    pub expiry_grace_ms: i64,
    pub presence_timeout_ms: i64,
    /// Compare-and-swap attempts per claim before giving up.
    pub claim_cas_retries: usize,
    pub publish_retries: usize,
    pub publish_retry_base_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            claim_duration_ms: DEFAULT_CLAIM_DURATION_MS,
            auto_release_on_blur: DEFAULT_AUTO_RELEASE_ON_BLUR,
            visual_claim_timeout_ms: DEFAULT_VISUAL_CLAIM_TIMEOUT_MS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            expiry_grace_ms: DEFAULT_EXPIRY_GRACE_MS,
            presence_timeout_ms: DEFAULT_PRESENCE_TIMEOUT_MS,
            claim_cas_retries: DEFAULT_CLAIM_CAS_RETRIES,
            publish_retries: DEFAULT_PUBLISH_RETRIES,
            publish_retry_base_ms: DEFAULT_PUBLISH_RETRY_BASE_MS,
        }
    }
}

impl CoordinatorConfig {
    /// Build config from environment variables.
    ///
    /// Optional:
    /// - `CLAIM_DURATION_MS`: lease TTL, default 30000 (clamped to >= 1)
    /// - `AUTO_RELEASE_ON_BLUR`: `true` (default) or `false`
    /// - `VISUAL_CLAIM_TIMEOUT_MS`: default 300
    /// - `SWEEP_INTERVAL_MS`: default 1000
    /// - `EXPIRY_GRACE_MS`: default 1000
    /// - `PRESENCE_TIMEOUT_MS`: default 30000
    /// - `CLAIM_CAS_RETRIES`: default 3
    /// - `PUBLISH_RETRIES`: default 2
    /// - `PUBLISH_RETRY_BASE_MS`: default 20
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup. `from_env` delegates here.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |key: &str| lookup(key);
        Self {
            claim_duration_ms: parse_or(parse("CLAIM_DURATION_MS"), DEFAULT_CLAIM_DURATION_MS).max(1),
            auto_release_on_blur: parse_or(parse("AUTO_RELEASE_ON_BLUR"), DEFAULT_AUTO_RELEASE_ON_BLUR),
            visual_claim_timeout_ms: parse_or(parse("VISUAL_CLAIM_TIMEOUT_MS"), DEFAULT_VISUAL_CLAIM_TIMEOUT_MS)
                .max(0),
            sweep_interval_ms: parse_or(parse("SWEEP_INTERVAL_MS"), DEFAULT_SWEEP_INTERVAL_MS).max(1),
            expiry_grace_ms: parse_or(parse("EXPIRY_GRACE_MS"), DEFAULT_EXPIRY_GRACE_MS).max(0),
            presence_timeout_ms: parse_or(parse("PRESENCE_TIMEOUT_MS"), DEFAULT_PRESENCE_TIMEOUT_MS).max(1),
            claim_cas_retries: parse_or(parse("CLAIM_CAS_RETRIES"), DEFAULT_CLAIM_CAS_RETRIES),
            publish_retries: parse_or(parse("PUBLISH_RETRIES"), DEFAULT_PUBLISH_RETRIES),
            publish_retry_base_ms: parse_or(parse("PUBLISH_RETRY_BASE_MS"), DEFAULT_PUBLISH_RETRY_BASE_MS),
        }
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

fn parse_or<T>(raw: Option<String>, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    raw.and_then(|v| v.trim().parse::<T>().ok()).unwrap_or(default)
}

/// Parse an environment variable, falling back to `default` when unset or invalid.
pub fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    parse_or(std::env::var(key).ok(), default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
