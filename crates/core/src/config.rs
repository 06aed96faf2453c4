//! Listener configuration.
//!
//! Options arrive as JSON (camelCase keys) or as `CHANGEWATCH_*` environment
//! variables. Pass-through options are carried for external collaborators and
//! not interpreted here.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::backoff::{BackoffPolicy, BackoffStrategy};
use crate::error::{DomainError, DomainResult};

/// Prefix of the environment variables read by [`ListenerConfig::from_env`].
pub const ENV_PREFIX: &str = "CHANGEWATCH_";

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListenerConfig {
    /// Maximum changes fetched per batch.
    pub batch_size: usize,
    pub backoff_strategy: BackoffStrategy,
    pub backoff_multiplier: f64,
    /// Base backoff delay in seconds.
    pub backoff_delay: f64,
    /// 0 = no limit.
    pub backoff_limit: u32,
    /// Conflict rounds the claim protocol attempts before giving up.
    pub claim_max_rounds: u32,
    /// Base pause between claim rounds, in milliseconds.
    pub claim_retry_base_ms: u64,
    /// Upper bound on batches a single drain runs back to back.
    pub max_batches_per_drain: u32,

    // Pass-through options for external collaborators.
    pub passwords: Option<JsonValue>,
    pub retry_after_seconds: Option<u64>,
    pub concurrency: Option<usize>,
    pub check_stalled_seconds: Option<u64>,
    pub assume_deleted_after_seconds: Option<u64>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            backoff_strategy: BackoffStrategy::Linear,
            backoff_multiplier: 2.0,
            backoff_delay: 5.0,
            backoff_limit: 0,
            claim_max_rounds: 10,
            claim_retry_base_ms: 25,
            max_batches_per_drain: 1000,
            passwords: None,
            retry_after_seconds: None,
            concurrency: None,
            check_stalled_seconds: None,
            assume_deleted_after_seconds: None,
        }
    }
}

impl core::fmt::Debug for ListenerConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ListenerConfig")
            .field("batch_size", &self.batch_size)
            .field("backoff_strategy", &self.backoff_strategy)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("backoff_delay", &self.backoff_delay)
            .field("backoff_limit", &self.backoff_limit)
            .field("claim_max_rounds", &self.claim_max_rounds)
            .field("claim_retry_base_ms", &self.claim_retry_base_ms)
            .field("max_batches_per_drain", &self.max_batches_per_drain)
            .field("passwords", &self.passwords.as_ref().map(|_| "<redacted>"))
            .field("retry_after_seconds", &self.retry_after_seconds)
            .field("concurrency", &self.concurrency)
            .field("check_stalled_seconds", &self.check_stalled_seconds)
            .field("assume_deleted_after_seconds", &self.assume_deleted_after_seconds)
            .finish()
    }
}

impl ListenerConfig {
    /// Parse and validate a JSON options object. Missing keys take defaults.
    pub fn from_json(raw: &str) -> DomainResult<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| DomainError::validation(format!("listener config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read `CHANGEWATCH_*` environment variables over the defaults.
    pub fn from_env() -> DomainResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> DomainResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut config = Self::default();

        if let Some(v) = get("BATCH_SIZE") {
            config.batch_size = parse_var("BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("BACKOFF_STRATEGY") {
            config.backoff_strategy = match v.trim().to_ascii_lowercase().as_str() {
                "linear" => BackoffStrategy::Linear,
                "exponential" => BackoffStrategy::Exponential,
                other => {
                    return Err(DomainError::validation(format!(
                        "{ENV_PREFIX}BACKOFF_STRATEGY: unknown strategy '{other}'"
                    )));
                }
            };
        }
        if let Some(v) = get("BACKOFF_MULTIPLIER") {
            config.backoff_multiplier = parse_var("BACKOFF_MULTIPLIER", &v)?;
        }
        if let Some(v) = get("BACKOFF_DELAY") {
            config.backoff_delay = parse_var("BACKOFF_DELAY", &v)?;
        }
        if let Some(v) = get("BACKOFF_LIMIT") {
            config.backoff_limit = parse_var("BACKOFF_LIMIT", &v)?;
        }
        if let Some(v) = get("CLAIM_MAX_ROUNDS") {
            config.claim_max_rounds = parse_var("CLAIM_MAX_ROUNDS", &v)?;
        }
        if let Some(v) = get("CLAIM_RETRY_BASE_MS") {
            config.claim_retry_base_ms = parse_var("CLAIM_RETRY_BASE_MS", &v)?;
        }
        if let Some(v) = get("MAX_BATCHES_PER_DRAIN") {
            config.max_batches_per_drain = parse_var("MAX_BATCHES_PER_DRAIN", &v)?;
        }
        if let Some(v) = get("PASSWORDS") {
            let passwords = serde_json::from_str(&v).map_err(|e| {
                DomainError::validation(format!("{ENV_PREFIX}PASSWORDS: {e}"))
            })?;
            config.passwords = Some(passwords);
        }
        if let Some(v) = get("RETRY_AFTER_SECONDS") {
            config.retry_after_seconds = Some(parse_var("RETRY_AFTER_SECONDS", &v)?);
        }
        if let Some(v) = get("CONCURRENCY") {
            config.concurrency = Some(parse_var("CONCURRENCY", &v)?);
        }
        if let Some(v) = get("CHECK_STALLED_SECONDS") {
            config.check_stalled_seconds = Some(parse_var("CHECK_STALLED_SECONDS", &v)?);
        }
        if let Some(v) = get("ASSUME_DELETED_AFTER_SECONDS") {
            config.assume_deleted_after_seconds =
                Some(parse_var("ASSUME_DELETED_AFTER_SECONDS", &v)?);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.batch_size == 0 {
            return Err(DomainError::validation("batchSize must be greater than 0"));
        }
        if !self.backoff_delay.is_finite() || self.backoff_delay < 0.0 {
            return Err(DomainError::validation(
                "backoffDelay must be a non-negative number of seconds",
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(DomainError::validation("backoffMultiplier must be >= 1"));
        }
        if self.claim_max_rounds == 0 {
            return Err(DomainError::validation("claimMaxRounds must be greater than 0"));
        }
        if self.max_batches_per_drain == 0 {
            return Err(DomainError::validation(
                "maxBatchesPerDrain must be greater than 0",
            ));
        }
        Ok(())
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            strategy: self.backoff_strategy,
            delay_secs: self.backoff_delay,
            multiplier: self.backoff_multiplier,
            limit: self.backoff_limit,
        }
    }

    pub fn claim_retry_base(&self) -> Duration {
        Duration::from_millis(self.claim_retry_base_ms)
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_backoff(mut self, policy: &BackoffPolicy) -> Self {
        self.backoff_strategy = policy.strategy;
        self.backoff_delay = policy.delay_secs;
        self.backoff_multiplier = policy.multiplier;
        self.backoff_limit = policy.limit;
        self
    }

    pub fn with_claim_rounds(mut self, max_rounds: u32, retry_base_ms: u64) -> Self {
        self.claim_max_rounds = max_rounds;
        self.claim_retry_base_ms = retry_base_ms;
        self
    }
}

fn parse_var<T>(name: &str, raw: &str) -> DomainResult<T>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| DomainError::validation(format!("{ENV_PREFIX}{name}: {e}")))
}
