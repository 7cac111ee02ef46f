//! Loader configuration.
//!
//! A [`LoaderConfig`] can be built in code, deserialized from JSON (it is
//! `serde`-enabled, with every field optional), or read from the
//! environment:
//!
//! - `LOADER_WINDOW_MS` - batch window in milliseconds (unset: one tick)
//! - `LOADER_MAX_KEYS` - dispatch a batch once it holds this many keys
//! - `LOADER_CACHE` - `true`/`false`, keep results for the loader's lifetime
//! - `LOADER_EVICT_FAILURES` - `true`/`false`, retry failed keys on reload
//! - `LOADER_PROJECTION_POLICY` - `union`, `first_key` or `reject`
//! - `LOADER_ID_FORMAT` - `object_id` or `any`
//! - `LOADER_RETRY_ATTEMPTS` - bulk read attempts for transient failures
//! - `LOADER_RETRY_BACKOFF_MS` - pause between attempts

use std::{env, num::NonZeroUsize, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    batch::BatchRules, error::ConfigError, projection::ProjectionPolicy, record::IdFormat,
    window::Window,
};

/// Bounded retry for transient bulk read failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. `1` disables retrying.
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 10,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 0,
        }
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// `None` keeps a batch open for one scheduler tick.
    pub window_ms: Option<u64>,
    pub max_keys: Option<NonZeroUsize>,
    pub cache: bool,
    pub evict_failures: bool,
    pub projection_policy: ProjectionPolicy,
    pub id_format: IdFormat,
    pub retry: RetryPolicy,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            window_ms: None,
            max_keys: None,
            cache: true,
            evict_failures: true,
            projection_policy: ProjectionPolicy::Union,
            id_format: IdFormat::ObjectId,
            retry: RetryPolicy::default(),
        }
    }
}

impl LoaderConfig {
    pub fn window(&self) -> Window {
        match self.window_ms {
            None => Window::Tick,
            Some(ms) => Window::Delay(Duration::from_millis(ms)),
        }
    }

    /// Batch rules for a controller running `batcher` under this
    /// configuration.
    pub fn rules<Batcher>(&self, batcher: Batcher) -> BatchRules<Batcher> {
        BatchRules {
            batcher,
            window: self.window(),
            max_keys: self.max_keys,
            cache: self.cache,
            evict_failures: self.evict_failures,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Defaults, overridden by any `LOADER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().overlay(|name| env::var(name).ok())
    }

    /// Override fields with the variables `lookup` returns.
    pub fn overlay(
        mut self,
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(ms) = var(&lookup, "LOADER_WINDOW_MS", parse_from_str::<u64>)? {
            self.window_ms = Some(ms);
        }
        if let Some(max_keys) = var(&lookup, "LOADER_MAX_KEYS", parse_from_str::<NonZeroUsize>)? {
            self.max_keys = Some(max_keys);
        }
        if let Some(cache) = var(&lookup, "LOADER_CACHE", parse_bool)? {
            self.cache = cache;
        }
        if let Some(evict) = var(&lookup, "LOADER_EVICT_FAILURES", parse_bool)? {
            self.evict_failures = evict;
        }
        if let Some(policy) = var(&lookup, "LOADER_PROJECTION_POLICY", parse_enum)? {
            self.projection_policy = policy;
        }
        if let Some(format) = var(&lookup, "LOADER_ID_FORMAT", parse_enum)? {
            self.id_format = format;
        }
        if let Some(attempts) = var(&lookup, "LOADER_RETRY_ATTEMPTS", parse_from_str::<u32>)? {
            self.retry.max_attempts = attempts.max(1);
        }
        if let Some(backoff) = var(&lookup, "LOADER_RETRY_BACKOFF_MS", parse_from_str::<u64>)? {
            self.retry.backoff_ms = backoff;
        }

        Ok(self)
    }
}

fn var<T>(
    lookup: &impl Fn(&'static str) -> Option<String>,
    name: &'static str,
    parse: impl Fn(&str) -> Result<T, String>,
) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(value) => parse(value.trim())
            .map(Some)
            .map_err(|reason| ConfigError::InvalidVar {
                name,
                value,
                reason,
            }),
    }
}

fn parse_from_str<T>(value: &str) -> Result<T, String>
where
    T: FromStr,
    T::Err: ToString,
{
    value.parse().map_err(|err: T::Err| err.to_string())
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err("expected true or false".into()),
    }
}

// The enums deserialize from their snake_case names, so reuse serde for
// the environment too.
fn parse_enum<T: serde::de::DeserializeOwned>(value: &str) -> Result<T, String> {
    serde_json::from_value(serde_json::Value::String(value.to_lowercase()))
        .map_err(|err| err.to_string())
}
