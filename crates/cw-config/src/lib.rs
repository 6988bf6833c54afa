//! cw-config
//!
//! Effective-config assembly for the daemon: built-in defaults, an optional
//! JSON config file, then `CW_*` environment overrides, merged in that
//! order (later layers win). The effective config is validated, then
//! serialized canonically and hashed so every boot can log exactly which
//! configuration it ran under.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

use cw_schemas::DEFAULT_MAX_CAPACITY;

/// Environment overrides recognized by [`Config::load`], applied after the
/// config file. `CW_DATABASE_URL` is deliberately absent: connection URLs
/// carry credentials and are read directly from the environment by cw-db,
/// never persisted into the hashed config.
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("CW_BIND_ADDR", "/bind_addr"),
    ("CW_MAX_CAPACITY", "/max_capacity"),
    ("CW_TRACK_RETENTION_SECS", "/track_retention_secs"),
    ("CW_SWEEP_INTERVAL_SECS", "/sweep_interval_secs"),
    ("CW_RECENT_LIMIT", "/recent_limit"),
    ("CW_LOG_FILTER", "/log_filter"),
];

/// Fourteen days, the default window before departed tracks are evicted.
const DEFAULT_TRACK_RETENTION_SECS: u64 = 14 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Address the HTTP API listens on.
    pub bind_addr: String,
    /// Advisory lot capacity used when initializing a fresh snapshot row.
    pub max_capacity: i64,
    /// Departed tracks untouched for this long are evicted by the sweep.
    pub track_retention_secs: u64,
    /// How often the retention sweep runs.
    pub sweep_interval_secs: u64,
    /// Default row limit for the recent-events and recent-audit endpoints.
    pub recent_limit: i64,
    /// Default tracing filter, overridable by `RUST_LOG` at runtime.
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8787".to_string(),
            max_capacity: DEFAULT_MAX_CAPACITY,
            track_retention_secs: DEFAULT_TRACK_RETENTION_SECS,
            sweep_interval_secs: 15 * 60,
            recent_limit: 50,
            log_filter: "info".to_string(),
        }
    }
}

impl Config {
    /// Reject configs that would misbehave at runtime rather than fail at
    /// their first use.
    pub fn validate(&self) -> Result<()> {
        if self.max_capacity <= 0 {
            bail!("CONFIG_INVALID: max_capacity must be positive (got {})", self.max_capacity);
        }
        if self.track_retention_secs == 0 {
            bail!("CONFIG_INVALID: track_retention_secs must be positive");
        }
        if self.sweep_interval_secs == 0 {
            bail!("CONFIG_INVALID: sweep_interval_secs must be positive");
        }
        if self.recent_limit <= 0 {
            bail!("CONFIG_INVALID: recent_limit must be positive (got {})", self.recent_limit);
        }
        if self.bind_addr.parse::<std::net::SocketAddr>().is_err() {
            bail!("CONFIG_INVALID: bind_addr is not a socket address: {}", self.bind_addr);
        }
        Ok(())
    }
}

/// A validated effective config plus its identity hash.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    /// sha256 of `canonical_json`, logged at boot.
    pub config_hash: String,
    pub canonical_json: String,
}

impl LoadedConfig {
    /// Assemble the effective config: defaults, then `path` (if given),
    /// then `CW_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => {
                let raw = fs::read_to_string(p)
                    .with_context(|| format!("failed to read config file: {}", p.display()))?;
                Some(raw)
            }
            None => None,
        };
        let env: Vec<(String, String)> = ENV_OVERRIDES
            .iter()
            .filter_map(|(var, ptr)| std::env::var(var).ok().map(|v| (ptr.to_string(), v)))
            .collect();
        Self::from_layers(file.as_deref(), &env)
    }

    /// Layer assembly with explicit inputs; `env` pairs are
    /// (JSON pointer, raw string value).
    pub fn from_layers(file_json: Option<&str>, env: &[(String, String)]) -> Result<Self> {
        let mut merged =
            serde_json::to_value(Config::default()).context("defaults serialize failed")?;

        if let Some(raw) = file_json {
            let file_value: Value = serde_json::from_str(raw).context("config file is not valid json")?;
            if !file_value.is_object() {
                bail!("CONFIG_INVALID: config file root must be a json object");
            }
            merged = deep_merge(merged, file_value);
        }

        for (pointer, raw) in env {
            let slot = merged
                .pointer_mut(pointer)
                .with_context(|| format!("unknown config pointer from env: {pointer}"))?;
            *slot = coerce_like(slot, raw)
                .with_context(|| format!("env override for {pointer} has the wrong type"))?;
        }

        let config: Config =
            serde_json::from_value(merged).context("effective config failed to deserialize")?;
        config.validate()?;

        let canonical_json =
            serde_json::to_string(&config).context("canonical json serialize failed")?;
        let config_hash = sha256_hex(canonical_json.as_bytes());

        Ok(Self {
            config,
            config_hash,
            canonical_json,
        })
    }
}

fn deep_merge(a: Value, b: Value) -> Value {
    match (a, b) {
        (Value::Object(mut a_map), Value::Object(b_map)) => {
            for (k, b_val) in b_map {
                let a_val = a_map.remove(&k).unwrap_or(Value::Null);
                a_map.insert(k, deep_merge(a_val, b_val));
            }
            Value::Object(a_map)
        }
        (_, b_other) => b_other,
    }
}

/// Parse an env string into the same JSON type as the value it replaces,
/// so "80" lands as a number where a number lives and as a string where a
/// string lives.
fn coerce_like(current: &Value, raw: &str) -> Result<Value> {
    match current {
        Value::String(_) => Ok(Value::String(raw.to_string())),
        Value::Number(_) => {
            let n: i64 = raw.trim().parse().context("expected an integer")?;
            Ok(Value::from(n))
        }
        Value::Bool(_) => {
            let b: bool = raw.trim().parse().context("expected true/false")?;
            Ok(Value::Bool(b))
        }
        other => bail!("cannot override config value of this shape: {other}"),
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
