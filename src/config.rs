//! Server configuration from `COURTSIDE_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::engine::BookingPolicy;
use crate::model::Minute;
use crate::tenant::TenantSettings;

const PREFIX: &str = "COURTSIDE_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("COURTSIDE_{key}: cannot parse {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub payment_base_url: String,
    pub tenant: TenantSettings,
}

impl Config {
    /// Read the process environment, after loading `.env` if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; keys are looked up with the `COURTSIDE_` prefix.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(&format!("{PREFIX}{key}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let policy = BookingPolicy {
            min_duration_minutes: parse_or(&get, "MIN_DURATION_MINUTES", 60 as Minute)?,
            reject_past_dates: parse_bool_or(&get, "REJECT_PAST_DATES", true)?,
            lock_timeout: Duration::from_millis(parse_or(&get, "LOCK_TIMEOUT_MS", 2_000u64)?),
            dispatch_timeout: Duration::from_millis(parse_or(&get, "DISPATCH_TIMEOUT_MS", 3_000u64)?),
        };

        Ok(Self {
            bind: get("BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&get, "PORT", 5433)?,
            data_dir: PathBuf::from(get("DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: get("PASSWORD").unwrap_or_else(|| "courtside".into()),
            max_connections: parse_or(&get, "MAX_CONNECTIONS", 256)?,
            metrics_port: parse_opt(&get, "METRICS_PORT")?,
            tls_cert: get("TLS_CERT"),
            tls_key: get("TLS_KEY"),
            payment_base_url: get("PAYMENT_BASE_URL")
                .unwrap_or_else(|| "https://pay.courtside.local".into()),
            tenant: TenantSettings {
                policy,
                compact_threshold: parse_or(&get, "COMPACT_THRESHOLD", 1_000)?,
                sweep_interval: Duration::from_secs(parse_or(&get, "SWEEP_INTERVAL_SECS", 60)?),
            },
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_opt<T>(get: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(key)
        .map(|value| {
            value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            })
        })
        .transpose()
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_opt(get, key)?.unwrap_or(default))
}

fn parse_bool_or(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match get(key) {
        None => Ok(default),
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key,
                value,
                reason: "expected true or false".into(),
            }),
        },
    }
}
