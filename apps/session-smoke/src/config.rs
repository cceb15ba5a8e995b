//! Environment-backed runtime configuration for `walink-smoke`.

use std::{env, error::Error, fmt, path::PathBuf};

use session_core::{AddressRules, BackoffMode, ReconnectPolicy};
use session_runtime::ManagerConfig;

const DEFAULT_AUTH_DIR: &str = "./auth";
const DEFAULT_SESSION_ID: &str = "walink-session";
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 3_000;
const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_COUNTRY_CODE: &str = "51";
const DEFAULT_LOCAL_NUMBER_LEN: usize = 9;
const DEFAULT_EVENT_BUFFER: usize = 256;

/// Runtime configuration used by the gateway binary.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    /// Directory holding `creds.json`.
    pub auth_dir: PathBuf,
    /// Identifier attached to log output.
    pub session_id: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub reconnect_backoff: BackoffMode,
    /// Cap for exponential backoff; ignored in fixed mode.
    pub reconnect_max_delay_ms: u64,
    /// `None` keeps every envelope until disconnect.
    pub retention_capacity: Option<usize>,
    pub default_country_code: String,
    pub local_number_len: usize,
    /// Render pairing artifacts to stdout.
    pub print_qr: bool,
    pub event_buffer: usize,
}

impl GatewayConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let auth_dir = optional_trimmed_env("WALINK_AUTH_DIR", &mut lookup)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_AUTH_DIR));
        let session_id = optional_trimmed_env("WALINK_SESSION_ID", &mut lookup)
            .unwrap_or_else(|| DEFAULT_SESSION_ID.to_owned());

        let max_reconnect_attempts = parse_with_default(
            "WALINK_MAX_RECONNECT_ATTEMPTS",
            DEFAULT_MAX_RECONNECT_ATTEMPTS,
            &mut lookup,
        )?;
        let reconnect_delay_ms = parse_with_default(
            "WALINK_RECONNECT_DELAY_MS",
            DEFAULT_RECONNECT_DELAY_MS,
            &mut lookup,
        )?;
        let reconnect_max_delay_ms = parse_with_default(
            "WALINK_RECONNECT_MAX_DELAY_MS",
            DEFAULT_RECONNECT_MAX_DELAY_MS,
            &mut lookup,
        )?;
        let reconnect_backoff = parse_backoff("WALINK_RECONNECT_BACKOFF", &mut lookup)?;
        let retention_capacity =
            parse_optional::<usize, _>("WALINK_RETENTION_CAPACITY", &mut lookup)?;

        let default_country_code = optional_trimmed_env("WALINK_DEFAULT_COUNTRY_CODE", &mut lookup)
            .unwrap_or_else(|| DEFAULT_COUNTRY_CODE.to_owned());
        let local_number_len = parse_with_default(
            "WALINK_LOCAL_NUMBER_LEN",
            DEFAULT_LOCAL_NUMBER_LEN,
            &mut lookup,
        )?;
        let print_qr = parse_bool("WALINK_PRINT_QR", true, &mut lookup)?;
        let event_buffer =
            parse_with_default("WALINK_EVENT_BUFFER", DEFAULT_EVENT_BUFFER, &mut lookup)?;

        if retention_capacity == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "WALINK_RETENTION_CAPACITY",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if event_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                key: "WALINK_EVENT_BUFFER",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if !default_country_code.chars().all(|ch| ch.is_ascii_digit()) {
            return Err(ConfigError::InvalidValue {
                key: "WALINK_DEFAULT_COUNTRY_CODE",
                value: default_country_code,
                reason: "must contain digits only".to_owned(),
            });
        }
        if reconnect_backoff == BackoffMode::Exponential
            && reconnect_max_delay_ms < reconnect_delay_ms
        {
            return Err(ConfigError::InvalidValue {
                key: "WALINK_RECONNECT_MAX_DELAY_MS",
                value: reconnect_max_delay_ms.to_string(),
                reason: "must not be below WALINK_RECONNECT_DELAY_MS".to_owned(),
            });
        }

        Ok(Self {
            auth_dir,
            session_id,
            max_reconnect_attempts,
            reconnect_delay_ms,
            reconnect_backoff,
            reconnect_max_delay_ms,
            retention_capacity,
            default_country_code,
            local_number_len,
            print_qr,
            event_buffer,
        })
    }

    /// Lifecycle manager tuning derived from this configuration.
    pub fn manager_config(&self) -> ManagerConfig {
        let reconnect = match self.reconnect_backoff {
            BackoffMode::Fixed => {
                ReconnectPolicy::fixed(self.max_reconnect_attempts, self.reconnect_delay_ms)
            }
            BackoffMode::Exponential => ReconnectPolicy::exponential(
                self.max_reconnect_attempts,
                self.reconnect_delay_ms,
                self.reconnect_max_delay_ms,
            ),
        };

        ManagerConfig {
            reconnect,
            address_rules: AddressRules {
                default_country_code: self.default_country_code.clone(),
                local_number_len: self.local_number_len,
            },
            retention_capacity: self.retention_capacity,
            event_buffer: self.event_buffer,
        }
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional<T, F>(key: &'static str, lookup: &mut F) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<T>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_with_default<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    Ok(parse_optional(key, lookup)?.unwrap_or(default))
}

fn parse_bool<F>(key: &'static str, default: bool, lookup: &mut F) -> Result<bool, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "expected true or false".to_owned(),
        }),
    }
}

fn parse_backoff<F>(key: &'static str, lookup: &mut F) -> Result<BackoffMode, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(BackoffMode::Fixed);
    };
    match value.to_ascii_lowercase().as_str() {
        "fixed" => Ok(BackoffMode::Fixed),
        "exponential" => Ok(BackoffMode::Exponential),
        _ => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "expected 'fixed' or 'exponential'".to_owned(),
        }),
    }
}
