use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::models::{FeePolicy, FeeRounding};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub env: String,
    pub host: String,
    pub port: u16,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub max_viewers_per_session: usize,
    pub heartbeat_interval: Duration,
    pub outbound_queue_capacity: usize,
    pub chat_max_body_chars: usize,
    pub chat_history_limit: usize,
    /// How long an ended session stays in memory before reads go to the store
    pub ended_session_retention: Duration,
}

#[derive(Debug, Clone)]
pub struct DonationConfig {
    pub fee: FeePolicy,
    pub min_amount: i64,
    pub max_amount: i64,
}

/// One rung of the output ladder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendition {
    pub name: &'static str,
    pub height: u32,
    pub bitrate_kbps: u32,
}

pub const DEFAULT_LADDER: [Rendition; 3] = [
    Rendition { name: "720p", height: 720, bitrate_kbps: 3000 },
    Rendition { name: "480p", height: 480, bitrate_kbps: 1500 },
    Rendition { name: "360p", height: 360, bitrate_kbps: 800 },
];

#[derive(Debug, Clone)]
pub struct TranscodeConfig {
    pub ready_timeout: Duration,
    pub stop_timeout: Duration,
    pub ingest_base_url: String,
    pub output_dir: String,
    pub playback_base_url: String,
    pub ffmpeg_bin: String,
    pub ladder: Vec<Rendition>,
}

#[derive(Debug, Clone)]
pub struct ExternalServicesConfig {
    pub subscription_service_url: Option<String>,
    pub payment_service_url: Option<String>,
    pub notification_service_url: Option<String>,
    pub timeout: Duration,
    pub retry_backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub connection_token_secret: String,
    pub connection_token_ttl_secs: i64,
    pub admin_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub app: AppConfig,
    pub limits: SessionLimits,
    pub donations: DonationConfig,
    pub transcode: TranscodeConfig,
    pub external: ExternalServicesConfig,
    pub security: SecurityConfig,
    pub database: DatabaseConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; `from_env` wraps this around the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let log_format = match get("LOG_FORMAT").as_deref() {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => return Err(invalid("LOG_FORMAT", other, "expected text or json")),
        };

        let app = AppConfig {
            env: get("APP_ENV").unwrap_or_else(|| "development".to_string()),
            host: get("LIVE_SESSION_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or(&get, "LIVE_SESSION_PORT", 8090)?,
            log_format,
        };

        let limits = SessionLimits {
            max_viewers_per_session: parse_or(&get, "MAX_VIEWERS_PER_SESSION", 5000)?,
            heartbeat_interval: Duration::from_secs(parse_or(&get, "HEARTBEAT_INTERVAL_SECS", 30)?),
            outbound_queue_capacity: parse_or(&get, "OUTBOUND_QUEUE_CAPACITY", 256)?,
            chat_max_body_chars: parse_or(&get, "CHAT_MAX_BODY_CHARS", 500)?,
            chat_history_limit: parse_or(&get, "CHAT_HISTORY_LIMIT", 1000)?,
            ended_session_retention: Duration::from_secs(parse_or(
                &get,
                "ENDED_SESSION_RETENTION_SECS",
                60,
            )?),
        };
        if limits.outbound_queue_capacity == 0 {
            return Err(invalid("OUTBOUND_QUEUE_CAPACITY", "0", "must be positive"));
        }
        if limits.heartbeat_interval.is_zero() {
            return Err(invalid("HEARTBEAT_INTERVAL_SECS", "0", "must be positive"));
        }

        let rounding = match get("DONATION_FEE_ROUNDING").as_deref() {
            None | Some("floor") => FeeRounding::Floor,
            Some("half_up") => FeeRounding::HalfUp,
            Some(other) => {
                return Err(invalid("DONATION_FEE_ROUNDING", other, "expected floor or half_up"))
            }
        };
        let rate_bps: u32 = parse_or(&get, "DONATION_FEE_BPS", 1000)?;
        if rate_bps > 10_000 {
            return Err(invalid("DONATION_FEE_BPS", &rate_bps.to_string(), "must be <= 10000"));
        }
        let donations = DonationConfig {
            fee: FeePolicy::new(rate_bps, rounding),
            min_amount: parse_or(&get, "DONATION_MIN_AMOUNT", 100)?,
            max_amount: parse_or(&get, "DONATION_MAX_AMOUNT", 1_000_000)?,
        };
        if donations.min_amount <= 0 || donations.min_amount > donations.max_amount {
            return Err(invalid(
                "DONATION_MIN_AMOUNT",
                &donations.min_amount.to_string(),
                "must be positive and not above DONATION_MAX_AMOUNT",
            ));
        }

        let transcode = TranscodeConfig {
            ready_timeout: Duration::from_secs(parse_or(&get, "TRANSCODE_READY_TIMEOUT_SECS", 20)?),
            stop_timeout: Duration::from_secs(parse_or(&get, "TRANSCODE_STOP_TIMEOUT_SECS", 30)?),
            ingest_base_url: get("TRANSCODE_INGEST_BASE_URL")
                .unwrap_or_else(|| "rtmp://127.0.0.1:1935/live".to_string()),
            output_dir: get("TRANSCODE_OUTPUT_DIR").unwrap_or_else(|| "/tmp/live-sessions".to_string()),
            playback_base_url: get("PLAYBACK_BASE_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8090/hls".to_string()),
            ffmpeg_bin: get("FFMPEG_BIN").unwrap_or_else(|| "ffmpeg".to_string()),
            ladder: DEFAULT_LADDER.to_vec(),
        };

        let external = ExternalServicesConfig {
            subscription_service_url: get("SUBSCRIPTION_SERVICE_URL"),
            payment_service_url: get("PAYMENT_SERVICE_URL"),
            notification_service_url: get("NOTIFICATION_SERVICE_URL"),
            timeout: Duration::from_millis(parse_or(&get, "EXTERNAL_TIMEOUT_MS", 3000)?),
            retry_backoff: Duration::from_millis(parse_or(&get, "RETRY_BACKOFF_MS", 200)?),
        };

        let connection_token_secret = match get("CONNECTION_TOKEN_SECRET") {
            Some(secret) => secret,
            None if app.env == "development" || app.env == "test" => {
                "dev-connection-secret-change-me".to_string()
            }
            None => {
                return Err(invalid(
                    "CONNECTION_TOKEN_SECRET",
                    "",
                    "required outside development",
                ))
            }
        };
        let security = SecurityConfig {
            connection_token_secret,
            connection_token_ttl_secs: parse_or(&get, "CONNECTION_TOKEN_TTL_SECS", 60)?,
            admin_token: get("ADMIN_TOKEN"),
        };

        let database = DatabaseConfig {
            url: get("DATABASE_URL"),
            max_connections: parse_or(&get, "DATABASE_MAX_CONNECTIONS", 10)?,
        };

        Ok(Config {
            app,
            limits,
            donations,
            transcode,
            external,
            security,
            database,
        })
    }

    pub fn is_production(&self) -> bool {
        self.app.env == "production"
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, &raw, &e.to_string())),
    }
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
