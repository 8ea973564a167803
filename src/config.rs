use std::env;
use std::time::Duration;

use crate::error::AppError;
use crate::models::commission::is_valid_rate;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub grpc_port: u16,
    pub log_level: String,
    pub event_buffer_size: usize,
    pub offer_window_secs: u64,
    pub commission_poll_secs: u64,
    pub default_commission_rate: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 3000,
            grpc_port: 50051,
            log_level: "info".to_string(),
            event_buffer_size: 1024,
            offer_window_secs: 300,
            commission_poll_secs: 300,
            default_commission_rate: 0.20,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        let config = Self {
            http_port: parse_or_default("HTTP_PORT", defaults.http_port)?,
            grpc_port: parse_or_default("GRPC_PORT", defaults.grpc_port)?,
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", defaults.event_buffer_size)?,
            offer_window_secs: parse_or_default("OFFER_WINDOW_SECS", defaults.offer_window_secs)?,
            commission_poll_secs: parse_or_default(
                "COMMISSION_POLL_SECS",
                defaults.commission_poll_secs,
            )?,
            default_commission_rate: parse_or_default(
                "DEFAULT_COMMISSION_RATE",
                defaults.default_commission_rate,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.offer_window_secs == 0 {
            return Err(AppError::Internal("OFFER_WINDOW_SECS must be > 0".to_string()));
        }
        if self.commission_poll_secs == 0 {
            return Err(AppError::Internal("COMMISSION_POLL_SECS must be > 0".to_string()));
        }
        if self.event_buffer_size == 0 {
            return Err(AppError::Internal("EVENT_BUFFER_SIZE must be > 0".to_string()));
        }
        if !is_valid_rate(self.default_commission_rate) {
            return Err(AppError::Internal(format!(
                "DEFAULT_COMMISSION_RATE must be in [0, 1), got {}",
                self.default_commission_rate
            )));
        }
        Ok(())
    }

    pub fn offer_window(&self) -> Duration {
        Duration::from_secs(self.offer_window_secs)
    }

    pub fn commission_poll_interval(&self) -> Duration {
        Duration::from_secs(self.commission_poll_secs)
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
