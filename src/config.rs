use std::env;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tracing::Level;

use crate::server::{CycleTiming, IdPolicy, RegistrySettings};

pub const DEFAULT_PORT: u32 = 1101;

#[derive(Debug, Parser)]
#[command(name = "seastar", version)]
#[command(about = "Multi-client TCP server announcing connection identifiers", long_about = None)]
pub struct Cli {
    /// Listening port (1-65535)
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u32,

    /// Log informational messages
    #[arg(short, long)]
    pub verbose: bool,

    /// Colorize log output
    #[arg(short, long)]
    pub colors: bool,

    /// Print the splash screen at startup
    #[arg(short, long)]
    pub splash: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub log_level: Level,
    pub colors: bool,
    pub splash: bool,
    pub shutdown_timeout: Duration,
    pub registry: RegistrySettings,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("port {0} is out of range (1-65535)")]
    PortOutOfRange(u32),
    #[error("invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },
}

impl AppConfig {
    /// Combines command line flags with `SEASTAR_*` environment knobs.
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let default_level = if cli.verbose { Level::INFO } else { Level::WARN };

        Ok(Self {
            port: validate_port(cli.port)?,
            log_level: log_level_from_env("SEASTAR_LOG_LEVEL", default_level)?,
            colors: cli.colors,
            splash: cli.splash,
            shutdown_timeout: duration_from_env("SEASTAR_SHUTDOWN_TIMEOUT_SECS", 5)?,
            registry: RegistrySettings {
                timing: CycleTiming {
                    period: Duration::from_millis(positive_from_env("SEASTAR_CYCLE_MS", 1000)?),
                    slices: positive_from_env("SEASTAR_SLICES", 20)?,
                },
                id_policy: id_policy_from_env("SEASTAR_ID_POLICY")?,
            },
        })
    }
}

pub fn validate_port(raw: u32) -> Result<u16, ConfigError> {
    match u16::try_from(raw) {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(ConfigError::PortOutOfRange(raw)),
    }
}

fn duration_from_env(var: &'static str, default_secs: u64) -> Result<Duration, ConfigError> {
    number_from_env(var, default_secs).map(Duration::from_secs)
}

fn number_from_env<T>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
{
    parsed_from_env(var, default, false)
}

/// Like [`number_from_env`], but zero is rejected.
fn positive_from_env<T>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
{
    parsed_from_env(var, default, true)
}

fn parsed_from_env<T>(var: &'static str, default: T, positive: bool) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
{
    match env::var(var) {
        Ok(raw) => parse_number(&raw, positive).ok_or(ConfigError::InvalidEnv { var, value: raw }),
        Err(_) => Ok(default),
    }
}

fn parse_number<T>(raw: &str, positive: bool) -> Option<T>
where
    T: FromStr + PartialOrd + Default,
{
    raw.trim()
        .parse::<T>()
        .ok()
        .filter(|value| !positive || *value > T::default())
}

fn log_level_from_env(var: &'static str, default: Level) -> Result<Level, ConfigError> {
    match env::var(var) {
        Ok(raw) => parse_level(&raw).ok_or(ConfigError::InvalidEnv { var, value: raw }),
        Err(_) => Ok(default),
    }
}

fn id_policy_from_env(var: &'static str) -> Result<IdPolicy, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw
            .parse()
            .map_err(|()| ConfigError::InvalidEnv { var, value: raw }),
        Err(_) => Ok(IdPolicy::default()),
    }
}

fn parse_level(raw: &str) -> Option<Level> {
    match raw.to_ascii_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}
