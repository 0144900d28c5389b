//! Configuration types.
//!
//! All configuration is read from the environment at startup. Missing
//! required values are fatal before any traffic is served.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Top-level bot configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Telegram bot API token.
    pub bot_token: SecretString,
    /// Chat id of the operator who receives registration submissions.
    pub operator_chat_id: String,
    /// Path to the local database file.
    pub db_path: PathBuf,
    /// Funnel behavior knobs.
    pub funnel: FunnelConfig,
    /// Reminder scheduler knobs.
    pub reminders: ReminderConfig,
}

impl BotConfig {
    /// Build the configuration from environment variables.
    ///
    /// `FUNNEL_BOT_TOKEN` and `FUNNEL_OPERATOR_CHAT_ID` are required;
    /// everything else has a default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let bot_token = std::env::var("FUNNEL_BOT_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("FUNNEL_BOT_TOKEN".into()))?;
        let operator_chat_id = std::env::var("FUNNEL_OPERATOR_CHAT_ID")
            .map_err(|_| ConfigError::MissingEnvVar("FUNNEL_OPERATOR_CHAT_ID".into()))?;

        let db_path = std::env::var("FUNNEL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/funnel-bot.db"));

        Ok(Self {
            bot_token: SecretString::from(bot_token),
            operator_chat_id,
            db_path,
            funnel: FunnelConfig::from_env()?,
            reminders: ReminderConfig::from_env()?,
        })
    }
}

/// What a returning subject sees when they re-enter the funnel start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturningStartPolicy {
    /// Show the welcome screen again (default).
    #[default]
    Welcome,
    /// Jump straight to the benefits screen.
    Benefits,
}

impl std::str::FromStr for ReturningStartPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "welcome" => Ok(Self::Welcome),
            "benefits" => Ok(Self::Benefits),
            other => Err(format!("unknown policy '{other}' (expected welcome|benefits)")),
        }
    }
}

/// Funnel state machine configuration.
#[derive(Debug, Clone, Default)]
pub struct FunnelConfig {
    /// Start-screen behavior for subjects the funnel has already seen.
    pub returning_start: ReturningStartPolicy,
}

impl FunnelConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let returning_start = match std::env::var("FUNNEL_RETURNING_START") {
            Ok(v) => v
                .parse()
                .map_err(|message| ConfigError::InvalidValue {
                    key: "FUNNEL_RETURNING_START".into(),
                    message,
                })?,
            Err(_) => ReturningStartPolicy::default(),
        };
        Ok(Self { returning_start })
    }
}

/// Reminder scheduler configuration.
#[derive(Debug, Clone)]
pub struct ReminderConfig {
    /// How often the due-reminder sweep runs.
    pub sweep_interval: Duration,
    /// Upper bound on a single reminder send; expiry counts as a failure.
    pub send_timeout: Duration,
    /// Delay between consecutive sends within one sweep (transport flood limit).
    pub pacing_delay: Duration,
    /// Hours after first contact for the first nudge.
    pub first_nudge_hours: i64,
    /// Hours after first contact for the second nudge.
    pub second_nudge_hours: i64,
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            send_timeout: Duration::from_secs(30),
            pacing_delay: Duration::from_secs(1),
            first_nudge_hours: 30,
            second_nudge_hours: 72,
        }
    }
}

impl ReminderConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            sweep_interval: Duration::from_secs(env_u64(
                "FUNNEL_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval.as_secs(),
            )?),
            send_timeout: Duration::from_secs(env_u64(
                "FUNNEL_SEND_TIMEOUT_SECS",
                defaults.send_timeout.as_secs(),
            )?),
            pacing_delay: Duration::from_millis(env_u64(
                "FUNNEL_PACING_DELAY_MS",
                defaults.pacing_delay.as_millis() as u64,
            )?),
            first_nudge_hours: env_u64("FUNNEL_FIRST_NUDGE_HOURS", 30)? as i64,
            second_nudge_hours: env_u64("FUNNEL_SECOND_NUDGE_HOURS", 72)? as i64,
        })
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v.parse().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{e}"),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returning_start_parses() {
        assert_eq!(
            "welcome".parse::<ReturningStartPolicy>().unwrap(),
            ReturningStartPolicy::Welcome
        );
        assert_eq!(
            "benefits".parse::<ReturningStartPolicy>().unwrap(),
            ReturningStartPolicy::Benefits
        );
        assert!("later".parse::<ReturningStartPolicy>().is_err());
    }

    #[test]
    fn reminder_defaults() {
        let config = ReminderConfig::default();
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.pacing_delay, Duration::from_secs(1));
        assert_eq!(config.first_nudge_hours, 30);
        assert_eq!(config.second_nudge_hours, 72);
    }
}
