use crate::error::GacError;
use crate::voting::{DEFAULT_KMEANS_RESTARTS, DEFAULT_SEED};
use std::env;
use std::str::FromStr;

const DEFAULT_DATABASE_URL: &str = "sqlite:gac_scores.db";
const DEFAULT_UPDATE_INTERVAL_SECONDS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookConfig {
    pub url: String,
    pub secret: String,
}

/// Runtime settings, read from the environment (and `.env` via dotenvy).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub database_url: String,
    /// `None` unless both WEBHOOK_URL and WEBHOOK_SECRET are set.
    pub webhook: Option<WebhookConfig>,
    /// Seconds between batches; 0 runs a single batch.
    pub update_interval_seconds: u64,
    pub random_seed: u64,
    pub kmeans_restarts: usize,
    pub dry_run: bool,
    pub poll_id: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            webhook: None,
            update_interval_seconds: DEFAULT_UPDATE_INTERVAL_SECONDS,
            random_seed: DEFAULT_SEED,
            kmeans_restarts: DEFAULT_KMEANS_RESTARTS,
            dry_run: false,
            poll_id: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, GacError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, GacError> {
        // Blank values count as unset
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let webhook = match (get("WEBHOOK_URL"), get("WEBHOOK_SECRET")) {
            (Some(url), Some(secret)) => Some(WebhookConfig { url, secret }),
            (None, None) => None,
            (Some(_), None) => {
                return Err(GacError::Config(
                    "WEBHOOK_URL is set but WEBHOOK_SECRET is missing".to_string(),
                ));
            }
            (None, Some(_)) => {
                return Err(GacError::Config(
                    "WEBHOOK_SECRET is set but WEBHOOK_URL is missing".to_string(),
                ));
            }
        };

        let kmeans_restarts = parse_or(
            "GAC_KMEANS_RESTARTS",
            get("GAC_KMEANS_RESTARTS"),
            defaults.kmeans_restarts,
        )?;
        if kmeans_restarts == 0 {
            return Err(GacError::Config(
                "GAC_KMEANS_RESTARTS must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            database_url: get("DATABASE_URL").unwrap_or(defaults.database_url),
            webhook,
            update_interval_seconds: parse_or(
                "GAC_UPDATE_INTERVAL_SECONDS",
                get("GAC_UPDATE_INTERVAL_SECONDS"),
                defaults.update_interval_seconds,
            )?,
            random_seed: parse_or("GAC_RANDOM_SEED", get("GAC_RANDOM_SEED"), defaults.random_seed)?,
            kmeans_restarts,
            dry_run: match get("GAC_DRY_RUN") {
                Some(raw) => parse_bool("GAC_DRY_RUN", &raw)?,
                None => defaults.dry_run,
            },
            poll_id: get("GAC_POLL_ID"),
        })
    }

    pub fn run_once(&self) -> bool {
        self.update_interval_seconds == 0
    }
}

fn parse_or<T: FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T, GacError>
where
    T::Err: std::fmt::Display,
{
    match raw {
        Some(raw) => raw
            .parse()
            .map_err(|e| GacError::Config(format!("{}={:?}: {}", key, raw, e))),
        None => Ok(default),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, GacError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(GacError::Config(format!("{}={:?} is not a boolean", key, raw))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, GacError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.database_url, "sqlite:gac_scores.db");
        assert_eq!(config.random_seed, 42);
        assert_eq!(config.kmeans_restarts, 3);
        assert!(!config.run_once());
    }

    #[test]
    fn reads_every_setting() {
        let config = config(&[
            ("DATABASE_URL", "sqlite::memory:"),
            ("WEBHOOK_URL", "https://example.test/hook"),
            ("WEBHOOK_SECRET", "s3cret"),
            ("GAC_UPDATE_INTERVAL_SECONDS", "0"),
            ("GAC_RANDOM_SEED", "7"),
            ("GAC_KMEANS_RESTARTS", "5"),
            ("GAC_DRY_RUN", "TRUE"),
            ("GAC_POLL_ID", "poll-1"),
        ])
        .unwrap();
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(
            config.webhook,
            Some(WebhookConfig {
                url: "https://example.test/hook".to_string(),
                secret: "s3cret".to_string(),
            })
        );
        assert!(config.run_once());
        assert_eq!(config.random_seed, 7);
        assert_eq!(config.kmeans_restarts, 5);
        assert!(config.dry_run);
        assert_eq!(config.poll_id.as_deref(), Some("poll-1"));
    }

    #[test]
    fn half_configured_webhook_is_rejected() {
        assert!(matches!(
            config(&[("WEBHOOK_URL", "https://example.test/hook")]),
            Err(GacError::Config(_))
        ));
        assert!(config(&[("WEBHOOK_SECRET", "s3cret")]).is_err());
    }

    #[test]
    fn malformed_numbers_and_flags_are_rejected() {
        assert!(config(&[("GAC_RANDOM_SEED", "forty-two")]).is_err());
        assert!(config(&[("GAC_UPDATE_INTERVAL_SECONDS", "-1")]).is_err());
        assert!(config(&[("GAC_KMEANS_RESTARTS", "0")]).is_err());
        assert!(config(&[("GAC_DRY_RUN", "maybe")]).is_err());
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = config(&[("GAC_POLL_ID", "  "), ("DATABASE_URL", "")]).unwrap();
        assert_eq!(config.poll_id, None);
        assert_eq!(config.database_url, "sqlite:gac_scores.db");
    }
}
