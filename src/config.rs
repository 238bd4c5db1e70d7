use anyhow::{Context, Result};

pub const DEFAULT_SOURCE_BASE_URL: &str = "https://ws.audioscrobbler.com/2.0/";

/// Runtime settings, read from the environment (a `.env` file is honored by
/// the CLI via dotenvy before this runs).
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub source_api_key: String,
    pub source_base_url: String,
    /// How many days of play events survive a sync.
    pub play_retention_days: i64,
    /// Global fallback when a guild has no minimum-playcount override.
    pub default_plays_for_crown: i64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgresql://localhost/crownboard".to_string());
        let source_api_key =
            std::env::var("SOURCE_API_KEY").context("SOURCE_API_KEY is not set")?;
        let source_base_url = std::env::var("SOURCE_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_SOURCE_BASE_URL.to_string());
        let play_retention_days = std::env::var("PLAY_RETENTION_DAYS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(46);
        let default_plays_for_crown = std::env::var("DEFAULT_PLAYS_FOR_CROWN")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        Ok(Self {
            database_url,
            source_api_key,
            source_base_url,
            play_retention_days,
            default_plays_for_crown,
        })
    }
}
