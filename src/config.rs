use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

use crate::backoff::BackoffPolicy;

const DEFAULT_AUDIT_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_AUDIT_KEEP_FILES: usize = 4;
const DEFAULT_PLACES_API_BASE: &str = "https://maps.googleapis.com/maps/api/place";
const DEFAULT_TIMEZONE_API_BASE: &str = "https://maps.googleapis.com/maps/api/timezone";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub places_api_key: Option<SecretString>,
    pub places_api_base: String,
    pub timezone_api_base: String,
    pub rate_limit_max_requests: u32,
    pub rate_limit_window_ms: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_factor: f64,
    pub detail_delay_ms: u64,
    pub max_hydrated_places: usize,
    pub http_timeout_secs: u64,
    pub item_delay_ms: u64,
    pub database_file_name: String,
    pub audit_enabled: bool,
    pub audit_max_bytes: u64,
    pub audit_keep_files: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub places_api_base: String,
    pub timezone_api_base: String,
    pub rate_limit_max_requests: u32,
    pub rate_limit_window_ms: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_factor: f64,
    pub detail_delay_ms: u64,
    pub max_hydrated_places: usize,
    pub item_delay_ms: u64,
    pub database_file_name: String,
    pub audit_enabled: bool,
    pub has_places_api_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            places_api_key: env::var("PLACES_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            places_api_base: parse_string("PLACES_API_BASE", DEFAULT_PLACES_API_BASE),
            timezone_api_base: parse_string("TIMEZONE_API_BASE", DEFAULT_TIMEZONE_API_BASE),
            rate_limit_max_requests: parse_u32("PLACES_RATE_LIMIT_MAX_REQUESTS", 10),
            rate_limit_window_ms: parse_u64("PLACES_RATE_LIMIT_WINDOW_MS", 1_000),
            max_retries: parse_u32("PLACES_MAX_RETRIES", 3),
            backoff_base_ms: parse_u64("PLACES_BACKOFF_BASE_MS", 500),
            backoff_max_ms: parse_u64("PLACES_BACKOFF_MAX_MS", 10_000),
            backoff_factor: parse_f64("PLACES_BACKOFF_FACTOR", 2.0),
            detail_delay_ms: parse_u64("PLACES_DETAIL_DELAY_MS", 200),
            max_hydrated_places: parse_usize("PLACES_MAX_HYDRATED", 5),
            http_timeout_secs: parse_u64("PLACES_HTTP_TIMEOUT_SECS", 10).max(1),
            item_delay_ms: parse_u64("INGEST_ITEM_DELAY_MS", 100),
            database_file_name: parse_string("DATABASE_FILE_NAME", "venues.db"),
            audit_enabled: parse_bool("AUDIT_ENABLED", true),
            audit_max_bytes: parse_u64("AUDIT_MAX_BYTES", DEFAULT_AUDIT_MAX_BYTES).max(1),
            audit_keep_files: parse_usize("AUDIT_KEEP_FILES", DEFAULT_AUDIT_KEEP_FILES),
        }
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
            max_retries: self.max_retries,
            factor: self.backoff_factor,
            ..BackoffPolicy::default()
        }
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }

    pub fn item_delay(&self) -> Duration {
        Duration::from_millis(self.item_delay_ms)
    }

    pub fn detail_delay(&self) -> Duration {
        Duration::from_millis(self.detail_delay_ms)
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            places_api_base: self.places_api_base.clone(),
            timezone_api_base: self.timezone_api_base.clone(),
            rate_limit_max_requests: self.rate_limit_max_requests,
            rate_limit_window_ms: self.rate_limit_window_ms,
            max_retries: self.max_retries,
            backoff_base_ms: self.backoff_base_ms,
            backoff_max_ms: self.backoff_max_ms,
            backoff_factor: self.backoff_factor,
            detail_delay_ms: self.detail_delay_ms,
            max_hydrated_places: self.max_hydrated_places,
            item_delay_ms: self.item_delay_ms,
            database_file_name: self.database_file_name.clone(),
            audit_enabled: self.audit_enabled,
            has_places_api_key: self.places_api_key.is_some(),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn parse_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 1.0)
        .unwrap_or(default)
}

#[cfg(test)]
pub(crate) fn test_config() -> AppConfig {
    AppConfig {
        places_api_key: None,
        places_api_base: DEFAULT_PLACES_API_BASE.into(),
        timezone_api_base: DEFAULT_TIMEZONE_API_BASE.into(),
        rate_limit_max_requests: 100,
        rate_limit_window_ms: 1_000,
        max_retries: 2,
        backoff_base_ms: 10,
        backoff_max_ms: 100,
        backoff_factor: 2.0,
        detail_delay_ms: 0,
        max_hydrated_places: 5,
        http_timeout_secs: 5,
        item_delay_ms: 0,
        database_file_name: "test.db".into(),
        audit_enabled: true,
        audit_max_bytes: 1024 * 1024,
        audit_keep_files: 3,
    }
}
