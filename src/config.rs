use std::path::PathBuf;
use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

use crate::bounds::GeoBounds;

const DEFAULT_JOURNAL_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_JOURNAL_MAX_FILES: usize = 5;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub database_file_name: String,
    pub geocoder_endpoint: String,
    pub geocoder_user_agent: String,
    pub geocoder_api_key: Option<SecretString>,
    pub country_code: String,
    pub country_name: String,
    pub home_region: String,
    pub home_region_name: String,
    pub request_timeout_secs: u64,
    pub rate_limit_qps: u32,
    pub inter_call_delay_ms: u64,
    pub rate_limit_cooldown_ms: u64,
    pub batch_size: usize,
    pub queue_interval_secs: u64,
    pub cache_ttl_days: i64,
    pub bounds: GeoBounds,
    pub journal_enabled: bool,
    pub journal_batch_size: usize,
    pub journal_max_bytes: u64,
    pub journal_max_files: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub data_dir: String,
    pub database_file_name: String,
    pub geocoder_endpoint: String,
    pub country_code: String,
    pub home_region: String,
    pub rate_limit_qps: u32,
    pub inter_call_delay_ms: u64,
    pub batch_size: usize,
    pub queue_interval_secs: u64,
    pub cache_ttl_days: i64,
    pub bounds: GeoBounds,
    pub journal_enabled: bool,
    pub has_geocoder_api_key: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            database_file_name: "property-geocoder.db".to_string(),
            geocoder_endpoint: "https://nominatim.openstreetmap.org".to_string(),
            geocoder_user_agent: concat!("property-geocoder/", env!("CARGO_PKG_VERSION"))
                .to_string(),
            geocoder_api_key: None,
            country_code: "us".to_string(),
            country_name: "USA".to_string(),
            home_region: "MA".to_string(),
            home_region_name: "Massachusetts".to_string(),
            request_timeout_secs: 20,
            rate_limit_qps: 1,
            inter_call_delay_ms: 1_500,
            rate_limit_cooldown_ms: 2_000,
            batch_size: 5,
            queue_interval_secs: 15,
            cache_ttl_days: 30,
            bounds: GeoBounds::new(41.0, 43.0, -73.8, -69.5),
            journal_enabled: true,
            journal_batch_size: 10,
            journal_max_bytes: DEFAULT_JOURNAL_MAX_BYTES,
            journal_max_files: DEFAULT_JOURNAL_MAX_FILES,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let defaults = Self::default();
        Self {
            data_dir: env::var("GEOCODER_DATA_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            database_file_name: parse_string("DATABASE_FILE_NAME", defaults.database_file_name),
            geocoder_endpoint: parse_string("GEOCODER_ENDPOINT", defaults.geocoder_endpoint),
            geocoder_user_agent: parse_string("GEOCODER_USER_AGENT", defaults.geocoder_user_agent),
            geocoder_api_key: env::var("GEOCODER_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            country_code: parse_string("GEOCODER_COUNTRY_CODE", defaults.country_code)
                .to_ascii_lowercase(),
            country_name: parse_string("GEOCODER_COUNTRY_NAME", defaults.country_name),
            home_region: parse_string("GEOCODER_HOME_REGION", defaults.home_region),
            home_region_name: parse_string("GEOCODER_HOME_REGION_NAME", defaults.home_region_name),
            request_timeout_secs: parse_u64("GEOCODER_TIMEOUT_SECS", defaults.request_timeout_secs)
                .max(1),
            rate_limit_qps: parse_u32("GEOCODER_RATE_LIMIT_QPS", defaults.rate_limit_qps).max(1),
            inter_call_delay_ms: parse_u64(
                "GEOCODER_INTER_CALL_DELAY_MS",
                defaults.inter_call_delay_ms,
            ),
            rate_limit_cooldown_ms: parse_u64(
                "GEOCODER_RATE_LIMIT_COOLDOWN_MS",
                defaults.rate_limit_cooldown_ms,
            ),
            batch_size: parse_usize("GEOCODER_BATCH_SIZE", defaults.batch_size).max(1),
            queue_interval_secs: parse_u64(
                "GEOCODER_QUEUE_INTERVAL_SECS",
                defaults.queue_interval_secs,
            ),
            cache_ttl_days: parse_i64("GEOCODER_CACHE_TTL_DAYS", defaults.cache_ttl_days).max(0),
            bounds: GeoBounds::new(
                parse_f64("GEOCODER_BOUNDS_MIN_LAT", defaults.bounds.min_lat),
                parse_f64("GEOCODER_BOUNDS_MAX_LAT", defaults.bounds.max_lat),
                parse_f64("GEOCODER_BOUNDS_MIN_LNG", defaults.bounds.min_lng),
                parse_f64("GEOCODER_BOUNDS_MAX_LNG", defaults.bounds.max_lng),
            ),
            journal_enabled: parse_bool("JOURNAL_ENABLED", defaults.journal_enabled),
            journal_batch_size: parse_usize("JOURNAL_BATCH_SIZE", defaults.journal_batch_size)
                .max(1),
            journal_max_bytes: parse_u64("JOURNAL_MAX_BYTES", defaults.journal_max_bytes),
            journal_max_files: parse_usize("JOURNAL_MAX_FILES", defaults.journal_max_files).max(1),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn inter_call_delay(&self) -> Duration {
        Duration::from_millis(self.inter_call_delay_ms)
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_millis(self.rate_limit_cooldown_ms)
    }

    pub fn queue_interval(&self) -> Duration {
        Duration::from_secs(self.queue_interval_secs)
    }

    pub fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(self.cache_ttl_days)
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            data_dir: self.data_dir.to_string_lossy().to_string(),
            database_file_name: self.database_file_name.clone(),
            geocoder_endpoint: self.geocoder_endpoint.clone(),
            country_code: self.country_code.clone(),
            home_region: self.home_region.clone(),
            rate_limit_qps: self.rate_limit_qps,
            inter_call_delay_ms: self.inter_call_delay_ms,
            batch_size: self.batch_size,
            queue_interval_secs: self.queue_interval_secs,
            cache_ttl_days: self.cache_ttl_days,
            bounds: self.bounds,
            journal_enabled: self.journal_enabled,
            has_geocoder_api_key: self.geocoder_api_key.is_some(),
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

fn parse_string(key: &str, default: String) -> String {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or(default)
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

fn parse_i64(key: &str, default: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
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
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_public_profile_without_secrets() {
        env::set_var("GEOCODER_API_KEY", "secret");
        env::set_var("DATABASE_FILE_NAME", "custom.db");
        env::set_var("GEOCODER_COUNTRY_CODE", "US");
        env::set_var("GEOCODER_BATCH_SIZE", "0");
        env::set_var("GEOCODER_BOUNDS_MIN_LAT", "not-a-number");
        env::set_var("JOURNAL_ENABLED", "false");

        let config = AppConfig::from_env();
        let public = config.public_profile();

        assert_eq!(public.database_file_name, "custom.db");
        assert_eq!(public.country_code, "us");
        assert_eq!(public.batch_size, 1);
        assert!(!public.journal_enabled);
        assert!(public.has_geocoder_api_key);
        assert!(config.geocoder_api_key.is_some());
        assert_eq!(public.bounds.min_lat, 41.0);
        assert_eq!(config.journal_max_files, DEFAULT_JOURNAL_MAX_FILES);
    }

    #[test]
    fn defaults_match_reference_pacing() {
        let config = AppConfig::default();
        assert_eq!(config.request_timeout(), Duration::from_secs(20));
        assert_eq!(config.inter_call_delay(), Duration::from_millis(1_500));
        assert_eq!(config.rate_limit_cooldown(), Duration::from_secs(2));
        assert_eq!(config.queue_interval(), Duration::from_secs(15));
        assert_eq!(config.cache_ttl(), chrono::Duration::days(30));
        assert_eq!(config.batch_size, 5);
    }
}
