//! Environment-driven settings.

use std::env;
use std::path::PathBuf;

/// Runtime settings, loaded once at startup. Every knob has a default so a
/// bare environment still produces a runnable (if offline) process.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_path: PathBuf,
    pub blob_root: PathBuf,
    pub fetch_base_url: String,
    pub fetch_api_key: Option<String>,
    pub fetch_timeout_secs: u64,
    pub followup_timeout_secs: u64,
    pub max_attempts: usize,
    pub max_concurrency: usize,
    pub rpm_limit: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            database_path: PathBuf::from("data/vinintel.db"),
            blob_root: PathBuf::from("data/raw_blobs"),
            fetch_base_url: "https://api.firecrawl.dev".to_string(),
            fetch_api_key: None,
            fetch_timeout_secs: 25,
            followup_timeout_secs: 30,
            max_attempts: 2,
            max_concurrency: 50,
            rpm_limit: 500,
        }
    }
}

impl Settings {
    pub fn from_env() -> Settings {
        let defaults = Settings::default();
        Settings {
            database_path: env::var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            blob_root: env::var("BLOB_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.blob_root),
            fetch_base_url: env::var("FIRECRAWL_BASE_URL").unwrap_or(defaults.fetch_base_url),
            fetch_api_key: env::var("FIRECRAWL_API_KEY").ok().filter(|k| !k.is_empty()),
            fetch_timeout_secs: env_parse("FETCH_TIMEOUT_SECS", defaults.fetch_timeout_secs),
            followup_timeout_secs: env_parse(
                "FOLLOWUP_TIMEOUT_SECS",
                defaults.followup_timeout_secs,
            ),
            max_attempts: env_parse("SCRAPE_MAX_ATTEMPTS", defaults.max_attempts).max(1),
            // Concurrency below 5 starves wide jobs; clamp like the scheduler expects.
            max_concurrency: env_parse("SCRAPE_MAX_CONCURRENCY", defaults.max_concurrency).max(5),
            rpm_limit: env_parse("SCRAPE_RPM_LIMIT", defaults.rpm_limit).max(1),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
