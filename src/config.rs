//! Runtime configuration from environment variables
//!
//! Device-side settings (servers, credentials, schedule, retention). The
//! risk scoring parameters come from the server instead, see
//! `risk::config::RiskConfig`.

use crate::engine::EngineTimeouts;
use crate::network::KeyServerType;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Connection settings for the main, key and publish servers
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Main app server (settings, metrics, callback). `None` until onboarding
    pub server_url: Option<String>,
    pub key_server_url: Option<String>,
    pub key_server_type: KeyServerType,
    pub publish_server_url: Option<String>,
    pub auth_token: Option<String>,
    pub refresh_token: Option<String>,
    pub app_version: String,
    pub request_timeout: Duration,
}

impl ServerSettings {
    /// Whether enough is configured to run a check at all
    pub fn is_configured(&self) -> bool {
        self.server_url.as_deref().map_or(false, |u| !u.is_empty()) && self.auth_token.is_some()
    }
}

/// Configuration for the exposure check runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Path to SQLite database file
    pub db_path: String,

    pub server: ServerSettings,

    /// Phone number for the callback request, if the user asked for one
    pub callback_number: Option<String>,

    /// Only post metrics when the user opted in
    pub analytics_opt_in: bool,

    /// Minutes between periodic checks
    pub check_frequency_minutes: u64,

    /// Upper bound of the random delay before the first periodic check
    pub scheduler_jitter: Duration,

    /// Exposures and tokens older than this are deleted
    pub store_exposures_for_days: i64,

    /// Directory for downloaded key files
    pub key_file_dir: PathBuf,

    pub engine_timeouts: EngineTimeouts,

    /// Recorded engine results used when no platform engine is present
    pub engine_fixture_path: Option<PathBuf>,
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

impl RuntimeConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `EXPOSURE_DB_PATH` (default: exposure_check.db)
    /// - `SERVER_URL`, `KEY_SERVER_URL`, `PUBLISH_SERVER_URL` (default: unset)
    /// - `KEY_SERVER_TYPE` (default: nearform)
    /// - `AUTH_TOKEN`, `REFRESH_TOKEN`, `CALLBACK_NUMBER` (default: unset)
    /// - `ANALYTICS_OPTIN` (default: false)
    /// - `APP_VERSION` (default: crate version)
    /// - `EXPOSURE_CHECK_FREQUENCY_MINUTES` (default: 120)
    /// - `SCHEDULER_JITTER_SECS` (default: 30)
    /// - `STORE_EXPOSURES_FOR_DAYS` (default: 14)
    /// - `KEY_FILE_DIR` (default: system temp dir)
    /// - `API_TIMEOUT_SECS` (default: 10), `DEFAULT_TIMEOUT_SECS` (default: 15)
    /// - `ENGINE_FIXTURE_PATH` (default: unset)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_timeout = Duration::from_secs(parse_or(lookup("API_TIMEOUT_SECS"), 10));
        let default_timeout = Duration::from_secs(parse_or(lookup("DEFAULT_TIMEOUT_SECS"), 15));

        let key_server_type = match lookup("KEY_SERVER_TYPE") {
            Some(value) => value.parse().unwrap_or_else(|e| {
                log::warn!("⚠️  {}, falling back to nearform", e);
                KeyServerType::NearForm
            }),
            None => KeyServerType::NearForm,
        };

        let server = ServerSettings {
            server_url: non_empty(lookup("SERVER_URL")),
            key_server_url: non_empty(lookup("KEY_SERVER_URL")),
            key_server_type,
            publish_server_url: non_empty(lookup("PUBLISH_SERVER_URL")),
            auth_token: non_empty(lookup("AUTH_TOKEN")),
            refresh_token: non_empty(lookup("REFRESH_TOKEN")),
            app_version: lookup("APP_VERSION")
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            request_timeout: api_timeout,
        };

        Self {
            db_path: lookup("EXPOSURE_DB_PATH").unwrap_or_else(|| "exposure_check.db".to_string()),

            server,

            callback_number: non_empty(lookup("CALLBACK_NUMBER")),

            analytics_opt_in: parse_or(lookup("ANALYTICS_OPTIN"), false),

            check_frequency_minutes: parse_or(lookup("EXPOSURE_CHECK_FREQUENCY_MINUTES"), 120),

            scheduler_jitter: Duration::from_secs(parse_or(lookup("SCHEDULER_JITTER_SECS"), 30)),

            store_exposures_for_days: parse_or(lookup("STORE_EXPOSURES_FOR_DAYS"), 14),

            key_file_dir: lookup("KEY_FILE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(env::temp_dir),

            engine_timeouts: EngineTimeouts {
                api: api_timeout,
                default: default_timeout,
            },

            engine_fixture_path: non_empty(lookup("ENGINE_FIXTURE_PATH")).map(PathBuf::from),
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_frequency_minutes.max(1) * 60)
    }
}
