use anyhow::{bail, Context, Result};

use crate::analysis::parse::ResultFormat;

pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash-preview-05-20";
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;
pub const DEFAULT_SESSION_IDLE_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_MAX_SESSIONS: usize = 10_000;

/// Application configuration loaded from environment variables.
/// Everything except the port has a usable default so a bare `cargo run` starts
/// with an in-memory report store.
#[derive(Debug, Clone)]
pub struct Config {
    /// May be empty when the deployment injects the key upstream.
    pub gemini_api_key: String,
    pub gemini_api_base: String,
    pub gemini_model: String,
    pub result_format: ResultFormat,
    pub analysis_max_attempts: u32,
    pub analysis_base_delay_ms: u64,
    pub max_upload_bytes: usize,
    pub app_id: String,
    pub reports_collection: String,
    /// `None` selects the in-memory report store.
    pub database_url: Option<String>,
    pub identity_verify_url: Option<String>,
    /// Sessions unused for this long are forgotten and get 401.
    pub session_idle_ttl_secs: u64,
    /// Upper bound on live sessions; the least recently used is evicted.
    pub max_sessions: usize,
    pub port: u16,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup. `from_env` is the only
    /// production caller; tests pass a closure over a fixed map.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let or_default = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());

        let result_format = var("RESULT_FORMAT")
            .map(|v| v.parse::<ResultFormat>())
            .transpose()
            .context("RESULT_FORMAT must be 'freeform' or 'structured'")?
            .unwrap_or_default();

        let analysis_max_attempts = parse_or("ANALYSIS_MAX_ATTEMPTS", var("ANALYSIS_MAX_ATTEMPTS"), 3)?;
        if analysis_max_attempts == 0 {
            bail!("ANALYSIS_MAX_ATTEMPTS must be at least 1");
        }

        let session_idle_ttl_secs = parse_or(
            "SESSION_IDLE_TTL_SECS",
            var("SESSION_IDLE_TTL_SECS"),
            DEFAULT_SESSION_IDLE_TTL_SECS,
        )?;
        let max_sessions = parse_or("MAX_SESSIONS", var("MAX_SESSIONS"), DEFAULT_MAX_SESSIONS)?;
        if session_idle_ttl_secs == 0 || max_sessions == 0 {
            bail!("SESSION_IDLE_TTL_SECS and MAX_SESSIONS must be at least 1");
        }

        let config = Config {
            gemini_api_key: lookup("GEMINI_API_KEY").unwrap_or_default(),
            gemini_api_base: or_default("GEMINI_API_BASE", DEFAULT_GEMINI_API_BASE)
                .trim_end_matches('/')
                .to_string(),
            gemini_model: or_default("GEMINI_MODEL", DEFAULT_GEMINI_MODEL),
            result_format,
            analysis_max_attempts,
            analysis_base_delay_ms: parse_or(
                "ANALYSIS_BASE_DELAY_MS",
                var("ANALYSIS_BASE_DELAY_MS"),
                1000,
            )?,
            max_upload_bytes: parse_or(
                "MAX_UPLOAD_BYTES",
                var("MAX_UPLOAD_BYTES"),
                DEFAULT_MAX_UPLOAD_BYTES,
            )?,
            app_id: or_default("APP_ID", "default-app-id"),
            reports_collection: or_default("REPORTS_COLLECTION", "retina_reports"),
            database_url: var("DATABASE_URL"),
            identity_verify_url: var("IDENTITY_VERIFY_URL"),
            session_idle_ttl_secs,
            max_sessions,
            port: parse_or("PORT", var("PORT"), 8080)?,
            rust_log: or_default("RUST_LOG", "info"),
        };
        config
            .generate_content_url()
            .context("GEMINI_API_BASE and GEMINI_MODEL must form a valid URL")?;

        Ok(config)
    }

    /// Full `generateContent` URL for the configured model. The key goes in the
    /// query string, percent-encoded, empty or not.
    pub fn generate_content_url(&self) -> Result<String> {
        let endpoint = format!(
            "{}/v1beta/models/{}:generateContent",
            self.gemini_api_base, self.gemini_model
        );
        let url = reqwest::Url::parse_with_params(&endpoint, &[("key", &self.gemini_api_key)])?;
        Ok(url.into())
    }
}

fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match raw {
        Some(v) => v
            .trim()
            .parse::<T>()
            .with_context(|| format!("Environment variable '{key}' has an invalid value '{v}'")),
        None => Ok(default),
    }
}
