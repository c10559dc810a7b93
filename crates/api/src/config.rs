//! Configuration loaded from environment variables

use thiserror::Error;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";
const DEFAULT_JWT_EXPIRY_HOURS: i64 = 24;
const DEV_JWT_SECRET: &str = "thinkink-development-secret-do-not-use-in-production";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub environment: String,
    pub jwt_secret: String,
    pub jwt_expiry_hours: i64,
    pub allowed_origins: Vec<String>,
    pub enable_billing: bool,
    pub log_format: LogFormat,
    pub skip_migrations: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("environment", &self.environment)
            .field("jwt_secret", &"[redacted]")
            .field("jwt_expiry_hours", &self.jwt_expiry_hours)
            .field("allowed_origins", &self.allowed_origins)
            .field("enable_billing", &self.enable_billing)
            .field("log_format", &self.log_format)
            .field("skip_migrations", &self.skip_migrations)
            .finish_non_exhaustive()
    }
}

fn parse_bool(value: Option<String>, default: bool) -> bool {
    match value.as_deref().map(str::trim) {
        Some("true") | Some("1") | Some("yes") => true,
        Some("false") | Some("0") | Some("no") => false,
        _ => default,
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (the process environment in production)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let environment = get("ENVIRONMENT").unwrap_or_else(|| "production".to_string());
        let is_development = environment == "development";

        let jwt_secret = match get("JWT_SECRET") {
            Some(secret) => secret,
            None if is_development => {
                tracing::warn!("JWT_SECRET not set, using development secret");
                DEV_JWT_SECRET.to_string()
            }
            None => return Err(ConfigError::Missing("JWT_SECRET")),
        };

        let jwt_expiry_hours = match get("JWT_EXPIRY_HOURS") {
            Some(raw) => raw
                .trim()
                .parse::<i64>()
                .ok()
                .filter(|h| *h > 0)
                .ok_or_else(|| ConfigError::Invalid {
                    name: "JWT_EXPIRY_HOURS",
                    reason: format!("expected a positive number of hours, got {raw:?}"),
                })?,
            None => DEFAULT_JWT_EXPIRY_HOURS,
        };

        let allowed_origins = get("ALLOWED_ORIGINS")
            .unwrap_or_else(|| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let log_format = match get("LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        Ok(Self {
            database_url,
            bind_address: get("BIND_ADDRESS").unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string()),
            environment,
            jwt_secret,
            jwt_expiry_hours,
            allowed_origins,
            enable_billing: parse_bool(get("ENABLE_BILLING"), true),
            log_format,
            skip_migrations: parse_bool(get("SKIP_MIGRATIONS"), false),
        })
    }

    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }

    /// Password reset tokens are only echoed back outside production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
