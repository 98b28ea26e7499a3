use std::{env, fmt::Display, str::FromStr};

use tracing::{info, warn};

pub const DEFAULT_ORIGINS: [&str; 2] = ["http://localhost:3000", "http://127.0.0.1:3000"];

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    pub jwt: JwtConfig,
    pub default_search_radius_km: f64,
    pub rate_limit_per_second: u64,
    pub rate_limit_burst: u32,
    pub allowed_origins: Vec<String>,
    pub production: bool,
}

#[derive(Clone, Debug)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: Option<String>,
    pub audience: Option<String>,
    pub ttl_hours: i64,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let production = env::var("RUST_ENV").map(|v| v == "production").unwrap_or(false);

        let secret = env::var("JWT_SECRET").map_err(|_| anyhow::anyhow!("JWT_SECRET must be set"))?;
        if secret.trim().is_empty() {
            anyhow::bail!("JWT_SECRET must not be empty");
        }

        let allowed_origins = parse_origins(env::var("ALLOWED_ORIGINS").ok().as_deref());
        let allowed_origins = if allowed_origins.is_empty() {
            if production {
                anyhow::bail!("ALLOWED_ORIGINS must contain at least one valid origin in production");
            }
            DEFAULT_ORIGINS.iter().map(|s| s.to_string()).collect()
        } else {
            allowed_origins
        };

        let default_search_radius_km: f64 = try_load("DEFAULT_SEARCH_RADIUS_KM", "50")?;
        if default_search_radius_km.is_nan() || default_search_radius_km <= 0.0 {
            anyhow::bail!("DEFAULT_SEARCH_RADIUS_KM must be positive");
        }

        Ok(Self {
            port: try_load("PORT", "8080")?,
            database_path: try_load("DATABASE_PATH", "annsampark.db")?,
            jwt: JwtConfig {
                secret,
                issuer: env::var("JWT_ISSUER").ok(),
                audience: env::var("JWT_AUDIENCE").ok(),
                ttl_hours: try_load("TOKEN_TTL_HOURS", "24")?,
            },
            default_search_radius_km,
            rate_limit_per_second: try_load("RATE_LIMIT_PER_SECOND", "1200")?,
            rate_limit_burst: try_load("RATE_LIMIT_BURST", "2400")?,
            allowed_origins,
            production,
        })
    }

    /// A configuration suitable for tests: in-memory store, fixed secret.
    pub fn for_tests() -> Self {
        Self {
            port: 0,
            database_path: crate::db::MEMORY_PATH.to_string(),
            jwt: JwtConfig {
                secret: "test-secret-do-not-use".to_string(),
                issuer: None,
                audience: None,
                ttl_hours: 1,
            },
            default_search_radius_km: 50.0,
            rate_limit_per_second: 1200,
            rate_limit_burst: 2400,
            allowed_origins: DEFAULT_ORIGINS.iter().map(|s| s.to_string()).collect(),
            production: false,
        }
    }
}

fn try_load<T: FromStr>(key: &str, default: &str) -> anyhow::Result<T>
where
    T::Err: Display,
{
    let raw = env::var(key).unwrap_or_else(|_| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });
    raw.parse()
        .map_err(|e| anyhow::anyhow!("Invalid {key} value {raw:?}: {e}"))
}

/// Splits a comma-separated origin list, dropping blanks and anything that is
/// not an http(s) origin.
pub fn parse_origins(raw: Option<&str>) -> Vec<String> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    raw.split(',')
        .filter_map(|s| {
            let trimmed = s.trim().trim_end_matches('/');
            if trimmed.is_empty() {
                return None;
            }
            if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
                Some(trimmed.to_string())
            } else {
                warn!("Ignoring invalid ALLOWED_ORIGINS entry: {}", trimmed);
                None
            }
        })
        .collect()
}
