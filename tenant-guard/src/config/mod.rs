use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use service_core::middleware::rate_limit::RateLimitConfig;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct TenancyConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub database: DatabaseConfig,
    pub jwt: JwtConfig,
    pub permissions: PermissionCacheConfig,
    pub audit: AuditConfig,
    pub rate_limit: TenantRateLimitConfig,
    pub isolation: IsolationConfig,
    pub validation: ValidationPolicy,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: Option<String>,
    pub access_token_expiry_minutes: i64,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            issuer: None,
            access_token_expiry_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PermissionCacheConfig {
    pub cache_ttl_seconds: u64,
}

impl PermissionCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }
}

impl Default for PermissionCacheConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    pub flush_interval_ms: u64,
    pub max_batch_size: usize,
    /// Queue depth past which enqueue logs a backpressure warning.
    pub max_queue_size: usize,
}

impl AuditConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 5000,
            max_batch_size: 500,
            max_queue_size: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TenantRateLimitConfig {
    pub enabled: bool,
    pub max_requests: u32,
    pub window_seconds: u64,
    pub skip_successful_requests: bool,
}

impl TenantRateLimitConfig {
    pub fn limiter_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_requests: self.max_requests,
            window: Duration::from_secs(self.window_seconds),
            skip_successful_requests: self.skip_successful_requests,
        }
    }
}

impl Default for TenantRateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 1000,
            window_seconds: 60,
            skip_successful_requests: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IsolationConfig {
    /// Run the canary query set on every request, not only on demand.
    pub verify_each_request: bool,
    pub detect_bypass: bool,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            verify_each_request: false,
            detect_bypass: true,
        }
    }
}

/// Thresholds and promotion switches for context validation warnings.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidationPolicy {
    pub promote_past_due_billing: bool,
    pub promote_security_signals: bool,
    pub max_failed_logins_24h: u32,
    pub max_distinct_ips_1h: u32,
    pub max_permission_denials_1h: u32,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            promote_past_due_billing: false,
            promote_security_signals: false,
            max_failed_logins_24h: 5,
            max_distinct_ips_1h: 3,
            max_permission_denials_1h: 10,
        }
    }
}

impl Default for TenancyConfig {
    fn default() -> Self {
        Self {
            common: core_config::Config::default(),
            environment: Environment::Dev,
            service_name: "tenant-guard".to_string(),
            database: DatabaseConfig::default(),
            jwt: JwtConfig::default(),
            permissions: PermissionCacheConfig::default(),
            audit: AuditConfig::default(),
            rate_limit: TenantRateLimitConfig::default(),
            isolation: IsolationConfig::default(),
            validation: ValidationPolicy::default(),
        }
    }
}

impl TenancyConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;
        let defaults = TenancyConfig::default();

        let config = TenancyConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("tenant-guard"), is_prod)?,
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", "10", is_prod)?,
            },
            jwt: JwtConfig {
                secret: get_env("JWT_SECRET", None, true)?,
                issuer: env::var("JWT_ISSUER").ok(),
                access_token_expiry_minutes: parse_env(
                    "JWT_ACCESS_TOKEN_EXPIRY_MINUTES",
                    "60",
                    is_prod,
                )?,
            },
            permissions: PermissionCacheConfig {
                cache_ttl_seconds: parse_env(
                    "PERMISSION_CACHE_TTL_SECONDS",
                    &defaults.permissions.cache_ttl_seconds.to_string(),
                    is_prod,
                )?,
            },
            audit: AuditConfig {
                flush_interval_ms: parse_env(
                    "AUDIT_FLUSH_INTERVAL_MS",
                    &defaults.audit.flush_interval_ms.to_string(),
                    is_prod,
                )?,
                max_batch_size: parse_env(
                    "AUDIT_MAX_BATCH_SIZE",
                    &defaults.audit.max_batch_size.to_string(),
                    is_prod,
                )?,
                max_queue_size: parse_env(
                    "AUDIT_MAX_QUEUE_SIZE",
                    &defaults.audit.max_queue_size.to_string(),
                    is_prod,
                )?,
            },
            rate_limit: TenantRateLimitConfig {
                enabled: parse_env("TENANT_RATE_LIMIT_ENABLED", "true", is_prod)?,
                max_requests: parse_env("TENANT_RATE_LIMIT_REQUESTS", "1000", is_prod)?,
                window_seconds: parse_env("TENANT_RATE_LIMIT_WINDOW_SECONDS", "60", is_prod)?,
                skip_successful_requests: parse_env(
                    "TENANT_RATE_LIMIT_SKIP_SUCCESS",
                    "false",
                    is_prod,
                )?,
            },
            isolation: IsolationConfig {
                verify_each_request: parse_env(
                    "ISOLATION_VERIFY_EACH_REQUEST",
                    "false",
                    is_prod,
                )?,
                detect_bypass: parse_env("ISOLATION_DETECT_BYPASS", "true", is_prod)?,
            },
            validation: ValidationPolicy {
                promote_past_due_billing: parse_env(
                    "VALIDATION_PROMOTE_PAST_DUE",
                    "false",
                    is_prod,
                )?,
                promote_security_signals: parse_env(
                    "VALIDATION_PROMOTE_SECURITY_SIGNALS",
                    "false",
                    is_prod,
                )?,
                max_failed_logins_24h: parse_env("SECURITY_MAX_FAILED_LOGINS_24H", "5", is_prod)?,
                max_distinct_ips_1h: parse_env("SECURITY_MAX_DISTINCT_IPS_1H", "3", is_prod)?,
                max_permission_denials_1h: parse_env(
                    "SECURITY_MAX_PERMISSION_DENIALS_1H",
                    "10",
                    is_prod,
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.permissions.cache_ttl_seconds == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PERMISSION_CACHE_TTL_SECONDS must be positive"
            )));
        }

        if self.audit.flush_interval_ms == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "AUDIT_FLUSH_INTERVAL_MS must be positive"
            )));
        }

        if self.audit.max_batch_size == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "AUDIT_MAX_BATCH_SIZE must be positive"
            )));
        }

        if self.environment == Environment::Prod {
            if self.jwt.secret.len() < 32 {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "JWT_SECRET must be at least 32 bytes in production"
                )));
            }

            if !self.isolation.detect_bypass {
                tracing::error!(
                    "Isolation bypass detection is disabled in production - tenant leaks will not be caught"
                );
            }
        }

        Ok(())
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod && default.is_none() {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: &str, is_prod: bool) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, Some(default), is_prod)?
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("{}: {}", key, e)))
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TenancyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.permissions.ttl(), Duration::from_secs(300));
        assert_eq!(config.audit.flush_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut config = TenancyConfig::default();
        config.audit.max_batch_size = 0;
        assert!(matches!(config.validate(), Err(AppError::ConfigError(_))));
    }

    #[test]
    fn test_prod_requires_strong_secret() {
        let mut config = TenancyConfig {
            environment: Environment::Prod,
            ..TenancyConfig::default()
        };
        config.jwt.secret = "short".to_string();
        assert!(config.validate().is_err());

        config.jwt.secret = "x".repeat(32);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_environment_parse() {
        assert_eq!("PROD".parse::<Environment>(), Ok(Environment::Prod));
        assert!("staging".parse::<Environment>().is_err());
    }
}
