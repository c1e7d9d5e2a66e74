//! Configuration types and loading
//!
//! Defaults match the values the upload and display paths use when no
//! environment overrides are present.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main client configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// REST backend configuration
    pub backend: BackendConfig,

    /// Upload compression budget
    pub compression: CompressionConfig,

    /// Signed URL renewal timing
    pub renewal: RenewalConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    pub base_url: String,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct CompressionConfig {
    /// Byte budget for an uploaded image
    pub max_size_bytes: u64,
    /// Longest allowed image side in pixels
    pub max_dimension_px: u32,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct RenewalConfig {
    /// Validity window of a signed URL as issued by the backend
    pub signed_url_ttl_seconds: u64,
    /// Period of the proactive refetch timer
    pub proactive_refresh_seconds: u64,
    /// Wait between a completed renewal and the cache-busted retry
    pub settle_delay_ms: u64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 1024 * 1024, // 1 MB
            max_dimension_px: 1920,
        }
    }
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            signed_url_ttl_seconds: 3600,    // 1 hour
            proactive_refresh_seconds: 1800, // 30 minutes
            settle_delay_ms: 500,
        }
    }
}

impl RenewalConfig {
    pub fn proactive_refresh(&self) -> Duration {
        Duration::from_secs(self.proactive_refresh_seconds)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn signed_url_ttl(&self) -> Duration {
        Duration::from_secs(self.signed_url_ttl_seconds)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig {
                base_url: "http://localhost:3000/api".to_string(),
                request_timeout_seconds: 30,
            },
            compression: CompressionConfig::default(),
            renewal: RenewalConfig::default(),
        }
    }
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

impl ClientConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        // Backend
        if let Some(url) = lookup("FM_API_BASE_URL") {
            config.backend.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(v) = lookup("FM_API_TIMEOUT_SECONDS") {
            config.backend.request_timeout_seconds = parse_value("FM_API_TIMEOUT_SECONDS", &v)?;
        }

        // Compression budget
        if let Some(v) = lookup("FM_UPLOAD_MAX_BYTES") {
            config.compression.max_size_bytes = parse_value("FM_UPLOAD_MAX_BYTES", &v)?;
        }
        if let Some(v) = lookup("FM_UPLOAD_MAX_DIMENSION_PX") {
            config.compression.max_dimension_px = parse_value("FM_UPLOAD_MAX_DIMENSION_PX", &v)?;
        }

        // Renewal
        if let Some(v) = lookup("FM_SIGNED_URL_TTL_SECONDS") {
            config.renewal.signed_url_ttl_seconds = parse_value("FM_SIGNED_URL_TTL_SECONDS", &v)?;
        }
        if let Some(v) = lookup("FM_URL_REFRESH_SECONDS") {
            config.renewal.proactive_refresh_seconds = parse_value("FM_URL_REFRESH_SECONDS", &v)?;
        }
        if let Some(v) = lookup("FM_RENEWAL_SETTLE_MS") {
            config.renewal.settle_delay_ms = parse_value("FM_RENEWAL_SETTLE_MS", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.base_url.trim().is_empty() {
            return Err(invalid("FM_API_BASE_URL", "must not be empty"));
        }
        if self.compression.max_size_bytes == 0 {
            return Err(invalid("FM_UPLOAD_MAX_BYTES", "must be greater than zero"));
        }
        if self.compression.max_dimension_px == 0 {
            return Err(invalid("FM_UPLOAD_MAX_DIMENSION_PX", "must be greater than zero"));
        }
        if self.renewal.proactive_refresh_seconds == 0 {
            return Err(invalid("FM_URL_REFRESH_SECONDS", "must be greater than zero"));
        }
        if self.renewal.proactive_refresh_seconds >= self.renewal.signed_url_ttl_seconds {
            return Err(invalid(
                "FM_URL_REFRESH_SECONDS",
                "must be shorter than the signed URL lifetime",
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.backend.request_timeout_seconds)
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("cannot parse {:?}", raw),
    })
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.compression.max_size_bytes, 1_048_576);
        assert_eq!(config.compression.max_dimension_px, 1920);
        assert!(config.renewal.proactive_refresh() < config.renewal.signed_url_ttl());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let config = ClientConfig::from_lookup(lookup_from(&[
            ("FM_API_BASE_URL", "https://condo.example.com/api/"),
            ("FM_UPLOAD_MAX_BYTES", "524288"),
            ("FM_URL_REFRESH_SECONDS", "600"),
            ("FM_RENEWAL_SETTLE_MS", "250"),
        ]))
        .unwrap();

        assert_eq!(config.backend.base_url, "https://condo.example.com/api");
        assert_eq!(config.compression.max_size_bytes, 524_288);
        assert_eq!(config.renewal.proactive_refresh(), Duration::from_secs(600));
        assert_eq!(config.renewal.settle_delay(), Duration::from_millis(250));
    }

    #[test]
    fn test_unparsable_value() {
        let result = ClientConfig::from_lookup(lookup_from(&[("FM_UPLOAD_MAX_BYTES", "lots")]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "FM_UPLOAD_MAX_BYTES"
        ));
    }

    #[test]
    fn test_refresh_must_be_shorter_than_ttl() {
        let result = ClientConfig::from_lookup(lookup_from(&[
            ("FM_SIGNED_URL_TTL_SECONDS", "900"),
            ("FM_URL_REFRESH_SECONDS", "900"),
        ]));
        assert!(result.is_err());
    }
}
