//! Delegation tuning, loadable from TOML

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::{DelegationError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationConfig {
    /// Hop limit for new requests
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,
    /// Advisory request timeout, checked on every recursive entry
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
    /// Confidence reported when a node fulfils a task itself
    #[serde(default = "default_direct_confidence")]
    pub direct_confidence: f64,
    /// Confidence assigned to every discovered capability node
    #[serde(default = "default_capability_confidence")]
    pub default_capability_confidence: f64,
    /// Description characters shown to the capability classifier
    #[serde(default = "default_excerpt_chars")]
    pub description_excerpt_chars: usize,
    /// Concurrent completion-service calls per delegator
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Router candidates reported when a run starts
    #[serde(default = "default_top_candidates")]
    pub top_candidates: usize,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

fn default_max_hops() -> u32 {
    crate::request::DEFAULT_MAX_HOPS
}

fn default_timeout_secs() -> f64 {
    crate::request::DEFAULT_TIMEOUT.as_secs_f64()
}

fn default_direct_confidence() -> f64 {
    0.8
}

fn default_capability_confidence() -> f64 {
    0.7
}

fn default_excerpt_chars() -> usize {
    500
}

fn default_max_in_flight() -> usize {
    8
}

fn default_top_candidates() -> usize {
    3
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            max_hops: default_max_hops(),
            timeout_secs: default_timeout_secs(),
            direct_confidence: default_direct_confidence(),
            default_capability_confidence: default_capability_confidence(),
            description_excerpt_chars: default_excerpt_chars(),
            max_in_flight: default_max_in_flight(),
            top_candidates: default_top_candidates(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl DelegationConfig {
    /// Parse and validate a TOML document; missing keys take their defaults
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| DelegationError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DelegationError::ConfigError(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        let unit = 0.0..=1.0;
        if !unit.contains(&self.direct_confidence) {
            return Err(DelegationError::ConfigError(format!(
                "direct_confidence must be within 0.0..=1.0, got {}",
                self.direct_confidence
            )));
        }
        if !unit.contains(&self.default_capability_confidence) {
            return Err(DelegationError::ConfigError(format!(
                "default_capability_confidence must be within 0.0..=1.0, got {}",
                self.default_capability_confidence
            )));
        }
        if self.timeout_secs <= 0.0 || Duration::try_from_secs_f64(self.timeout_secs).is_err() {
            return Err(DelegationError::ConfigError(format!(
                "timeout_secs must be a positive duration, got {}",
                self.timeout_secs
            )));
        }
        if self.max_in_flight == 0 {
            return Err(DelegationError::ConfigError("max_in_flight must be at least 1".into()));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(DelegationError::ConfigError(
                "circuit_breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if Duration::try_from_secs_f64(self.circuit_breaker.open_duration_secs).is_err() {
            return Err(DelegationError::ConfigError(format!(
                "circuit_breaker.open_duration_secs must be a non-negative duration, got {}",
                self.circuit_breaker.open_duration_secs
            )));
        }
        Ok(())
    }

    /// Request timeout; out-of-range values saturate instead of panicking
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_secs).unwrap_or(if self.timeout_secs > 0.0 {
            Duration::MAX
        } else {
            Duration::ZERO
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = DelegationConfig::default();
        assert_eq!(config.max_hops, 10);
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.direct_confidence, 0.8);
        assert_eq!(config.default_capability_confidence, 0.7);
        assert_eq!(config.description_excerpt_chars, 500);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = DelegationConfig::from_toml_str("").unwrap();
        assert_eq!(config, DelegationConfig::default());
    }

    #[test]
    fn test_partial_document() {
        let config = DelegationConfig::from_toml_str(
            r#"
            max_hops = 4
            timeout_secs = 2.5

            [circuit_breaker]
            failure_threshold = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.max_hops, 4);
        assert_eq!(config.timeout(), Duration::from_millis(2500));
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.open_duration_secs, 60.0);
        assert_eq!(config.max_in_flight, 8);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(DelegationConfig::from_toml_str("direct_confidence = 1.5").is_err());
        assert!(DelegationConfig::from_toml_str("timeout_secs = 0.0").is_err());
        assert!(DelegationConfig::from_toml_str("max_in_flight = 0").is_err());
        assert!(DelegationConfig::from_toml_str("timeout_secs = 1e300").is_err());
        assert!(DelegationConfig::from_toml_str("timeout_secs = nan").is_err());
        assert!(DelegationConfig::from_toml_str("timeout_secs = inf").is_err());
        assert!(DelegationConfig::from_toml_str("[circuit_breaker]\nopen_duration_secs = 1e300").is_err());
        assert!(DelegationConfig::from_toml_str("[circuit_breaker]\nopen_duration_secs = -1.0").is_err());
        assert!(matches!(
            DelegationConfig::from_toml_str("[circuit_breaker]\nfailure_threshold = 0"),
            Err(DelegationError::ConfigError(_))
        ));
    }

    #[test]
    fn test_out_of_range_durations_saturate() {
        let config = DelegationConfig {
            timeout_secs: 1e300,
            ..DelegationConfig::default()
        };
        assert_eq!(config.timeout(), Duration::MAX);

        let breaker = CircuitBreakerConfig {
            failure_threshold: 1,
            open_duration_secs: 1e300,
        };
        assert_eq!(breaker.open_duration(), Duration::MAX);
    }

    #[test]
    fn test_malformed_toml() {
        let err = DelegationConfig::from_toml_str("max_hops = \"many\"").unwrap_err();
        assert!(matches!(err, DelegationError::ConfigError(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "top_candidates = 1\nmax_in_flight = 2").unwrap();

        let config = DelegationConfig::load(file.path()).unwrap();
        assert_eq!(config.top_candidates, 1);
        assert_eq!(config.max_in_flight, 2);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = DelegationConfig::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(err.to_string().contains("absent.toml"));
    }
}
