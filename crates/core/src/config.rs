//! Engine tuning knobs.
//!
//! Loading configuration files is left to the embedding application. The
//! server binary layers `SIGNALFOLD_*` environment variables over
//! [`EngineConfig::default`] with [`EngineConfig::from_env`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Minimum cosine similarity (T) for a neighbor to contribute cause-heat.
    pub similarity_threshold: f32,
    /// Cause-heat changes at or below this are not re-emitted.
    pub heat_epsilon: f64,
    /// Half-width of the lat/lng box searched for cause-heat neighbors.
    pub geo_window_degrees: f64,
    /// Embedding model version. Changing it orphans every cached vector.
    pub model_version: String,
    /// Maximum events pulled past the watermark per projection phase.
    pub batch_size: usize,
    pub apply_workers: usize,
    pub apply_max_retries: u32,
    pub apply_backoff_ms: u64,
    pub apply_timeout_ms: u64,
    pub embed_timeout_ms: u64,
    /// Run id stamped on facts the enrichers append.
    pub enrichment_run_id: String,
    /// Consecutive cycles enrichment may wait on a backlog before it runs
    /// anyway.
    pub max_skipped_enrichments: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.75,
            heat_epsilon: 1e-6,
            geo_window_degrees: 0.5,
            model_version: "hashing-v1".to_string(),
            batch_size: 500,
            apply_workers: 4,
            apply_max_retries: 3,
            apply_backoff_ms: 10,
            apply_timeout_ms: 2000,
            embed_timeout_ms: 5000,
            enrichment_run_id: "enricher".to_string(),
            max_skipped_enrichments: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Parse { key: String, value: String },
    #[error("{field} {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: &str| ConfigError::Invalid {
            field,
            reason: reason.to_string(),
        };
        if !self.similarity_threshold.is_finite()
            || !(-1.0..=1.0).contains(&self.similarity_threshold)
        {
            return Err(invalid("similarity_threshold", "must be within [-1, 1]"));
        }
        if !self.heat_epsilon.is_finite() || self.heat_epsilon < 0.0 {
            return Err(invalid("heat_epsilon", "must be a non-negative number"));
        }
        if !self.geo_window_degrees.is_finite() || self.geo_window_degrees < 0.0 {
            return Err(invalid(
                "geo_window_degrees",
                "must be a non-negative number",
            ));
        }
        if self.model_version.trim().is_empty() {
            return Err(invalid("model_version", "must not be empty"));
        }
        if self.model_version.contains('\u{1f}') {
            return Err(invalid("model_version", "must not contain control characters"));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be at least 1"));
        }
        if self.apply_workers == 0 {
            return Err(invalid("apply_workers", "must be at least 1"));
        }
        if self.apply_timeout_ms == 0 {
            return Err(invalid("apply_timeout_ms", "must be at least 1"));
        }
        if self.embed_timeout_ms == 0 {
            return Err(invalid("embed_timeout_ms", "must be at least 1"));
        }
        if self.enrichment_run_id.trim().is_empty() {
            return Err(invalid("enrichment_run_id", "must not be empty"));
        }
        if self.max_skipped_enrichments == 0 {
            return Err(invalid("max_skipped_enrichments", "must be at least 1"));
        }
        Ok(())
    }

    /// Defaults overridden by `SIGNALFOLD_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, keyed by upper-cased field name with a
    /// `SIGNALFOLD_` prefix, then validate.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        macro_rules! override_fields {
            ($($key:literal => $field:ident),* $(,)?) => {
                $(override_parsed(&lookup, $key, &mut self.$field)?;)*
            };
        }
        override_fields! {
            "SIGNALFOLD_SIMILARITY_THRESHOLD" => similarity_threshold,
            "SIGNALFOLD_HEAT_EPSILON" => heat_epsilon,
            "SIGNALFOLD_GEO_WINDOW_DEGREES" => geo_window_degrees,
            "SIGNALFOLD_MODEL_VERSION" => model_version,
            "SIGNALFOLD_BATCH_SIZE" => batch_size,
            "SIGNALFOLD_APPLY_WORKERS" => apply_workers,
            "SIGNALFOLD_APPLY_MAX_RETRIES" => apply_max_retries,
            "SIGNALFOLD_APPLY_BACKOFF_MS" => apply_backoff_ms,
            "SIGNALFOLD_APPLY_TIMEOUT_MS" => apply_timeout_ms,
            "SIGNALFOLD_EMBED_TIMEOUT_MS" => embed_timeout_ms,
            "SIGNALFOLD_ENRICHMENT_RUN_ID" => enrichment_run_id,
            "SIGNALFOLD_MAX_SKIPPED_ENRICHMENTS" => max_skipped_enrichments,
        }
        self.validate()?;
        Ok(self)
    }

    pub fn apply_backoff(&self) -> Duration {
        Duration::from_millis(self.apply_backoff_ms)
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    pub fn embed_timeout(&self) -> Duration {
        Duration::from_millis(self.embed_timeout_ms)
    }
}

fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    if let Some(raw) = lookup(key) {
        *slot = raw.trim().parse().map_err(|_| ConfigError::Parse {
            key: key.to_string(),
            value: raw.clone(),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.similarity_threshold, 0.75);
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.embed_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn overrides_are_applied() {
        let vars: HashMap<&str, &str> = [
            ("SIGNALFOLD_SIMILARITY_THRESHOLD", "0.6"),
            ("SIGNALFOLD_MODEL_VERSION", "minilm-v2"),
            ("SIGNALFOLD_BATCH_SIZE", " 64 "),
        ]
        .into_iter()
        .collect();
        let config = EngineConfig::default()
            .with_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.similarity_threshold, 0.6);
        assert_eq!(config.model_version, "minilm-v2");
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.apply_workers, 4);
    }

    #[test]
    fn unparsable_override_names_the_key() {
        let err = EngineConfig::default()
            .with_overrides(|k| (k == "SIGNALFOLD_APPLY_WORKERS").then(|| "many".to_string()))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Parse {
                key: "SIGNALFOLD_APPLY_WORKERS".into(),
                value: "many".into()
            }
        );
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let config = EngineConfig {
            batch_size: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "batch_size",
                ..
            })
        ));
    }

    #[test]
    fn enrichment_skip_limit_is_overridable_and_positive() {
        let config = EngineConfig::default()
            .with_overrides(|k| (k == "SIGNALFOLD_MAX_SKIPPED_ENRICHMENTS").then(|| "3".into()))
            .unwrap();
        assert_eq!(config.max_skipped_enrichments, 3);

        let err = EngineConfig::default()
            .with_overrides(|k| (k == "SIGNALFOLD_MAX_SKIPPED_ENRICHMENTS").then(|| "0".into()))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "max_skipped_enrichments",
                ..
            }
        ));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"similarity_threshold": 0.9}"#).unwrap();
        assert_eq!(config.similarity_threshold, 0.9);
        assert_eq!(config.heat_epsilon, 1e-6);
    }
}
