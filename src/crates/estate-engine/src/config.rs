//! Engine configuration.
//!
//! One value tree covers every recognized option; components receive the
//! shared `Arc<EngineConfig>` at construction time rather than reading
//! globals, so tests can build a fresh configuration per case.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::error::{EngineError, Result};
use crate::types::{BackoffKind, StepRetryPolicy};
use estate_llm::LlmConfig;

fn default_max_retries() -> u32 {
    2
}

fn default_max_workers_per_plan() -> usize {
    3
}

fn default_max_concurrent() -> usize {
    3
}

fn default_total_run_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_per_step_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_query_length() -> usize {
    1000
}

fn default_language() -> String {
    "ko".to_string()
}

fn default_true() -> bool {
    true
}

fn default_min_confidence() -> f64 {
    0.1
}

fn default_min_quality() -> f64 {
    0.6
}

fn default_low_confidence() -> f64 {
    0.4
}

/// Engine-level retry backoff applied between scheduling rounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default)]
    pub kind: BackoffKind,
    #[serde(default = "BackoffConfig::default_initial_delay")]
    pub initial_delay: Duration,
    #[serde(default = "BackoffConfig::default_max_delay")]
    pub max_delay: Duration,
    /// Randomize delays by up to +25% to avoid retry stampedes. Off by
    /// default so tests stay deterministic.
    #[serde(default)]
    pub jitter: bool,
}

impl BackoffConfig {
    fn default_initial_delay() -> Duration {
        Duration::from_millis(200)
    }

    fn default_max_delay() -> Duration {
        Duration::from_secs(5)
    }

    /// Delay before scheduling round `retry_count + 1`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let base = StepRetryPolicy {
            max_retries: u32::MAX,
            backoff: self.kind,
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
        }
        .delay_for(retry_count);

        if self.jitter {
            use rand::Rng;
            let factor = rand::thread_rng().gen_range(1.0..1.25);
            base.mul_f64(factor).min(self.max_delay)
        } else {
            base
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential,
            initial_delay: Self::default_initial_delay(),
            max_delay: Self::default_max_delay(),
            jitter: false,
        }
    }
}

/// Analyzer thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentConfig {
    /// Below this, keyword classification degrades to `unclear`.
    #[serde(default = "default_min_confidence")]
    pub min_confidence_threshold: f64,
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            min_confidence_threshold: default_min_confidence(),
        }
    }
}

/// Evaluator thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    #[serde(default = "default_min_quality")]
    pub min_quality_threshold: f64,
    #[serde(default = "default_low_confidence")]
    pub low_confidence_threshold: f64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            min_quality_threshold: default_min_quality(),
            low_confidence_threshold: default_low_confidence(),
        }
    }
}

/// Texts used for guidance responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuidanceConfig {
    #[serde(default = "GuidanceConfig::default_irrelevant")]
    pub irrelevant_message: String,
    #[serde(default = "GuidanceConfig::default_unclear")]
    pub unclear_message: String,
    #[serde(default = "GuidanceConfig::default_examples")]
    pub example_prompts: Vec<String>,
}

impl GuidanceConfig {
    fn default_irrelevant() -> String {
        "I can help with real-estate questions: listings, prices, financing, \
         locations and contracts."
            .to_string()
    }

    fn default_unclear() -> String {
        "Could you be more specific? Naming a district, a budget or a \
         transaction type helps me route your question."
            .to_string()
    }

    fn default_examples() -> Vec<String> {
        vec![
            "강남구 아파트 전세 시세 알려줘".to_string(),
            "보증금 3억 전세 대출 한도 계산해줘".to_string(),
            "마포구 오피스텔 매매 계약시 주의사항 알려줘".to_string(),
        ]
    }
}

impl Default for GuidanceConfig {
    fn default() -> Self {
        Self {
            irrelevant_message: Self::default_irrelevant(),
            unclear_message: Self::default_unclear(),
            example_prompts: Self::default_examples(),
        }
    }
}

/// Every recognized engine option, with spec defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub run: RunConfig,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub llm: LlmConfig,
    pub intent: IntentConfig,
    pub evaluator: EvaluatorConfig,
    pub guidance: GuidanceConfig,
}

/// Run-wide limits and flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_workers_per_plan")]
    pub max_workers_per_plan: usize,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_total_run_timeout")]
    pub total_run_timeout: Duration,
    #[serde(default = "default_per_step_timeout")]
    pub per_step_default_timeout: Duration,
    /// When true a failed sequential step aborts the schedule outright;
    /// when false the remaining tail is recorded as skipped.
    #[serde(default)]
    pub strict_sequential: bool,
    #[serde(default = "default_max_query_length")]
    pub max_query_length: usize,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub debug_mode: bool,
    #[serde(default = "default_true")]
    pub checkpoint_enabled: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_workers_per_plan: default_max_workers_per_plan(),
            max_concurrent: default_max_concurrent(),
            total_run_timeout: default_total_run_timeout(),
            per_step_default_timeout: default_per_step_timeout(),
            strict_sequential: false,
            max_query_length: default_max_query_length(),
            language: default_language(),
            debug_mode: false,
            checkpoint_enabled: true,
        }
    }
}

/// `retry.backoff` from the recognized option list.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RetryConfig {
    pub backoff: BackoffConfig,
}

impl EngineConfig {
    /// Parse a YAML configuration document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)
            .map_err(|e| EngineError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.run.max_workers_per_plan == 0 {
            return Err(EngineError::Configuration(
                "max_workers_per_plan must be at least 1".into(),
            ));
        }
        if self.run.max_concurrent == 0 {
            return Err(EngineError::Configuration(
                "max_concurrent must be at least 1".into(),
            ));
        }
        if self.run.total_run_timeout.is_zero() {
            return Err(EngineError::Configuration(
                "total_run_timeout must be positive".into(),
            ));
        }
        for (name, value) in [
            ("intent.min_confidence_threshold", self.intent.min_confidence_threshold),
            ("evaluator.min_quality_threshold", self.evaluator.min_quality_threshold),
            (
                "evaluator.low_confidence_threshold",
                self.evaluator.low_confidence_threshold,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(EngineError::Configuration(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = EngineConfig::default();
        assert_eq!(config.run.max_retries, 2);
        assert_eq!(config.run.max_workers_per_plan, 3);
        assert_eq!(config.run.max_concurrent, 3);
        assert_eq!(config.cache.ttl, Duration::from_secs(1800));
        assert!(config.cache.enabled);
        assert!(config.run.checkpoint_enabled);
        config.validate().unwrap();
    }

    #[test]
    fn yaml_overrides_defaults() {
        let yaml = r#"
run:
  max_retries: 1
  max_concurrent: 5
  language: en
evaluator:
  min_quality_threshold: 0.8
"#;
        let config = EngineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.run.max_retries, 1);
        assert_eq!(config.run.max_concurrent, 5);
        assert_eq!(config.run.language, "en");
        assert!((config.evaluator.min_quality_threshold - 0.8).abs() < f64::EPSILON);
        // untouched sections keep defaults
        assert_eq!(config.run.max_workers_per_plan, 3);
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        let backoff = BackoffConfig {
            jitter: true,
            ..BackoffConfig::default()
        };
        for _ in 0..20 {
            let delay = backoff.delay_for(0);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(250));
        }
    }

    #[test]
    fn invalid_threshold_is_rejected() {
        let yaml = "evaluator:\n  min_quality_threshold: 1.5\n";
        assert!(matches!(
            EngineConfig::from_yaml_str(yaml),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut config = EngineConfig::default();
        config.run.max_concurrent = 0;
        assert!(config.validate().is_err());
    }
}
