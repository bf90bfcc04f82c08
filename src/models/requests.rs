use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::models::domain::ScoringWeights;

/// Allowed deviation of the weight sum from 1.0
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// What happens to participants left over after integer division by group size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeftoverPolicy {
    /// Grow existing groups by one member each
    #[default]
    Absorb,
    /// Report leftovers as carried over to the next round
    CarryForward,
}

/// Parameters for a single round, supplied fresh on every invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_weights"))]
pub struct RoundConfig {
    #[validate(range(min = 2, max = 10))]
    #[serde(rename = "groupSize")]
    pub group_size: usize,
    #[serde(rename = "lookbackWindow")]
    pub lookback_window: u64,
    pub weights: ScoringWeights,
    #[serde(rename = "maxRelaxationSteps")]
    pub max_relaxation_steps: u32,
    #[serde(rename = "leftoverPolicy", default)]
    pub leftover_policy: LeftoverPolicy,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            group_size: 2,
            lookback_window: 4,
            weights: ScoringWeights::default(),
            max_relaxation_steps: 3,
            leftover_policy: LeftoverPolicy::Absorb,
        }
    }
}

fn validate_weights(config: &RoundConfig) -> Result<(), ValidationError> {
    let w = &config.weights;
    let finite = [w.topic, w.availability, w.length]
        .iter()
        .all(|v| v.is_finite() && *v >= 0.0);
    if !finite {
        let mut err = ValidationError::new("weights_negative");
        err.message = Some("weights must be finite and non-negative".into());
        return Err(err);
    }

    if (w.sum() - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
        let mut err = ValidationError::new("weights_sum");
        err.message = Some(format!("weights must sum to 1.0, got {:.6}", w.sum()).into());
        return Err(err);
    }

    Ok(())
}

/// Trigger parameters for one round
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RunRoundRequest {
    #[validate(length(min = 1))]
    #[serde(rename = "roundId")]
    pub round_id: String,
    #[serde(rename = "roundIndex")]
    pub round_index: u64,
    #[serde(rename = "scheduledDate", default)]
    pub scheduled_date: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(RoundConfig::default().validate().is_ok());
    }

    #[test]
    fn test_group_size_bounds() {
        let mut config = RoundConfig::default();
        config.group_size = 1;
        assert!(config.validate().is_err());

        config.group_size = 11;
        assert!(config.validate().is_err());

        config.group_size = 10;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let mut config = RoundConfig::default();
        config.weights = ScoringWeights {
            topic: 0.5,
            availability: 0.3,
            length: 0.1,
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("weights"));
    }

    #[test]
    fn test_weights_tolerate_float_rounding() {
        let mut config = RoundConfig::default();
        config.weights = ScoringWeights {
            topic: 0.1,
            availability: 0.7,
            length: 0.2,
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_negative_weight_rejected() {
        let mut config = RoundConfig::default();
        config.weights = ScoringWeights {
            topic: 1.2,
            availability: -0.2,
            length: 0.0,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_leftover_policy_deserializes_snake_case() {
        let config: RoundConfig = serde_json::from_str(
            r#"{
                "groupSize": 3,
                "lookbackWindow": 2,
                "weights": {"topic": 0.5, "availability": 0.3, "length": 0.2},
                "maxRelaxationSteps": 1,
                "leftoverPolicy": "carry_forward"
            }"#,
        )
        .unwrap();
        assert_eq!(config.leftover_policy, LeftoverPolicy::CarryForward);
    }

    #[test]
    fn test_run_request_requires_round_id() {
        let request = RunRoundRequest {
            round_id: String::new(),
            round_index: 3,
            scheduled_date: None,
        };
        assert!(request.validate().is_err());
    }
}
