use crate::alert::provider::{MetricProvider, MetricSample, MetricUnavailable};
use crate::ErrorClassification;
use chrono::Duration;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConditionError {
    #[error("malformed condition: {0}")]
    Malformed(String),
    #[error("metric {metric} produced no samples in the window")]
    EmptyHistory { metric: String },
    #[error(transparent)]
    MetricUnavailable(#[from] MetricUnavailable),
}

impl ErrorClassification for ConditionError {
    fn is_retryable(&self) -> bool {
        match self {
            // A later cycle may find the metric populated again.
            ConditionError::EmptyHistory { .. } | ConditionError::MetricUnavailable(_) => true,
            ConditionError::Malformed(_) => false,
        }
    }
}

/// Threshold comparison operators with bit-exact semantics.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdOperator {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    Between,
    Outside,
}

impl ThresholdOperator {
    /// Applies the operator to `x` against `value` (and `upper_value` for
    /// the two-sided operators).
    pub fn apply(&self, x: f64, value: f64, upper_value: Option<f64>) -> bool {
        match self {
            ThresholdOperator::Gt => x > value,
            ThresholdOperator::Gte => x >= value,
            ThresholdOperator::Lt => x < value,
            ThresholdOperator::Lte => x <= value,
            ThresholdOperator::Eq => x == value,
            ThresholdOperator::Between => {
                let upper = upper_value.unwrap_or(value);
                value <= x && x <= upper
            }
            ThresholdOperator::Outside => {
                let upper = upper_value.unwrap_or(value);
                x < value || x > upper
            }
        }
    }

    fn requires_upper_value(&self) -> bool {
        matches!(self, ThresholdOperator::Between | ThresholdOperator::Outside)
    }
}

/// Time-window aggregation functions. Names outside the recognized set
/// deserialize to `Latest`, which picks the most recent sample.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Aggregation {
    Avg,
    Max,
    Min,
    Sum,
    Count,
    Latest,
}

impl Aggregation {
    fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Avg => "avg",
            Aggregation::Max => "max",
            Aggregation::Min => "min",
            Aggregation::Sum => "sum",
            Aggregation::Count => "count",
            Aggregation::Latest => "latest",
        }
    }
}

impl Serialize for Aggregation {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Aggregation {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(match name.to_ascii_lowercase().as_str() {
            "avg" => Aggregation::Avg,
            "max" => Aggregation::Max,
            "min" => Aggregation::Min,
            "sum" => Aggregation::Sum,
            "count" => Aggregation::Count,
            _ => Aggregation::Latest,
        })
    }
}

impl Aggregation {
    fn apply(&self, samples: &[MetricSample]) -> f64 {
        let values = samples.iter().map(|sample| sample.value);
        match self {
            Aggregation::Avg => {
                values.sum::<f64>() / samples.len() as f64
            }
            Aggregation::Max => values.fold(f64::NEG_INFINITY, f64::max),
            Aggregation::Min => values.fold(f64::INFINITY, f64::min),
            Aggregation::Sum => values.sum(),
            Aggregation::Count => samples.len() as f64,
            Aggregation::Latest => samples.last().map(|s| s.value).unwrap_or(0.0),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompositeOperator {
    And,
    Or,
    Not,
}

/// A predicate tree over metric values. Simple conditions test the current
/// value of one metric; time-based conditions aggregate a history window
/// first; composite conditions combine children with and/or/not.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertCondition {
    Simple {
        metric: String,
        operator: ThresholdOperator,
        value: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        upper_value: Option<f64>,
    },
    TimeBased {
        metric: String,
        operator: ThresholdOperator,
        value: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        upper_value: Option<f64>,
        aggregation: Aggregation,
        window_secs: u64,
    },
    Composite {
        operator: CompositeOperator,
        conditions: Vec<AlertCondition>,
    },
}

impl AlertCondition {
    /// Checks structural invariants. Called at rule registration so a
    /// malformed tree is rejected before it can ever evaluate.
    pub fn validate(&self) -> Result<(), ConditionError> {
        match self {
            AlertCondition::Simple {
                metric,
                operator,
                upper_value,
                ..
            }
            | AlertCondition::TimeBased {
                metric,
                operator,
                upper_value,
                ..
            } => {
                if metric.is_empty() {
                    return Err(ConditionError::Malformed(
                        "condition metric name is empty".to_owned(),
                    ));
                }
                if operator.requires_upper_value() && upper_value.is_none() {
                    return Err(ConditionError::Malformed(format!(
                        "operator {:?} requires an upper value",
                        operator
                    )));
                }
                Ok(())
            }
            AlertCondition::Composite {
                operator,
                conditions,
            } => {
                match operator {
                    CompositeOperator::And | CompositeOperator::Or => {
                        if conditions.is_empty() {
                            return Err(ConditionError::Malformed(format!(
                                "composite {:?} requires at least one child",
                                operator
                            )));
                        }
                    }
                    CompositeOperator::Not => {
                        if conditions.len() != 1 {
                            return Err(ConditionError::Malformed(
                                "composite not requires exactly one child".to_owned(),
                            ));
                        }
                    }
                }
                for child in conditions {
                    child.validate()?;
                }
                Ok(())
            }
        }
    }

    /// Evaluates the tree against the provider. Children evaluate
    /// left-to-right with short-circuiting, never in parallel, so results
    /// are reproducible.
    pub fn evaluate(&self, provider: &dyn MetricProvider) -> Result<bool, ConditionError> {
        match self {
            AlertCondition::Simple {
                metric,
                operator,
                value,
                upper_value,
            } => {
                let x = provider.metric_value(metric, None)?;
                Ok(operator.apply(x, *value, *upper_value))
            }
            AlertCondition::TimeBased {
                metric,
                operator,
                value,
                upper_value,
                aggregation,
                window_secs,
            } => {
                let history =
                    provider.metric_history(metric, Duration::seconds(*window_secs as i64))?;
                if history.is_empty() {
                    return Err(ConditionError::EmptyHistory {
                        metric: metric.clone(),
                    });
                }
                let aggregate = aggregation.apply(&history);
                Ok(operator.apply(aggregate, *value, *upper_value))
            }
            AlertCondition::Composite {
                operator,
                conditions,
            } => match operator {
                CompositeOperator::And => {
                    for child in conditions {
                        if !child.evaluate(provider)? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                CompositeOperator::Or => {
                    for child in conditions {
                        if child.evaluate(provider)? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                CompositeOperator::Not => Ok(!conditions[0].evaluate(provider)?),
            },
        }
    }
}
