//! Elasticity policies attached to a role.
//!
//! A policy pairs a comparison expression over one metric attribute with a
//! kind-specific adjustment. The evaluator owns `true_evals` and `last_eval`;
//! everything else is supplied when the role is created.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// What a triggered policy does to the role's cardinality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyKind {
    /// Add `adjust` (may be negative) to the current cardinality.
    Change { adjust: i64 },
    /// Set the cardinality to `adjust`.
    Cardinality { adjust: u32 },
    /// Change by `adjust` percent of the current cardinality, moving at
    /// least `min_adjust_step` nodes.
    PercentageChange {
        adjust: i64,
        #[serde(default)]
        min_adjust_step: Option<u32>,
    },
}

impl PolicyKind {
    /// Signed cardinality delta this kind recommends from `current`.
    pub fn delta(&self, current: u32) -> i64 {
        let current = i64::from(current);
        match *self {
            PolicyKind::Change { adjust } => adjust,
            PolicyKind::Cardinality { adjust } => i64::from(adjust) - current,
            PolicyKind::PercentageChange {
                adjust,
                min_adjust_step,
            } => {
                let raw = current.saturating_mul(adjust) as f64 / 100.0;
                // Round away from zero so small roles still move.
                let mut delta = if raw >= 0.0 { raw.ceil() } else { raw.floor() } as i64;
                if let Some(step) = min_adjust_step {
                    let step = i64::from(step);
                    if delta != 0 && delta.unsigned_abs() < step.unsigned_abs() {
                        delta = step * delta.signum();
                    } else if delta == 0 && adjust != 0 {
                        delta = step * adjust.signum();
                    }
                }
                delta
            }
        }
    }
}

/// Comparison operator of an elasticity expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
    Equal,
    NotEqual,
}

impl Comparison {
    pub fn holds(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            Comparison::Greater => lhs > rhs,
            Comparison::GreaterOrEqual => lhs >= rhs,
            Comparison::Less => lhs < rhs,
            Comparison::LessOrEqual => lhs <= rhs,
            Comparison::Equal => lhs == rhs,
            Comparison::NotEqual => lhs != rhs,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Comparison::Greater => ">",
            Comparison::GreaterOrEqual => ">=",
            Comparison::Less => "<",
            Comparison::LessOrEqual => "<=",
            Comparison::Equal => "==",
            Comparison::NotEqual => "!=",
        }
    }
}

impl FromStr for Comparison {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            ">" => Ok(Comparison::Greater),
            ">=" => Ok(Comparison::GreaterOrEqual),
            "<" => Ok(Comparison::Less),
            "<=" => Ok(Comparison::LessOrEqual),
            "==" => Ok(Comparison::Equal),
            "!=" => Ok(Comparison::NotEqual),
            other => Err(format!("unknown operator {other:?}")),
        }
    }
}

/// A parsed `<attribute> <op> <number>` expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    pub attribute: String,
    pub comparison: Comparison,
    pub value: f64,
}

impl Expression {
    /// Parse an expression. Exactly three whitespace-separated tokens are
    /// required.
    pub fn parse(expression: &str) -> Result<Self, ValidationError> {
        let malformed = |reason: String| ValidationError::MalformedExpression {
            expression: expression.to_string(),
            reason,
        };

        let tokens: Vec<&str> = expression.split_whitespace().collect();
        let [attribute, op, value] = tokens.as_slice() else {
            return Err(malformed(format!("expected 3 tokens, found {}", tokens.len())));
        };

        let comparison = op.parse::<Comparison>().map_err(malformed)?;
        let value = value
            .parse::<f64>()
            .map_err(|_| malformed(format!("threshold {value:?} is not a number")))?;
        if !value.is_finite() {
            return Err(malformed("threshold must be finite".to_string()));
        }

        Ok(Self {
            attribute: attribute.to_string(),
            comparison,
            value,
        })
    }

    pub fn holds(&self, observed: f64) -> bool {
        self.comparison.holds(observed, self.value)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.attribute, self.comparison.as_str(), self.value)
    }
}

fn default_period_number() -> u32 {
    1
}

/// A single elasticity rule on a role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElasticityPolicy {
    #[serde(flatten)]
    pub kind: PolicyKind,
    /// `<attribute> <op> <number>`, e.g. `"CPU > 80"`.
    pub expression: String,
    /// Consecutive true samples required before the policy triggers.
    #[serde(default = "default_period_number")]
    pub period_number: u32,
    /// Seconds between samples.
    #[serde(default)]
    pub period: u64,
    /// Cooldown in seconds after this policy scales the role.
    #[serde(default)]
    pub cooldown: Option<u64>,
    /// Most recent samples, newest last, at most `period_number` long.
    #[serde(default)]
    pub true_evals: VecDeque<bool>,
    /// Unix timestamp of the last sample.
    #[serde(default)]
    pub last_eval: Option<u64>,
}

impl ElasticityPolicy {
    pub fn new(kind: PolicyKind, expression: &str) -> Self {
        Self {
            kind,
            expression: expression.to_string(),
            period_number: 1,
            period: 0,
            cooldown: None,
            true_evals: VecDeque::new(),
            last_eval: None,
        }
    }

    pub fn parse_expression(&self) -> Result<Expression, ValidationError> {
        Expression::parse(&self.expression)
    }

    /// Whether `period` seconds have passed since the last sample.
    pub fn due(&self, now: u64) -> bool {
        match self.last_eval {
            Some(last) => now.saturating_sub(last) >= self.period,
            None => true,
        }
    }

    /// Append a sample, dropping the oldest beyond the window size.
    pub fn record(&mut self, value: bool, now: u64) {
        let window = self.period_number.max(1) as usize;
        self.true_evals.push_back(value);
        while self.true_evals.len() > window {
            self.true_evals.pop_front();
        }
        self.last_eval = Some(now);
    }

    /// The window is full and every sample in it held.
    pub fn triggered(&self) -> bool {
        let window = self.period_number.max(1) as usize;
        self.true_evals.len() >= window && self.true_evals.iter().all(|v| *v)
    }

    /// Forget the evaluation history.
    pub fn clear_evals(&mut self) {
        self.true_evals.clear();
        self.last_eval = None;
    }
}
