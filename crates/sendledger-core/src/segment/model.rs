//! Segment data models and filter expression evaluation.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Maximum combinator nesting accepted by validation. An owned tree cannot
/// contain reference cycles, so a depth cap is what rejects pathological
/// structures handed in by buggy callers.
pub const MAX_FILTER_DEPTH: usize = 64;

/// Unique identifier for a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentId(pub i64);

impl SegmentId {
    /// Create a new segment ID.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Comparison operator for a filter leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    /// Attribute equals the value.
    Equals,
    /// Attribute is set and differs from the value.
    NotEquals,
    /// Attribute contains the value as a substring.
    Contains,
    /// Attribute is greater than the value.
    GreaterThan,
    /// Attribute is less than the value.
    LessThan,
    /// Attribute is present, value ignored.
    IsSet,
    /// Attribute is absent, value ignored.
    IsUnset,
}

impl CompareOp {
    /// Whether this operator needs a comparison value.
    #[must_use]
    pub const fn requires_value(self) -> bool {
        !matches!(self, Self::IsSet | Self::IsUnset)
    }
}

/// A declarative audience filter over recipient attributes.
///
/// A closed recursive sum type: leaves compare one attribute, internal
/// nodes combine sub-expressions. Combinators short-circuit left to right.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterExpr {
    /// Leaf comparison on a single attribute.
    Compare {
        /// Attribute key.
        key: String,
        /// Comparison operator.
        op: CompareOp,
        /// Comparison value (required unless op is `IsSet`/`IsUnset`).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },
    /// All sub-expressions must match (AND).
    All {
        /// Sub-expressions, evaluated left to right.
        exprs: Vec<FilterExpr>,
    },
    /// Any sub-expression must match (OR).
    Any {
        /// Sub-expressions, evaluated left to right.
        exprs: Vec<FilterExpr>,
    },
    /// Sub-expression must not match (NOT).
    Not {
        /// Negated sub-expression.
        expr: Box<FilterExpr>,
    },
}

impl FilterExpr {
    /// Leaf comparison builder.
    #[must_use]
    pub fn compare(key: impl Into<String>, op: CompareOp, value: Option<&str>) -> Self {
        Self::Compare {
            key: key.into(),
            op,
            value: value.map(ToString::to_string),
        }
    }

    /// Shorthand for an equality leaf.
    #[must_use]
    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Compare {
            key: key.into(),
            op: CompareOp::Equals,
            value: Some(value.into()),
        }
    }

    /// AND combinator builder.
    #[must_use]
    pub fn all(exprs: Vec<Self>) -> Self {
        Self::All { exprs }
    }

    /// OR combinator builder.
    #[must_use]
    pub fn any(exprs: Vec<Self>) -> Self {
        Self::Any { exprs }
    }

    /// NOT combinator builder.
    #[must_use]
    pub fn negate(expr: Self) -> Self {
        Self::Not {
            expr: Box::new(expr),
        }
    }

    /// Evaluates the filter against a recipient's attribute map.
    ///
    /// Value operators treat a missing attribute as no-match; only
    /// `IsUnset` matches absence.
    #[must_use]
    pub fn matches(&self, attributes: &BTreeMap<String, String>) -> bool {
        match self {
            Self::Compare { key, op, value } => {
                let actual = attributes.get(key);
                match op {
                    CompareOp::IsSet => actual.is_some(),
                    CompareOp::IsUnset => actual.is_none(),
                    CompareOp::Equals => {
                        matches!((actual, value), (Some(a), Some(v)) if a == v)
                    }
                    CompareOp::NotEquals => {
                        matches!((actual, value), (Some(a), Some(v)) if a != v)
                    }
                    CompareOp::Contains => {
                        matches!((actual, value), (Some(a), Some(v)) if a.contains(v.as_str()))
                    }
                    CompareOp::GreaterThan => matches!(
                        (actual, value),
                        (Some(a), Some(v)) if compare_values(a, v) == Ordering::Greater
                    ),
                    CompareOp::LessThan => matches!(
                        (actual, value),
                        (Some(a), Some(v)) if compare_values(a, v) == Ordering::Less
                    ),
                }
            }
            Self::All { exprs } => exprs.iter().all(|e| e.matches(attributes)),
            Self::Any { exprs } => exprs.iter().any(|e| e.matches(attributes)),
            Self::Not { expr } => !expr.matches(attributes),
        }
    }

    /// Validates the expression structure.
    ///
    /// Checks nesting depth, operator/value agreement, and, when an
    /// attribute schema is supplied, that every compared key is known.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFilterExpression`] describing the first
    /// violation found.
    pub fn validate(&self, schema: Option<&BTreeSet<String>>) -> Result<()> {
        self.validate_at(schema, 0)
    }

    fn validate_at(&self, schema: Option<&BTreeSet<String>>, depth: usize) -> Result<()> {
        if depth > MAX_FILTER_DEPTH {
            return Err(Error::InvalidFilterExpression(format!(
                "nesting exceeds {MAX_FILTER_DEPTH} levels"
            )));
        }

        match self {
            Self::Compare { key, op, value } => {
                if key.is_empty() {
                    return Err(Error::InvalidFilterExpression(
                        "empty attribute key".into(),
                    ));
                }
                if op.requires_value() && value.is_none() {
                    return Err(Error::InvalidFilterExpression(format!(
                        "operator {op:?} requires a value for key '{key}'"
                    )));
                }
                if !op.requires_value() && value.is_some() {
                    return Err(Error::InvalidFilterExpression(format!(
                        "operator {op:?} takes no value for key '{key}'"
                    )));
                }
                if let Some(known) = schema {
                    if !known.contains(key) {
                        return Err(Error::InvalidFilterExpression(format!(
                            "unknown attribute key '{key}'"
                        )));
                    }
                }
                Ok(())
            }
            Self::All { exprs } | Self::Any { exprs } => {
                if exprs.is_empty() {
                    return Err(Error::InvalidFilterExpression(
                        "empty combinator".into(),
                    ));
                }
                for expr in exprs {
                    expr.validate_at(schema, depth + 1)?;
                }
                Ok(())
            }
            Self::Not { expr } => expr.validate_at(schema, depth + 1),
        }
    }
}

/// Compares attribute values numerically when both parse as numbers,
/// lexicographically otherwise.
fn compare_values(a: &str, b: &str) -> Ordering {
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => a.cmp(b),
    }
}

/// A saved audience filter.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Unique identifier (None for unsaved segments).
    pub id: Option<SegmentId>,
    /// Display name.
    pub name: String,
    /// The audience filter.
    pub filter: FilterExpr,
    /// Audience size from the most recent evaluation.
    pub cached_count: Option<u32>,
    /// When the cached count was computed.
    pub evaluated_at: Option<DateTime<Utc>>,
    /// When the segment was created.
    pub created_at: Option<DateTime<Utc>>,
}

impl Segment {
    /// Creates a new unsaved segment.
    #[must_use]
    pub fn new(name: impl Into<String>, filter: FilterExpr) -> Self {
        Self {
            id: None,
            name: name.into(),
            filter,
            cached_count: None,
            evaluated_at: None,
            created_at: None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn equals_and_not_equals() {
        let gold = FilterExpr::equals("tier", "gold");
        assert!(gold.matches(&attrs(&[("tier", "gold")])));
        assert!(!gold.matches(&attrs(&[("tier", "silver")])));
        assert!(!gold.matches(&attrs(&[])));

        let not_gold = FilterExpr::compare("tier", CompareOp::NotEquals, Some("gold"));
        assert!(not_gold.matches(&attrs(&[("tier", "silver")])));
        // Missing attribute is no-match, not "not equal".
        assert!(!not_gold.matches(&attrs(&[])));
    }

    #[test]
    fn contains_and_set_ops() {
        let city = FilterExpr::compare("city", CompareOp::Contains, Some("York"));
        assert!(city.matches(&attrs(&[("city", "New York")])));
        assert!(!city.matches(&attrs(&[("city", "Boston")])));

        let has_city = FilterExpr::compare("city", CompareOp::IsSet, None);
        assert!(has_city.matches(&attrs(&[("city", "Oslo")])));
        assert!(!has_city.matches(&attrs(&[])));

        let no_city = FilterExpr::compare("city", CompareOp::IsUnset, None);
        assert!(no_city.matches(&attrs(&[])));
    }

    #[test]
    fn ordering_is_numeric_when_possible() {
        let expr = FilterExpr::compare("age", CompareOp::GreaterThan, Some("9"));
        // "10" > "9" numerically even though it sorts lower as a string.
        assert!(expr.matches(&attrs(&[("age", "10")])));
        assert!(!expr.matches(&attrs(&[("age", "9")])));

        let lex = FilterExpr::compare("name", CompareOp::LessThan, Some("b"));
        assert!(lex.matches(&attrs(&[("name", "a")])));
    }

    #[test]
    fn combinators_compose() {
        let expr = FilterExpr::all(vec![
            FilterExpr::equals("tier", "gold"),
            FilterExpr::negate(FilterExpr::equals("region", "us")),
        ]);
        assert!(expr.matches(&attrs(&[("tier", "gold"), ("region", "eu")])));
        assert!(!expr.matches(&attrs(&[("tier", "gold"), ("region", "us")])));

        let either = FilterExpr::any(vec![
            FilterExpr::equals("tier", "gold"),
            FilterExpr::equals("tier", "silver"),
        ]);
        assert!(either.matches(&attrs(&[("tier", "silver")])));
        assert!(!either.matches(&attrs(&[("tier", "bronze")])));
    }

    #[test]
    fn validation_rejects_missing_value() {
        let expr = FilterExpr::compare("tier", CompareOp::Equals, None);
        assert!(matches!(
            expr.validate(None),
            Err(Error::InvalidFilterExpression(_))
        ));
    }

    #[test]
    fn validation_rejects_value_on_set_ops() {
        let expr = FilterExpr::compare("tier", CompareOp::IsSet, Some("x"));
        assert!(expr.validate(None).is_err());
    }

    #[test]
    fn validation_rejects_unknown_schema_key() {
        let schema: BTreeSet<String> = ["tier".to_string()].into_iter().collect();
        assert!(FilterExpr::equals("tier", "gold").validate(Some(&schema)).is_ok());
        assert!(FilterExpr::equals("plan", "gold").validate(Some(&schema)).is_err());
    }

    #[test]
    fn validation_rejects_excessive_nesting() {
        let mut expr = FilterExpr::equals("tier", "gold");
        for _ in 0..=MAX_FILTER_DEPTH {
            expr = FilterExpr::negate(expr);
        }
        assert!(matches!(
            expr.validate(None),
            Err(Error::InvalidFilterExpression(_))
        ));
    }

    #[test]
    fn validation_rejects_empty_combinator() {
        assert!(FilterExpr::all(vec![]).validate(None).is_err());
    }

    #[test]
    fn serde_round_trip() {
        let expr = FilterExpr::all(vec![
            FilterExpr::equals("tier", "gold"),
            FilterExpr::compare("city", CompareOp::IsUnset, None),
        ]);
        let json = serde_json::to_string(&expr).unwrap();
        let parsed: FilterExpr = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, expr);
    }
}
