use std::collections::BTreeSet;
use std::fmt;

use serde::ser::Error as _;
use serde::{Deserialize, Serialize, Serializer};

const CONSTANT: &str = "constant";
const PERCENT: &str = "percent";
const VALUE_IN: &str = "value_in";
const NOT: &str = "not";
const ALL_OF: &str = "all_of";
const ANY_OF: &str = "any_of";
const REF: &str = "ref";

#[cfg(test)]
const KNOWN_KINDS: [&str; 7] = [CONSTANT, PERCENT, VALUE_IN, NOT, ALL_OF, ANY_OF, REF];

/// A boolean decision rule attached to a flag.
///
/// On the wire an expression is a document with a `type` discriminator and one payload field named
/// after it, e.g. `{"type": "percent", "percent": 0.25}`. Payload fields belonging to other types
/// are ignored when reading and never written.
///
/// A document whose `type` is missing or not one this crate knows about still decodes, as
/// [Expr::Unrecognized], so that flags written by newer tooling can be fetched and inspected.
/// Evaluating such a node is always an error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ExprRecord", into = "ExprRecord")]
pub enum Expr {
    /// Always evaluates to the given value.
    Constant(bool),
    /// True for the given fraction of identities; see [crate::in_rollout].
    Percent(f64),
    /// True when the identity is one of the listed values.
    ValueIn(BTreeSet<String>),
    Not(Box<Expr>),
    /// True when every child is true. Evaluated left to right, stopping at the first false child.
    AllOf(Vec<Expr>),
    /// True when any child is true. Evaluated left to right, stopping at the first true child.
    AnyOf(Vec<Expr>),
    /// Defers to another flag; see [crate::RefResolution] for how the target is located.
    Ref(String),
    /// A node with a missing or unknown `type`. `kind` is the raw discriminator, empty if absent.
    Unrecognized { kind: String },
}

impl Expr {
    pub fn constant(value: bool) -> Self {
        Expr::Constant(value)
    }

    pub fn percent(fraction: f64) -> Self {
        Expr::Percent(fraction)
    }

    pub fn value_in<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Expr::ValueIn(values.into_iter().map(Into::into).collect())
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(expr: Expr) -> Self {
        Expr::Not(Box::new(expr))
    }

    pub fn all_of<I: IntoIterator<Item = Expr>>(exprs: I) -> Self {
        Expr::AllOf(exprs.into_iter().collect())
    }

    pub fn any_of<I: IntoIterator<Item = Expr>>(exprs: I) -> Self {
        Expr::AnyOf(exprs.into_iter().collect())
    }

    pub fn reference(target: impl Into<String>) -> Self {
        Expr::Ref(target.into())
    }

    /// The wire discriminator of this node.
    pub fn kind(&self) -> &str {
        match self {
            Expr::Constant(_) => CONSTANT,
            Expr::Percent(_) => PERCENT,
            Expr::ValueIn(_) => VALUE_IN,
            Expr::Not(_) => NOT,
            Expr::AllOf(_) => ALL_OF,
            Expr::AnyOf(_) => ANY_OF,
            Expr::Ref(_) => REF,
            Expr::Unrecognized { kind } => kind,
        }
    }
}

/// Returned when an expression document names a known type but its payload is missing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MissingPayload {
    kind: &'static str,
}

impl fmt::Display for MissingPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "expression of type {:?} has no {:?} field",
            self.kind, self.kind
        )
    }
}

impl std::error::Error for MissingPayload {}

// Flat mirror of the stored document. Every payload is optional here so that we can ignore the
// fields of inactive variants and report a missing active payload with a useful message.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct ExprRecord {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    constant: Option<bool>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_finite_fraction"
    )]
    percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value_in: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    not: Option<Box<Expr>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    all_of: Option<Vec<Expr>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    any_of: Option<Vec<Expr>>,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    reference: Option<String>,
}

// JSON has no representation for NaN or the infinities; serde_json would write them as null,
// which then fails to decode as a missing payload.
fn serialize_finite_fraction<S>(fraction: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match fraction {
        Some(f) if !f.is_finite() => Err(S::Error::custom(format!(
            "percent fraction {} is not a finite number",
            f
        ))),
        _ => fraction.serialize(serializer),
    }
}

fn required<T>(payload: Option<T>, kind: &'static str) -> Result<T, MissingPayload> {
    payload.ok_or(MissingPayload { kind })
}

impl TryFrom<ExprRecord> for Expr {
    type Error = MissingPayload;

    fn try_from(record: ExprRecord) -> Result<Self, Self::Error> {
        let kind = record.kind.unwrap_or_default();
        Ok(match kind.as_str() {
            CONSTANT => Expr::Constant(required(record.constant, CONSTANT)?),
            PERCENT => Expr::Percent(required(record.percent, PERCENT)?),
            VALUE_IN => Expr::ValueIn(required(record.value_in, VALUE_IN)?),
            NOT => Expr::Not(required(record.not, NOT)?),
            ALL_OF => Expr::AllOf(required(record.all_of, ALL_OF)?),
            ANY_OF => Expr::AnyOf(required(record.any_of, ANY_OF)?),
            REF => Expr::Ref(required(record.reference, REF)?),
            other => Expr::Unrecognized {
                kind: other.to_string(),
            },
        })
    }
}

impl From<Expr> for ExprRecord {
    fn from(expr: Expr) -> Self {
        let mut record = ExprRecord {
            kind: Some(expr.kind().to_string()),
            ..ExprRecord::default()
        };
        match expr {
            Expr::Constant(b) => record.constant = Some(b),
            Expr::Percent(f) => record.percent = Some(f),
            Expr::ValueIn(values) => record.value_in = Some(values),
            Expr::Not(inner) => record.not = Some(inner),
            Expr::AllOf(exprs) => record.all_of = Some(exprs),
            Expr::AnyOf(exprs) => record.any_of = Some(exprs),
            Expr::Ref(target) => record.reference = Some(target),
            Expr::Unrecognized { kind } => {
                record.kind = if kind.is_empty() { None } else { Some(kind) };
            }
        }
        record
    }
}
