use std::fmt;

use serde::{Deserialize, Serialize};

use crate::eval::Error;
use crate::expr::Expr;

/// Identifies a flag: names are unique within a namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlagKey {
    pub namespace: String,
    pub name: String,
}

impl FlagKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        FlagKey {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for FlagKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A named, namespaced decision rule.
///
/// Flags are immutable once read from a [crate::Store]; changing a rule means writing a new flag
/// through a [crate::FlagWriter].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Flag {
    pub namespace: String,
    pub name: String,
    pub expr: Expr,
}

impl Flag {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, expr: Expr) -> Self {
        Flag {
            namespace: namespace.into(),
            name: name.into(),
            expr,
        }
    }

    /// Builds a flag from an expression serialized as a JSON document, as accepted by the flag
    /// creation command.
    pub fn from_serialized(
        namespace: impl Into<String>,
        name: impl Into<String>,
        expression: &str,
    ) -> Result<Self, Error> {
        let expr = serde_json::from_str(expression)
            .map_err(|e| Error::MalformedExpression(e.to_string()))?;
        Ok(Flag::new(namespace, name, expr))
    }

    pub fn key(&self) -> FlagKey {
        FlagKey::new(self.namespace.as_str(), self.name.as_str())
    }

    /// The flag's expression as a JSON document.
    pub fn serialized_expr(&self) -> Result<String, Error> {
        serde_json::to_string(&self.expr).map_err(|e| Error::MalformedExpression(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_eq;
    use serde_json::json;
    use spectral::prelude::*;

    #[test]
    fn key_displays_as_path() {
        let flag = Flag::new("checkout", "new-flow", Expr::constant(true));
        assert_that!(flag.key().to_string()).is_equal_to("checkout/new-flow".to_string());
    }

    #[test]
    fn builds_flag_from_serialized_expression() {
        let flag = Flag::from_serialized(
            "checkout",
            "new-flow",
            r#"{"type": "all_of", "all_of": [
                {"type": "constant", "constant": true},
                {"type": "value_in", "value_in": ["beta-user-1", "beta-user-2"]}
            ]}"#,
        )
        .unwrap();

        assert_that!(flag).is_equal_to(Flag::new(
            "checkout",
            "new-flow",
            Expr::all_of(vec![
                Expr::constant(true),
                Expr::value_in(vec!["beta-user-1", "beta-user-2"]),
            ]),
        ));
    }

    #[test]
    fn rejects_unparseable_expression() {
        let result = Flag::from_serialized("checkout", "new-flow", r#"{"type": "constant""#);
        assert_that!(matches!(result, Err(Error::MalformedExpression(_)))).is_true();

        let result = Flag::from_serialized("checkout", "new-flow", r#"{"type": "percent"}"#);
        assert_that!(matches!(result, Err(Error::MalformedExpression(_)))).is_true();
    }

    #[test]
    fn serialized_expression_passes_through() {
        let flag = Flag::new("checkout", "rollout", Expr::not(Expr::percent(0.25)));
        let serialized = flag.serialized_expr().unwrap();

        assert_json_eq!(
            serde_json::from_str::<serde_json::Value>(&serialized).unwrap(),
            json!({"type": "not", "not": {"type": "percent", "percent": 0.25}})
        );
        assert_that!(Flag::from_serialized("checkout", "rollout", &serialized))
            .is_ok_containing(flag);
    }

    #[test]
    fn non_finite_fraction_cannot_be_serialized() {
        let flag = Flag::new("checkout", "rollout", Expr::percent(f64::INFINITY));
        let result = flag.serialized_expr();
        assert_that!(matches!(result, Err(Error::MalformedExpression(_)))).is_true();
    }

    #[test]
    fn flag_document_nests_expression() {
        let flag = Flag::new("checkout", "new-flow", Expr::reference("rollout"));
        assert_json_eq!(
            serde_json::to_value(&flag).unwrap(),
            json!({
                "namespace": "checkout",
                "name": "new-flow",
                "expr": {"type": "ref", "ref": "rollout"}
            })
        );
    }
}
