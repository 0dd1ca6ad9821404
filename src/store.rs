use std::collections::HashMap;
use std::sync::RwLock;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_with::json::JsonString;
use serde_with::serde_as;

use crate::eval::Error;
use crate::expr::Expr;
use crate::flag::{Flag, FlagKey};

/// Store is the read side of the flag database, consulted once for the flag being evaluated and
/// once more for every `ref` node reached.
///
/// Implementations report a missing flag as [Error::NotFound] and any infrastructure failure as
/// [Error::StorageUnavailable]; both abort the evaluation that triggered the lookup. A store that
/// is safe for concurrent reads may be shared by any number of evaluations at once.
pub trait Store {
    /// Retrieve the flag named `name` in `namespace`.
    fn flag(&self, namespace: &str, name: &str) -> Result<Flag, Error>;
}

/// FlagWriter is the write side of the flag database. Writing a flag replaces any previous flag
/// with the same namespace and name.
pub trait FlagWriter {
    fn put_flag(&self, flag: &Flag) -> Result<(), Error>;
}

/// The persisted form of a flag: the namespace and name are the record key, and the expression is
/// embedded as a JSON document in a string-valued `expr` column.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlagRecord {
    pub namespace: String,
    pub name: String,
    #[serde_as(as = "JsonString")]
    pub expr: Expr,
}

impl FlagRecord {
    pub fn encode(flag: &Flag) -> Result<String, Error> {
        let record = FlagRecord {
            namespace: flag.namespace.clone(),
            name: flag.name.clone(),
            expr: flag.expr.clone(),
        };
        serde_json::to_string(&record).map_err(|e| Error::MalformedExpression(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<FlagRecord, Error> {
        serde_json::from_str(raw).map_err(|e| Error::MalformedExpression(e.to_string()))
    }
}

impl From<FlagRecord> for Flag {
    fn from(record: FlagRecord) -> Self {
        Flag::new(record.namespace, record.name, record.expr)
    }
}

/// An in-process flag table holding encoded [FlagRecord]s, decoded on every read.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: RwLock<HashMap<FlagKey, String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an already-encoded record under the given key without validating it, the way an
    /// external writer sharing the table might.
    pub fn put_raw(
        &self,
        namespace: impl Into<String>,
        name: impl Into<String>,
        raw: impl Into<String>,
    ) -> Result<(), Error> {
        let mut records = self.records.write().map_err(|_| poisoned())?;
        records.insert(FlagKey::new(namespace, name), raw.into());
        Ok(())
    }

    pub fn len(&self) -> Result<usize, Error> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records.len())
    }

    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.len()? == 0)
    }
}

fn poisoned() -> Error {
    Error::StorageUnavailable("flag table lock poisoned".to_string())
}

impl Store for InMemoryStore {
    fn flag(&self, namespace: &str, name: &str) -> Result<Flag, Error> {
        let records = self.records.read().map_err(|_| poisoned())?;
        let key = FlagKey::new(namespace, name);
        match records.get(&key) {
            Some(raw) => {
                let record = FlagRecord::decode(raw)?;
                if record.namespace != key.namespace || record.name != key.name {
                    warn!(
                        "record stored under {} names itself {}/{}",
                        key, record.namespace, record.name
                    );
                }
                // The table key is authoritative for the flag's identity.
                Ok(Flag::new(key.namespace, key.name, record.expr))
            }
            None => {
                debug!("no record for flag {}", key);
                Err(Error::NotFound(key))
            }
        }
    }
}

impl FlagWriter for InMemoryStore {
    fn put_flag(&self, flag: &Flag) -> Result<(), Error> {
        let raw = FlagRecord::encode(flag)?;
        debug!("writing flag {}", flag.key());
        self.put_raw(flag.namespace.as_str(), flag.name.as_str(), raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_eq;
    use serde_json::json;
    use spectral::prelude::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn reads_back_written_flag() {
        let store = InMemoryStore::new();
        let flag = Flag::new("checkout", "rollout", Expr::percent(0.25));
        store.put_flag(&flag).unwrap();

        assert_that!(store.flag("checkout", "rollout")).is_ok_containing(flag);
        assert_that!(store.len()).is_ok_containing(1);
    }

    #[test]
    fn missing_flag_is_not_found() {
        let store = InMemoryStore::new();
        store
            .put_flag(&Flag::new("checkout", "rollout", Expr::percent(0.25)))
            .unwrap();

        assert_that!(store.flag("checkout", "new-flow"))
            .is_err_containing(Error::NotFound(FlagKey::new("checkout", "new-flow")));
        asserting!("namespace is part of the key")
            .that(&store.flag("billing", "rollout"))
            .is_err_containing(Error::NotFound(FlagKey::new("billing", "rollout")));
    }

    #[test]
    fn writing_again_replaces_flag() {
        let store = InMemoryStore::new();
        store
            .put_flag(&Flag::new("checkout", "rollout", Expr::percent(0.25)))
            .unwrap();
        store
            .put_flag(&Flag::new("checkout", "rollout", Expr::percent(0.5)))
            .unwrap();

        assert_that!(store.flag("checkout", "rollout").unwrap().expr)
            .is_equal_to(Expr::percent(0.5));
        assert_that!(store.len()).is_ok_containing(1);
    }

    #[test]
    fn record_embeds_expression_as_json_string() {
        let flag = Flag::new("checkout", "beta", Expr::value_in(vec!["beta-user-1"]));
        let raw = FlagRecord::encode(&flag).unwrap();

        assert_json_eq!(
            serde_json::from_str::<serde_json::Value>(&raw).unwrap(),
            json!({
                "namespace": "checkout",
                "name": "beta",
                "expr": r#"{"type":"value_in","value_in":["beta-user-1"]}"#
            })
        );
        assert_that!(FlagRecord::decode(&raw).map(Flag::from)).is_ok_containing(flag);
    }

    #[test]
    fn undecodable_record_is_malformed() {
        let store = InMemoryStore::new();
        store
            .put_raw(
                "checkout",
                "broken",
                r#"{"namespace": "checkout", "name": "broken", "expr": "{\"type\": \"percent\"}"}"#,
            )
            .unwrap();
        store.put_raw("checkout", "garbage", "not json").unwrap();

        for name in ["broken", "garbage"] {
            let result = store.flag("checkout", name);
            assert!(
                matches!(result, Err(Error::MalformedExpression(_))),
                "{} should fail to decode, got {:?}",
                name,
                result
            );
        }
    }

    #[test]
    fn record_with_unknown_expression_type_still_loads() {
        let store = InMemoryStore::new();
        store
            .put_raw(
                "checkout",
                "future",
                r#"{"namespace": "checkout", "name": "future", "expr": "{\"type\": \"geo_in\"}"}"#,
            )
            .unwrap();

        assert_that!(store.flag("checkout", "future").unwrap().expr).is_equal_to(
            Expr::Unrecognized {
                kind: "geo_in".into(),
            },
        );
    }

    #[test]
    fn poisoned_table_is_unavailable() {
        let store = Arc::new(InMemoryStore::new());
        let poisoner = Arc::clone(&store);
        let _ = thread::spawn(move || {
            let _guard = poisoner.records.write().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert_that!(store.flag("checkout", "rollout")).is_err_containing(poisoned());
        assert_that!(store.put_flag(&Flag::new("checkout", "rollout", Expr::percent(0.1))))
            .is_err_containing(poisoned());
        assert_that!(store.len()).is_err_containing(poisoned());
        assert_that!(store.is_empty()).is_err_containing(poisoned());
    }

    #[test]
    fn lookup_key_names_the_returned_flag() {
        let store = InMemoryStore::new();
        store
            .put_raw(
                "checkout",
                "rollout",
                r#"{"namespace": "billing", "name": "other", "expr": "{\"type\": \"constant\", \"constant\": true}"}"#,
            )
            .unwrap();

        assert_that!(store.flag("checkout", "rollout")).is_ok_containing(Flag::new(
            "checkout",
            "rollout",
            Expr::constant(true),
        ));
    }

    #[test]
    fn non_finite_fraction_is_not_written() {
        let store = InMemoryStore::new();
        for fraction in [f64::INFINITY, f64::NAN] {
            let result = store.put_flag(&Flag::new("checkout", "rollout", Expr::percent(fraction)));
            assert!(
                matches!(result, Err(Error::MalformedExpression(_))),
                "writing a {} fraction should fail, got {:?}",
                fraction,
                result
            );
        }

        assert_that!(store.is_empty()).is_ok_containing(true);
        assert_that!(store.flag("checkout", "rollout"))
            .is_err_containing(Error::NotFound(FlagKey::new("checkout", "rollout")));
    }

    #[test]
    fn concurrent_reads_see_the_same_flag() {
        let store = InMemoryStore::new();
        let flag = Flag::new("checkout", "rollout", Expr::percent(0.25));
        store.put_flag(&flag).unwrap();

        thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| s.spawn(|| store.flag("checkout", "rollout")))
                .collect();
            for handle in handles {
                assert_that!(handle.join().unwrap()).is_ok_containing(&flag);
            }
        });
    }
}
