#![cfg(test)]

use crate::eval::Error;
use crate::flag::Flag;
use crate::store::{FlagWriter, InMemoryStore, Store};
use maplit::hashmap;
use std::cell::Cell;

/// A flag table seeded with fixtures, counting every lookup it serves.
pub struct TestStore {
    store: InMemoryStore,
    lookups: Cell<usize>,
}

impl TestStore {
    pub fn new() -> Self {
        let expressions = hashmap! {
            ("checkout", "new-flow") => r#"{
                    "type": "all_of",
                    "all_of": [
                        {"type": "constant", "constant": true},
                        {"type": "value_in", "value_in": ["beta-user-1", "beta-user-2"]}
                    ]
                }"#,
            ("checkout", "rollout") => r#"{"type": "percent", "percent": 0.25}"#,
            ("checkout", "beta-users") => r#"{
                    "type": "value_in",
                    "value_in": ["beta-user-1", "beta-user-2"]
                }"#,
            ("checkout", "beta-gate") => r#"{"type": "ref", "ref": "beta-users"}"#,
            ("checkout", "diamond") => r#"{
                    "type": "any_of",
                    "any_of": [
                        {"type": "all_of", "all_of": [
                            {"type": "ref", "ref": "beta-users"},
                            {"type": "constant", "constant": false}
                        ]},
                        {"type": "ref", "ref": "beta-users"}
                    ]
                }"#,
            ("checkout", "self-loop") => r#"{"type": "ref", "ref": "self-loop"}"#,
            ("checkout", "ping") => r#"{"type": "not", "not": {"type": "ref", "ref": "pong"}}"#,
            ("checkout", "pong") => r#"{"type": "ref", "ref": "ping"}"#,
            ("checkout", "future") => r#"{"type": "geo_in", "geo_in": ["US"]}"#,
            ("checkout", "untyped") => r#"{"constant": true}"#,
            ("checkout", "refers-to-broken") => r#"{"type": "ref", "ref": "broken"}"#,
            ("checkout", "legacy-gate") => r#"{"type": "ref", "ref": "allowlist"}"#,
            ("allowlist", "beta-user-1") => r#"{"type": "value_in", "value_in": [""]}"#,
        };

        let store = InMemoryStore::new();
        for ((namespace, name), expression) in expressions {
            let flag = Flag::from_serialized(namespace, name, expression).unwrap();
            store.put_flag(&flag).unwrap();
        }
        store
            .put_raw(
                "checkout",
                "broken",
                r#"{"namespace": "checkout", "name": "broken", "expr": "{\"type\": \"not\"}"}"#,
            )
            .unwrap();

        Self {
            store,
            lookups: Cell::new(0),
        }
    }

    pub fn lookups(&self) -> usize {
        self.lookups.get()
    }
}

impl Store for TestStore {
    fn flag(&self, namespace: &str, name: &str) -> Result<Flag, Error> {
        self.lookups.set(self.lookups.get() + 1);
        self.store.flag(namespace, name)
    }
}

/// A store whose backend can never be reached.
pub struct UnavailableStore;

impl Store for UnavailableStore {
    fn flag(&self, _namespace: &str, _name: &str) -> Result<Flag, Error> {
        Err(Error::StorageUnavailable("connection refused".to_string()))
    }
}
