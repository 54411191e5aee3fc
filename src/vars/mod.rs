//! Hierarchical variable scopes.
//!
//! A [`Variables`] handle points at one scope. Lookups walk the parent chain,
//! writes always land in the scope the handle points at. Named sub-scopes are
//! rendered as nested objects when the scope is flattened for queries, which
//! is how task status scopes become reachable as `.tasks.<id>.result`.

pub mod query;

pub use query::{Query, is_truthy};

use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, LazyLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::trace;

/// Errors raised while resolving queries or injecting variables into configs
#[derive(Debug, thiserror::Error)]
pub enum VarsError {
    #[error("failed parsing query `{query}`: {message}")]
    QueryParse { query: String, message: String },

    #[error("failed evaluating query `{query}`: {message}")]
    QueryEval { query: String, message: String },

    #[error("config conversion failed: {0}")]
    Conversion(#[from] serde_json::Error),

    #[error("config is not an object, cannot set field `{0}`")]
    NotAnObject(String),
}

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\{(.*?)\}\}|\$\{([A-Za-z0-9_.\-\[\]]+)\}").expect("placeholder regex is valid")
});

#[derive(Default)]
struct Scope {
    parent: Option<Variables>,
    vars: RwLock<BTreeMap<String, Value>>,
    sub_scopes: RwLock<BTreeMap<String, Variables>>,
}

/// Cheaply cloneable handle to a variable scope
#[derive(Clone, Default)]
pub struct Variables {
    scope: Arc<Scope>,
}

impl fmt::Debug for Variables {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variables")
            .field("vars", &*read(&self.scope.vars))
            .field("sub_scopes", &read(&self.scope.sub_scopes).keys().collect::<Vec<_>>())
            .field("has_parent", &self.scope.parent.is_some())
            .finish()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl Variables {
    /// Create a new root scope
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a child scope that falls back to this scope on lookups
    pub fn new_scope(&self) -> Self {
        Self {
            scope: Arc::new(Scope {
                parent: Some(self.clone()),
                ..Default::default()
            }),
        }
    }

    /// Whether both handles point at the same scope
    pub fn same_scope(&self, other: &Variables) -> bool {
        Arc::ptr_eq(&self.scope, &other.scope)
    }

    pub fn get_var(&self, name: &str) -> Option<Value> {
        if let Some(value) = read(&self.scope.vars).get(name) {
            return Some(value.clone());
        }
        self.scope.parent.as_ref().and_then(|p| p.get_var(name))
    }

    pub fn set_var(&self, name: impl Into<String>, value: impl Into<Value>) {
        write(&self.scope.vars).insert(name.into(), value.into());
    }

    /// Set a variable only if it is not visible through the parent chain yet
    pub fn set_default_var(&self, name: &str, value: impl Into<Value>) {
        if self.get_var(name).is_none() {
            self.set_var(name, value);
        }
    }

    /// Replace the named sub-scope with a fresh, parentless scope
    pub fn new_sub_scope(&self, name: &str) -> Variables {
        let sub = Variables::new();
        write(&self.scope.sub_scopes).insert(name.to_string(), sub.clone());
        sub
    }

    /// Get the named sub-scope of this scope, creating it when missing
    pub fn get_sub_scope(&self, name: &str) -> Variables {
        if let Some(sub) = read(&self.scope.sub_scopes).get(name) {
            return sub.clone();
        }
        write(&self.scope.sub_scopes)
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    pub fn set_sub_scope(&self, name: &str, sub: Variables) {
        write(&self.scope.sub_scopes).insert(name.to_string(), sub);
    }

    /// Flatten this scope and its ancestors into one object.
    ///
    /// Child values override parent values; sub-scopes are deep-merged so a
    /// child's `tasks` scope does not hide its parent's.
    pub fn get_vars_map(&self) -> Map<String, Value> {
        let mut map = match &self.scope.parent {
            Some(parent) => parent.get_vars_map(),
            None => Map::new(),
        };

        for (name, value) in read(&self.scope.vars).iter() {
            map.insert(name.clone(), value.clone());
        }

        let subs: Vec<(String, Variables)> = read(&self.scope.sub_scopes)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (name, sub) in subs {
            merge_value(&mut map, name, Value::Object(sub.get_vars_map()));
        }

        map
    }

    /// Replace `${name}` and `${{ query }}` placeholders.
    ///
    /// Unresolvable placeholders are left untouched.
    pub fn resolve_placeholders(&self, input: &str) -> String {
        if !input.contains("${") {
            return input.to_string();
        }

        PLACEHOLDER_RE
            .replace_all(input, |caps: &regex::Captures<'_>| {
                let query = match (caps.get(1), caps.get(2)) {
                    (Some(q), _) => q.as_str().trim().to_string(),
                    (None, Some(name)) => format!(".{}", name.as_str()),
                    _ => return caps[0].to_string(),
                };
                match self.resolve_query(&query) {
                    Ok((Value::String(s), true)) => s,
                    Ok((value, true)) => value.to_string(),
                    Ok((_, false)) => caps[0].to_string(),
                    Err(err) => {
                        trace!("placeholder {} not resolved: {}", &caps[0], err);
                        caps[0].to_string()
                    }
                }
            })
            .into_owned()
    }

    /// Evaluate a query against the flattened scope.
    ///
    /// Returns the value and whether it was found (non-null).
    pub fn resolve_query(&self, expr: &str) -> Result<(Value, bool), VarsError> {
        let query = Query::parse(expr)?;
        let value = query.evaluate(&Value::Object(self.get_vars_map()))?;
        let found = !value.is_null();
        Ok((value, found))
    }

    /// Overwrite fields of `config` with the results of variable queries.
    ///
    /// `config_vars` maps a (serialized) config field name to a query. Queries
    /// that resolve to null leave the field untouched.
    pub fn consume_vars<T>(
        &self,
        config: &mut T,
        config_vars: &BTreeMap<String, String>,
    ) -> Result<(), VarsError>
    where
        T: Serialize + DeserializeOwned,
    {
        if config_vars.is_empty() {
            return Ok(());
        }

        let mut value = serde_json::to_value(&*config)?;
        let fields = value
            .as_object_mut()
            .ok_or_else(|| VarsError::NotAnObject(config_vars.keys().cloned().collect::<Vec<_>>().join(",")))?;

        for (field, expr) in config_vars {
            let (resolved, found) = self.resolve_query(expr)?;
            if found {
                fields.insert(field.clone(), resolved);
            }
        }

        *config = serde_json::from_value(value)?;
        Ok(())
    }

    /// Copy query results from `source` into this scope (target name -> query)
    pub fn copy_vars(
        &self,
        source: &Variables,
        copy_vars: &BTreeMap<String, String>,
    ) -> Result<(), VarsError> {
        for (name, expr) in copy_vars {
            let (value, found) = source.resolve_query(expr)?;
            if found {
                self.set_var(name.clone(), value);
            }
        }
        Ok(())
    }
}

fn merge_value(map: &mut Map<String, Value>, key: String, value: Value) {
    match (map.get_mut(&key), value) {
        (Some(Value::Object(existing)), Value::Object(incoming)) => {
            for (k, v) in incoming {
                merge_value(existing, k, v);
            }
        }
        (_, value) => {
            map.insert(key, value);
        }
    }
}
