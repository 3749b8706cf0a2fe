//! Parameter façade – component properties backed by a parameter store.
//!
//! A component owns a set of named properties.  [`ParamFacade`] copies them
//! from a [`ParamStore`] (`get*`) or into it (`set*`), resolving each
//! property name to a store key with a [`ResolutionPolicy`]:
//!
//! | Policy      | `"gain"` on component `arm` resolves to |
//! |-------------|-----------------------------------------|
//! | `Relative`  | `gain`                                  |
//! | `Absolute`  | `/gain`                                 |
//! | `Private`   | `~gain`                                 |
//! | `Component` | `~arm/gain`                             |
//!
//! `~` stands for the private namespace of the node hosting the component;
//! the store expands it.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use flowbridge_services::param::{MemoryParamStore, ParamFacade, ResolutionPolicy};
//! use serde_json::json;
//!
//! let store = Arc::new(MemoryParamStore::new("/node"));
//! store.insert("/node/arm/gain", json!(2.5));
//!
//! let params = ParamFacade::new("arm", store);
//! params.add_property("gain", json!(1.0));
//! params.get("gain", ResolutionPolicy::Component).unwrap();
//! assert_eq!(params.property("gain"), Some(json!(2.5)));
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use flowbridge_types::TransportError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from parameter operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParamError {
    #[error("Parameter not found: {0}")]
    NotFound(String),
    #[error("Component has no property named {0}")]
    UnknownProperty(String),
    #[error("Parameter {key} holds {found}, property expects {expected}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("Invalid parameter name: {0:?}")]
    InvalidName(String),
}

impl From<ParamError> for TransportError {
    fn from(err: ParamError) -> Self {
        TransportError::Service(err.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ResolutionPolicy
// ─────────────────────────────────────────────────────────────────────────────

/// How a property name becomes a parameter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionPolicy {
    /// `name`
    Relative,
    /// `/name`
    Absolute,
    /// `~name`
    Private,
    /// `~component/name`
    #[default]
    Component,
}

impl ResolutionPolicy {
    pub const ALL: [ResolutionPolicy; 4] = [
        ResolutionPolicy::Relative,
        ResolutionPolicy::Absolute,
        ResolutionPolicy::Private,
        ResolutionPolicy::Component,
    ];

    /// Store key of property `name` of `component`.
    pub fn resolve(self, component: &str, name: &str) -> String {
        let name = name.trim_start_matches(['/', '~']);
        match self {
            ResolutionPolicy::Relative => name.to_string(),
            ResolutionPolicy::Absolute => format!("/{name}"),
            ResolutionPolicy::Private => format!("~{name}"),
            ResolutionPolicy::Component => format!("~{}/{name}", component.trim_matches('/')),
        }
    }
}

impl fmt::Display for ResolutionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionPolicy::Relative => write!(f, "relative"),
            ResolutionPolicy::Absolute => write!(f, "absolute"),
            ResolutionPolicy::Private => write!(f, "private"),
            ResolutionPolicy::Component => write!(f, "component"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ParamStore
// ─────────────────────────────────────────────────────────────────────────────

/// Key/value parameter storage.
///
/// Keys are either relative (`name`), absolute (`/name`) or private
/// (`~name`); the store decides what relative and private keys mean.
pub trait ParamStore: Send + Sync {
    fn get_param(&self, key: &str) -> Option<Value>;

    fn set_param(&self, key: &str, value: Value);

    fn has_param(&self, key: &str) -> bool {
        self.get_param(key).is_some()
    }
}

/// In-memory [`ParamStore`] for a node living in the root namespace.
///
/// * `~name` expands to `<node>/name`.
/// * Relative `name` expands to `/name`.
#[derive(Debug, Default)]
pub struct MemoryParamStore {
    node: String,
    values: RwLock<BTreeMap<String, Value>>,
}

impl MemoryParamStore {
    /// Store for the node named `node` (e.g. `"/deployer"`).
    pub fn new(node: impl Into<String>) -> Self {
        let node = node.into();
        let node = format!("/{}", node.trim_matches('/'));
        Self {
            node,
            values: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Fully qualified form of `key`.
    pub fn canonical(&self, key: &str) -> String {
        if let Some(private) = key.strip_prefix('~') {
            format!("{}/{}", self.node.trim_end_matches('/'), private.trim_start_matches('/'))
        } else if key.starts_with('/') {
            key.to_string()
        } else {
            format!("/{key}")
        }
    }

    /// Set a parameter directly; same as [`ParamStore::set_param`].
    pub fn insert(&self, key: &str, value: Value) {
        self.set_param(key, value);
    }

    /// Every stored key, fully qualified and sorted.
    pub fn keys(&self) -> Vec<String> {
        self.values.read().keys().cloned().collect()
    }
}

impl ParamStore for MemoryParamStore {
    fn get_param(&self, key: &str) -> Option<Value> {
        self.values.read().get(&self.canonical(key)).cloned()
    }

    fn set_param(&self, key: &str, value: Value) {
        self.values.write().insert(self.canonical(key), value);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ParamFacade
// ─────────────────────────────────────────────────────────────────────────────

/// A component's properties, synchronised with a [`ParamStore`] on demand.
pub struct ParamFacade<S: ParamStore> {
    component: String,
    store: Arc<S>,
    properties: RwLock<BTreeMap<String, Value>>,
}

impl<S: ParamStore> ParamFacade<S> {
    pub fn new(component: impl Into<String>, store: Arc<S>) -> Self {
        Self {
            component: component.into(),
            store,
            properties: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Declare a property with its initial value.  The initial value fixes
    /// the property's JSON kind unless it is `null`.
    pub fn add_property(&self, name: impl Into<String>, initial: Value) {
        self.properties.write().insert(name.into(), initial);
    }

    pub fn property(&self, name: &str) -> Option<Value> {
        self.properties.read().get(name).cloned()
    }

    pub fn property_names(&self) -> Vec<String> {
        self.properties.read().keys().cloned().collect()
    }

    /// Load property `name` from the parameter resolved with `policy`.
    pub fn get(&self, name: &str, policy: ResolutionPolicy) -> Result<(), ParamError> {
        self.get_param(&policy.resolve(&self.component, name), name)
    }

    /// Store property `name` under the parameter resolved with `policy`.
    pub fn set(&self, name: &str, policy: ResolutionPolicy) -> Result<(), ParamError> {
        self.set_param(&policy.resolve(&self.component, name), name)
    }

    /// Load every property that has a parameter under `policy`.
    ///
    /// Properties without a parameter keep their value.  Returns how many
    /// were loaded.  A kind mismatch aborts with nothing changed.
    pub fn get_all(&self, policy: ResolutionPolicy) -> Result<usize, ParamError> {
        let mut properties = self.properties.write();
        let mut loaded = Vec::new();
        for (name, current) in properties.iter() {
            let key = policy.resolve(&self.component, name);
            if let Some(value) = self.store.get_param(&key) {
                check_kind(&key, current, &value)?;
                loaded.push((name.clone(), value));
            }
        }
        let count = loaded.len();
        properties.extend(loaded);
        debug!(component = %self.component, %policy, count, "properties loaded");
        Ok(count)
    }

    /// Store every property under `policy`.  Returns how many were written.
    pub fn set_all(&self, policy: ResolutionPolicy) -> Result<usize, ParamError> {
        let properties = self.properties.read();
        for (name, value) in properties.iter() {
            self.store
                .set_param(&policy.resolve(&self.component, name), value.clone());
        }
        debug!(component = %self.component, %policy, count = properties.len(), "properties stored");
        Ok(properties.len())
    }

    /// Load `property` from the parameter `param_name`, used as given.
    pub fn get_param(&self, param_name: &str, property: &str) -> Result<(), ParamError> {
        validate_key(param_name)?;
        let mut properties = self.properties.write();
        let current = properties
            .get_mut(property)
            .ok_or_else(|| ParamError::UnknownProperty(property.to_string()))?;
        let value = self
            .store
            .get_param(param_name)
            .ok_or_else(|| ParamError::NotFound(param_name.to_string()))?;
        check_kind(param_name, current, &value)?;
        *current = value;
        Ok(())
    }

    /// Store `property` under the parameter `param_name`, used as given.
    pub fn set_param(&self, param_name: &str, property: &str) -> Result<(), ParamError> {
        validate_key(param_name)?;
        let value = self
            .property(property)
            .ok_or_else(|| ParamError::UnknownProperty(property.to_string()))?;
        self.store.set_param(param_name, value);
        Ok(())
    }
}

fn validate_key(key: &str) -> Result<(), ParamError> {
    let bare = key.trim_start_matches(['/', '~']);
    if bare.is_empty() || key.contains(char::is_whitespace) || key.contains("//") {
        return Err(ParamError::InvalidName(key.to_string()));
    }
    Ok(())
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn check_kind(key: &str, current: &Value, incoming: &Value) -> Result<(), ParamError> {
    if current.is_null() || kind(current) == kind(incoming) {
        return Ok(());
    }
    Err(ParamError::TypeMismatch {
        key: key.to_string(),
        expected: kind(current),
        found: kind(incoming),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn facade() -> ParamFacade<MemoryParamStore> {
        let params = ParamFacade::new("arm", Arc::new(MemoryParamStore::new("deployer")));
        params.add_property("gain", json!(1.0));
        params.add_property("joints", json!(["shoulder"]));
        params
    }

    #[test]
    fn names_resolve_per_policy() {
        assert_eq!(ResolutionPolicy::Relative.resolve("arm", "gain"), "gain");
        assert_eq!(ResolutionPolicy::Absolute.resolve("arm", "gain"), "/gain");
        assert_eq!(ResolutionPolicy::Private.resolve("arm", "gain"), "~gain");
        assert_eq!(ResolutionPolicy::Component.resolve("arm", "gain"), "~arm/gain");
    }

    #[test]
    fn store_expands_private_and_relative_keys() {
        let store = MemoryParamStore::new("deployer");
        assert_eq!(store.canonical("~gain"), "/deployer/gain");
        assert_eq!(store.canonical("~arm/gain"), "/deployer/arm/gain");
        assert_eq!(store.canonical("gain"), "/gain");
        assert_eq!(store.canonical("/gain"), "/gain");
    }

    #[test]
    fn set_then_get_through_each_policy() -> Result<(), ParamError> {
        for policy in ResolutionPolicy::ALL {
            let params = facade();
            params.add_property("gain", json!(4.0));
            params.set("gain", policy)?;

            params.add_property("gain", json!(0.0));
            params.get("gain", policy)?;
            assert_eq!(params.property("gain"), Some(json!(4.0)), "policy {policy}");
        }
        Ok(())
    }

    #[test]
    fn policies_map_onto_store_keys() -> Result<(), ParamError> {
        let params = facade();
        // Relative and absolute coincide for a node in the root namespace.
        for policy in ResolutionPolicy::ALL {
            params.set("gain", policy)?;
        }
        assert_eq!(
            params.store().keys(),
            vec!["/deployer/arm/gain", "/deployer/gain", "/gain"]
        );
        Ok(())
    }

    #[test]
    fn missing_parameter_is_not_found() {
        let params = facade();
        assert_eq!(
            params.get("gain", ResolutionPolicy::Absolute),
            Err(ParamError::NotFound("/gain".to_string()))
        );
        assert_eq!(params.property("gain"), Some(json!(1.0)));
    }

    #[test]
    fn unknown_property_is_rejected() {
        let params = facade();
        params.store().insert("/speed", json!(3));
        assert_eq!(
            params.get("speed", ResolutionPolicy::Absolute),
            Err(ParamError::UnknownProperty("speed".to_string()))
        );
        assert!(matches!(
            params.set("speed", ResolutionPolicy::Absolute),
            Err(ParamError::UnknownProperty(_))
        ));
    }

    #[test]
    fn kind_mismatch_keeps_old_value() {
        let params = facade();
        params.store().insert("/gain", json!("fast"));
        assert!(matches!(
            params.get("gain", ResolutionPolicy::Absolute),
            Err(ParamError::TypeMismatch { expected: "number", found: "string", .. })
        ));
        assert_eq!(params.property("gain"), Some(json!(1.0)));
    }

    #[test]
    fn get_all_loads_what_exists() -> Result<(), ParamError> {
        let params = facade();
        params.store().insert("~arm/gain", json!(9.5));

        assert_eq!(params.get_all(ResolutionPolicy::Component)?, 1);
        assert_eq!(params.property("gain"), Some(json!(9.5)));
        assert_eq!(params.property("joints"), Some(json!(["shoulder"])));
        Ok(())
    }

    #[test]
    fn get_all_is_all_or_nothing_on_mismatch() {
        let params = facade();
        params.store().insert("/gain", json!(2.0));
        params.store().insert("/joints", json!(3));

        assert!(params.get_all(ResolutionPolicy::Absolute).is_err());
        assert_eq!(params.property("gain"), Some(json!(1.0)));
    }

    #[test]
    fn set_all_writes_every_property() -> Result<(), ParamError> {
        let params = facade();
        assert_eq!(params.set_all(ResolutionPolicy::Private)?, 2);
        assert_eq!(params.store().get_param("/deployer/gain"), Some(json!(1.0)));
        assert_eq!(params.store().get_param("~joints"), Some(json!(["shoulder"])));
        Ok(())
    }

    #[test]
    fn explicit_param_names_bypass_resolution() -> Result<(), ParamError> {
        let params = facade();
        params.store().insert("/calibration/gain", json!(0.25));

        params.get_param("/calibration/gain", "gain")?;
        assert_eq!(params.property("gain"), Some(json!(0.25)));

        params.set_param("/backup/gain", "gain")?;
        assert_eq!(params.store().get_param("/backup/gain"), Some(json!(0.25)));

        assert!(matches!(params.get_param("", "gain"), Err(ParamError::InvalidName(_))));
        assert!(matches!(params.set_param("/a//b", "gain"), Err(ParamError::InvalidName(_))));
        Ok(())
    }

    #[test]
    fn param_errors_convert_to_transport_errors() {
        let err: TransportError = ParamError::NotFound("/gain".to_string()).into();
        assert!(matches!(err, TransportError::Service(msg) if msg.contains("/gain")));
    }
}
