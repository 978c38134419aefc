//! Payload schemas
//!
//! A [`Schema`] validates and normalises a JSON payload before it is
//! published. Three shapes are provided:
//!
//! - [`TypedSchema<T>`]: the payload must deserialize into `T`; the value
//!   written to the bus is `T` serialized back, so defaults and renames apply.
//! - [`FieldSchema`]: a flat object description of field names and kinds.
//! - [`FnSchema`]: any closure.
//!
//! [`SchemaRegistry`] maps topics to schemas.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::utils::{BusError, Result};

pub trait Schema: Send + Sync {
    /// Returns the normalised payload, or a human-readable rejection reason.
    fn validate(&self, payload: Value) -> std::result::Result<Value, String>;
}

pub struct TypedSchema<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedSchema<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for TypedSchema<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Schema for TypedSchema<T>
where
    T: DeserializeOwned + Serialize,
{
    fn validate(&self, payload: Value) -> std::result::Result<Value, String> {
        let typed: T = serde_json::from_value(payload).map_err(|e| e.to_string())?;
        serde_json::to_value(typed).map_err(|e| e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Integer,
    Bool,
    Array,
    Object,
    Any,
}

impl FieldKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Array => value.is_array(),
            FieldKind::Object => value.is_object(),
            FieldKind::Any => true,
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Integer => "integer",
            FieldKind::Bool => "bool",
            FieldKind::Array => "array",
            FieldKind::Object => "object",
            FieldKind::Any => "any",
        };
        f.write_str(name)
    }
}

/// Object schema described field by field. Unknown fields pass through.
/// Optional fields may be absent or `null`.
#[derive(Debug, Clone, Default)]
pub struct FieldSchema {
    fields: BTreeMap<String, (FieldKind, bool)>,
}

impl FieldSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.insert(name.into(), (kind, true));
        self
    }

    pub fn optional(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.insert(name.into(), (kind, false));
        self
    }
}

impl Schema for FieldSchema {
    fn validate(&self, payload: Value) -> std::result::Result<Value, String> {
        let Some(object) = payload.as_object() else {
            return Err("payload must be an object".to_string());
        };
        for (name, (kind, required)) in &self.fields {
            match object.get(name) {
                None | Some(Value::Null) if *required => {
                    return Err(format!("missing required field `{name}`"));
                }
                None | Some(Value::Null) => {}
                Some(value) if !kind.matches(value) => {
                    return Err(format!("field `{name}` must be {kind}"));
                }
                Some(_) => {}
            }
        }
        Ok(payload)
    }
}

pub struct FnSchema<F> {
    validator: F,
}

impl<F> FnSchema<F>
where
    F: Fn(Value) -> std::result::Result<Value, String> + Send + Sync,
{
    pub fn new(validator: F) -> Self {
        Self { validator }
    }
}

impl<F> Schema for FnSchema<F>
where
    F: Fn(Value) -> std::result::Result<Value, String> + Send + Sync,
{
    fn validate(&self, payload: Value) -> std::result::Result<Value, String> {
        (self.validator)(payload)
    }
}

#[derive(Default)]
pub struct SchemaRegistry {
    schemas: DashMap<String, Arc<dyn Schema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `schema` for `topic`, replacing any previous one.
    pub fn register(&self, topic: impl Into<String>, schema: impl Schema + 'static) {
        let topic = topic.into();
        debug!(%topic, "Schema registered");
        self.schemas.insert(topic, Arc::new(schema));
    }

    pub fn unregister(&self, topic: &str) -> bool {
        self.schemas.remove(topic).is_some()
    }

    pub fn has_schema(&self, topic: &str) -> bool {
        self.schemas.contains_key(topic)
    }

    /// Validate a payload against the topic's schema. Topics without a schema
    /// accept anything unchanged.
    pub fn validate(&self, topic: &str, payload: Value) -> Result<Value> {
        let Some(schema) = self.schemas.get(topic).map(|s| Arc::clone(s.value())) else {
            return Ok(payload);
        };
        schema
            .validate(payload)
            .map_err(|reason| BusError::SchemaValidation {
                topic: topic.to_string(),
                reason,
            })
    }
}

impl fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let topics: Vec<String> = self.schemas.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("SchemaRegistry")
            .field("topics", &topics)
            .finish()
    }
}
