//! Runtime parameters.
//!
//! Each task owns an ordered registry of named, typed values that can be
//! changed while the stream runs. A parameter remembers the value it was
//! configured with (its "original"), so status reporting can say whether an
//! operator has edited anything. Values serialise to and from the generic
//! JSON value shape carried by parameters-change control messages.

use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Path(PathBuf),
    /// Index into a fixed set of named choices.
    Enum {
        value: usize,
        names: &'static [&'static str],
    },
    /// Valueless trigger; setting it only fires the change callback.
    Notification,
}

impl ParamValue {
    fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "bool",
            ParamValue::Int(_) => "int",
            ParamValue::Double(_) => "double",
            ParamValue::String(_) => "string",
            ParamValue::Path(_) => "path",
            ParamValue::Enum { .. } => "enum",
            ParamValue::Notification => "notification",
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ParamValue::Bool(v) => Value::Bool(*v),
            ParamValue::Int(v) => Value::from(*v),
            ParamValue::Double(v) => Value::from(*v),
            ParamValue::String(v) => Value::String(v.clone()),
            ParamValue::Path(v) => Value::String(v.display().to_string()),
            ParamValue::Enum { value, names } => names
                .get(*value)
                .map(|n| Value::String((*n).to_string()))
                .unwrap_or(Value::Null),
            ParamValue::Notification => Value::Null,
        }
    }

    /// Produce a value of the same variant from a generic JSON value.
    fn coerced_from(&self, json: &Value) -> Result<ParamValue> {
        let fail = || anyhow!("invalid value {} for {} parameter", json, self.type_name());
        Ok(match self {
            ParamValue::Bool(_) => match json {
                Value::Bool(v) => ParamValue::Bool(*v),
                Value::String(s) if s == "true" || s == "1" => ParamValue::Bool(true),
                Value::String(s) if s == "false" || s == "0" => ParamValue::Bool(false),
                Value::Number(n) if n.as_i64() == Some(0) => ParamValue::Bool(false),
                Value::Number(n) if n.as_i64() == Some(1) => ParamValue::Bool(true),
                _ => return Err(fail()),
            },
            ParamValue::Int(_) => match json {
                Value::Number(n) => ParamValue::Int(n.as_i64().ok_or_else(fail)?),
                Value::String(s) => ParamValue::Int(s.parse().map_err(|_| fail())?),
                _ => return Err(fail()),
            },
            ParamValue::Double(_) => match json {
                Value::Number(n) => ParamValue::Double(n.as_f64().ok_or_else(fail)?),
                Value::String(s) => ParamValue::Double(s.parse().map_err(|_| fail())?),
                _ => return Err(fail()),
            },
            ParamValue::String(_) => match json {
                Value::String(s) => ParamValue::String(s.clone()),
                _ => return Err(fail()),
            },
            ParamValue::Path(_) => match json {
                Value::String(s) => ParamValue::Path(PathBuf::from(s)),
                _ => return Err(fail()),
            },
            ParamValue::Enum { names, .. } => match json {
                Value::String(s) => {
                    let value = names
                        .iter()
                        .position(|n| n == s)
                        .ok_or_else(|| anyhow!("'{}' is not one of {:?}", s, names))?;
                    ParamValue::Enum { value, names }
                }
                Value::Number(n) => {
                    let value = n.as_u64().ok_or_else(fail)? as usize;
                    if value >= names.len() {
                        return Err(anyhow!("enum index {} out of range", value));
                    }
                    ParamValue::Enum { value, names }
                }
                _ => return Err(fail()),
            },
            ParamValue::Notification => ParamValue::Notification,
        })
    }
}

type ChangeCallback = Arc<dyn Fn(&ParamValue) + Send + Sync>;

/// A single named runtime value.
pub struct Parameter {
    name: String,
    label: String,
    value: ParamValue,
    original: ParamValue,
    editable: bool,
    advanced: bool,
    on_change: Option<ChangeCallback>,
}

impl std::fmt::Debug for Parameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parameter")
            .field("name", &self.name)
            .field("value", &self.value)
            .field("original", &self.original)
            .finish()
    }
}

impl Parameter {
    pub fn new(name: &str, label: &str, value: ParamValue) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            original: value.clone(),
            value,
            editable: true,
            advanced: false,
            on_change: None,
        }
    }

    pub fn bool_value(name: &str, label: &str, value: bool) -> Self {
        Self::new(name, label, ParamValue::Bool(value))
    }

    pub fn int_value(name: &str, label: &str, value: i64) -> Self {
        Self::new(name, label, ParamValue::Int(value))
    }

    pub fn double_value(name: &str, label: &str, value: f64) -> Self {
        Self::new(name, label, ParamValue::Double(value))
    }

    pub fn string_value(name: &str, label: &str, value: &str) -> Self {
        Self::new(name, label, ParamValue::String(value.to_string()))
    }

    pub fn path_value(name: &str, label: &str, value: impl Into<PathBuf>) -> Self {
        Self::new(name, label, ParamValue::Path(value.into()))
    }

    pub fn with_advanced(mut self, advanced: bool) -> Self {
        self.advanced = advanced;
        self
    }

    pub fn with_editable(mut self, editable: bool) -> Self {
        self.editable = editable;
        self
    }

    pub fn with_on_change(mut self, callback: ChangeCallback) -> Self {
        self.on_change = Some(callback);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &ParamValue {
        &self.value
    }

    pub fn is_editable(&self) -> bool {
        self.editable
    }

    pub fn is_advanced(&self) -> bool {
        self.advanced
    }

    pub fn is_not_original(&self) -> bool {
        self.value != self.original
    }

    /// Replace value and original together, bypassing coercion and the change
    /// callback. Used to mirror internal state into the registry.
    pub(crate) fn set_value_and_original(&mut self, value: ParamValue) {
        self.original = value.clone();
        self.value = value;
    }

    /// Apply a runtime edit.
    pub fn set_from_json(&mut self, json: &Value) -> Result<()> {
        let value = self.value.coerced_from(json)?;
        self.value = value;
        if let Some(callback) = &self.on_change {
            callback(&self.value);
        }
        Ok(())
    }

    /// Apply a configured value: both current and original move together.
    pub fn set_original_from_json(&mut self, json: &Value) -> Result<()> {
        let value = self.value.coerced_from(json)?;
        self.original = value.clone();
        self.value = value;
        if let Some(callback) = &self.on_change {
            callback(&self.value);
        }
        Ok(())
    }

    pub fn describe(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "label": self.label,
            "type": self.value.type_name(),
            "value": self.value.to_json(),
            "original": self.original.to_json(),
            "advanced": self.advanced,
        })
    }
}

/// Outcome of applying a batched parameters-change.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    /// Names that were applied successfully.
    pub applied: Vec<String>,
}

/// Ordered, name-keyed collection of a task's parameters.
#[derive(Debug, Default)]
pub struct ParameterRegistry {
    order: Vec<Parameter>,
    index: HashMap<String, usize>,
}

impl ParameterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a parameter. Duplicate names are rejected.
    pub fn register(&mut self, parameter: Parameter) -> bool {
        if self.index.contains_key(parameter.name()) {
            tracing::error!(name = parameter.name(), "duplicate parameter registration");
            return false;
        }
        self.index
            .insert(parameter.name().to_string(), self.order.len());
        self.order.push(parameter);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.index.get(name).map(|&i| &self.order[i])
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        let i = *self.index.get(name)?;
        Some(&mut self.order[i])
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(name)?.value() {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.get(name)?.value() {
            ParamValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_double(&self, name: &str) -> Option<f64> {
        match self.get(name)?.value() {
            ParamValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_string(&self, name: &str) -> Option<&str> {
        match self.get(name)?.value() {
            ParamValue::String(v) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Apply name/value pairs from a parameters-change request. Unknown names
    /// are logged and skipped; an invalid value stops the batch and surfaces
    /// the parameter's error.
    pub fn apply(&mut self, values: &[(String, Value)], originals: bool) -> Result<ApplyOutcome> {
        let mut outcome = ApplyOutcome::default();
        for (name, value) in values {
            let Some(parameter) = self.get_mut(name) else {
                tracing::error!(name = %name, "unknown parameter name");
                continue;
            };
            let applied = if originals {
                parameter.set_original_from_json(value)
            } else {
                parameter.set_from_json(value)
            };
            match applied {
                Ok(()) => {
                    tracing::info!(name = %name, %value, originals, "parameter changed");
                    outcome.applied.push(name.clone());
                }
                Err(err) => return Err(err),
            }
        }
        Ok(outcome)
    }

    /// Has any parameter moved away from its configured value?
    pub fn has_changed(&self) -> bool {
        self.order.iter().any(Parameter::is_not_original)
    }

    pub fn describe_changed(&self) -> Vec<Value> {
        self.order
            .iter()
            .filter(|p| p.is_not_original())
            .map(Parameter::describe)
            .collect()
    }

    pub fn describe_editable(&self) -> Vec<Value> {
        self.order
            .iter()
            .filter(|p| p.is_editable())
            .map(Parameter::describe)
            .collect()
    }
}
