//! Call envelope types shared by every host surface.
//!
//! A host delivers a [`PluginCall`] (method name plus named options) and gets
//! back a [`CallOutcome`]: either a resolved [`CallResponse`] or a
//! [`CallRejection`]. The line host wraps both, plus events, in [`HostFrame`]s.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::Display;

/// Inbound call from the host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginCall {
    /// Host correlation id, echoed back on the response.
    #[serde(default)]
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub options: Map<String, Value>,
}

impl PluginCall {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            id: 0,
            method: method.into(),
            options: Map::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// String option. Absent, `null` and non-string values read as `None`.
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }

    /// Integer option. Integral floats are accepted since JS numbers arrive
    /// as either.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        let value = self.options.get(key)?;
        if let Some(int) = value.as_i64() {
            return Some(int);
        }
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64)
            .map(|f| f as i64)
    }

    pub fn get_int_or(&self, key: &str, default: i64) -> i64 {
        self.get_int(key).unwrap_or(default)
    }
}

/// Response payload, built fresh for each call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallResponse(Map<String, Value>);

impl CallResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Serializes `value` into the response. Fails when `value` cannot be
    /// represented as JSON.
    pub fn try_put<T: Serialize + ?Sized>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<&mut Self, serde_json::Error> {
        let value = serde_json::to_value(value)?;
        self.0.insert(key.into(), value);
        Ok(self)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

/// Caller-visible failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRejection {
    pub message: String,
    /// Underlying fault, when the message wraps one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CallRejection {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(message: impl Into<String>, fault: impl Display) -> Self {
        Self {
            message: message.into(),
            detail: Some(fault.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CallOutcome {
    Resolved { data: CallResponse },
    Rejected(CallRejection),
}

impl CallOutcome {
    pub fn resolve(data: CallResponse) -> Self {
        Self::Resolved { data }
    }

    pub fn reject(message: impl Into<String>) -> Self {
        Self::Rejected(CallRejection::new(message))
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved { .. })
    }

    pub fn data(&self) -> Option<&CallResponse> {
        match self {
            Self::Resolved { data } => Some(data),
            Self::Rejected(_) => None,
        }
    }

    pub fn rejection(&self) -> Option<&CallRejection> {
        match self {
            Self::Resolved { .. } => None,
            Self::Rejected(rejection) => Some(rejection),
        }
    }
}

/// One line of the line-host protocol, host-bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HostFrame {
    Response { id: u64, outcome: CallOutcome },
    Event { event: String, data: Value },
}
