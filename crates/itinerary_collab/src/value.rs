//! Values stored in replicated containers.
//!
//! A document is a tree of containers. Maps hold [`LwwMap`](crate::lww_register::LwwMap)
//! registers and arrays hold [`Rga`](crate::rga::Rga) sequences; both store
//! [`Value`]s. A nested container is referenced by its [`ContainerId`], which is
//! the id of the operation that created it.

use crate::op_id::{ClientId, OpId};
use serde::{Deserialize, Serialize};

/// Identifier of a map or array container.
pub type ContainerId = OpId;

/// Root array holding the itinerary days.
pub const DAYS_ROOT: ContainerId = OpId {
    client_id: ClientId(0),
    seq: 1,
};

/// Root map holding comment threads keyed by block id.
pub const COMMENTS_ROOT: ContainerId = OpId {
    client_id: ClientId(0),
    seq: 2,
};

/// A value held by a map register or an array element.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// Reference to a nested map container
    Map(ContainerId),
    /// Reference to a nested array container
    Array(ContainerId),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view; floats with no fractional part are accepted too.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<ContainerId> {
        match self {
            Value::Map(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<ContainerId> {
        match self {
            Value::Array(id) => Some(*id),
            _ => None,
        }
    }

    /// The container this value refers to, if any.
    pub fn container(&self) -> Option<ContainerId> {
        match self {
            Value::Map(id) | Value::Array(id) => Some(*id),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}
