//! Scalar values as the engine hands them to expressions.

use serde::{Deserialize, Serialize};

/// Slot value representing SQL `NULL`.
pub const NULL_SENTINEL: i64 = i64::MIN;

/// A literal scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Datum {
    Null,
    Int(i64),
    Bool(bool),
}

impl Datum {
    /// Encodes the datum into its `i64` slot form.
    pub fn to_slot(self) -> i64 {
        match self {
            Datum::Null => NULL_SENTINEL,
            Datum::Int(n) => n,
            Datum::Bool(b) => b as i64,
        }
    }

    /// Decodes an `i64` slot as an integer datum.
    pub fn from_slot(slot: i64) -> Self {
        if slot == NULL_SENTINEL {
            Datum::Null
        } else {
            Datum::Int(slot)
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Datum::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Datum::Bool(b) => Some(*b),
            Datum::Int(n) => Some(*n != 0),
            Datum::Null => None,
        }
    }
}
