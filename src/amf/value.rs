//! AMF value types
//!
//! AMF0 and AMF3 share a common value representation. This enum covers the
//! value kinds the relay recognizes on the wire; reserved markers
//! (MovieClip, Reference, RecordSet, XML, typed objects) are rejected by the
//! codecs and have no representation here.

use std::collections::HashMap;

use crate::error::AmfError;

/// Unified AMF value representation
#[derive(Debug, Clone, PartialEq)]
pub enum AmfValue {
    /// Null value (AMF0: 0x05, AMF3: 0x01)
    Null,

    /// Undefined value (AMF0: 0x06, AMF3: 0x00)
    Undefined,

    /// Boolean value (AMF0: 0x01, AMF3: 0x02/0x03)
    Boolean(bool),

    /// IEEE 754 double-precision floating point (AMF0: 0x00, AMF3: 0x05)
    Number(f64),

    /// 29-bit signed integer (AMF3 only: 0x04); promoted to Number in AMF0
    Integer(i32),

    /// UTF-8 string (AMF0: 0x02/0x0C, AMF3: 0x06)
    String(String),

    /// Dense array (AMF0 StrictArray 0x0A, AMF3 Array 0x09)
    Array(Vec<AmfValue>),

    /// Key-value object (AMF0: 0x03, AMF3: 0x0A dynamic)
    Object(HashMap<String, AmfValue>),

    /// Associative array (AMF0: 0x08)
    EcmaArray(HashMap<String, AmfValue>),

    /// Milliseconds since Unix epoch (AMF0: 0x0B, AMF3: 0x08)
    Date(f64),

    /// Raw byte array (AMF3 only: 0x0C)
    ByteArray(Vec<u8>),
}

impl AmfValue {
    /// Try to get this value as a string reference
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AmfValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get this value as a number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            AmfValue::Number(n) => Some(*n),
            AmfValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Try to get this value as a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AmfValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to get this value as an object reference
    pub fn as_object(&self) -> Option<&HashMap<String, AmfValue>> {
        match self {
            AmfValue::Object(m) => Some(m),
            AmfValue::EcmaArray(m) => Some(m),
            _ => None,
        }
    }

    /// Try to get this value as an array reference
    pub fn as_array(&self) -> Option<&Vec<AmfValue>> {
        match self {
            AmfValue::Array(a) => Some(a),
            _ => None,
        }
    }

    /// String value or a type-mismatch error
    pub fn expect_str(&self) -> Result<&str, AmfError> {
        self.as_str().ok_or(AmfError::TypeMismatch("string"))
    }

    /// Numeric value or a type-mismatch error
    pub fn expect_number(&self) -> Result<f64, AmfError> {
        self.as_number().ok_or(AmfError::TypeMismatch("number"))
    }

    /// Object value or a type-mismatch error
    pub fn expect_object(&self) -> Result<&HashMap<String, AmfValue>, AmfError> {
        self.as_object().ok_or(AmfError::TypeMismatch("object"))
    }

    /// Check if this value is null or undefined
    pub fn is_null_or_undefined(&self) -> bool {
        matches!(self, AmfValue::Null | AmfValue::Undefined)
    }

    /// Get a property from an object value
    pub fn get(&self, key: &str) -> Option<&AmfValue> {
        self.as_object()?.get(key)
    }

    /// Get a string property from an object value
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str()
    }

    /// Get a number property from an object value
    pub fn get_number(&self, key: &str) -> Option<f64> {
        self.get(key)?.as_number()
    }
}

impl Default for AmfValue {
    fn default() -> Self {
        AmfValue::Null
    }
}

impl From<bool> for AmfValue {
    fn from(v: bool) -> Self {
        AmfValue::Boolean(v)
    }
}

impl From<f64> for AmfValue {
    fn from(v: f64) -> Self {
        AmfValue::Number(v)
    }
}

impl From<i32> for AmfValue {
    fn from(v: i32) -> Self {
        AmfValue::Number(v as f64)
    }
}

impl From<u32> for AmfValue {
    fn from(v: u32) -> Self {
        AmfValue::Number(v as f64)
    }
}

impl From<String> for AmfValue {
    fn from(v: String) -> Self {
        AmfValue::String(v)
    }
}

impl From<&str> for AmfValue {
    fn from(v: &str) -> Self {
        AmfValue::String(v.to_string())
    }
}

impl<V: Into<AmfValue>> From<Vec<V>> for AmfValue {
    fn from(v: Vec<V>) -> Self {
        AmfValue::Array(v.into_iter().map(|x| x.into()).collect())
    }
}

impl<V: Into<AmfValue>> From<HashMap<String, V>> for AmfValue {
    fn from(v: HashMap<String, V>) -> Self {
        AmfValue::Object(v.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}
