//! AMF0 encoder and decoder
//!
//! Type markers:
//! ```text
//! 0x00 - Number (IEEE 754 double)
//! 0x01 - Boolean
//! 0x02 - String (UTF-8, 16-bit length prefix)
//! 0x03 - Object (key-value pairs until 0x000009)
//! 0x04 - MovieClip (reserved, rejected)
//! 0x05 - Null
//! 0x06 - Undefined
//! 0x07 - Reference (rejected)
//! 0x08 - ECMA Array (associative array)
//! 0x09 - Object End
//! 0x0A - Strict Array (dense array)
//! 0x0B - Date (double + 2 reserved bytes)
//! 0x0C - Long String (UTF-8, 32-bit length prefix)
//! 0x0E - RecordSet (rejected)
//! 0x0F - XML Document (rejected)
//! 0x10 - Typed Object (rejected)
//! 0x11 - AVM+ (rejected)
//! ```
//!
//! Reference: AMF0 File Format Specification

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use super::value::AmfValue;
use crate::error::AmfError;

// AMF0 type markers
const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_STRICT_ARRAY: u8 = 0x0A;
const MARKER_DATE: u8 = 0x0B;
const MARKER_LONG_STRING: u8 = 0x0C;

/// Maximum nesting depth for objects/arrays (prevent stack overflow)
const MAX_NESTING_DEPTH: usize = 64;

/// AMF0 decoder
pub struct Amf0Decoder {
    /// Current nesting depth
    depth: usize,
}

impl Amf0Decoder {
    pub fn new() -> Self {
        Self { depth: 0 }
    }

    /// Decode a single AMF0 value from the buffer
    pub fn decode(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        if buf.is_empty() {
            return Err(AmfError::Malformed);
        }

        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(AmfError::NestingTooDeep);
        }

        let marker = buf.get_u8();
        let result = self.decode_value(marker, buf);
        self.depth -= 1;
        result
    }

    /// Decode all values from buffer until exhausted
    pub fn decode_all(&mut self, buf: &mut Bytes) -> Result<Vec<AmfValue>, AmfError> {
        let mut values = Vec::new();
        while buf.has_remaining() {
            values.push(self.decode(buf)?);
        }
        Ok(values)
    }

    fn decode_value(&mut self, marker: u8, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        match marker {
            MARKER_NUMBER => self.decode_number(buf),
            MARKER_BOOLEAN => self.decode_boolean(buf),
            MARKER_STRING => Ok(AmfValue::String(self.read_utf8(buf)?)),
            MARKER_OBJECT => self.decode_object(buf).map(AmfValue::Object),
            MARKER_NULL => Ok(AmfValue::Null),
            MARKER_UNDEFINED => Ok(AmfValue::Undefined),
            MARKER_ECMA_ARRAY => self.decode_ecma_array(buf),
            MARKER_STRICT_ARRAY => self.decode_strict_array(buf),
            MARKER_DATE => self.decode_date(buf),
            MARKER_LONG_STRING => Ok(AmfValue::String(self.read_utf8_long(buf)?)),
            // MovieClip, Reference, RecordSet, XML, TypedObject, AVM+ and
            // anything unknown are rejected rather than skipped.
            other => Err(AmfError::Unsupported(other)),
        }
    }

    fn decode_number(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        if buf.remaining() < 8 {
            return Err(AmfError::Malformed);
        }
        Ok(AmfValue::Number(buf.get_f64()))
    }

    fn decode_boolean(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        if buf.is_empty() {
            return Err(AmfError::Malformed);
        }
        Ok(AmfValue::Boolean(buf.get_u8() != 0))
    }

    /// Object body: u16-keyed properties until the empty key + 0x09 marker
    fn decode_object(&mut self, buf: &mut Bytes) -> Result<HashMap<String, AmfValue>, AmfError> {
        let mut properties = HashMap::new();

        loop {
            let key = self.read_utf8(buf)?;

            if key.is_empty() {
                if buf.is_empty() {
                    return Err(AmfError::Malformed);
                }
                let end_marker = buf.get_u8();
                if end_marker == MARKER_OBJECT_END {
                    break;
                }
                return Err(AmfError::Malformed);
            }

            let value = self.decode(buf)?;
            properties.insert(key, value);
        }

        Ok(properties)
    }

    fn decode_ecma_array(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        if buf.remaining() < 4 {
            return Err(AmfError::Malformed);
        }

        // Associative count is a hint only; the body is object-shaped
        let _count = buf.get_u32();
        let properties = self.decode_object(buf)?;
        Ok(AmfValue::EcmaArray(properties))
    }

    fn decode_strict_array(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        if buf.remaining() < 4 {
            return Err(AmfError::Malformed);
        }

        let count = buf.get_u32() as usize;
        let mut elements = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            elements.push(self.decode(buf)?);
        }

        Ok(AmfValue::Array(elements))
    }

    fn decode_date(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        if buf.remaining() < 10 {
            return Err(AmfError::Malformed);
        }

        let timestamp = buf.get_f64();
        let _timezone = buf.get_i16(); // reserved, usually 0

        Ok(AmfValue::Date(timestamp))
    }

    /// Read UTF-8 string with 16-bit length prefix
    fn read_utf8(&mut self, buf: &mut Bytes) -> Result<String, AmfError> {
        if buf.remaining() < 2 {
            return Err(AmfError::Malformed);
        }

        let len = buf.get_u16() as usize;
        if buf.remaining() < len {
            return Err(AmfError::Malformed);
        }

        let bytes = buf.copy_to_bytes(len);
        String::from_utf8(bytes.to_vec()).map_err(|_| AmfError::InvalidUtf8)
    }

    /// Read UTF-8 string with 32-bit length prefix
    fn read_utf8_long(&mut self, buf: &mut Bytes) -> Result<String, AmfError> {
        if buf.remaining() < 4 {
            return Err(AmfError::Malformed);
        }

        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(AmfError::Malformed);
        }

        let bytes = buf.copy_to_bytes(len);
        String::from_utf8(bytes.to_vec()).map_err(|_| AmfError::InvalidUtf8)
    }
}

impl Default for Amf0Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// AMF0 encoder
pub struct Amf0Encoder {
    buf: BytesMut,
}

impl Amf0Encoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
        }
    }

    /// Get the encoded bytes and reset encoder
    pub fn finish(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Encode a single AMF0 value
    ///
    /// Dispatches on the dynamic kind of the input: strings choose String vs
    /// LongString by length, integers are promoted to Number, maps become
    /// Object, sequences become StrictArray.
    pub fn encode(&mut self, value: &AmfValue) {
        match value {
            AmfValue::Null => {
                self.buf.put_u8(MARKER_NULL);
            }
            AmfValue::Undefined => {
                self.buf.put_u8(MARKER_UNDEFINED);
            }
            AmfValue::Boolean(b) => {
                self.buf.put_u8(MARKER_BOOLEAN);
                self.buf.put_u8(if *b { 1 } else { 0 });
            }
            AmfValue::Number(n) => {
                self.buf.put_u8(MARKER_NUMBER);
                self.buf.put_f64(*n);
            }
            AmfValue::Integer(i) => {
                // AMF0 has no integer type
                self.buf.put_u8(MARKER_NUMBER);
                self.buf.put_f64(*i as f64);
            }
            AmfValue::String(s) => {
                if s.len() > 0xFFFF {
                    self.buf.put_u8(MARKER_LONG_STRING);
                    self.buf.put_u32(s.len() as u32);
                } else {
                    self.buf.put_u8(MARKER_STRING);
                    self.buf.put_u16(s.len() as u16);
                }
                self.buf.put_slice(s.as_bytes());
            }
            AmfValue::Object(props) => {
                self.buf.put_u8(MARKER_OBJECT);
                self.encode_properties(props);
            }
            AmfValue::EcmaArray(props) => {
                self.buf.put_u8(MARKER_ECMA_ARRAY);
                self.buf.put_u32(props.len() as u32);
                self.encode_properties(props);
            }
            AmfValue::Array(elements) => {
                self.buf.put_u8(MARKER_STRICT_ARRAY);
                self.buf.put_u32(elements.len() as u32);
                for elem in elements {
                    self.encode(elem);
                }
            }
            AmfValue::Date(timestamp) => {
                self.buf.put_u8(MARKER_DATE);
                self.buf.put_f64(*timestamp);
                self.buf.put_i16(0); // reserved
            }
            AmfValue::ByteArray(_) => {
                // AMF3-only kind; AMF0 carries it as null
                self.buf.put_u8(MARKER_NULL);
            }
        }
    }

    /// Encode multiple values
    pub fn encode_all(&mut self, values: &[AmfValue]) {
        for value in values {
            self.encode(value);
        }
    }

    fn encode_properties(&mut self, props: &HashMap<String, AmfValue>) {
        for (key, val) in props {
            self.write_utf8(key);
            self.encode(val);
        }
        // Object end marker
        self.buf.put_u16(0);
        self.buf.put_u8(MARKER_OBJECT_END);
    }

    /// Write UTF-8 string with 16-bit length prefix (no type marker)
    fn write_utf8(&mut self, s: &str) {
        let len = s.len().min(0xFFFF);
        self.buf.put_u16(len as u16);
        self.buf.put_slice(&s.as_bytes()[..len]);
    }
}

impl Default for Amf0Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience function to encode a single value
pub fn encode(value: &AmfValue) -> Bytes {
    let mut encoder = Amf0Encoder::new();
    encoder.encode(value);
    encoder.finish()
}

/// Convenience function to encode multiple values
pub fn encode_all(values: &[AmfValue]) -> Bytes {
    let mut encoder = Amf0Encoder::new();
    encoder.encode_all(values);
    encoder.finish()
}

/// Convenience function to decode a single value
pub fn decode(data: &[u8]) -> Result<AmfValue, AmfError> {
    let mut decoder = Amf0Decoder::new();
    let mut buf = Bytes::copy_from_slice(data);
    decoder.decode(&mut buf)
}

/// Convenience function to decode all values
pub fn decode_all(data: &[u8]) -> Result<Vec<AmfValue>, AmfError> {
    let mut decoder = Amf0Decoder::new();
    let mut buf = Bytes::copy_from_slice(data);
    decoder.decode_all(&mut buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_roundtrip() {
        let value = AmfValue::Number(42.5);
        let encoded = encode(&value);
        assert_eq!(&encoded[..], &[0x00, 0x40, 0x45, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00]);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_string_roundtrip() {
        let value = AmfValue::String("hello world".into());
        let encoded = encode(&value);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, value);
        // encode(decode(bytes)) == bytes for a valid encoding
        assert_eq!(encode(&decoded), encoded);
    }

    #[test]
    fn test_boolean_null_undefined_roundtrip() {
        for value in [AmfValue::Boolean(true), AmfValue::Null, AmfValue::Undefined] {
            let encoded = encode(&value);
            assert_eq!(decode(&encoded).unwrap(), value);
        }
    }

    #[test]
    fn test_object_roundtrip() {
        let mut props = HashMap::new();
        props.insert("name".to_string(), AmfValue::String("test".into()));
        props.insert("value".to_string(), AmfValue::Number(123.0));
        let value = AmfValue::Object(props);

        let encoded = encode(&value);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_ecma_array_roundtrip() {
        let mut props = HashMap::new();
        props.insert("duration".to_string(), AmfValue::Number(0.0));
        let value = AmfValue::EcmaArray(props);

        let encoded = encode(&value);
        assert_eq!(encoded[0], 0x08);
        assert_eq!(decode(&encoded).unwrap(), value);
    }

    #[test]
    fn test_array_roundtrip() {
        let value = AmfValue::Array(vec![
            AmfValue::Number(1.0),
            AmfValue::String("two".into()),
            AmfValue::Boolean(true),
        ]);
        let encoded = encode(&value);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_date_roundtrip() {
        let value = AmfValue::Date(1234567890000.0);
        let encoded = encode(&value);
        assert_eq!(encoded.len(), 11);
        assert_eq!(decode(&encoded).unwrap(), value);
    }

    #[test]
    fn test_multiple_values() {
        let values = vec![
            AmfValue::String("connect".into()),
            AmfValue::Number(1.0),
            AmfValue::Null,
        ];

        let encoded = encode_all(&values);
        let decoded = decode_all(&encoded).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn test_long_string() {
        let long_str = "x".repeat(70000);
        let value = AmfValue::String(long_str.clone());
        let encoded = encode(&value);
        assert_eq!(encoded[0], 0x0C);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, AmfValue::String(long_str));
    }

    #[test]
    fn test_reserved_markers_rejected() {
        // MovieClip, Reference, RecordSet, XML, TypedObject, AVM+
        for marker in [0x04u8, 0x07, 0x0E, 0x0F, 0x10, 0x11] {
            let err = decode(&[marker]).unwrap_err();
            assert!(matches!(err, AmfError::Unsupported(m) if m == marker));
        }
    }

    #[test]
    fn test_truncated_inputs() {
        // Truncated number
        assert!(matches!(decode(&[0x00, 0x40]), Err(AmfError::Malformed)));
        // String length runs past the end
        assert!(matches!(decode(&[0x02, 0x00, 0x05, b'a']), Err(AmfError::Malformed)));
        // Object missing its end marker
        assert!(matches!(decode(&[0x03, 0x00, 0x00]), Err(AmfError::Malformed)));
        // Empty input
        assert!(matches!(decode(&[]), Err(AmfError::Malformed)));
    }

    #[test]
    fn test_integer_promoted_to_number() {
        let encoded = encode(&AmfValue::Integer(7));
        assert_eq!(decode(&encoded).unwrap(), AmfValue::Number(7.0));
    }
}
