//! AMF3 encoder and decoder
//!
//! Only the reference-free subset seen on the wire is handled. Reference
//! tables for strings, traits and objects are not maintained: any U29 whose
//! low bit signals a reference fails with `AmfError::Unsupported`.
//!
//! Type markers:
//! ```text
//! 0x00 - Undefined
//! 0x01 - Null
//! 0x02 - False
//! 0x03 - True
//! 0x04 - Integer (U29, 29-bit signed)
//! 0x05 - Double
//! 0x06 - String (U29 length, no string table)
//! 0x08 - Date (U29 flag + double)
//! 0x09 - Array (dense portion only)
//! 0x0A - Object (dynamic members, empty class name)
//! 0x0C - ByteArray
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use super::value::AmfValue;
use crate::error::AmfError;

const MARKER_UNDEFINED: u8 = 0x00;
const MARKER_NULL: u8 = 0x01;
const MARKER_FALSE: u8 = 0x02;
const MARKER_TRUE: u8 = 0x03;
const MARKER_INTEGER: u8 = 0x04;
const MARKER_DOUBLE: u8 = 0x05;
const MARKER_STRING: u8 = 0x06;
const MARKER_DATE: u8 = 0x08;
const MARKER_ARRAY: u8 = 0x09;
const MARKER_OBJECT: u8 = 0x0A;
const MARKER_BYTE_ARRAY: u8 = 0x0C;

/// Largest value representable in a U29
const U29_MAX: u32 = 0x1FFF_FFFF;

/// Dynamic-object traits word: inline object, inline traits, dynamic,
/// zero sealed members
const TRAITS_DYNAMIC: u32 = 0x0B;

/// AMF3 decoder
pub struct Amf3Decoder;

impl Amf3Decoder {
    pub fn new() -> Self {
        Self
    }

    /// Decode a single AMF3 value from the buffer
    pub fn decode(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        if buf.is_empty() {
            return Err(AmfError::Malformed);
        }

        let marker = buf.get_u8();
        match marker {
            MARKER_UNDEFINED => Ok(AmfValue::Undefined),
            MARKER_NULL => Ok(AmfValue::Null),
            MARKER_FALSE => Ok(AmfValue::Boolean(false)),
            MARKER_TRUE => Ok(AmfValue::Boolean(true)),
            MARKER_INTEGER => self.decode_integer(buf),
            MARKER_DOUBLE => self.decode_double(buf),
            MARKER_STRING => Ok(AmfValue::String(self.read_utf8(buf)?)),
            MARKER_DATE => self.decode_date(buf),
            MARKER_ARRAY => self.decode_array(buf),
            MARKER_OBJECT => self.decode_object(buf),
            MARKER_BYTE_ARRAY => self.decode_byte_array(buf),
            other => Err(AmfError::Unsupported(other)),
        }
    }

    /// Decode all values from buffer until exhausted
    pub fn decode_all(&mut self, buf: &mut Bytes) -> Result<Vec<AmfValue>, AmfError> {
        let mut values = Vec::new();
        while buf.has_remaining() {
            values.push(self.decode(buf)?);
        }
        Ok(values)
    }

    fn decode_integer(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        let raw = read_u29(buf)?;
        // Sign-extend from 29 bits
        let value = if raw & 0x1000_0000 != 0 {
            raw as i32 - 0x2000_0000
        } else {
            raw as i32
        };
        Ok(AmfValue::Integer(value))
    }

    fn decode_double(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        if buf.remaining() < 8 {
            return Err(AmfError::Malformed);
        }
        Ok(AmfValue::Number(buf.get_f64()))
    }

    fn decode_date(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        let flag = read_u29(buf)?;
        if flag & 0x01 == 0 {
            // Date reference
            return Err(AmfError::Unsupported(MARKER_DATE));
        }
        if buf.remaining() < 8 {
            return Err(AmfError::Malformed);
        }
        Ok(AmfValue::Date(buf.get_f64()))
    }

    fn decode_array(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        let header = read_u29(buf)?;
        if header & 0x01 == 0 {
            // Array reference
            return Err(AmfError::Unsupported(MARKER_ARRAY));
        }
        let dense_count = (header >> 1) as usize;

        // Associative portion must be empty (dense arrays only)
        let key = self.read_utf8(buf)?;
        if !key.is_empty() {
            return Err(AmfError::Unsupported(MARKER_ARRAY));
        }

        let mut elements = Vec::with_capacity(dense_count.min(1024));
        for _ in 0..dense_count {
            elements.push(self.decode(buf)?);
        }
        Ok(AmfValue::Array(elements))
    }

    fn decode_object(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        let traits = read_u29(buf)?;
        if traits & 0x01 == 0 {
            // Object reference
            return Err(AmfError::Unsupported(MARKER_OBJECT));
        }
        // Only inline dynamic traits with no sealed members are handled
        if traits != TRAITS_DYNAMIC {
            return Err(AmfError::Unsupported(MARKER_OBJECT));
        }

        let class_name = self.read_utf8(buf)?;
        if !class_name.is_empty() {
            return Err(AmfError::Unsupported(MARKER_OBJECT));
        }

        // Dynamic members until the empty key
        let mut properties = HashMap::new();
        loop {
            let key = self.read_utf8(buf)?;
            if key.is_empty() {
                break;
            }
            let value = self.decode(buf)?;
            properties.insert(key, value);
        }

        Ok(AmfValue::Object(properties))
    }

    fn decode_byte_array(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        let header = read_u29(buf)?;
        if header & 0x01 == 0 {
            return Err(AmfError::Unsupported(MARKER_BYTE_ARRAY));
        }
        let len = (header >> 1) as usize;
        if buf.remaining() < len {
            return Err(AmfError::Malformed);
        }
        Ok(AmfValue::ByteArray(buf.copy_to_bytes(len).to_vec()))
    }

    /// Read a U29-prefixed UTF-8 string (inline form only)
    fn read_utf8(&mut self, buf: &mut Bytes) -> Result<String, AmfError> {
        let header = read_u29(buf)?;
        if header & 0x01 == 0 {
            // String table reference
            return Err(AmfError::Unsupported(MARKER_STRING));
        }
        let len = (header >> 1) as usize;
        if buf.remaining() < len {
            return Err(AmfError::Malformed);
        }
        let bytes = buf.copy_to_bytes(len);
        String::from_utf8(bytes.to_vec()).map_err(|_| AmfError::InvalidUtf8)
    }
}

impl Default for Amf3Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Read a variable-length U29 (1-4 bytes)
fn read_u29(buf: &mut Bytes) -> Result<u32, AmfError> {
    let mut value: u32 = 0;
    for i in 0..4 {
        if buf.is_empty() {
            return Err(AmfError::Malformed);
        }
        let byte = buf.get_u8();
        if i == 3 {
            // Final byte carries all 8 bits
            value = (value << 8) | byte as u32;
            return Ok(value);
        }
        value = (value << 7) | (byte & 0x7F) as u32;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    unreachable!()
}

/// Write a variable-length U29; the range check is against the input value
fn write_u29(buf: &mut BytesMut, val: u32) -> Result<(), AmfError> {
    if val <= 0x0000_007F {
        buf.put_u8(val as u8);
    } else if val <= 0x0000_3FFF {
        buf.put_u8((val >> 7 | 0x80) as u8);
        buf.put_u8((val & 0x7F) as u8);
    } else if val <= 0x001F_FFFF {
        buf.put_u8((val >> 14 | 0x80) as u8);
        buf.put_u8((val >> 7 & 0x7F | 0x80) as u8);
        buf.put_u8((val & 0x7F) as u8);
    } else if val <= U29_MAX {
        buf.put_u8((val >> 22 | 0x80) as u8);
        buf.put_u8((val >> 15 & 0x7F | 0x80) as u8);
        buf.put_u8((val >> 8 & 0x7F | 0x80) as u8);
        buf.put_u8(val as u8);
    } else {
        return Err(AmfError::Malformed);
    }
    Ok(())
}

/// AMF3 encoder for the same subset the decoder reads
pub struct Amf3Encoder {
    buf: BytesMut,
}

impl Amf3Encoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
        }
    }

    /// Get the encoded bytes and reset encoder
    pub fn finish(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Encode a single AMF3 value
    pub fn encode(&mut self, value: &AmfValue) -> Result<(), AmfError> {
        match value {
            AmfValue::Undefined => self.buf.put_u8(MARKER_UNDEFINED),
            AmfValue::Null => self.buf.put_u8(MARKER_NULL),
            AmfValue::Boolean(false) => self.buf.put_u8(MARKER_FALSE),
            AmfValue::Boolean(true) => self.buf.put_u8(MARKER_TRUE),
            AmfValue::Integer(i) => {
                // Chosen between Integer and Double by magnitude
                if *i >= 0 && (*i as u32) <= U29_MAX {
                    self.buf.put_u8(MARKER_INTEGER);
                    write_u29(&mut self.buf, *i as u32)?;
                } else {
                    self.buf.put_u8(MARKER_DOUBLE);
                    self.buf.put_f64(*i as f64);
                }
            }
            AmfValue::Number(n) => {
                self.buf.put_u8(MARKER_DOUBLE);
                self.buf.put_f64(*n);
            }
            AmfValue::String(s) => {
                self.buf.put_u8(MARKER_STRING);
                self.write_utf8(s)?;
            }
            AmfValue::Date(ts) => {
                self.buf.put_u8(MARKER_DATE);
                write_u29(&mut self.buf, 0x01)?;
                self.buf.put_f64(*ts);
            }
            AmfValue::Array(elements) => {
                self.buf.put_u8(MARKER_ARRAY);
                write_u29(&mut self.buf, ((elements.len() as u32) << 1) | 0x01)?;
                self.write_utf8("")?; // empty associative portion
                for elem in elements {
                    self.encode(elem)?;
                }
            }
            AmfValue::Object(props) | AmfValue::EcmaArray(props) => {
                self.buf.put_u8(MARKER_OBJECT);
                write_u29(&mut self.buf, TRAITS_DYNAMIC)?;
                self.write_utf8("")?; // anonymous class
                for (key, val) in props {
                    self.write_utf8(key)?;
                    self.encode(val)?;
                }
                self.write_utf8("")?; // dynamic-member terminator
            }
            AmfValue::ByteArray(bytes) => {
                self.buf.put_u8(MARKER_BYTE_ARRAY);
                write_u29(&mut self.buf, ((bytes.len() as u32) << 1) | 0x01)?;
                self.buf.put_slice(bytes);
            }
        }
        Ok(())
    }

    fn write_utf8(&mut self, s: &str) -> Result<(), AmfError> {
        write_u29(&mut self.buf, ((s.len() as u32) << 1) | 0x01)?;
        self.buf.put_slice(s.as_bytes());
        Ok(())
    }
}

impl Default for Amf3Encoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: &AmfValue) -> AmfValue {
        let mut encoder = Amf3Encoder::new();
        encoder.encode(value).unwrap();
        let mut buf = encoder.finish();
        Amf3Decoder::new().decode(&mut buf).unwrap()
    }

    #[test]
    fn test_u29_boundaries() {
        for val in [0u32, 0x7F, 0x80, 0x3FFF, 0x4000, 0x1F_FFFF, 0x20_0000, U29_MAX] {
            let mut buf = BytesMut::new();
            write_u29(&mut buf, val).unwrap();
            let mut bytes = buf.freeze();
            assert_eq!(read_u29(&mut bytes).unwrap(), val, "value {:#x}", val);
        }
    }

    #[test]
    fn test_u29_out_of_range() {
        let mut buf = BytesMut::new();
        assert!(write_u29(&mut buf, U29_MAX + 1).is_err());
    }

    #[test]
    fn test_scalar_roundtrips() {
        assert_eq!(roundtrip(&AmfValue::Null), AmfValue::Null);
        assert_eq!(roundtrip(&AmfValue::Undefined), AmfValue::Undefined);
        assert_eq!(roundtrip(&AmfValue::Boolean(true)), AmfValue::Boolean(true));
        assert_eq!(roundtrip(&AmfValue::Boolean(false)), AmfValue::Boolean(false));
        assert_eq!(roundtrip(&AmfValue::Integer(12345)), AmfValue::Integer(12345));
        assert_eq!(roundtrip(&AmfValue::Number(2.5)), AmfValue::Number(2.5));
        assert_eq!(
            roundtrip(&AmfValue::String("onMetaData".into())),
            AmfValue::String("onMetaData".into())
        );
    }

    #[test]
    fn test_negative_integer_becomes_double() {
        // Negative values fall back to Double on encode
        assert_eq!(roundtrip(&AmfValue::Integer(-5)), AmfValue::Number(-5.0));
    }

    #[test]
    fn test_object_roundtrip() {
        let mut props = HashMap::new();
        props.insert("width".to_string(), AmfValue::Integer(1920));
        props.insert("codec".to_string(), AmfValue::String("avc1".into()));
        let value = AmfValue::Object(props);
        assert_eq!(roundtrip(&value), value);
    }

    #[test]
    fn test_array_roundtrip() {
        let value = AmfValue::Array(vec![AmfValue::Integer(1), AmfValue::String("a".into())]);
        assert_eq!(roundtrip(&value), value);
    }

    #[test]
    fn test_byte_array_roundtrip() {
        let value = AmfValue::ByteArray(vec![1, 2, 3, 255]);
        assert_eq!(roundtrip(&value), value);
    }

    #[test]
    fn test_reference_forms_rejected() {
        // String reference: marker 0x06 then U29 with low bit 0
        let mut buf = Bytes::from_static(&[0x06, 0x02]);
        let err = Amf3Decoder::new().decode(&mut buf).unwrap_err();
        assert!(matches!(err, AmfError::Unsupported(_)));

        // Object reference
        let mut buf = Bytes::from_static(&[0x0A, 0x00]);
        let err = Amf3Decoder::new().decode(&mut buf).unwrap_err();
        assert!(matches!(err, AmfError::Unsupported(_)));
    }

    #[test]
    fn test_integer_sign_extension() {
        // 0x1FFFFFFF encodes -1 as a 29-bit signed value
        let mut buf = BytesMut::new();
        buf.put_u8(MARKER_INTEGER);
        write_u29(&mut buf, U29_MAX).unwrap();
        let mut bytes = buf.freeze();
        let value = Amf3Decoder::new().decode(&mut bytes).unwrap();
        assert_eq!(value, AmfValue::Integer(-1));
    }

    #[test]
    fn test_truncated_input() {
        let mut buf = Bytes::from_static(&[0x05, 0x00, 0x00]);
        assert!(matches!(
            Amf3Decoder::new().decode(&mut buf),
            Err(AmfError::Malformed)
        ));
    }
}
