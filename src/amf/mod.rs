//! AMF (Action Message Format) implementation
//!
//! AMF is Adobe's binary serialization format used in RTMP for encoding
//! command parameters and metadata. This module implements AMF0 plus the
//! reference-free AMF3 subset that actually appears on the wire.

pub mod amf0;
pub mod amf3;
pub mod value;

pub use amf0::{Amf0Decoder, Amf0Encoder};
pub use amf3::{Amf3Decoder, Amf3Encoder};
pub use value::AmfValue;
