//! Unified error types for livehub

use std::fmt;
use std::io;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all relay operations
#[derive(Debug)]
pub enum Error {
    /// I/O error during network or file operations
    Io(io::Error),
    /// RTMP/RTP wire protocol violation
    Protocol(ProtocolError),
    /// AMF encoding/decoding error
    Amf(AmfError),
    /// Handshake failure
    Handshake(HandshakeError),
    /// Media parsing error
    Media(MediaError),
    /// publish after subscribe on the same net-stream, or vice versa
    StreamConflict,
    /// Publisher read exceeded its deadline
    StreamTimeout,
    /// Subscriber outbound queue is nearly full
    SubscriberLagging,
    /// Request refused by peer or policy
    Rejected(String),
    /// Operation timed out
    Timeout,
    /// Connection was closed
    ConnectionClosed,
    /// Invalid configuration
    Config(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e),
            Error::Amf(e) => write!(f, "AMF error: {}", e),
            Error::Handshake(e) => write!(f, "Handshake error: {}", e),
            Error::Media(e) => write!(f, "Media error: {}", e),
            Error::StreamConflict => write!(f, "Stream role already assigned"),
            Error::StreamTimeout => write!(f, "Publisher read timed out"),
            Error::SubscriberLagging => write!(f, "Subscriber outbound queue is full"),
            Error::Rejected(msg) => write!(f, "Rejected: {}", msg),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::ConnectionClosed => write!(f, "Connection closed"),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<AmfError> for Error {
    fn from(err: AmfError) -> Self {
        Error::Amf(err)
    }
}

impl From<HandshakeError> for Error {
    fn from(err: HandshakeError) -> Self {
        Error::Handshake(err)
    }
}

impl From<MediaError> for Error {
    fn from(err: MediaError) -> Self {
        Error::Media(err)
    }
}

/// Protocol-level errors (RTMP chunk stream, RTP framing)
#[derive(Debug)]
pub enum ProtocolError {
    InvalidChunkHeader,
    UnknownMessageType(u8),
    MessageTooLarge { size: u32, max: u32 },
    UnexpectedMessage(String),
    InvalidCommand(String),
    StreamNotFound(u32),
    InvalidRtpPacket,
    SsrcChanged { expected: u32, got: u32 },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidChunkHeader => write!(f, "Invalid chunk header"),
            ProtocolError::UnknownMessageType(t) => write!(f, "Unknown message type: {}", t),
            ProtocolError::MessageTooLarge { size, max } => {
                write!(f, "Message too large: {} bytes (max {})", size, max)
            }
            ProtocolError::UnexpectedMessage(msg) => write!(f, "Unexpected message: {}", msg),
            ProtocolError::InvalidCommand(cmd) => write!(f, "Invalid command: {}", cmd),
            ProtocolError::StreamNotFound(id) => write!(f, "Stream not found: {}", id),
            ProtocolError::InvalidRtpPacket => write!(f, "Invalid RTP packet"),
            ProtocolError::SsrcChanged { expected, got } => {
                write!(f, "SSRC changed mid-session: expected {}, got {}", expected, got)
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// AMF encoding/decoding errors
#[derive(Debug)]
pub enum AmfError {
    /// Truncated or otherwise damaged input
    Malformed,
    /// Marker (or reference form) the codec does not handle
    Unsupported(u8),
    /// Caller asked for one kind, the wire carried another
    TypeMismatch(&'static str),
    /// Invalid UTF-8 in a string value
    InvalidUtf8,
    /// Object/array nesting exceeds the sanity bound
    NestingTooDeep,
}

impl fmt::Display for AmfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AmfError::Malformed => write!(f, "Malformed AMF data"),
            AmfError::Unsupported(m) => write!(f, "Unsupported AMF marker: 0x{:02x}", m),
            AmfError::TypeMismatch(expected) => write!(f, "AMF type mismatch, expected {}", expected),
            AmfError::InvalidUtf8 => write!(f, "Invalid UTF-8 in AMF string"),
            AmfError::NestingTooDeep => write!(f, "AMF nesting too deep"),
        }
    }
}

impl std::error::Error for AmfError {}

/// Handshake-specific errors
#[derive(Debug)]
pub enum HandshakeError {
    InvalidVersion(u8),
    DigestMismatch,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::InvalidVersion(v) => write!(f, "Invalid RTMP version: {}", v),
            HandshakeError::DigestMismatch => write!(f, "Handshake digest mismatch"),
        }
    }
}

impl std::error::Error for HandshakeError {}

/// Media parsing errors
#[derive(Debug)]
pub enum MediaError {
    InvalidFlvTag,
    InvalidAvcPacket,
    InvalidAacPacket,
    UnsupportedCodec(u8),
    InvalidNalu,
    MissingSequenceHeader,
    GopFull,
}

impl fmt::Display for MediaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaError::InvalidFlvTag => write!(f, "Invalid FLV tag"),
            MediaError::InvalidAvcPacket => write!(f, "Invalid AVC packet"),
            MediaError::InvalidAacPacket => write!(f, "Invalid AAC packet"),
            MediaError::UnsupportedCodec(id) => write!(f, "Unsupported codec id: {}", id),
            MediaError::InvalidNalu => write!(f, "Invalid NAL unit"),
            MediaError::MissingSequenceHeader => write!(f, "Missing sequence header"),
            MediaError::GopFull => write!(f, "GOP slot is at capacity"),
        }
    }
}

impl std::error::Error for MediaError {}
