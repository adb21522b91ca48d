//! livehub: live streaming media relay
//!
//! This library implements a small relay server:
//! - RTMP ingest (publish) and fan-out (play), including the complex
//!   handshake with HMAC-SHA256 digests and the AMF0/AMF3 command codec
//! - A room broker that mediates between one publisher and many viewers,
//!   with a sequence-header/GOP cache for mid-stream joins
//! - HTTP-FLV fan-out and an HLS pipeline (MPEG-TS segments + rolling M3U8)
//! - RTP/RTCP ingest with H.264 STAP-A/FU-A and AAC depacketization,
//!   feeding the same broker, plus an optional upstream RTMP publish client
//!
//! # Example: relay server
//!
//! ```no_run
//! use std::sync::Arc;
//! use livehub::broker::RoomRegistry;
//! use livehub::server::RtmpServer;
//! use livehub::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let registry = Arc::new(RoomRegistry::new(&config));
//!     let server = RtmpServer::new(config.rtmp.clone(), registry);
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod amf;
pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod hls;
pub mod httpflv;
pub mod media;
pub mod protocol;
pub mod rtp;
pub mod server;

// Re-export main types for convenience
pub use broker::RoomRegistry;
pub use config::Config;
pub use error::{Error, Result};
pub use media::packet::AvPacket;
pub use server::RtmpServer;
