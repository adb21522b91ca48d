//! RTMP server: TCP listener, per-connection tasks, command dispatch

pub mod connection;
pub mod listener;
pub mod stream;

pub use listener::RtmpServer;
pub use stream::{OutMessage, RtmpIngest, RtmpSink};
