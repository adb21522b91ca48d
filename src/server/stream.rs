//! Net-stream state and the adapters between RTMP connections and the broker
//!
//! A net-stream is RTMP's per-stream session inside a connection. Its role
//! is assigned exactly once by `publish` or `play`; the broker sees it as a
//! `PacketSource` (publisher side) or a `PacketSink` (subscriber side).

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::broker::PacketSink;
use crate::broker::PacketSource;
use crate::error::{Error, Result};
use crate::media::packet::AvPacket;
use crate::protocol::constants::*;
use crate::protocol::message::{Command, RtmpMessage};

/// Role of a net-stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRole {
    Unknown,
    Publish,
    Subscribe,
    Closed,
}

/// Per-stream state held by a connection
#[derive(Debug)]
pub struct NetStream {
    pub id: u32,
    pub role: StreamRole,
    pub stream_name: String,
    pub publish_type: String,
    /// Publisher role: feeds the room's producer task
    pub media_tx: Option<mpsc::Sender<AvPacket>>,
    /// Subscriber role: uid in the room's subscriber map
    pub subscriber_uid: Option<u64>,
}

impl NetStream {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            role: StreamRole::Unknown,
            stream_name: String::new(),
            publish_type: String::new(),
            media_tx: None,
            subscriber_uid: None,
        }
    }

    pub fn is_publishing(&self) -> bool {
        self.role == StreamRole::Publish
    }

    pub fn is_subscribing(&self) -> bool {
        self.role == StreamRole::Subscribe
    }
}

/// One outbound message queued for the connection's writer task
#[derive(Debug, Clone)]
pub struct OutMessage {
    pub csid: u32,
    pub timestamp: u32,
    pub message_type: u8,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl OutMessage {
    /// Protocol control / user control message on stream 0
    pub fn control(message: &RtmpMessage) -> Self {
        let (message_type, payload) = message.encode();
        Self {
            csid: CSID_PROTOCOL_CONTROL,
            timestamp: 0,
            message_type,
            stream_id: 0,
            payload,
        }
    }

    /// Command message
    pub fn command(command: &Command, stream_id: u32) -> Self {
        let (message_type, payload) = RtmpMessage::Command(command.clone()).encode();
        Self {
            csid: CSID_COMMAND,
            timestamp: 0,
            message_type,
            stream_id,
            payload,
        }
    }

    /// AV packet, re-addressed to the subscriber's stream id
    pub fn from_packet(packet: &AvPacket, stream_id: u32) -> Self {
        let message_type = packet.kind.message_type();
        let csid = match message_type {
            MSG_AUDIO => CSID_AUDIO,
            MSG_VIDEO => CSID_VIDEO,
            _ => CSID_METADATA,
        };
        Self {
            csid,
            timestamp: packet.timestamp,
            message_type,
            stream_id,
            payload: packet.body.clone(),
        }
    }
}

/// Publisher-side adapter: the room's producer reads the connection's
/// bounded media queue through a refreshing deadline
pub struct RtmpIngest {
    rx: mpsc::Receiver<AvPacket>,
    read_timeout: Duration,
}

impl RtmpIngest {
    /// Returns the ingest and the sender the connection feeds
    pub fn new(read_timeout: Duration) -> (Self, mpsc::Sender<AvPacket>) {
        let (tx, rx) = mpsc::channel(MEDIA_QUEUE_CAPACITY);
        (Self { rx, read_timeout }, tx)
    }
}

#[async_trait]
impl PacketSource for RtmpIngest {
    async fn read_packet(&mut self) -> Result<AvPacket> {
        match timeout(self.read_timeout, self.rx.recv()).await {
            Ok(Some(packet)) => Ok(packet),
            Ok(None) => Err(Error::ConnectionClosed),
            Err(_) => Err(Error::StreamTimeout),
        }
    }
}

/// Subscriber-side adapter: non-blocking writes onto the connection's
/// outbound queue; a nearly-full queue is fatal for this subscriber
pub struct RtmpSink {
    out_tx: mpsc::Sender<OutMessage>,
    stream_id: u32,
}

impl RtmpSink {
    pub fn new(out_tx: mpsc::Sender<OutMessage>, stream_id: u32) -> Self {
        Self { out_tx, stream_id }
    }
}

impl PacketSink for RtmpSink {
    fn write_packet(&self, packet: &AvPacket) -> Result<()> {
        if self.out_tx.capacity() <= QUEUE_HEADROOM {
            return Err(Error::SubscriberLagging);
        }
        self.out_tx
            .try_send(OutMessage::from_packet(packet, self.stream_id))
            .map_err(|_| Error::SubscriberLagging)
    }

    fn close(&self) {
        // The queue belongs to the connection; dropping the subscriber entry
        // is enough. The viewer connection lives on.
    }
}
