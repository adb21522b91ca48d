//! Publisher: the ingest side of a room

use std::time::Instant;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::media::packet::AvPacket;

/// Blocking packet reader owned by the room's producer task
///
/// `read_packet` suspends until the next packet is available; a timeout,
/// EOF or wire error ends the producer task.
#[async_trait]
pub trait PacketSource: Send {
    async fn read_packet(&mut self) -> Result<AvPacket>;
}

/// Identifying information of an active publisher
#[derive(Debug, Clone)]
pub struct PublisherInfo {
    pub app: String,
    pub stream: String,
    pub publish_type: String,
    pub published_at: Instant,
}

impl PublisherInfo {
    pub fn new(app: &str, stream: &str, publish_type: &str) -> Self {
        Self {
            app: app.to_string(),
            stream: stream.to_string(),
            publish_type: publish_type.to_string(),
            published_at: Instant::now(),
        }
    }
}

/// The room's record of a running producer task
pub(crate) struct PublisherHandle {
    pub info: PublisherInfo,
    /// Monotonic per-room generation; guards slot clearing on exit
    pub generation: u64,
    pub task: JoinHandle<()>,
}

impl PublisherHandle {
    /// Stop the producer task; its ingest source drops with it
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for PublisherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherHandle")
            .field("info", &self.info)
            .field("generation", &self.generation)
            .finish()
    }
}
