//! A room: one publisher slot, many subscribers, one producer task

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::cache::AvCache;
use super::metadata::Metadata;
use super::publisher::{PacketSource, PublisherHandle};
use super::subscriber::{Subscriber, SubscriberState};
use crate::media::packet::{AvPacket, PacketKind};

/// The unit of multicast, keyed by stream name
pub struct Room {
    name: String,
    pub(crate) state: RwLock<RoomState>,
}

/// Mutable room state behind the room's own lock
///
/// The registry's outer map lock is never held while this one is taken.
#[derive(Default)]
pub(crate) struct RoomState {
    pub publisher: Option<PublisherHandle>,
    /// Bumped on every publish; lets an exiting producer recognize that a
    /// newer publisher already took the slot
    pub generation: u64,
    pub metadata: Option<Metadata>,
    pub rtmp_subscribers: HashMap<u64, Subscriber>,
    pub flv_subscribers: HashMap<u64, Subscriber>,
    pub hls_subscriber: Option<Subscriber>,
}

impl Room {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: RwLock::new(RoomState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// No producer task and no subscribers of any protocol
    pub async fn is_idle(&self) -> bool {
        let state = self.state.read().await;
        state.publisher.is_none()
            && state.rtmp_subscribers.is_empty()
            && state.flv_subscribers.is_empty()
            && state.hls_subscriber.is_none()
    }

    pub async fn has_publisher(&self) -> bool {
        self.state.read().await.publisher.is_some()
    }

    pub async fn subscriber_count(&self) -> usize {
        let state = self.state.read().await;
        state.rtmp_subscribers.len()
            + state.flv_subscribers.len()
            + usize::from(state.hls_subscriber.is_some())
    }

    /// Current metadata as a canonical onMetaData packet; a placeholder is
    /// synthesized before the publisher has sent any
    pub async fn metadata_packet(&self) -> AvPacket {
        let state = self.state.read().await;
        state
            .metadata
            .as_ref()
            .cloned()
            .unwrap_or_default()
            .to_packet()
    }

    pub(crate) async fn set_metadata(&self, metadata: Metadata) {
        self.state.write().await.metadata = Some(metadata);
    }

    /// Deliver one AV packet to every subscriber
    ///
    /// New subscribers get the cache replay instead of the current packet
    /// (the current packet is already in the cache); running ones get the
    /// packet; closed ones are dropped from the maps. The HLS subscriber is
    /// fed directly on the hot path, never from the cache.
    pub(crate) async fn broadcast(&self, packet: &AvPacket, cache: &AvCache) {
        let mut state = self.state.write().await;

        broadcast_pass(&mut state.rtmp_subscribers, packet, cache);
        broadcast_pass(&mut state.flv_subscribers, packet, cache);

        let hls_dead = match &state.hls_subscriber {
            Some(hls) => hls.is_closed() || hls.write_packet(packet).is_err(),
            None => false,
        };
        if hls_dead {
            tracing::warn!(room = %self.name, "HLS subscriber dropped");
            if let Some(hls) = state.hls_subscriber.take() {
                hls.close();
            }
        }
    }

    /// Deliver a metadata packet to every attached subscriber
    pub(crate) async fn broadcast_metadata(&self, packet: &AvPacket) {
        let mut state = self.state.write().await;

        metadata_pass(&mut state.rtmp_subscribers, packet);
        metadata_pass(&mut state.flv_subscribers, packet);

        let hls_dead = match &state.hls_subscriber {
            Some(hls) => hls.is_closed() || hls.write_packet(packet).is_err(),
            None => false,
        };
        if hls_dead {
            if let Some(hls) = state.hls_subscriber.take() {
                hls.close();
            }
        }
    }

    /// Clear the publisher slot on producer exit, unless a newer publisher
    /// already replaced it
    pub(crate) async fn clear_publisher(&self, generation: u64) {
        let mut state = self.state.write().await;
        if state.generation == generation {
            state.publisher = None;
        }
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room").field("name", &self.name).finish()
    }
}

/// One fan-out pass over a subscriber map
fn broadcast_pass(map: &mut HashMap<u64, Subscriber>, packet: &AvPacket, cache: &AvCache) {
    map.retain(|uid, sub| match sub.state() {
        SubscriberState::Closed => false,
        SubscriberState::New => {
            match cache.write_to(|cached| sub.write_packet(cached)) {
                Ok(()) => {
                    sub.mark_running();
                    true
                }
                Err(e) => {
                    tracing::warn!(uid = uid, error = %e, "cache flush failed, dropping subscriber");
                    sub.close();
                    false
                }
            }
        }
        SubscriberState::Running => match sub.write_packet(packet) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(uid = uid, error = %e, "write failed, dropping subscriber");
                sub.close();
                false
            }
        },
    });
}

fn metadata_pass(map: &mut HashMap<u64, Subscriber>, packet: &AvPacket) {
    map.retain(|uid, sub| {
        if sub.is_closed() {
            return false;
        }
        match sub.write_packet(packet) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(uid = uid, error = %e, "metadata write failed, dropping subscriber");
                sub.close();
                false
            }
        }
    });
}

/// The per-room producer task
///
/// Reads packets from the publisher until it errors (EOF, timeout, wire
/// damage), maintaining the cache and fanning out. The room keeps its
/// subscribers afterwards so a republish can resume serving them.
pub(crate) async fn serve(
    room: Arc<Room>,
    mut source: Box<dyn PacketSource>,
    mut cache: AvCache,
    generation: u64,
) {
    tracing::debug!(room = %room.name(), "producer started");

    loop {
        let packet = match source.read_packet().await {
            Ok(packet) => packet,
            Err(e) => {
                tracing::info!(room = %room.name(), reason = %e, "producer stopped");
                break;
            }
        };

        match packet.kind {
            PacketKind::Metadata => match Metadata::parse(&packet.body) {
                Ok(metadata) => {
                    let canonical = metadata.to_packet();
                    room.set_metadata(metadata).await;
                    room.broadcast_metadata(&canonical).await;
                }
                Err(e) => {
                    tracing::warn!(room = %room.name(), error = %e, "bad metadata packet");
                }
            },
            PacketKind::Video => {
                if packet.body.is_empty() || !(packet.is_avc() || packet.is_hevc()) {
                    tracing::warn!(room = %room.name(), "rejecting video packet with unknown codec");
                    continue;
                }
                if let Err(e) = cache.write(&packet) {
                    tracing::warn!(room = %room.name(), error = %e, "cache write failed");
                }
                room.broadcast(&packet, &cache).await;
            }
            PacketKind::Audio => {
                if packet.body.is_empty() {
                    continue;
                }
                if let Err(e) = cache.write(&packet) {
                    tracing::warn!(room = %room.name(), error = %e, "cache write failed");
                }
                room.broadcast(&packet, &cache).await;
            }
        }
    }

    room.clear_publisher(generation).await;
}
