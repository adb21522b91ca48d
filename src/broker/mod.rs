//! Room broker: the registry mediating between publishers and subscribers
//!
//! A process-wide map of stream name to room. Each room has at most one
//! publisher (whose producer task drains the ingest and fans out), RTMP and
//! HTTP-FLV subscriber maps, and at most one HLS pipeline. Rooms are created
//! lazily on first publish or subscribe and destroyed once the producer task
//! has exited and every subscriber map is empty.

pub mod cache;
pub mod metadata;
pub mod publisher;
pub mod room;
pub mod subscriber;

pub use cache::{AvCache, GopCache};
pub use metadata::Metadata;
pub use publisher::{PacketSource, PublisherInfo};
pub use room::Room;
pub use subscriber::{PacketSink, Subscriber, SubscriberProtocol, SubscriberState};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::config::{Config, HlsConfig};
use crate::error::Result;
use publisher::PublisherHandle;

type RoomMap = Arc<RwLock<HashMap<String, Arc<Room>>>>;

/// Contract between the protocol listeners and the broker
///
/// Listeners are constructed with one of these; the broker implements it.
#[async_trait]
pub trait StreamObserver: Send + Sync {
    /// A publisher arrived; the broker takes ownership of the ingest source
    async fn on_publish(
        &self,
        app: &str,
        stream: &str,
        publish_type: &str,
        source: Box<dyn PacketSource>,
    ) -> Result<()>;

    /// The publisher is gone; the room keeps its subscribers
    async fn on_unpublish(&self, app: &str, stream: &str);

    /// A viewer arrived; returns its uid for later detach
    async fn on_subscribe(
        &self,
        app: &str,
        stream: &str,
        protocol: SubscriberProtocol,
        sink: Box<dyn PacketSink>,
    ) -> Result<u64>;

    /// A viewer left
    async fn on_unsubscribe(&self, app: &str, stream: &str, protocol: SubscriberProtocol, uid: u64);
}

/// Process-singleton registry mapping stream name to room
pub struct RoomRegistry {
    rooms: RoomMap,
    next_uid: AtomicU64,
    gop_size: u8,
    hls: Option<HlsConfig>,
}

impl RoomRegistry {
    pub fn new(config: &Config) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            next_uid: AtomicU64::new(1),
            gop_size: config.rtmp.gop_size,
            hls: config.hls.enable.then(|| config.hls.clone()),
        }
    }

    /// Registry with given GOP ring capacity and no HLS pipeline
    pub fn with_gop_size(gop_size: u8) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            next_uid: AtomicU64::new(1),
            gop_size,
            hls: None,
        }
    }

    fn next_uid(&self) -> u64 {
        self.next_uid.fetch_add(1, Ordering::Relaxed)
    }

    /// Atomic get-or-create of a room
    pub async fn get_or_create(&self, name: &str) -> Arc<Room> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(name) {
                return Arc::clone(room);
            }
        }
        let mut rooms = self.rooms.write().await;
        Arc::clone(
            rooms
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Room::new(name))),
        )
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(name).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Attach a publisher and start the room's producer task
    ///
    /// An existing publisher for the same name is stopped first (republish).
    pub async fn publish(
        &self,
        app: &str,
        stream: &str,
        publish_type: &str,
        source: Box<dyn PacketSource>,
    ) -> Result<()> {
        let room = self.get_or_create(stream).await;
        let mut state = room.state.write().await;

        if let Some(old) = state.publisher.take() {
            tracing::debug!(room = stream, "republish, stopping previous producer");
            old.stop();
        }

        state.generation += 1;
        let generation = state.generation;
        state.metadata = None;

        let cache = AvCache::new(self.gop_size);
        let serve_room = Arc::clone(&room);
        let rooms = Arc::clone(&self.rooms);
        let room_name = stream.to_string();
        let task = tokio::spawn(async move {
            room::serve(Arc::clone(&serve_room), source, cache, generation).await;
            remove_room_if_idle(&rooms, &room_name).await;
        });

        state.publisher = Some(PublisherHandle {
            info: PublisherInfo::new(app, stream, publish_type),
            generation,
            task,
        });

        // The HLS pipeline rides the producer's hot path; attach one per
        // publish when enabled
        if let Some(hls_config) = &self.hls {
            if let Some(old) = state.hls_subscriber.take() {
                old.close();
            }
            match crate::hls::HlsSink::spawn(hls_config, stream) {
                Ok(sink) => {
                    let sub =
                        Subscriber::new(self.next_uid(), SubscriberProtocol::Hls, Box::new(sink));
                    sub.mark_running();
                    state.hls_subscriber = Some(sub);
                }
                Err(e) => {
                    tracing::error!(room = stream, error = %e, "failed to start HLS pipeline");
                }
            }
        }

        tracing::info!(app = app, room = stream, "publisher attached");
        Ok(())
    }

    /// Detach the publisher; subscribers stay for a future republish
    pub async fn unpublish(&self, stream: &str) {
        if let Some(room) = self.get(stream).await {
            let mut state = room.state.write().await;
            if let Some(handle) = state.publisher.take() {
                tracing::info!(room = stream, "publisher detached");
                handle.stop();
            }
            drop(state);
            remove_room_if_idle(&self.rooms, stream).await;
        }
    }

    /// Attach a subscriber; served the cache once a producer broadcasts
    pub async fn subscribe(
        &self,
        stream: &str,
        protocol: SubscriberProtocol,
        sink: Box<dyn PacketSink>,
    ) -> Result<u64> {
        let room = self.get_or_create(stream).await;
        let uid = self.next_uid();
        let sub = Subscriber::new(uid, protocol, sink);

        let mut state = room.state.write().await;

        // Late joiners get the current metadata right away
        if state.publisher.is_some() {
            let metadata = state
                .metadata
                .as_ref()
                .cloned()
                .unwrap_or_default()
                .to_packet();
            sub.write_packet(&metadata)?;
        } else {
            tracing::debug!(room = stream, "not published yet, queueing subscriber");
        }

        match protocol {
            SubscriberProtocol::Rtmp => {
                state.rtmp_subscribers.insert(uid, sub);
            }
            SubscriberProtocol::HttpFlv => {
                state.flv_subscribers.insert(uid, sub);
            }
            SubscriberProtocol::Hls => {
                if let Some(old) = state.hls_subscriber.take() {
                    old.close();
                }
                sub.mark_running();
                state.hls_subscriber = Some(sub);
            }
        }

        tracing::info!(room = stream, uid = uid, protocol = ?protocol, "subscriber attached");
        Ok(uid)
    }

    /// Detach and close a subscriber
    pub async fn unsubscribe(&self, stream: &str, protocol: SubscriberProtocol, uid: u64) {
        if let Some(room) = self.get(stream).await {
            let mut state = room.state.write().await;
            let removed = match protocol {
                SubscriberProtocol::Rtmp => state.rtmp_subscribers.remove(&uid),
                SubscriberProtocol::HttpFlv => state.flv_subscribers.remove(&uid),
                SubscriberProtocol::Hls => state.hls_subscriber.take(),
            };
            if let Some(sub) = removed {
                sub.close();
                tracing::info!(room = stream, uid = uid, "subscriber detached");
            }
            drop(state);
            remove_room_if_idle(&self.rooms, stream).await;
        }
    }
}

/// Drop a room once its producer is gone and no subscriber remains
async fn remove_room_if_idle(rooms: &RwLock<HashMap<String, Arc<Room>>>, name: &str) {
    let idle = match rooms.read().await.get(name) {
        Some(room) => room.is_idle().await,
        None => return,
    };
    if idle {
        let mut map = rooms.write().await;
        if let Some(room) = map.get(name) {
            if room.is_idle().await {
                map.remove(name);
                tracing::debug!(room = name, "room removed");
            }
        }
    }
}

#[async_trait]
impl StreamObserver for RoomRegistry {
    async fn on_publish(
        &self,
        app: &str,
        stream: &str,
        publish_type: &str,
        source: Box<dyn PacketSource>,
    ) -> Result<()> {
        self.publish(app, stream, publish_type, source).await
    }

    async fn on_unpublish(&self, _app: &str, stream: &str) {
        self.unpublish(stream).await;
    }

    async fn on_subscribe(
        &self,
        _app: &str,
        stream: &str,
        protocol: SubscriberProtocol,
        sink: Box<dyn PacketSink>,
    ) -> Result<u64> {
        self.subscribe(stream, protocol, sink).await
    }

    async fn on_unsubscribe(&self, _app: &str, stream: &str, protocol: SubscriberProtocol, uid: u64) {
        self.unsubscribe(stream, protocol, uid).await;
    }
}
