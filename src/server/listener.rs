//! RTMP server listener
//!
//! Handles the TCP accept loop and spawns connection handlers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use crate::broker::StreamObserver;
use crate::config::RtmpConfig;
use crate::error::{Error, Result};
use crate::server::connection::Connection;

/// RTMP server
pub struct RtmpServer {
    config: RtmpConfig,
    observer: Arc<dyn StreamObserver>,
    next_session_id: AtomicU64,
}

impl RtmpServer {
    pub fn new(config: RtmpConfig, observer: Arc<dyn StreamObserver>) -> Self {
        Self {
            config,
            observer,
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Run the server; blocks until the accept loop fails
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.accept_loop(&listener).await
    }

    /// Run the server until the shutdown future resolves
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let listener = self.bind().await?;

        tokio::select! {
            _ = shutdown => {
                tracing::info!("RTMP listener shutting down");
                Ok(())
            }
            result = self.accept_loop(&listener) => result,
        }
    }

    async fn bind(&self) -> Result<TcpListener> {
        let addr = format!("0.0.0.0:{}", self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Config(format!("RTMP bind {}: {}", addr, e)))?;
        tracing::info!(addr = %addr, "RTMP server listening");
        Ok(listener)
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(session_id = session_id, peer = %peer_addr, "new connection");
                    self.spawn_connection(session_id, socket, peer_addr);
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                }
            }
        }
    }

    fn spawn_connection(
        &self,
        session_id: u64,
        socket: TcpStream,
        peer_addr: std::net::SocketAddr,
    ) {
        if let Err(e) = socket.set_nodelay(true) {
            tracing::warn!(session_id = session_id, error = %e, "set_nodelay failed");
        }

        let mut connection = Connection::new(
            session_id,
            peer_addr,
            self.config.read_timeout(),
            Arc::clone(&self.observer),
        );

        tokio::spawn(async move {
            if let Err(e) = connection.run(socket).await {
                tracing::debug!(session_id = session_id, error = %e, "connection ended");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::subscriber::test_support::RecordingSink;
    use crate::broker::{RoomRegistry, SubscriberProtocol};
    use crate::client::RtmpPublishSink;
    use crate::media::packet::{AvPacket, PacketKind};
    use bytes::{BufMut, Bytes, BytesMut};
    use tokio::time::{sleep, Duration};

    fn video_seq_header() -> AvPacket {
        AvPacket::video(0, Bytes::from_static(&[0x17, 0x00, 0x00, 0x00, 0x00, 0x01]))
    }

    fn keyframe(ts: u32, total_len: usize) -> AvPacket {
        let mut body = BytesMut::with_capacity(total_len);
        body.put_slice(&[0x17, 0x01, 0x00, 0x00, 0x00]);
        body.resize(total_len, 0x42);
        AvPacket::video(ts, body.freeze())
    }

    /// Publish over a real socket: handshake, connect, createStream,
    /// publish, then media, observed through the broker
    #[tokio::test]
    async fn test_publish_over_tcp_reaches_subscriber() {
        let port = 19_350 + (std::process::id() % 500) as u16;
        let registry = Arc::new(RoomRegistry::with_gop_size(1));

        let config = RtmpConfig {
            port,
            gop_size: 1,
            read_timeout: 5,
        };
        let server = RtmpServer::new(config, Arc::clone(&registry) as _);
        tokio::spawn(async move {
            let _ = server.run().await;
        });
        sleep(Duration::from_millis(50)).await;

        // The publish client completes the command sequence before returning
        let url = format!("rtmp://127.0.0.1:{}/live/cam", port);
        let publisher = RtmpPublishSink::connect(&url).await.unwrap();

        // The Publish.Start status races the broker registration slightly
        sleep(Duration::from_millis(50)).await;
        let room = registry.get("cam").await.expect("room created by publish");
        assert!(room.has_publisher().await);

        // Attach a viewer, then stream a sequence header and a 5000-byte
        // keyframe through the full RTMP stack
        let (sink, packets, _, _) = RecordingSink::new();
        registry
            .subscribe("cam", SubscriberProtocol::Rtmp, Box::new(sink))
            .await
            .unwrap();

        use crate::broker::PacketSink;
        publisher.write_packet(&video_seq_header()).unwrap();
        publisher.write_packet(&keyframe(40, 5000)).unwrap();
        sleep(Duration::from_millis(200)).await;

        let received = packets.lock().unwrap();
        assert_eq!(received.len(), 3);
        assert_eq!(received[0].kind, PacketKind::Metadata);
        assert!(received[1].is_video_seq_header());
        assert!(received[2].is_keyframe());
        assert_eq!(received[2].length, 5000);
        assert_eq!(received[2].timestamp, 40);
        assert_eq!(received[2].body, keyframe(40, 5000).body);
    }
}
