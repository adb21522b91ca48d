//! RTP/RTCP ingest
//!
//! UDP sessions depacketize H.264 (single NAL, STAP-A, FU-A) and AAC
//! (MPEG4-GENERIC AU headers) into common packets and publish them into the
//! room broker, optionally mirrored to an upstream RTMP server.

pub mod depacketizer;
pub mod packer;
pub mod packet;
pub mod rtcp;
pub mod session;

pub use depacketizer::{depacketize_aac, AudioFrame, AvcDepacketizer};
pub use packet::{RtpHeader, RtpPacket};
pub use session::{RtpIngest, RtpSession};

use std::sync::Arc;

use crate::broker::{RoomRegistry, SubscriberProtocol};
use crate::client::RtmpPublishSink;
use crate::config::RtpConfig;
use crate::error::Result;

/// Bind every configured session and wire it into the broker
///
/// Each session publishes into its own room; with `rtp.remote` set, an
/// upstream RTMP publish client is attached to the room as one more
/// subscriber.
pub async fn start(config: &RtpConfig, registry: &Arc<RoomRegistry>) -> Result<()> {
    let single = config.ports.len() == 1;

    for &port in &config.ports {
        let stream = match (&config.stream, single) {
            (Some(name), true) => name.clone(),
            _ => format!("rtp-{}", port),
        };

        let (session, ingest) = RtpSession::bind(port, config.read_timeout()).await?;
        registry
            .publish("rtp", &stream, "live", Box::new(ingest))
            .await?;
        tokio::spawn(session.run());

        if let Some(remote) = &config.remote {
            match RtmpPublishSink::connect(remote).await {
                Ok(sink) => {
                    registry
                        .subscribe(&stream, SubscriberProtocol::Rtmp, Box::new(sink))
                        .await?;
                    tracing::info!(stream = %stream, remote = %remote, "upstream sink attached");
                }
                Err(e) => {
                    tracing::error!(remote = %remote, error = %e, "upstream connect failed");
                }
            }
        }
    }

    Ok(())
}
