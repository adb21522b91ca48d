//! RTP/RTCP UDP session
//!
//! One session per configured even port: RTP on the port, RTCP on the next
//! odd one. All packets must share one SSRC after the first; a deviation
//! terminates the session. Depacketized media is repacked into common
//! packets and handed to the room broker exactly like an RTMP publisher.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::broker::PacketSource;
use crate::error::{Error, ProtocolError, Result};
use crate::media::packet::AvPacket;
use crate::protocol::constants::MEDIA_QUEUE_CAPACITY;

use super::depacketizer::{depacketize_aac, AvcDepacketizer};
use super::packer;
use super::packet::{RtpPacket, PT_AAC, PT_AVC};
use super::rtcp::{RtcpHeader, SenderReport, PT_SR};

/// Broker-facing source fed by the session task
pub struct RtpIngest {
    rx: mpsc::Receiver<AvPacket>,
}

#[async_trait]
impl PacketSource for RtpIngest {
    async fn read_packet(&mut self) -> Result<AvPacket> {
        self.rx.recv().await.ok_or(Error::ConnectionClosed)
    }
}

/// One UDP ingest session
pub struct RtpSession {
    rtp_socket: UdpSocket,
    rtcp_socket: UdpSocket,
    read_timeout: Duration,

    /// Pinned on the first RTP packet
    ssrc: Option<u32>,
    /// Wall-clock anchor for RTMP timestamps
    started_at: Instant,
    /// First RTP timestamp observed
    base_rtp_ts: Option<u32>,

    depacketizer: AvcDepacketizer,
    avc_seq_sent: bool,
    aac_seq_sent: bool,
    /// Last sender-report mapping, kept for diagnostics
    last_sr: Option<SenderReport>,

    av_tx: mpsc::Sender<AvPacket>,
}

impl RtpSession {
    /// Bind the RTP (even) and RTCP (odd) sockets
    pub async fn bind(port: u16, read_timeout: Duration) -> Result<(Self, RtpIngest)> {
        if port % 2 == 1 {
            return Err(Error::Config(format!("RTP port {} must be even", port)));
        }

        let rtp_socket = UdpSocket::bind(("0.0.0.0", port))
            .await
            .map_err(|e| Error::Config(format!("RTP bind {}: {}", port, e)))?;
        let rtcp_socket = UdpSocket::bind(("0.0.0.0", port + 1))
            .await
            .map_err(|e| Error::Config(format!("RTCP bind {}: {}", port + 1, e)))?;

        tracing::info!(rtp = port, rtcp = port + 1, "RTP session listening");

        let (av_tx, rx) = mpsc::channel(MEDIA_QUEUE_CAPACITY);
        Ok((
            Self {
                rtp_socket,
                rtcp_socket,
                read_timeout,
                ssrc: None,
                started_at: Instant::now(),
                base_rtp_ts: None,
                depacketizer: AvcDepacketizer::new(),
                avc_seq_sent: false,
                aac_seq_sent: false,
                last_sr: None,
                av_tx,
            },
            RtpIngest { rx },
        ))
    }

    /// Receive loop; ends on the read deadline, a socket error, or an SSRC
    /// change
    pub async fn run(mut self) {
        enum Incoming {
            Rtp(std::io::Result<usize>),
            Rtcp(std::io::Result<usize>),
            Deadline,
        }

        let mut rtp_buf = vec![0u8; 2048];
        let mut rtcp_buf = vec![0u8; 1500];

        loop {
            let incoming = tokio::select! {
                received = timeout(self.read_timeout, self.rtp_socket.recv(&mut rtp_buf)) => {
                    match received {
                        Ok(result) => Incoming::Rtp(result),
                        Err(_) => Incoming::Deadline,
                    }
                }
                received = self.rtcp_socket.recv(&mut rtcp_buf) => Incoming::Rtcp(received),
            };

            match incoming {
                Incoming::Deadline => {
                    tracing::info!("RTP session read timeout");
                    break;
                }
                Incoming::Rtp(Err(e)) => {
                    tracing::warn!(error = %e, "RTP socket error");
                    break;
                }
                Incoming::Rtp(Ok(n)) => match self.handle_rtp(&rtp_buf[..n]).await {
                    Ok(()) => {}
                    Err(Error::Protocol(ProtocolError::SsrcChanged { expected, got })) => {
                        tracing::error!(expected, got, "SSRC changed, terminating session");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "bad RTP packet");
                    }
                },
                Incoming::Rtcp(Ok(n)) => self.handle_rtcp(&rtcp_buf[..n]),
                Incoming::Rtcp(Err(e)) => {
                    tracing::warn!(error = %e, "RTCP socket error");
                }
            }
        }

        if let Some(sr) = &self.last_sr {
            tracing::debug!(rtp_ts = sr.rtp_timestamp, "last sender report at session end");
        }
        // Dropping av_tx ends the room's producer
    }

    async fn handle_rtp(&mut self, data: &[u8]) -> Result<()> {
        let packet = RtpPacket::parse(Bytes::copy_from_slice(data))?;

        match self.ssrc {
            None => self.ssrc = Some(packet.header.ssrc),
            Some(ssrc) if ssrc != packet.header.ssrc => {
                return Err(ProtocolError::SsrcChanged {
                    expected: ssrc,
                    got: packet.header.ssrc,
                }
                .into());
            }
            _ => {}
        }

        if self.base_rtp_ts.is_none() {
            self.base_rtp_ts = Some(packet.header.timestamp);
        }

        match packet.header.payload_type {
            PT_AVC => self.handle_video(packet).await,
            PT_AAC => self.handle_audio(packet).await,
            other => {
                tracing::debug!(payload_type = other, "unhandled RTP payload type");
                Ok(())
            }
        }
    }

    async fn handle_video(&mut self, packet: RtpPacket) -> Result<()> {
        let marker = self.depacketizer.push(&packet)?;
        if !marker {
            return Ok(());
        }

        // The access unit is complete: the sequence header must precede the
        // first frame
        if !self.avc_seq_sent {
            match (self.depacketizer.sps(), self.depacketizer.pps()) {
                (Some(sps), Some(pps)) => {
                    let header = packer::video_seq_header(sps, pps)?;
                    self.emit(header).await?;
                    self.avc_seq_sent = true;
                }
                _ => {
                    // No parameter sets yet; the unit is not decodable
                    let _ = self.depacketizer.take_access_unit();
                    return Ok(());
                }
            }
        }

        let (nalus, keyframe) = self.depacketizer.take_access_unit();
        if nalus.is_empty() {
            return Ok(());
        }

        let timestamp = self.started_at.elapsed().as_millis() as u32;
        self.emit(packer::video_packet(timestamp, 0, keyframe, nalus))
            .await
    }

    async fn handle_audio(&mut self, packet: RtpPacket) -> Result<()> {
        if !self.aac_seq_sent {
            self.emit(packer::audio_seq_header()).await?;
            self.aac_seq_sent = true;
        }

        for frame in depacketize_aac(&packet)? {
            self.emit(packer::audio_packet(frame.timestamp, frame.data))
                .await?;
        }
        Ok(())
    }

    fn handle_rtcp(&mut self, data: &[u8]) {
        let Ok(header) = RtcpHeader::parse(data) else {
            tracing::debug!("malformed RTCP packet");
            return;
        };
        if header.packet_type == PT_SR {
            match SenderReport::parse(data) {
                Ok(sr) => {
                    tracing::debug!(
                        ssrc = sr.ssrc,
                        rtp_ts = sr.rtp_timestamp,
                        ntp_nanos = sr.unix_nanos(),
                        "sender report"
                    );
                    self.last_sr = Some(sr);
                }
                Err(e) => tracing::debug!(error = %e, "bad sender report"),
            }
        } else {
            tracing::debug!(packet_type = header.packet_type, "ignoring RTCP packet");
        }
    }

    async fn emit(&self, packet: AvPacket) -> Result<()> {
        self.av_tx
            .send(packet)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn rtp_datagram(marker: bool, pt: u8, seq: u16, ts: u32, ssrc: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(0x80);
        buf.put_u8((u8::from(marker) << 7) | pt);
        buf.put_u16(seq);
        buf.put_u32(ts);
        buf.put_u32(ssrc);
        buf.put_slice(payload);
        buf.to_vec()
    }

    async fn bound_session() -> (RtpSession, RtpIngest) {
        use std::sync::atomic::{AtomicU16, Ordering};
        // Ephemeral binds cannot guarantee an even/odd pair, so hand out
        // fixed even ports, distinct per test
        static NEXT: AtomicU16 = AtomicU16::new(0);
        let base = 40_000
            + (std::process::id() % 500) as u16 * 16
            + NEXT.fetch_add(1, Ordering::Relaxed) * 2;
        RtpSession::bind(base, Duration::from_secs(5)).await.unwrap()
    }

    #[tokio::test]
    async fn test_ssrc_pinning() {
        let (mut session, _ingest) = bound_session().await;

        let sps = rtp_datagram(false, PT_AVC, 1, 0, 7, &[0x67, 0x64, 0x00, 0x1F]);
        session.handle_rtp(&sps).await.unwrap();
        assert_eq!(session.ssrc, Some(7));

        let other = rtp_datagram(false, PT_AVC, 2, 0, 8, &[0x68, 0xEF]);
        let err = session.handle_rtp(&other).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::SsrcChanged { expected: 7, got: 8 })
        ));
    }

    #[tokio::test]
    async fn test_fu_a_emits_seq_header_then_nalu() {
        let (mut session, mut ingest) = bound_session().await;

        // Parameter sets via STAP-A
        let mut stap = vec![24u8];
        for nal in [&[0x67u8, 0x64, 0x00, 0x1F][..], &[0x68, 0xEF, 0x38]] {
            stap.extend_from_slice(&(nal.len() as u16).to_be_bytes());
            stap.extend_from_slice(nal);
        }
        session
            .handle_rtp(&rtp_datagram(false, PT_AVC, 1, 1000, 7, &stap))
            .await
            .unwrap();

        // A 4200-byte IDR in three FU-A fragments
        let body = vec![0x42u8; 4199];
        let chunks = [&body[..1400], &body[1400..2800], &body[2800..]];
        for (i, chunk) in chunks.iter().enumerate() {
            let mut payload = vec![0x60 | 28u8];
            let mut fu = 5u8;
            if i == 0 {
                fu |= 0x80;
            }
            if i == 2 {
                fu |= 0x40;
            }
            payload.push(fu);
            payload.extend_from_slice(chunk);
            session
                .handle_rtp(&rtp_datagram(i == 2, PT_AVC, 2 + i as u16, 1000, 7, &payload))
                .await
                .unwrap();
        }

        // Two packets on marker: sequence header, then the NALU packet
        let header = ingest.read_packet().await.unwrap();
        assert!(header.is_video_seq_header());

        let frame = ingest.read_packet().await.unwrap();
        assert!(frame.is_keyframe());
        // After the video preamble: u32 length 4200, restored NAL header
        assert_eq!(&frame.body[5..9], &[0x00, 0x00, 0x10, 0x68]);
        assert_eq!(frame.body[9], 0x65);
    }

    #[tokio::test]
    async fn test_audio_seq_header_precedes_frames() {
        let (mut session, mut ingest) = bound_session().await;

        let mut payload = Vec::new();
        payload.extend_from_slice(&16u16.to_be_bytes());
        payload.extend_from_slice(&((4u16) << 3).to_be_bytes());
        payload.extend_from_slice(&[0x21, 0x00, 0x03, 0x40]);
        session
            .handle_rtp(&rtp_datagram(true, PT_AAC, 1, 44_100, 9, &payload))
            .await
            .unwrap();

        let header = ingest.read_packet().await.unwrap();
        assert!(header.is_aac_seq_header());

        let frame = ingest.read_packet().await.unwrap();
        assert!(frame.is_aac_raw());
        assert_eq!(frame.timestamp, 44_100);
    }

    #[test]
    fn test_odd_port_rejected() {
        let result = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(RtpSession::bind(5005, Duration::from_secs(1)));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
