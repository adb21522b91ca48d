//! RTMP publish client
//!
//! Used as the optional upstream sink of the RTP path: connects out to a
//! remote RTMP server, publishes a stream, and forwards every common packet
//! it is handed.

use std::collections::HashMap;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::amf::AmfValue;
use crate::broker::PacketSink;
use crate::error::{Error, Result};
use crate::media::packet::AvPacket;
use crate::protocol::chunk::{ChunkDecoder, ChunkEncoder, RtmpChunk};
use crate::protocol::constants::*;
use crate::protocol::handshake;
use crate::protocol::message::{Command, RtmpMessage};

/// Connect/response deadline for client setup
const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Parsed rtmp:// URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpUrl {
    pub host: String,
    pub port: u16,
    pub app: String,
    pub stream: String,
}

impl RtmpUrl {
    /// Parse `rtmp://host[:port]/app/stream`
    pub fn parse(url: &str) -> Option<Self> {
        let rest = url.strip_prefix("rtmp://")?;
        let (authority, path) = rest.split_once('/')?;
        let (app, stream) = path.split_once('/')?;
        if app.is_empty() || stream.is_empty() {
            return None;
        }

        let (host, port) = match authority.split_once(':') {
            Some((host, port)) => (host, port.parse().ok()?),
            None => (authority, RTMP_PORT),
        };
        if host.is_empty() {
            return None;
        }

        Some(Self {
            host: host.to_string(),
            port,
            app: app.to_string(),
            stream: stream.to_string(),
        })
    }

    pub fn tc_url(&self) -> String {
        format!("rtmp://{}:{}/{}", self.host, self.port, self.app)
    }
}

/// Low-level client connection
struct Connector {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: BufWriter<tokio::net::tcp::OwnedWriteHalf>,
    read_buf: BytesMut,
    chunk_decoder: ChunkDecoder,
    chunk_encoder: ChunkEncoder,
}

impl Connector {
    async fn connect(url: &RtmpUrl) -> Result<Self> {
        let addr = format!("{}:{}", url.host, url.port);
        let mut socket = timeout(SETUP_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Timeout)??;
        socket.set_nodelay(true)?;

        handshake::client_handshake_complex(&mut socket).await?;

        let (read_half, write_half) = socket.into_split();
        Ok(Self {
            reader: BufReader::with_capacity(64 * 1024, read_half),
            writer: BufWriter::with_capacity(64 * 1024, write_half),
            read_buf: BytesMut::with_capacity(64 * 1024),
            chunk_decoder: ChunkDecoder::new(),
            chunk_encoder: ChunkEncoder::new(),
        })
    }

    async fn send(&mut self, chunk: &RtmpChunk) -> Result<()> {
        let mut buf = BytesMut::with_capacity(chunk.payload.len() + 64);
        self.chunk_encoder.encode(chunk, &mut buf);
        self.writer.write_all(&buf).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn send_command(&mut self, command: &Command) -> Result<()> {
        let (message_type, payload) = RtmpMessage::Command(command.clone()).encode();
        self.send(&RtmpChunk {
            csid: CSID_COMMAND,
            timestamp: 0,
            message_type,
            stream_id: command.stream_id,
            payload,
        })
        .await
    }

    async fn read_message(&mut self) -> Result<RtmpMessage> {
        loop {
            // Drain buffered chunks before touching the socket again
            loop {
                let len_before = self.read_buf.len();
                match self.chunk_decoder.decode(&mut self.read_buf)? {
                    Some(chunk) => {
                        let message = RtmpMessage::from_chunk(&chunk)?;
                        if let RtmpMessage::SetChunkSize(size) = &message {
                            self.chunk_decoder.set_chunk_size(*size);
                        }
                        return Ok(message);
                    }
                    None if self.read_buf.len() == len_before => break,
                    None => {}
                }
            }

            let n = self.reader.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
    }

    /// Wait for a `_result` with the given transaction id
    async fn await_result(&mut self, transaction_id: f64) -> Result<Command> {
        timeout(SETUP_TIMEOUT, async {
            loop {
                match self.read_message().await? {
                    RtmpMessage::Command(cmd) if cmd.name == CMD_RESULT => {
                        if cmd.transaction_id == transaction_id {
                            return Ok(cmd);
                        }
                    }
                    RtmpMessage::Command(cmd) if cmd.name == CMD_ERROR => {
                        return Err(Error::Rejected(format!(
                            "remote refused transaction {}",
                            cmd.transaction_id
                        )));
                    }
                    _ => {}
                }
            }
        })
        .await
        .map_err(|_| Error::Timeout)?
    }

    /// Wait for an onStatus with the given code
    async fn await_status(&mut self, code: &str) -> Result<()> {
        timeout(SETUP_TIMEOUT, async {
            loop {
                if let RtmpMessage::Command(cmd) = self.read_message().await? {
                    if cmd.name == CMD_ON_STATUS {
                        let got = cmd
                            .arguments
                            .first()
                            .and_then(|v| v.get_string("code"))
                            .unwrap_or("");
                        if got == code {
                            return Ok(());
                        }
                        if got.ends_with("BadName") || got.ends_with("Failed") {
                            return Err(Error::Rejected(got.to_string()));
                        }
                    }
                }
            }
        })
        .await
        .map_err(|_| Error::Timeout)?
    }
}

/// A connected, publishing upstream sink
///
/// `write_packet` is non-blocking; a forwarding task owns the socket.
pub struct RtmpPublishSink {
    tx: mpsc::Sender<AvPacket>,
}

impl RtmpPublishSink {
    /// Connect, publish, and spawn the forwarding task
    pub async fn connect(url: &str) -> Result<Self> {
        let url = RtmpUrl::parse(url)
            .ok_or_else(|| Error::Config(format!("invalid RTMP URL: {}", url)))?;

        let mut conn = Connector::connect(&url).await?;

        // connect
        let mut obj = HashMap::new();
        obj.insert("app".to_string(), AmfValue::String(url.app.clone()));
        obj.insert("type".to_string(), AmfValue::String("nonprivate".into()));
        obj.insert("flashVer".to_string(), AmfValue::String("FMLE/3.0".into()));
        obj.insert("tcUrl".to_string(), AmfValue::String(url.tc_url()));
        let connect = Command {
            name: CMD_CONNECT.to_string(),
            transaction_id: 1.0,
            command_object: AmfValue::Object(obj),
            arguments: vec![],
            stream_id: 0,
        };
        conn.send_command(&connect).await?;
        conn.await_result(1.0).await?;

        // Negotiate a larger outbound chunk size
        let (message_type, payload) =
            RtmpMessage::SetChunkSize(NEGOTIATED_CHUNK_SIZE).encode();
        conn.send(&RtmpChunk {
            csid: CSID_PROTOCOL_CONTROL,
            timestamp: 0,
            message_type,
            stream_id: 0,
            payload,
        })
        .await?;
        conn.chunk_encoder.set_chunk_size(NEGOTIATED_CHUNK_SIZE);

        // createStream
        let create = Command {
            name: CMD_CREATE_STREAM.to_string(),
            transaction_id: 2.0,
            command_object: AmfValue::Null,
            arguments: vec![],
            stream_id: 0,
        };
        conn.send_command(&create).await?;
        let result = conn.await_result(2.0).await?;
        let stream_id = result
            .arguments
            .first()
            .and_then(|v| v.as_number())
            .unwrap_or(1.0) as u32;

        // publish
        let publish = Command {
            name: CMD_PUBLISH.to_string(),
            transaction_id: 3.0,
            command_object: AmfValue::Null,
            arguments: vec![
                AmfValue::String(url.stream.clone()),
                AmfValue::String("live".into()),
            ],
            stream_id,
        };
        conn.send_command(&publish).await?;
        conn.await_status(NS_PUBLISH_START).await?;

        tracing::info!(host = %url.host, app = %url.app, stream = %url.stream, "upstream publish started");

        let (tx, rx) = mpsc::channel(OUT_QUEUE_CAPACITY);
        tokio::spawn(forward_loop(conn, rx, stream_id));

        Ok(Self { tx })
    }
}

impl PacketSink for RtmpPublishSink {
    fn write_packet(&self, packet: &AvPacket) -> Result<()> {
        if self.tx.capacity() <= QUEUE_HEADROOM {
            return Err(Error::SubscriberLagging);
        }
        self.tx
            .try_send(packet.clone())
            .map_err(|_| Error::SubscriberLagging)
    }

    fn close(&self) {
        // Dropping the last sender ends the forwarding task
    }
}

/// Forward packets upstream; inbound control traffic is drained and dropped
async fn forward_loop(conn: Connector, mut rx: mpsc::Receiver<AvPacket>, stream_id: u32) {
    let Connector {
        mut reader,
        mut writer,
        mut chunk_encoder,
        ..
    } = conn;

    let mut scratch = [0u8; 4096];
    let mut buf = BytesMut::with_capacity(16 * 1024);

    loop {
        tokio::select! {
            packet = rx.recv() => {
                let Some(packet) = packet else { break };
                let message_type = packet.kind.message_type();
                let csid = match message_type {
                    MSG_AUDIO => CSID_AUDIO,
                    MSG_VIDEO => CSID_VIDEO,
                    _ => CSID_METADATA,
                };
                let chunk = RtmpChunk {
                    csid,
                    timestamp: packet.timestamp,
                    message_type,
                    stream_id,
                    payload: packet.body,
                };
                buf.clear();
                chunk_encoder.encode(&chunk, &mut buf);
                let written = async {
                    writer.write_all(&buf).await?;
                    writer.flush().await
                }
                .await;
                if let Err(e) = written {
                    tracing::warn!(error = %e, "upstream write failed, stopping");
                    break;
                }
            }
            read = reader.read(&mut scratch) => {
                match read {
                    Ok(0) => {
                        tracing::info!("upstream closed the connection");
                        break;
                    }
                    Ok(_) => {} // acks and pings; nothing to do with them
                    Err(e) => {
                        tracing::warn!(error = %e, "upstream read failed, stopping");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_parse() {
        let url = RtmpUrl::parse("rtmp://upstream.example:2935/live/cam").unwrap();
        assert_eq!(url.host, "upstream.example");
        assert_eq!(url.port, 2935);
        assert_eq!(url.app, "live");
        assert_eq!(url.stream, "cam");
        assert_eq!(url.tc_url(), "rtmp://upstream.example:2935/live");
    }

    #[test]
    fn test_url_default_port() {
        let url = RtmpUrl::parse("rtmp://host/live/cam").unwrap();
        assert_eq!(url.port, RTMP_PORT);
    }

    #[test]
    fn test_url_rejects_garbage() {
        assert!(RtmpUrl::parse("http://host/live/cam").is_none());
        assert!(RtmpUrl::parse("rtmp://host/live").is_none());
        assert!(RtmpUrl::parse("rtmp:///live/cam").is_none());
        assert!(RtmpUrl::parse("rtmp://host//cam").is_none());
    }
}
