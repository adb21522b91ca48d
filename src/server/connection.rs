//! Per-connection RTMP handler
//!
//! Each accepted socket gets two cooperating tasks: this reader loop, which
//! decodes chunks into messages and drives the command state machine, and a
//! writer task draining the bounded outbound queue. They never touch the
//! socket concurrently.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::amf::AmfValue;
use crate::broker::{StreamObserver, SubscriberProtocol};
use crate::error::{Error, ProtocolError, Result};
use crate::media::packet::{AvPacket, PacketKind};
use crate::protocol::chunk::{ChunkDecoder, ChunkEncoder, RtmpChunk};
use crate::protocol::constants::*;
use crate::protocol::handshake;
use crate::protocol::message::{Command, ConnectParams, RtmpMessage, UserControlEvent};
use crate::server::stream::{NetStream, OutMessage, RtmpIngest, RtmpSink, StreamRole};

/// Per-connection handler (the reader side)
pub struct Connection {
    session_id: u64,
    peer_addr: SocketAddr,
    read_timeout: Duration,
    observer: Arc<dyn StreamObserver>,

    /// Outbound queue drained by the writer task
    out_tx: mpsc::Sender<OutMessage>,
    out_rx: Option<mpsc::Receiver<OutMessage>>,

    chunk_decoder: ChunkDecoder,
    read_buf: BytesMut,

    /// Application name from connect
    app: String,
    remote_window_ack_size: u32,
    remote_bandwidth: u32,
    remote_bandwidth_limit: u8,
    received_bytes: u32,

    /// Net-streams owned by this connection, keyed by stream id
    streams: HashMap<u32, NetStream>,
}

impl Connection {
    pub fn new(
        session_id: u64,
        peer_addr: SocketAddr,
        read_timeout: Duration,
        observer: Arc<dyn StreamObserver>,
    ) -> Self {
        let (out_tx, out_rx) = mpsc::channel(OUT_QUEUE_CAPACITY);
        Self {
            session_id,
            peer_addr,
            read_timeout,
            observer,
            out_tx,
            out_rx: Some(out_rx),
            chunk_decoder: ChunkDecoder::new(),
            read_buf: BytesMut::with_capacity(64 * 1024),
            app: String::new(),
            remote_window_ack_size: DEFAULT_WINDOW_ACK_SIZE,
            remote_bandwidth: DEFAULT_PEER_BANDWIDTH,
            remote_bandwidth_limit: BANDWIDTH_LIMIT_DYNAMIC,
            received_bytes: 0,
            streams: HashMap::new(),
        }
    }

    /// Drive the connection to completion
    pub async fn run(&mut self, mut socket: TcpStream) -> Result<()> {
        handshake::server_handshake(&mut socket).await?;
        tracing::debug!(session_id = self.session_id, peer = %self.peer_addr, "handshake complete");

        let (mut read_half, write_half) = socket.into_split();

        // Writer task: serializes every outbound message into chunks
        let out_rx = self.out_rx.take().expect("writer started twice");
        let writer_task = tokio::spawn(writer_loop(out_rx, write_half));

        let result = loop {
            match read_half.read_buf(&mut self.read_buf).await {
                Ok(0) => break Ok(()),
                Ok(_) => {
                    if let Err(e) = self.process_buffer().await {
                        break Err(e);
                    }
                }
                Err(e) => break Err(e.into()),
            }
        };

        self.cleanup().await;
        writer_task.abort();

        result
    }

    /// Decode and dispatch every complete message in the read buffer
    ///
    /// Continuation chunks consume buffer without yielding a message, so
    /// the drain keeps going until decoding makes no progress.
    async fn process_buffer(&mut self) -> Result<()> {
        loop {
            let len_before = self.read_buf.len();
            let decoded = {
                let mut buf = std::mem::take(&mut self.read_buf);
                let decoded = self.chunk_decoder.decode(&mut buf);
                self.read_buf = buf;
                decoded?
            };

            match decoded {
                Some(chunk) => {
                    // Window acknowledgement bookkeeping
                    self.received_bytes = self
                        .received_bytes
                        .wrapping_add(chunk.payload.len() as u32);
                    if self.received_bytes >= self.remote_window_ack_size {
                        let ack = RtmpMessage::Acknowledgement {
                            sequence: self.received_bytes,
                        };
                        self.enqueue(OutMessage::control(&ack)).await?;
                        self.received_bytes = 0;
                    }

                    self.handle_chunk(chunk).await?;
                }
                None if self.read_buf.len() == len_before => break,
                None => {}
            }
        }
        Ok(())
    }

    /// Dispatch one assembled message
    async fn handle_chunk(&mut self, chunk: RtmpChunk) -> Result<()> {
        // Media and metadata for a publishing stream bypass full parsing:
        // the payload is already the common-packet body
        match chunk.message_type {
            MSG_AUDIO | MSG_VIDEO | MSG_DATA_AMF0 | MSG_DATA_AMF3 => {
                return self.route_media(chunk);
            }
            _ => {}
        }

        let message = RtmpMessage::from_chunk(&chunk)?;

        match message {
            RtmpMessage::SetChunkSize(size) => {
                tracing::debug!(session_id = self.session_id, size = size, "peer set chunk size");
                self.chunk_decoder.set_chunk_size(size);
            }

            RtmpMessage::Abort { csid } => {
                self.chunk_decoder.abort(csid);
            }

            RtmpMessage::Acknowledgement { sequence } => {
                tracing::trace!(session_id = self.session_id, sequence = sequence, "ack");
            }

            RtmpMessage::WindowAckSize(size) => {
                self.remote_window_ack_size = size;
            }

            RtmpMessage::SetPeerBandwidth { size, limit_type } => {
                self.remote_bandwidth = size;
                self.remote_bandwidth_limit = limit_type;
                tracing::debug!(
                    session_id = self.session_id,
                    bandwidth = self.remote_bandwidth,
                    limit = self.remote_bandwidth_limit,
                    "peer bandwidth updated"
                );
            }

            RtmpMessage::UserControl(event) => {
                self.handle_user_control(event).await?;
            }

            RtmpMessage::Command(cmd) | RtmpMessage::CommandAmf3(cmd) => {
                self.handle_command(cmd).await?;
            }

            RtmpMessage::Audio { .. }
            | RtmpMessage::Video { .. }
            | RtmpMessage::Data(_)
            | RtmpMessage::DataAmf3(_) => {
                unreachable!("media and data are routed before parsing");
            }

            RtmpMessage::Unknown { type_id, .. } => {
                tracing::trace!(session_id = self.session_id, type_id = type_id, "unhandled message");
            }
        }

        Ok(())
    }

    /// Push an audio/video/metadata message into the publishing stream's
    /// bounded media queue
    fn route_media(&mut self, chunk: RtmpChunk) -> Result<()> {
        let Some(stream) = self
            .streams
            .get(&chunk.stream_id)
            .filter(|s| s.is_publishing())
        else {
            // Media for a stream that is not publishing is a wire error;
            // stray data messages (e.g. on stream 0) are just noise
            if chunk.message_type == MSG_AUDIO || chunk.message_type == MSG_VIDEO {
                return Err(ProtocolError::StreamNotFound(chunk.stream_id).into());
            }
            tracing::trace!(
                session_id = self.session_id,
                stream_id = chunk.stream_id,
                "ignoring data message for non-publishing stream"
            );
            return Ok(());
        };
        let Some(media_tx) = stream.media_tx.clone() else {
            return Ok(());
        };
        let stream_name = stream.stream_name.clone();

        let kind = match chunk.message_type {
            MSG_AUDIO => PacketKind::Audio,
            MSG_VIDEO => PacketKind::Video,
            _ => PacketKind::Metadata,
        };

        let mut body = chunk.payload;
        if chunk.message_type == MSG_DATA_AMF3 && !body.is_empty() && body[0] == 0x00 {
            body.advance(1);
        }
        if body.is_empty() {
            return Ok(());
        }

        // Recognized video codecs only
        if kind == PacketKind::Video {
            let codec = body[0] & 0x0F;
            if codec != 7 && codec != 12 {
                tracing::warn!(session_id = self.session_id, codec = codec, "rejecting unknown video codec");
                return Ok(());
            }
        }

        let packet = AvPacket::new(kind, chunk.timestamp, chunk.stream_id, body);

        match media_tx.try_send(packet) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    session_id = self.session_id,
                    stream = %stream_name,
                    "ingest queue full, dropping packet"
                );
                Ok(())
            }
            // Producer is gone (replaced or stopped): publisher teardown
            // closes the whole connection
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::ConnectionClosed),
        }
    }

    async fn handle_user_control(&mut self, event: UserControlEvent) -> Result<()> {
        match event {
            UserControlEvent::PingRequest(timestamp) => {
                let pong = RtmpMessage::UserControl(UserControlEvent::PingResponse(timestamp));
                self.enqueue(OutMessage::control(&pong)).await?;
            }
            other => {
                tracing::trace!(session_id = self.session_id, event = ?other, "user control");
            }
        }
        Ok(())
    }

    async fn handle_command(&mut self, cmd: Command) -> Result<()> {
        match cmd.name.as_str() {
            CMD_CONNECT => self.handle_connect(cmd).await,
            CMD_CREATE_STREAM => self.handle_create_stream(cmd).await,
            CMD_DELETE_STREAM | CMD_CLOSE_STREAM => self.handle_delete_stream(cmd).await,
            CMD_PUBLISH => self.handle_publish(cmd).await,
            CMD_PLAY => self.handle_play(cmd).await,
            CMD_RELEASE_STREAM => {
                tracing::debug!(session_id = self.session_id, "releaseStream");
                Ok(())
            }
            CMD_FC_PUBLISH => {
                let ack = Command {
                    name: CMD_ON_FC_PUBLISH.to_string(),
                    transaction_id: 0.0,
                    command_object: AmfValue::Null,
                    arguments: vec![],
                    stream_id: 0,
                };
                self.enqueue(OutMessage::command(&ack, 0)).await
            }
            CMD_FC_UNPUBLISH => {
                let ack = Command {
                    name: CMD_ON_FC_UNPUBLISH.to_string(),
                    transaction_id: 0.0,
                    command_object: AmfValue::Null,
                    arguments: vec![],
                    stream_id: 0,
                };
                self.enqueue(OutMessage::command(&ack, 0)).await
            }
            CMD_GET_STREAM_LENGTH => {
                let result = Command::result(cmd.transaction_id, AmfValue::Null, AmfValue::Number(0.0));
                self.enqueue(OutMessage::command(&result, 0)).await
            }
            other => {
                tracing::debug!(session_id = self.session_id, command = other, "unknown command");
                Ok(())
            }
        }
    }

    /// connect: negotiate sizes, then report success or rejection
    async fn handle_connect(&mut self, cmd: Command) -> Result<()> {
        let params = ConnectParams::from_amf(&cmd.command_object);

        if params.tc_url.is_none() {
            let mut info = HashMap::new();
            info.insert("level".to_string(), AmfValue::String("error".into()));
            info.insert("code".to_string(), AmfValue::String(NC_CONNECT_REJECTED.into()));
            info.insert(
                "description".to_string(),
                AmfValue::String("tcUrl required".into()),
            );
            let error = Command::error(cmd.transaction_id, AmfValue::Null, AmfValue::Object(info));
            self.enqueue(OutMessage::command(&error, 0)).await?;
            return Err(Error::Rejected("connect without tcUrl".into()));
        }

        self.app = params.app.clone();

        self.enqueue(OutMessage::control(&RtmpMessage::SetChunkSize(
            NEGOTIATED_CHUNK_SIZE,
        )))
        .await?;
        self.enqueue(OutMessage::control(&RtmpMessage::WindowAckSize(
            DEFAULT_WINDOW_ACK_SIZE,
        )))
        .await?;
        self.enqueue(OutMessage::control(&RtmpMessage::SetPeerBandwidth {
            size: DEFAULT_PEER_BANDWIDTH,
            limit_type: BANDWIDTH_LIMIT_DYNAMIC,
        }))
        .await?;

        let mut props = HashMap::new();
        props.insert("fmsVer".to_string(), AmfValue::String("FMS/3,5,7,7009".into()));
        props.insert("capabilities".to_string(), AmfValue::Number(31.0));

        let mut info = HashMap::new();
        info.insert("level".to_string(), AmfValue::String("status".into()));
        info.insert("code".to_string(), AmfValue::String(NC_CONNECT_SUCCESS.into()));
        info.insert(
            "description".to_string(),
            AmfValue::String("Connection succeeded".into()),
        );
        info.insert(
            "objectEncoding".to_string(),
            AmfValue::Number(params.object_encoding),
        );

        let result = Command::result(
            cmd.transaction_id,
            AmfValue::Object(props),
            AmfValue::Object(info),
        );
        self.enqueue(OutMessage::command(&result, 0)).await?;

        tracing::info!(session_id = self.session_id, app = %self.app, "connected");
        Ok(())
    }

    /// createStream: smallest unused stream id >= 1
    async fn handle_create_stream(&mut self, cmd: Command) -> Result<()> {
        let mut stream_id = 1u32;
        while self.streams.contains_key(&stream_id) {
            stream_id += 1;
        }
        self.streams.insert(stream_id, NetStream::new(stream_id));

        let result = Command::result(
            cmd.transaction_id,
            AmfValue::Null,
            AmfValue::Number(stream_id as f64),
        );
        self.enqueue(OutMessage::command(&result, 0)).await?;

        tracing::debug!(session_id = self.session_id, stream_id = stream_id, "stream created");
        Ok(())
    }

    async fn handle_delete_stream(&mut self, cmd: Command) -> Result<()> {
        let stream_id = cmd
            .arguments
            .first()
            .and_then(|v| v.as_number())
            .unwrap_or(cmd.stream_id as f64) as u32;

        if let Some(stream) = self.streams.remove(&stream_id) {
            self.detach_stream(stream).await;
        }
        Ok(())
    }

    /// publish: assign the publisher role and hand the broker an ingest
    async fn handle_publish(&mut self, cmd: Command) -> Result<()> {
        let stream_name = cmd
            .arguments
            .first()
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let publish_type = cmd
            .arguments
            .get(1)
            .and_then(|v| v.as_str())
            .unwrap_or("live")
            .to_string();

        let role = match self.streams.get(&cmd.stream_id) {
            Some(s) => s.role,
            None => return Err(ProtocolError::StreamNotFound(cmd.stream_id).into()),
        };

        if role != StreamRole::Unknown {
            tracing::warn!(
                session_id = self.session_id,
                stream_id = cmd.stream_id,
                role = ?role,
                error = %Error::StreamConflict,
                "publish refused"
            );
            let status = Command::on_status(
                cmd.stream_id,
                "error",
                NS_PUBLISH_BAD_NAME,
                "stream already in use",
            );
            self.enqueue(OutMessage::command(&status, cmd.stream_id)).await?;
            return Ok(());
        }

        let status = Command::on_status(
            cmd.stream_id,
            "status",
            NS_PUBLISH_START,
            &format!("{} is now published", stream_name),
        );
        self.enqueue(OutMessage::command(&status, cmd.stream_id)).await?;

        let (ingest, media_tx) = RtmpIngest::new(self.read_timeout);

        if let Some(stream) = self.streams.get_mut(&cmd.stream_id) {
            stream.role = StreamRole::Publish;
            stream.stream_name = stream_name.clone();
            stream.publish_type = publish_type.clone();
            stream.media_tx = Some(media_tx);
        }

        self.observer
            .on_publish(&self.app, &stream_name, &publish_type, Box::new(ingest))
            .await?;

        tracing::info!(
            session_id = self.session_id,
            stream = %stream_name,
            publish_type = %publish_type,
            "publishing"
        );
        Ok(())
    }

    /// play: assign the subscriber role and attach a sink to the room
    async fn handle_play(&mut self, cmd: Command) -> Result<()> {
        let stream_name = cmd
            .arguments
            .first()
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let role = match self.streams.get(&cmd.stream_id) {
            Some(s) => s.role,
            None => return Err(ProtocolError::StreamNotFound(cmd.stream_id).into()),
        };

        if role != StreamRole::Unknown {
            tracing::warn!(
                session_id = self.session_id,
                stream_id = cmd.stream_id,
                role = ?role,
                error = %Error::StreamConflict,
                "play refused"
            );
            let status = Command::on_status(
                cmd.stream_id,
                "error",
                NS_PLAY_FAILED,
                "stream already in use",
            );
            self.enqueue(OutMessage::command(&status, cmd.stream_id)).await?;
            return Ok(());
        }

        self.enqueue(OutMessage::control(&RtmpMessage::SetChunkSize(
            NEGOTIATED_CHUNK_SIZE,
        )))
        .await?;
        self.enqueue(OutMessage::control(&RtmpMessage::UserControl(
            UserControlEvent::StreamIsRecorded(cmd.stream_id),
        )))
        .await?;
        self.enqueue(OutMessage::control(&RtmpMessage::UserControl(
            UserControlEvent::StreamBegin(cmd.stream_id),
        )))
        .await?;

        let reset = Command::on_status(
            cmd.stream_id,
            "status",
            NS_PLAY_RESET,
            &format!("resetting {}", stream_name),
        );
        self.enqueue(OutMessage::command(&reset, cmd.stream_id)).await?;
        let start = Command::on_status(
            cmd.stream_id,
            "status",
            NS_PLAY_START,
            &format!("playing {}", stream_name),
        );
        self.enqueue(OutMessage::command(&start, cmd.stream_id)).await?;

        let sink = RtmpSink::new(self.out_tx.clone(), cmd.stream_id);
        let uid = self
            .observer
            .on_subscribe(&self.app, &stream_name, SubscriberProtocol::Rtmp, Box::new(sink))
            .await?;

        if let Some(stream) = self.streams.get_mut(&cmd.stream_id) {
            stream.role = StreamRole::Subscribe;
            stream.stream_name = stream_name.clone();
            stream.subscriber_uid = Some(uid);
        }

        tracing::info!(session_id = self.session_id, stream = %stream_name, uid = uid, "playing");
        Ok(())
    }

    async fn enqueue(&self, message: OutMessage) -> Result<()> {
        self.out_tx
            .send(message)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Notify the broker that one net-stream is going away
    async fn detach_stream(&self, stream: NetStream) {
        tracing::debug!(
            session_id = self.session_id,
            stream_id = stream.id,
            role = ?stream.role,
            publish_type = %stream.publish_type,
            "detaching net-stream"
        );
        match stream.role {
            StreamRole::Publish => {
                self.observer
                    .on_unpublish(&self.app, &stream.stream_name)
                    .await;
            }
            StreamRole::Subscribe => {
                if let Some(uid) = stream.subscriber_uid {
                    self.observer
                        .on_unsubscribe(&self.app, &stream.stream_name, SubscriberProtocol::Rtmp, uid)
                        .await;
                }
            }
            _ => {}
        }
    }

    /// Tear down every net-stream on disconnect
    async fn cleanup(&mut self) {
        let streams: Vec<NetStream> = self.streams.drain().map(|(_, s)| s).collect();
        for stream in streams {
            self.detach_stream(stream).await;
        }
        tracing::debug!(session_id = self.session_id, peer = %self.peer_addr, "connection closed");
    }
}

/// Writer task: drains the outbound queue, serializing messages to chunks
///
/// Tracks Set Chunk Size messages it emits so the encoder follows the
/// negotiated size. An emission error is fatal to the connection.
async fn writer_loop(
    mut rx: mpsc::Receiver<OutMessage>,
    write_half: tokio::net::tcp::OwnedWriteHalf,
) {
    let mut writer = BufWriter::with_capacity(64 * 1024, write_half);
    let mut encoder = ChunkEncoder::new();
    let mut buf = BytesMut::with_capacity(16 * 1024);

    while let Some(msg) = rx.recv().await {
        buf.clear();
        let chunk = RtmpChunk {
            csid: msg.csid,
            timestamp: msg.timestamp,
            message_type: msg.message_type,
            stream_id: msg.stream_id,
            payload: msg.payload.clone(),
        };
        encoder.encode(&chunk, &mut buf);

        if writer.write_all(&buf).await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }

        // Our own chunk-size announcements take effect once on the wire
        if msg.message_type == MSG_SET_CHUNK_SIZE && msg.payload.len() >= 4 {
            let size = u32::from_be_bytes([
                msg.payload[0],
                msg.payload[1],
                msg.payload[2],
                msg.payload[3],
            ]) & 0x7FFF_FFFF;
            encoder.set_chunk_size(size);
        }
    }
}
