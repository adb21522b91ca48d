//! HTTP-FLV fan-out
//!
//! `GET /{app}/{stream}.flv` answers with a chunked FLV byte stream
//! synthesized from live common packets: the 9-byte FLV header, then one
//! tag per packet. The common packet body is already FLV tag-data, so
//! re-muxing is pure framing.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::{Path as AxumPath, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;

use crate::broker::{PacketSink, StreamObserver, SubscriberProtocol};
use crate::config::HttpFlvConfig;
use crate::error::{Error, Result};
use crate::media::flv;
use crate::media::packet::AvPacket;
use crate::protocol::constants::{MEDIA_QUEUE_CAPACITY, QUEUE_HEADROOM};

/// Broker-facing sink: frames packets as FLV tags onto the response queue
pub struct FlvSink {
    tx: mpsc::Sender<Bytes>,
}

impl FlvSink {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }
}

impl PacketSink for FlvSink {
    fn write_packet(&self, packet: &AvPacket) -> Result<()> {
        if self.tx.capacity() <= QUEUE_HEADROOM {
            return Err(Error::SubscriberLagging);
        }
        let tag_type = match packet.kind {
            crate::media::packet::PacketKind::Audio => flv::TAG_AUDIO,
            crate::media::packet::PacketKind::Video => flv::TAG_VIDEO,
            crate::media::packet::PacketKind::Metadata => flv::TAG_SCRIPT,
        };
        let tag = flv::encode_tag(tag_type, packet.timestamp, &packet.body);
        self.tx.try_send(tag).map_err(|_| Error::SubscriberLagging)
    }

    fn close(&self) {
        // Dropping the last sender ends the HTTP response body
    }
}

/// Response body that detaches its subscriber when the viewer goes away
struct FlvBodyStream {
    rx: mpsc::Receiver<Bytes>,
    observer: Arc<dyn StreamObserver>,
    app: String,
    stream: String,
    uid: u64,
}

impl Stream for FlvBodyStream {
    type Item = std::result::Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|chunk| chunk.map(Ok))
    }
}

impl Drop for FlvBodyStream {
    fn drop(&mut self) {
        let observer = Arc::clone(&self.observer);
        let app = std::mem::take(&mut self.app);
        let stream = std::mem::take(&mut self.stream);
        let uid = self.uid;
        tokio::spawn(async move {
            observer
                .on_unsubscribe(&app, &stream, SubscriberProtocol::HttpFlv, uid)
                .await;
        });
    }
}

#[derive(Clone)]
struct FlvState {
    observer: Arc<dyn StreamObserver>,
}

/// Build the HTTP-FLV router
pub fn router(observer: Arc<dyn StreamObserver>) -> Router {
    Router::new()
        .route("/{app}/{file}", any(serve_stream))
        .with_state(FlvState { observer })
}

/// Bind and serve until the shutdown future resolves
pub async fn serve(
    config: HttpFlvConfig,
    observer: Arc<dyn StreamObserver>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::Config(format!("HTTP-FLV bind {}: {}", addr, e)))?;
    tracing::info!(addr = %addr, "HTTP-FLV server listening");

    axum::serve(listener, router(observer))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(Error::Io)
}

async fn serve_stream(
    State(state): State<FlvState>,
    method: Method,
    AxumPath((app, file)): AxumPath<(String, String)>,
) -> Response {
    if method != Method::GET {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let Some(stream) = file.strip_suffix(".flv") else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if stream.is_empty() {
        return StatusCode::NOT_FOUND.into_response();
    }

    let (tx, rx) = mpsc::channel(MEDIA_QUEUE_CAPACITY);

    // The FLV file header leads the body
    if tx.try_send(flv::file_header()).is_err() {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let sink = FlvSink::new(tx);
    let uid = match state
        .observer
        .on_subscribe(&app, stream, SubscriberProtocol::HttpFlv, Box::new(sink))
        .await
    {
        Ok(uid) => uid,
        Err(e) => {
            tracing::warn!(app = %app, stream = %stream, error = %e, "FLV subscribe failed");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };

    tracing::info!(app = %app, stream = %stream, uid = uid, "HTTP-FLV viewer attached");

    let body = FlvBodyStream {
        rx,
        observer: state.observer,
        app,
        stream: stream.to_string(),
        uid,
    };

    (
        [
            (header::CONTENT_TYPE, "video/x-flv"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (header::ACCESS_CONTROL_ALLOW_HEADERS, "*"),
        ],
        Body::from_stream(body),
    )
        .into_response()
}
