//! HLS pipeline: TS segmenter, playlist roller, and the HTTP endpoints
//!
//! The writer side hangs off the room broker's hot path (`HlsSink`); the
//! HTTP side serves the rolled playlist and segment files.

pub mod m3u8;
pub mod pes;
pub mod ts;
pub mod writer;

pub use m3u8::PlaylistRoller;
pub use writer::{HlsSink, HlsWriter};

use std::path::PathBuf;

use axum::body::Body;
use axum::extract::{Path as AxumPath, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;

use crate::config::HlsConfig;
use crate::error::{Error, Result};

#[derive(Clone)]
struct HlsState {
    dir: PathBuf,
}

/// Build the HLS router: `/{app}/{stream}.m3u8` and `/{app}/{stream}-{sn}.ts`
pub fn router(config: &HlsConfig) -> Router {
    let state = HlsState {
        dir: PathBuf::from(&config.ts_path),
    };
    Router::new()
        .route("/{app}/{file}", any(serve_file))
        .with_state(state)
}

/// Bind and serve until the shutdown future resolves
pub async fn serve(
    config: HlsConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::Config(format!("HLS bind {}: {}", addr, e)))?;
    tracing::info!(addr = %addr, "HLS server listening");

    axum::serve(listener, router(&config))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(Error::Io)
}

async fn serve_file(
    State(state): State<HlsState>,
    method: Method,
    AxumPath((_app, file)): AxumPath<(String, String)>,
) -> Response {
    if method != Method::GET {
        return StatusCode::BAD_REQUEST.into_response();
    }
    // Flat segment directory; never walk out of it
    if file.contains('/') || file.contains("..") {
        return StatusCode::NOT_FOUND.into_response();
    }

    let content_type = if file.ends_with(".m3u8") {
        "application/vnd.apple.mpegurl"
    } else if file.ends_with(".ts") {
        "video/MP2T"
    } else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match tokio::fs::read(state.dir.join(&file)).await {
        Ok(data) => (
            [
                (header::CONTENT_TYPE, content_type),
                (header::CACHE_CONTROL, "no-cache"),
                (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            ],
            Body::from(data),
        )
            .into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}
