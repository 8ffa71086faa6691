//! The streaming endpoint: `GET /stream/{mount}`.
//!
//! Attaches an HTTP listener to a broadcaster mount and streams chunks
//! until the client disconnects or the mount is removed. No
//! Content-Length; the Content-Type follows the channel codec.

use axum::{
    Router,
    body::Body,
    extract::{Path, State},
    http::{StatusCode, header},
    response::Response,
    routing::get,
};
use tracing::debug;

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::media::audio_content_type;

pub fn router() -> Router<AppState> {
    Router::new().route("/stream/{mount}", get(stream_mount))
}

/// Decrements listener counts and detaches the broadcaster listener when
/// the response body is dropped (client disconnect or mount removal).
struct ListenerGuard {
    state: AppState,
    mount: String,
    listener_id: u64,
    is_radio: bool,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        debug!(mount = %self.mount, listener = self.listener_id, "stream listener detached");
        self.state
            .broadcaster
            .detach_listener(&self.mount, self.listener_id);
        if self.is_radio {
            self.state.radio.update_listener_count(&self.mount, -1);
        } else {
            self.state.tv.update_viewer_count(&self.mount, -1);
        }
    }
}

async fn stream_mount(
    State(state): State<AppState>,
    Path(mount): Path<String>,
) -> ApiResult<Response> {
    let radio_codec = state.radio.channel_codec(&mount);
    let is_radio = radio_codec.is_some();
    let content_type = match &radio_codec {
        Some(codec) => audio_content_type(codec),
        None if state.tv.is_channel(&mount) => "video/mp2t",
        None => "application/octet-stream",
    };

    let handle = state.broadcaster.attach_listener(&mount)?;

    if is_radio {
        state.radio.update_listener_count(&mount, 1);
    } else if state.tv.is_channel(&mount) {
        state.tv.update_viewer_count(&mount, 1);
    }

    let guard = ListenerGuard {
        state: state.clone(),
        mount: mount.clone(),
        listener_id: handle.id,
        is_radio,
    };

    // The guard rides inside the stream state so client disconnect (body
    // drop) releases the listener and the counts.
    let stream = futures::stream::unfold((handle.rx, guard), |(mut rx, guard)| async move {
        rx.recv()
            .await
            .map(|chunk| (Ok::<_, std::convert::Infallible>(chunk), (rx, guard)))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache, no-store")
        .body(Body::from_stream(stream))
        .map_err(|e| {
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                e.to_string(),
            )
        })
}
