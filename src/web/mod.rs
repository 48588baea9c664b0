//! Read API: a loopback-only HTTP surface serving the dashboard's five
//! read-only endpoints plus an operator/monitoring `/healthz`. No auth layer
//! here — the bind address itself (default `127.0.0.1:8080`) is the access
//! control, per spec §6.

use crate::health::HealthRegistry;
use crate::pipeline::{LiveHandles, State as PipelineState};
use base::shutdown;
use bytes::{BufMut, Bytes, BytesMut};
use db::camera::Camera;
use db::event::Event;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use jiff::Timestamp;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct AppState {
    pub db: Arc<Mutex<db::Database>>,
    pub live: LiveHandles,
    pub health: HealthRegistry,
}

type ResponseBody = BoxBody<Bytes, Infallible>;

const MJPEG_BOUNDARY: &str = "sentryedge-frame";
const MJPEG_TICK: Duration = Duration::from_millis(100); // ~10 fps, per spec §6

/// Serves the Read API on `bind` until `shutdown` fires. Each accepted
/// connection gets its own task; in-flight requests are not waited on past
/// the shutdown signal (an MJPEG stream just stops being polled and its
/// socket closes with the listener task).
pub async fn run(bind: SocketAddr, state: Arc<AppState>, mut shutdown: shutdown::Receiver) -> Result<(), base::Error> {
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|e| base::err!(Internal, "binding read API to {bind}: {e}"))?;
    info!(%bind, "read API listening");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("read API shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => { warn!(error = %e, "read API accept failed"); continue; }
                };
                let state = state.clone();
                let conn_shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(route(req, state).await) }
                    });
                    let conn = http1::Builder::new().serve_connection(io, service);
                    tokio::pin!(conn);
                    tokio::select! {
                        result = &mut conn => {
                            if let Err(e) = result {
                                debug!(%peer, error = %e, "read API connection error");
                            }
                        }
                        _ = conn_shutdown.clone().cancelled() => {}
                    }
                });
            }
        }
    }
}

#[derive(Debug, Default)]
struct Query {
    since: Option<Timestamp>,
    camera: Option<String>,
    limit: u32,
}

fn parse_query(uri: &hyper::Uri) -> Query {
    let mut q = Query { limit: 100, ..Default::default() };
    let Some(raw) = uri.query() else { return q };
    for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
        match key.as_ref() {
            "since" => q.since = value.parse().ok(),
            "camera" => q.camera = Some(value.into_owned()),
            "limit" => q.limit = value.parse().unwrap_or(q.limit),
            _ => {}
        }
    }
    q
}

/// Splits a request path into non-empty segments, e.g. `/api/cameras/cam1`
/// -> `["api", "cameras", "cam1"]`. Grounded on the teacher's path-segment
/// matching idea, hand-rolled rather than reusing its `nom` combinator since
/// this router only needs five fixed shapes.
fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

async fn route(req: Request<Incoming>, state: Arc<AppState>) -> Response<ResponseBody> {
    let path = req.uri().path().to_owned();
    let segs = segments(&path);
    match (req.method(), segs.as_slice()) {
        (&hyper::Method::GET, ["healthz"]) => healthz(&state).await,
        (&hyper::Method::GET, ["api", "cameras"]) => list_cameras(&state).await,
        (&hyper::Method::GET, ["api", "cameras", id, "frame"]) => camera_frame(&state, id).await,
        (&hyper::Method::GET, ["api", "cameras", id, "mjpeg"]) => camera_mjpeg(&state, id).await,
        (&hyper::Method::GET, ["api", "events"]) => list_events(&state, parse_query(req.uri())).await,
        (&hyper::Method::GET, ["api", "events", id, "clip"]) => event_clip(&state, id).await,
        _ => not_found(),
    }
}

fn full(bytes: impl Into<Bytes>) -> ResponseBody {
    Full::new(bytes.into()).map_err(|never: Infallible| match never {}).boxed()
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<ResponseBody> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(full(body))
            .unwrap(),
        Err(e) => plain_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn plain_error(status: StatusCode, message: &str) -> Response<ResponseBody> {
    Response::builder().status(status).body(full(message.to_owned())).unwrap()
}

fn not_found() -> Response<ResponseBody> {
    plain_error(StatusCode::NOT_FOUND, "not found")
}

async fn healthz(state: &AppState) -> Response<ResponseBody> {
    json(StatusCode::OK, &state.health.snapshot().await)
}

/// View of a [`Camera`] without the credential fields; those never leave the
/// Local Index.
#[derive(Serialize)]
struct CameraView<'a> {
    id: &'a str,
    transport: &'a db::camera::Transport,
    connection: &'a str,
    manufacturer: &'a Option<String>,
    model: &'a Option<String>,
    has_ptz: bool,
    has_snapshot: bool,
    has_video: bool,
    first_seen: Timestamp,
    last_seen: Timestamp,
    enabled: bool,
    status: &'a db::camera::Status,
}

impl<'a> From<&'a Camera> for CameraView<'a> {
    fn from(c: &'a Camera) -> Self {
        CameraView {
            id: &c.id,
            transport: &c.transport,
            connection: &c.connection,
            manufacturer: &c.manufacturer,
            model: &c.model,
            has_ptz: c.has_ptz,
            has_snapshot: c.has_snapshot,
            has_video: c.has_video,
            first_seen: c.first_seen,
            last_seen: c.last_seen,
            enabled: c.enabled,
            status: &c.status,
        }
    }
}

async fn list_cameras(state: &AppState) -> Response<ResponseBody> {
    let cameras = match state.db.lock().await.camera().list() {
        Ok(c) => c,
        Err(e) => return plain_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };
    let views: Vec<CameraView> = cameras.iter().map(CameraView::from).collect();
    json(StatusCode::OK, &views)
}

async fn camera_frame(state: &AppState, camera_id: &str) -> Response<ResponseBody> {
    let live = state.live.lock().await;
    let Some(handle) = live.get(camera_id) else { return not_found() };
    let Some(frame) = handle.latest_frame.borrow().clone() else {
        return plain_error(StatusCode::SERVICE_UNAVAILABLE, "no frame captured yet");
    };
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "image/jpeg")
        .body(full(frame.data))
        .unwrap()
}

fn multipart_chunk(jpeg: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(jpeg.len() + 128);
    buf.put_slice(format!("--{MJPEG_BOUNDARY}\r\n").as_bytes());
    buf.put_slice(b"Content-Type: image/jpeg\r\n");
    buf.put_slice(format!("Content-Length: {}\r\n\r\n", jpeg.len()).as_bytes());
    buf.put_slice(jpeg);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

async fn camera_mjpeg(state: &AppState, camera_id: &str) -> Response<ResponseBody> {
    let rx = {
        let live = state.live.lock().await;
        let Some(handle) = live.get(camera_id) else { return not_found() };
        handle.latest_frame.clone()
    };
    let state_rx = {
        let live = state.live.lock().await;
        live.get(camera_id).map(|h| h.state.clone())
    };

    let stream = futures::stream::unfold(
        (rx, state_rx, tokio::time::interval(MJPEG_TICK)),
        |(mut rx, state_rx, mut interval)| async move {
            loop {
                interval.tick().await;
                if let Some(state_rx) = &state_rx {
                    if *state_rx.borrow() == PipelineState::Stopped {
                        return None;
                    }
                }
                if let Some(frame) = rx.borrow_and_update().clone() {
                    let chunk = multipart_chunk(&frame.data);
                    return Some((Ok::<_, Infallible>(Frame::data(chunk)), (rx, state_rx, interval)));
                }
            }
        },
    );

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", format!("multipart/x-mixed-replace; boundary={MJPEG_BOUNDARY}"))
        .body(StreamBody::new(stream).boxed())
        .unwrap()
}

#[derive(Serialize)]
struct EventsPage {
    events: Vec<Event>,
}

async fn list_events(state: &AppState, query: Query) -> Response<ResponseBody> {
    let mut db = state.db.lock().await;
    match db.event().list(query.camera.as_deref(), query.since, query.limit) {
        Ok(events) => json(StatusCode::OK, &EventsPage { events }),
        Err(e) => plain_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn event_clip(state: &AppState, event_id: &str) -> Response<ResponseBody> {
    let Ok(id) = event_id.parse::<uuid::Uuid>() else {
        return plain_error(StatusCode::BAD_REQUEST, "invalid event id");
    };
    let clip = {
        let mut db = state.db.lock().await;
        match db.clip().get_by_event(id) {
            Ok(c) => c,
            Err(e) => return plain_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        }
    };
    let Some(clip) = clip else { return not_found() };
    match std::fs::read(&clip.path) {
        Ok(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/octet-stream")
            .body(full(bytes))
            .unwrap(),
        Err(_) => plain_error(StatusCode::NOT_FOUND, "clip file missing from disk"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_strips_empty_parts() {
        assert_eq!(segments("/api/cameras/cam1/frame"), vec!["api", "cameras", "cam1", "frame"]);
        assert_eq!(segments("/"), Vec::<&str>::new());
    }

    #[test]
    fn parse_query_reads_known_keys_and_ignores_others() {
        let uri: hyper::Uri = "/api/events?camera=cam1&limit=5&bogus=x".parse().unwrap();
        let q = parse_query(&uri);
        assert_eq!(q.camera.as_deref(), Some("cam1"));
        assert_eq!(q.limit, 5);
        assert!(q.since.is_none());
    }

    #[test]
    fn parse_query_defaults_limit_when_absent() {
        let uri: hyper::Uri = "/api/events".parse().unwrap();
        assert_eq!(parse_query(&uri).limit, 100);
    }

    #[test]
    fn multipart_chunk_frames_with_boundary_and_length() {
        let chunk = multipart_chunk(b"jpegdata");
        let text = String::from_utf8_lossy(&chunk);
        assert!(text.starts_with("--sentryedge-frame\r\n"));
        assert!(text.contains("Content-Length: 8\r\n"));
        assert!(text.ends_with("jpegdata\r\n"));
    }
}
