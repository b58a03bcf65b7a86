//! Live MJPEG preview per camera.
//!
//! Two threads per camera: a pump that pulls JPEG frames from the device's
//! video source into a latest-frame slot, and an HTTP server (axum on a
//! single-threaded tokio runtime) that streams the slot to clients as
//! `multipart/x-mixed-replace` on `/rgb`. Neither thread ever touches the
//! synchronized depth pipeline, so preview clients cannot stall captures.

use crate::backend::VideoSource;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;

pub const STREAM_PATH: &str = "/rgb";
const BOUNDARY: &str = "--jpgboundary";
const PUMP_WAIT: Duration = Duration::from_millis(200);
const CLIENT_POLL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("failed to bind preview port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid CORS origin {0:?}")]
    InvalidOrigin(String),
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("preview threads still running after {0:?}")]
    StopTimeout(Duration),
}

/// Most recent preview frame with a sequence number so clients can skip
/// frames they have already sent.
#[derive(Default)]
struct LatestFrame {
    slot: Mutex<Option<(u64, Bytes)>>,
}

impl LatestFrame {
    fn store(&self, jpeg: Vec<u8>) {
        if let Ok(mut slot) = self.slot.lock() {
            let seq = slot.as_ref().map_or(1, |(seq, _)| seq + 1);
            *slot = Some((seq, Bytes::from(jpeg)));
        }
    }

    fn newer_than(&self, seen: u64) -> Option<(u64, Bytes)> {
        let slot = self.slot.lock().ok()?;
        match slot.as_ref() {
            Some((seq, jpeg)) if *seq > seen => Some((*seq, jpeg.clone())),
            _ => None,
        }
    }
}

#[derive(Clone)]
struct ResponderState {
    latest: Arc<LatestFrame>,
    origin: HeaderValue,
    stopping: Arc<AtomicBool>,
}

/// Handle for a running preview responder.
pub struct VideoResponder {
    local_addr: SocketAddr,
    stopping: Arc<AtomicBool>,
    shutdown: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
    finished: mpsc::Receiver<&'static str>,
}

/// Sends the thread name on `finished` when the owning thread exits,
/// including by panic.
struct FinishGuard {
    name: &'static str,
    tx: mpsc::Sender<&'static str>,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(self.name);
    }
}

impl VideoResponder {
    /// Bind `port` on all interfaces (0 = ephemeral) and start serving.
    pub fn start(
        mut source: Box<dyn VideoSource>,
        port: u16,
        cors_origin: &str,
        label: &str,
    ) -> Result<Self, StreamError> {
        let origin = HeaderValue::from_str(cors_origin)
            .map_err(|_| StreamError::InvalidOrigin(cors_origin.to_string()))?;
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .map_err(|source| StreamError::Bind { port, source })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| StreamError::Bind { port, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| StreamError::Bind { port, source })?;

        let latest = Arc::new(LatestFrame::default());
        let stopping = Arc::new(AtomicBool::new(false));
        let (finished_tx, finished) = mpsc::channel();

        let pump_guard = FinishGuard {
            name: "pump",
            tx: finished_tx.clone(),
        };
        let pump_latest = Arc::clone(&latest);
        let pump_stopping = Arc::clone(&stopping);
        let pump = std::thread::Builder::new()
            .name(format!("preview-pump-{label}"))
            .spawn(move || {
                let _guard = pump_guard;
                while !pump_stopping.load(Ordering::Acquire) {
                    if let Some(jpeg) = source.next_frame(PUMP_WAIT) {
                        pump_latest.store(jpeg);
                    }
                }
            })
            .map_err(|source| StreamError::Spawn {
                name: "pump",
                source,
            })?;

        let state = ResponderState {
            latest,
            origin,
            stopping: Arc::clone(&stopping),
        };
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server_guard = FinishGuard {
            name: "server",
            tx: finished_tx,
        };
        let server_label = label.to_string();
        let server = std::thread::Builder::new()
            .name(format!("preview-http-{label}"))
            .spawn(move || {
                let _guard = server_guard;
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::error!(camera = %server_label, error = %e, "preview runtime failed to start");
                        return;
                    }
                };
                let result = runtime.block_on(async move {
                    let listener = tokio::net::TcpListener::from_std(listener)?;
                    axum::serve(listener, router(state))
                        .with_graceful_shutdown(async {
                            let _ = shutdown_rx.await;
                        })
                        .await
                });
                if let Err(e) = result {
                    tracing::error!(camera = %server_label, error = %e, "preview server error");
                }
            });
        let server = match server {
            Ok(handle) => handle,
            Err(source) => {
                stopping.store(true, Ordering::Release);
                let _ = pump.join();
                return Err(StreamError::Spawn {
                    name: "server",
                    source,
                });
            }
        };

        tracing::info!(camera = label, addr = %local_addr, path = STREAM_PATH, "preview responder listening");
        Ok(Self {
            local_addr,
            stopping,
            shutdown: Some(shutdown_tx),
            server: Some(server),
            pump: Some(pump),
            finished,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signal both threads and join them, waiting at most `timeout`.
    ///
    /// Threads still running at the deadline are detached.
    pub fn stop(mut self, timeout: Duration) -> Result<(), StreamError> {
        self.signal();
        let deadline = Instant::now() + timeout;
        let mut pending = [self.pump.is_some(), self.server.is_some()]
            .iter()
            .filter(|running| **running)
            .count();
        while pending > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.finished.recv_timeout(remaining) {
                Ok(name) => {
                    let handle = match name {
                        "pump" => self.pump.take(),
                        _ => self.server.take(),
                    };
                    if let Some(handle) = handle {
                        let _ = handle.join();
                    }
                    pending -= 1;
                }
                Err(_) => {
                    self.pump = None;
                    self.server = None;
                    return Err(StreamError::StopTimeout(timeout));
                }
            }
        }
        Ok(())
    }

    fn signal(&mut self) {
        self.stopping.store(true, Ordering::Release);
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for VideoResponder {
    fn drop(&mut self) {
        // Unjoined threads wind down on their own once signalled.
        self.signal();
    }
}

fn router(state: ResponderState) -> Router {
    Router::new()
        .route(STREAM_PATH, get(stream_rgb).options(preflight))
        .fallback(fallback)
        .layer(axum::middleware::map_response_with_state(
            state.clone(),
            add_cors_headers,
        ))
        .with_state(state)
}

async fn add_cors_headers(State(state): State<ResponderState>, mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, state.origin.clone());
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    headers.insert(
        "access-control-allow-private-network",
        HeaderValue::from_static("true"),
    );
    response
}

async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn fallback(method: Method) -> StatusCode {
    if method == Method::OPTIONS {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn stream_rgb(State(state): State<ResponderState>) -> Response {
    let parts = futures::stream::unfold((state, 0u64), |(state, seen)| async move {
        loop {
            if state.stopping.load(Ordering::Acquire) {
                return None;
            }
            if let Some((seq, jpeg)) = state.latest.newer_than(seen) {
                return Some((Ok::<_, Infallible>(multipart_part(&jpeg)), (state, seq)));
            }
            tokio::time::sleep(CLIENT_POLL).await;
        }
    });
    (
        [
            (
                header::CONTENT_TYPE,
                format!("multipart/x-mixed-replace; boundary={BOUNDARY}"),
            ),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        Body::from_stream(parts),
    )
        .into_response()
}

fn multipart_part(jpeg: &[u8]) -> Bytes {
    let head = format!(
        "{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    );
    let mut part = Vec::with_capacity(head.len() + jpeg.len() + 2);
    part.extend_from_slice(head.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;

    const FAKE_JPEG: &[u8] = &[0xFF, 0xD8, 0x01, 0x02, 0x03, 0xFF, 0xD9];

    struct FakeSource;

    impl VideoSource for FakeSource {
        fn next_frame(&mut self, timeout: Duration) -> Option<Vec<u8>> {
            std::thread::sleep(timeout.min(Duration::from_millis(20)));
            Some(FAKE_JPEG.to_vec())
        }
    }

    /// Source that ignores its timeout, like a wedged driver call.
    /// Reports on `entered` once the pump is inside `next_frame`, then hangs.
    struct WedgedSource {
        entered: std::sync::mpsc::Sender<()>,
    }

    impl VideoSource for WedgedSource {
        fn next_frame(&mut self, _timeout: Duration) -> Option<Vec<u8>> {
            let _ = self.entered.send(());
            std::thread::sleep(Duration::from_secs(5));
            None
        }
    }

    fn start() -> VideoResponder {
        VideoResponder::start(Box::new(FakeSource), 0, "http://localhost:8042", "test").unwrap()
    }

    fn request(addr: SocketAddr, method: &str, path: &str) -> String {
        let mut conn = TcpStream::connect(addr).unwrap();
        conn.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        write!(
            conn,
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"
        )
        .unwrap();
        let mut out = String::new();
        conn.read_to_string(&mut out).unwrap();
        out
    }

    /// Read from a streaming response until `needle` has been seen twice.
    fn read_stream(addr: SocketAddr, needle: &[u8]) -> Vec<u8> {
        let mut conn = TcpStream::connect(addr).unwrap();
        conn.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        write!(conn, "GET /rgb HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        while buf.windows(needle.len()).filter(|w| *w == needle).count() < 2 {
            let n = conn.read(&mut chunk).unwrap();
            assert!(n > 0, "stream closed early");
            buf.extend_from_slice(&chunk[..n]);
        }
        buf
    }

    #[test]
    fn test_unknown_path_is_404_with_cors() {
        let responder = start();
        let response = request(responder.local_addr(), "GET", "/depth");
        assert!(response.starts_with("HTTP/1.1 404"), "{response}");
        let lower = response.to_ascii_lowercase();
        assert!(lower.contains("access-control-allow-origin: http://localhost:8042"));
        assert!(lower.contains("access-control-allow-methods: get, options"));
        assert!(lower.contains("access-control-allow-headers: content-type"));
        assert!(lower.contains("access-control-allow-private-network: true"));
        responder.stop(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn test_preflight_is_204_on_any_path() {
        let responder = start();
        for path in ["/rgb", "/anything"] {
            let response = request(responder.local_addr(), "OPTIONS", path);
            assert!(response.starts_with("HTTP/1.1 204"), "{path}: {response}");
            assert!(response
                .to_ascii_lowercase()
                .contains("access-control-allow-origin: http://localhost:8042"));
        }
        responder.stop(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn test_rgb_streams_multipart_jpeg() {
        let responder = start();
        let body = read_stream(responder.local_addr(), &[0xFF, 0xD9, b'\r', b'\n']);
        let text = String::from_utf8_lossy(&body).to_ascii_lowercase();
        assert!(text.starts_with("http/1.1 200"));
        assert!(text.contains("content-type: multipart/x-mixed-replace; boundary=--jpgboundary"));
        assert!(text.contains("content-type: image/jpeg\r\ncontent-length: 7\r\n\r\n"));
        assert!(body.windows(FAKE_JPEG.len()).any(|w| w == FAKE_JPEG));
        responder.stop(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn test_stop_with_open_stream_client() {
        let responder = start();
        let addr = responder.local_addr();
        let mut conn = TcpStream::connect(addr).unwrap();
        write!(conn, "GET /rgb HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        responder.stop(Duration::from_secs(2)).unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(TcpStream::connect(addr).is_err());
    }

    #[test]
    fn test_stop_is_bounded_with_wedged_source() {
        let (entered, wedged) = std::sync::mpsc::channel();
        let responder = VideoResponder::start(
            Box::new(WedgedSource { entered }),
            0,
            "http://localhost:8042",
            "wedged",
        )
        .unwrap();
        wedged.recv_timeout(Duration::from_secs(2)).unwrap();
        let started = Instant::now();
        let result = responder.stop(Duration::from_millis(200));
        assert!(matches!(result, Err(StreamError::StopTimeout(_))));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_bind_conflict_reported() {
        let taken = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let port = taken.local_addr().unwrap().port();
        let err = VideoResponder::start(Box::new(FakeSource), port, "*", "dup")
            .err()
            .unwrap();
        assert!(matches!(err, StreamError::Bind { .. }));
    }

    #[test]
    fn test_invalid_origin_rejected() {
        let err = VideoResponder::start(Box::new(FakeSource), 0, "bad\norigin", "bad")
            .err()
            .unwrap();
        assert!(matches!(err, StreamError::InvalidOrigin(_)));
    }
}
