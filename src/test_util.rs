use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use std::net::SocketAddr;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Initialize tracing for tests, writing to the test output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

#[derive(Clone, Copy)]
struct Pace {
    chunk: usize,
    delay: Duration,
}

struct ServerState {
    payload: Vec<u8>,
    ignore_ranges: bool,
    pace: Option<Pace>,
    ranges: Mutex<Vec<Option<String>>>,
}

/// Serves one payload under `/files/{name}`, honouring `Range: bytes=N-`
/// (416 past the end) and recording every range header it receives.
pub struct FileServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    handle: tokio::task::JoinHandle<()>,
}

impl FileServer {
    pub async fn start(payload: Vec<u8>) -> Self {
        Self::spawn(payload, false, None).await
    }

    pub async fn start_ignoring_ranges(payload: Vec<u8>) -> Self {
        Self::spawn(payload, true, None).await
    }

    /// Streams the body in `chunk`-sized pieces, sleeping `delay` before each.
    pub async fn start_paced(payload: Vec<u8>, chunk: usize, delay: Duration) -> Self {
        Self::spawn(payload, false, Some(Pace { chunk, delay })).await
    }

    async fn spawn(payload: Vec<u8>, ignore_ranges: bool, pace: Option<Pace>) -> Self {
        let state = Arc::new(ServerState {
            payload,
            ignore_ranges,
            pace,
            ranges: Mutex::new(Vec::new()),
        });
        let app = Router::new()
            .route("/files/{name}", get(serve_file))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn url(&self, name: &str) -> String {
        format!("http://{}/files/{}", self.addr, name)
    }

    pub fn missing_url(&self) -> String {
        format!("http://{}/nothing/here.bin", self.addr)
    }

    pub fn range_headers(&self) -> Vec<Option<String>> {
        self.state.ranges.lock().clone()
    }
}

impl Drop for FileServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_file(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.ranges.lock().push(range.clone());

    let len = state.payload.len();
    let start = range
        .as_deref()
        .filter(|_| !state.ignore_ranges)
        .and_then(|r| r.strip_prefix("bytes="))
        .and_then(|r| r.strip_suffix('-'))
        .and_then(|r| r.parse::<usize>().ok())
        .unwrap_or(0);
    if start > 0 && start >= len {
        return StatusCode::RANGE_NOT_SATISFIABLE.into_response();
    }

    let status = if start > 0 {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    let body = &state.payload[start..];
    let Some(pace) = state.pace else {
        return (status, body.to_vec()).into_response();
    };

    let chunks: Vec<Bytes> = body.chunks(pace.chunk).map(Bytes::copy_from_slice).collect();
    let stream = futures::stream::iter(chunks).then(move |chunk| async move {
        tokio::time::sleep(pace.delay).await;
        Ok::<_, std::convert::Infallible>(chunk)
    });
    (
        status,
        [(header::CONTENT_LENGTH, body.len().to_string())],
        Body::from_stream(stream),
    )
        .into_response()
}
