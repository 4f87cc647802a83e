//! In-process HTTP server that streams a payload in timed chunks.

use axum::body::Body;
use axum::http::header::CONTENT_LENGTH;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;

/// Deterministic, non-repeating-looking test bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Serves `body` at `/model.gguf` and returns its URL.
pub async fn serve(body: Vec<u8>, chunk: usize, delay: Duration) -> String {
    let body = Arc::new(body);
    let app = Router::new().route(
        "/model.gguf",
        get(move || {
            let body = body.clone();
            async move { chunked(body, chunk, delay) }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/model.gguf", addr)
}

fn chunked(body: Arc<Vec<u8>>, chunk: usize, delay: Duration) -> Response {
    let len = body.len();
    let stream = futures_util::stream::unfold(0usize, move |offset| {
        let body = body.clone();
        async move {
            if offset >= body.len() {
                return None;
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let end = (offset + chunk).min(body.len());
            Some((Ok::<_, std::io::Error>(body[offset..end].to_vec()), end))
        }
    });

    Response::builder()
        .header(CONTENT_LENGTH, len)
        .body(Body::from_stream(stream))
        .unwrap()
}
