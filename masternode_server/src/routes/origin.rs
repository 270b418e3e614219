//! Origin proxying

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, Request, Response, StatusCode},
    response::IntoResponse,
};
use bytes::{Bytes, BytesMut};
use masternode_common::constants::MAX_BODY_BYTES;

/// Connection-scoped headers that are never forwarded
static HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::CONTENT_LENGTH,
];

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Failed to read request body: {0}")]
    RequestBody(axum::Error),

    #[error("Origin request timed out")]
    Timeout,

    #[error("Origin unavailable: {0}")]
    Unavailable(reqwest::Error),

    #[error("Origin response exceeds {0} bytes")]
    TooLarge(usize),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::RequestBody(_) => StatusCode::BAD_REQUEST,
            ProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Unavailable(_) | ProxyError::TooLarge(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProxyError::Timeout
        } else {
            ProxyError::Unavailable(e)
        }
    }
}

/// A fully buffered origin response
#[derive(Debug)]
pub struct OriginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl IntoResponse for OriginResponse {
    fn into_response(self) -> Response<Body> {
        (self.status, self.headers, self.body).into_response()
    }
}

/// Forward `request` to `origin`, presenting it as addressed to `host`
///
/// Request and response bodies are buffered up to `MAX_BODY_BYTES`.
pub async fn forward(
    client: &reqwest::Client,
    origin: &str,
    host: &str,
    request: Request<Body>,
) -> Result<OriginResponse, ProxyError> {
    forward_limited(client, origin, host, request, MAX_BODY_BYTES).await
}

async fn forward_limited(
    client: &reqwest::Client,
    origin: &str,
    host: &str,
    request: Request<Body>,
    limit: usize,
) -> Result<OriginResponse, ProxyError> {
    let (parts, body) = request.into_parts();

    let body_bytes = axum::body::to_bytes(body, limit)
        .await
        .map_err(ProxyError::RequestBody)?;

    let url = format!(
        "{}{}",
        origin,
        parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    );

    let mut headers = strip_hop_by_hop(&parts.headers);
    headers.remove(header::HOST);

    let response = client
        .request(parts.method, &url)
        .headers(headers)
        .header(header::HOST, host)
        .body(body_bytes)
        .send()
        .await?;

    let status = response.status();
    let headers = strip_hop_by_hop(response.headers());
    let body = read_limited(response, limit).await?;

    Ok(OriginResponse {
        status,
        headers,
        body,
    })
}

/// Collect a response body, refusing anything larger than `limit`
async fn read_limited(mut response: reqwest::Response, limit: usize) -> Result<Bytes, ProxyError> {
    if response.content_length().is_some_and(|len| len > limit as u64) {
        return Err(ProxyError::TooLarge(limit));
    }

    let mut body = BytesMut::new();
    while let Some(chunk) = response.chunk().await? {
        if body.len() + chunk.len() > limit {
            return Err(ProxyError::TooLarge(limit));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body.freeze())
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut headers = headers.clone();
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use std::time::Duration;

    async fn spawn_origin(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        format!("http://{}", addr)
    }

    fn client(timeout: Duration) -> reqwest::Client {
        reqwest::Client::builder().timeout(timeout).build().unwrap()
    }

    #[tokio::test]
    async fn test_forward_passes_request_and_response_through() {
        let origin = spawn_origin(Router::new().fallback(|request: Request<Body>| async move {
            let host = request.headers()[header::HOST].to_str().unwrap().to_string();
            let echo = format!("{} {} {}", request.method(), request.uri(), host);
            (StatusCode::CREATED, [("x-origin", "yes")], echo)
        }))
        .await;

        let request = Request::builder()
            .method("POST")
            .uri("/submit?x=1")
            .header(header::HOST, "demo.example.com")
            .header(header::CONNECTION, "keep-alive")
            .body(Body::from("payload"))
            .unwrap();

        let response = forward(&client(Duration::from_secs(5)), &origin, "demo.example.com", request)
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(response.headers["x-origin"], "yes");
        assert_eq!(&response.body[..], b"POST /submit?x=1 demo.example.com");
    }

    #[tokio::test]
    async fn test_timeout_maps_to_gateway_timeout() {
        let origin = spawn_origin(Router::new().fallback(|| async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            "late"
        }))
        .await;

        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let err = forward(&client(Duration::from_millis(100)), &origin, "h", request)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Timeout));
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_oversized_origin_body_rejected() {
        let origin = spawn_origin(Router::new().fallback(|request: Request<Body>| async move {
            let size = if request.uri().path() == "/big" { 64 } else { 16 };
            vec![b'x'; size]
        }))
        .await;
        let client = client(Duration::from_secs(5));

        let request = Request::builder().uri("/big").body(Body::empty()).unwrap();
        let err = forward_limited(&client, &origin, "h", request, 32)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::TooLarge(32)));
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);

        let request = Request::builder().uri("/small").body(Body::empty()).unwrap();
        let response = forward_limited(&client, &origin, "h", request, 32)
            .await
            .unwrap();
        assert_eq!(response.body.len(), 16);
    }

    #[tokio::test]
    async fn test_unreachable_origin_maps_to_bad_gateway() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let err = forward(&client(Duration::from_secs(5)), &dead, "h", request)
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }
}
