//! HTTP/1.1 over peer streams
//!
//! One request and one response per stream, driven by hyper on both ends.
//! Header names arrive lowercased, in the order they were sent. Connection
//! headers (`Content-Length`, `Transfer-Encoding`, `Connection`) belong to
//! hyper and never appear in a [`BridgeRequest`] or [`BridgeResponse`].

use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::client::conn::http1 as client_http1;
use hyper::server::conn::http1 as server_http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tracing::debug;

use crate::error::{FedError, Result};

/// Read buffer bound, and so the upper bound for a message head
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Upper bound for a message body
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub type Headers = Vec<(String, String)>;

/// A request carried over the bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: Vec<u8>,
}

impl BridgeRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// `POST` with a JSON body
    pub fn post_json<T: Serialize>(path: impl Into<String>, body: &T) -> Result<Self> {
        Ok(Self::new("POST", path)
            .with_header("Content-Type", "application/json")
            .with_body(serde_json::to_vec(body)?))
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Path without the query string
    pub fn route(&self) -> &str {
        self.path.split('?').next().unwrap_or(&self.path)
    }

    /// Value of a cookie sent with the request
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("cookie"))
            .flat_map(|(_, v)| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v)
    }

    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| FedError::MalformedRequest(e.to_string()))
    }
}

/// A response carried back over the bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: Vec<u8>,
}

impl BridgeResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn json<T: Serialize>(status: u16, body: &T) -> Result<Self> {
        Ok(Self::new(status)
            .with_header("Content-Type", "application/json")
            .with_body(serde_json::to_vec(body)?))
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self::new(status)
            .with_header("Content-Type", "text/plain")
            .with_body(body.into().into_bytes())
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| FedError::MalformedResponse(e.to_string()))
    }
}

fn find_header<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn is_connection_header(name: &str) -> bool {
    ["content-length", "transfer-encoding", "connection"]
        .iter()
        .any(|h| name.eq_ignore_ascii_case(h))
}

fn headers_from_http(map: &http::HeaderMap) -> Headers {
    map.iter()
        .filter(|(k, _)| !is_connection_header(k.as_str()))
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                String::from_utf8_lossy(v.as_bytes()).into_owned(),
            )
        })
        .collect()
}

async fn collect_body(body: Incoming, malformed: fn(String) -> FedError) -> Result<Vec<u8>> {
    let collected = Limited::new(body, MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| malformed(format!("body: {}", e)))?;
    Ok(collected.to_bytes().to_vec())
}

fn request_to_http(req: &BridgeRequest) -> Result<http::Request<Full<Bytes>>> {
    if req.method.is_empty() || req.method.contains(char::is_whitespace) {
        return Err(FedError::MalformedRequest(format!("bad method {:?}", req.method)));
    }
    if !req.path.starts_with('/') || req.path.contains(char::is_whitespace) {
        return Err(FedError::MalformedRequest(format!("bad path {:?}", req.path)));
    }

    let mut builder = http::Request::builder()
        .method(req.method.as_str())
        .uri(req.path.as_str());
    for (name, value) in req.headers.iter().filter(|(k, _)| !is_connection_header(k)) {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
        .body(Full::new(Bytes::from(req.body.clone())))
        .map_err(|e| FedError::MalformedRequest(e.to_string()))
}

async fn request_from_http(req: http::Request<Incoming>) -> Result<BridgeRequest> {
    let (parts, body) = req.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    Ok(BridgeRequest {
        method: parts.method.to_string(),
        path,
        headers: headers_from_http(&parts.headers),
        body: collect_body(body, FedError::MalformedRequest).await?,
    })
}

fn response_to_http(resp: BridgeResponse) -> Result<http::Response<Full<Bytes>>> {
    let mut builder = http::Response::builder().status(resp.status);
    for (name, value) in resp.headers.iter().filter(|(k, _)| !is_connection_header(k)) {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
        .body(Full::new(Bytes::from(resp.body)))
        .map_err(|e| FedError::MalformedResponse(e.to_string()))
}

fn response_error(err: hyper::Error) -> FedError {
    if err.is_parse() || err.is_parse_too_large() || err.is_parse_status() {
        FedError::MalformedResponse(err.to_string())
    } else if err.is_timeout() {
        FedError::Timeout(err.to_string())
    } else {
        FedError::StreamError(err.to_string())
    }
}

fn request_error(err: hyper::Error) -> FedError {
    if err.is_parse() || err.is_parse_too_large() {
        FedError::MalformedRequest(err.to_string())
    } else if err.is_timeout() {
        FedError::Timeout(err.to_string())
    } else {
        FedError::StreamError(err.to_string())
    }
}

/// Send one request over `stream` and read its response.
///
/// Callers bound the whole exchange with their own deadline.
pub async fn send_request<S>(stream: S, req: &BridgeRequest) -> Result<BridgeResponse>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let request = request_to_http(req)?;
    let (mut sender, conn) = client_http1::handshake(TokioIo::new(stream))
        .await
        .map_err(response_error)?;
    // ends once the sender is dropped or the remote closes
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Bridge connection ended: {}", e);
        }
    });

    let resp = sender.send_request(request).await.map_err(response_error)?;
    let (parts, body) = resp.into_parts();
    Ok(BridgeResponse {
        status: parts.status.as_u16(),
        headers: headers_from_http(&parts.headers),
        body: collect_body(body, FedError::MalformedResponse).await?,
    })
}

/// Serve one request arriving on `stream`.
///
/// `read_timeout` bounds the wait for the first byte, the head and the
/// body each. When `handler` fails the stream is closed without an answer
/// and its error is returned.
pub async fn serve_stream<S, H, Fut>(stream: S, read_timeout: Duration, handler: H) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: Fn(BridgeRequest) -> Fut,
    Fut: Future<Output = Result<BridgeResponse>>,
{
    let mut stream = BufReader::new(stream);
    match tokio::time::timeout(read_timeout, stream.fill_buf()).await {
        Err(_) => {
            return Err(FedError::Timeout(format!(
                "no request within {:?}",
                read_timeout
            )));
        }
        Ok(Err(e)) => return Err(e.into()),
        Ok(Ok(buf)) if buf.is_empty() => {
            return Err(FedError::StreamError(
                "stream closed before a request".to_string(),
            ));
        }
        Ok(Ok(_)) => {}
    }

    let handler = &handler;
    let answer = move |req: http::Request<Incoming>| async move {
        let req = tokio::time::timeout(read_timeout, request_from_http(req))
            .await
            .map_err(|_| {
                FedError::Timeout(format!("request body not read within {:?}", read_timeout))
            })??;
        response_to_http(handler(req).await?)
    };
    let failure = Mutex::new(None);
    let service = service_fn(|req| {
        let failure = &failure;
        let answered = answer(req);
        async move {
            answered.await.map_err(|e| {
                *failure.lock() = Some(e);
                "request dropped unanswered"
            })
        }
    });

    let mut builder = server_http1::Builder::new();
    builder
        .timer(TokioTimer::new())
        .header_read_timeout(read_timeout)
        .max_buf_size(MAX_HEAD_BYTES)
        .keep_alive(false);
    let served = builder
        .serve_connection(TokioIo::new(stream), service)
        .await;

    if let Some(e) = failure.lock().take() {
        return Err(e);
    }
    served.map_err(request_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Read one request head off `server`, then answer with raw bytes
    async fn answer_raw(mut server: DuplexStream, raw: &'static [u8]) {
        let mut seen = Vec::new();
        let mut buf = [0u8; 1024];
        while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
            match server.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => seen.extend_from_slice(&buf[..n]),
            }
        }
        let _ = server.write_all(raw).await;
        let _ = server.shutdown().await;
    }

    async fn fetch_raw(raw: &'static [u8]) -> Result<BridgeResponse> {
        let (client, server) = duplex(64 * 1024);
        tokio::spawn(answer_raw(server, raw));
        send_request(client, &BridgeRequest::new("GET", "/")).await
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let (client, server) = duplex(64 * 1024);
        tokio::spawn(serve_stream(server, Duration::from_secs(5), |req| async move {
            Ok(BridgeResponse::new(201)
                .with_header("X-Method", req.method.clone())
                .with_header("X-Path", req.path.clone())
                .with_header("X-A", req.header("a").unwrap_or_default().to_string())
                .with_body(req.body))
        }));

        let req = BridgeRequest::new("PUT", "/x?y=1")
            .with_header("A", "B")
            .with_body("hi");
        let resp = send_request(client, &req).await.unwrap();

        assert_eq!(resp.status, 201);
        assert_eq!(resp.header("x-method"), Some("PUT"));
        assert_eq!(resp.header("x-path"), Some("/x?y=1"));
        assert_eq!(resp.header("x-a"), Some("B"));
        assert_eq!(resp.body, b"hi");
    }

    #[tokio::test]
    async fn test_header_names_lowercased_in_order() {
        let (client, server) = duplex(64 * 1024);
        tokio::spawn(serve_stream(server, Duration::from_secs(5), |req| async move {
            let seen: Vec<String> = req
                .headers
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            Ok(BridgeResponse::text(200, seen.join(",")))
        }));

        let req = BridgeRequest::new("POST", "/a")
            .with_header("X-Zeta", "1")
            .with_header("x-alpha", "2")
            .with_body("abc");
        let resp = send_request(client, &req).await.unwrap();

        assert_eq!(resp.body, b"x-zeta=1,x-alpha=2");
    }

    #[tokio::test]
    async fn test_chunked_response() {
        let resp = fetch_raw(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\n\r\n",
        )
        .await
        .unwrap();

        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"Wikipedia");
        assert!(resp.headers.is_empty());
    }

    #[tokio::test]
    async fn test_response_body_until_eof() {
        let resp = fetch_raw(b"HTTP/1.1 404 Not Found\r\nX-A: b\r\n\r\nmissing")
            .await
            .unwrap();

        assert_eq!(resp.status, 404);
        assert_eq!(resp.header("x-a"), Some("b"));
        assert_eq!(resp.body, b"missing");
    }

    #[tokio::test]
    async fn test_malformed_response() {
        let err = fetch_raw(b"garbage\r\n\r\n").await.unwrap_err();
        assert!(matches!(err, FedError::MalformedResponse(_)));

        let err = fetch_raw(b"").await.unwrap_err();
        assert!(matches!(err, FedError::StreamError(_)));
    }

    #[tokio::test]
    async fn test_overflowing_chunk_size_is_an_error() {
        let result = fetch_raw(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffffff\r\nx\r\n0\r\n\r\n",
        )
        .await;
        assert!(result.is_err());

        let calls = AtomicUsize::new(0);
        let (mut client, server) = duplex(64 * 1024);
        client
            .write_all(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffffff\r\nx\r\n0\r\n\r\n")
            .await
            .unwrap();
        let served = serve_stream(server, Duration::from_secs(5), |_req| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(BridgeResponse::new(200)) }
        })
        .await;
        assert!(matches!(served, Err(FedError::MalformedRequest(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unterminated_header_rejected() {
        let (mut client, server) = duplex(4096);
        tokio::spawn(async move {
            let _ = client.write_all(b"GET / HTTP/1.1\r\nX-Long: ").await;
            let filler = vec![b'a'; 4096];
            for _ in 0..(MAX_HEAD_BYTES / filler.len()) * 2 {
                if client.write_all(&filler).await.is_err() {
                    return;
                }
            }
        });

        let calls = AtomicUsize::new(0);
        let served = tokio::time::timeout(
            Duration::from_secs(5),
            serve_stream(server, Duration::from_secs(5), |_req| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(BridgeResponse::new(200)) }
            }),
        )
        .await
        .unwrap();

        assert!(matches!(served, Err(FedError::MalformedRequest(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_silent_stream_times_out() {
        let (_client, server) = duplex(1024);
        let served = tokio::time::timeout(
            Duration::from_secs(5),
            serve_stream(server, Duration::from_millis(100), |_req| async {
                Ok(BridgeResponse::new(200))
            }),
        )
        .await
        .unwrap();
        assert!(matches!(served, Err(FedError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_stalled_head_times_out() {
        let (mut client, server) = duplex(1024);
        client.write_all(b"GET / HTTP/1.1\r\nX-A: b\r\n").await.unwrap();

        let served = tokio::time::timeout(
            Duration::from_secs(5),
            serve_stream(server, Duration::from_millis(100), |_req| async {
                Ok(BridgeResponse::new(200))
            }),
        )
        .await
        .unwrap();
        assert!(served.is_err());
        drop(client);
    }

    #[tokio::test]
    async fn test_handler_error_closes_unanswered() {
        let (client, server) = duplex(64 * 1024);
        let serving = tokio::spawn(serve_stream(server, Duration::from_secs(5), |_req| async {
            Err::<BridgeResponse, _>(FedError::Rejected("no".to_string()))
        }));

        let result = send_request(client, &BridgeRequest::new("GET", "/admin")).await;
        assert!(matches!(result, Err(FedError::StreamError(_))));
        assert!(matches!(serving.await.unwrap(), Err(FedError::Rejected(_))));
    }

    #[test]
    fn test_cookie_lookup() {
        let req = BridgeRequest::new("GET", "/")
            .with_header("Cookie", "theme=dark; session_id=abc");
        assert_eq!(req.cookie("session_id"), Some("abc"));
        assert_eq!(req.cookie("missing"), None);
    }
}
