//! HTTP forwarder
//!
//! Replays a decoded request payload against the local origin server and
//! streams the response back as payload chunks over a bounded channel.
//! Origin-side failures never reach the caller as errors; they collapse
//! into a single synthetic 500 payload so the tunnel stream stays well
//! formed. Only a missing or malformed HTTP method fails the call up
//! front, before any network traffic.

use burrow_shared::{Error, Payload, Result};
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use std::future::Future;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::LocalServerConfig;

/// Response chunks buffered between the origin read and the socket send
const CHUNK_CHANNEL_CAPACITY: usize = 16;

const INTERNAL_SERVER_ERROR_BODY: &[u8] = b"INTERNAL_SERVER_ERROR";

pub struct HttpForwarder {
    client: reqwest::Client,
    base_url: String,
}

impl HttpForwarder {
    pub fn new(config: &LocalServerConfig) -> Result<Self> {
        // reqwest has no standalone write timeout; the write knob bounds
        // the whole attempt together with the other two.
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .read_timeout(config.read_timeout())
            .timeout(config.connect_timeout() + config.write_timeout() + config.read_timeout())
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }

    /// Issue `payload` against the origin. Returns the driver future and
    /// the receiving end of the chunk stream. The caller awaits the
    /// driver on whichever task consumes the chunks; one forward never
    /// occupies more than that single task. Cancelling the token,
    /// dropping the receiver, or dropping the driver aborts the origin
    /// call with no further emission.
    pub fn forward(
        &self,
        payload: Payload,
        cancel: CancellationToken,
    ) -> Result<(impl Future<Output = ()> + Send + 'static, mpsc::Receiver<Payload>)> {
        let method = payload
            .method
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| Error::BadRequest("Invalid HTTP Method".into()))?;
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| Error::BadRequest(format!("Invalid HTTP Method '{method}'")))?;

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let started = Instant::now();

        let driver = async move {
            let mut completion = CompletionLog {
                url: payload.url.clone().unwrap_or_default(),
                started,
                outcome: "cancelled",
            };
            completion.outcome = tokio::select! {
                _ = cancel.cancelled() => "cancelled",
                outcome = drive(&client, &base_url, method, &payload, &tx) => outcome,
            };
        };

        Ok((driver, rx))
    }
}

/// Emits the per-invocation duration log exactly once, even when a
/// cancelled pipeline drops the driver mid-flight.
struct CompletionLog {
    url: String,
    started: Instant,
    outcome: &'static str,
}

impl Drop for CompletionLog {
    fn drop(&mut self) {
        info!(
            url = %self.url,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            outcome = self.outcome,
            "forward finished"
        );
    }
}

/// Execute the origin exchange, emitting one payload per body chunk.
/// Returns the outcome tag for the completion log.
async fn drive(
    client: &reqwest::Client,
    base_url: &str,
    method: Method,
    payload: &Payload,
    tx: &mpsc::Sender<Payload>,
) -> &'static str {
    let path = decode_path(payload.url.as_deref().unwrap_or(""));
    let url = format!("{}{}", base_url, path);

    let mut request = client.request(method, &url).headers(origin_headers(payload));
    if !payload.query_params.is_empty() {
        let pairs: Vec<(&str, &str)> = payload
            .query_params
            .iter()
            .flat_map(|(k, vs)| vs.iter().map(move |v| (k.as_str(), v.as_str())))
            .collect();
        request = request.query(&pairs);
    }
    if !payload.body.is_empty() {
        request = request.body(payload.body.clone());
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(err) => {
            error!(url = %url, error = %err, "origin request failed");
            let _ = tx.send(internal_error()).await;
            return "failed";
        }
    };

    let status = response.status().as_u16();
    let headers = collect_headers(response.headers());
    let mut body = response.bytes_stream();
    let mut emitted = false;

    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(bytes) => {
                emitted = true;
                let chunk_payload = payload.with_response(status, headers.clone(), bytes.to_vec());
                if tx.send(chunk_payload).await.is_err() {
                    return "cancelled";
                }
            }
            Err(err) => {
                error!(url = %url, error = %err, "origin response stream failed");
                let _ = tx.send(internal_error()).await;
                return "failed";
            }
        }
    }

    // Empty bodies still produce one response payload
    if !emitted && tx.send(payload.with_response(status, headers, Vec::new())).await.is_err() {
        return "cancelled";
    }

    "completed"
}

/// The synthetic fallback the peer sees for any origin-side failure.
fn internal_error() -> Payload {
    Payload {
        status: Some(500),
        body: INTERNAL_SERVER_ERROR_BODY.to_vec(),
        ..Default::default()
    }
}

fn decode_path(raw: &str) -> String {
    match urlencoding::decode(raw) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => raw.to_string(),
    }
}

/// Request headers to replay, minus `host` (handled by the HTTP client)
/// and anything that does not survive the trip as a valid header.
fn origin_headers(payload: &Payload) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, values) in payload.forwardable_headers() {
        let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
            warn!(header = name, "skipping invalid header name");
            continue;
        };
        for value in values {
            match HeaderValue::from_str(value) {
                Ok(header_value) => {
                    map.append(header_name.clone(), header_value);
                }
                Err(_) => warn!(header = name, "skipping invalid header value"),
            }
        }
    }
    map
}

fn collect_headers(headers: &HeaderMap) -> Vec<(String, Vec<String>)> {
    let mut out: Vec<(String, Vec<String>)> = Vec::new();
    for (name, value) in headers.iter() {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        match out.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name.as_str())) {
            Some((_, values)) => values.push(value),
            None => out.push((name.as_str().to_string(), vec![value])),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockOrigin;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn forwarder(origin_url: String) -> HttpForwarder {
        let config = LocalServerConfig {
            url: origin_url,
            connect_timeout_secs: 2,
            read_timeout_secs: 2,
            write_timeout_secs: 2,
        };
        HttpForwarder::new(&config).unwrap()
    }

    /// Run the driver on its own task, as the dispatcher does alongside
    /// its chunk consumer.
    fn start(fwd: &HttpForwarder, payload: Payload, cancel: CancellationToken) -> mpsc::Receiver<Payload> {
        let (driver, rx) = fwd.forward(payload, cancel).unwrap();
        tokio::spawn(driver);
        rx
    }

    fn get_request(url: &str) -> Payload {
        Payload {
            method: Some("GET".into()),
            url: Some(url.into()),
            ..Default::default()
        }
    }

    async fn collect(mut rx: mpsc::Receiver<Payload>) -> Vec<Payload> {
        let mut out = Vec::new();
        while let Some(p) = rx.recv().await {
            out.push(p);
        }
        out
    }

    #[tokio::test]
    async fn forwards_origin_response() {
        let origin = MockOrigin::start(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
        )
        .await;

        let fwd = forwarder(origin.url());
        let rx = start(&fwd, get_request("/health"), CancellationToken::new());
        let chunks = collect(rx).await;

        assert!(!chunks.is_empty());
        let body: Vec<u8> = chunks.iter().flat_map(|p| p.body.clone()).collect();
        assert_eq!(body, b"ok");
        for chunk in &chunks {
            assert_eq!(chunk.status, Some(200));
            assert_eq!(chunk.header("content-type").unwrap(), ["text/plain"]);
            // identity fields survive
            assert_eq!(chunk.method.as_deref(), Some("GET"));
            assert_eq!(chunk.url.as_deref(), Some("/health"));
        }
    }

    #[tokio::test]
    async fn empty_body_still_emits_one_payload() {
        let origin =
            MockOrigin::start("HTTP/1.1 204 No Content\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await;

        let fwd = forwarder(origin.url());
        let rx = start(&fwd, get_request("/empty"), CancellationToken::new());
        let chunks = collect(rx).await;

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].status, Some(204));
        assert!(chunks[0].body.is_empty());
    }

    #[tokio::test]
    async fn missing_method_fails_without_origin_call() {
        let origin = MockOrigin::start("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
        let fwd = forwarder(origin.url());

        let payload = Payload { url: Some("/".into()), ..Default::default() };
        assert!(matches!(
            fwd.forward(payload, CancellationToken::new()),
            Err(Error::BadRequest(_))
        ));

        let blank = Payload { method: Some("  ".into()), ..Default::default() };
        assert!(matches!(
            fwd.forward(blank, CancellationToken::new()),
            Err(Error::BadRequest(_))
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(origin.hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unreachable_origin_becomes_single_500() {
        // Bind and drop to get a port with nothing listening
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let fwd = forwarder(format!("http://{}", addr));
        let rx = start(&fwd, get_request("/down"), CancellationToken::new());
        let chunks = collect(rx).await;

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].status, Some(500));
        assert_eq!(chunks[0].body, b"INTERNAL_SERVER_ERROR");
    }

    #[tokio::test]
    async fn host_header_is_stripped() {
        let origin = MockOrigin::start("HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await;
        let fwd = forwarder(origin.url());

        let payload = Payload {
            method: Some("GET".into()),
            url: Some("/".into()),
            headers: vec![
                ("Host".into(), vec!["tunnel.example.com".into()]),
                ("X-Custom".into(), vec!["yes".into()]),
            ],
            ..Default::default()
        };
        collect(start(&fwd, payload, CancellationToken::new())).await;

        let head = origin.requests.lock().unwrap().join("\n").to_lowercase();
        assert!(head.contains("x-custom: yes"));
        assert!(!head.contains("tunnel.example.com"));
    }

    #[tokio::test]
    async fn decodes_url_and_attaches_query_params() {
        let origin = MockOrigin::start("HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await;
        let fwd = forwarder(origin.url());

        let payload = Payload {
            method: Some("GET".into()),
            url: Some("/a%20b".into()),
            query_params: vec![("q".into(), vec!["1".into(), "2".into()])],
            ..Default::default()
        };
        collect(start(&fwd, payload, CancellationToken::new())).await;

        let head = origin.requests.lock().unwrap().join("\n");
        assert!(head.contains("/a%20b?q=1&q=2"), "request head was: {head}");
    }

    #[tokio::test]
    async fn cancellation_stops_emission() {
        let origin = MockOrigin::start_with_delay(
            "HTTP/1.1 200 OK\r\nContent-Length: 4\r\nConnection: close\r\n\r\nlate",
            Duration::from_millis(500),
        )
        .await;

        let fwd = forwarder(origin.url());
        let cancel = CancellationToken::new();
        let mut rx = start(&fwd, get_request("/slow"), cancel.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        // Stream closes without any payload leaking out
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropping_the_driver_closes_the_stream() {
        let origin = MockOrigin::start_with_delay(
            "HTTP/1.1 200 OK\r\nContent-Length: 4\r\nConnection: close\r\n\r\nlate",
            Duration::from_millis(500),
        )
        .await;

        let fwd = forwarder(origin.url());
        let (driver, mut rx) = fwd
            .forward(get_request("/slow"), CancellationToken::new())
            .unwrap();
        drop(driver);

        assert!(rx.recv().await.is_none());
    }
}
