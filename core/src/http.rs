/// HTTP/SSE client for the messenger API
///
/// Endpoints (paths configurable):
///   GET  /api/contacts                   roster with unseen counts
///   GET  /events                         SSE stream of message events
///   POST /api/conversations/:peer/seen   body: {"through":"<rfc3339>"}
use crate::collab::{HistorySink, LiveEventSource, LiveEventStream, RosterSource};
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::types::{LiveEvent, PeerId, SeenMark, SnapshotPeer};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures_util::stream::{unfold, StreamExt};
use http_body_util::{BodyExt, BodyStream, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::header::{ACCEPT, CONTENT_TYPE, HOST};
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

const MAX_ERROR_BODY: usize = 256;
const MAX_PENDING_EVENT: usize = 64 * 1024;

// ─── Wire types ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WireContact {
    #[serde(alias = "id")]
    node_id: String,
    #[serde(default, alias = "name")]
    display_name: Option<String>,
    #[serde(default, alias = "unseen_count")]
    unseen: u32,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RosterBody {
    Wrapped { contacts: Vec<WireContact> },
    Bare(Vec<WireContact>),
}

impl RosterBody {
    fn into_rows(self) -> Vec<SnapshotPeer> {
        let contacts = match self {
            RosterBody::Wrapped { contacts } | RosterBody::Bare(contacts) => contacts,
        };
        contacts
            .into_iter()
            .map(|c| SnapshotPeer {
                id: PeerId::new(c.node_id),
                display_name: c.display_name.filter(|n| !n.is_empty()),
                unseen: c.unseen,
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    NewMessage {
        peer_id: String,
        message_id: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(other)]
    Other,
}

/// Parse the roster endpoint body
pub fn parse_roster(body: &[u8]) -> Result<Vec<SnapshotPeer>> {
    let parsed: RosterBody = serde_json::from_slice(body)?;
    Ok(parsed.into_rows())
}

/// Parse one SSE `data` payload. Non-message events yield `None`.
pub fn parse_event(payload: &str) -> Result<Option<LiveEvent>> {
    match serde_json::from_str::<WireEvent>(payload)? {
        WireEvent::NewMessage {
            peer_id,
            message_id,
            timestamp,
        } => Ok(Some(LiveEvent {
            peer_id: PeerId::new(peer_id),
            message_id,
            timestamp,
        })),
        WireEvent::Other => Ok(None),
    }
}

// ─── SSE framing ─────────────────────────────────────────────────────────────

/// Incremental `text/event-stream` decoder yielding the `data` payload of each
/// complete event. Comments and other fields are skipped.
///
/// Bytes are buffered until a block is complete, so multi-byte characters
/// split across chunks decode intact.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        if self.buffer.contains(&b'\r') {
            self.normalize_line_endings();
        }

        let mut payloads = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block = self.buffer.split_to(end + 2);
            let block = String::from_utf8_lossy(&block);
            let data: Vec<&str> = block
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|d| d.strip_prefix(' ').unwrap_or(d))
                .collect();
            if !data.is_empty() {
                payloads.push(data.join("\n"));
            }
        }

        if self.buffer.len() > MAX_PENDING_EVENT {
            warn!(
                "Dropping {} bytes of unterminated event data",
                self.buffer.len()
            );
            self.buffer.clear();
        }
        payloads
    }

    /// Rewrite CRLF as LF. A trailing CR is kept until its LF arrives.
    fn normalize_line_endings(&mut self) {
        let mut normalized = BytesMut::with_capacity(self.buffer.len());
        let mut bytes = self.buffer.iter().peekable();
        while let Some(&b) = bytes.next() {
            if b == b'\r' && bytes.peek() == Some(&&b'\n') {
                continue;
            }
            normalized.extend_from_slice(&[b]);
        }
        self.buffer = normalized;
    }
}

// ─── Client ──────────────────────────────────────────────────────────────────

/// Implements all three collaborator contracts over plain HTTP/1.1.
#[derive(Debug, Clone)]
pub struct HttpCollaborator {
    addr: SocketAddr,
    roster_path: String,
    events_path: String,
    seen_path_prefix: String,
    request_timeout: Duration,
}

impl HttpCollaborator {
    pub fn new(config: &Config) -> Self {
        Self {
            addr: config.server_addr,
            roster_path: config.roster_path.clone(),
            events_path: config.events_path.clone(),
            seen_path_prefix: config.seen_path_prefix.clone(),
            request_timeout: config.request_timeout,
        }
    }

    fn seen_path(&self, peer_id: &PeerId) -> String {
        format!(
            "{}{}/seen",
            self.seen_path_prefix,
            urlencoding::encode(peer_id.as_str())
        )
    }

    fn request(&self, method: Method, path: &str, body: Bytes) -> Result<Request<Full<Bytes>>> {
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, self.addr.to_string());
        if !body.is_empty() {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }
        builder
            .body(Full::new(body))
            .map_err(|e| SyncError::Transport(format!("Invalid request: {}", e)))
    }

    /// Open a connection, send `req` and wait for the response head
    async fn send(&self, req: Request<Full<Bytes>>) -> Result<Response<Incoming>> {
        let exchange = async {
            let stream = TcpStream::connect(self.addr).await?;
            let io = TokioIo::new(stream);
            let (mut sender, conn) = http1::handshake(io)
                .await
                .map_err(|e| SyncError::Transport(format!("Handshake failed: {}", e)))?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!("Messenger API connection closed: {}", e);
                }
            });
            let response = sender
                .send_request(req)
                .await
                .map_err(|e| SyncError::Transport(format!("Request failed: {}", e)))?;
            Ok::<_, SyncError>(response)
        };

        timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| SyncError::Transport(format!("Request to {} timed out", self.addr)))?
    }

    async fn read_body(&self, response: Response<Incoming>) -> Result<Bytes> {
        let status = response.status();
        let collected = timeout(self.request_timeout, response.into_body().collect())
            .await
            .map_err(|_| SyncError::Transport("Response body timed out".to_string()))?
            .map_err(|e| SyncError::Transport(format!("Body read error: {}", e)))?;
        let body = collected.to_bytes();

        if !status.is_success() {
            let text = String::from_utf8_lossy(&body);
            return Err(SyncError::Http {
                status: status.as_u16(),
                message: text.chars().take(MAX_ERROR_BODY).collect(),
            });
        }
        Ok(body)
    }
}

impl RosterSource for HttpCollaborator {
    async fn fetch_roster(&self) -> Result<Vec<SnapshotPeer>> {
        let req = self.request(Method::GET, &self.roster_path, Bytes::new())?;
        let response = self.send(req).await?;
        let body = self.read_body(response).await?;
        let rows = parse_roster(&body)?;
        debug!("Fetched roster with {} peers", rows.len());
        Ok(rows)
    }
}

impl LiveEventSource for HttpCollaborator {
    async fn subscribe(&self) -> Result<LiveEventStream> {
        let mut req = self.request(Method::GET, &self.events_path, Bytes::new())?;
        req.headers_mut()
            .insert(ACCEPT, hyper::header::HeaderValue::from_static("text/event-stream"));
        let response = self.send(req).await?;

        if !response.status().is_success() {
            // Reuse the error path for the status and body text
            self.read_body(response).await?;
            return Err(SyncError::Transport("Event stream rejected".to_string()));
        }

        let body = Box::pin(BodyStream::new(response.into_body()));
        let state = (body, SseDecoder::default(), VecDeque::new(), false);
        let stream = unfold(state, |(mut body, mut decoder, mut ready, mut done)| async move {
            loop {
                if let Some(item) = ready.pop_front() {
                    return Some((item, (body, decoder, ready, done)));
                }
                if done {
                    return None;
                }
                match body.next().await {
                    Some(Ok(frame)) => {
                        let Ok(data) = frame.into_data() else {
                            continue;
                        };
                        for payload in decoder.push(&data) {
                            match parse_event(&payload) {
                                Ok(Some(event)) => ready.push_back(Ok(event)),
                                Ok(None) => {}
                                Err(e) => warn!("Skipping malformed event: {}", e),
                            }
                        }
                    }
                    Some(Err(e)) => {
                        ready.push_back(Err(SyncError::Transport(format!(
                            "Event stream error: {}",
                            e
                        ))));
                        done = true;
                    }
                    None => done = true,
                }
            }
        });

        Ok(stream.boxed())
    }
}

impl HistorySink for HttpCollaborator {
    async fn mark_seen(&self, mark: SeenMark) -> Result<()> {
        let body = serde_json::to_vec(&serde_json::json!({ "through": mark.through.to_rfc3339() }))?;
        let req = self.request(Method::POST, &self.seen_path(&mark.peer_id), Bytes::from(body))?;
        let response = self.send(req).await?;
        self.read_body(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wrapped_and_bare_roster() {
        let wrapped = br#"{"contacts":[{"node_id":"a","display_name":"Alice","unseen":2},{"node_id":"b","display_name":"Bob"}]}"#;
        let rows = parse_roster(wrapped).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], SnapshotPeer::new("a", "Alice", 2));
        assert_eq!(rows[1].unseen, 0);

        let bare = br#"[{"id":"c","name":"","unseen_count":4}]"#;
        let rows = parse_roster(bare).unwrap();
        assert_eq!(rows[0].id, PeerId::from("c"));
        assert_eq!(rows[0].display_name, None);
        assert_eq!(rows[0].unseen, 4);
    }

    #[test]
    fn test_parse_events() {
        let event = parse_event(
            r#"{"type":"new_message","peer_id":"a","message_id":"m1","timestamp":"2024-05-01T10:00:00Z"}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(event.peer_id, PeerId::from("a"));
        assert_eq!(event.message_id, "m1");

        let other = parse_event(r#"{"type":"peer_connected","peer_id":"a"}"#).unwrap();
        assert!(other.is_none());

        assert!(parse_event("not json").is_err());
    }

    #[test]
    fn test_sse_decoder_handles_split_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b": connected\n\n").is_empty());
        assert!(decoder.push(b"data: {\"a\":").is_empty());
        assert_eq!(decoder.push(b"1}\n\ndata: x\r\n\r\n"), vec!["{\"a\":1}", "x"]);
    }

    #[test]
    fn test_sse_decoder_joins_multiline_data() {
        let mut decoder = SseDecoder::default();
        let out = decoder.push(b"event: message\ndata: one\ndata:two\n\n");
        assert_eq!(out, vec!["one\ntwo"]);
    }

    #[test]
    fn test_sse_decoder_keeps_split_utf8_intact() {
        let frame = "data: {\"type\":\"new_message\",\"peer_id\":\"josé\",\"message_id\":\"m1\",\"timestamp\":\"2024-05-01T10:00:00Z\"}\n\n";
        let bytes = frame.as_bytes();
        let split = frame.find('é').unwrap() + 1;

        let mut decoder = SseDecoder::default();
        assert!(decoder.push(&bytes[..split]).is_empty());
        let payloads = decoder.push(&bytes[split..]);

        assert_eq!(payloads.len(), 1);
        let event = parse_event(&payloads[0]).unwrap().unwrap();
        assert_eq!(event.peer_id, PeerId::from("josé"));
    }

    #[test]
    fn test_sse_decoder_crlf_split_between_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: x\r").is_empty());
        assert!(decoder.push(b"\n\r").is_empty());
        assert_eq!(decoder.push(b"\n"), vec!["x"]);
    }

    #[test]
    fn test_sse_decoder_drops_oversized_event() {
        let mut decoder = SseDecoder::default();
        let junk = vec![b'a'; MAX_PENDING_EVENT + 1];
        assert!(decoder.push(&junk).is_empty());
        assert!(decoder.buffer.is_empty());

        assert_eq!(decoder.push(b"data: ok\n\n"), vec!["ok"]);
    }

    #[test]
    fn test_seen_path_is_encoded() {
        let client = HttpCollaborator::new(&Config::default());
        assert_eq!(
            client.seen_path(&PeerId::from("a b/c")),
            "/api/conversations/a%20b%2Fc/seen"
        );
    }
}
