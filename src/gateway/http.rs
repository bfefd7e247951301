//! HTTP gateway to a manager.
//!
//! Calls are JSON POSTs; the delta stream is a server-sent event stream on
//! `/events` whose `delta` events carry one JSON-encoded [`Delta`] each.
//! Endpoints are relative to the configured base URL
//! (default `http://localhost:7531/api/v1`).

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::mpsc;

use super::{ComponentRef, DeltaReceiver, GatewayError, RemoteGateway};
use crate::config::AdminConfig;
use crate::models::{Delta, Snapshot};

const EVENT_BUFFER: usize = 256;

/// Error body returned by the manager.
#[derive(Debug, Deserialize)]
struct RemoteFault {
    kind: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Clone)]
pub struct HttpGateway {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client: Client::new(),
        }
    }

    pub fn from_config(config: &AdminConfig) -> Self {
        Self::new(config.manager_url.clone(), config.api_key.clone())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build a request with optional auth header.
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.request(method, &url);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }
        req
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, GatewayError> {
        req.send().await.map_err(transport_error)
    }

    async fn handle_json<T: DeserializeOwned>(&self, response: Response) -> Result<T, GatewayError> {
        let status = response.status();
        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| GatewayError::Protocol(e.to_string()))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(fault_error(status, &body, &self.base_url, None))
        }
    }

    /// Like `handle_json`, but an empty body means `null`.
    async fn handle_call(
        &self,
        response: Response,
        target: &str,
        method: &str,
    ) -> Result<serde_json::Value, GatewayError> {
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(fault_error(status, &body, target, Some(method)));
        }
        if body.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| GatewayError::Protocol(e.to_string()))
    }
}

fn transport_error(e: reqwest::Error) -> GatewayError {
    if e.is_connect() {
        GatewayError::ConnectionRefused(e.to_string())
    } else if e.is_decode() {
        GatewayError::Protocol(e.to_string())
    } else {
        GatewayError::ConnectionFailed(e.to_string())
    }
}

fn fault_error(status: StatusCode, body: &str, target: &str, method: Option<&str>) -> GatewayError {
    if status == StatusCode::UNAUTHORIZED {
        return GatewayError::ConnectionRefused("unauthorized: API key required or invalid".into());
    }
    match serde_json::from_str::<RemoteFault>(body) {
        Ok(fault) => match fault.kind.as_str() {
            "no_method" => GatewayError::NoMethod {
                target: target.to_string(),
                method: method.unwrap_or_default().to_string(),
            },
            "busy_component" => GatewayError::BusyComponent(if fault.message.is_empty() {
                target.to_string()
            } else {
                fault.message
            }),
            "not_found" => GatewayError::NotFound(fault.message),
            kind => GatewayError::Remote(format!("{}: {}", kind, fault.message)),
        },
        Err(_) if status == StatusCode::NOT_FOUND => GatewayError::NotFound(body.to_string()),
        Err(_) => GatewayError::Remote(format!("{}: {}", status, body)),
    }
}

#[async_trait]
impl RemoteGateway for HttpGateway {
    async fn fetch_snapshot(&self) -> Result<Snapshot, GatewayError> {
        let response = self.send(self.request(Method::GET, "/planet")).await?;
        self.handle_json(response).await
    }

    async fn list_workers(&self) -> Result<Snapshot, GatewayError> {
        let response = self.send(self.request(Method::GET, "/workers")).await?;
        self.handle_json(response).await
    }

    async fn subscribe(&self) -> Result<DeltaReceiver, GatewayError> {
        let response = self
            .send(
                self.request(Method::GET, "/events")
                    .header(reqwest::header::ACCEPT, "text/event-stream"),
            )
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(fault_error(status, &body, &self.base_url, None));
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(listen_for_deltas(response.bytes_stream(), tx));
        Ok(rx)
    }

    async fn call(
        &self,
        component: &ComponentRef,
        method: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, GatewayError> {
        let target = component.avatar.to_string();
        tracing::debug!(%target, method, "calling component");
        let response = self
            .send(
                self.request(Method::POST, &format!("/components/{}/call", component.node))
                    .json(&serde_json::json!({
                        "avatar": component.avatar,
                        "method": method,
                        "args": args,
                    })),
            )
            .await?;
        self.handle_call(response, &target, method).await
    }

    async fn call_manager(
        &self,
        method: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, GatewayError> {
        tracing::debug!(method, "calling manager");
        let response = self
            .send(
                self.request(Method::POST, "/manager/call")
                    .json(&serde_json::json!({ "method": method, "args": args })),
            )
            .await?;
        self.handle_call(response, "manager", method).await
    }
}

/// Incremental server-sent-events parser.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: String,
}

impl SseDecoder {
    /// Feed raw bytes; returns completed `(event type, data)` pairs.
    ///
    /// Only whole lines are decoded, so a character split across chunks survives.
    fn push(&mut self, chunk: &[u8]) -> Vec<(Option<String>, String)> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push((self.event.take(), std::mem::take(&mut self.data)));
                }
                self.event = None;
            } else if let Some(event) = line.strip_prefix("event:") {
                self.event = Some(event.trim().to_string());
            } else if let Some(data) = line.strip_prefix("data:") {
                if !self.data.is_empty() {
                    self.data.push('\n');
                }
                self.data.push_str(data.trim());
            }
            // comments (":keepalive") and unknown fields are ignored
        }
        events
    }
}

/// Background task: decode the event stream into deltas until either side goes away.
async fn listen_for_deltas<S, B>(mut stream: S, tx: mpsc::Sender<Result<Delta, GatewayError>>)
where
    S: Stream<Item = Result<B, reqwest::Error>> + Unpin,
    B: AsRef<[u8]>,
{
    let mut decoder = SseDecoder::default();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = tx.send(Err(transport_error(e))).await;
                return;
            }
        };
        for (event, data) in decoder.push(chunk.as_ref()) {
            if event.as_deref().is_some_and(|e| e != "delta") {
                tracing::trace!(?event, "ignoring event");
                continue;
            }
            let item = serde_json::from_str::<Delta>(&data)
                .map_err(|e| GatewayError::Protocol(format!("bad delta: {}", e)));
            if let Err(ref e) = item {
                tracing::warn!("{}", e);
                continue;
            }
            if tx.send(item).await.is_err() {
                return;
            }
        }
    }
    let _ = tx
        .send(Err(GatewayError::ConnectionFailed(
            "event stream closed by manager".into(),
        )))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_splits_events_across_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"event: delta\ndata: {\"a\"").is_empty());
        let events = decoder.push(b":1}\n\n: keepalive\n\nevent: delta\r\ndata: 2\r\n\r\n");
        assert_eq!(
            events,
            vec![
                (Some("delta".to_string()), "{\"a\":1}".to_string()),
                (Some("delta".to_string()), "2".to_string()),
            ]
        );
    }

    #[test]
    fn decoder_joins_multiline_data() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(b"data: one\ndata: two\n\n");
        assert_eq!(events, vec![(None, "one\ntwo".to_string())]);
    }

    #[test]
    fn decoder_keeps_characters_split_between_chunks() {
        let mut decoder = SseDecoder::default();
        let line = "data: café\n\n".as_bytes();
        let split = line.iter().position(|&b| b == 0xC3).unwrap() + 1;

        assert!(decoder.push(&line[..split]).is_empty());
        let events = decoder.push(&line[split..]);
        assert_eq!(events, vec![(None, "café".to_string())]);
    }

    #[test]
    fn faults_map_to_gateway_errors() {
        let no_method = fault_error(
            StatusCode::BAD_REQUEST,
            r#"{"kind":"no_method","message":"nope"}"#,
            "/default/producer",
            Some("reload"),
        );
        assert_eq!(
            no_method,
            GatewayError::NoMethod {
                target: "/default/producer".into(),
                method: "reload".into()
            }
        );

        let busy = fault_error(
            StatusCode::CONFLICT,
            r#"{"kind":"busy_component"}"#,
            "/default/producer",
            None,
        );
        assert_eq!(busy, GatewayError::BusyComponent("/default/producer".into()));

        assert!(fault_error(StatusCode::UNAUTHORIZED, "", "x", None).is_connection());
        assert_eq!(
            fault_error(StatusCode::NOT_FOUND, "gone", "x", None),
            GatewayError::NotFound("gone".into())
        );
    }

    #[tokio::test]
    async fn listener_forwards_deltas_then_reports_close() {
        let body = "event: delta\ndata: {\"node\":1,\"op\":\"set\",\"key\":\"mood\",\"value\":{\"scalar\":\"happy\"}}\n\n\
                    event: ping\ndata: {}\n\n\
                    event: delta\ndata: not json\n\n";
        let stream = futures::stream::iter(vec![Ok::<_, reqwest::Error>(body.as_bytes().to_vec())]);
        let (tx, mut rx) = mpsc::channel(8);

        listen_for_deltas(stream, tx).await;

        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first, Delta::set(1, "mood", serde_json::json!("happy")));
        assert!(matches!(
            rx.recv().await,
            Some(Err(GatewayError::ConnectionFailed(_)))
        ));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn listener_decodes_names_split_inside_a_character() {
        let body = "event: delta\ndata: {\"node\":7,\"op\":\"set\",\"key\":\"name\",\"value\":{\"scalar\":\"café\"}}\n\n";
        let bytes = body.as_bytes();
        let split = bytes.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let stream = futures::stream::iter(vec![
            Ok::<_, reqwest::Error>(bytes[..split].to_vec()),
            Ok(bytes[split..].to_vec()),
        ]);
        let (tx, mut rx) = mpsc::channel(8);

        listen_for_deltas(stream, tx).await;

        let delta = rx.recv().await.unwrap().unwrap();
        assert_eq!(delta, Delta::set(7, "name", serde_json::json!("café")));
    }
}
