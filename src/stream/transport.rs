//! Transport opener collaborator and its websocket / push-stream
//! implementations.
//!
//! Connections treat an open transport as an opaque resource with `send`,
//! `recv`, and `close`. Tests substitute scripted openers.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::{SinkExt, StreamExt};
use reqwest::{Client, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::stream::error::{parse_retry_after, StreamError};
use crate::stream::profile::{AuthStyle, TransportKind};
use crate::stream::proto::{EventStreamDecoder, RawFrame};

/// Everything needed to open one physical transport.
#[derive(Clone, Debug)]
pub struct TransportRequest {
    pub kind: TransportKind,
    pub address: Url,
    pub auth: AuthStyle,
    pub token: Option<SecretString>,
}

impl TransportRequest {
    /// Address with query-parameter auth applied.
    pub fn authorized_address(&self) -> Url {
        let mut url = self.address.clone();
        if let (AuthStyle::QueryParam(param), Some(token)) = (&self.auth, &self.token) {
            url.query_pairs_mut()
                .append_pair(param, token.expose_secret());
        }
        url
    }

    /// Bearer header value when header auth is used.
    pub fn bearer(&self) -> Option<String> {
        match (&self.auth, &self.token) {
            (AuthStyle::BearerHeader, Some(token)) => {
                Some(format!("Bearer {}", token.expose_secret()))
            }
            _ => None,
        }
    }
}

/// One open physical link.
#[async_trait]
pub trait Transport: Send {
    /// Sends a text frame. Read-only transports reject sends.
    async fn send(&mut self, text: String) -> Result<(), StreamError>;

    /// Sends a liveness ping where the transport supports one.
    async fn ping(&mut self) -> Result<(), StreamError> {
        Ok(())
    }

    /// Receives the next frame. `Ok(None)` means the remote side closed.
    ///
    /// Must be cancel-safe: it is raced against timers and commands.
    async fn recv(&mut self) -> Result<Option<RawFrame>, StreamError>;

    /// Releases the transport. Called exactly once per opened transport.
    async fn close(&mut self);
}

/// Opens transports for connections.
#[async_trait]
pub trait TransportOpener: Send + Sync {
    async fn open(&self, request: TransportRequest) -> Result<Box<dyn Transport>, StreamError>;
}

/// Opener backed by tokio-tungstenite and reqwest.
#[derive(Clone, Debug)]
pub struct NetworkOpener {
    http: Client,
}

impl NetworkOpener {
    pub fn new(connect_timeout: Duration) -> Result<Self, StreamError> {
        let http = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|err| StreamError::Transport(format!("http client: {err}")))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl TransportOpener for NetworkOpener {
    async fn open(&self, request: TransportRequest) -> Result<Box<dyn Transport>, StreamError> {
        match request.kind {
            TransportKind::WebSocket => {
                Ok(Box::new(WebSocketTransport::connect(&request).await?))
            }
            TransportKind::EventStream => {
                Ok(Box::new(EventStreamTransport::connect(&self.http, &request).await?))
            }
            TransportKind::Polling => Err(StreamError::Transport(
                "polling channels do not open a transport".to_string(),
            )),
        }
    }
}

/// Persistent websocket transport.
pub struct WebSocketTransport {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WebSocketTransport {
    pub async fn connect(request: &TransportRequest) -> Result<Self, StreamError> {
        let mut ws_request = request
            .authorized_address()
            .as_str()
            .into_client_request()
            .map_err(map_ws_error)?;
        if let Some(bearer) = request.bearer() {
            let header = bearer
                .parse()
                .map_err(|err| StreamError::Auth(format!("invalid token header: {err}")))?;
            ws_request.headers_mut().insert("authorization", header);
        }

        let (socket, _) = connect_async(ws_request).await.map_err(map_ws_error)?;
        debug!(event = "websocket_opened", address = %request.address);
        Ok(Self { socket })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, text: String) -> Result<(), StreamError> {
        self.socket
            .send(Message::Text(text))
            .await
            .map_err(map_ws_error)
    }

    async fn ping(&mut self) -> Result<(), StreamError> {
        self.socket
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(map_ws_error)
    }

    async fn recv(&mut self) -> Result<Option<RawFrame>, StreamError> {
        loop {
            match self.socket.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(RawFrame::Text(text))),
                Some(Ok(Message::Binary(bytes))) => {
                    return String::from_utf8(bytes)
                        .map(|text| Some(RawFrame::Text(text)))
                        .or(Ok(Some(RawFrame::Heartbeat)));
                }
                Some(Ok(Message::Ping(payload))) => {
                    self.socket
                        .send(Message::Pong(payload))
                        .await
                        .map_err(map_ws_error)?;
                    return Ok(Some(RawFrame::Heartbeat));
                }
                Some(Ok(Message::Pong(_))) => return Ok(Some(RawFrame::Heartbeat)),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(err)) => return Err(map_ws_error(err)),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.socket.close(None).await;
    }
}

/// Read-only server-push text stream.
pub struct EventStreamTransport {
    body: Option<BoxStream<'static, Result<Vec<u8>, reqwest::Error>>>,
    decoder: EventStreamDecoder,
}

impl EventStreamTransport {
    pub async fn connect(http: &Client, request: &TransportRequest) -> Result<Self, StreamError> {
        let mut builder = http
            .get(request.authorized_address())
            .header("accept", "text/event-stream");
        if let Some(bearer) = request.bearer() {
            builder = builder.header("authorization", bearer);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| StreamError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|value| value.to_str().ok())
                .and_then(parse_retry_after);
            return Err(classify_status(status, retry_after));
        }

        debug!(event = "event_stream_opened", address = %request.address);
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();
        Ok(Self {
            body: Some(body),
            decoder: EventStreamDecoder::new(),
        })
    }
}

#[async_trait]
impl Transport for EventStreamTransport {
    async fn send(&mut self, _text: String) -> Result<(), StreamError> {
        Err(StreamError::Protocol("push stream is read-only".to_string()))
    }

    async fn recv(&mut self) -> Result<Option<RawFrame>, StreamError> {
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                return Ok(Some(frame));
            }
            let Some(body) = self.body.as_mut() else {
                return Ok(None);
            };
            match body.next().await {
                Some(Ok(chunk)) => self.decoder.push(&chunk),
                Some(Err(err)) => return Err(StreamError::Transport(err.to_string())),
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) {
        self.body = None;
    }
}

/// Maps an HTTP status seen during a handshake to the error taxonomy.
pub(crate) fn classify_status(status: StatusCode, retry_after: Option<Duration>) -> StreamError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            StreamError::Auth(format!("handshake rejected with {status}"))
        }
        StatusCode::TOO_MANY_REQUESTS => StreamError::RateLimited { retry_after },
        _ => StreamError::Transport(format!("handshake failed with {status}")),
    }
}

fn map_ws_error(err: WsError) -> StreamError {
    match err {
        WsError::Http(response) => {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|value| value.to_str().ok())
                .and_then(parse_retry_after);
            let status = StatusCode::from_u16(response.status().as_u16())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            classify_status(status, retry_after)
        }
        other => StreamError::Transport(other.to_string()),
    }
}
