//! Self-healing WebSocket client for the upstream feed.
//!
//! The client owns one connection at a time. It sends an application-level
//! ping every heartbeat interval, treats prolonged silence as a dead link, and
//! redials with exponential backoff until shut down.

pub mod backoff;
pub mod frame;
pub mod state;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::StreamConfig;
use crate::error::{excerpt, ConnectionError, ProtocolError};
use crate::event::RawEvent;
use crate::stats::Statistics;

use self::backoff::Backoff;
use self::state::{ConnectionState, TransportEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
const LOG_EXCERPT: usize = 120;

struct Session {
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
    connected_at: Instant,
    last_traffic: Instant,
    last_ping: Instant,
}

enum Pump {
    Cancelled,
    Frame(Option<Result<Message, tungstenite::Error>>),
    Silent,
    PingDue,
}

pub struct StreamClient {
    config: StreamConfig,
    stats: Arc<Statistics>,
    cancel: CancellationToken,
    state: ConnectionState,
    backoff: Backoff,
    session: Option<Session>,
    pending: VecDeque<RawEvent>,
    dialed: bool,
}

impl StreamClient {
    pub fn new(config: StreamConfig, stats: Arc<Statistics>, cancel: CancellationToken) -> Self {
        let backoff = Backoff::from_config(&config);
        Self {
            config,
            stats,
            cancel,
            state: ConnectionState::Disconnected,
            backoff,
            session: None,
            pending: VecDeque::new(),
            dialed: false,
        }
    }

    fn transition(&mut self, event: TransportEvent) {
        let next = self.state.on(event);
        if next != self.state {
            debug!("Stream state {:?} -> {:?} ({:?})", self.state, next, event);
        }
        self.state = next;
    }

    /// Open the transport and complete the subscribe handshake.
    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        self.dialed = true;
        self.transition(TransportEvent::Dial);
        info!("Connecting to stream {}", self.config.url);

        let connect_timeout = self.config.connect_timeout();
        let result = match timeout(connect_timeout, self.open_session()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout(connect_timeout)),
        };

        match result {
            Ok((session, ack)) => {
                self.session = Some(session);
                self.transition(TransportEvent::HandshakeAcknowledged);
                info!("Stream connected");
                if let Some(ack) = ack {
                    self.ingest_text(&ack);
                }
                Ok(())
            }
            Err(e) => {
                self.transition(TransportEvent::Closed);
                Err(e)
            }
        }
    }

    /// Next event from the feed, reconnecting as needed.
    /// Returns `None` once the client has been shut down.
    pub async fn next_event(&mut self) -> Option<RawEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.cancel.is_cancelled() {
                self.close().await;
                return None;
            }
            if self.session.is_none() {
                if !self.reconnect().await {
                    self.close().await;
                    return None;
                }
                continue;
            }
            self.pump().await;
        }
    }

    pub async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            let _ = timeout(CLOSE_TIMEOUT, session.sink.close()).await;
            info!("Stream connection closed");
        }
        self.transition(TransportEvent::Shutdown);
    }

    /// Forward events into the processor queue until shutdown.
    /// A full queue suspends reading from the socket.
    pub async fn run(mut self, events: mpsc::Sender<RawEvent>) {
        let cancel = self.cancel.clone();
        while let Some(event) = self.next_event().await {
            tokio::select! {
                biased;
                sent = events.send(event) => {
                    if sent.is_err() {
                        warn!("Processor queue closed, stopping stream client");
                        break;
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
        self.close().await;
    }

    fn build_request(&self) -> Result<Request, ConnectionError> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectionError::InvalidRequest(e.to_string()))?;

        let headers = request.headers_mut();
        if let Some(token) = &self.config.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| ConnectionError::InvalidRequest(format!("auth token: {}", e)))?;
            headers.insert(AUTHORIZATION, value);
        }
        for (name, value) in &self.config.headers {
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ConnectionError::InvalidRequest(format!("header {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ConnectionError::InvalidRequest(format!("header {}: {}", name, e)))?;
            headers.insert(header, value);
        }

        Ok(request)
    }

    async fn open_session(&self) -> Result<(Session, Option<String>), ConnectionError> {
        let request = self.build_request()?;
        let (ws, response) = connect_async(request).await?;
        debug!("Stream upgrade response: {}", response.status());

        let (mut sink, mut stream) = ws.split();
        let ack = match &self.config.subscribe_message {
            Some(subscribe) => {
                sink.send(Message::Text(subscribe.clone().into())).await?;
                Some(Self::await_ack(&mut stream).await?)
            }
            None => None,
        };

        let now = Instant::now();
        Ok((
            Session {
                sink,
                stream,
                connected_at: now,
                last_traffic: now,
                last_ping: now,
            },
            ack,
        ))
    }

    async fn await_ack(stream: &mut SplitStream<WsStream>) -> Result<String, ConnectionError> {
        while let Some(frame) = stream.next().await {
            match frame? {
                Message::Text(text) => return Ok(text.as_str().to_string()),
                Message::Binary(bytes) => {
                    return String::from_utf8(bytes.to_vec()).map_err(|_| {
                        ConnectionError::Handshake("acknowledgement is not UTF-8".to_string())
                    })
                }
                Message::Close(_) => break,
                _ => continue,
            }
        }
        Err(ConnectionError::Handshake(
            "connection closed before the subscription was acknowledged".to_string(),
        ))
    }

    async fn reconnect(&mut self) -> bool {
        let cancel = self.cancel.clone();
        loop {
            if self.dialed {
                let delay = self.backoff.next_delay();
                self.stats.record_reconnect();
                info!("Reconnecting to stream in {:?}", delay);
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = cancel.cancelled() => return false,
                }
            }

            let result = tokio::select! {
                result = self.connect() => result,
                _ = cancel.cancelled() => return false,
            };
            match result {
                Ok(()) => return true,
                Err(e) => {
                    self.stats.record_error();
                    error!("Stream connect to {} failed: {}", self.config.url, e);
                }
            }
        }
    }

    async fn pump(&mut self) {
        let cancel = self.cancel.clone();
        let stale_after = self.config.stale_after();
        let heartbeat = self.config.heartbeat_interval();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let stale_at = session.last_traffic + stale_after;
        let ping_at = session.last_ping + heartbeat;

        // Pings go ahead of frames so a busy feed cannot starve the heartbeat
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Pump::Cancelled,
            _ = sleep_until(ping_at) => Pump::PingDue,
            frame = session.stream.next() => Pump::Frame(frame),
            _ = sleep_until(stale_at) => Pump::Silent,
        };

        match outcome {
            Pump::Cancelled => {}
            Pump::Frame(Some(Ok(message))) => self.on_message(message).await,
            Pump::Frame(Some(Err(e))) => {
                self.stats.record_error();
                error!("Stream transport error: {}", e);
                self.drop_session("transport error").await;
            }
            Pump::Frame(None) => self.drop_session("stream ended").await,
            Pump::Silent => {
                self.transition(TransportEvent::SilenceTimeout);
                warn!("No stream traffic for {:?}, connection degraded", stale_after);
                self.drop_session("heartbeat timeout").await;
            }
            Pump::PingDue => self.send_heartbeat().await,
        }
    }

    async fn on_message(&mut self, message: Message) {
        if let Some(session) = self.session.as_mut() {
            session.last_traffic = Instant::now();
        }
        self.transition(TransportEvent::Traffic);

        match message {
            Message::Text(text) => self.ingest_text(text.as_str()),
            Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                Ok(text) => self.ingest_text(text),
                Err(_) => {
                    self.stats.record_frame();
                    self.stats.record_error();
                    warn!(
                        "Dropping stream frame: {} ({} bytes)",
                        ProtocolError::InvalidUtf8,
                        bytes.len()
                    );
                }
            },
            Message::Close(frame) => {
                let reason = frame
                    .map(|f| f.reason.as_str().to_string())
                    .unwrap_or_default();
                info!("Stream closed by server: {}", reason);
                self.drop_session("closed by server").await;
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }

    fn ingest_text(&mut self, text: &str) {
        self.stats.record_frame();
        match frame::parse_frame(text, Utc::now()) {
            Ok(decoded) => {
                for e in &decoded.rejected {
                    self.stats.record_error();
                    warn!(
                        "Dropping array element: {} (frame: {})",
                        e,
                        excerpt(text, LOG_EXCERPT)
                    );
                }
                self.pending.extend(decoded.events);
            }
            Err(e) => {
                self.stats.record_error();
                warn!(
                    "Dropping stream frame: {} (frame: {})",
                    e,
                    excerpt(text, LOG_EXCERPT)
                );
            }
        }
    }

    async fn send_heartbeat(&mut self) {
        let send_timeout = self.config.heartbeat_interval();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.last_ping = Instant::now();

        let ping = json!({ "type": "ping", "timestamp": Utc::now().timestamp_millis() });
        let sent = timeout(
            send_timeout,
            session.sink.send(Message::Text(ping.to_string().into())),
        )
        .await;

        match sent {
            Ok(Ok(())) => debug!("Heartbeat sent"),
            Ok(Err(e)) => {
                self.stats.record_error();
                warn!("Failed to send heartbeat: {}", e);
                self.drop_session("heartbeat send failed").await;
            }
            Err(_) => {
                self.stats.record_error();
                warn!("Heartbeat send timed out after {:?}", send_timeout);
                self.drop_session("heartbeat send timed out").await;
            }
        }
    }

    async fn drop_session(&mut self, reason: &str) {
        if let Some(mut session) = self.session.take() {
            let lived = session.connected_at.elapsed();
            if lived >= self.config.stable_after() {
                debug!("Connection was stable for {:?}, resetting backoff", lived);
                self.backoff.reset();
            }
            let _ = timeout(CLOSE_TIMEOUT, session.sink.close()).await;
            warn!("Stream connection lost after {:?}: {}", lived, reason);
        }
        self.transition(TransportEvent::Closed);
    }
}
