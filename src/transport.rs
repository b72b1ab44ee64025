//! WebSocket transport: connects a single session to its CSMS
//! endpoint, reconnecting with backoff on any drop, and exposes plain
//! text-frame send/receive independent of OCPP framing semantics.

use futures_util::{SinkExt, StreamExt};
use http::Request;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::errors::{SimError, SimResult};

/// Cancellation signal a session hands to its reconnect task so
/// deletion or an explicit disconnect interrupts an in-progress
/// backoff sleep instead of waiting out the remaining delay. Reconnect
/// and backoff loops are cancelled by session deletion or an explicit
/// disconnect. A `watch` channel (rather than a one-shot `Notify`) so the signal
/// is observed even if `cancel()` runs before the task starts waiting.
pub struct ConnectCancel {
    tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct ConnectCancelSource {
    rx: watch::Receiver<bool>,
}

impl ConnectCancel {
    pub fn new() -> (Self, ConnectCancelSource) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, ConnectCancelSource { rx })
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl ConnectCancelSource {
    fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    async fn cancelled(&mut self) {
        if self.is_cancelled() {
            return;
        }
        let _ = self.rx.changed().await;
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Endpoint identity for one charge point's connection to its CSMS.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub url: String,
    pub charge_point_id: String,
    pub auth_token: Option<String>,
}

impl Endpoint {
    fn into_request(self) -> SimResult<Request<()>> {
        let uri = format!(
            "{}/{}",
            self.url.trim_end_matches('/'),
            self.charge_point_id
        );
        let mut request = uri
            .into_client_request()
            .map_err(|e| SimError::Configuration(format!("invalid CSMS url: {e}")))?;

        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", "ocpp1.6".parse().unwrap());

        if let Some(token) = &self.auth_token {
            let value = format!("Bearer {token}")
                .parse()
                .map_err(|e| SimError::Configuration(format!("invalid auth token: {e}")))?;
            request.headers_mut().insert("Authorization", value);
        }

        Ok(request)
    }
}

/// Write half of an established connection. Held by the session actor
/// so every outbound frame is serialized through the actor's mailbox.
pub struct TransportWriter {
    sink: futures_util::stream::SplitSink<WsStream, Message>,
}

/// Read half of an established connection. Owned by a dedicated task
/// that forwards incoming text frames back into the actor's mailbox —
/// reading happens independently of whatever the actor is doing with
/// the write half.
pub struct TransportReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

impl TransportWriter {
    pub async fn send_text(&mut self, text: String) -> SimResult<()> {
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| SimError::Transport(e.to_string()))
    }

    pub async fn close(mut self) {
        let _ = self.sink.close().await;
    }
}

impl TransportReader {
    /// Await the next text frame, skipping ping/pong/binary frames
    /// (tungstenite answers pings automatically). Returns `Ok(None)`
    /// when the peer closes the stream cleanly.
    pub async fn recv_text(&mut self) -> SimResult<Option<String>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(SimError::Transport(e.to_string())),
            }
        }
    }
}

async fn connect_once(endpoint: Endpoint) -> SimResult<(TransportWriter, TransportReader)> {
    let request = endpoint.into_request()?;
    let (stream, response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| SimError::Transport(e.to_string()))?;

    let negotiated = response
        .headers()
        .get("Sec-WebSocket-Protocol")
        .and_then(|v| v.to_str().ok());
    if negotiated != Some("ocpp1.6") {
        warn!(?negotiated, "CSMS did not echo the ocpp1.6 subprotocol");
    }

    let (sink, stream) = stream.split();
    Ok((TransportWriter { sink }, TransportReader { stream }))
}

/// Connect to `endpoint`, retrying with exponential backoff, until a
/// connection succeeds or `cancel` fires. Transient failures are
/// retried forever — matching a charge point's own AUTO_RECONNECT
/// behavior — unless the session is deleted or explicitly
/// disconnected, in which case this returns `None` promptly even if a
/// backoff sleep was in progress.
pub async fn connect_with_backoff(
    endpoint: &Endpoint,
    backoff: &mut Backoff,
    cancel: &mut ConnectCancelSource,
) -> Option<(TransportWriter, TransportReader)> {
    loop {
        if cancel.is_cancelled() {
            return None;
        }
        match connect_once(endpoint.clone()).await {
            Ok(halves) => {
                backoff.reset();
                return Some(halves);
            }
            Err(e) => {
                let delay = backoff.next();
                warn!(
                    charge_point_id = %endpoint.charge_point_id,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "connect failed, backing off"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        debug!(charge_point_id = %endpoint.charge_point_id, "retrying connect");
                    }
                    _ = cancel.cancelled() => return None,
                }
            }
        }
    }
}
