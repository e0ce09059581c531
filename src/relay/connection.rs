//! A single relay connection: owns the WebSocket, replays subscriptions
//! after reconnects, and correlates publish acknowledgements.
//!
//! Wire framing is the plain NIP-01 JSON arrays (`["EVENT", ...]`,
//! `["REQ", ...]`, `["CLOSE", ...]` out; `["EVENT"|"EOSE"|"OK"|...]` in).

use crate::error::{Error, Result};
use futures::{SinkExt, StreamExt};
use nostr::{Event, EventId, Filter, RelayUrl, SubscriptionId};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Commands a pool may send to a connection task.
pub(crate) enum RelayCmd {
    Publish {
        event: Box<Event>,
        ack: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        id: SubscriptionId,
        filters: Vec<Filter>,
    },
    Unsubscribe {
        id: SubscriptionId,
    },
    Close,
}

/// Messages a connection forwards back to the pool dispatcher.
pub(crate) enum RelayIncoming {
    Event {
        relay: RelayUrl,
        subscription_id: SubscriptionId,
        event: Box<Event>,
    },
    EndOfStored {
        relay: RelayUrl,
        subscription_id: SubscriptionId,
    },
}

/// Handle to a spawned connection task.
pub(crate) struct RelayConnection {
    pub url: RelayUrl,
    pub tx: mpsc::UnboundedSender<RelayCmd>,
}

impl RelayConnection {
    /// Spawn the connection task for `url`.
    ///
    /// The task connects lazily and keeps reconnecting with exponential
    /// backoff until [`RelayCmd::Close`] or pool cancellation.
    pub(crate) fn spawn(
        url: RelayUrl,
        incoming: mpsc::UnboundedSender<RelayIncoming>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task_url = url.clone();
        tokio::spawn(async move {
            run(task_url, rx, incoming, cancel).await;
        });
        Self { url, tx }
    }

    pub(crate) fn send(&self, cmd: RelayCmd) {
        // A dropped task means the pool is shutting down; publish acks are
        // failed through their closed oneshot channels.
        let _ = self.tx.send(cmd);
    }
}

fn req_frame(id: &SubscriptionId, filters: &[Filter]) -> String {
    let mut frame = vec![json!("REQ"), json!(id.to_string())];
    frame.extend(filters.iter().map(|f| json!(f)));
    Value::Array(frame).to_string()
}

struct ConnState {
    url: RelayUrl,
    ws: Option<WsStream>,
    subs: HashMap<SubscriptionId, Vec<Filter>>,
    pending_acks: HashMap<EventId, oneshot::Sender<Result<()>>>,
    /// Publishes accepted while the socket is still being established.
    queued_publishes: Vec<(Box<Event>, oneshot::Sender<Result<()>>)>,
    backoff_exp: u32,
}

impl ConnState {
    fn backoff(&mut self) -> Duration {
        let delay = Duration::from_secs(1 << self.backoff_exp.min(5));
        self.backoff_exp = (self.backoff_exp + 1).min(5);
        delay.min(MAX_BACKOFF)
    }

    async fn send_json(&mut self, json: String) -> bool {
        if let Some(ws) = self.ws.as_mut() {
            if let Err(e) = ws.send(Message::Text(json.into())).await {
                log::warn!("Relay {} send failed: {e}", self.url);
                self.drop_socket();
                return false;
            }
            return true;
        }
        false
    }

    fn drop_socket(&mut self) {
        self.ws = None;
        // Acks can no longer be correlated; fail them so publishers move on.
        for (_, ack) in self.pending_acks.drain() {
            let _ = ack.send(Err(Error::Relay(format!(
                "Connection to {} lost before acknowledgement",
                self.url
            ))));
        }
        for (_, ack) in self.queued_publishes.drain(..) {
            let _ = ack.send(Err(Error::Relay(format!(
                "Connection to {} lost before send",
                self.url
            ))));
        }
    }

    async fn send_publish(&mut self, event: Box<Event>, ack: oneshot::Sender<Result<()>>) {
        let id = event.id;
        let json = json!(["EVENT", *event]).to_string();
        if self.send_json(json).await {
            self.pending_acks.insert(id, ack);
        } else {
            let _ = ack.send(Err(Error::Relay(format!("Send to {} failed", self.url))));
        }
    }
}

async fn run(
    url: RelayUrl,
    mut cmds: mpsc::UnboundedReceiver<RelayCmd>,
    incoming: mpsc::UnboundedSender<RelayIncoming>,
    cancel: CancellationToken,
) {
    let mut state = ConnState {
        url: url.clone(),
        ws: None,
        subs: HashMap::new(),
        pending_acks: HashMap::new(),
        queued_publishes: Vec::new(),
        backoff_exp: 0,
    };
    let mut reconnect_at = tokio::time::Instant::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            cmd = cmds.recv() => {
                match cmd {
                    None | Some(RelayCmd::Close) => break,
                    Some(RelayCmd::Publish { event, ack }) => {
                        if state.ws.is_none() {
                            // The first connect may still be in flight; the
                            // caller's deadline bounds the wait.
                            state.queued_publishes.push((event, ack));
                            continue;
                        }
                        state.send_publish(event, ack).await;
                    }
                    Some(RelayCmd::Subscribe { id, filters }) => {
                        let json = req_frame(&id, &filters);
                        state.subs.insert(id, filters);
                        state.send_json(json).await;
                    }
                    Some(RelayCmd::Unsubscribe { id }) => {
                        state.subs.remove(&id);
                        let json = json!(["CLOSE", id.to_string()]).to_string();
                        state.send_json(json).await;
                    }
                }
            }

            msg = async { state.ws.as_mut().unwrap().next().await }, if state.ws.is_some() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_relay_message(&mut state, text.as_str(), &incoming);
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if let Some(ws) = state.ws.as_mut() {
                            let _ = ws.send(Message::Pong(payload)).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::debug!("Relay {url} closed the connection");
                        state.drop_socket();
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("Relay {url} read error: {e}");
                        state.drop_socket();
                    }
                }
            }

            _ = tokio::time::sleep_until(reconnect_at), if state.ws.is_none() => {
                match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.to_string())).await {
                    Ok(Ok((ws, _response))) => {
                        log::debug!("Connected to relay {url}");
                        state.ws = Some(ws);
                        state.backoff_exp = 0;
                        // Replay live subscriptions on the fresh socket.
                        let frames: Vec<String> = state
                            .subs
                            .iter()
                            .map(|(id, filters)| req_frame(id, filters))
                            .collect();
                        for frame in frames {
                            state.send_json(frame).await;
                        }
                        let queued: Vec<_> = state.queued_publishes.drain(..).collect();
                        for (event, ack) in queued {
                            state.send_publish(event, ack).await;
                        }
                    }
                    Ok(Err(e)) => {
                        let delay = state.backoff();
                        log::debug!("Connect to {url} failed ({e}); retry in {delay:?}");
                        reconnect_at = tokio::time::Instant::now() + delay;
                    }
                    Err(_) => {
                        let delay = state.backoff();
                        log::debug!("Connect to {url} timed out; retry in {delay:?}");
                        reconnect_at = tokio::time::Instant::now() + delay;
                    }
                }
            }
        }
    }

    state.drop_socket();
}

fn handle_relay_message(
    state: &mut ConnState,
    text: &str,
    incoming: &mpsc::UnboundedSender<RelayIncoming>,
) {
    let frame: Value = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            log::debug!("Unparseable message from {}: {e}", state.url);
            return;
        }
    };
    let Some(items) = frame.as_array() else {
        return;
    };
    let Some(tag) = items.first().and_then(Value::as_str) else {
        return;
    };

    match tag {
        "EVENT" => {
            let (Some(sub_id), Some(payload)) =
                (items.get(1).and_then(Value::as_str), items.get(2))
            else {
                return;
            };
            match serde_json::from_value::<Event>(payload.clone()) {
                Ok(event) => {
                    let _ = incoming.send(RelayIncoming::Event {
                        relay: state.url.clone(),
                        subscription_id: SubscriptionId::new(sub_id),
                        event: Box::new(event),
                    });
                }
                Err(e) => log::debug!("Malformed event from {}: {e}", state.url),
            }
        }
        "EOSE" => {
            if let Some(sub_id) = items.get(1).and_then(Value::as_str) {
                let _ = incoming.send(RelayIncoming::EndOfStored {
                    relay: state.url.clone(),
                    subscription_id: SubscriptionId::new(sub_id),
                });
            }
        }
        "OK" => {
            let event_id = items
                .get(1)
                .and_then(Value::as_str)
                .and_then(|s| EventId::from_hex(s).ok());
            let accepted = items.get(2).and_then(Value::as_bool).unwrap_or(false);
            let message = items.get(3).and_then(Value::as_str).unwrap_or_default();
            let Some(event_id) = event_id else { return };
            if let Some(ack) = state.pending_acks.remove(&event_id) {
                let result = if accepted {
                    Ok(())
                } else {
                    Err(Error::Relay(format!(
                        "Relay {} rejected event: {message}",
                        state.url
                    )))
                };
                let _ = ack.send(result);
            }
        }
        "CLOSED" | "NOTICE" => {
            log::debug!("Relay {}: {text}", state.url);
        }
        // Unknown frame types are ignored for forward compatibility.
        _ => {}
    }
}
