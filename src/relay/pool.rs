//! The relay pool shared by all sessions within a process.
//!
//! Connections are opened on first use, shared per URL and closed once no
//! live subscription references them. Events are deduplicated per
//! subscription by identifier.

use crate::error::{Error, Result};
use crate::event::validate_event;
use crate::relay::connection::{RelayCmd, RelayConnection, RelayIncoming};
use futures::future::join_all;
use nostr::{Event, EventId, Filter, RelayUrl, SubscriptionId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Items yielded by a [`Subscription`].
#[derive(Debug)]
pub enum SubscriptionItem {
    /// A verified, deduplicated event matching the subscription filters.
    Event(Box<Event>),
    /// One relay finished replaying stored events.
    EndOfStored(RelayUrl),
}

struct SubEntry {
    tx: mpsc::UnboundedSender<SubscriptionItem>,
    relays: HashSet<RelayUrl>,
    seen: HashSet<EventId>,
}

struct PoolState {
    connections: HashMap<RelayUrl, RelayConnection>,
    subscriptions: HashMap<SubscriptionId, SubEntry>,
}

struct PoolShared {
    state: Mutex<PoolState>,
    incoming_tx: mpsc::UnboundedSender<RelayIncoming>,
    cancel: CancellationToken,
}

/// Fan-out relay pool.
///
/// Cheap to clone; all clones share the same connections.
#[derive(Clone)]
pub struct RelayPool {
    shared: Arc<PoolShared>,
}

impl Default for RelayPool {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayPool {
    pub fn new() -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                connections: HashMap::new(),
                subscriptions: HashMap::new(),
            }),
            incoming_tx,
            cancel: CancellationToken::new(),
        });

        let dispatcher = Arc::downgrade(&shared);
        tokio::spawn(dispatch_loop(dispatcher, incoming_rx));

        Self { shared }
    }

    /// Publish `event` to every relay in `relays`, waiting up to `timeout`
    /// for acknowledgements.
    ///
    /// Returns the set of relays that acknowledged. Succeeding on at least
    /// one relay counts as delivery; zero acknowledgements is
    /// [`Error::RelayPublishEmpty`].
    pub async fn publish(
        &self,
        event: &Event,
        relays: &[RelayUrl],
        timeout: Duration,
    ) -> Result<HashSet<RelayUrl>> {
        if relays.is_empty() {
            return Err(Error::RelayPublishEmpty(event.id.to_hex()));
        }

        let mut acks = Vec::with_capacity(relays.len());
        {
            let mut state = self.shared.state.lock().unwrap();
            for url in relays {
                let conn = ensure_connection(&mut state, &self.shared, url);
                let (tx, rx) = oneshot::channel();
                conn.send(RelayCmd::Publish {
                    event: Box::new(event.clone()),
                    ack: tx,
                });
                acks.push((url.clone(), rx));
            }
        }

        let results = join_all(acks.into_iter().map(|(url, rx)| async move {
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(Ok(()))) => (url, Ok(())),
                Ok(Ok(Err(e))) => (url, Err(e)),
                Ok(Err(_)) => {
                    let msg = format!("Connection to {url} closed");
                    (url, Err(Error::Relay(msg)))
                }
                Err(_) => {
                    let msg = format!("publishing to {url}");
                    (url, Err(Error::Timeout(msg)))
                }
            }
        }))
        .await;

        let mut succeeded = HashSet::new();
        for (url, result) in results {
            match result {
                Ok(()) => {
                    succeeded.insert(url);
                }
                Err(e) => log::debug!("Publish to {url} failed: {e}"),
            }
        }

        if succeeded.is_empty() {
            return Err(Error::RelayPublishEmpty(event.id.to_hex()));
        }
        if succeeded.len() < relays.len() {
            log::info!(
                "Event {} accepted by {}/{} relays",
                event.id,
                succeeded.len(),
                relays.len()
            );
        }
        Ok(succeeded)
    }

    /// Open a live subscription over `relays`.
    ///
    /// The subscription deduplicates events by identifier and drops events
    /// failing signature verification. Closing (or dropping) the handle
    /// releases the relay connections it held.
    pub fn subscribe(&self, filters: Vec<Filter>, relays: &[RelayUrl]) -> Result<Subscription> {
        if relays.is_empty() {
            return Err(Error::Relay("Subscription requires at least one relay".into()));
        }

        let id = SubscriptionId::generate();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.shared.state.lock().unwrap();
        state.subscriptions.insert(
            id.clone(),
            SubEntry {
                tx,
                relays: relays.iter().cloned().collect(),
                seen: HashSet::new(),
            },
        );
        for url in relays {
            let conn = ensure_connection(&mut state, &self.shared, url);
            conn.send(RelayCmd::Subscribe {
                id: id.clone(),
                filters: filters.clone(),
            });
        }
        drop(state);

        Ok(Subscription {
            id,
            rx,
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// Fetch stored events matching `filter`, sorted by creation time
    /// descending.
    ///
    /// Collects until every relay reported end-of-stored-events or the
    /// deadline elapses; relay failures shrink the result rather than
    /// failing the call.
    pub async fn query(
        &self,
        filter: Filter,
        relays: &[RelayUrl],
        timeout: Duration,
    ) -> Result<Vec<Event>> {
        let mut sub = self.subscribe(vec![filter], relays)?;
        let deadline = tokio::time::Instant::now() + timeout;
        let mut events = Vec::new();
        let mut pending: HashSet<RelayUrl> = relays.iter().cloned().collect();

        loop {
            let item = tokio::select! {
                item = sub.recv() => item,
                _ = tokio::time::sleep_until(deadline) => break,
            };
            match item {
                Some(SubscriptionItem::Event(event)) => events.push(*event),
                Some(SubscriptionItem::EndOfStored(url)) => {
                    pending.remove(&url);
                    if pending.is_empty() {
                        break;
                    }
                }
                None => break,
            }
        }
        sub.close();

        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(events)
    }

    /// Wait up to `timeout` for the first event matching `filter`.
    pub async fn wait_for(
        &self,
        filter: Filter,
        relays: &[RelayUrl],
        timeout: Duration,
    ) -> Result<Option<Event>> {
        let mut sub = self.subscribe(vec![filter], relays)?;
        let deadline = tokio::time::Instant::now() + timeout;

        let found = loop {
            let item = tokio::select! {
                item = sub.recv() => item,
                _ = tokio::time::sleep_until(deadline) => break None,
            };
            match item {
                Some(SubscriptionItem::Event(event)) => break Some(*event),
                Some(SubscriptionItem::EndOfStored(_)) => continue,
                None => break None,
            }
        };
        sub.close();
        Ok(found)
    }

    /// Close every connection and subscription. Idempotent.
    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
        let mut state = self.shared.state.lock().unwrap();
        for (_, conn) in state.connections.drain() {
            conn.send(RelayCmd::Close);
        }
        state.subscriptions.clear();
    }

}

fn ensure_connection<'a>(
    state: &'a mut PoolState,
    shared: &Arc<PoolShared>,
    url: &RelayUrl,
) -> &'a RelayConnection {
    state.connections.entry(url.clone()).or_insert_with(|| {
        RelayConnection::spawn(
            url.clone(),
            shared.incoming_tx.clone(),
            shared.cancel.child_token(),
        )
    })
}

async fn dispatch_loop(
    shared: Weak<PoolShared>,
    mut incoming: mpsc::UnboundedReceiver<RelayIncoming>,
) {
    while let Some(msg) = incoming.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let mut state = shared.state.lock().unwrap();
        match msg {
            RelayIncoming::Event {
                relay,
                subscription_id,
                event,
            } => {
                let Some(entry) = state.subscriptions.get_mut(&subscription_id) else {
                    continue;
                };
                if !entry.seen.insert(event.id) {
                    continue;
                }
                if !validate_event(&event) {
                    log::debug!("Dropping invalid event {} from {relay}", event.id);
                    continue;
                }
                let _ = entry.tx.send(SubscriptionItem::Event(event));
            }
            RelayIncoming::EndOfStored {
                relay,
                subscription_id,
            } => {
                if let Some(entry) = state.subscriptions.get(&subscription_id) {
                    let _ = entry.tx.send(SubscriptionItem::EndOfStored(relay));
                }
            }
        }
    }
}

/// A live subscription handle.
///
/// Dropping the handle closes the subscription on every relay it spans.
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<SubscriptionItem>,
    shared: Weak<PoolShared>,
}

impl Subscription {
    /// Receive the next item, or `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<SubscriptionItem> {
        self.rx.recv().await
    }

    /// Close the subscription and release relay connections. Idempotent.
    pub fn close(&mut self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut state = shared.state.lock().unwrap();
        let Some(entry) = state.subscriptions.remove(&self.id) else {
            return;
        };
        for url in &entry.relays {
            if let Some(conn) = state.connections.get(url) {
                conn.send(RelayCmd::Unsubscribe { id: self.id.clone() });
            }
        }
        // Reference counting: close connections only this subscription used.
        let referenced: HashSet<RelayUrl> = state
            .subscriptions
            .values()
            .flat_map(|e| e.relays.iter().cloned())
            .collect();
        for url in &entry.relays {
            if !referenced.contains(url) {
                if let Some(conn) = state.connections.remove(url) {
                    conn.send(RelayCmd::Close);
                }
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}
