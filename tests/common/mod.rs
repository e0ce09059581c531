//! Shared fixtures: an in-process relay speaking the Nostr wire protocol
//! and an in-memory Lightning wallet minting real BOLT11 invoices.

#![allow(dead_code)]

use expertmarket::types::OpFuture;
use expertmarket::wallet::{LightningWallet, NewInvoice, PaidInvoice, WalletInvoice};
use expertmarket::Error;
use futures::{SinkExt, StreamExt};
use lightning_invoice::{Bolt11Invoice, Currency, InvoiceBuilder, PaymentSecret};
use nostr::{Event, Filter, RelayUrl};
use rand::RngCore;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

/// In-process relay: stores events, answers REQ with stored matches plus
/// EOSE, and fans live events out to matching subscriptions.
pub struct MockRelay {
    url: RelayUrl,
    cancel: CancellationToken,
    events: Arc<Mutex<Vec<Event>>>,
}

impl MockRelay {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = RelayUrl::parse(&format!("ws://{addr}")).unwrap();

        let events: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
        let (live_tx, _) = broadcast::channel::<Event>(256);
        let cancel = CancellationToken::new();

        let accept_events = events.clone();
        let accept_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    accepted = listener.accept() => accepted,
                    _ = accept_cancel.cancelled() => break,
                };
                let Ok((stream, _)) = accepted else { continue };
                tokio::spawn(relay_connection(
                    stream,
                    accept_events.clone(),
                    live_tx.clone(),
                    live_tx.subscribe(),
                    accept_cancel.clone(),
                ));
            }
        });

        Self {
            url,
            cancel,
            events,
        }
    }

    pub fn url(&self) -> RelayUrl {
        self.url.clone()
    }

    /// Every event the relay accepted, in arrival order.
    pub fn stored(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Stored events of the given kind.
    pub fn stored_of_kind(&self, kind: u16) -> Vec<Event> {
        self.stored()
            .into_iter()
            .filter(|e| e.kind == nostr::Kind::Custom(kind))
            .collect()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn relay_connection(
    stream: TcpStream,
    events: Arc<Mutex<Vec<Event>>>,
    live_tx: broadcast::Sender<Event>,
    mut live_rx: broadcast::Receiver<Event>,
    cancel: CancellationToken,
) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let (mut sink, mut reader) = ws.split();
    let mut subs: HashMap<String, Vec<Filter>> = HashMap::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            live = live_rx.recv() => {
                let Ok(event) = live else { continue };
                for (sub_id, filters) in &subs {
                    if filters.iter().any(|f| f.match_event(&event)) {
                        let frame = json!(["EVENT", sub_id, event]).to_string();
                        if sink.send(Message::Text(frame.into())).await.is_err() {
                            return;
                        }
                    }
                }
            }

            incoming = reader.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                };
                let Ok(Value::Array(items)) = serde_json::from_str::<Value>(text.as_str())
                else {
                    continue;
                };
                match items.first().and_then(Value::as_str) {
                    Some("EVENT") => {
                        let Some(event) = items
                            .get(1)
                            .and_then(|v| serde_json::from_value::<Event>(v.clone()).ok())
                        else {
                            continue;
                        };
                        let accepted = event.verify().is_ok();
                        let reply = json!(["OK", event.id, accepted, ""]).to_string();
                        if accepted {
                            events.lock().unwrap().push(event.clone());
                            let _ = live_tx.send(event);
                        }
                        if sink.send(Message::Text(reply.into())).await.is_err() {
                            break;
                        }
                    }
                    Some("REQ") => {
                        let Some(sub_id) = items.get(1).and_then(Value::as_str) else {
                            continue;
                        };
                        let filters: Vec<Filter> = items[2..]
                            .iter()
                            .filter_map(|v| serde_json::from_value(v.clone()).ok())
                            .collect();
                        let stored = events.lock().unwrap().clone();
                        for event in stored {
                            if filters.iter().any(|f| f.match_event(&event)) {
                                let frame = json!(["EVENT", sub_id, event]).to_string();
                                if sink.send(Message::Text(frame.into())).await.is_err() {
                                    return;
                                }
                            }
                        }
                        let eose = json!(["EOSE", sub_id]).to_string();
                        if sink.send(Message::Text(eose.into())).await.is_err() {
                            break;
                        }
                        subs.insert(sub_id.to_string(), filters);
                    }
                    Some("CLOSE") => {
                        if let Some(sub_id) = items.get(1).and_then(Value::as_str) {
                            subs.remove(sub_id);
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

struct MockInvoiceEntry {
    bolt11: String,
    preimage: [u8; 32],
    amount_msat: u64,
    settled_at: Option<u64>,
    created_at: u64,
}

/// In-memory Lightning wallet: mints signed regtest invoices, settles them
/// when paid, and answers lookups from its own table.
pub struct MockWallet {
    node_secret: bitcoin::secp256k1::SecretKey,
    invoices: Mutex<HashMap<String, MockInvoiceEntry>>,
}

impl MockWallet {
    pub fn new() -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self {
            node_secret: bitcoin::secp256k1::SecretKey::from_slice(&secret).unwrap(),
            invoices: Mutex::new(HashMap::new()),
        }
    }

    pub fn settled_count(&self) -> usize {
        self.invoices
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.settled_at.is_some())
            .count()
    }

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }
}

impl Default for MockWallet {
    fn default() -> Self {
        Self::new()
    }
}

impl LightningWallet for MockWallet {
    fn make_invoice(
        &self,
        amount_msat: u64,
        description: &str,
        _expiry_secs: Option<u64>,
    ) -> OpFuture<'_, NewInvoice> {
        let description = description.to_string();
        Box::pin(async move {
            let mut preimage = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut preimage);
            let payment_hash: bitcoin::hashes::sha256::Hash = {
                use bitcoin::hashes::Hash;
                bitcoin::hashes::sha256::Hash::hash(&preimage)
            };

            let mut secret_bytes = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut secret_bytes);
            let secp = bitcoin::secp256k1::Secp256k1::new();
            let invoice = InvoiceBuilder::new(Currency::Regtest)
                .description(description)
                .payment_hash(payment_hash)
                .payment_secret(PaymentSecret(secret_bytes))
                .amount_milli_satoshis(amount_msat)
                .current_timestamp()
                .min_final_cltv_expiry_delta(18)
                .build_signed(|hash| secp.sign_ecdsa_recoverable(hash, &self.node_secret))
                .map_err(|e| Error::Wallet(format!("Invoice build failed: {e}")))?;

            let bolt11 = invoice.to_string();
            let payment_hash_hex = payment_hash.to_string();
            self.invoices.lock().unwrap().insert(
                payment_hash_hex.clone(),
                MockInvoiceEntry {
                    bolt11: bolt11.clone(),
                    preimage,
                    amount_msat,
                    settled_at: None,
                    created_at: Self::now(),
                },
            );
            Ok(NewInvoice {
                invoice: bolt11,
                payment_hash: payment_hash_hex,
            })
        })
    }

    fn pay_invoice(&self, invoice: &str, _amount_msat: Option<u64>) -> OpFuture<'_, PaidInvoice> {
        let invoice = invoice.to_string();
        Box::pin(async move {
            let parsed = Bolt11Invoice::from_str(&invoice)
                .map_err(|e| Error::InvoiceParse(format!("{e}")))?;
            let payment_hash = parsed.payment_hash().to_string();

            let mut invoices = self.invoices.lock().unwrap();
            let entry = invoices
                .get_mut(&payment_hash)
                .ok_or_else(|| Error::PaymentFailed("No route to unknown invoice".into()))?;
            entry.settled_at = Some(Self::now());
            Ok(PaidInvoice {
                preimage: hex::encode(entry.preimage),
            })
        })
    }

    fn lookup_invoice(&self, payment_hash: &str) -> OpFuture<'_, Option<WalletInvoice>> {
        let payment_hash = payment_hash.to_string();
        Box::pin(async move {
            let invoices = self.invoices.lock().unwrap();
            Ok(invoices.get(&payment_hash).map(|entry| WalletInvoice {
                payment_hash: payment_hash.clone(),
                invoice: Some(entry.bolt11.clone()),
                preimage: Some(hex::encode(entry.preimage)),
                amount_msat: entry.amount_msat,
                settled_at: entry.settled_at,
                created_at: entry.created_at,
                expires_at: None,
            }))
        })
    }
}

/// A relay URL with nothing listening behind it.
pub async fn dead_relay_url() -> RelayUrl {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    RelayUrl::parse(&format!("ws://{addr}")).unwrap()
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
