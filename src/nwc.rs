//! Nostr Wallet Connect (NIP-47) implementation of the wallet bridge.
//!
//! Requests are NIP-04 encrypted kind-23194 events published to the wallet
//! service's relays; responses come back as kind-23195 events referencing
//! the request.

use crate::error::{Error, Result};
use crate::relay::{RelayPool, SubscriptionItem};
use crate::types::OpFuture;
use crate::wallet::{LightningWallet, NewInvoice, PaidInvoice, WalletInvoice};
use nostr::nips::nip04;
use nostr::nips::nip47::{
    ErrorCode, LookupInvoiceRequest, MakeInvoiceRequest, Method, NostrWalletConnectURI,
    PayInvoiceRequest, Request, RequestParams, Response, ResponseResult,
};
use nostr::{EventBuilder, JsonUtil, Keys, Kind, PublicKey, RelayUrl, Tag};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// A wallet reachable over Nostr Wallet Connect.
pub struct NwcWallet {
    pool: Arc<RelayPool>,
    /// Client-side keys from the connection secret.
    keys: Keys,
    wallet_pubkey: PublicKey,
    relays: Vec<RelayUrl>,
    timeout: Duration,
}

impl NwcWallet {
    /// Build a wallet from a `nostr+walletconnect://` URI, sharing the
    /// process-wide relay pool.
    pub fn new(uri: &str, pool: Arc<RelayPool>) -> Result<Self> {
        let uri = NostrWalletConnectURI::from_str(uri)
            .map_err(|e| Error::Wallet(format!("Invalid wallet connect uri: {e}")))?;
        let relays: Vec<RelayUrl> = uri.relays.clone();
        if relays.is_empty() {
            return Err(Error::Wallet("Wallet connect uri names no relay".into()));
        }
        Ok(Self {
            pool,
            keys: Keys::new(uri.secret.clone()),
            wallet_pubkey: uri.public_key,
            relays,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Override the per-request response timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send one request and wait for the matching response.
    async fn request(&self, request: Request) -> Result<ResponseResult> {
        let plaintext = request.as_json();
        let ciphertext = nip04::encrypt(self.keys.secret_key(), &self.wallet_pubkey, plaintext)
            .map_err(|e| Error::Wallet(format!("Request encryption failed: {e}")))?;

        let event = EventBuilder::new(Kind::WalletConnectRequest, ciphertext)
            .tags([Tag::public_key(self.wallet_pubkey)])
            .sign_with_keys(&self.keys)
            .map_err(|e| Error::Wallet(format!("Failed to sign request: {e}")))?;

        // Subscribe before publishing so the response cannot race past us.
        let filter = nostr::Filter::new()
            .kind(Kind::WalletConnectResponse)
            .author(self.wallet_pubkey)
            .event(event.id);
        let mut sub = self.pool.subscribe(vec![filter], &self.relays)?;

        self.pool
            .publish(&event, &self.relays, PUBLISH_TIMEOUT)
            .await?;

        let deadline = tokio::time::Instant::now() + self.timeout;
        let response_event = loop {
            let item = tokio::select! {
                item = sub.recv() => item,
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(Error::Timeout("waiting for wallet response".into()));
                }
            };
            match item {
                Some(SubscriptionItem::Event(event)) => break event,
                Some(SubscriptionItem::EndOfStored(_)) => continue,
                None => return Err(Error::Wallet("Wallet subscription closed".into())),
            }
        };

        let plaintext = nip04::decrypt(
            self.keys.secret_key(),
            &self.wallet_pubkey,
            &response_event.content,
        )
        .map_err(|e| Error::Decrypt(format!("Wallet response: {e}")))?;
        let response = Response::from_json(plaintext)
            .map_err(|e| Error::Wallet(format!("Malformed wallet response: {e}")))?;

        if let Some(err) = response.error {
            return Err(map_nip47_error(err.code, err.message));
        }
        response
            .result
            .ok_or_else(|| Error::Wallet("Wallet response carries no result".into()))
    }
}

fn map_nip47_error(code: ErrorCode, message: String) -> Error {
    match code {
        ErrorCode::PaymentFailed => Error::PaymentFailed(message),
        ErrorCode::NotFound => Error::InvoiceNotFound(message),
        ErrorCode::RateLimited | ErrorCode::Internal => Error::PaymentNetwork(message),
        _ => Error::Wallet(message),
    }
}

impl LightningWallet for NwcWallet {
    fn make_invoice(
        &self,
        amount_msat: u64,
        description: &str,
        expiry_secs: Option<u64>,
    ) -> OpFuture<'_, NewInvoice> {
        let description = description.to_string();
        Box::pin(async move {
            let result = self
                .request(Request {
                    method: Method::MakeInvoice,
                    params: RequestParams::MakeInvoice(MakeInvoiceRequest {
                        amount: amount_msat,
                        description: Some(description),
                        description_hash: None,
                        expiry: expiry_secs,
                    }),
                })
                .await?;
            match result {
                ResponseResult::MakeInvoice(r) => Ok(NewInvoice {
                    invoice: r.invoice,
                    payment_hash: r.payment_hash,
                }),
                _ => Err(Error::Wallet("Unexpected make_invoice result".into())),
            }
        })
    }

    fn pay_invoice(&self, invoice: &str, amount_msat: Option<u64>) -> OpFuture<'_, PaidInvoice> {
        let invoice = invoice.to_string();
        Box::pin(async move {
            let result = self
                .request(Request {
                    method: Method::PayInvoice,
                    params: RequestParams::PayInvoice(PayInvoiceRequest {
                        id: None,
                        invoice,
                        amount: amount_msat,
                    }),
                })
                .await?;
            match result {
                ResponseResult::PayInvoice(r) => Ok(PaidInvoice {
                    preimage: r.preimage,
                }),
                _ => Err(Error::Wallet("Unexpected pay_invoice result".into())),
            }
        })
    }

    fn lookup_invoice(&self, payment_hash: &str) -> OpFuture<'_, Option<WalletInvoice>> {
        let payment_hash = payment_hash.to_string();
        Box::pin(async move {
            let result = self
                .request(Request {
                    method: Method::LookupInvoice,
                    params: RequestParams::LookupInvoice(LookupInvoiceRequest {
                        payment_hash: Some(payment_hash),
                        invoice: None,
                    }),
                })
                .await;
            let result = match result {
                Ok(result) => result,
                // A missing record is a regular outcome, not a failure.
                Err(Error::InvoiceNotFound(_)) => return Ok(None),
                Err(e) => return Err(e),
            };
            match result {
                ResponseResult::LookupInvoice(r) => Ok(Some(WalletInvoice {
                    payment_hash: r.payment_hash,
                    invoice: r.invoice,
                    preimage: r.preimage,
                    amount_msat: r.amount,
                    settled_at: r.settled_at.map(|t| t.as_u64()),
                    created_at: r.created_at.as_u64(),
                    expires_at: r.expires_at.map(|t| t.as_u64()),
                })),
                _ => Err(Error::Wallet("Unexpected lookup_invoice result".into())),
            }
        })
    }
}
