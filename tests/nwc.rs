//! Wallet-connect bridge tests: a scripted NIP-47 wallet service answers
//! requests over the in-process relay.

mod common;

use common::{MockRelay, MockWallet, init_logging};
use expertmarket::wallet::LightningWallet;
use expertmarket::{NwcWallet, RelayPool, SubscriptionItem};
use nostr::nips::nip04;
use nostr::nips::nip47::{
    LookupInvoiceResponse, MakeInvoiceResponse, PayInvoiceResponse, Request, RequestParams,
    Response, ResponseResult,
};
use nostr::{EventBuilder, Filter, JsonUtil, Keys, Kind, Tag};
use std::sync::Arc;
use std::time::Duration;

/// Serve NIP-47 requests against the in-memory wallet backend.
async fn run_wallet_service(
    pool: Arc<RelayPool>,
    relay: nostr::RelayUrl,
    keys: Keys,
    backend: Arc<MockWallet>,
) {
    let filter = Filter::new()
        .kind(Kind::WalletConnectRequest)
        .pubkey(keys.public_key());
    let mut sub = pool.subscribe(vec![filter], &[relay.clone()]).unwrap();

    while let Some(item) = sub.recv().await {
        let SubscriptionItem::Event(event) = item else {
            continue;
        };
        let plaintext =
            match nip04::decrypt(keys.secret_key(), &event.pubkey, &event.content) {
                Ok(plaintext) => plaintext,
                Err(_) => continue,
            };
        let Ok(request) = Request::from_json(plaintext) else {
            continue;
        };

        let result = match request.params {
            RequestParams::MakeInvoice(params) => {
                let invoice = backend
                    .make_invoice(
                        params.amount,
                        params.description.as_deref().unwrap_or_default(),
                        params.expiry,
                    )
                    .await
                    .unwrap();
                ResponseResult::MakeInvoice(MakeInvoiceResponse {
                    invoice: invoice.invoice,
                    payment_hash: invoice.payment_hash,
                })
            }
            RequestParams::PayInvoice(params) => {
                let paid = backend.pay_invoice(&params.invoice, params.amount).await.unwrap();
                ResponseResult::PayInvoice(PayInvoiceResponse {
                    preimage: paid.preimage,
                })
            }
            RequestParams::LookupInvoice(params) => {
                let record = backend
                    .lookup_invoice(params.payment_hash.as_deref().unwrap_or_default())
                    .await
                    .unwrap()
                    .expect("invoice known to the backend");
                ResponseResult::LookupInvoice(LookupInvoiceResponse {
                    transaction_type: None,
                    invoice: record.invoice,
                    description: None,
                    description_hash: None,
                    preimage: record.preimage,
                    payment_hash: record.payment_hash,
                    amount: record.amount_msat,
                    fees_paid: 0,
                    created_at: nostr::Timestamp::from(record.created_at),
                    expires_at: None,
                    settled_at: record.settled_at.map(nostr::Timestamp::from),
                    metadata: None,
                })
            }
            _ => continue,
        };

        let response = Response {
            result_type: request.method,
            error: None,
            result: Some(result),
        };
        let ciphertext =
            nip04::encrypt(keys.secret_key(), &event.pubkey, response.as_json()).unwrap();
        let reply = EventBuilder::new(Kind::WalletConnectResponse, ciphertext)
            .tags([Tag::public_key(event.pubkey), Tag::event(event.id)])
            .sign_with_keys(&keys)
            .unwrap();
        pool.publish(&reply, &[relay.clone()], Duration::from_secs(2))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn nwc_wallet_round_trip() {
    init_logging();
    let relay = MockRelay::start().await;
    let backend = Arc::new(MockWallet::new());
    let service_keys = Keys::generate();

    let service_pool = Arc::new(RelayPool::new());
    tokio::spawn(run_wallet_service(
        service_pool,
        relay.url(),
        service_keys.clone(),
        backend.clone(),
    ));

    let secret = Keys::generate();
    let uri = format!(
        "nostr+walletconnect://{}?relay={}&secret={}",
        service_keys.public_key().to_hex(),
        relay.url(),
        secret.secret_key().to_secret_hex(),
    );

    let pool = Arc::new(RelayPool::new());
    let wallet = NwcWallet::new(&uri, pool)
        .unwrap()
        .with_timeout(Duration::from_secs(5));

    // Issue an invoice through the bridge.
    let invoice = wallet
        .make_invoice(25_000, "bridge test", Some(600))
        .await
        .unwrap();
    assert!(invoice.invoice.starts_with("lnbcrt"));

    // Unpaid yet.
    let record = wallet
        .lookup_invoice(&invoice.payment_hash)
        .await
        .unwrap()
        .unwrap();
    assert!(!record.is_settled());

    // Pay it and observe settlement.
    let paid = wallet.pay_invoice(&invoice.invoice, None).await.unwrap();
    assert_eq!(paid.preimage.len(), 64);

    let record = wallet
        .lookup_invoice(&invoice.payment_hash)
        .await
        .unwrap()
        .unwrap();
    assert!(record.is_settled());
    assert_eq!(record.amount_msat, 25_000);
    assert_eq!(backend.settled_count(), 1);
}
