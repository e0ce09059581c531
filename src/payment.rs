//! Payment coordinator: invoice issuance, bounded-concurrency payment
//! dispatch and proof-of-payment verification.
//!
//! The coordinator is shared by every expert backed by the same wallet;
//! its in-flight semaphore is the only payment mutex.

use crate::error::{Error, Result};
use crate::wallet::{LightningWallet, NewInvoice};
use lightning_invoice::Bolt11Invoice;
use sha2::{Digest, Sha256};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Coordinator tuning knobs.
#[derive(Debug, Clone)]
pub struct PaymentConfig {
    /// Maximum concurrently in-flight `pay_invoice` calls.
    pub max_in_flight: usize,
    /// Extra wallet lookups tolerated while an invoice is unsettled.
    pub unsettled_retries: u32,
    /// Base backoff between unsettled lookups (doubles per attempt).
    pub retry_backoff: Duration,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 5,
            unsettled_retries: 3,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

/// Fields extracted from a BOLT11 invoice string.
#[derive(Debug, Clone)]
pub struct ParsedInvoice {
    /// Hex-encoded payment hash.
    pub payment_hash: String,
    pub amount_msat: Option<u64>,
}

/// Shared payment dispatcher over a [`LightningWallet`].
pub struct PaymentCoordinator {
    wallet: Arc<dyn LightningWallet>,
    permits: Semaphore,
    config: PaymentConfig,
    in_flight: AtomicUsize,
}

impl PaymentCoordinator {
    pub fn new(wallet: Arc<dyn LightningWallet>, config: PaymentConfig) -> Self {
        let permits = Semaphore::new(config.max_in_flight);
        Self {
            wallet,
            permits,
            config,
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_defaults(wallet: Arc<dyn LightningWallet>) -> Self {
        Self::new(wallet, PaymentConfig::default())
    }

    /// Currently in-flight outgoing payments.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Issue an invoice for `amount_sats`.
    pub async fn make_invoice(
        &self,
        amount_sats: u64,
        description: &str,
        expiry_secs: Option<u64>,
    ) -> Result<NewInvoice> {
        self.wallet
            .make_invoice(amount_sats * 1000, description, expiry_secs)
            .await
    }

    /// Pay a BOLT11 invoice and return the hex preimage.
    ///
    /// At most `max_in_flight` payments run concurrently; excess callers
    /// queue in arrival order (the semaphore is fair). An in-flight payment
    /// is never abandoned once the wallet call started.
    pub async fn pay_invoice(&self, invoice: &str) -> Result<String> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::Cancelled)?;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = self.wallet.pay_invoice(invoice, None).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(result?.preimage)
    }

    /// Parse a BOLT11 string into the fields the protocol needs.
    pub fn parse_invoice(invoice: &str) -> Result<ParsedInvoice> {
        let parsed = Bolt11Invoice::from_str(invoice)
            .map_err(|e| Error::InvoiceParse(format!("{e}")))?;
        Ok(ParsedInvoice {
            payment_hash: parsed.payment_hash().to_string(),
            amount_msat: parsed.amount_milli_satoshis(),
        })
    }

    /// Verify a proof of payment.
    ///
    /// Checks, in order: (a) the preimage hashes to `payment_hash` (pure
    /// computation, fails fast), then (b) the wallet backend records the
    /// invoice with a non-zero settlement time. Unsettled lookups are
    /// retried a bounded number of times with doubling backoff.
    pub async fn verify_payment(&self, payment_hash: &str, preimage: &str) -> Result<()> {
        let preimage_bytes = hex::decode(preimage).map_err(|_| Error::PreimageMismatch)?;
        if preimage_bytes.len() != 32 {
            return Err(Error::PreimageMismatch);
        }
        let digest = Sha256::digest(&preimage_bytes);
        if hex::encode(digest) != payment_hash.to_lowercase() {
            return Err(Error::PreimageMismatch);
        }

        let mut backoff = self.config.retry_backoff;
        for attempt in 0..=self.config.unsettled_retries {
            match self.wallet.lookup_invoice(payment_hash).await {
                Ok(None) => {
                    return Err(Error::InvoiceNotFound(payment_hash.to_string()));
                }
                Ok(Some(record)) if record.is_settled() => return Ok(()),
                Ok(Some(_)) => {
                    log::debug!(
                        "Invoice {payment_hash} not settled yet (attempt {})",
                        attempt + 1
                    );
                }
                Err(e) if e.is_transient() => {
                    log::debug!("Wallet lookup failed transiently: {e}");
                }
                Err(e) => return Err(e),
            }
            if attempt < self.config.unsettled_retries {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
        Err(Error::InvoiceUnsettled(payment_hash.to_string()))
    }
}
