//! Lightning wallet bridge.
//!
//! The payment coordinator depends only on the three operations below. The
//! production implementation is Nostr Wallet Connect ([`crate::nwc`]);
//! tests inject an in-memory wallet.

use crate::types::OpFuture;
use serde::{Deserialize, Serialize};

/// A freshly issued invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInvoice {
    /// BOLT11 invoice string.
    pub invoice: String,
    /// Hex-encoded payment hash.
    pub payment_hash: String,
}

/// Result of paying an invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaidInvoice {
    /// Hex-encoded 32-byte preimage.
    pub preimage: String,
}

/// An invoice as recorded by the wallet backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletInvoice {
    pub payment_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preimage: Option<String>,
    pub amount_msat: u64,
    /// Unix seconds of settlement; `None` while unpaid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<u64>,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl WalletInvoice {
    /// Whether the wallet observed settlement.
    pub fn is_settled(&self) -> bool {
        self.settled_at.is_some_and(|t| t > 0)
    }
}

/// The three wallet operations the core depends on.
pub trait LightningWallet: Send + Sync {
    /// Create an invoice for `amount_msat` with the given description.
    fn make_invoice(
        &self,
        amount_msat: u64,
        description: &str,
        expiry_secs: Option<u64>,
    ) -> OpFuture<'_, NewInvoice>;

    /// Pay a BOLT11 invoice, returning the preimage.
    ///
    /// `amount_msat` overrides the invoice amount for zero-amount invoices.
    fn pay_invoice(&self, invoice: &str, amount_msat: Option<u64>) -> OpFuture<'_, PaidInvoice>;

    /// Look up an invoice by payment hash.
    ///
    /// Returns `Ok(None)` when the wallet has no record of it.
    fn lookup_invoice(&self, payment_hash: &str) -> OpFuture<'_, Option<WalletInvoice>>;
}
