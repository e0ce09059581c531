//! Error types for the expertmarket crate.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur across the protocol engine, relay transport,
/// payment coordinator and scheduler.
#[derive(Error, Debug)]
pub enum Error {
    /// An event could not be built or signed.
    #[error("Event error: {0}")]
    Event(String),

    /// An encrypted payload failed to decrypt or authenticate.
    #[error("Decrypt error: {0}")]
    Decrypt(String),

    /// Relay-level failure (connect, send, protocol).
    #[error("Relay error: {0}")]
    Relay(String),

    /// A publish was acknowledged by zero relays.
    #[error("Publish not acknowledged by any relay: {0}")]
    RelayPublishEmpty(String),

    /// A protocol phase deadline elapsed.
    #[error("Timeout while {0}")]
    Timeout(String),

    /// The counterparty violated the protocol (bad reference, bad payload).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The quote was rejected by the quote handler.
    #[error("Quote rejected: {0}")]
    QuoteRejected(String),

    /// A BOLT11 invoice string could not be parsed.
    #[error("Invalid invoice: {0}")]
    InvoiceParse(String),

    /// Transient payment-network failure; the caller may retry.
    #[error("Payment network error: {0}")]
    PaymentNetwork(String),

    /// The wallet has no record of the invoice.
    #[error("Invoice not found: {0}")]
    InvoiceNotFound(String),

    /// The wallet records the invoice but it is not settled.
    #[error("Invoice not settled: {0}")]
    InvoiceUnsettled(String),

    /// The supplied preimage does not hash to the invoice's payment hash.
    #[error("Preimage does not match payment hash")]
    PreimageMismatch,

    /// A proof of payment was rejected.
    #[error("Invalid payment proof: {0}")]
    InvalidProof(String),

    /// An outgoing payment failed.
    #[error("Payment failed: {0}")]
    PaymentFailed(String),

    /// The per-expert budget cannot cover the quoted amount.
    #[error("Budget exceeded: {required} sats required, {available} sats available")]
    BudgetExceeded { required: u64, available: u64 },

    /// The operation was cancelled externally.
    #[error("Operation cancelled")]
    Cancelled,

    /// Wallet bridge failure.
    #[error("Wallet error: {0}")]
    Wallet(String),

    /// Scheduler control-plane failure.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Parse error.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Generic error with context.
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(format!("{:#}", err))
    }
}

impl Error {
    /// Whether a payment-verification failure is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::PaymentNetwork(_) | Error::InvoiceUnsettled(_))
    }
}
