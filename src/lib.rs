//! expertmarket - Decentralized Expert Q&A Marketplace
//!
//! A client and server SDK for a question-answer marketplace carried over
//! Nostr relays, with per-question payment settled over Lightning.
//!
//! The pieces compose bottom-up: signed events with authenticated
//! encryption ([`event`]), a shared relay pool ([`relay`]), the five-phase
//! ask/bid/prompt/quote/reply engine ([`client`] and [`expert`]), a
//! bounded-concurrency payment coordinator over a pluggable wallet bridge
//! ([`payment`], [`wallet`], [`nwc`]), and a control plane distributing
//! experts across worker processes ([`scheduler`], [`worker`]).
//!
//! # Example
//!
//! ```rust,ignore
//! use expertmarket::{AskClient, ClientOptions, FindExpertsOptions, RelayPool};
//!
//! let pool = Arc::new(RelayPool::new());
//! let client = AskClient::new(pool, ClientOptions { discovery_relays, ..Default::default() });
//!
//! // Discover experts under a throwaway session key
//! let bids = client.find_experts("lightning question", &hashtags, Default::default()).await?;
//!
//! // Ask the best bid, paying its quote through the coordinator
//! let replies = client.ask_expert(params).await?;
//! let answer = replies.collect_text().await?;
//! ```

pub mod client;
pub mod error;
pub mod event;
pub mod expert;
pub mod kinds;
pub mod nwc;
pub mod payment;
pub mod pricing;
pub mod relay;
pub mod scheduler;
pub mod smart;
pub mod types;
pub mod wallet;
pub mod worker;

pub use client::{
    AskClient, AskExpertParams, AskTarget, BudgetPayer, ClientOptions, FindExpertsOptions,
    QuoteHandler, RefuseAll, Replies,
};
pub use error::{Error, Result};
pub use expert::{Expert, ExpertCallbacks, ExpertOptions, ExpertReply};
pub use nwc::NwcWallet;
pub use payment::{PaymentConfig, PaymentCoordinator};
pub use pricing::{HttpPriceFeed, ModelPrice, PriceFeed, StaticPriceFeed};
pub use relay::{RelayPool, Subscription, SubscriptionItem};
pub use scheduler::{
    ExpertRecord, ExpertState, Scheduler, SchedulerConfig, SchedulerMessage, SchedulerSnapshot,
    WorkerMessage,
};
pub use smart::{ChatCompletion, ExpertAnswer, SmartClient, SmartClientOptions};
pub use types::{
    Ask, Bid, ChatMessage, ExpertBid, ExpertPrice, ExpertProfile, OpFuture, PaymentMethod,
    ProfileInfo, Prompt, PromptFormat, PromptPayload, Proof, Quote, QuoteInvoice, ReplyChunk,
};
pub use wallet::{LightningWallet, NewInvoice, PaidInvoice, WalletInvoice};
pub use worker::{ExpertFactory, RunningExpert, Worker, WorkerOptions};
