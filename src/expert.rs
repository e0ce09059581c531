//! Expert runtime: the server side of the protocol engine.
//!
//! One `Expert` instance is a long-running process component owning a
//! stable key pair, a wallet-backed payment coordinator and a set of
//! pluggable callbacks. It bids on matching asks, quotes incoming prompts,
//! verifies payment proofs and streams answers back.

use crate::error::{Error, Result};
use crate::event::{build_event, decrypt, encrypt, recent_cutoff};
use crate::kinds;
use crate::payment::PaymentCoordinator;
use crate::pricing::PriceFeed;
use crate::relay::{RelayPool, SubscriptionItem};
use crate::types::{
    Ask, ExpertBid, ExpertPrice, OpFuture, PaymentMethod, ProfileInfo, Prompt, PromptContent,
    PromptFormat, Proof, Quote, QuoteContent, QuoteInvoice, ReplyChunk, capability_tags,
};
use futures::StreamExt;
use futures::stream::BoxStream;
use nostr::{Event, Filter, JsonUtil, Keys, PublicKey, RelayUrl, Tag};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// The answer produced for a paid prompt.
pub enum ExpertReply {
    /// One complete answer.
    Single(String),
    /// A lazy chunk sequence; each item becomes one reply event.
    Stream(BoxStream<'static, Result<String>>),
}

/// Implementation hooks of an expert.
///
/// Every hook may suspend on I/O (LLM calls, datastore reads). Errors from
/// `on_prompt_price` turn into quote refusals; errors from
/// `on_prompt_paid` terminate the reply stream with an error chunk.
pub trait ExpertCallbacks: Send + Sync {
    /// Decide whether to bid on an ask. `None` ignores it.
    fn on_ask<'a>(&'a self, ask: &'a Ask) -> OpFuture<'a, Option<ExpertBid>>;

    /// Price an incoming prompt.
    fn on_prompt_price<'a>(&'a self, prompt: &'a Prompt) -> OpFuture<'a, ExpertPrice>;

    /// Produce the answer once payment is verified.
    fn on_prompt_paid<'a>(
        &'a self,
        prompt: &'a Prompt,
        quote: &'a Quote,
    ) -> OpFuture<'a, ExpertReply>;
}

/// Expert configuration.
#[derive(Clone)]
pub struct ExpertOptions {
    pub discovery_relays: Vec<RelayUrl>,
    pub prompt_relays: Vec<RelayUrl>,
    /// Hashtags the expert advertises and listens on.
    pub hashtags: Vec<String>,
    pub formats: Vec<PromptFormat>,
    pub methods: Vec<PaymentMethod>,
    pub stream: bool,
    pub profile: ProfileInfo,
    /// Interval between profile recomputations.
    pub profile_refresh: Duration,
    pub publish_timeout: Duration,
    /// Invoice expiry attached to quotes.
    pub quote_expiry_secs: Option<u64>,
    /// Quote publication to proof arrival.
    pub proof_timeout: Duration,
    /// Optional feed for a dynamic pricing line in the profile.
    pub price_feed: Option<Arc<dyn PriceFeed>>,
    /// Model identifier looked up in the price feed.
    pub model: Option<String>,
}

impl Default for ExpertOptions {
    fn default() -> Self {
        Self {
            discovery_relays: Vec::new(),
            prompt_relays: Vec::new(),
            hashtags: Vec::new(),
            formats: vec![PromptFormat::Text, PromptFormat::Openai],
            methods: vec![PaymentMethod::Lightning],
            stream: false,
            profile: ProfileInfo::default(),
            profile_refresh: Duration::from_secs(60),
            publish_timeout: Duration::from_secs(5),
            quote_expiry_secs: Some(600),
            proof_timeout: Duration::from_secs(60),
            price_feed: None,
            model: None,
        }
    }
}

/// Server-side phase of one prompt, used for tracing transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PromptPhase {
    Quoted,
    AwaitingProof,
    VerifyingPayment,
    Answering,
    Done,
    Failed,
    TimedOut,
}

struct ExpertShared {
    keys: Keys,
    pool: Arc<RelayPool>,
    payments: Arc<PaymentCoordinator>,
    callbacks: Arc<dyn ExpertCallbacks>,
    options: ExpertOptions,
    cancel: CancellationToken,
}

/// A running expert. `start`/`stop` are idempotent.
pub struct Expert {
    shared: Arc<ExpertShared>,
    started: AtomicBool,
}

impl Expert {
    pub fn new(
        keys: Keys,
        pool: Arc<RelayPool>,
        payments: Arc<PaymentCoordinator>,
        callbacks: Arc<dyn ExpertCallbacks>,
        options: ExpertOptions,
    ) -> Self {
        Self {
            shared: Arc::new(ExpertShared {
                keys,
                pool,
                payments,
                callbacks,
                options,
                cancel: CancellationToken::new(),
            }),
            started: AtomicBool::new(false),
        }
    }

    pub fn pubkey(&self) -> PublicKey {
        self.shared.keys.public_key()
    }

    /// Publish the profile and open the discovery and prompt
    /// subscriptions.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.shared.options.prompt_relays.is_empty() {
            return Err(Error::Relay("Expert requires at least one prompt relay".into()));
        }

        let mut last_profile = None;
        publish_profile(&self.shared, &mut last_profile).await?;

        let shared = self.shared.clone();
        tokio::spawn(async move { discovery_loop(shared).await });
        let shared = self.shared.clone();
        tokio::spawn(async move { prompt_loop(shared).await });
        let shared = self.shared.clone();
        tokio::spawn(async move { profile_loop(shared, last_profile).await });

        log::info!("Expert {} started", self.pubkey());
        Ok(())
    }

    /// Wind the expert down: all subscriptions close, per-prompt tasks
    /// stop at their next suspension point. Idempotent.
    pub fn stop(&self) {
        if !self.shared.cancel.is_cancelled() {
            log::info!("Expert {} stopping", self.pubkey());
        }
        self.shared.cancel.cancel();
    }
}

impl Drop for Expert {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

/// Build the current profile event, including the dynamic pricing line.
async fn build_profile_event(shared: &ExpertShared) -> Result<Event> {
    let options = &shared.options;
    let mut info = options.profile.clone();
    if let (Some(feed), Some(model)) = (&options.price_feed, &options.model) {
        match feed.model_price(model).await {
            Ok(Some(price)) => {
                if !info.description.is_empty() {
                    info.description.push('\n');
                }
                info.description.push_str(&price.pricing_line(model));
            }
            Ok(None) => {}
            Err(e) => log::warn!("Price feed lookup failed: {e}"),
        }
    }

    let mut tags: Vec<Tag> = options
        .hashtags
        .iter()
        .map(|t| Tag::hashtag(t.clone()))
        .collect();
    tags.extend(capability_tags(
        &options.formats,
        &options.methods,
        options.stream,
        &options.prompt_relays,
    ));
    build_event(
        kinds::EXPERT_PROFILE,
        serde_json::to_string(&info)?,
        tags,
        &shared.keys,
    )
}

/// Publish the profile if it changed since `last` (profile events are
/// replaceable; relays keep the newest per author).
async fn publish_profile(shared: &ExpertShared, last: &mut Option<String>) -> Result<()> {
    let event = build_profile_event(shared).await?;
    let fingerprint = format!("{}|{:?}", event.content, event.tags);
    if last.as_deref() == Some(fingerprint.as_str()) {
        return Ok(());
    }

    let mut relays = shared.options.discovery_relays.clone();
    for url in &shared.options.prompt_relays {
        if !relays.contains(url) {
            relays.push(url.clone());
        }
    }
    shared
        .pool
        .publish(&event, &relays, shared.options.publish_timeout)
        .await?;
    *last = Some(fingerprint);
    Ok(())
}

async fn profile_loop(shared: Arc<ExpertShared>, mut last: Option<String>) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = tokio::time::sleep(shared.options.profile_refresh) => {
                if let Err(e) = publish_profile(&shared, &mut last).await {
                    log::warn!("Profile republish failed: {e}");
                }
            }
        }
    }
}

async fn discovery_loop(shared: Arc<ExpertShared>) {
    if shared.options.discovery_relays.is_empty() || shared.options.hashtags.is_empty() {
        log::debug!("Expert {} not listening for asks", shared.keys.public_key());
        return;
    }
    let filter = Filter::new()
        .kind(kinds::kind(kinds::ASK))
        .hashtags(shared.options.hashtags.clone())
        .since(recent_cutoff());
    let mut sub = match shared
        .pool
        .subscribe(vec![filter], &shared.options.discovery_relays)
    {
        Ok(sub) => sub,
        Err(e) => {
            log::error!("Discovery subscription failed: {e}");
            return;
        }
    };

    loop {
        let item = tokio::select! {
            item = sub.recv() => item,
            _ = shared.cancel.cancelled() => break,
        };
        let event = match item {
            Some(SubscriptionItem::Event(event)) => event,
            Some(SubscriptionItem::EndOfStored(_)) => continue,
            None => break,
        };
        if let Err(e) = handle_ask(&shared, &event).await {
            log::debug!("Ask {} not answered: {e}", event.id);
        }
    }
    sub.close();
}

async fn handle_ask(shared: &Arc<ExpertShared>, event: &Event) -> Result<()> {
    let ask = Ask::from_event(event)?;

    // Skip asks we could never serve.
    let format_ok = ask.formats.is_empty()
        || ask.formats.iter().any(|f| shared.options.formats.contains(f));
    let method_ok = ask.methods.is_empty()
        || ask.methods.iter().any(|m| shared.options.methods.contains(m));
    if !format_ok || !method_ok {
        return Ok(());
    }

    let Some(bid) = shared.callbacks.on_ask(&ask).await? else {
        return Ok(());
    };

    // Inner payload proves the expert's identity to the session-key
    // holder; the throwaway envelope author hides it from everyone else.
    let payload = build_event(
        kinds::BID_PAYLOAD,
        bid.offer,
        capability_tags(
            &shared.options.formats,
            &shared.options.methods,
            shared.options.stream,
            &shared.options.prompt_relays,
        ),
        &shared.keys,
    )?;
    let throwaway = Keys::generate();
    let ciphertext = encrypt(&throwaway, &ask.session_pubkey, &payload.as_json())?;
    let envelope = build_event(
        kinds::BID,
        ciphertext,
        vec![Tag::public_key(ask.session_pubkey), Tag::event(ask.id)],
        &throwaway,
    )?;

    let relays = if ask.relays.is_empty() {
        shared.options.discovery_relays.clone()
    } else {
        ask.relays.clone()
    };
    shared
        .pool
        .publish(&envelope, &relays, shared.options.publish_timeout)
        .await?;
    log::debug!("Bid {} sent for ask {}", envelope.id, ask.id);
    Ok(())
}

async fn prompt_loop(shared: Arc<ExpertShared>) {
    let filter = Filter::new()
        .kind(kinds::kind(kinds::PROMPT))
        .pubkey(shared.keys.public_key())
        .since(recent_cutoff());
    let mut sub = match shared
        .pool
        .subscribe(vec![filter], &shared.options.prompt_relays)
    {
        Ok(sub) => sub,
        Err(e) => {
            log::error!("Prompt subscription failed: {e}");
            return;
        }
    };

    loop {
        let item = tokio::select! {
            item = sub.recv() => item,
            _ = shared.cancel.cancelled() => break,
        };
        let event = match item {
            Some(SubscriptionItem::Event(event)) => event,
            Some(SubscriptionItem::EndOfStored(_)) => continue,
            None => break,
        };
        // Prompts are independent sessions; serve them concurrently.
        let shared = shared.clone();
        tokio::spawn(async move {
            handle_prompt(shared, *event).await;
        });
    }
    sub.close();
}

/// Drive one prompt through quote, proof verification and answering.
async fn handle_prompt(shared: Arc<ExpertShared>, event: Event) {
    let prompt = match decode_prompt(&shared, &event) {
        Ok(prompt) => prompt,
        Err(e) => {
            // Not decryptable by us; drop without a trace on the wire.
            log::debug!("Dropping prompt {}: {e}", event.id);
            return;
        }
    };
    let prompt_id = prompt.id;

    let price = match shared.callbacks.on_prompt_price(&prompt).await {
        Ok(price) => price,
        Err(e) => {
            log::debug!("Prompt {prompt_id} refused: {e}");
            let refusal = QuoteContent {
                invoices: Vec::new(),
                error: Some(e.to_string()),
            };
            let _ = send_quote(&shared, &prompt, &refusal).await;
            return;
        }
    };

    let invoice = match shared
        .payments
        .make_invoice(
            price.amount_sats,
            &price.description,
            shared.options.quote_expiry_secs,
        )
        .await
    {
        Ok(invoice) => invoice,
        Err(e) => {
            log::warn!("Invoice issuance failed for prompt {prompt_id}: {e}");
            let refusal = QuoteContent {
                invoices: Vec::new(),
                error: Some("Invoice issuance failed".to_string()),
            };
            let _ = send_quote(&shared, &prompt, &refusal).await;
            return;
        }
    };

    // Open the proof subscription before the quote goes out.
    let proof_filter = Filter::new()
        .kind(kinds::kind(kinds::PROOF))
        .author(prompt.prompt_pubkey)
        .event(prompt_id)
        .since(recent_cutoff());
    let mut proof_sub = match shared
        .pool
        .subscribe(vec![proof_filter], &shared.options.prompt_relays)
    {
        Ok(sub) => sub,
        Err(e) => {
            log::error!("Proof subscription failed for prompt {prompt_id}: {e}");
            return;
        }
    };

    let content = QuoteContent {
        invoices: vec![QuoteInvoice::lightning(price.amount_sats, &invoice.invoice)],
        error: None,
    };
    if let Err(e) = send_quote(&shared, &prompt, &content).await {
        log::warn!("Quote publish failed for prompt {prompt_id}: {e}");
        return;
    }
    trace_phase(prompt_id, PromptPhase::Quoted);
    trace_phase(prompt_id, PromptPhase::AwaitingProof);

    let proof = match await_proof(&shared, &mut proof_sub).await {
        Ok(Some(proof)) => proof,
        Ok(None) => {
            trace_phase(prompt_id, PromptPhase::TimedOut);
            return;
        }
        Err(Error::Cancelled) => return,
        Err(e) => {
            log::debug!("Proof wait failed for prompt {prompt_id}: {e}");
            trace_phase(prompt_id, PromptPhase::Failed);
            return;
        }
    };
    proof_sub.close();

    trace_phase(prompt_id, PromptPhase::VerifyingPayment);
    if proof.method != PaymentMethod::Lightning {
        log::warn!("Prompt {prompt_id}: unsupported proof method {}", proof.method);
        trace_phase(prompt_id, PromptPhase::Failed);
        return;
    }
    match shared
        .payments
        .verify_payment(&invoice.payment_hash, &proof.preimage)
        .await
    {
        Ok(()) => {}
        Err(Error::PreimageMismatch) => {
            // Invalid proof is fatal; no answer leaves this expert.
            log::warn!("Prompt {prompt_id}: invalid proof (preimage mismatch)");
            trace_phase(prompt_id, PromptPhase::Failed);
            return;
        }
        Err(e) => {
            log::warn!("Prompt {prompt_id}: payment verification failed: {e}");
            trace_phase(prompt_id, PromptPhase::Failed);
            return;
        }
    }

    // Payment verified; only now may the answer generator run.
    trace_phase(prompt_id, PromptPhase::Answering);
    let quote = Quote {
        prompt_id,
        expert_pubkey: shared.keys.public_key(),
        invoices: content.invoices.clone(),
        error: None,
    };
    match shared.callbacks.on_prompt_paid(&prompt, &quote).await {
        Ok(reply) => {
            if let Err(e) = send_reply(&shared, &prompt, reply).await {
                log::warn!("Reply delivery failed for prompt {prompt_id}: {e}");
                trace_phase(prompt_id, PromptPhase::Failed);
                return;
            }
            trace_phase(prompt_id, PromptPhase::Done);
        }
        Err(e) => {
            log::warn!("Answer generation failed for prompt {prompt_id}: {e}");
            let chunk = ReplyChunk {
                index: 0,
                done: true,
                payload: String::new(),
                error: Some("Answer generation failed".to_string()),
            };
            let _ = publish_chunk(&shared, &prompt, &chunk).await;
            trace_phase(prompt_id, PromptPhase::Failed);
        }
    }
}

fn decode_prompt(shared: &ExpertShared, event: &Event) -> Result<Prompt> {
    let plaintext = decrypt(&shared.keys, &event.pubkey, &event.content)?;
    let content: PromptContent = serde_json::from_str(&plaintext)?;
    Ok(Prompt {
        id: event.id,
        prompt_pubkey: event.pubkey,
        expert_pubkey: shared.keys.public_key(),
        format: content.format,
        payload: content.payload,
        created_at: event.created_at,
    })
}

async fn send_quote(
    shared: &ExpertShared,
    prompt: &Prompt,
    content: &QuoteContent,
) -> Result<()> {
    let ciphertext = encrypt(
        &shared.keys,
        &prompt.prompt_pubkey,
        &serde_json::to_string(content)?,
    )?;
    let event = build_event(
        kinds::QUOTE,
        ciphertext,
        vec![Tag::public_key(prompt.prompt_pubkey), Tag::event(prompt.id)],
        &shared.keys,
    )?;
    shared
        .pool
        .publish(&event, &shared.options.prompt_relays, shared.options.publish_timeout)
        .await?;
    Ok(())
}

async fn await_proof(
    shared: &ExpertShared,
    sub: &mut crate::relay::Subscription,
) -> Result<Option<Proof>> {
    let deadline = tokio::time::Instant::now() + shared.options.proof_timeout;
    loop {
        let item = tokio::select! {
            item = sub.recv() => item,
            _ = tokio::time::sleep_until(deadline) => return Ok(None),
            _ = shared.cancel.cancelled() => return Err(Error::Cancelled),
        };
        let event = match item {
            Some(SubscriptionItem::Event(event)) => event,
            Some(SubscriptionItem::EndOfStored(_)) => continue,
            None => return Err(Error::Relay("Proof subscription closed".into())),
        };
        let plaintext = match decrypt(&shared.keys, &event.pubkey, &event.content) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                log::debug!("Undecryptable proof {}: {e}", event.id);
                continue;
            }
        };
        match serde_json::from_str::<Proof>(&plaintext) {
            Ok(proof) => return Ok(Some(proof)),
            Err(e) => log::debug!("Malformed proof {}: {e}", event.id),
        }
    }
}

async fn send_reply(shared: &ExpertShared, prompt: &Prompt, reply: ExpertReply) -> Result<()> {
    match reply {
        ExpertReply::Single(text) => {
            let chunk = ReplyChunk {
                index: 0,
                done: true,
                payload: text,
                error: None,
            };
            publish_chunk(shared, prompt, &chunk).await
        }
        ExpertReply::Stream(mut chunks) => {
            let mut index: u32 = 0;
            loop {
                let next = tokio::select! {
                    next = chunks.next() => next,
                    _ = shared.cancel.cancelled() => return Err(Error::Cancelled),
                };
                match next {
                    Some(Ok(payload)) => {
                        let chunk = ReplyChunk {
                            index,
                            done: false,
                            payload,
                            error: None,
                        };
                        publish_chunk(shared, prompt, &chunk).await?;
                        index += 1;
                    }
                    Some(Err(e)) => {
                        let chunk = ReplyChunk {
                            index,
                            done: true,
                            payload: String::new(),
                            error: Some(e.to_string()),
                        };
                        publish_chunk(shared, prompt, &chunk).await?;
                        return Ok(());
                    }
                    None => {
                        // Exactly one terminal chunk closes the sequence.
                        let chunk = ReplyChunk {
                            index,
                            done: true,
                            payload: String::new(),
                            error: None,
                        };
                        publish_chunk(shared, prompt, &chunk).await?;
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn publish_chunk(
    shared: &ExpertShared,
    prompt: &Prompt,
    chunk: &ReplyChunk,
) -> Result<()> {
    let ciphertext = encrypt(
        &shared.keys,
        &prompt.prompt_pubkey,
        &serde_json::to_string(chunk)?,
    )?;
    let event = build_event(
        kinds::REPLY,
        ciphertext,
        vec![Tag::public_key(prompt.prompt_pubkey), Tag::event(prompt.id)],
        &shared.keys,
    )?;
    shared
        .pool
        .publish(&event, &shared.options.prompt_relays, shared.options.publish_timeout)
        .await?;
    Ok(())
}

fn trace_phase(prompt_id: nostr::EventId, phase: PromptPhase) {
    log::debug!("prompt {prompt_id}: {phase:?}");
}
