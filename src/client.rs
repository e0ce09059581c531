//! Client side of the protocol engine: expert discovery, prompting,
//! quote handling and reply streaming.
//!
//! Each discovery session and each prompt runs under its own throwaway
//! key pair, so nothing on the wire links back to the human user.

use crate::error::{Error, Result};
use crate::event::{build_event, decrypt, encrypt, recent_cutoff};
use crate::kinds;
use crate::payment::PaymentCoordinator;
use crate::relay::{RelayPool, Subscription, SubscriptionItem};
use crate::types::{
    Bid, ExpertProfile, OpFuture, PaymentMethod, PromptContent, PromptFormat, PromptPayload,
    Proof, Quote, QuoteContent, ReplyChunk, capability_tags,
};
use nostr::{Event, EventId, Filter, JsonUtil, Keys, PublicKey, RelayUrl, Tag};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Capacity of the reply channel; carries backpressure for streamed answers.
const REPLY_CHANNEL_CAPACITY: usize = 32;

/// Client-side timeouts and relay selection. All fields overridable.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Relays asks are published to and profiles are fetched from.
    pub discovery_relays: Vec<RelayUrl>,
    pub publish_timeout: Duration,
    pub query_timeout: Duration,
    /// Hard deadline for bid collection.
    pub bid_window: Duration,
    /// Early close once this much time passed after the first bid.
    pub bid_grace: Duration,
    /// Prompt publication to quote arrival.
    pub quote_timeout: Duration,
    /// Proof publication to first reply chunk.
    pub first_reply_timeout: Duration,
    /// Maximum gap between consecutive reply chunks.
    pub reply_gap_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            discovery_relays: Vec::new(),
            publish_timeout: Duration::from_secs(5),
            query_timeout: Duration::from_secs(5),
            bid_window: Duration::from_secs(5),
            bid_grace: Duration::from_secs(5),
            quote_timeout: Duration::from_secs(30),
            first_reply_timeout: Duration::from_secs(60),
            reply_gap_timeout: Duration::from_secs(30),
        }
    }
}

/// Options for one discovery session.
#[derive(Debug, Clone, Default)]
pub struct FindExpertsOptions {
    /// Accepted prompt formats; empty means text only.
    pub formats: Vec<PromptFormat>,
    /// Accepted payment methods; empty means lightning only.
    pub methods: Vec<PaymentMethod>,
    /// Whether streamed replies are acceptable.
    pub stream: bool,
    /// Discovery relays overriding the client defaults.
    pub relays: Option<Vec<RelayUrl>>,
    pub cancel: Option<CancellationToken>,
}

/// Who a prompt is sent to: a bid from discovery or a known profile.
#[derive(Debug, Clone)]
pub enum AskTarget {
    Bid(Bid),
    Profile(ExpertProfile),
}

impl AskTarget {
    pub fn expert_pubkey(&self) -> PublicKey {
        match self {
            AskTarget::Bid(bid) => bid.expert_pubkey,
            AskTarget::Profile(profile) => profile.pubkey,
        }
    }

    fn relays(&self) -> &[RelayUrl] {
        match self {
            AskTarget::Bid(bid) => &bid.relays,
            AskTarget::Profile(profile) => &profile.prompt_relays,
        }
    }

    fn formats(&self) -> &[PromptFormat] {
        match self {
            AskTarget::Bid(bid) => &bid.formats,
            AskTarget::Profile(profile) => &profile.formats,
        }
    }
}

/// Parameters for one `ask_expert` call.
pub struct AskExpertParams {
    pub target: AskTarget,
    pub content: PromptPayload,
    /// Explicit format; defaults to the first mutually workable one.
    pub format: Option<PromptFormat>,
    pub handler: Arc<dyn QuoteHandler>,
    pub cancel: Option<CancellationToken>,
}

/// Decides whether to accept a quote and performs the payment.
pub trait QuoteHandler: Send + Sync {
    /// Accept or decline the quote. Errors abort the session.
    fn on_quote<'a>(&'a self, quote: &'a Quote) -> OpFuture<'a, bool>;

    /// Settle an accepted quote, returning the proof of payment.
    fn on_pay<'a>(&'a self, quote: &'a Quote) -> OpFuture<'a, Proof>;
}

/// Default-accept handler: pays lightning quotes up to a budget through
/// the shared payment coordinator.
pub struct BudgetPayer {
    payments: Arc<PaymentCoordinator>,
    max_amount_sats: u64,
}

impl BudgetPayer {
    pub fn new(payments: Arc<PaymentCoordinator>, max_amount_sats: u64) -> Self {
        Self {
            payments,
            max_amount_sats,
        }
    }
}

impl QuoteHandler for BudgetPayer {
    fn on_quote<'a>(&'a self, quote: &'a Quote) -> OpFuture<'a, bool> {
        Box::pin(async move {
            let entry = quote
                .lightning_invoice()
                .ok_or_else(|| Error::Protocol("Quote carries no lightning invoice".into()))?;
            let bolt11 = entry.invoice.as_deref().unwrap_or_default();
            let parsed = PaymentCoordinator::parse_invoice(bolt11)?;
            if let Some(amount_msat) = parsed.amount_msat {
                if amount_msat != entry.amount * 1000 {
                    return Err(Error::Protocol(format!(
                        "Invoice amount {amount_msat} msat contradicts quoted {} sats",
                        entry.amount
                    )));
                }
            }
            if entry.amount > self.max_amount_sats {
                return Err(Error::BudgetExceeded {
                    required: entry.amount,
                    available: self.max_amount_sats,
                });
            }
            Ok(true)
        })
    }

    fn on_pay<'a>(&'a self, quote: &'a Quote) -> OpFuture<'a, Proof> {
        Box::pin(async move {
            let entry = quote
                .lightning_invoice()
                .ok_or_else(|| Error::Protocol("Quote carries no lightning invoice".into()))?;
            let bolt11 = entry
                .invoice
                .clone()
                .ok_or_else(|| Error::Protocol("Lightning entry without invoice".into()))?;
            let preimage = self.payments.pay_invoice(&bolt11).await?;
            Ok(Proof {
                method: PaymentMethod::Lightning,
                preimage,
            })
        })
    }
}

/// Default-refuse sentinel: declines every quote.
pub struct RefuseAll;

impl QuoteHandler for RefuseAll {
    fn on_quote<'a>(&'a self, _quote: &'a Quote) -> OpFuture<'a, bool> {
        Box::pin(async { Ok(false) })
    }

    fn on_pay<'a>(&'a self, _quote: &'a Quote) -> OpFuture<'a, Proof> {
        Box::pin(async { Err(Error::QuoteRejected("refuse-all handler".into())) })
    }
}

/// The protocol engine's client face.
pub struct AskClient {
    pool: Arc<RelayPool>,
    options: ClientOptions,
}

impl AskClient {
    pub fn new(pool: Arc<RelayPool>, options: ClientOptions) -> Self {
        Self { pool, options }
    }

    pub fn pool(&self) -> &Arc<RelayPool> {
        &self.pool
    }

    /// Publish an ask under a fresh session key and collect bids.
    ///
    /// Collection runs until the hard window elapses, closing early once
    /// `bid_grace` passed after the first bid. Zero bids is an empty list,
    /// not an error. The session key is destroyed on return.
    pub async fn find_experts(
        &self,
        summary: &str,
        hashtags: &[String],
        opts: FindExpertsOptions,
    ) -> Result<Vec<Bid>> {
        let relays = opts
            .relays
            .clone()
            .unwrap_or_else(|| self.options.discovery_relays.clone());
        if relays.is_empty() {
            return Err(Error::Relay("No discovery relays configured".into()));
        }
        let formats = if opts.formats.is_empty() {
            vec![PromptFormat::Text]
        } else {
            opts.formats.clone()
        };
        let methods = if opts.methods.is_empty() {
            vec![PaymentMethod::Lightning]
        } else {
            opts.methods.clone()
        };
        let cancel = opts.cancel.clone().unwrap_or_default();

        let session = Keys::generate();
        let session_pubkey = session.public_key();

        let mut tags: Vec<Tag> = hashtags.iter().map(|t| Tag::hashtag(t.clone())).collect();
        tags.extend(capability_tags(&formats, &methods, opts.stream, &relays));
        let ask_event = build_event(kinds::ASK, summary, tags, &session)?;

        // Subscribe before publishing so no bid can slip past.
        let filter = Filter::new()
            .kind(kinds::kind(kinds::BID))
            .pubkey(session_pubkey)
            .since(recent_cutoff());
        let mut sub = self.pool.subscribe(vec![filter], &relays)?;

        self.pool
            .publish(&ask_event, &relays, self.options.publish_timeout)
            .await?;

        let hard_deadline = tokio::time::Instant::now() + self.options.bid_window;
        let mut deadline = hard_deadline;
        let mut bids: Vec<Bid> = Vec::new();
        let mut seen: HashSet<(PublicKey, EventId)> = HashSet::new();

        loop {
            let item = tokio::select! {
                item = sub.recv() => item,
                _ = tokio::time::sleep_until(deadline) => break,
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            };
            let envelope = match item {
                Some(SubscriptionItem::Event(envelope)) => envelope,
                Some(SubscriptionItem::EndOfStored(_)) => continue,
                None => break,
            };
            match decode_bid(&session, &ask_event.id, &envelope) {
                Ok(bid) => {
                    if seen.insert((bid.expert_pubkey, bid.id)) {
                        if bids.is_empty() {
                            let grace = tokio::time::Instant::now() + self.options.bid_grace;
                            deadline = grace.min(hard_deadline);
                        }
                        bids.push(bid);
                    }
                }
                // Undecryptable or malformed bids are dropped silently.
                Err(e) => log::debug!("Ignoring bid {}: {e}", envelope.id),
            }
        }
        sub.close();

        Ok(bids)
    }

    /// Fetch the latest profile of each listed expert.
    pub async fn fetch_experts(
        &self,
        pubkeys: &[PublicKey],
        relays: Option<&[RelayUrl]>,
    ) -> Result<Vec<ExpertProfile>> {
        let relays = relays.unwrap_or(&self.options.discovery_relays);
        if relays.is_empty() {
            return Err(Error::Relay("No relays to fetch profiles from".into()));
        }
        let filter = Filter::new()
            .kind(kinds::kind(kinds::EXPERT_PROFILE))
            .authors(pubkeys.iter().copied());
        let events = self
            .pool
            .query(filter, relays, self.options.query_timeout)
            .await?;

        let mut latest: HashMap<PublicKey, Event> = HashMap::new();
        for event in events {
            match latest.get(&event.pubkey) {
                Some(existing) if existing.created_at >= event.created_at => {}
                _ => {
                    latest.insert(event.pubkey, event);
                }
            }
        }
        let mut profiles = Vec::with_capacity(latest.len());
        for event in latest.into_values() {
            match ExpertProfile::from_event(&event) {
                Ok(profile) => profiles.push(profile),
                Err(e) => log::debug!("Skipping malformed profile {}: {e}", event.id),
            }
        }
        Ok(profiles)
    }

    /// Run one paid question against one expert.
    ///
    /// Publishes the prompt under a fresh prompt key, waits for the first
    /// quote (later quotes for the same prompt are dropped), lets the
    /// handler accept and pay, publishes the proof, and returns the reply
    /// stream.
    pub async fn ask_expert(&self, params: AskExpertParams) -> Result<Replies> {
        let expert_pubkey = params.target.expert_pubkey();
        let relays: Vec<RelayUrl> = params.target.relays().to_vec();
        if relays.is_empty() {
            return Err(Error::Relay("Target lists no prompt relays".into()));
        }
        let format = match params.format {
            Some(format) => {
                let supported = params.target.formats();
                if !supported.is_empty() && !supported.contains(&format) {
                    return Err(Error::Protocol(format!(
                        "Expert does not accept format {format}"
                    )));
                }
                format
            }
            None => params
                .target
                .formats()
                .first()
                .cloned()
                .unwrap_or(PromptFormat::Text),
        };
        let cancel = params.cancel.clone().unwrap_or_default();

        let prompt_keys = Keys::generate();
        let content = PromptContent {
            format,
            payload: params.content.clone(),
        };
        let ciphertext = encrypt(&prompt_keys, &expert_pubkey, &serde_json::to_string(&content)?)?;
        let prompt_event = build_event(
            kinds::PROMPT,
            ciphertext,
            vec![Tag::public_key(expert_pubkey)],
            &prompt_keys,
        )?;
        let prompt_id = prompt_event.id;

        // One subscription covers the quote and the replies.
        let filter = Filter::new()
            .kinds([kinds::kind(kinds::QUOTE), kinds::kind(kinds::REPLY)])
            .author(expert_pubkey)
            .event(prompt_id)
            .since(recent_cutoff());
        let mut sub = self.pool.subscribe(vec![filter], &relays)?;

        self.pool
            .publish(&prompt_event, &relays, self.options.publish_timeout)
            .await?;

        // Phase 4: first quote wins.
        let quote = self
            .await_quote(&mut sub, &prompt_keys, &expert_pubkey, prompt_id, &cancel)
            .await?;
        if let Some(reason) = &quote.error {
            return Err(Error::Protocol(format!("Expert declined: {reason}")));
        }

        if !params.handler.on_quote(&quote).await? {
            return Err(Error::QuoteRejected(format!(
                "Quote for prompt {prompt_id} declined by handler"
            )));
        }
        let proof = params.handler.on_pay(&quote).await?;
        let amount_paid = quote
            .lightning_invoice()
            .map(|entry| entry.amount)
            .unwrap_or_default();

        let proof_ciphertext =
            encrypt(&prompt_keys, &expert_pubkey, &serde_json::to_string(&proof)?)?;
        let proof_event = build_event(
            kinds::PROOF,
            proof_ciphertext,
            vec![Tag::public_key(expert_pubkey), Tag::event(prompt_id)],
            &prompt_keys,
        )?;
        self.pool
            .publish(&proof_event, &relays, self.options.publish_timeout)
            .await?;

        // Phase 5: stream replies until the terminal chunk.
        let (tx, rx) = mpsc::channel(REPLY_CHANNEL_CAPACITY);
        let reader = ReplyReader {
            sub,
            prompt_keys,
            expert_pubkey,
            first_timeout: self.options.first_reply_timeout,
            gap_timeout: self.options.reply_gap_timeout,
            cancel: cancel.clone(),
        };
        tokio::spawn(reader.run(tx));

        Ok(Replies {
            expert_pubkey,
            prompt_id,
            amount_paid,
            rx,
            cancel,
        })
    }

    async fn await_quote(
        &self,
        sub: &mut Subscription,
        prompt_keys: &Keys,
        expert_pubkey: &PublicKey,
        prompt_id: EventId,
        cancel: &CancellationToken,
    ) -> Result<Quote> {
        let deadline = tokio::time::Instant::now() + self.options.quote_timeout;
        loop {
            let item = tokio::select! {
                item = sub.recv() => item,
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(Error::Timeout("waiting for quote".into()));
                }
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            };
            let event = match item {
                Some(SubscriptionItem::Event(event)) => event,
                Some(SubscriptionItem::EndOfStored(_)) => continue,
                None => return Err(Error::Relay("Subscription closed".into())),
            };
            if event.kind != kinds::kind(kinds::QUOTE) {
                continue;
            }
            match decode_quote(prompt_keys, expert_pubkey, prompt_id, &event) {
                Ok(quote) => return Ok(quote),
                Err(e) => log::debug!("Ignoring quote {}: {e}", event.id),
            }
        }
    }
}

fn decode_bid(session: &Keys, ask_id: &EventId, envelope: &Event) -> Result<Bid> {
    let plaintext = decrypt(session, &envelope.pubkey, &envelope.content)?;
    let payload = Event::from_json(&plaintext)
        .map_err(|e| Error::Protocol(format!("Bid payload is not an event: {e}")))?;
    if payload.verify().is_err() {
        return Err(Error::Protocol("Bid payload signature invalid".into()));
    }
    let bid = Bid::from_events(envelope, &payload)?;
    if bid.ask_id != *ask_id {
        return Err(Error::Protocol("Bid references a different ask".into()));
    }
    Ok(bid)
}

fn decode_quote(
    prompt_keys: &Keys,
    expert_pubkey: &PublicKey,
    prompt_id: EventId,
    event: &Event,
) -> Result<Quote> {
    let plaintext = decrypt(prompt_keys, expert_pubkey, &event.content)?;
    let content: QuoteContent = serde_json::from_str(&plaintext)?;
    Ok(Quote {
        prompt_id,
        expert_pubkey: *expert_pubkey,
        invoices: content.invoices,
        error: content.error,
    })
}

/// Reads reply events off the subscription, reorders chunks into a
/// contiguous sequence and forwards them through the bounded channel.
struct ReplyReader {
    sub: Subscription,
    prompt_keys: Keys,
    expert_pubkey: PublicKey,
    first_timeout: Duration,
    gap_timeout: Duration,
    cancel: CancellationToken,
}

impl ReplyReader {
    async fn run(mut self, tx: mpsc::Sender<Result<ReplyChunk>>) {
        let mut next_index: u32 = 0;
        let mut pending: BTreeMap<u32, ReplyChunk> = BTreeMap::new();
        let mut deadline = tokio::time::Instant::now() + self.first_timeout;

        'outer: loop {
            let item = tokio::select! {
                item = self.sub.recv() => item,
                _ = tokio::time::sleep_until(deadline) => {
                    let _ = tx.send(Err(Error::Timeout("waiting for reply chunk".into()))).await;
                    break;
                }
                _ = self.cancel.cancelled() => {
                    let _ = tx.send(Err(Error::Cancelled)).await;
                    break;
                }
            };
            let event = match item {
                Some(SubscriptionItem::Event(event)) => event,
                Some(SubscriptionItem::EndOfStored(_)) => continue,
                None => break,
            };
            if event.kind != kinds::kind(kinds::REPLY) {
                // A second quote for the same prompt: dropped by design.
                log::debug!("Dropping duplicate quote {}", event.id);
                continue;
            }
            let chunk = match self.decode_chunk(&event) {
                Ok(chunk) => chunk,
                Err(e) => {
                    log::debug!("Ignoring reply {}: {e}", event.id);
                    continue;
                }
            };
            if chunk.index < next_index || pending.contains_key(&chunk.index) {
                // Duplicate chunk index: the first one won.
                continue;
            }
            pending.insert(chunk.index, chunk);
            deadline = tokio::time::Instant::now() + self.gap_timeout;

            while let Some(chunk) = pending.remove(&next_index) {
                next_index += 1;
                if let Some(message) = chunk.error {
                    let _ = tx.send(Err(Error::Protocol(message))).await;
                    break 'outer;
                }
                let is_done = chunk.done;
                if tx.send(Ok(chunk)).await.is_err() {
                    // Receiver dropped; nothing left to deliver to.
                    break 'outer;
                }
                if is_done {
                    break 'outer;
                }
            }
        }
        self.sub.close();
    }

    fn decode_chunk(&self, event: &Event) -> Result<ReplyChunk> {
        let plaintext = decrypt(&self.prompt_keys, &self.expert_pubkey, &event.content)?;
        Ok(serde_json::from_str(&plaintext)?)
    }
}

/// The asynchronous reply sequence of one paid prompt.
///
/// Finite and non-restartable: ends at the terminal chunk, an error item
/// or a timeout item.
#[derive(Debug)]
pub struct Replies {
    expert_pubkey: PublicKey,
    prompt_id: EventId,
    amount_paid: u64,
    rx: mpsc::Receiver<Result<ReplyChunk>>,
    cancel: CancellationToken,
}

impl Replies {
    /// Next chunk, an error item, or `None` once the stream ended.
    pub async fn next(&mut self) -> Option<Result<ReplyChunk>> {
        self.rx.recv().await
    }

    pub fn expert_pubkey(&self) -> PublicKey {
        self.expert_pubkey
    }

    pub fn prompt_id(&self) -> EventId {
        self.prompt_id
    }

    /// Sats paid for this prompt.
    pub fn amount_paid(&self) -> u64 {
        self.amount_paid
    }

    /// Cancel the stream; pending subscriptions are released. The payment,
    /// already made, stands.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drain the stream and concatenate chunk payloads.
    pub async fn collect_text(mut self) -> Result<String> {
        let mut text = String::new();
        while let Some(item) = self.next().await {
            let chunk = item?;
            text.push_str(&chunk.payload);
            if chunk.done {
                return Ok(text);
            }
        }
        Err(Error::Protocol("Reply stream ended without terminal chunk".into()))
    }
}
