//! End-to-end protocol tests: discovery, paid prompts and reply streams
//! over an in-process relay with an in-memory wallet.

mod common;

use common::{MockRelay, MockWallet, dead_relay_url, init_logging};
use expertmarket::types::OpFuture;
use expertmarket::{
    AskClient, AskExpertParams, AskTarget, BudgetPayer, ChatCompletion, ClientOptions, Error,
    Expert, ExpertBid, ExpertCallbacks, ExpertOptions, ExpertPrice, ExpertReply, FindExpertsOptions,
    PaymentCoordinator, PaymentMethod, ProfileInfo, Prompt, PromptFormat, PromptPayload, Proof,
    Quote, QuoteHandler, RelayPool, SmartClient, SmartClientOptions, kinds,
};
use nostr::{Keys, RelayUrl};
use rand::RngCore;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Scripted expert: fixed offer, fixed price, canned reply chunks.
struct TestExpert {
    offer: String,
    price_sats: u64,
    chunks: Vec<String>,
    refuse_prompts: bool,
    prompts_seen: Mutex<Vec<String>>,
}

impl TestExpert {
    fn new(offer: &str, price_sats: u64, chunks: &[&str]) -> Self {
        Self {
            offer: offer.to_string(),
            price_sats,
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            refuse_prompts: false,
            prompts_seen: Mutex::new(Vec::new()),
        }
    }
}

impl ExpertCallbacks for TestExpert {
    fn on_ask<'a>(&'a self, _ask: &'a expertmarket::Ask) -> OpFuture<'a, Option<ExpertBid>> {
        Box::pin(async move { Ok(Some(ExpertBid::new(self.offer.clone()))) })
    }

    fn on_prompt_price<'a>(&'a self, _prompt: &'a Prompt) -> OpFuture<'a, ExpertPrice> {
        Box::pin(async move {
            if self.refuse_prompts {
                return Err(Error::Other("not taking questions today".into()));
            }
            Ok(ExpertPrice {
                amount_sats: self.price_sats,
                description: "expert answer".to_string(),
            })
        })
    }

    fn on_prompt_paid<'a>(
        &'a self,
        prompt: &'a Prompt,
        _quote: &'a Quote,
    ) -> OpFuture<'a, ExpertReply> {
        Box::pin(async move {
            self.prompts_seen
                .lock()
                .unwrap()
                .push(prompt.payload.as_text());
            if self.chunks.len() == 1 {
                Ok(ExpertReply::Single(self.chunks[0].clone()))
            } else {
                let chunks: Vec<expertmarket::Result<String>> =
                    self.chunks.iter().cloned().map(Ok).collect();
                Ok(ExpertReply::Stream(Box::pin(futures::stream::iter(chunks))))
            }
        })
    }
}

fn test_client_options(relays: Vec<RelayUrl>) -> ClientOptions {
    ClientOptions {
        discovery_relays: relays,
        publish_timeout: Duration::from_secs(3),
        query_timeout: Duration::from_secs(3),
        bid_window: Duration::from_secs(3),
        bid_grace: Duration::from_millis(300),
        quote_timeout: Duration::from_secs(5),
        first_reply_timeout: Duration::from_secs(3),
        reply_gap_timeout: Duration::from_secs(3),
    }
}

fn test_expert_options(discovery: Vec<RelayUrl>, prompts: Vec<RelayUrl>) -> ExpertOptions {
    ExpertOptions {
        discovery_relays: discovery,
        prompt_relays: prompts,
        hashtags: vec!["bitcoin".to_string(), "lightning".to_string()],
        stream: true,
        profile: ProfileInfo {
            nickname: "ln-helper".to_string(),
            description: "lightning questions answered".to_string(),
            picture: None,
        },
        publish_timeout: Duration::from_secs(3),
        proof_timeout: Duration::from_secs(10),
        ..Default::default()
    }
}

struct TestBed {
    relay: MockRelay,
    pool: Arc<RelayPool>,
    wallet: Arc<MockWallet>,
    payments: Arc<PaymentCoordinator>,
    expert_keys: Keys,
    expert: Expert,
    callbacks: Arc<TestExpert>,
    client: AskClient,
}

async fn start_testbed(callbacks: TestExpert) -> TestBed {
    init_logging();
    let relay = MockRelay::start().await;
    let pool = Arc::new(RelayPool::new());
    let wallet = Arc::new(MockWallet::new());
    let payments = Arc::new(PaymentCoordinator::with_defaults(wallet.clone()));
    let expert_keys = Keys::generate();
    let callbacks = Arc::new(callbacks);

    let expert = Expert::new(
        expert_keys.clone(),
        pool.clone(),
        payments.clone(),
        callbacks.clone(),
        test_expert_options(vec![relay.url()], vec![relay.url()]),
    );
    expert.start().await.unwrap();

    let client = AskClient::new(pool.clone(), test_client_options(vec![relay.url()]));
    TestBed {
        relay,
        pool,
        wallet,
        payments,
        expert_keys,
        expert,
        callbacks,
        client,
    }
}

#[tokio::test]
async fn happy_path_text_answer() {
    let bed = start_testbed(TestExpert::new(
        "I can help",
        50,
        &["Channels close ", "either cooperatively ", "or unilaterally."],
    ))
    .await;

    let bids = bed
        .client
        .find_experts(
            "Tell me about lightning",
            &["bitcoin".to_string(), "lightning".to_string()],
            FindExpertsOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(bids.len(), 1);
    let bid = bids[0].clone();
    assert_eq!(bid.expert_pubkey, bed.expert_keys.public_key());
    assert_eq!(bid.offer, "I can help");
    assert!(bid.methods.contains(&PaymentMethod::Lightning));

    let handler = Arc::new(BudgetPayer::new(bed.payments.clone(), 100));
    let replies = bed
        .client
        .ask_expert(AskExpertParams {
            target: AskTarget::Bid(bid),
            content: "how do channels close?".into(),
            format: None,
            handler,
            cancel: None,
        })
        .await
        .unwrap();

    assert_eq!(replies.amount_paid(), 50);
    let text = replies.collect_text().await.unwrap();
    assert_eq!(text, "Channels close either cooperatively or unilaterally.");

    assert_eq!(bed.wallet.settled_count(), 1);
    assert_eq!(
        *bed.callbacks.prompts_seen.lock().unwrap(),
        vec!["how do channels close?".to_string()]
    );
    bed.expert.stop();
}

/// Pays nothing and fabricates a random preimage.
struct BogusProofHandler;

impl QuoteHandler for BogusProofHandler {
    fn on_quote<'a>(&'a self, _quote: &'a Quote) -> OpFuture<'a, bool> {
        Box::pin(async { Ok(true) })
    }

    fn on_pay<'a>(&'a self, _quote: &'a Quote) -> OpFuture<'a, Proof> {
        Box::pin(async {
            let mut preimage = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut preimage);
            Ok(Proof {
                method: PaymentMethod::Lightning,
                preimage: hex::encode(preimage),
            })
        })
    }
}

#[tokio::test]
async fn preimage_mismatch_gets_no_answer() {
    let bed = start_testbed(TestExpert::new("I can help", 50, &["answer"])).await;

    let bids = bed
        .client
        .find_experts(
            "Tell me about lightning",
            &["lightning".to_string()],
            FindExpertsOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(bids.len(), 1);

    let replies = bed
        .client
        .ask_expert(AskExpertParams {
            target: AskTarget::Bid(bids[0].clone()),
            content: "how do channels close?".into(),
            format: None,
            handler: Arc::new(BogusProofHandler),
            cancel: None,
        })
        .await
        .unwrap();

    // The expert must refuse: the client observes a timeout, not a reply.
    let err = replies.collect_text().await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "got {err:?}");
    assert!(bed.relay.stored_of_kind(kinds::REPLY).is_empty());
    assert_eq!(bed.wallet.settled_count(), 0);
    assert!(bed.callbacks.prompts_seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn partial_relay_delivery_still_yields_one_bid() {
    init_logging();
    let live = MockRelay::start().await;
    let relays = vec![live.url(), dead_relay_url().await, dead_relay_url().await];

    let pool = Arc::new(RelayPool::new());
    let wallet = Arc::new(MockWallet::new());
    let payments = Arc::new(PaymentCoordinator::with_defaults(wallet.clone()));
    let expert = Expert::new(
        Keys::generate(),
        pool.clone(),
        payments,
        Arc::new(TestExpert::new("here", 10, &["yes"])),
        test_expert_options(relays.clone(), vec![live.url()]),
    );
    expert.start().await.unwrap();

    let mut options = test_client_options(relays);
    options.publish_timeout = Duration::from_secs(1);
    let client = AskClient::new(pool, options);

    let bids = client
        .find_experts(
            "Tell me about lightning",
            &["lightning".to_string()],
            FindExpertsOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(bids.len(), 1);
    expert.stop();
}

#[tokio::test]
async fn zero_bids_is_empty_not_error() {
    init_logging();
    let relay = MockRelay::start().await;
    let pool = Arc::new(RelayPool::new());
    let mut options = test_client_options(vec![relay.url()]);
    options.bid_window = Duration::from_millis(500);
    let client = AskClient::new(pool, options);

    let bids = client
        .find_experts(
            "anyone there?",
            &["nothing".to_string()],
            FindExpertsOptions::default(),
        )
        .await
        .unwrap();
    assert!(bids.is_empty());
}

#[tokio::test]
async fn refused_prompt_surfaces_decline() {
    let mut callbacks = TestExpert::new("I can help", 50, &["answer"]);
    callbacks.refuse_prompts = true;
    let bed = start_testbed(callbacks).await;

    let bids = bed
        .client
        .find_experts(
            "Tell me about lightning",
            &["lightning".to_string()],
            FindExpertsOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(bids.len(), 1);

    let err = bed
        .client
        .ask_expert(AskExpertParams {
            target: AskTarget::Bid(bids[0].clone()),
            content: "hello?".into(),
            format: None,
            handler: Arc::new(BudgetPayer::new(bed.payments.clone(), 100)),
            cancel: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Protocol(_)), "got {err:?}");
    assert_eq!(bed.wallet.settled_count(), 0);
}

#[tokio::test]
async fn budget_exceeded_blocks_payment() {
    let bed = start_testbed(TestExpert::new("pricey", 500, &["answer"])).await;

    let bids = bed
        .client
        .find_experts(
            "Tell me about lightning",
            &["lightning".to_string()],
            FindExpertsOptions::default(),
        )
        .await
        .unwrap();

    let err = bed
        .client
        .ask_expert(AskExpertParams {
            target: AskTarget::Bid(bids[0].clone()),
            content: "hello".into(),
            format: None,
            handler: Arc::new(BudgetPayer::new(bed.payments.clone(), 100)),
            cancel: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BudgetExceeded { required: 500, .. }));
    assert_eq!(bed.wallet.settled_count(), 0);
}

#[tokio::test]
async fn cancelled_discovery_returns_cancelled() {
    let bed = start_testbed(TestExpert::new("hi", 1, &["a"])).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = bed
        .client
        .find_experts(
            "question",
            &["lightning".to_string()],
            FindExpertsOptions {
                cancel: Some(cancel),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
}

#[tokio::test]
async fn fetch_experts_returns_published_profile() {
    let bed = start_testbed(TestExpert::new("hi", 1, &["a"])).await;
    // The profile goes out during expert start; give the relay a moment.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let profiles = bed
        .client
        .fetch_experts(&[bed.expert_keys.public_key()], None)
        .await
        .unwrap();
    assert_eq!(profiles.len(), 1);
    assert_eq!(profiles[0].info.nickname, "ln-helper");
    assert!(profiles[0].formats.contains(&PromptFormat::Text));
    assert!(!profiles[0].prompt_relays.is_empty());
}

#[tokio::test]
async fn profile_carries_dynamic_pricing_line() {
    init_logging();
    let relay = MockRelay::start().await;
    let pool = Arc::new(RelayPool::new());
    let wallet = Arc::new(MockWallet::new());
    let payments = Arc::new(PaymentCoordinator::with_defaults(wallet));
    let expert_keys = Keys::generate();

    let mut prices = std::collections::HashMap::new();
    prices.insert(
        "gpt-4o".to_string(),
        expertmarket::ModelPrice {
            prompt_sats_per_ktok: 0.5,
            completion_sats_per_ktok: 1.5,
        },
    );
    let mut options = test_expert_options(vec![relay.url()], vec![relay.url()]);
    options.price_feed = Some(Arc::new(expertmarket::StaticPriceFeed::new(prices)));
    options.model = Some("gpt-4o".to_string());

    let expert = Expert::new(
        expert_keys.clone(),
        pool.clone(),
        payments,
        Arc::new(TestExpert::new("hi", 1, &["a"])),
        options,
    );
    expert.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let client = AskClient::new(pool, test_client_options(vec![relay.url()]));
    let profiles = client
        .fetch_experts(&[expert_keys.public_key()], None)
        .await
        .unwrap();
    assert_eq!(profiles.len(), 1);
    assert!(
        profiles[0].info.description.contains("gpt-4o: 0.500"),
        "description was: {}",
        profiles[0].info.description
    );
    expert.stop();
}

/// Scripted LLM: JSON for summarization requests, a fixed score otherwise.
struct ScriptedLlm;

impl ChatCompletion for ScriptedLlm {
    fn complete<'a>(&'a self, system: &'a str, _user: &'a str) -> OpFuture<'a, String> {
        let reply = if system.contains("anonymize") {
            r#"{"summary": "A question about lightning channels", "hashtags": ["lightning"]}"#
                .to_string()
        } else {
            "9".to_string()
        };
        Box::pin(async move { Ok(reply) })
    }
}

#[tokio::test]
async fn smart_client_collects_paid_answer() {
    let bed = start_testbed(TestExpert::new("I know lightning", 50, &["channels close."])).await;

    let smart = SmartClient::new(
        AskClient::new(bed.pool.clone(), test_client_options(vec![bed.relay.url()])),
        Arc::new(ScriptedLlm),
        bed.payments.clone(),
        SmartClientOptions::default(),
    );

    let answers = smart.ask("how do lightning channels close?", 200).await.unwrap();
    assert_eq!(answers.len(), 1);
    let answer = &answers[0];
    assert_eq!(answer.expert_pubkey, bed.expert_keys.public_key());
    assert_eq!(answer.content.as_deref(), Some("channels close."));
    assert_eq!(answer.amount_paid, 50);
    assert!(answer.error.is_none());
}

#[tokio::test]
async fn wait_for_yields_first_matching_event() {
    init_logging();
    let relay = MockRelay::start().await;
    let pool = Arc::new(RelayPool::new());
    let keys = Keys::generate();
    let event =
        expertmarket::event::build_event(kinds::ASK, "ping", vec![], &keys).unwrap();

    pool.publish(&event, &[relay.url()], Duration::from_secs(2))
        .await
        .unwrap();

    let filter = nostr::Filter::new()
        .kind(nostr::Kind::Custom(kinds::ASK))
        .author(keys.public_key());
    let found = pool
        .wait_for(filter, &[relay.url()], Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(found.map(|e| e.id), Some(event.id));

    // A filter nothing matches runs out the clock and yields nothing.
    let other = nostr::Filter::new()
        .kind(nostr::Kind::Custom(kinds::ASK))
        .author(Keys::generate().public_key());
    let none = pool
        .wait_for(other, &[relay.url()], Duration::from_millis(300))
        .await
        .unwrap();
    assert!(none.is_none());
}

#[tokio::test]
async fn publish_with_no_reachable_relay_is_an_error() {
    init_logging();
    let pool = Arc::new(RelayPool::new());
    let keys = Keys::generate();
    let event =
        expertmarket::event::build_event(kinds::ASK, "into the void", vec![], &keys).unwrap();

    let err = pool
        .publish(&event, &[dead_relay_url().await], Duration::from_millis(500))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RelayPublishEmpty(_)));
}

#[tokio::test]
async fn rejected_quote_sends_no_proof() {
    let bed = start_testbed(TestExpert::new("I can help", 50, &["answer"])).await;

    let bids = bed
        .client
        .find_experts(
            "Tell me about lightning",
            &["lightning".to_string()],
            FindExpertsOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(bids.len(), 1);

    let err = bed
        .client
        .ask_expert(AskExpertParams {
            target: AskTarget::Bid(bids[0].clone()),
            content: "hello".into(),
            format: None,
            handler: Arc::new(expertmarket::RefuseAll),
            cancel: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QuoteRejected(_)));
    assert!(bed.relay.stored_of_kind(kinds::PROOF).is_empty());
    assert_eq!(bed.wallet.settled_count(), 0);
}

#[tokio::test]
async fn prompt_payload_chat_format_roundtrip() {
    let bed = start_testbed(TestExpert::new("chat", 10, &["ok"])).await;

    let bids = bed
        .client
        .find_experts(
            "chat question",
            &["lightning".to_string()],
            FindExpertsOptions {
                formats: vec![PromptFormat::Openai],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(bids.len(), 1);

    let replies = bed
        .client
        .ask_expert(AskExpertParams {
            target: AskTarget::Bid(bids[0].clone()),
            content: PromptPayload::Chat(vec![
                expertmarket::ChatMessage::new("system", "be brief"),
                expertmarket::ChatMessage::new("user", "hello"),
            ]),
            format: Some(PromptFormat::Openai),
            handler: Arc::new(BudgetPayer::new(bed.payments.clone(), 100)),
            cancel: None,
        })
        .await
        .unwrap();
    assert_eq!(replies.collect_text().await.unwrap(), "ok");
    assert_eq!(
        *bed.callbacks.prompts_seen.lock().unwrap(),
        vec!["be brief\nhello".to_string()]
    );
}
