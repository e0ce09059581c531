//! Smart client: budget-aware fan-out over LLM-selected experts.
//!
//! Takes a natural-language question and a total budget in sats,
//! anonymizes the question into a public summary with hashtags, scores
//! incoming bids against the question and runs the paid protocol against
//! the best matches. Partial success is the norm; each attempted expert
//! yields its own result entry.

use crate::client::{AskClient, AskExpertParams, AskTarget, BudgetPayer, FindExpertsOptions};
use crate::error::{Error, Result};
use crate::payment::PaymentCoordinator;
use crate::types::{Bid, OpFuture, PromptPayload};
use futures::future::join_all;
use nostr::PublicKey;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Black-box chat-completion interface (the LLM endpoint).
pub trait ChatCompletion: Send + Sync {
    fn complete<'a>(&'a self, system: &'a str, user: &'a str) -> OpFuture<'a, String>;
}

/// Smart-client policy knobs.
#[derive(Debug, Clone)]
pub struct SmartClientOptions {
    /// Maximum experts asked per question.
    pub max_experts: usize,
    /// Minimum LLM match score (0-10) for a bid to qualify.
    pub min_score: u8,
    /// Discovery options forwarded to `find_experts`.
    pub find: FindExpertsOptions,
}

impl Default for SmartClientOptions {
    fn default() -> Self {
        Self {
            max_experts: 3,
            min_score: 6,
            find: FindExpertsOptions::default(),
        }
    }
}

/// Outcome of one attempted expert.
#[derive(Debug)]
pub struct ExpertAnswer {
    pub expert_pubkey: PublicKey,
    /// The offer text the expert bid with.
    pub offer: String,
    /// The collected answer, when the exchange succeeded.
    pub content: Option<String>,
    pub amount_paid: u64,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SynthesizedAsk {
    summary: String,
    #[serde(default)]
    hashtags: Vec<String>,
}

const SUMMARIZE_SYSTEM: &str = "You anonymize questions for a public expert marketplace. \
Given a question, reply with JSON only: {\"summary\": \"<one sentence, no personal details>\", \
\"hashtags\": [\"<up to 5 lowercase topic tags>\"]}";

const SCORE_SYSTEM: &str = "You match expert offers to a question. \
Reply with a single integer 0-10: how well the offer fits the question. \
10 means a perfect specialist, 0 means unrelated.";

/// Orchestrates question → discovery → selection → paid fan-out.
pub struct SmartClient {
    client: AskClient,
    llm: Arc<dyn ChatCompletion>,
    payments: Arc<PaymentCoordinator>,
    options: SmartClientOptions,
}

impl SmartClient {
    pub fn new(
        client: AskClient,
        llm: Arc<dyn ChatCompletion>,
        payments: Arc<PaymentCoordinator>,
        options: SmartClientOptions,
    ) -> Self {
        Self {
            client,
            llm,
            payments,
            options,
        }
    }

    /// Ask up to `max_experts` experts, spending at most `budget_sats`
    /// in total. Returns one entry per attempted expert.
    pub async fn ask(&self, question: &str, budget_sats: u64) -> Result<Vec<ExpertAnswer>> {
        self.ask_with_cancel(question, budget_sats, CancellationToken::new())
            .await
    }

    /// Like [`SmartClient::ask`] with an external cancellation signal.
    pub async fn ask_with_cancel(
        &self,
        question: &str,
        budget_sats: u64,
        cancel: CancellationToken,
    ) -> Result<Vec<ExpertAnswer>> {
        let synthesized = self.synthesize(question).await?;
        log::debug!(
            "Asking as '{}' with tags {:?}",
            synthesized.summary,
            synthesized.hashtags
        );

        let mut find = self.options.find.clone();
        find.cancel = Some(cancel.clone());
        let bids = self
            .client
            .find_experts(&synthesized.summary, &synthesized.hashtags, find)
            .await?;
        if bids.is_empty() {
            return Ok(Vec::new());
        }

        let selected = self.select(question, bids).await;
        if selected.is_empty() {
            return Ok(Vec::new());
        }

        // Even budget split; experts quoting above their share fail their
        // own entry with BudgetExceeded rather than the whole call.
        let share = budget_sats / selected.len() as u64;
        let attempts = selected.into_iter().map(|bid| {
            let cancel = cancel.clone();
            async move { self.ask_one(question, bid, share, cancel).await }
        });
        Ok(join_all(attempts).await)
    }

    /// LLM-synthesized public summary and hashtags.
    async fn synthesize(&self, question: &str) -> Result<SynthesizedAsk> {
        let raw = self.llm.complete(SUMMARIZE_SYSTEM, question).await?;
        let json = extract_json(&raw)
            .ok_or_else(|| Error::Parse(format!("LLM returned no JSON: {raw}")))?;
        let synthesized: SynthesizedAsk =
            serde_json::from_str(json).map_err(|e| Error::Parse(format!("Bad summary: {e}")))?;
        if synthesized.summary.is_empty() {
            return Err(Error::Parse("LLM produced an empty summary".into()));
        }
        Ok(synthesized)
    }

    /// Score every bid and keep the best-matching ones.
    async fn select(&self, question: &str, bids: Vec<Bid>) -> Vec<Bid> {
        let scored = join_all(bids.into_iter().map(|bid| async move {
            let score = self.score(question, &bid).await;
            (score, bid)
        }))
        .await;

        let mut qualified: Vec<(u8, Bid)> = scored
            .into_iter()
            .filter(|(score, _)| *score >= self.options.min_score)
            .collect();
        // Descending score; pubkey breaks ties deterministically.
        qualified.sort_by(|(a_score, a), (b_score, b)| {
            b_score
                .cmp(a_score)
                .then_with(|| a.expert_pubkey.to_hex().cmp(&b.expert_pubkey.to_hex()))
        });
        qualified
            .into_iter()
            .take(self.options.max_experts)
            .map(|(_, bid)| bid)
            .collect()
    }

    async fn score(&self, question: &str, bid: &Bid) -> u8 {
        let user = format!("Question: {question}\nOffer: {}", bid.offer);
        match self.llm.complete(SCORE_SYSTEM, &user).await {
            Ok(raw) => parse_score(&raw).unwrap_or(0),
            Err(e) => {
                log::debug!("Scoring failed for {}: {e}", bid.expert_pubkey);
                0
            }
        }
    }

    async fn ask_one(
        &self,
        question: &str,
        bid: Bid,
        share_sats: u64,
        cancel: CancellationToken,
    ) -> ExpertAnswer {
        let expert_pubkey = bid.expert_pubkey;
        let offer = bid.offer.clone();

        if share_sats == 0 {
            return ExpertAnswer {
                expert_pubkey,
                offer,
                content: None,
                amount_paid: 0,
                error: Some(
                    Error::BudgetExceeded {
                        required: 1,
                        available: 0,
                    }
                    .to_string(),
                ),
            };
        }

        let handler = Arc::new(BudgetPayer::new(self.payments.clone(), share_sats));
        let result = self
            .client
            .ask_expert(AskExpertParams {
                target: AskTarget::Bid(bid),
                content: PromptPayload::Text(question.to_string()),
                format: None,
                handler,
                cancel: Some(cancel),
            })
            .await;
        match result {
            Ok(replies) => {
                let amount_paid = replies.amount_paid();
                match replies.collect_text().await {
                    Ok(content) => ExpertAnswer {
                        expert_pubkey,
                        offer,
                        content: Some(content),
                        amount_paid,
                        error: None,
                    },
                    Err(e) => ExpertAnswer {
                        expert_pubkey,
                        offer,
                        content: None,
                        amount_paid,
                        error: Some(e.to_string()),
                    },
                }
            }
            Err(e) => ExpertAnswer {
                expert_pubkey,
                offer,
                content: None,
                amount_paid: 0,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Extract the first JSON object from possibly fenced LLM output.
fn extract_json(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end >= start).then(|| &raw[start..=end])
}

/// Parse the first integer in an LLM scoring reply, clamped to 0-10.
fn parse_score(raw: &str) -> Option<u8> {
    let digits: String = raw
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let value: u32 = digits.parse().ok()?;
    Some(value.min(10) as u8)
}
