//! Shared protocol types: the data model carried by the five phases.

use crate::error::{Error, Result};
use crate::event::{self, FORMAT_TAG, METHOD_TAG, RELAY_TAG, STREAM_TAG, stream_flag, tag_values};
use crate::kinds;
use futures::future::BoxFuture;
use nostr::{Event, EventId, PublicKey, RelayUrl, Tag, TagKind, Timestamp};
use serde::{Deserialize, Serialize};

/// Boxed future type used by the pluggable callback traits.
pub type OpFuture<'a, T> = BoxFuture<'a, Result<T>>;

/// Prompt serialization format.
///
/// The wire value is an open string; `Other` carries formats this crate has
/// no special handling for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptFormat {
    /// Plain UTF-8 text prompt and reply.
    Text,
    /// Chat-completion message list (role/content pairs).
    Openai,
    /// Any other format identifier.
    #[serde(untagged)]
    Other(String),
}

impl PromptFormat {
    /// Get the string representation of the format.
    pub fn as_str(&self) -> &str {
        match self {
            PromptFormat::Text => "text",
            PromptFormat::Openai => "openai",
            PromptFormat::Other(s) => s,
        }
    }

    /// Parse from the wire string.
    pub fn parse(s: &str) -> Self {
        match s {
            "text" => PromptFormat::Text,
            "openai" => PromptFormat::Openai,
            other => PromptFormat::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for PromptFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payment method for settling a quote.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    /// Bitcoin Lightning (BOLT11 invoice, preimage proof).
    Lightning,
    /// Any other method identifier.
    #[serde(untagged)]
    Other(String),
}

impl PaymentMethod {
    /// Get the string representation of the method.
    pub fn as_str(&self) -> &str {
        match self {
            PaymentMethod::Lightning => "lightning",
            PaymentMethod::Other(s) => s,
        }
    }

    /// Parse from the wire string.
    pub fn parse(s: &str) -> Self {
        match s {
            "lightning" => PaymentMethod::Lightning,
            other => PaymentMethod::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One message of a chat-format prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Prompt body: either plain text or a chat-message list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptPayload {
    Text(String),
    Chat(Vec<ChatMessage>),
}

impl PromptPayload {
    /// Flatten to plain text (chat messages joined by newlines).
    pub fn as_text(&self) -> String {
        match self {
            PromptPayload::Text(s) => s.clone(),
            PromptPayload::Chat(messages) => messages
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl From<&str> for PromptPayload {
    fn from(s: &str) -> Self {
        PromptPayload::Text(s.to_string())
    }
}

/// A public question summary observed on discovery relays.
#[derive(Debug, Clone)]
pub struct Ask {
    /// Ask event identifier.
    pub id: EventId,
    /// The client's throwaway session key for this ask.
    pub session_pubkey: PublicKey,
    /// Public, anonymized question summary.
    pub summary: String,
    /// Discovery hashtags.
    pub hashtags: Vec<String>,
    /// Prompt formats the client accepts.
    pub formats: Vec<PromptFormat>,
    /// Payment methods the client accepts.
    pub methods: Vec<PaymentMethod>,
    /// Whether the client accepts streamed replies.
    pub stream: bool,
    /// Discovery relays the client selected for this session.
    pub relays: Vec<RelayUrl>,
    pub created_at: Timestamp,
}

impl Ask {
    /// Parse an ask from its public event.
    pub fn from_event(event: &Event) -> Result<Self> {
        if event.kind != kinds::kind(kinds::ASK) {
            return Err(Error::Protocol(format!(
                "Expected ask kind, got {:?}",
                event.kind
            )));
        }
        Ok(Self {
            id: event.id,
            session_pubkey: event.pubkey,
            summary: event.content.clone(),
            hashtags: event::hashtags(event),
            formats: tag_values(event, FORMAT_TAG).map(PromptFormat::parse).collect(),
            methods: tag_values(event, METHOD_TAG).map(PaymentMethod::parse).collect(),
            stream: stream_flag(event),
            relays: parse_relay_tags(event),
            created_at: event.created_at,
        })
    }
}

/// What an expert offers in response to an ask.
///
/// Produced by the expert's `on_ask` callback; the runtime wraps it into the
/// two-layer encrypted bid.
#[derive(Debug, Clone)]
pub struct ExpertBid {
    /// Human-readable offer text shown to the client.
    pub offer: String,
}

impl ExpertBid {
    pub fn new(offer: impl Into<String>) -> Self {
        Self { offer: offer.into() }
    }
}

/// A decrypted, signature-verified bid.
///
/// The outer envelope hides the expert's identity from third parties; this
/// struct exists only after the session-key holder decrypted the payload and
/// verified the inner signature.
#[derive(Debug, Clone)]
pub struct Bid {
    /// Outer envelope event identifier (dedup key together with the expert).
    pub id: EventId,
    /// Inner payload event identifier.
    pub payload_id: EventId,
    /// The ask this bid answers.
    pub ask_id: EventId,
    /// The expert's stable public key (author of the inner payload).
    pub expert_pubkey: PublicKey,
    /// Offer text.
    pub offer: String,
    /// Relays the expert listens on for prompts.
    pub relays: Vec<RelayUrl>,
    /// Formats the expert supports.
    pub formats: Vec<PromptFormat>,
    /// Methods the expert supports.
    pub methods: Vec<PaymentMethod>,
    /// Whether the expert can stream replies.
    pub stream: bool,
}

impl Bid {
    /// Assemble a bid from the outer envelope and the decrypted,
    /// already-verified inner payload event.
    pub fn from_events(envelope: &Event, payload: &Event) -> Result<Self> {
        if payload.kind != kinds::kind(kinds::BID_PAYLOAD) {
            return Err(Error::Protocol(format!(
                "Expected bid payload kind, got {:?}",
                payload.kind
            )));
        }
        let ask_id = event::e_tag(envelope)
            .ok_or_else(|| Error::Protocol("Bid envelope missing ask reference".to_string()))?;
        Ok(Self {
            id: envelope.id,
            payload_id: payload.id,
            ask_id,
            expert_pubkey: payload.pubkey,
            offer: payload.content.clone(),
            relays: parse_relay_tags(payload),
            formats: tag_values(payload, FORMAT_TAG).map(PromptFormat::parse).collect(),
            methods: tag_values(payload, METHOD_TAG).map(PaymentMethod::parse).collect(),
            stream: stream_flag(payload),
        })
    }
}

/// Decrypted prompt content (the JSON inside a prompt event).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptContent {
    pub format: PromptFormat,
    pub payload: PromptPayload,
}

/// A decrypted prompt as seen by the expert.
#[derive(Debug, Clone)]
pub struct Prompt {
    /// Prompt event identifier; quotes, proofs and replies reference it.
    pub id: EventId,
    /// The client's throwaway prompt key (recipient of quote and replies).
    pub prompt_pubkey: PublicKey,
    /// The expert the prompt is addressed to.
    pub expert_pubkey: PublicKey,
    pub format: PromptFormat,
    pub payload: PromptPayload,
    pub created_at: Timestamp,
}

/// One invoice entry inside a quote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteInvoice {
    pub method: PaymentMethod,
    /// Amount unit, `"sat"` for lightning.
    pub unit: String,
    pub amount: u64,
    /// Method-specific payload; a BOLT11 string for lightning.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice: Option<String>,
}

impl QuoteInvoice {
    /// A lightning invoice entry denominated in sats.
    pub fn lightning(amount_sats: u64, bolt11: impl Into<String>) -> Self {
        Self {
            method: PaymentMethod::Lightning,
            unit: "sat".to_string(),
            amount: amount_sats,
            invoice: Some(bolt11.into()),
        }
    }
}

/// Decrypted quote content.
///
/// Either a non-empty invoice list or an error string explaining refusal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteContent {
    #[serde(default)]
    pub invoices: Vec<QuoteInvoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A decrypted quote bound to its prompt.
#[derive(Debug, Clone)]
pub struct Quote {
    /// The prompt this quote answers; a quote is only valid for it.
    pub prompt_id: EventId,
    pub expert_pubkey: PublicKey,
    pub invoices: Vec<QuoteInvoice>,
    pub error: Option<String>,
}

impl Quote {
    /// The first lightning invoice entry, if any.
    pub fn lightning_invoice(&self) -> Option<&QuoteInvoice> {
        self.invoices
            .iter()
            .find(|i| i.method == PaymentMethod::Lightning && i.invoice.is_some())
    }
}

/// Decrypted proof content: the payment preimage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proof {
    pub method: PaymentMethod,
    /// Hex-encoded 32-byte preimage.
    pub preimage: String,
}

/// One decrypted reply chunk.
///
/// A logical answer spans chunks with contiguous indices and exactly one
/// terminal `done = true` chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyChunk {
    pub index: u32,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Expert-chosen price for a prompt.
#[derive(Debug, Clone)]
pub struct ExpertPrice {
    pub amount_sats: u64,
    pub description: String,
}

/// Profile metadata content (the JSON inside a profile event).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileInfo {
    pub nickname: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
}

/// A parsed long-lived expert profile.
#[derive(Debug, Clone)]
pub struct ExpertProfile {
    pub pubkey: PublicKey,
    pub info: ProfileInfo,
    pub hashtags: Vec<String>,
    pub formats: Vec<PromptFormat>,
    pub methods: Vec<PaymentMethod>,
    pub stream: bool,
    /// Relays the expert listens on for prompts.
    pub prompt_relays: Vec<RelayUrl>,
    pub created_at: Timestamp,
}

impl ExpertProfile {
    /// Parse a profile from its public event.
    pub fn from_event(event: &Event) -> Result<Self> {
        if event.kind != kinds::kind(kinds::EXPERT_PROFILE) {
            return Err(Error::Protocol(format!(
                "Expected profile kind, got {:?}",
                event.kind
            )));
        }
        let info: ProfileInfo = serde_json::from_str(&event.content)?;
        Ok(Self {
            pubkey: event.pubkey,
            info,
            hashtags: event::hashtags(event),
            formats: tag_values(event, FORMAT_TAG).map(PromptFormat::parse).collect(),
            methods: tag_values(event, METHOD_TAG).map(PaymentMethod::parse).collect(),
            stream: stream_flag(event),
            prompt_relays: parse_relay_tags(event),
            created_at: event.created_at,
        })
    }
}

/// Collect `relay` tags into parsed URLs, skipping malformed entries.
pub(crate) fn parse_relay_tags(event: &Event) -> Vec<RelayUrl> {
    tag_values(event, RELAY_TAG)
        .filter_map(|v| match RelayUrl::parse(v) {
            Ok(url) => Some(url),
            Err(e) => {
                log::debug!("Skipping malformed relay url {v}: {e}");
                None
            }
        })
        .collect()
}

/// Build the capability tags shared by asks, bid payloads and profiles.
pub(crate) fn capability_tags(
    formats: &[PromptFormat],
    methods: &[PaymentMethod],
    stream: bool,
    relays: &[RelayUrl],
) -> Vec<Tag> {
    let mut tags = Vec::new();
    for format in formats {
        tags.push(Tag::custom(TagKind::custom(FORMAT_TAG), [format.as_str()]));
    }
    for method in methods {
        tags.push(Tag::custom(TagKind::custom(METHOD_TAG), [method.as_str()]));
    }
    if stream {
        tags.push(Tag::custom(TagKind::custom(STREAM_TAG), ["true"]));
    }
    for relay in relays {
        tags.push(Tag::custom(TagKind::custom(RELAY_TAG), [relay.to_string()]));
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_open_variant_roundtrip() {
        let json = serde_json::to_string(&PromptFormat::Openai).unwrap();
        assert_eq!(json, "\"openai\"");

        let parsed: PromptFormat = serde_json::from_str("\"markdown\"").unwrap();
        assert_eq!(parsed, PromptFormat::Other("markdown".to_string()));
        assert_eq!(PromptFormat::parse("text"), PromptFormat::Text);
    }

    #[test]
    fn method_open_variant_roundtrip() {
        let parsed: PaymentMethod = serde_json::from_str("\"lightning\"").unwrap();
        assert_eq!(parsed, PaymentMethod::Lightning);

        let other: PaymentMethod = serde_json::from_str("\"cashu\"").unwrap();
        assert_eq!(other, PaymentMethod::Other("cashu".to_string()));
    }

    #[test]
    fn prompt_payload_untagged() {
        let text: PromptPayload = serde_json::from_str("\"hello\"").unwrap();
        assert_eq!(text, PromptPayload::Text("hello".to_string()));

        let chat: PromptPayload =
            serde_json::from_str(r#"[{"role":"user","content":"hi"}]"#).unwrap();
        assert_eq!(
            chat,
            PromptPayload::Chat(vec![ChatMessage::new("user", "hi")])
        );
        assert_eq!(chat.as_text(), "hi");
    }

    #[test]
    fn quote_content_error_or_invoices() {
        let refusal: QuoteContent = serde_json::from_str(r#"{"error":"too busy"}"#).unwrap();
        assert!(refusal.invoices.is_empty());
        assert_eq!(refusal.error.as_deref(), Some("too busy"));

        let quoted: QuoteContent = serde_json::from_str(
            r#"{"invoices":[{"method":"lightning","unit":"sat","amount":50,"invoice":"lnbc..."}]}"#,
        )
        .unwrap();
        assert_eq!(quoted.invoices.len(), 1);
        assert_eq!(quoted.invoices[0].amount, 50);
    }
}
