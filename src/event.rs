//! Event primitives: signed event construction, validation and
//! authenticated encryption between two keys.
//!
//! Everything on the wire is a Nostr event. Encryption uses NIP-44 v2,
//! which derives a conversation key from (sender secret, recipient public)
//! so the ciphertext is bound to that pair.

use crate::error::{Error, Result};
use nostr::nips::nip44::{self, Version};
use nostr::{Event, EventBuilder, EventId, Keys, PublicKey, Tag, Timestamp};

/// Tag name carrying a prompt format identifier.
pub const FORMAT_TAG: &str = "format";
/// Tag name carrying a payment method identifier.
pub const METHOD_TAG: &str = "method";
/// Tag name flagging stream capability.
pub const STREAM_TAG: &str = "stream";
/// Tag name carrying a relay URL.
pub const RELAY_TAG: &str = "relay";

/// Build and sign an event of the given kind.
///
/// Creation time is filled with wall-clock seconds; the identifier and
/// signature are computed by the signer.
pub fn build_event(
    kind: u16,
    content: impl Into<String>,
    tags: Vec<Tag>,
    keys: &Keys,
) -> Result<Event> {
    EventBuilder::new(crate::kinds::kind(kind), content)
        .tags(tags)
        .sign_with_keys(keys)
        .map_err(|e| Error::Event(format!("Failed to sign event: {e}")))
}

/// Structural validity plus identifier and signature verification.
pub fn validate_event(event: &Event) -> bool {
    event.verify().is_ok()
}

/// Encrypt `plaintext` from `sender` to `recipient` (NIP-44 v2).
pub fn encrypt(sender: &Keys, recipient: &PublicKey, plaintext: &str) -> Result<String> {
    nip44::encrypt(sender.secret_key(), recipient, plaintext, Version::V2)
        .map_err(|e| Error::Event(format!("Encryption failed: {e}")))
}

/// Decrypt a payload produced by [`encrypt`] with the mirrored key pair.
///
/// Fails with [`Error::Decrypt`] when the ciphertext does not authenticate
/// against the (sender, recipient) conversation key.
pub fn decrypt(recipient: &Keys, sender: &PublicKey, ciphertext: &str) -> Result<String> {
    nip44::decrypt(recipient.secret_key(), sender, ciphertext)
        .map_err(|e| Error::Decrypt(format!("{e}")))
}

/// All values of tags named `name` (first positional value only).
pub fn tag_values<'a>(event: &'a Event, name: &str) -> impl Iterator<Item = &'a str> {
    let name = name.to_string();
    event.tags.iter().filter_map(move |tag| {
        let slice = tag.as_slice();
        match slice {
            [kind, value, ..] if *kind == name => Some(value.as_str()),
            _ => None,
        }
    })
}

/// First value of the first tag named `name`.
pub fn first_tag_value<'a>(event: &'a Event, name: &str) -> Option<&'a str> {
    tag_values(event, name).next()
}

/// The addressed recipient (first `p` tag), if any.
pub fn p_tag(event: &Event) -> Option<PublicKey> {
    first_tag_value(event, "p").and_then(|v| PublicKey::from_hex(v).ok())
}

/// The referenced event (first `e` tag), if any.
pub fn e_tag(event: &Event) -> Option<EventId> {
    first_tag_value(event, "e").and_then(|v| EventId::from_hex(v).ok())
}

/// All hashtag (`t`) values.
pub fn hashtags(event: &Event) -> Vec<String> {
    tag_values(event, "t").map(|s| s.to_string()).collect()
}

/// Whether the event carries a truthy `stream` tag.
pub fn stream_flag(event: &Event) -> bool {
    matches!(first_tag_value(event, STREAM_TAG), Some("true") | Some("1"))
}

/// Seconds elapsed since the event's creation time (zero if in the future).
pub fn age_secs(event: &Event) -> u64 {
    Timestamp::now().as_u64().saturating_sub(event.created_at.as_u64())
}

/// Cutoff for live-subscription filters; a small lookback absorbs relay
/// clock skew.
pub(crate) fn recent_cutoff() -> Timestamp {
    Timestamp::from(Timestamp::now().as_u64().saturating_sub(60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::JsonUtil;

    #[test]
    fn build_and_validate_roundtrip() {
        let keys = Keys::generate();
        let tags = vec![
            Tag::hashtag("bitcoin"),
            Tag::custom(nostr::TagKind::custom(FORMAT_TAG), ["text"]),
        ];
        let event = build_event(crate::kinds::ASK, "what is a channel?", tags, &keys).unwrap();

        assert!(validate_event(&event));
        assert_eq!(event.kind, crate::kinds::kind(crate::kinds::ASK));
        assert_eq!(event.pubkey, keys.public_key());
        assert_eq!(hashtags(&event), vec!["bitcoin".to_string()]);
        assert_eq!(first_tag_value(&event, FORMAT_TAG), Some("text"));
    }

    #[test]
    fn tampered_event_is_invalid() {
        let keys = Keys::generate();
        let event = build_event(crate::kinds::ASK, "original", vec![], &keys).unwrap();

        // Mutate the content in the serialized form; the identifier and
        // signature no longer cover the new bytes.
        let tampered_json = event.as_json().replace("original", "tampered");
        let tampered = Event::from_json(&tampered_json).unwrap();
        assert!(!validate_event(&tampered));
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let alice = Keys::generate();
        let bob = Keys::generate();

        let ciphertext = encrypt(&alice, &bob.public_key(), "hello bob").unwrap();
        let plaintext = decrypt(&bob, &alice.public_key(), &ciphertext).unwrap();
        assert_eq!(plaintext, "hello bob");
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let mallory = Keys::generate();

        let ciphertext = encrypt(&alice, &bob.public_key(), "secret").unwrap();
        let result = decrypt(&mallory, &alice.public_key(), &ciphertext);
        assert!(matches!(result, Err(Error::Decrypt(_))));
    }
}
