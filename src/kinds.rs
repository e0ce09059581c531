//! Protocol event kinds.
//!
//! These numbers are fixed by the deployed network and must not change.

use nostr::Kind;

/// Public question summary, authored by a per-session throwaway key.
pub const ASK: u16 = 20174;
/// Encrypted bid envelope addressed to the session key.
pub const BID: u16 = 20175;
/// Inner bid payload, signed by the expert's stable key.
pub const BID_PAYLOAD: u16 = 20176;
/// Encrypted prompt, authored by a per-prompt throwaway key.
pub const PROMPT: u16 = 20177;
/// Encrypted quote carrying invoices, addressed to the prompt key.
pub const QUOTE: u16 = 20178;
/// Encrypted payment proof (preimage), addressed to the expert.
pub const PROOF: u16 = 20179;
/// Encrypted answer chunk, addressed to the prompt key.
pub const REPLY: u16 = 20180;
/// Long-lived public expert profile (replaceable).
pub const EXPERT_PROFILE: u16 = 10174;

/// Convert one of the constants above into a [`nostr::Kind`].
pub fn kind(k: u16) -> Kind {
    Kind::Custom(k)
}
