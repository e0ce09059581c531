//! Relay transport: fan-out publish, multiplexed subscribe with
//! deduplication, point-in-time query and live waiting.
//!
//! Relay failures are absorbed and logged; delivery to at least one relay
//! counts as a delivery. Callers needing stronger guarantees inspect the
//! set of acknowledging relays returned by [`RelayPool::publish`].

mod connection;
mod pool;

pub use pool::{RelayPool, Subscription, SubscriptionItem};
