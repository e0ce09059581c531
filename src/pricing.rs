//! Model token-price feed backing dynamic expert pricing.
//!
//! Experts that price per token advertise a pricing line in their profile
//! and recompute it on a coarse interval. The feed itself is pluggable;
//! the HTTP implementation fetches a JSON map of per-model prices.

use crate::error::{Error, Result};
use crate::types::OpFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Per-model token prices, denominated in sats per 1000 tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub prompt_sats_per_ktok: f64,
    pub completion_sats_per_ktok: f64,
}

impl ModelPrice {
    /// Human-readable pricing line for an expert profile.
    pub fn pricing_line(&self, model: &str) -> String {
        format!(
            "{model}: {:.3} sats/1K prompt tokens, {:.3} sats/1K completion tokens",
            self.prompt_sats_per_ktok, self.completion_sats_per_ktok
        )
    }
}

/// Source of model prices.
pub trait PriceFeed: Send + Sync {
    /// Current price for `model`, or `None` if the feed does not carry it.
    fn model_price<'a>(&'a self, model: &'a str) -> OpFuture<'a, Option<ModelPrice>>;
}

/// Fixed in-memory price table.
#[derive(Debug, Default)]
pub struct StaticPriceFeed {
    prices: HashMap<String, ModelPrice>,
}

impl StaticPriceFeed {
    pub fn new(prices: HashMap<String, ModelPrice>) -> Self {
        Self { prices }
    }
}

impl PriceFeed for StaticPriceFeed {
    fn model_price<'a>(&'a self, model: &'a str) -> OpFuture<'a, Option<ModelPrice>> {
        let price = self.prices.get(model).copied();
        Box::pin(async move { Ok(price) })
    }
}

/// HTTP price feed fetching a JSON object of `model → price` entries.
///
/// Responses are cached for `ttl`; a stale cache is served when the
/// upstream is unreachable.
pub struct HttpPriceFeed {
    url: String,
    client: reqwest::Client,
    ttl: Duration,
    cache: Mutex<Option<(Instant, HashMap<String, ModelPrice>)>>,
}

impl HttpPriceFeed {
    pub fn new(url: impl Into<String>, ttl: Duration) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            ttl,
            cache: Mutex::new(None),
        }
    }

    async fn table(&self) -> Result<HashMap<String, ModelPrice>> {
        {
            let cache = self.cache.lock().unwrap();
            if let Some((fetched_at, table)) = cache.as_ref() {
                if fetched_at.elapsed() < self.ttl {
                    return Ok(table.clone());
                }
            }
        }

        match self.fetch().await {
            Ok(table) => {
                *self.cache.lock().unwrap() = Some((Instant::now(), table.clone()));
                Ok(table)
            }
            Err(e) => {
                let cache = self.cache.lock().unwrap();
                if let Some((_, table)) = cache.as_ref() {
                    log::warn!("Price feed refresh failed, serving stale prices: {e}");
                    Ok(table.clone())
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn fetch(&self) -> Result<HashMap<String, ModelPrice>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| Error::Other(format!("Price feed request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Other(format!(
                "Price feed returned {}",
                response.status()
            )));
        }
        response
            .json::<HashMap<String, ModelPrice>>()
            .await
            .map_err(|e| Error::Parse(format!("Malformed price feed response: {e}")))
    }
}

impl PriceFeed for HttpPriceFeed {
    fn model_price<'a>(&'a self, model: &'a str) -> OpFuture<'a, Option<ModelPrice>> {
        Box::pin(async move {
            let table = self.table().await?;
            Ok(table.get(model).copied())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_feed_lookup() {
        let mut prices = HashMap::new();
        prices.insert(
            "gpt-4o".to_string(),
            ModelPrice {
                prompt_sats_per_ktok: 0.5,
                completion_sats_per_ktok: 1.5,
            },
        );
        let feed = StaticPriceFeed::new(prices);

        let price = feed.model_price("gpt-4o").await.unwrap().unwrap();
        assert_eq!(price.prompt_sats_per_ktok, 0.5);
        assert!(feed.model_price("unknown").await.unwrap().is_none());
        assert!(price.pricing_line("gpt-4o").starts_with("gpt-4o: 0.500"));
    }
}
