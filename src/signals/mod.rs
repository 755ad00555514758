// =============================================================================
// Candidate-Coin Signal Sources — ranked symbol feeds
// =============================================================================
//
// Two black-box HTTP providers each return a ranked list of symbols: the
// coin-pool feed and the open-interest-top feed. Either may be disabled per
// trader. The merged list is cached process-wide for a short window so many
// traders polling on similar schedules don't hammer the providers; the cache
// is a constructed singleton injected at trader-creation time so tests can
// supply fakes.
// =============================================================================

use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::types::{normalize_symbol, CandidateCoin, SourceTag};

/// How long a fetched ranking stays fresh.
const SOURCE_CACHE_TTL: Duration = Duration::from_secs(60);

/// Cap applied to each provider's ranking before merging.
const PER_SOURCE_LIMIT: usize = 30;

/// Shared candidate-coin source with a short-lived merge cache.
pub struct CandidateSources {
    client: reqwest::Client,
    coin_pool_url: Option<String>,
    oi_top_url: Option<String>,
    cache: RwLock<Option<(Instant, Vec<CandidateCoin>)>>,
}

impl CandidateSources {
    /// Build from provider endpoints; `None` disables that provider globally.
    pub fn new(coin_pool_url: Option<String>, oi_top_url: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client for CandidateSources");
        Self {
            client,
            coin_pool_url,
            oi_top_url,
            cache: RwLock::new(None),
        }
    }

    /// Endpoints from `COIN_POOL_URL` / `OI_TOP_URL` env vars.
    pub fn from_env() -> Self {
        Self::new(
            std::env::var("COIN_POOL_URL").ok().filter(|s| !s.is_empty()),
            std::env::var("OI_TOP_URL").ok().filter(|s| !s.is_empty()),
        )
    }

    /// Return the merged candidate ranking, honouring the per-trader source
    /// flags. Provider failures degrade to an empty contribution.
    pub async fn candidates(&self, use_coin_pool: bool, use_oi_top: bool) -> Vec<CandidateCoin> {
        let merged = self.merged_ranking().await;
        merged
            .into_iter()
            .filter_map(|mut c| {
                c.sources.retain(|s| match s {
                    SourceTag::CoinPool => use_coin_pool,
                    SourceTag::OiTop => use_oi_top,
                    _ => true,
                });
                (!c.sources.is_empty()).then_some(c)
            })
            .collect()
    }

    async fn merged_ranking(&self) -> Vec<CandidateCoin> {
        if let Some((at, cached)) = self.cache.read().as_ref() {
            if at.elapsed() < SOURCE_CACHE_TTL {
                return cached.clone();
            }
        }

        let mut merged: Vec<CandidateCoin> = Vec::new();

        if let Some(url) = &self.coin_pool_url {
            match self.fetch_ranking(url).await {
                Ok(symbols) => merge_into(&mut merged, symbols, SourceTag::CoinPool),
                Err(e) => warn!(url, error = %e, "coin-pool feed failed"),
            }
        }

        if let Some(url) = &self.oi_top_url {
            match self.fetch_ranking(url).await {
                Ok(symbols) => merge_into(&mut merged, symbols, SourceTag::OiTop),
                Err(e) => warn!(url, error = %e, "oi-top feed failed"),
            }
        }

        debug!(count = merged.len(), "candidate ranking refreshed");
        *self.cache.write() = Some((Instant::now(), merged.clone()));
        merged
    }

    /// Fetch one provider's ranked symbol list.
    ///
    /// Accepts either a bare JSON array or an object with a `data` array;
    /// elements may be plain strings or objects carrying a `symbol` field.
    async fn fetch_ranking(&self, url: &str) -> anyhow::Result<Vec<String>> {
        let body: serde_json::Value = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(parse_ranking(&body))
    }
}

/// Lenient extraction of a ranked symbol list from a provider response.
fn parse_ranking(body: &serde_json::Value) -> Vec<String> {
    let arr = body
        .as_array()
        .or_else(|| body.get("data").and_then(|d| d.as_array()));

    let Some(arr) = arr else {
        return Vec::new();
    };

    arr.iter()
        .filter_map(|entry| {
            entry
                .as_str()
                .or_else(|| entry.get("symbol").and_then(|s| s.as_str()))
        })
        .map(normalize_symbol)
        .take(PER_SOURCE_LIMIT)
        .collect()
}

/// Merge `symbols` into the ranking, tagging duplicates instead of repeating.
fn merge_into(merged: &mut Vec<CandidateCoin>, symbols: Vec<String>, tag: SourceTag) {
    for symbol in symbols {
        match merged.iter_mut().find(|c| c.symbol == symbol) {
            Some(existing) => existing.tag(tag),
            None => merged.push(CandidateCoin::new(symbol, tag)),
        }
    }
}
