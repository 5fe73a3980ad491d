//! Pricing agent
//!
//! Consults the pricing cache, else fans out to every configured
//! marketplace source concurrently, fuses whatever subset returned
//! data, and writes the fused result back to the cache. Partial source
//! failures are tolerated; only a total source failure fails the agent
//! (as `AllSourcesUnavailable`, transient — the orchestrator's branch
//! retry budget owns the rest). The narrative summary is optional: a
//! reasoning failure leaves it empty but never fails the agent.

use crate::cache::PricingCache;
use crate::types::{
    CardIdentity, ComparableSale, FeatureEnvelope, PricingPayload, ReasoningAdapter,
    SourceAdapter, StepError, Valuation,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Modified z-score bound for MAD outlier rejection
const OUTLIER_Z_BOUND: f64 = 3.5;

/// Comps newer than this count as recent for the confidence score
const RECENCY_WINDOW_DAYS: i64 = 90;

pub struct PricingAgent {
    cache: PricingCache,
    sources: Vec<Arc<dyn SourceAdapter>>,
    reasoning: Arc<dyn ReasoningAdapter>,
    source_timeout: Duration,
}

impl PricingAgent {
    pub fn new(
        cache: PricingCache,
        sources: Vec<Arc<dyn SourceAdapter>>,
        reasoning: Arc<dyn ReasoningAdapter>,
        source_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            sources,
            reasoning,
            source_timeout,
        }
    }

    /// Produce a fused valuation for the identified card
    pub async fn price(
        &self,
        identity: &CardIdentity,
        envelope: &FeatureEnvelope,
        force_refresh: bool,
    ) -> Result<PricingPayload, StepError> {
        let fingerprint = identity.fingerprint();

        if !force_refresh {
            // A cache read failure is not worth failing the branch over
            match self.cache.get(&fingerprint).await {
                Ok(Some(entry)) => {
                    info!(fingerprint = %fingerprint, "Serving pricing from cache");
                    return Ok(entry.payload);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(fingerprint = %fingerprint, "Pricing cache read failed, treating as miss: {}", e);
                }
            }
        }

        let comps = self.fetch_all_sources(identity).await?;
        let sources_used = distinct_sources(&comps);
        let now = Utc::now();

        let retained = reject_outliers(&comps);
        let valuation = fuse_valuation(&retained, now).ok_or_else(|| {
            StepError::AllSourcesUnavailable("no comparable sales returned".to_string())
        })?;

        let summary = self.summarize(identity, envelope, &valuation, retained.len()).await;

        let payload = PricingPayload {
            valuation,
            sources_used,
            comps_count: retained.len(),
            summary,
        };

        // Always write back, so forced refreshes overwrite stale entries
        if let Err(e) = self.cache.put(&fingerprint, &payload).await {
            warn!(fingerprint = %fingerprint, "Pricing cache write failed: {}", e);
        }

        Ok(payload)
    }

    /// Query every configured source concurrently with an individual
    /// deadline; succeed if at least one source returned data
    async fn fetch_all_sources(
        &self,
        identity: &CardIdentity,
    ) -> Result<Vec<ComparableSale>, StepError> {
        let futures = self.sources.iter().map(|source| {
            let name = source.name();
            async move {
                let result =
                    tokio::time::timeout(self.source_timeout, source.fetch_comparables(identity))
                        .await;
                match result {
                    Ok(Ok(comps)) => Ok(comps),
                    Ok(Err(e)) => Err((name, e)),
                    Err(_) => Err((
                        name,
                        StepError::Timeout(format!("source {} exceeded deadline", name)),
                    )),
                }
            }
        });

        let results = futures::future::join_all(futures).await;

        let mut comps = Vec::new();
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(mut source_comps) => comps.append(&mut source_comps),
                Err((name, e)) => {
                    warn!(source = name, "Pricing source failed (non-fatal): {}", e);
                    failures.push(format!("{}: {}", name, e));
                }
            }
        }

        if comps.is_empty() && failures.len() == self.sources.len() {
            return Err(StepError::AllSourcesUnavailable(failures.join("; ")));
        }

        debug!(comps = comps.len(), failed_sources = failures.len(), "Source fan-out complete");
        Ok(comps)
    }

    /// Optional narrative summary; failures degrade to an empty string
    async fn summarize(
        &self,
        identity: &CardIdentity,
        envelope: &FeatureEnvelope,
        valuation: &Valuation,
        comps_count: usize,
    ) -> String {
        let prompt = format!(
            "Summarize the market for {} ({} {}, {}, condition {}) in two sentences. \
             Fused valuation: low ${:.2}, median ${:.2}, high ${:.2} from {} comparable sales. \
             Image quality during identification: {:.2}.",
            identity.name,
            identity.set_name,
            identity.number,
            identity.rarity,
            identity.condition.as_str(),
            valuation.low,
            valuation.median,
            valuation.high,
            comps_count,
            envelope.image_quality,
        );

        match self.reasoning.infer(&prompt).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Pricing summary unavailable (non-fatal): {}", e);
                String::new()
            }
        }
    }
}

fn distinct_sources(comps: &[ComparableSale]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for comp in comps {
        if !names.iter().any(|n| n == &comp.source_name) {
            names.push(comp.source_name.clone());
        }
    }
    names
}

fn median_of_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Discard statistical outliers using the MAD-based modified z-score
///
/// A comp is rejected when `0.6745 * |price - median| / MAD` exceeds
/// the configured bound. With a zero MAD (most comps identical) any
/// deviating price is an outlier.
pub fn reject_outliers(comps: &[ComparableSale]) -> Vec<ComparableSale> {
    if comps.len() < 3 {
        return comps.to_vec();
    }

    let mut prices: Vec<f64> = comps.iter().map(|c| c.price).collect();
    prices.sort_by(|a, b| a.total_cmp(b));
    let med = median_of_sorted(&prices);

    let mut deviations: Vec<f64> = prices.iter().map(|p| (p - med).abs()).collect();
    deviations.sort_by(|a, b| a.total_cmp(b));
    let mad = median_of_sorted(&deviations);

    comps
        .iter()
        .filter(|c| {
            let deviation = (c.price - med).abs();
            if mad == 0.0 {
                deviation < f64::EPSILON
            } else {
                0.6745 * deviation / mad <= OUTLIER_Z_BOUND
            }
        })
        .cloned()
        .collect()
}

/// Compute low/median/high and a confidence from comp count and recency
///
/// Returns None for an empty comp set.
pub fn fuse_valuation(comps: &[ComparableSale], now: DateTime<Utc>) -> Option<Valuation> {
    if comps.is_empty() {
        return None;
    }

    let mut prices: Vec<f64> = comps.iter().map(|c| c.price).collect();
    prices.sort_by(|a, b| a.total_cmp(b));

    let recency_cutoff = now - ChronoDuration::days(RECENCY_WINDOW_DAYS);
    let recent = comps.iter().filter(|c| c.date >= recency_cutoff).count();

    let count_factor = (comps.len() as f64 / 10.0).min(1.0);
    let recency_factor = recent as f64 / comps.len() as f64;
    let confidence = 0.6 * count_factor + 0.4 * recency_factor;

    Some(Valuation {
        low: prices[0],
        median: median_of_sorted(&prices),
        high: prices[prices.len() - 1],
        confidence,
    })
}
