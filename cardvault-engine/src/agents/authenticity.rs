//! Authenticity agent
//!
//! Scores five independent signals (text/visual/hologram/border/font)
//! by comparing the extracted features against reference
//! characteristics for the identified card, combines them with fixed
//! weights, and asks the reasoning adapter for a rationale only when
//! the combined score falls under the counterfeit threshold. The
//! judgment is numeric; missing prose never fails the branch.

use crate::types::{
    AuthenticityPayload, FeatureEnvelope, ReasoningAdapter, ReferenceSignals, SignalScores,
    StepError,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

// Fixed signal weights, summing to 1.0
const WEIGHT_TEXT: f64 = 0.30;
const WEIGHT_VISUAL: f64 = 0.10;
const WEIGHT_HOLOGRAM: f64 = 0.25;
const WEIGHT_BORDER: f64 = 0.20;
const WEIGHT_FONT: f64 = 0.15;

/// Reference characteristics keyed by card fingerprint
///
/// Cards without a curated entry fall back to genre-wide defaults, so
/// the agent always has something to compare against. Updating the
/// catalog does not invalidate cached pricing; staleness there is
/// bounded by the cache TTL alone.
pub struct ReferenceCatalog {
    entries: HashMap<String, ReferenceSignals>,
    fallback: ReferenceSignals,
}

impl ReferenceCatalog {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            fallback: ReferenceSignals {
                expected_text: Vec::new(),
                expected_holo_variance: 0.5,
                expected_border_score: 0.9,
                expected_font_score: 0.9,
            },
        }
    }

    pub fn insert(&mut self, fingerprint: String, signals: ReferenceSignals) {
        self.entries.insert(fingerprint, signals);
    }

    /// Reference signals for a fingerprint, falling back to defaults
    pub fn lookup(&self, fingerprint: &str) -> &ReferenceSignals {
        self.entries.get(fingerprint).unwrap_or(&self.fallback)
    }
}

impl Default for ReferenceCatalog {
    fn default() -> Self {
        Self::new()
    }
}

pub struct AuthenticityAgent {
    catalog: Arc<ReferenceCatalog>,
    reasoning: Arc<dyn ReasoningAdapter>,
    counterfeit_threshold: f64,
}

impl AuthenticityAgent {
    pub fn new(
        catalog: Arc<ReferenceCatalog>,
        reasoning: Arc<dyn ReasoningAdapter>,
        counterfeit_threshold: f64,
    ) -> Self {
        Self {
            catalog,
            reasoning,
            counterfeit_threshold,
        }
    }

    /// Assess authenticity of the extracted features
    pub async fn assess(
        &self,
        envelope: &FeatureEnvelope,
    ) -> Result<AuthenticityPayload, StepError> {
        // A malformed envelope cannot be scored, now or on retry
        for (name, value) in [
            ("holo_variance", envelope.holo_variance),
            ("border_score", envelope.border_score),
            ("font_score", envelope.font_score),
            ("image_quality", envelope.image_quality),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(StepError::UnreadableInput(format!(
                    "feature {} out of range: {}",
                    name, value
                )));
            }
        }

        let fingerprint = envelope.identity.fingerprint();
        let reference = self.catalog.lookup(&fingerprint);

        let signals = score_signals(envelope, reference);
        let score = combine_signals(&signals);
        let likely_counterfeit = score < self.counterfeit_threshold;

        debug!(
            fingerprint = %fingerprint,
            score,
            likely_counterfeit,
            "Authenticity signals scored"
        );

        // Prose is only worth an external call for suspicious cards,
        // and its absence never fails the branch
        let rationale = if likely_counterfeit {
            let prompt = format!(
                "The card {} ({} {}) scored {:.2} overall on authenticity signals \
                 (text {:.2}, visual {:.2}, hologram {:.2}, border {:.2}, font {:.2}), \
                 below the {:.2} threshold. Explain in two sentences which signals \
                 suggest a counterfeit.",
                envelope.identity.name,
                envelope.identity.set_name,
                envelope.identity.number,
                score,
                signals.text,
                signals.visual,
                signals.hologram,
                signals.border,
                signals.font,
                self.counterfeit_threshold,
            );
            match self.reasoning.infer(&prompt).await {
                Ok(text) => text,
                Err(e) => {
                    warn!("Authenticity rationale unavailable (non-fatal): {}", e);
                    String::new()
                }
            }
        } else {
            String::new()
        };

        Ok(AuthenticityPayload {
            score,
            signals,
            likely_counterfeit,
            rationale,
        })
    }
}

/// Score each signal against the reference, all clamped to [0, 1]
fn score_signals(envelope: &FeatureEnvelope, reference: &ReferenceSignals) -> SignalScores {
    SignalScores {
        text: text_score(&envelope.ocr_text, &reference.expected_text),
        visual: envelope.image_quality.clamp(0.0, 1.0),
        hologram: proximity(envelope.holo_variance, reference.expected_holo_variance),
        border: proximity(envelope.border_score, reference.expected_border_score),
        font: proximity(envelope.font_score, reference.expected_font_score),
    }
}

/// Fraction of expected keywords present in the OCR text
///
/// No expectations means no evidence either way; score neutral.
fn text_score(ocr_text: &str, expected: &[String]) -> f64 {
    if expected.is_empty() {
        return 0.5;
    }
    let haystack = ocr_text.to_lowercase();
    let found = expected
        .iter()
        .filter(|kw| haystack.contains(&kw.to_lowercase()))
        .count();
    found as f64 / expected.len() as f64
}

/// Similarity of a measured metric to its reference value
fn proximity(actual: f64, expected: f64) -> f64 {
    (1.0 - (actual - expected).abs()).clamp(0.0, 1.0)
}

fn combine_signals(signals: &SignalScores) -> f64 {
    WEIGHT_TEXT * signals.text
        + WEIGHT_VISUAL * signals.visual
        + WEIGHT_HOLOGRAM * signals.hologram
        + WEIGHT_BORDER * signals.border
        + WEIGHT_FONT * signals.font
}
