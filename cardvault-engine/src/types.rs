//! Core types and capability traits for the orchestration engine
//!
//! Defines the data contracts between workflow steps and the adapter
//! traits for the three external capabilities (marketplace sources,
//! vision extraction, reasoning). The orchestrator and agents depend
//! only on these traits, so concrete providers can be substituted and
//! mocked in tests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub use cardvault_common::events::{BranchKind, CompletionStatus};

// ============================================================================
// Card Identity
// ============================================================================

/// Condition bucket used for cache fingerprinting
///
/// Coarse on purpose: pricing comps from adjacent raw grades are close
/// enough to share a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionBucket {
    Mint,
    NearMint,
    Played,
    HeavilyPlayed,
    Damaged,
}

impl ConditionBucket {
    pub fn as_str(self) -> &'static str {
        match self {
            ConditionBucket::Mint => "mint",
            ConditionBucket::NearMint => "near_mint",
            ConditionBucket::Played => "played",
            ConditionBucket::HeavilyPlayed => "heavily_played",
            ConditionBucket::Damaged => "damaged",
        }
    }
}

/// Normalized card identity, as resolved by vision extraction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardIdentity {
    pub name: String,
    pub set_name: String,
    pub number: String,
    pub rarity: String,
    pub condition: ConditionBucket,
}

impl CardIdentity {
    /// Cache fingerprint derived from normalized identity attributes
    ///
    /// Normalization: lowercase, trimmed, joined with `|` so that
    /// cosmetic differences in casing or whitespace address the same
    /// cache entry.
    pub fn fingerprint(&self) -> String {
        let normalized = format!(
            "{}|{}|{}|{}|{}",
            self.name.trim().to_lowercase(),
            self.set_name.trim().to_lowercase(),
            self.number.trim().to_lowercase(),
            self.rarity.trim().to_lowercase(),
            self.condition.as_str(),
        );
        let digest = Sha256::digest(normalized.as_bytes());
        format!("{:x}", digest)
    }
}

// ============================================================================
// Feature Envelope (extraction output)
// ============================================================================

/// Immutable output of vision feature extraction
///
/// Produced once per execution and consumed by both analysis branches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureEnvelope {
    /// Reference to the raw image the features were extracted from
    pub image_ref: String,
    /// Card identity resolved by the vision model
    pub identity: CardIdentity,
    /// Confidence in the identification (0.0-1.0)
    pub identification_confidence: f64,
    /// OCR text recovered from the card face
    pub ocr_text: String,
    /// Holographic foil variance metric (0.0-1.0)
    pub holo_variance: f64,
    /// Border geometry metric (0.0-1.0)
    pub border_score: f64,
    /// Font rendering metric (0.0-1.0)
    pub font_score: f64,
    /// Overall image quality metric (0.0-1.0)
    pub image_quality: f64,
}

// ============================================================================
// Pricing types
// ============================================================================

/// One comparable sale as returned by a marketplace source adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparableSale {
    pub price: f64,
    pub date: DateTime<Utc>,
    pub condition: String,
    pub source_name: String,
}

/// Fused low/median/high valuation with a confidence score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Valuation {
    pub low: f64,
    pub median: f64,
    pub high: f64,
    /// Confidence from comp count and recency (0.0-1.0)
    pub confidence: f64,
}

/// Pricing branch payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingPayload {
    pub valuation: Valuation,
    pub sources_used: Vec<String>,
    pub comps_count: usize,
    /// Narrative summary from the reasoning adapter; empty when the
    /// optional reasoning step failed
    pub summary: String,
}

// ============================================================================
// Authenticity types
// ============================================================================

/// Independent authenticity signal scores, each 0.0-1.0
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalScores {
    pub text: f64,
    pub visual: f64,
    pub hologram: f64,
    pub border: f64,
    pub font: f64,
}

/// Reference characteristics for the identified card, compared against
/// extracted features to score each signal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceSignals {
    /// Keywords expected in the OCR text for a genuine print
    pub expected_text: Vec<String>,
    /// Expected holographic variance for this print run
    pub expected_holo_variance: f64,
    /// Expected border geometry metric
    pub expected_border_score: f64,
    /// Expected font rendering metric
    pub expected_font_score: f64,
}

/// Authenticity branch payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticityPayload {
    /// Weighted overall score (0.0-1.0)
    pub score: f64,
    pub signals: SignalScores,
    pub likely_counterfeit: bool,
    /// Rationale from the reasoning adapter; empty when reasoning was
    /// unavailable (the judgment does not depend on prose)
    pub rationale: String,
}

// ============================================================================
// Branch outcomes
// ============================================================================

/// Captured terminal failure of a workflow step or branch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchFailure {
    pub error: String,
    pub class: ErrorClass,
}

/// Terminal outcome of one analysis branch, as handed to the aggregator
///
/// The orchestrator always wraps branch results in this type; the
/// aggregator unwraps exclusively through [`BranchOutcome::payload`].
/// Nothing downstream ever sees a bare payload or an auto-wrapped map.
#[derive(Debug, Clone)]
pub struct BranchOutcome<T> {
    pub branch: BranchKind,
    /// Attempts consumed, including the successful one
    pub attempts: u32,
    pub result: Result<T, BranchFailure>,
}

impl<T> BranchOutcome<T> {
    pub fn succeeded(branch: BranchKind, attempts: u32, payload: T) -> Self {
        Self {
            branch,
            attempts,
            result: Ok(payload),
        }
    }

    pub fn failed(branch: BranchKind, attempts: u32, failure: BranchFailure) -> Self {
        Self {
            branch,
            attempts,
            result: Err(failure),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// The branch payload, or None if the branch terminally failed
    pub fn payload(&self) -> Option<&T> {
        self.result.as_ref().ok()
    }

    pub fn failure(&self) -> Option<&BranchFailure> {
        self.result.as_ref().err()
    }
}

// ============================================================================
// Aggregated result
// ============================================================================

/// The final fused record persisted to the record store
///
/// Append-only from the client's perspective: a revalue request writes a
/// new version (higher `version`), never mutates the old one in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub card_id: String,
    pub execution_id: Uuid,
    pub version: i64,
    pub identity: CardIdentity,
    pub identification_confidence: f64,
    /// Absent (not zeroed) when the authenticity branch failed
    pub authenticity: Option<AuthenticityPayload>,
    /// Absent (not zeroed) when the pricing branch failed
    pub valuation: Option<PricingPayload>,
    pub status: CompletionStatus,
    pub completed_at: DateTime<Utc>,
}

// ============================================================================
// Step errors
// ============================================================================

/// Failure classification driving the retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Retryable within the step's budget
    Transient,
    /// Fail fast, no retry
    Permanent,
    /// Treated conservatively: one retry, then permanent
    Unknown,
}

/// Error from a single workflow step or adapter call
#[derive(Debug, Clone, Error)]
pub enum StepError {
    /// Network-level failure reaching an external capability
    #[error("Network error: {0}")]
    Network(String),

    /// External service throttled the request
    #[error("Throttled: {0}")]
    Throttled(String),

    /// External call exceeded its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Every configured pricing source failed for this attempt
    #[error("All pricing sources unavailable: {0}")]
    AllSourcesUnavailable(String),

    /// Input the capability cannot ever process (corrupt image, etc.)
    #[error("Unreadable input: {0}")]
    UnreadableInput(String),

    /// External API rejected the request
    #[error("API error: {0}")]
    Api(String),

    /// Response could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Internal processing error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StepError {
    /// Classify for the retry policy
    pub fn class(&self) -> ErrorClass {
        match self {
            StepError::Network(_)
            | StepError::Throttled(_)
            | StepError::Timeout(_)
            | StepError::AllSourcesUnavailable(_) => ErrorClass::Transient,
            StepError::UnreadableInput(_) | StepError::Api(_) => ErrorClass::Permanent,
            StepError::Parse(_) | StepError::Internal(_) => ErrorClass::Unknown,
        }
    }

    pub fn into_failure(self) -> BranchFailure {
        BranchFailure {
            class: self.class(),
            error: self.to_string(),
        }
    }
}

// ============================================================================
// Capability traits
// ============================================================================

/// Marketplace pricing source
///
/// One implementation per external marketplace. Implementations own
/// their HTTP specifics (auth, rate limiting, response shape); the
/// pricing agent only sees comparable sales.
#[async_trait::async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Source name for provenance tracking
    fn name(&self) -> &'static str;

    /// Fetch comparable sales for the identified card
    async fn fetch_comparables(
        &self,
        identity: &CardIdentity,
    ) -> Result<Vec<ComparableSale>, StepError>;
}

/// Vision feature extraction capability
#[async_trait::async_trait]
pub trait VisionAdapter: Send + Sync {
    /// Extract a feature envelope from the referenced image
    async fn extract(&self, image_ref: &str) -> Result<FeatureEnvelope, StepError>;
}

/// Opaque LLM-style reasoning capability
#[async_trait::async_trait]
pub trait ReasoningAdapter: Send + Sync {
    /// Produce a free-text inference for the given prompt
    async fn infer(&self, prompt: &str) -> Result<String, StepError>;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> CardIdentity {
        CardIdentity {
            name: "Charizard".to_string(),
            set_name: "Base Set".to_string(),
            number: "4/102".to_string(),
            rarity: "Holo Rare".to_string(),
            condition: ConditionBucket::NearMint,
        }
    }

    #[test]
    fn test_fingerprint_normalizes_case_and_whitespace() {
        let a = identity();
        let mut b = identity();
        b.name = "  CHARIZARD ".to_string();
        b.set_name = "base set".to_string();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_differs_per_condition() {
        let a = identity();
        let mut b = identity();
        b.condition = ConditionBucket::Played;
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_step_error_classification() {
        assert_eq!(
            StepError::Timeout("t".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            StepError::AllSourcesUnavailable("all down".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            StepError::UnreadableInput("corrupt".into()).class(),
            ErrorClass::Permanent
        );
        assert_eq!(
            StepError::Internal("?".into()).class(),
            ErrorClass::Unknown
        );
    }

    #[test]
    fn test_branch_outcome_payload_access() {
        let ok: BranchOutcome<u32> = BranchOutcome::succeeded(BranchKind::Pricing, 1, 7);
        assert!(ok.is_success());
        assert_eq!(ok.payload(), Some(&7));
        assert!(ok.failure().is_none());

        let failed: BranchOutcome<u32> = BranchOutcome::failed(
            BranchKind::Authenticity,
            3,
            StepError::Timeout("deadline".into()).into_failure(),
        );
        assert!(!failed.is_success());
        assert!(failed.payload().is_none());
        assert_eq!(failed.failure().unwrap().class, ErrorClass::Transient);
    }
}
