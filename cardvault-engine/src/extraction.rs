//! Feature extraction step
//!
//! Single external call to the vision adapter, wrapped in an explicit
//! deadline. The orchestrator runs it through the shared retry policy;
//! a permanent failure here short-circuits the whole execution since
//! both branches depend on the envelope.

use crate::types::{FeatureEnvelope, StepError, VisionAdapter};
use std::sync::Arc;
use std::time::Duration;

/// Deadline-wrapped vision extraction
pub struct FeatureExtractor {
    vision: Arc<dyn VisionAdapter>,
    timeout: Duration,
}

impl FeatureExtractor {
    pub fn new(vision: Arc<dyn VisionAdapter>, timeout: Duration) -> Self {
        Self { vision, timeout }
    }

    /// Extract the feature envelope for an image reference
    pub async fn extract(&self, image_ref: &str) -> Result<FeatureEnvelope, StepError> {
        match tokio::time::timeout(self.timeout, self.vision.extract(image_ref)).await {
            Ok(result) => result,
            Err(_) => Err(StepError::Timeout(format!(
                "vision extraction exceeded {:?} for {}",
                self.timeout, image_ref
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CardIdentity, ConditionBucket, ErrorClass};

    struct SlowVision;

    #[async_trait::async_trait]
    impl VisionAdapter for SlowVision {
        async fn extract(&self, image_ref: &str) -> Result<FeatureEnvelope, StepError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(FeatureEnvelope {
                image_ref: image_ref.to_string(),
                identity: CardIdentity {
                    name: "x".into(),
                    set_name: "y".into(),
                    number: "1".into(),
                    rarity: "common".into(),
                    condition: ConditionBucket::Played,
                },
                identification_confidence: 1.0,
                ocr_text: String::new(),
                holo_variance: 0.5,
                border_score: 0.5,
                font_score: 0.5,
                image_quality: 0.5,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_extraction_times_out_as_transient() {
        let extractor = FeatureExtractor::new(Arc::new(SlowVision), Duration::from_secs(15));
        let err = extractor.extract("img1").await.unwrap_err();
        assert!(matches!(err, StepError::Timeout(_)));
        assert_eq!(err.class(), ErrorClass::Transient);
    }
}
