//! Vision extraction adapter
//!
//! Wraps the external vision feature-extraction service. The service
//! resolves the card identity from the photograph and computes the
//! visual metrics both analysis branches consume.

use crate::adapters::{status_error, transport_error};
use crate::types::{CardIdentity, ConditionBucket, FeatureEnvelope, StepError, VisionAdapter};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Response shape of the vision service
#[derive(Debug, Deserialize)]
struct VisionResponse {
    name: String,
    set_name: String,
    number: String,
    rarity: String,
    condition: String,
    identification_confidence: f64,
    ocr_text: String,
    holo_variance: f64,
    border_score: f64,
    font_score: f64,
    image_quality: f64,
}

#[derive(Debug, Serialize)]
struct VisionRequest<'a> {
    image_ref: &'a str,
}

/// HTTP client for the vision extraction service
pub struct HttpVisionAdapter {
    http_client: Client,
    base_url: String,
}

impl HttpVisionAdapter {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self, StepError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StepError::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            http_client,
            base_url,
        })
    }

    fn parse_condition(raw: &str) -> ConditionBucket {
        match raw.to_lowercase().as_str() {
            "mint" => ConditionBucket::Mint,
            "near_mint" | "nm" => ConditionBucket::NearMint,
            "heavily_played" | "hp" => ConditionBucket::HeavilyPlayed,
            "damaged" => ConditionBucket::Damaged,
            _ => ConditionBucket::Played,
        }
    }
}

#[async_trait::async_trait]
impl VisionAdapter for HttpVisionAdapter {
    async fn extract(&self, image_ref: &str) -> Result<FeatureEnvelope, StepError> {
        debug!(image_ref, "Requesting vision extraction");

        let url = format!("{}/v1/extract", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .json(&VisionRequest { image_ref })
            .send()
            .await
            .map_err(|e| transport_error("vision extract", e))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNPROCESSABLE_ENTITY {
            // The service could not read the image at all; retrying
            // the same bytes cannot succeed
            return Err(StepError::UnreadableInput(format!(
                "vision service rejected image {}",
                image_ref
            )));
        }
        if !status.is_success() {
            return Err(status_error("vision extract", status));
        }

        let body: VisionResponse = response
            .json()
            .await
            .map_err(|e| StepError::Parse(format!("vision response: {}", e)))?;

        Ok(FeatureEnvelope {
            image_ref: image_ref.to_string(),
            identity: CardIdentity {
                name: body.name,
                set_name: body.set_name,
                number: body.number,
                rarity: body.rarity,
                condition: Self::parse_condition(&body.condition),
            },
            identification_confidence: body.identification_confidence,
            ocr_text: body.ocr_text,
            holo_variance: body.holo_variance,
            border_score: body.border_score,
            font_score: body.font_score,
            image_quality: body.image_quality,
        })
    }
}
