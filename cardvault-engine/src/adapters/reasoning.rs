//! Reasoning adapter
//!
//! Opaque LLM-style capability used for pricing narratives and
//! authenticity rationales. Both call sites tolerate its failure, so
//! errors here never fail a branch on their own.

use crate::adapters::{status_error, transport_error};
use crate::types::{ReasoningAdapter, StepError};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Serialize)]
struct InferRequest<'a> {
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct InferResponse {
    text: String,
}

/// HTTP client for the reasoning service
pub struct HttpReasoningAdapter {
    http_client: Client,
    base_url: String,
}

impl HttpReasoningAdapter {
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
}

#[async_trait::async_trait]
impl ReasoningAdapter for HttpReasoningAdapter {
    async fn infer(&self, prompt: &str) -> Result<String, StepError> {
        debug!(prompt_len = prompt.len(), "Requesting inference");

        let url = format!("{}/v1/infer", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .json(&InferRequest { prompt })
            .send()
            .await
            .map_err(|e| transport_error("reasoning infer", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error("reasoning infer", status));
        }

        let body: InferResponse = response
            .json()
            .await
            .map_err(|e| StepError::Parse(format!("reasoning response: {}", e)))?;

        Ok(body.text)
    }
}
