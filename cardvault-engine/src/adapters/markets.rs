//! Marketplace source adapters
//!
//! One adapter per external marketplace, each mapping its own response
//! shape to the common [`ComparableSale`] contract. TCG Portal enforces
//! a 1 request/second limit per its terms of service, so that adapter
//! carries a rate limiter; Auction Archive does not.

use crate::adapters::{status_error, transport_error};
use crate::types::{CardIdentity, ComparableSale, SourceAdapter, StepError};
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Rate limit for TCG Portal (1 request/second per their TOS)
const TCG_PORTAL_RATE_INTERVAL: Duration = Duration::from_millis(1000);

// ============================================================================
// TCG Portal
// ============================================================================

#[derive(Debug, Deserialize)]
struct TcgPortalListing {
    sold_price: f64,
    sold_date: DateTime<Utc>,
    condition: String,
}

#[derive(Debug, Deserialize)]
struct TcgPortalResponse {
    listings: Vec<TcgPortalListing>,
}

/// Adapter for the TCG Portal sold-listings API
pub struct TcgPortalAdapter {
    http_client: Client,
    base_url: String,
    /// Last request time, for the 1 req/sec limit
    rate_limiter: Arc<Mutex<Option<Instant>>>,
}

impl TcgPortalAdapter {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self, StepError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StepError::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            http_client,
            base_url,
            rate_limiter: Arc::new(Mutex::new(None)),
        })
    }

    /// Sleep if necessary to maintain the 1 req/sec limit
    async fn enforce_rate_limit(&self) {
        let mut last_request = self.rate_limiter.lock().await;

        if let Some(last_time) = *last_request {
            let elapsed = last_time.elapsed();
            if elapsed < TCG_PORTAL_RATE_INTERVAL {
                let sleep_duration = TCG_PORTAL_RATE_INTERVAL - elapsed;
                debug!(
                    sleep_ms = sleep_duration.as_millis() as u64,
                    "Rate limiting: sleeping before TCG Portal request"
                );
                sleep(sleep_duration).await;
            }
        }

        *last_request = Some(Instant::now());
    }
}

#[async_trait::async_trait]
impl SourceAdapter for TcgPortalAdapter {
    fn name(&self) -> &'static str {
        "tcg_portal"
    }

    async fn fetch_comparables(
        &self,
        identity: &CardIdentity,
    ) -> Result<Vec<ComparableSale>, StepError> {
        self.enforce_rate_limit().await;

        let url = format!("{}/v2/sold", self.base_url);
        let response = self
            .http_client
            .get(&url)
            .query(&[
                ("name", identity.name.as_str()),
                ("set", identity.set_name.as_str()),
                ("number", identity.number.as_str()),
                ("condition", identity.condition.as_str()),
            ])
            .send()
            .await
            .map_err(|e| transport_error("tcg_portal sold", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error("tcg_portal sold", status));
        }

        let body: TcgPortalResponse = response
            .json()
            .await
            .map_err(|e| StepError::Parse(format!("tcg_portal response: {}", e)))?;

        debug!(count = body.listings.len(), "TCG Portal returned listings");

        Ok(body
            .listings
            .into_iter()
            .map(|l| ComparableSale {
                price: l.sold_price,
                date: l.sold_date,
                condition: l.condition,
                source_name: "tcg_portal".to_string(),
            })
            .collect())
    }
}

// ============================================================================
// Auction Archive
// ============================================================================

#[derive(Debug, Deserialize)]
struct AuctionLot {
    hammer_price: f64,
    /// Auction close date, YYYY-MM-DD
    closed_on: String,
    grade: String,
}

#[derive(Debug, Deserialize)]
struct AuctionArchiveResponse {
    lots: Vec<AuctionLot>,
}

/// Adapter for the Auction Archive closed-lots API
pub struct AuctionArchiveAdapter {
    http_client: Client,
    base_url: String,
}

impl AuctionArchiveAdapter {
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

    fn parse_close_date(raw: &str) -> Result<DateTime<Utc>, StepError> {
        let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map_err(|e| StepError::Parse(format!("auction close date '{}': {}", raw, e)))?;
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| StepError::Parse(format!("auction close date '{}'", raw)))?;
        Ok(DateTime::from_naive_utc_and_offset(midnight, Utc))
    }
}

#[async_trait::async_trait]
impl SourceAdapter for AuctionArchiveAdapter {
    fn name(&self) -> &'static str {
        "auction_archive"
    }

    async fn fetch_comparables(
        &self,
        identity: &CardIdentity,
    ) -> Result<Vec<ComparableSale>, StepError> {
        let url = format!("{}/api/lots/closed", self.base_url);
        let query = format!("{} {} {}", identity.name, identity.set_name, identity.number);

        let response = self
            .http_client
            .get(&url)
            .query(&[("q", query.as_str())])
            .send()
            .await
            .map_err(|e| transport_error("auction_archive lots", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error("auction_archive lots", status));
        }

        let body: AuctionArchiveResponse = response
            .json()
            .await
            .map_err(|e| StepError::Parse(format!("auction_archive response: {}", e)))?;

        debug!(count = body.lots.len(), "Auction Archive returned lots");

        body.lots
            .into_iter()
            .map(|lot| {
                Ok(ComparableSale {
                    price: lot.hammer_price,
                    date: Self::parse_close_date(&lot.closed_on)?,
                    condition: lot.grade,
                    source_name: "auction_archive".to_string(),
                })
            })
            .collect()
    }
}
