//! Concrete adapters for the external capabilities
//!
//! One reqwest-backed implementation per capability: the vision
//! extractor, the reasoning service, and one adapter per marketplace
//! pricing source. The rest of the engine depends only on the traits in
//! [`crate::types`], so these are substitutable and mockable.

mod markets;
mod reasoning;
mod vision;

pub use markets::{AuctionArchiveAdapter, TcgPortalAdapter};
pub use reasoning::HttpReasoningAdapter;
pub use vision::HttpVisionAdapter;

use crate::types::StepError;

/// Map a reqwest transport error to a classified step error
pub(crate) fn transport_error(context: &str, e: reqwest::Error) -> StepError {
    if e.is_timeout() {
        StepError::Timeout(format!("{}: {}", context, e))
    } else {
        StepError::Network(format!("{}: {}", context, e))
    }
}

/// Map a non-success HTTP status to a classified step error
pub(crate) fn status_error(context: &str, status: reqwest::StatusCode) -> StepError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        StepError::Throttled(format!("{}: HTTP 429", context))
    } else if status.is_server_error() {
        // Upstream 5xx is worth retrying
        StepError::Network(format!("{}: HTTP {}", context, status))
    } else {
        StepError::Api(format!("{}: HTTP {}", context, status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorClass;

    #[test]
    fn test_status_classification() {
        assert_eq!(
            status_error("t", reqwest::StatusCode::TOO_MANY_REQUESTS).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            status_error("t", reqwest::StatusCode::BAD_GATEWAY).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            status_error("t", reqwest::StatusCode::NOT_FOUND).class(),
            ErrorClass::Permanent
        );
    }
}
