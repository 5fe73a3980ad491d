//! Analysis agents
//!
//! The two branch agents that run concurrently after feature
//! extraction: pricing (multi-source fusion with caching) and
//! authenticity (signal scoring with a reasoning judgment).

pub mod authenticity;
pub mod pricing;

pub use authenticity::AuthenticityAgent;
pub use pricing::PricingAgent;
