//! HTTP API handlers for cardvault-engine
//!
//! Submission plus the thin read surface: clients poll the record store
//! for results; SSE carries completion events to downstream
//! subscribers.

pub mod health;
pub mod records;
pub mod sse;
pub mod submit;

pub use health::health_routes;
pub use records::record_routes;
pub use sse::event_stream;
pub use submit::submit_routes;
