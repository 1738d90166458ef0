//! HTTP API handlers for doccat-ingest
//!
//! REST for session lifecycle, review batches, decisions and clusters; SSE
//! for progress.

pub mod batches;
pub mod clusters;
pub mod firms;
pub mod health;
pub mod sessions;
pub mod sse;
pub mod validation;

pub use batches::batch_routes;
pub use clusters::cluster_routes;
pub use firms::firm_routes;
pub use health::health_routes;
pub use sessions::session_routes;
pub use sse::event_stream;
pub use validation::validation_routes;
