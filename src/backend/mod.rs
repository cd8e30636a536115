//! # Backend Ingestion
//!
//! ```text
//! broker ──► Ingestor (suction/+/state) ──► TopicRouter ──► StateStore
//! ```
//!
//! - `router.rs`   - topic → room, payload → store writes, absent-field policy
//! - `ingestor.rs` - MQTT subscription task with statum lifecycle and a handle

pub mod ingestor;
pub mod router;

pub use ingestor::{IngestStats, Ingestor, IngestorHandle, IngestorSettings};
pub use router::{AbsentFieldPolicy, RouteOutcome, TopicRouter};
