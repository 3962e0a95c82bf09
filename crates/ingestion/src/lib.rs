//! Ingestion: the data-plane pipeline, platform health tracking, and the
//! degradation protocol.

pub mod degradation;
pub mod health;
pub mod pipeline;

pub use degradation::{DegradationProtocol, DegradationReason, DegradationState};
pub use health::HealthTracker;
pub use pipeline::{IngestionConfig, IngestionPipeline};
