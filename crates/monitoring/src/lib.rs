//! Monitoring: the tamper-evident audit log and the alert pipeline.

pub mod alerts;
pub mod audit;

pub use alerts::{
    classify, info_deliverable, AlertMessage, AlertService, AlertServiceConfig, Severity,
};
pub use audit::{canonical_json, compute_entry_hash, AuditLog, ChainVerification, GENESIS_HASH};
