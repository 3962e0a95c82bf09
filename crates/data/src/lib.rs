//! Persistence for the arbitrage engine: the sink contract, an in-memory
//! test double, and the Postgres repositories.

pub mod postgres;
pub mod sink;

pub use postgres::PostgresSink;
pub use sink::{AuditRecord, MemorySink, PersistenceSink, SinkError, StoredAuditRecord};
