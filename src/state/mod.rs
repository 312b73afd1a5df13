//! The on-disk state store (§4.10): network snapshots, verbatim create
//! payloads, and the running-set snapshot, all written via temp-file +
//! atomic rename and tolerant of absence on read.

pub mod store;

pub use store::{atomic_write, read_json, redact_payload, CreatePayload, NetworkSnapshot, RunningSet};
