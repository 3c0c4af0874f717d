//! Domain events and their tenant-scoped envelopes.
//!
//! Voucher workflow transitions are recorded as events; the stored envelopes
//! form each voucher's audit history.

pub mod envelope;
pub mod event;

pub use envelope::EventEnvelope;
pub use event::Event;
