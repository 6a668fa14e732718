//! Shared types for the notification dispatch pipeline
//!
//! Used by the ingestion API, the channel workers and anything that reads the
//! queue wire format, so that every process agrees on the shape of a
//! notification, its lifecycle and the queue envelope.

pub mod types;

pub use types::*;
