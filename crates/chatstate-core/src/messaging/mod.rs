//! Platform-facing abstractions: the outbound port and the inbound update model.

pub mod port;
pub mod types;
