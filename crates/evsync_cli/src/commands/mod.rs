//! CLI command implementations.

pub mod intervals;
pub mod replay;
pub mod stream_id;
