//! Utility functions for id generation, validation and timestamps.

mod ids;
pub mod timestamps;
mod validation;

pub use ids::{generate_correlation_id, generate_run_id};
pub use timestamps::{compact_timestamp, format_iso8601, iso_timestamp, now_utc, Timestamp};
pub use validation::{validate_run_id, validate_stage_name, InvalidNameError};
