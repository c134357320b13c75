//! Small helpers for ids, timing and paths.

pub mod paths;
pub mod timestamps;

pub use paths::{expand_home, is_plain_name};
pub use timestamps::elapsed_ms;

use uuid::Uuid;

/// Generates a new UUID v7 (time-ordered). Used for run ids.
#[must_use]
pub fn generate_uuid_v7() -> Uuid {
    Uuid::now_v7()
}
