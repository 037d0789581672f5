//! Prefixed ID generation.
//!
//! Decision records and queued operations carry a `prefix_` followed by a
//! UUIDv7, so ids sort by creation time and identify their kind in logs.

use uuid::Uuid;

/// Generate a prefixed ID using UUIDv7.
fn prefixed_id(prefix: &str) -> String {
    let id = Uuid::now_v7();
    format!("{}_{}", prefix, id.as_simple())
}

/// Generate a handover decision ID: `dec_<uuid7>`
pub fn decision_id() -> String {
    prefixed_id("dec")
}

/// Generate a queued operation ID: `op_<uuid7>`
pub fn operation_id() -> String {
    prefixed_id("op")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_have_correct_prefix() {
        assert!(decision_id().starts_with("dec_"));
        assert!(operation_id().starts_with("op_"));
    }

    #[test]
    fn ids_are_unique() {
        let a = operation_id();
        let b = operation_id();
        assert_ne!(a, b);
    }
}
