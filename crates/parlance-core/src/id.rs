//! Prefixed opaque identifiers.
//!
//! Every persisted entity carries a stable id allocated once at creation:
//! `conv_` conversations, `msg_` messages, `snt_` sentences, `tu_` tool
//! uses, `mem_` memory entries. The payload is a UUIDv7 so ids sort by
//! creation time.

use uuid::Uuid;

pub fn conversation() -> String {
    prefixed("conv")
}

pub fn message() -> String {
    prefixed("msg")
}

pub fn sentence() -> String {
    prefixed("snt")
}

pub fn tool_use() -> String {
    prefixed("tu")
}

pub fn memory() -> String {
    prefixed("mem")
}

fn prefixed(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::now_v7().simple())
}

/// Check that `id` carries the expected prefix (e.g. `"conv"`).
pub fn has_prefix(id: &str, prefix: &str) -> bool {
    id.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('_'))
        .is_some_and(|payload| !payload.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_prefixes() {
        assert!(has_prefix(&conversation(), "conv"));
        assert!(has_prefix(&message(), "msg"));
        assert!(has_prefix(&sentence(), "snt"));
        assert!(has_prefix(&tool_use(), "tu"));
        assert!(has_prefix(&memory(), "mem"));
    }

    #[test]
    fn ids_are_unique() {
        let a = message();
        let b = message();
        assert_ne!(a, b);
    }

    #[test]
    fn prefix_check_rejects_foreign_ids() {
        assert!(!has_prefix("msg_abc", "conv"));
        assert!(!has_prefix("conv_", "conv"));
        assert!(!has_prefix("conv", "conv"));
    }
}
