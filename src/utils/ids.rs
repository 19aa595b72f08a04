//! Id Generation
//!
//! UUID-backed implementation of the core `IdGen` seam. Short ids are the
//! first segment of a v4 UUID, which is enough entropy for project-name
//! suffixes and conversation ids.

use appforge_core::context::IdGen;
use uuid::Uuid;

/// UUID v4 based id source.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdGen;

impl IdGen for UuidIdGen {
    fn short_id(&self) -> String {
        Uuid::new_v4().simple().to_string()[..8].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id_shape() {
        let id = UuidIdGen.short_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_short_ids_are_distinct() {
        assert_ne!(UuidIdGen.short_id(), UuidIdGen.short_id());
    }
}
