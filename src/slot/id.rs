//! Slot identifiers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Slot reserved for the control endpoint
pub const CONTROL_SLOT: SlotId = SlotId(0);

/// Position of a mapping in the fixed-capacity table
///
/// Doubles as the minor number of the mapping's endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotId(u32);

impl SlotId {
    /// Create a new slot ID
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Table index for this slot
    pub fn index(&self) -> usize {
        self.0 as usize
    }

    pub fn get(&self) -> u32 {
        self.0
    }

    /// Whether this is the control endpoint's slot
    pub fn is_control(&self) -> bool {
        *self == CONTROL_SLOT
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_id_creation() {
        let id = SlotId::new(5);
        assert_eq!(id.index(), 5);
        assert_eq!(id.get(), 5);
        assert!(!id.is_control());
        assert!(CONTROL_SLOT.is_control());
        assert_eq!(id.to_string(), "slot 5");
    }
}
