//! Slot Allocator
//!
//! Hands out the integer slot ids that key the mapping table. Slot 0 is
//! the control endpoint and is reserved for the whole lifetime of the
//! allocator.
//!
//! # Architecture
//!
//! ```text
//! SlotAllocator (capacity = 130)
//!   ├─→ word 0  [1111 0111 ... 0001]   bit 0 = control slot, always set
//!   ├─→ word 1  [0000 0000 ... 0000]
//!   └─→ word 2  [1111 1111 ... 1100]   bits past capacity pre-set
//!          ↑
//!        cursor (lowest word that may hold a free bit)
//! ```

pub mod allocator;
pub mod id;

pub use allocator::{SlotAllocator, SlotStats, MAX_CAPACITY};
pub use id::{SlotId, CONTROL_SLOT};
