//! Row conflict detection and resolution.
//!
//! The conflict subsystem is responsible for:
//! 1. **Detection** -- classifying each key changed on both sides of a merge.
//! 2. **Resolution** -- clearing recorded conflicts by keeping ours or taking theirs.

pub mod detector;
pub mod resolver;

pub use detector::{Conflict, ConflictDetector, ConflictType, RowMerge};
pub use resolver::{ConflictResolver, Resolution};
