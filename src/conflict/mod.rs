pub mod detection;

pub use detection::{ConflictType, FieldSpec, acquire_locks, detect_conflicts, release_locks};
