//! Heap allocation and garbage collection (spec §4.3).

pub mod collector;
pub mod heap;
pub mod roots;

pub use collector::{GarbageCollector, GcStats};
pub use heap::Heap;
pub use roots::RootSet;
