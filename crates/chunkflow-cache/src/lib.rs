//! Metadata catalog: analysis results indexed by scope, then by content.

pub mod catalog;
pub mod entry;
pub mod stats;

pub use catalog::*;
pub use entry::*;
pub use stats::*;
