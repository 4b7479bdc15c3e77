//! Task execution: the per-task coordinator loop, checkpoints, synthesis and the
//! submission service that ties them together.

pub mod checkpoint;
pub mod coordinator;
pub mod service;
pub mod synthesis;

pub use checkpoint::*;
pub use coordinator::*;
pub use service::*;
pub use synthesis::*;
