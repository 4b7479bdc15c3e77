//! Splits a task's input into bounded chunks and wires their dependencies.

pub mod boundary;
pub mod decomposer;
pub mod fs;
pub mod graph;
pub mod input;

pub use decomposer::*;
pub use fs::FsInputResolver;
pub use graph::*;
pub use input::*;
