//! Core types, traits and configuration shared by the chunkflow crates.

pub mod compression;
pub mod config;
pub mod digest;
pub mod edge;
pub mod error;
pub mod methodology;
pub mod telemetry;
pub mod types;
pub mod worker;

pub use config::*;
pub use digest::*;
pub use edge::*;
pub use error::*;
pub use methodology::*;
pub use types::*;
pub use worker::*;
