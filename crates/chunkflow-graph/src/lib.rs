pub mod cycles;
pub mod store;

pub use cycles::*;
pub use store::*;
