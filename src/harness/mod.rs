//! Runtime harness to execute the consumer as a long-running process

mod heart;
mod module;
mod status;

pub use heart::*;
pub use module::*;
pub use status::*;
