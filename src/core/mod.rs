pub mod error;
pub mod installer;
pub mod interrupt;
pub mod materialize;
pub mod proxy;
pub mod remote;
pub mod reset;
pub mod settings;
pub mod stage;
pub mod sync;
pub mod workflow;

pub use error::{Error, ErrorCode, Result};
