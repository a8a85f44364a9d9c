pub mod core;
pub mod utils;

// Re-export everything from core for ergonomic library use
// Users can write `stage_reset::proxy` instead of `stage_reset::core::proxy`
pub use core::*;
pub use utils::*;
