pub mod cli;
pub mod engine;
pub mod server;
pub mod stats;
pub mod utils;

pub use engine::Engine;
pub use utils::parse_duration_str;
