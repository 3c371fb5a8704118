pub mod appliances;
pub mod client;
pub mod collector;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod rotation;
pub mod smile;
pub mod stretch;
pub mod summary;
pub mod xml;

// Re-export commonly used items
pub use collector::{Collector, CycleReport, RunMode};
pub use config::Config;
pub use error::AppError;
