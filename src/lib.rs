// Core modules
pub mod api;
pub mod config;
pub mod execution;
pub mod models;
pub mod session;
pub mod strategy;

// Re-export commonly used types
pub use api::*;
pub use models::*;
pub use strategy::{DecisionEngine, TradeType};

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
