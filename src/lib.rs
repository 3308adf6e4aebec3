pub mod config;
pub mod error;
pub mod filter;
pub mod http;
pub mod model;
pub mod orchestrator;
pub mod settings;
pub mod types;
