pub mod agent;
pub mod analysis;
pub mod config;
pub mod error;
pub mod exec;
pub mod git;
pub mod notify;
pub mod patch;
pub mod pipeline;
pub mod results;
pub mod sandbox;
pub mod store;
pub mod triage;
pub mod trigger;
pub mod types;
pub mod workspace;

pub use types::*;
