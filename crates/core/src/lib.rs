// Core types and functionality for Stepflow workflow orchestration

pub mod types;
pub mod error;
pub mod config;
pub mod events;
pub mod template;
pub mod condition;
pub mod state;
pub mod storage;
pub mod workflow;

pub use types::*;
