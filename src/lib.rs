//! Token-flow analytics API for SPL tokens.
//!
//! This crate reconstructs multi-hop token-flow paths, classifies token
//! activity (transfers vs. swaps with buy/sell direction) and derives
//! proximity-based risk scores for addresses, fronted by a tenant model
//! with API keys, monthly quotas and per-minute rate limits.

pub mod cache;
pub mod classifier;
pub mod config;
pub mod entities;
pub mod error;
pub mod graph;
pub mod http;
pub mod intent;
pub mod risk;
pub mod security;
pub mod storage;
pub mod tenant;
pub mod upstream;

// Re-export main types for convenience
pub use config::Config;
pub use error::{ApiError, UpstreamError};
pub use graph::{FlowGraphEngine, FlowPath, PathNode};
pub use risk::{RiskAssessment, RiskEngine};
pub use upstream::{Transfer, UpstreamClient};
