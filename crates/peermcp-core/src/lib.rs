//! Core types for peermcp.
//!
//! This crate provides the building blocks shared by every other crate in the
//! workspace:
//! - [`McpError`] / [`ErrorCode`]: the error model for MCP operations
//! - Logging targets built on the standard [`log`] facade
//! - [`TokenBucketLimiter`]: the token bucket behind the rate-limit middleware
//! - [`WaitGroup`]: in-flight request tracking for graceful shutdown

#![forbid(unsafe_code)]

mod error;
mod limiter;
pub mod logging;
mod waitgroup;

pub use error::{
    ErrorCode, McpError, McpResult, CONNECTION_ERROR, INTERNAL_ERROR, INVALID_PARAMS,
    INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR,
};
pub use limiter::{Rate, TokenBucketLimiter};
pub use waitgroup::WaitGroup;
