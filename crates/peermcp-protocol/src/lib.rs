//! MCP protocol types and JSON-RPC envelopes.
//!
//! This crate provides:
//! - JSON-RPC 2.0 envelope types with probe-based classification
//! - MCP method constants and typed request/result pairs
//! - Capability structs negotiated at initialize
//! - Cursor-based pagination over registry listings
//! - The tool input-schema model, builder, and argument validator
//!
//! # Wire Format
//!
//! All messages are JSON-RPC 2.0. Stream transports frame messages as
//! newline-delimited JSON (NDJSON).

#![forbid(unsafe_code)]

mod jsonrpc;
mod messages;
pub mod pagination;
pub mod schema;
mod types;

pub use jsonrpc::{
    classify, from_raw, from_raw_or_default, to_raw, JsonRpcError, JsonRpcMessage,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId, JSONRPC_VERSION,
};
pub use messages::*;
pub use pagination::{paginate, Cursor, SortKey};
pub use schema::{validate, Field, InputSchema, Property, PropertyKind, SchemaBuilder, SchemaError};
pub use types::*;

/// Latest protocol version this implementation speaks.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-03-26";

/// All protocol versions accepted at initialize.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-03-26", "2024-11-05"];

/// Returns true if the given protocol version is in the supported set.
#[must_use]
pub fn is_supported_version(version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}
