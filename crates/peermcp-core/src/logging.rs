//! Logging for peermcp.
//!
//! Built on the standard [`log`] facade. The workspace does not bundle a log
//! implementation; applications initialize whichever backend they prefer
//! (`env_logger`, `simple_logger`, ...).
//!
//! Targets are hierarchical for filtering, e.g.
//! `RUST_LOG=peermcp::server=debug,peermcp::transport=trace`.

pub use log::{debug, error, info, trace, warn};
pub use log::{Level, LevelFilter};

/// Log targets used across the workspace.
pub mod targets {
    /// Root target.
    pub const PEERMCP: &str = "peermcp";

    /// Server dispatch and request handling.
    pub const SERVER: &str = "peermcp::server";

    /// Client dispatch and calls.
    pub const CLIENT: &str = "peermcp::client";

    /// Transport layer (stdio, SSE, streamable HTTP).
    pub const TRANSPORT: &str = "peermcp::transport";

    /// Session lifecycle, heartbeat, and reaping.
    pub const SESSION: &str = "peermcp::session";

    /// Tool, resource, and prompt handler execution.
    pub const HANDLER: &str = "peermcp::handler";
}
