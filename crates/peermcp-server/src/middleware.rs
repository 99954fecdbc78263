//! Tool middleware.
//!
//! Middleware wraps a tool handler at registration time; a chain
//! `[m1, m2, m3]` composes as `m3(m2(m1(handler)))`, so the last middleware
//! runs outermost.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use peermcp_core::{McpError, Rate, TokenBucketLimiter};

use crate::ToolHandlerFn;

/// Wraps tool handlers at registration time.
pub trait ToolMiddleware: Send + Sync {
    /// Returns a handler that decorates `next`.
    fn wrap(&self, next: ToolHandlerFn) -> ToolHandlerFn;
}

/// Composes a middleware chain around a handler.
pub(crate) fn compose(
    handler: ToolHandlerFn,
    middlewares: &[Arc<dyn ToolMiddleware>],
) -> ToolHandlerFn {
    let mut handler = handler;
    for middleware in middlewares {
        handler = middleware.wrap(handler);
    }
    handler
}

/// Token-bucket rate limiting for a tool.
///
/// Denied calls fail with an internal error (`-32603` on the wire) carrying a
/// rate-limit message.
pub struct RateLimitMiddleware {
    limiter: Arc<TokenBucketLimiter>,
}

impl RateLimitMiddleware {
    /// Creates a middleware with its own bucket.
    #[must_use]
    pub fn new(rate: Rate) -> Self {
        Self {
            limiter: Arc::new(TokenBucketLimiter::new(rate)),
        }
    }

    /// Creates a middleware sharing an existing bucket.
    #[must_use]
    pub fn with_limiter(limiter: Arc<TokenBucketLimiter>) -> Self {
        Self { limiter }
    }
}

impl ToolMiddleware for RateLimitMiddleware {
    fn wrap(&self, next: ToolHandlerFn) -> ToolHandlerFn {
        let limiter = self.limiter.clone();
        Arc::new(move |ctx, params| {
            if !limiter.try_acquire() {
                let name = params.name.clone();
                return Box::pin(async move {
                    Err(McpError::internal(format!(
                        "rate limit exceeded for tool: {name}"
                    )))
                });
            }
            next(ctx, params)
        })
    }
}

/// Server-wide rate-limit configuration: a global bucket plus per-tool
/// overrides.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Default bucket applied to tools without an override.
    pub global: Rate,
    /// Per-tool bucket overrides, keyed by tool name.
    pub per_tool: HashMap<String, Rate>,
}

impl RateLimitConfig {
    /// Config with only a global bucket.
    #[must_use]
    pub fn global(rate: Rate) -> Self {
        Self {
            global: rate,
            per_tool: HashMap::new(),
        }
    }

    /// Adds a per-tool override.
    #[must_use]
    pub fn with_tool(mut self, tool: impl Into<String>, rate: Rate) -> Self {
        self.per_tool.insert(tool.into(), rate);
        self
    }
}

/// Buckets realized from a [`RateLimitConfig`]: tools with an override get a
/// private bucket, everything else shares the global one.
pub(crate) struct RateLimiters {
    config: RateLimitConfig,
    global: Arc<TokenBucketLimiter>,
    per_tool: DashMap<String, Arc<TokenBucketLimiter>>,
}

impl RateLimiters {
    pub(crate) fn new(config: RateLimitConfig) -> Self {
        let global = Arc::new(TokenBucketLimiter::new(config.global));
        Self {
            config,
            global,
            per_tool: DashMap::new(),
        }
    }

    pub(crate) fn limiter_for(&self, tool: &str) -> Arc<TokenBucketLimiter> {
        match self.config.per_tool.get(tool) {
            Some(rate) => self
                .per_tool
                .entry(tool.to_string())
                .or_insert_with(|| Arc::new(TokenBucketLimiter::new(*rate)))
                .clone(),
            None => self.global.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RequestContext;
    use peermcp_protocol::{CallToolParams, CallToolResult};

    fn ok_handler() -> ToolHandlerFn {
        Arc::new(|_ctx, _params| Box::pin(async { Ok(CallToolResult::text("ok")) }))
    }

    #[tokio::test]
    async fn rate_limit_denies_past_burst() {
        let handler = compose(
            ok_handler(),
            &[Arc::new(RateLimitMiddleware::new(Rate::new(5.0, 10))) as Arc<dyn ToolMiddleware>],
        );

        let mut ok = 0;
        let mut denied = 0;
        for _ in 0..15 {
            let params = CallToolParams::new("t", None);
            match handler(RequestContext::detached(), params).await {
                Ok(_) => ok += 1,
                Err(err) => {
                    assert!(err.message.contains("rate limit exceeded"), "{err}");
                    denied += 1;
                }
            }
        }
        assert_eq!(ok, 10);
        assert_eq!(denied, 5);
    }

    #[test]
    fn per_tool_override_gets_private_bucket() {
        let limiters = RateLimiters::new(
            RateLimitConfig::global(Rate::new(1.0, 1)).with_tool("busy", Rate::new(100.0, 100)),
        );
        let a = limiters.limiter_for("busy");
        let b = limiters.limiter_for("other");
        let c = limiters.limiter_for("other2");
        assert_eq!(a.rate().burst, 100);
        assert_eq!(b.rate().burst, 1);
        // Non-override tools share the global bucket.
        assert!(b.try_acquire());
        assert!(!c.try_acquire());
    }
}
