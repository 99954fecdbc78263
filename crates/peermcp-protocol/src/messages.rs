//! MCP method constants and typed request/result pairs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::jsonrpc::RequestId;
use crate::pagination::Cursor;
use crate::types::{
    ClientCapabilities, ClientInfo, Content, ModelPreferences, Prompt, PromptMessage, Resource,
    ResourceContents, ResourceTemplate, Role, SamplingMessage, ServerCapabilities, ServerInfo,
    StopReason, Tool,
};

/// MCP method names.
pub mod method {
    /// Initialize handshake.
    pub const INITIALIZE: &str = "initialize";
    /// Liveness probe, valid in both directions.
    pub const PING: &str = "ping";
    /// List registered tools.
    pub const TOOLS_LIST: &str = "tools/list";
    /// Invoke a tool.
    pub const TOOLS_CALL: &str = "tools/call";
    /// List registered prompts.
    pub const PROMPTS_LIST: &str = "prompts/list";
    /// Fetch a prompt.
    pub const PROMPTS_GET: &str = "prompts/get";
    /// List registered resources.
    pub const RESOURCES_LIST: &str = "resources/list";
    /// List registered resource templates.
    pub const RESOURCES_TEMPLATES_LIST: &str = "resources/templates/list";
    /// Read a resource by URI.
    pub const RESOURCES_READ: &str = "resources/read";
    /// Subscribe to change notifications for a resource.
    pub const RESOURCES_SUBSCRIBE: &str = "resources/subscribe";
    /// Unsubscribe from a resource.
    pub const RESOURCES_UNSUBSCRIBE: &str = "resources/unsubscribe";
    /// Server-to-client completion request.
    pub const SAMPLING_CREATE_MESSAGE: &str = "sampling/createMessage";

    /// Handshake completion notification.
    pub const NOTIFICATION_INITIALIZED: &str = "notifications/initialized";
    /// Request cancellation notification.
    pub const NOTIFICATION_CANCELLED: &str = "notifications/cancelled";
    /// Progress update for an outstanding request.
    pub const NOTIFICATION_PROGRESS: &str = "notifications/progress";
    /// The tool registry changed.
    pub const NOTIFICATION_TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
    /// The prompt registry changed.
    pub const NOTIFICATION_PROMPTS_LIST_CHANGED: &str = "notifications/prompts/list_changed";
    /// The resource registry changed.
    pub const NOTIFICATION_RESOURCES_LIST_CHANGED: &str = "notifications/resources/list_changed";
    /// A subscribed resource changed.
    pub const NOTIFICATION_RESOURCES_UPDATED: &str = "notifications/resources/updated";
}

/// Progress token correlating progress notifications with a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgressToken {
    /// String token.
    String(String),
    /// Integer token.
    Number(i64),
}

impl From<String> for ProgressToken {
    fn from(s: String) -> Self {
        ProgressToken::String(s)
    }
}

impl From<&str> for ProgressToken {
    fn from(s: &str) -> Self {
        ProgressToken::String(s.to_owned())
    }
}

impl From<i64> for ProgressToken {
    fn from(n: i64) -> Self {
        ProgressToken::Number(n)
    }
}

impl std::fmt::Display for ProgressToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressToken::String(s) => write!(f, "{s}"),
            ProgressToken::Number(n) => write!(f, "{n}"),
        }
    }
}

/// Request metadata carried under `_meta`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestMeta {
    /// Progress token for receiving progress notifications.
    #[serde(
        rename = "progressToken",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub progress_token: Option<ProgressToken>,
}

// ============================================================================
// Initialize & ping
// ============================================================================

/// `initialize` request params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeParams {
    /// Protocol version requested.
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    /// Client capabilities.
    pub capabilities: ClientCapabilities,
    /// Client identity.
    #[serde(rename = "clientInfo")]
    pub client_info: ClientInfo,
}

/// `initialize` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    /// Protocol version accepted.
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    /// Server capabilities.
    pub capabilities: ServerCapabilities,
    /// Server identity.
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
    /// Optional usage instructions for the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// `ping` request params (empty).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingParams {}

/// `ping` result (empty).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingResult {}

// ============================================================================
// Tools
// ============================================================================

/// `tools/list` request params.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListToolsParams {
    /// Pagination cursor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

/// `tools/list` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListToolsResult {
    /// Registered tools.
    pub tools: Vec<Tool>,
    /// Cursor for the next page.
    #[serde(rename = "nextCursor", default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<Cursor>,
}

/// `tools/call` request params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolParams {
    /// Tool name.
    pub name: String,
    /// Tool arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
    /// Request metadata.
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<RequestMeta>,
}

impl CallToolParams {
    /// Creates call params for the named tool.
    #[must_use]
    pub fn new(name: impl Into<String>, arguments: Option<serde_json::Value>) -> Self {
        Self {
            name: name.into(),
            arguments,
            meta: None,
        }
    }
}

/// `tools/call` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolResult {
    /// Tool output content.
    pub content: Vec<Content>,
    /// Whether the tool reported a failure.
    #[serde(rename = "isError", default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl CallToolResult {
    /// A successful text result.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![Content::text(text)],
            is_error: false,
        }
    }
}

// ============================================================================
// Prompts
// ============================================================================

/// `prompts/list` request params.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListPromptsParams {
    /// Pagination cursor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

/// `prompts/list` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListPromptsResult {
    /// Registered prompts.
    pub prompts: Vec<Prompt>,
    /// Cursor for the next page.
    #[serde(rename = "nextCursor", default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<Cursor>,
}

/// `prompts/get` request params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPromptParams {
    /// Prompt name.
    pub name: String,
    /// Prompt arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<HashMap<String, String>>,
    /// Request metadata.
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<RequestMeta>,
}

/// `prompts/get` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPromptResult {
    /// Prompt description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Prompt messages.
    pub messages: Vec<PromptMessage>,
}

// ============================================================================
// Resources
// ============================================================================

/// `resources/list` request params.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListResourcesParams {
    /// Pagination cursor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

/// `resources/list` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResourcesResult {
    /// Registered resources.
    pub resources: Vec<Resource>,
    /// Cursor for the next page.
    #[serde(rename = "nextCursor", default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<Cursor>,
}

/// `resources/templates/list` request params.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListResourceTemplatesParams {
    /// Pagination cursor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

/// `resources/templates/list` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResourceTemplatesResult {
    /// Registered templates.
    #[serde(rename = "resourceTemplates")]
    pub resource_templates: Vec<ResourceTemplate>,
    /// Cursor for the next page.
    #[serde(rename = "nextCursor", default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<Cursor>,
}

/// `resources/read` request params.
///
/// `arguments` is filled in by the server when the URI matched a resource
/// template; it carries the extracted template variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResourceParams {
    /// Resource URI.
    pub uri: String,
    /// Template variables extracted from the URI.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub arguments: HashMap<String, String>,
    /// Request metadata.
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<RequestMeta>,
}

impl ReadResourceParams {
    /// Creates read params for the given URI.
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            arguments: HashMap::new(),
            meta: None,
        }
    }
}

/// `resources/read` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResourceResult {
    /// Resource contents.
    pub contents: Vec<ResourceContents>,
}

/// `resources/subscribe` request params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeParams {
    /// Resource URI to subscribe to.
    pub uri: String,
}

/// `resources/subscribe` result (empty).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscribeResult {}

/// `resources/unsubscribe` request params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribeParams {
    /// Resource URI to unsubscribe from.
    pub uri: String,
}

/// `resources/unsubscribe` result (empty).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnsubscribeResult {}

// ============================================================================
// Notifications
// ============================================================================

/// `notifications/initialized` params (empty).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitializedParams {}

/// `notifications/cancelled` params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelledParams {
    /// The id of the request to cancel.
    #[serde(rename = "requestId")]
    pub request_id: RequestId,
    /// Optional reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `notifications/progress` params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressParams {
    /// Token from the originating request's `_meta.progressToken`.
    #[serde(rename = "progressToken")]
    pub progress_token: ProgressToken,
    /// Progress so far.
    pub progress: f64,
    /// Total expected progress, when determinate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    /// Status message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `notifications/resources/updated` params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceUpdatedParams {
    /// The URI of the changed resource.
    pub uri: String,
}

// ============================================================================
// Sampling
// ============================================================================

/// `sampling/createMessage` request params: a server asking the client for an
/// LLM completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMessageParams {
    /// Conversation messages.
    pub messages: Vec<SamplingMessage>,
    /// Maximum tokens to generate.
    #[serde(rename = "maxTokens")]
    pub max_tokens: u32,
    /// Optional system prompt.
    #[serde(
        rename = "systemPrompt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub system_prompt: Option<String>,
    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Stop sequences.
    #[serde(
        rename = "stopSequences",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub stop_sequences: Vec<String>,
    /// Model preferences.
    #[serde(
        rename = "modelPreferences",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub model_preferences: Option<ModelPreferences>,
}

impl CreateMessageParams {
    /// Creates a sampling request with default settings.
    #[must_use]
    pub fn new(messages: Vec<SamplingMessage>, max_tokens: u32) -> Self {
        Self {
            messages,
            max_tokens,
            system_prompt: None,
            temperature: None,
            stop_sequences: Vec::new(),
            model_preferences: None,
        }
    }
}

/// `sampling/createMessage` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMessageResult {
    /// Generated content.
    pub content: Content,
    /// Role of the generated message.
    pub role: Role,
    /// Model that produced the completion.
    pub model: String,
    /// Why generation stopped.
    #[serde(rename = "stopReason")]
    pub stop_reason: StopReason,
}

impl CreateMessageResult {
    /// A text completion.
    #[must_use]
    pub fn text(text: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            content: Content::text(text),
            role: Role::Assistant,
            model: model.into(),
            stop_reason: StopReason::EndTurn,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_params_wire_names() {
        let params = InitializeParams {
            protocol_version: "2025-03-26".into(),
            capabilities: ClientCapabilities::default(),
            client_info: ClientInfo {
                name: "c".into(),
                version: "1".into(),
            },
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["protocolVersion"], "2025-03-26");
        assert_eq!(value["clientInfo"]["name"], "c");
    }

    #[test]
    fn call_tool_meta_progress_token() {
        let params = CallToolParams {
            name: "t".into(),
            arguments: None,
            meta: Some(RequestMeta {
                progress_token: Some("tok".into()),
            }),
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["_meta"]["progressToken"], "tok");
    }

    #[test]
    fn list_params_omit_empty_cursor() {
        let value = serde_json::to_value(ListToolsParams::default()).unwrap();
        assert_eq!(value, serde_json::json!({}));
    }

    #[test]
    fn read_resource_arguments_skip_when_empty() {
        let value = serde_json::to_value(ReadResourceParams::new("file:///x")).unwrap();
        assert_eq!(value, serde_json::json!({ "uri": "file:///x" }));
    }

    #[test]
    fn cancelled_params_round_trip() {
        let params = CancelledParams {
            request_id: RequestId::String("5".into()),
            reason: Some("deadline".into()),
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["requestId"], "5");
        let back: CancelledParams = serde_json::from_value(value).unwrap();
        assert_eq!(back.request_id, RequestId::String("5".into()));
    }

    #[test]
    fn create_message_result_text() {
        let result = CreateMessageResult::text("Hello!", "test-model");
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["content"]["type"], "text");
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["stopReason"], "endTurn");
    }
}
