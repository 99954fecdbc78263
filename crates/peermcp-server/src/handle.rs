//! Per-method request handlers.

use std::collections::HashMap;
use std::sync::Arc;

use peermcp_core::{McpError, McpResult};
use peermcp_protocol::{
    from_raw, from_raw_or_default, is_supported_version, paginate, schema, CallToolParams,
    CallToolResult, GetPromptParams, GetPromptResult, InitializeParams, InitializeResult,
    ListPromptsParams, ListPromptsResult, ListResourceTemplatesParams,
    ListResourceTemplatesResult, ListResourcesParams, ListResourcesResult, ListToolsParams,
    ListToolsResult, Prompt, ReadResourceParams, ReadResourceResult, Resource, ResourceTemplate,
    SubscribeParams, SubscribeResult, Tool, UnsubscribeParams, UnsubscribeResult,
    LATEST_PROTOCOL_VERSION,
};
use serde_json::value::RawValue;

use crate::{RequestContext, ServerInner};

impl ServerInner {
    pub(crate) fn handle_initialize(
        &self,
        ctx: &peermcp_transport::ReceiveContext,
        raw: Option<&RawValue>,
    ) -> McpResult<InitializeResult> {
        let params: InitializeParams = from_raw(raw)?;

        if !is_supported_version(&params.protocol_version) {
            return Err(McpError::internal(format!(
                "protocol version not supported, supported latest version is {LATEST_PROTOCOL_VERSION}"
            )));
        }

        let session_id = match (&ctx.new_session, ctx.session_id.is_empty()) {
            (Some(slot), _) => {
                let session_id = self.session_manager.create();
                slot.set(session_id.clone());
                Some(session_id)
            }
            (None, false) => Some(ctx.session_id.clone()),
            (None, true) => None,
        };

        if let Some(session_id) = session_id {
            let session = self
                .session_manager
                .get(&session_id)
                .ok_or_else(McpError::session_missing)?;
            session.set_client_info(params.client_info, params.capabilities);
            session.mark_received_initialize();
        }

        Ok(InitializeResult {
            protocol_version: params.protocol_version,
            capabilities: self.capabilities.clone(),
            server_info: self.server_info.clone(),
            instructions: self.instructions.clone(),
        })
    }

    pub(crate) fn handle_tools_list(&self, raw: Option<&RawValue>) -> McpResult<ListToolsResult> {
        if self.capabilities.tools.is_none() {
            return Err(McpError::not_supported());
        }
        let params: ListToolsParams = from_raw_or_default(raw)?;

        let tools: Vec<Tool> = self.tools.iter().map(|e| e.value().tool.clone()).collect();
        if self.pagination_limit > 0 {
            let (tools, next_cursor) =
                paginate(tools, params.cursor.as_ref(), self.pagination_limit)?;
            return Ok(ListToolsResult { tools, next_cursor });
        }
        Ok(ListToolsResult {
            tools,
            next_cursor: None,
        })
    }

    pub(crate) async fn handle_tools_call(
        self: &Arc<Self>,
        ctx: RequestContext,
        raw: Option<&RawValue>,
    ) -> McpResult<CallToolResult> {
        if self.capabilities.tools.is_none() {
            return Err(McpError::not_supported());
        }
        let params: CallToolParams = from_raw(raw)?;

        let (tool, handler) = {
            let entry = self.tools.get(&params.name).ok_or_else(|| {
                McpError::internal(format!("missing tool, toolName={}", params.name))
            })?;
            (entry.tool.clone(), entry.handler.clone())
        };

        let arguments = params
            .arguments
            .clone()
            .unwrap_or_else(|| serde_json::json!({}));
        if let Err(violations) = schema::validate(&tool.input_schema, &arguments) {
            let detail: Vec<String> = violations.iter().map(ToString::to_string).collect();
            return Err(McpError::invalid_params(format!(
                "input validation failed: {}",
                detail.join("; ")
            )));
        }

        let ctx = ctx.with_progress_token(params.meta.as_ref().and_then(|m| m.progress_token.clone()));
        handler(ctx, params).await
    }

    pub(crate) fn handle_prompts_list(
        &self,
        raw: Option<&RawValue>,
    ) -> McpResult<ListPromptsResult> {
        if self.capabilities.prompts.is_none() {
            return Err(McpError::not_supported());
        }
        let params: ListPromptsParams = from_raw_or_default(raw)?;

        let prompts: Vec<Prompt> = self
            .prompts
            .iter()
            .map(|e| e.value().prompt.clone())
            .collect();
        if self.pagination_limit > 0 {
            let (prompts, next_cursor) =
                paginate(prompts, params.cursor.as_ref(), self.pagination_limit)?;
            return Ok(ListPromptsResult {
                prompts,
                next_cursor,
            });
        }
        Ok(ListPromptsResult {
            prompts,
            next_cursor: None,
        })
    }

    pub(crate) async fn handle_prompts_get(
        &self,
        ctx: RequestContext,
        raw: Option<&RawValue>,
    ) -> McpResult<GetPromptResult> {
        if self.capabilities.prompts.is_none() {
            return Err(McpError::not_supported());
        }
        let params: GetPromptParams = from_raw(raw)?;

        let handler = self
            .prompts
            .get(&params.name)
            .map(|e| e.value().handler.clone())
            .ok_or_else(|| {
                McpError::internal(format!("missing prompt, promptName={}", params.name))
            })?;
        let ctx = ctx.with_progress_token(params.meta.as_ref().and_then(|m| m.progress_token.clone()));
        handler(ctx, params).await
    }

    pub(crate) fn handle_resources_list(
        &self,
        raw: Option<&RawValue>,
    ) -> McpResult<ListResourcesResult> {
        if self.capabilities.resources.is_none() {
            return Err(McpError::not_supported());
        }
        let params: ListResourcesParams = from_raw_or_default(raw)?;

        let resources: Vec<Resource> = self
            .resources
            .iter()
            .map(|e| e.value().resource.clone())
            .collect();
        if self.pagination_limit > 0 {
            let (resources, next_cursor) =
                paginate(resources, params.cursor.as_ref(), self.pagination_limit)?;
            return Ok(ListResourcesResult {
                resources,
                next_cursor,
            });
        }
        Ok(ListResourcesResult {
            resources,
            next_cursor: None,
        })
    }

    pub(crate) fn handle_resource_templates_list(
        &self,
        raw: Option<&RawValue>,
    ) -> McpResult<ListResourceTemplatesResult> {
        if self.capabilities.resources.is_none() {
            return Err(McpError::not_supported());
        }
        let params: ListResourceTemplatesParams = from_raw_or_default(raw)?;

        let templates: Vec<ResourceTemplate> = self
            .resource_templates
            .iter()
            .map(|e| e.value().template.clone())
            .collect();
        if self.pagination_limit > 0 {
            let (resource_templates, next_cursor) =
                paginate(templates, params.cursor.as_ref(), self.pagination_limit)?;
            return Ok(ListResourceTemplatesResult {
                resource_templates,
                next_cursor,
            });
        }
        Ok(ListResourceTemplatesResult {
            resource_templates: templates,
            next_cursor: None,
        })
    }

    pub(crate) async fn handle_resources_read(
        &self,
        ctx: RequestContext,
        raw: Option<&RawValue>,
    ) -> McpResult<ReadResourceResult> {
        if self.capabilities.resources.is_none() {
            return Err(McpError::not_supported());
        }
        let mut params: ReadResourceParams = from_raw(raw)?;

        // Exact URI first, then the first matching template with its
        // extracted variables placed in the request arguments.
        let handler = match self.resources.get(&params.uri) {
            Some(entry) => Some(entry.value().handler.clone()),
            None => self.resource_templates.iter().find_map(|entry| {
                entry.value().matcher.matches(&params.uri).map(|vars| {
                    params.arguments = vars;
                    entry.value().handler.clone()
                })
            }),
        };

        let handler = handler.ok_or_else(|| {
            McpError::new(
                peermcp_core::ErrorCode::MethodNotFound,
                format!("missing resource, uri={}", params.uri),
            )
        })?;
        let ctx = ctx.with_progress_token(params.meta.as_ref().and_then(|m| m.progress_token.clone()));
        handler(ctx, params).await
    }

    pub(crate) fn handle_resources_subscribe(
        &self,
        session_id: &str,
        raw: Option<&RawValue>,
    ) -> McpResult<SubscribeResult> {
        self.require_subscribe_capability()?;
        let params: SubscribeParams = from_raw(raw)?;

        let session = self
            .session_manager
            .get(session_id)
            .ok_or_else(McpError::session_missing)?;
        session.subscribe(params.uri);
        Ok(SubscribeResult {})
    }

    pub(crate) fn handle_resources_unsubscribe(
        &self,
        session_id: &str,
        raw: Option<&RawValue>,
    ) -> McpResult<UnsubscribeResult> {
        self.require_subscribe_capability()?;
        let params: UnsubscribeParams = from_raw(raw)?;

        let session = self
            .session_manager
            .get(session_id)
            .ok_or_else(McpError::session_missing)?;
        session.unsubscribe(&params.uri);
        Ok(UnsubscribeResult {})
    }

    pub(crate) fn handle_initialized(&self, session_id: &str) -> McpResult<()> {
        if session_id.is_empty() {
            return Ok(());
        }
        let session = self
            .session_manager
            .get(session_id)
            .ok_or_else(McpError::session_missing)?;
        if !session.received_initialize() {
            return Err(McpError::internal(
                "the server has not received the client's initialization request",
            ));
        }
        session.set_ready();
        Ok(())
    }

    fn require_subscribe_capability(&self) -> McpResult<()> {
        let supports = self
            .capabilities
            .resources
            .as_ref()
            .is_some_and(|r| r.subscribe);
        if supports {
            Ok(())
        } else {
            Err(McpError::not_supported())
        }
    }
}

/// A parsed URI template (RFC 6570 simple expansion), compiled at
/// registration so malformed templates are rejected before they are
/// published.
#[derive(Debug, Clone)]
pub(crate) struct UriTemplate {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Param(String),
}

impl UriTemplate {
    pub(crate) fn parse(pattern: &str) -> McpResult<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = pattern.chars();

        while let Some(ch) = chars.next() {
            if ch != '{' {
                if ch == '}' {
                    return Err(McpError::invalid_request(format!(
                        "invalid uri template {pattern:?}: unmatched '}}'"
                    )));
                }
                literal.push(ch);
                continue;
            }

            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }

            let mut name = String::new();
            let mut terminated = false;
            for next in chars.by_ref() {
                if next == '}' {
                    terminated = true;
                    break;
                }
                name.push(next);
            }
            if !terminated {
                return Err(McpError::invalid_request(format!(
                    "invalid uri template {pattern:?}: unterminated expression"
                )));
            }
            if name.is_empty() {
                return Err(McpError::invalid_request(format!(
                    "invalid uri template {pattern:?}: empty expression"
                )));
            }
            segments.push(Segment::Param(name));
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self { segments })
    }

    /// Matches a URI against the template, extracting variable values.
    pub(crate) fn matches(&self, uri: &str) -> Option<HashMap<String, String>> {
        let mut params = HashMap::new();
        let mut remainder = uri;
        let mut iter = self.segments.iter().peekable();

        while let Some(segment) = iter.next() {
            match segment {
                Segment::Literal(literal) => {
                    remainder = remainder.strip_prefix(literal.as_str())?;
                }
                Segment::Param(name) => {
                    let next_literal = iter.peek().and_then(|next| match next {
                        Segment::Literal(literal) => Some(literal.as_str()),
                        Segment::Param(_) => None,
                    });

                    // Two adjacent expressions have no delimiter to split on.
                    if next_literal.is_none() && iter.peek().is_some() {
                        return None;
                    }

                    match next_literal {
                        Some(literal) => {
                            let idx = remainder.find(literal)?;
                            if idx == 0 {
                                return None; // empty variable value
                            }
                            params.insert(name.clone(), remainder[..idx].to_string());
                            remainder = &remainder[idx..];
                        }
                        None => {
                            if remainder.is_empty() {
                                return None;
                            }
                            params.insert(name.clone(), remainder.to_string());
                            remainder = "";
                        }
                    }
                }
            }
        }

        remainder.is_empty().then_some(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_matches_single_variable() {
        let template = UriTemplate::parse("file:///{path}").unwrap();
        let vars = template.matches("file:///notes.txt").unwrap();
        assert_eq!(vars["path"], "notes.txt");
        assert!(template.matches("http:///notes.txt").is_none());
    }

    #[test]
    fn template_matches_multiple_variables() {
        let template = UriTemplate::parse("db://{table}/{id}").unwrap();
        let vars = template.matches("db://users/42").unwrap();
        assert_eq!(vars["table"], "users");
        assert_eq!(vars["id"], "42");
    }

    #[test]
    fn template_rejects_malformed_patterns() {
        assert!(UriTemplate::parse("file:///{path").is_err());
        assert!(UriTemplate::parse("file:///{}").is_err());
        assert!(UriTemplate::parse("file:///}oops").is_err());
    }

    #[test]
    fn template_requires_full_match() {
        let template = UriTemplate::parse("file:///{path}.txt").unwrap();
        assert!(template.matches("file:///a.txt").is_some());
        assert!(template.matches("file:///a.txt.bak").is_none());
    }
}
