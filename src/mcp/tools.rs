//! MCP Tool definitions and handlers
//!
//! Each tool turns its JSON arguments into a query, runs it through the
//! Graph client and returns the reconciled page (or the folded failure) as
//! pretty-printed JSON.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{McpError, ValidationError};
use crate::graph::client::GraphClient;
use crate::graph::query::{
    DateRange, EventFilterSpec, EventQuery, EventSearchSpec, FilterSpec, Importance, Query,
    SearchSpec, DEFAULT_PAGE_SIZE,
};
use crate::graph::reconcile::{continuation_kind, CollectionKind};
use crate::mcp::types::{CallToolResult, Tool};

/// Largest `$top` Graph accepts for messages and events
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Tool handler
pub struct ToolHandler {
    graph_client: Arc<GraphClient>,
}

impl ToolHandler {
    pub fn new(graph_client: Arc<GraphClient>) -> Self {
        Self { graph_client }
    }

    /// List all available tools
    pub fn list_tools(&self) -> Vec<Tool> {
        vec![
            tool_def(
                "search_emails",
                "Searches messages by keyword or subject and filters them by date, importance, sender, read state, attachments and categories",
                search_emails_schema(),
            ),
            tool_def(
                "search_events",
                "Searches calendar events by date window, subject or body text, and event properties",
                search_events_schema(),
            ),
            tool_def(
                "next_page",
                "Fetches the next page of an earlier search using its continuation token",
                next_page_schema(),
            ),
        ]
    }

    /// Call a tool by name
    pub async fn call_tool(&self, name: &str, args: Value) -> CallToolResult {
        tracing::debug!("Calling tool {}", name);
        match name {
            "search_emails" => self.handle_search_emails(args).await,
            "search_events" => self.handle_search_events(args).await,
            "next_page" => self.handle_next_page(args).await,
            _ => CallToolResult::error(
                McpError::UnknownTool {
                    name: name.to_string(),
                }
                .to_string(),
            ),
        }
    }

    // ==================== Tool Handlers ====================

    async fn handle_search_emails(&self, args: Value) -> CallToolResult {
        let query = match parse_args::<SearchEmailsArgs>(args).and_then(|a| {
            a.into_query()
                .map_err(|e| CallToolResult::error(e.to_string()))
        }) {
            Ok(query) => query,
            Err(result) => return result,
        };

        match self.graph_client.search_messages(&query).await {
            Ok(outcome) => CallToolResult::json(&outcome),
            Err(e) => CallToolResult::error(e.to_string()),
        }
    }

    async fn handle_search_events(&self, args: Value) -> CallToolResult {
        let query = match parse_args::<SearchEventsArgs>(args).and_then(|a| {
            a.into_query()
                .map_err(|e| CallToolResult::error(e.to_string()))
        }) {
            Ok(query) => query,
            Err(result) => return result,
        };

        match self.graph_client.search_events(&query).await {
            Ok(outcome) => CallToolResult::json(&outcome),
            Err(e) => CallToolResult::error(e.to_string()),
        }
    }

    async fn handle_next_page(&self, args: Value) -> CallToolResult {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Args {
            continuation_token: String,
            kind: Option<CollectionKind>,
        }

        let args: Args = match parse_args(args) {
            Ok(a) => a,
            Err(result) => return result,
        };

        let kind = match continuation_kind(&args.continuation_token, args.kind) {
            Ok(kind) => kind,
            Err(failure) => {
                tracing::warn!("Refusing continuation token: {}", failure.error);
                return CallToolResult::json(&failure);
            }
        };

        let outcome = match kind {
            CollectionKind::Emails => self
                .graph_client
                .next_messages(&args.continuation_token)
                .await
                .map(|o| CallToolResult::json(&o)),
            CollectionKind::Events => self
                .graph_client
                .next_events(&args.continuation_token)
                .await
                .map(|o| CallToolResult::json(&o)),
        };

        outcome.unwrap_or_else(|e| CallToolResult::error(e.to_string()))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SearchEmailsArgs {
    keyword: Option<String>,
    subject: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
    importance: Option<Importance>,
    sender: Option<String>,
    #[serde(default)]
    unread_only: bool,
    #[serde(default)]
    has_attachments: bool,
    #[serde(default)]
    categories: Vec<String>,
    folder_id: Option<String>,
    page_size: Option<u32>,
}

impl SearchEmailsArgs {
    fn into_query(self) -> Result<Query, ValidationError> {
        let date = parse_date_range(self.start_date.as_deref(), self.end_date.as_deref())?;
        let search = (self.keyword.is_some() || self.subject.is_some()).then(|| SearchSpec {
            keyword: self.keyword,
            subject: self.subject,
        });

        Ok(Query {
            filters: FilterSpec {
                date,
                importance: self.importance,
                sender: self.sender,
                unread_only: self.unread_only,
                has_attachments: self.has_attachments,
                categories: self.categories,
            },
            search,
            page_size: page_size(self.page_size)?,
            container_id: self.folder_id,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SearchEventsArgs {
    subject: Option<String>,
    body: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
    importance: Option<Importance>,
    is_all_day: Option<bool>,
    has_attachments: Option<bool>,
    #[serde(default)]
    categories: Vec<String>,
    is_cancelled: Option<bool>,
    calendar_id: Option<String>,
    page_size: Option<u32>,
}

impl SearchEventsArgs {
    fn into_query(self) -> Result<EventQuery, ValidationError> {
        let date = parse_date_range(self.start_date.as_deref(), self.end_date.as_deref())?;
        let search = (self.subject.is_some() || self.body.is_some()).then(|| EventSearchSpec {
            subject: self.subject,
            body: self.body,
        });

        Ok(EventQuery {
            filters: EventFilterSpec {
                date,
                importance: self.importance,
                is_all_day: self.is_all_day,
                has_attachments: self.has_attachments,
                categories: self.categories,
                is_cancelled: self.is_cancelled,
            },
            search,
            page_size: page_size(self.page_size)?,
            calendar_id: self.calendar_id,
        })
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(args: Value) -> Result<T, CallToolResult> {
    // Clients send `null` arguments for tools without required fields
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args).map_err(|e| {
        CallToolResult::error(
            McpError::InvalidArguments {
                message: e.to_string(),
            }
            .to_string(),
        )
    })
}

fn parse_date_range(start: Option<&str>, end: Option<&str>) -> Result<Option<DateRange>, ValidationError> {
    let range = DateRange::parse(start, end)?;
    if let (Some(start), Some(end)) = (range.start, range.end) {
        if start > end {
            return Err(ValidationError::InvalidParameter {
                name: "startDate".to_string(),
                message: "must not be after endDate".to_string(),
            });
        }
    }
    Ok((!range.is_empty()).then_some(range))
}

fn page_size(requested: Option<u32>) -> Result<u32, ValidationError> {
    match requested {
        None => Ok(DEFAULT_PAGE_SIZE),
        Some(size) if (1..=MAX_PAGE_SIZE).contains(&size) => Ok(size),
        Some(size) => Err(ValidationError::InvalidParameter {
            name: "pageSize".to_string(),
            message: format!("{} is outside 1..={}", size, MAX_PAGE_SIZE),
        }),
    }
}

// ==================== Schema Definitions ====================

fn tool_def(name: &str, description: &str, input_schema: Value) -> Tool {
    Tool {
        name: name.to_string(),
        description: Some(description.to_string()),
        input_schema,
    }
}

fn date_property(description: &str) -> Value {
    json!({
        "type": "string",
        "description": format!("{} (RFC 3339 timestamp or YYYY-MM-DD)", description)
    })
}

fn page_size_property() -> Value {
    json!({
        "type": "integer",
        "minimum": 1,
        "maximum": MAX_PAGE_SIZE,
        "description": format!("Maximum number of results (default {})", DEFAULT_PAGE_SIZE)
    })
}

fn search_emails_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "keyword": {
                "type": "string",
                "description": "Free-text phrase matched anywhere in the message; takes precedence over subject"
            },
            "subject": {
                "type": "string",
                "description": "Phrase matched against the subject only"
            },
            "startDate": date_property("Earliest received date"),
            "endDate": date_property("Latest received date"),
            "importance": {
                "type": "string",
                "enum": ["low", "normal", "high"]
            },
            "sender": {
                "type": "string",
                "description": "Sender email address"
            },
            "unreadOnly": {
                "type": "boolean",
                "description": "Only unread messages"
            },
            "hasAttachments": {
                "type": "boolean",
                "description": "Only messages with attachments"
            },
            "categories": {
                "type": "array",
                "items": {"type": "string"},
                "description": "Match messages in any of these categories"
            },
            "folderId": {
                "type": "string",
                "description": "Mail folder to search instead of the whole mailbox"
            },
            "pageSize": page_size_property()
        }
    })
}

fn search_events_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "subject": {
                "type": "string",
                "description": "Text the event subject must contain"
            },
            "body": {
                "type": "string",
                "description": "Text the event body must contain"
            },
            "startDate": date_property("Window start"),
            "endDate": date_property("Window end"),
            "importance": {
                "type": "string",
                "enum": ["low", "normal", "high"]
            },
            "isAllDay": {"type": "boolean"},
            "hasAttachments": {"type": "boolean"},
            "categories": {
                "type": "array",
                "items": {"type": "string"},
                "description": "Match events in any of these categories"
            },
            "isCancelled": {"type": "boolean"},
            "calendarId": {
                "type": "string",
                "description": "Calendar to search instead of the default calendar"
            },
            "pageSize": page_size_property()
        }
    })
}

fn next_page_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "continuationToken": {
                "type": "string",
                "description": "continuation_token from a previous result"
            },
            "kind": {
                "type": "string",
                "enum": ["emails", "events"],
                "description": "Which search produced the token; only needed when the token's path does not say"
            }
        },
        "required": ["continuationToken"]
    })
}
