//! Static tool definitions exposed to the agent.

use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::{json, Value};

use super::CONTENT_TYPES;
use crate::config::FeaturesConfig;
use crate::graph::{CALENDARS_READ, CALENDARS_READ_WRITE, MAIL_READ, MAIL_SEND};
use crate::schema::{SchemaError, SchemaNode};

pub const NAMESPACE: &str = "graph";
pub const VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Mail,
    Calendar,
}

impl Capability {
    pub fn enabled(self, features: &FeaturesConfig) -> bool {
        match self {
            Self::Mail => features.enable_mail,
            Self::Calendar => features.enable_calendar,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolMetadata {
    pub required_scopes: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: SchemaNode,
    pub metadata: ToolMetadata,
    #[serde(skip)]
    pub capability: Capability,
}

impl ToolDefinition {
    fn parse(tool: &DeclaredTool) -> Result<Self, SchemaError> {
        Ok(Self {
            name: tool.name.to_string(),
            description: tool.description.to_string(),
            input_schema: SchemaNode::from_value(&tool.input_schema)?,
            metadata: ToolMetadata {
                required_scopes: tool.scopes.iter().map(|s| s.to_string()).collect(),
            },
            capability: tool.capability,
        })
    }
}

/// A tool in its declarative form, before the schema is parsed.
struct DeclaredTool {
    capability: Capability,
    name: &'static str,
    description: &'static str,
    scopes: &'static [&'static str],
    input_schema: Value,
}

/// What `listTools` returns. Every call hands out an owned copy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Manifest {
    pub namespace: String,
    pub version: String,
    pub tools: Vec<ToolDefinition>,
}

impl Manifest {
    pub fn new(tools: Vec<ToolDefinition>) -> Self {
        Self {
            namespace: NAMESPACE.to_string(),
            version: VERSION.to_string(),
            tools,
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name.clone()).collect()
    }
}

fn folder_id() -> Value {
    json!({
        "type": "string",
        "description": "Mail folder id or well-known name (inbox, sentitems, archive...)",
        "default": "inbox"
    })
}

fn content_type() -> Value {
    json!({
        "type": "string",
        "enum": CONTENT_TYPES,
        "description": "Body content type",
        "default": CONTENT_TYPES[0]
    })
}

fn date_time(description: &str) -> Value {
    json!({ "type": "string", "format": "date-time", "description": description })
}

fn declared_tools() -> Vec<DeclaredTool> {
    vec![
        DeclaredTool {
            capability: Capability::Mail,
            name: "mail.latestMessage.get",
            description: "Fetch the newest message in a mail folder, including body and attachment summaries.",
            scopes: &[MAIL_READ],
            input_schema: json!({
                "type": "object",
                "properties": { "folderId": folder_id() }
            }),
        },
        DeclaredTool {
            capability: Capability::Mail,
            name: "mail.messages.list",
            description: "List messages in a mail folder, newest first, optionally bounded by received time.",
            scopes: &[MAIL_READ],
            input_schema: json!({
                "type": "object",
                "properties": {
                    "folderId": folder_id(),
                    "startDateTime": date_time("Only messages received at or after this time"),
                    "endDateTime": date_time("Only messages received at or before this time"),
                    "unreadOnly": {
                        "type": "boolean",
                        "description": "Only unread messages",
                        "default": false
                    },
                    "maxResults": {
                        "type": "integer",
                        "description": "Number of messages to return, clamped to 1..200",
                        "default": 20
                    }
                }
            }),
        },
        DeclaredTool {
            capability: Capability::Mail,
            name: "mail.message.reply",
            description: "Reply (or reply-all) to a message with a comment and/or body.",
            scopes: &[MAIL_SEND],
            input_schema: json!({
                "type": "object",
                "required": ["messageId"],
                "properties": {
                    "messageId": { "type": "string", "description": "Id of the message to reply to" },
                    "comment": { "type": "string", "description": "Short reply text" },
                    "body": { "type": "string", "description": "Full reply body" },
                    "contentType": content_type(),
                    "replyAll": {
                        "type": "boolean",
                        "description": "Reply to all recipients",
                        "default": false
                    }
                }
            }),
        },
        DeclaredTool {
            capability: Capability::Mail,
            name: "mail.attachment.download",
            description: "Save a message attachment to disk. Skips the download when a non-empty file already exists at the target.",
            scopes: &[MAIL_READ],
            input_schema: json!({
                "type": "object",
                "required": ["messageId", "attachmentId", "targetPath"],
                "properties": {
                    "messageId": { "type": "string", "description": "Message id" },
                    "attachmentId": { "type": "string", "description": "Attachment id" },
                    "targetPath": {
                        "type": "string",
                        "description": "Destination file; relative paths resolve under the configured files root"
                    }
                }
            }),
        },
        DeclaredTool {
            capability: Capability::Calendar,
            name: "calendar.events.list",
            description: "List calendar events in a time window, ordered by start time.",
            scopes: &[CALENDARS_READ],
            input_schema: json!({
                "type": "object",
                "required": ["startDateTime", "endDateTime"],
                "properties": {
                    "startDateTime": date_time("Window start (ISO 8601)"),
                    "endDateTime": date_time("Window end (ISO 8601)")
                }
            }),
        },
        DeclaredTool {
            capability: Capability::Calendar,
            name: "calendar.event.create",
            description: "Create a calendar event, optionally as a Teams meeting.",
            scopes: &[CALENDARS_READ_WRITE],
            input_schema: json!({
                "type": "object",
                "required": ["subject", "startDateTime", "endDateTime"],
                "properties": {
                    "subject": { "type": "string", "description": "Event title" },
                    "startDateTime": date_time("Start (ISO 8601)"),
                    "endDateTime": date_time("End (ISO 8601)"),
                    "timeZone": {
                        "type": "string",
                        "description": "Time zone for start and end",
                        "default": "UTC"
                    },
                    "body": { "type": "string", "description": "Event description" },
                    "contentType": content_type(),
                    "location": { "type": "string", "description": "Location display name" },
                    "attendees": {
                        "type": "array",
                        "items": {},
                        "description": "Email addresses or {address, name, type} objects"
                    },
                    "isOnlineMeeting": { "type": "boolean" },
                    "onlineMeetingProvider": { "type": "string" },
                    "teams": {
                        "type": "boolean",
                        "description": "Make this a Teams meeting; overrides the online meeting fields",
                        "default": false
                    }
                }
            }),
        },
    ]
}

/// The full tool list, before feature filtering.
pub fn definitions() -> Result<Vec<ToolDefinition>, SchemaError> {
    declared_tools().iter().map(ToolDefinition::parse).collect()
}

/// Definitions whose capability is switched on.
pub fn enabled_definitions(features: &FeaturesConfig) -> Result<Vec<ToolDefinition>, SchemaError> {
    Ok(definitions()?
        .into_iter()
        .filter(|d| d.capability.enabled(features))
        .collect())
}
