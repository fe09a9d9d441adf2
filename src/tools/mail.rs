use std::path::{Component, Path, PathBuf};

use serde_json::{json, Map, Value};

use super::{bool_or, content_type, optional_str, required_str, ToolContext, ToolHandler};
use crate::error::ToolError;
use crate::graph::MessageQuery;

pub const DEFAULT_FOLDER: &str = "inbox";
pub const DEFAULT_MAX_RESULTS: i64 = 20;
pub const MAX_RESULTS_LIMIT: i64 = 200;

/// `mail.latestMessage.get`
pub struct LatestMessage;

/// `mail.messages.list`
pub struct ListMessages;

/// `mail.message.reply`
pub struct ReplyToMessage;

/// `mail.attachment.download`
pub struct DownloadAttachment;

#[async_trait::async_trait]
impl ToolHandler for LatestMessage {
    fn name(&self) -> &'static str {
        "mail.latestMessage.get"
    }

    async fn run(&self, input: Map<String, Value>, ctx: &ToolContext) -> Result<Value, ToolError> {
        let folder_id = optional_str(&input, "folderId").unwrap_or_else(|| DEFAULT_FOLDER.to_string());

        match ctx.client.get_latest_message(&folder_id).await? {
            Some(message) => Ok(json!({
                "status": "ok",
                "folderId": folder_id,
                "message": shape_latest(&message),
            })),
            None => {
                log::info!("mail.latestMessage.get: folder {} is empty", folder_id);
                Ok(json!({
                    "status": "empty",
                    "folderId": folder_id,
                    "message": "No messages found",
                }))
            }
        }
    }
}

#[async_trait::async_trait]
impl ToolHandler for ListMessages {
    fn name(&self) -> &'static str {
        "mail.messages.list"
    }

    async fn run(&self, input: Map<String, Value>, ctx: &ToolContext) -> Result<Value, ToolError> {
        let folder_id = optional_str(&input, "folderId").unwrap_or_else(|| DEFAULT_FOLDER.to_string());
        let top = clamp_max_results(input.get("maxResults"));
        let filter = build_filter(
            optional_str(&input, "startDateTime").as_deref(),
            optional_str(&input, "endDateTime").as_deref(),
            bool_or(&input, "unreadOnly", false),
        );

        let messages = ctx
            .client
            .list_messages(&MessageQuery {
                folder_id: folder_id.clone(),
                top,
                filter,
            })
            .await?;

        let shaped: Vec<Value> = messages.iter().map(shape_summary).collect();
        Ok(json!({
            "folderId": folder_id,
            "count": shaped.len(),
            "messages": shaped,
        }))
    }
}

#[async_trait::async_trait]
impl ToolHandler for ReplyToMessage {
    fn name(&self) -> &'static str {
        "mail.message.reply"
    }

    async fn run(&self, input: Map<String, Value>, ctx: &ToolContext) -> Result<Value, ToolError> {
        let message_id = required_str(&input, "messageId")?;
        let comment = optional_str(&input, "comment");
        let body = optional_str(&input, "body");
        let content_type = content_type(&input)?;
        let reply_all = bool_or(&input, "replyAll", false);

        if let Some(recipient) = &ctx.reply_redirect {
            let original = ctx.client.get_message(&message_id, "subject").await?;
            let subject = original
                .get("subject")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let content = merge_reply_text(comment.as_deref(), body.as_deref(), content_type);
            let message = json!({
                "subject": format!("RE: {subject}"),
                "body": { "contentType": content_type, "content": content },
                "toRecipients": [{ "emailAddress": { "address": recipient } }],
            });
            log::info!(
                "mail.message.reply: redirecting reply to {} as a new message",
                recipient
            );
            ctx.client.send_mail(message).await?;
            return Ok(json!({
                "status": "sent",
                "mode": "redirected",
                "messageId": message_id,
                "to": recipient,
            }));
        }

        let payload = build_reply_payload(comment.as_deref(), body.as_deref(), content_type);
        ctx.client
            .reply_to_message(&message_id, reply_all, payload)
            .await?;
        let mode = if reply_all { "replyAll" } else { "reply" };
        Ok(json!({
            "status": "sent",
            "mode": mode,
            "messageId": message_id,
        }))
    }
}

#[async_trait::async_trait]
impl ToolHandler for DownloadAttachment {
    fn name(&self) -> &'static str {
        "mail.attachment.download"
    }

    async fn run(&self, input: Map<String, Value>, ctx: &ToolContext) -> Result<Value, ToolError> {
        let message_id = required_str(&input, "messageId")?;
        let attachment_id = required_str(&input, "attachmentId")?;
        let target = required_str(&input, "targetPath")?;
        let path = resolve_target(&target, ctx.sandbox_root.as_deref())?;

        if let Ok(meta) = tokio::fs::metadata(&path).await {
            if meta.is_file() && meta.len() > 0 {
                log::info!("mail.attachment.download: {} already exists", path.display());
                return Ok(json!({
                    "status": "exists",
                    "path": path.display().to_string(),
                    "bytes": meta.len(),
                }));
            }
        }

        let content = ctx
            .client
            .download_attachment(&message_id, &attachment_id)
            .await?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::io(parent, e))?;
        }
        tokio::fs::write(&path, &content)
            .await
            .map_err(|e| ToolError::io(&path, e))?;

        log::info!(
            "mail.attachment.download: saved {} bytes to {}",
            content.len(),
            path.display()
        );
        Ok(json!({
            "status": "saved",
            "path": path.display().to_string(),
            "bytes": content.len(),
        }))
    }
}

/// Page size for message listing, clamped to `1..=200`.
pub fn clamp_max_results(value: Option<&Value>) -> u32 {
    let requested = value
        .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
        .unwrap_or(DEFAULT_MAX_RESULTS);
    requested.clamp(1, MAX_RESULTS_LIMIT) as u32
}

/// `$filter` conjunction for the optional time window and unread flag.
pub fn build_filter(start: Option<&str>, end: Option<&str>, unread_only: bool) -> Option<String> {
    let mut clauses = Vec::new();
    if let Some(start) = start {
        clauses.push(format!("receivedDateTime ge {start}"));
    }
    if let Some(end) = end {
        clauses.push(format!("receivedDateTime le {end}"));
    }
    if unread_only {
        clauses.push("isRead eq false".to_string());
    }
    (!clauses.is_empty()).then(|| clauses.join(" and "))
}

/// Graph accepts either `comment` or `message.body`, not both, so a
/// supplied comment is folded into the body.
fn build_reply_payload(comment: Option<&str>, body: Option<&str>, content_type: &str) -> Value {
    match body {
        Some(_) => json!({
            "message": {
                "body": {
                    "contentType": content_type,
                    "content": merge_reply_text(comment, body, content_type),
                }
            }
        }),
        None => json!({ "comment": comment.unwrap_or_default() }),
    }
}

fn merge_reply_text(comment: Option<&str>, body: Option<&str>, content_type: &str) -> String {
    match (comment, body) {
        (Some(comment), Some(body)) if content_type == "HTML" => format!("<p>{comment}</p>{body}"),
        (Some(comment), Some(body)) => format!("{comment}\n\n{body}"),
        (Some(text), None) | (None, Some(text)) => text.to_string(),
        (None, None) => String::new(),
    }
}

/// Absolute destination for an attachment. Relative targets resolve under
/// the sandbox root (or the working directory) and may not climb out of it.
pub fn resolve_target(target: &str, sandbox_root: Option<&Path>) -> Result<PathBuf, ToolError> {
    let target = Path::new(target);
    if target.is_absolute() {
        return Ok(target.to_path_buf());
    }
    if target.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(ToolError::validation(format!(
            "targetPath may not contain '..': {}",
            target.display()
        )));
    }
    let base = match sandbox_root {
        Some(root) => root.to_path_buf(),
        None => std::env::current_dir().map_err(|e| ToolError::io(".", e))?,
    };
    Ok(base.join(target))
}

fn address(recipient: &Value) -> Value {
    json!({
        "name": recipient["emailAddress"]["name"],
        "address": recipient["emailAddress"]["address"],
    })
}

fn addresses(list: &Value) -> Vec<Value> {
    list.as_array()
        .map(|items| items.iter().map(address).collect())
        .unwrap_or_default()
}

fn shape_summary(message: &Value) -> Value {
    json!({
        "id": message["id"],
        "subject": message["subject"],
        "from": address(&message["from"]),
        "to": addresses(&message["toRecipients"]),
        "receivedDateTime": message["receivedDateTime"],
        "isRead": message["isRead"],
        "hasAttachments": message["hasAttachments"],
        "preview": message["bodyPreview"],
        "webLink": message["webLink"],
    })
}

fn shape_latest(message: &Value) -> Value {
    let attachments: Vec<Value> = message["attachments"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .map(|a| {
                    json!({
                        "id": a["id"],
                        "name": a["name"],
                        "contentType": a["contentType"],
                        "size": a["size"],
                        "isInline": a["isInline"],
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    json!({
        "id": message["id"],
        "subject": message["subject"],
        "from": address(&message["from"]),
        "to": addresses(&message["toRecipients"]),
        "cc": addresses(&message["ccRecipients"]),
        "receivedDateTime": message["receivedDateTime"],
        "isRead": message["isRead"],
        "body": {
            "contentType": message["body"]["contentType"],
            "content": message["body"]["content"],
        },
        "webLink": message["webLink"],
        "attachments": attachments,
    })
}
