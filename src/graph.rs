//! Authenticated client for the Microsoft Graph REST API.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use serde_json::{json, Value};

use crate::auth::{CliCredentialSource, CredentialSource, TokenCache};
use crate::config::GraphConfig;
use crate::error::{AuthError, ToolError};

pub const MAIL_READ: &str = "Mail.Read";
pub const MAIL_SEND: &str = "Mail.Send";
pub const CALENDARS_READ: &str = "Calendars.Read";
pub const CALENDARS_READ_WRITE: &str = "Calendars.ReadWrite";

const MESSAGE_FIELDS: &str =
    "id,subject,from,toRecipients,receivedDateTime,isRead,hasAttachments,bodyPreview,webLink";
const LATEST_MESSAGE_FIELDS: &str =
    "id,subject,from,toRecipients,ccRecipients,receivedDateTime,isRead,hasAttachments,body,webLink";
const ATTACHMENT_SUMMARY: &str = "attachments($select=id,name,contentType,size,isInline)";
const EVENT_FIELDS: &str =
    "id,subject,start,end,location,organizer,attendees,isOnlineMeeting,onlineMeeting,webLink";
const CALENDAR_PAGE_SIZE: u32 = 100;
/// Upper bound on `@odata.nextLink` hops for one calendar view.
const MAX_CALENDAR_PAGES: usize = 20;
const NEXT_LINK: &str = "@odata.nextLink";

/// Optional parts of a [`GraphClient::request`] call.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Scopes for the bearer token. Empty means the configured defaults.
    pub scopes: Vec<String>,
    /// Overrides the client's default timeout for this call. Covers token
    /// acquisition as well as the HTTP exchange.
    pub timeout: Option<Duration>,
    /// Skip content negotiation and return the body as bytes.
    pub binary: bool,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn header(mut self, key: &str, value: impl ToString) -> Self {
        self.headers.push((key.to_string(), value.to_string()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn scopes(mut self, scopes: &[&str]) -> Self {
        self.scopes = scopes.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn binary(mut self) -> Self {
        self.binary = true;
        self
    }
}

/// Parsed response body.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(Value),
    Binary(Vec<u8>),
}

impl ResponseBody {
    /// JSON payload; an empty body reads as `null`.
    pub fn into_json(self) -> Result<Value, ToolError> {
        match self {
            Self::Json(value) => Ok(value),
            Self::Binary(bytes) if bytes.is_empty() => Ok(Value::Null),
            Self::Binary(bytes) => Err(ToolError::UnexpectedResponse(format!(
                "expected JSON, got {} bytes of binary content",
                bytes.len()
            ))),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Json(value) => value.to_string().into_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }
}

/// Query for a page of messages in one folder, newest first.
#[derive(Debug, Clone)]
pub struct MessageQuery {
    pub folder_id: String,
    pub top: u32,
    pub filter: Option<String>,
}

/// The process-wide Graph client. Owns the token cache.
pub struct GraphClient {
    http: reqwest::Client,
    base_url: String,
    tokens: TokenCache,
    default_scopes: Vec<String>,
    timeout: Duration,
    download_timeout: Duration,
    closed: AtomicBool,
}

impl GraphClient {
    /// Client authenticating through the configured credential CLI.
    pub fn new(config: &GraphConfig) -> Result<Self, ToolError> {
        let source = Arc::new(CliCredentialSource::new(config.credential_command.clone()));
        Self::with_credential_source(config, source)
    }

    pub fn with_credential_source(
        config: &GraphConfig,
        source: Arc<dyn CredentialSource>,
    ) -> Result<Self, ToolError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            tokens: TokenCache::new(source, config.resource.clone(), config.token_ttl()),
            default_scopes: config.default_scopes.clone(),
            timeout: config.request_timeout(),
            download_timeout: config.download_timeout(),
            closed: AtomicBool::new(false),
        })
    }

    /// Issue an authenticated request against the API base.
    ///
    /// Non-2xx responses become [`ToolError::Request`] carrying the status
    /// and raw body. JSON responses are parsed, anything else is returned as
    /// bytes.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        options: RequestOptions,
    ) -> Result<ResponseBody, ToolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ToolError::Configuration(
                "Graph client has been closed".to_string(),
            ));
        }

        let scopes: &[String] = if options.scopes.is_empty() {
            &self.default_scopes
        } else {
            &options.scopes
        };
        let timeout = options.timeout.unwrap_or(self.timeout);
        let token = tokio::time::timeout(timeout, self.tokens.get_access_token(scopes))
            .await
            .map_err(|_| AuthError::Timeout { after: timeout })??;

        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let query: Vec<&(String, String)> =
            options.query.iter().filter(|(_, v)| !v.is_empty()).collect();

        let mut builder = self
            .http
            .request(method.clone(), &url)
            .bearer_auth(token)
            .timeout(timeout);
        if !query.is_empty() {
            builder = builder.query(&query);
        }
        for (key, value) in &options.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        builder = match options.body {
            // Pre-serialized payloads go out untouched.
            Some(Value::String(raw)) => builder.body(raw),
            Some(body) => builder.json(&body),
            None => builder,
        };

        let response = builder.send().await?;
        let status = response.status();
        log::debug!("{} {} -> {}", method, path, status);

        if !status.is_success() {
            let body = error_body(response).await;
            return Err(ToolError::Request {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or_default().to_string(),
                body,
            });
        }

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.to_ascii_lowercase().contains("json"))
            .unwrap_or(false);
        let bytes = response.bytes().await?;

        if is_json && !options.binary && !bytes.is_empty() {
            let value = serde_json::from_slice(&bytes).map_err(|e| {
                ToolError::UnexpectedResponse(format!("invalid JSON body: {e}"))
            })?;
            Ok(ResponseBody::Json(value))
        } else {
            Ok(ResponseBody::Binary(bytes.to_vec()))
        }
    }

    pub async fn list_messages(&self, query: &MessageQuery) -> Result<Vec<Value>, ToolError> {
        let path = format!("me/mailFolders/{}/messages", encode_segment(&query.folder_id));
        let mut options = RequestOptions::new()
            .scopes(&[MAIL_READ])
            .query("$top", query.top)
            .query("$orderby", "receivedDateTime desc")
            .query("$select", MESSAGE_FIELDS);
        if let Some(filter) = &query.filter {
            options = options.query("$filter", filter);
        }
        let body = self.request(Method::GET, &path, options).await?.into_json()?;
        Ok(collection(body))
    }

    /// Newest message in a folder, with attachment summaries.
    pub async fn get_latest_message(&self, folder_id: &str) -> Result<Option<Value>, ToolError> {
        let path = format!("me/mailFolders/{}/messages", encode_segment(folder_id));
        let options = RequestOptions::new()
            .scopes(&[MAIL_READ])
            .query("$top", 1)
            .query("$orderby", "receivedDateTime desc")
            .query("$select", LATEST_MESSAGE_FIELDS)
            .query("$expand", ATTACHMENT_SUMMARY);
        let body = self.request(Method::GET, &path, options).await?.into_json()?;
        Ok(collection(body).into_iter().next())
    }

    pub async fn get_message(&self, message_id: &str, select: &str) -> Result<Value, ToolError> {
        let path = format!("me/messages/{}", encode_segment(message_id));
        let options = RequestOptions::new()
            .scopes(&[MAIL_READ])
            .query("$select", select);
        self.request(Method::GET, &path, options).await?.into_json()
    }

    pub async fn reply_to_message(
        &self,
        message_id: &str,
        reply_all: bool,
        payload: Value,
    ) -> Result<(), ToolError> {
        let action = if reply_all { "replyAll" } else { "reply" };
        let path = format!("me/messages/{}/{}", encode_segment(message_id), action);
        let options = RequestOptions::new().scopes(&[MAIL_SEND]).json(payload);
        self.request(Method::POST, &path, options).await?;
        Ok(())
    }

    pub async fn send_mail(&self, message: Value) -> Result<(), ToolError> {
        let options = RequestOptions::new()
            .scopes(&[MAIL_SEND])
            .json(json!({ "message": message, "saveToSentItems": true }));
        self.request(Method::POST, "me/sendMail", options).await?;
        Ok(())
    }

    /// Raw content of one attachment.
    pub async fn download_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, ToolError> {
        let path = format!(
            "me/messages/{}/attachments/{}/$value",
            encode_segment(message_id),
            encode_segment(attachment_id)
        );
        let options = RequestOptions::new()
            .scopes(&[MAIL_READ])
            .timeout(self.download_timeout)
            .binary();
        Ok(self.request(Method::GET, &path, options).await?.into_bytes())
    }

    /// Events overlapping the window, earliest start first. Follows
    /// `@odata.nextLink` until the view is exhausted.
    pub async fn list_calendar_events(
        &self,
        start: &str,
        end: &str,
    ) -> Result<Vec<Value>, ToolError> {
        let first = RequestOptions::new()
            .query("startDateTime", start)
            .query("endDateTime", end)
            .query("$orderby", "start/dateTime")
            .query("$top", CALENDAR_PAGE_SIZE)
            .query("$select", EVENT_FIELDS);
        let mut next = Some(("me/calendarView".to_string(), first));
        let mut events = Vec::new();
        let mut pages = 0;

        while let Some((path, options)) = next.take() {
            let options = options
                .scopes(&[CALENDARS_READ])
                .header("Prefer", "outlook.timezone=\"UTC\"");
            let body = self.request(Method::GET, &path, options).await?.into_json()?;
            let link = next_link(&body);
            events.extend(collection(body));
            pages += 1;

            if let Some(link) = link {
                if pages >= MAX_CALENDAR_PAGES {
                    log::warn!(
                        "calendar view still has more pages after {pages}; returning {} events",
                        events.len()
                    );
                    break;
                }
                next = Some((self.relative_link(&link)?, RequestOptions::new()));
            }
        }
        Ok(events)
    }

    pub async fn create_calendar_event(&self, event: Value) -> Result<Value, ToolError> {
        let options = RequestOptions::new()
            .scopes(&[CALENDARS_READ_WRITE])
            .json(event);
        self.request(Method::POST, "me/events", options)
            .await?
            .into_json()
    }

    /// Path and query of a paging link, which must point back at the API
    /// base so the bearer token never leaves it.
    fn relative_link(&self, link: &str) -> Result<String, ToolError> {
        link.strip_prefix(&self.base_url)
            .filter(|rest| rest.starts_with('/'))
            .map(str::to_string)
            .ok_or_else(|| {
                ToolError::UnexpectedResponse(format!("paging link outside the API base: {link}"))
            })
    }

    /// Drop cached credentials and refuse further requests.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.tokens.clear();
    }
}

fn collection(body: Value) -> Vec<Value> {
    match body {
        Value::Object(mut map) => match map.remove("value") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn next_link(body: &Value) -> Option<String> {
    body.get(NEXT_LINK).and_then(Value::as_str).map(str::to_string)
}

/// Graph ids may contain `/` and `+`.
fn encode_segment(raw: &str) -> String {
    urlencoding::encode(raw).into_owned()
}

/// Body of a failed response. A body that cannot be read is noted in its
/// place so the status still reaches the caller.
async fn error_body(response: reqwest::Response) -> String {
    match response.text().await {
        Ok(text) => text,
        Err(err) => {
            log::warn!("could not read error response body: {err}");
            format!("<unreadable response body: {err}>")
        }
    }
}

#[cfg(test)]
pub(crate) fn test_client(base_url: &str) -> GraphClient {
    let config = GraphConfig {
        base_url: base_url.to_string(),
        ..GraphConfig::default()
    };
    let source = Arc::new(crate::auth::StaticCredentialSource("test-token"));
    GraphClient::with_credential_source(&config, source).unwrap()
}
