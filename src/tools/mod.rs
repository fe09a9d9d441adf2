pub mod calendar;
pub mod mail;
pub mod manifest;
pub mod registry;

pub use manifest::Manifest;
pub use registry::ToolRegistry;

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::config::Config;
use crate::error::ToolError;
use crate::graph::GraphClient;

/// Shared state handed to every handler call.
pub struct ToolContext {
    pub client: Arc<GraphClient>,
    pub sandbox_root: Option<PathBuf>,
    /// Send replies as new messages to this address instead.
    pub reply_redirect: Option<String>,
}

impl ToolContext {
    pub fn new(client: Arc<GraphClient>, config: &Config) -> Self {
        Self {
            client,
            sandbox_root: config.files.sandbox_root.clone(),
            reply_redirect: config.reply.redirect_to.clone(),
        }
    }
}

/// One named capability the agent can call.
///
/// Handlers check their own required inputs so they stay safe when schema
/// validation is switched off.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self, input: Map<String, Value>, ctx: &ToolContext) -> Result<Value, ToolError>;
}

/// Every handler this server knows about.
pub fn all_handlers() -> Vec<Arc<dyn ToolHandler>> {
    vec![
        Arc::new(mail::LatestMessage),
        Arc::new(mail::ListMessages),
        Arc::new(mail::ReplyToMessage),
        Arc::new(mail::DownloadAttachment),
        Arc::new(calendar::ListEvents),
        Arc::new(calendar::CreateEvent),
    ]
}

/// Non-empty, trimmed string field.
pub(crate) fn optional_str(input: &Map<String, Value>, key: &str) -> Option<String> {
    input
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub(crate) fn required_str(input: &Map<String, Value>, key: &str) -> Result<String, ToolError> {
    optional_str(input, key).ok_or_else(|| ToolError::validation(format!("{key} is required")))
}

/// Body content types Graph accepts, spelled the way the manifest lists them.
pub(crate) const CONTENT_TYPES: [&str; 2] = ["Text", "HTML"];

/// `contentType` input, `Text` when absent. Only the manifest spellings pass,
/// so the handler accepts exactly what the schema advertises.
pub(crate) fn content_type(input: &Map<String, Value>) -> Result<&'static str, ToolError> {
    match optional_str(input, "contentType") {
        None => Ok(CONTENT_TYPES[0]),
        Some(given) => CONTENT_TYPES
            .into_iter()
            .find(|ct| *ct == given)
            .ok_or_else(|| {
                ToolError::validation(format!(
                    "contentType must be one of {}, got {given}",
                    CONTENT_TYPES.join(", ")
                ))
            }),
    }
}

pub(crate) fn bool_or(input: &Map<String, Value>, key: &str, default: bool) -> bool {
    input.get(key).and_then(Value::as_bool).unwrap_or(default)
}
