//! Tool server facade and its newline-delimited JSON transport.

use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::ToolError;
use crate::graph::GraphClient;
use crate::tools::{Manifest, ToolContext, ToolRegistry};

const LOG_ERROR_CHARS: usize = 200;

/// Owns the Graph client, the registry and the per-call context.
pub struct ToolServer {
    ctx: ToolContext,
    registry: ToolRegistry,
    validate_inputs: bool,
}

impl ToolServer {
    /// Validate the config and build a server authenticating through the
    /// configured credential command.
    pub fn bootstrap(config: &Config) -> Result<Self, ToolError> {
        config.validate()?;
        let client = GraphClient::new(&config.graph)?;
        Self::with_client(config, Arc::new(client))
    }

    pub fn with_client(config: &Config, client: Arc<GraphClient>) -> Result<Self, ToolError> {
        let registry = ToolRegistry::new(&config.features)?;
        log::info!(
            "tool server ready with {} tools (input validation {})",
            registry.names().len(),
            if config.features.validate_inputs { "on" } else { "off" }
        );
        Ok(Self {
            ctx: ToolContext::new(client, config),
            registry,
            validate_inputs: config.features.validate_inputs,
        })
    }

    /// An owned copy of the manifest; callers may mutate it freely.
    pub fn list_tools(&self) -> Manifest {
        self.registry.manifest().clone()
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ToolError> {
        let Some(handler) = self.registry.handler(name) else {
            log::warn!("call to unknown tool '{name}'");
            return Err(ToolError::UnknownTool {
                name: name.to_string(),
                supported: self.registry.names(),
            });
        };

        let input = match arguments {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        let outcome = match self.prepare_input(name, input) {
            Ok(input) => {
                if let Some(definition) = self.registry.definition(name) {
                    log::debug!(
                        "running tool {name} (scopes: {:?})",
                        definition.metadata.required_scopes
                    );
                }
                handler.run(input, &self.ctx).await
            }
            Err(err) => Err(err),
        };
        outcome.inspect_err(|err| {
            log::error!("tool {name} failed: {}", err.truncated(LOG_ERROR_CHARS));
        })
    }

    /// Validate and normalize arguments when validation is switched on.
    fn prepare_input(&self, name: &str, input: Map<String, Value>) -> Result<Map<String, Value>, ToolError> {
        if !self.validate_inputs {
            return Ok(input);
        }
        let Some(validator) = self.registry.validator(name) else {
            return Ok(input);
        };
        let normalized = validator
            .validate(&Value::Object(input))
            .map_err(|violations| ToolError::Validation(violations.to_string()))?;
        Ok(match normalized {
            Value::Object(map) => map,
            _ => Map::new(),
        })
    }

    /// Release the Graph client and its cached credentials.
    pub fn close(&self) {
        self.ctx.client.close();
        log::info!("tool server closed");
    }
}

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

/// Serve requests, one JSON object per line, until the reader hits EOF.
///
/// `{"id", "method": "tools/list"}` and
/// `{"id", "method": "tools/call", "params": {"name", "arguments"}}` are
/// answered with `{"id", "result"}` or `{"id", "error": {"message"}}`.
/// Requests run concurrently, so responses arrive in completion order.
pub async fn serve<R, W>(server: Arc<ToolServer>, reader: R, mut writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let mut lines = reader.lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Request>(line) {
                    Ok(request) => {
                        let server = Arc::clone(&server);
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            let id = request.id.clone();
                            let response = match dispatch(&server, request).await {
                                Ok(result) => json!({ "id": id, "result": result }),
                                Err(message) => json!({ "id": id, "error": { "message": message } }),
                            };
                            // Receiver only goes away when serve itself fails.
                            let _ = tx.send(response);
                        });
                    }
                    Err(err) => {
                        log::warn!("malformed request line: {err}");
                        let message = format!("malformed request: {err}");
                        write_line(&mut writer, &json!({ "id": Value::Null, "error": { "message": message } })).await?;
                    }
                }
            }
            Some(response) = rx.recv() => write_line(&mut writer, &response).await?,
        }
    }

    log::info!("input closed, waiting for in-flight calls");
    drop(tx);
    while let Some(response) = rx.recv().await {
        write_line(&mut writer, &response).await?;
    }
    Ok(())
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, response: &Value) -> Result<()> {
    let mut out = serde_json::to_string(response)?;
    out.push('\n');
    writer.write_all(out.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

async fn dispatch(server: &ToolServer, request: Request) -> Result<Value, String> {
    match request.method.as_str() {
        "tools/list" => serde_json::to_value(server.list_tools()).map_err(|e| e.to_string()),
        "tools/call" => {
            let name = request.params["name"].as_str().unwrap_or_default().to_string();
            let arguments = request.params.get("arguments").cloned().unwrap_or(Value::Null);
            server
                .call_tool(&name, arguments)
                .await
                .map_err(|e| e.to_string())
        }
        other => Err(format!("unknown method '{other}'")),
    }
}
