use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use relay_core::error::{RelayError, Result};
use relay_core::traits::LlmProvider;
use relay_core::types::*;

use crate::streaming::{SseEvent, SseStream};

/// OpenAI-compatible provider. Works with OpenAI, Ollama, vLLM, Groq, OpenRouter, etc.
pub struct OpenAiProvider {
    http: Client,
    name: String,
    endpoint: String,
    api_key: Option<String>,
    extra_headers: Vec<(String, String)>,
}

impl OpenAiProvider {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            name: name.into(),
            endpoint: endpoint.into(),
            api_key: None,
            extra_headers: Vec::new(),
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.is_empty());
        self
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.extra_headers = headers;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(&self, body: &ChatRequest) -> Result<reqwest::Response> {
        let mut req = self.http.post(&self.endpoint).json(body);
        if let Some(api_key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }
        for (k, v) in &self.extra_headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let response = req
            .send()
            .await
            .map_err(|e| RelayError::Provider(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(RelayError::Provider(format!("HTTP {}: {}", status, body)));
        }
        Ok(response)
    }
}

// Request types
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    temperature: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OaiTool>,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Serialize)]
struct OaiMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct OaiTool {
    r#type: &'static str,
    function: OaiToolDef,
}

#[derive(Serialize)]
struct OaiToolDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

// Response types
#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ResponseChoice>,
    #[serde(default)]
    usage: Option<OaiUsage>,
}

#[derive(Deserialize, Debug)]
struct ResponseChoice {
    message: ResponseMessage,
}

#[derive(Deserialize, Debug)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OaiToolCall>,
}

#[derive(Deserialize, Debug)]
struct OaiToolCall {
    #[serde(default)]
    id: Option<String>,
    function: OaiFunction,
}

#[derive(Deserialize, Debug)]
struct OaiFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Deserialize, Debug)]
struct OaiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl From<OaiUsage> for Usage {
    fn from(u: OaiUsage) -> Self {
        Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        }
    }
}

#[derive(Deserialize, Debug)]
struct ChunkBody {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<OaiUsage>,
}

#[derive(Deserialize, Debug)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Deserialize, Debug, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

fn build_request(request: CompletionRequest, stream: bool) -> ChatRequest {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if !request.system_prompt.is_empty() {
        messages.push(OaiMessage {
            role: "system",
            content: request.system_prompt,
        });
    }
    messages.extend(request.messages.into_iter().map(|m| OaiMessage {
        role: m.role.as_str(),
        content: m.content,
    }));

    ChatRequest {
        model: request.model,
        messages,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        stream,
        stream_options: stream.then_some(StreamOptions {
            include_usage: true,
        }),
        tools: request
            .tools
            .into_iter()
            .map(|t| OaiTool {
                r#type: "function",
                function: OaiToolDef {
                    name: t.name,
                    description: t.description,
                    parameters: t.input_schema,
                },
            })
            .collect(),
    }
}

fn convert_response(body: ChatResponse) -> Result<CompletionResponse> {
    let choice = body
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| RelayError::ProviderParse("response has no choices".to_string()))?;

    let tool_calls = choice
        .message
        .tool_calls
        .into_iter()
        .enumerate()
        .map(|(i, tc)| {
            let arguments = if tc.function.arguments.trim().is_empty() {
                serde_json::Map::new()
            } else {
                match serde_json::from_str::<serde_json::Value>(&tc.function.arguments) {
                    Ok(serde_json::Value::Object(map)) => map,
                    Ok(other) => {
                        let mut map = serde_json::Map::new();
                        map.insert("input".to_string(), other);
                        map
                    }
                    Err(e) => {
                        return Err(RelayError::ProviderParse(format!(
                            "tool call {} arguments: {}",
                            tc.function.name, e
                        )))
                    }
                }
            };
            Ok(ToolCall {
                id: tc
                    .id
                    .unwrap_or_else(|| format!("{}_{}", tc.function.name, i)),
                name: tc.function.name,
                arguments,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(CompletionResponse {
        content: choice.message.content.unwrap_or_default(),
        tool_calls,
        usage: body.usage.map(Usage::from),
    })
}

fn parse_chunk(event: SseEvent) -> Option<Result<StreamChunk>> {
    if event.is_done_marker() {
        return Some(Ok(StreamChunk {
            done: true,
            ..Default::default()
        }));
    }

    match serde_json::from_str::<ChunkBody>(&event.data) {
        Ok(body) => {
            let usage = body.usage.map(Usage::from);
            let content = body
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.delta.content)
                .unwrap_or_default();
            if content.is_empty() && usage.is_none() {
                return None;
            }
            Some(Ok(StreamChunk {
                content,
                done: false,
                usage,
            }))
        }
        Err(e) => {
            warn!(data = %event.data, error = %e, "Failed to parse SSE chunk");
            None
        }
    }
}

impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<CompletionResponse>> {
        Box::pin(async move {
            let body = build_request(request, false);
            debug!(provider = %self.name, model = %body.model, "Sending completion request");
            let response = self.send(&body).await?;
            let parsed: ChatResponse = response
                .json()
                .await
                .map_err(|e| RelayError::ProviderParse(e.to_string()))?;
            convert_response(parsed)
        })
    }

    fn complete_stream(
        &self,
        request: CompletionRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'static, Result<StreamChunk>>>> {
        Box::pin(async move {
            let body = build_request(request, true);
            debug!(provider = %self.name, model = %body.model, "Opening completion stream");
            let response = self.send(&body).await?;

            let chunks = SseStream::new(response.bytes_stream()).filter_map(|event| async move {
                match event {
                    Ok(event) => parse_chunk(event),
                    Err(e) => Some(Err(e)),
                }
            });

            Ok(Box::pin(chunks) as BoxStream<'static, Result<StreamChunk>>)
        })
    }
}
