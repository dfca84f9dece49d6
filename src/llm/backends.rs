use crate::error::BackendError;
use log::warn;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A structured completion request as seen by a backend
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    /// Task description, sent as the system prompt
    pub task: String,
    /// User prompt with the material to work on
    pub prompt: String,
    /// Expected output shape; when set the backend is asked for JSON
    pub schema: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(task: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            prompt: prompt.into(),
            schema: None,
            max_tokens: 1024,
            temperature: 0.1,
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Whether a JSON object is expected back
    pub fn is_structured(&self) -> bool {
        self.schema.is_some()
    }

    /// System prompt with the schema appended
    pub fn system_prompt(&self) -> String {
        match &self.schema {
            Some(schema) => format!(
                "{}\n\nRespond with a single JSON object matching this schema and nothing else:\n{}",
                self.task, schema
            ),
            None => self.task.clone(),
        }
    }
}

/// Why the provider stopped generating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    /// Token budget exhausted
    Length,
    Other,
}

impl FinishReason {
    /// Map the provider-specific stop reason
    pub fn from_provider(reason: Option<&str>) -> Self {
        match reason {
            None | Some("stop") | Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
            Some("length") | Some("max_tokens") => FinishReason::Length,
            Some(_) => FinishReason::Other,
        }
    }
}

/// Raw backend answer plus token-usage metadata
#[derive(Debug, Clone, PartialEq)]
pub struct BackendResponse {
    pub content: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub finish_reason: FinishReason,
}

impl BackendResponse {
    /// A completed response whose token counts are estimated from text length
    pub fn estimated(model: &str, prompt: &str, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            completion_tokens: estimate_tokens(&content),
            prompt_tokens: estimate_tokens(prompt),
            content,
            model: model.to_string(),
            finish_reason: FinishReason::Stop,
        }
    }
}

/// Rough token estimate used when a provider reports no usage
pub fn estimate_tokens(text: &str) -> u32 {
    ((text.chars().count() as f64 / 4.0).ceil() as u32).max(1)
}

/// Trait for LLM backend implementations
///
/// Transport and provider identity are opaque to the orchestrator; it only
/// sees completions and their usage.
pub trait LLMBackend: Send + Sync {
    /// Model identifier reported in diagnoses and usage
    fn model(&self) -> &str;

    fn complete<'a>(
        &'a self,
        request: &'a CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<BackendResponse, BackendError>> + Send + 'a>>;
}

fn http_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            warn!("Falling back to default HTTP client: {}", e);
            Client::new()
        })
}

/// Read an error body for a non-2xx response
async fn error_for_status(response: reqwest::Response) -> BackendError {
    let status = response.status().as_u16();
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    BackendError::Api { status, message }
}

/// Ollama backend for local LLM inference
pub struct OllamaBackend {
    client: Client,
    endpoint: String,
    model: String,
}

/// Request format for Ollama API
#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    system: String,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'static str>,
    options: OllamaOptions,
}

/// Options for Ollama inference
#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

/// Response format from Ollama API
#[derive(Debug, Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

impl OllamaBackend {
    /// Create a new Ollama backend
    ///
    /// # Arguments
    /// * `endpoint` - Ollama server URL (e.g., "http://localhost:11434")
    /// * `model` - Model name to use (e.g., "llama3", "mistral")
    ///
    /// # Example
    /// ```
    /// use warden::llm::backends::OllamaBackend;
    ///
    /// let backend = OllamaBackend::new(
    ///     "http://localhost:11434".to_string(),
    ///     "llama3".to_string()
    /// );
    /// ```
    pub fn new(endpoint: String, model: String) -> Self {
        Self {
            client: http_client(Duration::from_secs(120)),
            endpoint,
            model,
        }
    }

    /// Format the Ollama API endpoint URL
    fn api_url(&self) -> String {
        format!("{}/api/generate", self.endpoint.trim_end_matches('/'))
    }
}

impl LLMBackend for OllamaBackend {
    fn model(&self) -> &str {
        &self.model
    }

    fn complete<'a>(
        &'a self,
        request: &'a CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<BackendResponse, BackendError>> + Send + 'a>> {
        Box::pin(async move {
            let body = OllamaRequest {
                model: &self.model,
                system: request.system_prompt(),
                prompt: &request.prompt,
                stream: false,
                format: request.is_structured().then_some("json"),
                options: OllamaOptions {
                    temperature: request.temperature,
                    num_predict: request.max_tokens,
                },
            };

            let response = self.client.post(self.api_url()).json(&body).send().await?;
            if !response.status().is_success() {
                return Err(error_for_status(response).await);
            }

            let parsed: OllamaResponse = response.json().await.map_err(|e| {
                BackendError::InvalidResponse(format!("Failed to parse Ollama response: {}", e))
            })?;

            if let Some(error) = parsed.error {
                return Err(BackendError::Communication(format!("Ollama error: {}", error)));
            }

            Ok(BackendResponse {
                prompt_tokens: parsed
                    .prompt_eval_count
                    .unwrap_or_else(|| estimate_tokens(&request.prompt)),
                completion_tokens: parsed
                    .eval_count
                    .unwrap_or_else(|| estimate_tokens(&parsed.response)),
                finish_reason: FinishReason::from_provider(parsed.done_reason.as_deref()),
                content: parsed.response,
                model: self.model.clone(),
            })
        })
    }
}

/// OpenAI backend, also usable with any OpenAI-compatible endpoint
pub struct OpenAIBackend {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

/// Request format for OpenAI Chat Completions API
#[derive(Debug, Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<OpenAIResponseFormat>,
}

/// Message format shared by the chat-style APIs
#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

/// Response format specification for OpenAI API
#[derive(Debug, Serialize)]
struct OpenAIResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

/// Response format from OpenAI API
#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    #[serde(default)]
    choices: Vec<OpenAIChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
    #[serde(default)]
    error: Option<ProviderErrorBody>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

/// Error body returned by OpenAI and Anthropic
#[derive(Debug, Deserialize)]
struct ProviderErrorBody {
    message: String,
}

impl OpenAIBackend {
    /// Create a new OpenAI backend
    ///
    /// # Example
    /// ```
    /// use warden::llm::backends::OpenAIBackend;
    ///
    /// let backend = OpenAIBackend::new(
    ///     "sk-...".to_string(),
    ///     "gpt-4o-mini".to_string()
    /// );
    /// ```
    pub fn new(api_key: String, model: String) -> Self {
        Self::with_base_url(api_key, model, "https://api.openai.com/v1".to_string())
    }

    /// Create a new OpenAI backend with custom base URL
    pub fn with_base_url(api_key: String, model: String, base_url: String) -> Self {
        Self {
            client: http_client(Duration::from_secs(120)),
            api_key,
            model,
            base_url,
        }
    }

    fn api_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

impl LLMBackend for OpenAIBackend {
    fn model(&self) -> &str {
        &self.model
    }

    fn complete<'a>(
        &'a self,
        request: &'a CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<BackendResponse, BackendError>> + Send + 'a>> {
        Box::pin(async move {
            let body = OpenAIRequest {
                model: &self.model,
                messages: vec![
                    ChatMessage {
                        role: "system",
                        content: request.system_prompt(),
                    },
                    ChatMessage {
                        role: "user",
                        content: request.prompt.clone(),
                    },
                ],
                temperature: request.temperature,
                max_tokens: request.max_tokens,
                response_format: request.is_structured().then_some(OpenAIResponseFormat {
                    format_type: "json_object",
                }),
            };

            let response = self
                .client
                .post(self.api_url())
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(error_for_status(response).await);
            }

            let parsed: OpenAIResponse = response.json().await.map_err(|e| {
                BackendError::InvalidResponse(format!("Failed to parse OpenAI response: {}", e))
            })?;

            if let Some(error) = parsed.error {
                return Err(BackendError::Communication(format!(
                    "OpenAI error: {}",
                    error.message
                )));
            }

            let choice = parsed.choices.into_iter().next().ok_or_else(|| {
                BackendError::InvalidResponse("No choices in OpenAI response".to_string())
            })?;
            let content = choice.message.content.unwrap_or_default();

            let (prompt_tokens, completion_tokens) = match parsed.usage {
                Some(usage) => (usage.prompt_tokens, usage.completion_tokens),
                None => (estimate_tokens(&request.prompt), estimate_tokens(&content)),
            };

            Ok(BackendResponse {
                content,
                model: self.model.clone(),
                prompt_tokens,
                completion_tokens,
                finish_reason: FinishReason::from_provider(choice.finish_reason.as_deref()),
            })
        })
    }
}

/// Anthropic Messages API backend
pub struct AnthropicBackend {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicContent>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
    #[serde(default)]
    error: Option<ProviderErrorBody>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

impl AnthropicBackend {
    pub fn new(api_key: String, model: String) -> Self {
        Self::with_base_url(api_key, model, "https://api.anthropic.com".to_string())
    }

    pub fn with_base_url(api_key: String, model: String, base_url: String) -> Self {
        Self {
            client: http_client(Duration::from_secs(120)),
            api_key,
            model,
            base_url,
        }
    }

    fn api_url(&self) -> String {
        format!("{}/v1/messages", self.base_url.trim_end_matches('/'))
    }
}

impl LLMBackend for AnthropicBackend {
    fn model(&self) -> &str {
        &self.model
    }

    fn complete<'a>(
        &'a self,
        request: &'a CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<BackendResponse, BackendError>> + Send + 'a>> {
        Box::pin(async move {
            let body = AnthropicRequest {
                model: &self.model,
                max_tokens: request.max_tokens,
                system: request.system_prompt(),
                messages: vec![ChatMessage {
                    role: "user",
                    content: request.prompt.clone(),
                }],
                temperature: request.temperature,
            };

            let response = self
                .client
                .post(self.api_url())
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", "2023-06-01")
                .json(&body)
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(error_for_status(response).await);
            }

            let parsed: AnthropicResponse = response.json().await.map_err(|e| {
                BackendError::InvalidResponse(format!("Failed to parse Anthropic response: {}", e))
            })?;

            if let Some(error) = parsed.error {
                return Err(BackendError::Communication(format!(
                    "Anthropic error: {}",
                    error.message
                )));
            }

            let content: String = parsed
                .content
                .into_iter()
                .filter(|block| block.content_type == "text")
                .filter_map(|block| block.text)
                .collect::<Vec<_>>()
                .join("");

            let (prompt_tokens, completion_tokens) = match parsed.usage {
                Some(usage) => (usage.input_tokens, usage.output_tokens),
                None => (estimate_tokens(&request.prompt), estimate_tokens(&content)),
            };

            Ok(BackendResponse {
                content,
                model: self.model.clone(),
                prompt_tokens,
                completion_tokens,
                finish_reason: FinishReason::from_provider(parsed.stop_reason.as_deref()),
            })
        })
    }
}

/// Mock backend for testing and offline runs
///
/// Returns scripted responses in order, cycling back to the first after the
/// last. Can simulate delays, failures and degenerate output.
#[derive(Clone)]
pub struct MockBackend {
    model: String,
    responses: Arc<Vec<Result<BackendResponse, BackendError>>>,
    current_index: Arc<Mutex<usize>>,
    delay: Option<Duration>,
    call_count: Arc<Mutex<usize>>,
    last_request: Arc<Mutex<Option<CompletionRequest>>>,
}

impl MockBackend {
    /// Create a mock backend that always gives the same answer
    ///
    /// # Example
    /// ```
    /// use warden::llm::backends::{BackendResponse, MockBackend};
    ///
    /// let backend = MockBackend::with_response(Ok(BackendResponse::estimated(
    ///     "mock",
    ///     "prompt",
    ///     r#"{"category":"connectivity"}"#,
    /// )));
    /// ```
    pub fn with_response(response: Result<BackendResponse, BackendError>) -> Self {
        Self::with_responses(vec![response])
    }

    /// Create a mock backend with multiple responses
    ///
    /// Responses are returned in order. After the last response,
    /// the backend cycles back to the first response.
    pub fn with_responses(responses: Vec<Result<BackendResponse, BackendError>>) -> Self {
        Self {
            model: "mock".to_string(),
            responses: Arc::new(responses),
            current_index: Arc::new(Mutex::new(0)),
            delay: None,
            call_count: Arc::new(Mutex::new(0)),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Create a mock backend that always answers with `content`
    pub fn success(content: &str) -> Self {
        Self::with_response(Ok(BackendResponse::estimated("mock", "", content)))
    }

    /// Create a mock backend that always fails with a communication error
    pub fn error(message: &str) -> Self {
        Self::with_response(Err(BackendError::Communication(message.to_string())))
    }

    /// Create a mock backend that reports transport timeouts
    pub fn timeout() -> Self {
        Self::with_response(Err(BackendError::Timeout))
    }

    /// Add a delay to all responses (useful for testing timeout behavior)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    /// Number of times `complete` has been called
    pub fn call_count(&self) -> usize {
        *self.call_count.lock().unwrap()
    }

    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.last_request.lock().unwrap().clone()
    }

    /// Reset call tracking and the response cursor
    pub fn reset(&self) {
        *self.call_count.lock().unwrap() = 0;
        *self.last_request.lock().unwrap() = None;
        *self.current_index.lock().unwrap() = 0;
    }
}

impl LLMBackend for MockBackend {
    fn model(&self) -> &str {
        &self.model
    }

    fn complete<'a>(
        &'a self,
        request: &'a CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<BackendResponse, BackendError>> + Send + 'a>> {
        Box::pin(async move {
            *self.call_count.lock().unwrap() += 1;
            *self.last_request.lock().unwrap() = Some(request.clone());

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            if self.responses.is_empty() {
                return Err(BackendError::InvalidResponse(
                    "Mock backend has no scripted responses".to_string(),
                ));
            }

            let response_index = {
                let mut index = self.current_index.lock().unwrap();
                let current = *index % self.responses.len();
                *index += 1;
                current
            };

            self.responses[response_index].clone().map(|mut response| {
                response.model = self.model.clone();
                response
            })
        })
    }
}
