use anyhow::{Context, Result, anyhow};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use tracing::debug;

use crate::models::{Posting, Project};
use crate::run::{GenerationBackend, GenerationStream, StreamEvent};

#[derive(Debug, Clone)]
pub enum ProviderKind {
    Anthropic,
    OpenAI,
}

#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub provider: ProviderKind,
    pub model_id: String,
    pub short_name: String,
}

pub fn resolve_model(name: &str) -> Result<ModelSpec> {
    match name {
        // Anthropic API (requires ANTHROPIC_API_KEY)
        "sonnet" => Ok(ModelSpec {
            provider: ProviderKind::Anthropic,
            model_id: "claude-sonnet-4-5-20250929".to_string(),
            short_name: "sonnet".to_string(),
        }),
        "opus" => Ok(ModelSpec {
            provider: ProviderKind::Anthropic,
            model_id: "claude-opus-4-6".to_string(),
            short_name: "opus".to_string(),
        }),
        "haiku" => Ok(ModelSpec {
            provider: ProviderKind::Anthropic,
            model_id: "claude-haiku-4-5-20251001".to_string(),
            short_name: "haiku".to_string(),
        }),
        // OpenAI (requires OPENAI_API_KEY)
        "gpt-4o" => Ok(ModelSpec {
            provider: ProviderKind::OpenAI,
            model_id: "gpt-4o".to_string(),
            short_name: "gpt-4o".to_string(),
        }),
        "gpt-5.2" | "gpt5" => Ok(ModelSpec {
            provider: ProviderKind::OpenAI,
            model_id: "gpt-5.2".to_string(),
            short_name: "gpt-5.2".to_string(),
        }),
        _ => Err(anyhow!(
            "Unknown model '{}'. Available: sonnet (default), opus, haiku, gpt-4o, gpt-5.2",
            name
        )),
    }
}

pub fn create_backend(spec: &ModelSpec) -> Result<Box<dyn GenerationBackend>> {
    match spec.provider {
        ProviderKind::Anthropic => Ok(Box::new(AnthropicBackend::new(spec.model_id.clone())?)),
        ProviderKind::OpenAI => Ok(Box::new(OpenAIBackend::new(spec.model_id.clone())?)),
    }
}

const EVENT_CHANNEL_CAPACITY: usize = 32;

// --- Anthropic backend ---

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    stream: bool,
    messages: Vec<AnthropicMessage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    delta: Option<AnthropicDelta>,
    #[serde(default)]
    error: Option<AnthropicErrorBody>,
}

#[derive(Debug, Deserialize)]
struct AnthropicDelta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorBody {
    message: String,
}

#[derive(Debug)]
pub struct AnthropicBackend {
    api_key: String,
    model_id: String,
    client: reqwest::Client,
}

impl AnthropicBackend {
    pub fn new(model_id: String) -> Result<Self> {
        let api_key = env::var("ANTHROPIC_API_KEY")
            .context("ANTHROPIC_API_KEY environment variable not set. Set it with: export ANTHROPIC_API_KEY=your-key-here")?;
        Ok(Self {
            api_key,
            model_id,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl GenerationBackend for AnthropicBackend {
    async fn begin(&self, prompt: &str) -> Result<GenerationStream> {
        let request = AnthropicRequest {
            model: self.model_id.clone(),
            max_tokens: 4096,
            stream: true,
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .context("Failed to send request to Anthropic API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Anthropic API request failed with status {}: {}",
                status,
                error_text
            ));
        }

        Ok(spawn_sse_pump(response, parse_anthropic_data))
    }
}

// --- OpenAI backend ---

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    max_tokens: u32,
    stream: bool,
    messages: Vec<OpenAIMessage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChunk {
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    delta: OpenAIDelta,
}

#[derive(Debug, Deserialize)]
struct OpenAIDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug)]
pub struct OpenAIBackend {
    api_key: String,
    model_id: String,
    client: reqwest::Client,
}

impl OpenAIBackend {
    pub fn new(model_id: String) -> Result<Self> {
        let api_key = env::var("OPENAI_API_KEY")
            .context("OPENAI_API_KEY environment variable not set. Set it with: export OPENAI_API_KEY=your-key-here")?;
        Ok(Self {
            api_key,
            model_id,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl GenerationBackend for OpenAIBackend {
    async fn begin(&self, prompt: &str) -> Result<GenerationStream> {
        let request = OpenAIRequest {
            model: self.model_id.clone(),
            max_tokens: 4096,
            stream: true,
            messages: vec![OpenAIMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        let response = self
            .client
            .post(OPENAI_API_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .context("Failed to send request to OpenAI API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "OpenAI API request failed with status {}: {}",
                status,
                error_text
            ));
        }

        Ok(spawn_sse_pump(response, parse_openai_data))
    }
}

// --- SSE plumbing ---

/// Pump an SSE byte stream into controller events until a terminal event,
/// upstream cancellation, or the consumer going away. Dropping the sender
/// without a Done is deliberate on early termination: the controller
/// treats it as an incomplete stream.
fn spawn_sse_pump(
    response: reqwest::Response,
    parse_data: fn(&str) -> Option<StreamEvent>,
) -> GenerationStream {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let cancel = Arc::new(Notify::new());
    let cancel_signal = cancel.clone();

    tokio::spawn(async move {
        let mut bytes = Box::pin(response.bytes_stream());
        let mut lines = SseLineBuffer::new();
        loop {
            tokio::select! {
                _ = cancel_signal.notified() => {
                    debug!("generation stream cancelled upstream");
                    return;
                }
                chunk = bytes.next() => match chunk {
                    Some(Ok(data)) => {
                        for line in lines.push(&data) {
                            let Some(data) = line.strip_prefix("data: ") else {
                                continue; // event:/id:/ping lines
                            };
                            if let Some(event) = parse_data(data.trim()) {
                                let terminal =
                                    matches!(event, StreamEvent::Done | StreamEvent::Error(_));
                                if tx.send(event).await.is_err() {
                                    return; // controller superseded us
                                }
                                if terminal {
                                    return;
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(StreamEvent::Error(e.to_string())).await;
                        return;
                    }
                    None => return,
                },
            }
        }
    });

    GenerationStream { events: rx, cancel }
}

/// Accumulates raw bytes and hands back complete lines; SSE events may be
/// split across network reads.
struct SseLineBuffer {
    buffer: String,
}

impl SseLineBuffer {
    fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut lines = Vec::new();
        while let Some(idx) = self.buffer.find('\n') {
            let line = self.buffer[..idx].trim_end_matches('\r').to_string();
            self.buffer.drain(..=idx);
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }
}

fn parse_anthropic_data(data: &str) -> Option<StreamEvent> {
    let event: AnthropicEvent = serde_json::from_str(data).ok()?;
    match event.kind.as_str() {
        "content_block_delta" => event
            .delta
            .and_then(|d| d.text)
            .filter(|t| !t.is_empty())
            .map(StreamEvent::Delta),
        "message_stop" => Some(StreamEvent::Done),
        "error" => Some(StreamEvent::Error(
            event
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "unknown provider error".to_string()),
        )),
        // message_start, content_block_start, message_delta, ping, ...
        _ => None,
    }
}

fn parse_openai_data(data: &str) -> Option<StreamEvent> {
    if data == "[DONE]" {
        return Some(StreamEvent::Done);
    }
    let chunk: OpenAIChunk = serde_json::from_str(data).ok()?;
    chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|t| !t.is_empty())
        .map(StreamEvent::Delta)
}

// --- Prompt assembly ---

/// Compose the generation prompt for one posting, mining the selected
/// portfolio projects (locked picks first, then the AI-selectable fill).
pub fn build_generation_prompt(posting: &Posting, projects: &[&Project]) -> String {
    let mut project_sections = String::new();
    for (i, project) in projects.iter().enumerate() {
        if i == 0 {
            project_sections.push_str(&format!(
                "=== FEATURED PROJECT: {} ===\n{}\n\n",
                project.name, project.summary
            ));
        } else {
            project_sections.push_str(&format!(
                "=== PROJECT: {} ===\n{}\n\n",
                project.name, project.summary
            ));
        }
    }

    let company = posting.company.as_deref().unwrap_or("the employer");
    let description = posting.description.as_deref().unwrap_or("(no description captured)");

    format!(
        "You are an expert application writer. Draft a tailored, concise application \
        message for the job below.\n\n\
        IMPORTANT RULES:\n\
        - Stay 100% truthful — only use facts from the provided projects\n\
        - Tailor language and emphasis to this specific role\n\
        - Reference the most relevant projects by name\n\
        - Keep it under four paragraphs\n\n\
        Job Title: {title}\n\
        Company: {company}\n\n\
        Job Description:\n{description}\n\n\
        {project_sections}\
        Write the application message now:",
        title = posting.title,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Source, Stage};

    fn posting(title: &str, company: Option<&str>) -> Posting {
        Posting {
            id: 1,
            source: Source::Manual,
            dedup_key: "k".to_string(),
            title: title.to_string(),
            company: company.map(str::to_string),
            description: Some("Ship reliable pipelines.".to_string()),
            url: None,
            raw_payload: None,
            visa_sponsor: None,
            stage: Stage::Discovered,
            discovered_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_resolve_model_anthropic() {
        let spec = resolve_model("sonnet").unwrap();
        assert_eq!(spec.model_id, "claude-sonnet-4-5-20250929");
        assert!(matches!(spec.provider, ProviderKind::Anthropic));

        let spec = resolve_model("opus").unwrap();
        assert_eq!(spec.model_id, "claude-opus-4-6");
    }

    #[test]
    fn test_resolve_model_openai() {
        let spec = resolve_model("gpt5").unwrap();
        assert_eq!(spec.short_name, "gpt-5.2");
        assert!(matches!(spec.provider, ProviderKind::OpenAI));
    }

    #[test]
    fn test_resolve_model_unknown() {
        assert!(resolve_model("gpt-3").is_err());
    }

    #[test]
    fn test_anthropic_backend_requires_api_key() {
        let original = env::var("ANTHROPIC_API_KEY").ok();
        unsafe {
            env::remove_var("ANTHROPIC_API_KEY");
        }

        let result = AnthropicBackend::new("claude-sonnet-4-5-20250929".to_string());
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("ANTHROPIC_API_KEY"));

        unsafe {
            env::set_var("ANTHROPIC_API_KEY", "test-key");
        }
        assert!(AnthropicBackend::new("claude-sonnet-4-5-20250929".to_string()).is_ok());

        unsafe {
            match original {
                Some(val) => env::set_var("ANTHROPIC_API_KEY", val),
                None => env::remove_var("ANTHROPIC_API_KEY"),
            }
        }
    }

    #[test]
    fn test_openai_backend_requires_api_key() {
        let original = env::var("OPENAI_API_KEY").ok();
        unsafe {
            env::remove_var("OPENAI_API_KEY");
        }

        let result = OpenAIBackend::new("gpt-4o".to_string());
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("OPENAI_API_KEY"));

        unsafe {
            match original {
                Some(val) => env::set_var("OPENAI_API_KEY", val),
                None => env::remove_var("OPENAI_API_KEY"),
            }
        }
    }

    #[test]
    fn test_sse_line_buffer_handles_partial_lines() {
        let mut buf = SseLineBuffer::new();
        assert!(buf.push(b"data: {\"type\":").is_empty());
        let lines = buf.push(b"\"ping\"}\ndata: x\n");
        assert_eq!(lines, vec!["data: {\"type\":\"ping\"}", "data: x"]);
    }

    #[test]
    fn test_sse_line_buffer_strips_crlf_and_blanks() {
        let mut buf = SseLineBuffer::new();
        let lines = buf.push(b"event: ping\r\n\r\ndata: one\n");
        assert_eq!(lines, vec!["event: ping", "data: one"]);
    }

    #[test]
    fn test_parse_anthropic_delta_and_stop() {
        let event = parse_anthropic_data(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#,
        );
        assert!(matches!(event, Some(StreamEvent::Delta(t)) if t == "Hi"));

        assert!(matches!(
            parse_anthropic_data(r#"{"type":"message_stop"}"#),
            Some(StreamEvent::Done)
        ));

        // bookkeeping events produce nothing
        assert!(parse_anthropic_data(r#"{"type":"ping"}"#).is_none());
        assert!(parse_anthropic_data(r#"{"type":"message_start","message":{}}"#).is_none());
    }

    #[test]
    fn test_parse_anthropic_error_event() {
        let event = parse_anthropic_data(
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        );
        assert!(matches!(event, Some(StreamEvent::Error(m)) if m == "Overloaded"));
    }

    #[test]
    fn test_parse_openai_delta_and_done() {
        let event = parse_openai_data(r#"{"choices":[{"delta":{"content":"Hello"}}]}"#);
        assert!(matches!(event, Some(StreamEvent::Delta(t)) if t == "Hello"));

        assert!(matches!(parse_openai_data("[DONE]"), Some(StreamEvent::Done)));
        assert!(parse_openai_data(r#"{"choices":[{"delta":{}}]}"#).is_none());
    }

    #[test]
    fn test_build_generation_prompt_mines_projects() {
        let p1 = Project {
            id: 1,
            name: "kv-store".to_string(),
            summary: "Wrote a log-structured KV store in Rust.".to_string(),
            created_at: String::new(),
        };
        let p2 = Project {
            id: 2,
            name: "ray-tracer".to_string(),
            summary: "Physically based renderer.".to_string(),
            created_at: String::new(),
        };

        let prompt = build_generation_prompt(&posting("Rust Engineer", Some("Acme")), &[&p1, &p2]);
        assert!(prompt.contains("Job Title: Rust Engineer"));
        assert!(prompt.contains("Company: Acme"));
        assert!(prompt.contains("FEATURED PROJECT: kv-store"));
        assert!(prompt.contains("PROJECT: ray-tracer"));
        assert!(prompt.contains("Ship reliable pipelines."));
    }

    #[test]
    fn test_build_generation_prompt_without_company() {
        let prompt = build_generation_prompt(&posting("SRE", None), &[]);
        assert!(prompt.contains("Company: the employer"));
    }
}
