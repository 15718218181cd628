//! HTTP language-model clients.
//!
//! | Provider | Endpoint | Notes |
//! |----------|----------|-------|
//! | `ollama` | `POST {url}/api/generate` | System prompt in `system`; streamed replies are NDJSON |
//! | `openai` | `POST {url}/chat/completions` | Any OpenAI-compatible server (OpenAI, vLLM); streamed replies are SSE; `OPENAI_API_KEY` optional for local servers |
//!
//! Transport failures and 5xx responses are retried with the same backoff as
//! the embedding providers; other non-success statuses fail immediately.
//! A streamed reply is only retried before its first byte arrives.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use tracing::{debug, warn};

pub use ordinance_rag_core::llm::{LlmClient, TextStream};

use crate::config::LlmConfig;

const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";
const OPENAI_DEFAULT_URL: &str = "https://api.openai.com/v1";

/// Names accepted by [`create_llm_client`].
pub const LLM_PROVIDERS: &[&str] = &["ollama", "openai"];

#[derive(Debug, Clone, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

async fn send_with_retry(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
    label: &str,
) -> Result<reqwest::Response> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let mut request = client.post(url).json(body);
        if let Some(key) = bearer {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }
                let text = response.text().await.unwrap_or_default();
                if status.is_server_error() {
                    warn!(provider = label, %status, attempt, "transient model error");
                    last_err = Some(anyhow!("{} API error: {} - {}", label, status, text));
                    continue;
                }
                bail!("{} API error: {} - {}", label, status, text);
            }
            Err(e) => {
                last_err = Some(anyhow!("{} connection error ({}): {}", label, url, e));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("{} request failed after retries", label)))
}

async fn post_json(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
    label: &str,
) -> Result<serde_json::Value> {
    let response = send_with_retry(client, url, bearer, body, max_retries, label).await?;
    let json: serde_json::Value = response.json().await?;
    if let Some(error) = json.get("error") {
        bail!("{} API returned error: {}", label, error);
    }
    Ok(json)
}

/// What one line of a streamed reply contributes.
#[derive(Debug, PartialEq, Eq)]
enum Piece {
    Text(String),
    Skip,
    End,
}

/// Splits a byte stream into `\n`-terminated lines.
struct LineReader<S> {
    bytes: S,
    buf: Vec<u8>,
    eof: bool,
}

impl<S, B, E> LineReader<S>
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::error::Error + Send + Sync + 'static,
{
    fn new(bytes: S) -> Self {
        Self {
            bytes,
            buf: Vec::new(),
            eof: false,
        }
    }

    async fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                return Ok(Some(line.trim_end_matches(['\n', '\r']).to_string()));
            }
            if self.eof {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let line = String::from_utf8_lossy(&self.buf).trim_end_matches('\r').to_string();
                self.buf.clear();
                return Ok(Some(line));
            }
            match self.bytes.next().await {
                Some(chunk) => self.buf.extend_from_slice(chunk?.as_ref()),
                None => self.eof = true,
            }
        }
    }
}

/// Turn a line-oriented reply into a stream of text pieces.
///
/// The stream ends at the first [`Piece::End`] or at end of input, and
/// stops after yielding the first error.
fn text_stream<S, B, E>(reader: LineReader<S>, parse: fn(&str) -> Result<Piece>) -> TextStream
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    stream::unfold(Some(reader), move |reader| async move {
        let mut reader = reader?;
        loop {
            let line = match reader.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => return Some((Err(e), None)),
            };
            match parse(&line) {
                Ok(Piece::Text(text)) => return Some((Ok(text), Some(reader))),
                Ok(Piece::Skip) => continue,
                Ok(Piece::End) => return None,
                Err(e) => return Some((Err(e), None)),
            }
        }
    })
    .boxed()
}

/// One NDJSON line of an Ollama `/api/generate` stream.
fn ollama_piece(line: &str) -> Result<Piece> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Piece::Skip);
    }
    let json: serde_json::Value = serde_json::from_str(line)?;
    if let Some(error) = json.get("error") {
        bail!("Ollama API returned error: {}", error);
    }
    match json["response"].as_str() {
        Some(text) if !text.is_empty() => Ok(Piece::Text(text.to_string())),
        _ if json["done"].as_bool() == Some(true) => Ok(Piece::End),
        _ => Ok(Piece::Skip),
    }
}

/// One server-sent-events line of an OpenAI chat completion stream.
fn openai_piece(line: &str) -> Result<Piece> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(Piece::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(Piece::End);
    }
    if data.is_empty() {
        return Ok(Piece::Skip);
    }
    let json: serde_json::Value = serde_json::from_str(data)?;
    if let Some(error) = json.get("error") {
        bail!("OpenAI API returned error: {}", error);
    }
    match json["choices"][0]["delta"]["content"].as_str() {
        Some(text) if !text.is_empty() => Ok(Piece::Text(text.to_string())),
        _ => Ok(Piece::Skip),
    }
}

fn http_client(config: &LlmConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

/// Client for a local Ollama instance.
pub struct OllamaClient {
    client: reqwest::Client,
    url: String,
    model: String,
    max_tokens: u32,
    max_retries: u32,
}

impl OllamaClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config)?,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| OLLAMA_DEFAULT_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
        })
    }

    fn request_body(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        temperature: f32,
        stream: bool,
    ) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": stream,
            "options": {
                "temperature": temperature,
                "num_ctx": 4096,
                "num_predict": self.max_tokens,
            },
        });
        if let Some(system) = system_prompt {
            body["system"] = serde_json::json!(system);
        }
        body
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn generate(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        temperature: f32,
    ) -> Result<String> {
        let url = format!("{}/api/generate", self.url);
        let body = self.request_body(prompt, system_prompt, temperature, false);
        debug!(model = %self.model, "ollama generate");
        let json = post_json(&self.client, &url, None, &body, self.max_retries, "Ollama").await?;
        json["response"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("Invalid Ollama response: missing response field"))
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        temperature: f32,
    ) -> Result<TextStream> {
        let url = format!("{}/api/generate", self.url);
        let body = self.request_body(prompt, system_prompt, temperature, true);
        debug!(model = %self.model, "ollama generate (stream)");
        let response =
            send_with_retry(&self.client, &url, None, &body, self.max_retries, "Ollama").await?;
        Ok(text_stream(
            LineReader::new(response.bytes_stream().boxed()),
            ollama_piece,
        ))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Client for OpenAI-compatible chat completion servers.
pub struct OpenAiClient {
    client: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
    max_retries: u32,
}

impl OpenAiClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").ok();
        let api_base = config
            .url
            .clone()
            .unwrap_or_else(|| OPENAI_DEFAULT_URL.to_string());
        if api_key.is_none() && api_base.starts_with(OPENAI_DEFAULT_URL) {
            bail!("OPENAI_API_KEY not set");
        }
        Ok(Self {
            client: http_client(config)?,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
        })
    }

    fn request_body(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        temperature: f32,
        stream: bool,
    ) -> serde_json::Value {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system_prompt {
            messages.push(Message {
                role: "system",
                content: system,
            });
        }
        messages.push(Message {
            role: "user",
            content: prompt,
        });
        serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": temperature,
            "stream": stream,
            "max_tokens": self.max_tokens,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn generate(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        temperature: f32,
    ) -> Result<String> {
        let url = format!("{}/chat/completions", self.api_base);
        let body = self.request_body(prompt, system_prompt, temperature, false);
        debug!(model = %self.model, "chat completion");
        let json = post_json(
            &self.client,
            &url,
            self.api_key.as_deref(),
            &body,
            self.max_retries,
            "OpenAI",
        )
        .await?;
        json["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("Invalid response format: missing content in choices"))
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        temperature: f32,
    ) -> Result<TextStream> {
        let url = format!("{}/chat/completions", self.api_base);
        let body = self.request_body(prompt, system_prompt, temperature, true);
        debug!(model = %self.model, "chat completion (stream)");
        let response = send_with_retry(
            &self.client,
            &url,
            self.api_key.as_deref(),
            &body,
            self.max_retries,
            "OpenAI",
        )
        .await?;
        Ok(text_stream(
            LineReader::new(response.bytes_stream().boxed()),
            openai_piece,
        ))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Instantiate the configured provider.
pub fn create_llm_client(config: &LlmConfig) -> Result<Arc<dyn LlmClient>> {
    match config.provider.to_lowercase().as_str() {
        "ollama" => Ok(Arc::new(OllamaClient::new(config)?)),
        "openai" => Ok(Arc::new(OpenAiClient::new(config)?)),
        other => bail!(
            "Unknown LLM provider '{}'. Available: {}",
            other,
            LLM_PROVIDERS.join(", ")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ollama_body_carries_system_prompt() {
        let client = OllamaClient::new(&LlmConfig::default()).unwrap();
        let body = client.request_body("When are quiet hours?", Some("Use context."), 0.1, false);
        assert_eq!(body["stream"], false);
        assert_eq!(body["system"], "Use context.");
        assert_eq!(body["prompt"], "When are quiet hours?");
        assert!(client.request_body("q", None, 0.1, false).get("system").is_none());
        assert_eq!(client.request_body("q", None, 0.1, true)["stream"], true);
    }

    #[test]
    fn test_openai_body_orders_messages() {
        let config = LlmConfig {
            provider: "openai".to_string(),
            url: Some("http://localhost:8000/v1/".to_string()),
            ..LlmConfig::default()
        };
        let client = OpenAiClient::new(&config).unwrap();
        assert_eq!(client.api_base, "http://localhost:8000/v1");
        let body = client.request_body("question", Some("system"), 0.1, true);
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["messages"][1]["content"], "question");
    }

    #[test]
    fn test_unknown_provider_lists_available() {
        let config = LlmConfig {
            provider: "bard".to_string(),
            ..LlmConfig::default()
        };
        let err = create_llm_client(&config).err().unwrap();
        assert!(err.to_string().contains("ollama, openai"));
    }

    fn chunks(parts: &[&str]) -> LineReader<stream::Iter<std::vec::IntoIter<std::io::Result<Vec<u8>>>>> {
        let items: Vec<std::io::Result<Vec<u8>>> = parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
        LineReader::new(stream::iter(items))
    }

    async fn collect(stream: TextStream) -> Vec<String> {
        stream.map(|piece| piece.unwrap()).collect().await
    }

    #[tokio::test]
    async fn test_line_reader_joins_split_chunks() {
        let mut reader = chunks(&["first li", "ne\r\nsecond\n", "tail"]);
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("first line"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("second"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("tail"));
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ollama_ndjson_stream() {
        let reader = chunks(&[
            "{\"response\":\"Quiet \",\"done\":false}\n{\"respo",
            "nse\":\"hours\",\"done\":false}\n\n",
            "{\"response\":\"\",\"done\":true}\n{\"response\":\"late\",\"done\":false}\n",
        ]);
        assert_eq!(collect(text_stream(reader, ollama_piece)).await, vec!["Quiet ", "hours"]);
    }

    #[tokio::test]
    async fn test_openai_sse_stream() {
        let reader = chunks(&[
            ": keep-alive\n",
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"10 PM\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" [Source: noise.md]\"}}]}\n\n",
            "data: [DONE]\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n",
        ]);
        assert_eq!(
            collect(text_stream(reader, openai_piece)).await,
            vec!["10 PM", " [Source: noise.md]"]
        );
    }

    #[tokio::test]
    async fn test_stream_error_line_ends_stream() {
        let reader = chunks(&["{\"response\":\"a\"}\n{\"error\":\"model not found\"}\n{\"response\":\"b\"}\n"]);
        let items: Vec<Result<String>> = text_stream(reader, ollama_piece).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "a");
        assert!(items[1].as_ref().unwrap_err().to_string().contains("model not found"));
    }

    #[test]
    fn test_sse_ignores_non_data_lines() {
        assert_eq!(openai_piece("event: message").unwrap(), Piece::Skip);
        assert_eq!(openai_piece("").unwrap(), Piece::Skip);
        assert_eq!(openai_piece("data: [DONE]").unwrap(), Piece::End);
        assert!(openai_piece("data: {not json").is_err());
    }

    #[tokio::test]
    async fn test_connection_errors_propagate() {
        let config = LlmConfig {
            url: Some("http://127.0.0.1:9".to_string()),
            max_retries: 0,
            timeout_secs: 2,
            ..LlmConfig::default()
        };
        let client = OllamaClient::new(&config).unwrap();
        let err = client.generate("q", None, 0.1).await.unwrap_err();
        assert!(err.to_string().contains("Ollama connection error"));
        let err = client.generate_stream("q", None, 0.1).await.err().unwrap();
        assert!(err.to_string().contains("Ollama connection error"));
    }
}
