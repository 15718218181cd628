//! Language-model abstraction.
//!
//! The citation engine needs two operations: turn a prompt and a system
//! prompt into text, either in one piece or as a stream of pieces. Concrete
//! HTTP clients (Ollama, OpenAI-compatible servers such as vLLM) live in the
//! app crate.

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

/// Incremental model output. Each item is the next piece of text.
pub type TextStream = BoxStream<'static, Result<String>>;

/// Text generation backend.
///
/// The core never retries a failed call; any retry policy belongs to the
/// implementation. Errors it gives up on reach the caller unchanged.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate a completion for `prompt`.
    async fn generate(&self, prompt: &str, system_prompt: Option<&str>, temperature: f32) -> Result<String>;

    /// Generate a completion as it is produced.
    ///
    /// The default yields the whole of [`generate`](Self::generate) as a
    /// single piece. Errors before the first piece are returned directly;
    /// errors mid-stream arrive as stream items.
    async fn generate_stream(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        temperature: f32,
    ) -> Result<TextStream> {
        let text = self.generate(prompt, system_prompt, temperature).await?;
        Ok(stream::once(async move { Ok(text) }).boxed())
    }

    /// Model identifier, for logging.
    fn model_name(&self) -> &str {
        "unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl LlmClient for Echo {
        async fn generate(&self, prompt: &str, _: Option<&str>, _: f32) -> Result<String> {
            Ok(format!("echo: {prompt}"))
        }
    }

    #[tokio::test]
    async fn test_default_stream_yields_whole_completion() {
        let pieces: Vec<String> = Echo
            .generate_stream("hello", None, 0.1)
            .await
            .unwrap()
            .map(|piece| piece.unwrap())
            .collect()
            .await;
        assert_eq!(pieces, vec!["echo: hello".to_string()]);
    }
}
