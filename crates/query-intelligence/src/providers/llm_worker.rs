//! HTTP client for an OpenAI-compatible completion and embedding server.
//!
//! Every call is a single non-streaming request; deadlines are enforced by
//! the caller, the client-level timeout is only a backstop.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Completion, CompletionProvider, CompletionRequest, Embedder};
use crate::config::Config;

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    total_tokens: u32,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

pub struct LLMWorker {
    backend_url: String,
    api_key: Option<String>,
    model: String,
    embedding_model: String,
    http_client: reqwest::Client,
}

impl LLMWorker {
    pub fn from_config(config: &Config) -> Self {
        let mut worker = Self::new_with_backend(config.llm_base_url.clone());
        worker.api_key = config.llm_api_key.clone();
        worker.model = config.llm_model.clone();
        worker.embedding_model = config.embedding_model.clone();
        worker
    }

    pub fn new_with_backend(backend_url: String) -> Self {
        info!("LLM worker initialized with backend: {}", backend_url);
        Self {
            backend_url: backend_url.trim_end_matches('/').to_string(),
            api_key: None,
            model: "local-llm".to_string(),
            embedding_model: "local-embedding".to_string(),
            http_client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(300))
                .build()
                .unwrap_or_default(),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.backend_url)
    }

    fn embeddings_url(&self) -> String {
        format!("{}/v1/embeddings", self.backend_url)
    }

    fn post(&self, url: String) -> reqwest::RequestBuilder {
        let builder = self.http_client.post(url);
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn estimate_tokens(text: &str) -> u32 {
        (text.chars().count() / 4) as u32
    }
}

#[async_trait]
impl CompletionProvider for LLMWorker {
    async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<Completion> {
        debug!(
            "LLM worker completion (max_tokens={}, temperature={})",
            request.max_tokens, request.temperature
        );
        let mut messages = Vec::with_capacity(2);
        if !request.system.is_empty() {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: request.system.clone(),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: request.prompt.clone(),
        });
        let body = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: false,
        };
        let response = self
            .post(self.completions_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("LLM backend request failed: {}", e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("LLM backend returned {}: {}", status, body));
        }
        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse LLM response: {}", e))?;
        let text = completion
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .map(|m| m.content.trim().to_string())
            .unwrap_or_default();
        let tokens_used = completion
            .usage
            .map(|u| u.total_tokens)
            .unwrap_or_else(|| Self::estimate_tokens(&request.prompt) + Self::estimate_tokens(&text));
        Ok(Completion { text, tokens_used })
    }
}

#[async_trait]
impl Embedder for LLMWorker {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| anyhow::anyhow!("Embedding endpoint returned no vectors"))
    }

    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!("Generating embeddings for {} text(s)", texts.len());
        let request = EmbeddingRequest {
            model: self.embedding_model.clone(),
            input: texts.to_vec(),
        };
        let response = self
            .post(self.embeddings_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Embedding request failed: {}", e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Embedding endpoint returned {}: {}", status, body));
        }
        let embedding_response: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse embedding response: {}", e))?;
        let embeddings: Vec<Vec<f32>> = embedding_response
            .data
            .into_iter()
            .map(|d| d.embedding)
            .collect();
        if embeddings.len() != texts.len() {
            return Err(anyhow::anyhow!(
                "Embedding endpoint returned {} vectors for {} inputs",
                embeddings.len(),
                texts.len()
            ));
        }
        debug!(
            "Generated {} embeddings (dim={})",
            embeddings.len(),
            embeddings.first().map(|e| e.len()).unwrap_or(0)
        );
        Ok(embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(prompt: &str) -> CompletionRequest {
        CompletionRequest {
            system: "You are a SQL assistant".to_string(),
            prompt: prompt.to_string(),
            max_tokens: 64,
            temperature: 0.1,
        }
    }

    #[tokio::test]
    async fn test_complete_reads_first_choice_and_usage() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"choices":[{"message":{"role":"assistant","content":"  SELECT 1  "}}],
                    "usage":{"total_tokens":42}}"#,
            )
            .create_async()
            .await;

        let worker = LLMWorker::new_with_backend(server.url());
        let completion = worker.complete(&request("count teachers")).await.unwrap();

        mock.assert_async().await;
        assert_eq!(completion.text, "SELECT 1");
        assert_eq!(completion.tokens_used, 42);
    }

    #[tokio::test]
    async fn test_complete_estimates_tokens_without_usage() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(r#"{"choices":[{"message":{"role":"assistant","content":"abcdefgh"}}]}"#)
            .create_async()
            .await;

        let worker = LLMWorker::new_with_backend(server.url());
        let completion = worker.complete(&request("abcdefghabcdefgh")).await.unwrap();
        assert_eq!(completion.tokens_used, 4 + 2);
    }

    #[tokio::test]
    async fn test_complete_surfaces_http_errors() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(503)
            .with_body("overloaded")
            .create_async()
            .await;

        let worker = LLMWorker::new_with_backend(server.url());
        let err = worker.complete(&request("hi")).await.unwrap_err();
        assert!(err.to_string().contains("503"));
        assert!(err.to_string().contains("overloaded"));
    }

    #[tokio::test]
    async fn test_embed_batch_returns_vectors_in_order() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/embeddings")
            .with_status(200)
            .with_body(r#"{"data":[{"embedding":[1.0,0.0]},{"embedding":[0.0,1.0]}]}"#)
            .create_async()
            .await;

        let worker = LLMWorker::new_with_backend(server.url());
        let vectors = worker
            .embed_batch(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[tokio::test]
    async fn test_embed_batch_rejects_count_mismatch() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/embeddings")
            .with_status(200)
            .with_body(r#"{"data":[{"embedding":[1.0]}]}"#)
            .create_async()
            .await;

        let worker = LLMWorker::new_with_backend(server.url());
        let result = worker.embed_batch(&["a".to_string(), "b".to_string()]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_embed_batch_empty_input_skips_request() {
        let worker = LLMWorker::new_with_backend("http://127.0.0.1:1".to_string());
        let vectors = worker.embed_batch(&[]).await.unwrap();
        assert!(vectors.is_empty());
    }
}
