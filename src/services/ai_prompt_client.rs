use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The `ai_prompt` node's dependency: a single-shot text completion. Grounded
/// in the request-building style of `ReplyClient`, narrowed to the one
/// method the flow engine actually calls.
#[async_trait::async_trait]
pub trait AiPromptClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> anyhow::Result<String>;
}

pub struct RealAiPromptClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl RealAiPromptClient {
    pub fn new(api_key: String, model: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            api_key,
            model,
            base_url: "https://openrouter.ai/api/v1/chat/completions".to_string(),
        })
    }
}

#[async_trait::async_trait]
impl AiPromptClient for RealAiPromptClient {
    async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": 0.3,
            "max_tokens": 1024,
        });

        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("ai_prompt node: completion request failed ({status}): {text}");
        }

        let json: serde_json::Value = response.json().await?;
        json["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.trim().to_string())
            .ok_or_else(|| anyhow::anyhow!("ai_prompt node: completion response had no content"))
    }
}
