use anyhow::{Context, Result};
use reqwest::{Client, Method};
use serde_json::Value;
use std::time::Duration;
use stepflow_core::workflow::{AgentInvoker, AgentRequest, ApiInvoker, ApiRequest};
use tracing::debug;

/// Agent backend reached over HTTP: `POST {base}/agents/{agent}/invoke`
pub struct HttpAgentInvoker {
    client: Client,
    base_url: String,
}

impl HttpAgentInvoker {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn invoke_url(&self, agent: &str) -> String {
        format!("{}/agents/{}/invoke", self.base_url, agent)
    }
}

#[async_trait::async_trait]
impl AgentInvoker for HttpAgentInvoker {
    async fn invoke(&self, request: AgentRequest) -> Result<Value> {
        let url = self.invoke_url(&request.agent);
        debug!(url = %url, step_id = %request.step_id, "POST agent invocation");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("Agent request to {} failed", url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("agent '{}' returned {}: {}", request.agent, status, body);
        }

        response
            .json()
            .await
            .context("Agent response was not valid JSON")
    }
}

/// Sends `api_call` step requests as-is
pub struct HttpApiInvoker {
    client: Client,
}

impl HttpApiInvoker {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl ApiInvoker for HttpApiInvoker {
    async fn call(&self, request: ApiRequest) -> Result<Value> {
        let method = Method::from_bytes(request.method.as_bytes())
            .with_context(|| format!("Invalid HTTP method: {}", request.method))?;
        debug!(method = %method, url = %request.url, step_id = %request.step_id, "API call");

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("Request to {} failed", request.url))?;

        let status = response.status();
        let text = response.text().await.context("Failed to read response body")?;
        if !status.is_success() {
            anyhow::bail!("{} returned {}: {}", request.url, status, text);
        }

        // Non-JSON bodies come back as text
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok(serde_json::json!({
            "status": status.as_u16(),
            "body": body,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoke_url_trims_trailing_slash() {
        let invoker = HttpAgentInvoker::new("http://agents.local:8700/", Duration::from_secs(5))
            .unwrap();
        assert_eq!(
            invoker.invoke_url("reviewer"),
            "http://agents.local:8700/agents/reviewer/invoke"
        );
    }
}
