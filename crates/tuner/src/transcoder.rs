use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use serde_json::Value;

/// Task id substituted when the submission response carries no recognizable
/// identifier field.
pub const PLACEHOLDER_TASK_ID: &str = "unknown";

/// Remote transcode engine collaborator: accepts one job payload, returns
/// the remote task identifier.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn submit(&self, payload: &Value) -> Result<String>;
}

/// Production transcoder client: HTTP POST of the payload to a configured
/// endpoint, expecting a JSON response with a `task_id` (or `id`) field.
pub struct HttpTranscoder {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTranscoder {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(HttpTranscoder {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Transcoder for HttpTranscoder {
    async fn submit(&self, payload: &Value) -> Result<String> {
        debug!("submitting job payload to {}", self.endpoint);

        let response = self
            .client
            .post(&self.endpoint)
            .json(payload)
            .send()
            .await
            .with_context(|| format!("Failed to reach transcoder endpoint: {}", self.endpoint))?
            .error_for_status()
            .context("Transcoder rejected the job payload")?;

        let body: Value = response
            .json()
            .await
            .context("Transcoder response is not valid JSON")?;

        Ok(extract_task_id(&body))
    }
}

/// Pull the task identifier out of a submission response: `task_id` first,
/// then `id`, else the placeholder.
pub fn extract_task_id(body: &Value) -> String {
    for key in ["task_id", "id"] {
        match body.get(key) {
            Some(Value::String(s)) => return s.clone(),
            Some(Value::Number(n)) => return n.to_string(),
            _ => {}
        }
    }
    PLACEHOLDER_TASK_ID.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_id_field_is_preferred() {
        let body = json!({"task_id": "abc-123", "id": "ignored"});
        assert_eq!(extract_task_id(&body), "abc-123");
    }

    #[test]
    fn id_field_is_the_fallback() {
        assert_eq!(extract_task_id(&json!({"id": 42})), "42");
    }

    #[test]
    fn placeholder_when_no_identifier_present() {
        assert_eq!(extract_task_id(&json!({"status": "queued"})), PLACEHOLDER_TASK_ID);
    }
}
